use anyhow::{Context, Result};
use serialport::SerialPort;
use std::io::{self, ErrorKind, Read, Write};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::bridge;
use crate::config::SensorConfig;
use crate::error::{ProtocolError, TransferError};
use crate::presence::PresenceProbe;
use crate::protocol::{confirm, instruction, read_packet, write_packet, PacketType};

/// Per-call read timeout on the port itself; the codec layers its own
/// deadline on top by polling.
const PORT_POLL_TIMEOUT: Duration = Duration::from_millis(20);

/// Byte link to the sensor.
pub trait SensorLink: Read + Write {
    /// Number of received bytes waiting to be read
    fn pending(&mut self) -> io::Result<usize>;
}

impl SensorLink for Box<dyn SerialPort> {
    fn pending(&mut self) -> io::Result<usize> {
        Ok(self.bytes_to_read()? as usize)
    }
}

/// Open the sensor UART at 8N1, no flow control
pub fn open_port(config: &SensorConfig) -> Result<Box<dyn SerialPort>> {
    let mut port = serialport::new(&config.port, config.baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(PORT_POLL_TIMEOUT)
        .open()
        .context(format!("Failed to open serial port {}", config.port))?;

    if let Err(e) = port.write_data_terminal_ready(true) {
        warn!("Failed to set DTR on {}: {}", config.port, e);
    }

    // Allow the module to finish booting, then drop any power-on noise
    thread::sleep(Duration::from_millis(100));
    port.clear(serialport::ClearBuffer::All).ok();

    Ok(port)
}

/// Minimal driver for an R30x-style optical fingerprint module.
///
/// Owns the link exclusively: nothing else may issue sensor commands while a
/// `Sensor` exists.
pub struct Sensor<L> {
    link: L,
    address: u32,
    timeout: Duration,
}

impl<L: SensorLink> Sensor<L> {
    pub fn new(link: L, address: u32, timeout: Duration) -> Self {
        Sensor {
            link,
            address,
            timeout,
        }
    }

    /// Handshake with the module. `Ok(false)` means the module answered but
    /// rejected the password.
    pub fn verify_password(&mut self, password: u32) -> Result<bool, ProtocolError> {
        let mut payload = [0u8; 5];
        payload[0] = instruction::VERIFY_PASSWORD;
        payload[1..].copy_from_slice(&password.to_be_bytes());

        let code = self.command(&payload)?;
        debug!("verify password reply: {:#04x}", code);
        Ok(code == confirm::OK)
    }

    /// Run GenImg. A finger on the glass is captured into the sensor's image
    /// buffer, ready for `stream_image`.
    pub fn capture_image(&mut self) -> Result<bool, ProtocolError> {
        match self.command(&[instruction::GEN_IMAGE])? {
            confirm::OK => Ok(true),
            confirm::NO_FINGER => Ok(false),
            code => Err(ProtocolError::DeviceNack(code)),
        }
    }

    /// Relay the last captured image to `sink`
    pub fn stream_image<W: Write + ?Sized>(&mut self, sink: &mut W) -> Result<usize, TransferError> {
        bridge::stream_image(&mut self.link, self.address, sink, self.timeout)
    }

    /// Drop whatever is sitting in the receive buffer right now
    pub fn discard_pending(&mut self) -> io::Result<usize> {
        let mut scratch = [0u8; 256];
        let mut discarded = 0;

        while self.link.pending()? > 0 {
            match self.link.read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => discarded += n,
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(discarded)
    }

    #[cfg(test)]
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Send a COMMAND packet and return the ACK confirmation code
    fn command(&mut self, payload: &[u8]) -> Result<u8, ProtocolError> {
        write_packet(&mut self.link, self.address, PacketType::Command, payload)?;

        let reply = read_packet(&mut self.link, self.timeout)?;
        if reply.packet_type != PacketType::Ack {
            return Err(ProtocolError::UnexpectedType(reply.packet_type.code()));
        }
        reply
            .payload
            .first()
            .copied()
            .ok_or(ProtocolError::DeviceNack(0xFF))
    }
}

impl<L: SensorLink> PresenceProbe for Sensor<L> {
    fn finger_present(&mut self) -> Result<bool, ProtocolError> {
        self.capture_image()
    }

    fn resync(&mut self) {
        match self.discard_pending() {
            Ok(0) => {}
            Ok(n) => debug!("discarded {} bytes after failed probe", n),
            Err(e) => warn!("Failed to clear sensor input: {}", e),
        }
    }
}
