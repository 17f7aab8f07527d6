use std::io::{Read, Write};
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{ProtocolError, TransferError, TransportError};
use crate::protocol::{confirm, instruction, read_packet, write_packet, PacketType};

/// Ask the sensor to upload its image buffer and relay every DATA/DATA_END
/// payload to `sink` as it arrives. Returns the number of bytes forwarded.
///
/// Only one packet payload is alive at a time. A sink failure aborts the read
/// loop immediately, leaving unread packets on the link for the caller to
/// drain before the next command.
pub fn stream_image<L, W>(
    link: &mut L,
    address: u32,
    sink: &mut W,
    timeout: Duration,
) -> Result<usize, TransferError>
where
    L: Read + Write + ?Sized,
    W: Write + ?Sized,
{
    write_packet(link, address, PacketType::Command, &[instruction::UP_IMAGE])?;

    let reply = read_packet(link, timeout)?;
    if reply.packet_type != PacketType::Ack {
        return Err(ProtocolError::UnexpectedType(reply.packet_type.code()).into());
    }
    // An ACK without a status byte is as good as a NACK
    match reply.payload.first() {
        Some(&confirm::OK) => {}
        Some(&code) => return Err(ProtocolError::DeviceNack(code).into()),
        None => return Err(ProtocolError::DeviceNack(0xFF).into()),
    }

    let mut sent = 0usize;
    let mut packets = 0usize;
    loop {
        let packet = read_packet(link, timeout)?;
        if !matches!(packet.packet_type, PacketType::Data | PacketType::DataEnd) {
            return Err(ProtocolError::UnexpectedType(packet.packet_type.code()).into());
        }

        sink.write_all(&packet.payload)
            .map_err(TransportError::Send)?;
        sent += packet.payload.len();
        packets += 1;
        trace!("relayed packet {} ({} bytes, {} total)", packets, packet.payload.len(), sent);

        if packet.packet_type == PacketType::DataEnd {
            break;
        }
    }

    sink.flush().map_err(TransportError::Send)?;
    debug!("image upload complete: {} bytes in {} packets", sent, packets);
    Ok(sent)
}
