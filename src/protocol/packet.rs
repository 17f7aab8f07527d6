use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::ProtocolError;

/// Marker at the start of every packet
pub const START_CODE: u16 = 0xEF01;

/// Marker (2) + address (4) + type (1) + length (2)
pub const HEADER_LEN: usize = 9;

const CHECKSUM_LEN: usize = 2;

/// Largest payload whose length field (payload + checksum) still fits in u16
pub const MAX_PAYLOAD: usize = u16::MAX as usize - CHECKSUM_LEN;

/// Packet identifier byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Command,
    Data,
    Ack,
    DataEnd,
}

impl PacketType {
    pub fn code(self) -> u8 {
        match self {
            PacketType::Command => 0x01,
            PacketType::Data => 0x02,
            PacketType::Ack => 0x07,
            PacketType::DataEnd => 0x08,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        match code {
            0x01 => Ok(PacketType::Command),
            0x02 => Ok(PacketType::Data),
            0x07 => Ok(PacketType::Ack),
            0x08 => Ok(PacketType::DataEnd),
            other => Err(ProtocolError::UnexpectedType(other)),
        }
    }
}

/// Fixed-width part of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub address: u32,
    pub packet_type: PacketType,
    /// Payload length + 2 (the trailing checksum)
    pub length: u16,
}

/// A decoded packet. Holds exactly one payload, never more.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub payload: Vec<u8>,
}

/// Low 16 bits of type + length bytes + every payload byte
pub fn checksum(type_code: u8, length: u16, payload: &[u8]) -> u16 {
    let [len_hi, len_lo] = length.to_be_bytes();
    let seed = type_code as u16 + len_hi as u16 + len_lo as u16;
    payload
        .iter()
        .fold(seed, |sum, &b| sum.wrapping_add(b as u16))
}

/// Build a complete packet. Payloads over `MAX_PAYLOAD` are the caller's
/// bug; `write_packet` rejects them before they reach the wire.
pub fn encode(address: u32, packet_type: PacketType, payload: &[u8]) -> Vec<u8> {
    debug_assert!(
        payload.len() <= MAX_PAYLOAD,
        "payload of {} bytes overflows the length field",
        payload.len()
    );
    let length = (payload.len() + CHECKSUM_LEN) as u16;
    let type_code = packet_type.code();

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + CHECKSUM_LEN);

    // Header
    frame.extend_from_slice(&START_CODE.to_be_bytes());
    frame.extend_from_slice(&address.to_be_bytes());
    frame.push(type_code);
    frame.extend_from_slice(&length.to_be_bytes());

    // Payload
    frame.extend_from_slice(payload);

    // Checksum
    frame.extend_from_slice(&checksum(type_code, length, payload).to_be_bytes());

    frame
}

/// Validate the start marker and split out type and length
pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<PacketHeader, ProtocolError> {
    let marker = u16::from_be_bytes([header[0], header[1]]);
    if marker != START_CODE {
        return Err(ProtocolError::BadMarker(marker));
    }

    let address = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);
    let packet_type = PacketType::from_code(header[6])?;
    let length = u16::from_be_bytes([header[7], header[8]]);

    Ok(PacketHeader {
        address,
        packet_type,
        length,
    })
}

/// Verify the trailing checksum of `body` (exactly `header.length` bytes) and
/// return the payload slice.
pub fn decode_body<'a>(header: &PacketHeader, body: &'a [u8]) -> Result<&'a [u8], ProtocolError> {
    let type_code = header.packet_type.code();

    // A body too short to carry a checksum can never verify
    if body.len() < CHECKSUM_LEN {
        return Err(ProtocolError::BadChecksum {
            received: 0,
            computed: checksum(type_code, header.length, body),
        });
    }

    let (payload, tail) = body.split_at(body.len() - CHECKSUM_LEN);
    let received = u16::from_be_bytes([tail[0], tail[1]]);
    let computed = checksum(type_code, header.length, payload);
    if received != computed {
        return Err(ProtocolError::BadChecksum { received, computed });
    }

    Ok(payload)
}

/// Fill `buf` completely or fail with `Timeout` once `timeout` has elapsed.
///
/// Serial ports report "no data yet" either as `TimedOut`, `WouldBlock` or a
/// zero-length read; all three just mean poll again.
pub fn read_exact_timeout<R: Read + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<(), ProtocolError> {
    let start = Instant::now();
    let mut filled = 0;

    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(n) if n > 0 => {
                filled += n;
                continue;
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }

        if start.elapsed() > timeout {
            return Err(ProtocolError::Timeout {
                wanted: buf.len(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        thread::sleep(Duration::from_millis(1));
    }

    Ok(())
}

/// Read one packet: fixed 9-byte header, then a length-directed body
pub fn read_packet<R: Read + ?Sized>(
    reader: &mut R,
    timeout: Duration,
) -> Result<Packet, ProtocolError> {
    let mut header_bytes = [0u8; HEADER_LEN];
    read_exact_timeout(reader, &mut header_bytes, timeout)?;
    let header = decode_header(&header_bytes)?;

    let mut body = vec![0u8; header.length as usize];
    read_exact_timeout(reader, &mut body, timeout)?;
    let payload_len = decode_body(&header, &body)?.len();

    trace!(
        "rx {:?} from {:#010x} ({} payload bytes): {:02x?}",
        header.packet_type,
        header.address,
        payload_len,
        &body[..payload_len.min(16)]
    );

    body.truncate(payload_len);
    Ok(Packet {
        packet_type: header.packet_type,
        payload: body,
    })
}

/// Encode and send one packet
pub fn write_packet<W: Write + ?Sized>(
    writer: &mut W,
    address: u32,
    packet_type: PacketType,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }
    let frame = encode(address, packet_type, payload);
    trace!("tx {:?}: {:02x?}", packet_type, frame);

    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}
