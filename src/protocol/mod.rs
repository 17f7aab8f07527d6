mod packet;

pub use packet::{read_packet, write_packet, PacketType};

#[cfg(test)]
pub use packet::{decode_body, decode_header, encode, HEADER_LEN};

/// Instruction codes understood by the sensor (first payload byte of a COMMAND packet)
pub mod instruction {
    /// Capture a finger image into the sensor's image buffer
    pub const GEN_IMAGE: u8 = 0x01;
    /// Upload the image buffer to the host as DATA/DATA_END packets
    pub const UP_IMAGE: u8 = 0x0A;
    /// Verify the handshake password
    pub const VERIFY_PASSWORD: u8 = 0x13;
}

/// Confirmation codes carried in byte 0 of an ACK payload
pub mod confirm {
    pub const OK: u8 = 0x00;
    pub const NO_FINGER: u8 = 0x02;
}
