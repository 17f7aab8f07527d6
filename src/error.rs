use std::io;

use thiserror::Error;

/// Failures of the sensor packet protocol. Always fatal to the current
/// transfer, never to the process.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad start marker {0:#06x}")]
    BadMarker(u16),

    #[error("bad checksum: received {received:#06x}, computed {computed:#06x}")]
    BadChecksum { received: u16, computed: u16 },

    #[error("timed out waiting for {wanted} bytes after {timeout_ms}ms")]
    Timeout { wanted: usize, timeout_ms: u64 },

    #[error("unexpected packet type {0:#04x}")]
    UnexpectedType(u8),

    #[error("device replied with error code {0:#04x}")]
    DeviceNack(u8),

    #[error("payload of {0} bytes does not fit in one packet")]
    PayloadTooLarge(usize),

    #[error("serial I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failures of the outbound HTTP connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("send failed: {0}")]
    Send(#[source] io::Error),

    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),
}

/// Why a single image transfer did not complete.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),
}
