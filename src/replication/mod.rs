//! Replication subsystem: master-side fan-out/`WAIT` barrier (C6) and
//! replica-side handshake/stream consumer (C7).

pub mod master;
pub mod replica;

use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("IO error talking to the master")]
    Io(#[from] std::io::Error),

    #[error("master handshake reply did not match the expected form")]
    UnexpectedHandshakeReply,

    #[error("master handshake closed before completing")]
    HandshakeClosed,
}

/// A fresh 40-hex-character replication id, stable for the process lifetime.
pub fn generate_replid() -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..40)
        .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
        .collect()
}

/// The hardcoded empty snapshot sent after `+FULLRESYNC`, reused verbatim
/// for every full resync since this server never writes a real one.
pub const EMPTY_RDB: &[u8] = &[
    0x52, 0x45, 0x44, 0x49, 0x53, 0x30, 0x30, 0x31, 0x31, 0xfa, 0x09, 0x72, 0x65, 0x64, 0x69,
    0x73, 0x2d, 0x76, 0x65, 0x72, 0x05, 0x37, 0x2e, 0x32, 0x2e, 0x30, 0xfa, 0x0a, 0x72, 0x65,
    0x64, 0x69, 0x73, 0x2d, 0x62, 0x69, 0x74, 0x73, 0xc0, 0x40, 0xfa, 0x05, 0x63, 0x74, 0x69,
    0x6d, 0x65, 0xc2, 0x6d, 0x08, 0xbc, 0x65, 0xfa, 0x08, 0x75, 0x73, 0x65, 0x64, 0x2d, 0x6d,
    0x65, 0x6d, 0xc2, 0xb0, 0xc4, 0x10, 0x00, 0xfa, 0x08, 0x61, 0x6f, 0x66, 0x2d, 0x62, 0x61,
    0x73, 0x65, 0xc0, 0x00, 0xff, 0xf0, 0x6e, 0x3b, 0xfe, 0xc0, 0xff, 0x5a, 0xa2,
];
