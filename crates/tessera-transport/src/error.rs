//! # Transport Errors
//!
//! Every fallible transport operation returns [`Result`]. Transient receive
//! conditions (timeouts, empty datagrams, undecryptable noise) are not
//! errors; they surface as `Ok(None)` from `read_packet`.

use std::io;

use thiserror::Error;

use crate::socket::ConnectionState;
use crate::wire::PacketType;

/// Crate result alias.
pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("packet of {size} bytes exceeds the {max} byte datagram limit")]
    PacketTooLarge { size: usize, max: usize },

    #[error("{packet_type:?} payload of {size} bytes needs {num_indices} fragments, limit is {max_indices} fragments / {max_size} bytes")]
    PayloadTooLarge {
        packet_type: PacketType,
        size: usize,
        num_indices: usize,
        max_indices: usize,
        max_size: usize,
    },

    #[error("NACK buffer for {0:?} is already registered")]
    NackBufferExists(PacketType),

    #[error("no NACK buffer registered for {0:?}")]
    NoNackBuffer(PacketType),

    #[error("{packet_type:?} packet id {id} index {index} is not in the NACK buffer")]
    NackNotFound {
        packet_type: PacketType,
        id: i32,
        index: u16,
    },

    #[error("another packet read is in progress or still checked out")]
    PacketInUse,

    #[error("malformed {0}")]
    Malformed(&'static str),

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,

    #[error("handshake failed: {0}")]
    Handshake(&'static str),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("STUN rendezvous timed out")]
    StunTimeout,

    #[error("STUN response does not match the request")]
    StunMismatch,

    #[error("STUN server does not know a peer at the requested address")]
    NoSuchPeer,

    #[error("sent {sent} of {total} fragments")]
    PartialSend { sent: usize, total: usize },

    #[error("only the server side owns a throttler")]
    NoThrottler,

    #[error("socket context is closed")]
    Closed,

    #[error("connection cannot move from {from:?} to {to:?}")]
    InvalidTransition { from: ConnectionState, to: ConnectionState },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TransportError {
    /// Whether the error is a transient socket condition worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}
