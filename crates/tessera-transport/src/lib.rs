//! # tessera-transport
//!
//! Real-time media transport over UDP.
//!
//! Video, audio and control messages travel as encrypted, fragmented
//! datagrams between one server (the streaming host) and one client.
//! Lost fragments are recovered by receiver-driven NACKs, and the client
//! steers the server's encoder and send rate with an adaptive bitrate
//! controller. Peers connect directly or through a STUN rendezvous.
//!
//! ## Crate structure
//!
//! - [`wire`] — Packet header, packet types, size limits
//! - [`fragment`] — Payload fragmentation and reassembly
//! - [`bundle`] — Encoded-frame bundles crossing the codec boundary
//! - [`message`] — Control messages carried by MESSAGE packets
//! - [`nack`] — Sender-side retransmission buffers
//! - [`ring`] — Receiver-side frame reassembly and NACK scheduling
//! - [`crypto`] — AES-GCM datagram sealing, handshake proofs
//! - [`handshake`] — Private-key handshake
//! - [`stun`] — Rendezvous request/entry format
//! - [`throttle`] — Server-side send throttler
//! - [`socket`] — Socket context: connect, send, read, NACK
//! - [`bitrate`] — Adaptive bitrate controller
//! - [`stats`] — Socket counters and per-period network statistics
//! - [`session`] — Receiver loop tying the pieces together
//! - [`queue`] — Bounded FIFO queue between threads
//! - [`config`] — TOML configuration
//! - [`error`] — Error type

pub mod bitrate;
pub mod bundle;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fragment;
pub mod handshake;
pub mod message;
pub mod nack;
pub mod queue;
pub mod ring;
pub mod session;
pub mod socket;
pub mod stats;
pub mod stun;
pub mod throttle;
pub mod wire;

pub use error::{Result, TransportError};
pub use socket::{PacketGuard, Role, SocketContext};
pub use wire::{Packet, PacketType};
