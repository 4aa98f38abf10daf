//! Transports carrying encrypted MagicLink frames.
//!
//! The proxy hosts a WebSocket endpoint every server connects to,
//! [`memory`] wires participants of a single process together.

pub mod memory;
pub mod websocket;

pub use crate::engine::Transport;

/// Header carrying the JSON [`SourceIdentifier`](crate::SourceIdentifier)
/// of a connecting server.
pub const SERVER_IDENTIFICATION_HEADER: &str = "X-Server-Identification";
