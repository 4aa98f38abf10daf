//! MagicLink, the control protocol between a RustyConnector proxy and
//! its backend servers.
//!
//! Packets are JSON envelopes encrypted with a network-wide AES-256 key.
//! Every participant runs a [`MagicLink`] on top of a [`Transport`]: it
//! dispatches received packets to typed listeners, correlates replies with
//! the packets they answer and keeps a bounded history of packets.

mod builder;
pub mod cache;
pub mod crypto;
mod engine;
mod error;
mod identification;
mod packet;
pub mod packets;
mod parameter;
mod source;
pub mod token;
pub mod transport;

pub use builder::{PacketBuilder, PrepareForSending, ReadyForSending};
pub use cache::{CachedPacket, PacketCache, TimeoutCache};
pub use engine::{
    ListenerOptions, MagicLink, MagicLinkConfig, PacketHandler, Transport,
    DEFAULT_REPLY_TIMEOUT, UNAVAILABLE_REPLY_MESSAGE,
};
pub use error::{ListenerError, MagicLinkError, Result};
pub use identification::PacketIdentification;
pub use packet::{
    LocalPacket, Packet, PacketStatus, PacketWrapper, RemotePacket, ReplyTable, StatusCell,
    PROTOCOL_VERSION,
};
pub use parameter::Parameter;
pub use source::{Origin, SourceIdentifier};
