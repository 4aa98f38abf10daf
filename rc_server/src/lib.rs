//! Backend side of RustyConnector.
//!
//! A game server runs a [`ServerKernel`] to register itself to the proxy
//! over MagicLink, keep that registration alive with periodic pings,
//! and ask the proxy to move players around the network.

mod adapter;
pub mod config;
mod handshake;
mod kernel;

pub use adapter::*;
pub use handshake::*;
pub use kernel::*;
