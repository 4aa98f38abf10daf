//! WebSocket transports.
//!
//! A server first calls `GET /connect` on the proxy with a bearer token and
//! its [`SERVER_IDENTIFICATION_HEADER`](super::SERVER_IDENTIFICATION_HEADER).
//! The proxy answers with its encrypted, randomly generated upgrade endpoint,
//! which the server then upgrades at with the same headers. Every frame is
//! an encrypted packet sent as a text message.

mod proxy;
mod server;

pub use proxy::ProxyWebSocketTransport;
pub use server::ServerWebSocketTransport;

/// Path the upgrade endpoint is discovered at.
pub const CONNECT_PATH: &str = "/connect";
