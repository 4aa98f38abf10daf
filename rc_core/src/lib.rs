//! Proxy kernel of RustyConnector, a control plane connecting
//! a Minecraft proxy to a dynamic fleet of backend servers.
//!
//! Servers register themselves over MagicLink by pinging the proxy,
//! and are grouped into families. Each [`Family`] routes the players
//! joining it through its [`LoadBalancer`].
//!
//! The entrypoint is a [`Proxy`], wrapping a [`ProxyKernel`] along with
//! the scheduler keeping servers alive and families balanced. Actual
//! player moves are carried out by the hosting proxy software through
//! a [`ProxyAdapter`].

mod adapter;
pub mod config;
mod connection;
pub mod events;
mod family;
mod handlers;
mod load_balancer;
mod player;
mod proxy;
mod registry;
mod scheduler;
mod server;

pub use adapter::*;
pub use connection::*;
pub use family::*;
pub use load_balancer::*;
pub use player::*;
pub use proxy::*;
pub use registry::*;
pub use scheduler::Scheduler;
pub use server::*;
