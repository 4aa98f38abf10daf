//! Adapters for running the kernels without a game platform attached.
//!
//! Nothing is actually connected: every request is logged, which is enough
//! to operate and observe a network's control plane.

use std::sync::atomic::{AtomicI32, Ordering};

use rc_core::{Player, ProxyAdapter, Server};
use rc_magiclink::packets::PlayerRef;
use rc_server::ServerAdapter;
use uuid::Uuid;

pub struct HeadlessProxyAdapter;

#[derive(Default)]
pub struct HeadlessServerAdapter {
    max_players: AtomicI32,
}

#[async_trait::async_trait]
impl ProxyAdapter for HeadlessProxyAdapter {
    async fn register_server(&self, server: &Server) -> bool {
        log::info!(
            "Server {} is now reachable at {}{}",
            server.name(),
            server.address,
            server
                .pod_name
                .as_ref()
                .map(|pod| format!(" (pod {})", pod))
                .unwrap_or_default()
        );
        true
    }

    async fn unregister_server(&self, server: &Server) {
        log::info!("Server {} is no longer reachable", server.name());
    }

    async fn connect_server(&self, player: &Player, server: &Server) -> anyhow::Result<()> {
        log::info!("Connecting {} to {}", player, server.name());
        Ok(())
    }

    async fn fetch_server(&self, _: &Player) -> Option<Uuid> {
        None
    }

    async fn fetch_player(&self, player: &PlayerRef) -> Option<Player> {
        log::debug!("Player {} was requested but no player is ever online", player);
        None
    }

    async fn is_online(&self, _: &Player) -> bool {
        false
    }

    async fn check_permission(&self, _: &Player, _: &str) -> bool {
        false
    }

    async fn message_player(&self, player: &Player, message: &str) {
        log::info!("[to {}] {}", player, message);
    }

    async fn disconnect(&self, player: &Player, reason: &str) {
        log::info!("Disconnecting {}: {}", player, reason);
    }
}

#[async_trait::async_trait]
impl ServerAdapter for HeadlessServerAdapter {
    async fn online_player_count(&self) -> i64 {
        0
    }

    async fn set_max_players(&self, max_players: i32) {
        let previous = self.max_players.swap(max_players, Ordering::Relaxed);
        if previous != max_players {
            log::info!("The proxy granted {} player slots", max_players);
        }
    }

    async fn player_uuid(&self, _: &str) -> Option<Uuid> {
        None
    }

    async fn player_username(&self, _: Uuid) -> Option<String> {
        None
    }

    async fn is_online(&self, _: Uuid) -> bool {
        false
    }

    async fn send_message(&self, uuid: Uuid, message: &str) {
        log::info!("[to {}] {}", uuid, message);
    }
}
