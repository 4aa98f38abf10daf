use rc_magiclink::packets::PlayerRef;
use uuid::Uuid;

use crate::{Player, Server};

/// Permission letting a player join servers past their soft cap.
pub const SOFT_CAP_BYPASS_PERMISSION: &str = "rustyconnector.softCapBypass";
/// Permission letting a player join servers past their hard cap.
pub const HARD_CAP_BYPASS_PERMISSION: &str = "rustyconnector.hardCapBypass";

/// Bridge to the proxy software hosting the kernel.
///
/// The kernel decides where players go, the adapter carries it out.
#[async_trait::async_trait]
pub trait ProxyAdapter: Send + Sync {
    /// Makes a newly registered server known to the proxy software.
    ///
    /// Returning `false` aborts the registration.
    async fn register_server(&self, server: &Server) -> bool;

    /// Forgets a server.
    async fn unregister_server(&self, server: &Server);

    /// Connects a player to a server.
    ///
    /// ## Arguments
    ///
    /// * `player` - Player to move
    /// * `server` - Destination server
    async fn connect_server(&self, player: &Player, server: &Server) -> anyhow::Result<()>;

    /// UUID of the server a player is currently connected to, if any.
    async fn fetch_server(&self, player: &Player) -> Option<Uuid>;

    /// Looks up an online player.
    async fn fetch_player(&self, player: &PlayerRef) -> Option<Player>;

    /// Whether a player is still connected to the proxy.
    async fn is_online(&self, player: &Player) -> bool;

    async fn check_permission(&self, player: &Player, permission: &str) -> bool;

    async fn message_player(&self, player: &Player, message: &str);

    /// Disconnects a player from the proxy.
    async fn disconnect(&self, player: &Player, reason: &str);
}
