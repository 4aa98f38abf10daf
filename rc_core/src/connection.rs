//! Player connection pipeline: joining the network, switching servers,
//! getting kicked and leaving.

use std::sync::Arc;

use rc_magiclink::packets::SendPlayerTarget;
use uuid::Uuid;

use crate::{events::Event, ConnectionResult, Family, Player, ProxyKernel, Server};

/// What happened to a kicked player.
#[derive(Debug, Clone)]
pub enum KickResolution {
    /// The player was moved to another server.
    Redirected(ConnectionResult),
    /// The player was disconnected from the proxy.
    Disconnected {
        /// Reason shown to the player.
        reason: String,
    },
}

impl ProxyKernel {
    /// A player joined the proxy. They are connected to the root family,
    /// and disconnected if that fails.
    pub async fn on_join(&self, player: &Player) -> ConnectionResult {
        self.events()
            .fire(Event::NetworkJoin {
                player: player.clone(),
            })
            .await;
        let result = match self.families().root().await {
            Some(root) => root.connect(player, self.adapter(), self.events()).await,
            None => ConnectionResult::failed("There is nowhere to send you to."),
        };
        if !result.is_success() {
            log::debug!("{} could not join the network: {}", player, result.message);
            self.adapter().disconnect(player, &result.message).await;
        }
        result
    }

    /// A player moved from one server to another.
    ///
    /// ## Arguments
    ///
    /// * `player` - Player who moved
    /// * `previous` - Server they left, if any
    /// * `server` - Server they arrived on
    pub async fn on_server_switch(&self, player: &Player, previous: Option<Uuid>, server: Uuid) {
        let previous = match previous {
            Some(uuid) => self.families().find_server(&uuid).await,
            None => None,
        };
        if let Some(previous) = &previous {
            previous.remove_player();
        }
        let Some(server) = self.families().find_server(&server).await else {
            return;
        };
        self.events()
            .fire(Event::ServerSwitch {
                previous,
                server,
                player: player.clone(),
            })
            .await;
    }

    /// A player was kicked from a server.
    ///
    /// Unless redirects are disabled, the player is sent to the parent family
    /// of the server's family, then to the root family (unless that is where
    /// they were kicked from), and told the kick reason. If nothing works,
    /// they are disconnected with it.
    ///
    /// ## Arguments
    ///
    /// * `player` - Kicked player
    /// * `server` - Server they were kicked from, if known
    /// * `reason` - Kick reason
    pub async fn on_kick(&self, player: &Player, server: Option<Uuid>, reason: &str) -> KickResolution {
        let server = match server {
            Some(uuid) => self.families().find_server(&uuid).await,
            None => None,
        };
        if let Some(server) = &server {
            server.remove_player();
        }
        self.events()
            .fire(Event::PlayerKicked {
                server: server.clone(),
                player: player.clone(),
                reason: reason.to_owned(),
            })
            .await;

        let kick_redirect = self.config_provider().read().await.kick_redirect;
        if kick_redirect {
            for family in self.redirect_candidates(server.as_deref()).await {
                let result = family.connect(player, self.adapter(), self.events()).await;
                if result.is_success() {
                    if !reason.is_empty() {
                        self.adapter().message_player(player, reason).await;
                    }
                    return KickResolution::Redirected(result);
                }
                log::debug!(
                    "Could not redirect kicked {} to family {}: {}",
                    player,
                    family.id,
                    result.message
                );
            }
        }

        self.adapter().disconnect(player, reason).await;
        KickResolution::Disconnected {
            reason: reason.to_owned(),
        }
    }

    /// Families a player kicked from `server` may be sent to, in order.
    async fn redirect_candidates(&self, server: Option<&Server>) -> Vec<Arc<Family>> {
        let family = match server {
            Some(server) => self.families().family_of(server).await,
            None => None,
        };
        let mut candidates = Vec::new();
        if let Some(parent) = family.as_ref().and_then(|family| family.parent.as_deref()) {
            if let Some(parent) = self.families().find(parent).await {
                candidates.push(parent);
            }
        }
        let kicked_from_root = family
            .as_ref()
            .is_some_and(|family| family.id == self.families().root_id());
        if !kicked_from_root {
            if let Some(root) = self.families().root().await {
                if !candidates.iter().any(|family| family.id == root.id) {
                    candidates.push(root);
                }
            }
        }
        candidates
    }

    /// A player left the proxy.
    ///
    /// ## Arguments
    ///
    /// * `player` - Player who left
    /// * `server` - Server they were on, if any
    pub async fn on_leave(&self, player: &Player, server: Option<Uuid>) {
        if let Some(uuid) = server {
            if let Some(server) = self.families().find_server(&uuid).await {
                server.remove_player();
            }
        }
        self.events()
            .fire(Event::NetworkLeave {
                player: player.clone(),
            })
            .await;
    }

    /// Sends a player to a server or a family.
    ///
    /// Generic targets are looked up as a server UUID first,
    /// then as a family ID.
    pub async fn send_player(&self, player: &Player, target: &SendPlayerTarget) -> ConnectionResult {
        match target {
            SendPlayerTarget::Server(uuid) => match self.families().find_server(uuid).await {
                Some(server) => self.connect_server(player, &server).await,
                None => ConnectionResult::failed(format!("There is no server with UUID {}", uuid)),
            },
            SendPlayerTarget::Family(id) => match self.families().find(id).await {
                Some(family) => family.connect(player, self.adapter(), self.events()).await,
                None => ConnectionResult::failed(format!("The family `{}` doesn't exist", id)),
            },
            SendPlayerTarget::Generic(target) => {
                if let Ok(uuid) = Uuid::parse_str(target) {
                    if let Some(server) = self.families().find_server(&uuid).await {
                        return self.connect_server(player, &server).await;
                    }
                }
                match self.families().find(target).await {
                    Some(family) => family.connect(player, self.adapter(), self.events()).await,
                    None => ConnectionResult::failed(format!(
                        "`{}` is neither a server nor a family",
                        target
                    )),
                }
            }
        }
    }

    /// Connects a player straight to a server, bypassing load balancing.
    pub async fn connect_server(&self, player: &Player, server: &Arc<Server>) -> ConnectionResult {
        if self.adapter().fetch_server(player).await == Some(server.uuid) {
            return ConnectionResult::failed("You're already connected to this server.");
        }
        let pre_join = Event::ServerPreJoin {
            server: server.clone(),
            player: player.clone(),
        };
        if !self.events().fire_cancellable(pre_join).await {
            return ConnectionResult::failed("You can't join this server right now.");
        }
        let result = server.connect(self.adapter(), player).await;
        if result.is_success() {
            self.events()
                .fire(Event::ServerPostJoin {
                    server: server.clone(),
                    player: player.clone(),
                })
                .await;
        }
        result
    }
}
