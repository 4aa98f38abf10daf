use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use parking_lot::RwLock;
use rc_magiclink::SourceIdentifier;
use uuid::Uuid;

use crate::{
    adapter::{HARD_CAP_BYPASS_PERMISSION, SOFT_CAP_BYPASS_PERMISSION},
    ConnectionResult, Player, ProxyAdapter,
};

/// A [`Server`] is a backend game server registered
/// through MagicLink, to which players can be routed to.
#[derive(Debug)]
pub struct Server {
    /// Unique ID, the one the server identifies itself with.
    pub uuid: Uuid,
    /// Address players are connected to.
    pub address: String,
    pub display_name: Option<String>,
    /// Name of the pod when running under container orchestration.
    pub pod_name: Option<String>,
    /// Sorting weight in weighted load balancers.
    pub weight: i32,
    soft_cap: i32,
    hard_cap: i32,
    /// Remaining time to live, in seconds.
    timeout: AtomicI64,
    player_count: AtomicI64,
    /// ID of the family the server belongs to.
    family: RwLock<Option<String>>,
}

/// Everything needed to create a [`Server`].
#[derive(Debug, Clone)]
pub struct ServerDetails {
    pub uuid: Uuid,
    pub address: String,
    pub display_name: Option<String>,
    pub pod_name: Option<String>,
    pub weight: i32,
    pub soft_cap: i32,
    pub hard_cap: i32,
    pub timeout: i64,
}

impl Server {
    /// Creates a server.
    ///
    /// The soft cap is clamped down to the hard cap.
    pub fn new(details: ServerDetails) -> Self {
        let hard_cap = details.hard_cap.max(0);
        let soft_cap = details.soft_cap.clamp(0, hard_cap);
        Self {
            uuid: details.uuid,
            address: details.address,
            display_name: details.display_name,
            pod_name: details.pod_name,
            weight: details.weight,
            soft_cap,
            hard_cap,
            timeout: AtomicI64::new(details.timeout),
            player_count: AtomicI64::new(0),
            family: RwLock::new(None),
        }
    }

    /// MagicLink identity of the server.
    pub fn identity(&self) -> SourceIdentifier {
        SourceIdentifier::server(self.uuid)
    }

    /// Display name, falling back to the UUID.
    pub fn name(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| self.uuid.to_string())
    }

    pub fn soft_cap(&self) -> i32 {
        self.soft_cap
    }

    pub fn hard_cap(&self) -> i32 {
        self.hard_cap
    }

    pub fn timeout(&self) -> i64 {
        self.timeout.load(Ordering::SeqCst)
    }

    pub fn set_timeout(&self, timeout: i64) {
        self.timeout.store(timeout, Ordering::SeqCst);
    }

    /// Decreases the timeout and returns what is left of it.
    pub fn decrease_timeout(&self, by: i64) -> i64 {
        self.timeout.fetch_sub(by, Ordering::SeqCst) - by
    }

    /// Whether the server stopped pinging long enough to be considered gone.
    pub fn stale(&self) -> bool {
        self.timeout() <= 0
    }

    pub fn player_count(&self) -> i64 {
        self.player_count.load(Ordering::SeqCst)
    }

    pub fn set_player_count(&self, player_count: i64) {
        self.player_count.store(player_count.max(0), Ordering::SeqCst);
    }

    pub fn add_player(&self) {
        self.player_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Removes a player, never going below zero.
    pub fn remove_player(&self) {
        let _ = self
            .player_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                Some(i64::max(count - 1, 0))
            });
    }

    /// Whether the soft cap is reached.
    pub fn full(&self) -> bool {
        self.player_count() >= i64::from(self.soft_cap)
    }

    /// Whether the hard cap is reached.
    pub fn maxed(&self) -> bool {
        self.player_count() >= i64::from(self.hard_cap)
    }

    pub fn family(&self) -> Option<String> {
        self.family.read().clone()
    }

    pub(crate) fn set_family(&self, family: Option<String>) {
        *self.family.write() = family;
    }

    /// Connects a player to this server after checking admission.
    ///
    /// ## Arguments
    ///
    /// * `adapter` - Proxy adapter carrying out the connection
    /// * `player` - Player to connect
    pub async fn connect(
        self: &Arc<Self>,
        adapter: &dyn ProxyAdapter,
        player: &Player,
    ) -> ConnectionResult {
        if !adapter.is_online(player).await {
            return ConnectionResult::failed("You are no longer connected.");
        }
        if self.maxed() && !adapter.check_permission(player, HARD_CAP_BYPASS_PERMISSION).await {
            return ConnectionResult::failed("The server is currently full. Try again later.");
        }
        if self.full() && !adapter.check_permission(player, SOFT_CAP_BYPASS_PERMISSION).await {
            return ConnectionResult::failed("The server is currently full. Try again later.");
        }
        if let Err(err) = adapter.connect_server(player, self).await {
            log::debug!(
                "Could not connect {} to server {}: {:?}",
                player,
                self.uuid,
                err
            );
            return ConnectionResult::failed("Unable to connect you to the server!");
        }
        self.add_player();
        ConnectionResult::success(self.clone())
    }
}
