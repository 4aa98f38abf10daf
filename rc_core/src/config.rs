use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock, RwLockReadGuard};

/// Interval at which registered servers lose timeout.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// As [`RuntimeConfig`] may be updated by reloads,
/// it is proxied behind this provider.
pub struct RuntimeConfigProvider {
    /// Last config.
    config: RwLock<RuntimeConfig>,
    /// Reload notifier.
    reload_notify: Notify,
}

/// Configuration for things that can be changed
/// at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Timeout, in seconds, a server is given by each of its pings.
    #[serde(default = "default_server_timeout")]
    pub server_timeout: i64,
    /// Interval, in seconds, servers are told to ping at once registered.
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    /// Rate, in seconds, at which load balancers are fully sorted.
    #[serde(default = "default_rebalance_rate")]
    pub rebalance_rate: u64,
    /// Whether kicked players are redirected to another family.
    #[serde(default = "default_true")]
    pub kick_redirect: bool,
    /// Time, in seconds, cancellable events are given before failing closed.
    #[serde(default = "default_event_timeout")]
    pub event_timeout: u64,
    /// Registration configurations servers refer to by name.
    #[serde(default)]
    pub magic_configs: HashMap<String, MagicConfig>,
}

/// Registration configuration, referenced by servers in their pings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MagicConfig {
    /// Family the server joins.
    pub family: String,
    /// Sorting weight in weighted load balancers.
    #[serde(default)]
    pub weight: i32,
    /// Preferred maximum player count.
    pub soft_cap: i32,
    /// Absolute maximum player count.
    pub hard_cap: i32,
}

/// Load balancing method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceMethod {
    /// Pick each server in turn.
    RoundRobin,
    /// Pick the least connected server.
    LeastConnection,
    /// Fill servers one after the other.
    MostConnection,
}

/// Load balancer configuration of a family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    /// Load balancing method.
    #[serde(default = "default_method")]
    pub method: LoadBalanceMethod,
    /// Whether server weights are taken into account when sorting.
    #[serde(default)]
    pub weighted: bool,
    /// Whether failed connections are retried on the next server.
    #[serde(default)]
    pub persistence: bool,
    /// Number of servers tried when persistence is enabled.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

/// Configuration for a family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyConfig {
    /// Family ID.
    pub id: String,
    /// Name shown to players.
    pub display_name: Option<String>,
    /// Family kicked players are sent to.
    pub parent: Option<String>,
    /// Load balancer settings.
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
}

impl RuntimeConfigProvider {
    pub fn new(initial_config: RuntimeConfig) -> Self {
        Self {
            config: RwLock::new(initial_config),
            reload_notify: Notify::new(),
        }
    }

    #[inline]
    pub async fn read(&self) -> RwLockReadGuard<'_, RuntimeConfig> {
        self.config.read().await
    }

    #[inline]
    pub async fn wait_reload(&self) {
        self.reload_notify.notified().await;
    }

    /// Reloads the configuration.
    ///
    /// ## Arguments
    ///
    /// * `config` - New runtime config
    pub async fn reload(&self, config: RuntimeConfig) {
        let mut w = self.config.write().await;
        *w = config;
        drop(w);
        self.reload_notify.notify_waiters();
    }
}

impl RuntimeConfig {
    pub fn event_timeout(&self) -> Duration {
        Duration::from_secs(u64::max(self.event_timeout, 1))
    }

    pub fn rebalance_rate(&self) -> Duration {
        Duration::from_secs(u64::max(self.rebalance_rate, 1))
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            server_timeout: default_server_timeout(),
            ping_interval: default_ping_interval(),
            rebalance_rate: default_rebalance_rate(),
            kick_redirect: true,
            event_timeout: default_event_timeout(),
            magic_configs: HashMap::new(),
        }
    }
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            method: default_method(),
            weighted: false,
            persistence: false,
            attempts: default_attempts(),
        }
    }
}

fn default_server_timeout() -> i64 {
    15
}

fn default_ping_interval() -> u64 {
    10
}

fn default_rebalance_rate() -> u64 {
    15
}

fn default_event_timeout() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_method() -> LoadBalanceMethod {
    LoadBalanceMethod::RoundRobin
}

fn default_attempts() -> u32 {
    5
}
