use std::{cmp::Ordering, collections::HashMap, sync::Arc};

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    config::{LoadBalanceMethod, LoadBalancerConfig},
    events::{Event, EventManager},
    FamilyPlugin, Server,
};

/// Name the load balancer is installed under in its family's plugins.
pub const LOAD_BALANCER_PLUGIN: &str = "LoadBalancer";

/// A load balancer is responsible for picking the server
/// to point new connections to for a family.
///
/// Servers are either unlocked (eligible) or locked (kept registered
/// but never picked). Each family has its own instance.
pub struct LoadBalancer {
    /// Load balancing method.
    method: LoadBalanceMethod,
    /// Whether weights are taken into account when sorting.
    weighted: bool,
    /// Whether failed connections move on to the next server.
    persistence: bool,
    /// Number of servers tried when persistence is enabled.
    attempts: u32,
    /// Mutable state.
    state: RwLock<LoadBalancerState>,
    /// Event manager lock/unlock are announced to.
    events: Arc<EventManager>,
}

#[derive(Default)]
struct LoadBalancerState {
    unlocked: Vec<Arc<Server>>,
    locked: Vec<Arc<Server>>,
    /// Every known server, locked or not.
    servers: HashMap<Uuid, Arc<Server>>,
    /// Position of the current pick in `unlocked`.
    index: usize,
}

impl LoadBalancer {
    /// Initializes a load balancer.
    ///
    /// ## Arguments
    ///
    /// * `config` - Load balancer settings
    /// * `events` - Event manager to fire lock/unlock events on
    pub fn new(config: &LoadBalancerConfig, events: Arc<EventManager>) -> Self {
        Self {
            method: config.method,
            weighted: config.weighted,
            persistence: config.persistence,
            attempts: config.attempts,
            state: RwLock::new(LoadBalancerState::default()),
            events,
        }
    }

    /// Returns the load balancing method.
    pub fn method(&self) -> LoadBalanceMethod {
        self.method
    }

    pub fn weighted(&self) -> bool {
        self.weighted
    }

    pub fn persistence(&self) -> bool {
        self.persistence
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Adds a server, unlocked. Does nothing if it is already known.
    pub async fn add(&self, server: Arc<Server>) {
        let mut state = self.state.write().await;
        if state.servers.contains_key(&server.uuid) {
            return;
        }
        state.servers.insert(server.uuid, server.clone());
        state.unlocked.push(server);
    }

    /// Removes a server, whether it's locked or not.
    pub async fn remove(&self, uuid: &Uuid) -> Option<Arc<Server>> {
        let mut state = self.state.write().await;
        let server = state.servers.remove(uuid)?;
        state.unlocked.retain(|server| &server.uuid != uuid);
        state.locked.retain(|server| &server.uuid != uuid);
        if state.index >= state.unlocked.len() {
            state.index = 0;
        }
        Some(server)
    }

    /// Removes every server.
    pub async fn clear(&self) -> Vec<Arc<Server>> {
        let mut state = self.state.write().await;
        state.unlocked.clear();
        state.locked.clear();
        state.index = 0;
        state.servers.drain().map(|(_, server)| server).collect()
    }

    /// Locks a server, unless a listener cancels it.
    ///
    /// Returns whether the server is now locked.
    pub async fn lock(&self, server: &Arc<Server>) -> bool {
        if !self.contains(&server.uuid).await {
            return false;
        }
        let event = Event::ServerLock {
            server: server.clone(),
        };
        if !self.events.fire_cancellable(event).await {
            return false;
        }
        let mut state = self.state.write().await;
        let Some(position) = state.unlocked.iter().position(|s| s.uuid == server.uuid) else {
            return state.locked.iter().any(|s| s.uuid == server.uuid);
        };
        let server = state.unlocked.remove(position);
        state.locked.push(server);
        if state.index >= state.unlocked.len() {
            state.index = 0;
        }
        true
    }

    /// Unlocks a server, unless a listener cancels it.
    ///
    /// Returns whether the server is now unlocked.
    pub async fn unlock(&self, server: &Arc<Server>) -> bool {
        if !self.contains(&server.uuid).await {
            return false;
        }
        let event = Event::ServerUnlock {
            server: server.clone(),
        };
        if !self.events.fire_cancellable(event).await {
            return false;
        }
        let mut state = self.state.write().await;
        let Some(position) = state.locked.iter().position(|s| s.uuid == server.uuid) else {
            return state.unlocked.iter().any(|s| s.uuid == server.uuid);
        };
        let server = state.locked.remove(position);
        state.unlocked.push(server);
        true
    }

    /// Gets the server at the cursor, wrapping to the first one
    /// if the cursor is out of bounds.
    ///
    /// Will return [`None`] if no server is unlocked.
    pub async fn current(&self) -> Option<Arc<Server>> {
        let state = self.state.read().await;
        state
            .unlocked
            .get(state.index)
            .or_else(|| state.unlocked.first())
            .cloned()
    }

    /// Alias of [`LoadBalancer::current`], for callers that only
    /// want a reasonable pick.
    pub async fn static_fetch(&self) -> Option<Arc<Server>> {
        self.current().await
    }

    /// Moves the cursor according to the load balancing method.
    pub async fn iterate(&self) {
        let mut state = self.state.write().await;
        let len = state.unlocked.len();
        if len == 0 {
            state.index = 0;
            return;
        }
        let index = state.index;
        state.index = match self.method {
            LoadBalanceMethod::RoundRobin => (index + 1) % len,
            LoadBalanceMethod::LeastConnection => {
                match (state.unlocked.get(index), state.unlocked.get(index + 1)) {
                    (Some(current), Some(next)) => {
                        if current.player_count() >= next.player_count() {
                            index + 1
                        } else {
                            index
                        }
                    }
                    _ => 0,
                }
            }
            LoadBalanceMethod::MostConnection => match state.unlocked.get(index) {
                Some(current) => {
                    if current.player_count() + 1 > i64::from(current.hard_cap()) {
                        (index + 1) % len
                    } else {
                        index
                    }
                }
                None => 0,
            },
        };
    }

    /// Moves the cursor to the next server no matter what.
    pub async fn force_iterate(&self) {
        let mut state = self.state.write().await;
        let len = state.unlocked.len();
        state.index = if len == 0 { 0 } else { (state.index + 1) % len };
    }

    /// Sorts all unlocked servers and resets the cursor.
    pub async fn complete_sort(&self) {
        let mut state = self.state.write().await;
        let method = self.method;
        let weighted = self.weighted;
        match method {
            LoadBalanceMethod::RoundRobin if !weighted => return,
            _ => state
                .unlocked
                .sort_by(|a, b| compare_servers(method, weighted, a, b)),
        }
        state.index = 0;
    }

    /// Puts the server at the cursor back where it belongs, after its
    /// player count changed. Cheaper than [`LoadBalancer::complete_sort`].
    pub async fn single_sort(&self) {
        if self.method == LoadBalanceMethod::RoundRobin {
            return;
        }
        let mut state = self.state.write().await;
        let index = state.index;
        if index >= state.unlocked.len() {
            return;
        }
        let server = state.unlocked.remove(index);
        let position = state
            .unlocked
            .partition_point(|other| {
                compare_servers(self.method, self.weighted, other, &server) != Ordering::Greater
            });
        state.unlocked.insert(position, server);
        state.index = 0;
    }

    /// Snapshot of every server, unlocked ones first.
    pub async fn servers(&self) -> Vec<Arc<Server>> {
        let state = self.state.read().await;
        state
            .unlocked
            .iter()
            .chain(state.locked.iter())
            .cloned()
            .collect()
    }

    pub async fn unlocked_servers(&self) -> Vec<Arc<Server>> {
        self.state.read().await.unlocked.clone()
    }

    pub async fn locked_servers(&self) -> Vec<Arc<Server>> {
        self.state.read().await.locked.clone()
    }

    pub async fn get(&self, uuid: &Uuid) -> Option<Arc<Server>> {
        self.state.read().await.servers.get(uuid).cloned()
    }

    pub async fn contains(&self, uuid: &Uuid) -> bool {
        self.state.read().await.servers.contains_key(uuid)
    }

    pub async fn is_locked(&self, uuid: &Uuid) -> bool {
        let state = self.state.read().await;
        state.locked.iter().any(|server| &server.uuid == uuid)
    }

    pub async fn size(&self) -> usize {
        self.state.read().await.servers.len()
    }

    /// Current cursor position.
    pub async fn index(&self) -> usize {
        self.state.read().await.index
    }
}

/// Ordering used to sort unlocked servers.
///
/// Weighted sorts group servers by descending weight first. Least connection
/// then sorts by ascending player count, most connection by descending
/// player count.
fn compare_servers(
    method: LoadBalanceMethod,
    weighted: bool,
    a: &Server,
    b: &Server,
) -> Ordering {
    let by_weight = if weighted {
        b.weight.cmp(&a.weight)
    } else {
        Ordering::Equal
    };
    let by_players = match method {
        LoadBalanceMethod::RoundRobin => Ordering::Equal,
        LoadBalanceMethod::LeastConnection => a.player_count().cmp(&b.player_count()),
        LoadBalanceMethod::MostConnection => b.player_count().cmp(&a.player_count()),
    };
    by_weight.then(by_players)
}

#[async_trait::async_trait]
impl FamilyPlugin for LoadBalancer {
    fn name(&self) -> &str {
        LOAD_BALANCER_PLUGIN
    }

    async fn shutdown(&self) {
        let removed = self.clear().await;
        log::debug!("Load balancer shut down, released {} servers", removed.len());
    }
}
