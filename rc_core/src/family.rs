use std::{collections::HashMap, sync::Arc};

use anyhow::bail;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    config::FamilyConfig,
    events::{Event, EventManager},
    load_balancer::LOAD_BALANCER_PLUGIN,
    ConnectionResult, LoadBalancer, Player, ProxyAdapter, Server,
};

/// Maximum length of a family ID.
pub const MAX_FAMILY_ID_LENGTH: usize = 24;

/// Extension installed on a family, such as its load balancer.
#[async_trait::async_trait]
pub trait FamilyPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Called when the plugin is uninstalled or its family unregistered.
    async fn shutdown(&self);
}

/// A set of servers that players can be routed to.
///
/// Each family has its own load balancer to decide
/// where to send new connections to.
pub struct Family {
    /// Family ID.
    pub id: String,
    /// Name shown to players.
    pub display_name: Option<String>,
    /// Family kicked players are sent to.
    pub parent: Option<String>,
    /// Load balancer, also installed as a plugin.
    load_balancer: Arc<LoadBalancer>,
    /// Installed plugins, by name.
    plugins: RwLock<HashMap<String, Arc<dyn FamilyPlugin>>>,
}

impl Family {
    /// Initializes an empty family.
    ///
    /// ## Arguments
    ///
    /// * `config` - Family configuration
    /// * `events` - Event manager the load balancer fires lock events on
    pub fn new(config: &FamilyConfig, events: Arc<EventManager>) -> anyhow::Result<Self> {
        if config.id.is_empty() || config.id.len() > MAX_FAMILY_ID_LENGTH {
            bail!(
                "Family ID `{}` must be between 1 and {} characters long",
                config.id,
                MAX_FAMILY_ID_LENGTH
            );
        }
        let load_balancer = Arc::new(LoadBalancer::new(&config.load_balancer, events));
        let mut plugins: HashMap<String, Arc<dyn FamilyPlugin>> = HashMap::new();
        plugins.insert(LOAD_BALANCER_PLUGIN.to_owned(), load_balancer.clone());
        Ok(Self {
            id: config.id.clone(),
            display_name: config.display_name.clone(),
            parent: config.parent.clone(),
            load_balancer,
            plugins: RwLock::new(plugins),
        })
    }

    /// Display name, falling back to the ID.
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }

    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.load_balancer
    }

    /// Installs a plugin, replacing (and shutting down) any plugin of the same name.
    pub async fn install_plugin(&self, plugin: Arc<dyn FamilyPlugin>) -> anyhow::Result<()> {
        if plugin.name() == LOAD_BALANCER_PLUGIN {
            bail!("The load balancer of family `{}` can't be replaced", self.id);
        }
        let previous = {
            let mut plugins = self.plugins.write().await;
            plugins.insert(plugin.name().to_owned(), plugin)
        };
        if let Some(previous) = previous {
            previous.shutdown().await;
        }
        Ok(())
    }

    /// Uninstalls and shuts down a plugin.
    pub async fn uninstall_plugin(&self, name: &str) -> bool {
        if name == LOAD_BALANCER_PLUGIN {
            return false;
        }
        let removed = self.plugins.write().await.remove(name);
        match removed {
            Some(plugin) => {
                plugin.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub async fn plugin(&self, name: &str) -> Option<Arc<dyn FamilyPlugin>> {
        self.plugins.read().await.get(name).cloned()
    }

    pub async fn plugin_names(&self) -> Vec<String> {
        self.plugins.read().await.keys().cloned().collect()
    }

    /// Adds a server to the family.
    pub async fn add_server(&self, server: Arc<Server>) {
        server.set_family(Some(self.id.clone()));
        self.load_balancer.add(server).await;
    }

    /// Removes a server from the family.
    pub async fn remove_server(&self, uuid: &Uuid) -> Option<Arc<Server>> {
        let server = self.load_balancer.remove(uuid).await?;
        server.set_family(None);
        Some(server)
    }

    pub async fn find_server(&self, uuid: &Uuid) -> Option<Arc<Server>> {
        self.load_balancer.get(uuid).await
    }

    /// Snapshot of the family's servers.
    pub async fn servers(&self) -> Vec<Arc<Server>> {
        self.load_balancer.servers().await
    }

    /// Total number of players on the family's servers.
    pub async fn player_count(&self) -> i64 {
        self.servers()
            .await
            .iter()
            .map(|server| server.player_count())
            .sum()
    }

    /// Connects a player to one of the family's servers.
    ///
    /// With persistence enabled, several servers are tried in turn
    /// before giving up.
    ///
    /// ## Arguments
    ///
    /// * `player` - Player to connect
    /// * `adapter` - Proxy adapter carrying out the connection
    /// * `events` - Event manager join events are fired on
    pub async fn connect(
        &self,
        player: &Player,
        adapter: &dyn ProxyAdapter,
        events: &EventManager,
    ) -> ConnectionResult {
        let pre_join = Event::FamilyPreJoin {
            family: self.id.clone(),
            player: player.clone(),
        };
        if !events.fire_cancellable(pre_join).await {
            return ConnectionResult::failed("You can't join this family right now.");
        }

        let lb = &self.load_balancer;
        let attempts = if lb.persistence() {
            lb.attempts().max(1)
        } else {
            1
        };
        let mut result = ConnectionResult::failed("There are no servers for you to connect to!");
        for _ in 0..attempts {
            let Some(server) = lb.current().await else {
                break;
            };
            let pre_join = Event::ServerPreJoin {
                server: server.clone(),
                player: player.clone(),
            };
            if !events.fire_cancellable(pre_join).await {
                result = ConnectionResult::failed("You can't join this server right now.");
                lb.force_iterate().await;
                continue;
            }
            result = server.connect(adapter, player).await;
            if result.is_success() {
                lb.single_sort().await;
                lb.iterate().await;
                events
                    .fire(Event::ServerPostJoin {
                        server: server.clone(),
                        player: player.clone(),
                    })
                    .await;
                events
                    .fire(Event::FamilyPostJoin {
                        family: self.id.clone(),
                        server,
                        player: player.clone(),
                    })
                    .await;
                return result;
            }
            lb.force_iterate().await;
        }
        result
    }

    /// Shuts down every plugin, releasing the family's servers.
    ///
    /// Returns the servers the family had.
    pub async fn shutdown(&self) -> Vec<Arc<Server>> {
        let servers = self.servers().await;
        for server in servers.iter() {
            server.set_family(None);
        }
        let plugins: Vec<_> = self.plugins.read().await.values().cloned().collect();
        for plugin in plugins {
            plugin.shutdown().await;
        }
        servers
    }
}
