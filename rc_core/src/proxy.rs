//! RustyConnector proxy kernel.

use std::sync::Arc;

use anyhow::{bail, Context};
use rc_magiclink::{
    packets::{Disconnect, StalePing},
    MagicLink, PacketWrapper, SourceIdentifier,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    config::{FamilyConfig, RuntimeConfig, RuntimeConfigProvider, HEARTBEAT_INTERVAL},
    events::{Event, EventManager},
    handlers,
    scheduler::Scheduler,
    Family, FamilyRegistry, ProxyAdapter, Server, ServerDetails,
};

/// State shared by everything running on the proxy:
/// the family topology, the MagicLink and the adapter.
pub struct ProxyKernel {
    /// UUID of the proxy, as known by MagicLink.
    pub uuid: Uuid,
    /// Runtime config provider.
    config_provider: Arc<RuntimeConfigProvider>,
    magic_link: Arc<MagicLink>,
    families: FamilyRegistry,
    adapter: Arc<dyn ProxyAdapter>,
    events: Arc<EventManager>,
    /// Serializes server registrations.
    registration_lock: Mutex<()>,
}

/// Why a server is being unregistered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnregisterCause {
    /// The server said goodbye.
    Disconnect,
    /// The server stopped pinging.
    Timeout,
    /// The proxy is shutting down.
    Shutdown,
}

/// [`Proxy`] is a wrapper around a [`ProxyKernel`],
/// that also deals with starting and stopping its background tasks.
pub struct Proxy {
    /// Proxy kernel.
    pub kernel: Arc<ProxyKernel>,
    /// Runtime config provider.
    pub config_provider: Arc<RuntimeConfigProvider>,
    /// Scheduler.
    pub scheduler: Scheduler,
}

impl ProxyKernel {
    /// Initializes the kernel and registers the configured families.
    ///
    /// ## Arguments
    ///
    /// * `config_provider` - Runtime config provider
    /// * `magic_link` - MagicLink of the proxy, not started yet
    /// * `adapter` - Proxy adapter
    /// * `root_family` - ID of the family players join first
    /// * `families` - Families to register
    pub async fn new(
        config_provider: Arc<RuntimeConfigProvider>,
        magic_link: Arc<MagicLink>,
        adapter: Arc<dyn ProxyAdapter>,
        root_family: &str,
        families: &[FamilyConfig],
    ) -> anyhow::Result<Arc<Self>> {
        let uuid = magic_link
            .identity()
            .uuid()
            .filter(|_| magic_link.identity().is_proxy())
            .context("The MagicLink of a proxy must have a proxy identity")?;
        let event_timeout = config_provider.read().await.event_timeout();
        let events = Arc::new(EventManager::new(event_timeout));

        let registry = FamilyRegistry::new(root_family);
        for config in families.iter() {
            let family = Family::new(config, events.clone())?;
            registry.register(Arc::new(family)).await?;
        }
        if registry.root().await.is_none() {
            bail!("The root family `{}` is not configured", root_family);
        }
        for family in registry.families().await {
            if let Some(parent) = &family.parent {
                if registry.find(parent).await.is_none() {
                    bail!(
                        "Family `{}` has parent `{}` which is not configured",
                        family.id,
                        parent
                    );
                }
            }
        }
        for family in registry.families().await {
            log::info!("Registered family {}", family.id);
            events
                .fire(Event::FamilyRegister {
                    family: family.id.clone(),
                })
                .await;
        }

        Ok(Arc::new(Self {
            uuid,
            config_provider,
            magic_link,
            families: registry,
            adapter,
            events,
            registration_lock: Mutex::new(()),
        }))
    }

    pub fn config_provider(&self) -> &Arc<RuntimeConfigProvider> {
        &self.config_provider
    }

    pub fn magic_link(&self) -> &Arc<MagicLink> {
        &self.magic_link
    }

    pub fn families(&self) -> &FamilyRegistry {
        &self.families
    }

    pub fn adapter(&self) -> &dyn ProxyAdapter {
        self.adapter.as_ref()
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub(crate) fn registration_lock(&self) -> &Mutex<()> {
        &self.registration_lock
    }

    /// Creates a server and adds it to a family.
    ///
    /// ## Arguments
    ///
    /// * `details` - Server details
    /// * `family_id` - Family the server joins
    pub async fn register_server(
        &self,
        details: ServerDetails,
        family_id: &str,
    ) -> anyhow::Result<Arc<Server>> {
        let Some(family) = self.families.find(family_id).await else {
            bail!("The family `{}` doesn't exist", family_id);
        };
        if let Some(existing) = self.families.find_server(&details.uuid).await {
            return Ok(existing);
        }
        let server = Arc::new(Server::new(details));
        if !self.adapter.register_server(&server).await {
            bail!("The proxy refused to register server {}", server.uuid);
        }
        family.add_server(server.clone()).await;
        log::info!(
            "Registered server {} ({}) in family {}",
            server.name(),
            server.address,
            family.id
        );
        self.events
            .fire(Event::ServerRegister {
                family: family.id.clone(),
                server: server.clone(),
            })
            .await;
        Ok(server)
    }

    /// Removes a server from its family and forgets it.
    ///
    /// A server removed for staleness is told to register again
    /// and its MagicLink session is closed.
    pub async fn unregister_server(
        &self,
        uuid: &Uuid,
        cause: UnregisterCause,
    ) -> Option<Arc<Server>> {
        let server = self.families.find_server(uuid).await?;
        let family = server.family();
        if let Some(family) = self.families.family_of(&server).await {
            family.remove_server(uuid).await;
        }
        self.adapter.unregister_server(&server).await;
        let event = match cause {
            UnregisterCause::Timeout => Event::ServerTimeout {
                family: family.clone(),
                server: server.clone(),
            },
            UnregisterCause::Disconnect | UnregisterCause::Shutdown => Event::ServerUnregister {
                family: family.clone(),
                server: server.clone(),
            },
        };
        self.events.fire(event).await;

        if cause == UnregisterCause::Timeout {
            let identity = server.identity();
            self.magic_link
                .packet()
                .identification(StalePing::IDENTIFICATION)
                .address_to(identity.clone())
                .send()
                .await;
            self.magic_link.close_session(&identity).await;
        }
        log::info!(
            "Unregistered server {} from family {} ({:?})",
            server.name(),
            family.as_deref().unwrap_or("-"),
            cause
        );
        Some(server)
    }

    /// Heartbeat tick: every server loses timeout,
    /// and the ones that become stale are unregistered.
    ///
    /// Staleness is checked again under the registration lock,
    /// a ping handled meanwhile keeps the server.
    pub async fn heartbeat(&self) {
        let by = HEARTBEAT_INTERVAL.as_secs() as i64;
        for family in self.families.families().await {
            for server in family.servers().await {
                if server.decrease_timeout(by) > 0 {
                    continue;
                }
                let _guard = self.registration_lock.lock().await;
                if !server.stale() {
                    continue;
                }
                log::warn!(
                    "Server {} in family {} stopped pinging, unregistering it",
                    server.name(),
                    family.id
                );
                self.unregister_server(&server.uuid, UnregisterCause::Timeout)
                    .await;
            }
        }
    }

    /// Fully sorts the load balancer of every family.
    pub async fn rebalance(&self) {
        for family in self.families.families().await {
            family.load_balancer().complete_sort().await;
        }
    }

    /// Tells every server the proxy is going away and unregisters everything.
    pub async fn shutdown(&self) {
        self.magic_link
            .packet()
            .identification(Disconnect::IDENTIFICATION)
            .address_to(SourceIdentifier::all_available_servers())
            .send()
            .await;
        for family in self.families.families().await {
            let Some((family, servers)) = self.families.unregister(&family.id).await else {
                continue;
            };
            for server in servers {
                self.adapter.unregister_server(&server).await;
                self.events
                    .fire(Event::ServerUnregister {
                        family: Some(family.id.clone()),
                        server,
                    })
                    .await;
            }
            self.events
                .fire(Event::FamilyUnregister {
                    family: family.id.clone(),
                })
                .await;
        }
        self.magic_link.stop().await;
        log::info!("Proxy kernel shut down");
    }
}

impl Proxy {
    pub fn new(kernel: Arc<ProxyKernel>) -> Self {
        let config_provider = kernel.config_provider().clone();
        let scheduler = Scheduler::new(kernel.clone());
        Self {
            kernel,
            config_provider,
            scheduler,
        }
    }

    /// Registers the MagicLink listeners, then starts MagicLink and the scheduler.
    pub async fn start(&self) {
        handlers::register(&self.kernel).await;
        self.kernel.magic_link().start();
        self.scheduler.start();
    }

    /// Applies a new runtime configuration.
    pub async fn reload_config(&self, config: RuntimeConfig) {
        self.kernel.events().set_timeout(config.event_timeout());
        self.config_provider.reload(config).await;
    }

    /// Stops the scheduler and shuts the kernel down.
    pub async fn shutdown(&self) {
        self.scheduler.stop(true).await;
        self.kernel.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use rc_magiclink::{
        crypto::{generate_key, AesCryptor},
        packets::PlayerRef,
        transport::memory::MemoryNetwork,
        MagicLinkConfig,
    };

    use super::*;
    use crate::{config::MagicConfig, Player};

    struct Headless;

    #[async_trait::async_trait]
    impl ProxyAdapter for Headless {
        async fn register_server(&self, _: &Server) -> bool {
            true
        }

        async fn unregister_server(&self, _: &Server) {}

        async fn connect_server(&self, _: &Player, _: &Server) -> anyhow::Result<()> {
            Ok(())
        }

        async fn fetch_server(&self, _: &Player) -> Option<Uuid> {
            None
        }

        async fn fetch_player(&self, _: &PlayerRef) -> Option<Player> {
            None
        }

        async fn is_online(&self, _: &Player) -> bool {
            false
        }

        async fn check_permission(&self, _: &Player, _: &str) -> bool {
            false
        }

        async fn message_player(&self, _: &Player, _: &str) {}

        async fn disconnect(&self, _: &Player, _: &str) {}
    }

    async fn kernel() -> Arc<ProxyKernel> {
        let memory = MemoryNetwork::new();
        let cryptor = Arc::new(AesCryptor::from_base64(&generate_key().unwrap()).unwrap());
        let identity = SourceIdentifier::proxy(Uuid::new_v4());
        let link = MagicLink::new(
            identity.clone(),
            cryptor,
            memory.connect(identity),
            MagicLinkConfig::default(),
        );
        let mut config = RuntimeConfig::default();
        config.magic_configs.insert(
            "lobby".to_owned(),
            MagicConfig {
                family: "lobby".to_owned(),
                weight: 0,
                soft_cap: 20,
                hard_cap: 30,
            },
        );
        ProxyKernel::new(
            Arc::new(RuntimeConfigProvider::new(config)),
            link,
            Arc::new(Headless),
            "lobby",
            &[FamilyConfig {
                id: "lobby".to_owned(),
                display_name: None,
                parent: None,
                load_balancer: Default::default(),
            }],
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn heartbeats_spare_servers_pinged_while_waiting() {
        let kernel = kernel().await;
        let server = kernel
            .register_server(
                ServerDetails {
                    uuid: Uuid::new_v4(),
                    address: "10.0.0.5:25566".to_owned(),
                    display_name: None,
                    pod_name: None,
                    weight: 0,
                    soft_cap: 20,
                    hard_cap: 30,
                    timeout: HEARTBEAT_INTERVAL.as_secs() as i64,
                },
                "lobby",
            )
            .await
            .unwrap();

        // a ping is being handled while the heartbeat ticks
        let guard = kernel.registration_lock().lock().await;
        let heartbeat = tokio::spawn({
            let kernel = kernel.clone();
            async move { kernel.heartbeat().await }
        });
        while !server.stale() {
            tokio::task::yield_now().await;
        }
        server.set_timeout(6);
        drop(guard);
        heartbeat.await.unwrap();

        let current = kernel.families().find_server(&server.uuid).await.unwrap();
        assert!(Arc::ptr_eq(&current, &server));
    }
}
