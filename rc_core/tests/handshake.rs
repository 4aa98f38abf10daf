//! A proxy kernel and a server kernel talking over the in-memory transport.

use std::{sync::Arc, time::Duration};

use rc_core::{
    config::{FamilyConfig, MagicConfig, RuntimeConfig, RuntimeConfigProvider},
    Player, Proxy, ProxyAdapter, ProxyKernel, Server,
};
use rc_magiclink::{
    crypto::{generate_key, AesCryptor},
    packets::PlayerRef,
    transport::memory::MemoryNetwork,
    MagicLink, MagicLinkConfig, SourceIdentifier,
};
use rc_server::{config::ServerConfig, ServerAdapter, ServerKernel};
use uuid::Uuid;

struct HeadlessProxy;

#[async_trait::async_trait]
impl ProxyAdapter for HeadlessProxy {
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
        true
    }

    async fn check_permission(&self, _: &Player, _: &str) -> bool {
        false
    }

    async fn message_player(&self, _: &Player, _: &str) {}

    async fn disconnect(&self, _: &Player, _: &str) {}
}

struct HeadlessServer;

#[async_trait::async_trait]
impl ServerAdapter for HeadlessServer {
    async fn online_player_count(&self) -> i64 {
        4
    }

    async fn set_max_players(&self, _: i32) {}

    async fn player_uuid(&self, _: &str) -> Option<Uuid> {
        None
    }

    async fn player_username(&self, _: Uuid) -> Option<String> {
        None
    }

    async fn is_online(&self, _: Uuid) -> bool {
        false
    }

    async fn send_message(&self, _: Uuid, _: &str) {}
}

async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition was never met");
}

#[tokio::test]
async fn servers_register_then_go_stale() {
    let memory = MemoryNetwork::new();
    let cryptor = Arc::new(AesCryptor::from_base64(&generate_key().unwrap()).unwrap());

    let mut config = RuntimeConfig::default();
    config.server_timeout = 3;
    config.magic_configs.insert(
        "lobby".to_owned(),
        MagicConfig {
            family: "lobby".to_owned(),
            weight: 0,
            soft_cap: 20,
            hard_cap: 30,
        },
    );
    let proxy_id = SourceIdentifier::proxy(Uuid::new_v4());
    let proxy_link = MagicLink::new(
        proxy_id.clone(),
        cryptor.clone(),
        memory.connect(proxy_id),
        MagicLinkConfig::default(),
    );
    let kernel = ProxyKernel::new(
        Arc::new(RuntimeConfigProvider::new(config)),
        proxy_link,
        Arc::new(HeadlessProxy),
        "lobby",
        &[FamilyConfig {
            id: "lobby".to_owned(),
            display_name: None,
            parent: None,
            load_balancer: Default::default(),
        }],
    )
    .await
    .unwrap();
    let proxy = Proxy::new(kernel.clone());
    proxy.start().await;

    let server_id = SourceIdentifier::server(Uuid::new_v4());
    let server_link = MagicLink::new(
        server_id.clone(),
        cryptor,
        memory.connect(server_id),
        MagicLinkConfig::default(),
    );
    let server = ServerKernel::new(
        ServerConfig {
            magic_config: "lobby".to_owned(),
            address: "10.0.0.5:25566".to_owned(),
            display_name: Some("Lobby #1".to_owned()),
            pod_name: None,
        },
        server_link,
        Arc::new(HeadlessServer),
    )
    .unwrap();
    server.start().await;

    wait_for(|| async { server.handshake().is_registered() }).await;
    let registered = kernel.families().find_server(&server.uuid).await.unwrap();
    assert_eq!(registered.name(), "Lobby #1");
    assert_eq!(registered.player_count(), 4);

    // a single heartbeat tick takes the whole timeout away
    kernel.heartbeat().await;
    assert!(registered.stale());
    let current = kernel.families().find_server(&server.uuid).await;
    assert!(current.map_or(true, |current| !Arc::ptr_eq(&current, &registered)));
    assert!(!memory.is_connected(&SourceIdentifier::server(server.uuid)));
}

#[tokio::test]
async fn proxy_shutdown_resets_servers() {
    let memory = MemoryNetwork::new();
    let cryptor = Arc::new(AesCryptor::from_base64(&generate_key().unwrap()).unwrap());

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
    let proxy_id = SourceIdentifier::proxy(Uuid::new_v4());
    let kernel = ProxyKernel::new(
        Arc::new(RuntimeConfigProvider::new(config)),
        MagicLink::new(
            proxy_id.clone(),
            cryptor.clone(),
            memory.connect(proxy_id),
            MagicLinkConfig::default(),
        ),
        Arc::new(HeadlessProxy),
        "lobby",
        &[FamilyConfig {
            id: "lobby".to_owned(),
            display_name: None,
            parent: None,
            load_balancer: Default::default(),
        }],
    )
    .await
    .unwrap();
    let proxy = Proxy::new(kernel);
    proxy.start().await;

    let server_id = SourceIdentifier::server(Uuid::new_v4());
    let server = ServerKernel::new(
        ServerConfig {
            magic_config: "lobby".to_owned(),
            address: "10.0.0.6:25566".to_owned(),
            display_name: None,
            pod_name: None,
        },
        MagicLink::new(
            server_id.clone(),
            cryptor,
            memory.connect(server_id),
            MagicLinkConfig::default(),
        ),
        Arc::new(HeadlessServer),
    )
    .unwrap();
    server.start().await;
    wait_for(|| async { server.handshake().is_registered() }).await;

    proxy.shutdown().await;
    wait_for(|| async { !server.handshake().is_registered() }).await;
}
