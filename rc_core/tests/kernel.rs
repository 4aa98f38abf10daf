use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use rc_core::{
    config::{
        FamilyConfig, LoadBalanceMethod, LoadBalancerConfig, MagicConfig, RuntimeConfig,
        RuntimeConfigProvider,
    },
    KickResolution, Player, Proxy, ProxyAdapter, Server,
};
use rc_magiclink::{
    crypto::{generate_key, AesCryptor},
    packets::{Ping, PlayerRef, Response, SendPlayer, StalePing},
    transport::memory::MemoryNetwork,
    ListenerError, MagicLink, MagicLinkConfig, PacketWrapper, SourceIdentifier,
};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Proxy software double, recording what the kernel asks of it.
#[derive(Default)]
struct TestAdapter {
    registered: Mutex<HashSet<Uuid>>,
    online: Mutex<HashMap<Uuid, Player>>,
    connections: Mutex<Vec<(Uuid, Uuid)>>,
    disconnected: Mutex<Vec<(Uuid, String)>>,
    messages: Mutex<Vec<(Uuid, String)>>,
}

#[async_trait::async_trait]
impl ProxyAdapter for TestAdapter {
    async fn register_server(&self, server: &Server) -> bool {
        self.registered.lock().insert(server.uuid);
        true
    }

    async fn unregister_server(&self, server: &Server) {
        self.registered.lock().remove(&server.uuid);
    }

    async fn connect_server(&self, player: &Player, server: &Server) -> anyhow::Result<()> {
        self.connections.lock().push((player.uuid, server.uuid));
        Ok(())
    }

    async fn fetch_server(&self, player: &Player) -> Option<Uuid> {
        self.connections
            .lock()
            .iter()
            .rev()
            .find(|(uuid, _)| *uuid == player.uuid)
            .map(|(_, server)| *server)
    }

    async fn fetch_player(&self, player: &PlayerRef) -> Option<Player> {
        let online = self.online.lock();
        match player {
            PlayerRef::Uuid(uuid) => online.get(uuid).cloned(),
            PlayerRef::Username(username) => online
                .values()
                .find(|player| &player.username == username)
                .cloned(),
        }
    }

    async fn is_online(&self, player: &Player) -> bool {
        self.online.lock().contains_key(&player.uuid)
    }

    async fn check_permission(&self, _: &Player, _: &str) -> bool {
        false
    }

    async fn message_player(&self, player: &Player, message: &str) {
        self.messages.lock().push((player.uuid, message.to_owned()));
    }

    async fn disconnect(&self, player: &Player, reason: &str) {
        self.online.lock().remove(&player.uuid);
        self.disconnected
            .lock()
            .push((player.uuid, reason.to_owned()));
    }
}

impl TestAdapter {
    fn join(&self, username: &str) -> Player {
        let player = Player::new(Uuid::new_v4(), username);
        self.online.lock().insert(player.uuid, player.clone());
        player
    }
}

struct Network {
    memory: Arc<MemoryNetwork>,
    cryptor: Arc<AesCryptor>,
    proxy: Proxy,
    adapter: Arc<TestAdapter>,
}

fn runtime_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.server_timeout = 6;
    config.magic_configs.insert(
        "lobby".to_owned(),
        MagicConfig {
            family: "lobby".to_owned(),
            weight: 0,
            soft_cap: 20,
            hard_cap: 30,
        },
    );
    config.magic_configs.insert(
        "games".to_owned(),
        MagicConfig {
            family: "games".to_owned(),
            weight: 0,
            soft_cap: 2,
            hard_cap: 2,
        },
    );
    config
}

fn family(id: &str, parent: Option<&str>) -> FamilyConfig {
    FamilyConfig {
        id: id.to_owned(),
        display_name: None,
        parent: parent.map(str::to_owned),
        load_balancer: LoadBalancerConfig {
            method: LoadBalanceMethod::LeastConnection,
            ..Default::default()
        },
    }
}

async fn network() -> Network {
    let memory = MemoryNetwork::new();
    let cryptor = Arc::new(AesCryptor::from_base64(&generate_key().unwrap()).unwrap());
    let identity = SourceIdentifier::proxy(Uuid::new_v4());
    let link = MagicLink::new(
        identity.clone(),
        cryptor.clone(),
        memory.connect(identity),
        MagicLinkConfig::default(),
    );
    let adapter = Arc::new(TestAdapter::default());
    let config_provider = Arc::new(RuntimeConfigProvider::new(runtime_config()));
    let kernel = rc_core::ProxyKernel::new(
        config_provider,
        link,
        adapter.clone(),
        "lobby",
        &[family("lobby", None), family("games", Some("lobby"))],
    )
    .await
    .unwrap();
    let proxy = Proxy::new(kernel);
    proxy.start().await;
    Network {
        memory,
        cryptor,
        proxy,
        adapter,
    }
}

impl Network {
    fn server(&self) -> Arc<MagicLink> {
        let identity = SourceIdentifier::server(Uuid::new_v4());
        let link = MagicLink::new(
            identity.clone(),
            self.cryptor.clone(),
            self.memory.connect(identity),
            MagicLinkConfig::default(),
        );
        link.start();
        link
    }
}

/// Publishes a packet and waits for its response.
async fn request(link: &Arc<MagicLink>, packet: rc_magiclink::ReadyForSending) -> Response {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let packet = packet.build();
    packet.on_reply_typed::<Response, _>(move |response| {
        let _ = tx.send(response);
        Ok(())
    });
    link.publish(packet).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap()
}

async fn ping(link: &Arc<MagicLink>, magic_config: &str, player_count: i64) -> Response {
    let packet = link
        .packet()
        .identification(Ping::IDENTIFICATION)
        .parameter(Ping::MAGIC_CONFIG, magic_config)
        .parameter(Ping::ADDRESS, "10.0.0.5:25566")
        .parameter(Ping::PLAYER_COUNT, player_count)
        .address_to(SourceIdentifier::all_available_proxies());
    request(link, packet).await
}

fn uuid_of(link: &MagicLink) -> Uuid {
    link.identity().uuid().unwrap()
}

#[tokio::test]
async fn servers_register_by_pinging() {
    let network = network().await;
    let kernel = &network.proxy.kernel;
    let server = network.server();

    let response = ping(&server, "lobby", 0).await;
    assert!(response.successful, "{}", response.message);
    assert_eq!(response.integer(Response::INTERVAL), Some(10));
    assert_eq!(response.integer(Response::HARD_CAP), Some(30));

    let uuid = uuid_of(&server);
    let registered = kernel.families().find_server(&uuid).await.unwrap();
    assert_eq!(registered.family().as_deref(), Some("lobby"));
    assert_eq!(registered.soft_cap(), 20);
    assert!(network.adapter.registered.lock().contains(&uuid));

    registered.decrease_timeout(3);
    let response = ping(&server, "lobby", 7).await;
    assert!(response.successful);
    assert_eq!(registered.timeout(), 6);
    assert_eq!(registered.player_count(), 7);
    assert_eq!(kernel.families().find("lobby").await.unwrap().servers().await.len(), 1);
}

#[tokio::test]
async fn unknown_magic_configs_are_refused() {
    let network = network().await;
    let server = network.server();

    let response = ping(&server, "survival", 0).await;
    assert!(!response.successful);
    assert_eq!(response.message, "The magic config `survival` doesn't exist");
    assert!(network
        .proxy
        .kernel
        .families()
        .find_server(&uuid_of(&server))
        .await
        .is_none());
}

#[tokio::test]
async fn silent_servers_go_stale() {
    let network = network().await;
    let kernel = &network.proxy.kernel;
    let server = network.server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    server
        .listen::<StalePing, _>(move |_: StalePing| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(());
                Ok::<_, ListenerError>(())
            }
        })
        .await;

    assert!(ping(&server, "lobby", 0).await.successful);
    let uuid = uuid_of(&server);

    kernel.heartbeat().await;
    assert!(kernel.families().find_server(&uuid).await.is_some());
    kernel.heartbeat().await;
    assert!(kernel.families().find_server(&uuid).await.is_none());
    assert!(!network.adapter.registered.lock().contains(&uuid));

    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(!network.memory.is_connected(server.identity()));
}

#[tokio::test]
async fn disconnecting_servers_unregister() {
    let network = network().await;
    let kernel = &network.proxy.kernel;
    let server = network.server();
    assert!(ping(&server, "lobby", 0).await.successful);

    let packet = server
        .packet()
        .identification(rc_magiclink::packets::Disconnect::IDENTIFICATION)
        .address_to(SourceIdentifier::all_available_proxies())
        .build();
    server.publish(packet).await.unwrap();

    let uuid = uuid_of(&server);
    for _ in 0..50 {
        if kernel.families().find_server(&uuid).await.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(kernel.families().find_server(&uuid).await.is_none());
}

#[tokio::test]
async fn players_join_the_root_family() {
    let network = network().await;
    let kernel = &network.proxy.kernel;
    let first = network.server();
    let second = network.server();
    assert!(ping(&first, "lobby", 0).await.successful);
    assert!(ping(&second, "lobby", 0).await.successful);

    let steve = network.adapter.join("Steve");
    let alex = network.adapter.join("Alex");
    let result = kernel.on_join(&steve).await;
    assert!(result.is_success());
    let result = kernel.on_join(&alex).await;
    assert!(result.is_success());

    // least connection spreads players over both servers
    let servers: HashSet<Uuid> = network
        .adapter
        .connections
        .lock()
        .iter()
        .map(|(_, server)| *server)
        .collect();
    assert_eq!(servers.len(), 2);

    let server = kernel.adapter().fetch_server(&steve).await;
    kernel.on_leave(&steve, server).await;
    let lobby = kernel.families().find("lobby").await.unwrap();
    assert_eq!(lobby.player_count().await, 1);
}

#[tokio::test]
async fn joining_without_servers_disconnects() {
    let network = network().await;
    let steve = network.adapter.join("Steve");

    let result = network.proxy.kernel.on_join(&steve).await;
    assert!(!result.is_success());
    let disconnected = network.adapter.disconnected.lock();
    assert_eq!(disconnected.len(), 1);
    assert_eq!(disconnected[0].1, result.message);
}

#[tokio::test]
async fn kicked_players_fall_back_to_the_parent_family() {
    let network = network().await;
    let kernel = &network.proxy.kernel;
    let lobby = network.server();
    let games = network.server();
    assert!(ping(&lobby, "lobby", 0).await.successful);
    assert!(ping(&games, "games", 0).await.successful);

    let steve = network.adapter.join("Steve");
    let games_uuid = uuid_of(&games);
    let games_server = kernel.families().find_server(&games_uuid).await.unwrap();
    assert!(kernel.connect_server(&steve, &games_server).await.is_success());
    assert_eq!(games_server.player_count(), 1);
    let again = kernel.connect_server(&steve, &games_server).await;
    assert!(!again.is_success());
    assert_eq!(again.message, "You're already connected to this server.");
    assert_eq!(games_server.player_count(), 1);

    let resolution = kernel.on_kick(&steve, Some(games_uuid), "Game over").await;
    let KickResolution::Redirected(result) = resolution else {
        panic!("kicked player should have been redirected");
    };
    assert_eq!(result.server.unwrap().uuid, uuid_of(&lobby));
    assert_eq!(games_server.player_count(), 0);
    assert_eq!(
        network.adapter.messages.lock().as_slice(),
        &[(steve.uuid, "Game over".to_owned())]
    );

    // there's nowhere to go when kicked from the root family
    let resolution = kernel.on_kick(&steve, Some(uuid_of(&lobby)), "Banned").await;
    assert!(matches!(
        resolution,
        KickResolution::Disconnected { ref reason } if reason == "Banned"
    ));
    assert_eq!(network.adapter.disconnected.lock().len(), 1);
}

#[tokio::test]
async fn servers_can_send_players_around() {
    let network = network().await;
    let lobby = network.server();
    let games = network.server();
    assert!(ping(&lobby, "lobby", 0).await.successful);
    assert!(ping(&games, "games", 0).await.successful);
    let steve = network.adapter.join("Steve");

    let packet = lobby
        .packet()
        .identification(SendPlayer::IDENTIFICATION)
        .parameter(SendPlayer::GENERIC_TARGET, "games")
        .parameter(SendPlayer::PLAYER, "Steve")
        .address_to(SourceIdentifier::all_available_proxies());
    let response = request(&lobby, packet).await;
    assert!(response.successful, "{}", response.message);
    assert_eq!(
        network.adapter.connections.lock().last(),
        Some(&(steve.uuid, uuid_of(&games)))
    );

    let packet = lobby
        .packet()
        .identification(SendPlayer::IDENTIFICATION)
        .parameter(SendPlayer::TARGET_FAMILY, "games")
        .parameter(SendPlayer::PLAYER, "Herobrine")
        .address_to(SourceIdentifier::all_available_proxies());
    let response = request(&lobby, packet).await;
    assert!(!response.successful);
    assert_eq!(response.message, "The player `Herobrine` is not online");
}

#[tokio::test]
async fn shutdown_releases_every_server() {
    let network = network().await;
    let server = network.server();
    assert!(ping(&server, "lobby", 0).await.successful);

    network.proxy.shutdown().await;
    assert!(network.adapter.registered.lock().is_empty());
    assert!(network.proxy.kernel.families().families().await.is_empty());
    assert!(!network.proxy.scheduler.is_running());
}
