use std::{sync::Arc, time::Duration};

use anyhow::Context;
use rc_magiclink::{
    packets::{Disconnect, Ping, Response, SendPlayer, SendPlayerTarget, StalePing},
    ListenerError, LocalPacket, MagicLink, PacketStatus, PacketWrapper, RemotePacket,
    SourceIdentifier,
};
use tokio::sync::{Notify, Semaphore};
use uuid::Uuid;

use crate::{config::ServerConfig, Handshake, HandshakeState, ServerAdapter};

/// Message shown to a player whose send request got no answer.
const SEND_TIMEOUT_MESSAGE: &str = "The proxy didn't answer, try again later.";

/// Backend side of RustyConnector.
///
/// Keeps the server registered to the proxy by pinging it,
/// and carries out requests of the proxy.
pub struct ServerKernel {
    /// UUID of the server, as known by MagicLink.
    pub uuid: Uuid,
    config: ServerConfig,
    magic_link: Arc<MagicLink>,
    adapter: Arc<dyn ServerAdapter>,
    handshake: Handshake,

    lock: Semaphore,
    stop_notify: Notify,
    /// Wakes the heartbeat loop up for an immediate ping.
    wake_notify: Notify,
}

fn from_proxy(packet: &RemotePacket) -> Result<(), ListenerError> {
    if packet.local().is_proxy() {
        return Ok(());
    }
    Err(ListenerError::status(
        PacketStatus::WrongSource,
        format!("{} packets can only be sent by proxies", packet.identification()),
    ))
}

impl ServerKernel {
    /// ## Arguments
    ///
    /// * `config` - Identity of the server
    /// * `magic_link` - MagicLink of the server, not started yet
    /// * `adapter` - Server adapter
    pub fn new(
        config: ServerConfig,
        magic_link: Arc<MagicLink>,
        adapter: Arc<dyn ServerAdapter>,
    ) -> anyhow::Result<Arc<Self>> {
        let uuid = magic_link
            .identity()
            .uuid()
            .filter(|_| magic_link.identity().is_server())
            .context("The MagicLink of a server must have a server identity")?;
        Ok(Arc::new(Self {
            uuid,
            config,
            magic_link,
            adapter,
            handshake: Handshake::new(),
            lock: Semaphore::new(1),
            stop_notify: Notify::new(),
            wake_notify: Notify::new(),
        }))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn magic_link(&self) -> &Arc<MagicLink> {
        &self.magic_link
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    pub fn is_running(&self) -> bool {
        self.lock.available_permits() == 0
    }

    /// Registers the MagicLink listeners, then starts MagicLink
    /// and the heartbeat loop.
    pub async fn start(self: &Arc<Self>) {
        if self.is_running() {
            return;
        }
        let kernel = Arc::downgrade(self);
        self.magic_link
            .listen::<StalePing, _>(move |stale: StalePing| {
                let kernel = kernel.clone();
                async move {
                    from_proxy(&stale.packet)?;
                    if let Some(kernel) = kernel.upgrade() {
                        log::warn!("The proxy forgot about this server, registering again");
                        kernel.handshake.reset();
                        kernel.wake_notify.notify_one();
                    }
                    Ok::<_, ListenerError>(())
                }
            })
            .await;
        let kernel = Arc::downgrade(self);
        self.magic_link
            .listen::<Disconnect, _>(move |disconnect: Disconnect| {
                let kernel = kernel.clone();
                async move {
                    from_proxy(&disconnect.packet)?;
                    if let Some(kernel) = kernel.upgrade() {
                        log::warn!("The proxy is shutting down");
                        kernel.handshake.reset();
                    }
                    Ok::<_, ListenerError>(())
                }
            })
            .await;
        self.magic_link.start();

        let kernel = self.clone();
        tokio::spawn(async move {
            let _permit = kernel.lock.acquire().await;
            kernel.run().await;
        });
    }

    async fn run(self: &Arc<Self>) {
        loop {
            self.ping().await;
            let delay = self.handshake.delay();
            tokio::select! {
                _ = self.stop_notify.notified() => return,
                _ = self.wake_notify.notified() => {},
                _ = tokio::time::sleep(delay) => {},
            }
        }
    }

    /// Pings the proxy, registering the server if it isn't yet.
    pub async fn ping(self: &Arc<Self>) -> Arc<LocalPacket> {
        let player_count = self.adapter.online_player_count().await;
        let mut builder = self
            .magic_link
            .packet()
            .identification(Ping::IDENTIFICATION)
            .parameter(Ping::MAGIC_CONFIG, self.config.magic_config.as_str())
            .parameter(Ping::ADDRESS, self.config.address.as_str())
            .parameter(Ping::PLAYER_COUNT, player_count);
        if let Some(display_name) = &self.config.display_name {
            builder = builder.parameter(Ping::DISPLAY_NAME, display_name.as_str());
        }
        if let Some(pod_name) = &self.config.pod_name {
            builder = builder.parameter(Ping::POD_NAME, pod_name.as_str());
        }
        let packet = builder
            .address_to(SourceIdentifier::all_available_proxies())
            .build();

        let seq = self.handshake.ping_sent();
        let kernel = Arc::downgrade(self);
        packet.on_reply_typed::<Response, _>(move |response| {
            if let Some(kernel) = kernel.upgrade() {
                kernel.on_ping_response(seq, response);
            }
            Ok(())
        });
        let kernel = Arc::downgrade(self);
        packet.on_timeout(move |_| {
            let Some(kernel) = kernel.upgrade() else {
                return;
            };
            if let Some(HandshakeState::Registered) = kernel.handshake.expired(seq) {
                log::warn!("The proxy stopped answering pings");
            }
        });

        if let Err(err) = self.magic_link.publish(packet.clone()).await {
            log::debug!("Could not ping the proxy: {}", err);
        }
        packet
    }

    fn on_ping_response(&self, seq: u64, response: Response) {
        if !response.successful {
            self.handshake.refused(seq);
            log::warn!(
                "The proxy refused to register this server: {}. Retrying in {}s",
                response.message,
                self.handshake.delay().as_secs()
            );
            return;
        }
        let interval = response
            .integer(Response::INTERVAL)
            .map(|interval| Duration::from_secs(interval.max(0) as u64));
        if !self.handshake.acknowledged(seq, interval) {
            return;
        }
        log::info!("Registered to the proxy: {}", response.message);
        if let Some(hard_cap) = response.integer(Response::HARD_CAP) {
            let adapter = self.adapter.clone();
            tokio::spawn(async move { adapter.set_max_players(hard_cap as i32).await });
        }
    }

    /// Asks the proxy to send a player somewhere.
    ///
    /// The player is told why if it doesn't work out.
    ///
    /// ## Arguments
    ///
    /// * `player` - Player UUID
    /// * `target` - Where to send them
    pub async fn send_player(&self, player: Uuid, target: SendPlayerTarget) -> Arc<LocalPacket> {
        let (key, value) = target.to_parameter();
        let packet = self
            .magic_link
            .packet()
            .identification(SendPlayer::IDENTIFICATION)
            .parameter(key, value)
            .parameter(SendPlayer::PLAYER, player.to_string())
            .address_to(SourceIdentifier::all_available_proxies())
            .build();

        let adapter = self.adapter.clone();
        packet.on_reply_typed::<Response, _>(move |response| {
            if !response.successful {
                let adapter = adapter.clone();
                tokio::spawn(async move { adapter.send_message(player, &response.message).await });
            }
            Ok(())
        });
        let adapter = self.adapter.clone();
        packet.on_timeout(move |_| {
            let adapter = adapter.clone();
            tokio::spawn(async move { adapter.send_message(player, SEND_TIMEOUT_MESSAGE).await });
        });

        if let Err(err) = self.magic_link.publish(packet.clone()).await {
            log::debug!("Could not send {} to {:?}: {}", player, target, err);
        }
        packet
    }

    /// Stops pinging, tells the proxy this server is going away
    /// and stops MagicLink.
    pub async fn shutdown(&self) {
        if self.is_running() {
            self.stop_notify.notify_one();
            let _ = self.lock.acquire().await;
        }
        if self.handshake.is_registered() {
            self.magic_link
                .packet()
                .identification(Disconnect::IDENTIFICATION)
                .address_to(SourceIdentifier::all_available_proxies())
                .send()
                .await;
        }
        self.handshake.reset();
        self.magic_link.stop().await;
        log::info!("Server kernel shut down");
    }
}
