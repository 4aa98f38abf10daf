//! MagicLink listeners of the proxy.

use std::sync::{Arc, Weak};

use rc_magiclink::{
    packets::{Disconnect, Ping, Response, SendPlayer},
    ListenerError, ListenerOptions, PacketHandler, PacketStatus, PacketWrapper, RemotePacket,
};
use uuid::Uuid;

use crate::{proxy::UnregisterCause, ProxyKernel, ServerDetails};

/// Registers every proxy listener on the kernel's MagicLink.
pub(crate) async fn register(kernel: &Arc<ProxyKernel>) {
    let link = kernel.magic_link();
    let reply_on_error = ListenerOptions {
        reply_on_error: true,
    };
    link.listen_with::<Ping, _>(PingHandler::new(kernel), reply_on_error)
        .await;
    link.listen::<Disconnect, _>(DisconnectHandler::new(kernel))
        .await;
    link.listen_with::<SendPlayer, _>(SendPlayerHandler::new(kernel), reply_on_error)
        .await;
}

/// Registers new servers and keeps registered ones alive.
struct PingHandler {
    kernel: Weak<ProxyKernel>,
}

/// Unregisters servers that are shutting down.
struct DisconnectHandler {
    kernel: Weak<ProxyKernel>,
}

/// Moves players on behalf of servers.
struct SendPlayerHandler {
    kernel: Weak<ProxyKernel>,
}

fn upgrade(kernel: &Weak<ProxyKernel>) -> Result<Arc<ProxyKernel>, ListenerError> {
    kernel
        .upgrade()
        .ok_or_else(|| ListenerError::status(PacketStatus::Canceled, "The proxy is shutting down"))
}

/// UUID of the server that sent a packet.
fn sender(packet: &RemotePacket) -> Result<Uuid, ListenerError> {
    packet
        .local()
        .uuid()
        .filter(|_| packet.local().is_server())
        .ok_or_else(|| {
            ListenerError::status(
                PacketStatus::WrongSource,
                format!("{} packets can only be sent by servers", packet.identification()),
            )
        })
}

async fn reply(
    kernel: &ProxyKernel,
    packet: &RemotePacket,
    successful: bool,
    message: impl Into<String>,
    extra: &[(&str, i64)],
) {
    let message: String = message.into();
    kernel
        .magic_link()
        .packet()
        .identification(Response::IDENTIFICATION)
        .parameter(Response::SUCCESSFUL, successful)
        .parameter(Response::MESSAGE, message)
        .parameters(extra.iter().map(|(key, value)| (key.to_string(), *value)))
        .address_to_packet(packet)
        .send()
        .await;
}

impl PingHandler {
    fn new(kernel: &Arc<ProxyKernel>) -> Self {
        Self {
            kernel: Arc::downgrade(kernel),
        }
    }
}

#[async_trait::async_trait]
impl PacketHandler<Ping> for PingHandler {
    async fn handle(&self, ping: Ping) -> Result<(), ListenerError> {
        let kernel = upgrade(&self.kernel)?;
        let uuid = sender(&ping.packet)?;
        let (server_timeout, ping_interval, magic_config) = {
            let config = kernel.config_provider().read().await;
            (
                config.server_timeout,
                config.ping_interval,
                config.magic_configs.get(&ping.magic_config).cloned(),
            )
        };

        let _guard = kernel.registration_lock().lock().await;
        if let Some(server) = kernel.families().find_server(&uuid).await {
            server.set_timeout(server_timeout);
            server.set_player_count(ping.player_count);
            reply(
                &kernel,
                &ping.packet,
                true,
                "Heartbeat acknowledged",
                &[
                    (Response::INTERVAL, ping_interval as i64),
                    (Response::HARD_CAP, server.hard_cap() as i64),
                ],
            )
            .await;
            return Ok(());
        }

        let Some(magic_config) = magic_config else {
            return Err(ListenerError::status(
                PacketStatus::BadAttitude,
                format!("The magic config `{}` doesn't exist", ping.magic_config),
            ));
        };
        let details = ServerDetails {
            uuid,
            address: ping.address.clone(),
            display_name: ping.display_name.clone(),
            pod_name: ping.pod_name.clone(),
            weight: magic_config.weight,
            soft_cap: magic_config.soft_cap,
            hard_cap: magic_config.hard_cap,
            timeout: server_timeout,
        };
        let server = kernel
            .register_server(details, &magic_config.family)
            .await
            .map_err(|err| ListenerError::status(PacketStatus::BadAttitude, err.to_string()))?;
        server.set_player_count(ping.player_count);
        reply(
            &kernel,
            &ping.packet,
            true,
            format!("Registered to family `{}`", magic_config.family),
            &[
                (Response::INTERVAL, ping_interval as i64),
                (Response::HARD_CAP, server.hard_cap() as i64),
            ],
        )
        .await;
        Ok(())
    }
}

impl DisconnectHandler {
    fn new(kernel: &Arc<ProxyKernel>) -> Self {
        Self {
            kernel: Arc::downgrade(kernel),
        }
    }
}

#[async_trait::async_trait]
impl PacketHandler<Disconnect> for DisconnectHandler {
    async fn handle(&self, disconnect: Disconnect) -> Result<(), ListenerError> {
        let kernel = upgrade(&self.kernel)?;
        let uuid = sender(&disconnect.packet)?;
        match kernel
            .unregister_server(&uuid, UnregisterCause::Disconnect)
            .await
        {
            Some(_) => Ok(()),
            None => Err(ListenerError::status(
                PacketStatus::Trashed,
                format!("Server {} is not registered", uuid),
            )),
        }
    }
}

impl SendPlayerHandler {
    fn new(kernel: &Arc<ProxyKernel>) -> Self {
        Self {
            kernel: Arc::downgrade(kernel),
        }
    }
}

#[async_trait::async_trait]
impl PacketHandler<SendPlayer> for SendPlayerHandler {
    async fn handle(&self, request: SendPlayer) -> Result<(), ListenerError> {
        let kernel = upgrade(&self.kernel)?;
        let Some(player) = kernel.adapter().fetch_player(&request.player).await else {
            return Err(ListenerError::status(
                PacketStatus::BadAttitude,
                format!("The player `{}` is not online", request.player),
            ));
        };
        let result = kernel.send_player(&player, &request.target).await;
        reply(
            &kernel,
            &request.packet,
            result.is_success(),
            result.message.clone(),
            &[],
        )
        .await;
        Ok(())
    }
}
