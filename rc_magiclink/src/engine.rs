use std::{
    collections::{HashMap, HashSet},
    future::Future,
    marker::PhantomData,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use futures::FutureExt;
use tokio::sync::{mpsc, Notify, RwLock};

use crate::{
    builder::PacketBuilder,
    cache::{CachedPacket, PacketCache, DEFAULT_CACHE_SIZE},
    crypto::{generate_id, AesCryptor, ID_LENGTH},
    error::{ListenerError, Result},
    packet::ReplyTable,
    packets::Response,
    LocalPacket, Packet, PacketIdentification, PacketStatus, PacketWrapper, RemotePacket,
    SourceIdentifier, TimeoutCache,
};

/// Default time a packet waits for a reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(15);

/// Message set on replies whose original packet is gone.
pub const UNAVAILABLE_REPLY_MESSAGE: &str =
    "This packet is a reply to a packet that is no longer available";

/// Carries encrypted frames between MagicLink participants.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Runs the transport until it is shut down.
    ///
    /// Every received frame must be pushed to `inbound`, the MagicLink
    /// handles each of them independently.
    async fn run(self: Arc<Self>, inbound: mpsc::Sender<String>) -> anyhow::Result<()>;

    /// Sends a frame to every session equivalent to `target`.
    ///
    /// Returns the number of sessions the frame was written to.
    async fn send(&self, target: &SourceIdentifier, frame: String) -> Result<usize>;

    /// Forcibly closes the sessions of a participant.
    async fn close_session(&self, target: &SourceIdentifier);

    /// Stops the transport.
    async fn shutdown(&self);
}

/// Handles received packets of type `P`.
#[async_trait::async_trait]
pub trait PacketHandler<P: PacketWrapper>: Send + Sync + 'static {
    async fn handle(&self, packet: P) -> std::result::Result<(), ListenerError>;
}

#[async_trait::async_trait]
impl<P, F, Fut> PacketHandler<P> for F
where
    P: PacketWrapper,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), ListenerError>> + Send,
{
    async fn handle(&self, packet: P) -> std::result::Result<(), ListenerError> {
        (self)(packet).await
    }
}

/// Options of a registered listener.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListenerOptions {
    /// Whether a failure should be answered with an unsuccessful [`Response`].
    pub reply_on_error: bool,
}

#[async_trait::async_trait]
trait ErasedListener: Send + Sync {
    async fn invoke(&self, packet: Arc<RemotePacket>) -> std::result::Result<(), ListenerError>;

    fn options(&self) -> ListenerOptions;
}

struct TypedListener<P, H> {
    handler: H,
    options: ListenerOptions,
    _phantom: PhantomData<fn() -> P>,
}

#[async_trait::async_trait]
impl<P, H> ErasedListener for TypedListener<P, H>
where
    P: PacketWrapper,
    H: PacketHandler<P>,
{
    async fn invoke(&self, packet: Arc<RemotePacket>) -> std::result::Result<(), ListenerError> {
        let typed = P::from_packet(packet).map_err(|err| {
            ListenerError::status(PacketStatus::BadAttitude, err.to_string())
        })?;
        self.handler.handle(typed).await
    }

    fn options(&self) -> ListenerOptions {
        self.options
    }
}

/// Settings of a [`MagicLink`].
#[derive(Debug, Clone)]
pub struct MagicLinkConfig {
    pub reply_timeout: Duration,
    pub cache_size: usize,
    pub ignored_packets: HashSet<PacketIdentification>,
}

impl Default for MagicLinkConfig {
    fn default() -> Self {
        Self {
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            cache_size: DEFAULT_CACHE_SIZE,
            ignored_packets: HashSet::new(),
        }
    }
}

/// MagicLink protocol engine.
///
/// Owns listeners, the reply-wait table and the packet cache, and sits on
/// top of a [`Transport`] variant (proxy side or server side).
pub struct MagicLink {
    identity: SourceIdentifier,
    cryptor: Arc<AesCryptor>,
    transport: Arc<dyn Transport>,
    listeners: RwLock<HashMap<PacketIdentification, Vec<Arc<dyn ErasedListener>>>>,
    awaiting_reply: Arc<ReplyTable>,
    cache: PacketCache,
    reply_timeout: Duration,
    stop_notify: Arc<Notify>,
}

impl MagicLink {
    pub fn new(
        identity: SourceIdentifier,
        cryptor: Arc<AesCryptor>,
        transport: Arc<dyn Transport>,
        config: MagicLinkConfig,
    ) -> Arc<Self> {
        let awaiting_reply: Arc<ReplyTable> = Arc::new(TimeoutCache::new());
        awaiting_reply.on_expire(|endpoint, packet: Arc<LocalPacket>| {
            log::warn!(
                "Packet {} ({}) sent to {} expired before receiving a reply",
                packet.identification(),
                endpoint,
                packet.packet().remote(),
            );
            packet.expire();
        });
        Arc::new(Self {
            identity: identity.without_reply_endpoint(),
            cryptor,
            transport,
            listeners: RwLock::new(HashMap::new()),
            awaiting_reply,
            cache: PacketCache::new(config.cache_size, config.ignored_packets),
            reply_timeout: config.reply_timeout,
            stop_notify: Arc::new(Notify::new()),
        })
    }

    /// Starts the transport, the inbound pump and the reply expiry sweeper.
    pub fn start(self: &Arc<Self>) {
        let (tx, mut rx) = mpsc::channel::<String>(256);
        tokio::spawn({
            let transport = self.transport.clone();
            async move {
                if let Err(err) = transport.run(tx).await {
                    log::error!("MagicLink transport stopped with an error: {:?}", err);
                }
            }
        });
        tokio::spawn({
            let link = Arc::downgrade(self);
            async move {
                while let Some(frame) = rx.recv().await {
                    let Some(link) = link.upgrade() else {
                        return;
                    };
                    tokio::spawn(async move {
                        link.handle_message(&frame).await;
                    });
                }
            }
        });
        tokio::spawn({
            let awaiting_reply = self.awaiting_reply.clone();
            let stop_notify = self.stop_notify.clone();
            async move { awaiting_reply.run_sweeper(&stop_notify).await }
        });
        log::debug!("MagicLink started as {}", self.identity);
    }

    /// Stops the sweeper and shuts the transport down.
    pub async fn stop(&self) {
        self.stop_notify.notify_one();
        self.transport.shutdown().await;
        self.awaiting_reply.clear();
    }

    /// Identity of this participant, without reply endpoint.
    pub fn identity(&self) -> &SourceIdentifier {
        &self.identity
    }

    pub fn cryptor(&self) -> &Arc<AesCryptor> {
        &self.cryptor
    }

    pub fn cache(&self) -> &PacketCache {
        &self.cache
    }

    pub fn awaiting_reply(&self) -> &ReplyTable {
        &self.awaiting_reply
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    /// Starts building a packet sent from this participant.
    pub fn packet(self: &Arc<Self>) -> PacketBuilder {
        PacketBuilder::new(self.clone())
    }

    /// Registers a handler for packets of type `P`.
    pub async fn listen<P, H>(&self, handler: H)
    where
        P: PacketWrapper,
        H: PacketHandler<P>,
    {
        self.listen_with(handler, ListenerOptions::default()).await
    }

    /// Registers a handler for packets of type `P` with options.
    pub async fn listen_with<P, H>(&self, handler: H, options: ListenerOptions)
    where
        P: PacketWrapper,
        H: PacketHandler<P>,
    {
        let listener: Arc<dyn ErasedListener> = Arc::new(TypedListener {
            handler,
            options,
            _phantom: PhantomData::<fn() -> P>,
        });
        let mut listeners = self.listeners.write().await;
        listeners
            .entry(P::IDENTIFICATION)
            .or_default()
            .push(listener);
        log::debug!("Registered MagicLink listener for {}", P::IDENTIFICATION);
    }

    /// Number of listeners registered for a packet type.
    pub async fn listener_count(&self, identification: &PacketIdentification) -> usize {
        let listeners = self.listeners.read().await;
        listeners.get(identification).map(Vec::len).unwrap_or_default()
    }

    /// Allocates a reply endpoint that no pending packet uses.
    pub(crate) fn allocate_reply_endpoint(&self) -> String {
        loop {
            let id = generate_id(ID_LENGTH);
            if !self.awaiting_reply.contains(&id) && self.cache.find(&id).is_none() {
                return id;
            }
        }
    }

    pub(crate) fn wrap_local(&self, packet: Packet) -> Arc<LocalPacket> {
        Arc::new(LocalPacket::new(
            packet,
            Arc::downgrade(&self.awaiting_reply),
            self.reply_timeout,
        ))
    }

    /// Encrypts and sends a local packet, then records its delivery status.
    ///
    /// Returns the number of sessions the packet was written to.
    pub async fn publish(&self, packet: Arc<LocalPacket>) -> Result<usize> {
        self.cache.cache(CachedPacket::Local(packet.clone()));
        let target = packet.packet().remote().clone();
        let result = async {
            let json = packet.packet().to_json()?;
            let frame = self.cryptor.encrypt_str(&json)?;
            self.transport.send(&target, frame).await
        }
        .await;
        match &result {
            Ok(0) => packet.set_status(
                PacketStatus::Error,
                Some(format!("No session is available for {}", target)),
            ),
            Ok(_) => packet.set_status(PacketStatus::Success, None),
            Err(err) => packet.set_status(PacketStatus::Error, Some(err.to_string())),
        }
        log::trace!(
            "Published {} to {}: {}",
            packet.identification(),
            target,
            packet.status()
        );
        result
    }

    /// Forcibly closes the transport sessions of a participant.
    pub async fn close_session(&self, target: &SourceIdentifier) {
        self.transport.close_session(target).await;
    }

    /// Inbound pipeline for one transport frame.
    ///
    /// Never fails: frames that can't be decrypted or parsed are dropped,
    /// packets addressed to someone else are ignored, and every other
    /// outcome is recorded as the status of the returned packet.
    pub async fn handle_message(self: &Arc<Self>, raw: &str) -> Option<Arc<RemotePacket>> {
        let plaintext = match self.cryptor.decrypt_str(raw) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                log::trace!("Dropping undecipherable MagicLink frame: {}", err);
                return None;
            }
        };
        let packet = match Packet::from_json(&plaintext) {
            Ok(packet) => packet,
            Err(err) => {
                log::warn!("Dropping malformed MagicLink packet: {}", err);
                return None;
            }
        };
        if !self.identity.is_equivalent(packet.remote()) {
            return None;
        }
        let packet = Arc::new(RemotePacket::new(packet));
        self.cache.cache(CachedPacket::Remote(packet.clone()));

        if packet.replying() {
            let endpoint = packet.remote().reply_endpoint().unwrap_or_default().to_owned();
            match self.awaiting_reply.remove(&endpoint) {
                Some(local) => local.handle_reply(&packet),
                None => packet.set_status(
                    PacketStatus::Error,
                    Some(UNAVAILABLE_REPLY_MESSAGE.to_owned()),
                ),
            }
            return Some(packet);
        }

        let listeners = {
            let listeners = self.listeners.read().await;
            listeners
                .get(packet.identification())
                .cloned()
                .unwrap_or_default()
        };
        if listeners.is_empty() {
            packet.set_status(
                PacketStatus::Error,
                Some(format!(
                    "No listener is registered for packets of type {}",
                    packet.identification()
                )),
            );
            return Some(packet);
        }
        for listener in listeners {
            let result = AssertUnwindSafe(listener.invoke(packet.clone()))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(ListenerError::status(
                        PacketStatus::Error,
                        "Listener panicked while handling the packet",
                    ))
                });
            match result {
                Ok(()) => packet.set_status(PacketStatus::Success, None),
                Err(err) => {
                    let (status, message) = err.into_status();
                    log::warn!(
                        "Listener for {} from {} failed: {}",
                        packet.identification(),
                        packet.local(),
                        message
                    );
                    packet.set_status(status, Some(message.clone()));
                    if listener.options().reply_on_error {
                        self.reply_failure(&packet, message).await;
                    }
                }
            }
        }
        Some(packet)
    }

    async fn reply_failure(self: &Arc<Self>, packet: &RemotePacket, message: String) {
        self.packet()
            .identification(Response::IDENTIFICATION)
            .parameter(Response::SUCCESSFUL, false)
            .parameter(Response::MESSAGE, message)
            .address_to_packet(packet)
            .send()
            .await;
    }
}
