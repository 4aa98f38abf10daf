//! Built-in packet types of the `RC` namespace.

use std::sync::Arc;

use uuid::Uuid;

use crate::{
    error::{MagicLinkError, Result},
    PacketIdentification, PacketWrapper, RemotePacket,
};

/// Heartbeat and registration request, sent by servers.
#[derive(Debug, Clone)]
pub struct Ping {
    pub packet: Arc<RemotePacket>,
    /// Name of the registration config the server wants to use.
    pub magic_config: String,
    pub address: String,
    pub display_name: Option<String>,
    pub pod_name: Option<String>,
    pub player_count: i64,
}

/// Immediate unregistration, sent by a server shutting down
/// or by the proxy to every server when it stops.
#[derive(Debug, Clone)]
pub struct Disconnect {
    pub packet: Arc<RemotePacket>,
}

/// Sent by the proxy to a server it no longer knows, asking it to register again.
#[derive(Debug, Clone)]
pub struct StalePing {
    pub packet: Arc<RemotePacket>,
}

/// Generic reply.
#[derive(Debug, Clone)]
pub struct Response {
    pub packet: Arc<RemotePacket>,
    pub successful: bool,
    pub message: String,
}

/// Request to move a player somewhere on the network.
#[derive(Debug, Clone)]
pub struct SendPlayer {
    pub packet: Arc<RemotePacket>,
    pub target: SendPlayerTarget,
    pub player: PlayerRef,
    pub flags: Vec<String>,
}

/// Destination of a [`SendPlayer`] request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendPlayerTarget {
    Server(Uuid),
    Family(String),
    /// Either a server UUID or a family id, servers are looked up first.
    Generic(String),
}

/// A player, referenced either by UUID or by username.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerRef {
    Uuid(Uuid),
    Username(String),
}

impl Ping {
    pub const MAGIC_CONFIG: &'static str = "magic_config";
    pub const ADDRESS: &'static str = "address";
    pub const DISPLAY_NAME: &'static str = "display_name";
    pub const POD_NAME: &'static str = "pod_name";
    pub const PLAYER_COUNT: &'static str = "player_count";
}

impl PacketWrapper for Ping {
    const IDENTIFICATION: PacketIdentification = PacketIdentification::from_static("RC-P");

    fn from_packet(packet: Arc<RemotePacket>) -> Result<Self> {
        let inner = packet.packet();
        Ok(Self {
            magic_config: inner.string(Self::MAGIC_CONFIG)?.to_owned(),
            address: inner.string(Self::ADDRESS)?.to_owned(),
            display_name: inner.optional_string(Self::DISPLAY_NAME).map(str::to_owned),
            pod_name: inner.optional_string(Self::POD_NAME).map(str::to_owned),
            player_count: inner.optional_integer(Self::PLAYER_COUNT).unwrap_or_default(),
            packet,
        })
    }
}

impl PacketWrapper for Disconnect {
    const IDENTIFICATION: PacketIdentification = PacketIdentification::from_static("RC-D");

    fn from_packet(packet: Arc<RemotePacket>) -> Result<Self> {
        Ok(Self { packet })
    }
}

impl PacketWrapper for StalePing {
    const IDENTIFICATION: PacketIdentification = PacketIdentification::from_static("RC-SP");

    fn from_packet(packet: Arc<RemotePacket>) -> Result<Self> {
        Ok(Self { packet })
    }
}

impl Response {
    pub const SUCCESSFUL: &'static str = "successful";
    pub const MESSAGE: &'static str = "message";
    /// Heartbeat interval, in seconds, the server should use from now on.
    pub const INTERVAL: &'static str = "interval";
    /// Hard player cap granted by the proxy.
    pub const HARD_CAP: &'static str = "hard_cap";

    /// Extra integer parameter, if present.
    pub fn integer(&self, key: &str) -> Option<i64> {
        self.packet.packet().optional_integer(key)
    }
}

impl PacketWrapper for Response {
    const IDENTIFICATION: PacketIdentification = PacketIdentification::from_static("RC-R");

    fn from_packet(packet: Arc<RemotePacket>) -> Result<Self> {
        let inner = packet.packet();
        Ok(Self {
            successful: inner.boolean(Self::SUCCESSFUL)?,
            message: inner
                .optional_string(Self::MESSAGE)
                .unwrap_or_default()
                .to_owned(),
            packet,
        })
    }
}

impl SendPlayer {
    pub const TARGET_SERVER: &'static str = "target_server";
    pub const TARGET_FAMILY: &'static str = "target_family";
    pub const GENERIC_TARGET: &'static str = "generic_target";
    pub const PLAYER: &'static str = "player";
    pub const FLAGS: &'static str = "flags";
}

impl PacketWrapper for SendPlayer {
    const IDENTIFICATION: PacketIdentification = PacketIdentification::from_static("RC-PS");

    fn from_packet(packet: Arc<RemotePacket>) -> Result<Self> {
        let inner = packet.packet();
        let target = if let Some(server) = inner.optional_string(Self::TARGET_SERVER) {
            let uuid = Uuid::parse_str(server).map_err(|_| {
                MagicLinkError::InvalidPacket(format!("`{}` is not a server UUID", server))
            })?;
            SendPlayerTarget::Server(uuid)
        } else if let Some(family) = inner.optional_string(Self::TARGET_FAMILY) {
            SendPlayerTarget::Family(family.to_owned())
        } else if let Some(generic) = inner.optional_string(Self::GENERIC_TARGET) {
            SendPlayerTarget::Generic(generic.to_owned())
        } else {
            return Err(MagicLinkError::MissingParameter(Self::GENERIC_TARGET.to_owned()));
        };
        let player = PlayerRef::parse(inner.string(Self::PLAYER)?);
        let flags = inner
            .parameter(Self::FLAGS)
            .and_then(|flags| flags.as_array())
            .map(|flags| {
                flags
                    .iter()
                    .filter_map(|flag| flag.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            target,
            player,
            flags,
            packet,
        })
    }
}

impl SendPlayerTarget {
    /// Parameter key and value describing this target.
    pub fn to_parameter(&self) -> (&'static str, String) {
        match self {
            Self::Server(uuid) => (SendPlayer::TARGET_SERVER, uuid.to_string()),
            Self::Family(id) => (SendPlayer::TARGET_FAMILY, id.clone()),
            Self::Generic(target) => (SendPlayer::GENERIC_TARGET, target.clone()),
        }
    }
}

impl PlayerRef {
    pub fn parse(raw: &str) -> Self {
        match Uuid::parse_str(raw) {
            Ok(uuid) => Self::Uuid(uuid),
            Err(_) => Self::Username(raw.to_owned()),
        }
    }
}

impl std::fmt::Display for PlayerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uuid(uuid) => write!(f, "{}", uuid),
            Self::Username(username) => f.write_str(username),
        }
    }
}
