use std::fmt::Display;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of MagicLink participant a [`SourceIdentifier`] points to.
///
/// Wire codes: `0=PROXY, 1=ANY_PROXY, 2=SERVER, 3=ANY_SERVER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Origin {
    Proxy,
    AnyProxy,
    Server,
    AnyServer,
}

/// Address of a MagicLink participant.
///
/// `reply_endpoint` is only set on the local side of outgoing packets,
/// it is the correlation key replies are matched with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceIdentifier {
    #[serde(rename = "u", default, skip_serializing_if = "Option::is_none")]
    uuid: Option<Uuid>,
    #[serde(rename = "n")]
    origin: Origin,
    #[serde(rename = "r", default, skip_serializing_if = "Option::is_none")]
    reply_endpoint: Option<String>,
}

impl Origin {
    pub fn code(self) -> u8 {
        match self {
            Self::Proxy => 0,
            Self::AnyProxy => 1,
            Self::Server => 2,
            Self::AnyServer => 3,
        }
    }

    /// Whether this origin addresses every participant of its side.
    pub fn is_broadcast(self) -> bool {
        matches!(self, Self::AnyProxy | Self::AnyServer)
    }

    fn is_proxy_side(self) -> bool {
        matches!(self, Self::Proxy | Self::AnyProxy)
    }
}

impl TryFrom<u8> for Origin {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Proxy),
            1 => Ok(Self::AnyProxy),
            2 => Ok(Self::Server),
            3 => Ok(Self::AnyServer),
            other => Err(format!("unknown origin code {}", other)),
        }
    }
}

impl From<Origin> for u8 {
    fn from(value: Origin) -> Self {
        value.code()
    }
}

impl SourceIdentifier {
    pub fn proxy(uuid: Uuid) -> Self {
        Self::new(Some(uuid), Origin::Proxy)
    }

    pub fn server(uuid: Uuid) -> Self {
        Self::new(Some(uuid), Origin::Server)
    }

    /// Addresses every connected proxy.
    pub fn all_available_proxies() -> Self {
        Self::new(None, Origin::AnyProxy)
    }

    /// Addresses every connected server.
    pub fn all_available_servers() -> Self {
        Self::new(None, Origin::AnyServer)
    }

    fn new(uuid: Option<Uuid>, origin: Origin) -> Self {
        Self {
            uuid,
            origin,
            reply_endpoint: None,
        }
    }

    pub fn uuid(&self) -> Option<Uuid> {
        self.uuid
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn reply_endpoint(&self) -> Option<&str> {
        self.reply_endpoint.as_deref()
    }

    pub fn is_server(&self) -> bool {
        !self.origin.is_proxy_side()
    }

    pub fn is_proxy(&self) -> bool {
        self.origin.is_proxy_side()
    }

    /// Same identifier, carrying a reply endpoint.
    pub fn with_reply_endpoint(&self, reply_endpoint: impl Into<String>) -> Self {
        Self {
            uuid: self.uuid,
            origin: self.origin,
            reply_endpoint: Some(reply_endpoint.into()),
        }
    }

    /// Same identifier, stripped from its reply endpoint.
    pub fn without_reply_endpoint(&self) -> Self {
        Self::new(self.uuid, self.origin)
    }

    /// Looser equality used for addressing.
    ///
    /// `ANY_PROXY` matches any proxy and `ANY_SERVER` matches any server,
    /// in both directions. Otherwise this is plain equality.
    pub fn is_equivalent(&self, other: &SourceIdentifier) -> bool {
        if self.origin.is_proxy_side() != other.origin.is_proxy_side() {
            return false;
        }
        if self.origin.is_broadcast() || other.origin.is_broadcast() {
            return true;
        }
        self == other
    }
}

/// Exact equality on uuid and origin, the reply endpoint is not part of it.
impl PartialEq for SourceIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid && self.origin == other.origin
    }
}

impl Eq for SourceIdentifier {}

impl std::hash::Hash for SourceIdentifier {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.uuid.hash(state);
        self.origin.hash(state);
    }
}

impl Display for SourceIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.origin {
            Origin::Proxy => "proxy",
            Origin::AnyProxy => "any proxy",
            Origin::Server => "server",
            Origin::AnyServer => "any server",
        };
        match self.uuid {
            Some(uuid) => write!(f, "{} {}", kind, uuid),
            None => f.write_str(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_equivalence() {
        let uuid = Uuid::new_v4();
        let proxy = SourceIdentifier::proxy(uuid);
        let any_proxy = SourceIdentifier::all_available_proxies();
        assert!(proxy.is_equivalent(&any_proxy));
        assert!(any_proxy.is_equivalent(&proxy));
        assert!(!proxy.is_equivalent(&SourceIdentifier::server(uuid)));
        assert!(!proxy.is_equivalent(&SourceIdentifier::all_available_servers()));

        let server = SourceIdentifier::server(uuid);
        assert!(server.is_equivalent(&SourceIdentifier::all_available_servers()));
        assert!(!server.is_equivalent(&SourceIdentifier::server(Uuid::new_v4())));
    }

    #[test]
    fn reply_endpoint_is_not_identity() {
        let server = SourceIdentifier::server(Uuid::new_v4());
        let with_endpoint = server.with_reply_endpoint("abc");
        assert_eq!(server, with_endpoint);
        assert!(server.is_equivalent(&with_endpoint));
        assert_eq!(with_endpoint.reply_endpoint(), Some("abc"));
        assert_eq!(with_endpoint.without_reply_endpoint().reply_endpoint(), None);
    }

    #[test]
    fn wire_shape() {
        let uuid = Uuid::new_v4();
        let json = serde_json::to_value(SourceIdentifier::server(uuid).with_reply_endpoint("x"))
            .unwrap();
        assert_eq!(json["u"], uuid.to_string());
        assert_eq!(json["n"], 2);
        assert_eq!(json["r"], "x");

        let any: SourceIdentifier = serde_json::from_str(r#"{"n":1}"#).unwrap();
        assert_eq!(any, SourceIdentifier::all_available_proxies());
        assert!(serde_json::from_str::<SourceIdentifier>(r#"{"n":9}"#).is_err());
    }
}
