use std::{borrow::Cow, fmt::Display};

use serde::{Deserialize, Serialize};

/// Packet type token, formatted as `NAMESPACE-TYPE`.
///
/// Used both as the dispatch key for listeners and as the `i` wire field.
/// Two identifications are equal if and only if their string forms match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PacketIdentification(Cow<'static, str>);

impl PacketIdentification {
    /// Identification known at compile time.
    pub const fn from_static(raw: &'static str) -> Self {
        Self(Cow::Borrowed(raw))
    }

    /// Builds an identification out of a namespace and a type.
    pub fn new(namespace: &str, kind: &str) -> Self {
        Self(Cow::Owned(format!(
            "{}-{}",
            namespace.to_uppercase(),
            kind.to_uppercase()
        )))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(Cow::Owned(raw.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Part before the first `-`, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.0.split_once('-').map(|(namespace, _)| namespace)
    }

    /// Part after the first `-`, or the whole token if there is no namespace.
    pub fn kind(&self) -> &str {
        match self.0.split_once('-') {
            Some((_, kind)) => kind,
            None => &self.0,
        }
    }
}

impl Display for PacketIdentification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PacketIdentification {
    fn from(value: &str) -> Self {
        Self::from_raw(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_textual() {
        const PING: PacketIdentification = PacketIdentification::from_static("RC-P");
        assert_eq!(PING, PacketIdentification::new("rc", "p"));
        assert_eq!(PING, PacketIdentification::from_raw("RC-P"));
        assert_ne!(PING, PacketIdentification::from_raw("RC-PS"));
    }

    #[test]
    fn parts() {
        let id = PacketIdentification::from_raw("RC-PS");
        assert_eq!(id.namespace(), Some("RC"));
        assert_eq!(id.kind(), "PS");
        let bare = PacketIdentification::from_raw("PING");
        assert_eq!(bare.namespace(), None);
        assert_eq!(bare.kind(), "PING");
    }
}
