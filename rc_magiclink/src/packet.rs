use std::{
    collections::HashMap,
    fmt::Display,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    cache::TimeoutCache,
    error::{ListenerError, MagicLinkError, Result},
    Parameter, PacketIdentification, SourceIdentifier,
};

/// Protocol version written in the `v` field of every packet.
pub const PROTOCOL_VERSION: i32 = 3;

/// Table of local packets waiting on a reply, keyed by reply endpoint.
pub type ReplyTable = TimeoutCache<String, Arc<LocalPacket>>;

/// Immutable packet envelope, as found on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    #[serde(rename = "v")]
    version: i32,
    #[serde(rename = "i")]
    identification: PacketIdentification,
    #[serde(rename = "s")]
    local: SourceIdentifier,
    #[serde(rename = "t")]
    remote: SourceIdentifier,
    #[serde(rename = "p")]
    parameters: HashMap<String, Parameter>,
}

/// Outcome of sending or handling a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketStatus {
    Undefined,
    /// The packet was refused because of its content.
    BadAttitude,
    /// The packet came from someone it shouldn't have.
    WrongSource,
    /// The packet was thrown away without being handled.
    Trashed,
    Success,
    Error,
    Canceled,
}

/// Status of a packet along with an optional message.
#[derive(Debug)]
pub struct StatusCell(Mutex<(PacketStatus, Option<String>)>);

type ReplyCallback = Arc<dyn Fn(&Arc<RemotePacket>) -> std::result::Result<(), ListenerError> + Send + Sync>;
type TimeoutCallback = Arc<dyn Fn(&LocalPacket) + Send + Sync>;

#[derive(Default)]
struct ReplyListeners {
    typed: Vec<(PacketIdentification, ReplyCallback)>,
    general: Vec<ReplyCallback>,
    timeout: Vec<TimeoutCallback>,
}

/// A packet created by this process, possibly waiting on replies.
pub struct LocalPacket {
    packet: Packet,
    status: StatusCell,
    listeners: Mutex<ReplyListeners>,
    reply_table: Weak<ReplyTable>,
    reply_timeout: Duration,
}

/// A packet received from a remote participant.
#[derive(Debug)]
pub struct RemotePacket {
    packet: Packet,
    status: StatusCell,
    received_at: OffsetDateTime,
}

/// Strongly typed view of a [`RemotePacket`] of a given identification.
pub trait PacketWrapper: Sized + Send + 'static {
    const IDENTIFICATION: PacketIdentification;

    /// Decodes the typed view, failing if required parameters are missing.
    fn from_packet(packet: Arc<RemotePacket>) -> Result<Self>;
}

impl Packet {
    pub(crate) fn new(
        identification: PacketIdentification,
        local: SourceIdentifier,
        remote: SourceIdentifier,
        parameters: HashMap<String, Parameter>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            identification,
            local,
            remote,
            parameters,
        }
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn identification(&self) -> &PacketIdentification {
        &self.identification
    }

    /// Sender of the packet.
    pub fn local(&self) -> &SourceIdentifier {
        &self.local
    }

    /// Target of the packet.
    pub fn remote(&self) -> &SourceIdentifier {
        &self.remote
    }

    pub fn parameters(&self) -> &HashMap<String, Parameter> {
        &self.parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&Parameter> {
        self.parameters.get(key)
    }

    /// Whether this packet is a reply to an earlier packet.
    pub fn replying(&self) -> bool {
        self.remote.reply_endpoint().is_some()
    }

    /// Correlation key of this packet, as set by its sender.
    pub fn reply_endpoint(&self) -> Option<&str> {
        self.local.reply_endpoint()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    fn required(&self, key: &str) -> Result<&Parameter> {
        self.parameter(key)
            .ok_or_else(|| MagicLinkError::MissingParameter(key.to_owned()))
    }

    pub fn string(&self, key: &str) -> Result<&str> {
        self.required(key)?
            .as_str()
            .ok_or_else(|| type_error(key, "string"))
    }

    pub fn integer(&self, key: &str) -> Result<i64> {
        self.required(key)?
            .as_i64()
            .ok_or_else(|| type_error(key, "number"))
    }

    pub fn boolean(&self, key: &str) -> Result<bool> {
        self.required(key)?
            .as_bool()
            .ok_or_else(|| type_error(key, "boolean"))
    }

    pub fn optional_string(&self, key: &str) -> Option<&str> {
        self.parameter(key).and_then(Parameter::as_str)
    }

    pub fn optional_integer(&self, key: &str) -> Option<i64> {
        self.parameter(key).and_then(Parameter::as_i64)
    }
}

fn type_error(key: &str, expected: &'static str) -> MagicLinkError {
    MagicLinkError::ParameterType {
        key: key.to_owned(),
        expected,
    }
}

impl Display for PacketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Undefined => "UNDEFINED",
            Self::BadAttitude => "BAD_ATTITUDE",
            Self::WrongSource => "WRONG_SOURCE",
            Self::Trashed => "TRASHED",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Canceled => "CANCELED",
        };
        f.write_str(name)
    }
}

impl StatusCell {
    fn new() -> Self {
        Self(Mutex::new((PacketStatus::Undefined, None)))
    }

    pub fn get(&self) -> PacketStatus {
        self.0.lock().0
    }

    pub fn message(&self) -> Option<String> {
        self.0.lock().1.clone()
    }

    pub fn set(&self, status: PacketStatus, message: Option<String>) {
        *self.0.lock() = (status, message);
    }
}

impl LocalPacket {
    pub(crate) fn new(packet: Packet, reply_table: Weak<ReplyTable>, reply_timeout: Duration) -> Self {
        Self {
            packet,
            status: StatusCell::new(),
            listeners: Mutex::new(ReplyListeners::default()),
            reply_table,
            reply_timeout,
        }
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn identification(&self) -> &PacketIdentification {
        self.packet.identification()
    }

    /// Correlation key replies to this packet must carry.
    pub fn reply_endpoint(&self) -> &str {
        self.packet.reply_endpoint().unwrap_or_default()
    }

    /// Delivery status, set by the transport.
    pub fn status(&self) -> PacketStatus {
        self.status.get()
    }

    pub fn status_message(&self) -> Option<String> {
        self.status.message()
    }

    pub fn set_status(&self, status: PacketStatus, message: Option<String>) {
        self.status.set(status, message);
    }

    /// Registers a catch-all reply callback.
    ///
    /// Registering any callback makes the packet wait for a reply
    /// until the reply timeout elapses.
    pub fn on_reply<F>(self: &Arc<Self>, callback: F)
    where
        F: Fn(&Arc<RemotePacket>) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.listeners.lock().general.push(Arc::new(callback));
        self.await_reply();
    }

    /// Registers a callback only invoked for replies of type `R`.
    pub fn on_reply_typed<R, F>(self: &Arc<Self>, callback: F)
    where
        R: PacketWrapper,
        F: Fn(R) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
    {
        let erased: ReplyCallback = Arc::new(move |packet: &Arc<RemotePacket>| {
            let typed = R::from_packet(packet.clone())?;
            callback(typed)
        });
        self.listeners
            .lock()
            .typed
            .push((R::IDENTIFICATION, erased));
        self.await_reply();
    }

    /// Registers a callback invoked if no reply arrived in time.
    pub fn on_timeout<F>(self: &Arc<Self>, callback: F)
    where
        F: Fn(&LocalPacket) + Send + Sync + 'static,
    {
        self.listeners.lock().timeout.push(Arc::new(callback));
        self.await_reply();
    }

    fn await_reply(self: &Arc<Self>) {
        let Some(table) = self.reply_table.upgrade() else {
            return;
        };
        if let Err(err) = self.claim_endpoint(&table) {
            log::warn!("{}, {} will not get replies", err, self.identification());
        }
    }

    /// Enters the packet in the reply table under its reply endpoint.
    ///
    /// Claiming again is a no-op, another packet holding the endpoint is an error.
    fn claim_endpoint(self: &Arc<Self>, table: &ReplyTable) -> Result<()> {
        let endpoint = self.reply_endpoint().to_owned();
        if table.put_if_absent(endpoint.clone(), self.clone(), self.reply_timeout) {
            return Ok(());
        }
        match table.get(&endpoint) {
            Some(current) if !Arc::ptr_eq(&current, self) => {
                Err(MagicLinkError::DuplicateReplyEndpoint(endpoint))
            }
            _ => Ok(()),
        }
    }

    /// Delivers a reply to the registered callbacks.
    ///
    /// Typed callbacks matching the reply identification run first, then
    /// catch-all callbacks, each in registration order. The first callback
    /// to succeed records [`PacketStatus::Success`] and ends the delivery,
    /// so at most one final status is ever recorded. Failing callbacks record
    /// their status and let the next one try.
    pub fn handle_reply(&self, reply: &Arc<RemotePacket>) {
        let callbacks: Vec<ReplyCallback> = {
            let listeners = self.listeners.lock();
            listeners
                .typed
                .iter()
                .filter(|(identification, _)| identification == reply.identification())
                .map(|(_, callback)| callback.clone())
                .chain(listeners.general.iter().cloned())
                .collect()
        };
        for callback in callbacks {
            match callback(reply) {
                Ok(()) => {
                    reply.set_status(PacketStatus::Success, None);
                    return;
                }
                Err(err) => {
                    let (status, message) = err.into_status();
                    log::debug!(
                        "Reply callback for {} ({}) failed: {}",
                        self.identification(),
                        self.reply_endpoint(),
                        message
                    );
                    reply.set_status(status, Some(message));
                }
            }
        }
    }

    /// Called once the reply-wait entry of this packet expired.
    pub(crate) fn expire(&self) {
        self.set_status(
            PacketStatus::Canceled,
            Some(format!(
                "No reply received within {} seconds",
                self.reply_timeout.as_secs()
            )),
        );
        let callbacks = self.listeners.lock().timeout.clone();
        for callback in callbacks {
            callback(self);
        }
    }
}

impl std::fmt::Debug for LocalPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPacket")
            .field("packet", &self.packet)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl RemotePacket {
    pub fn new(packet: Packet) -> Self {
        Self {
            packet,
            status: StatusCell::new(),
            received_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn identification(&self) -> &PacketIdentification {
        self.packet.identification()
    }

    pub fn local(&self) -> &SourceIdentifier {
        self.packet.local()
    }

    pub fn remote(&self) -> &SourceIdentifier {
        self.packet.remote()
    }

    pub fn replying(&self) -> bool {
        self.packet.replying()
    }

    pub fn received_at(&self) -> OffsetDateTime {
        self.received_at
    }

    pub fn status(&self) -> PacketStatus {
        self.status.get()
    }

    pub fn status_message(&self) -> Option<String> {
        self.status.message()
    }

    pub fn set_status(&self, status: PacketStatus, message: Option<String>) {
        self.status.set(status, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn sample(parameters: HashMap<String, Parameter>) -> Packet {
        Packet::new(
            PacketIdentification::from_static("RC-P"),
            SourceIdentifier::server(Uuid::new_v4()).with_reply_endpoint("abc"),
            SourceIdentifier::all_available_proxies(),
            parameters,
        )
    }

    #[test]
    fn wire_fields() {
        let packet = sample(HashMap::from([("player_count".to_owned(), Parameter::from(3))]));
        let value: serde_json::Value = serde_json::from_str(&packet.to_json().unwrap()).unwrap();
        assert_eq!(value["v"], PROTOCOL_VERSION);
        assert_eq!(value["i"], "RC-P");
        assert_eq!(value["s"]["n"], 2);
        assert_eq!(value["s"]["r"], "abc");
        assert_eq!(value["t"], json!({"n": 1}));
        assert_eq!(value["p"]["player_count"], json!({"t": "n", "v": 3}));
    }

    #[test]
    fn parameters_keep_their_type() {
        let mut object = serde_json::Map::new();
        object.insert("nested".into(), json!(true));
        let parameters = HashMap::from([
            ("number".to_owned(), Parameter::from(42)),
            ("boolean".to_owned(), Parameter::from(false)),
            ("string".to_owned(), Parameter::from("lobby")),
            ("array".to_owned(), Parameter::from(vec![json!(1), json!("two")])),
            ("object".to_owned(), Parameter::from(object)),
        ]);
        let packet = sample(parameters.clone());
        let parsed = Packet::from_json(&packet.to_json().unwrap()).unwrap();
        assert_eq!(parsed.parameters(), &parameters);
        for (key, value) in parameters.iter() {
            assert_eq!(parsed.parameter(key).map(Parameter::tag), Some(value.tag()));
        }
    }

    #[test]
    fn strict_parsing() {
        let missing_identification = r#"{"v":3,"s":{"n":0},"t":{"n":2},"p":{}}"#;
        assert!(Packet::from_json(missing_identification).is_err());
        let unknown_key = r#"{"v":3,"i":"RC-D","s":{"n":0},"t":{"n":2},"p":{},"x":1}"#;
        let packet = Packet::from_json(unknown_key).unwrap();
        assert_eq!(packet.identification().as_str(), "RC-D");
        assert!(!packet.replying());
    }

    #[test]
    fn typed_getters() {
        let packet = sample(HashMap::from([
            ("name".to_owned(), Parameter::from("lobby")),
            ("count".to_owned(), Parameter::from(2)),
        ]));
        assert_eq!(packet.string("name").unwrap(), "lobby");
        assert_eq!(packet.integer("count").unwrap(), 2);
        assert!(matches!(
            packet.integer("name"),
            Err(MagicLinkError::ParameterType { .. })
        ));
        assert!(matches!(
            packet.boolean("missing"),
            Err(MagicLinkError::MissingParameter(_))
        ));
    }

    fn remote_reply(identification: &'static str) -> Arc<RemotePacket> {
        Arc::new(RemotePacket::new(Packet::new(
            PacketIdentification::from_static(identification),
            SourceIdentifier::proxy(Uuid::new_v4()),
            SourceIdentifier::server(Uuid::new_v4()).with_reply_endpoint("abc"),
            HashMap::new(),
        )))
    }

    #[test]
    fn first_successful_reply_callback_wins() {
        let local = Arc::new(LocalPacket::new(
            sample(HashMap::new()),
            Weak::new(),
            Duration::from_secs(15),
        ));
        let calls = Arc::new(Mutex::new(Vec::new()));
        for (name, fail) in [("first", true), ("second", false), ("third", false)] {
            let calls = calls.clone();
            local.on_reply(move |_| {
                calls.lock().push(name);
                if fail {
                    Err(ListenerError::status(PacketStatus::BadAttitude, "nope"))
                } else {
                    Ok(())
                }
            });
        }
        let reply = remote_reply("RC-R");
        local.handle_reply(&reply);
        assert_eq!(*calls.lock(), vec!["first", "second"]);
        assert_eq!(reply.status(), PacketStatus::Success);
    }

    #[test]
    fn failing_reply_callbacks_record_status() {
        let local = Arc::new(LocalPacket::new(
            sample(HashMap::new()),
            Weak::new(),
            Duration::from_secs(15),
        ));
        local.on_reply(|_| Err(anyhow::anyhow!("boom").into()));
        let reply = remote_reply("RC-R");
        local.handle_reply(&reply);
        assert_eq!(reply.status(), PacketStatus::Error);
        assert_eq!(reply.status_message().as_deref(), Some("boom"));
    }

    #[test]
    fn reply_endpoints_are_claimed_once() {
        let table = Arc::new(ReplyTable::new());
        let first = Arc::new(LocalPacket::new(
            sample(HashMap::new()),
            Arc::downgrade(&table),
            Duration::from_secs(15),
        ));
        let second = Arc::new(LocalPacket::new(
            sample(HashMap::new()),
            Arc::downgrade(&table),
            Duration::from_secs(15),
        ));
        assert!(first.claim_endpoint(&table).is_ok());
        assert!(first.claim_endpoint(&table).is_ok());
        assert!(matches!(
            second.claim_endpoint(&table),
            Err(MagicLinkError::DuplicateReplyEndpoint(endpoint)) if endpoint == "abc"
        ));

        // the second packet's callbacks never take the endpoint over
        second.on_reply(|_| Ok(()));
        let current = table.get(&"abc".to_owned()).unwrap();
        assert!(Arc::ptr_eq(&current, &first));
        assert_eq!(table.len(), 1);
    }
}
