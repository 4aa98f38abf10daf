//! Step-by-step packet construction.
//!
//! `identification` -> `address_to` / `address_to_packet` -> `send`.
//! Each step returns the only type exposing the next legal step, so an
//! unaddressed packet cannot be sent.

use std::{collections::HashMap, sync::Arc};

use crate::{
    LocalPacket, MagicLink, Packet, PacketIdentification, Parameter, RemotePacket,
    SourceIdentifier,
};

/// Entry point, obtained from [`MagicLink::packet`].
pub struct PacketBuilder {
    link: Arc<MagicLink>,
}

/// Identified packet that still needs a target.
pub struct PrepareForSending {
    link: Arc<MagicLink>,
    identification: PacketIdentification,
    parameters: HashMap<String, Parameter>,
}

/// Fully addressed packet.
pub struct ReadyForSending {
    link: Arc<MagicLink>,
    packet: Packet,
}

impl PacketBuilder {
    pub(crate) fn new(link: Arc<MagicLink>) -> Self {
        Self { link }
    }

    pub fn identification(self, identification: PacketIdentification) -> PrepareForSending {
        PrepareForSending {
            link: self.link,
            identification,
            parameters: HashMap::new(),
        }
    }
}

impl PrepareForSending {
    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<Parameter>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn parameters<I, K, V>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Parameter>,
    {
        for (key, value) in parameters {
            self.parameters.insert(key.into(), value.into());
        }
        self
    }

    /// Addresses the packet to a participant (or a group of participants).
    pub fn address_to(self, target: SourceIdentifier) -> ReadyForSending {
        let remote = target.without_reply_endpoint();
        self.ready(remote)
    }

    /// Addresses the packet as a reply to a received packet.
    ///
    /// The target carries the reply endpoint of the original sender, which
    /// is what the sender correlates replies with.
    pub fn address_to_packet(self, packet: &RemotePacket) -> ReadyForSending {
        let remote = packet.local().clone();
        self.ready(remote)
    }

    fn ready(self, remote: SourceIdentifier) -> ReadyForSending {
        let endpoint = self.link.allocate_reply_endpoint();
        let local = self.link.identity().with_reply_endpoint(endpoint);
        let packet = Packet::new(self.identification, local, remote, self.parameters);
        ReadyForSending {
            link: self.link,
            packet,
        }
    }
}

impl ReadyForSending {
    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    /// Builds the local packet without publishing it.
    ///
    /// Useful to attach reply callbacks before anything can reply,
    /// then hand it over to [`MagicLink::publish`].
    pub fn build(self) -> Arc<LocalPacket> {
        self.link.wrap_local(self.packet)
    }

    /// Publishes the packet.
    ///
    /// Delivery failures are recorded in the returned packet status.
    pub async fn send(self) -> Arc<LocalPacket> {
        let link = self.link.clone();
        let packet = self.build();
        if let Err(err) = link.publish(packet.clone()).await {
            log::debug!(
                "Could not publish {} to {}: {}",
                packet.identification(),
                packet.packet().remote(),
                err
            );
        }
        packet
    }
}
