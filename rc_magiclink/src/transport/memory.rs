//! In-process transport.
//!
//! Every participant registers on a shared [`MemoryNetwork`] which routes
//! frames by identity, the way the WebSocket transports route them by
//! session.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::{engine::Transport, error::Result, SourceIdentifier};

struct Peer {
    identity: SourceIdentifier,
    sender: mpsc::UnboundedSender<String>,
}

/// Shared hub of in-process participants.
#[derive(Default)]
pub struct MemoryNetwork {
    peers: RwLock<Vec<Peer>>,
}

/// Transport attached to a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    identity: SourceIdentifier,
    receiver: Mutex<mpsc::UnboundedReceiver<String>>,
    shutdown: Notify,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attaches a participant. Frames addressed to it are queued
    /// until its transport runs.
    pub fn connect(self: &Arc<Self>, identity: SourceIdentifier) -> Arc<MemoryTransport> {
        let identity = identity.without_reply_endpoint();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.peers.write().push(Peer {
            identity: identity.clone(),
            sender,
        });
        Arc::new(MemoryTransport {
            network: self.clone(),
            identity,
            receiver: Mutex::new(receiver),
            shutdown: Notify::new(),
        })
    }

    /// Whether a participant is attached.
    pub fn is_connected(&self, identity: &SourceIdentifier) -> bool {
        self.peers
            .read()
            .iter()
            .any(|peer| &peer.identity == identity)
    }

    fn route(&self, from: &SourceIdentifier, target: &SourceIdentifier, frame: &str) -> usize {
        let peers = self.peers.read();
        peers
            .iter()
            .filter(|peer| &peer.identity != from && target.is_equivalent(&peer.identity))
            .filter(|peer| peer.sender.send(frame.to_owned()).is_ok())
            .count()
    }

    fn disconnect(&self, target: &SourceIdentifier) {
        self.peers
            .write()
            .retain(|peer| !target.is_equivalent(&peer.identity));
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn run(self: Arc<Self>, inbound: mpsc::Sender<String>) -> anyhow::Result<()> {
        let mut receiver = self.receiver.lock().await;
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                frame = receiver.recv() => {
                    let Some(frame) = frame else {
                        break;
                    };
                    if inbound.send(frame).await.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn send(&self, target: &SourceIdentifier, frame: String) -> Result<usize> {
        Ok(self.network.route(&self.identity, target, &frame))
    }

    async fn close_session(&self, target: &SourceIdentifier) {
        self.network.disconnect(target);
    }

    async fn shutdown(&self) {
        self.network.disconnect(&self.identity);
        self.shutdown.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[tokio::test]
    async fn routes_by_identity() {
        let network = MemoryNetwork::new();
        let proxy = network.connect(SourceIdentifier::proxy(Uuid::new_v4()));
        let first = SourceIdentifier::server(Uuid::new_v4());
        let second = SourceIdentifier::server(Uuid::new_v4());
        network.connect(first.clone());
        network.connect(second.clone());

        let sent = proxy
            .send(&SourceIdentifier::all_available_servers(), "hi".into())
            .await
            .unwrap();
        assert_eq!(sent, 2);
        assert_eq!(proxy.send(&first, "hi".into()).await.unwrap(), 1);
        assert_eq!(
            proxy
                .send(&SourceIdentifier::all_available_proxies(), "hi".into())
                .await
                .unwrap(),
            0
        );

        proxy.close_session(&first).await;
        assert!(!network.is_connected(&first));
        assert!(network.is_connected(&second));
        assert_eq!(proxy.send(&first, "hi".into()).await.unwrap(), 0);
    }
}
