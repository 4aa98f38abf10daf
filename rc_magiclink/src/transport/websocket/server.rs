use std::{sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::header::AUTHORIZATION;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest, http::HeaderValue, Message,
};
use uuid::Uuid;

use crate::{
    crypto::AesCryptor,
    engine::Transport,
    error::Result,
    token::issue_token,
    transport::SERVER_IDENTIFICATION_HEADER,
    SourceIdentifier,
};

use super::CONNECT_PATH;

const MIN_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Server side of the WebSocket transport, holding one session to the proxy.
pub struct ServerWebSocketTransport {
    address: String,
    uuid: Uuid,
    cryptor: Arc<AesCryptor>,
    http: reqwest::Client,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    shutdown: Notify,
}

impl ServerWebSocketTransport {
    /// Creates the transport.
    ///
    /// ## Arguments
    ///
    /// * `address` - Base HTTP address of the proxy, e.g. `http://127.0.0.1:8080`
    /// * `uuid` - UUID of this server
    /// * `cryptor` - Cryptor shared by the whole network
    pub fn new(address: impl Into<String>, uuid: Uuid, cryptor: Arc<AesCryptor>) -> Arc<Self> {
        Arc::new(Self {
            address: address.into().trim_end_matches('/').to_owned(),
            uuid,
            cryptor,
            http: reqwest::Client::new(),
            outbound: Mutex::new(None),
            shutdown: Notify::new(),
        })
    }

    /// Whether a session to the proxy is currently open.
    pub fn is_connected(&self) -> bool {
        self.outbound
            .lock()
            .as_ref()
            .is_some_and(|outbound| !outbound.is_closed())
    }

    fn identification(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(&SourceIdentifier::server(self.uuid))?)
    }

    async fn discover_endpoint(&self) -> anyhow::Result<String> {
        let identification = self.identification()?;
        let token = issue_token(&self.cryptor, &identification);
        let encrypted = self
            .http
            .get(format!("{}{}", self.address, CONNECT_PATH))
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .header(SERVER_IDENTIFICATION_HEADER, identification)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(self.cryptor.decrypt_str(&encrypted)?)
    }

    async fn run_session(&self, inbound: &mpsc::Sender<String>) -> anyhow::Result<()> {
        let endpoint = self.discover_endpoint().await?;
        let url = format!(
            "{}/{}",
            self.address
                .replacen("https://", "wss://", 1)
                .replacen("http://", "ws://", 1),
            endpoint
        );
        let mut request = url.into_client_request()?;
        let identification = self.identification()?;
        let token = issue_token(&self.cryptor, &identification);
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", token))?,
        );
        request.headers_mut().insert(
            SERVER_IDENTIFICATION_HEADER,
            HeaderValue::from_str(&identification)?,
        );

        let (socket, _) = tokio_tungstenite::connect_async(request).await?;
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound.lock() = Some(tx);
        log::info!("Connected to the MagicLink endpoint of {}", self.address);

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let close = matches!(message, Message::Close(_));
                if sink.send(message).await.is_err() || close {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        while let Some(message) = stream.next().await {
            match message? {
                Message::Text(frame) => {
                    if inbound.send(frame).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        self.outbound.lock().take();
        writer.abort();
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for ServerWebSocketTransport {
    async fn run(self: Arc<Self>, inbound: mpsc::Sender<String>) -> anyhow::Result<()> {
        let mut delay = MIN_RECONNECT_DELAY;
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => return Ok(()),
                result = self.run_session(&inbound) => match result {
                    Ok(()) => {
                        log::warn!("MagicLink session to {} closed", self.address);
                        delay = MIN_RECONNECT_DELAY;
                    }
                    Err(err) => {
                        log::warn!("MagicLink session to {} failed: {}", self.address, err);
                        delay = (delay * 2).min(MAX_RECONNECT_DELAY);
                    }
                },
            }
            self.outbound.lock().take();
            tokio::select! {
                _ = self.shutdown.notified() => return Ok(()),
                _ = tokio::time::sleep(delay) => {},
            }
        }
    }

    async fn send(&self, target: &SourceIdentifier, frame: String) -> Result<usize> {
        if !target.is_proxy() {
            return Ok(0);
        }
        let outbound = self.outbound.lock();
        let sent = outbound
            .as_ref()
            .is_some_and(|outbound| outbound.send(Message::Text(frame)).is_ok());
        Ok(usize::from(sent))
    }

    async fn close_session(&self, target: &SourceIdentifier) {
        if !target.is_proxy() {
            return;
        }
        if let Some(outbound) = self.outbound.lock().take() {
            let _ = outbound.send(Message::Close(None));
        }
    }

    async fn shutdown(&self) {
        self.close_session(&SourceIdentifier::all_available_proxies())
            .await;
        self.shutdown.notify_one();
    }
}
