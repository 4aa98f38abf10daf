use std::{
    collections::HashMap,
    net::{SocketAddr, TcpListener},
    sync::Arc,
};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify, RwLock};
use uuid::Uuid;

use crate::{
    crypto::{generate_id, AesCryptor},
    engine::Transport,
    error::{MagicLinkError, Result},
    token::{strip_bearer, verify_token},
    transport::SERVER_IDENTIFICATION_HEADER,
    Origin, SourceIdentifier,
};

use super::CONNECT_PATH;

const ENDPOINT_LENGTH: usize = 32;

/// Proxy side of the WebSocket transport, accepting server sessions.
pub struct ProxyWebSocketTransport {
    bind: SocketAddr,
    /// Bound listener, until the transport runs.
    listener: Mutex<Option<TcpListener>>,
    shared: Arc<Shared>,
    shutdown: Notify,
}

struct Shared {
    cryptor: Arc<AesCryptor>,
    endpoint: String,
    sessions: RwLock<HashMap<Uuid, mpsc::UnboundedSender<Message>>>,
}

struct AppState {
    shared: Arc<Shared>,
    inbound: mpsc::Sender<String>,
}

impl ProxyWebSocketTransport {
    /// Binds the transport. Serving starts once the MagicLink runs.
    ///
    /// ## Arguments
    ///
    /// * `bind` - Address the HTTP server binds to
    /// * `cryptor` - Cryptor shared by the whole network
    pub fn bind(bind: SocketAddr, cryptor: Arc<AesCryptor>) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(bind)
            .and_then(|listener| listener.set_nonblocking(true).map(|_| listener))
            .map_err(|err| MagicLinkError::Transport(format!("could not bind {}: {}", bind, err)))?;
        let bind = listener.local_addr().unwrap_or(bind);
        Ok(Arc::new(Self {
            bind,
            listener: Mutex::new(Some(listener)),
            shared: Arc::new(Shared {
                cryptor,
                endpoint: generate_id(ENDPOINT_LENGTH),
                sessions: RwLock::new(HashMap::new()),
            }),
            shutdown: Notify::new(),
        }))
    }

    /// Address the transport is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.bind
    }

    /// UUIDs of the servers holding an open session.
    pub async fn sessions(&self) -> Vec<Uuid> {
        self.shared.sessions.read().await.keys().copied().collect()
    }
}

#[async_trait::async_trait]
impl Transport for ProxyWebSocketTransport {
    async fn run(self: Arc<Self>, inbound: mpsc::Sender<String>) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            shared: self.shared.clone(),
            inbound,
        });
        let router = Router::new()
            .route(CONNECT_PATH, get(connect))
            .route("/:endpoint", get(upgrade))
            .with_state(state);

        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("the transport is already running"))?;
        log::info!("MagicLink WebSocket endpoint listening on {}", self.bind);
        axum::Server::from_tcp(listener)?
            .serve(router.into_make_service())
            .with_graceful_shutdown(self.shutdown.notified())
            .await?;
        Ok(())
    }

    async fn send(&self, target: &SourceIdentifier, frame: String) -> Result<usize> {
        let sessions = self.shared.sessions.read().await;
        let sent = sessions
            .iter()
            .filter(|(uuid, _)| target.is_equivalent(&SourceIdentifier::server(**uuid)))
            .filter(|(_, session)| session.send(Message::Text(frame.clone())).is_ok())
            .count();
        Ok(sent)
    }

    async fn close_session(&self, target: &SourceIdentifier) {
        let mut sessions = self.shared.sessions.write().await;
        sessions.retain(|uuid, session| {
            if !target.is_equivalent(&SourceIdentifier::server(*uuid)) {
                return true;
            }
            let _ = session.send(Message::Close(None));
            log::debug!("Closed MagicLink session of server {}", uuid);
            false
        });
    }

    async fn shutdown(&self) {
        self.close_session(&SourceIdentifier::all_available_servers())
            .await;
        self.shutdown.notify_one();
    }
}

fn authorize(shared: &Shared, headers: &HeaderMap) -> std::result::Result<Uuid, StatusCode> {
    let identification = headers
        .get(SERVER_IDENTIFICATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(StatusCode::BAD_REQUEST)?;
    let uuid = serde_json::from_str::<SourceIdentifier>(identification)
        .ok()
        .filter(|source| source.origin() == Origin::Server)
        .and_then(|source| source.uuid())
        .ok_or(StatusCode::BAD_REQUEST)?;
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(strip_bearer)
        .ok_or(StatusCode::UNAUTHORIZED)?;
    verify_token(&shared.cryptor, identification, token).map_err(|err| {
        log::debug!("Refused MagicLink connection of {}: {}", uuid, err);
        StatusCode::UNAUTHORIZED
    })?;
    Ok(uuid)
}

async fn connect(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(status) = authorize(&state.shared, &headers) {
        return status.into_response();
    }
    match state.shared.cryptor.encrypt_str(&state.shared.endpoint) {
        Ok(encrypted) => encrypted.into_response(),
        Err(err) => {
            log::error!("Could not encrypt the MagicLink endpoint: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn upgrade(
    State(state): State<Arc<AppState>>,
    Path(endpoint): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if endpoint != state.shared.endpoint {
        return StatusCode::NOT_FOUND.into_response();
    }
    let uuid = match authorize(&state.shared, &headers) {
        Ok(uuid) => uuid,
        Err(status) => return status.into_response(),
    };
    ws.on_upgrade(move |socket| handle_session(state, uuid, socket))
}

async fn handle_session(state: Arc<AppState>, uuid: Uuid, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    {
        let mut sessions = state.shared.sessions.write().await;
        if let Some(previous) = sessions.insert(uuid, tx.clone()) {
            let _ = previous.send(Message::Close(None));
        }
    }
    log::debug!("Opened MagicLink session of server {}", uuid);

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
        match message {
            Ok(Message::Text(frame)) => {
                if state.inbound.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
        if writer.is_finished() {
            break;
        }
    }

    let mut sessions = state.shared.sessions.write().await;
    if sessions
        .get(&uuid)
        .is_some_and(|current| current.same_channel(&tx))
    {
        sessions.remove(&uuid);
    }
    drop(sessions);
    drop(tx);
    writer.abort();
    log::debug!("MagicLink session of server {} ended", uuid);
}
