use std::{fmt::Display, sync::Arc};

use uuid::Uuid;

use crate::Server;

/// A player connected to the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Player {
    pub uuid: Uuid,
    pub username: String,
}

/// Outcome of an attempt to connect a player somewhere.
#[derive(Debug, Clone)]
pub struct ConnectionResult {
    pub status: ConnectionStatus,
    /// Message meant for the player.
    pub message: String,
    /// Server the player ended up on.
    pub server: Option<Arc<Server>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Success,
    Failed,
}

impl Player {
    pub fn new(uuid: Uuid, username: impl Into<String>) -> Self {
        Self {
            uuid,
            username: username.into(),
        }
    }
}

impl Display for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.username, self.uuid)
    }
}

impl ConnectionResult {
    pub fn success(server: Arc<Server>) -> Self {
        Self {
            status: ConnectionStatus::Success,
            message: "You successfully connected to the server!".to_owned(),
            server: Some(server),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ConnectionStatus::Failed,
            message: message.into(),
            server: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ConnectionStatus::Success
    }
}
