use crate::PacketStatus;

/// Errors raised by the MagicLink protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum MagicLinkError {
    #[error("crypto failure: {0}")]
    Crypto(String),
    #[error("malformed packet: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("invalid packet: {0}")]
    InvalidPacket(String),
    #[error("missing parameter `{0}`")]
    MissingParameter(String),
    #[error("parameter `{key}` is not a {expected}")]
    ParameterType { key: String, expected: &'static str },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("token rejected: {0}")]
    Token(String),
    #[error("reply endpoint `{0}` is already awaiting a reply")]
    DuplicateReplyEndpoint(String),
}

pub type Result<T> = std::result::Result<T, MagicLinkError>;

/// Failure signalled by a packet listener or reply callback.
///
/// [`ListenerError::Status`] sets a precise status on the handled packet,
/// anything else ends up as [`PacketStatus::Error`] with the error message.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("{message}")]
    Status {
        status: PacketStatus,
        message: String,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ListenerError {
    pub fn status(status: PacketStatus, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Status and message to record on the packet that failed.
    pub fn into_status(self) -> (PacketStatus, String) {
        match self {
            Self::Status { status, message } => (status, message),
            Self::Other(err) => (PacketStatus::Error, err.to_string()),
        }
    }
}

impl From<MagicLinkError> for ListenerError {
    fn from(value: MagicLinkError) -> Self {
        Self::Other(value.into())
    }
}

impl From<tokio::sync::mpsc::error::SendError<String>> for MagicLinkError {
    fn from(value: tokio::sync::mpsc::error::SendError<String>) -> Self {
        Self::Transport(value.to_string())
    }
}
