use crate::protocol::ProtocolError;
use thiserror::Error;

pub type Result<T> = core::result::Result<T, ChatSyncError>;

#[derive(Error, Debug)]
pub enum ChatSyncError {
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Logging setup error: {0}")]
    LoggingSetup(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Transport not connected")]
    NotConnected,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Server API error ({status}): {body}")]
    Api { status: u16, body: String },
}

impl ChatSyncError {
    /// True when the server rejected the credential or the caller's rights.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, ChatSyncError::PermissionDenied(_))
    }
}
