//! Errors surfaced by forking and routing

/// Errors that can occur while forking a child or exchanging messages with it
#[derive(Debug, thiserror::Error)]
pub enum WtforkError {
    /// The child process could not be spawned
    #[error("failed to spawn child process: {0}")]
    Spawn(#[source] std::io::Error),

    /// The one-shot IPC server used to bootstrap the link could not be created
    #[error("failed to create IPC server: {0}")]
    Bootstrap(#[source] std::io::Error),

    /// A routing thread could not be started
    #[error("failed to start routing thread: {0}")]
    Thread(#[source] std::io::Error),

    /// A listener panicked on the receive loop, which stopped dispatching
    #[error("receive loop panicked")]
    ReceiveLoopPanicked,

    /// The underlying IPC link failed to send, receive, or connect
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The peer has gone away and the link no longer accepts messages
    #[error("transport closed")]
    TransportClosed,

    /// Parent and child could not agree on the link during bootstrap
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A message could not be serialized or deserialized
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WtforkError {
    /// Wrap an error produced by the IPC link, keeping it as the source
    pub(crate) fn transport(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Transport(Box::new(err))
    }
}

/// Result type used throughout this crate
pub type Result<T> = std::result::Result<T, WtforkError>;
