// Error taxonomy for the chat room protocol

use thiserror::Error;

/// Errors raised by the room protocol and its transport
#[derive(Error, Debug)]
pub enum ChatError {
    /// Listening socket could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Connect, read or write failure on one transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// Bytes that do not decode to an envelope
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Ciphertext failed authentication (tampered or wrong key)
    #[error("Message authentication failed")]
    Authentication,

    /// Host refused the presented credential
    #[error("Handshake rejected: unauthorized")]
    HandshakeRejected,

    /// Peer sent an envelope that is not valid at this point of the protocol
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Key text or bytes of the wrong shape
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Send attempted before listening or connecting
    #[error("Not connected: connect or listen first")]
    NotConnected,

    /// Encoded chat frame exceeds the frame size limit
    #[error("Message too large: {size} byte frame exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },

    /// Peer was shut down with `close_all`
    #[error("Connection manager is closed")]
    Closed,

    /// Configuration could not be loaded or saved
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChatError {
    /// Wrap a bind failure with the address that was attempted
    pub fn bind(addr: impl Into<String>, source: std::io::Error) -> Self {
        ChatError::Bind {
            addr: addr.into(),
            source,
        }
    }

    /// Wrap a connect failure with the remote address
    pub fn connect(addr: &str, source: std::io::Error) -> Self {
        ChatError::Transport(format!("Failed to connect to {}: {}", addr, source))
    }
}

/// Result alias used across the room module
pub type Result<T> = std::result::Result<T, ChatError>;
