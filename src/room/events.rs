// Output events delivered to the front-end

use std::fmt;
use tokio::sync::mpsc;

/// Something the user should see
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// Decrypted chat message
    Message { sender: String, text: String },
    /// Lifecycle notice: joins, disconnects, handshake results
    Status(String),
    /// Per-message or per-connection failure that did not stop the peer
    Error(String),
}

impl fmt::Display for ChatEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatEvent::Message { sender, text } => write!(f, "{}: {}", sender, text),
            ChatEvent::Status(status) => f.write_str(status),
            ChatEvent::Error(error) => write!(f, "Error: {}", error),
        }
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<ChatEvent>;

/// Cloneable sending half of the event stream.
///
/// A front-end that dropped its receiver is not an error for the protocol,
/// so sends never fail.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ChatEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn message(&self, sender: impl Into<String>, text: impl Into<String>) {
        self.emit(ChatEvent::Message {
            sender: sender.into(),
            text: text.into(),
        });
    }

    pub fn status(&self, status: impl Into<String>) {
        self.emit(ChatEvent::Status(status.into()));
    }

    pub fn error(&self, error: impl Into<String>) {
        self.emit(ChatEvent::Error(error.into()));
    }

    fn emit(&self, event: ChatEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Event receiver dropped; event discarded");
        }
    }
}
