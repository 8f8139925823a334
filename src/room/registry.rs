// Registry of authorized sessions and their outbound channels

use std::collections::HashMap;
use std::fmt;
use tokio::sync::{mpsc, RwLock};
use tokio_util::bytes::Bytes;
use uuid::Uuid;

/// Sender side of one connection's outbound queue; the connection's writer
/// task drains it onto the socket
pub type OutboundChannel = mpsc::UnboundedSender<Bytes>;

/// Identifies one live transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An authorized session
struct Session {
    identity: String,
    tx: OutboundChannel,
}

/// Maps live connections to the identity they authenticated as.
///
/// Identities need not be unique: two connections may authenticate with the
/// same username and both are kept.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ConnectionId, Session>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register an authorized identity together with its outbound channel
    pub async fn register(&self, identity: String, tx: OutboundChannel) -> ConnectionId {
        let id = ConnectionId::new();
        let mut sessions = self.sessions.write().await;
        tracing::info!("Session {} registered for {}", id, identity);
        sessions.insert(id, Session { identity, tx });
        id
    }

    /// Remove a session, returning the identity it was registered under
    pub async fn remove(&self, id: ConnectionId) -> Option<String> {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.remove(&id).map(|s| s.identity);
        if let Some(identity) = &removed {
            tracing::info!("Session {} ({}) removed", id, identity);
        }
        removed
    }

    /// Whether any live session authenticated as `identity`
    pub async fn is_authorized(&self, identity: &str) -> bool {
        let sessions = self.sessions.read().await;
        sessions.values().any(|s| s.identity == identity)
    }

    /// Whether `id` is still registered under `identity`
    pub async fn is_bound(&self, id: ConnectionId, identity: &str) -> bool {
        let sessions = self.sessions.read().await;
        sessions
            .get(&id)
            .map(|s| s.identity == identity)
            .unwrap_or(false)
    }

    /// Identities of all live sessions, duplicates included
    pub async fn identities(&self) -> Vec<String> {
        let sessions = self.sessions.read().await;
        sessions.values().map(|s| s.identity.clone()).collect()
    }

    /// Queue `frame` on every live channel. Returns the number of channels that took it.
    pub async fn broadcast(&self, frame: Bytes) -> usize {
        self.broadcast_except(frame, None).await
    }

    /// Queue `frame` on every live channel except `skip`.
    ///
    /// Delivery is best-effort per channel: a channel whose writer has gone
    /// away is dropped from the registry and the rest still receive the frame.
    pub async fn broadcast_except(&self, frame: Bytes, skip: Option<ConnectionId>) -> usize {
        let sessions = self.sessions.read().await;

        let mut delivered = 0;
        let mut failed = Vec::new();

        for (id, session) in sessions.iter() {
            if Some(*id) == skip {
                continue;
            }

            if session.tx.send(frame.clone()).is_err() {
                tracing::warn!("Failed to queue frame for {} ({})", session.identity, id);
                failed.push(*id);
            } else {
                delivered += 1;
            }
        }

        drop(sessions);

        if !failed.is_empty() {
            let mut sessions = self.sessions.write().await;
            for id in failed {
                if let Some(session) = sessions.remove(&id) {
                    tracing::info!("Removed dead session {} ({})", id, session.identity);
                }
            }
        }

        delivered
    }

    /// Number of live sessions
    pub async fn len(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every session; each writer task sees its queue close and shuts its socket down
    pub async fn clear(&self) {
        let mut sessions = self.sessions.write().await;
        sessions.clear();
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_remove() {
        let registry = SessionRegistry::new();

        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.register("alice".to_string(), tx).await;

        assert_eq!(registry.len().await, 1);
        assert!(registry.is_authorized("alice").await);
        assert!(registry.is_bound(id, "alice").await);
        assert!(!registry.is_authorized("bob").await);

        assert_eq!(registry.remove(id).await.as_deref(), Some("alice"));
        assert!(registry.is_empty().await);
        assert!(!registry.is_authorized("alice").await);
        assert_eq!(registry.remove(id).await, None);
    }

    #[tokio::test]
    async fn test_duplicate_identities_kept() {
        let registry = SessionRegistry::new();

        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let first = registry.register("alice".to_string(), tx1).await;
        registry.register("alice".to_string(), tx2).await;

        assert_eq!(registry.identities().await, vec!["alice", "alice"]);

        registry.remove(first).await;
        assert!(registry.is_authorized("alice").await);
    }

    #[tokio::test]
    async fn test_broadcast_skips_origin() {
        let registry = SessionRegistry::new();

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = registry.register("a".to_string(), tx_a).await;
        registry.register("b".to_string(), tx_b).await;

        let delivered = registry
            .broadcast_except(Bytes::from_static(b"frame"), Some(a))
            .await;

        assert_eq!(delivered, 1);
        assert_eq!(rx_b.recv().await.unwrap(), Bytes::from_static(b"frame"));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_drops_dead_channel() {
        let registry = SessionRegistry::new();

        let (tx_dead, rx_dead) = mpsc::unbounded_channel();
        let (tx_live, mut rx_live) = mpsc::unbounded_channel();
        registry.register("dead".to_string(), tx_dead).await;
        registry.register("live".to_string(), tx_live).await;
        drop(rx_dead);

        let delivered = registry.broadcast(Bytes::from_static(b"hi")).await;

        assert_eq!(delivered, 1);
        assert_eq!(rx_live.recv().await.unwrap(), Bytes::from_static(b"hi"));
        assert_eq!(registry.identities().await, vec!["live"]);
    }

    #[tokio::test]
    async fn test_clear_closes_queues() {
        let registry = SessionRegistry::new();

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("alice".to_string(), tx).await;
        registry.clear().await;

        assert!(rx.recv().await.is_none());
        assert!(registry.is_empty().await);
    }
}
