// Connection manager: listening, connecting, receive loops and fan-out

use crate::room::cipher::{self, SharedSecret};
use crate::room::envelope::{frame_codec, Envelope, Payload, MAX_FRAME_LEN};
use crate::room::error::{ChatError, Result};
use crate::room::events::{EventReceiver, EventSink};
use crate::room::handshake::{
    Admission, HandshakeOutcome, InitiatorHandshake, ResponderHandshake,
};
use crate::room::registry::{ConnectionId, SessionRegistry};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

/// Host used when `connect` is given an empty address
pub const DEFAULT_CONNECT_HOST: &str = "127.0.0.1";

/// Host the listener binds to unless configured otherwise
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

type FrameReader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;
type FrameWriter = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

/// Result of `start_listening`
#[derive(Debug, Clone)]
pub struct Listening {
    /// Address the listener actually bound (ephemeral port resolved)
    pub local_addr: SocketAddr,
    /// Room key in hex, to hand to clients out of band
    pub key_hex: String,
}

/// Result of a successful `connect`
#[derive(Debug, Clone)]
pub struct Connected {
    /// Identity the host answered with
    pub host_identity: String,
    pub peer_addr: SocketAddr,
}

/// State shared between a peer and all of its connection tasks
struct Shared {
    identity: String,
    secret: SharedSecret,
    registry: SessionRegistry,
    events: EventSink,
    shutdown: CancellationToken,
    max_frame_len: usize,
}

/// One peer of a room, acting as host, client, or both.
///
/// Every live connection runs in its own task. Outbound traffic goes through
/// the session registry, which holds one queue per authorized connection.
/// `close_all` is terminal: a closed peer cannot listen or connect again.
pub struct Connection {
    shared: Arc<Shared>,
    bind_host: String,
    active: AtomicBool,
}

impl Connection {
    /// Create a peer with a known room key
    pub fn new(identity: impl Into<String>, secret: SharedSecret) -> (Self, EventReceiver) {
        Self::build(identity.into(), secret, MAX_FRAME_LEN)
    }

    /// Create a peer that will host a room under a freshly generated key
    pub fn host(identity: impl Into<String>) -> (Self, EventReceiver) {
        Self::new(identity, SharedSecret::generate())
    }

    /// Create a peer with an explicit frame size limit
    pub fn with_frame_limit(
        identity: impl Into<String>,
        secret: SharedSecret,
        max_frame_len: usize,
    ) -> (Self, EventReceiver) {
        Self::build(identity.into(), secret, max_frame_len)
    }

    fn build(identity: String, secret: SharedSecret, max_frame_len: usize) -> (Self, EventReceiver) {
        let (events, rx) = EventSink::channel();

        let shared = Arc::new(Shared {
            identity,
            secret,
            registry: SessionRegistry::new(),
            events,
            shutdown: CancellationToken::new(),
            max_frame_len,
        });

        let connection = Self {
            shared,
            bind_host: DEFAULT_BIND_HOST.to_string(),
            active: AtomicBool::new(false),
        };

        (connection, rx)
    }

    /// Set the local host the listener binds to
    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    pub fn identity(&self) -> &str {
        &self.shared.identity
    }

    pub fn key_hex(&self) -> String {
        self.shared.secret.to_hex()
    }

    /// Identities of every live authorized channel
    pub async fn authorized_identities(&self) -> Vec<String> {
        self.shared.registry.identities().await
    }

    /// Number of live outbound channels
    pub async fn channel_count(&self) -> usize {
        self.shared.registry.len().await
    }

    /// Bind `bind_host:port` and accept clients in the background
    pub async fn start_listening(&self, port: u16) -> Result<Listening> {
        self.ensure_open()?;
        let addr = format!("{}:{}", self.bind_host, port);

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ChatError::bind(addr.clone(), e))?;
        let local_addr = listener.local_addr()?;

        tracing::info!("Listening on {}", local_addr);
        self.active.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        tokio::spawn(async move {
            run_accept_loop(listener, shared).await;
        });

        Ok(Listening {
            local_addr,
            key_hex: self.shared.secret.to_hex(),
        })
    }

    /// Connect to a host and authenticate with the room key.
    ///
    /// An empty `address` means the local host.
    pub async fn connect(&self, address: &str, port: u16) -> Result<Connected> {
        self.ensure_open()?;
        let host = match address.trim() {
            "" => DEFAULT_CONNECT_HOST,
            other => other,
        };
        let target = format!("{}:{}", host, port);

        let stream = TcpStream::connect(&target)
            .await
            .map_err(|e| ChatError::connect(&target, e))?;
        let peer_addr = stream.peer_addr()?;

        tracing::info!("Connected to {}, sending handshake", peer_addr);

        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, frame_codec(self.shared.max_frame_len));
        let mut writer = FramedWrite::new(write_half, frame_codec(self.shared.max_frame_len));

        let host_identity = match initiate_handshake(&mut reader, &mut writer, &self.shared).await {
            Ok(host_identity) => host_identity,
            Err(e) => {
                let _ = SinkExt::<Bytes>::close(&mut writer).await;
                match &e {
                    ChatError::HandshakeRejected => {
                        tracing::warn!("Handshake with {} rejected", peer_addr);
                        self.shared.events.status("Handshake failed! Unauthorized!");
                    }
                    other => {
                        tracing::warn!("Handshake with {} failed: {}", peer_addr, other);
                        self.shared.events.error(format!("Handshake failed: {}", other));
                    }
                }
                return Err(e);
            }
        };

        tracing::info!("Handshake with {} ({}) succeeded", host_identity, peer_addr);
        self.shared.events.status("Handshake successful!");

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.registry.register(host_identity.clone(), tx).await;
        tokio::spawn(write_loop(writer, rx, host_identity.clone()));

        let shared = self.shared.clone();
        let identity = host_identity.clone();
        tokio::spawn(async move {
            receive_loop(reader, id, identity, None, &shared).await;
            shared.registry.remove(id).await;
        });

        self.active.store(true, Ordering::SeqCst);

        Ok(Connected {
            host_identity,
            peer_addr,
        })
    }

    /// Encrypt `text` once and queue it on every live channel.
    ///
    /// Returns how many channels took the message. A message whose frame
    /// would exceed the frame limit is refused before anything is queued.
    pub async fn send_message(&self, text: &str) -> Result<usize> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(ChatError::NotConnected);
        }

        let (nonce, ciphertext) = cipher::encrypt(text.as_bytes(), &self.shared.secret)?;
        let envelope = Envelope::chat(self.shared.identity.clone(), &nonce, ciphertext);
        let frame = Bytes::from(envelope.to_bytes()?);

        if frame.len() > self.shared.max_frame_len {
            tracing::warn!(
                "Refusing {} byte message frame (limit {})",
                frame.len(),
                self.shared.max_frame_len
            );
            return Err(ChatError::MessageTooLarge {
                size: frame.len(),
                max: self.shared.max_frame_len,
            });
        }

        let delivered = self.shared.registry.broadcast(frame).await;
        tracing::debug!("Message queued on {} channel(s)", delivered);

        Ok(delivered)
    }

    /// Stop accepting, end every receive loop and close every channel
    pub async fn close_all(&self) {
        self.shared.shutdown.cancel();
        self.shared.registry.clear().await;
        self.active.store(false, Ordering::SeqCst);
        tracing::info!("All connections closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.shutdown.is_cancelled() {
            return Err(ChatError::Closed);
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

/// Accept clients until shutdown; each gets its own task
async fn run_accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        tracing::info!("Connection from {} has been established", peer_addr);
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            handle_inbound(stream, peer_addr, shared).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
            _ = shared.shutdown.cancelled() => {
                tracing::info!("Listener shutting down");
                break;
            }
        }
    }
}

/// Run one accepted connection: handshake, registration, then chat
async fn handle_inbound(stream: TcpStream, peer_addr: SocketAddr, shared: Arc<Shared>) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, frame_codec(shared.max_frame_len));
    let mut writer = FramedWrite::new(write_half, frame_codec(shared.max_frame_len));
    let mut handshake = ResponderHandshake::new(shared.identity.clone(), &shared.secret);

    let accepted = tokio::select! {
        accepted = respond_handshake(&mut reader, &mut writer, &mut handshake, peer_addr, &shared) => accepted,
        _ = shared.shutdown.cancelled() => return,
    };

    let Some((identity, reply)) = accepted else {
        let _ = SinkExt::<Bytes>::close(&mut writer).await;
        return;
    };

    let reply = match reply.to_bytes() {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => {
            tracing::error!("Failed to encode handshake reply: {}", e);
            return;
        }
    };

    // The accept is queued before registration so no broadcast can overtake it
    let (tx, rx) = mpsc::unbounded_channel();
    let _ = tx.send(reply);
    let id = shared.registry.register(identity.clone(), tx).await;
    tokio::spawn(write_loop(writer, rx, identity.clone()));

    tracing::info!("Handshake successful, {} ({}) is now connected", identity, peer_addr);
    shared
        .events
        .status(format!("Handshake successful! {} is now connected!", identity));

    receive_loop(reader, id, identity, Some(handshake), &shared).await;
    shared.registry.remove(id).await;
}

/// Host side of the handshake. Returns the authorized identity and the
/// reply to send, or `None` once the connection has been turned away.
async fn respond_handshake(
    reader: &mut FrameReader,
    writer: &mut FrameWriter,
    handshake: &mut ResponderHandshake,
    peer_addr: SocketAddr,
    shared: &Shared,
) -> Option<(String, Envelope)> {
    let frame = match reader.next().await {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => {
            tracing::warn!("Transport error from {} before handshake: {}", peer_addr, e);
            return None;
        }
        None => {
            tracing::info!("{} disconnected before handshake", peer_addr);
            return None;
        }
    };

    let outcome = match Envelope::from_bytes(&frame) {
        Ok(envelope) => handshake.respond(&envelope),
        Err(e) => {
            tracing::warn!("Malformed handshake from {}: {}", peer_addr, e);
            HandshakeOutcome::Reject {
                reply: handshake.reject_malformed(),
            }
        }
    };

    match outcome {
        HandshakeOutcome::Accept { identity, reply } => Some((identity, reply)),
        HandshakeOutcome::Reject { reply } => {
            tracing::warn!("Rejected handshake from {}", peer_addr);
            if let Err(e) = send_envelope(writer, &reply).await {
                tracing::debug!("Could not deliver rejection to {}: {}", peer_addr, e);
            }
            shared
                .events
                .status(format!("Handshake from {} rejected: unauthorized", peer_addr));
            None
        }
        HandshakeOutcome::Unauthorized(reason) => {
            tracing::warn!("Dropping {}: {}", peer_addr, reason);
            shared
                .events
                .status(format!("Dropped unauthorized connection from {}", peer_addr));
            None
        }
    }
}

/// Client side of the handshake: one request, exactly one response
async fn initiate_handshake(
    reader: &mut FrameReader,
    writer: &mut FrameWriter,
    shared: &Shared,
) -> Result<String> {
    let (mut handshake, request) = InitiatorHandshake::start(shared.identity.clone(), &shared.secret);
    send_envelope(writer, &request).await?;

    let frame = match reader.next().await {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => return Err(ChatError::Transport(e.to_string())),
        None => {
            return Err(ChatError::Transport(
                "host closed the connection during handshake".to_string(),
            ))
        }
    };

    let response = Envelope::from_bytes(&frame)?;
    handshake.on_response(&response)
}

/// Read envelopes until the peer leaves or the peer shuts down.
///
/// Inbound (host-side) connections carry the responder that authorized them:
/// their chat is admission-checked and relayed to every other channel.
async fn receive_loop(
    mut reader: FrameReader,
    id: ConnectionId,
    identity: String,
    responder: Option<ResponderHandshake>,
    shared: &Shared,
) {
    loop {
        let frame = tokio::select! {
            frame = reader.next() => frame,
            _ = shared.shutdown.cancelled() => break,
        };

        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::warn!("Connection with {} lost: {}", identity, e);
                shared
                    .events
                    .error(format!("Connection with {} lost: {}", identity, e));
                break;
            }
            None => {
                tracing::info!("{} ({}) disconnected", identity, id);
                let notice = if responder.is_some() {
                    format!("Client {} has disconnected!", identity)
                } else {
                    "Disconnected from host.".to_string()
                };
                shared.events.status(notice);
                break;
            }
        };

        let envelope = match Envelope::from_bytes(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Dropping malformed envelope from {}: {}", identity, e);
                shared
                    .events
                    .error(format!("Dropped malformed message from {}", identity));
                continue;
            }
        };

        if let Some(responder) = &responder {
            match responder.admit(&envelope) {
                Admission::Chat => {
                    if !shared.registry.is_bound(id, &envelope.sender).await {
                        tracing::warn!("Session {} for {} is no longer registered", id, identity);
                        break;
                    }
                }
                Admission::Ignore(reason) => {
                    tracing::warn!("Ignoring envelope: {}", reason);
                    continue;
                }
                Admission::Unauthorized(reason) => {
                    tracing::warn!("Closing connection: {}", reason);
                    shared
                        .events
                        .status(format!("Dropped unauthorized message on {}'s connection", identity));
                    break;
                }
            }
        } else if !matches!(envelope.payload, Payload::Chat { .. }) {
            tracing::warn!("Ignoring unexpected {} from {}", envelope.kind(), envelope.sender);
            continue;
        }

        match open_chat(&envelope, &shared.secret) {
            Ok(text) => {
                tracing::debug!("Chat from {} ({} bytes)", envelope.sender, text.len());
                shared.events.message(envelope.sender.clone(), text);

                // Inbound frames are bounded by the same codec limit the writers use
                if responder.is_some() {
                    let relayed = shared
                        .registry
                        .broadcast_except(frame.freeze(), Some(id))
                        .await;
                    tracing::debug!("Relayed chat from {} to {} channel(s)", envelope.sender, relayed);
                }
            }
            Err(e) => {
                tracing::warn!("Failed to decrypt message from {}: {}", envelope.sender, e);
                shared.events.error(format!(
                    "Could not decrypt message from {}: {}",
                    envelope.sender, e
                ));
            }
        }
    }
}

/// Decrypt a chat envelope into its text
fn open_chat(envelope: &Envelope, secret: &SharedSecret) -> Result<String> {
    let Payload::Chat { nonce, ciphertext } = &envelope.payload else {
        return Err(ChatError::Protocol(format!(
            "expected chat, got {}",
            envelope.kind()
        )));
    };

    let plaintext = cipher::decrypt(nonce, ciphertext, secret)?;
    String::from_utf8(plaintext)
        .map_err(|_| ChatError::MalformedEnvelope("chat text is not UTF-8".to_string()))
}

/// Drain one connection's outbound queue onto its socket
async fn write_loop(mut writer: FrameWriter, mut rx: mpsc::UnboundedReceiver<Bytes>, identity: String) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.send(frame).await {
            tracing::warn!("Write to {} failed: {}", identity, e);
            break;
        }
    }

    let _ = SinkExt::<Bytes>::close(&mut writer).await;
    tracing::debug!("Writer for {} closed", identity);
}

async fn send_envelope(writer: &mut FrameWriter, envelope: &Envelope) -> Result<()> {
    let bytes = envelope.to_bytes()?;
    writer
        .send(Bytes::from(bytes))
        .await
        .map_err(|e| ChatError::Transport(e.to_string()))
}
