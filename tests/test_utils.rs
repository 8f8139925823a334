//! Test utilities and fixtures for keyroom
//!
//! Helpers to start hosts and clients on loopback, drain their event streams,
//! and drive a connection by hand at the frame level.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use keyroom::room::envelope::{frame_codec, MAX_FRAME_LEN};
use keyroom::room::*;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// How long any single wait in a test may take
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Start a host on an ephemeral loopback port
pub async fn start_host(name: &str) -> (Connection, EventReceiver, Listening) {
    start_host_with_limit(name, MAX_FRAME_LEN).await
}

/// Start a host whose frames may not exceed `max_frame_len` bytes
pub async fn start_host_with_limit(
    name: &str,
    max_frame_len: usize,
) -> (Connection, EventReceiver, Listening) {
    let (host, events) = Connection::with_frame_limit(name, SharedSecret::generate(), max_frame_len);
    let host = host.with_bind_host("127.0.0.1");
    let listening = host
        .start_listening(0)
        .await
        .expect("Host should bind an ephemeral port");
    (host, events, listening)
}

/// Join the host at `listening` with the given key
pub async fn join(
    name: &str,
    key_hex: &str,
    listening: &Listening,
) -> keyroom::room::Result<(Connection, EventReceiver)> {
    join_with_limit(name, key_hex, listening, MAX_FRAME_LEN).await
}

/// Join with a client-side frame limit of `max_frame_len` bytes
pub async fn join_with_limit(
    name: &str,
    key_hex: &str,
    listening: &Listening,
    max_frame_len: usize,
) -> keyroom::room::Result<(Connection, EventReceiver)> {
    let secret = SharedSecret::from_hex(key_hex)?;
    let (client, events) = Connection::with_frame_limit(name, secret, max_frame_len);
    client
        .connect("127.0.0.1", listening.local_addr.port())
        .await?;
    Ok((client, events))
}

/// Next chat message on the stream as `(sender, text)`, skipping status events
pub async fn next_message(events: &mut EventReceiver) -> (String, String) {
    loop {
        match next_event(events).await {
            ChatEvent::Message { sender, text } => return (sender, text),
            _ => continue,
        }
    }
}

/// Next error event on the stream, skipping everything else
pub async fn next_error(events: &mut EventReceiver) -> String {
    loop {
        if let ChatEvent::Error(error) = next_event(events).await {
            return error;
        }
    }
}

/// Wait for a status event containing `needle`
pub async fn wait_for_status(events: &mut EventReceiver, needle: &str) -> String {
    loop {
        if let ChatEvent::Status(status) = next_event(events).await {
            if status.contains(needle) {
                return status;
            }
        }
    }
}

pub async fn next_event(events: &mut EventReceiver) -> ChatEvent {
    tokio::time::timeout(TIMEOUT, events.recv())
        .await
        .expect("Timed out waiting for event")
        .expect("Event stream closed")
}

/// Assert no chat message arrives within `window`
pub async fn assert_no_message(events: &mut EventReceiver, window: Duration) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Err(_) => return,
            Ok(None) => return,
            Ok(Some(ChatEvent::Message { sender, text })) => {
                panic!("Unexpected message {}: {}", sender, text)
            }
            Ok(Some(_)) => continue,
        }
    }
}

/// Wait until the peer holds exactly `count` live channels
pub async fn wait_for_channels(peer: &Connection, count: usize) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < TIMEOUT {
        if peer.channel_count().await == count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// A port with nothing listening on it
pub fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().unwrap().port()
}

/// A hand-driven connection speaking raw frames
pub struct RawPeer {
    reader: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    writer: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
}

impl RawPeer {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("raw connect");
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: FramedRead::new(read_half, frame_codec(MAX_FRAME_LEN)),
            writer: FramedWrite::new(write_half, frame_codec(MAX_FRAME_LEN)),
        }
    }

    pub async fn send(&mut self, envelope: &Envelope) {
        self.send_raw(&envelope.to_bytes().unwrap()).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer
            .send(Bytes::copy_from_slice(bytes))
            .await
            .expect("raw send");
    }

    /// Next envelope, or `None` once the other side closed the connection
    pub async fn recv(&mut self) -> Option<Envelope> {
        let frame = tokio::time::timeout(TIMEOUT, self.reader.next())
            .await
            .expect("Timed out waiting for frame")?;
        match frame {
            Ok(frame) => Some(Envelope::from_bytes(&frame).expect("decodable frame")),
            Err(_) => None,
        }
    }

    /// Perform a correct handshake as `name`
    pub async fn authenticate(addr: SocketAddr, name: &str, secret: &SharedSecret) -> Self {
        let mut peer = Self::connect(addr).await;
        peer.send(&Envelope::handshake_request(name, secret.to_hex()))
            .await;
        let reply = peer.recv().await.expect("handshake reply");
        assert_eq!(reply.payload, Payload::HandshakeAccept);
        peer
    }
}

/// Chat envelope from `sender` encrypted under `secret`
pub fn chat(sender: &str, text: &str, secret: &SharedSecret) -> Envelope {
    let (nonce, ciphertext) = encrypt(text.as_bytes(), secret).unwrap();
    Envelope::chat(sender, &nonce, ciphertext)
}
