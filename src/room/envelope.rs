// Wire envelope exchanged between peers, and the frame codec that carries it

use crate::room::cipher::NONCE_SIZE;
use crate::room::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::codec::LengthDelimitedCodec;

/// Payload the host answers with when a credential does not match
pub const REJECTION_TOKEN: &str = "UNAUTHORIZED";

/// Default upper bound for one frame on the wire (1 MiB)
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Envelope kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    HandshakeRequest,
    HandshakeAccept,
    HandshakeReject,
    Chat,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::HandshakeRequest => "handshake_request",
            Kind::HandshakeAccept => "handshake_accept",
            Kind::HandshakeReject => "handshake_reject",
            Kind::Chat => "chat",
        };
        f.write_str(name)
    }
}

/// Kind-specific content of an envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// Client presenting the room key as hex text
    HandshakeRequest { credential: String },
    /// Host admitting the client
    HandshakeAccept,
    /// Host refusing the client
    HandshakeReject { token: String },
    /// Encrypted chat body
    Chat {
        #[serde(with = "hex::serde")]
        nonce: Vec<u8>,
        #[serde(with = "hex::serde")]
        ciphertext: Vec<u8>,
    },
}

/// The unit sent over the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Identity (username) of the originating peer
    pub sender: String,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(sender: impl Into<String>, payload: Payload) -> Self {
        Self {
            sender: sender.into(),
            payload,
        }
    }

    pub fn handshake_request(sender: impl Into<String>, credential: impl Into<String>) -> Self {
        Self::new(
            sender,
            Payload::HandshakeRequest {
                credential: credential.into(),
            },
        )
    }

    pub fn handshake_accept(sender: impl Into<String>) -> Self {
        Self::new(sender, Payload::HandshakeAccept)
    }

    pub fn handshake_reject(sender: impl Into<String>) -> Self {
        Self::new(
            sender,
            Payload::HandshakeReject {
                token: REJECTION_TOKEN.to_string(),
            },
        )
    }

    pub fn chat(sender: impl Into<String>, nonce: &[u8], ciphertext: Vec<u8>) -> Self {
        Self::new(
            sender,
            Payload::Chat {
                nonce: nonce.to_vec(),
                ciphertext,
            },
        )
    }

    pub fn kind(&self) -> Kind {
        match self.payload {
            Payload::HandshakeRequest { .. } => Kind::HandshakeRequest,
            Payload::HandshakeAccept => Kind::HandshakeAccept,
            Payload::HandshakeReject { .. } => Kind::HandshakeReject,
            Payload::Chat { .. } => Kind::Chat,
        }
    }

    /// Serialize to JSON bytes (one frame body)
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ChatError::MalformedEnvelope(e.to_string()))
    }

    /// Deserialize from one frame body.
    ///
    /// Truncated or otherwise malformed input is rejected as a whole; so is a
    /// chat payload whose nonce cannot have come from the cipher.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| ChatError::MalformedEnvelope(e.to_string()))?;

        if let Payload::Chat { nonce, .. } = &envelope.payload {
            if nonce.len() != NONCE_SIZE {
                return Err(ChatError::MalformedEnvelope(format!(
                    "chat nonce must be {} bytes, got {}",
                    NONCE_SIZE,
                    nonce.len()
                )));
            }
        }

        Ok(envelope)
    }
}

/// Length-prefixed frame codec: 4-byte big-endian length, then the envelope bytes
pub fn frame_codec(max_frame_len: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(max_frame_len)
        .new_codec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::cipher::{encrypt, SharedSecret};
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;
    use tokio_util::bytes::{Bytes, BytesMut};
    use tokio_util::codec::{Encoder, FramedRead};

    fn chat_envelope() -> Envelope {
        let key = SharedSecret::generate();
        let (nonce, ciphertext) = encrypt(b"hello", &key).unwrap();
        Envelope::chat("alice", &nonce, ciphertext)
    }

    fn encode_frames(envelopes: &[Envelope]) -> BytesMut {
        let mut codec = frame_codec(MAX_FRAME_LEN);
        let mut buf = BytesMut::new();
        for envelope in envelopes {
            codec
                .encode(Bytes::from(envelope.to_bytes().unwrap()), &mut buf)
                .unwrap();
        }
        buf
    }

    #[test]
    fn test_chat_envelope_roundtrip() {
        let envelope = chat_envelope();
        let decoded = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded, envelope);
        assert_eq!(decoded.kind(), Kind::Chat);
    }

    #[test]
    fn test_reject_carries_token() {
        let envelope = Envelope::handshake_reject("host");
        let decoded = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();

        match decoded.payload {
            Payload::HandshakeReject { token } => assert_eq!(token, REJECTION_TOKEN),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_truncated_bytes_rejected() {
        let bytes = chat_envelope().to_bytes().unwrap();
        let result = Envelope::from_bytes(&bytes[..bytes.len() / 2]);

        assert!(matches!(result, Err(ChatError::MalformedEnvelope(_))));
    }

    #[test]
    fn test_garbage_and_unknown_kind_rejected() {
        assert!(matches!(
            Envelope::from_bytes(b"\x00\x01\x02"),
            Err(ChatError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            Envelope::from_bytes(br#"{"sender":"a","payload":{"kind":"shout"}}"#),
            Err(ChatError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_bad_nonce_length_rejected() {
        let bytes = br#"{"sender":"a","payload":{"kind":"chat","nonce":"0011","ciphertext":"ff"}}"#;

        assert!(matches!(
            Envelope::from_bytes(bytes),
            Err(ChatError::MalformedEnvelope(_))
        ));
    }

    #[tokio::test]
    async fn test_coalesced_frames_split_correctly() {
        let first = Envelope::handshake_request("alice", "00ff");
        let second = chat_envelope();
        let buf = encode_frames(&[first.clone(), second.clone()]);

        let mut frames = FramedRead::new(&buf[..], frame_codec(MAX_FRAME_LEN));

        let a = frames.next().await.unwrap().unwrap();
        let b = frames.next().await.unwrap().unwrap();
        assert_eq!(Envelope::from_bytes(&a).unwrap(), first);
        assert_eq!(Envelope::from_bytes(&b).unwrap(), second);
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn test_fragmented_frame_reassembled() {
        let envelope = chat_envelope();
        let buf = encode_frames(&[envelope.clone()]);

        let (mut writer, reader) = tokio::io::duplex(64);
        tokio::spawn(async move {
            for byte in buf.iter() {
                writer.write_all(&[*byte]).await.unwrap();
            }
        });

        let mut frames = FramedRead::new(reader, frame_codec(MAX_FRAME_LEN));
        let frame = frames.next().await.unwrap().unwrap();

        assert_eq!(Envelope::from_bytes(&frame).unwrap(), envelope);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_error() {
        let envelope = chat_envelope();
        let buf = encode_frames(&[envelope]);

        let mut frames = FramedRead::new(&buf[..], frame_codec(8));
        assert!(frames.next().await.unwrap().is_err());
    }
}
