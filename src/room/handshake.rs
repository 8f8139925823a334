// Handshake state machines for both ends of a room connection
//
// The handshake is a single round trip: the client presents the room key as
// hex text and the host compares it against its own. These types perform no
// I/O; the connection manager feeds them envelopes and carries out the
// outcome.

use crate::room::cipher::SharedSecret;
use crate::room::envelope::{Envelope, Payload};
use crate::room::error::{ChatError, Result};
use subtle::ConstantTimeEq;

/// Host-side connection state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponderState {
    AwaitingHandshake,
    Authorized(String),
    Rejected,
}

/// What the host does with an envelope received before authorization
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// Register `identity`, send `reply`, keep the connection
    Accept { identity: String, reply: Envelope },
    /// Send `reply`, then close the connection
    Reject { reply: Envelope },
    /// Close the connection without replying
    Unauthorized(String),
}

/// What the host does with an envelope received after authorization
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    /// Decrypt and deliver
    Chat,
    /// Drop this envelope, keep the connection
    Ignore(String),
    /// Drop this envelope and close the connection
    Unauthorized(String),
}

/// Host (responder) side of the handshake
pub struct ResponderHandshake {
    local_identity: String,
    expected: SharedSecret,
    state: ResponderState,
}

impl ResponderHandshake {
    /// Create a responder for one freshly accepted connection
    pub fn new(local_identity: impl Into<String>, secret: &SharedSecret) -> Self {
        Self {
            local_identity: local_identity.into(),
            expected: secret.clone(),
            state: ResponderState::AwaitingHandshake,
        }
    }

    pub fn state(&self) -> &ResponderState {
        &self.state
    }

    /// Identity bound to this connection once authorized
    pub fn identity(&self) -> Option<&str> {
        match &self.state {
            ResponderState::Authorized(identity) => Some(identity),
            _ => None,
        }
    }

    /// Drive the handshake with the first envelope(s) of the connection
    pub fn respond(&mut self, envelope: &Envelope) -> HandshakeOutcome {
        if self.state != ResponderState::AwaitingHandshake {
            return HandshakeOutcome::Unauthorized("handshake already completed".to_string());
        }

        match &envelope.payload {
            Payload::HandshakeRequest { credential } => {
                if self.credential_matches(credential) {
                    self.state = ResponderState::Authorized(envelope.sender.clone());
                    HandshakeOutcome::Accept {
                        identity: envelope.sender.clone(),
                        reply: Envelope::handshake_accept(self.local_identity.clone()),
                    }
                } else {
                    self.state = ResponderState::Rejected;
                    HandshakeOutcome::Reject {
                        reply: Envelope::handshake_reject(self.local_identity.clone()),
                    }
                }
            }
            _ => {
                self.state = ResponderState::Rejected;
                HandshakeOutcome::Unauthorized(format!(
                    "{} from {} before handshake",
                    envelope.kind(),
                    envelope.sender
                ))
            }
        }
    }

    /// Undecodable bytes before authorization count as a failed handshake
    pub fn reject_malformed(&mut self) -> Envelope {
        self.state = ResponderState::Rejected;
        Envelope::handshake_reject(self.local_identity.clone())
    }

    /// Decide what to do with an envelope on an authorized connection.
    ///
    /// Only chat from the identity bound by this connection's handshake is
    /// processed; chat claiming any other sender closes the connection.
    pub fn admit(&self, envelope: &Envelope) -> Admission {
        let Some(identity) = self.identity() else {
            return Admission::Unauthorized("connection is not authorized".to_string());
        };

        match &envelope.payload {
            Payload::Chat { .. } if envelope.sender == identity => Admission::Chat,
            Payload::Chat { .. } => Admission::Unauthorized(format!(
                "chat from {} on connection authorized as {}",
                envelope.sender, identity
            )),
            _ => Admission::Ignore(format!(
                "unexpected {} from {} after handshake",
                envelope.kind(),
                envelope.sender
            )),
        }
    }

    /// Decode the presented hex key and compare it in constant time
    fn credential_matches(&self, credential: &str) -> bool {
        match SharedSecret::from_hex(credential) {
            Ok(presented) => presented.ct_eq(&self.expected).into(),
            Err(_) => false,
        }
    }
}

/// Client-side connection state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitiatorState {
    HandshakeSent,
    Connected(String),
    Failed,
}

/// Client (initiator) side of the handshake
pub struct InitiatorHandshake {
    state: InitiatorState,
}

impl InitiatorHandshake {
    /// Begin a handshake; returns the request to send immediately
    pub fn start(identity: impl Into<String>, secret: &SharedSecret) -> (Self, Envelope) {
        let request = Envelope::handshake_request(identity, secret.to_hex());
        (
            Self {
                state: InitiatorState::HandshakeSent,
            },
            request,
        )
    }

    pub fn state(&self) -> &InitiatorState {
        &self.state
    }

    /// Consume the host's single response. Returns the host identity on success.
    pub fn on_response(&mut self, response: &Envelope) -> Result<String> {
        if self.state != InitiatorState::HandshakeSent {
            return Err(ChatError::Protocol(
                "handshake response already processed".to_string(),
            ));
        }

        match &response.payload {
            Payload::HandshakeAccept => {
                self.state = InitiatorState::Connected(response.sender.clone());
                Ok(response.sender.clone())
            }
            Payload::HandshakeReject { .. } => {
                self.state = InitiatorState::Failed;
                Err(ChatError::HandshakeRejected)
            }
            _ => {
                self.state = InitiatorState::Failed;
                Err(ChatError::Protocol(format!(
                    "expected handshake response, got {}",
                    response.kind()
                )))
            }
        }
    }
}
