// Encrypted chat room over TCP
//
// One peer hosts a room and accepts clients; clients authenticate with the
// pre-shared room key and exchange encrypted chat that the host fans out to
// every other authenticated client.

pub mod error;
pub mod cipher;
pub mod envelope;
pub mod registry;
pub mod handshake;
pub mod events;
pub mod connection;
pub mod config;
pub mod cli;
pub mod commands;

pub use error::{ChatError, Result};
pub use cipher::{decrypt, encrypt, SharedSecret};
pub use envelope::{Envelope, Kind, Payload};
pub use registry::{ConnectionId, SessionRegistry};
pub use handshake::{InitiatorHandshake, ResponderHandshake};
pub use events::{ChatEvent, EventReceiver, EventSink};
pub use connection::{Connected, Connection, Listening};
pub use config::PeerConfig;
pub use cli::{KeyroomCli, KeyroomCommand};
pub use commands::execute_command;
