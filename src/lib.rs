//! keyroom - Encrypted group chat over raw TCP
//!
//! A host peer listens for clients, authenticates each one against a
//! pre-shared room key, and relays XChaCha20-Poly1305 encrypted chat between
//! every authenticated client.

pub mod room;

pub use room::{ChatError, ChatEvent, Connection, SharedSecret};
