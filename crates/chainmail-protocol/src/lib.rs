//! Message envelope, content digests, and the mail server wire protocol.
//!
//! This crate defines what travels between a chainmail client and a
//! mail server: the [`message::Message`] envelope, its content-addressed
//! 160-bit digest, the typed payloads it can carry, and the
//! line-delimited JSON-RPC client used to talk to servers.

pub mod hash;
pub mod message;
pub mod wire;
