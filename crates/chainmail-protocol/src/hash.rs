//! Content digests and key→address derivation.
//!
//! The message digest is RIPEMD-160 over a fixed field concatenation:
//!
//! ```text
//! digest = RIPEMD160(kind_tag || timestamp_be || nonce_be || recipient || payload)
//! ```
//!
//! The nonce and timestamp are part of the preimage, so the digest
//! changes with every mining step — that is what makes it usable as a
//! proof-of-work witness. The concatenation is fixed-layout rather
//! than a serialized form so recomputing it in the mining loop cannot
//! fail.

use ripemd::{Digest as _, Ripemd160};
use sha2::{Digest as _, Sha256};

use chainmail_types::{Address, MessageId, MessageKind, PublicKey};

use crate::message::Message;

/// Computes the RIPEMD-160 digest of arbitrary bytes.
pub fn ripemd160(data: &[u8]) -> [u8; 20] {
    let mut hasher = Ripemd160::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Stable one-byte tag for each message kind.
///
/// Part of the digest preimage; must never be renumbered.
fn kind_tag(kind: MessageKind) -> u8 {
    match kind {
        MessageKind::Encrypted => 0,
        MessageKind::Email => 1,
        MessageKind::TransactionNotice => 2,
    }
}

/// Computes the content id of a message.
pub fn message_digest(message: &Message) -> MessageId {
    let mut preimage =
        Vec::with_capacity(1 + 8 + 8 + PublicKey::LEN + message.payload.len());
    preimage.push(kind_tag(message.kind));
    preimage.extend_from_slice(&message.timestamp.as_secs().to_be_bytes());
    preimage.extend_from_slice(&message.nonce.to_be_bytes());
    preimage.extend_from_slice(message.recipient.as_bytes());
    preimage.extend_from_slice(&message.payload);
    MessageId::new(ripemd160(&preimage))
}

/// Derives the account address of a public key: `RIPEMD160(SHA256(key))`.
pub fn address_of_key(key: &PublicKey) -> Address {
    let sha = Sha256::digest(key.as_bytes());
    Address::new(ripemd160(&sha))
}
