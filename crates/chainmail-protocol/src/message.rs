//! The message envelope and its typed payloads.
//!
//! A [`Message`] is the unit a mail server stores: a small typed
//! envelope whose payload is opaque until decrypted. Outgoing mail is
//! sealed by the wallet (`kind = Encrypted`, the payload being another
//! serialized message); once opened, the inner envelope's payload
//! decodes into one of the typed payloads below.
//!
//! The envelope's `nonce` and `timestamp` are mutated during mining:
//! the content id covers both, and a message is transmittable only
//! when its id satisfies the proof-of-work target.

use serde::{Deserialize, Serialize};

use chainmail_types::{MailError, MessageId, MessageKind, PublicKey, Result, Timestamp};

use crate::hash::message_digest;

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A typed message envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    /// Payload classification.
    pub kind: MessageKind,
    /// Creation time; refreshed while mining so servers do not reject
    /// the message as stale.
    pub timestamp: Timestamp,
    /// Proof-of-work counter.
    pub nonce: u64,
    /// Owner key of the recipient account.
    pub recipient: PublicKey,
    /// Opaque payload bytes (hex on the wire).
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
}

impl Message {
    /// Returns the content id of this envelope in its current state.
    ///
    /// The id covers the nonce and timestamp; two calls straddling a
    /// mining step return different values.
    pub fn id(&self) -> MessageId {
        message_digest(self)
    }

    /// Decodes the payload as an email.
    ///
    /// # Errors
    ///
    /// Returns [`MailError::ProtocolError`] if the kind is not
    /// [`MessageKind::Email`] or the payload does not decode.
    pub fn as_email(&self) -> Result<EmailPayload> {
        if self.kind != MessageKind::Email {
            return Err(MailError::ProtocolError {
                reason: format!("expected an email payload, found {}", self.kind),
            });
        }
        EmailPayload::decode(&self.payload)
    }

    /// Decodes the payload as a transaction notice.
    ///
    /// # Errors
    ///
    /// Returns [`MailError::ProtocolError`] if the kind is not
    /// [`MessageKind::TransactionNotice`] or the payload does not
    /// decode.
    pub fn as_transaction_notice(&self) -> Result<TransactionNoticePayload> {
        if self.kind != MessageKind::TransactionNotice {
            return Err(MailError::ProtocolError {
                reason: format!("expected a transaction notice, found {}", self.kind),
            });
        }
        TransactionNoticePayload::decode(&self.payload)
    }
}

// ---------------------------------------------------------------------------
// EmailPayload
// ---------------------------------------------------------------------------

/// Plaintext email carried by a message of kind `Email`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmailPayload {
    /// Key the email claims to be signed by; the wallet maps it to a
    /// label during fetch.
    pub from_key: PublicKey,
    /// Subject line.
    pub subject: String,
    /// Body text.
    pub body: String,
    /// Id of the message this one replies to, if any.
    pub reply_to: Option<MessageId>,
}

impl EmailPayload {
    /// Encodes the payload to CBOR bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_cbor(self)
    }

    /// Decodes a payload from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode_cbor(bytes)
    }
}

// ---------------------------------------------------------------------------
// TransactionNoticePayload
// ---------------------------------------------------------------------------

/// Notification that a transaction was addressed to the recipient.
///
/// The fetcher hands the transaction id to the wallet's scanner and
/// surfaces a notification event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionNoticePayload {
    /// Key the notice claims to be signed by.
    pub from_key: PublicKey,
    /// Id of the noticed transaction.
    pub txid: String,
}

impl TransactionNoticePayload {
    /// Encodes the payload to CBOR bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_cbor(self)
    }

    /// Decodes a payload from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode_cbor(bytes)
    }
}

// ---------------------------------------------------------------------------
// CBOR helpers
// ---------------------------------------------------------------------------

fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| MailError::ProtocolError {
        reason: format!("payload encoding failed: {e}"),
    })?;
    Ok(buf)
}

fn decode_cbor<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    ciborium::de::from_reader(bytes).map_err(|e| MailError::ProtocolError {
        reason: format!("payload decoding failed: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Hex serde for payload bytes
// ---------------------------------------------------------------------------

/// Serializes byte payloads as hex strings so the JSON wire stays
/// line-oriented and printable.
mod hex_bytes {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &[u8],
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(|e| D::Error::custom(format!("invalid hex payload: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
