//! Core shared types for the chainmail client.
//!
//! This crate defines the fundamental types used across the workspace.
//! No other crate should define shared types — everything lives here.

pub mod config;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Hex parsing helper
// ---------------------------------------------------------------------------

/// Decodes a hex string into a fixed-size byte array.
fn parse_fixed_hex<const N: usize>(s: &str) -> Option<[u8; N]> {
    let bytes = hex::decode(s).ok()?;
    if bytes.len() != N {
        return None;
    }
    let mut arr = [0u8; N];
    arr.copy_from_slice(&bytes);
    Some(arr)
}

// ---------------------------------------------------------------------------
// MessageId
// ---------------------------------------------------------------------------

/// Content-addressed 160-bit message digest.
///
/// Computed over the serialized message including its nonce, so the id
/// changes whenever the nonce changes. The numeric ordering of ids is
/// meaningful: a message satisfies proof-of-work when its id compares
/// `<=` the 160-bit target, so a `MessageId` also serves as a PoW
/// ceiling.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct MessageId([u8; 20]);

impl MessageId {
    /// The fixed byte length of a message id.
    pub const LEN: usize = 20;

    /// The all-zero id. An unset PoW target compares equal to this.
    pub const ZERO: MessageId = MessageId([0u8; 20]);

    /// The maximum id (every digest satisfies this as a PoW target).
    pub const MAX: MessageId = MessageId([0xFFu8; 20]);

    /// Creates a new `MessageId` from raw bytes.
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Returns `true` if this id is all zeroes.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl From<[u8; 20]> for MessageId {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for MessageId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for MessageId {
    type Err = MailError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        parse_fixed_hex(s).map(Self).ok_or_else(|| MailError::ProtocolError {
            reason: format!("invalid message id: expected {} hex bytes", Self::LEN),
        })
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|e: MailError| D::Error::custom(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// 160-bit account address: the hash of an owner public key.
///
/// Mail servers index stored messages by the recipient's address, and
/// the archive records the recipient address of every inbound message.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 20]);

impl Address {
    /// The fixed byte length of an address.
    pub const LEN: usize = 20;

    /// Creates a new `Address` from raw bytes.
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl From<[u8; 20]> for Address {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = MailError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        parse_fixed_hex(s).map(Self).ok_or_else(|| MailError::ProtocolError {
            reason: format!("invalid address: expected {} hex bytes", Self::LEN),
        })
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|e: MailError| D::Error::custom(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// PublicKey
// ---------------------------------------------------------------------------

/// Compressed 33-byte public key.
///
/// Key material is opaque to the mail pipeline: the wallet creates,
/// encrypts, and opens messages. The pipeline only routes keys (a mail
/// record carries the recipient's owner key) and derives addresses
/// from them.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct PublicKey([u8; 33]);

impl PublicKey {
    /// The fixed byte length of a compressed public key.
    pub const LEN: usize = 33;

    /// Creates a new `PublicKey` from raw bytes.
    pub fn new(bytes: [u8; 33]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 33] {
        &self.0
    }
}

impl Default for PublicKey {
    fn default() -> Self {
        Self([0u8; 33])
    }
}

impl From<[u8; 33]> for PublicKey {
    fn from(bytes: [u8; 33]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for PublicKey {
    type Err = MailError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        parse_fixed_hex(s).map(Self).ok_or_else(|| MailError::ProtocolError {
            reason: format!("invalid public key: expected {} hex bytes", Self::LEN),
        })
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|e: MailError| D::Error::custom(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Timestamp
// ---------------------------------------------------------------------------

/// UTC timestamp with one-second resolution.
///
/// Stored and transmitted as seconds since the Unix epoch. Message
/// timestamps participate in the content digest and are refreshed
/// while mining, so second resolution is deliberate.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The minimum representable timestamp.
    pub const MIN: Timestamp = Timestamp(i64::MIN);

    /// Returns the current UTC time.
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp())
    }

    /// Creates a `Timestamp` from seconds since the Unix epoch.
    pub fn from_secs(secs: i64) -> Self {
        Self(secs)
    }

    /// Returns seconds since the Unix epoch.
    pub fn as_secs(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match chrono::DateTime::from_timestamp(self.0, 0) {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "{}s", self.0),
        }
    }
}

// ---------------------------------------------------------------------------
// MailStatus
// ---------------------------------------------------------------------------

/// Status of a message in the mail pipeline.
///
/// `Ord` follows pipeline order: cancellation is permitted only while
/// `status <= ProofOfWork`, and the transmit timeout fires only while
/// `status >= Transmitting`.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MailStatus {
    /// Accepted from the caller; servers not yet resolved.
    Submitted,
    /// Mining a nonce that satisfies the PoW target.
    ProofOfWork,
    /// Fan-out to the resolved server set is in flight.
    Transmitting,
    /// At least one server durably holds the message (outgoing).
    Accepted,
    /// Fetched from a server and addressed to a local account.
    Received,
    /// Terminal failure; `failure_reason` explains why.
    Failed,
    /// Canceled by the user before transmission began.
    Canceled,
}

impl fmt::Display for MailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submitted => write!(f, "submitted"),
            Self::ProofOfWork => write!(f, "proof_of_work"),
            Self::Transmitting => write!(f, "transmitting"),
            Self::Accepted => write!(f, "accepted"),
            Self::Received => write!(f, "received"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

/// Classifies the payload carried by a message envelope.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Opaque ciphertext; the payload is another message, sealed.
    Encrypted,
    /// Human-readable mail with subject and body.
    Email,
    /// Notification that a transaction was addressed to the recipient.
    TransactionNotice,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encrypted => write!(f, "encrypted"),
            Self::Email => write!(f, "email"),
            Self::TransactionNotice => write!(f, "transaction_notice"),
        }
    }
}

// ---------------------------------------------------------------------------
// ServerSet
// ---------------------------------------------------------------------------

/// Resolved mail servers: account name → `host:port` endpoint.
pub type ServerSet = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// EmailHeader
// ---------------------------------------------------------------------------

/// Summary of a message: what the inbox shows and the index stores.
///
/// `sender` is a key label resolved by the wallet; it is the literal
/// `"INVALID SIGNATURE"` when signature verification failed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EmailHeader {
    /// Content id of the stored message.
    pub id: MessageId,
    /// Sender label (account name or `"INVALID SIGNATURE"`).
    pub sender: String,
    /// Recipient account name.
    pub recipient: String,
    /// Timestamp of the (plaintext) message.
    pub timestamp: Timestamp,
    /// Subject line; empty when not derivable.
    pub subject: String,
}

// ---------------------------------------------------------------------------
// MailEvent
// ---------------------------------------------------------------------------

/// User-visible notifications emitted by the mail client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MailEvent {
    /// An outgoing message reached at least one server.
    ///
    /// `id` is the stable handle the caller holds; `final_id` is the
    /// post-mining content id the archive is keyed by.
    MessageAccepted {
        /// Stable id assigned at submission.
        id: MessageId,
        /// Final content id after mining.
        final_id: MessageId,
    },
    /// New inbox entries appeared during a mail check.
    NewMail {
        /// Number of genuinely new messages.
        count: u32,
    },
    /// A transaction notice was received and scanned.
    TransactionReceived {
        /// Id of the noticed transaction.
        txid: String,
        /// Sender label of the notice.
        sender: String,
    },
}

// ---------------------------------------------------------------------------
// MailError
// ---------------------------------------------------------------------------

/// Central error type for the chainmail client.
///
/// All crates in the workspace convert their internal errors into
/// variants of this enum, ensuring a unified error handling surface.
#[derive(Debug, Error)]
pub enum MailError {
    /// A storage or database operation failed.
    #[error("storage error: {reason}")]
    StorageError {
        /// Human-readable description of the storage failure.
        reason: String,
    },

    /// A TCP or I/O operation failed.
    #[error("network error: {reason}")]
    NetworkError {
        /// Human-readable description of the network failure.
        reason: String,
    },

    /// A wire or serialization error (malformed request/response/record).
    #[error("protocol error: {reason}")]
    ProtocolError {
        /// Human-readable description of the protocol failure.
        reason: String,
    },

    /// A mail server actively rejected a request.
    ///
    /// The reason carries the server's error text; the transmitter
    /// matches it against the known sentinel strings.
    #[error("server error: {reason}")]
    ServerError {
        /// Error text returned by the server.
        reason: String,
    },

    /// Account directory lookup or parsing failed.
    #[error("directory error: {reason}")]
    DirectoryError {
        /// Human-readable description of the directory failure.
        reason: String,
    },

    /// The wallet refused an operation (locked, unknown key, bad decrypt).
    #[error("wallet error: {reason}")]
    WalletError {
        /// Human-readable description of the wallet failure.
        reason: String,
    },

    /// A requested record does not exist.
    #[error("not found: {reason}")]
    NotFound {
        /// What was looked up and missed.
        reason: String,
    },

    /// An operation's precondition was violated; no state was changed.
    #[error("precondition failed: {reason}")]
    PreconditionFailed {
        /// Which precondition failed.
        reason: String,
    },

    /// A configuration value is invalid or missing.
    #[error("config error: {reason}")]
    ConfigError {
        /// Human-readable description of the configuration problem.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Result alias
// ---------------------------------------------------------------------------

/// Convenience result type using [`MailError`].
pub type Result<T> = std::result::Result<T, MailError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
