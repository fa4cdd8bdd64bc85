//! Stored record shapes for in-flight and archived mail.

use serde::{Deserialize, Serialize};

use chainmail_protocol::hash::address_of_key;
use chainmail_protocol::message::Message;
use chainmail_types::{
    Address, EmailHeader, MailStatus, MessageId, PublicKey, ServerSet,
};

// ---------------------------------------------------------------------------
// ProcessingRecord
// ---------------------------------------------------------------------------

/// One in-flight outgoing message.
///
/// `id` is the *stable* identifier assigned at submission — the
/// initial content hash, and the handle the caller holds. Mining
/// mutates `content.nonce` and `content.timestamp`, so `content.id()`
/// drifts away from `id`; the archive is later keyed by that final
/// value while this record stays keyed by the stable one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessingRecord {
    /// Stable id: the content hash at submission time.
    pub id: MessageId,
    /// Pipeline status.
    pub status: MailStatus,
    /// Sender account name.
    pub sender: String,
    /// Recipient account name.
    pub recipient: String,
    /// The recipient's owner public key.
    pub recipient_key: PublicKey,
    /// The (usually encrypted) message being delivered.
    pub content: Message,
    /// Resolved mail servers for the recipient.
    pub servers: ServerSet,
    /// Proof-of-work ceiling; the message is valid once
    /// `content.id() <= pow_target`.
    pub pow_target: MessageId,
    /// Why the record failed; empty unless `status == Failed`.
    pub failure_reason: String,
}

impl ProcessingRecord {
    /// Creates a fresh record in `Submitted` state. The stable id is
    /// the content hash at this instant.
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        recipient_key: PublicKey,
        content: Message,
    ) -> Self {
        Self {
            id: content.id(),
            status: MailStatus::Submitted,
            sender: sender.into(),
            recipient: recipient.into(),
            recipient_key,
            content,
            servers: ServerSet::new(),
            pow_target: MessageId::ZERO,
            failure_reason: String::new(),
        }
    }

    /// Marks the record failed with a human-readable reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = MailStatus::Failed;
        self.failure_reason = reason.into();
    }
}

// ---------------------------------------------------------------------------
// ArchiveRecord
// ---------------------------------------------------------------------------

/// One durably stored message, sent (`Accepted`) or received
/// (`Received`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiveRecord {
    /// Final content id: post-mining for outgoing, the server's id for
    /// incoming.
    pub id: MessageId,
    /// `Accepted` for mail we sent, `Received` for mail we fetched.
    pub status: MailStatus,
    /// Sender account name or label.
    pub sender: String,
    /// Recipient account name.
    pub recipient: String,
    /// Hash of the recipient's owner key.
    pub recipient_address: Address,
    /// The stored message.
    pub content: Message,
    /// Servers known to hold this message.
    pub servers: ServerSet,
}

impl ArchiveRecord {
    /// Builds the archive row for a successfully transmitted record.
    ///
    /// The row is keyed by the final content id; the caller deletes
    /// the processing row under the stable id in the same step.
    pub fn accepted(record: ProcessingRecord) -> Self {
        Self {
            id: record.content.id(),
            status: MailStatus::Accepted,
            sender: record.sender,
            recipient: record.recipient,
            recipient_address: address_of_key(&record.recipient_key),
            content: record.content,
            servers: record.servers,
        }
    }

    /// Builds the archive row for a fetched inbound message.
    pub fn received(content: Message, header: &EmailHeader, recipient_address: Address) -> Self {
        Self {
            id: content.id(),
            status: MailStatus::Received,
            sender: header.sender.clone(),
            recipient: header.recipient.clone(),
            recipient_address,
            content,
            servers: ServerSet::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
