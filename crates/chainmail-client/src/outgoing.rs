//! Outgoing state machine: submission, dispatch, and finalize.
//!
//! Messages go through a pipeline of processing:
//!
//! 1. Resolve the recipient's mail servers.
//! 2. Obtain a proof-of-work target.
//! 3. Mine until the content id satisfies the target.
//! 4. Transmit to all resolved servers.
//! 5. Move the record into the archive.
//!
//! After every mutation the record is written to the processing store
//! before the next step is enqueued, so recovery after a crash can
//! resume from disk alone: [`dispatch_record`] re-enters each
//! surviving record at its stored status on open.

use std::sync::Arc;

use chainmail_storage::{ArchiveRecord, ProcessingRecord};
use chainmail_types::{EmailHeader, MailEvent, MailStatus, MessageId, MessageKind, Result};

use crate::core::ClientCore;
use crate::index::IndexRecord;

/// Starts a freshly submitted record on its journey.
pub(crate) fn process_outgoing_mail(
    core: &Arc<ClientCore>,
    mut record: ProcessingRecord,
) -> Result<()> {
    record.servers = core.resolver.servers_for(&record.recipient);
    core.persist(&record)?;
    assign_pow_target(core, record.id)
}

/// Assigns the proof-of-work target and hands the record to the
/// mining queue. An empty server set is a terminal failure.
pub(crate) fn assign_pow_target(core: &Arc<ClientCore>, id: MessageId) -> Result<()> {
    let mut record = core.db.processing().get(id)?;

    if record.servers.is_empty() {
        record.fail("Could not find mail servers for this recipient.");
        return core.persist(&record);
    }

    // TODO: ask each resolved server for its own PoW requirement and
    // take the minimum instead of the configured network-wide target.
    record.pow_target = core.config.pow_target;
    core.persist(&record)?;

    core.schedule_pow(id);
    Ok(())
}

/// Re-enters a record into the pipeline at its stored status.
///
/// Used on open for every surviving processing record, and by the
/// facade's retry operation after flipping a failed record back to
/// submitted.
pub(crate) fn dispatch_record(core: &Arc<ClientCore>, record: ProcessingRecord) -> Result<()> {
    match record.status {
        MailStatus::Submitted => process_outgoing_mail(core, record),
        MailStatus::ProofOfWork => {
            core.schedule_pow(record.id);
            Ok(())
        }
        MailStatus::Transmitting => {
            core.schedule_transmit(record.id);
            Ok(())
        }
        MailStatus::Accepted => finalize_message(core, record.id),
        _ => Ok(()),
    }
}

/// Moves a successfully transmitted record into the archive.
///
/// The archive row is keyed by the *final* content id (mining mutated
/// the nonce and timestamp since submission); the processing row is
/// deleted under the *stable* id in the same step. The accepted
/// notification reports both.
pub(crate) fn finalize_message(core: &Arc<ClientCore>, stable_id: MessageId) -> Result<()> {
    let mut record = core.db.processing().get(stable_id)?;
    let final_id = record.content.id();
    tracing::info!(
        id = %stable_id,
        final_id = %final_id,
        "message sent successfully",
    );

    record.id = final_id;
    record.status = MailStatus::Accepted;

    let header = header_for_processing(&record);
    core.index.insert(IndexRecord::from(&header));
    core.db.archive().put(final_id, &ArchiveRecord::accepted(record))?;
    core.db.processing().delete(stable_id)?;

    core.emit(MailEvent::MessageAccepted {
        id: stable_id,
        final_id,
    });
    Ok(())
}

/// Builds the header summary of a processing record.
///
/// The subject is only derivable when the content is plaintext email;
/// sealed content yields an empty subject.
pub(crate) fn header_for_processing(record: &ProcessingRecord) -> EmailHeader {
    let subject = if record.content.kind == MessageKind::Email {
        record
            .content
            .as_email()
            .map(|email| email.subject)
            .unwrap_or_default()
    } else {
        String::new()
    };
    EmailHeader {
        id: record.id,
        sender: record.sender.clone(),
        recipient: record.recipient.clone(),
        timestamp: record.content.timestamp,
        subject,
    }
}
