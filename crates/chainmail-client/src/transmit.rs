//! Serialized transmitter with per-message fan-out.
//!
//! One worker drains the FIFO of message ids, so at most one message
//! is transmitting at a time; within one message, delivery fans out
//! to every resolved server in parallel. Sub-tasks share the
//! `successful_servers` set behind a mutex; a timeout task fails the
//! record and aborts the stragglers if nothing succeeded within the
//! deadline.
//!
//! Server rejections are interpreted through the protocol sentinels:
//! an already-stored message counts as delivered, and a stale
//! timestamp sends the record back through proof-of-work with a
//! bumped nonce.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

use chainmail_protocol::wire::{
    MailServerClient, ERR_MESSAGE_ALREADY_STORED, ERR_TIMESTAMP_TOO_OLD,
};
use chainmail_types::{MailError, MailStatus, MessageId, Result, ServerSet};

use crate::core::{lock, ClientCore};
use crate::outgoing::finalize_message;
use crate::pow::CANCELED_BY_USER;

/// Drains the transmit queue until shutdown.
pub(crate) async fn run_transmit_worker(
    core: Arc<ClientCore>,
    mut jobs: mpsc::UnboundedReceiver<MessageId>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let id = tokio::select! {
            _ = shutdown.changed() => break,
            job = jobs.recv() => match job {
                Some(id) => id,
                None => break,
            },
        };

        if let Err(e) = transmit_message(&core, id).await {
            tracing::warn!(%id, error = %e, "transmit job failed");
        }
    }
}

/// Transmits one message to its resolved server set.
async fn transmit_message(core: &Arc<ClientCore>, id: MessageId) -> Result<()> {
    let mut record;
    {
        let _guard = lock(&core.cancel_lock);
        record = core.db.processing().get(id)?;

        // Last cancellation checkpoint: a cancel that landed while
        // the record sat in the queue turns terminal here.
        if record.status == MailStatus::Canceled {
            record.fail(CANCELED_BY_USER);
            return core.persist(&record);
        }
        if record.servers.is_empty() {
            record.fail("No mail servers found when trying to transmit message.");
            return core.persist(&record);
        }
        record.status = MailStatus::Transmitting;
        core.persist(&record)?;
    }

    let successes: Arc<Mutex<ServerSet>> = Arc::new(Mutex::new(ServerSet::new()));
    let mut tasks = Vec::with_capacity(record.servers.len());
    let mut aborts: Vec<AbortHandle> = Vec::with_capacity(record.servers.len());
    for (name, endpoint) in record.servers.clone() {
        let task = tokio::spawn(transmit_to_server(
            Arc::clone(core),
            id,
            name,
            endpoint,
            Arc::clone(&successes),
        ));
        aborts.push(task.abort_handle());
        tasks.push(task);
    }

    let timeout_task = tokio::spawn(transmit_timeout(
        Arc::clone(core),
        id,
        Arc::clone(&successes),
        aborts.clone(),
        core.config.transmit_timeout_secs,
    ));

    let mut failed = false;
    for task in tasks {
        // Aborted sub-tasks resolve to a join error; that is expected.
        let _ = task.await;
        if core.shutdown.load(Ordering::Relaxed) {
            break;
        }
        if core.db.processing().get(id)?.status == MailStatus::Failed {
            failed = true;
            for handle in &aborts {
                handle.abort();
            }
            break;
        }
    }
    timeout_task.abort();

    if failed || core.shutdown.load(Ordering::Relaxed) {
        return Ok(());
    }

    let record = core.db.processing().get(id)?;
    let successes = lock(&successes).clone();
    if !successes.is_empty() {
        let mut record = record;
        record.servers = successes;
        core.persist(&record)?;
        finalize_message(core, id)
    } else if record.status == MailStatus::ProofOfWork {
        // A server rejected the timestamp as stale; the sub-task
        // already reset the record, we re-enter the mining queue.
        core.schedule_pow(id);
        Ok(())
    } else {
        Ok(())
    }
}

/// Delivers the message to one server and verifies the store.
async fn transmit_to_server(
    core: Arc<ClientCore>,
    id: MessageId,
    server_name: String,
    endpoint: String,
    successes: Arc<Mutex<ServerSet>>,
) {
    let mut record = match core.db.processing().get(id) {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!(%id, error = %e, "record vanished before transmit");
            return;
        }
    };

    let mut connection = match MailServerClient::connect(&endpoint).await {
        Ok(connection) => connection,
        Err(e) => {
            // Mark as failed only if no server has succeeded yet; a
            // later success overwrites the status again.
            if lock(&successes).is_empty() {
                record.fail(e.to_string());
                persist_best_effort(&core, &record);
            }
            return;
        }
    };

    match connection.store_message(&record.content).await {
        Ok(()) => {}
        Err(MailError::ServerError { reason }) => {
            if reason == ERR_MESSAGE_ALREADY_STORED {
                // Another client delivered it first; the message is
                // there, which is all we wanted.
                tracing::warn!(%id, server = %server_name, "message already stored on server");
                lock(&successes).insert(server_name, endpoint);
                return;
            }
            if reason == ERR_TIMESTAMP_TOO_OLD {
                record.status = MailStatus::ProofOfWork;
                record.content.nonce = record.content.nonce.wrapping_add(1);
                persist_best_effort(&core, &record);
                return;
            }
            tracing::error!(%id, server = %server_name, error = %reason, "server refused message");
            record.fail(reason);
            persist_best_effort(&core, &record);
            return;
        }
        Err(e) => {
            if lock(&successes).is_empty() {
                record.fail(e.to_string());
                persist_best_effort(&core, &record);
            }
            return;
        }
    }

    // Read the message back to confirm the server stored what we
    // sent.
    match connection.fetch_message(record.content.id()).await {
        Ok(stored) if stored.id() == record.content.id() => {
            lock(&successes).insert(server_name, endpoint);
        }
        Ok(_) => {
            // Only possible on a digest collision.
            tracing::error!(%id, server = %server_name, "server returned a different message on verification");
            record.fail(
                "Message saved to server, but server responded with another message when we requested it.",
            );
            persist_best_effort(&core, &record);
        }
        Err(e) => {
            if lock(&successes).is_empty() {
                record.fail(e.to_string());
                persist_best_effort(&core, &record);
            }
        }
    }
}

/// Fails the record and aborts outstanding sub-tasks once the
/// deadline passes without a success.
async fn transmit_timeout(
    core: Arc<ClientCore>,
    id: MessageId,
    successes: Arc<Mutex<ServerSet>>,
    aborts: Vec<AbortHandle>,
    timeout_secs: u64,
) {
    tokio::time::sleep(Duration::from_secs(timeout_secs)).await;

    // If any server succeeded we take the win. Otherwise fail the
    // record — unless a sub-task already pushed it back in the
    // pipeline (status below Transmitting).
    if lock(&successes).is_empty() {
        match core.db.processing().get_optional(id) {
            Ok(Some(mut record)) if record.status >= MailStatus::Transmitting => {
                tracing::warn!(%id, "timeout when transmitting");
                record.fail("Timed out while transmitting message.");
                persist_best_effort(&core, &record);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(%id, error = %e, "failed to load record at transmit timeout"),
        }
    }

    for handle in &aborts {
        handle.abort();
    }
}

fn persist_best_effort(core: &ClientCore, record: &chainmail_storage::ProcessingRecord) {
    if let Err(e) = core.persist(record) {
        tracing::error!(id = %record.id, error = %e, "failed to persist record");
    }
}
