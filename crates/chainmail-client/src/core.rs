//! Shared state behind the facade and the pipeline workers.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use chainmail_storage::{MailDb, ProcessingRecord};
use chainmail_types::config::MailConfig;
use chainmail_types::{MailEvent, MessageId, Result};

use crate::directory::{ChainDirectory, DirectoryResolver};
use crate::index::SharedIndex;
use crate::wallet::Wallet;

/// Locks a mutex, recovering the guard from a poisoned lock.
///
/// Index rows and server sets stay valid even if a holder panicked,
/// so queries continue instead of propagating the poison.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// State shared by the facade, the two queue workers, the index
/// builder, and every transmit/fetch sub-task.
pub(crate) struct ClientCore {
    pub(crate) config: MailConfig,
    pub(crate) wallet: Arc<dyn Wallet>,
    pub(crate) chain: Arc<dyn ChainDirectory>,
    pub(crate) resolver: DirectoryResolver,
    pub(crate) db: MailDb,
    pub(crate) index: SharedIndex,
    pub(crate) events: mpsc::UnboundedSender<MailEvent>,
    pub(crate) pow_tx: mpsc::UnboundedSender<MessageId>,
    pub(crate) transmit_tx: mpsc::UnboundedSender<MessageId>,
    /// Serializes the check-and-merge step of message ingestion.
    /// Two servers delivering the same message concurrently must
    /// resolve to exactly one inbox entry.
    pub(crate) ingest_lock: Mutex<()>,
    /// Serializes cancel against the pipeline's check-then-persist
    /// sections, so a cancel flag can never be overwritten by a
    /// timestamp refresh or a status advance.
    pub(crate) cancel_lock: Mutex<()>,
    /// Set once at shutdown; mining slices and the index builder poll
    /// it so cancellation latency stays bounded.
    pub(crate) shutdown: Arc<AtomicBool>,
}

impl ClientCore {
    /// Enqueues a message on the serialized proof-of-work queue.
    pub(crate) fn schedule_pow(&self, id: MessageId) {
        if self.pow_tx.send(id).is_err() {
            tracing::warn!(%id, "proof-of-work queue is closed, dropping job");
        }
    }

    /// Enqueues a message on the serialized transmit queue.
    pub(crate) fn schedule_transmit(&self, id: MessageId) {
        if self.transmit_tx.send(id).is_err() {
            tracing::warn!(%id, "transmit queue is closed, dropping job");
        }
    }

    /// Durably writes a processing record under its stable id.
    pub(crate) fn persist(&self, record: &ProcessingRecord) -> Result<()> {
        self.db.processing().put(record.id, record)
    }

    /// Emits a user-visible notification.
    pub(crate) fn emit(&self, event: MailEvent) {
        let _ = self.events.send(event);
    }
}
