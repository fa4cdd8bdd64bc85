//! Serialized proof-of-work miner.
//!
//! One worker drains the FIFO of message ids, so no two messages mine
//! concurrently. Mining runs in bounded slices (default one second)
//! on the blocking pool: each slice increments the nonce until the
//! content id drops under the target, the slice expires, or shutdown
//! is flagged. Between slices the supervisor refreshes the content
//! timestamp and persists the record — that is what keeps a slow
//! mine from tripping the servers' freshness rejection — and observes
//! user cancellation.
//!
//! The slicing is a contract, not an optimization: an unbounded mine
//! loop would make cancellation latency unbounded and pin the
//! timestamp at submission time.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use chainmail_types::{MailError, MailStatus, MessageId, Result, Timestamp};

use crate::core::{lock, ClientCore};

/// Failure reason recorded when the user cancels a message.
pub(crate) const CANCELED_BY_USER: &str = "Canceled by user.";

/// Drains the proof-of-work queue until shutdown.
pub(crate) async fn run_pow_worker(
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

        if let Err(e) = mine_message(&core, id).await {
            tracing::warn!(%id, error = %e, "proof-of-work job failed");
        }
        tokio::task::yield_now().await;
    }
}

/// Mines one message until its content id satisfies the target.
async fn mine_message(core: &Arc<ClientCore>, id: MessageId) -> Result<()> {
    // The cancel lock serializes every check-then-persist section
    // against cancel_message; without it a cancel written between the
    // check and the persist would be silently overwritten.
    let mut record;
    {
        let _guard = lock(&core.cancel_lock);
        record = core.db.processing().get(id)?;

        let canceled = record.status == MailStatus::Canceled;
        if canceled || record.pow_target.is_zero() {
            record.fail(if canceled {
                CANCELED_BY_USER
            } else {
                "No proof of work target. Cannot do proof of work."
            });
            return core.persist(&record);
        }

        record.status = MailStatus::ProofOfWork;
        core.persist(&record)?;
    }

    let slice = Duration::from_millis(core.config.pow_slice_millis);
    let finished = loop {
        if core.shutdown.load(Ordering::Relaxed) {
            // Leave the record in ProofOfWork; it resumes from disk
            // at the next open.
            return Ok(());
        }

        {
            let _guard = lock(&core.cancel_lock);
            if core.db.processing().get(id)?.status == MailStatus::Canceled {
                break false;
            }
            if record.content.id() <= record.pow_target {
                break true;
            }
            record.content.timestamp = Timestamp::now();
            core.persist(&record)?;
        }

        // One bounded slice. The slice owns its working copy of the
        // content and hands it back; the supervisor persists.
        let mut content = record.content.clone();
        let target = record.pow_target;
        let stop = Arc::clone(&core.shutdown);
        record.content = tokio::task::spawn_blocking(move || {
            let deadline = Instant::now() + slice;
            while !stop.load(Ordering::Relaxed)
                && content.id() > target
                && Instant::now() < deadline
            {
                content.nonce = content.nonce.wrapping_add(1);
            }
            content
        })
        .await
        .map_err(|e| MailError::ProtocolError {
            reason: format!("mining slice aborted: {e}"),
        })?;
    };

    if !finished {
        record.fail(CANCELED_BY_USER);
        return core.persist(&record);
    }

    core.persist(&record)?;
    core.schedule_transmit(id);
    Ok(())
}
