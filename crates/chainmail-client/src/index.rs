//! In-memory multi-key index over the archive.
//!
//! The index is rebuilt from the archive on every open, in a
//! background task, so the on-disk format stays minimal and the index
//! cannot diverge. Four access patterns are served:
//!
//! 1. Point lookup by id (unique).
//! 2. Ordered range by `(sender, recipient, timestamp)` — a partial
//!    prefix yields "all messages from X" and "from X to Y".
//! 3. Ordered range by `(recipient, timestamp)`.
//! 4. Ordered by `timestamp`.
//!
//! Queries issued while the build is still running return `None` so
//! the caller can surface an advisory instead of blocking or
//! streaming partial results. One coarse lock guards the maps; the
//! builder, the fetcher, and finalize all insert through it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chainmail_storage::ArchiveRecord;
use chainmail_types::{EmailHeader, MessageId, Timestamp};

use crate::core::lock;

// ---------------------------------------------------------------------------
// IndexRecord
// ---------------------------------------------------------------------------

/// One secondary-index row.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct IndexRecord {
    pub id: MessageId,
    pub sender: String,
    pub recipient: String,
    pub timestamp: Timestamp,
}

impl From<&EmailHeader> for IndexRecord {
    fn from(header: &EmailHeader) -> Self {
        Self {
            id: header.id,
            sender: header.sender.clone(),
            recipient: header.recipient.clone(),
            timestamp: header.timestamp,
        }
    }
}

impl From<&ArchiveRecord> for IndexRecord {
    fn from(row: &ArchiveRecord) -> Self {
        Self {
            id: row.id,
            sender: row.sender.clone(),
            recipient: row.recipient.clone(),
            timestamp: row.content.timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// MailIndex
// ---------------------------------------------------------------------------

/// The four underlying maps. Insertion is idempotent per id.
#[derive(Default)]
pub(crate) struct MailIndex {
    by_id: BTreeMap<MessageId, IndexRecord>,
    by_sender: BTreeSet<(String, String, Timestamp, MessageId)>,
    by_recipient: BTreeSet<(String, Timestamp, MessageId)>,
    by_time: BTreeSet<(Timestamp, MessageId)>,
}

impl MailIndex {
    pub(crate) fn insert(&mut self, record: IndexRecord) {
        if let Some(existing) = self.by_id.get(&record.id) {
            if *existing == record {
                return;
            }
            // Same id, different row: drop the stale entries first.
            let stale = existing.clone();
            self.by_sender.remove(&(
                stale.sender.clone(),
                stale.recipient.clone(),
                stale.timestamp,
                stale.id,
            ));
            self.by_recipient
                .remove(&(stale.recipient, stale.timestamp, stale.id));
            self.by_time.remove(&(stale.timestamp, stale.id));
        }

        self.by_sender.insert((
            record.sender.clone(),
            record.recipient.clone(),
            record.timestamp,
            record.id,
        ));
        self.by_recipient
            .insert((record.recipient.clone(), record.timestamp, record.id));
        self.by_time.insert((record.timestamp, record.id));
        self.by_id.insert(record.id, record);
    }

    pub(crate) fn get(&self, id: MessageId) -> Option<&IndexRecord> {
        self.by_id.get(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    /// All ids from `sender`, any recipient, timestamp ascending.
    pub(crate) fn ids_by_sender(&self, sender: &str) -> Vec<MessageId> {
        let lower = (
            sender.to_string(),
            String::new(),
            Timestamp::MIN,
            MessageId::ZERO,
        );
        self.by_sender
            .range(lower..)
            .take_while(|(s, _, _, _)| s == sender)
            .map(|(_, _, _, id)| *id)
            .collect()
    }

    /// All ids from `sender` to `recipient`, timestamp ascending.
    pub(crate) fn ids_from_to(&self, sender: &str, recipient: &str) -> Vec<MessageId> {
        let lower = (
            sender.to_string(),
            recipient.to_string(),
            Timestamp::MIN,
            MessageId::ZERO,
        );
        self.by_sender
            .range(lower..)
            .take_while(|(s, r, _, _)| s == sender && r == recipient)
            .map(|(_, _, _, id)| *id)
            .collect()
    }

    /// All ids to `recipient`, any sender, timestamp ascending.
    pub(crate) fn ids_by_recipient(&self, recipient: &str) -> Vec<MessageId> {
        let lower = (recipient.to_string(), Timestamp::MIN, MessageId::ZERO);
        self.by_recipient
            .range(lower..)
            .take_while(|(r, _, _)| r == recipient)
            .map(|(_, _, id)| *id)
            .collect()
    }

    /// All ids, timestamp ascending.
    pub(crate) fn ids_by_time(&self) -> Vec<MessageId> {
        self.by_time.iter().map(|(_, id)| *id).collect()
    }
}

// ---------------------------------------------------------------------------
// SharedIndex
// ---------------------------------------------------------------------------

/// The index behind its coarse lock, plus the build-in-progress flag.
pub(crate) struct SharedIndex {
    inner: Mutex<MailIndex>,
    building: AtomicBool,
}

impl SharedIndex {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(MailIndex::default()),
            building: AtomicBool::new(false),
        }
    }

    pub(crate) fn begin_build(&self) {
        self.building.store(true, Ordering::SeqCst);
    }

    pub(crate) fn finish_build(&self) {
        self.building.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_building(&self) -> bool {
        self.building.load(Ordering::SeqCst)
    }

    pub(crate) fn insert(&self, record: IndexRecord) {
        lock(&self.inner).insert(record);
    }

    /// Number of indexed rows, regardless of build state.
    pub(crate) fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    /// Runs a query, or returns `None` while the build is in
    /// progress.
    pub(crate) fn query<T>(&self, f: impl FnOnce(&MailIndex) -> T) -> Option<T> {
        if self.is_building() {
            return None;
        }
        let guard = lock(&self.inner);
        Some(f(&guard))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
