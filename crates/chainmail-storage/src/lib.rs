//! Persistent mail stores.
//!
//! Four keyed stores live under the data root, one sled database per
//! sub-directory:
//!
//! - `archive/` — durable sent and received mail, keyed by final
//!   content id.
//! - `processing/` — in-flight outgoing mail, keyed by the stable id
//!   assigned at submission.
//! - `inbox/` — headers of unread received mail.
//! - `properties/` — string-keyed client metadata (`version`,
//!   `last_fetch/<account>`).
//!
//! Every write is flushed before the call returns, so the pipeline can
//! resume from disk alone after a crash.

pub mod engine;
pub mod records;
pub mod store;

pub use engine::{MailDb, DATABASE_VERSION};
pub use records::{ArchiveRecord, ProcessingRecord};
