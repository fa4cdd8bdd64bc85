//! Store lifecycle: open, version gate, typed accessors.

use std::path::Path;

use chainmail_types::{EmailHeader, MailError, Result, Timestamp};

use crate::records::{ArchiveRecord, ProcessingRecord};
use crate::store::{decode_value, encode_value, TypedStore};

/// Supported on-disk format version.
pub const DATABASE_VERSION: i64 = 1;

/// Property key holding the format version.
const VERSION_KEY: &str = "version";

/// Property key prefix for per-account fetch checkpoints.
const LAST_FETCH_PREFIX: &str = "last_fetch/";

// ---------------------------------------------------------------------------
// PropertyStore
// ---------------------------------------------------------------------------

/// String-keyed client metadata.
pub struct PropertyStore {
    db: sled::Db,
}

impl PropertyStore {
    /// Reads the stored format version, if any.
    pub fn version(&self) -> Result<Option<i64>> {
        self.get_raw(VERSION_KEY)
    }

    pub(crate) fn set_version(&self, version: i64) -> Result<()> {
        self.put_raw(VERSION_KEY, &version)
    }

    /// Reads the fetch checkpoint for an account.
    pub fn last_fetch(&self, account: &str) -> Result<Option<Timestamp>> {
        self.get_raw(&format!("{LAST_FETCH_PREFIX}{account}"))
    }

    /// Durably records the fetch checkpoint for an account.
    pub fn set_last_fetch(&self, account: &str, at: Timestamp) -> Result<()> {
        self.put_raw(&format!("{LAST_FETCH_PREFIX}{account}"), &at)
    }

    fn get_raw<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw = self.db.get(key).map_err(|e| MailError::StorageError {
            reason: format!("sled get failed: {e}"),
        })?;
        match raw {
            None => Ok(None),
            Some(bytes) => Ok(Some(decode_value(&bytes)?)),
        }
    }

    fn put_raw<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.db
            .insert(key, encode_value(value)?)
            .map_err(|e| MailError::StorageError {
                reason: format!("sled insert failed: {e}"),
            })?;
        self.db.flush().map_err(|e| MailError::StorageError {
            reason: format!("sled flush failed: {e}"),
        })?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MailDb
// ---------------------------------------------------------------------------

/// The four mail stores, opened together under one data root.
///
/// On open, a `version` property is written if absent; an existing
/// property with a different version is fatal — the format is not
/// migrated in place.
pub struct MailDb {
    archive: TypedStore<ArchiveRecord>,
    processing: TypedStore<ProcessingRecord>,
    inbox: TypedStore<EmailHeader>,
    properties: PropertyStore,
}

impl MailDb {
    /// Opens (or creates) all four stores under `data_dir`.
    ///
    /// # Errors
    ///
    /// - [`MailError::StorageError`] if any database cannot be opened
    ///   or the stored version is not [`DATABASE_VERSION`].
    pub fn open(data_dir: &Path) -> Result<Self> {
        let archive = TypedStore::new(open_sled(&data_dir.join("archive"))?);
        let processing = TypedStore::new(open_sled(&data_dir.join("processing"))?);
        let inbox = TypedStore::new(open_sled(&data_dir.join("inbox"))?);
        let properties = PropertyStore {
            db: open_sled(&data_dir.join("properties"))?,
        };

        match properties.version()? {
            None => properties.set_version(DATABASE_VERSION)?,
            Some(version) if version == DATABASE_VERSION => {}
            Some(version) => {
                tracing::error!(
                    supported = DATABASE_VERSION,
                    stored = version,
                    "unable to open mail stores: unknown database version",
                );
                return Err(MailError::StorageError {
                    reason: format!(
                        "mail database is an unknown version: supported {DATABASE_VERSION}, stored {version}"
                    ),
                });
            }
        }

        Ok(Self {
            archive,
            processing,
            inbox,
            properties,
        })
    }

    /// Durable sent and received mail, keyed by final content id.
    pub fn archive(&self) -> &TypedStore<ArchiveRecord> {
        &self.archive
    }

    /// In-flight outgoing mail, keyed by stable id.
    pub fn processing(&self) -> &TypedStore<ProcessingRecord> {
        &self.processing
    }

    /// Headers of unread received mail.
    pub fn inbox(&self) -> &TypedStore<EmailHeader> {
        &self.inbox
    }

    /// Client metadata.
    pub fn properties(&self) -> &PropertyStore {
        &self.properties
    }
}

fn open_sled(path: &Path) -> Result<sled::Db> {
    sled::open(path).map_err(|e| MailError::StorageError {
        reason: format!("failed to open store at {}: {e}", path.display()),
    })
}
