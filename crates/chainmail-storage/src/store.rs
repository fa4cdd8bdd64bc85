//! Generic typed sled store keyed by message id.
//!
//! [`TypedStore<T>`] wraps one sled database: values are CBOR, keys
//! are the raw 20 bytes of a [`MessageId`] (sled's lexicographic key
//! order therefore matches numeric id order, giving an ordered
//! forward cursor for free). Every write flushes before returning.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use chainmail_types::{MailError, MessageId, Result};

// ---------------------------------------------------------------------------
// CBOR helpers
// ---------------------------------------------------------------------------

pub(crate) fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| MailError::StorageError {
        reason: format!("failed to encode stored value: {e}"),
    })?;
    Ok(buf)
}

pub(crate) fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::de::from_reader(bytes).map_err(|e| MailError::StorageError {
        reason: format!("failed to decode stored value: {e}"),
    })
}

// ---------------------------------------------------------------------------
// TypedStore
// ---------------------------------------------------------------------------

/// One sled database holding CBOR values of a single type, keyed by
/// message id.
pub struct TypedStore<T> {
    db: sled::Db,
    _marker: PhantomData<T>,
}

impl<T> TypedStore<T>
where
    T: Serialize + DeserializeOwned,
{
    pub(crate) fn new(db: sled::Db) -> Self {
        Self {
            db,
            _marker: PhantomData,
        }
    }

    /// Retrieves a value, failing if the key is absent.
    ///
    /// # Errors
    ///
    /// [`MailError::NotFound`] if the id has no entry;
    /// [`MailError::StorageError`] on database or decode failure.
    pub fn get(&self, id: MessageId) -> Result<T> {
        self.get_optional(id)?.ok_or_else(|| MailError::NotFound {
            reason: format!("message {id} not found"),
        })
    }

    /// Retrieves a value, or `None` if the key is absent.
    pub fn get_optional(&self, id: MessageId) -> Result<Option<T>> {
        let raw = self
            .db
            .get(id.as_bytes())
            .map_err(|e| MailError::StorageError {
                reason: format!("sled get failed: {e}"),
            })?;
        match raw {
            None => Ok(None),
            Some(bytes) => Ok(Some(decode_value(&bytes)?)),
        }
    }

    /// Stores a value durably: the write is flushed before returning.
    pub fn put(&self, id: MessageId, value: &T) -> Result<()> {
        let encoded = encode_value(value)?;
        self.db
            .insert(id.as_bytes(), encoded)
            .map_err(|e| MailError::StorageError {
                reason: format!("sled insert failed: {e}"),
            })?;
        self.flush()
    }

    /// Removes a key. Returns `true` if it existed.
    pub fn delete(&self, id: MessageId) -> Result<bool> {
        let prev = self
            .db
            .remove(id.as_bytes())
            .map_err(|e| MailError::StorageError {
                reason: format!("sled remove failed: {e}"),
            })?;
        self.flush()?;
        Ok(prev.is_some())
    }

    /// Ordered forward cursor over all entries, ascending by id.
    pub fn iter(&self) -> impl Iterator<Item = Result<(MessageId, T)>> + '_ {
        self.db.iter().map(|item| {
            let (key, value) = item.map_err(|e| MailError::StorageError {
                reason: format!("sled iter failed: {e}"),
            })?;
            if key.len() != MessageId::LEN {
                return Err(MailError::StorageError {
                    reason: format!("unexpected key length {} in store", key.len()),
                });
            }
            let mut id = [0u8; MessageId::LEN];
            id.copy_from_slice(&key);
            Ok((MessageId::new(id), decode_value(&value)?))
        })
    }

    fn flush(&self) -> Result<()> {
        self.db.flush().map_err(|e| MailError::StorageError {
            reason: format!("sled flush failed: {e}"),
        })?;
        Ok(())
    }
}
