//! The mail client facade.
//!
//! [`MailClient::open`] wires the stores, the two serialized queue
//! workers, and the background index build together, re-enters every
//! surviving in-flight message into the pipeline, and returns the
//! handle all mail operations go through.
//!
//! A message id lives in exactly one of processing or archive:
//! processing rows are keyed by the stable id assigned at submission
//! and deleted the moment the archive row (keyed by the final,
//! post-mining content id) is created.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use chainmail_protocol::message::Message;
use chainmail_storage::{MailDb, ProcessingRecord};
use chainmail_types::config::MailConfig;
use chainmail_types::{
    EmailHeader, MailError, MailEvent, MailStatus, MessageId, MessageKind, PublicKey, Result,
    ServerSet,
};

use crate::core::ClientCore;
use crate::directory::{ChainDirectory, DirectoryResolver};
use crate::fetch::check_new_mail;
use crate::index::{IndexRecord, SharedIndex};
use crate::outgoing::{dispatch_record, header_for_processing, process_outgoing_mail};
use crate::pow::run_pow_worker;
use crate::transmit::run_transmit_worker;
use crate::wallet::Wallet;

// ---------------------------------------------------------------------------
// EmailRecord
// ---------------------------------------------------------------------------

/// A full message as returned by [`MailClient::get_message`]:
/// header summary, decrypted content, and delivery metadata.
#[derive(Clone, Debug)]
pub struct EmailRecord {
    /// Header summary.
    pub header: EmailHeader,
    /// Pipeline or archive status.
    pub status: MailStatus,
    /// Message content, decrypted when it was sealed.
    pub content: Message,
    /// Servers involved with this message.
    pub servers: ServerSet,
    /// Failure reason, present iff the record failed.
    pub failure_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// MailClient
// ---------------------------------------------------------------------------

/// The mail client: owns the stores, the pipeline workers, and the
/// in-memory index.
pub struct MailClient {
    core: Arc<ClientCore>,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    index_task: Option<JoinHandle<()>>,
    events_rx: Option<mpsc::UnboundedReceiver<MailEvent>>,
}

impl MailClient {
    /// Opens the mail client over a data directory.
    ///
    /// Spawns the proof-of-work and transmit workers, places every
    /// surviving processing record back on the pipeline at its stored
    /// status, and starts the background archive index build.
    ///
    /// # Errors
    ///
    /// - [`MailError::ConfigError`] for an invalid configuration.
    /// - [`MailError::StorageError`] if the stores cannot be opened or
    ///   carry an unknown database version.
    pub async fn open(
        data_dir: &Path,
        config: MailConfig,
        wallet: Arc<dyn Wallet>,
        chain: Arc<dyn ChainDirectory>,
    ) -> Result<Self> {
        config.validate()?;
        let db = MailDb::open(data_dir)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (pow_tx, pow_rx) = mpsc::unbounded_channel();
        let (transmit_tx, transmit_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let resolver =
            DirectoryResolver::new(Arc::clone(&chain), config.default_mail_servers.clone());
        let core = Arc::new(ClientCore {
            config,
            wallet,
            chain,
            resolver,
            db,
            index: SharedIndex::new(),
            events: events_tx,
            pow_tx,
            transmit_tx,
            ingest_lock: std::sync::Mutex::new(()),
            cancel_lock: std::sync::Mutex::new(()),
            shutdown: Arc::new(AtomicBool::new(false)),
        });

        let workers = vec![
            tokio::spawn(run_pow_worker(
                Arc::clone(&core),
                pow_rx,
                shutdown_rx.clone(),
            )),
            tokio::spawn(run_transmit_worker(
                Arc::clone(&core),
                transmit_rx,
                shutdown_rx,
            )),
        ];

        // Place all in-flight messages back in their place on the
        // pipeline.
        let mut surviving = Vec::new();
        for item in core.db.processing().iter() {
            match item {
                Ok((_, record)) => surviving.push(record),
                Err(e) => tracing::warn!(error = %e, "skipping unreadable processing record"),
            }
        }
        for record in surviving {
            let id = record.id;
            if let Err(e) = dispatch_record(&core, record) {
                tracing::warn!(%id, error = %e, "failed to re-enter message into pipeline");
            }
        }

        // Build the archive index in the background.
        core.index.begin_build();
        let index_task = tokio::task::spawn_blocking({
            let core = Arc::clone(&core);
            move || build_index(&core)
        });

        Ok(Self {
            core,
            shutdown_tx,
            workers,
            index_task: Some(index_task),
            events_rx: Some(events_rx),
        })
    }

    /// Takes the notification receiver. Subsequent calls return
    /// `None`.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<MailEvent>> {
        self.events_rx.take()
    }

    /// Signals all workers to stop and waits for them.
    ///
    /// A message caught mid-mining stays in the processing store at
    /// its persisted status and resumes at the next open.
    pub async fn shutdown(&mut self) {
        self.core.shutdown.store(true, Ordering::Relaxed);
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
        if let Some(task) = self.index_task.take() {
            let _ = task.await;
        }
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Composes, seals, and submits an email. Returns the stable id
    /// the caller can use to watch, cancel, or retry the message.
    ///
    /// # Errors
    ///
    /// - [`MailError::PreconditionFailed`] if the wallet is not open
    ///   and unlocked.
    /// - [`MailError::NotFound`] if the recipient is not registered
    ///   on chain.
    pub fn send_email(
        &self,
        from: &str,
        to: &str,
        subject: &str,
        body: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId> {
        if !self.core.wallet.is_open() {
            return Err(MailError::PreconditionFailed {
                reason: "wallet is not open".into(),
            });
        }
        if !self.core.wallet.is_unlocked() {
            return Err(MailError::PreconditionFailed {
                reason: "wallet is locked".into(),
            });
        }
        let recipient = self.core.chain.get_account(to).ok_or_else(|| MailError::NotFound {
            reason: format!("Could not find recipient account: {to}"),
        })?;

        // All mail is addressed to the owner key, but encrypted with
        // the active key.
        let mut plaintext = self.core.wallet.mail_create(from, subject, body, reply_to)?;
        plaintext.recipient = recipient.owner_key;
        let mut ciphertext = self
            .core
            .wallet
            .mail_encrypt(&recipient.active_key, &plaintext)?;
        ciphertext.recipient = recipient.owner_key;

        let record = ProcessingRecord::new(from, to, recipient.owner_key, ciphertext);
        let id = record.id;
        process_outgoing_mail(&self.core, record)?;
        Ok(id)
    }

    /// Submits an already-sealed message. Returns the stable id.
    ///
    /// # Errors
    ///
    /// [`MailError::PreconditionFailed`] if the message is not of
    /// kind `Encrypted` — plaintext is never transmitted.
    pub fn send_encrypted_message(
        &self,
        mut ciphertext: Message,
        from: &str,
        to: &str,
        recipient_key: PublicKey,
    ) -> Result<MessageId> {
        if ciphertext.kind != MessageKind::Encrypted {
            return Err(MailError::PreconditionFailed {
                reason: "Refusing to send plaintext message".into(),
            });
        }
        ciphertext.recipient = recipient_key;

        let record = ProcessingRecord::new(from, to, recipient_key, ciphertext);
        let id = record.id;
        process_outgoing_mail(&self.core, record)?;
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Pipeline control
    // -----------------------------------------------------------------------

    /// Re-runs a failed message from the start of the pipeline.
    ///
    /// # Errors
    ///
    /// - [`MailError::NotFound`] if the id has no processing record.
    /// - [`MailError::PreconditionFailed`] unless the record failed.
    pub fn retry_message(&self, id: MessageId) -> Result<()> {
        let mut record = self.core.db.processing().get(id)?;
        if record.status != MailStatus::Failed {
            return Err(MailError::PreconditionFailed {
                reason: "Message has not failed to send; cannot retry sending.".into(),
            });
        }
        record.status = MailStatus::Submitted;
        record.failure_reason.clear();
        dispatch_record(&self.core, record)
    }

    /// Flags an in-flight message as canceled. The pipeline observes
    /// the flag at its next checkpoint.
    ///
    /// # Errors
    ///
    /// - [`MailError::NotFound`] if the id has no processing record.
    /// - [`MailError::PreconditionFailed`] once the message has
    ///   reached transmission.
    pub fn cancel_message(&self, id: MessageId) -> Result<()> {
        let _guard = crate::core::lock(&self.core.cancel_lock);
        let mut record = self.core.db.processing().get(id)?;
        if record.status > MailStatus::ProofOfWork {
            return Err(MailError::PreconditionFailed {
                reason: "Cannot cancel message once it has been submitted to servers.".into(),
            });
        }
        record.status = MailStatus::Canceled;
        self.core.persist(&record)
    }

    /// Removes a message: from processing (failed records only), or
    /// failing that, from the archive.
    pub fn remove_message(&self, id: MessageId) -> Result<()> {
        if let Some(record) = self.core.db.processing().get_optional(id)? {
            if record.status != MailStatus::Failed {
                return Err(MailError::PreconditionFailed {
                    reason: "Cannot remove message during processing.".into(),
                });
            }
            self.core.db.processing().delete(id)?;
            return Ok(());
        }
        self.core.db.archive().delete(id)?;
        Ok(())
    }

    /// Marks an inbox message as read: removes it from the inbox
    /// only. The archive copy stays.
    pub fn archive_message(&self, id: MessageId) -> Result<()> {
        self.core.db.inbox().delete(id)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Fetching
    // -----------------------------------------------------------------------

    /// Polls all servers of all local accounts for new mail.
    ///
    /// Returns the number of genuinely new messages and fires the
    /// new-mail notification when positive. With `include_historical`
    /// the scan restarts at each account's registration date.
    pub async fn check_new_messages(&self, include_historical: bool) -> Result<u32> {
        let count = check_new_mail(&self.core, include_historical).await?;
        if count > 0 {
            self.core.emit(MailEvent::NewMail { count });
        }
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Loads one message, trying processing first, then the archive.
    /// Sealed content is decrypted before return.
    ///
    /// # Errors
    ///
    /// [`MailError::NotFound`] if neither store has the id.
    pub fn get_message(&self, id: MessageId) -> Result<EmailRecord> {
        if let Some(record) = self.core.db.processing().get_optional(id)? {
            let mut content = record.content.clone();
            if content.kind == MessageKind::Encrypted {
                content = self
                    .core
                    .wallet
                    .mail_open_by_key(&record.recipient_key, &content)?;
            }
            let failure_reason = (record.status == MailStatus::Failed)
                .then(|| record.failure_reason.clone());
            let mut decrypted = record.clone();
            decrypted.content = content.clone();
            return Ok(EmailRecord {
                header: header_for_processing(&decrypted),
                status: record.status,
                content,
                servers: record.servers,
                failure_reason,
            });
        }

        if let Some(row) = self.core.db.archive().get_optional(id)? {
            let mut content = row.content.clone();
            if content.kind == MessageKind::Encrypted {
                content = self
                    .core
                    .wallet
                    .mail_open_by_address(&row.recipient_address, &content)?;
            }
            let subject = if content.kind == MessageKind::Email {
                content.as_email().map(|email| email.subject).unwrap_or_default()
            } else {
                String::new()
            };
            return Ok(EmailRecord {
                header: EmailHeader {
                    id: row.id,
                    sender: row.sender.clone(),
                    recipient: row.recipient.clone(),
                    timestamp: content.timestamp,
                    subject,
                },
                status: row.status,
                content,
                servers: row.servers,
                failure_reason: None,
            });
        }

        Err(MailError::NotFound {
            reason: format!("Message {id} not found."),
        })
    }

    /// Returns the unread inbox, oldest first.
    pub fn get_inbox(&self) -> Result<Vec<EmailHeader>> {
        let mut inbox = Vec::new();
        for item in self.core.db.inbox().iter() {
            let (_, header) = item?;
            inbox.push(header);
        }
        inbox.sort_by_key(|header| header.timestamp);
        Ok(inbox)
    }

    /// Lists `(status, id)` for every in-flight message, grouped by
    /// status.
    pub fn get_processing_messages(&self) -> Result<Vec<(MailStatus, MessageId)>> {
        self.database_messages(self.core.db.processing().iter().map(|item| {
            item.map(|(_, record)| (record.status, record.id))
        }))
    }

    /// Lists `(status, id)` for every archived message, grouped by
    /// status.
    pub fn get_archive_messages(&self) -> Result<Vec<(MailStatus, MessageId)>> {
        self.database_messages(self.core.db.archive().iter().map(|item| {
            item.map(|(_, row)| (row.status, row.id))
        }))
    }

    /// All messages from `sender`, timestamp ascending.
    pub fn get_messages_by_sender(&self, sender: &str) -> Result<Vec<EmailHeader>> {
        match self.core.index.query(|index| index.ids_by_sender(sender)) {
            Some(ids) => Ok(self.headers_for(ids)),
            None => Ok(self.indexing_advisory()),
        }
    }

    /// All messages to `recipient`, timestamp ascending.
    pub fn get_messages_by_recipient(&self, recipient: &str) -> Result<Vec<EmailHeader>> {
        match self.core.index.query(|index| index.ids_by_recipient(recipient)) {
            Some(ids) => Ok(self.headers_for(ids)),
            None => Ok(self.indexing_advisory()),
        }
    }

    /// All messages from `sender` to `recipient`, timestamp ascending.
    pub fn get_messages_from_to(&self, sender: &str, recipient: &str) -> Result<Vec<EmailHeader>> {
        match self.core.index.query(|index| index.ids_from_to(sender, recipient)) {
            Some(ids) => Ok(self.headers_for(ids)),
            None => Ok(self.indexing_advisory()),
        }
    }

    /// Both directions of a conversation, merged and sorted by
    /// timestamp.
    pub fn get_messages_in_conversation(
        &self,
        account_one: &str,
        account_two: &str,
    ) -> Result<Vec<EmailHeader>> {
        let mut forward = self.get_messages_from_to(account_one, account_two)?;
        let backward = self.get_messages_from_to(account_two, account_one)?;
        forward.extend(backward);
        forward.sort_by_key(|header| header.timestamp);
        Ok(forward)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn database_messages(
        &self,
        entries: impl Iterator<Item = Result<(MailStatus, MessageId)>>,
    ) -> Result<Vec<(MailStatus, MessageId)>> {
        let mut messages = entries.collect::<Result<Vec<_>>>()?;
        messages.sort();
        Ok(messages)
    }

    fn headers_for(&self, ids: Vec<MessageId>) -> Vec<EmailHeader> {
        // Ids whose record has been removed since indexing are
        // skipped; they disappear for good at the next rebuild.
        ids.into_iter()
            .filter_map(|id| self.get_message(id).ok().map(|record| record.header))
            .collect()
    }

    fn indexing_advisory(&self) -> Vec<EmailHeader> {
        tracing::warn!("mail archive is currently indexing, please try again later");
        Vec::new()
    }
}

impl Drop for MailClient {
    fn drop(&mut self) {
        self.core.shutdown.store(true, Ordering::Relaxed);
        let _ = self.shutdown_tx.send(true);
        for worker in &self.workers {
            worker.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Index build
// ---------------------------------------------------------------------------

/// Scans the archive into the in-memory index. Runs on the blocking
/// pool; aborts early on shutdown.
fn build_index(core: &ClientCore) {
    for item in core.db.archive().iter() {
        if core.shutdown.load(Ordering::Relaxed) {
            break;
        }
        match item {
            Ok((_, row)) => core.index.insert(IndexRecord::from(&row)),
            Err(e) => tracing::warn!(error = %e, "skipping unreadable archive record"),
        }
    }
    core.index.finish_build();
    tracing::debug!(records = core.index.len(), "archive indexing complete");
}
