//! Inbound fetch loop.
//!
//! For every local wallet account, every server in its published set
//! is polled: inventory pages since the last checkpoint, then each
//! listed message is downloaded, opened by the wallet, classified,
//! and merged into the archive. Dedup across servers is keyed on the
//! message id: copies only extend the record's server set, and mail
//! we sent ourselves flips from accepted to received exactly once.
//!
//! Downloading is deliberately naive: a message held by three servers
//! is downloaded three times, and each page is walked synchronously
//! per server. A 60-second timeout bounds each account's pass.
//!
//! The per-account checkpoint `last_fetch/<name>` advances only when
//! every server sub-task completed cleanly; a partial pass would
//! otherwise silently skip whatever the failed server still holds.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::AbortHandle;

use chainmail_protocol::message::Message;
use chainmail_protocol::wire::MailServerClient;
use chainmail_storage::ArchiveRecord;
use chainmail_types::{
    EmailHeader, MailEvent, MailStatus, MessageKind, PublicKey, Result, Timestamp,
};

use crate::core::{lock, ClientCore};
use crate::index::IndexRecord;
use crate::wallet::WalletAccount;

/// Sender label substituted when signature verification fails.
const INVALID_SIGNATURE: &str = "INVALID SIGNATURE";

/// Polls all servers of all local accounts for new mail.
///
/// Returns the number of genuinely new inbox entries. With
/// `include_historical` the scan starts at each account's
/// registration date instead of its stored checkpoint.
pub(crate) async fn check_new_mail(
    core: &Arc<ClientCore>,
    include_historical: bool,
) -> Result<u32> {
    let accounts = core.wallet.my_accounts();
    let new_messages = Arc::new(AtomicU32::new(0));

    for account in accounts {
        let servers = core.resolver.servers_for(&account.name);
        let check_time = Timestamp::now();

        let mut last_check = account.registration_date;
        if !include_historical {
            if let Some(at) = core.db.properties().last_fetch(&account.name)? {
                last_check = at;
            }
        }

        let pass_ok = Arc::new(AtomicBool::new(true));
        let mut tasks = Vec::with_capacity(servers.len());
        let mut aborts: Vec<AbortHandle> = Vec::with_capacity(servers.len());
        for (name, endpoint) in servers {
            let task = tokio::spawn(fetch_from_server(
                Arc::clone(core),
                account.clone(),
                name,
                endpoint,
                last_check,
                Arc::clone(&new_messages),
                Arc::clone(&pass_ok),
            ));
            aborts.push(task.abort_handle());
            tasks.push(task);
        }

        let timeout_task = tokio::spawn({
            let pass_ok = Arc::clone(&pass_ok);
            let aborts = aborts.clone();
            let timeout_secs = core.config.fetch_timeout_secs;
            async move {
                tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
                tracing::error!("timed out fetching new mail");
                pass_ok.store(false, Ordering::Relaxed);
                for handle in &aborts {
                    handle.abort();
                }
            }
        });

        for task in tasks {
            if task.await.is_err() {
                pass_ok.store(false, Ordering::Relaxed);
            }
        }
        timeout_task.abort();

        if pass_ok.load(Ordering::Relaxed) {
            core.db.properties().set_last_fetch(&account.name, check_time)?;
        } else {
            tracing::warn!(
                account = %account.name,
                "fetch pass incomplete, leaving last_fetch unadvanced",
            );
        }
    }

    Ok(new_messages.load(Ordering::Relaxed))
}

/// Fetches everything one server holds for one account.
async fn fetch_from_server(
    core: Arc<ClientCore>,
    account: WalletAccount,
    server_name: String,
    endpoint: String,
    mut since: Timestamp,
    new_messages: Arc<AtomicU32>,
    pass_ok: Arc<AtomicBool>,
) {
    let mut connection = match MailServerClient::connect(&endpoint).await {
        Ok(connection) => connection,
        Err(e) => {
            tracing::error!(server = %server_name, error = %e, "failed to connect to mail server");
            pass_ok.store(false, Ordering::Relaxed);
            return;
        }
    };

    loop {
        let page = match connection
            .fetch_inventory(account.address, since, core.config.max_inventory)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                tracing::error!(server = %server_name, error = %e, "inventory request failed");
                pass_ok.store(false, Ordering::Relaxed);
                return;
            }
        };
        let full_page = page.len() >= core.config.max_inventory;
        let page_start = since;

        for (seen_at, message_id) in page {
            let ciphertext = match connection.fetch_message(message_id).await {
                Ok(message) => message,
                Err(e) => {
                    tracing::error!(
                        server = %server_name,
                        %message_id,
                        error = %e,
                        "message download failed",
                    );
                    pass_ok.store(false, Ordering::Relaxed);
                    return;
                }
            };

            match ingest_message(&core, &account, &server_name, &endpoint, ciphertext) {
                Ok(true) => {
                    new_messages.fetch_add(1, Ordering::Relaxed);
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(%message_id, error = %e, "failed to ingest fetched message");
                    pass_ok.store(false, Ordering::Relaxed);
                }
            }

            since = since.max(seen_at);
        }

        // A short page is end-of-stream. A full page that did not
        // advance the window would repeat forever; bail out instead.
        if !full_page {
            break;
        }
        if since == page_start {
            tracing::warn!(server = %server_name, "inventory window did not advance, stopping");
            break;
        }
    }
}

/// Classifies one downloaded message and merges it into the stores.
///
/// Returns `true` when the message is genuinely new to the user.
fn ingest_message(
    core: &Arc<ClientCore>,
    account: &WalletAccount,
    server_name: &str,
    endpoint: &str,
    ciphertext: Message,
) -> Result<bool> {
    let id = ciphertext.id();
    let plaintext = core.wallet.mail_open_by_address(&account.address, &ciphertext)?;

    let mut header = EmailHeader {
        id,
        sender: String::new(),
        recipient: account.name.clone(),
        timestamp: plaintext.timestamp,
        subject: String::new(),
    };

    match plaintext.kind {
        MessageKind::Email => {
            let email = plaintext.as_email()?;
            header.sender = sender_label(core, &email.from_key);
            header.subject = email.subject;
        }
        MessageKind::TransactionNotice => {
            let notice = plaintext.as_transaction_notice()?;
            header.sender = sender_label(core, &notice.from_key);
            header.subject = "Transaction Notification".into();
            if let Err(e) = core.wallet.scan_transaction(&notice.txid, true) {
                tracing::warn!(txid = %notice.txid, error = %e, "transaction scan failed");
            }
            core.emit(MailEvent::TransactionReceived {
                txid: notice.txid,
                sender: header.sender.clone(),
            });
        }
        MessageKind::Encrypted => {}
    }

    let _guard = lock(&core.ingest_lock);

    let mut new_mail = false;
    let mut row = match core.db.archive().get_optional(id)? {
        Some(mut existing) => {
            if existing.status == MailStatus::Accepted {
                // We sent this message, but it is still newly
                // received mail.
                existing.status = MailStatus::Received;
                new_mail = true;
            }
            existing
        }
        None => {
            new_mail = true;
            ArchiveRecord::received(ciphertext, &header, account.address)
        }
    };
    row.servers.insert(server_name.to_string(), endpoint.to_string());

    core.db.archive().put(id, &row)?;
    core.index.insert(IndexRecord::from(&header));

    if new_mail {
        core.db.inbox().put(id, &header)?;
    }
    Ok(new_mail)
}

fn sender_label(core: &Arc<ClientCore>, key: &PublicKey) -> String {
    core.wallet
        .key_label(key)
        .unwrap_or_else(|_| INVALID_SIGNATURE.to_string())
}
