//! Recipient → mail server resolution via the on-chain account
//! directory.
//!
//! Users publish a `mail_servers` array of server account names in
//! their account's public data; server accounts publish a
//! `mail_server_endpoint` (`host:port`). Anything missing or
//! malformed falls back to the configured default set — an
//! unregistered recipient can still be reached through defaults, and
//! a recipient with no resolvable servers at all is a send-time
//! failure the caller handles.

use std::collections::BTreeSet;
use std::sync::Arc;

use chainmail_types::{PublicKey, ServerSet, Timestamp};

/// A chain account record, as the directory exposes it.
#[derive(Clone, Debug)]
pub struct AccountRecord {
    /// Registered account name.
    pub name: String,
    /// Owner key: mail is addressed to it.
    pub owner_key: PublicKey,
    /// Active key: mail is encrypted with it.
    pub active_key: PublicKey,
    /// Registration time.
    pub registration_date: Timestamp,
    /// Free-form published data; the directory fields live here.
    pub public_data: serde_json::Value,
}

/// Contract with the chain database: account lookup by name.
pub trait ChainDirectory: Send + Sync {
    /// Returns the account record registered under `name`, if any.
    fn get_account(&self, name: &str) -> Option<AccountRecord>;
}

// ---------------------------------------------------------------------------
// DirectoryResolver
// ---------------------------------------------------------------------------

/// Resolves recipients to sets of reachable mail servers.
pub struct DirectoryResolver {
    chain: Arc<dyn ChainDirectory>,
    default_servers: Vec<String>,
}

impl DirectoryResolver {
    /// Creates a resolver over a chain directory with a default
    /// server set.
    pub fn new(chain: Arc<dyn ChainDirectory>, default_servers: Vec<String>) -> Self {
        Self {
            chain,
            default_servers,
        }
    }

    /// Looks up an account record directly.
    pub fn account(&self, name: &str) -> Option<AccountRecord> {
        self.chain.get_account(name)
    }

    /// Returns the server account names preferred by `recipient`.
    ///
    /// Falls back to the default set when the recipient is not
    /// registered or has not published a parseable `mail_servers`
    /// field.
    pub fn server_names_for(&self, recipient: &str) -> BTreeSet<String> {
        let Some(account) = self.chain.get_account(recipient) else {
            return self.default_set();
        };

        match account.public_data.get("mail_servers") {
            Some(value) => match serde_json::from_value::<Vec<String>>(value.clone()) {
                Ok(names) => names.into_iter().collect(),
                Err(e) => {
                    tracing::error!(
                        recipient,
                        error = %e,
                        "malformed mail_servers in account public data, using defaults",
                    );
                    self.default_set()
                }
            },
            None => {
                tracing::info!(
                    recipient,
                    "recipient has not published preferred mail servers, using defaults",
                );
                self.default_set()
            }
        }
    }

    /// Resolves `recipient` to `(name, endpoint)` pairs.
    ///
    /// Server names that do not resolve to an account with a
    /// published endpoint are skipped. An empty result is legal; the
    /// caller treats it as a send-time failure.
    pub fn servers_for(&self, recipient: &str) -> ServerSet {
        let mut servers = ServerSet::new();
        for name in self.server_names_for(recipient) {
            let Some(account) = self.chain.get_account(&name) else {
                tracing::warn!(server = %name, "mail server account is not registered, skipping");
                continue;
            };
            match account
                .public_data
                .get("mail_server_endpoint")
                .and_then(|value| value.as_str())
            {
                Some(endpoint) => {
                    servers.insert(name, endpoint.to_string());
                }
                None => {
                    tracing::warn!(
                        server = %name,
                        "mail server account has no published endpoint, skipping",
                    );
                }
            }
        }
        servers
    }

    fn default_set(&self) -> BTreeSet<String> {
        self.default_servers.iter().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
