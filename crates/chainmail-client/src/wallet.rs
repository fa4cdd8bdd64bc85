//! Contract with the cryptographic wallet.
//!
//! The pipeline never touches key material: the embedding shell's
//! wallet creates, seals, and opens messages, labels keys, and scans
//! noticed transactions. This trait pins down exactly what the
//! pipeline needs from it.

use chainmail_protocol::message::Message;
use chainmail_types::{Address, MessageId, PublicKey, Result, Timestamp};

/// One local account known to the wallet.
#[derive(Clone, Debug)]
pub struct WalletAccount {
    /// Account name.
    pub name: String,
    /// Address mail servers index this account's inbound mail by.
    pub address: Address,
    /// When the account was registered on chain; the earliest moment
    /// mail could have been addressed to it.
    pub registration_date: Timestamp,
}

/// The wallet operations the mail pipeline depends on.
pub trait Wallet: Send + Sync {
    /// Whether a wallet is open at all.
    fn is_open(&self) -> bool;

    /// Whether the open wallet is unlocked for signing.
    fn is_unlocked(&self) -> bool;

    /// Composes and signs a plaintext email message.
    fn mail_create(
        &self,
        from: &str,
        subject: &str,
        body: &str,
        reply_to: Option<MessageId>,
    ) -> Result<Message>;

    /// Seals a plaintext message for the holder of `active_key`.
    fn mail_encrypt(&self, active_key: &PublicKey, plaintext: &Message) -> Result<Message>;

    /// Opens a sealed message using the private key matching `key`.
    ///
    /// Used for in-flight outgoing mail, where the processing record
    /// carries the recipient's owner key.
    fn mail_open_by_key(&self, key: &PublicKey, ciphertext: &Message) -> Result<Message>;

    /// Opens a sealed message addressed to one of our accounts.
    ///
    /// Used for fetched and archived mail, where only the recipient
    /// address is known.
    fn mail_open_by_address(&self, address: &Address, ciphertext: &Message) -> Result<Message>;

    /// Resolves a public key to a human-readable label.
    ///
    /// # Errors
    ///
    /// Fails when the key is unknown or its signature did not verify;
    /// the fetcher substitutes `"INVALID SIGNATURE"`.
    fn key_label(&self, key: &PublicKey) -> Result<String>;

    /// Lists the wallet's local accounts.
    fn my_accounts(&self) -> Vec<WalletAccount>;

    /// Scans a noticed transaction into the wallet's history.
    fn scan_transaction(&self, txid: &str, unconditional: bool) -> Result<()>;
}
