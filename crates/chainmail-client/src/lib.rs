//! Client-side mail pipeline.
//!
//! A [`client::MailClient`] turns a wallet, a chain directory, and a
//! data directory into a working mail client: it resolves recipients
//! to mail servers, mines proof-of-work over outgoing messages,
//! transmits them with a fan-out and a hard timeout, polls servers
//! for inbound mail, and keeps three persistent stores plus an
//! in-memory multi-index consistent across crashes.
//!
//! The wallet and the chain database are external collaborators,
//! abstracted as the [`wallet::Wallet`] and
//! [`directory::ChainDirectory`] traits.

mod core;
mod fetch;
mod index;
mod outgoing;
mod pow;
mod transmit;

pub mod client;
pub mod directory;
pub mod wallet;

pub use client::{EmailRecord, MailClient};
pub use directory::{AccountRecord, ChainDirectory, DirectoryResolver};
pub use wallet::{Wallet, WalletAccount};
