//! Mail client configuration with sensible defaults.
//!
//! All operational parameters of the pipeline are centralized here.
//! Defaults match the network's published constants.

use serde::{Deserialize, Serialize};

use crate::{MailError, MessageId, Result};

/// Default proof-of-work target published by the network.
const DEFAULT_POW_TARGET: &str = "000ffffffdeadbeeffffffffffffffffffffffff";

/// Mail pipeline configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MailConfig {
    /// Proof-of-work ceiling: a message is valid once its content id
    /// compares `<=` this value.
    pub pow_target: MessageId,

    /// Mail servers used when a recipient has not published a
    /// preferred set (or published one we cannot parse).
    pub default_mail_servers: Vec<String>,

    /// Hard deadline for one message's transmit fan-out, in seconds.
    pub transmit_timeout_secs: u64,

    /// Hard deadline for one account's fetch pass, in seconds.
    pub fetch_timeout_secs: u64,

    /// Maximum inventory entries requested per page. A page with fewer
    /// entries signals end-of-stream.
    pub max_inventory: usize,

    /// Length of one bounded mining slice, in milliseconds. Slicing
    /// admits cancellation and timestamp refresh between bursts.
    pub pow_slice_millis: u64,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            // The constant is well-formed hex of the right length.
            pow_target: DEFAULT_POW_TARGET.parse().unwrap_or(MessageId::ZERO),
            default_mail_servers: Vec::new(),
            transmit_timeout_secs: 10,
            fetch_timeout_secs: 60,
            max_inventory: 1000,
            pow_slice_millis: 1000,
        }
    }
}

impl MailConfig {
    /// Validates all configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`MailError::ConfigError`] if any value is outside its
    /// acceptable range.
    pub fn validate(&self) -> Result<()> {
        if self.transmit_timeout_secs == 0 {
            return Err(MailError::ConfigError {
                reason: "transmit_timeout_secs must be greater than 0".into(),
            });
        }

        if self.fetch_timeout_secs == 0 {
            return Err(MailError::ConfigError {
                reason: "fetch_timeout_secs must be greater than 0".into(),
            });
        }

        if self.max_inventory == 0 {
            return Err(MailError::ConfigError {
                reason: "max_inventory must be greater than 0".into(),
            });
        }

        if self.pow_slice_millis == 0 {
            return Err(MailError::ConfigError {
                reason: "pow_slice_millis must be greater than 0".into(),
            });
        }

        Ok(())
    }
}
