//! Session timing and identity configuration

use crate::{DispatchError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settle time between identity resolution and engine start
pub const DEFAULT_GRACE_DELAY: Duration = Duration::from_secs(15);

/// Time a session may run before blame is assigned
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Epoch parity used to separate old and new resharing identities
pub const DEFAULT_EPOCH_INDEX_MODULUS: u64 = 2;

/// Fixed per-node settings handed to every session at construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub grace_delay: Duration,
    pub session_timeout: Duration,
    pub epoch_index_modulus: u64,
}

impl DispatcherConfig {
    pub fn with_grace_delay(mut self, grace_delay: Duration) -> Self {
        self.grace_delay = grace_delay;
        self
    }

    pub fn with_session_timeout(mut self, session_timeout: Duration) -> Self {
        self.session_timeout = session_timeout;
        self
    }

    pub fn with_epoch_index_modulus(mut self, modulus: u64) -> Self {
        self.epoch_index_modulus = modulus;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.session_timeout.is_zero() {
            return Err(DispatchError::InvalidConfig(
                "session timeout must be non-zero".into(),
            ));
        }
        if self.epoch_index_modulus == 0 {
            return Err(DispatchError::InvalidConfig(
                "epoch index modulus must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            grace_delay: DEFAULT_GRACE_DELAY,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            epoch_index_modulus: DEFAULT_EPOCH_INDEX_MODULUS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DispatcherConfig::default();
        assert_eq!(config.grace_delay, Duration::from_secs(15));
        assert_eq!(config.session_timeout, Duration::from_secs(60));
        assert_eq!(config.epoch_index_modulus, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values() {
        let config = DispatcherConfig::default().with_session_timeout(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = DispatcherConfig::default().with_epoch_index_modulus(0);
        assert!(config.validate().is_err());

        // no grace delay is fine
        let config = DispatcherConfig::default().with_grace_delay(Duration::ZERO);
        assert!(config.validate().is_ok());
    }
}
