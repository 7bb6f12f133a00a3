//! Error types for dispatcher sessions

use crate::keystore::KeystoreError;
use crate::transport::TransportError;
use thiserror::Error;
use tss_engine::TssError;

/// Result type alias for dispatcher operations
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors surfaced by a dispatcher session
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Invalid session parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The local account is not part of any committee of the session
    #[error("Account {0} is not a participant of this session")]
    SelfNotFound(String),

    /// No stored key material for the requested key and epoch
    #[error("No key material for {key_id} at epoch {epoch}")]
    KeyNotFound { key_id: String, epoch: u64 },

    /// The engine refused its parameters
    #[error("Engine error: {0}")]
    Engine(#[from] tss_engine::Error),

    /// A running engine reported a failure
    #[error("Protocol error: {0}")]
    Protocol(#[from] TssError),

    /// Keystore failure
    #[error("Keystore error: {0}")]
    Keystore(#[from] KeystoreError),

    /// Transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// `start` was called twice
    #[error("Session already started")]
    AlreadyStarted,

    /// `done` was called on a session that never started
    #[error("Session was never started")]
    NotStarted,

    /// `done` was called twice
    #[error("Session outcome was already awaited")]
    AlreadyAwaited,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Errors that fail `start` before the session runs
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DispatchError::InvalidConfig(_)
                | DispatchError::SelfNotFound(_)
                | DispatchError::KeyNotFound { .. }
                | DispatchError::Engine(_)
        )
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(e: serde_json::Error) -> Self {
        DispatchError::Serialization(e.to_string())
    }
}
