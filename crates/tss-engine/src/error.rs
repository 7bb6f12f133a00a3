//! Error types for threshold protocol parties

use crate::types::PartyId;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a protocol party
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Invalid party configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Threshold requirements not met
    #[error("Threshold not met: required {required}, got {actual}")]
    ThresholdNotMet { required: usize, actual: usize },

    /// Sender is not part of the committee
    #[error("Unknown party: {0}")]
    UnknownParty(String),

    /// Message verification failed
    #[error("Message verification failed: {0}")]
    VerificationFailed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// `start` was called twice
    #[error("Party already started")]
    AlreadyStarted,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Failure reported by a running party.
///
/// Carries the protocol task and round it happened in, plus the peers the
/// party holds responsible (empty when the failure is local).
#[derive(Debug, Clone, Error)]
#[error("{task} round {round} at {party}: {cause}")]
pub struct TssError {
    #[source]
    pub cause: Error,
    pub task: &'static str,
    pub round: u32,
    pub party: PartyId,
    pub culprits: Vec<PartyId>,
}

impl TssError {
    pub fn new(
        cause: Error,
        task: &'static str,
        round: u32,
        party: PartyId,
        culprits: Vec<PartyId>,
    ) -> Self {
        Self {
            cause,
            task,
            round,
            party,
            culprits,
        }
    }

    pub fn culprits(&self) -> &[PartyId] {
        &self.culprits
    }
}
