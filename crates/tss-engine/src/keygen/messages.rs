//! Keygen wire messages

use serde::{Deserialize, Serialize};

/// Keygen message, tagged by round
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "round", rename_all = "snake_case")]
pub enum KeygenMessage {
    /// Round 1: Feldman commitments to the sender's polynomial (hex points)
    Commitments { commitments: Vec<String> },
    /// Round 2: the sender's polynomial evaluated at the receiver (hex scalar)
    Share { share: String },
}

impl KeygenMessage {
    pub fn round(&self) -> u32 {
        match self {
            KeygenMessage::Commitments { .. } => 1,
            KeygenMessage::Share { .. } => 2,
        }
    }
}
