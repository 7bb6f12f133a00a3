//! Signing wire messages

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "round", rename_all = "snake_case")]
pub enum SignMessage {
    /// Round 1: nonce commitment `k_i * G` (hex point)
    Nonce { point: String },
    /// Round 2: partial signature (hex scalar)
    Partial { sigma: String },
}

impl SignMessage {
    pub fn round(&self) -> u32 {
        match self {
            SignMessage::Nonce { .. } => 1,
            SignMessage::Partial { .. } => 2,
        }
    }
}
