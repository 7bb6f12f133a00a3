//! Resharing wire messages

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "round", rename_all = "snake_case")]
pub enum ReshareMessage {
    /// Round 1, old to new: a sub-share of the sender's weighted share plus
    /// commitments to the polynomial it came from
    Deal {
        public_key: String,
        commitments: Vec<String>,
        share: String,
    },
    /// Round 2, new to everyone: the receiver accepted all deals
    Ack { public_share: String },
}

impl ReshareMessage {
    pub fn round(&self) -> u32 {
        match self {
            ReshareMessage::Deal { .. } => 1,
            ReshareMessage::Ack { .. } => 2,
        }
    }
}
