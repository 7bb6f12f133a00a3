//! Account-set commitments anchored with every session result

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use dashmap::DashMap;
use tracing::warn;

/// Turns an account set into the digest carried by a commitment
pub trait SetCommitter: Send + Sync {
    fn set_to_commitment(&self, accounts: &[String], epoch: u64) -> String;
}

/// Commits to a set of accounts as a membership bitset over the elected
/// members of an epoch.
///
/// Bit `i` (least significant bit first within each byte) is set when the
/// `i`-th elected member is in the set.
#[derive(Default)]
pub struct ElectionCommitter {
    elections: DashMap<u64, Vec<String>>,
}

impl ElectionCommitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the ordered member list elected for `epoch`
    pub fn record_election(&self, epoch: u64, members: Vec<String>) {
        self.elections.insert(epoch, members);
    }

    pub fn members(&self, epoch: u64) -> Option<Vec<String>> {
        self.elections.get(&epoch).map(|entry| entry.value().clone())
    }
}

impl SetCommitter for ElectionCommitter {
    fn set_to_commitment(&self, accounts: &[String], epoch: u64) -> String {
        let Some(members) = self.elections.get(&epoch) else {
            warn!(epoch, "no election recorded for epoch");
            return String::new();
        };

        let mut bits = vec![0u8; members.len().div_ceil(8)];
        for (idx, member) in members.iter().enumerate() {
            if accounts.contains(member) {
                bits[idx / 8] |= 1 << (idx % 8);
            }
        }
        URL_SAFE_NO_PAD.encode(bits)
    }
}
