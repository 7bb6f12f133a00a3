//! Party identity resolution and committee thresholds

use crate::{DispatchError, Result};
use std::collections::HashSet;
use tss_engine::{sort_party_ids, PartyId, PartyKey, SortedPartyIds};

/// Committee threshold before the engine offset: `ceil(2n / 3) - 1`
pub fn get_threshold(n: usize) -> Result<usize> {
    if n == 0 {
        return Err(DispatchError::InvalidConfig("committee is empty".into()));
    }
    Ok((2 * n + 2) / 3 - 1)
}

/// Threshold handed to the engine, one above [`get_threshold`]
pub fn engine_threshold(n: usize) -> Result<usize> {
    let threshold = get_threshold(n)? + 1;
    if threshold >= n {
        return Err(DispatchError::InvalidConfig(format!(
            "a committee of {n} cannot satisfy threshold {threshold}"
        )));
    }
    Ok(threshold)
}

pub fn epoch_index_offset(epoch: u64, modulus: u64) -> u64 {
    if modulus == 0 {
        return 0;
    }
    epoch % modulus
}

/// Label of the incoming committee in a resharing session
pub fn new_committee_moniker(session_id: &str) -> String {
    format!("{session_id}-new")
}

/// Participant accounts resolved to sorted party identities
#[derive(Debug, Clone)]
pub struct Committee {
    accounts: Vec<String>,
    parties: SortedPartyIds,
}

impl Committee {
    /// Resolve `accounts` under `moniker`, multiplying every numeric
    /// identity by `factor`.
    pub fn resolve(accounts: &[String], moniker: &str, factor: u64) -> Result<Self> {
        if accounts.is_empty() {
            return Err(DispatchError::InvalidConfig("no participants".into()));
        }
        let mut seen = HashSet::with_capacity(accounts.len());
        for account in accounts {
            if account.is_empty() {
                return Err(DispatchError::InvalidConfig("empty account name".into()));
            }
            if !seen.insert(account.as_str()) {
                return Err(DispatchError::InvalidConfig(format!(
                    "duplicate participant {account}"
                )));
            }
        }

        let parties = accounts
            .iter()
            .map(|account| {
                let key = PartyKey::from_account(account);
                let key = if factor > 1 { key.scaled(factor) } else { key };
                PartyId::new(account.clone(), moniker, key)
            })
            .collect();

        Ok(Self {
            accounts: accounts.to_vec(),
            parties: sort_party_ids(parties),
        })
    }

    /// Accounts in configured order
    pub fn accounts(&self) -> &[String] {
        &self.accounts
    }

    pub fn parties(&self) -> &SortedPartyIds {
        &self.parties
    }

    pub fn len(&self) -> usize {
        self.parties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parties.is_empty()
    }

    pub fn find(&self, account: &str) -> Option<&PartyId> {
        self.parties.find_by_id(account)
    }

    pub fn contains(&self, party: &PartyId) -> bool {
        self.parties.contains(party)
    }

    pub fn engine_threshold(&self) -> Result<usize> {
        engine_threshold(self.len())
    }
}
