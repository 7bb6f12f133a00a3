//! Helpers shared by the protocol tests

use crate::keygen::{LocalParty, PreParams};
use crate::mpc::MemoryRouter;
use crate::suite::Suite;
use crate::{sort_party_ids, LocalSaveData, Parameters, PartyId, PartyKey, SortedPartyIds};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

pub(crate) fn committee(accounts: &[&str], moniker: &str) -> SortedPartyIds {
    sort_party_ids(
        accounts
            .iter()
            .map(|a| PartyId::new(*a, moniker, PartyKey::from_account(a)))
            .collect(),
    )
}

/// Keygen parties for `members`, all sharing one output channel
pub(crate) fn keygen_router<S: Suite>(
    parties: &SortedPartyIds,
    members: &[&str],
    threshold: usize,
) -> (MemoryRouter, UnboundedReceiver<LocalSaveData>) {
    let (end_tx, end_rx) = unbounded_channel();
    let mut router = MemoryRouter::new();
    for account in members {
        let me = parties.find_by_id(account).unwrap().clone();
        let params = Parameters::new(me, parties.clone(), threshold).unwrap();
        let (out_tx, out_rx) = unbounded_channel();
        let party = LocalParty::<S>::new(
            params,
            Some(PreParams::generate(threshold)),
            out_tx,
            end_tx.clone(),
        );
        router.add(Box::new(party), out_rx);
    }
    (router, end_rx)
}

/// Run a complete keygen and return every party's save data
pub(crate) fn run_keygen<S: Suite>(accounts: &[&str], threshold: usize) -> Vec<LocalSaveData> {
    let parties = committee(accounts, "keygen");
    let (mut router, mut end) = keygen_router::<S>(&parties, accounts, threshold);
    router.start_all().unwrap();
    router.run().unwrap();
    let outputs: Vec<LocalSaveData> = std::iter::from_fn(|| end.try_recv().ok()).collect();
    assert_eq!(outputs.len(), accounts.len());
    outputs
}

pub(crate) fn save_for<'a>(outputs: &'a [LocalSaveData], account: &str) -> &'a LocalSaveData {
    outputs.iter().find(|s| s.party == account).unwrap()
}
