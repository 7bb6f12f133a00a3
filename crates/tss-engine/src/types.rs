//! Core types shared by every protocol party

use crate::suite::{decode_point, encode_point, Ed25519, Secp256k1, Suite};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Signature scheme a key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SigningAlgo {
    /// ECDSA over secp256k1
    Ecdsa,
    /// EdDSA over ed25519
    Eddsa,
}

impl fmt::Display for SigningAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigningAlgo::Ecdsa => f.write_str("ecdsa"),
            SigningAlgo::Eddsa => f.write_str("eddsa"),
        }
    }
}

impl FromStr for SigningAlgo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ecdsa" => Ok(SigningAlgo::Ecdsa),
            "eddsa" => Ok(SigningAlgo::Eddsa),
            other => Err(Error::InvalidConfig(format!("unknown algorithm {other}"))),
        }
    }
}

/// Unsigned big-endian integer identifying a party.
///
/// Leading zero bytes are stripped so that equal numbers compare equal.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartyKey(Vec<u8>);

impl PartyKey {
    /// Interpret `bytes` as a big-endian number
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        Self(bytes[start..].to_vec())
    }

    /// Numeric identity of an account name
    pub fn from_account(account: &str) -> Self {
        Self::from_bytes(account.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_empty()
    }

    /// Multiply by a small factor
    pub fn scaled(&self, factor: u64) -> Self {
        let mut out = Vec::with_capacity(self.0.len() + 8);
        let mut carry: u128 = 0;
        for byte in self.0.iter().rev() {
            let product = u128::from(*byte) * u128::from(factor) + carry;
            out.push((product & 0xff) as u8);
            carry = product >> 8;
        }
        while carry > 0 {
            out.push((carry & 0xff) as u8);
            carry >>= 8;
        }
        out.reverse();
        Self::from_bytes(&out)
    }

    /// Evaluation point of this party in a secret sharing.
    ///
    /// Never zero, so a share can never reveal the secret directly.
    pub fn share_index(&self) -> u64 {
        let digest = blake3::hash(&self.0);
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_be_bytes(head) | 1
    }
}

impl Ord for PartyKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for PartyKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for PartyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartyKey({})", hex::encode(&self.0))
    }
}

/// Identity of one protocol participant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartyId {
    /// Account the party acts for
    pub id: String,
    /// Human-readable label, usually the session it belongs to
    pub moniker: String,
    /// Sort key
    pub key: PartyKey,
}

impl PartyId {
    pub fn new(id: impl Into<String>, moniker: impl Into<String>, key: PartyKey) -> Self {
        Self {
            id: id.into(),
            moniker: moniker.into(),
            key,
        }
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{},{}}}", self.id, self.moniker)
    }
}

/// Party ids in canonical order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortedPartyIds(Vec<PartyId>);

impl SortedPartyIds {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PartyId> {
        self.0.iter()
    }

    pub fn contains(&self, party: &PartyId) -> bool {
        self.0.contains(party)
    }

    /// Look a party up by account
    pub fn find_by_id(&self, id: &str) -> Option<&PartyId> {
        self.0.iter().find(|p| p.id == id)
    }

    pub fn as_slice(&self) -> &[PartyId] {
        &self.0
    }
}

impl<'a> IntoIterator for &'a SortedPartyIds {
    type Item = &'a PartyId;
    type IntoIter = std::slice::Iter<'a, PartyId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Sort party ids by key, ties broken by account
pub fn sort_party_ids(mut ids: Vec<PartyId>) -> SortedPartyIds {
    ids.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.id.cmp(&b.id)));
    SortedPartyIds(ids)
}

/// Parameters of a keygen or signing party
#[derive(Debug, Clone)]
pub struct Parameters {
    pub party_id: PartyId,
    pub parties: SortedPartyIds,
    /// Polynomial degree; `threshold + 1` shares reconstruct
    pub threshold: usize,
}

impl Parameters {
    pub fn new(party_id: PartyId, parties: SortedPartyIds, threshold: usize) -> Result<Self> {
        check_committee(&party_id, &parties, threshold)?;
        Ok(Self {
            party_id,
            parties,
            threshold,
        })
    }

    /// Every party except this one
    pub fn peers(&self) -> impl Iterator<Item = &PartyId> {
        self.parties.iter().filter(move |p| **p != self.party_id)
    }
}

/// Parameters of a resharing party, which runs either the old or the new
/// committee's side of the protocol
#[derive(Debug, Clone)]
pub struct ReSharingParameters {
    pub party_id: PartyId,
    pub old_parties: SortedPartyIds,
    pub old_threshold: usize,
    pub new_parties: SortedPartyIds,
    pub new_threshold: usize,
}

impl ReSharingParameters {
    pub fn new(
        party_id: PartyId,
        old_parties: SortedPartyIds,
        old_threshold: usize,
        new_parties: SortedPartyIds,
        new_threshold: usize,
    ) -> Result<Self> {
        check_threshold(old_parties.len(), old_threshold)?;
        check_threshold(new_parties.len(), new_threshold)?;
        if !old_parties.contains(&party_id) && !new_parties.contains(&party_id) {
            return Err(Error::InvalidConfig(format!(
                "{party_id} is in neither committee"
            )));
        }
        Ok(Self {
            party_id,
            old_parties,
            old_threshold,
            new_parties,
            new_threshold,
        })
    }

    pub fn is_old_committee(&self) -> bool {
        self.old_parties.contains(&self.party_id)
    }
}

fn check_threshold(n: usize, threshold: usize) -> Result<()> {
    if n == 0 {
        return Err(Error::InvalidConfig("committee is empty".into()));
    }
    if threshold >= n {
        return Err(Error::ThresholdNotMet {
            required: threshold + 1,
            actual: n,
        });
    }
    Ok(())
}

fn check_committee(party_id: &PartyId, parties: &SortedPartyIds, threshold: usize) -> Result<()> {
    check_threshold(parties.len(), threshold)?;
    if !parties.contains(party_id) {
        return Err(Error::InvalidConfig(format!(
            "{party_id} is not part of the committee"
        )));
    }
    Ok(())
}

/// Outbound protocol message.
///
/// Broadcasts carry an empty recipient list unless the protocol addresses a
/// specific set (resharing does).
#[derive(Debug, Clone)]
pub struct Message {
    pub from: PartyId,
    pub to: Vec<PartyId>,
    pub is_broadcast: bool,
    pub to_old_committee: bool,
    pub to_old_and_new_committees: bool,
    payload: Vec<u8>,
}

impl Message {
    pub(crate) fn broadcast(from: PartyId, payload: Vec<u8>) -> Self {
        Self {
            from,
            to: Vec::new(),
            is_broadcast: true,
            to_old_committee: false,
            to_old_and_new_committees: false,
            payload,
        }
    }

    pub(crate) fn direct(from: PartyId, to: PartyId, payload: Vec<u8>) -> Self {
        Self {
            from,
            to: vec![to],
            is_broadcast: false,
            to_old_committee: false,
            to_old_and_new_committees: false,
            payload,
        }
    }

    pub(crate) fn to_both_committees(from: PartyId, to: Vec<PartyId>, payload: Vec<u8>) -> Self {
        Self {
            from,
            to,
            is_broadcast: true,
            to_old_committee: false,
            to_old_and_new_committees: true,
            payload,
        }
    }

    /// Bytes to put on the wire
    pub fn wire_bytes(&self) -> &[u8] {
        &self.payload
    }
}

/// Public record of one committee member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeMember {
    pub id: String,
    pub key: PartyKey,
    pub share_index: u64,
    /// Encoded `share * G`
    pub public_share: Vec<u8>,
}

/// Key material a party keeps after keygen or resharing
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct LocalSaveData {
    #[zeroize(skip)]
    pub algo: SigningAlgo,
    pub threshold: usize,
    pub party: String,
    pub share_index: u64,
    /// Encoded secret share
    pub share: Vec<u8>,
    /// Encoded group public key; empty for a placeholder
    pub public_key: Vec<u8>,
    #[zeroize(skip)]
    pub committee: Vec<CommitteeMember>,
}

impl LocalSaveData {
    /// Empty save data for a party that joins through resharing
    pub fn placeholder(algo: SigningAlgo) -> Self {
        Self {
            algo,
            threshold: 0,
            party: String::new(),
            share_index: 0,
            share: Vec::new(),
            public_key: Vec::new(),
            committee: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.public_key.is_empty()
    }

    pub fn member(&self, id: &str) -> Option<&CommitteeMember> {
        self.committee.iter().find(|m| m.id == id)
    }

    /// Validated compressed public key (33 bytes SEC1 or 32 bytes ed25519)
    pub fn compressed_public_key(&self) -> Result<Vec<u8>> {
        if self.is_empty() {
            return Err(Error::InvalidConfig("save data holds no public key".into()));
        }
        match self.algo {
            SigningAlgo::Ecdsa => reencode::<Secp256k1>(&self.public_key),
            SigningAlgo::Eddsa => reencode::<Ed25519>(&self.public_key),
        }
    }
}

fn reencode<S: Suite>(bytes: &[u8]) -> Result<Vec<u8>> {
    Ok(encode_point(&decode_point::<S::Point>(bytes)?))
}

impl fmt::Debug for LocalSaveData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSaveData")
            .field("algo", &self.algo)
            .field("threshold", &self.threshold)
            .field("party", &self.party)
            .field("share_index", &self.share_index)
            .field("share", &"<redacted>")
            .field("public_key", &hex::encode(&self.public_key))
            .field("committee", &self.committee.len())
            .finish()
    }
}

/// Raw signature produced by a signing party
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureData {
    /// R component (x coordinate for ECDSA, encoded point for EdDSA)
    pub r: Vec<u8>,
    /// S component
    pub s: Vec<u8>,
    /// Recovery ID (0 or 1), ECDSA only
    pub recovery_id: u8,
    /// r || s
    pub signature: Vec<u8>,
    /// Signed message
    pub message: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_party_key_orders_numerically() {
        let short = PartyKey::from_bytes(&[0xff]);
        let long = PartyKey::from_bytes(&[0x01, 0x00]);
        assert!(short < long);
        assert_eq!(PartyKey::from_bytes(&[0, 0, 7]), PartyKey::from_bytes(&[7]));
    }

    #[test]
    fn test_party_key_scaled() {
        let key = PartyKey::from_bytes(&[0x80]);
        assert_eq!(key.scaled(2).as_bytes(), &[0x01, 0x00]);
        assert_eq!(key.scaled(1), key);
        assert!(key.scaled(0).is_zero());

        let account = PartyKey::from_account("alice");
        assert_ne!(account.scaled(2), account);
        assert_ne!(account.scaled(2).share_index(), account.share_index());
    }

    #[test]
    fn test_sort_party_ids() {
        let ids = ["carol", "bob", "alice", "al"]
            .iter()
            .map(|a| PartyId::new(*a, "s", PartyKey::from_account(a)))
            .collect();
        let sorted = sort_party_ids(ids);
        let order: Vec<_> = sorted.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(order, vec!["al", "bob", "alice", "carol"]);
    }

    #[test]
    fn test_parameters_validation() {
        let ids: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|a| PartyId::new(*a, "s", PartyKey::from_account(a)))
            .collect();
        let me = ids[0].clone();
        let sorted = sort_party_ids(ids);

        assert!(Parameters::new(me.clone(), sorted.clone(), 2).is_ok());
        assert!(matches!(
            Parameters::new(me, sorted.clone(), 3),
            Err(Error::ThresholdNotMet { .. })
        ));

        let stranger = PartyId::new("z", "s", PartyKey::from_account("z"));
        assert!(matches!(
            Parameters::new(stranger, sorted, 1),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_save_data_debug_redacts_share() {
        let mut data = LocalSaveData::placeholder(SigningAlgo::Eddsa);
        data.share = vec![0xaa; 32];
        let printed = format!("{data:?}");
        assert!(printed.contains("<redacted>"));
        assert!(!printed.contains("aaaa"));
    }
}
