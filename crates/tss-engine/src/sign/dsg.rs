//! DSG party implementation

use super::SignMessage;
use crate::mpc::{deserialize, serialize, Party};
use crate::poly::{index_scalar, lagrange_at_zero};
use crate::suite::{
    decode_point, decode_point_hex, decode_scalar, decode_scalar_hex, encode_point_hex,
    encode_scalar, Suite,
};
use crate::{Error, LocalSaveData, Message, Parameters, PartyId, Result, SignatureData, TssError};
use elliptic_curve::ff::Field;
use elliptic_curve::group::Group;
use rand::rngs::OsRng;
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, instrument};

const TASK: &str = "signing";

/// One participant of a signing run
pub struct LocalParty<S: Suite> {
    params: Parameters,
    message: Vec<u8>,
    share: S::Scalar,
    public_key: S::Point,
    /// Evaluation points of the signing set
    indices: HashMap<String, S::Scalar>,
    out: UnboundedSender<Message>,
    end: UnboundedSender<SignatureData>,
    nonce: Option<S::Scalar>,
    nonce_points: HashMap<String, S::Point>,
    big_r: Option<S::Point>,
    partials: HashMap<String, S::Scalar>,
    started: bool,
    finished: bool,
}

impl<S: Suite> LocalParty<S> {
    /// Prepare a signer from stored key material.
    ///
    /// Fails if the key belongs to another scheme, if a signer was not part
    /// of the committee that holds the key, or if too few signers take part.
    pub fn new(
        params: Parameters,
        key: &LocalSaveData,
        message: Vec<u8>,
        out: UnboundedSender<Message>,
        end: UnboundedSender<SignatureData>,
    ) -> Result<Self> {
        if key.algo != S::ALGO {
            return Err(Error::InvalidConfig(format!(
                "key is for {}, not {}",
                key.algo,
                S::ALGO
            )));
        }
        if key.is_empty() {
            return Err(Error::InvalidConfig("key material is empty".into()));
        }
        S::check_message(&message)?;
        if params.parties.len() <= key.threshold {
            return Err(Error::ThresholdNotMet {
                required: key.threshold + 1,
                actual: params.parties.len(),
            });
        }

        let mut indices = HashMap::with_capacity(params.parties.len());
        for party in &params.parties {
            let member = key
                .member(&party.id)
                .ok_or_else(|| Error::UnknownParty(party.id.clone()))?;
            indices.insert(party.id.clone(), index_scalar(member.share_index));
        }

        Ok(Self {
            share: decode_scalar(&key.share)?,
            public_key: decode_point(&key.public_key)?,
            params,
            message,
            indices,
            out,
            end,
            nonce: None,
            nonce_points: HashMap::new(),
            big_r: None,
            partials: HashMap::new(),
            started: false,
            finished: false,
        })
    }

    fn error(&self, cause: Error, round: u32, culprits: Vec<PartyId>) -> TssError {
        TssError::new(cause, TASK, round, self.params.party_id.clone(), culprits)
    }

    fn broadcast(&self, message: &SignMessage) -> std::result::Result<(), TssError> {
        let round = message.round();
        let payload = serialize(message).map_err(|e| self.error(e, round, vec![]))?;
        self.out
            .send(Message::broadcast(self.params.party_id.clone(), payload))
            .map_err(|_| {
                self.error(Error::Internal("outbound channel closed".into()), round, vec![])
            })
    }

    /// Lagrange-weighted key share over the signing set
    fn weighted_share(&self) -> Result<S::Scalar> {
        let xs: Vec<S::Scalar> = self.indices.values().copied().collect();
        let x_me = self
            .indices
            .get(&self.params.party_id.id)
            .copied()
            .ok_or_else(|| Error::UnknownParty(self.params.party_id.id.clone()))?;
        Ok(lagrange_at_zero(x_me, &xs)? * self.share)
    }

    fn try_advance(&mut self) -> std::result::Result<(), TssError> {
        if !self.started || self.finished {
            return Ok(());
        }
        let n = self.params.parties.len();

        if self.big_r.is_none() && self.nonce_points.len() == n {
            debug!(party_id = %self.params.party_id, "DSG Round 2: Partial signature");
            let big_r = self
                .nonce_points
                .values()
                .fold(S::Point::identity(), |acc, point| acc + *point);
            let nonce = self
                .nonce
                .ok_or_else(|| self.error(Error::Internal("nonce missing".into()), 2, vec![]))?;
            let sigma = self
                .weighted_share()
                .and_then(|w| {
                    S::partial_signature(&nonce, &big_r, &w, &self.public_key, &self.message)
                })
                .map_err(|e| self.error(e, 2, vec![]))?;

            self.broadcast(&SignMessage::Partial {
                sigma: hex::encode(encode_scalar(&sigma)),
            })?;
            self.partials
                .insert(self.params.party_id.id.clone(), sigma);
            self.big_r = Some(big_r);
            self.nonce = None;
        }

        let Some(big_r) = self.big_r else {
            return Ok(());
        };
        if self.partials.len() < n {
            return Ok(());
        }

        let s = self
            .partials
            .values()
            .fold(S::Scalar::ZERO, |acc, sigma| acc + *sigma);
        let signature = S::finalize_signature(&big_r, &s, &self.message)
            .map_err(|e| self.error(e, 3, vec![]))?;

        info!(
            party_id = %self.params.party_id,
            r = hex::encode(&signature.r),
            s = hex::encode(&signature.s),
            "DSG completed successfully"
        );

        self.finished = true;
        self.end
            .send(signature)
            .map_err(|_| self.error(Error::Internal("output channel closed".into()), 3, vec![]))
    }
}

impl<S: Suite> Party for LocalParty<S> {
    fn party_id(&self) -> &PartyId {
        &self.params.party_id
    }

    #[instrument(skip(self), fields(party_id = %self.params.party_id))]
    fn start(&mut self) -> std::result::Result<(), TssError> {
        if self.started {
            return Err(self.error(Error::AlreadyStarted, 1, vec![]));
        }
        info!(
            participants = self.params.parties.len(),
            algo = %S::ALGO,
            "Starting DSG"
        );

        debug!("DSG Round 1: Nonce commitment");
        let nonce = S::Scalar::random(&mut OsRng);
        let point = S::Point::generator() * nonce;
        self.broadcast(&SignMessage::Nonce {
            point: encode_point_hex(&point),
        })?;

        self.nonce = Some(nonce);
        self.nonce_points
            .insert(self.params.party_id.id.clone(), point);
        self.started = true;

        self.try_advance()
    }

    fn update_from_bytes(
        &mut self,
        wire: &[u8],
        from: &PartyId,
        _is_broadcast: bool,
    ) -> std::result::Result<bool, TssError> {
        if self.finished {
            return Ok(true);
        }
        if !self.params.parties.contains(from) {
            return Err(self.error(Error::UnknownParty(from.to_string()), 0, vec![]));
        }

        let message: SignMessage =
            deserialize(wire).map_err(|e| self.error(e, 0, vec![from.clone()]))?;
        let round = message.round();

        match message {
            SignMessage::Nonce { point } => {
                let point = decode_point_hex::<S::Point>(&point)
                    .map_err(|e| self.error(e, round, vec![from.clone()]))?;
                self.nonce_points.insert(from.id.clone(), point);
            }
            SignMessage::Partial { sigma } => {
                let sigma = decode_scalar_hex::<S::Scalar>(&sigma)
                    .map_err(|e| self.error(e, round, vec![from.clone()]))?;
                self.partials.insert(from.id.clone(), sigma);
            }
        }

        self.try_advance()?;
        Ok(true)
    }

    fn waiting_for(&self) -> Vec<PartyId> {
        self.params
            .peers()
            .filter(|p| {
                if self.big_r.is_none() {
                    !self.nonce_points.contains_key(&p.id)
                } else {
                    !self.partials.contains_key(&p.id)
                }
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpc::MemoryRouter;
    use crate::suite::{Ed25519, Secp256k1};
    use crate::testing::{committee, run_keygen, save_for};
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn sign_router<S: Suite>(
        keys: &[LocalSaveData],
        signers: &[&str],
        message: &[u8],
    ) -> (MemoryRouter, UnboundedReceiver<SignatureData>) {
        let parties = committee(signers, "sign");
        let (end_tx, end_rx) = unbounded_channel();
        let mut router = MemoryRouter::new();
        for account in signers {
            let me = parties.find_by_id(account).unwrap().clone();
            let params = Parameters::new(me, parties.clone(), 1).unwrap();
            let (out_tx, out_rx) = unbounded_channel();
            let party = LocalParty::<S>::new(
                params,
                save_for(keys, account),
                message.to_vec(),
                out_tx,
                end_tx.clone(),
            )
            .unwrap();
            router.add(Box::new(party), out_rx);
        }
        (router, end_rx)
    }

    #[test]
    fn test_dsg_ed25519_signature_verifies() {
        let accounts = ["alice", "bob", "carol", "dave"];
        let keys = run_keygen::<Ed25519>(&accounts, 2);
        let message = b"withdraw 10 HIVE to @alice";

        let (mut router, mut end) = sign_router::<Ed25519>(&keys, &["bob", "carol", "dave"], message);
        router.start_all().unwrap();
        router.run().unwrap();

        let signatures: Vec<SignatureData> = std::iter::from_fn(|| end.try_recv().ok()).collect();
        assert_eq!(signatures.len(), 3);

        let public_key: [u8; 32] = keys[0].public_key.as_slice().try_into().unwrap();
        let verifying_key = VerifyingKey::from_bytes(&public_key).unwrap();
        let bytes: [u8; 64] = signatures[0].signature.as_slice().try_into().unwrap();
        verifying_key
            .verify(message, &Signature::from_bytes(&bytes))
            .unwrap();
        assert!(signatures.iter().all(|s| s.signature == signatures[0].signature));
    }

    #[test]
    fn test_dsg_secp256k1_all_signers_agree() {
        let accounts = ["alice", "bob", "carol"];
        let keys = run_keygen::<Secp256k1>(&accounts, 2);
        let digest = [7u8; 32];

        let (mut router, mut end) = sign_router::<Secp256k1>(&keys, &accounts, &digest);
        router.start_all().unwrap();
        router.run().unwrap();

        let signatures: Vec<SignatureData> = std::iter::from_fn(|| end.try_recv().ok()).collect();
        assert_eq!(signatures.len(), 3);
        assert!(signatures.iter().all(|s| s.signature == signatures[0].signature));
        assert_eq!(signatures[0].r.len(), 32);
        assert_eq!(signatures[0].message, digest.to_vec());
    }

    #[test]
    fn test_dsg_rejects_insufficient_signers() {
        let accounts = ["alice", "bob", "carol"];
        let keys = run_keygen::<Secp256k1>(&accounts, 2);
        let parties = committee(&["alice", "bob"], "sign");
        let me = parties.find_by_id("alice").unwrap().clone();
        let (out_tx, _) = unbounded_channel();
        let (end_tx, _) = unbounded_channel();

        let result = LocalParty::<Secp256k1>::new(
            Parameters::new(me, parties, 1).unwrap(),
            save_for(&keys, "alice"),
            vec![0u8; 32],
            out_tx,
            end_tx,
        );
        assert!(matches!(result, Err(Error::ThresholdNotMet { required: 3, actual: 2 })));
    }

    #[test]
    fn test_dsg_rejects_foreign_key() {
        let keys = run_keygen::<Ed25519>(&["alice", "bob"], 1);
        let parties = committee(&["alice", "bob"], "sign");
        let me = parties.find_by_id("alice").unwrap().clone();
        let (out_tx, _) = unbounded_channel();
        let (end_tx, _) = unbounded_channel();

        let result = LocalParty::<Secp256k1>::new(
            Parameters::new(me, parties, 1).unwrap(),
            save_for(&keys, "alice"),
            vec![0u8; 32],
            out_tx,
            end_tx,
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_dsg_waiting_for_tracks_round() {
        let accounts = ["alice", "bob", "carol"];
        let keys = run_keygen::<Ed25519>(&accounts, 2);
        let (mut router, _end) = sign_router::<Ed25519>(&keys, &accounts, b"msg");
        let alice = router.take_party(0);
        assert_eq!(alice.waiting_for().len(), 2);

        router.start_all().unwrap();
        router.run().unwrap();
        for party in router.parties() {
            let pending: Vec<_> = party.waiting_for().into_iter().map(|p| p.id).collect();
            assert_eq!(pending, vec![alice.party_id().id.clone()]);
        }
    }
}
