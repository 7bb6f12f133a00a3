//! DKG party implementation

use super::KeygenMessage;
use crate::mpc::{deserialize, serialize, Party};
use crate::poly::{
    commit, evaluate_commitments, evaluate_polynomial, index_scalar, random_polynomial,
    verify_share,
};
use crate::suite::{
    decode_point_hex, decode_scalar_hex, encode_point, encode_point_hex, encode_scalar, Suite,
};
use crate::{CommitteeMember, Error, LocalSaveData, Message, Parameters, PartyId, TssError};
use elliptic_curve::ff::Field;
use elliptic_curve::group::Group;
use rand::rngs::OsRng;
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, instrument};

const TASK: &str = "keygen";

/// Secret polynomial prepared ahead of the protocol run
pub struct PreParams<S: Suite> {
    coefficients: Vec<S::Scalar>,
}

impl<S: Suite> PreParams<S> {
    /// Sample a random polynomial of degree `threshold`.
    ///
    /// Meant to run on a blocking thread before the session starts.
    pub fn generate(threshold: usize) -> Self {
        Self {
            coefficients: random_polynomial(S::Scalar::random(&mut OsRng), threshold),
        }
    }

    pub fn threshold(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }
}

/// One participant of a key generation run
pub struct LocalParty<S: Suite> {
    params: Parameters,
    out: UnboundedSender<Message>,
    end: UnboundedSender<LocalSaveData>,
    pre_params: Option<PreParams<S>>,
    commitments: HashMap<String, Vec<S::Point>>,
    shares: HashMap<String, S::Scalar>,
    started: bool,
    finished: bool,
}

impl<S: Suite> LocalParty<S> {
    pub fn new(
        params: Parameters,
        pre_params: Option<PreParams<S>>,
        out: UnboundedSender<Message>,
        end: UnboundedSender<LocalSaveData>,
    ) -> Self {
        Self {
            params,
            out,
            end,
            pre_params,
            commitments: HashMap::new(),
            shares: HashMap::new(),
            started: false,
            finished: false,
        }
    }

    fn error(&self, cause: Error, round: u32, culprits: Vec<PartyId>) -> TssError {
        TssError::new(cause, TASK, round, self.params.party_id.clone(), culprits)
    }

    fn emit(&self, message: Message, round: u32) -> Result<(), TssError> {
        self.out
            .send(message)
            .map_err(|_| {
                self.error(Error::Internal("outbound channel closed".into()), round, vec![])
            })
    }

    fn x(party: &PartyId) -> S::Scalar {
        index_scalar(party.key.share_index())
    }

    fn try_finish(&mut self) -> Result<(), TssError> {
        let n = self.params.parties.len();
        if !self.started || self.finished || self.commitments.len() < n || self.shares.len() < n {
            return Ok(());
        }

        debug!(party_id = %self.params.party_id, "DKG Round 3: Verification");
        let x_me = Self::x(&self.params.party_id);

        let culprits: Vec<PartyId> = self
            .params
            .parties
            .iter()
            .filter(|p| match (self.shares.get(&p.id), self.commitments.get(&p.id)) {
                (Some(share), Some(commitments)) => !verify_share(share, x_me, commitments),
                _ => true,
            })
            .cloned()
            .collect();
        if !culprits.is_empty() {
            // Forget the bad shares so the senders show up as pending
            for culprit in &culprits {
                self.shares.remove(&culprit.id);
            }
            return Err(self.error(
                Error::VerificationFailed("share does not match commitments".into()),
                2,
                culprits,
            ));
        }

        let share = self
            .shares
            .values()
            .fold(S::Scalar::ZERO, |acc, share| acc + *share);
        let public_key = self
            .commitments
            .values()
            .fold(S::Point::identity(), |acc, commitments| acc + commitments[0]);

        let committee = self
            .params
            .parties
            .iter()
            .map(|p| {
                let x = Self::x(p);
                let public_share = self
                    .commitments
                    .values()
                    .fold(S::Point::identity(), |acc, c| acc + evaluate_commitments(c, x));
                CommitteeMember {
                    id: p.id.clone(),
                    key: p.key.clone(),
                    share_index: p.key.share_index(),
                    public_share: encode_point(&public_share),
                }
            })
            .collect();

        let save = LocalSaveData {
            algo: S::ALGO,
            threshold: self.params.threshold,
            party: self.params.party_id.id.clone(),
            share_index: self.params.party_id.key.share_index(),
            share: encode_scalar(&share),
            public_key: encode_point(&public_key),
            committee,
        };

        info!(
            party_id = %self.params.party_id,
            public_key = hex::encode(&save.public_key),
            "DKG completed successfully"
        );

        self.finished = true;
        self.end
            .send(save)
            .map_err(|_| self.error(Error::Internal("output channel closed".into()), 3, vec![]))
    }
}

impl<S: Suite> Party for LocalParty<S> {
    fn party_id(&self) -> &PartyId {
        &self.params.party_id
    }

    #[instrument(skip(self), fields(party_id = %self.params.party_id))]
    fn start(&mut self) -> Result<(), TssError> {
        if self.started {
            return Err(self.error(Error::AlreadyStarted, 1, vec![]));
        }
        info!(
            n_parties = self.params.parties.len(),
            threshold = self.params.threshold,
            algo = %S::ALGO,
            "Starting DKG"
        );

        let threshold = self.params.threshold;
        let coefficients = match self.pre_params.take() {
            Some(pre) if pre.threshold() == threshold => pre.coefficients,
            _ => random_polynomial(S::Scalar::random(&mut OsRng), threshold),
        };
        let commitments = commit::<S::Point>(&coefficients);
        let me = self.params.party_id.clone();

        debug!("DKG Round 1: Commitment");
        let round1 = KeygenMessage::Commitments {
            commitments: commitments.iter().map(encode_point_hex).collect(),
        };
        let payload = serialize(&round1).map_err(|e| self.error(e, 1, vec![]))?;
        self.emit(Message::broadcast(me.clone(), payload), 1)?;

        debug!("DKG Round 2: Secret sharing");
        for peer in self.params.peers() {
            let share = evaluate_polynomial(&coefficients, Self::x(peer));
            let round2 = KeygenMessage::Share {
                share: hex::encode(encode_scalar(&share)),
            };
            let payload = serialize(&round2).map_err(|e| self.error(e, 2, vec![]))?;
            self.emit(Message::direct(me.clone(), peer.clone(), payload), 2)?;
        }

        self.shares
            .insert(me.id.clone(), evaluate_polynomial(&coefficients, Self::x(&me)));
        self.commitments.insert(me.id, commitments);
        self.started = true;

        self.try_finish()
    }

    fn update_from_bytes(
        &mut self,
        wire: &[u8],
        from: &PartyId,
        _is_broadcast: bool,
    ) -> Result<bool, TssError> {
        if self.finished {
            return Ok(true);
        }
        if !self.params.parties.contains(from) {
            return Err(self.error(Error::UnknownParty(from.to_string()), 0, vec![]));
        }

        let message: KeygenMessage =
            deserialize(wire).map_err(|e| self.error(e, 0, vec![from.clone()]))?;
        let round = message.round();

        match message {
            KeygenMessage::Commitments { commitments } => {
                let points = commitments
                    .iter()
                    .map(|c| decode_point_hex::<S::Point>(c))
                    .collect::<crate::Result<Vec<_>>>()
                    .map_err(|e| self.error(e, round, vec![from.clone()]))?;
                if points.len() != self.params.threshold + 1 {
                    return Err(self.error(
                        Error::VerificationFailed(format!(
                            "expected {} commitments, got {}",
                            self.params.threshold + 1,
                            points.len()
                        )),
                        round,
                        vec![from.clone()],
                    ));
                }
                self.commitments.insert(from.id.clone(), points);
            }
            KeygenMessage::Share { share } => {
                let share = decode_scalar_hex::<S::Scalar>(&share)
                    .map_err(|e| self.error(e, round, vec![from.clone()]))?;
                self.shares.insert(from.id.clone(), share);
            }
        }

        self.try_finish()?;
        Ok(true)
    }

    fn waiting_for(&self) -> Vec<PartyId> {
        self.params
            .peers()
            .filter(|p| !self.commitments.contains_key(&p.id) || !self.shares.contains_key(&p.id))
            .cloned()
            .collect()
    }
}
