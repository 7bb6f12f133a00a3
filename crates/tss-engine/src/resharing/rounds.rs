//! Resharing party implementation

use super::ReshareMessage;
use crate::mpc::{deserialize, serialize, Party};
use crate::poly::{
    commit, evaluate_commitments, evaluate_polynomial, index_scalar, lagrange_at_zero,
    random_polynomial, verify_share,
};
use crate::suite::{
    decode_point, decode_point_hex, decode_scalar, decode_scalar_hex, encode_point,
    encode_point_hex, encode_scalar, Suite,
};
use crate::{
    CommitteeMember, Error, LocalSaveData, Message, PartyId, ReSharingParameters, Result,
    TssError,
};
use elliptic_curve::ff::Field;
use elliptic_curve::group::Group;
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, instrument};

const TASK: &str = "resharing";

struct Deal<S: Suite> {
    public_key: S::Point,
    commitments: Vec<S::Point>,
    share: S::Scalar,
}

/// What an old-committee party brings to the run
struct Dealer<S: Suite> {
    weighted_share: S::Scalar,
    public_key: S::Point,
}

/// New-committee state once every deal checked out
struct Accepted<S: Suite> {
    share: S::Scalar,
    public_key: S::Point,
    public_shares: HashMap<String, S::Point>,
}

/// One side (old or new committee) of a resharing run
pub struct LocalParty<S: Suite> {
    params: ReSharingParameters,
    dealer: Option<Dealer<S>>,
    out: UnboundedSender<Message>,
    end: UnboundedSender<LocalSaveData>,
    deals: HashMap<String, Deal<S>>,
    acks: HashMap<String, S::Point>,
    accepted: Option<Accepted<S>>,
    started: bool,
    finished: bool,
}

impl<S: Suite> LocalParty<S> {
    /// Old-committee parties pass their stored key; new-committee parties
    /// pass a placeholder.
    pub fn new(
        params: ReSharingParameters,
        key: &LocalSaveData,
        out: UnboundedSender<Message>,
        end: UnboundedSender<LocalSaveData>,
    ) -> Result<Self> {
        if key.algo != S::ALGO {
            return Err(Error::InvalidConfig(format!(
                "key is for {}, not {}",
                key.algo,
                S::ALGO
            )));
        }

        let dealer = if params.is_old_committee() {
            if key.is_empty() {
                return Err(Error::InvalidConfig("old committee party needs its key".into()));
            }
            if params.old_parties.len() <= key.threshold {
                return Err(Error::ThresholdNotMet {
                    required: key.threshold + 1,
                    actual: params.old_parties.len(),
                });
            }
            let mut xs = Vec::with_capacity(params.old_parties.len());
            for party in &params.old_parties {
                let member = key
                    .member(&party.id)
                    .ok_or_else(|| Error::UnknownParty(party.id.clone()))?;
                xs.push(index_scalar::<S::Scalar>(member.share_index));
            }
            let x_me = index_scalar::<S::Scalar>(key.share_index);
            let share: S::Scalar = decode_scalar(&key.share)?;
            Some(Dealer {
                weighted_share: lagrange_at_zero(x_me, &xs)? * share,
                public_key: decode_point(&key.public_key)?,
            })
        } else {
            None
        };

        Ok(Self {
            params,
            dealer,
            out,
            end,
            deals: HashMap::new(),
            acks: HashMap::new(),
            accepted: None,
            started: false,
            finished: false,
        })
    }

    fn error(&self, cause: Error, round: u32, culprits: Vec<PartyId>) -> TssError {
        TssError::new(cause, TASK, round, self.params.party_id.clone(), culprits)
    }

    fn emit(&self, message: Message, round: u32) -> std::result::Result<(), TssError> {
        self.out.send(message).map_err(|_| {
            self.error(Error::Internal("outbound channel closed".into()), round, vec![])
        })
    }

    fn x(party: &PartyId) -> S::Scalar {
        index_scalar(party.key.share_index())
    }

    fn new_committee_peers(&self) -> impl Iterator<Item = &PartyId> {
        self.params
            .new_parties
            .iter()
            .filter(move |p| **p != self.params.party_id)
    }

    /// Round 1 for the old committee: re-deal the weighted share
    fn deal(&self, dealer: &Dealer<S>) -> std::result::Result<(), TssError> {
        debug!("Resharing Round 1: Deal");
        let coefficients = random_polynomial(dealer.weighted_share, self.params.new_threshold);
        let commitments: Vec<String> = commit::<S::Point>(&coefficients)
            .iter()
            .map(encode_point_hex)
            .collect();
        let public_key = encode_point_hex(&dealer.public_key);

        for receiver in &self.params.new_parties {
            let share = evaluate_polynomial(&coefficients, Self::x(receiver));
            let deal = ReshareMessage::Deal {
                public_key: public_key.clone(),
                commitments: commitments.clone(),
                share: hex::encode(encode_scalar(&share)),
            };
            let payload = serialize(&deal).map_err(|e| self.error(e, 1, vec![]))?;
            self.emit(
                Message::direct(self.params.party_id.clone(), receiver.clone(), payload),
                1,
            )?;
        }
        Ok(())
    }

    /// Check every deal and derive the new share
    fn accept_deals(&self) -> std::result::Result<Accepted<S>, TssError> {
        let x_me = Self::x(&self.params.party_id);
        let expected_key = self
            .params
            .old_parties
            .iter()
            .find_map(|p| self.deals.get(&p.id))
            .map(|deal| deal.public_key)
            .ok_or_else(|| self.error(Error::Internal("no deals".into()), 1, vec![]))?;

        let culprits: Vec<PartyId> = self
            .params
            .old_parties
            .iter()
            .filter(|p| match self.deals.get(&p.id) {
                Some(deal) => {
                    deal.public_key != expected_key
                        || !verify_share(&deal.share, x_me, &deal.commitments)
                }
                None => true,
            })
            .cloned()
            .collect();
        if !culprits.is_empty() {
            return Err(self.error(
                Error::VerificationFailed("deal does not match its commitments".into()),
                1,
                culprits,
            ));
        }

        let reconstructed = self
            .deals
            .values()
            .fold(S::Point::identity(), |acc, deal| acc + deal.commitments[0]);
        if reconstructed != expected_key {
            return Err(self.error(
                Error::VerificationFailed("deals do not reconstruct the public key".into()),
                1,
                vec![],
            ));
        }

        let share = self
            .deals
            .values()
            .fold(S::Scalar::ZERO, |acc, deal| acc + deal.share);
        let public_shares = self
            .params
            .new_parties
            .iter()
            .map(|p| {
                let x = Self::x(p);
                let point = self.deals.values().fold(S::Point::identity(), |acc, deal| {
                    acc + evaluate_commitments(&deal.commitments, x)
                });
                (p.id.clone(), point)
            })
            .collect();

        Ok(Accepted {
            share,
            public_key: expected_key,
            public_shares,
        })
    }

    fn try_advance(&mut self) -> std::result::Result<(), TssError> {
        if !self.started || self.finished {
            return Ok(());
        }

        if self.dealer.is_some() {
            // Old committee is done once the whole new committee acknowledged
            let all_acked = self
                .params
                .new_parties
                .iter()
                .all(|p| self.acks.contains_key(&p.id));
            if all_acked {
                info!(party_id = %self.params.party_id, "Resharing completed for old committee");
                self.finished = true;
                return self
                    .end
                    .send(LocalSaveData::placeholder(S::ALGO))
                    .map_err(|_| {
                        self.error(Error::Internal("output channel closed".into()), 2, vec![])
                    });
            }
            return Ok(());
        }

        if self.accepted.is_none() && self.deals.len() == self.params.old_parties.len() {
            let accepted = match self.accept_deals() {
                Ok(accepted) => accepted,
                Err(err) => {
                    for culprit in &err.culprits {
                        self.deals.remove(&culprit.id);
                    }
                    return Err(err);
                }
            };

            debug!("Resharing Round 2: Acknowledge");
            let public_share = S::Point::generator() * accepted.share;
            let ack = ReshareMessage::Ack {
                public_share: encode_point_hex(&public_share),
            };
            let payload = serialize(&ack).map_err(|e| self.error(e, 2, vec![]))?;
            let recipients: Vec<PartyId> = self
                .params
                .old_parties
                .iter()
                .chain(self.new_committee_peers())
                .cloned()
                .collect();
            self.emit(
                Message::to_both_committees(self.params.party_id.clone(), recipients, payload),
                2,
            )?;

            self.acks
                .insert(self.params.party_id.id.clone(), public_share);
            self.accepted = Some(accepted);
        }

        let Some(accepted) = &self.accepted else {
            return Ok(());
        };
        let all_acked = self
            .params
            .new_parties
            .iter()
            .all(|p| self.acks.contains_key(&p.id));
        if !all_acked {
            return Ok(());
        }

        let culprits: Vec<PartyId> = self
            .new_committee_peers()
            .filter(|p| self.acks.get(&p.id) != accepted.public_shares.get(&p.id))
            .cloned()
            .collect();
        if !culprits.is_empty() {
            for culprit in &culprits {
                self.acks.remove(&culprit.id);
            }
            return Err(self.error(
                Error::VerificationFailed("acknowledged share does not match deals".into()),
                2,
                culprits,
            ));
        }

        let committee = self
            .params
            .new_parties
            .iter()
            .map(|p| CommitteeMember {
                id: p.id.clone(),
                key: p.key.clone(),
                share_index: p.key.share_index(),
                public_share: accepted
                    .public_shares
                    .get(&p.id)
                    .map(encode_point)
                    .unwrap_or_default(),
            })
            .collect();

        let save = LocalSaveData {
            algo: S::ALGO,
            threshold: self.params.new_threshold,
            party: self.params.party_id.id.clone(),
            share_index: self.params.party_id.key.share_index(),
            share: encode_scalar(&accepted.share),
            public_key: encode_point(&accepted.public_key),
            committee,
        };

        info!(
            party_id = %self.params.party_id,
            public_key = hex::encode(&save.public_key),
            "Resharing completed for new committee"
        );

        self.finished = true;
        self.end
            .send(save)
            .map_err(|_| self.error(Error::Internal("output channel closed".into()), 2, vec![]))
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
            old_parties = self.params.old_parties.len(),
            new_parties = self.params.new_parties.len(),
            old_committee = self.dealer.is_some(),
            "Starting resharing"
        );

        if let Some(dealer) = &self.dealer {
            self.deal(dealer)?;
        }
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

        let message: ReshareMessage =
            deserialize(wire).map_err(|e| self.error(e, 0, vec![from.clone()]))?;
        let round = message.round();

        match message {
            ReshareMessage::Deal {
                public_key,
                commitments,
                share,
            } => {
                if self.dealer.is_some() {
                    return Err(self.error(
                        Error::VerificationFailed("deal sent to the old committee".into()),
                        round,
                        vec![from.clone()],
                    ));
                }
                if !self.params.old_parties.contains(from) {
                    return Err(self.error(Error::UnknownParty(from.to_string()), round, vec![]));
                }
                let decode = || -> Result<Deal<S>> {
                    Ok(Deal {
                        public_key: decode_point_hex(&public_key)?,
                        commitments: commitments
                            .iter()
                            .map(|c| decode_point_hex(c))
                            .collect::<Result<Vec<_>>>()?,
                        share: decode_scalar_hex(&share)?,
                    })
                };
                let deal = decode().map_err(|e| self.error(e, round, vec![from.clone()]))?;
                if deal.commitments.len() != self.params.new_threshold + 1 {
                    return Err(self.error(
                        Error::VerificationFailed(format!(
                            "expected {} commitments, got {}",
                            self.params.new_threshold + 1,
                            deal.commitments.len()
                        )),
                        round,
                        vec![from.clone()],
                    ));
                }
                self.deals.insert(from.id.clone(), deal);
            }
            ReshareMessage::Ack { public_share } => {
                if !self.params.new_parties.contains(from) {
                    return Err(self.error(Error::UnknownParty(from.to_string()), round, vec![]));
                }
                let point = decode_point_hex::<S::Point>(&public_share)
                    .map_err(|e| self.error(e, round, vec![from.clone()]))?;
                self.acks.insert(from.id.clone(), point);
            }
        }

        self.try_advance()?;
        Ok(true)
    }

    fn waiting_for(&self) -> Vec<PartyId> {
        if self.dealer.is_some() {
            return self
                .params
                .new_parties
                .iter()
                .filter(|p| !self.acks.contains_key(&p.id))
                .cloned()
                .collect();
        }
        if self.accepted.is_none() {
            return self
                .params
                .old_parties
                .iter()
                .filter(|p| !self.deals.contains_key(&p.id))
                .cloned()
                .collect();
        }
        self.new_committee_peers()
            .filter(|p| !self.acks.contains_key(&p.id))
            .cloned()
            .collect()
    }
}
