//! Resharing sessions
//!
//! A node runs up to two engines in one session: an old-committee view that
//! deals its existing share and a new-committee view that receives one. Both
//! write to a single outbound queue, and inbound traffic is routed to the
//! view(s) named by the committee tag.

use crate::keystore::{load_save_data, store_save_data};
use crate::participant::{epoch_index_offset, new_committee_moniker, Committee};
use crate::result::{Outcome, ReshareResult, SessionHeader};
use crate::session::{
    committee_tag, engine, Engine, NodeContext, SessionState, SessionStatus, Terminal,
};
use crate::transport::{CommitteeTag, Envelope};
use crate::{DispatchError, Dispatcher, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, instrument, warn};
use tss_engine::resharing::LocalParty;
use tss_engine::{
    Ed25519, LocalSaveData, Message, Party, PartyId, ReSharingParameters, Secp256k1, SigningAlgo,
};

/// Parameters of a resharing session from `epoch` to `new_epoch`
#[derive(Debug, Clone)]
pub struct ReshareParams {
    pub session_id: String,
    pub key_id: String,
    pub block_height: u64,
    pub algo: SigningAlgo,
    /// Epoch of the share being handed over
    pub epoch: u64,
    pub participants: Vec<String>,
    pub new_epoch: u64,
    pub new_participants: Vec<String>,
}

impl ReshareParams {
    fn header(&self) -> SessionHeader {
        SessionHeader {
            session_id: self.session_id.clone(),
            key_id: self.key_id.clone(),
            epoch: self.new_epoch,
            block_height: self.block_height,
        }
    }
}

/// Committee a message sender belongs to
pub(crate) fn origin_of(old: &Committee, new: &Committee, from: &PartyId) -> Option<CommitteeTag> {
    if new.contains(from) {
        Some(CommitteeTag::New)
    } else if old.contains(from) {
        Some(CommitteeTag::Old)
    } else {
        None
    }
}

fn reshare_party(
    algo: SigningAlgo,
    params: ReSharingParameters,
    key: &LocalSaveData,
    out: UnboundedSender<Message>,
    end: UnboundedSender<LocalSaveData>,
) -> Result<Box<dyn Party>> {
    Ok(match algo {
        SigningAlgo::Ecdsa => Box::new(LocalParty::<Secp256k1>::new(params, key, out, end)?),
        SigningAlgo::Eddsa => Box::new(LocalParty::<Ed25519>::new(params, key, out, end)?),
    })
}

/// Runs the old and/or new committee side of a resharing.
///
/// Only a share produced by the new-committee view ends the session with a
/// [`ReshareResult`]. A node that sits in the old committee alone hands its
/// share over and then waits for the timeout: it reports a `TimeoutResult`
/// whose culprits are the new members that never acknowledged, which is an
/// empty list when the resharing went through.
pub struct ReshareDispatcher {
    state: Arc<SessionState<ReshareResult>>,
    params: ReshareParams,
    old_committee: OnceLock<Committee>,
    new_committee: OnceLock<Committee>,
    old_engine: OnceLock<Engine>,
    new_engine: OnceLock<Engine>,
}

impl ReshareDispatcher {
    pub fn new(ctx: NodeContext, params: ReshareParams) -> Self {
        Self {
            state: SessionState::new(ctx, params.header()),
            params,
            old_committee: OnceLock::new(),
            new_committee: OnceLock::new(),
            old_engine: OnceLock::new(),
            new_engine: OnceLock::new(),
        }
    }

    fn engines(&self) -> Vec<Engine> {
        self.old_engine
            .get()
            .into_iter()
            .chain(self.new_engine.get())
            .cloned()
            .collect()
    }
}

/// Forward both views' traffic. Recipients are deduplicated by account; a
/// node in both committees gets one copy and routes it by committee tag.
fn spawn_pump(
    state: Weak<SessionState<ReshareResult>>,
    old: Committee,
    new: Committee,
    mut outbound: UnboundedReceiver<Message>,
) {
    tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let Some(state) = state.upgrade() else {
                break;
            };
            let committee = committee_tag(&message);
            let origin = origin_of(&old, &new, &message.from);

            let mut seen = HashSet::with_capacity(message.to.len());
            for to in &message.to {
                if !seen.insert(to.id.as_str()) {
                    continue;
                }
                state
                    .send(Envelope {
                        session_id: state.header.session_id.clone(),
                        recipient: to.id.clone(),
                        moniker: to.moniker.clone(),
                        payload: message.wire_bytes().to_vec(),
                        is_broadcast: message.is_broadcast,
                        committee,
                        origin,
                    })
                    .await;
            }
        }
    });
}

/// Persist the new share and build the session result
async fn finish(
    state: &SessionState<ReshareResult>,
    new: &Committee,
    save: LocalSaveData,
) -> Result<ReshareResult> {
    let header = &state.header;
    store_save_data(
        state.ctx.keystore.as_ref(),
        &header.key_id,
        header.epoch,
        &save,
    )
    .await?;

    info!(
        session_id = %header.session_id,
        key_id = %header.key_id,
        epoch = header.epoch,
        public_key = hex::encode(&save.public_key),
        "Key reshared and stored"
    );

    let new_participants = new.accounts().to_vec();
    let digest = state
        .ctx
        .committer
        .set_to_commitment(&new_participants, header.epoch);
    Ok(ReshareResult {
        header: header.clone(),
        new_participants,
        digest,
    })
}

#[async_trait]
impl Dispatcher for ReshareDispatcher {
    fn session_id(&self) -> &str {
        self.state.session_id()
    }

    fn key_id(&self) -> &str {
        &self.params.key_id
    }

    fn status(&self) -> SessionStatus {
        self.state.status()
    }

    #[instrument(skip(self), fields(session_id = %self.params.session_id, new_epoch = self.params.new_epoch))]
    async fn start(&self) -> Result<()> {
        let starting = self.state.begin()?;
        let ctx = &self.state.ctx;
        let params = &self.params;

        let offset = epoch_index_offset(params.new_epoch, ctx.config.epoch_index_modulus);
        let old = Committee::resolve(&params.participants, &params.session_id, 1)?;
        let new = Committee::resolve(
            &params.new_participants,
            &new_committee_moniker(&params.session_id),
            offset + 1,
        )?;
        let old_threshold = old.engine_threshold()?;
        let new_threshold = new.engine_threshold()?;

        let me_old = old.find(&ctx.account).cloned();
        let me_new = new.find(&ctx.account).cloned();
        if me_old.is_none() && me_new.is_none() {
            return Err(DispatchError::SelfNotFound(ctx.account.clone()));
        }

        let (out_tx, out_rx) = unbounded_channel();
        let (end_tx, mut end_rx) = unbounded_channel::<LocalSaveData>();

        let old_party = match me_old {
            Some(me) => {
                let key = load_save_data(ctx.keystore.as_ref(), &params.key_id, params.epoch).await?;
                if key.algo != params.algo {
                    return Err(DispatchError::InvalidConfig(format!(
                        "key {} is an {} key, not {}",
                        params.key_id, key.algo, params.algo
                    )));
                }
                let parameters = ReSharingParameters::new(
                    me,
                    old.parties().clone(),
                    old_threshold,
                    new.parties().clone(),
                    new_threshold,
                )?;
                Some(reshare_party(
                    params.algo,
                    parameters,
                    &key,
                    out_tx.clone(),
                    end_tx.clone(),
                )?)
            }
            None => None,
        };

        let new_party = match me_new {
            Some(me) => {
                let parameters = ReSharingParameters::new(
                    me,
                    old.parties().clone(),
                    old_threshold,
                    new.parties().clone(),
                    new_threshold,
                )?;
                Some(reshare_party(
                    params.algo,
                    parameters,
                    &LocalSaveData::placeholder(params.algo),
                    out_tx,
                    end_tx,
                )?)
            }
            None => None,
        };

        info!(
            old_parties = old.len(),
            old_threshold,
            new_parties = new.len(),
            new_threshold,
            old_view = old_party.is_some(),
            new_view = new_party.is_some(),
            "Starting resharing"
        );

        let mut engines = Vec::with_capacity(2);
        if let Some(party) = old_party {
            let party = engine(party);
            let _ = self.old_engine.set(Arc::clone(&party));
            engines.push(party);
        }
        if let Some(party) = new_party {
            let party = engine(party);
            let _ = self.new_engine.set(Arc::clone(&party));
            engines.push(party);
        }
        let _ = self.old_committee.set(old.clone());
        let _ = self.new_committee.set(new.clone());
        starting.mark_running();

        spawn_pump(Arc::downgrade(&self.state), old, new.clone(), out_rx);

        let weak = Arc::downgrade(&self.state);
        tokio::spawn(async move {
            while let Some(save) = end_rx.recv().await {
                // the old view only reports that it handed its share over
                if save.is_empty() {
                    debug!("Old committee view finished");
                    continue;
                }
                let Some(state) = weak.upgrade() else {
                    return;
                };
                let terminal = match finish(&state, &new, save).await {
                    Ok(result) => Terminal::Finished(result),
                    Err(err) => Terminal::Fatal(err),
                };
                state.complete(terminal).await;
                return;
            }
        });

        self.state.start_engines(&engines).await;
        Ok(())
    }

    async fn done(&self) -> Result<Outcome> {
        self.state.resolve(&self.engines()).await
    }

    async fn handle_p2p(
        &self,
        payload: &[u8],
        from: &str,
        is_broadcast: bool,
        committee: CommitteeTag,
        origin: Option<CommitteeTag>,
    ) {
        let (Some(old), Some(new)) = (self.old_committee.get(), self.new_committee.get()) else {
            warn!(session_id = %self.params.session_id, from, "Message before engine start dropped");
            return;
        };
        let sender = match origin {
            Some(CommitteeTag::Old) => old.find(from),
            Some(CommitteeTag::New) => new.find(from),
            _ => None,
        };
        let Some(sender) = sender else {
            warn!(session_id = %self.params.session_id, from, ?origin, "Message from unknown sender dropped");
            return;
        };

        if matches!(committee, CommitteeTag::Old | CommitteeTag::Both) {
            if let Some(engine) = self.old_engine.get() {
                self.state.feed(engine, payload, sender, is_broadcast).await;
            }
        }
        if matches!(committee, CommitteeTag::New | CommitteeTag::Both) {
            if let Some(engine) = self.new_engine.get() {
                self.state.feed(engine, payload, sender, is_broadcast).await;
            }
        }
    }
}
