//! Key generation sessions

use crate::keystore::store_save_data;
use crate::participant::Committee;
use crate::result::{KeyGenResult, Outcome, SessionHeader};
use crate::session::{engine, Engine, NodeContext, SessionState, SessionStatus, Terminal};
use crate::transport::CommitteeTag;
use crate::{DispatchError, Dispatcher, Result};
use async_trait::async_trait;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc::unbounded_channel;
use tracing::{info, instrument, warn};
use tss_engine::keygen::{LocalParty, PreParams};
use tss_engine::{Ed25519, LocalSaveData, Parameters, Party, Secp256k1, SigningAlgo};

/// What a keygen, signing or single-committee session is about
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub session_id: String,
    pub key_id: String,
    pub epoch: u64,
    pub block_height: u64,
    pub algo: SigningAlgo,
    pub participants: Vec<String>,
}

impl SessionParams {
    pub(crate) fn header(&self) -> SessionHeader {
        SessionHeader {
            session_id: self.session_id.clone(),
            key_id: self.key_id.clone(),
            epoch: self.epoch,
            block_height: self.block_height,
        }
    }
}

/// Runs distributed key generation for a fresh `(key_id, epoch)`
pub struct KeygenDispatcher {
    state: Arc<SessionState<KeyGenResult>>,
    params: SessionParams,
    committee: OnceLock<Committee>,
    engine: OnceLock<Engine>,
}

impl KeygenDispatcher {
    pub fn new(ctx: NodeContext, params: SessionParams) -> Self {
        Self {
            state: SessionState::new(ctx, params.header()),
            params,
            committee: OnceLock::new(),
            engine: OnceLock::new(),
        }
    }

    async fn build_party(
        &self,
        parameters: Parameters,
        out: tokio::sync::mpsc::UnboundedSender<tss_engine::Message>,
        end: tokio::sync::mpsc::UnboundedSender<LocalSaveData>,
    ) -> Result<Box<dyn Party>> {
        Ok(match self.params.algo {
            SigningAlgo::Ecdsa => {
                let threshold = parameters.threshold;
                let pre_params = tokio::task::spawn_blocking(move || {
                    PreParams::<Secp256k1>::generate(threshold)
                })
                .await
                .map_err(|e| DispatchError::Internal(format!("pre-params task failed: {e}")))?;
                Box::new(LocalParty::<Secp256k1>::new(
                    parameters,
                    Some(pre_params),
                    out,
                    end,
                ))
            }
            SigningAlgo::Eddsa => Box::new(LocalParty::<Ed25519>::new(parameters, None, out, end)),
        })
    }
}

/// Persist the share and build the session result
async fn finish(
    state: &SessionState<KeyGenResult>,
    committee: &Committee,
    save: LocalSaveData,
) -> Result<KeyGenResult> {
    let header = &state.header;
    store_save_data(
        state.ctx.keystore.as_ref(),
        &header.key_id,
        header.epoch,
        &save,
    )
    .await?;
    let public_key = save.compressed_public_key()?;

    info!(
        session_id = %header.session_id,
        key_id = %header.key_id,
        epoch = header.epoch,
        public_key = hex::encode(&public_key),
        "Key generated and stored"
    );

    let participants = committee.accounts().to_vec();
    let digest = state
        .ctx
        .committer
        .set_to_commitment(&participants, header.epoch);
    Ok(KeyGenResult {
        header: header.clone(),
        public_key,
        participants,
        digest,
    })
}

#[async_trait]
impl Dispatcher for KeygenDispatcher {
    fn session_id(&self) -> &str {
        self.state.session_id()
    }

    fn key_id(&self) -> &str {
        &self.params.key_id
    }

    fn status(&self) -> SessionStatus {
        self.state.status()
    }

    #[instrument(skip(self), fields(session_id = %self.params.session_id, algo = %self.params.algo))]
    async fn start(&self) -> Result<()> {
        let starting = self.state.begin()?;
        let account = &self.state.ctx.account;

        let committee = Committee::resolve(&self.params.participants, &self.params.session_id, 1)?;
        let me = committee
            .find(account)
            .cloned()
            .ok_or_else(|| DispatchError::SelfNotFound(account.clone()))?;
        let threshold = committee.engine_threshold()?;
        let parameters = Parameters::new(me.clone(), committee.parties().clone(), threshold)?;

        let (out_tx, out_rx) = unbounded_channel();
        let (end_tx, mut end_rx) = unbounded_channel();
        let party = engine(self.build_party(parameters, out_tx, end_tx).await?);

        info!(
            parties = committee.len(),
            threshold,
            "Starting key generation"
        );
        let _ = self.committee.set(committee.clone());
        let _ = self.engine.set(Arc::clone(&party));
        starting.mark_running();

        self.state.spawn_pump(committee.clone(), me, out_rx);

        let weak = Arc::downgrade(&self.state);
        tokio::spawn(async move {
            if let Some(save) = end_rx.recv().await {
                let Some(state) = weak.upgrade() else {
                    return;
                };
                let terminal = match finish(&state, &committee, save).await {
                    Ok(result) => Terminal::Finished(result),
                    Err(err) => Terminal::Fatal(err),
                };
                state.complete(terminal).await;
            }
        });

        self.state.start_engines(&[party]).await;
        Ok(())
    }

    async fn done(&self) -> Result<Outcome> {
        let engines: Vec<Engine> = self.engine.get().cloned().into_iter().collect();
        self.state.resolve(&engines).await
    }

    async fn handle_p2p(
        &self,
        payload: &[u8],
        from: &str,
        is_broadcast: bool,
        _committee: CommitteeTag,
        _origin: Option<CommitteeTag>,
    ) {
        let (Some(committee), Some(engine)) = (self.committee.get(), self.engine.get()) else {
            warn!(session_id = %self.params.session_id, from, "Message before engine start dropped");
            return;
        };
        let Some(sender) = committee.find(from) else {
            warn!(session_id = %self.params.session_id, from, "Message from unknown sender dropped");
            return;
        };
        self.state.feed(engine, payload, sender, is_broadcast).await;
    }
}
