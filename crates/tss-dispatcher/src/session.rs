//! Session state shared by every dispatcher variant
//!
//! A session is driven by several tasks: the caller's `start`, one outbound
//! pump per engine output queue, one task waiting for the engine result and
//! one timer. The first of them to reach a terminal state wins; the others
//! are ignored. `done` then folds the sticky error fields and the winning
//! terminal into a single [`Outcome`].

use crate::commitment::SetCommitter;
use crate::keystore::Keystore;
use crate::participant::Committee;
use crate::result::{ErrorResult, Outcome, SessionHeader, TimeoutResult};
use crate::transport::{CommitteeTag, Envelope, Transport};
use crate::{DispatchError, DispatcherConfig, Result};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tss_engine::{Message, Party, PartyId, TssError};

/// Everything a node hands to the sessions it runs
#[derive(Clone)]
pub struct NodeContext {
    /// Local account
    pub account: String,
    pub config: DispatcherConfig,
    pub transport: Arc<dyn Transport>,
    pub keystore: Arc<dyn Keystore>,
    pub committer: Arc<dyn SetCommitter>,
}

impl NodeContext {
    pub fn new(
        account: impl Into<String>,
        transport: Arc<dyn Transport>,
        keystore: Arc<dyn Keystore>,
        committer: Arc<dyn SetCommitter>,
    ) -> Self {
        Self {
            account: account.into(),
            config: DispatcherConfig::default(),
            transport,
            keystore,
            committer,
        }
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    Created = 0,
    Running = 1,
    Completed = 2,
    TimedOut = 3,
    Errored = 4,
}

impl SessionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionStatus::Running,
            2 => SessionStatus::Completed,
            3 => SessionStatus::TimedOut,
            4 => SessionStatus::Errored,
            _ => SessionStatus::Created,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::TimedOut | SessionStatus::Errored
        )
    }
}

/// A protocol party shared between the pump, `handle_p2p` and `done`
pub(crate) type Engine = Arc<Mutex<Box<dyn Party>>>;

pub(crate) fn engine(party: Box<dyn Party>) -> Engine {
    Arc::new(Mutex::new(party))
}

/// Committee an engine message is addressed to
pub(crate) fn committee_tag(message: &Message) -> CommitteeTag {
    if message.to_old_and_new_committees {
        CommitteeTag::Both
    } else if message.to_old_committee {
        CommitteeTag::Old
    } else {
        CommitteeTag::New
    }
}

/// Progress of the single `start` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartPhase {
    Idle,
    Starting,
    Running,
    /// `start` returned an error; the session never runs
    Failed,
}

/// Claim on a session's `start`, handed out by [`SessionState::begin`].
///
/// Dropping it without [`Starting::mark_running`] marks the start as failed,
/// which releases any `done` waiting on it.
pub(crate) struct Starting<'a, R> {
    state: &'a SessionState<R>,
}

impl<R> Starting<'_, R>
where
    R: Into<Outcome> + Send + 'static,
{
    /// Configuration checks passed; `done` may now wait for a terminal
    pub(crate) fn mark_running(self) {
        self.state.set_status(SessionStatus::Running);
        self.state.phase.send_replace(StartPhase::Running);
    }
}

impl<R> Drop for Starting<'_, R> {
    fn drop(&mut self) {
        self.state.phase.send_if_modified(|phase| {
            if *phase == StartPhase::Starting {
                *phase = StartPhase::Failed;
                true
            } else {
                false
            }
        });
    }
}

/// How a session ended
pub(crate) enum Terminal<R> {
    /// The engine produced its output
    Finished(R),
    TimedOut,
    /// An engine failed to start; the cause is in the generic error
    Aborted,
    /// The output could not be turned into a result
    Fatal(DispatchError),
}

pub(crate) struct SessionState<R> {
    pub(crate) ctx: NodeContext,
    pub(crate) header: SessionHeader,
    status: AtomicU8,
    phase: watch::Sender<StartPhase>,
    fired: AtomicBool,
    done_tx: Mutex<Option<oneshot::Sender<Terminal<R>>>>,
    done_rx: Mutex<Option<oneshot::Receiver<Terminal<R>>>>,
    err: Mutex<Option<DispatchError>>,
    tss_err: Mutex<Option<TssError>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl<R> SessionState<R>
where
    R: Into<Outcome> + Send + 'static,
{
    pub(crate) fn new(ctx: NodeContext, header: SessionHeader) -> Arc<Self> {
        let (tx, rx) = oneshot::channel();
        Arc::new(Self {
            ctx,
            header,
            status: AtomicU8::new(SessionStatus::Created as u8),
            phase: watch::channel(StartPhase::Idle).0,
            fired: AtomicBool::new(false),
            done_tx: Mutex::new(Some(tx)),
            done_rx: Mutex::new(Some(rx)),
            err: Mutex::new(None),
            tss_err: Mutex::new(None),
            timer: Mutex::new(None),
        })
    }

    pub(crate) fn session_id(&self) -> &str {
        &self.header.session_id
    }

    pub(crate) fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: SessionStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Claim the session for a single `start`
    pub(crate) fn begin(&self) -> Result<Starting<'_, R>> {
        let claimed = self.phase.send_if_modified(|phase| {
            if *phase == StartPhase::Idle {
                *phase = StartPhase::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(DispatchError::AlreadyStarted);
        }
        let starting = Starting { state: self };
        self.ctx.config.validate()?;
        Ok(starting)
    }

    /// Keep the first generic error
    pub(crate) async fn record_error(&self, err: DispatchError) {
        let mut slot = self.err.lock().await;
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Keep the first protocol error
    pub(crate) async fn record_tss_error(&self, err: TssError) {
        let mut slot = self.tss_err.lock().await;
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Signal the end of the session. Only the first caller wins.
    pub(crate) async fn complete(&self, terminal: Terminal<R>) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(session_id = %self.header.session_id, "late terminal ignored");
            return false;
        }

        let from_timer = matches!(terminal, Terminal::TimedOut);
        self.set_status(match terminal {
            Terminal::Finished(_) => SessionStatus::Completed,
            Terminal::TimedOut => SessionStatus::TimedOut,
            Terminal::Aborted | Terminal::Fatal(_) => SessionStatus::Errored,
        });

        if let Some(tx) = self.done_tx.lock().await.take() {
            // nobody awaiting `done` is fine
            let _ = tx.send(terminal);
        }
        if !from_timer {
            if let Some(timer) = self.timer.lock().await.take() {
                timer.abort();
            }
        }
        true
    }

    async fn arm_timeout(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let timeout = self.ctx.config.session_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(state) = weak.upgrade() {
                if state.complete(Terminal::TimedOut).await {
                    warn!(session_id = %state.header.session_id, ?timeout, "Session timed out");
                }
            }
        });

        let mut timer = self.timer.lock().await;
        if self.fired.load(Ordering::Acquire) {
            handle.abort();
        } else {
            *timer = Some(handle);
        }
    }

    /// Wait out the grace delay, start every engine in order, then arm the
    /// timeout. Returns `false` if an engine refused to start.
    pub(crate) async fn start_engines(self: &Arc<Self>, engines: &[Engine]) -> bool {
        tokio::time::sleep(self.ctx.config.grace_delay).await;

        for engine in engines {
            let started = engine.lock().await.start();
            if let Err(err) = started {
                warn!(session_id = %self.header.session_id, error = %err, "Engine failed to start");
                self.record_error(DispatchError::Protocol(err)).await;
                self.complete(Terminal::Aborted).await;
                return false;
            }
        }

        self.arm_timeout().await;
        true
    }

    /// Send one envelope, recording a failure as the generic error
    pub(crate) async fn send(&self, envelope: Envelope) {
        let recipient = envelope.recipient.clone();
        if let Err(err) = self.ctx.transport.send_msg(envelope).await {
            warn!(session_id = %self.header.session_id, to = %recipient, error = %err, "Send failed");
            self.record_error(err.into()).await;
        }
    }

    /// Fan one engine message out to single-committee recipients
    async fn route(&self, committee: &Committee, me: &PartyId, message: Message) {
        let tag = committee_tag(&message);
        let recipients: Vec<(String, String)> = if message.is_broadcast {
            committee
                .parties()
                .iter()
                .filter(|p| p.id != me.id)
                .map(|p| (p.id.clone(), message.from.moniker.clone()))
                .collect()
        } else {
            message
                .to
                .iter()
                .map(|p| (p.id.clone(), p.moniker.clone()))
                .collect()
        };

        for (recipient, moniker) in recipients {
            self.send(Envelope {
                session_id: self.header.session_id.clone(),
                recipient,
                moniker,
                payload: message.wire_bytes().to_vec(),
                is_broadcast: message.is_broadcast,
                committee: tag,
                origin: None,
            })
            .await;
        }
    }

    /// Drain an engine's outbound queue for the lifetime of the engine
    pub(crate) fn spawn_pump(
        self: &Arc<Self>,
        committee: Committee,
        me: PartyId,
        mut outbound: UnboundedReceiver<Message>,
    ) {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                let Some(state) = weak.upgrade() else {
                    break;
                };
                state.route(&committee, &me, message).await;
            }
        });
    }

    /// Feed one inbound message to an engine
    pub(crate) async fn feed(
        &self,
        engine: &Engine,
        payload: &[u8],
        sender: &PartyId,
        is_broadcast: bool,
    ) {
        let result = {
            let mut party = engine.lock().await;
            if party.party_id() == sender {
                debug!(party_id = %sender, "dropping message from self");
                return;
            }
            party.update_from_bytes(payload, sender, is_broadcast)
        };

        if let Err(err) = result {
            warn!(
                session_id = %self.header.session_id,
                from = %sender,
                error = %err,
                "Engine rejected message"
            );
            self.record_tss_error(err).await;
        }
    }

    /// Peers the engines are still waiting for, by account, first seen first
    async fn pending_accounts(&self, engines: &[Engine]) -> Vec<String> {
        let mut pending = Vec::new();
        for engine in engines {
            pending.extend(engine.lock().await.waiting_for());
        }
        unique_accounts(pending)
    }

    fn error_outcome(&self, culprits: Vec<String>, error: String) -> Outcome {
        let digest = if culprits.is_empty() {
            String::new()
        } else {
            self.ctx
                .committer
                .set_to_commitment(&culprits, self.header.epoch)
        };
        Outcome::Error(ErrorResult {
            header: self.header.clone(),
            culprits,
            error,
            digest,
        })
    }

    /// Await the terminal signal and fold it into an outcome.
    ///
    /// A `start` still in progress is waited for; one that failed or never
    /// happened yields `NotStarted`. Timeout wins over a protocol error,
    /// which wins over a generic error, which wins over the engine result.
    pub(crate) async fn resolve(&self, engines: &[Engine]) -> Result<Outcome> {
        let mut phase = self.phase.subscribe();
        let settled = phase
            .wait_for(|phase| *phase != StartPhase::Starting)
            .await
            .map(|phase| *phase)
            .map_err(|_| DispatchError::Internal("start signal dropped".into()))?;
        if settled != StartPhase::Running {
            return Err(DispatchError::NotStarted);
        }
        let rx = self
            .done_rx
            .lock()
            .await
            .take()
            .ok_or(DispatchError::AlreadyAwaited)?;
        let terminal = rx
            .await
            .map_err(|_| DispatchError::Internal("completion signal dropped".into()))?;

        let finished = match terminal {
            Terminal::TimedOut => {
                let culprits = self.pending_accounts(engines).await;
                warn!(session_id = %self.header.session_id, ?culprits, "Blaming unresponsive peers");
                let digest = self
                    .ctx
                    .committer
                    .set_to_commitment(&culprits, self.header.epoch);
                return Ok(Outcome::Timeout(TimeoutResult {
                    header: self.header.clone(),
                    culprits,
                    digest,
                }));
            }
            Terminal::Fatal(err) => return Err(err),
            Terminal::Finished(result) => Some(result),
            Terminal::Aborted => None,
        };

        if let Some(err) = self.tss_err.lock().await.take() {
            self.set_status(SessionStatus::Errored);
            let culprits = unique_accounts(err.culprits().iter().cloned());
            return Ok(self.error_outcome(culprits, err.to_string()));
        }
        if let Some(err) = self.err.lock().await.take() {
            self.set_status(SessionStatus::Errored);
            return Ok(self.error_outcome(Vec::new(), err.to_string()));
        }

        match finished {
            Some(result) => {
                info!(session_id = %self.header.session_id, key_id = %self.header.key_id, "Session completed");
                Ok(result.into())
            }
            None => Err(DispatchError::Internal(
                "session aborted without a recorded cause".into(),
            )),
        }
    }
}

fn unique_accounts(parties: impl IntoIterator<Item = PartyId>) -> Vec<String> {
    let mut accounts: Vec<String> = Vec::new();
    for party in parties {
        if !accounts.contains(&party.id) {
            accounts.push(party.id);
        }
    }
    accounts
}
