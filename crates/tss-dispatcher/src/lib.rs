//! # TSS Dispatcher
//!
//! Drives one threshold-signature protocol run per session between
//! validator nodes: key generation, signing, and resharing of a key from
//! one committee to the next across an epoch boundary.
//!
//! A session is created with [`dispatcher_for`], started with
//! [`Dispatcher::start`] and awaited with [`Dispatcher::done`]. Inbound peer
//! traffic is pushed in through [`Dispatcher::handle_p2p`] while the session
//! runs; outbound traffic leaves through the node's [`Transport`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use tss_dispatcher::{dispatcher_for, NodeContext, SessionParams, SessionRequest};
//!
//! let session = dispatcher_for(SessionRequest::Keygen(params), ctx);
//! network.register("alice", &session);
//! session.start().await?;
//! let commitment = session.done().await?.commitment();
//! ```

pub mod commitment;
pub mod config;
pub mod error;
pub mod keygen;
pub mod keystore;
pub mod participant;
pub mod reshare;
pub mod result;
pub mod session;
pub mod sign;
pub mod transport;

pub use commitment::{ElectionCommitter, SetCommitter};
pub use config::DispatcherConfig;
pub use error::{DispatchError, Result};
pub use keygen::{KeygenDispatcher, SessionParams};
pub use keystore::{key_path, Keystore, KeystoreError, MemoryKeystore};
pub use reshare::{ReshareDispatcher, ReshareParams};
pub use result::{
    Commitment, CommitmentKind, CommitmentMetadata, ErrorResult, KeyGenResult, KeySignResult,
    Outcome, ReshareResult, ResultType, SessionHeader, TimeoutResult,
};
pub use session::{NodeContext, SessionStatus};
pub use sign::SignDispatcher;
pub use transport::{
    CommitteeTag, Envelope, MemoryNetwork, MemoryTransport, Transport, TransportError,
};

use async_trait::async_trait;
use std::sync::Arc;

/// One protocol run as seen by the node that owns it
#[async_trait]
pub trait Dispatcher: Send + Sync {
    fn session_id(&self) -> &str;

    fn key_id(&self) -> &str;

    fn status(&self) -> SessionStatus;

    /// Resolve identities, wait out the grace delay and start the engine(s).
    ///
    /// Configuration errors fail here and leave the session unstarted.
    async fn start(&self) -> Result<()>;

    /// Wait for the session to end. Resolves once; later calls fail.
    async fn done(&self) -> Result<Outcome>;

    /// Deliver one peer message. Failures are recorded on the session.
    async fn handle_p2p(
        &self,
        payload: &[u8],
        from: &str,
        is_broadcast: bool,
        committee: CommitteeTag,
        origin: Option<CommitteeTag>,
    );
}

/// What a node is asked to run
#[derive(Debug, Clone)]
pub enum SessionRequest {
    Keygen(SessionParams),
    Sign {
        params: SessionParams,
        message: Vec<u8>,
    },
    Reshare(ReshareParams),
}

impl SessionRequest {
    pub fn session_id(&self) -> &str {
        match self {
            SessionRequest::Keygen(params) => &params.session_id,
            SessionRequest::Sign { params, .. } => &params.session_id,
            SessionRequest::Reshare(params) => &params.session_id,
        }
    }
}

/// Build the dispatcher variant for `request`
pub fn dispatcher_for(request: SessionRequest, ctx: NodeContext) -> Arc<dyn Dispatcher> {
    match request {
        SessionRequest::Keygen(params) => Arc::new(KeygenDispatcher::new(ctx, params)),
        SessionRequest::Sign { params, message } => {
            Arc::new(SignDispatcher::new(ctx, params, message))
        }
        SessionRequest::Reshare(params) => Arc::new(ReshareDispatcher::new(ctx, params)),
    }
}

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
