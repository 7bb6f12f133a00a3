//! Peer transport boundary and an in-process network

use crate::Dispatcher;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, instrument};

/// Which committee of a resharing session a message is meant for.
/// Keygen and signing traffic is always tagged `New`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitteeTag {
    Old,
    New,
    Both,
}

impl fmt::Display for CommitteeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitteeTag::Old => write!(f, "old"),
            CommitteeTag::New => write!(f, "new"),
            CommitteeTag::Both => write!(f, "both"),
        }
    }
}

/// One protocol message addressed to one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub session_id: String,
    /// Recipient account
    pub recipient: String,
    /// Recipient label
    pub moniker: String,
    pub payload: Vec<u8>,
    pub is_broadcast: bool,
    pub committee: CommitteeTag,
    /// Committee the sender belongs to, resharing only
    pub origin: Option<CommitteeTag>,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("No route to {account} for session {session_id}")]
    NoRoute { session_id: String, account: String },
    #[error("Peer unreachable: {0}")]
    Unreachable(String),
    #[error("Transport closed")]
    Closed,
}

/// Outbound side of the peer network
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_msg(&self, envelope: Envelope) -> Result<(), TransportError>;
}

/// In-process network routing envelopes to registered dispatchers.
///
/// Muted accounts neither send nor receive; their traffic is dropped
/// silently, the way an unresponsive peer looks from the outside.
#[derive(Default)]
pub struct MemoryNetwork {
    routes: DashMap<(String, String), Weak<dyn Dispatcher>>,
    muted: DashSet<String>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Route messages for `account` in the dispatcher's session to it
    pub fn register(&self, account: &str, dispatcher: &Arc<dyn Dispatcher>) {
        self.routes.insert(
            (dispatcher.session_id().to_string(), account.to_string()),
            Arc::downgrade(dispatcher),
        );
    }

    pub fn unregister(&self, session_id: &str, account: &str) {
        self.routes
            .remove(&(session_id.to_string(), account.to_string()));
    }

    pub fn mute(&self, account: &str) {
        self.muted.insert(account.to_string());
    }

    pub fn unmute(&self, account: &str) {
        self.muted.remove(account);
    }

    /// Transport handle sending on behalf of `account`
    pub fn endpoint(self: &Arc<Self>, account: &str) -> MemoryTransport {
        MemoryTransport {
            network: Arc::clone(self),
            account: account.to_string(),
        }
    }

    #[instrument(skip(self, envelope), fields(session_id = %envelope.session_id, to = %envelope.recipient))]
    async fn deliver(&self, from: &str, envelope: Envelope) -> Result<(), TransportError> {
        if self.muted.contains(from) || self.muted.contains(&envelope.recipient) {
            debug!(from, "dropping muted traffic");
            return Ok(());
        }

        let route = (envelope.session_id.clone(), envelope.recipient.clone());
        let dispatcher = self
            .routes
            .get(&route)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::NoRoute {
                session_id: envelope.session_id.clone(),
                account: envelope.recipient.clone(),
            })?
            .upgrade()
            .ok_or_else(|| TransportError::Unreachable(envelope.recipient.clone()))?;

        dispatcher
            .handle_p2p(
                &envelope.payload,
                from,
                envelope.is_broadcast,
                envelope.committee,
                envelope.origin,
            )
            .await;
        Ok(())
    }
}

/// One node's handle on a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    account: String,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_msg(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.network.deliver(&self.account, envelope).await
    }
}
