//! In-memory router driving several parties inside one process

use super::Party;
use crate::{Message, TssError};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

/// Delivers messages between locally held parties until nobody has anything
/// left to say
pub struct MemoryRouter {
    parties: Vec<Box<dyn Party>>,
    outbound: Vec<UnboundedReceiver<Message>>,
}

impl MemoryRouter {
    /// Create an empty router
    pub fn new() -> Self {
        Self {
            parties: Vec::new(),
            outbound: Vec::new(),
        }
    }

    /// Add a party together with the receiving end of its outbound channel
    pub fn add(&mut self, party: Box<dyn Party>, outbound: UnboundedReceiver<Message>) {
        self.parties.push(party);
        self.outbound.push(outbound);
    }

    pub fn parties(&self) -> &[Box<dyn Party>] {
        &self.parties
    }

    /// Remove a party from the network and hand it back
    pub fn take_party(&mut self, idx: usize) -> Box<dyn Party> {
        self.outbound.remove(idx);
        self.parties.remove(idx)
    }

    /// Start every party
    pub fn start_all(&mut self) -> Result<(), TssError> {
        for party in &mut self.parties {
            party.start()?;
        }
        Ok(())
    }

    /// Route queued messages until the network is quiet, returning the
    /// number of deliveries
    pub fn run(&mut self) -> Result<usize, TssError> {
        let mut delivered = 0;
        loop {
            let mut pending = Vec::new();
            for rx in &mut self.outbound {
                while let Ok(message) = rx.try_recv() {
                    pending.push(message);
                }
            }
            if pending.is_empty() {
                return Ok(delivered);
            }

            for message in pending {
                let recipients: Vec<usize> = self
                    .parties
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| {
                        let id = p.party_id();
                        if message.to.is_empty() {
                            *id != message.from
                        } else {
                            message.to.contains(id)
                        }
                    })
                    .map(|(idx, _)| idx)
                    .collect();

                // Messages for parties that were never added are lost
                for idx in recipients {
                    debug!(from = %message.from, to = %self.parties[idx].party_id(), "delivering");
                    self.parties[idx].update_from_bytes(
                        message.wire_bytes(),
                        &message.from,
                        message.is_broadcast,
                    )?;
                    delivered += 1;
                }
            }
        }
    }
}

impl Default for MemoryRouter {
    fn default() -> Self {
        Self::new()
    }
}
