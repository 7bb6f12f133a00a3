//! The capability every protocol party exposes to its driver

use crate::{Error, PartyId, TssError};
use serde::{de::DeserializeOwned, Serialize};

/// A message-driven protocol party.
///
/// Outbound messages and the final output are delivered on the channels the
/// party was constructed with; the driver only pushes inbound bytes.
pub trait Party: Send {
    /// Identity this party acts as
    fn party_id(&self) -> &PartyId;

    /// Run the first round
    fn start(&mut self) -> Result<(), TssError>;

    /// Feed one inbound message. Messages may arrive before `start` and in
    /// any order; they are buffered until the round that needs them.
    fn update_from_bytes(
        &mut self,
        wire: &[u8],
        from: &PartyId,
        is_broadcast: bool,
    ) -> Result<bool, TssError>;

    /// Peers whose input the current round still needs
    fn waiting_for(&self) -> Vec<PartyId>;
}

pub(crate) fn serialize<T: Serialize>(value: &T) -> crate::Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))
}

pub(crate) fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> crate::Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
}

/// In-process message router
pub mod memory;

pub use memory::MemoryRouter;
