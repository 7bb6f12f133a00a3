//! Key resharing module
//!
//! Moves a key from an old committee and threshold to a new one without
//! changing the public key. Every old party re-deals its Lagrange-weighted
//! share to the new committee; new parties sum what they receive and
//! acknowledge to both committees. A node that sits in both committees runs
//! two parties, one per side.

mod messages;
mod rounds;

pub use messages::ReshareMessage;
pub use rounds::LocalParty;
