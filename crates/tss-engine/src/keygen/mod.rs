//! Distributed Key Generation (DKG) module
//!
//! Feldman-VSS key generation: every party deals a random polynomial,
//! broadcasts commitments to it and sends each peer its evaluation. The key
//! share is the sum of everything received.

mod dkg;
mod messages;

pub use dkg::{LocalParty, PreParams};
pub use messages::KeygenMessage;
