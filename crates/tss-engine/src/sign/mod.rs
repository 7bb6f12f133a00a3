//! Distributed Signature Generation (DSG) module
//!
//! Two broadcast rounds: nonce commitments, then partial signatures that sum
//! to the final `s`. Each signer weights its key share with its Lagrange
//! coefficient over the signing set.

mod dsg;
mod messages;

pub use dsg::LocalParty;
pub use messages::SignMessage;
