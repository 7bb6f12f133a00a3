//! # TSS Engine
//!
//! Threshold signing protocols driven as message-passing state machines.
//!
//! This crate provides:
//! - Distributed Key Generation (Feldman VSS)
//! - Distributed Signature Generation for ECDSA (secp256k1) and EdDSA (ed25519)
//! - Resharing of an existing key from one committee to another
//!
//! ## Driving a party
//!
//! Every protocol exposes a `LocalParty` implementing [`Party`]. The caller
//! owns the transport: outgoing [`Message`]s appear on the `out` channel given
//! at construction, incoming wire bytes are fed with
//! [`Party::update_from_bytes`], and the final result arrives on the `end`
//! channel.
//!
//! ```rust,ignore
//! use tss_engine::{keygen, Parameters, Secp256k1};
//!
//! let (out_tx, out_rx) = tokio::sync::mpsc::unbounded_channel();
//! let (end_tx, end_rx) = tokio::sync::mpsc::unbounded_channel();
//! let mut party = keygen::LocalParty::<Secp256k1>::new(params, None, out_tx, end_tx);
//! party.start()?;
//! ```

pub mod error;
pub mod keygen;
pub mod mpc;
pub(crate) mod poly;
pub mod resharing;
pub mod sign;
pub mod suite;
pub mod types;

#[cfg(test)]
mod testing;

pub use error::{Error, Result, TssError};
pub use mpc::{MemoryRouter, Party};
pub use suite::{Ed25519, Secp256k1, Suite};
pub use types::*;

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
