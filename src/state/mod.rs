//! Durable local state.
//!
//! The nonce keeper owns the per-signer submission record; the outcome
//! log is the append-only journal of terminal trade results. Nothing
//! else in the process writes to either file.

pub mod nonce_keeper;
pub mod outcome_log;

pub use nonce_keeper::{NonceError, NonceKeeper, PendingResolution};
pub use outcome_log::OutcomeLog;
