//! Cross-venue AMM arbitrage agent.
//!
//! Detects price discrepancies across constant-product, concentrated-
//! liquidity, and discrete-bin pools, sizes each opportunity against a
//! cost model, and reports, simulates, or atomically submits the
//! resulting flash-borrow transaction. Submission state survives
//! crashes through a per-signer nonce file and an append-only outcome
//! journal.

pub mod arbitrage;
pub mod chain;
pub mod config;
pub mod events;
pub mod pool;
pub mod state;
pub mod types;

// Re-export commonly used types
pub use arbitrage::{DeltaDetector, ExecutionMode, Executor, OpportunityAnalyzer};
pub use chain::{ChainClient, RpcChainClient, TransactionBuilder};
pub use config::Config;
pub use events::{event_channel, BotEvent};
pub use pool::{PoolSnapshotter, SnapshotStore};
pub use state::{NonceKeeper, OutcomeLog};
pub use types::{ArbitrageOpportunity, PoolDescriptor, PriceSnapshot, VenueFamily};
