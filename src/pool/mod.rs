//! Pool-facing half of the pipeline.
//!
//! Handles snapshot storage, batched price acquisition, and the pure AMM
//! math used for pricing and output estimation.

pub mod math;
pub mod snapshotter;
pub mod store;

pub use snapshotter::{PoolSnapshotter, RoundResult};
pub use store::SnapshotStore;
