//! Latest-snapshot storage.
//!
//! One entry per pool id, overwritten each polling round. The Snapshotter
//! is the only writer; the Detector reads value copies. Backed by DashMap
//! so reads never block the polling task.

use crate::types::PriceSnapshot;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Keyed latest-snapshot map, cheaply cloneable handle.
#[derive(Debug)]
pub struct SnapshotStore {
    snapshots: Arc<DashMap<String, PriceSnapshot>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self {
            snapshots: Arc::new(DashMap::new()),
        }
    }

    /// Overwrite the latest snapshot for a pool.
    pub fn insert(&self, snapshot: PriceSnapshot) {
        debug!(
            "snapshot: {} block={} price={:.8}",
            snapshot.descriptor.id, snapshot.block_number, snapshot.price
        );
        self.snapshots
            .insert(snapshot.descriptor.id.clone(), snapshot);
    }

    pub fn get(&self, pool_id: &str) -> Option<PriceSnapshot> {
        self.snapshots.get(pool_id).map(|entry| entry.clone())
    }

    /// Flag an existing snapshot stale without discarding its raw fields.
    pub fn mark_stale(&self, pool_id: &str) {
        if let Some(mut entry) = self.snapshots.get_mut(pool_id) {
            entry.stale = true;
        }
    }

    /// All other pools quoting the same ordered token pair.
    pub fn peers_for_pair(&self, snapshot: &PriceSnapshot) -> Vec<PriceSnapshot> {
        let pair = snapshot.descriptor.pair_key();
        let own_id = &snapshot.descriptor.id;
        self.snapshots
            .iter()
            .filter(|entry| {
                entry.value().descriptor.pair_key() == pair && entry.key() != own_id
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn all(&self) -> Vec<PriceSnapshot> {
        self.snapshots
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// (pool_count, oldest_block, newest_block) for round summaries.
    pub fn stats(&self) -> (usize, u64, u64) {
        let count = self.snapshots.len();
        let oldest = self
            .snapshots
            .iter()
            .map(|e| e.value().block_number)
            .min()
            .unwrap_or(0);
        let newest = self
            .snapshots
            .iter()
            .map(|e| e.value().block_number)
            .max()
            .unwrap_or(0);
        (count, oldest, newest)
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for SnapshotStore {
    fn clone(&self) -> Self {
        Self {
            snapshots: Arc::clone(&self.snapshots),
        }
    }
}
