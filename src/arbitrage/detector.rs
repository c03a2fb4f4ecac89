//! Cross-venue delta detector.
//!
//! Holds no state of its own: on each fresh snapshot it scans the store
//! for other pools quoting the same ordered token pair and emits a
//! buy -> sell oriented `PriceDelta` for every discrepancy at or above
//! the configured threshold. Thin pools are excluded so phantom spreads
//! against near-empty venues never reach the analyzer.

use crate::events::{BotEvent, EventSender};
use crate::pool::math;
use crate::pool::store::SnapshotStore;
use crate::types::{now_ms, PriceDelta, PriceSnapshot};
use tracing::debug;

pub struct DeltaDetector {
    store: SnapshotStore,
    events: EventSender,
    /// Minimum |Δ| in percent to emit.
    delta_threshold_percent: f64,
    /// Snapshots older than this never participate.
    staleness_horizon_ms: u64,
    /// Base-token depth below which a pool is ignored.
    min_liquidity_floor: f64,
}

impl DeltaDetector {
    pub fn new(
        store: SnapshotStore,
        events: EventSender,
        delta_threshold_percent: f64,
        staleness_horizon_ms: u64,
        min_liquidity_floor: f64,
    ) -> Self {
        Self {
            store,
            events,
            delta_threshold_percent,
            staleness_horizon_ms,
            min_liquidity_floor,
        }
    }

    /// A pool participates when its base-token (token1) side carries at
    /// least the configured depth. Families without depth data (the
    /// liquidity book) pass; the analyzer falls back to default sizing
    /// for them anyway.
    fn has_depth(&self, snapshot: &PriceSnapshot) -> bool {
        if self.min_liquidity_floor <= 0.0 {
            return true;
        }
        match math::virtual_reserve_in(snapshot, snapshot.descriptor.token1) {
            Some(depth) => depth >= self.min_liquidity_floor,
            None => true,
        }
    }

    /// Compare one fresh snapshot against its peers. Deltas come back in
    /// peer iteration order; each is also emitted as an event.
    pub fn on_snapshot(&self, snapshot: &PriceSnapshot) -> Vec<PriceDelta> {
        let now = now_ms();
        if !snapshot.is_fresh(now, self.staleness_horizon_ms) || !self.has_depth(snapshot) {
            return Vec::new();
        }

        let mut deltas = Vec::new();
        for peer in self.store.peers_for_pair(snapshot) {
            if !peer.is_fresh(now, self.staleness_horizon_ms) || !self.has_depth(&peer) {
                continue;
            }

            // Equal prices carry no signal.
            let (buy, sell) = if peer.price > snapshot.price {
                (snapshot.clone(), peer)
            } else if snapshot.price > peer.price {
                (peer, snapshot.clone())
            } else {
                continue;
            };

            let delta_percent = (sell.price - buy.price) / buy.price * 100.0;
            if delta_percent < self.delta_threshold_percent {
                debug!(
                    "{}: spread {:.4}% below {:.4}% threshold",
                    buy.descriptor.symbol, delta_percent, self.delta_threshold_percent
                );
                continue;
            }

            let delta = PriceDelta {
                timestamp_ms: buy.taken_at_ms.max(sell.taken_at_ms),
                buy,
                sell,
                delta_percent,
            };
            self.events.emit(BotEvent::Delta(delta.clone()));
            deltas.push(delta);
        }

        deltas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;
    use crate::types::{PoolDescriptor, PoolReading, VenueFamily};
    use alloy::primitives::{Address, U256};
    use std::sync::Arc;

    fn v2_snapshot(id: &str, weth_reserve: u64, usdc_reserve: u64, taken_at_ms: u64) -> PriceSnapshot {
        // USDC is token0 (sorts first), WETH is token1 and the base.
        let reserve0 = U256::from(usdc_reserve) * U256::from(10u64).pow(U256::from(6u64));
        let reserve1 = U256::from(weth_reserve) * U256::from(10u64).pow(U256::from(18u64));
        let descriptor = Arc::new(PoolDescriptor {
            id: id.to_string(),
            family: VenueFamily::ConstantProductV2,
            address: Address::repeat_byte(5),
            token0: Address::repeat_byte(1),
            token1: Address::repeat_byte(2),
            token0_decimals: 6,
            token1_decimals: 18,
            fee: None,
            dynamic_fee: false,
            symbol: "WETH/USDC".to_string(),
        });
        let price = math::v2_price(reserve0, reserve1, 6, 18);
        PriceSnapshot {
            descriptor,
            block_number: 100,
            taken_at_ms,
            price,
            inverse_price: 1.0 / price,
            reading: PoolReading::V2 { reserve0, reserve1 },
            stale: false,
        }
    }

    fn detector(store: SnapshotStore, threshold: f64, floor: f64) -> DeltaDetector {
        let (events, _rx) = event_channel();
        DeltaDetector::new(store, events, threshold, 60_000, floor)
    }

    #[test]
    fn test_emits_oriented_delta_above_threshold() {
        let store = SnapshotStore::new();
        let now = now_ms();
        // Pool a: 2000 USDC/WETH -> price (WETH per USDC) = 1/2000
        // Pool b: 2050 USDC/WETH -> price = 1/2050 (lower)
        let a = v2_snapshot("a", 10_000, 20_000_000, now);
        let b = v2_snapshot("b", 10_000, 20_500_000, now);
        store.insert(a.clone());
        store.insert(b.clone());

        let deltas = detector(store, 0.5, 0.0).on_snapshot(&a);
        assert_eq!(deltas.len(), 1);
        let delta = &deltas[0];
        // The lower-priced pool is the buy side.
        assert_eq!(delta.buy.descriptor.id, "b");
        assert_eq!(delta.sell.descriptor.id, "a");
        assert!(delta.sell.price > delta.buy.price);
        // (1/2000 - 1/2050) / (1/2050) = 2.5%
        assert!((delta.delta_percent - 2.5).abs() < 1e-9);
        assert_eq!(delta.timestamp_ms, now);
    }

    #[test]
    fn test_below_threshold_is_silent() {
        let store = SnapshotStore::new();
        let now = now_ms();
        let a = v2_snapshot("a", 10_000, 20_000_000, now);
        let b = v2_snapshot("b", 10_000, 20_020_000, now); // 0.1% spread
        store.insert(a.clone());
        store.insert(b);

        assert!(detector(store, 0.5, 0.0).on_snapshot(&a).is_empty());
    }

    #[test]
    fn test_tie_in_price_is_no_emission() {
        let store = SnapshotStore::new();
        let now = now_ms();
        let a = v2_snapshot("a", 10_000, 20_000_000, now);
        let b = v2_snapshot("b", 10_000, 20_000_000, now);
        store.insert(a.clone());
        store.insert(b);

        assert!(detector(store, 0.0, 0.0).on_snapshot(&a).is_empty());
    }

    #[test]
    fn test_stale_peer_is_excluded() {
        let store = SnapshotStore::new();
        let now = now_ms();
        let a = v2_snapshot("a", 10_000, 20_000_000, now);
        let mut b = v2_snapshot("b", 10_000, 20_500_000, now);
        b.stale = true;
        store.insert(a.clone());
        store.insert(b);

        assert!(detector(store, 0.5, 0.0).on_snapshot(&a).is_empty());
    }

    #[test]
    fn test_aged_out_peer_is_excluded() {
        let store = SnapshotStore::new();
        let now = now_ms();
        let a = v2_snapshot("a", 10_000, 20_000_000, now);
        let b = v2_snapshot("b", 10_000, 20_500_000, now.saturating_sub(120_000));
        store.insert(a.clone());
        store.insert(b);

        assert!(detector(store, 0.5, 0.0).on_snapshot(&a).is_empty());
    }

    #[test]
    fn test_thin_pool_is_excluded_by_liquidity_floor() {
        let store = SnapshotStore::new();
        let now = now_ms();
        let a = v2_snapshot("a", 10_000, 20_000_000, now);
        // Same 2.5% spread but only 2 WETH of depth.
        let b = v2_snapshot("b", 2, 4_100, now);
        store.insert(a.clone());
        store.insert(b);

        // Floor of 100 WETH keeps the thin pool out.
        assert!(detector(store.clone(), 0.5, 100.0).on_snapshot(&a).is_empty());
        // Without the floor the delta comes through.
        assert_eq!(detector(store, 0.5, 0.0).on_snapshot(&a).len(), 1);
    }
}
