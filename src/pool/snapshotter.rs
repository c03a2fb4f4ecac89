//! Pool price snapshotter.
//!
//! One `poll()` per round: every configured pool's hot-path state is
//! fetched in a single batched read, decoded per venue family, checked
//! against the math invariants, and written into the snapshot store. A
//! pool failing `max_retries` consecutive rounds is marked stale and
//! stays out of detector input until a read succeeds again.
//!
//! Per-pool errors are isolated: one bad pool never poisons the round.

use crate::chain::ChainClient;
use crate::events::{BotEvent, EventSender};
use crate::pool::math;
use crate::pool::store::SnapshotStore;
use crate::types::{now_ms, PoolDescriptor, PoolReading, PriceSnapshot};
use alloy::primitives::{Address, Bytes, U256};
use alloy::sol;
use alloy::sol_types::SolCall;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

sol! {
    function getReserves() external view returns (uint112 reserve0, uint112 reserve1, uint32 blockTimestampLast);
    function slot0() external view returns (uint160 sqrtPriceX96, int24 tick, uint16 observationIndex, uint16 observationCardinality, uint16 observationCardinalityNext, uint8 feeProtocol, bool unlocked);
    function liquidity() external view returns (uint128 liquidity);
    function getActiveId() external view returns (uint24 activeId);
}

/// Per-pool read/decode failure. Isolated to the pool that produced it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("batched read returned no data for {call} call")]
    MissingReturnData { call: &'static str },
    #[error("return data decode failed for {call} call: {message}")]
    Decode { call: &'static str, message: String },
    #[error("pool reserves are empty")]
    EmptyReserves,
    #[error("decoded price is not positive")]
    NonPositivePrice,
    #[error("discrete-bin pool is missing its binStep fee parameter")]
    MissingBinStep,
}

/// One pool's failure within an otherwise successful round.
#[derive(Debug, Clone)]
pub struct PoolRoundError {
    pub pool_id: String,
    pub error: SnapshotError,
    /// This failure crossed the retry threshold.
    pub now_stale: bool,
}

/// What one polling round produced.
#[derive(Debug, Clone)]
pub struct RoundResult {
    pub snapshots: Vec<PriceSnapshot>,
    pub errors: Vec<PoolRoundError>,
    pub block_number: u64,
}

/// Batched reader of pool state into `SnapshotStore`.
pub struct PoolSnapshotter {
    descriptors: Vec<Arc<PoolDescriptor>>,
    chain: Arc<dyn ChainClient>,
    store: SnapshotStore,
    events: EventSender,
    max_retries: u32,
    /// Consecutive failed polls per pool id.
    failures: HashMap<String, u32>,
}

impl PoolSnapshotter {
    pub fn new(
        descriptors: Vec<Arc<PoolDescriptor>>,
        chain: Arc<dyn ChainClient>,
        store: SnapshotStore,
        events: EventSender,
        max_retries: u32,
    ) -> Self {
        Self {
            descriptors,
            chain,
            store,
            events,
            max_retries,
            failures: HashMap::new(),
        }
    }

    /// Calldata for one pool's hot-path reads. V3 needs two sub-calls
    /// (slot0 + in-range liquidity), the other families one.
    fn calls_for(descriptor: &PoolDescriptor) -> Vec<(Address, Bytes)> {
        let address = descriptor.address;
        if descriptor.family.is_v2() {
            vec![(address, getReservesCall {}.abi_encode().into())]
        } else if descriptor.family.is_v3() {
            vec![
                (address, slot0Call {}.abi_encode().into()),
                (address, liquidityCall {}.abi_encode().into()),
            ]
        } else {
            vec![(address, getActiveIdCall {}.abi_encode().into())]
        }
    }

    fn decode_v2(descriptor: &PoolDescriptor, data: &Bytes) -> Result<(f64, PoolReading), SnapshotError> {
        let decoded = getReservesCall::abi_decode_returns(data).map_err(|e| SnapshotError::Decode {
            call: "getReserves",
            message: e.to_string(),
        })?;
        let reserve0 = U256::from(decoded.reserve0);
        let reserve1 = U256::from(decoded.reserve1);
        if reserve0.is_zero() || reserve1.is_zero() {
            return Err(SnapshotError::EmptyReserves);
        }
        let price = math::v2_price(
            reserve0,
            reserve1,
            descriptor.token0_decimals,
            descriptor.token1_decimals,
        );
        if price <= 0.0 || !price.is_finite() {
            return Err(SnapshotError::NonPositivePrice);
        }
        Ok((price, PoolReading::V2 { reserve0, reserve1 }))
    }

    fn decode_v3(
        descriptor: &PoolDescriptor,
        slot0_data: &Bytes,
        liquidity_data: &Bytes,
    ) -> Result<(f64, PoolReading), SnapshotError> {
        let slot0 = slot0Call::abi_decode_returns(slot0_data).map_err(|e| SnapshotError::Decode {
            call: "slot0",
            message: e.to_string(),
        })?;
        let liquidity =
            liquidityCall::abi_decode_returns(liquidity_data).map_err(|e| SnapshotError::Decode {
                call: "liquidity",
                message: e.to_string(),
            })?;

        let sqrt_price_x96 = U256::from(slot0.sqrtPriceX96);
        let price = math::v3_price(
            sqrt_price_x96,
            descriptor.token0_decimals,
            descriptor.token1_decimals,
        );
        if price <= 0.0 || !price.is_finite() {
            return Err(SnapshotError::NonPositivePrice);
        }
        Ok((
            price,
            PoolReading::V3 {
                liquidity,
                sqrt_price_x96,
            },
        ))
    }

    fn decode_bin(descriptor: &PoolDescriptor, data: &Bytes) -> Result<(f64, PoolReading), SnapshotError> {
        let bin_step = descriptor.fee.ok_or(SnapshotError::MissingBinStep)?;
        let decoded = getActiveIdCall::abi_decode_returns(data).map_err(|e| SnapshotError::Decode {
            call: "getActiveId",
            message: e.to_string(),
        })?;
        let active_id = decoded.to::<u32>();
        let price = math::bin_price(
            active_id,
            bin_step,
            descriptor.token0_decimals,
            descriptor.token1_decimals,
        );
        if price <= 0.0 || !price.is_finite() {
            return Err(SnapshotError::NonPositivePrice);
        }
        Ok((price, PoolReading::DiscreteBin { active_id }))
    }

    /// One batched read of every configured pool.
    pub async fn poll(&mut self) -> Result<RoundResult> {
        let mut calls: Vec<(Address, Bytes)> = Vec::new();
        let mut spans: Vec<usize> = Vec::with_capacity(self.descriptors.len());
        for descriptor in &self.descriptors {
            let pool_calls = Self::calls_for(descriptor);
            spans.push(pool_calls.len());
            calls.extend(pool_calls);
        }

        let batch = self
            .chain
            .batch_call(&calls)
            .await
            .context("pool snapshot batch read failed")?;
        if batch.returns.len() != calls.len() {
            return Err(anyhow::anyhow!(
                "batched read returned {} entries for {} calls",
                batch.returns.len(),
                calls.len()
            ));
        }

        let mut snapshots = Vec::with_capacity(self.descriptors.len());
        let mut errors = Vec::new();
        let mut cursor = 0usize;

        for (descriptor, span) in self.descriptors.iter().zip(spans) {
            let returns = &batch.returns[cursor..cursor + span];
            cursor += span;

            let decoded = Self::decode_pool(descriptor, returns);
            match decoded {
                Ok((price, reading)) => {
                    self.failures.remove(&descriptor.id);
                    let snapshot = PriceSnapshot {
                        descriptor: Arc::clone(descriptor),
                        block_number: batch.block_number,
                        taken_at_ms: now_ms(),
                        price,
                        inverse_price: 1.0 / price,
                        reading,
                        stale: false,
                    };
                    self.store.insert(snapshot.clone());
                    self.events.emit(BotEvent::PriceUpdate(snapshot.clone()));
                    snapshots.push(snapshot);
                }
                Err(error) => {
                    let count = self.failures.entry(descriptor.id.clone()).or_insert(0);
                    *count += 1;
                    let now_stale = *count == self.max_retries;
                    if now_stale {
                        self.store.mark_stale(&descriptor.id);
                        warn!(
                            "pool {} stale after {} consecutive failed polls: {}",
                            descriptor.id, count, error
                        );
                    } else {
                        debug!(
                            "pool {} read failed ({}/{}): {}",
                            descriptor.id, count, self.max_retries, error
                        );
                    }
                    self.events.emit(BotEvent::PoolError {
                        pool_id: descriptor.id.clone(),
                        message: error.to_string(),
                        now_stale,
                    });
                    errors.push(PoolRoundError {
                        pool_id: descriptor.id.clone(),
                        error,
                        now_stale,
                    });
                }
            }
        }

        Ok(RoundResult {
            snapshots,
            errors,
            block_number: batch.block_number,
        })
    }

    fn decode_pool(
        descriptor: &PoolDescriptor,
        returns: &[Option<Bytes>],
    ) -> Result<(f64, PoolReading), SnapshotError> {
        if descriptor.family.is_v2() {
            let data = returns[0].as_ref().ok_or(SnapshotError::MissingReturnData {
                call: "getReserves",
            })?;
            Self::decode_v2(descriptor, data)
        } else if descriptor.family.is_v3() {
            let slot0_data = returns[0]
                .as_ref()
                .ok_or(SnapshotError::MissingReturnData { call: "slot0" })?;
            let liquidity_data = returns[1]
                .as_ref()
                .ok_or(SnapshotError::MissingReturnData { call: "liquidity" })?;
            Self::decode_v3(descriptor, slot0_data, liquidity_data)
        } else {
            let data = returns[0].as_ref().ok_or(SnapshotError::MissingReturnData {
                call: "getActiveId",
            })?;
            Self::decode_bin(descriptor, data)
        }
    }
}
