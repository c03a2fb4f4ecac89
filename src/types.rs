// Core data structures shared across the opportunity pipeline.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Wall-clock unix timestamp in milliseconds.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// AMM venue families we can read and trade against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VenueFamily {
    /// Uniswap V2 style constant product (x * y = k), proportional fee.
    ConstantProductV2,
    /// Uniswap V3 style concentrated liquidity (sqrtPriceX96 + in-range L).
    ConcentratedLiquidityV3,
    /// V3 fork whose fee can be re-ticked by governance mid-flight.
    /// Same read/decode path as V3, stricter profit threshold.
    ConcentratedLiquidityV3TickedFee,
    /// Trader Joe style liquidity book: discrete bins at geometric prices,
    /// the active bin id is the single hot-path read.
    DiscreteBinLiquidityBook,
}

impl VenueFamily {
    /// True for both plain V3 and the ticked-fee variant (shared decode path).
    pub fn is_v3(&self) -> bool {
        matches!(
            self,
            VenueFamily::ConcentratedLiquidityV3 | VenueFamily::ConcentratedLiquidityV3TickedFee
        )
    }

    pub fn is_v2(&self) -> bool {
        matches!(self, VenueFamily::ConstantProductV2)
    }

    pub fn is_discrete_bin(&self) -> bool {
        matches!(self, VenueFamily::DiscreteBinLiquidityBook)
    }
}

impl fmt::Display for VenueFamily {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VenueFamily::ConstantProductV2 => write!(f, "constant-product-v2"),
            VenueFamily::ConcentratedLiquidityV3 => write!(f, "concentrated-liquidity-v3"),
            VenueFamily::ConcentratedLiquidityV3TickedFee => {
                write!(f, "concentrated-liquidity-v3-with-ticked-fee")
            }
            VenueFamily::DiscreteBinLiquidityBook => write!(f, "discrete-bin-liquidity-book"),
        }
    }
}

/// Static pool configuration, loaded once at startup and shared read-only.
///
/// `fee` meaning depends on family: hundredths of a basis point for V3
/// (500 = 0.05%), basis points for the liquidity-book bin step (15 = 0.15%
/// per bin). V2 pools carry no fee parameter (fixed 0.30%).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolDescriptor {
    /// Stable identifier, unique across the configured set.
    pub id: String,
    pub family: VenueFamily,
    pub address: Address,
    pub token0: Address,
    pub token1: Address,
    pub token0_decimals: u8,
    pub token1_decimals: u8,
    #[serde(default)]
    pub fee: Option<u32>,
    /// Set for venues whose effective fee can move between reads.
    #[serde(default)]
    pub dynamic_fee: bool,
    /// Human label for logs, e.g. "WETH/USDC".
    pub symbol: String,
}

impl PoolDescriptor {
    /// Token pair key for cross-venue matching.
    pub fn pair_key(&self) -> (Address, Address) {
        (self.token0, self.token1)
    }
}

/// Family-specific raw fields captured alongside the normalized price.
#[derive(Debug, Clone)]
pub enum PoolReading {
    V2 { reserve0: U256, reserve1: U256 },
    V3 { liquidity: u128, sqrt_price_x96: U256 },
    DiscreteBin { active_id: u32 },
}

/// One pool's decoded state for one polling round.
///
/// Invariant: `price > 0` unless `stale` is set; a stale snapshot is never
/// consumed by the detector.
#[derive(Debug, Clone)]
pub struct PriceSnapshot {
    pub descriptor: Arc<PoolDescriptor>,
    pub block_number: u64,
    /// Wall-clock acquisition time, unix ms.
    pub taken_at_ms: u64,
    /// token1 per token0, decimal adjusted.
    pub price: f64,
    /// token0 per token1, decimal adjusted.
    pub inverse_price: f64,
    pub reading: PoolReading,
    pub stale: bool,
}

impl PriceSnapshot {
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.taken_at_ms)
    }

    /// Fresh means non-stale and younger than the given horizon.
    pub fn is_fresh(&self, now_ms: u64, horizon_ms: u64) -> bool {
        !self.stale && self.price > 0.0 && self.age_ms(now_ms) < horizon_ms
    }
}

/// Cross-venue price discrepancy on one token pair, oriented buy -> sell
/// (`sell.price > buy.price`).
#[derive(Debug, Clone)]
pub struct PriceDelta {
    pub buy: PriceSnapshot,
    pub sell: PriceSnapshot,
    /// (sell - buy) / buy, as a percentage.
    pub delta_percent: f64,
    /// max of the two snapshot timestamps, unix ms.
    pub timestamp_ms: u64,
}

/// One swap leg of an arbitrage path.
#[derive(Debug, Clone)]
pub struct SwapStep {
    pub family: VenueFamily,
    pub pool: Address,
    pub token_in: Address,
    pub token_out: Address,
    pub decimals_in: u8,
    pub decimals_out: u8,
    /// Expected token_out per token_in at the reference snapshot.
    pub reference_price: f64,
    /// Proportional venue fee, volatility buffer already applied.
    pub fee_rate: f64,
    /// Raw venue fee parameter from the descriptor (V3 tier, bin step),
    /// carried through for on-chain leg routing.
    pub venue_fee: Option<u32>,
    /// token_in side depth in decimal-adjusted units, when known.
    /// None signals the optimizer to fall back to the default input size.
    pub virtual_reserve_in: Option<f64>,
}

/// Ordered swap sequence starting and ending in the borrowed base token.
#[derive(Debug, Clone)]
pub struct SwapPath {
    pub steps: Vec<SwapStep>,
    pub base_token: Address,
    pub label: String,
}

/// Why the optimizer stopped short of convergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    Timeout,
    MaxIterations,
    NoProfitableSize,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FallbackReason::Timeout => write!(f, "timeout"),
            FallbackReason::MaxIterations => write!(f, "max_iterations"),
            FallbackReason::NoProfitableSize => write!(f, "no_profitable_size"),
        }
    }
}

/// Outcome of one ternary-search sizing run.
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    pub optimal_amount: f64,
    pub expected_profit: f64,
    pub iterations: u32,
    pub duration_ms: u64,
    pub converged: bool,
    pub fallback_reason: Option<FallbackReason>,
}

/// Cost side of the profit model, all in base-token units.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub flash_borrow_fee: f64,
    pub gas_cost: f64,
    pub slippage_cost: f64,
    pub total_cost: f64,
}

impl CostBreakdown {
    pub fn new(flash_borrow_fee: f64, gas_cost: f64, slippage_cost: f64) -> Self {
        Self {
            flash_borrow_fee,
            gas_cost,
            slippage_cost,
            total_cost: flash_borrow_fee + gas_cost + slippage_cost,
        }
    }
}

/// A sized, costed, policy-checked arbitrage candidate.
///
/// Invariant: `net_profit = gross_profit - costs.total_cost`.
#[derive(Debug, Clone)]
pub struct ArbitrageOpportunity {
    /// `<pair>-<block>-<detection_ms>`, stable across events and journal.
    pub id: String,
    pub path: SwapPath,
    /// Base-token input, decimal adjusted.
    pub input_amount: f64,
    /// Absent when no liquidity-depth data allowed optimization.
    pub optimization: Option<OptimizationResult>,
    pub gross_profit: f64,
    pub costs: CostBreakdown,
    pub net_profit: f64,
    pub net_profit_percent: f64,
    /// Flash-borrow provider key selected by the analyzer.
    pub flash_provider: String,
    pub block_number: u64,
    /// Stamped at analysis completion; the staleness gate measures from here.
    pub timestamp_ms: u64,
}

/// Durable per-signer submission record, `<data_dir>/nonce.json`.
///
/// Invariant: at most one pending transaction; pending is resolved before
/// any new submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonceRecord {
    pub address: Address,
    /// Next nonce to use.
    pub nonce: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    /// Unix ms of the in-flight broadcast, present iff tx_hash is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<u64>,
}

impl NonceRecord {
    pub fn has_pending(&self) -> bool {
        self.tx_hash.is_some()
    }
}

/// Terminal status of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeStatus {
    Success,
    Revert,
    SimulationRevert,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OutcomeStatus::Success => write!(f, "success"),
            OutcomeStatus::Revert => write!(f, "revert"),
            OutcomeStatus::SimulationRevert => write!(f, "simulation-revert"),
        }
    }
}

/// One line of the append-only `<data_dir>/trades.jsonl` journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeOutcome {
    pub id: String,
    pub detected_at_ms: u64,
    pub submitted_at_ms: u64,
    pub path_label: String,
    pub input_amount: f64,
    pub estimated_profit: f64,
    pub status: OutcomeStatus,
    pub gross_profit: f64,
    pub gas_cost_l2: f64,
    pub data_cost_l1: f64,
    pub revert_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
}

/// Flash-borrow aggregator entry from the pool table file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashProvider {
    pub key: String,
    pub address: Address,
    /// Provider fee in basis points of the borrowed amount. Zero for
    /// fee-free providers.
    pub fee_bps: u32,
}

/// Per-venue risk policy, applied multiplicatively by the analyzer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VenuePolicy {
    /// Multiplier on the venue's base fee rate.
    pub fee_buffer: f64,
    /// Multiplier on the minimum-profit threshold.
    pub profit_threshold_multiplier: f64,
}

impl Default for VenuePolicy {
    fn default() -> Self {
        Self {
            fee_buffer: 1.0,
            profit_threshold_multiplier: 1.0,
        }
    }
}

/// Default policy table. The liquidity book gets a volatility-accumulator
/// fee buffer and a stricter profit bar; ticked-fee V3 forks get a 2x
/// profit bar against fee manipulation between read and execution.
pub static DEFAULT_VENUE_POLICIES: once_cell::sync::Lazy<BTreeMap<VenueFamily, VenuePolicy>> =
    once_cell::sync::Lazy::new(|| {
        let mut table = BTreeMap::new();
        table.insert(
            VenueFamily::DiscreteBinLiquidityBook,
            VenuePolicy {
                fee_buffer: 1.5,
                profit_threshold_multiplier: 1.33,
            },
        );
        table.insert(
            VenueFamily::ConcentratedLiquidityV3TickedFee,
            VenuePolicy {
                fee_buffer: 1.0,
                profit_threshold_multiplier: 2.0,
            },
        );
        table
    });
