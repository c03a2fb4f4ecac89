//! AMM math kernel.
//!
//! Pure functions over pool state: normalized prices per venue family,
//! output-for-input along a swap step, and virtual reserve depth. No I/O,
//! no global state; every function is deterministic.
//!
//! V3 pools are treated locally as constant product in virtual reserves
//! (L / sqrtP, L * sqrtP). The optimizer and the cost model both quote
//! through `output_for_input`, so the approximation can never disagree
//! with itself.

use crate::types::{PoolReading, PriceSnapshot, SwapStep, VenueFamily};
use alloy::primitives::{Address, U256};

/// Q64.96 scaling factor for V3 sqrt prices: 2^96.
const Q96: f64 = 79_228_162_514_264_337_593_543_950_336.0;

/// Liquidity-book anchor bin: ids above it price token0 richer, below
/// cheaper. 2^23.
pub const BIN_ANCHOR_ID: u32 = 8_388_608;

/// Fixed proportional fee for constant-product V2 venues (0.30%).
pub const V2_FEE_RATE: f64 = 0.003;

/// Lossy widening of a U256 into f64. Reserves (uint112) convert exactly;
/// sqrt prices (uint160) keep 53 bits of precision, which is what the
/// f64 pipeline carries everywhere anyway.
pub fn u256_to_f64(value: U256) -> f64 {
    value
        .as_limbs()
        .iter()
        .enumerate()
        .fold(0.0, |acc, (i, limb)| {
            acc + (*limb as f64) * 2f64.powi(64 * i as i32)
        })
}

fn decimal_adjustment(decimals0: u8, decimals1: u8) -> f64 {
    10f64.powi(decimals0 as i32 - decimals1 as i32)
}

/// token1 per token0 from V2 reserves, decimal adjusted.
/// Returns 0.0 on an empty pool; callers treat non-positive as invalid.
pub fn v2_price(reserve0: U256, reserve1: U256, decimals0: u8, decimals1: u8) -> f64 {
    let r0 = u256_to_f64(reserve0);
    let r1 = u256_to_f64(reserve1);
    if r0 == 0.0 {
        return 0.0;
    }
    (r1 / r0) * decimal_adjustment(decimals0, decimals1)
}

/// token1 per token0 from a V3 sqrt price, decimal adjusted.
///
/// The decimal scaling is applied to the square root BEFORE squaring, so
/// an 18/6-decimal pair never pushes the intermediate through f64
/// underflow.
pub fn v3_price(sqrt_price_x96: U256, decimals0: u8, decimals1: u8) -> f64 {
    let s = u256_to_f64(sqrt_price_x96) / Q96;
    let scaled = s * 10f64.powf((decimals0 as i32 - decimals1 as i32) as f64 / 2.0);
    scaled * scaled
}

/// token1 per token0 from a liquidity-book active bin, decimal adjusted.
///
/// price = (1 + binStep/10_000)^(activeId - 2^23). Computed through
/// logarithms: bin ids sit millions of steps from the anchor and naive
/// exponentiation overflows.
pub fn bin_price(active_id: u32, bin_step_bps: u32, decimals0: u8, decimals1: u8) -> f64 {
    let delta = active_id as i64 - BIN_ANCHOR_ID as i64;
    let log_base = (1.0 + bin_step_bps as f64 / 10_000.0).ln();
    (delta as f64 * log_base).exp() * decimal_adjustment(decimals0, decimals1)
}

/// Proportional fee rate for a venue, before any policy buffer.
/// V3 carries its tier in hundredths of a basis point, the liquidity
/// book its bin step in basis points.
pub fn base_fee_rate(family: VenueFamily, fee_param: Option<u32>) -> f64 {
    match family {
        VenueFamily::ConstantProductV2 => V2_FEE_RATE,
        VenueFamily::ConcentratedLiquidityV3 | VenueFamily::ConcentratedLiquidityV3TickedFee => {
            fee_param.unwrap_or(0) as f64 / 1e6
        }
        VenueFamily::DiscreteBinLiquidityBook => fee_param.unwrap_or(0) as f64 / 1e4,
    }
}

/// Expected output for `amount_in` along one step, in decimal-adjusted
/// token_out units.
///
/// With reserve depth known the step quotes constant product over
/// (reserve_in, reserve_in * price):
///   out = (r_out * x') / (r_in + x'),  x' = x * (1 - fee)
/// Without depth (liquidity-book pools, snapshots missing reserves) the
/// quote degrades to the linear reference price after fees.
pub fn output_for_input(step: &SwapStep, amount_in: f64) -> f64 {
    if amount_in <= 0.0 || step.reference_price <= 0.0 {
        return 0.0;
    }
    let amount_after_fee = amount_in * (1.0 - step.fee_rate);
    match step.virtual_reserve_in {
        Some(reserve_in) if reserve_in > 0.0 => {
            let reserve_out = reserve_in * step.reference_price;
            (reserve_out * amount_after_fee) / (reserve_in + amount_after_fee)
        }
        _ => amount_after_fee * step.reference_price,
    }
}

/// Depth of the `token_in` side of a pool, in decimal-adjusted units.
///
/// V2: the relevant reserve. V3: virtual reserve L / sqrtP (token0 side)
/// or L * sqrtP (token1 side). None when liquidity is zero or the family
/// exposes no depth data, which routes the analyzer to fallback sizing.
pub fn virtual_reserve_in(snapshot: &PriceSnapshot, token_in: Address) -> Option<f64> {
    let d = &snapshot.descriptor;
    let decimals_in = if token_in == d.token0 {
        d.token0_decimals
    } else {
        d.token1_decimals
    };

    let raw = match &snapshot.reading {
        PoolReading::V2 { reserve0, reserve1 } => {
            let reserve = if token_in == d.token0 { reserve0 } else { reserve1 };
            u256_to_f64(*reserve)
        }
        PoolReading::V3 {
            liquidity,
            sqrt_price_x96,
        } => {
            if *liquidity == 0 {
                return None;
            }
            let sqrt_p = u256_to_f64(*sqrt_price_x96) / Q96;
            if sqrt_p <= 0.0 {
                return None;
            }
            if token_in == d.token0 {
                *liquidity as f64 / sqrt_p
            } else {
                *liquidity as f64 * sqrt_p
            }
        }
        PoolReading::DiscreteBin { .. } => return None,
    };

    if raw <= 0.0 {
        return None;
    }
    Some(raw / 10f64.powi(decimals_in as i32))
}
