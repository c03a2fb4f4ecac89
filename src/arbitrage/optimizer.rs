//! Input sizing by ternary search.
//!
//! Maximizes a caller-supplied profit function over an input interval,
//! bounded in both iterations and wall time. The profit function is a
//! plain stack closure evaluated synchronously; this is the pipeline's
//! cancellation-free zone and must never suspend.
//!
//! The best (amount, profit) pair ever evaluated is tracked separately
//! from the shrinking interval: the objective is only approximately
//! unimodal once costs are subtracted, and the final midpoint can sit on
//! the wrong side of a kink.

use crate::types::{FallbackReason, OptimizationResult};
use std::time::Instant;

/// Search bounds and budgets. Defaults follow the sizing envelope of a
/// two-leg flash borrow: range [1, 1000] base tokens, 20 iterations,
/// 100 ms.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub max_iterations: u32,
    pub timeout_ms: u64,
    pub min_amount: f64,
    pub max_amount: f64,
    /// Interval width at which the search is considered converged.
    pub convergence_threshold: f64,
    /// Safe output when no profitable size exists.
    pub fallback_amount: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            timeout_ms: 100,
            min_amount: 1.0,
            max_amount: 1000.0,
            convergence_threshold: 1.0,
            fallback_amount: 1.0,
        }
    }
}

/// Ternary search for the input maximizing `profit_fn` on [lo, hi].
///
/// Termination is checked on entry to each iteration, in order: wall
/// time, iteration budget, interval convergence. Each iteration keeps
/// the richer two-thirds of the interval (ties keep the lower side).
pub fn optimize<F>(config: &OptimizerConfig, lo: f64, hi: f64, profit_fn: F) -> OptimizationResult
where
    F: Fn(f64) -> f64,
{
    let start = Instant::now();
    let mut lo = lo.max(0.0);
    let mut hi = hi.max(lo);
    let mut iterations = 0u32;
    let mut best_amount = config.fallback_amount;
    let mut best_profit = f64::NEG_INFINITY;

    let (converged, fallback_reason) = loop {
        if start.elapsed().as_millis() as u64 > config.timeout_ms {
            break (false, Some(FallbackReason::Timeout));
        }
        if iterations >= config.max_iterations {
            if best_profit > 0.0 {
                break (false, Some(FallbackReason::MaxIterations));
            }
            break (false, Some(FallbackReason::NoProfitableSize));
        }
        if hi - lo < config.convergence_threshold {
            break (true, None);
        }

        let third = (hi - lo) / 3.0;
        let m1 = lo + third;
        let m2 = hi - third;
        let f1 = profit_fn(m1);
        let f2 = profit_fn(m2);

        if f1 > best_profit {
            best_profit = f1;
            best_amount = m1;
        }
        if f2 > best_profit {
            best_profit = f2;
            best_amount = m2;
        }

        if f1 >= f2 {
            hi = m2;
        } else {
            lo = m1;
        }
        iterations += 1;
    };

    let duration_ms = start.elapsed().as_millis() as u64;

    if best_profit > 0.0 {
        OptimizationResult {
            optimal_amount: best_amount,
            expected_profit: best_profit,
            iterations,
            duration_ms,
            converged,
            fallback_reason,
        }
    } else {
        // No profitable size anywhere in the interval.
        OptimizationResult {
            optimal_amount: config.fallback_amount,
            expected_profit: 0.0,
            iterations,
            duration_ms,
            converged: false,
            fallback_reason: Some(FallbackReason::NoProfitableSize),
        }
    }
}
