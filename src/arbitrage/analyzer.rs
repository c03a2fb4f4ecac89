//! Opportunity analyzer.
//!
//! Turns a price delta into a sized, costed two-leg path or a rejection.
//! The borrowed base token is token1 of the pair: leg 1 buys token0 on
//! the lower-priced pool, leg 2 sells it back on the higher-priced pool.
//!
//! The profit function handed to the optimizer quotes both legs through
//! the math kernel and subtracts the same cost model used for the final
//! breakdown, so the sizing objective and the emitted numbers can never
//! drift apart.

use crate::arbitrage::optimizer::{self, OptimizerConfig};
use crate::config::Config;
use crate::events::{BotEvent, EventSender};
use crate::pool::math;
use crate::types::{
    now_ms, ArbitrageOpportunity, CostBreakdown, FlashProvider, PriceDelta, PriceSnapshot,
    SwapPath, SwapStep, VenueFamily, VenuePolicy,
};
use std::collections::BTreeMap;
use tracing::{debug, info};

pub struct OpportunityAnalyzer {
    events: EventSender,
    optimizer: OptimizerConfig,
    min_profit_threshold: f64,
    max_slippage: f64,
    default_input_amount: f64,
    gas_price_gwei: f64,
    gas_per_swap: u64,
    flash_providers: Vec<FlashProvider>,
    venue_policies: BTreeMap<VenueFamily, VenuePolicy>,
}

impl OpportunityAnalyzer {
    pub fn new(config: &Config, events: EventSender) -> Self {
        Self {
            events,
            optimizer: config.optimizer.clone(),
            min_profit_threshold: config.min_profit_threshold,
            max_slippage: config.max_slippage,
            default_input_amount: config.default_input_amount,
            gas_price_gwei: config.gas_price_gwei,
            gas_per_swap: config.gas_per_swap,
            flash_providers: config.flash_providers.clone(),
            venue_policies: config.venue_policies.clone(),
        }
    }

    fn policy_for(&self, family: VenueFamily) -> VenuePolicy {
        self.venue_policies
            .get(&family)
            .copied()
            .unwrap_or_default()
    }

    /// Cheapest configured flash-borrow provider, or a zero-fee
    /// placeholder in report-only setups with no provider table.
    fn select_provider(&self) -> (String, u32) {
        self.flash_providers
            .iter()
            .min_by_key(|p| p.fee_bps)
            .map(|p| (p.key.clone(), p.fee_bps))
            .unwrap_or_else(|| ("none".to_string(), 0))
    }

    fn step_from(&self, snapshot: &PriceSnapshot, base_to_other: bool) -> SwapStep {
        let d = &snapshot.descriptor;
        let policy = self.policy_for(d.family);
        let fee_rate = math::base_fee_rate(d.family, d.fee) * policy.fee_buffer;

        let (token_in, token_out, decimals_in, decimals_out, reference_price) = if base_to_other {
            // token1 (base) -> token0
            (
                d.token1,
                d.token0,
                d.token1_decimals,
                d.token0_decimals,
                snapshot.inverse_price,
            )
        } else {
            // token0 -> token1 (base)
            (
                d.token0,
                d.token1,
                d.token0_decimals,
                d.token1_decimals,
                snapshot.price,
            )
        };

        SwapStep {
            family: d.family,
            pool: d.address,
            token_in,
            token_out,
            decimals_in,
            decimals_out,
            reference_price,
            fee_rate,
            venue_fee: d.fee,
            virtual_reserve_in: math::virtual_reserve_in(snapshot, token_in),
        }
    }

    fn cost_model(&self, input_amount: f64, num_steps: usize, provider_fee_bps: u32) -> CostBreakdown {
        let flash_borrow_fee = input_amount * provider_fee_bps as f64 / 10_000.0;
        let gas_cost = self.gas_per_swap as f64 * num_steps as f64 * self.gas_price_gwei * 1e-9;
        let slippage_cost = input_amount * self.max_slippage;
        CostBreakdown::new(flash_borrow_fee, gas_cost, slippage_cost)
    }

    fn gross_profit(path: &[SwapStep], input_amount: f64) -> f64 {
        let mut amount = input_amount;
        for step in path {
            amount = math::output_for_input(step, amount);
        }
        amount - input_amount
    }

    /// Analyze one delta. Emits `opportunityFound` / `opportunityRejected`
    /// and returns the opportunity when it survives the policy gates.
    pub fn analyze(&self, delta: &PriceDelta) -> Option<ArbitrageOpportunity> {
        let buy = &delta.buy;
        let sell = &delta.sell;
        let symbol = &buy.descriptor.symbol;

        let steps = vec![self.step_from(buy, true), self.step_from(sell, false)];
        let (provider_key, provider_fee_bps) = self.select_provider();
        let num_steps = steps.len();

        // Sizing: optimize only when every leg exposes depth data.
        let depth_known = steps.iter().all(|s| s.virtual_reserve_in.is_some());
        let (input_amount, optimization) = if depth_known {
            let hi = self
                .optimizer
                .max_amount
                .min(self.default_input_amount * 100.0);
            let profit_fn = |amount: f64| {
                Self::gross_profit(&steps, amount)
                    - self.cost_model(amount, num_steps, provider_fee_bps).total_cost
            };
            let result = optimizer::optimize(&self.optimizer, self.optimizer.min_amount, hi, profit_fn);
            debug!(
                "{}: sizing {} iterations in {}ms -> {:.6}",
                symbol, result.iterations, result.duration_ms, result.optimal_amount
            );
            (result.optimal_amount, Some(result))
        } else {
            (self.default_input_amount, None)
        };

        let gross_profit = Self::gross_profit(&steps, input_amount);
        let costs = self.cost_model(input_amount, num_steps, provider_fee_bps);
        let net_profit = gross_profit - costs.total_cost;
        let net_profit_percent = if input_amount > 0.0 {
            net_profit / input_amount * 100.0
        } else {
            0.0
        };

        let block_number = buy.block_number.max(sell.block_number);
        let id = format!("{}-{}-{}", symbol, block_number, delta.timestamp_ms);

        // Venue policies combine by taking the strictest multiplier in
        // the path.
        let (policy_family, threshold_multiplier) = steps
            .iter()
            .map(|s| {
                (
                    s.family,
                    self.policy_for(s.family).profit_threshold_multiplier,
                )
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .unwrap_or((buy.descriptor.family, 1.0));
        let effective_threshold = self.min_profit_threshold * threshold_multiplier;

        if net_profit < effective_threshold || net_profit <= 0.0 {
            let reason = if self.min_profit_threshold > 0.0 && threshold_multiplier > 1.0 {
                format!(
                    "net profit {:.6} below {:.2}x threshold {:.6} for {} venue",
                    net_profit, threshold_multiplier, effective_threshold, policy_family
                )
            } else if net_profit < effective_threshold && effective_threshold > 0.0 {
                format!(
                    "net profit {:.6} below threshold {:.6}",
                    net_profit, effective_threshold
                )
            } else {
                format!("no positive net profit ({:.6})", net_profit)
            };
            debug!("{}: rejected: {}", symbol, reason);
            self.events
                .emit(BotEvent::OpportunityRejected { id, reason });
            return None;
        }

        let label = format!(
            "{} buy:{} sell:{}",
            symbol, buy.descriptor.id, sell.descriptor.id
        );
        let opportunity = ArbitrageOpportunity {
            id,
            path: SwapPath {
                steps,
                base_token: buy.descriptor.token1,
                label,
            },
            input_amount,
            optimization,
            gross_profit,
            costs,
            net_profit,
            net_profit_percent,
            flash_provider: provider_key,
            block_number,
            // Stamped at analysis completion: the staleness gate budget
            // starts here.
            timestamp_ms: now_ms(),
        };

        info!(
            "{}: opportunity {:.6} net ({:.3}%) on {:.4} in, spread {:.3}%",
            symbol, net_profit, net_profit_percent, input_amount, delta.delta_percent
        );
        self.events
            .emit(BotEvent::OpportunityFound(opportunity.clone()));
        Some(opportunity)
    }
}
