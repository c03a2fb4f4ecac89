//! Configuration management.
//!
//! Scalar settings come from the environment (.env supported); the pool
//! descriptor list, flash-borrow provider table, and any venue-policy
//! overrides come from a TOML file. Configuration errors fail fast at
//! startup with messages naming the offending pool and field.

use crate::arbitrage::executor::ExecutionMode;
use crate::arbitrage::optimizer::OptimizerConfig;
use crate::types::{
    FlashProvider, PoolDescriptor, VenueFamily, VenuePolicy, DEFAULT_VENUE_POLICIES,
};
use alloy::primitives::Address;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Everything that affects core behavior. Constructed once at startup,
/// shared read-only.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: ExecutionMode,
    pub rpc_url: String,
    pub chain_id: u64,
    pub data_dir: PathBuf,

    // Snapshotter
    pub poll_interval_ms: u64,
    pub max_retries: u32,

    // Detector
    pub delta_threshold_percent: f64,
    pub min_liquidity_floor: f64,

    // Optimizer
    pub optimizer: OptimizerConfig,

    // Analyzer
    pub min_profit_threshold: f64,
    pub max_slippage: f64,
    pub default_input_amount: f64,
    pub gas_price_gwei: f64,
    pub gas_per_swap: u64,
    pub venue_policies: BTreeMap<VenueFamily, VenuePolicy>,

    // Executor
    pub staleness_ms: u64,
    pub pending_timeout_ms: u64,

    // Collaborators
    pub private_key: Option<String>,
    pub aggregator_address: Option<Address>,

    pub pools: Vec<PoolDescriptor>,
    pub flash_providers: Vec<FlashProvider>,
}

/// On-disk shape of the pool table file.
#[derive(Debug, Deserialize)]
struct PoolTableFile {
    #[serde(default)]
    pools: Vec<PoolDescriptor>,
    #[serde(default)]
    providers: Vec<FlashProvider>,
    #[serde(default)]
    policies: BTreeMap<VenueFamily, VenuePolicy>,
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {}={}: {}", key, raw, e)),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load from environment plus the pool table file. `mode` and
    /// `pool_table` come from the CLI when given.
    pub fn load(mode: Option<ExecutionMode>, pool_table: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let table_path = pool_table
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("POOL_TABLE").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("pools.toml"));
        let table_raw = std::fs::read_to_string(&table_path)
            .with_context(|| format!("cannot read pool table {}", table_path.display()))?;
        let table: PoolTableFile = toml::from_str(&table_raw)
            .with_context(|| format!("cannot parse pool table {}", table_path.display()))?;

        let mut venue_policies = DEFAULT_VENUE_POLICIES.clone();
        venue_policies.extend(table.policies);

        let config = Self {
            // Report is the safe default when nothing is selected.
            mode: mode.unwrap_or_default(),
            rpc_url: std::env::var("RPC_URL").context("RPC_URL not set")?,
            chain_id: env_or("CHAIN_ID", 8453u64)?,
            data_dir: PathBuf::from(
                std::env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()),
            ),

            poll_interval_ms: env_or("POLL_INTERVAL_MS", 1_000u64)?,
            max_retries: env_or("MAX_RETRIES", 3u32)?,

            delta_threshold_percent: env_or("DELTA_THRESHOLD_PERCENT", 0.5f64)?,
            min_liquidity_floor: env_or("MIN_LIQUIDITY_FLOOR", 0.0f64)?,

            optimizer: OptimizerConfig {
                max_iterations: env_or("OPTIMIZER_MAX_ITERATIONS", 20u32)?,
                timeout_ms: env_or("OPTIMIZER_TIMEOUT_MS", 100u64)?,
                min_amount: env_or("OPTIMIZER_MIN_AMOUNT", 1.0f64)?,
                max_amount: env_or("OPTIMIZER_MAX_AMOUNT", 1000.0f64)?,
                convergence_threshold: env_or("OPTIMIZER_CONVERGENCE_THRESHOLD", 1.0f64)?,
                fallback_amount: env_or("OPTIMIZER_FALLBACK_AMOUNT", 1.0f64)?,
            },

            min_profit_threshold: env_or("MIN_PROFIT_THRESHOLD", 0.0f64)?,
            max_slippage: env_or("MAX_SLIPPAGE", 0.005f64)?,
            default_input_amount: env_or("DEFAULT_INPUT_AMOUNT", 10.0f64)?,
            gas_price_gwei: env_or("GAS_PRICE_GWEI", 0.05f64)?,
            gas_per_swap: env_or("GAS_PER_SWAP", 150_000u64)?,
            venue_policies,

            staleness_ms: env_or("STALENESS_MS", 200u64)?,
            pending_timeout_ms: env_or("PENDING_TIMEOUT_MS", 300_000u64)?,

            private_key: std::env::var("PRIVATE_KEY").ok(),
            aggregator_address: match std::env::var("AGGREGATOR_ADDRESS") {
                Ok(raw) => Some(
                    raw.parse()
                        .map_err(|e| anyhow::anyhow!("invalid AGGREGATOR_ADDRESS {}: {}", raw, e))?,
                ),
                Err(_) => None,
            },

            pools: table.pools,
            flash_providers: table.providers,
        };

        config.validate()?;
        Ok(config)
    }

    /// Detector freshness horizon, derived from the polling cadence.
    pub fn staleness_horizon_ms(&self) -> u64 {
        self.poll_interval_ms * 2
    }

    /// Configuration-fatal checks. Everything here aborts startup.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for pool in &self.pools {
            if !seen.insert(pool.id.as_str()) {
                bail!("duplicate pool id '{}'", pool.id);
            }
            if pool.family.is_discrete_bin() && pool.fee.is_none() {
                bail!(
                    "pool '{}' ({}): discrete-bin pools require the binStep fee parameter",
                    pool.id,
                    pool.symbol
                );
            }
            if pool.token0 == pool.token1 {
                bail!("pool '{}' ({}): token0 equals token1", pool.id, pool.symbol);
            }
        }

        if self.mode != ExecutionMode::Report {
            if self.private_key.is_none() {
                bail!("PRIVATE_KEY is required in {} mode", self.mode);
            }
            if self.aggregator_address.is_none() {
                bail!("AGGREGATOR_ADDRESS is required in {} mode", self.mode);
            }
            if self.flash_providers.is_empty() {
                bail!("at least one flash-borrow provider is required in {} mode", self.mode);
            }
        }

        Ok(())
    }
}
