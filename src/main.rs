//! Process entry point: wires the pipeline and drives the polling loop.
//!
//! Single-task cooperative loop: poll -> detect -> analyze -> execute,
//! strictly in that order, one round at a time. A round that overruns
//! the interval causes the next one to start immediately on completion
//! (tokio's default burst tick behavior). Ctrl-C cancels at the top of
//! the loop, never mid-batched-read and never with an unpersisted
//! pending transaction.

use alloy::signers::local::PrivateKeySigner;
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use flasharb_bot::arbitrage::{DeltaDetector, ExecutionMode, Executor, OpportunityAnalyzer};
use flasharb_bot::chain::{ChainClient, FlashArbTxBuilder, RpcChainClient, TransactionBuilder};
use flasharb_bot::config::Config;
use flasharb_bot::events::{event_channel, BotEvent};
use flasharb_bot::pool::{PoolSnapshotter, SnapshotStore};
use flasharb_bot::state::{NonceKeeper, OutcomeLog};
use flasharb_bot::types::PoolDescriptor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Rounds between periodic summary lines.
const SUMMARY_EVERY_ROUNDS: u64 = 60;

#[derive(Debug, Parser)]
#[command(name = "flasharb-bot", about = "Cross-venue AMM arbitrage agent")]
struct Cli {
    /// Execution mode; report (log only) when not given.
    #[arg(long, value_enum)]
    mode: Option<ExecutionMode>,

    /// Pool table file (pools, flash providers, policy overrides).
    #[arg(long)]
    pools: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.mode, cli.pools.as_deref())?;

    info!("flasharb-bot starting in {} mode", config.mode);
    info!(
        "  chain {} | {} pools | poll {}ms | delta >= {:.2}%",
        config.chain_id,
        config.pools.len(),
        config.poll_interval_ms,
        config.delta_threshold_percent
    );

    run(config).await
}

async fn run(config: Config) -> Result<()> {
    let chain: Arc<dyn ChainClient> = Arc::new(RpcChainClient::new(&config.rpc_url)?);
    let (events, mut event_rx) = event_channel();
    let store = SnapshotStore::new();

    let descriptors: Vec<Arc<PoolDescriptor>> =
        config.pools.iter().cloned().map(Arc::new).collect();
    let mut snapshotter = PoolSnapshotter::new(
        descriptors,
        Arc::clone(&chain),
        store.clone(),
        events.clone(),
        config.max_retries,
    );
    let detector = DeltaDetector::new(
        store.clone(),
        events.clone(),
        config.delta_threshold_percent,
        config.staleness_horizon_ms(),
        config.min_liquidity_floor,
    );
    let analyzer = OpportunityAnalyzer::new(&config, events.clone());

    // Builder and keeper exist only when the mode can touch the chain.
    let (builder, keeper): (Option<Arc<dyn TransactionBuilder>>, Option<NonceKeeper>) =
        if config.mode == ExecutionMode::Report {
            (None, None)
        } else {
            let key = config
                .private_key
                .as_ref()
                .ok_or_else(|| anyhow!("PRIVATE_KEY missing after validation"))?;
            let signer: PrivateKeySigner = key.parse().context("invalid PRIVATE_KEY")?;
            let aggregator = config
                .aggregator_address
                .ok_or_else(|| anyhow!("AGGREGATOR_ADDRESS missing after validation"))?;
            let builder = FlashArbTxBuilder::new(
                signer,
                aggregator,
                config.chain_id,
                config.flash_providers.clone(),
            );
            let keeper = NonceKeeper::load(
                &config.data_dir,
                builder.signer_address(),
                chain.as_ref(),
                config.pending_timeout_ms,
            )
            .await?;
            info!(
                "signer {} at nonce {}",
                builder.signer_address(),
                keeper.current_nonce()
            );
            (Some(Arc::new(builder)), Some(keeper))
        };

    let outcomes = OutcomeLog::new(&config.data_dir)?;
    let mut executor = Executor::new(&config, Arc::clone(&chain), builder, keeper, outcomes, events);

    // Event rendering: components already log their own decisions at
    // info level, so the tap stays at debug.
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            render(&event);
        }
    });

    let mut interval = tokio::time::interval(Duration::from_millis(config.poll_interval_ms));
    let mut rounds: u64 = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested, stopping before the next poll");
                break;
            }
            _ = interval.tick() => {}
        }

        let round_started = Instant::now();
        let round = match snapshotter.poll().await {
            Ok(round) => round,
            Err(e) => {
                error!("polling round failed: {:#}", e);
                continue;
            }
        };
        rounds += 1;

        // Snapshots arrive in configuration order; each new snapshot is
        // compared against its peers. The same discrepancy shows up once
        // per side, so survivors are deduplicated per round and ranked
        // by net profit before execution.
        let mut opportunities = Vec::new();
        let mut seen_pairs = std::collections::HashSet::new();
        for snapshot in &round.snapshots {
            for delta in detector.on_snapshot(snapshot) {
                let pair_key = (
                    delta.buy.descriptor.id.clone(),
                    delta.sell.descriptor.id.clone(),
                );
                if !seen_pairs.insert(pair_key) {
                    continue;
                }
                if let Some(opportunity) = analyzer.analyze(&delta) {
                    opportunities.push(opportunity);
                }
            }
        }
        opportunities.sort_by(|a, b| {
            b.net_profit
                .partial_cmp(&a.net_profit)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // Strictly serial: one opportunity at a time, one nonce at a time.
        for opportunity in &opportunities {
            if let Err(e) = executor.process(opportunity).await {
                error!("execution failed for {}: {:#}", opportunity.id, e);
            }
        }

        if rounds % SUMMARY_EVERY_ROUNDS == 0 {
            let (count, oldest, newest) = store.stats();
            info!(
                "round {}: {} pools (blocks {}..{}), {} errors, {}ms",
                rounds,
                count,
                oldest,
                newest,
                round.errors.len(),
                round_started.elapsed().as_millis()
            );
        }
    }

    Ok(())
}

fn render(event: &BotEvent) {
    match event {
        BotEvent::PriceUpdate(snapshot) => debug!(
            "[event] priceUpdate {} {:.8} @ block {}",
            snapshot.descriptor.id, snapshot.price, snapshot.block_number
        ),
        BotEvent::PoolError {
            pool_id,
            message,
            now_stale,
        } => debug!("[event] error {} stale={} {}", pool_id, now_stale, message),
        BotEvent::Delta(delta) => debug!(
            "[event] delta {} {:.4}% {} -> {}",
            delta.buy.descriptor.symbol,
            delta.delta_percent,
            delta.buy.descriptor.id,
            delta.sell.descriptor.id
        ),
        BotEvent::OpportunityFound(opportunity) => debug!(
            "[event] opportunityFound {} net {:.6}",
            opportunity.id, opportunity.net_profit
        ),
        BotEvent::OpportunityRejected { id, reason } => {
            debug!("[event] opportunityRejected {}: {}", id, reason)
        }
        BotEvent::Submitted { id, tx_hash } => debug!("[event] submitted {} {}", id, tx_hash),
        BotEvent::Confirmed {
            id,
            tx_hash,
            block_number,
        } => debug!("[event] confirmed {} {} @ {}", id, tx_hash, block_number),
        BotEvent::Reverted {
            id,
            tx_hash,
            block_number,
        } => debug!("[event] reverted {} {} @ {}", id, tx_hash, block_number),
    }
}
