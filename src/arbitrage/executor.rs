//! Executor and mode dispatcher.
//!
//! One mode per process lifetime: report logs the opportunity, simulate
//! runs the built transaction through a non-broadcasting call, submit
//! broadcasts it behind the staleness gate. Opportunities are processed
//! strictly serially; there is never a concurrent nonce acquisition for
//! the signer.
//!
//! Submission ordering is deliberate: the pending record is persisted
//! BEFORE the raw transaction leaves the process, so a crash between
//! broadcast and receipt never loses the hash.

use crate::chain::{BuiltTransaction, ChainClient, GasFields, TransactionBuilder};
use crate::config::Config;
use crate::events::{BotEvent, EventSender};
use crate::state::{NonceError, NonceKeeper, OutcomeLog, PendingResolution};
use crate::types::{now_ms, ArbitrageOpportunity, OutcomeStatus, TradeOutcome};
use anyhow::{anyhow, Context, Result};
use clap::ValueEnum;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Gas headroom for the flash-borrow wrapper around the swap legs.
const FLASH_OVERHEAD_GAS: u64 = 300_000;

/// Process execution mode. Report is the safe default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ExecutionMode {
    #[default]
    Report,
    Simulate,
    Submit,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecutionMode::Report => write!(f, "report"),
            ExecutionMode::Simulate => write!(f, "simulate"),
            ExecutionMode::Submit => write!(f, "submit"),
        }
    }
}

pub struct Executor {
    mode: ExecutionMode,
    chain: Arc<dyn ChainClient>,
    builder: Option<Arc<dyn TransactionBuilder>>,
    keeper: Option<NonceKeeper>,
    outcomes: OutcomeLog,
    events: EventSender,
    /// Maximum age of an opportunity at submission, in ms.
    staleness_ms: u64,
    gas_price_gwei: f64,
    gas_per_swap: u64,
}

impl Executor {
    pub fn new(
        config: &Config,
        chain: Arc<dyn ChainClient>,
        builder: Option<Arc<dyn TransactionBuilder>>,
        keeper: Option<NonceKeeper>,
        outcomes: OutcomeLog,
        events: EventSender,
    ) -> Self {
        Self {
            mode: config.mode,
            chain,
            builder,
            keeper,
            outcomes,
            events,
            staleness_ms: config.staleness_ms,
            gas_price_gwei: config.gas_price_gwei,
            gas_per_swap: config.gas_per_swap,
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// The test at exactly the threshold counts as fresh.
    fn is_stale(&self, opportunity: &ArbitrageOpportunity, now_ms: u64) -> bool {
        now_ms.saturating_sub(opportunity.timestamp_ms) > self.staleness_ms
    }

    fn gas_fields(&self, num_steps: usize) -> GasFields {
        let max_fee_per_gas = ((self.gas_price_gwei * 1e9) as u128).max(1);
        GasFields {
            gas_limit: self.gas_per_swap * num_steps as u64 + FLASH_OVERHEAD_GAS,
            max_fee_per_gas,
            max_priority_fee_per_gas: (max_fee_per_gas / 10).max(1),
        }
    }

    fn builder(&self) -> Result<&Arc<dyn TransactionBuilder>> {
        self.builder
            .as_ref()
            .ok_or_else(|| anyhow!("no transaction builder configured for {} mode", self.mode))
    }

    /// Handle one opportunity according to the process mode.
    pub async fn process(&mut self, opportunity: &ArbitrageOpportunity) -> Result<()> {
        match self.mode {
            ExecutionMode::Report => {
                self.report(opportunity);
                Ok(())
            }
            ExecutionMode::Simulate => self.simulate(opportunity).await,
            ExecutionMode::Submit => self.submit(opportunity).await,
        }
    }

    fn report(&self, opportunity: &ArbitrageOpportunity) {
        info!(
            "[report] {} | in {:.4} | gross {:.6} | costs {:.6} (borrow {:.6} gas {:.6} slip {:.6}) | net {:.6} ({:.3}%)",
            opportunity.path.label,
            opportunity.input_amount,
            opportunity.gross_profit,
            opportunity.costs.total_cost,
            opportunity.costs.flash_borrow_fee,
            opportunity.costs.gas_cost,
            opportunity.costs.slippage_cost,
            opportunity.net_profit,
            opportunity.net_profit_percent,
        );
    }

    async fn simulate(&mut self, opportunity: &ArbitrageOpportunity) -> Result<()> {
        let nonce = self.keeper.as_ref().map(|k| k.current_nonce()).unwrap_or(0);
        let gas = self.gas_fields(opportunity.path.steps.len());
        let built = self
            .builder()?
            .build(opportunity, &opportunity.flash_provider, nonce, gas)
            .context("transaction build failed")?;

        match self.chain.call(built.to, built.calldata.clone()).await {
            Ok(_) => {
                info!(
                    "[simulate] {} ok, would broadcast {} for est. profit {:.6}",
                    opportunity.path.label, built.tx_hash, opportunity.net_profit
                );
            }
            Err(e) => {
                warn!("[simulate] {} reverted: {}", opportunity.path.label, e);
                self.record_outcome(opportunity, OutcomeStatus::SimulationRevert, None, None, 0.0);
            }
        }
        Ok(())
    }

    async fn submit(&mut self, opportunity: &ArbitrageOpportunity) -> Result<()> {
        let now = now_ms();
        if self.is_stale(opportunity, now) {
            warn!(
                "[submit] {} stale: {}ms old exceeds {}ms budget, not submitting",
                opportunity.id,
                now.saturating_sub(opportunity.timestamp_ms),
                self.staleness_ms
            );
            return Ok(());
        }

        let keeper = self
            .keeper
            .as_mut()
            .ok_or_else(|| anyhow!("no nonce keeper configured for submit mode"))?;

        let (nonce, resolution) = match keeper.get_next_nonce(self.chain.as_ref()).await {
            Ok(acquired) => acquired,
            Err(e) if e.downcast_ref::<NonceError>().is_some() => {
                warn!("[submit] {} skipped: {}", opportunity.id, e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        match resolution {
            Some(PendingResolution::Confirmed) => info!("had pending: confirmed"),
            Some(PendingResolution::Dropped) => info!("had pending: dropped"),
            None => {}
        }

        let gas = self.gas_fields(opportunity.path.steps.len());
        let built: BuiltTransaction = self
            .builder()?
            .build(opportunity, &opportunity.flash_provider, nonce, gas)
            .context("transaction build failed")?;
        let hash_str = format!("{}", built.tx_hash);

        // Persist the hash first; only then let it leave the process.
        let keeper = self.keeper.as_mut().expect("checked above");
        keeper.mark_submitted(&hash_str)?;

        if let Err(e) = self.chain.send_raw_transaction(built.raw.clone()).await {
            // The pending record stays: if the transaction did reach the
            // network despite the error, resolution on the next
            // acquisition (confirmed or dropped) sorts it out.
            error!("[submit] {} broadcast failed: {}", opportunity.id, e);
            return Err(e);
        }

        self.events.emit(BotEvent::Submitted {
            id: opportunity.id.clone(),
            tx_hash: hash_str.clone(),
        });
        info!("[submit] {} broadcast as {}", opportunity.id, hash_str);

        let receipt = self.chain.wait_for_receipt(built.tx_hash).await?;
        let gas_burn = receipt.gas_used as f64 * receipt.effective_gas_price as f64 * 1e-18;
        let keeper = self.keeper.as_mut().expect("checked above");

        if receipt.status {
            keeper.mark_confirmed(&hash_str)?;
            self.events.emit(BotEvent::Confirmed {
                id: opportunity.id.clone(),
                tx_hash: hash_str.clone(),
                block_number: receipt.block_number,
            });
            info!(
                "[submit] {} confirmed in block {} (gas {:.8})",
                opportunity.id, receipt.block_number, gas_burn
            );
            self.record_outcome(
                opportunity,
                OutcomeStatus::Success,
                Some(hash_str),
                Some(receipt.block_number),
                gas_burn,
            );
        } else {
            keeper.mark_reverted(&hash_str)?;
            self.events.emit(BotEvent::Reverted {
                id: opportunity.id.clone(),
                tx_hash: hash_str.clone(),
                block_number: receipt.block_number,
            });
            warn!(
                "[submit] {} reverted in block {} (gas {:.8})",
                opportunity.id, receipt.block_number, gas_burn
            );
            self.record_outcome(
                opportunity,
                OutcomeStatus::Revert,
                Some(hash_str),
                Some(receipt.block_number),
                gas_burn,
            );
        }

        Ok(())
    }

    /// Journal write, off the submission hot path. A journal failure is
    /// logged, never propagated into trading.
    fn record_outcome(
        &self,
        opportunity: &ArbitrageOpportunity,
        status: OutcomeStatus,
        tx_hash: Option<String>,
        block_number: Option<u64>,
        gas_burn: f64,
    ) {
        let (gross_profit, revert_cost) = match status {
            OutcomeStatus::Success => (opportunity.gross_profit, 0.0),
            OutcomeStatus::Revert => (0.0, gas_burn),
            OutcomeStatus::SimulationRevert => (0.0, 0.0),
        };
        let outcome = TradeOutcome {
            id: opportunity.id.clone(),
            detected_at_ms: opportunity.timestamp_ms,
            submitted_at_ms: now_ms(),
            path_label: opportunity.path.label.clone(),
            input_amount: opportunity.input_amount,
            estimated_profit: opportunity.net_profit,
            status,
            gross_profit,
            gas_cost_l2: gas_burn,
            data_cost_l1: 0.0,
            revert_cost,
            tx_hash,
            block_number,
        };
        if let Err(e) = self.outcomes.append(&outcome) {
            error!("journal write failed for {}: {}", outcome.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{BatchReadResult, ReceiptSummary};
    use crate::events::event_channel;
    use crate::types::{CostBreakdown, SwapPath, SwapStep, VenueFamily};
    use alloy::primitives::{Address, Bytes, B256};
    use async_trait::async_trait;
    use std::env;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct FakeChain {
        on_chain_nonce: AtomicU64,
        send_called: AtomicBool,
        call_reverts: AtomicBool,
        receipt_status: AtomicBool,
    }

    impl FakeChain {
        fn new() -> Self {
            Self {
                on_chain_nonce: AtomicU64::new(5),
                send_called: AtomicBool::new(false),
                call_reverts: AtomicBool::new(false),
                receipt_status: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl ChainClient for FakeChain {
        async fn batch_call(&self, _calls: &[(Address, Bytes)]) -> Result<BatchReadResult> {
            unimplemented!("not used by the executor")
        }
        async fn call(&self, _to: Address, _data: Bytes) -> Result<Bytes> {
            if self.call_reverts.load(Ordering::SeqCst) {
                Err(anyhow!("execution reverted: insufficient output"))
            } else {
                Ok(Bytes::new())
            }
        }
        async fn send_raw_transaction(&self, _raw: Bytes) -> Result<B256> {
            self.send_called.store(true, Ordering::SeqCst);
            Ok(B256::repeat_byte(0x11))
        }
        async fn wait_for_receipt(&self, tx_hash: B256) -> Result<ReceiptSummary> {
            Ok(ReceiptSummary {
                tx_hash,
                block_number: 777,
                status: self.receipt_status.load(Ordering::SeqCst),
                gas_used: 400_000,
                effective_gas_price: 50_000_000,
            })
        }
        async fn transaction_count(&self, _address: Address) -> Result<u64> {
            Ok(self.on_chain_nonce.load(Ordering::SeqCst))
        }
    }

    struct FixedBuilder;

    impl TransactionBuilder for FixedBuilder {
        fn build(
            &self,
            _opportunity: &ArbitrageOpportunity,
            _provider_key: &str,
            nonce: u64,
            _gas: GasFields,
        ) -> Result<BuiltTransaction> {
            Ok(BuiltTransaction {
                to: Address::repeat_byte(9),
                calldata: Bytes::from(vec![1, 2, 3, 4]),
                raw: Bytes::from(vec![2, nonce as u8]),
                tx_hash: B256::repeat_byte(0x11),
            })
        }
    }

    fn opportunity(timestamp_ms: u64) -> ArbitrageOpportunity {
        let weth = Address::repeat_byte(2);
        let usdc = Address::repeat_byte(1);
        let step = |token_in, token_out| SwapStep {
            family: VenueFamily::ConstantProductV2,
            pool: Address::repeat_byte(7),
            token_in,
            token_out,
            decimals_in: 18,
            decimals_out: 6,
            reference_price: 2000.0,
            fee_rate: 0.003,
            venue_fee: None,
            virtual_reserve_in: Some(10_000.0),
        };
        ArbitrageOpportunity {
            id: "WETH/USDC-100-1".to_string(),
            path: SwapPath {
                steps: vec![step(weth, usdc), step(usdc, weth)],
                base_token: weth,
                label: "WETH/USDC buy:b sell:a".to_string(),
            },
            input_amount: 50.0,
            optimization: None,
            gross_profit: 0.9,
            costs: CostBreakdown::new(0.0, 0.01, 0.25),
            net_profit: 0.64,
            net_profit_percent: 1.28,
            flash_provider: "balancer".to_string(),
            block_number: 100,
            timestamp_ms,
        }
    }

    fn temp_data_dir(tag: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("flasharb_executor_test_{}", tag));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn test_config(mode: ExecutionMode) -> Config {
        Config {
            mode,
            rpc_url: String::new(),
            chain_id: 8453,
            data_dir: PathBuf::from("data"),
            poll_interval_ms: 1_000,
            max_retries: 3,
            delta_threshold_percent: 0.5,
            min_liquidity_floor: 0.0,
            optimizer: Default::default(),
            min_profit_threshold: 0.0,
            max_slippage: 0.005,
            default_input_amount: 10.0,
            gas_price_gwei: 0.05,
            gas_per_swap: 150_000,
            venue_policies: crate::types::DEFAULT_VENUE_POLICIES.clone(),
            staleness_ms: 200,
            pending_timeout_ms: 300_000,
            private_key: None,
            aggregator_address: None,
            pools: vec![],
            flash_providers: vec![],
        }
    }

    async fn executor_with(
        tag: &str,
        mode: ExecutionMode,
        chain: Arc<FakeChain>,
    ) -> (Executor, UnboundedReceiver<BotEvent>, PathBuf) {
        let dir = temp_data_dir(tag);
        let keeper = if mode == ExecutionMode::Report {
            None
        } else {
            Some(
                NonceKeeper::load(&dir, Address::repeat_byte(0xAA), chain.as_ref(), 300_000)
                    .await
                    .unwrap(),
            )
        };
        let (events, rx) = event_channel();
        let executor = Executor::new(
            &test_config(mode),
            chain,
            Some(Arc::new(FixedBuilder)),
            keeper,
            OutcomeLog::new(&dir).unwrap(),
            events,
        );
        (executor, rx, dir)
    }

    #[tokio::test]
    async fn test_staleness_gate_blocks_old_opportunity() {
        let chain = Arc::new(FakeChain::new());
        let (mut executor, mut rx, dir) =
            executor_with("stale", ExecutionMode::Submit, chain.clone()).await;
        let nonce_before = executor.keeper.as_ref().unwrap().current_nonce();

        // Consumer slept 250 ms before invoking the executor.
        let opp = opportunity(now_ms() - 250);
        executor.process(&opp).await.unwrap();

        assert!(!chain.send_called.load(Ordering::SeqCst), "no broadcast");
        assert_eq!(
            executor.keeper.as_ref().unwrap().current_nonce(),
            nonce_before,
            "no nonce consumed"
        );
        assert!(rx.try_recv().is_err(), "no event emitted");
        assert_eq!(executor.outcomes.record_count().unwrap(), 0);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_exactly_at_threshold_counts_as_fresh() {
        let chain = Arc::new(FakeChain::new());
        let (events, _rx) = event_channel();
        let dir = temp_data_dir("threshold");
        let executor = Executor::new(
            &test_config(ExecutionMode::Submit),
            chain,
            None,
            None,
            OutcomeLog::new(&dir).unwrap(),
            events,
        );

        let opp = opportunity(10_000);
        assert!(!executor.is_stale(&opp, 10_200), "age == 200ms is fresh");
        assert!(executor.is_stale(&opp, 10_201), "age 201ms is stale");

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_submit_confirmed_advances_nonce_and_journals() {
        let chain = Arc::new(FakeChain::new());
        let (mut executor, mut rx, dir) =
            executor_with("confirm", ExecutionMode::Submit, chain.clone()).await;

        let opp = opportunity(now_ms());
        executor.process(&opp).await.unwrap();

        assert!(chain.send_called.load(Ordering::SeqCst));
        // Nonce 5 was consumed; next is 6 and nothing is pending.
        let keeper = executor.keeper.as_ref().unwrap();
        assert_eq!(keeper.current_nonce(), 6);
        assert!(!keeper.record().has_pending());

        match rx.try_recv().unwrap() {
            BotEvent::Submitted { id, .. } => assert_eq!(id, opp.id),
            other => panic!("unexpected event {:?}", other),
        }
        match rx.try_recv().unwrap() {
            BotEvent::Confirmed { block_number, .. } => assert_eq!(block_number, 777),
            other => panic!("unexpected event {:?}", other),
        }

        let outcomes = executor.outcomes.read_all().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, OutcomeStatus::Success);
        assert_eq!(outcomes[0].block_number, Some(777));
        assert!(outcomes[0].gas_cost_l2 > 0.0);

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_submit_revert_consumes_nonce_and_records_revert() {
        let chain = Arc::new(FakeChain::new());
        chain.receipt_status.store(false, Ordering::SeqCst);
        let (mut executor, mut rx, dir) =
            executor_with("revert", ExecutionMode::Submit, chain.clone()).await;

        let opp = opportunity(now_ms());
        executor.process(&opp).await.unwrap();

        let keeper = executor.keeper.as_ref().unwrap();
        assert_eq!(keeper.current_nonce(), 6, "a mined revert still burns the nonce");

        let _ = rx.try_recv(); // Submitted
        match rx.try_recv().unwrap() {
            BotEvent::Reverted { .. } => {}
            other => panic!("unexpected event {:?}", other),
        }

        let outcomes = executor.outcomes.read_all().unwrap();
        assert_eq!(outcomes[0].status, OutcomeStatus::Revert);
        assert!(outcomes[0].revert_cost > 0.0);
        assert_eq!(outcomes[0].gross_profit, 0.0);

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_still_pending_nonce_skips_without_error() {
        let chain = Arc::new(FakeChain::new());
        let (mut executor, _rx, dir) =
            executor_with("pending", ExecutionMode::Submit, chain.clone()).await;
        // An in-flight hash from moments ago.
        executor
            .keeper
            .as_mut()
            .unwrap()
            .mark_submitted("0xinflight")
            .unwrap();

        let opp = opportunity(now_ms());
        executor.process(&opp).await.unwrap();

        assert!(!chain.send_called.load(Ordering::SeqCst));
        assert!(executor.keeper.as_ref().unwrap().record().has_pending());

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_simulate_revert_is_journaled_and_non_fatal() {
        let chain = Arc::new(FakeChain::new());
        chain.call_reverts.store(true, Ordering::SeqCst);
        let (mut executor, _rx, dir) =
            executor_with("simrevert", ExecutionMode::Simulate, chain.clone()).await;

        let opp = opportunity(now_ms());
        executor.process(&opp).await.unwrap();

        assert!(!chain.send_called.load(Ordering::SeqCst), "simulate never broadcasts");
        let outcomes = executor.outcomes.read_all().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, OutcomeStatus::SimulationRevert);
        assert!(outcomes[0].tx_hash.is_none());

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_simulate_success_leaves_no_journal_line() {
        let chain = Arc::new(FakeChain::new());
        let (mut executor, _rx, dir) =
            executor_with("simok", ExecutionMode::Simulate, chain.clone()).await;

        executor.process(&opportunity(now_ms())).await.unwrap();

        assert_eq!(executor.outcomes.record_count().unwrap(), 0);

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_report_mode_touches_nothing() {
        let chain = Arc::new(FakeChain::new());
        let (mut executor, _rx, dir) =
            executor_with("report", ExecutionMode::Report, chain.clone()).await;

        executor.process(&opportunity(now_ms())).await.unwrap();

        assert!(!chain.send_called.load(Ordering::SeqCst));
        assert_eq!(executor.outcomes.record_count().unwrap(), 0);

        let _ = fs::remove_dir_all(&dir);
    }
}
