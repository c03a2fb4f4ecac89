//! Chain transport and transaction building.
//!
//! `ChainClient` is the five-verb provider surface the pipeline consumes:
//! batched read, non-broadcasting call, raw broadcast, receipt wait, and
//! current-nonce query. The production implementation rides an alloy HTTP
//! provider and folds the batched read into a single Multicall3
//! `aggregate3` call, with the chain's block number and timestamp fetched
//! as two extra sub-calls against Multicall3 itself.
//!
//! `TransactionBuilder` turns a sized opportunity into a signed EIP-1559
//! payload for the flash-borrow aggregator contract. Simulation uses the
//! unsigned (to, calldata) pair; submission uses the raw bytes.

use crate::types::{ArbitrageOpportunity, SwapStep, VenueFamily};
use alloy::consensus::{SignableTransaction, TxEnvelope};
use alloy::eips::eip2718::Encodable2718;
use alloy::network::TxSignerSync;
use alloy::primitives::{aliases::U24, Address, Bytes, TxKind, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::sol_types::SolCall;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// Multicall3 deployed address (same on all EVM chains)
const MULTICALL3_ADDRESS: &str = "0xcA11bde05977b3631167028862bE2a173976CA11";

/// Receipt polling cadence and cap for `wait_for_receipt`.
const RECEIPT_POLL_INTERVAL_MS: u64 = 500;
const RECEIPT_POLL_MAX_ATTEMPTS: u32 = 120;

/// Fee tag sentinel for constant-product legs in the aggregator calldata.
/// type(uint24).max signals the V2 swap path; V3 legs carry their fee tier,
/// liquidity-book legs their bin step.
pub const V2_FEE_SENTINEL: u32 = 16_777_215;

sol! {
    struct Call3 { address target; bool allowFailure; bytes callData; }
    struct Call3Result { bool success; bytes returnData; }
    function aggregate3(Call3[] calldata calls) external payable returns (Call3Result[] memory returnData);
    function getBlockNumber() external view returns (uint256 blockNumber);
    function getCurrentBlockTimestamp() external view returns (uint256 timestamp);
}

sol! {
    struct BorrowLeg { address pool; address tokenIn; address tokenOut; uint24 feeTag; }
    function executeFlashArbitrage(
        address lender,
        address baseToken,
        uint256 amountIn,
        uint256 minProfit,
        BorrowLeg[] legs
    ) external;
}

/// Result of one batched read round.
#[derive(Debug, Clone)]
pub struct BatchReadResult {
    /// Per-call return data, in request order. None = that sub-call failed.
    pub returns: Vec<Option<Bytes>>,
    pub block_number: u64,
    /// Chain timestamp in seconds, as reported by the batch block.
    pub block_timestamp: u64,
}

/// Minimal receipt view the executor needs.
#[derive(Debug, Clone)]
pub struct ReceiptSummary {
    pub tx_hash: B256,
    pub block_number: u64,
    pub status: bool,
    pub gas_used: u64,
    pub effective_gas_price: u128,
}

/// The five transport verbs the pipeline consumes. No other provider
/// capability is assumed anywhere.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Single-round-trip batched read of (address, calldata) pairs.
    async fn batch_call(&self, calls: &[(Address, Bytes)]) -> Result<BatchReadResult>;

    /// Non-broadcasting call (simulation).
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes>;

    /// Broadcast a signed raw transaction, returning its hash.
    async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256>;

    /// Block until the transaction is mined (bounded), returning a summary.
    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<ReceiptSummary>;

    /// Current on-chain nonce for an address.
    async fn transaction_count(&self, address: Address) -> Result<u64>;
}

/// Gas triple handed to the builder by the executor.
#[derive(Debug, Clone, Copy)]
pub struct GasFields {
    pub gas_limit: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

/// A built and signed submission payload.
#[derive(Debug, Clone)]
pub struct BuiltTransaction {
    pub to: Address,
    pub calldata: Bytes,
    pub raw: Bytes,
    pub tx_hash: B256,
}

/// Turns an opportunity plus nonce/gas into a signed payload.
pub trait TransactionBuilder: Send + Sync {
    fn build(
        &self,
        opportunity: &ArbitrageOpportunity,
        provider_key: &str,
        nonce: u64,
        gas: GasFields,
    ) -> Result<BuiltTransaction>;
}

/// Production `ChainClient` over an alloy HTTP provider.
pub struct RpcChainClient {
    provider: DynProvider,
    multicall: Address,
}

impl RpcChainClient {
    pub fn new(rpc_url: &str) -> Result<Self> {
        let url = rpc_url
            .parse()
            .with_context(|| format!("invalid RPC url: {}", rpc_url))?;
        let provider = ProviderBuilder::new().connect_http(url).erased();
        let multicall: Address = MULTICALL3_ADDRESS
            .parse()
            .context("invalid Multicall3 address constant")?;

        Ok(Self { provider, multicall })
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn batch_call(&self, calls: &[(Address, Bytes)]) -> Result<BatchReadResult> {
        // Two trailing sub-calls against Multicall3 itself give every
        // round a block number and chain timestamp for free.
        let mut call3s: Vec<Call3> = calls
            .iter()
            .map(|(target, data)| Call3 {
                target: *target,
                allowFailure: true,
                callData: data.clone(),
            })
            .collect();
        call3s.push(Call3 {
            target: self.multicall,
            allowFailure: false,
            callData: getBlockNumberCall {}.abi_encode().into(),
        });
        call3s.push(Call3 {
            target: self.multicall,
            allowFailure: false,
            callData: getCurrentBlockTimestampCall {}.abi_encode().into(),
        });

        let calldata: Bytes = aggregate3Call { calls: call3s }.abi_encode().into();

        let request = alloy::rpc::types::TransactionRequest {
            to: Some(TxKind::Call(self.multicall)),
            input: calldata.into(),
            ..Default::default()
        };
        let raw = self
            .provider
            .call(request)
            .await
            .context("Multicall3 aggregate3 eth_call failed")?;

        let mut results =
            aggregate3Call::abi_decode_returns(&raw).context("bad aggregate3 return data")?;

        if results.len() != calls.len() + 2 {
            return Err(anyhow!(
                "aggregate3 returned {} results for {} sub-calls",
                results.len(),
                calls.len() + 2
            ));
        }

        let ts_result = results.pop().expect("length checked above");
        let bn_result = results.pop().expect("length checked above");
        let block_timestamp = getCurrentBlockTimestampCall::abi_decode_returns(&ts_result.returnData)
            .context("bad getCurrentBlockTimestamp return")?
            .to::<u64>();
        let block_number = getBlockNumberCall::abi_decode_returns(&bn_result.returnData)
            .context("bad getBlockNumber return")?
            .to::<u64>();

        let returns = results
            .into_iter()
            .map(|r| {
                if r.success && !r.returnData.is_empty() {
                    Some(r.returnData)
                } else {
                    None
                }
            })
            .collect();

        debug!(
            "batch_call: {} pools at block {} (ts {})",
            calls.len(),
            block_number,
            block_timestamp
        );

        Ok(BatchReadResult {
            returns,
            block_number,
            block_timestamp,
        })
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        let request = alloy::rpc::types::TransactionRequest {
            to: Some(TxKind::Call(to)),
            input: data.into(),
            ..Default::default()
        };
        self.provider
            .call(request)
            .await
            .context("eth_call failed")
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256> {
        let pending = self
            .provider
            .send_raw_transaction(raw.as_ref())
            .await
            .context("raw transaction broadcast failed")?;
        Ok(*pending.tx_hash())
    }

    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<ReceiptSummary> {
        for attempt in 0..RECEIPT_POLL_MAX_ATTEMPTS {
            if let Some(receipt) = self
                .provider
                .get_transaction_receipt(tx_hash)
                .await
                .context("receipt query failed")?
            {
                return Ok(ReceiptSummary {
                    tx_hash,
                    block_number: receipt.block_number.unwrap_or_default(),
                    status: receipt.status(),
                    gas_used: receipt.gas_used,
                    effective_gas_price: receipt.effective_gas_price,
                });
            }
            if attempt % 20 == 19 {
                warn!("still waiting for receipt of {tx_hash}");
            }
            tokio::time::sleep(Duration::from_millis(RECEIPT_POLL_INTERVAL_MS)).await;
        }
        Err(anyhow!(
            "no receipt for {} after {}ms",
            tx_hash,
            RECEIPT_POLL_INTERVAL_MS * RECEIPT_POLL_MAX_ATTEMPTS as u64
        ))
    }

    async fn transaction_count(&self, address: Address) -> Result<u64> {
        self.provider
            .get_transaction_count(address)
            .await
            .context("nonce query failed")
    }
}

/// Builds and signs the flash-borrow aggregator call locally.
pub struct FlashArbTxBuilder {
    signer: PrivateKeySigner,
    aggregator: Address,
    chain_id: u64,
    providers: Vec<crate::types::FlashProvider>,
}

/// Fraction of expected net profit the on-chain minProfit guard keeps.
/// The contract reverts the whole borrow if realized profit lands below it.
const MIN_PROFIT_HAIRCUT: f64 = 0.5;

impl FlashArbTxBuilder {
    pub fn new(
        signer: PrivateKeySigner,
        aggregator: Address,
        chain_id: u64,
        providers: Vec<crate::types::FlashProvider>,
    ) -> Self {
        Self {
            signer,
            aggregator,
            chain_id,
            providers,
        }
    }

    pub fn signer_address(&self) -> Address {
        self.signer.address()
    }

    /// uint24 routing tag for one leg: V2 sentinel, otherwise the raw
    /// venue fee parameter (V3 tier, bin step).
    fn fee_tag(step: &SwapStep) -> u32 {
        match step.family {
            VenueFamily::ConstantProductV2 => V2_FEE_SENTINEL,
            _ => step.venue_fee.unwrap_or(0),
        }
    }

    fn raw_amount(amount: f64, decimals: u8) -> U256 {
        U256::from((amount.max(0.0) * 10f64.powi(decimals as i32)) as u128)
    }
}

impl TransactionBuilder for FlashArbTxBuilder {
    fn build(
        &self,
        opportunity: &ArbitrageOpportunity,
        provider_key: &str,
        nonce: u64,
        gas: GasFields,
    ) -> Result<BuiltTransaction> {
        let lender = self
            .providers
            .iter()
            .find(|p| p.key == provider_key)
            .ok_or_else(|| anyhow!("unknown flash-borrow provider: {}", provider_key))?;

        let base_decimals = opportunity
            .path
            .steps
            .first()
            .map(|s| s.decimals_in)
            .ok_or_else(|| anyhow!("empty swap path"))?;

        let legs: Vec<BorrowLeg> = opportunity
            .path
            .steps
            .iter()
            .map(|step| BorrowLeg {
                pool: step.pool,
                tokenIn: step.token_in,
                tokenOut: step.token_out,
                feeTag: U24::from(Self::fee_tag(step)),
            })
            .collect();

        let calldata: Bytes = executeFlashArbitrageCall {
            lender: lender.address,
            baseToken: opportunity.path.base_token,
            amountIn: Self::raw_amount(opportunity.input_amount, base_decimals),
            minProfit: Self::raw_amount(
                opportunity.net_profit * MIN_PROFIT_HAIRCUT,
                base_decimals,
            ),
            legs,
        }
        .abi_encode()
        .into();

        let mut tx = alloy::consensus::TxEip1559 {
            chain_id: self.chain_id,
            nonce,
            gas_limit: gas.gas_limit,
            max_fee_per_gas: gas.max_fee_per_gas,
            max_priority_fee_per_gas: gas.max_priority_fee_per_gas,
            to: TxKind::Call(self.aggregator),
            value: U256::ZERO,
            input: calldata.clone(),
            access_list: Default::default(),
        };

        let signature = self
            .signer
            .sign_transaction_sync(&mut tx)
            .context("transaction signing failed")?;
        let signed = tx.into_signed(signature);
        let tx_hash = *signed.hash();
        let envelope: TxEnvelope = signed.into();
        let raw: Bytes = envelope.encoded_2718().into();

        Ok(BuiltTransaction {
            to: self.aggregator,
            calldata,
            raw,
            tx_hash,
        })
    }
}
