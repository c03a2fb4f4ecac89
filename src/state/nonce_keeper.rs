//! Submission state keeper.
//!
//! One JSON file per signer at `<data_dir>/nonce.json` holds the next
//! nonce and at most one in-flight transaction. Every mutation is
//! persisted through an atomic temp-write + rename with fsync, so a
//! crash between broadcast and receipt never loses the tx hash and a
//! restart resumes resolution instead of burning or reusing a nonce
//! blindly.

use crate::chain::ChainClient;
use crate::types::{now_ms, NonceRecord};
use alloy::primitives::Address;
use anyhow::{bail, Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// How a pre-existing pending record was resolved during acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingResolution {
    /// The in-flight transaction landed; the nonce advanced.
    Confirmed,
    /// The in-flight transaction never landed within the timeout; its
    /// nonce is reused.
    Dropped,
}

/// Retryable nonce-acquisition failure. The caller skips the current
/// opportunity and tries again on the next one.
#[derive(Debug, Error)]
pub enum NonceError {
    #[error("pending transaction {tx_hash} still in flight ({age_ms}ms old)")]
    StillPending { tx_hash: String, age_ms: u64 },
}

#[derive(Debug)]
pub struct NonceKeeper {
    path: PathBuf,
    record: NonceRecord,
    pending_timeout_ms: u64,
}

impl NonceKeeper {
    /// Read (or initialize) the signer's record and sync it against the
    /// chain. An address mismatch between file and signer is fatal
    /// misconfiguration.
    pub async fn load(
        data_dir: &Path,
        signer: Address,
        chain: &dyn ChainClient,
        pending_timeout_ms: u64,
    ) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("cannot create data dir {}", data_dir.display()))?;
        let path = data_dir.join("nonce.json");

        let mut record = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("cannot read nonce file {}", path.display()))?;
            let record: NonceRecord = serde_json::from_str(&raw)
                .with_context(|| format!("cannot parse nonce file {}", path.display()))?;
            if record.address != signer {
                bail!(
                    "nonce file {} belongs to signer {}, current signer is {}, refusing to start",
                    path.display(),
                    record.address,
                    signer
                );
            }
            record
        } else {
            NonceRecord {
                address: signer,
                nonce: 0,
                tx_hash: None,
                submitted_at: None,
            }
        };

        // Out-of-band submissions are tolerated, not assumed: never let
        // the local nonce trail the chain.
        let on_chain = chain.transaction_count(signer).await?;
        if record.nonce < on_chain {
            info!(
                "nonce sync: raising local {} to on-chain {}",
                record.nonce, on_chain
            );
            record.nonce = on_chain;
        }

        let keeper = Self {
            path,
            record,
            pending_timeout_ms,
        };
        keeper.persist()?;
        Ok(keeper)
    }

    pub fn current_nonce(&self) -> u64 {
        self.record.nonce
    }

    pub fn record(&self) -> &NonceRecord {
        &self.record
    }

    /// Acquire the nonce for the next submission, resolving any pending
    /// record first. With no pending record this is a pure read.
    pub async fn get_next_nonce(
        &mut self,
        chain: &dyn ChainClient,
    ) -> Result<(u64, Option<PendingResolution>)> {
        let (tx_hash, submitted_at) = match (&self.record.tx_hash, self.record.submitted_at) {
            (Some(hash), Some(at)) => (hash.clone(), at),
            _ => return Ok((self.record.nonce, None)),
        };

        let on_chain = chain.transaction_count(self.record.address).await?;

        if on_chain > self.record.nonce {
            // The pending transaction landed. Out-of-band submissions may
            // have advanced the chain further; never trail it.
            self.record.nonce = (self.record.nonce + 1).max(on_chain);
            self.record.tx_hash = None;
            self.record.submitted_at = None;
            self.persist()?;
            info!("had pending: confirmed ({}), next nonce {}", tx_hash, self.record.nonce);
            return Ok((self.record.nonce, Some(PendingResolution::Confirmed)));
        }

        let age_ms = now_ms().saturating_sub(submitted_at);
        if on_chain == self.record.nonce && age_ms > self.pending_timeout_ms {
            // Never mined and past the timeout: the nonce is free again.
            self.record.tx_hash = None;
            self.record.submitted_at = None;
            self.persist()?;
            warn!("had pending: dropped ({}), reusing nonce {}", tx_hash, self.record.nonce);
            return Ok((self.record.nonce, Some(PendingResolution::Dropped)));
        }

        Err(NonceError::StillPending { tx_hash, age_ms }.into())
    }

    /// Record the in-flight hash. Called before the broadcast returns so
    /// a crash mid-submission leaves the hash on disk.
    pub fn mark_submitted(&mut self, tx_hash: &str) -> Result<()> {
        self.record.tx_hash = Some(tx_hash.to_string());
        self.record.submitted_at = Some(now_ms());
        self.persist()
    }

    pub fn mark_confirmed(&mut self, _tx_hash: &str) -> Result<()> {
        self.advance()
    }

    /// A mined revert still consumes the nonce.
    pub fn mark_reverted(&mut self, _tx_hash: &str) -> Result<()> {
        self.advance()
    }

    fn advance(&mut self) -> Result<()> {
        self.record.nonce += 1;
        self.record.tx_hash = None;
        self.record.submitted_at = None;
        self.persist()
    }

    /// Atomic replace: temp write, fsync, rename.
    fn persist(&self) -> Result<()> {
        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut tmp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .with_context(|| format!("cannot open {}", tmp_path.display()))?;
            let json = serde_json::to_string_pretty(&self.record)
                .context("cannot serialize nonce record")?;
            tmp.write_all(json.as_bytes())?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("cannot replace {}", self.path.display()))?;
        Ok(())
    }

    /// Re-read the on-disk record, for verification and tooling.
    pub fn read_file(path: &Path) -> Result<NonceRecord> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{BatchReadResult, ReceiptSummary};
    use alloy::primitives::{Bytes, B256};
    use async_trait::async_trait;
    use std::env;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Chain stub that only answers nonce queries.
    struct NonceOnlyChain {
        on_chain: AtomicU64,
    }

    impl NonceOnlyChain {
        fn new(nonce: u64) -> Self {
            Self {
                on_chain: AtomicU64::new(nonce),
            }
        }
        fn set(&self, nonce: u64) {
            self.on_chain.store(nonce, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ChainClient for NonceOnlyChain {
        async fn batch_call(&self, _calls: &[(Address, Bytes)]) -> Result<BatchReadResult> {
            unimplemented!("not used by the keeper")
        }
        async fn call(&self, _to: Address, _data: Bytes) -> Result<Bytes> {
            unimplemented!("not used by the keeper")
        }
        async fn send_raw_transaction(&self, _raw: Bytes) -> Result<B256> {
            unimplemented!("not used by the keeper")
        }
        async fn wait_for_receipt(&self, _tx_hash: B256) -> Result<ReceiptSummary> {
            unimplemented!("not used by the keeper")
        }
        async fn transaction_count(&self, _address: Address) -> Result<u64> {
            Ok(self.on_chain.load(Ordering::SeqCst))
        }
    }

    fn temp_data_dir(tag: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("flasharb_nonce_test_{}", tag));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn signer() -> Address {
        Address::repeat_byte(0xAA)
    }

    #[tokio::test]
    async fn test_fresh_start_takes_on_chain_nonce() {
        let dir = temp_data_dir("fresh");
        let chain = NonceOnlyChain::new(12);

        let keeper = NonceKeeper::load(&dir, signer(), &chain, 300_000).await.unwrap();
        assert_eq!(keeper.current_nonce(), 12);

        // The record is already on disk.
        let on_disk = NonceKeeper::read_file(&dir.join("nonce.json")).unwrap();
        assert_eq!(on_disk, *keeper.record());

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_startup_sync_is_idempotent() {
        let dir = temp_data_dir("idem");
        let chain = NonceOnlyChain::new(5);

        let first = NonceKeeper::load(&dir, signer(), &chain, 300_000).await.unwrap();
        let first_record = first.record().clone();
        drop(first);

        let second = NonceKeeper::load(&dir, signer(), &chain, 300_000).await.unwrap();
        assert_eq!(*second.record(), first_record);

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_address_mismatch_is_fatal() {
        let dir = temp_data_dir("mismatch");
        let chain = NonceOnlyChain::new(0);
        NonceKeeper::load(&dir, signer(), &chain, 300_000).await.unwrap();

        let other_signer = Address::repeat_byte(0xBB);
        let err = NonceKeeper::load(&dir, other_signer, &chain, 300_000)
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("refusing to start"), "got: {}", err);

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_get_next_nonce_without_pending_is_a_pure_read() {
        let dir = temp_data_dir("pure");
        let chain = NonceOnlyChain::new(3);
        let mut keeper = NonceKeeper::load(&dir, signer(), &chain, 300_000).await.unwrap();

        let (nonce, resolution) = keeper.get_next_nonce(&chain).await.unwrap();
        assert_eq!(nonce, 3);
        assert!(resolution.is_none());
        let (again, _) = keeper.get_next_nonce(&chain).await.unwrap();
        assert_eq!(again, 3);

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_disk_matches_memory_through_the_lifecycle() {
        let dir = temp_data_dir("lifecycle");
        let path = dir.join("nonce.json");
        let chain = NonceOnlyChain::new(0);
        let mut keeper = NonceKeeper::load(&dir, signer(), &chain, 300_000).await.unwrap();

        keeper.mark_submitted("0xdead").unwrap();
        assert_eq!(NonceKeeper::read_file(&path).unwrap(), *keeper.record());
        assert!(keeper.record().has_pending());

        keeper.mark_confirmed("0xdead").unwrap();
        assert_eq!(NonceKeeper::read_file(&path).unwrap(), *keeper.record());
        assert_eq!(keeper.current_nonce(), 1);
        assert!(!keeper.record().has_pending());

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_pending_confirmed_advances_nonce() {
        let dir = temp_data_dir("confirmed");
        let chain = NonceOnlyChain::new(7);
        let mut keeper = NonceKeeper::load(&dir, signer(), &chain, 300_000).await.unwrap();
        keeper.mark_submitted("0xabc").unwrap();

        // The chain saw the transaction land.
        chain.set(8);
        let (nonce, resolution) = keeper.get_next_nonce(&chain).await.unwrap();
        assert_eq!(nonce, 8);
        assert_eq!(resolution, Some(PendingResolution::Confirmed));
        assert!(!keeper.record().has_pending());

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_dropped_transaction_reuses_nonce() {
        let dir = temp_data_dir("dropped");
        fs::create_dir_all(&dir).unwrap();
        // Persisted pending record submitted six minutes ago.
        let stale = NonceRecord {
            address: signer(),
            nonce: 4,
            tx_hash: Some("0xfeed".to_string()),
            submitted_at: Some(now_ms() - 6 * 60 * 1_000),
        };
        fs::write(dir.join("nonce.json"), serde_json::to_string(&stale).unwrap()).unwrap();

        let chain = NonceOnlyChain::new(4);
        let mut keeper = NonceKeeper::load(&dir, signer(), &chain, 300_000).await.unwrap();

        let (nonce, resolution) = keeper.get_next_nonce(&chain).await.unwrap();
        assert_eq!(nonce, 4, "dropped pending reuses the nonce");
        assert_eq!(resolution, Some(PendingResolution::Dropped));
        assert!(!keeper.record().has_pending());

        // The file was rewritten without the pending fields.
        let on_disk = NonceKeeper::read_file(&dir.join("nonce.json")).unwrap();
        assert_eq!(on_disk.nonce, 4);
        assert!(on_disk.tx_hash.is_none());

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_still_pending_surfaces_retryable_error() {
        let dir = temp_data_dir("inflight");
        let chain = NonceOnlyChain::new(2);
        let mut keeper = NonceKeeper::load(&dir, signer(), &chain, 300_000).await.unwrap();
        keeper.mark_submitted("0xbeef").unwrap();

        let err = keeper.get_next_nonce(&chain).await.unwrap_err();
        let nonce_err = err.downcast_ref::<NonceError>().expect("typed error");
        match nonce_err {
            NonceError::StillPending { tx_hash, .. } => assert_eq!(tx_hash, "0xbeef"),
        }
        // Nothing changed.
        assert!(keeper.record().has_pending());
        assert_eq!(keeper.current_nonce(), 2);

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_reverted_consumes_nonce() {
        let dir = temp_data_dir("reverted");
        let chain = NonceOnlyChain::new(0);
        let mut keeper = NonceKeeper::load(&dir, signer(), &chain, 300_000).await.unwrap();
        keeper.mark_submitted("0x01").unwrap();
        keeper.mark_reverted("0x01").unwrap();

        assert_eq!(keeper.current_nonce(), 1);
        assert!(!keeper.record().has_pending());

        let _ = fs::remove_dir_all(&dir);
    }
}
