//! Typed pipeline events.
//!
//! Every externally visible occurrence is one variant of `BotEvent`,
//! pushed through an unbounded mpsc channel. The outer process owns the
//! receiver and renders events; components only ever hold a sender.

use crate::types::{ArbitrageOpportunity, PriceDelta, PriceSnapshot};
use tokio::sync::mpsc;
use tracing::warn;

/// Tagged event stream exposed to the outer process.
#[derive(Debug, Clone)]
pub enum BotEvent {
    /// Fresh snapshot decoded for a pool.
    PriceUpdate(PriceSnapshot),
    /// Per-pool read or decode failure. `now_stale` marks the poll that
    /// crossed the retry threshold.
    PoolError {
        pool_id: String,
        message: String,
        now_stale: bool,
    },
    /// Cross-venue discrepancy above threshold.
    Delta(PriceDelta),
    OpportunityFound(ArbitrageOpportunity),
    OpportunityRejected { id: String, reason: String },
    Submitted { id: String, tx_hash: String },
    Confirmed {
        id: String,
        tx_hash: String,
        block_number: u64,
    },
    Reverted {
        id: String,
        tx_hash: String,
        block_number: u64,
    },
}

/// Cloneable sending half handed to every component.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<BotEvent>,
}

impl EventSender {
    pub fn emit(&self, event: BotEvent) {
        // Receiver dropping means the process is shutting down; losing
        // tail events at that point is acceptable.
        if self.tx.send(event).is_err() {
            warn!("event receiver closed, dropping event");
        }
    }
}

/// Build the event channel. The receiver goes to the outer loop.
pub fn event_channel() -> (EventSender, mpsc::UnboundedReceiver<BotEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}
