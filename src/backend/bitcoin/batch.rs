//! Bitcoin batch executor
//!
//! Coalesces pending HTLC actions from every account sharing the wallet into
//! one transaction per tick to amortize fees. The pending buffer is guarded
//! by a mutex covering both the idempotency-marker check and the append, so
//! two producers cannot enqueue the same (kind, swap) pair.

use crate::backend::bitcoin::{BatchItem, BitcoinBackend};
use crate::backend::ActionKind;
use crate::error::{SettlerError, SettlerResult};
use crate::store::{SwapLedger, SwapState};
use crate::types::AtomicSwap;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};

/// Upper bound on one combined build-and-broadcast
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(60);

/// A queued action plus the ledger bookkeeping to run after broadcast
#[derive(Debug, Clone)]
pub struct PendingAction {
    pub account: String,
    pub secret_hash: String,
    pub order_id: u64,
    pub kind: ActionKind,
    pub swap: AtomicSwap,
    pub secret: Option<Vec<u8>>,
    pub success_state: SwapState,
}

pub struct BitcoinBatcher {
    ledger: Arc<SwapLedger>,
    backend: Arc<BitcoinBackend>,
    pending: Mutex<Vec<PendingAction>>,
    capacity: usize,
    tick: Duration,
}

impl BitcoinBatcher {
    pub fn new(
        ledger: Arc<SwapLedger>,
        backend: Arc<BitcoinBackend>,
        capacity: usize,
        tick: Duration,
    ) -> Self {
        Self {
            ledger,
            backend,
            pending: Mutex::new(Vec::new()),
            capacity,
            tick,
        }
    }

    /// Queue an action for the next tick. Checks and records the
    /// (kind, swap) idempotency marker atomically with the append; an
    /// already-recorded pair is dropped silently.
    pub async fn enqueue(&self, action: PendingAction) -> SettlerResult<()> {
        let mut pending = self.pending.lock().await;
        if pending.len() >= self.capacity {
            return Err(SettlerError::QueueFull {
                capacity: self.capacity,
            });
        }
        if !self
            .ledger
            .try_mark_action(action.kind, &action.secret_hash)
            .await?
        {
            debug!(
                kind = %action.kind,
                secret_hash = %action.secret_hash,
                "action already queued or done, dropping"
            );
            return Ok(());
        }
        debug!(
            kind = %action.kind,
            account = %action.account,
            secret_hash = %action.secret_hash,
            "action queued for next batch"
        );
        pending.push(action);
        Ok(())
    }

    /// Periodic drain loop. Clears stale markers once at startup so a
    /// restarted process re-evaluates outstanding actions.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.ledger.reset_action_markers().await {
            error!("failed to reset action markers: {e}");
        }

        let mut tick = interval(self.tick);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.flush().await {
                        error!("batch flush failed: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("batch executor stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Drain the queue and, if non-empty, broadcast one combined
    /// transaction. On success every drained action records its success
    /// state with the shared txid. On failure the actions stay marked and
    /// outstanding; the operator is told, nothing retries automatically.
    pub async fn flush(&self) -> SettlerResult<usize> {
        let drained: Vec<PendingAction> = {
            let mut pending = self.pending.lock().await;
            std::mem::take(&mut *pending)
        };
        if drained.is_empty() {
            return Ok(0);
        }

        let items: Vec<BatchItem> = drained
            .iter()
            .map(|a| BatchItem {
                kind: a.kind,
                swap: a.swap.clone(),
                secret: a.secret.clone(),
            })
            .collect();

        let submitted = match timeout(SUBMIT_TIMEOUT, self.backend.execute_batch(&items)).await {
            Ok(result) => result,
            Err(_) => Err(SettlerError::Timeout {
                operation: "batch broadcast".into(),
            }),
        };

        match submitted {
            Ok(txid) => {
                let txid = txid.to_string();
                info!(%txid, actions = drained.len(), "batch broadcast");
                crate::metrics::record_batch_broadcast(drained.len());
                for action in &drained {
                    if let Err(e) = self
                        .ledger
                        .record_success(
                            &action.account,
                            &action.secret_hash,
                            action.success_state,
                            &txid,
                        )
                        .await
                    {
                        error!(
                            account = %action.account,
                            secret_hash = %action.secret_hash,
                            "batch landed but ledger update failed: {e}"
                        );
                    }
                }
                Ok(drained.len())
            }
            Err(e) => {
                if e.should_alert() {
                    error!("batch broadcast needs operator attention: {e}");
                }
                for action in &drained {
                    warn!(
                        account = %action.account,
                        secret_hash = %action.secret_hash,
                        order_id = action.order_id,
                        kind = %action.kind,
                        "batch broadcast failed, action outstanding until retried: {e}"
                    );
                }
                Err(e)
            }
        }
    }
}
