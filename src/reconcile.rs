//! Swap reconciliation engine
//!
//! One decision pass over one order: given the remote leg statuses and the
//! local ledger state, pick the single action (or no-op) this signer owes the
//! swap, submit it, and record the outcome. Every entry point — the push
//! feed, the safety-net poll, operator tooling — goes through this one
//! component.
//!
//! The pass is idempotent: every branch re-checks local state before acting,
//! so replaying the same order observation submits nothing twice.

use crate::backend::bitcoin::batch::{BitcoinBatcher, PendingAction};
use crate::backend::{ActionKind, SwapBackend};
use crate::error::{SettlerError, SettlerResult};
use crate::metrics;
use crate::store::{Role, SwapLedger};
use crate::types::{
    hash_secret, AtomicSwap, Chain, ChainFamily, LegStatus, Order, OrderStatus,
};

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct Reconciler {
    account: String,
    /// Order-book identity compared against maker/taker
    signer_address: String,
    ledger: Arc<SwapLedger>,
    backends: HashMap<Chain, Arc<dyn SwapBackend>>,
    /// When present, Bitcoin-leg actions coalesce through the batch executor
    batcher: Option<Arc<BitcoinBatcher>>,
}

impl Reconciler {
    pub fn new(
        account: String,
        signer_address: String,
        ledger: Arc<SwapLedger>,
        backends: HashMap<Chain, Arc<dyn SwapBackend>>,
        batcher: Option<Arc<BitcoinBatcher>>,
    ) -> Self {
        Self {
            account,
            signer_address,
            ledger,
            backends,
            batcher,
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn signer_address(&self) -> &str {
        &self.signer_address
    }

    /// One decision pass over one observed order update
    pub async fn reconcile(&self, order: &Order) -> SettlerResult<()> {
        if let Err(e) = order.validate() {
            warn!(order_id = order.id, "skipping malformed order: {e}");
            metrics::record_reconcile(&self.account, "malformed");
            return Ok(());
        }

        let actionable = match self
            .ledger
            .check_actionable(&self.account, &order.secret_hash)
            .await
        {
            Ok(check) => check,
            Err(SettlerError::NotFound { .. }) => {
                debug!(
                    account = %self.account,
                    order_id = order.id,
                    "no local record for order, skipping"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if !actionable.actionable {
            info!(
                account = %self.account,
                secret_hash = %order.secret_hash,
                order_id = order.id,
                last_error = actionable.last_error.as_deref().unwrap_or(""),
                "skipped, previously failed"
            );
            metrics::record_reconcile(&self.account, "blocked");
            return Ok(());
        }

        let role = if self.signer_address == order.maker {
            Role::Initiator
        } else if self.signer_address == order.taker {
            Role::Follower
        } else {
            debug!(order_id = order.id, "order is not ours, skipping");
            return Ok(());
        };

        if order.status != OrderStatus::Filled {
            debug!(order_id = order.id, status = ?order.status, "order not filled, holding");
            return Ok(());
        }

        let (own, counter) = match role {
            Role::Initiator => (&order.initiator_leg, &order.follower_leg),
            Role::Follower => (&order.follower_leg, &order.initiator_leg),
        };
        let local = self.ledger.state(&self.account, &order.secret_hash).await?;

        if counter.status == LegStatus::Detected {
            debug!(
                order_id = order.id,
                "counterpart funding detected, awaiting confirmation"
            );
            metrics::record_reconcile(&self.account, "detected");
            return Ok(());
        }

        if own.status == LegStatus::Unknown
            && local != role.initiated()
            && local != role.failed_to_initiate()
        {
            return self
                .dispatch(order, role, ActionKind::Initiate, own, None)
                .await;
        }

        if counter.status == LegStatus::Initiated
            && local != role.redeemed()
            && local != role.failed_to_redeem()
        {
            let secret = match self.resolve_secret(order, role, own, counter).await {
                Ok(secret) => secret,
                Err(e) => {
                    warn!(
                        account = %self.account,
                        secret_hash = %order.secret_hash,
                        order_id = order.id,
                        "secret unavailable, skipping redeem: {e}"
                    );
                    metrics::record_reconcile(&self.account, "no_secret");
                    return Ok(());
                }
            };
            return self
                .dispatch(order, role, ActionKind::Redeem, counter, Some(secret))
                .await;
        }

        if own.status == LegStatus::Expired && local == role.initiated() {
            // Guard against a premature refund: the order book may flag
            // expiry before the chain's relative timelock has elapsed.
            match self.backend(own.chain)?.expired(own).await {
                Ok(true) => {
                    return self
                        .dispatch(order, role, ActionKind::Refund, own, None)
                        .await
                }
                Ok(false) => {
                    debug!(
                        order_id = order.id,
                        "timelock not yet elapsed, holding refund"
                    );
                    metrics::record_reconcile(&self.account, "premature_refund");
                    return Ok(());
                }
                Err(e) => {
                    warn!(order_id = order.id, "expiry check failed: {e}");
                    return Ok(());
                }
            }
        }

        debug!(order_id = order.id, %local, "no action for this observation");
        metrics::record_reconcile(&self.account, "noop");
        Ok(())
    }

    /// The redeem secret for this pass. The order creator reads its own
    /// ledger; the follower needs the counterpart leg's revealed secret, or
    /// failing that, the on-chain Redeemed event of its own leg.
    async fn resolve_secret(
        &self,
        order: &Order,
        role: Role,
        own: &AtomicSwap,
        counter: &AtomicSwap,
    ) -> SettlerResult<Vec<u8>> {
        let secret = match role {
            Role::Initiator => {
                let stored = self.ledger.secret(&self.account, &order.secret_hash).await?;
                decode_secret(&stored)?
            }
            Role::Follower => {
                if !counter.secret.is_empty() {
                    decode_secret(&counter.secret)?
                } else if own.status == LegStatus::Redeemed {
                    self.backend(own.chain)?.reveal_secret(own).await?
                } else {
                    return Err(SettlerError::SecretNotFound {
                        swap_id: order.secret_hash.clone(),
                    });
                }
            }
        };

        // A wrong preimage would burn a redeem attempt on-chain
        let expected = hex::decode(order.secret_hash.trim_start_matches("0x"))
            .map_err(|e| SettlerError::Internal(format!("stored secret hash: {e}")))?;
        if hash_secret(&secret).as_slice() != expected.as_slice() {
            return Err(SettlerError::Internal(format!(
                "secret does not hash to {} for order {}",
                order.secret_hash, order.id
            )));
        }
        Ok(secret)
    }

    fn backend(&self, chain: Chain) -> SettlerResult<&Arc<dyn SwapBackend>> {
        self.backends
            .get(&chain)
            .ok_or_else(|| SettlerError::Config(format!("no backend configured for {chain}")))
    }

    /// Submit one action, either directly or through the Bitcoin batch
    /// executor, and record the outcome.
    async fn dispatch(
        &self,
        order: &Order,
        role: Role,
        kind: ActionKind,
        leg: &AtomicSwap,
        secret: Option<Vec<u8>>,
    ) -> SettlerResult<()> {
        let (success, failure) = match kind {
            ActionKind::Initiate => (role.initiated(), role.failed_to_initiate()),
            ActionKind::Redeem => (role.redeemed(), role.failed_to_redeem()),
            ActionKind::Refund => (role.refunded(), role.failed_to_refund()),
        };

        if leg.chain.family() == ChainFamily::Bitcoin {
            if let Some(batcher) = &self.batcher {
                let action = PendingAction {
                    account: self.account.clone(),
                    secret_hash: order.secret_hash.clone(),
                    order_id: order.id,
                    kind,
                    swap: leg.clone(),
                    secret,
                    success_state: success,
                };
                match batcher.enqueue(action).await {
                    Ok(()) => {
                        debug!(
                            order_id = order.id,
                            %kind,
                            "action queued for the next batch"
                        );
                        metrics::record_reconcile(&self.account, "queued");
                    }
                    Err(e @ SettlerError::QueueFull { .. }) => {
                        // The next observation re-queues once the tick drains
                        warn!(order_id = order.id, "batch queue full, deferring: {e}");
                    }
                    Err(e) => return Err(e),
                }
                return Ok(());
            }
        }

        let backend = self.backend(leg.chain)?;
        let started = std::time::Instant::now();
        let result = match kind {
            ActionKind::Initiate => backend.initiate(leg).await,
            ActionKind::Redeem => {
                backend
                    .redeem(leg, secret.as_deref().unwrap_or_default())
                    .await
            }
            ActionKind::Refund => backend.refund(leg).await,
        };
        metrics::record_action_latency(
            leg.chain.as_str(),
            kind.as_str(),
            started.elapsed().as_secs_f64(),
        );

        match result {
            Ok(tx_hash) => {
                metrics::record_action(leg.chain.as_str(), kind.as_str(), true);
                self.ledger
                    .record_success(&self.account, &order.secret_hash, success, &tx_hash)
                    .await?;
                info!(
                    account = %self.account,
                    secret_hash = %order.secret_hash,
                    order_id = order.id,
                    %kind,
                    tx_hash = %tx_hash,
                    "action submitted"
                );
                metrics::record_reconcile(&self.account, kind.as_str());
            }
            Err(e) if e.is_transient() => {
                metrics::record_action(leg.chain.as_str(), kind.as_str(), false);
                warn!(
                    account = %self.account,
                    secret_hash = %order.secret_hash,
                    order_id = order.id,
                    %kind,
                    "transient failure, retrying on next observation: {e}"
                );
            }
            Err(e) => {
                metrics::record_action(leg.chain.as_str(), kind.as_str(), false);
                error!(
                    account = %self.account,
                    secret_hash = %order.secret_hash,
                    order_id = order.id,
                    %kind,
                    "action failed: {e}"
                );
                self.ledger
                    .record_failure(&self.account, &order.secret_hash, failure, &e.to_string())
                    .await?;
            }
        }
        Ok(())
    }
}

fn decode_secret(hex_secret: &str) -> SettlerResult<Vec<u8>> {
    hex::decode(hex_secret.trim_start_matches("0x"))
        .map_err(|e| SettlerError::Internal(format!("stored secret is not hex: {e}")))
}
