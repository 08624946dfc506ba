//! Crash recovery for failure records
//!
//! A process crash between broadcasting a transaction and persisting its
//! success leaves a FailedTo* record for an action that actually landed.
//! Recovery reconciles those records against the order book's ground truth:
//! when the remote leg already carries the tx hash of the supposedly-failed
//! action, the record is promoted to the matching success state without
//! resubmitting. Anything else is left for the operator.

use crate::backend::ActionKind;
use crate::error::{SettlerError, SettlerResult};
use crate::metrics;
use crate::orderbook::OrderbookApi;
use crate::store::{Role, SwapLedger, SwapRecord};
use crate::types::Order;

use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Recovery {
    ledger: Arc<SwapLedger>,
    orderbook: Arc<dyn OrderbookApi>,
}

impl Recovery {
    pub fn new(ledger: Arc<SwapLedger>, orderbook: Arc<dyn OrderbookApi>) -> Self {
        Self { ledger, orderbook }
    }

    /// Repair one account's failure records. Returns how many were promoted.
    pub async fn run(&self, account: &str) -> SettlerResult<usize> {
        let records = self.ledger.list_all(account).await?;
        let mut promoted = 0;

        for record in records.iter().filter(|r| r.state.is_failure()) {
            match self.repair(account, record).await {
                Ok(true) => promoted += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    account,
                    secret_hash = %record.secret_hash,
                    order_id = record.order_id,
                    "recovery pass failed, record left as-is: {e}"
                ),
            }
        }

        if promoted > 0 {
            info!(account, promoted, "recovery promoted failure records");
        }
        Ok(promoted)
    }

    async fn repair(&self, account: &str, record: &SwapRecord) -> SettlerResult<bool> {
        let order = self.orderbook.get_order(record.order_id).await?;

        let (Some(role), Some(action)) = (record.state.role(), record.state.failed_action())
        else {
            return Ok(false);
        };

        let leg = action_leg(&order, role, action);
        let observed = match action {
            ActionKind::Initiate => &leg.initiate_tx_hash,
            ActionKind::Redeem => &leg.redeem_tx_hash,
            ActionKind::Refund => &leg.refund_tx_hash,
        };

        if !observed.is_empty() {
            let target = record.state.promotion_target().ok_or_else(|| {
                SettlerError::Internal(format!("{} has no promotion target", record.state))
            })?;
            self.ledger
                .record_success(account, &record.secret_hash, target, observed)
                .await?;
            info!(
                account,
                secret_hash = %record.secret_hash,
                order_id = record.order_id,
                %action,
                tx_hash = %observed,
                "failed action actually landed on-chain, record promoted"
            );
            metrics::record_recovery_promotion(account);
            return Ok(true);
        }

        // The expected hash is absent. A hash for a *different* action on
        // the same leg means remote state contradicts the local record in a
        // way we cannot resolve automatically.
        let others: Vec<&str> = [
            ("initiate", leg.initiate_tx_hash.as_str()),
            ("redeem", leg.redeem_tx_hash.as_str()),
            ("refund", leg.refund_tx_hash.as_str()),
        ]
        .into_iter()
        .filter(|(name, hash)| *name != action.as_str() && !hash.is_empty())
        .map(|(name, _)| name)
        .collect();

        if !others.is_empty() {
            warn!(
                account,
                secret_hash = %record.secret_hash,
                order_id = record.order_id,
                failed_action = %action,
                observed_actions = ?others,
                "remote leg contradicts local failure record, leaving for inspection"
            );
        } else {
            debug!(
                account,
                secret_hash = %record.secret_hash,
                order_id = record.order_id,
                "genuine failure, awaiting explicit retry"
            );
        }
        Ok(false)
    }
}

/// The leg the failed action would have landed on: initiate and refund act
/// on the signer's own leg, redeem spends the counterpart's.
fn action_leg(order: &Order, role: Role, action: ActionKind) -> &crate::types::AtomicSwap {
    let (own, counter) = match role {
        Role::Initiator => (&order.initiator_leg, &order.follower_leg),
        Role::Follower => (&order.follower_leg, &order.initiator_leg),
    };
    match action {
        ActionKind::Initiate | ActionKind::Refund => own,
        ActionKind::Redeem => counter,
    }
}
