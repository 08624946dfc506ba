//! Per-account subscription driver
//!
//! Maintains the live order feed for one account and pushes every batch of
//! updated orders through the reconciler, strictly sequentially so two
//! conflicting actions can never be dispatched for the same swap in one
//! pass. Reconnects with exponential backoff; a periodic safety-net pass
//! re-fetches locally-open swaps in case a push was missed.

use crate::metrics;
use crate::orderbook::{FeedEvent, OrderFilter, OrderbookApi};
use crate::reconcile::Reconciler;
use crate::recovery::Recovery;
use crate::store::SwapLedger;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(8);

pub struct SubscriptionDriver {
    reconciler: Arc<Reconciler>,
    recovery: Arc<Recovery>,
    orderbook: Arc<dyn OrderbookApi>,
    ledger: Arc<SwapLedger>,
    poll_interval: Duration,
}

impl SubscriptionDriver {
    pub fn new(
        reconciler: Arc<Reconciler>,
        recovery: Arc<Recovery>,
        orderbook: Arc<dyn OrderbookApi>,
        ledger: Arc<SwapLedger>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            reconciler,
            recovery,
            orderbook,
            ledger,
            poll_interval,
        }
    }

    /// Drive the account until the stop signal. An in-flight reconciliation
    /// always finishes before the task exits; only the idle waits race the
    /// signal.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let account = self.reconciler.account();
        let mut backoff = INITIAL_BACKOFF;
        let mut poll = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self
                .orderbook
                .subscribe(self.reconciler.signer_address())
                .await
            {
                Ok(mut feed) => {
                    info!(account, "order feed connected");
                    metrics::record_feed_connected(account, true);

                    // Catch up on anything pushed while we were away
                    self.catch_up(account).await;

                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    info!(account, "driver stopping");
                                    metrics::record_feed_connected(account, false);
                                    return;
                                }
                            }
                            _ = poll.tick() => {
                                self.safety_net(account).await;
                            }
                            event = feed.next() => match event {
                                Some(FeedEvent::UpdatedOrders(orders)) => {
                                    backoff = INITIAL_BACKOFF;
                                    debug!(account, count = orders.len(), "order update batch");
                                    for order in &orders {
                                        if let Err(e) = self.reconciler.reconcile(order).await {
                                            warn!(
                                                account,
                                                order_id = order.id,
                                                "reconcile failed: {e}"
                                            );
                                        }
                                    }
                                }
                                Some(FeedEvent::Error(message)) => {
                                    warn!(account, "order feed error: {message}");
                                    break;
                                }
                                None => {
                                    warn!(account, "order feed disconnected");
                                    break;
                                }
                            }
                        }
                    }
                    metrics::record_feed_connected(account, false);
                }
                Err(e) => {
                    warn!(account, "order feed connect failed: {e}");
                }
            }

            metrics::record_feed_reconnect(account);
            tokio::select! {
                _ = sleep(backoff) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        info!(account, "driver stopped");
    }

    /// Sweep the order book for this signer's live orders, both sides
    async fn catch_up(&self, account: &str) {
        let signer = self.reconciler.signer_address().to_string();
        let filters = [
            OrderFilter {
                maker: Some(signer.clone()),
                status: Some(crate::types::OrderStatus::Filled),
                ..Default::default()
            },
            OrderFilter {
                taker: Some(signer),
                status: Some(crate::types::OrderStatus::Filled),
                ..Default::default()
            },
        ];
        for filter in filters {
            match self.orderbook.get_orders(&filter).await {
                Ok(orders) => {
                    for order in &orders {
                        if let Err(e) = self.reconciler.reconcile(order).await {
                            warn!(account, order_id = order.id, "catch-up reconcile failed: {e}");
                        }
                    }
                }
                Err(e) => debug!(account, "catch-up order listing failed: {e}"),
            }
        }
    }

    /// Missed-push safety net: repair failure records, then re-fetch and
    /// reconcile every locally-open swap.
    async fn safety_net(&self, account: &str) {
        if let Err(e) = self.recovery.run(account).await {
            warn!(account, "recovery pass failed: {e}");
        }

        let records = match self.ledger.list_all(account).await {
            Ok(records) => records,
            Err(e) => {
                warn!(account, "ledger listing failed: {e}");
                return;
            }
        };
        let open: Vec<_> = records
            .into_iter()
            .filter(|r| !r.state.is_terminal() && !r.state.is_failure())
            .collect();
        metrics::record_open_swaps(account, open.len());

        for record in open {
            match self.orderbook.get_order(record.order_id).await {
                Ok(order) => {
                    if let Err(e) = self.reconciler.reconcile(&order).await {
                        warn!(
                            account,
                            order_id = record.order_id,
                            "safety-net reconcile failed: {e}"
                        );
                    }
                }
                Err(e) => {
                    debug!(
                        account,
                        order_id = record.order_id,
                        "safety-net order fetch failed: {e}"
                    );
                }
            }
        }
    }
}
