//! End-to-end settlement scenarios over the reconciliation engine
//!
//! Walks whole swap lifecycles against scripted backends and an in-memory
//! ledger: maker initiate -> redeem, follower refund after expiry, failure
//! blocking and operator retry.

use swap_settler::backend::SwapBackend;
use swap_settler::error::{SettlerError, SettlerResult};
use swap_settler::reconcile::Reconciler;
use swap_settler::store::{SwapLedger, SwapState};
use swap_settler::types::{
    hash_secret, new_secret, AtomicSwap, Chain, LegStatus, Order, OrderStatus,
};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const MAKER: &str = "0xmaker";
const TAKER: &str = "0xtaker";

/// Scripted backend that records every submission and answers with fixed
/// transaction hashes.
#[derive(Default)]
struct ScriptedBackend {
    initiates: Mutex<Vec<String>>,
    redeems: Mutex<Vec<(String, Vec<u8>)>>,
    refunds: Mutex<Vec<String>>,
    expired: bool,
    fail_initiate: Option<String>,
}

impl ScriptedBackend {
    fn with_expired(mut self, expired: bool) -> Self {
        self.expired = expired;
        self
    }

    fn failing_initiate(mut self, error: &str) -> Self {
        self.fail_initiate = Some(error.to_string());
        self
    }

    fn initiate_count(&self) -> usize {
        self.initiates.lock().unwrap().len()
    }
}

#[async_trait]
impl SwapBackend for ScriptedBackend {
    async fn initiate(&self, swap: &AtomicSwap) -> SettlerResult<String> {
        if let Some(error) = &self.fail_initiate {
            return Err(SettlerError::Transaction(error.clone()));
        }
        self.initiates.lock().unwrap().push(swap.secret_hash.clone());
        Ok(format!("init-{}", swap.chain))
    }

    async fn redeem(&self, swap: &AtomicSwap, secret: &[u8]) -> SettlerResult<String> {
        self.redeems
            .lock()
            .unwrap()
            .push((swap.secret_hash.clone(), secret.to_vec()));
        Ok(format!("redeem-{}", swap.chain))
    }

    async fn refund(&self, swap: &AtomicSwap) -> SettlerResult<String> {
        self.refunds.lock().unwrap().push(swap.secret_hash.clone());
        Ok(format!("refund-{}", swap.chain))
    }

    async fn expired(&self, _swap: &AtomicSwap) -> SettlerResult<bool> {
        Ok(self.expired)
    }
}

fn leg(chain: Chain, amount: &str, secret_hash: &str) -> AtomicSwap {
    AtomicSwap {
        chain,
        asset: "primary".into(),
        amount: amount.into(),
        timelock: 144,
        initiator_address: "addr-initiator".into(),
        redeemer_address: "addr-redeemer".into(),
        secret_hash: secret_hash.into(),
        secret: String::new(),
        status: LegStatus::Unknown,
        initiate_tx_hash: String::new(),
        redeem_tx_hash: String::new(),
        refund_tx_hash: String::new(),
    }
}

/// Bitcoin send leg (maker initiates), EVM receive leg (taker initiates)
fn matched_order(secret_hash: &str) -> Order {
    Order {
        id: 7,
        secret_hash: secret_hash.into(),
        order_pair: "bitcoin_regtest-ethereum".into(),
        maker: MAKER.into(),
        taker: TAKER.into(),
        status: OrderStatus::Filled,
        initiator_leg: leg(Chain::BitcoinRegtest, "100000", secret_hash),
        follower_leg: leg(Chain::Ethereum, "200000", secret_hash),
    }
}

struct Scenario {
    ledger: Arc<SwapLedger>,
    btc: Arc<ScriptedBackend>,
    evm: Arc<ScriptedBackend>,
    secret: String,
    secret_hash: String,
}

impl Scenario {
    async fn new(btc: ScriptedBackend, evm: ScriptedBackend) -> Self {
        let secret_bytes = new_secret();
        Self {
            ledger: Arc::new(SwapLedger::open("sqlite::memory:").await.unwrap()),
            btc: Arc::new(btc),
            evm: Arc::new(evm),
            secret: hex::encode(secret_bytes),
            secret_hash: hex::encode(hash_secret(&secret_bytes)),
        }
    }

    fn reconciler(&self, account: &str, signer: &str) -> Reconciler {
        let mut backends: HashMap<Chain, Arc<dyn SwapBackend>> = HashMap::new();
        backends.insert(Chain::BitcoinRegtest, self.btc.clone());
        backends.insert(Chain::Ethereum, self.evm.clone());
        Reconciler::new(
            account.into(),
            signer.into(),
            self.ledger.clone(),
            backends,
            None,
        )
    }
}

#[tokio::test]
async fn maker_settles_initiate_then_redeem() {
    let scenario = Scenario::new(ScriptedBackend::default(), ScriptedBackend::default()).await;
    scenario
        .ledger
        .create_record("alice", &scenario.secret_hash, Some(&scenario.secret), 7)
        .await
        .unwrap();
    let engine = scenario.reconciler("alice", MAKER);

    // First observation: both legs unknown, the maker funds its Bitcoin leg
    let order = matched_order(&scenario.secret_hash);
    engine.reconcile(&order).await.unwrap();
    assert_eq!(scenario.btc.initiate_count(), 1);
    let record = &scenario.ledger.list_all("alice").await.unwrap()[0];
    assert_eq!(record.state, SwapState::InitiatorInitiated);
    assert_eq!(record.initiate_tx_hash.as_deref(), Some("init-bitcoin_regtest"));

    // Replayed observation: no second submission
    engine.reconcile(&order).await.unwrap();
    assert_eq!(scenario.btc.initiate_count(), 1);

    // The follower funded its EVM leg: the maker redeems it with its secret
    let mut order = matched_order(&scenario.secret_hash);
    order.initiator_leg.status = LegStatus::Initiated;
    order.follower_leg.status = LegStatus::Initiated;
    engine.reconcile(&order).await.unwrap();

    let redeems = scenario.evm.redeems.lock().unwrap().clone();
    assert_eq!(redeems.len(), 1);
    assert_eq!(redeems[0].1, hex::decode(&scenario.secret).unwrap());
    let record = &scenario.ledger.list_all("alice").await.unwrap()[0];
    assert_eq!(record.state, SwapState::InitiatorRedeemed);
    assert_eq!(record.redeem_tx_hash.as_deref(), Some("redeem-ethereum"));

    // Replay after settlement stays settled
    engine.reconcile(&order).await.unwrap();
    assert_eq!(scenario.evm.redeems.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn follower_refunds_after_own_leg_expires() {
    // Follower's own leg is the EVM one; its backend reports expiry elapsed
    let scenario = Scenario::new(
        ScriptedBackend::default(),
        ScriptedBackend::default().with_expired(true),
    )
    .await;
    scenario
        .ledger
        .create_record("bob", &scenario.secret_hash, None, 7)
        .await
        .unwrap();
    scenario
        .ledger
        .record_success("bob", &scenario.secret_hash, SwapState::FollowerInitiated, "t0")
        .await
        .unwrap();
    let engine = scenario.reconciler("bob", TAKER);

    let mut order = matched_order(&scenario.secret_hash);
    order.initiator_leg.status = LegStatus::Redeemed;
    order.follower_leg.status = LegStatus::Expired;
    engine.reconcile(&order).await.unwrap();

    assert_eq!(
        scenario.evm.refunds.lock().unwrap().as_slice(),
        &[scenario.secret_hash.clone()]
    );
    let record = &scenario.ledger.list_all("bob").await.unwrap()[0];
    assert_eq!(record.state, SwapState::FollowerRefunded);
    assert_eq!(record.refund_tx_hash.as_deref(), Some("refund-ethereum"));
}

#[tokio::test]
async fn premature_expiry_flag_never_refunds() {
    let scenario = Scenario::new(
        ScriptedBackend::default(),
        ScriptedBackend::default().with_expired(false),
    )
    .await;
    scenario
        .ledger
        .create_record("bob", &scenario.secret_hash, None, 7)
        .await
        .unwrap();
    scenario
        .ledger
        .record_success("bob", &scenario.secret_hash, SwapState::FollowerInitiated, "t0")
        .await
        .unwrap();
    let engine = scenario.reconciler("bob", TAKER);

    let mut order = matched_order(&scenario.secret_hash);
    order.follower_leg.status = LegStatus::Expired;
    engine.reconcile(&order).await.unwrap();

    assert!(scenario.evm.refunds.lock().unwrap().is_empty());
    assert_eq!(
        scenario.ledger.state("bob", &scenario.secret_hash).await.unwrap(),
        SwapState::FollowerInitiated
    );
}

#[tokio::test]
async fn failed_initiate_blocks_until_operator_retry() {
    let scenario = Scenario::new(
        ScriptedBackend::default().failing_initiate("insufficient funds"),
        ScriptedBackend::default(),
    )
    .await;
    scenario
        .ledger
        .create_record("alice", &scenario.secret_hash, Some(&scenario.secret), 7)
        .await
        .unwrap();
    let engine = scenario.reconciler("alice", MAKER);

    let order = matched_order(&scenario.secret_hash);
    engine.reconcile(&order).await.unwrap();
    let check = scenario
        .ledger
        .check_actionable("alice", &scenario.secret_hash)
        .await
        .unwrap();
    assert!(!check.actionable);
    assert_eq!(check.last_error.as_deref(), Some("Transaction error: insufficient funds"));

    // Further observations do nothing while the failure is recorded
    engine.reconcile(&order).await.unwrap();
    assert_eq!(scenario.btc.initiate_count(), 0);

    // Operator retry rolls back to the pre-failure state and reopens the walk
    let target = scenario
        .ledger
        .retry("alice", &scenario.secret_hash)
        .await
        .unwrap();
    assert_eq!(target, SwapState::Created);
    assert!(scenario
        .ledger
        .check_actionable("alice", &scenario.secret_hash)
        .await
        .unwrap()
        .actionable);
}

#[tokio::test]
async fn secret_round_trips_through_the_ledger() {
    let scenario = Scenario::new(ScriptedBackend::default(), ScriptedBackend::default()).await;
    scenario
        .ledger
        .create_record("alice", &scenario.secret_hash, Some(&scenario.secret), 7)
        .await
        .unwrap();

    let stored = scenario
        .ledger
        .secret("alice", &scenario.secret_hash)
        .await
        .unwrap();
    assert_eq!(stored, scenario.secret);
    assert_eq!(
        hex::encode(hash_secret(&hex::decode(&stored).unwrap())),
        scenario.secret_hash
    );
}
