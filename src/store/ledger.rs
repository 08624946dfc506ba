//! SQLite-backed swap ledger
//!
//! Persistent per-account ledger of local swap records and the batch
//! executor's action idempotency markers. All mutating calls take the
//! account's lock so concurrent reconciler passes cannot race a
//! read-modify-write on the same record.

use crate::backend::ActionKind;
use crate::error::{SettlerError, SettlerResult};
use crate::store::status::SwapState;

use chrono::NaiveDateTime;
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One local swap record, keyed by (account, secret_hash)
#[derive(Debug, Clone)]
pub struct SwapRecord {
    pub account: String,
    pub secret_hash: String,
    pub order_id: u64,
    pub secret: Option<String>,
    pub state: SwapState,
    pub last_error: Option<String>,
    pub initiate_tx_hash: Option<String>,
    pub redeem_tx_hash: Option<String>,
    pub refund_tx_hash: Option<String>,
    pub updated_at: NaiveDateTime,
}

/// Result of the pre-action guard check
#[derive(Debug, Clone)]
pub struct Actionable {
    pub actionable: bool,
    pub last_error: Option<String>,
}

pub struct SwapLedger {
    pool: SqlitePool,
    account_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SwapLedger {
    /// Open (or create) the ledger database and run migrations
    pub async fn open(url: &str) -> SettlerResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| SettlerError::Config(format!("invalid database url: {e}")))?
            .create_if_missing(true);

        // SQLite serializes writers anyway; a single connection also keeps
        // every caller on the same database when the url is :memory:
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let ledger = Self {
            pool,
            account_locks: DashMap::new(),
        };
        ledger.run_migrations().await?;
        Ok(ledger)
    }

    async fn run_migrations(&self) -> SettlerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swaps (
                account TEXT NOT NULL,
                secret_hash TEXT NOT NULL,
                order_id INTEGER NOT NULL,
                secret TEXT,
                state TEXT NOT NULL,
                last_error TEXT,
                initiate_tx_hash TEXT,
                redeem_tx_hash TEXT,
                refund_tx_hash TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (account, secret_hash)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS action_markers (
                kind TEXT NOT NULL,
                swap_id TEXT NOT NULL,
                PRIMARY KEY (kind, swap_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_swaps_account_state ON swaps (account, state)",
        )
        .execute(&self.pool)
        .await?;

        info!("Ledger migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> SettlerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn account_lock(&self, account: &str) -> Arc<Mutex<()>> {
        self.account_locks
            .entry(account.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Create a fresh swap record. A present secret means this account made
    /// the order (initial state Created); an absent secret means it filled
    /// the order and only knows the hash (initial state Filled).
    pub async fn create_record(
        &self,
        account: &str,
        secret_hash: &str,
        secret: Option<&str>,
        order_id: u64,
    ) -> SettlerResult<()> {
        let lock = self.account_lock(account);
        let _guard = lock.lock().await;

        let state = if secret.is_some() {
            SwapState::Created
        } else {
            SwapState::Filled
        };

        let result = sqlx::query(
            r#"
            INSERT INTO swaps (account, secret_hash, order_id, secret, state)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(account)
        .bind(secret_hash)
        .bind(order_id as i64)
        .bind(secret)
        .bind(state.as_str())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!(account, secret_hash, order_id, %state, "swap record created");
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => Err(SettlerError::DuplicateKey {
                account: account.to_string(),
                secret_hash: secret_hash.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Attach the order id the order book assigned after placement. Records
    /// for orders this account creates are persisted before the order exists
    /// so the secret survives a crash between placement and response.
    pub async fn bind_order(
        &self,
        account: &str,
        secret_hash: &str,
        order_id: u64,
    ) -> SettlerResult<()> {
        let lock = self.account_lock(account);
        let _guard = lock.lock().await;

        // Existence check first so a missing record reports NotFound
        self.state_unlocked(account, secret_hash).await?;
        sqlx::query(
            "UPDATE swaps SET order_id = $1, updated_at = datetime('now') \
             WHERE account = $2 AND secret_hash = $3",
        )
        .bind(order_id as i64)
        .bind(account)
        .bind(secret_hash)
        .execute(&self.pool)
        .await?;

        debug!(account, secret_hash, order_id, "order id bound");
        Ok(())
    }

    /// Current local state of a swap
    pub async fn state(&self, account: &str, secret_hash: &str) -> SettlerResult<SwapState> {
        let row = sqlx::query("SELECT state FROM swaps WHERE account = $1 AND secret_hash = $2")
            .bind(account)
            .bind(secret_hash)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| SettlerError::NotFound {
                account: account.to_string(),
                secret_hash: secret_hash.to_string(),
            })?;

        parse_state(&row.get::<String, _>("state"))
    }

    /// Record a successful chain action as a forward transition
    pub async fn record_success(
        &self,
        account: &str,
        secret_hash: &str,
        next: SwapState,
        tx_hash: &str,
    ) -> SettlerResult<()> {
        let lock = self.account_lock(account);
        let _guard = lock.lock().await;

        let current = self.state_unlocked(account, secret_hash).await?;
        if !current.can_transition_to(next) {
            return Err(SettlerError::IllegalTransition {
                from: current.to_string(),
                to: next.to_string(),
            });
        }

        let column = tx_hash_column(next);
        let sql = format!(
            "UPDATE swaps SET state = $1, {column} = $2, last_error = NULL, \
             updated_at = datetime('now') WHERE account = $3 AND secret_hash = $4"
        );
        sqlx::query(&sql)
            .bind(next.as_str())
            .bind(tx_hash)
            .bind(account)
            .bind(secret_hash)
            .execute(&self.pool)
            .await?;

        debug!(account, secret_hash, %next, tx_hash, "recorded success");
        Ok(())
    }

    /// Record a failed chain action. The record moves to the FailedTo* state
    /// and stays there until an explicit retry.
    pub async fn record_failure(
        &self,
        account: &str,
        secret_hash: &str,
        failed: SwapState,
        error: &str,
    ) -> SettlerResult<()> {
        let lock = self.account_lock(account);
        let _guard = lock.lock().await;

        let current = self.state_unlocked(account, secret_hash).await?;
        if !current.can_transition_to(failed) {
            return Err(SettlerError::IllegalTransition {
                from: current.to_string(),
                to: failed.to_string(),
            });
        }

        sqlx::query(
            "UPDATE swaps SET state = $1, last_error = $2, updated_at = datetime('now') \
             WHERE account = $3 AND secret_hash = $4",
        )
        .bind(failed.as_str())
        .bind(error)
        .bind(account)
        .bind(secret_hash)
        .execute(&self.pool)
        .await?;

        debug!(account, secret_hash, %failed, error, "recorded failure");
        Ok(())
    }

    /// Roll a FailedTo* record back to its retry target. The only transition
    /// allowed to move backwards. Also clears any batch markers for the swap
    /// so the retried action can be enqueued again.
    pub async fn retry(&self, account: &str, secret_hash: &str) -> SettlerResult<SwapState> {
        let lock = self.account_lock(account);
        let _guard = lock.lock().await;

        let current = self.state_unlocked(account, secret_hash).await?;
        let target = current
            .retry_target()
            .ok_or_else(|| SettlerError::NotRetryable {
                state: current.to_string(),
            })?;

        sqlx::query(
            "UPDATE swaps SET state = $1, last_error = NULL, updated_at = datetime('now') \
             WHERE account = $2 AND secret_hash = $3",
        )
        .bind(target.as_str())
        .bind(account)
        .bind(secret_hash)
        .execute(&self.pool)
        .await?;

        sqlx::query("DELETE FROM action_markers WHERE swap_id = $1")
            .bind(secret_hash)
            .execute(&self.pool)
            .await?;

        info!(account, secret_hash, from = %current, to = %target, "swap retried");
        Ok(target)
    }

    /// Pre-action guard: false (with the stored error) while the record sits
    /// in any FailedTo* state.
    pub async fn check_actionable(
        &self,
        account: &str,
        secret_hash: &str,
    ) -> SettlerResult<Actionable> {
        let row = sqlx::query(
            "SELECT state, last_error FROM swaps WHERE account = $1 AND secret_hash = $2",
        )
        .bind(account)
        .bind(secret_hash)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SettlerError::NotFound {
            account: account.to_string(),
            secret_hash: secret_hash.to_string(),
        })?;

        let state = parse_state(&row.get::<String, _>("state"))?;
        Ok(Actionable {
            actionable: !state.is_failure(),
            last_error: row.get("last_error"),
        })
    }

    /// The stored secret for a swap this account created
    pub async fn secret(&self, account: &str, secret_hash: &str) -> SettlerResult<String> {
        let row = sqlx::query("SELECT secret FROM swaps WHERE account = $1 AND secret_hash = $2")
            .bind(account)
            .bind(secret_hash)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| SettlerError::NotFound {
                account: account.to_string(),
                secret_hash: secret_hash.to_string(),
            })?;

        row.get::<Option<String>, _>("secret")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SettlerError::SecretNotFound {
                swap_id: secret_hash.to_string(),
            })
    }

    /// All records for an account, for recovery and the safety-net poll
    pub async fn list_all(&self, account: &str) -> SettlerResult<Vec<SwapRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT account, secret_hash, order_id, secret, state, last_error,
                   initiate_tx_hash, redeem_tx_hash, refund_tx_hash, updated_at
            FROM swaps WHERE account = $1 ORDER BY order_id
            "#,
        )
        .bind(account)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(SwapRecord {
                    account: row.get("account"),
                    secret_hash: row.get("secret_hash"),
                    order_id: row.get::<i64, _>("order_id") as u64,
                    secret: row.get("secret"),
                    state: parse_state(&row.get::<String, _>("state"))?,
                    last_error: row.get("last_error"),
                    initiate_tx_hash: row.get("initiate_tx_hash"),
                    redeem_tx_hash: row.get("redeem_tx_hash"),
                    refund_tx_hash: row.get("refund_tx_hash"),
                    updated_at: row.get("updated_at"),
                })
            })
            .collect()
    }

    /// Atomically record a batch action marker. Returns false if the
    /// (kind, swap_id) pair was already recorded, meaning the action is
    /// queued or done and must not be enqueued again.
    pub async fn try_mark_action(&self, kind: ActionKind, swap_id: &str) -> SettlerResult<bool> {
        let result = sqlx::query("INSERT OR IGNORE INTO action_markers (kind, swap_id) VALUES ($1, $2)")
            .bind(kind.as_str())
            .bind(swap_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Drop all action markers. Run when the batch executor starts so a
    /// restarted process can re-evaluate outstanding actions.
    pub async fn reset_action_markers(&self) -> SettlerResult<()> {
        sqlx::query("DELETE FROM action_markers")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn state_unlocked(&self, account: &str, secret_hash: &str) -> SettlerResult<SwapState> {
        let row = sqlx::query("SELECT state FROM swaps WHERE account = $1 AND secret_hash = $2")
            .bind(account)
            .bind(secret_hash)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| SettlerError::NotFound {
                account: account.to_string(),
                secret_hash: secret_hash.to_string(),
            })?;
        parse_state(&row.get::<String, _>("state"))
    }
}

fn parse_state(s: &str) -> SettlerResult<SwapState> {
    SwapState::parse(s).ok_or_else(|| SettlerError::Internal(format!("unknown swap state: {s}")))
}

fn tx_hash_column(state: SwapState) -> &'static str {
    use SwapState::*;
    match state {
        InitiatorInitiated | FollowerInitiated => "initiate_tx_hash",
        InitiatorRedeemed | FollowerRedeemed => "redeem_tx_hash",
        InitiatorRefunded | FollowerRefunded => "refund_tx_hash",
        // Forward transitions always target a success state
        _ => "initiate_tx_hash",
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|d| d.kind() == sqlx::error::ErrorKind::UniqueViolation)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{hash_secret, new_secret};

    async fn ledger() -> SwapLedger {
        SwapLedger::open("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn create_and_duplicate() {
        let ledger = ledger().await;
        ledger
            .create_record("alice", "aa11", Some("deadbeef"), 7)
            .await
            .unwrap();
        assert_eq!(
            ledger.state("alice", "aa11").await.unwrap(),
            SwapState::Created
        );

        let err = ledger
            .create_record("alice", "aa11", None, 7)
            .await
            .unwrap_err();
        assert!(matches!(err, SettlerError::DuplicateKey { .. }));

        // Same hash under another account is a distinct record
        ledger.create_record("bob", "aa11", None, 7).await.unwrap();
        assert_eq!(ledger.state("bob", "aa11").await.unwrap(), SwapState::Filled);
    }

    #[tokio::test]
    async fn secret_round_trips() {
        let ledger = ledger().await;
        let secret = hex::encode(new_secret());
        let hash = hex::encode(hash_secret(&hex::decode(&secret).unwrap()));

        ledger
            .create_record("alice", &hash, Some(&secret), 1)
            .await
            .unwrap();
        assert_eq!(ledger.secret("alice", &hash).await.unwrap(), secret);

        // Taker record has no secret
        ledger.create_record("bob", &hash, None, 1).await.unwrap();
        assert!(matches!(
            ledger.secret("bob", &hash).await.unwrap_err(),
            SettlerError::SecretNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn success_failure_and_retry_walk() {
        let ledger = ledger().await;
        ledger
            .create_record("alice", "h1", Some("s"), 1)
            .await
            .unwrap();

        ledger
            .record_success("alice", "h1", SwapState::InitiatorInitiated, "tx-init")
            .await
            .unwrap();

        ledger
            .record_failure("alice", "h1", SwapState::InitiatorFailedToRedeem, "gas too low")
            .await
            .unwrap();
        let check = ledger.check_actionable("alice", "h1").await.unwrap();
        assert!(!check.actionable);
        assert_eq!(check.last_error.as_deref(), Some("gas too low"));

        let target = ledger.retry("alice", "h1").await.unwrap();
        assert_eq!(target, SwapState::InitiatorInitiated);
        assert!(ledger.check_actionable("alice", "h1").await.unwrap().actionable);

        ledger
            .record_success("alice", "h1", SwapState::InitiatorRedeemed, "tx-redeem")
            .await
            .unwrap();
        let record = &ledger.list_all("alice").await.unwrap()[0];
        assert_eq!(record.state, SwapState::InitiatorRedeemed);
        assert_eq!(record.initiate_tx_hash.as_deref(), Some("tx-init"));
        assert_eq!(record.redeem_tx_hash.as_deref(), Some("tx-redeem"));
        assert_eq!(record.last_error, None);
    }

    #[tokio::test]
    async fn illegal_transitions_rejected() {
        let ledger = ledger().await;
        ledger.create_record("alice", "h1", None, 1).await.unwrap();

        // Taker record starts Filled; initiator transitions are illegal
        let err = ledger
            .record_success("alice", "h1", SwapState::InitiatorInitiated, "tx")
            .await
            .unwrap_err();
        assert!(matches!(err, SettlerError::IllegalTransition { .. }));

        // Retry only applies to failure states
        let err = ledger.retry("alice", "h1").await.unwrap_err();
        assert!(matches!(err, SettlerError::NotRetryable { .. }));

        assert!(matches!(
            ledger.state("alice", "missing").await.unwrap_err(),
            SettlerError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/ledger.db", dir.path().display());

        {
            let ledger = SwapLedger::open(&url).await.unwrap();
            ledger
                .create_record("alice", "h1", Some("s"), 1)
                .await
                .unwrap();
            ledger
                .record_success("alice", "h1", SwapState::InitiatorInitiated, "tx-init")
                .await
                .unwrap();
        }

        let reopened = SwapLedger::open(&url).await.unwrap();
        let record = &reopened.list_all("alice").await.unwrap()[0];
        assert_eq!(record.state, SwapState::InitiatorInitiated);
        assert_eq!(record.initiate_tx_hash.as_deref(), Some("tx-init"));
        assert_eq!(record.secret.as_deref(), Some("s"));
    }

    #[tokio::test]
    async fn bind_order_updates_placement_id() {
        let ledger = ledger().await;
        ledger
            .create_record("alice", "h1", Some("s"), 0)
            .await
            .unwrap();
        ledger.bind_order("alice", "h1", 99).await.unwrap();
        assert_eq!(ledger.list_all("alice").await.unwrap()[0].order_id, 99);

        assert!(matches!(
            ledger.bind_order("alice", "missing", 1).await.unwrap_err(),
            SettlerError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn action_markers_deduplicate() {
        let ledger = ledger().await;
        assert!(ledger
            .try_mark_action(ActionKind::Redeem, "swap-1")
            .await
            .unwrap());
        assert!(!ledger
            .try_mark_action(ActionKind::Redeem, "swap-1")
            .await
            .unwrap());
        // Different kind for the same swap is a distinct action
        assert!(ledger
            .try_mark_action(ActionKind::Refund, "swap-1")
            .await
            .unwrap());

        ledger.reset_action_markers().await.unwrap();
        assert!(ledger
            .try_mark_action(ActionKind::Redeem, "swap-1")
            .await
            .unwrap());
    }
}
