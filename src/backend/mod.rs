//! Chain-specific swap backends
//!
//! A SwapBackend constructs, signs, and submits the HTLC operations for one
//! chain family. The reconciler only ever speaks this interface; everything
//! below it (script construction, calldata, fee handling) is backend-private.

pub mod bitcoin;
pub mod evm;

use crate::error::{SettlerError, SettlerResult};
use crate::types::AtomicSwap;

use async_trait::async_trait;
use std::fmt;

/// The three chain actions a swap leg can need
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Initiate,
    Redeem,
    Refund,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Initiate => "initiate",
            ActionKind::Redeem => "redeem",
            ActionKind::Refund => "refund",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chain-specific HTLC operations. Implementations submit transactions but
/// never touch the ledger; recording outcomes is the caller's job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SwapBackend: Send + Sync {
    /// Fund the HTLC for this leg. Returns the transaction hash.
    async fn initiate(&self, swap: &AtomicSwap) -> SettlerResult<String>;

    /// Spend the HTLC with the secret. Returns the transaction hash.
    async fn redeem(&self, swap: &AtomicSwap, secret: &[u8]) -> SettlerResult<String>;

    /// Reclaim the HTLC after its timelock. Returns the transaction hash.
    /// Only valid once `expired` reports true.
    async fn refund(&self, swap: &AtomicSwap) -> SettlerResult<String>;

    /// Whether the leg's timelock has elapsed on-chain.
    async fn expired(&self, swap: &AtomicSwap) -> SettlerResult<bool>;

    /// Recover the revealed secret for a leg the counterparty redeemed.
    /// Backends without on-chain secret discovery report `SecretNotFound`;
    /// the order book's indexer is then the only source.
    async fn reveal_secret(&self, swap: &AtomicSwap) -> SettlerResult<Vec<u8>> {
        Err(SettlerError::SecretNotFound {
            swap_id: swap.secret_hash.clone(),
        })
    }
}
