//! swap-settler - Autonomous settlement of cross-chain HTLC atomic swaps
//!
//! The engine watches an external order book for matched orders and, per
//! order, decides which of {no-op, initiate, redeem, refund} each leg owes,
//! submits it through the chain-specific backend, and records the outcome in
//! a persistent ledger that makes every action idempotent and retryable
//! across crashes.

pub mod api;
pub mod backend;
pub mod config;
pub mod driver;
pub mod error;
pub mod keys;
pub mod metrics;
pub mod orderbook;
pub mod reconcile;
pub mod recovery;
pub mod store;
pub mod types;
