//! Persistent swap ledger and local state machine

pub mod ledger;
pub mod status;

pub use ledger::{Actionable, SwapLedger, SwapRecord};
pub use status::{Role, SwapState};
