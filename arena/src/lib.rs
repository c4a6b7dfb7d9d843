pub mod api;
pub mod catalog;
pub mod config;
pub mod contract;
pub mod error;
pub mod feed;
pub mod ledger;
pub mod odds;
pub mod ops;
pub mod portfolio;
pub mod rewards;
pub mod sync;
pub mod tx;
pub mod types;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};
pub use ledger::{Ledger, LedgerCall};
pub use types::{ContestRef, OutcomeKind, Outcomes, PoolSnapshot};
