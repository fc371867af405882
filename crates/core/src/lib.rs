//! Core types for the weekly top-balances aggregator.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub type EntityId = String;
pub type Amount = i128;
pub type WindowIndex = u64;

/// One transfer as read from a ledger log. Amounts are in the ledger's smallest unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Record {
    pub entity: EntityId,
    pub amount: Amount,
    pub date: NaiveDate,
}

impl Record {
    pub fn new(entity: impl Into<EntityId>, amount: Amount, date: NaiveDate) -> Self {
        Self {
            entity: entity.into(),
            amount,
            date,
        }
    }
}

pub mod amount;
pub mod balance;
pub mod error;
pub mod retry;
pub mod window;

pub use amount::{format_scaled, parse_amount, parse_scaled, scale_divisor, LedgerFamily, MAX_DECIMALS};
pub use balance::BalanceMap;
pub use error::PipelineError;
pub use retry::RetryPolicy;
pub use window::{aligned_start, WindowClock};
