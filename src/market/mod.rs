pub mod balance;
pub mod coingecko;
pub mod history;
pub mod pipeline;
pub mod poller;
pub mod scheduler;
pub mod solana;
pub mod types;
pub mod valuation;

use std::time::{SystemTime, UNIX_EPOCH};

pub const PRICE_SNAPSHOTS_EVENT: &str = "price_snapshots";
pub const BALANCES_UPDATE_EVENT: &str = "balances_update";
pub const VALUATION_UPDATE_EVENT: &str = "valuation_update";
pub const HISTORY_UPDATE_EVENT: &str = "history_update";
pub const FEED_ERROR_EVENT: &str = "feed_error";

pub(crate) fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
