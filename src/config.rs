use crate::error::AppError;
use crate::market::coingecko::COINGECKO_BASE_URL;
use crate::market::pipeline::DashboardOptions;
use crate::market::solana::SOLANA_MAINNET_RPC_URL;
use crate::market::types::{
    BalancePollingConfig, ConnectAccountArgs, HistoryArgs, HistoryConfig, PriceFeedConfig,
    StartPriceFeedArgs, DEFAULT_INCLUDE_TOKENS, DEFAULT_REQUEST_TIMEOUT_MS,
};
use std::time::Duration;

const MIN_REQUEST_TIMEOUT_MS: u64 = 500;
const MAX_REQUEST_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq)]
pub struct DashboardSettings {
    pub price_feed_base_url: String,
    pub solana_rpc_url: String,
    pub request_timeout: Duration,
    pub price_feed: PriceFeedConfig,
    pub account: Option<BalancePollingConfig>,
    pub include_tokens: bool,
    pub genuine_history: bool,
    pub history: HistoryConfig,
}

impl DashboardSettings {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Self::from_env`] with an injectable variable source. Blank
    /// values count as unset.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, AppError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let request_timeout_ms = match read("REQUEST_TIMEOUT_MS") {
            Some(raw) => parse_millis("REQUEST_TIMEOUT_MS", &raw)?,
            None => DEFAULT_REQUEST_TIMEOUT_MS,
        };
        if !(MIN_REQUEST_TIMEOUT_MS..=MAX_REQUEST_TIMEOUT_MS).contains(&request_timeout_ms) {
            return Err(AppError::Config(format!(
                "REQUEST_TIMEOUT_MS must be between {MIN_REQUEST_TIMEOUT_MS} and {MAX_REQUEST_TIMEOUT_MS}"
            )));
        }

        let price_feed = StartPriceFeedArgs {
            assets: read("TRACKED_ASSETS")
                .map(|raw| raw.split(',').map(str::to_string).collect()),
            interval_ms: read("PRICE_INTERVAL_MS")
                .map(|raw| parse_millis("PRICE_INTERVAL_MS", &raw))
                .transpose()?,
        }
        .normalize()?;

        let account = match read("WALLET_ADDRESS") {
            Some(account_id) => Some(
                ConnectAccountArgs {
                    account_id,
                    interval_ms: read("BALANCE_INTERVAL_MS")
                        .map(|raw| parse_millis("BALANCE_INTERVAL_MS", &raw))
                        .transpose()?,
                }
                .normalize()?,
            ),
            None => None,
        };

        let history = HistoryArgs {
            points: read("HISTORY_POINTS")
                .map(|raw| {
                    raw.parse::<usize>().map_err(|error| {
                        AppError::Config(format!("HISTORY_POINTS must be a count: {error}"))
                    })
                })
                .transpose()?,
            spacing_ms: read("HISTORY_SPACING_MS")
                .map(|raw| parse_millis("HISTORY_SPACING_MS", &raw))
                .transpose()?
                .map(|spacing_ms| spacing_ms.min(i64::MAX as u64) as i64),
            max_variation: read("HISTORY_MAX_VARIATION")
                .map(|raw| {
                    raw.parse::<f64>().map_err(|error| {
                        AppError::Config(format!("HISTORY_MAX_VARIATION must be a number: {error}"))
                    })
                })
                .transpose()?,
        }
        .normalize()?;

        Ok(Self {
            price_feed_base_url: read("PRICE_FEED_BASE_URL")
                .unwrap_or_else(|| COINGECKO_BASE_URL.to_string()),
            solana_rpc_url: read("SOLANA_RPC_URL")
                .unwrap_or_else(|| SOLANA_MAINNET_RPC_URL.to_string()),
            request_timeout: Duration::from_millis(request_timeout_ms),
            price_feed,
            account,
            include_tokens: read("INCLUDE_TOKENS")
                .map(|raw| parse_flag("INCLUDE_TOKENS", &raw))
                .transpose()?
                .unwrap_or(DEFAULT_INCLUDE_TOKENS),
            genuine_history: read("GENUINE_HISTORY")
                .map(|raw| parse_flag("GENUINE_HISTORY", &raw))
                .transpose()?
                .unwrap_or(false),
            history,
        })
    }

    pub fn dashboard_options(&self) -> DashboardOptions {
        DashboardOptions {
            request_timeout: self.request_timeout,
            include_tokens: self.include_tokens,
            history: self.history,
            ..DashboardOptions::default()
        }
    }
}

fn parse_millis(name: &str, raw: &str) -> Result<u64, AppError> {
    raw.parse::<u64>()
        .map_err(|error| AppError::Config(format!("{name} must be milliseconds: {error}")))
}

fn parse_flag(name: &str, raw: &str) -> Result<bool, AppError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AppError::Config(format!("{name} must be a boolean, got '{raw}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::{DEFAULT_PRICE_INTERVAL_MS, DEFAULT_TRACKED_ASSETS};
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<DashboardSettings, AppError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        DashboardSettings::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn falls_back_to_defaults() {
        let settings = settings(&[("PRICE_FEED_BASE_URL", "   ")]).expect("defaults valid");

        assert_eq!(settings.price_feed_base_url, COINGECKO_BASE_URL);
        assert_eq!(settings.solana_rpc_url, SOLANA_MAINNET_RPC_URL);
        assert_eq!(settings.price_feed.assets.len(), DEFAULT_TRACKED_ASSETS.len());
        assert_eq!(settings.price_feed.interval_ms, DEFAULT_PRICE_INTERVAL_MS);
        assert_eq!(settings.request_timeout, Duration::from_secs(10));
        assert!(settings.account.is_none());
        assert!(settings.include_tokens);
        assert!(!settings.genuine_history);
        assert_eq!(settings.history, HistoryConfig::default());
    }

    #[test]
    fn reads_overrides() {
        let settings = settings(&[
            ("TRACKED_ASSETS", "Bitcoin, solana,,bitcoin"),
            ("PRICE_INTERVAL_MS", "15000"),
            ("WALLET_ADDRESS", "5Q544fKrFoe6tsEbD7S8EmxGTJYAKtTVhAW5Q5pge4j1"),
            ("BALANCE_INTERVAL_MS", "20000"),
            ("INCLUDE_TOKENS", "no"),
            ("GENUINE_HISTORY", "TRUE"),
            ("REQUEST_TIMEOUT_MS", "2500"),
            ("HISTORY_POINTS", "48"),
            ("HISTORY_MAX_VARIATION", "0.1"),
        ])
        .expect("overrides valid");

        assert_eq!(
            settings.price_feed.assets,
            vec!["bitcoin".to_string(), "solana".to_string()]
        );
        assert_eq!(settings.price_feed.interval_ms, 15_000);
        let account = settings.account.expect("wallet configured");
        assert_eq!(account.interval_ms, 20_000);
        assert!(!settings.include_tokens);
        assert!(settings.genuine_history);
        assert_eq!(settings.request_timeout, Duration::from_millis(2_500));
        assert_eq!(settings.history.points, 48);
        assert_eq!(settings.history.max_variation, 0.1);
        assert_eq!(settings.history.spacing_ms, 3_600_000);
    }

    #[test]
    fn rejects_malformed_values() {
        assert!(matches!(
            settings(&[("PRICE_INTERVAL_MS", "soon")]),
            Err(AppError::Config(_))
        ));
        assert!(matches!(
            settings(&[("INCLUDE_TOKENS", "maybe")]),
            Err(AppError::Config(_))
        ));
        assert!(matches!(
            settings(&[("WALLET_ADDRESS", "0xabc")]),
            Err(AppError::InvalidAccount(_))
        ));
        assert!(matches!(
            settings(&[("REQUEST_TIMEOUT_MS", "5")]),
            Err(AppError::Config(_))
        ));
    }
}
