use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_TRACKED_ASSETS: [&str; 6] = [
    "solana",
    "bitcoin",
    "ethereum",
    "cardano",
    "polygon-pos",
    "chainlink",
];
pub const NATIVE_ASSET_ID: &str = "solana";
pub const NATIVE_SYMBOL: &str = "SOL";
pub const NATIVE_DECIMALS: u8 = 9;
pub const DEFAULT_PRICE_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_BALANCE_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_INCLUDE_TOKENS: bool = true;
pub const DEFAULT_HISTORY_POINTS: usize = 24;
pub const DEFAULT_HISTORY_SPACING_MS: i64 = 3_600_000;
pub const DEFAULT_HISTORY_MAX_VARIATION: f64 = 0.05;
pub const MIN_POLL_INTERVAL_MS: u64 = 5_000;
pub const MAX_POLL_INTERVAL_MS: u64 = 600_000;
pub const MIN_HISTORY_POINTS: usize = 2;
pub const MAX_HISTORY_POINTS: usize = 500;
pub const MIN_HISTORY_SPACING_MS: i64 = 60_000;
pub const MAX_HISTORY_MAX_VARIATION: f64 = 0.5;

/// SPL mints the dashboard can name and price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownToken {
    pub mint: &'static str,
    pub symbol: &'static str,
    pub price_asset_id: &'static str,
}

pub static KNOWN_TOKENS: [KnownToken; 2] = [
    KnownToken {
        mint: "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
        symbol: "USDC",
        price_asset_id: "usd-coin",
    },
    KnownToken {
        mint: "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB",
        symbol: "USDT",
        price_asset_id: "tether",
    },
];

pub fn known_token(mint: &str) -> Option<&'static KnownToken> {
    KNOWN_TOKENS.iter().find(|token| token.mint == mint)
}

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotSource {
    Live,
    Fallback,
}

/// One asset's quote as reported by a price feed, before it is stamped into
/// a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceQuote {
    pub asset_id: String,
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub price_usd: f64,
    pub change_24h_pct: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub market_cap_usd: Option<f64>,
    pub volume_24h_usd: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriceSnapshot {
    pub asset_id: String,
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub price_usd: f64,
    pub change_24h_pct: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub market_cap_usd: Option<f64>,
    pub volume_24h_usd: Option<f64>,
    pub fetched_at: i64,
    pub source: SnapshotSource,
    pub sequence: u64,
}

impl PriceSnapshot {
    pub fn from_quote(
        quote: PriceQuote,
        source: SnapshotSource,
        sequence: u64,
        fetched_at: i64,
    ) -> Self {
        Self {
            asset_id: quote.asset_id,
            symbol: quote.symbol,
            name: quote.name,
            price_usd: quote.price_usd,
            change_24h_pct: quote.change_24h_pct,
            high_24h: quote.high_24h,
            low_24h: quote.low_24h,
            market_cap_usd: quote.market_cap_usd,
            volume_24h_usd: quote.volume_24h_usd,
            fetched_at,
            source,
            sequence,
        }
    }

    pub fn is_live(&self) -> bool {
        self.source == SnapshotSource::Live
    }
}

pub type PriceSnapshotMap = BTreeMap<String, PriceSnapshot>;

/// Smallest-unit amount plus the decimals needed to scale it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerAmount {
    pub raw: u64,
    pub decimals: u8,
}

impl LedgerAmount {
    pub fn ui_amount(&self) -> f64 {
        self.raw as f64 / 10f64.powi(i32::from(self.decimals))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHolding {
    pub mint: String,
    pub amount: LedgerAmount,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BalanceSnapshot {
    pub account_id: String,
    pub asset_id: String,
    pub symbol: Option<String>,
    pub amount: f64,
    pub raw_amount: u64,
    pub decimals: u8,
    pub fetched_at: i64,
    pub source: SnapshotSource,
}

impl BalanceSnapshot {
    pub fn from_ledger(
        account_id: &str,
        asset_id: &str,
        symbol: Option<String>,
        amount: LedgerAmount,
        fetched_at: i64,
    ) -> Self {
        Self {
            account_id: account_id.to_string(),
            asset_id: asset_id.to_string(),
            symbol,
            amount: amount.ui_amount(),
            raw_amount: amount.raw,
            decimals: amount.decimals,
            fetched_at,
            source: SnapshotSource::Live,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccountBalances {
    pub account_id: String,
    pub native: BalanceSnapshot,
    pub tokens: Vec<BalanceSnapshot>,
}

impl AccountBalances {
    pub fn iter(&self) -> impl Iterator<Item = &BalanceSnapshot> {
        std::iter::once(&self.native).chain(self.tokens.iter())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "state", content = "balances", rename_all = "lowercase")]
pub enum BalanceState {
    #[default]
    Empty,
    Loaded(AccountBalances),
}

impl BalanceState {
    pub fn loaded(&self) -> Option<&AccountBalances> {
        match self {
            Self::Empty => None,
            Self::Loaded(balances) => Some(balances),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Valuation {
    pub account_id: String,
    pub asset_id: String,
    pub amount: f64,
    pub price_usd: f64,
    pub value_usd: f64,
    pub computed_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PendingReason {
    MissingBalance,
    MissingPrice,
    MissingBoth,
    AssetMismatch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ValuationOutcome {
    Ready(Valuation),
    Pending { reason: PendingReason },
}

impl ValuationOutcome {
    pub fn ready(&self) -> Option<&Valuation> {
        match self {
            Self::Ready(valuation) => Some(valuation),
            Self::Pending { .. } => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingAsset {
    pub asset_id: String,
    pub reason: PendingReason,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioTotal {
    pub account_id: String,
    pub total_value_usd: f64,
    pub valuations: Vec<Valuation>,
    pub pending_assets: Vec<PendingAsset>,
    pub computed_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", content = "portfolio", rename_all = "lowercase")]
pub enum PortfolioView {
    Disconnected,
    Pending,
    Valued(PortfolioTotal),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPoint {
    pub timestamp: i64,
    pub price_usd: f64,
    pub synthesized: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HistoryOrigin {
    Synthesized,
    Genuine,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistorySeries {
    pub asset_id: String,
    pub points: Vec<HistoryPoint>,
    pub anchor_price: f64,
    pub generated_at: i64,
    pub origin: HistoryOrigin,
}

/// Point-in-time view of everything the dashboard shows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSnapshot {
    pub prices: PriceSnapshotMap,
    pub balances: BalanceState,
    pub portfolio: PortfolioView,
    pub history: Option<HistorySeries>,
    pub chart_asset: Option<String>,
    pub tracked_assets: Vec<String>,
    pub price_feed_running: bool,
    pub active_account: Option<String>,
    pub balance_polling: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartPriceFeedArgs {
    pub assets: Option<Vec<String>>,
    pub interval_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceFeedConfig {
    pub assets: Vec<String>,
    pub interval_ms: u64,
}

impl StartPriceFeedArgs {
    pub fn normalize(self) -> Result<PriceFeedConfig, AppError> {
        let assets = match self.assets {
            Some(assets) => normalize_asset_ids(&assets)?,
            None => DEFAULT_TRACKED_ASSETS
                .iter()
                .map(|asset| asset.to_string())
                .collect(),
        };

        let interval_ms = self.interval_ms.unwrap_or(DEFAULT_PRICE_INTERVAL_MS);
        if !(MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&interval_ms) {
            return Err(AppError::Config(format!(
                "intervalMs must be between {MIN_POLL_INTERVAL_MS} and {MAX_POLL_INTERVAL_MS}"
            )));
        }

        Ok(PriceFeedConfig {
            assets,
            interval_ms,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAccountArgs {
    pub account_id: String,
    pub interval_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BalancePollingConfig {
    pub account_id: String,
    pub interval_ms: u64,
}

impl ConnectAccountArgs {
    pub fn normalize(self) -> Result<BalancePollingConfig, AppError> {
        let account_id = validate_account_id(&self.account_id)?;
        let interval_ms = self.interval_ms.unwrap_or(DEFAULT_BALANCE_INTERVAL_MS);
        if !(MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&interval_ms) {
            return Err(AppError::Config(format!(
                "intervalMs must be between {MIN_POLL_INTERVAL_MS} and {MAX_POLL_INTERVAL_MS}"
            )));
        }

        Ok(BalancePollingConfig {
            account_id,
            interval_ms,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectChartAssetArgs {
    pub asset_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HistoryArgs {
    pub points: Option<usize>,
    pub spacing_ms: Option<i64>,
    pub max_variation: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryConfig {
    pub points: usize,
    pub spacing_ms: i64,
    pub max_variation: f64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            points: DEFAULT_HISTORY_POINTS,
            spacing_ms: DEFAULT_HISTORY_SPACING_MS,
            max_variation: DEFAULT_HISTORY_MAX_VARIATION,
        }
    }
}

impl HistoryArgs {
    pub fn normalize(self) -> Result<HistoryConfig, AppError> {
        let points = self.points.unwrap_or(DEFAULT_HISTORY_POINTS);
        if !(MIN_HISTORY_POINTS..=MAX_HISTORY_POINTS).contains(&points) {
            return Err(AppError::Config(format!(
                "points must be between {MIN_HISTORY_POINTS} and {MAX_HISTORY_POINTS}"
            )));
        }

        let spacing_ms = self.spacing_ms.unwrap_or(DEFAULT_HISTORY_SPACING_MS);
        if spacing_ms < MIN_HISTORY_SPACING_MS {
            return Err(AppError::Config(format!(
                "spacingMs must be at least {MIN_HISTORY_SPACING_MS}"
            )));
        }

        let max_variation = self
            .max_variation
            .unwrap_or(DEFAULT_HISTORY_MAX_VARIATION);
        if !max_variation.is_finite()
            || max_variation <= 0.0
            || max_variation > MAX_HISTORY_MAX_VARIATION
        {
            return Err(AppError::Config(format!(
                "maxVariation must be in (0, {MAX_HISTORY_MAX_VARIATION}]"
            )));
        }

        Ok(HistoryConfig {
            points,
            spacing_ms,
            max_variation,
        })
    }
}

/// Trims, lowercases and de-duplicates asset ids, keeping first-seen order.
pub fn normalize_asset_ids<S: AsRef<str>>(asset_ids: &[S]) -> Result<Vec<String>, AppError> {
    let mut normalized: Vec<String> = Vec::with_capacity(asset_ids.len());
    for raw in asset_ids {
        let asset_id = raw.as_ref().trim().to_ascii_lowercase();
        if asset_id.is_empty() {
            continue;
        }
        if !asset_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-')
        {
            return Err(AppError::Config(format!(
                "asset id '{asset_id}' must be alphanumeric ASCII or '-'"
            )));
        }
        if !normalized.contains(&asset_id) {
            normalized.push(asset_id);
        }
    }

    if normalized.is_empty() {
        return Err(AppError::Config(
            "at least one asset id is required".to_string(),
        ));
    }
    Ok(normalized)
}

pub fn validate_account_id(account_id: &str) -> Result<String, AppError> {
    let trimmed = account_id.trim();
    if !(32..=44).contains(&trimmed.len()) {
        return Err(AppError::InvalidAccount(format!(
            "'{trimmed}' is not a 32-44 character address"
        )));
    }
    if !trimmed.chars().all(|ch| BASE58_ALPHABET.contains(ch)) {
        return Err(AppError::InvalidAccount(format!(
            "'{trimmed}' contains non-base58 characters"
        )));
    }
    Ok(trimmed.to_string())
}

#[derive(Debug, Deserialize)]
pub struct MarketQuoteWire {
    pub id: String,
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub current_price: Option<f64>,
    pub price_change_percentage_24h: Option<f64>,
    pub high_24h: Option<f64>,
    pub low_24h: Option<f64>,
    pub market_cap: Option<f64>,
    pub total_volume: Option<f64>,
}

fn required_finite(value: Option<f64>, field: &str, asset_id: &str) -> Result<f64, AppError> {
    match value {
        Some(number) if number.is_finite() => Ok(number),
        Some(_) => Err(AppError::Schema(format!(
            "{field} for '{asset_id}' must be finite"
        ))),
        None => Err(AppError::Schema(format!(
            "{field} missing for '{asset_id}'"
        ))),
    }
}

impl TryFrom<MarketQuoteWire> for PriceQuote {
    type Error = AppError;

    fn try_from(value: MarketQuoteWire) -> Result<Self, Self::Error> {
        let asset_id = value.id.trim().to_ascii_lowercase();
        if asset_id.is_empty() {
            return Err(AppError::Schema("quote without asset id".to_string()));
        }

        let price_usd = required_finite(value.current_price, "current_price", &asset_id)?;
        if price_usd < 0.0 {
            return Err(AppError::Schema(format!(
                "current_price for '{asset_id}' must be non-negative"
            )));
        }
        let change_24h_pct = required_finite(
            value.price_change_percentage_24h,
            "price_change_percentage_24h",
            &asset_id,
        )?;
        let high_24h = required_finite(value.high_24h, "high_24h", &asset_id)?;
        let low_24h = required_finite(value.low_24h, "low_24h", &asset_id)?;

        Ok(Self {
            symbol: value.symbol.map(|symbol| symbol.to_ascii_uppercase()),
            name: value.name,
            price_usd,
            change_24h_pct,
            high_24h,
            low_24h,
            market_cap_usd: value.market_cap.filter(|number| number.is_finite()),
            volume_24h_usd: value.total_volume.filter(|number| number.is_finite()),
            asset_id,
        })
    }
}

pub fn parse_markets_payload(payload: &mut [u8]) -> Result<Vec<PriceQuote>, AppError> {
    let wire: Vec<MarketQuoteWire> = simd_json::serde::from_slice(payload)?;
    wire.into_iter().map(PriceQuote::try_from).collect()
}

#[derive(Debug, Deserialize)]
pub struct MarketChartWire {
    pub prices: Vec<(f64, f64)>,
}

pub fn parse_market_chart_payload(payload: &mut [u8]) -> Result<Vec<HistoryPoint>, AppError> {
    let wire: MarketChartWire = simd_json::serde::from_slice(payload)?;
    let mut points = Vec::with_capacity(wire.prices.len());
    for (timestamp, price) in wire.prices {
        if !timestamp.is_finite() || !price.is_finite() || price < 0.0 {
            return Err(AppError::Schema(
                "market chart entries must be finite and non-negative".to_string(),
            ));
        }
        points.push(HistoryPoint {
            timestamp: timestamp as i64,
            price_usd: price,
            synthesized: false,
        });
    }
    Ok(points)
}
