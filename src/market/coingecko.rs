use crate::error::AppError;
use crate::market::history::ChartSource;
use crate::market::poller::PriceFeed;
use crate::market::types::{
    parse_market_chart_payload, parse_markets_payload, HistoryPoint, PriceQuote,
};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

pub const COINGECKO_BASE_URL: &str = "https://api.coingecko.com/api/v3";
const COINGECKO_MIN_PAGE_SIZE: usize = 10;
const COINGECKO_MAX_PAGE_SIZE: usize = 250;
const COINGECKO_CHART_DAYS: u16 = 1;

fn markets_endpoint(base_url: &str, asset_ids: &[String]) -> String {
    let per_page = asset_ids
        .len()
        .clamp(COINGECKO_MIN_PAGE_SIZE, COINGECKO_MAX_PAGE_SIZE);
    format!("{}/coins/markets", base_url.trim_end_matches('/'))
        + &format!(
            "?vs_currency=usd&ids={}&order=market_cap_desc&per_page={per_page}&page=1&sparkline=false&price_change_percentage=24h",
            asset_ids.join(",")
        )
}

fn market_chart_endpoint(base_url: &str, asset_id: &str, days: u16) -> String {
    format!(
        "{}/coins/{asset_id}/market_chart",
        base_url.trim_end_matches('/')
    ) + &format!("?vs_currency=usd&days={days}&interval=hourly")
}

pub fn build_http_client(request_timeout: Duration) -> Result<Client, AppError> {
    let client = Client::builder()
        .timeout(request_timeout)
        .user_agent(concat!("dashboard-sync/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

async fn fetch_body(client: &Client, endpoint: String) -> Result<Vec<u8>, AppError> {
    let response = client.get(endpoint).send().await?.error_for_status()?;
    Ok(response.bytes().await?.to_vec())
}

pub async fn fetch_market_quotes(
    client: &Client,
    base_url: &str,
    asset_ids: &[String],
) -> Result<Vec<PriceQuote>, AppError> {
    let mut payload = fetch_body(client, markets_endpoint(base_url, asset_ids)).await?;
    parse_markets_payload(&mut payload)
}

pub async fn fetch_market_chart(
    client: &Client,
    base_url: &str,
    asset_id: &str,
) -> Result<Vec<HistoryPoint>, AppError> {
    let endpoint = market_chart_endpoint(base_url, asset_id, COINGECKO_CHART_DAYS);
    let mut payload = fetch_body(client, endpoint).await?;
    parse_market_chart_payload(&mut payload)
}

/// CoinGecko-backed price feed and chart source.
#[derive(Debug, Clone)]
pub struct HttpPriceFeed {
    client: Client,
    base_url: String,
}

impl HttpPriceFeed {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, AppError> {
        Ok(Self {
            client: build_http_client(request_timeout)?,
            base_url: base_url.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl PriceFeed for HttpPriceFeed {
    async fn fetch_quotes(&self, asset_ids: &[String]) -> Result<Vec<PriceQuote>, AppError> {
        fetch_market_quotes(&self.client, &self.base_url, asset_ids).await
    }
}

#[async_trait]
impl ChartSource for HttpPriceFeed {
    async fn fetch_history(&self, asset_id: &str) -> Result<Vec<HistoryPoint>, AppError> {
        fetch_market_chart(&self.client, &self.base_url, asset_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_markets_endpoint() {
        let assets = vec!["solana".to_string(), "bitcoin".to_string()];
        let endpoint = markets_endpoint(COINGECKO_BASE_URL, &assets);

        assert_eq!(
            endpoint,
            "https://api.coingecko.com/api/v3/coins/markets?vs_currency=usd&ids=solana,bitcoin&order=market_cap_desc&per_page=10&page=1&sparkline=false&price_change_percentage=24h"
        );
    }

    #[test]
    fn markets_page_grows_with_asset_count() {
        let assets: Vec<String> = (0..30).map(|index| format!("asset-{index}")).collect();
        let endpoint = markets_endpoint("http://localhost:8080/", &assets);

        assert!(endpoint.starts_with("http://localhost:8080/coins/markets?"));
        assert!(endpoint.contains("per_page=30"));
    }

    #[test]
    fn builds_market_chart_endpoint() {
        let endpoint = market_chart_endpoint(COINGECKO_BASE_URL, "ethereum", 1);

        assert_eq!(
            endpoint,
            "https://api.coingecko.com/api/v3/coins/ethereum/market_chart?vs_currency=usd&days=1&interval=hourly"
        );
    }

    #[test]
    fn builds_client_with_timeout() {
        let feed = HttpPriceFeed::new(COINGECKO_BASE_URL, Duration::from_secs(10))
            .expect("client should build");
        assert_eq!(feed.base_url(), COINGECKO_BASE_URL);
    }
}
