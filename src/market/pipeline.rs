use crate::error::AppError;
use crate::market::balance::{BalanceFetcher, FetcherOptions, Ledger};
use crate::market::history::{ChartSource, HistorySynthesizer};
use crate::market::now_unix_ms;
use crate::market::poller::{CycleReport, FallbackCatalog, PollerOptions, PriceFeed, PriceFeedPoller};
use crate::market::types::{
    normalize_asset_ids, AccountBalances, BalancePollingConfig, BalanceState, DashboardSnapshot,
    HistoryConfig, HistorySeries, PortfolioView, PriceFeedConfig, PriceSnapshotMap,
    DEFAULT_INCLUDE_TOKENS, DEFAULT_REQUEST_TIMEOUT_MS, NATIVE_ASSET_ID,
};
use crate::market::valuation::portfolio_view;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct DashboardOptions {
    pub request_timeout: Duration,
    pub include_tokens: bool,
    pub history: HistoryConfig,
    pub fallback: FallbackCatalog,
    pub chart_source: Option<Arc<dyn ChartSource>>,
    pub history_seed: Option<u64>,
}

impl Default for DashboardOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            include_tokens: DEFAULT_INCLUDE_TOKENS,
            history: HistoryConfig::default(),
            fallback: FallbackCatalog::default(),
            chart_source: None,
            history_seed: None,
        }
    }
}

/// Derived state fan-out. Price and balance callbacks land here from their
/// cycle tasks and republish through watch channels.
struct DashboardHub {
    update_lock: Mutex<()>,
    history: Mutex<HistorySynthesizer<StdRng>>,
    chart_asset: Mutex<Option<String>>,
    prices_tx: watch::Sender<PriceSnapshotMap>,
    balances_tx: watch::Sender<BalanceState>,
    portfolio_tx: watch::Sender<PortfolioView>,
    history_tx: watch::Sender<Option<HistorySeries>>,
}

impl DashboardHub {
    fn on_prices(&self, prices: &PriceSnapshotMap) {
        let _guard = self.update_lock.lock();
        self.prices_tx.send_replace(prices.clone());
        self.publish_portfolio();
        self.publish_history(prices);
    }

    fn on_balances(&self, balances: &BalanceState) {
        let _guard = self.update_lock.lock();
        self.balances_tx.send_replace(balances.clone());
        self.publish_portfolio();
    }

    fn publish_portfolio(&self) {
        let view = portfolio_view(&self.balances_tx.borrow(), &self.prices_tx.borrow());
        self.portfolio_tx.send_if_modified(|current| {
            if *current == view {
                return false;
            }
            *current = view;
            true
        });
    }

    fn publish_history(&self, prices: &PriceSnapshotMap) {
        let Some(asset_id) = self.chart_asset.lock().clone() else {
            return;
        };
        let Some(snapshot) = prices.get(&asset_id) else {
            return;
        };

        let update = self.history.lock().on_price_update(snapshot, now_unix_ms());
        match update {
            Ok(Some(series)) => {
                debug!(asset = %asset_id, anchor = series.anchor_price, "chart history regenerated");
                self.history_tx.send_replace(Some(series));
            }
            Ok(None) => {}
            Err(error) => warn!(asset = %asset_id, "chart history skipped: {error}"),
        }
    }
}

/// Price poller, balance fetcher, valuation and chart history wired
/// together behind one set of controls.
pub struct Dashboard<F, L> {
    poller: PriceFeedPoller<F>,
    fetcher: BalanceFetcher<L>,
    hub: Arc<DashboardHub>,
    chart_source: Option<Arc<dyn ChartSource>>,
    request_timeout: Duration,
    error_rx: Mutex<Option<UnboundedReceiver<AppError>>>,
}

impl<F: PriceFeed + 'static, L: Ledger + 'static> Dashboard<F, L> {
    pub fn new(feed: F, ledger: L, options: DashboardOptions) -> Self {
        let (error_tx, error_rx) = unbounded_channel();
        let rng = match options.history_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let poller = PriceFeedPoller::new(
            feed,
            PollerOptions::default()
                .with_request_timeout(options.request_timeout)
                .with_fallback(options.fallback)
                .with_error_channel(error_tx.clone()),
        );
        let fetcher = BalanceFetcher::new(
            ledger,
            FetcherOptions::default()
                .with_request_timeout(options.request_timeout)
                .with_tokens(options.include_tokens)
                .with_error_channel(error_tx),
        );

        let hub = Arc::new(DashboardHub {
            update_lock: Mutex::new(()),
            history: Mutex::new(HistorySynthesizer::new(rng, options.history)),
            chart_asset: Mutex::new(Some(NATIVE_ASSET_ID.to_string())),
            prices_tx: watch::Sender::new(PriceSnapshotMap::new()),
            balances_tx: watch::Sender::new(BalanceState::Empty),
            portfolio_tx: watch::Sender::new(PortfolioView::Disconnected),
            history_tx: watch::Sender::new(None),
        });

        let price_hub = Arc::clone(&hub);
        poller.subscribe(move |prices| price_hub.on_prices(prices));
        let balance_hub = Arc::clone(&hub);
        fetcher.subscribe(move |balances| balance_hub.on_balances(balances));

        Self {
            poller,
            fetcher,
            hub,
            chart_source: options.chart_source,
            request_timeout: options.request_timeout,
            error_rx: Mutex::new(Some(error_rx)),
        }
    }

    /// The chart asset is settled before the first cycle is scheduled.
    pub fn start_prices(&self, config: &PriceFeedConfig) -> Result<(), AppError> {
        let tracked = normalize_asset_ids(&config.assets)?;
        let previous = {
            let mut chart_asset = self.hub.chart_asset.lock();
            let previous = chart_asset.clone();
            let keep_current = chart_asset
                .as_ref()
                .is_some_and(|asset_id| tracked.contains(asset_id));
            if !keep_current {
                *chart_asset = tracked.first().cloned();
            }
            previous
        };

        if let Err(error) = self.poller.start(&tracked, config.interval_ms) {
            *self.hub.chart_asset.lock() = previous;
            return Err(error);
        }
        Ok(())
    }

    pub fn stop_prices(&self) {
        self.poller.stop();
    }

    pub fn refresh_prices(
        &self,
    ) -> impl Future<Output = Result<CycleReport, AppError>> + Send + 'static {
        self.poller.refresh()
    }

    pub fn connect_account(&self, config: &BalancePollingConfig) -> Result<(), AppError> {
        self.fetcher
            .start_polling(&config.account_id, config.interval_ms)
    }

    pub fn disconnect_account(&self) {
        self.fetcher.disconnect();
    }

    pub fn fetch_balance_once(
        &self,
        account_id: &str,
    ) -> impl Future<Output = Result<AccountBalances, AppError>> + Send + 'static {
        self.fetcher.fetch(account_id)
    }

    /// Points the chart at another asset and returns its current series, if
    /// a price for it is known.
    pub fn select_chart_asset(&self, asset_id: &str) -> Result<Option<HistorySeries>, AppError> {
        let asset_id = normalize_asset_ids(&[asset_id])?.remove(0);

        let _guard = self.hub.update_lock.lock();
        *self.hub.chart_asset.lock() = Some(asset_id.clone());
        let snapshot = self.hub.prices_tx.borrow().get(&asset_id).cloned();
        let series = {
            let mut history = self.hub.history.lock();
            if let Some(snapshot) = &snapshot {
                history.on_price_update(snapshot, now_unix_ms())?;
            }
            history.series(&asset_id).cloned()
        };
        self.hub.history_tx.send_replace(series.clone());

        info!(asset = %asset_id, "chart asset selected");
        Ok(series)
    }

    /// Replaces the chart asset's series with real history when a chart
    /// source is configured. Resolves to `None` otherwise.
    pub fn load_genuine_history(
        &self,
    ) -> impl Future<Output = Result<Option<HistorySeries>, AppError>> + Send + 'static {
        let hub = Arc::clone(&self.hub);
        let source = self.chart_source.clone();
        let asset_id = self.hub.chart_asset.lock().clone();
        let request_timeout = self.request_timeout;

        async move {
            let (Some(source), Some(asset_id)) = (source, asset_id) else {
                return Ok(None);
            };

            let points =
                tokio::time::timeout(request_timeout, source.fetch_history(&asset_id)).await??;
            let series = {
                let _guard = hub.update_lock.lock();
                let series = hub
                    .history
                    .lock()
                    .replace_with_genuine(&asset_id, points, now_unix_ms())?;
                if hub.chart_asset.lock().as_deref() == Some(asset_id.as_str()) {
                    hub.history_tx.send_replace(Some(series.clone()));
                }
                series
            };

            info!(asset = %asset_id, points = series.points.len(), "genuine chart history loaded");
            Ok(Some(series))
        }
    }

    pub fn watch_prices(&self) -> watch::Receiver<PriceSnapshotMap> {
        self.hub.prices_tx.subscribe()
    }

    pub fn watch_balances(&self) -> watch::Receiver<BalanceState> {
        self.hub.balances_tx.subscribe()
    }

    pub fn watch_portfolio(&self) -> watch::Receiver<PortfolioView> {
        self.hub.portfolio_tx.subscribe()
    }

    pub fn watch_history(&self) -> watch::Receiver<Option<HistorySeries>> {
        self.hub.history_tx.subscribe()
    }

    /// Feed and ledger errors from background cycles. Can be taken once.
    pub fn take_error_receiver(&self) -> Option<UnboundedReceiver<AppError>> {
        self.error_rx.lock().take()
    }

    pub fn snapshot(&self) -> DashboardSnapshot {
        DashboardSnapshot {
            prices: self.hub.prices_tx.borrow().clone(),
            balances: self.hub.balances_tx.borrow().clone(),
            portfolio: self.hub.portfolio_tx.borrow().clone(),
            history: self.hub.history_tx.borrow().clone(),
            chart_asset: self.hub.chart_asset.lock().clone(),
            tracked_assets: self.poller.tracked_assets(),
            price_feed_running: self.poller.is_running(),
            active_account: self.fetcher.active_account(),
            balance_polling: self.fetcher.is_polling(),
        }
    }

    pub fn shutdown(&self) {
        self.poller.stop();
        self.fetcher.stop_polling();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::{
        HistoryOrigin, HistoryPoint, LedgerAmount, PriceQuote, TokenHolding,
    };
    use async_trait::async_trait;

    const ALICE: &str = "5Q544fKrFoe6tsEbD7S8EmxGTJYAKtTVhAW5Q5pge4j1";

    fn quote(asset_id: &str, price_usd: f64) -> PriceQuote {
        PriceQuote {
            asset_id: asset_id.to_string(),
            symbol: None,
            name: None,
            price_usd,
            change_24h_pct: 0.0,
            high_24h: price_usd,
            low_24h: price_usd,
            market_cap_usd: None,
            volume_24h_usd: None,
        }
    }

    /// Serves whatever quotes the test last set.
    struct SettableFeed {
        quotes: Mutex<Vec<PriceQuote>>,
    }

    impl SettableFeed {
        fn new(quotes: Vec<PriceQuote>) -> Arc<Self> {
            Arc::new(Self {
                quotes: Mutex::new(quotes),
            })
        }
    }

    #[async_trait]
    impl PriceFeed for SettableFeed {
        async fn fetch_quotes(&self, _asset_ids: &[String]) -> Result<Vec<PriceQuote>, AppError> {
            Ok(self.quotes.lock().clone())
        }
    }

    struct FixedLedger;

    #[async_trait]
    impl Ledger for FixedLedger {
        async fn native_balance(&self, _account_id: &str) -> Result<LedgerAmount, AppError> {
            Ok(LedgerAmount {
                raw: 2_000_000_000,
                decimals: 9,
            })
        }

        async fn token_balances(&self, _account_id: &str) -> Result<Vec<TokenHolding>, AppError> {
            Ok(Vec::new())
        }
    }

    struct HourlyChart;

    #[async_trait]
    impl ChartSource for HourlyChart {
        async fn fetch_history(&self, _asset_id: &str) -> Result<Vec<HistoryPoint>, AppError> {
            Ok((0..25)
                .map(|index| HistoryPoint {
                    timestamp: 1_700_000_000_000 + index * 3_600_000,
                    price_usd: 20.0 + index as f64,
                    synthesized: false,
                })
                .collect())
        }
    }

    fn dashboard(
        feed: Arc<SettableFeed>,
        chart_source: Option<Arc<dyn ChartSource>>,
    ) -> Dashboard<Arc<SettableFeed>, FixedLedger> {
        Dashboard::new(
            feed,
            FixedLedger,
            DashboardOptions {
                chart_source,
                history_seed: Some(11),
                ..DashboardOptions::default()
            },
        )
    }

    fn price_config(assets: &[&str]) -> PriceFeedConfig {
        PriceFeedConfig {
            assets: assets.iter().map(|asset| asset.to_string()).collect(),
            interval_ms: 30_000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn values_portfolio_and_clears_on_disconnect() {
        let feed = SettableFeed::new(vec![quote("solana", 25.0), quote("bitcoin", 40_000.0)]);
        let dashboard = dashboard(feed, None);
        let mut portfolio = dashboard.watch_portfolio();

        dashboard
            .start_prices(&price_config(&["solana", "bitcoin"]))
            .expect("prices should start");
        dashboard
            .connect_account(&BalancePollingConfig {
                account_id: ALICE.to_string(),
                interval_ms: 60_000,
            })
            .expect("account should connect");
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(portfolio.has_changed().expect("sender alive"));
        match &*portfolio.borrow_and_update() {
            PortfolioView::Valued(total) => {
                assert_eq!(total.total_value_usd, 50.0);
                assert_eq!(total.account_id, ALICE);
            }
            other => panic!("expected valued portfolio, got {other:?}"),
        }

        dashboard.disconnect_account();
        assert_eq!(*portfolio.borrow(), PortfolioView::Disconnected);
        assert!(dashboard.snapshot().balances.is_empty());

        dashboard.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn chart_follows_selected_asset() {
        let feed = SettableFeed::new(vec![quote("solana", 25.0), quote("ethereum", 2_500.0)]);
        let dashboard = dashboard(Arc::clone(&feed), None);

        dashboard
            .start_prices(&price_config(&["solana", "ethereum"]))
            .expect("prices should start");
        tokio::time::sleep(Duration::from_millis(1)).await;

        let history = dashboard.watch_history();
        let series = history.borrow().clone().expect("solana series");
        assert_eq!(series.asset_id, "solana");
        assert_eq!(series.points.len(), 24);
        assert_eq!(series.anchor_price, 25.0);

        let selected = dashboard
            .select_chart_asset("Ethereum")
            .expect("asset valid")
            .expect("price known");
        assert_eq!(selected.asset_id, "ethereum");
        assert_eq!(selected.anchor_price, 2_500.0);

        *feed.quotes.lock() = vec![quote("solana", 26.0), quote("ethereum", 2_600.0)];
        tokio::time::sleep(Duration::from_millis(30_000)).await;
        let series = dashboard.watch_history().borrow().clone().expect("series");
        assert_eq!(series.asset_id, "ethereum");
        assert_eq!(series.anchor_price, 2_600.0);

        dashboard.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn first_cycle_charts_the_newly_tracked_asset() {
        let feed = SettableFeed::new(vec![quote("ethereum", 2_500.0), quote("bitcoin", 40_000.0)]);
        let dashboard = dashboard(feed, None);

        dashboard
            .start_prices(&price_config(&["ethereum"]))
            .expect("prices should start");
        assert_eq!(dashboard.snapshot().chart_asset.as_deref(), Some("ethereum"));
        tokio::time::sleep(Duration::from_millis(1)).await;

        let series = dashboard.watch_history().borrow().clone().expect("ethereum series");
        assert_eq!(series.asset_id, "ethereum");
        assert_eq!(series.anchor_price, 2_500.0);

        let rejected = dashboard.start_prices(&PriceFeedConfig {
            assets: vec!["bitcoin".to_string()],
            interval_ms: 1,
        });
        assert!(matches!(rejected, Err(AppError::Config(_))));
        assert_eq!(dashboard.snapshot().chart_asset.as_deref(), Some("ethereum"));

        dashboard.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn genuine_history_survives_price_updates() {
        let feed = SettableFeed::new(vec![quote("solana", 25.0)]);
        let dashboard = dashboard(Arc::clone(&feed), Some(Arc::new(HourlyChart)));

        dashboard
            .start_prices(&price_config(&["solana"]))
            .expect("prices should start");
        tokio::time::sleep(Duration::from_millis(1)).await;

        let series = dashboard
            .load_genuine_history()
            .await
            .expect("history should load")
            .expect("chart source configured");
        assert_eq!(series.origin, HistoryOrigin::Genuine);
        assert_eq!(series.points.len(), 24);
        assert_eq!(series.anchor_price, 44.0);

        *feed.quotes.lock() = vec![quote("solana", 27.0)];
        tokio::time::sleep(Duration::from_millis(30_000)).await;

        let current = dashboard.watch_history().borrow().clone().expect("series");
        assert_eq!(current.origin, HistoryOrigin::Genuine);
        assert_eq!(
            dashboard.snapshot().prices.get("solana").map(|price| price.price_usd),
            Some(27.0)
        );

        dashboard.shutdown();
    }

    #[tokio::test]
    async fn genuine_history_is_optional() {
        let dashboard = dashboard(SettableFeed::new(Vec::new()), None);
        let loaded = dashboard
            .load_genuine_history()
            .await
            .expect("nothing to load");
        assert!(loaded.is_none());
        assert!(dashboard.take_error_receiver().is_some());
        assert!(dashboard.take_error_receiver().is_none());
    }
}
