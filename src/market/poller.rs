use crate::error::AppError;
use crate::market::now_unix_ms;
use crate::market::scheduler::{schedule, RepeatingTask};
use crate::market::types::{
    normalize_asset_ids, PriceQuote, PriceSnapshot, PriceSnapshotMap, SnapshotSource,
    DEFAULT_REQUEST_TIMEOUT_MS, MAX_POLL_INTERVAL_MS, MIN_POLL_INTERVAL_MS,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Batched source of current quotes for a set of assets.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn fetch_quotes(&self, asset_ids: &[String]) -> Result<Vec<PriceQuote>, AppError>;
}

#[async_trait]
impl<T: PriceFeed + ?Sized> PriceFeed for Arc<T> {
    async fn fetch_quotes(&self, asset_ids: &[String]) -> Result<Vec<PriceQuote>, AppError> {
        (**self).fetch_quotes(asset_ids).await
    }
}

/// Placeholder quotes used only for assets that have never had a live price.
#[derive(Debug, Clone)]
pub struct FallbackCatalog {
    quotes: HashMap<String, PriceQuote>,
}

impl FallbackCatalog {
    pub fn empty() -> Self {
        Self {
            quotes: HashMap::new(),
        }
    }

    pub fn with_quote(mut self, quote: PriceQuote) -> Self {
        self.quotes.insert(quote.asset_id.clone(), quote);
        self
    }

    pub fn get(&self, asset_id: &str) -> Option<&PriceQuote> {
        self.quotes.get(asset_id)
    }
}

impl Default for FallbackCatalog {
    fn default() -> Self {
        Self::empty()
            .with_quote(PriceQuote {
                asset_id: "solana".to_string(),
                symbol: Some("SOL".to_string()),
                name: Some("Solana".to_string()),
                price_usd: 24.89,
                change_24h_pct: 2.34,
                high_24h: 25.67,
                low_24h: 23.12,
                market_cap_usd: Some(10_567_890_123.0),
                volume_24h_usd: Some(834_567_890.0),
            })
            .with_quote(PriceQuote {
                asset_id: "bitcoin".to_string(),
                symbol: Some("BTC".to_string()),
                name: Some("Bitcoin".to_string()),
                price_usd: 43_250.0,
                change_24h_pct: -1.23,
                high_24h: 44_100.0,
                low_24h: 42_800.0,
                market_cap_usd: Some(846_789_123_456.0),
                volume_24h_usd: Some(15_678_901_234.0),
            })
            .with_quote(PriceQuote {
                asset_id: "ethereum".to_string(),
                symbol: Some("ETH".to_string()),
                name: Some("Ethereum".to_string()),
                price_usd: 2_567.89,
                change_24h_pct: 3.45,
                high_24h: 2_645.0,
                low_24h: 2_489.0,
                market_cap_usd: Some(308_567_890_123.0),
                volume_24h_usd: Some(8_765_432_109.0),
            })
    }
}

pub struct PollerOptions {
    pub request_timeout: Duration,
    pub fallback: FallbackCatalog,
    pub error_tx: Option<UnboundedSender<AppError>>,
}

impl PollerOptions {
    pub fn with_error_channel(mut self, error_tx: UnboundedSender<AppError>) -> Self {
        self.error_tx = Some(error_tx);
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackCatalog) -> Self {
        self.fallback = fallback;
        self
    }
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            fallback: FallbackCatalog::default(),
            error_tx: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct PollerState {
    assets: Vec<String>,
    snapshots: PriceSnapshotMap,
    next_sequence: u64,
    generation: u64,
    running: bool,
}

/// Everything a cycle needs to know about the poller at the moment it was
/// issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleTicket {
    pub sequence: u64,
    pub generation: u64,
    pub assets: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub sequence: u64,
    pub failed: bool,
    pub discarded: bool,
    pub live: Vec<String>,
    pub fallback: Vec<String>,
    pub stale: Vec<String>,
}

impl PollerState {
    fn issue(&mut self) -> CycleTicket {
        self.next_sequence = self.next_sequence.saturating_add(1);
        CycleTicket {
            sequence: self.next_sequence,
            generation: self.generation,
            assets: self.assets.clone(),
        }
    }
}

enum AssetApply {
    Applied,
    Stale,
    Untouched,
}

fn apply_live_quote(
    snapshots: &mut PriceSnapshotMap,
    quote: PriceQuote,
    sequence: u64,
    now_ms: i64,
) -> AssetApply {
    let previous_live = snapshots.get(&quote.asset_id).filter(|current| current.is_live());
    if let Some(current) = previous_live {
        if current.sequence >= sequence {
            return AssetApply::Stale;
        }
    }

    let fetched_at = previous_live
        .map(|current| now_ms.max(current.fetched_at))
        .unwrap_or(now_ms);
    let snapshot = PriceSnapshot::from_quote(quote, SnapshotSource::Live, sequence, fetched_at);
    snapshots.insert(snapshot.asset_id.clone(), snapshot);
    AssetApply::Applied
}

fn apply_fallback_quote(
    snapshots: &mut PriceSnapshotMap,
    asset_id: &str,
    catalog: &FallbackCatalog,
    sequence: u64,
    now_ms: i64,
) -> AssetApply {
    match snapshots.get(asset_id) {
        Some(current) if current.is_live() => return AssetApply::Untouched,
        Some(current) if current.sequence >= sequence => return AssetApply::Stale,
        _ => {}
    }

    let Some(quote) = catalog.get(asset_id) else {
        return AssetApply::Untouched;
    };
    let snapshot =
        PriceSnapshot::from_quote(quote.clone(), SnapshotSource::Fallback, sequence, now_ms);
    snapshots.insert(asset_id.to_string(), snapshot);
    AssetApply::Applied
}

/// Folds one finished cycle into the poller state. `quotes` is `None` when the
/// whole request failed.
///
/// Live data is ordered by issue sequence, not by arrival. A live snapshot is
/// never replaced by fallback data, and fallback data only ever fills assets
/// that have no live snapshot yet.
pub fn apply_cycle_outcome(
    state: &mut PollerState,
    ticket: &CycleTicket,
    quotes: Option<Vec<PriceQuote>>,
    catalog: &FallbackCatalog,
    now_ms: i64,
) -> CycleReport {
    let mut report = CycleReport {
        sequence: ticket.sequence,
        failed: quotes.is_none(),
        ..CycleReport::default()
    };

    if ticket.generation != state.generation {
        report.discarded = true;
        return report;
    }

    let mut by_asset: HashMap<String, PriceQuote> = quotes
        .unwrap_or_default()
        .into_iter()
        .map(|quote| (quote.asset_id.clone(), quote))
        .collect();

    for asset_id in &ticket.assets {
        if !state.assets.contains(asset_id) {
            continue;
        }

        let applied = match by_asset.remove(asset_id) {
            Some(quote) => {
                match apply_live_quote(&mut state.snapshots, quote, ticket.sequence, now_ms) {
                    AssetApply::Applied => {
                        report.live.push(asset_id.clone());
                        continue;
                    }
                    other => other,
                }
            }
            None => {
                match apply_fallback_quote(
                    &mut state.snapshots,
                    asset_id,
                    catalog,
                    ticket.sequence,
                    now_ms,
                ) {
                    AssetApply::Applied => {
                        report.fallback.push(asset_id.clone());
                        continue;
                    }
                    other => other,
                }
            }
        };

        if matches!(applied, AssetApply::Stale) {
            report.stale.push(asset_id.clone());
        }
    }

    report
}

pub type SnapshotCallback = Arc<dyn Fn(&PriceSnapshotMap) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct PollerShared<F> {
    feed: F,
    state: Mutex<PollerState>,
    fallback: FallbackCatalog,
    request_timeout: Duration,
    error_tx: Option<UnboundedSender<AppError>>,
    subscribers: Mutex<Vec<(SubscriptionId, SnapshotCallback)>>,
    next_subscription: AtomicU64,
    /// Held from applying a cycle until its subscribers have run, and by
    /// `start`/`stop` while they bump the generation. Taken before `state`.
    publish: Mutex<()>,
}

impl<F> PollerShared<F> {
    fn notify(&self, snapshots: &PriceSnapshotMap) {
        let callbacks: Vec<SnapshotCallback> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(snapshots);
        }
    }

    fn report_error(&self, error: AppError) {
        if let Some(error_tx) = &self.error_tx {
            let _ = error_tx.send(error);
        }
    }
}

async fn run_cycle<F: PriceFeed>(shared: Arc<PollerShared<F>>, ticket: CycleTicket) -> CycleReport {
    let result =
        match tokio::time::timeout(shared.request_timeout, shared.feed.fetch_quotes(&ticket.assets))
            .await
        {
            Ok(result) => result,
            Err(elapsed) => Err(elapsed.into()),
        };

    let (quotes, error) = match result {
        Ok(quotes) => (Some(quotes), None),
        Err(error) => (None, Some(error)),
    };

    let publish = shared.publish.lock();
    let (report, published) = {
        let mut state = shared.state.lock();
        let report = apply_cycle_outcome(
            &mut state,
            &ticket,
            quotes,
            &shared.fallback,
            now_unix_ms(),
        );
        let published = (!report.discarded).then(|| state.snapshots.clone());
        (report, published)
    };

    if report.discarded {
        debug!(
            sequence = report.sequence,
            "price cycle finished after stop or restart; result discarded"
        );
        return report;
    }

    if let Some(error) = error {
        warn!(sequence = report.sequence, "price cycle failed: {error}");
        shared.report_error(error);
    }
    if !report.stale.is_empty() {
        debug!(
            sequence = report.sequence,
            stale = ?report.stale,
            "ignored quotes older than stored live data"
        );
    }

    if let Some(snapshots) = published {
        shared.notify(&snapshots);
    }
    drop(publish);
    report
}

pub struct PriceFeedPoller<F> {
    shared: Arc<PollerShared<F>>,
    task: Mutex<Option<RepeatingTask>>,
}

impl<F: PriceFeed + 'static> PriceFeedPoller<F> {
    pub fn new(feed: F, options: PollerOptions) -> Self {
        Self {
            shared: Arc::new(PollerShared {
                feed,
                state: Mutex::new(PollerState::default()),
                fallback: options.fallback,
                request_timeout: options.request_timeout,
                error_tx: options.error_tx,
                subscribers: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                publish: Mutex::new(()),
            }),
            task: Mutex::new(None),
        }
    }

    /// Replaces the tracked asset set without scheduling anything. Snapshots
    /// of assets that are no longer tracked are dropped.
    pub fn set_assets<S: AsRef<str>>(&self, assets: &[S]) -> Result<Vec<String>, AppError> {
        let assets = normalize_asset_ids(assets)?;
        let mut state = self.shared.state.lock();
        state.snapshots.retain(|asset_id, _| assets.contains(asset_id));
        state.assets = assets.clone();
        Ok(assets)
    }

    /// Starts the repeating refresh cycle. Any previous schedule is replaced
    /// and its in-flight cycles are discarded when they land.
    pub fn start<S: AsRef<str>>(&self, assets: &[S], interval_ms: u64) -> Result<(), AppError> {
        let assets = normalize_asset_ids(assets)?;
        if !(MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&interval_ms) {
            return Err(AppError::Config(format!(
                "price poll interval must be between {MIN_POLL_INTERVAL_MS} and {MAX_POLL_INTERVAL_MS} ms"
            )));
        }

        {
            let _publish = self.shared.publish.lock();
            let mut state = self.shared.state.lock();
            state.generation = state.generation.saturating_add(1);
            state.running = true;
            state.snapshots.retain(|asset_id, _| assets.contains(asset_id));
            state.assets = assets.clone();
        }

        let shared = Arc::clone(&self.shared);
        let task = schedule(Duration::from_millis(interval_ms), move || {
            let ticket = {
                let mut state = shared.state.lock();
                state.running.then(|| state.issue())
            };
            let cycle_shared = Arc::clone(&shared);
            async move {
                if let Some(ticket) = ticket {
                    run_cycle(cycle_shared, ticket).await;
                }
            }
        });

        let previous = self.task.lock().replace(task);
        if let Some(previous) = previous {
            previous.cancel();
        }

        info!(?assets, interval_ms, "price feed polling started");
        Ok(())
    }

    /// Stops scheduling. A cycle already applied has notified its subscribers
    /// before this returns; later ones are discarded.
    pub fn stop(&self) {
        let was_running = {
            let _publish = self.shared.publish.lock();
            let mut state = self.shared.state.lock();
            state.generation = state.generation.saturating_add(1);
            std::mem::replace(&mut state.running, false)
        };

        if let Some(task) = self.task.lock().take() {
            task.cancel();
        }

        if was_running {
            info!("price feed polling stopped");
        }
    }

    /// Issues one cycle right away. The sequence number is taken when this is
    /// called, not when the returned future is first polled.
    pub fn refresh(&self) -> impl Future<Output = Result<CycleReport, AppError>> + Send + 'static {
        let shared = Arc::clone(&self.shared);
        let ticket = {
            let mut state = shared.state.lock();
            if state.assets.is_empty() {
                Err(AppError::Config(
                    "no tracked assets; call start or set_assets first".to_string(),
                ))
            } else {
                Ok(state.issue())
            }
        };

        async move {
            let ticket = ticket?;
            Ok(run_cycle(shared, ticket).await)
        }
    }

    pub fn latest(&self, asset_id: &str) -> Option<PriceSnapshot> {
        self.shared.state.lock().snapshots.get(asset_id).cloned()
    }

    pub fn snapshots(&self) -> PriceSnapshotMap {
        self.shared.state.lock().snapshots.clone()
    }

    pub fn tracked_assets(&self) -> Vec<String> {
        self.shared.state.lock().assets.clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Callbacks run on the cycle task, in the order cycles were applied,
    /// and must not call back into this poller's controls.
    pub fn subscribe<C>(&self, callback: C) -> SubscriptionId
    where
        C: Fn(&PriceSnapshotMap) + Send + Sync + 'static,
    {
        let id = SubscriptionId(
            self.shared
                .next_subscription
                .fetch_add(1, Ordering::Relaxed),
        );
        self.shared.subscribers.lock().push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.shared.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }
}

impl<F> Drop for PriceFeedPoller<F> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.generation = state.generation.saturating_add(1);
        state.running = false;
    }
}
