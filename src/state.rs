use crate::config::DashboardSettings;
use crate::error::AppError;
use crate::market::coingecko::HttpPriceFeed;
use crate::market::pipeline::Dashboard;
use crate::market::solana::SolanaLedger;
use crate::market::{
    BALANCES_UPDATE_EVENT, FEED_ERROR_EVENT, HISTORY_UPDATE_EVENT, PRICE_SNAPSHOTS_EVENT,
    VALUATION_UPDATE_EVENT,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tauri::{AppHandle, Emitter};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub type DesktopDashboard = Dashboard<HttpPriceFeed, SolanaLedger>;

pub struct AppState {
    pub started_at: Instant,
    pub settings: DashboardSettings,
    pub dashboard: Arc<DesktopDashboard>,
    pub forwarding: CancellationToken,
}

impl AppState {
    pub fn new(settings: DashboardSettings) -> Result<Self, AppError> {
        let feed = HttpPriceFeed::new(settings.price_feed_base_url.clone(), settings.request_timeout)?;
        let ledger = SolanaLedger::new(settings.solana_rpc_url.clone(), settings.request_timeout)?;

        let mut options = settings.dashboard_options();
        if settings.genuine_history {
            options.chart_source = Some(Arc::new(feed.clone()));
        }

        Ok(Self {
            started_at: Instant::now(),
            dashboard: Arc::new(Dashboard::new(feed, ledger, options)),
            settings,
            forwarding: CancellationToken::new(),
        })
    }
}

impl Drop for AppState {
    fn drop(&mut self) {
        self.forwarding.cancel();
        self.dashboard.shutdown();
    }
}

fn forward_watch<T>(
    app: AppHandle,
    mut receiver: watch::Receiver<T>,
    event: &'static str,
    cancellation_token: CancellationToken,
) where
    T: Serialize + Clone + Send + Sync + 'static,
{
    tauri::async_runtime::spawn(async move {
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                changed = receiver.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let payload = receiver.borrow_and_update().clone();
                    if let Err(error) = app.emit(event, payload) {
                        warn!(event, "failed to emit dashboard event: {error}");
                    }
                }
            }
        }
    });
}

/// Pushes every dashboard channel to the webview as it changes.
pub fn spawn_event_forwarding(app: &AppHandle, state: &AppState) {
    let dashboard = &state.dashboard;
    let token = &state.forwarding;

    forward_watch(app.clone(), dashboard.watch_prices(), PRICE_SNAPSHOTS_EVENT, token.clone());
    forward_watch(app.clone(), dashboard.watch_balances(), BALANCES_UPDATE_EVENT, token.clone());
    forward_watch(
        app.clone(),
        dashboard.watch_portfolio(),
        VALUATION_UPDATE_EVENT,
        token.clone(),
    );
    forward_watch(app.clone(), dashboard.watch_history(), HISTORY_UPDATE_EVENT, token.clone());

    let Some(mut errors) = dashboard.take_error_receiver() else {
        return;
    };
    let app = app.clone();
    let token = token.clone();
    tauri::async_runtime::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                error = errors.recv() => {
                    let Some(error) = error else {
                        break;
                    };
                    if let Err(emit_error) = app.emit(FEED_ERROR_EVENT, &error) {
                        warn!("failed to emit feed error: {emit_error}");
                    }
                }
            }
        }
    });
}
