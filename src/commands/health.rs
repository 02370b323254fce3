use crate::{error::AppError, market::types::DashboardSnapshot, state::AppState};
use serde::Serialize;
use std::time::Instant;
use tauri::State;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub price_feed: &'static str,
    pub account: &'static str,
    pub live_prices: usize,
}

pub fn build_health_response(started_at: Instant, snapshot: &DashboardSnapshot) -> HealthResponse {
    HealthResponse {
        status: "ok",
        uptime_ms: started_at.elapsed().as_millis(),
        price_feed: if snapshot.price_feed_running {
            "running"
        } else {
            "stopped"
        },
        account: if snapshot.active_account.is_some() {
            "connected"
        } else {
            "disconnected"
        },
        live_prices: snapshot
            .prices
            .values()
            .filter(|price| price.is_live())
            .count(),
    }
}

#[tauri::command]
pub async fn health(state: State<'_, AppState>) -> Result<HealthResponse, AppError> {
    Ok(build_health_response(
        state.started_at,
        &state.dashboard.snapshot(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::{BalanceState, PortfolioView};

    #[test]
    fn health_reports_feed_and_account_status() {
        let snapshot = DashboardSnapshot {
            prices: Default::default(),
            balances: BalanceState::Empty,
            portfolio: PortfolioView::Disconnected,
            history: None,
            chart_asset: Some("solana".to_string()),
            tracked_assets: vec!["solana".to_string()],
            price_feed_running: true,
            active_account: None,
            balance_polling: false,
        };

        let response = build_health_response(Instant::now(), &snapshot);

        assert_eq!(response.status, "ok");
        assert_eq!(response.price_feed, "running");
        assert_eq!(response.account, "disconnected");
        assert_eq!(response.live_prices, 0);
        assert!(response.uptime_ms <= 1_000);
    }
}
