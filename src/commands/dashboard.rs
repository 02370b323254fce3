use crate::error::AppError;
use crate::market::poller::CycleReport;
use crate::market::types::{
    AccountBalances, ConnectAccountArgs, DashboardSnapshot, HistorySeries, SelectChartAssetArgs,
    StartPriceFeedArgs,
};
use crate::state::AppState;
use tauri::State;
use tracing::warn;

fn spawn_genuine_history(state: &AppState) {
    if !state.settings.genuine_history {
        return;
    }
    let load = state.dashboard.load_genuine_history();
    tauri::async_runtime::spawn(async move {
        if let Err(error) = load.await {
            warn!("keeping synthesized chart history: {error}");
        }
    });
}

#[tauri::command]
pub async fn start_price_feed(
    state: State<'_, AppState>,
    args: Option<StartPriceFeedArgs>,
) -> Result<DashboardSnapshot, AppError> {
    let config = args.unwrap_or_default().normalize()?;
    state.dashboard.start_prices(&config)?;
    spawn_genuine_history(&state);
    Ok(state.dashboard.snapshot())
}

#[tauri::command]
pub async fn stop_price_feed(state: State<'_, AppState>) -> Result<DashboardSnapshot, AppError> {
    state.dashboard.stop_prices();
    Ok(state.dashboard.snapshot())
}

#[tauri::command]
pub async fn refresh_prices(state: State<'_, AppState>) -> Result<CycleReport, AppError> {
    let refresh = state.dashboard.refresh_prices();
    refresh.await
}

#[tauri::command]
pub async fn connect_account(
    state: State<'_, AppState>,
    args: ConnectAccountArgs,
) -> Result<DashboardSnapshot, AppError> {
    let config = args.normalize()?;
    state.dashboard.connect_account(&config)?;
    Ok(state.dashboard.snapshot())
}

#[tauri::command]
pub async fn disconnect_account(
    state: State<'_, AppState>,
) -> Result<DashboardSnapshot, AppError> {
    state.dashboard.disconnect_account();
    Ok(state.dashboard.snapshot())
}

#[tauri::command]
pub async fn fetch_balance_once(
    state: State<'_, AppState>,
    args: ConnectAccountArgs,
) -> Result<AccountBalances, AppError> {
    let fetch = state.dashboard.fetch_balance_once(&args.account_id);
    fetch.await
}

#[tauri::command]
pub async fn select_chart_asset(
    state: State<'_, AppState>,
    args: SelectChartAssetArgs,
) -> Result<Option<HistorySeries>, AppError> {
    let series = state.dashboard.select_chart_asset(&args.asset_id)?;
    spawn_genuine_history(&state);
    Ok(series)
}

#[tauri::command]
pub async fn dashboard_snapshot(
    state: State<'_, AppState>,
) -> Result<DashboardSnapshot, AppError> {
    Ok(state.dashboard.snapshot())
}
