pub mod config;
pub mod error;
pub mod logging;
pub mod market;

#[cfg(feature = "desktop")]
mod commands;
#[cfg(feature = "desktop")]
pub mod state;

pub use config::DashboardSettings;
pub use error::AppError;
pub use market::pipeline::{Dashboard, DashboardOptions};

/// Installs dashboard state, event forwarding and the command handlers on a
/// Tauri builder. The host application supplies its own context and runs it.
#[cfg(feature = "desktop")]
pub fn register_commands(builder: tauri::Builder<tauri::Wry>) -> tauri::Builder<tauri::Wry> {
    use state::{spawn_event_forwarding, AppState};
    use tauri::Manager;

    builder
        .setup(|app| {
            logging::init_tracing();
            let settings = DashboardSettings::from_env()?;
            let state = AppState::new(settings)?;
            spawn_event_forwarding(app.handle(), &state);
            app.manage(state);
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            commands::health::health,
            commands::dashboard::start_price_feed,
            commands::dashboard::stop_price_feed,
            commands::dashboard::refresh_prices,
            commands::dashboard::connect_account,
            commands::dashboard::disconnect_account,
            commands::dashboard::fetch_balance_once,
            commands::dashboard::select_chart_asset,
            commands::dashboard::dashboard_snapshot
        ])
}
