use dashboard_sync_lib::market::coingecko::HttpPriceFeed;
use dashboard_sync_lib::market::solana::SolanaLedger;
use dashboard_sync_lib::market::types::PortfolioView;
use dashboard_sync_lib::{logging, AppError, Dashboard, DashboardSettings};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    logging::init_tracing();

    let settings = DashboardSettings::from_env()?;
    let feed = HttpPriceFeed::new(settings.price_feed_base_url.clone(), settings.request_timeout)?;
    let ledger = SolanaLedger::new(settings.solana_rpc_url.clone(), settings.request_timeout)?;

    let mut options = settings.dashboard_options();
    if settings.genuine_history {
        options.chart_source = Some(Arc::new(feed.clone()));
    }
    let dashboard = Dashboard::new(feed, ledger, options);
    let mut errors = dashboard
        .take_error_receiver()
        .ok_or_else(|| AppError::Config("error receiver already taken".to_string()))?;
    let mut prices = dashboard.watch_prices();
    let mut portfolio = dashboard.watch_portfolio();

    dashboard.start_prices(&settings.price_feed)?;
    if let Some(account) = &settings.account {
        dashboard.connect_account(account)?;
    }
    if settings.genuine_history {
        let load = dashboard.load_genuine_history();
        tokio::spawn(async move {
            if let Err(error) = load.await {
                warn!("keeping synthesized chart history: {error}");
            }
        });
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = prices.changed() => {
                if changed.is_err() {
                    break;
                }
                for snapshot in prices.borrow_and_update().values() {
                    info!(
                        asset = %snapshot.asset_id,
                        price_usd = snapshot.price_usd,
                        change_24h_pct = snapshot.change_24h_pct,
                        source = ?snapshot.source,
                        "price"
                    );
                }
            }
            changed = portfolio.changed() => {
                if changed.is_err() {
                    break;
                }
                match &*portfolio.borrow_and_update() {
                    PortfolioView::Valued(total) => info!(
                        account = %total.account_id,
                        total_value_usd = total.total_value_usd,
                        pending = total.pending_assets.len(),
                        "portfolio"
                    ),
                    PortfolioView::Pending => info!("portfolio awaiting prices"),
                    PortfolioView::Disconnected => info!("no account connected"),
                }
            }
            Some(error) = errors.recv() => warn!("feed error: {error}"),
        }
    }

    info!("shutting down");
    dashboard.shutdown();
    Ok(())
}
