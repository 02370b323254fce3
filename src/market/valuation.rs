use crate::market::types::{
    known_token, AccountBalances, BalanceSnapshot, BalanceState, PendingAsset, PendingReason,
    PortfolioTotal, PortfolioView, PriceSnapshot, PriceSnapshotMap, Valuation, ValuationOutcome,
};

/// Price-feed id a balance is quoted under. Known token mints map to their
/// feed id, everything else is quoted under its own asset id.
pub fn price_asset_for(balance: &BalanceSnapshot) -> &str {
    known_token(&balance.asset_id)
        .map(|token| token.price_asset_id)
        .unwrap_or(balance.asset_id.as_str())
}

pub fn valuate(
    balance: Option<&BalanceSnapshot>,
    price: Option<&PriceSnapshot>,
) -> ValuationOutcome {
    let (balance, price) = match (balance, price) {
        (Some(balance), Some(price)) => (balance, price),
        (None, None) => {
            return ValuationOutcome::Pending {
                reason: PendingReason::MissingBoth,
            }
        }
        (None, Some(_)) => {
            return ValuationOutcome::Pending {
                reason: PendingReason::MissingBalance,
            }
        }
        (Some(_), None) => {
            return ValuationOutcome::Pending {
                reason: PendingReason::MissingPrice,
            }
        }
    };

    if price_asset_for(balance) != price.asset_id {
        return ValuationOutcome::Pending {
            reason: PendingReason::AssetMismatch,
        };
    }

    ValuationOutcome::Ready(Valuation {
        account_id: balance.account_id.clone(),
        asset_id: price.asset_id.clone(),
        amount: balance.amount,
        price_usd: price.price_usd,
        value_usd: balance.amount * price.price_usd,
        computed_at: balance.fetched_at.max(price.fetched_at),
    })
}

pub fn valuate_portfolio(balances: &AccountBalances, prices: &PriceSnapshotMap) -> PortfolioTotal {
    let mut valuations = Vec::new();
    let mut pending_assets = Vec::new();

    for balance in balances.iter() {
        let price = prices.get(price_asset_for(balance));
        match valuate(Some(balance), price) {
            ValuationOutcome::Ready(valuation) => valuations.push(valuation),
            ValuationOutcome::Pending { reason } => pending_assets.push(PendingAsset {
                asset_id: balance.asset_id.clone(),
                reason,
            }),
        }
    }

    let total_value_usd = valuations.iter().map(|valuation| valuation.value_usd).sum();
    let computed_at = valuations
        .iter()
        .map(|valuation| valuation.computed_at)
        .chain(balances.iter().map(|balance| balance.fetched_at))
        .max()
        .unwrap_or_default();

    PortfolioTotal {
        account_id: balances.account_id.clone(),
        total_value_usd,
        valuations,
        pending_assets,
        computed_at,
    }
}

/// `Pending` until at least one held asset has a price.
pub fn portfolio_view(balances: &BalanceState, prices: &PriceSnapshotMap) -> PortfolioView {
    let Some(balances) = balances.loaded() else {
        return PortfolioView::Disconnected;
    };
    let total = valuate_portfolio(balances, prices);
    if total.valuations.is_empty() {
        PortfolioView::Pending
    } else {
        PortfolioView::Valued(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::{LedgerAmount, SnapshotSource};

    const ACCOUNT: &str = "5Q544fKrFoe6tsEbD7S8EmxGTJYAKtTVhAW5Q5pge4j1";
    const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

    fn balance(asset_id: &str, raw: u64, decimals: u8, fetched_at: i64) -> BalanceSnapshot {
        BalanceSnapshot::from_ledger(
            ACCOUNT,
            asset_id,
            None,
            LedgerAmount { raw, decimals },
            fetched_at,
        )
    }

    fn price(asset_id: &str, price_usd: f64, fetched_at: i64) -> PriceSnapshot {
        PriceSnapshot {
            asset_id: asset_id.to_string(),
            symbol: None,
            name: None,
            price_usd,
            change_24h_pct: 0.0,
            high_24h: price_usd,
            low_24h: price_usd,
            market_cap_usd: None,
            volume_24h_usd: None,
            fetched_at,
            source: SnapshotSource::Live,
            sequence: 1,
        }
    }

    #[test]
    fn zero_amount_is_worth_zero() {
        let outcome = valuate(
            Some(&balance("solana", 0, 9, 10)),
            Some(&price("solana", 25.0, 20)),
        );

        let valuation = outcome.ready().expect("valuation ready");
        assert_eq!(valuation.value_usd, 0.0);
        assert_eq!(valuation.computed_at, 20);
    }

    #[test]
    fn multiplies_amount_by_price() {
        let outcome = valuate(
            Some(&balance("solana", 2_500_000_000, 9, 30)),
            Some(&price("solana", 24.0, 20)),
        );

        let valuation = outcome.ready().expect("valuation ready");
        assert_eq!(valuation.value_usd, 60.0);
        assert_eq!(valuation.computed_at, 30);
    }

    #[test]
    fn missing_inputs_stay_pending() {
        let sol = balance("solana", 1, 9, 0);
        let quote = price("solana", 25.0, 0);

        assert_eq!(
            valuate(None, Some(&quote)),
            ValuationOutcome::Pending {
                reason: PendingReason::MissingBalance
            }
        );
        assert_eq!(
            valuate(Some(&sol), None),
            ValuationOutcome::Pending {
                reason: PendingReason::MissingPrice
            }
        );
        assert!(valuate(None, None).is_pending());
        assert_eq!(
            valuate(Some(&sol), Some(&price("bitcoin", 1.0, 0))),
            ValuationOutcome::Pending {
                reason: PendingReason::AssetMismatch
            }
        );
    }

    #[test]
    fn known_token_uses_its_price_id() {
        let usdc = balance(USDC_MINT, 12_500_000, 6, 5);
        let outcome = valuate(Some(&usdc), Some(&price("usd-coin", 1.0, 6)));

        let valuation = outcome.ready().expect("valuation ready");
        assert_eq!(valuation.asset_id, "usd-coin");
        assert_eq!(valuation.value_usd, 12.5);
    }

    #[test]
    fn portfolio_sums_priced_assets_and_lists_the_rest() {
        let balances = AccountBalances {
            account_id: ACCOUNT.to_string(),
            native: balance("solana", 2_000_000_000, 9, 100),
            tokens: vec![
                balance(USDC_MINT, 3_000_000, 6, 100),
                balance("MysteryMint1111111111111111111111111111111", 1, 0, 100),
            ],
        };
        let mut prices = PriceSnapshotMap::new();
        prices.insert("solana".to_string(), price("solana", 25.0, 150));
        prices.insert("usd-coin".to_string(), price("usd-coin", 1.0, 120));

        let total = valuate_portfolio(&balances, &prices);
        assert_eq!(total.total_value_usd, 53.0);
        assert_eq!(total.valuations.len(), 2);
        assert_eq!(total.pending_assets.len(), 1);
        assert_eq!(total.pending_assets[0].reason, PendingReason::MissingPrice);
        assert_eq!(total.computed_at, 150);
    }

    #[test]
    fn view_follows_balance_state() {
        let prices = PriceSnapshotMap::new();
        assert_eq!(
            portfolio_view(&BalanceState::Empty, &prices),
            PortfolioView::Disconnected
        );

        let loaded = BalanceState::Loaded(AccountBalances {
            account_id: ACCOUNT.to_string(),
            native: balance("solana", 1_000_000_000, 9, 0),
            tokens: Vec::new(),
        });
        assert_eq!(portfolio_view(&loaded, &prices), PortfolioView::Pending);

        let mut priced = PriceSnapshotMap::new();
        priced.insert("solana".to_string(), price("solana", 20.0, 1));
        assert!(matches!(
            portfolio_view(&loaded, &priced),
            PortfolioView::Valued(total) if total.total_value_usd == 20.0
        ));
    }
}
