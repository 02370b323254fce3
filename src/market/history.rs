use crate::error::AppError;
use crate::market::types::{
    HistoryConfig, HistoryOrigin, HistoryPoint, HistorySeries, PriceSnapshot,
};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;

/// Source of genuine price history for one asset.
#[async_trait]
pub trait ChartSource: Send + Sync {
    async fn fetch_history(&self, asset_id: &str) -> Result<Vec<HistoryPoint>, AppError>;
}

#[async_trait]
impl<T: ChartSource + ?Sized> ChartSource for Arc<T> {
    async fn fetch_history(&self, asset_id: &str) -> Result<Vec<HistoryPoint>, AppError> {
        (**self).fetch_history(asset_id).await
    }
}

/// Builds chart series around an anchor price and remembers the latest one
/// per asset. A genuine series, once stored, is kept until another genuine
/// series replaces it.
pub struct HistorySynthesizer<R> {
    rng: R,
    config: HistoryConfig,
    series: HashMap<String, HistorySeries>,
}

impl<R: Rng> HistorySynthesizer<R> {
    pub fn new(rng: R, config: HistoryConfig) -> Self {
        Self {
            rng,
            config,
            series: HashMap::new(),
        }
    }

    /// `points - 1` perturbed points followed by the anchor itself, ending at
    /// `now_ms`.
    pub fn synthesize(
        &mut self,
        asset_id: &str,
        anchor_price: f64,
        now_ms: i64,
    ) -> Result<HistorySeries, AppError> {
        if !anchor_price.is_finite() || anchor_price < 0.0 {
            return Err(AppError::Config(format!(
                "anchor price for '{asset_id}' must be finite and non-negative"
            )));
        }

        let HistoryConfig {
            points,
            spacing_ms,
            max_variation,
        } = self.config;
        let spread = anchor_price * max_variation;
        let (low, high) = (anchor_price - spread, anchor_price + spread);

        let mut series_points = Vec::with_capacity(points);
        for index in 0..points {
            let steps_back = (points - 1 - index) as i64;
            let timestamp = now_ms.saturating_sub(steps_back.saturating_mul(spacing_ms));
            if steps_back == 0 {
                series_points.push(HistoryPoint {
                    timestamp,
                    price_usd: anchor_price,
                    synthesized: false,
                });
                continue;
            }

            let unit = self.rng.gen::<f64>() * 2.0 - 1.0;
            series_points.push(HistoryPoint {
                timestamp,
                price_usd: (anchor_price + spread * unit).clamp(low, high),
                synthesized: true,
            });
        }

        Ok(HistorySeries {
            asset_id: asset_id.to_string(),
            points: series_points,
            anchor_price,
            generated_at: now_ms,
            origin: HistoryOrigin::Synthesized,
        })
    }

    /// Regenerates the synthesized series for the snapshot's asset when its
    /// price moved or a spacing interval has passed since the last one, so
    /// the series keeps ending at `now_ms`. Returns `None` when nothing
    /// changed, including while a genuine series is held.
    pub fn on_price_update(
        &mut self,
        snapshot: &PriceSnapshot,
        now_ms: i64,
    ) -> Result<Option<HistorySeries>, AppError> {
        if let Some(current) = self.series.get(&snapshot.asset_id) {
            let fresh = now_ms.saturating_sub(current.generated_at) < self.config.spacing_ms;
            if current.origin == HistoryOrigin::Genuine
                || (current.anchor_price == snapshot.price_usd && fresh)
            {
                return Ok(None);
            }
        }

        let series = self.synthesize(&snapshot.asset_id, snapshot.price_usd, now_ms)?;
        self.series
            .insert(snapshot.asset_id.clone(), series.clone());
        Ok(Some(series))
    }

    /// Swaps in real history for an asset. Points are sorted and
    /// de-duplicated by timestamp, then cut to the newest `points` entries.
    pub fn replace_with_genuine(
        &mut self,
        asset_id: &str,
        mut points: Vec<HistoryPoint>,
        now_ms: i64,
    ) -> Result<HistorySeries, AppError> {
        points.sort_by_key(|point| point.timestamp);
        points.dedup_by_key(|point| point.timestamp);

        let wanted = self.config.points;
        if points.len() < wanted {
            return Err(AppError::Schema(format!(
                "history for '{asset_id}' has {} points, need {wanted}",
                points.len()
            )));
        }
        let surplus = points.len() - wanted;
        points.drain(..surplus);
        for point in &mut points {
            point.synthesized = false;
        }

        let anchor_price = points
            .last()
            .map(|point| point.price_usd)
            .unwrap_or_default();
        let series = HistorySeries {
            asset_id: asset_id.to_string(),
            points,
            anchor_price,
            generated_at: now_ms,
            origin: HistoryOrigin::Genuine,
        };
        self.series.insert(asset_id.to_string(), series.clone());
        Ok(series)
    }

    pub fn series(&self, asset_id: &str) -> Option<&HistorySeries> {
        self.series.get(asset_id)
    }
}
