use chrono::Utc;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Score given when an apartment has nothing to be compared against.
pub const NEUTRAL_SCORE: u8 = 50;

/// 0–100, higher is a better deal. Priced exactly at the local average
/// scores 75; every 1% above the average costs half a point.
pub fn fair_rent_score(target_rpp: f64, comparable_rpps: &[f64]) -> u8 {
    if comparable_rpps.is_empty() {
        return NEUTRAL_SCORE;
    }
    let avg = comparable_rpps.iter().sum::<f64>() / comparable_rpps.len() as f64;
    if avg <= 0.0 || !avg.is_finite() {
        return NEUTRAL_SCORE;
    }
    let deviation = (target_rpp - avg) / avg;
    (75.0 - deviation * 50.0).round().clamp(0.0, 100.0) as u8
}

impl Engine {
    /// Recompute and store the fair-rent score of one apartment.
    ///
    /// `Ok(None)` means the apartment lacks rent, occupancy or a location and
    /// nothing was written. Counters on an existing metrics row survive.
    pub async fn recompute_fair_rent(&self, apartment_id: Ulid) -> Result<Option<u8>, EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let apartment = self.get_apartment(apartment_id)?;

        let (Some(target), Some(location_id)) = (apartment.rent_per_person(), apartment.location_id) else {
            warn!(apartment = %apartment_id, "fair-rent skipped: rent, occupancy or location missing");
            return Ok(None);
        };

        let comparables: Vec<f64> = self
            .apartments
            .iter()
            .filter(|e| e.key() != &apartment_id && e.value().location_id == Some(location_id))
            .filter_map(|e| e.value().rent_per_person())
            .collect();
        let score = fair_rent_score(target, &comparables);

        let previous = self.metrics.get(&apartment_id).map(|e| e.value().clone());
        let metrics = ApartmentMetrics {
            apartment_id,
            fair_rent_score: score,
            view_count: previous.as_ref().map_or(0, |m| m.view_count),
            wishlist_count: previous.as_ref().map_or(0, |m| m.wishlist_count),
            last_calculated: Utc::now(),
        };
        self.persist_catalog(&Event::MetricsRecorded { metrics }).await?;
        debug!(apartment = %apartment_id, score, comparables = comparables.len(), "fair-rent recomputed");
        Ok(Some(score))
    }

    pub fn get_metrics(&self, apartment_id: Ulid) -> Option<ApartmentMetrics> {
        self.metrics.get(&apartment_id).map(|e| e.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_comparables_is_neutral() {
        assert_eq!(fair_rent_score(1234.0, &[]), NEUTRAL_SCORE);
    }

    #[test]
    fn at_average_scores_75() {
        assert_eq!(fair_rent_score(4000.0, &[3000.0, 5000.0]), 75);
    }

    #[test]
    fn half_above_average_scores_50() {
        assert_eq!(fair_rent_score(6000.0, &[4000.0]), 50);
    }

    #[test]
    fn half_price_scores_100() {
        assert_eq!(fair_rent_score(2000.0, &[4000.0]), 100);
    }

    #[test]
    fn far_above_average_clamps_to_zero() {
        assert_eq!(fair_rent_score(40_000.0, &[4000.0]), 0);
    }

    #[test]
    fn far_below_average_clamps_to_100() {
        assert_eq!(fair_rent_score(1.0, &[4000.0]), 100);
    }
}
