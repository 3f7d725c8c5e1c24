use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    Json,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::jobs::{EntitlementTier, Resolution};
use crate::store::{Store, StoreError};

pub const MIN_DURATION_SECONDS: i32 = 1;
pub const MAX_DURATION_SECONDS: i32 = 300;

/// key: pricing-catalog -> model row
#[derive(Debug, Clone, Serialize)]
pub struct VideoModel {
    pub model_ref: String,
    pub display_name: String,
    /// Version identifier forwarded to the provider, if the model pins one.
    pub provider_version: Option<String>,
    pub active: bool,
    pub min_tier: EntitlementTier,
    pub default_cost_per_second: Option<Decimal>,
    pub max_duration_seconds: i32,
}

/// A business setting together with the bounds it must respect.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BoundedSetting {
    pub value: Decimal,
    pub min: Decimal,
    pub max: Decimal,
}

impl BoundedSetting {
    pub fn new(value: Decimal, min: Decimal, max: Decimal) -> Self {
        Self { value, min, max }
    }

    fn validated(&self, name: &str) -> Result<Decimal, PricingError> {
        if self.min > self.max {
            return Err(PricingError::Configuration(format!(
                "{name} bounds are inverted ({} > {})",
                self.min, self.max
            )));
        }
        if self.value < self.min || self.value > self.max {
            return Err(PricingError::Configuration(format!(
                "{name} {} outside [{}, {}]",
                self.value, self.min, self.max
            )));
        }
        Ok(self.value)
    }
}

/// key: pricing-config -> immutable snapshot read once per computation
#[derive(Debug, Clone)]
pub struct PricingConfig {
    /// Exact per-(model, resolution) cost per second in USD.
    pub resolution_costs: HashMap<(String, Resolution), Decimal>,
    pub resolution_multipliers: HashMap<Resolution, Decimal>,
    pub profit_margin: BoundedSetting,
    pub credits_per_dollar: BoundedSetting,
    /// Hard ceiling on any resolved cost per second.
    pub max_cost_per_second: Decimal,
    /// Hard ceiling on the credits a single job may cost.
    pub max_credits_per_job: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostQuote {
    pub model_ref: String,
    pub resolution: Resolution,
    pub duration_seconds: i32,
    pub cost_per_second: Decimal,
    pub base_cost_usd: Decimal,
    pub total_usd: Decimal,
    pub credits: i64,
}

#[derive(Debug, Error)]
pub enum PricingError {
    #[error("model `{0}` not found")]
    ModelNotFound(String),
    #[error("pricing configuration error: {0}")]
    Configuration(String),
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Cost in credits for one job. Pure: the model and snapshot are passed in.
pub fn quote(
    model: &VideoModel,
    config: &PricingConfig,
    duration_seconds: i32,
    resolution: Resolution,
) -> Result<CostQuote, PricingError> {
    if !(MIN_DURATION_SECONDS..=MAX_DURATION_SECONDS).contains(&duration_seconds) {
        return Err(PricingError::Validation(format!(
            "duration must be between {MIN_DURATION_SECONDS} and {MAX_DURATION_SECONDS} seconds"
        )));
    }
    if !model.active {
        return Err(PricingError::ModelNotFound(model.model_ref.clone()));
    }

    let cost_per_second = resolve_cost_per_second(model, config, resolution)?;
    if cost_per_second <= Decimal::ZERO {
        return Err(PricingError::Configuration(format!(
            "non-positive cost per second for {} at {resolution}",
            model.model_ref
        )));
    }
    if cost_per_second > config.max_cost_per_second {
        return Err(PricingError::Configuration(format!(
            "cost per second {cost_per_second} for {} exceeds ceiling {}",
            model.model_ref, config.max_cost_per_second
        )));
    }

    let profit_margin = config.profit_margin.validated("profit_margin")?;
    let credits_per_dollar = config.credits_per_dollar.validated("credits_per_dollar")?;

    let base_cost_usd = cost_per_second * Decimal::from(duration_seconds);
    let total_usd = base_cost_usd * profit_margin;
    let credits = (total_usd * credits_per_dollar)
        .ceil()
        .to_i64()
        .ok_or_else(|| PricingError::Validation("credit cost out of range".to_string()))?;

    if credits <= 0 {
        return Err(PricingError::Validation(
            "computed credit cost must be positive".to_string(),
        ));
    }
    if credits > config.max_credits_per_job {
        return Err(PricingError::Validation(format!(
            "computed cost of {credits} credits exceeds the per-job limit of {}",
            config.max_credits_per_job
        )));
    }

    Ok(CostQuote {
        model_ref: model.model_ref.clone(),
        resolution,
        duration_seconds,
        cost_per_second,
        base_cost_usd,
        total_usd,
        credits,
    })
}

fn resolve_cost_per_second(
    model: &VideoModel,
    config: &PricingConfig,
    resolution: Resolution,
) -> Result<Decimal, PricingError> {
    if let Some(cost) = config
        .resolution_costs
        .get(&(model.model_ref.clone(), resolution))
    {
        return Ok(*cost);
    }
    let base = model.default_cost_per_second.ok_or_else(|| {
        PricingError::Configuration(format!(
            "no cost configured for {} at {resolution} and no default cost",
            model.model_ref
        ))
    })?;
    let multiplier = config
        .resolution_multipliers
        .get(&resolution)
        .ok_or_else(|| {
            PricingError::Configuration(format!("no resolution multiplier for {resolution}"))
        })?;
    Ok(base * *multiplier)
}

/// key: pricing-engine -> model lookup + snapshot + quote
#[derive(Clone)]
pub struct PricingEngine {
    store: Arc<dyn Store>,
}

impl PricingEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Resolve an active model or fail with `ModelNotFound`.
    pub async fn active_model(&self, model_ref: &str) -> Result<VideoModel, PricingError> {
        match self.store.model(model_ref).await? {
            Some(model) if model.active => Ok(model),
            _ => Err(PricingError::ModelNotFound(model_ref.to_string())),
        }
    }

    pub async fn compute_cost(
        &self,
        model_ref: &str,
        duration_seconds: i32,
        resolution: Option<Resolution>,
    ) -> Result<CostQuote, PricingError> {
        let model = self.active_model(model_ref).await?;
        self.quote_model(&model, duration_seconds, resolution.unwrap_or_default())
            .await
    }

    pub async fn quote_model(
        &self,
        model: &VideoModel,
        duration_seconds: i32,
        resolution: Resolution,
    ) -> Result<CostQuote, PricingError> {
        let snapshot = self
            .store
            .pricing_snapshot()
            .await
            .map_err(|err| match err {
                StoreError::NotFound(what) => {
                    PricingError::Configuration(format!("{what} is missing"))
                }
                other => PricingError::Store(other),
            })?;
        let result = quote(model, &snapshot, duration_seconds, resolution);
        if let Err(PricingError::Configuration(reason)) = &result {
            tracing::error!(
                target: "pricing.alert",
                model_ref = %model.model_ref,
                %resolution,
                %reason,
                "pricing configuration invalid; model unavailable until fixed"
            );
        }
        result
    }
}

#[derive(Debug, Deserialize)]
pub struct QuoteQuery {
    pub model_ref: String,
    pub duration_seconds: i32,
    pub resolution: Option<String>,
}

/// key: pricing-api -> cost preview, nothing is charged
pub async fn get_quote(
    _user: AuthUser,
    Extension(pricing): Extension<PricingEngine>,
    Query(query): Query<QuoteQuery>,
) -> AppResult<Json<CostQuote>> {
    let resolution = query
        .resolution
        .as_deref()
        .map(str::parse::<Resolution>)
        .transpose()
        .map_err(AppError::Validation)?;
    let quote = pricing
        .compute_cost(query.model_ref.trim(), query.duration_seconds, resolution)
        .await?;
    Ok(Json(quote))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn model(default_cost: Option<Decimal>) -> VideoModel {
        VideoModel {
            model_ref: "acme/motion-v2".to_string(),
            display_name: "Motion v2".to_string(),
            provider_version: None,
            active: true,
            min_tier: EntitlementTier::Free,
            default_cost_per_second: default_cost,
            max_duration_seconds: 300,
        }
    }

    fn config() -> PricingConfig {
        PricingConfig {
            resolution_costs: HashMap::new(),
            resolution_multipliers: HashMap::from([
                (Resolution::Sd480, dec!(0.75)),
                (Resolution::Hd720, dec!(1.0)),
                (Resolution::FullHd1080, dec!(1.5)),
            ]),
            profit_margin: BoundedSetting::new(dec!(1.32), dec!(1.0), dec!(3.0)),
            credits_per_dollar: BoundedSetting::new(dec!(50), dec!(10), dec!(1000)),
            max_cost_per_second: dec!(2.0),
            max_credits_per_job: 10_000,
        }
    }

    #[test]
    fn worked_example_rounds_up() {
        let quote = quote(&model(Some(dec!(0.18))), &config(), 5, Resolution::Hd720).unwrap();
        assert_eq!(quote.base_cost_usd, dec!(0.90));
        assert_eq!(quote.total_usd, dec!(1.188));
        assert_eq!(quote.credits, 60);
    }

    #[test]
    fn specific_cost_wins_over_multiplier() {
        let mut config = config();
        config
            .resolution_costs
            .insert(("acme/motion-v2".to_string(), Resolution::FullHd1080), dec!(0.20));
        let quote = quote(&model(Some(dec!(0.18))), &config, 5, Resolution::FullHd1080).unwrap();
        assert_eq!(quote.cost_per_second, dec!(0.20));
    }

    #[test]
    fn multiplier_applies_without_specific_cost() {
        let quote = quote(&model(Some(dec!(0.10))), &config(), 10, Resolution::FullHd1080).unwrap();
        assert_eq!(quote.cost_per_second, dec!(0.150));
    }

    #[test]
    fn missing_cost_and_multiplier_is_configuration_error() {
        let mut config = config();
        config.resolution_multipliers.remove(&Resolution::Sd480);
        let err = quote(&model(Some(dec!(0.10))), &config, 5, Resolution::Sd480).unwrap_err();
        assert!(matches!(err, PricingError::Configuration(_)));

        let err = quote(&model(None), &super::tests::config(), 5, Resolution::Hd720).unwrap_err();
        assert!(matches!(err, PricingError::Configuration(_)));
    }

    #[test]
    fn manipulated_cost_per_second_is_rejected() {
        let err = quote(&model(Some(dec!(9.99))), &config(), 5, Resolution::Hd720).unwrap_err();
        assert!(matches!(err, PricingError::Configuration(_)));
    }

    #[test]
    fn out_of_bounds_margin_is_rejected() {
        let mut config = config();
        config.profit_margin.value = dec!(0.5);
        let err = quote(&model(Some(dec!(0.18))), &config, 5, Resolution::Hd720).unwrap_err();
        assert!(matches!(err, PricingError::Configuration(_)));
    }

    #[test]
    fn duration_bounds_are_enforced() {
        for duration in [0, -3, 301] {
            let err = quote(&model(Some(dec!(0.18))), &config(), duration, Resolution::Hd720)
                .unwrap_err();
            assert!(matches!(err, PricingError::Validation(_)));
        }
    }

    #[test]
    fn inactive_model_is_not_found() {
        let mut model = model(Some(dec!(0.18)));
        model.active = false;
        let err = quote(&model, &config(), 5, Resolution::Hd720).unwrap_err();
        assert!(matches!(err, PricingError::ModelNotFound(_)));
    }

    #[test]
    fn per_job_ceiling_is_enforced() {
        let mut config = config();
        config.max_credits_per_job = 100;
        assert!(quote(&model(Some(dec!(0.18))), &config, 5, Resolution::Hd720).is_ok());
        let err = quote(&model(Some(dec!(0.18))), &config, 60, Resolution::Hd720).unwrap_err();
        assert!(matches!(err, PricingError::Validation(_)));
    }

    #[test]
    fn cost_is_monotonic_in_duration_and_capped() {
        let config = config();
        for cost in [dec!(0.01), dec!(0.18), dec!(0.333), dec!(1.7)] {
            let model = model(Some(cost));
            for resolution in Resolution::ALL {
                let mut previous = 0;
                for duration in MIN_DURATION_SECONDS..=MAX_DURATION_SECONDS {
                    match quote(&model, &config, duration, resolution) {
                        Ok(quote) => {
                            assert!(quote.credits >= previous);
                            assert!(quote.credits <= config.max_credits_per_job);
                            previous = quote.credits;
                        }
                        // once over the ceiling it stays over
                        Err(PricingError::Validation(_)) => previous = i64::MAX,
                        Err(PricingError::Configuration(_)) => break,
                        Err(other) => panic!("unexpected error {other}"),
                    }
                }
            }
        }
    }
}
