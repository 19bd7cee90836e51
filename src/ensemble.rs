//! Multi-model forecast combination.
//!
//! # Horizons
//!
//! A horizon is a lead-time bucket in hours. With requested horizons
//! `[24, 48, 72]`, bucket `24` covers lead hours `1..=24` after the base
//! time, `48` covers `25..=48` and `72` covers `49..=72`. The cadence is
//! hourly, so every bucket is a gap-free run of hourly timestamps.
//!
//! # Combination
//!
//! For each horizon:
//! 1. keep the models that supply a finite value for every timestamp of the bucket,
//! 2. look up their weights in the [`EnsemblePolicy`] table and renormalize over
//!    the models actually present,
//! 3. mark the horizon `degraded` when an expected model is missing,
//! 4. combine as the weighted sum and derive `(lower, upper)` from the
//!    weighted dispersion ([`UncertaintyPolicy`]).
//!
//! A horizon nobody covers is omitted and listed in
//! [`ForecastResult::unavailable_horizons`]. Only when every horizon is
//! missing does [`ForecastEnsembleEngine::combine`] fail with
//! [`PipelineError::ForecastUnavailable`].

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

/// Weights are compared against this tolerance when checking they sum to 1.
pub const WEIGHT_TOLERANCE: f64 = 1e-9;

/// One predicted value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Raw prediction of one forecasting model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOutput {
    pub model_id: String,
    /// Ordered `(timestamp, value)` pairs. Non-finite values count as missing.
    pub predictions: Vec<Prediction>,
    /// Model-reported confidence in `[0, 1]`, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl ModelOutput {
    /// Build an hourly series starting at `start`.
    pub fn hourly(model_id: impl Into<String>, start: DateTime<Utc>, values: &[f64]) -> Self {
        let predictions = values
            .iter()
            .zip(0i64..)
            .map(|(&value, i)| Prediction {
                timestamp: start + Duration::hours(i),
                value,
            })
            .collect();
        Self {
            model_id: model_id.into(),
            predictions,
            confidence: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// One combined timestep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub lower: f64,
    pub upper: f64,
}

/// A model's normalized share of a horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelContribution {
    pub model_id: String,
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Combined forecast for one horizon bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonForecast {
    pub horizon_hours: u32,
    /// Strictly increasing, hourly.
    pub points: Vec<ForecastPoint>,
    /// Normalized weights; they sum to 1.
    pub contributors: Vec<ModelContribution>,
    /// An expected model was missing and weights were renormalized.
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_models: Vec<String>,
}

/// The published forecast artifact. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub id: String,
    pub generated_at: DateTime<Utc>,
    /// Lead hours are counted from this instant.
    pub base_time: DateTime<Utc>,
    /// In requested order; unavailable horizons are absent.
    pub horizons: Vec<HorizonForecast>,
    /// Every model that contributed to at least one horizon.
    pub models: Vec<String>,
    /// Any horizon degraded or unavailable.
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unavailable_horizons: Vec<u32>,
    /// Non-fatal `ModelUnavailable` conditions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ForecastResult {
    pub fn horizon(&self, hours: u32) -> Option<&HorizonForecast> {
        self.horizons.iter().find(|h| h.horizon_hours == hours)
    }

    /// `true` when some requested horizon had no usable model at all.
    pub fn is_partial(&self) -> bool {
        !self.unavailable_horizons.is_empty()
    }
}

/// How the spread across contributing models is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispersionMethod {
    /// `sqrt(Σ wᵢ (xᵢ − μ)²)`
    WeightedStdDev,
    /// Half the distance between the lowest and highest prediction.
    HalfRange,
}

/// Uncertainty-interval policy.
///
/// `half_width = max(z · dispersion, min_half_width, relative_floor · |μ|)`,
/// multiplied by `degraded_widening` on degraded horizons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UncertaintyPolicy {
    pub method: DispersionMethod,
    pub z: f64,
    pub degraded_widening: f64,
    pub min_half_width: f64,
    pub relative_floor: f64,
    /// Air-quality indices are never negative.
    pub clamp_non_negative: bool,
}

impl Default for UncertaintyPolicy {
    fn default() -> Self {
        Self {
            method: DispersionMethod::WeightedStdDev,
            z: 1.96,
            degraded_widening: 1.5,
            min_half_width: 2.0,
            relative_floor: 0.05,
            clamp_non_negative: true,
        }
    }
}

impl UncertaintyPolicy {
    /// Interval around `mean` for the weighted `samples`.
    pub fn bounds(&self, mean: f64, samples: &[(f64, f64)], degraded: bool) -> (f64, f64) {
        let dispersion = match self.method {
            DispersionMethod::WeightedStdDev => samples
                .iter()
                .map(|&(w, x)| w * (x - mean).powi(2))
                .sum::<f64>()
                .sqrt(),
            DispersionMethod::HalfRange => {
                let (lo, hi) = samples
                    .iter()
                    .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &(_, x)| {
                        (lo.min(x), hi.max(x))
                    });
                if lo.is_finite() { (hi - lo) / 2.0 } else { 0.0 }
            }
        };
        let mut half = (self.z * dispersion)
            .max(self.min_half_width)
            .max(self.relative_floor * mean.abs());
        if degraded {
            half *= self.degraded_widening;
        }
        let lower = mean - half;
        let lower = if self.clamp_non_negative { lower.max(0.0) } else { lower };
        (lower, mean + half)
    }
}

/// Static weights for one horizon bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonWeights {
    pub hours: u32,
    /// Model id → weight. Models with weight 0 are not expected.
    pub models: BTreeMap<String, f64>,
}

impl HorizonWeights {
    pub fn new(hours: u32, models: impl IntoIterator<Item = (impl Into<String>, f64)>) -> Self {
        Self {
            hours,
            models: models.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Models this horizon expects to hear from.
    pub fn expected(&self) -> impl Iterator<Item = &str> {
        self.models
            .iter()
            .filter(|(_, w)| **w > 0.0)
            .map(|(m, _)| m.as_str())
    }
}

/// Combination policy: per-horizon weight table plus uncertainty policy.
///
/// A horizon without a table row weighs every covering model equally and
/// expects every model named anywhere in the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsemblePolicy {
    pub weights: Vec<HorizonWeights>,
    pub uncertainty: UncertaintyPolicy,
}

impl Default for EnsemblePolicy {
    fn default() -> Self {
        Self {
            weights: vec![
                HorizonWeights::new(24, [("catboost", 0.6), ("tcn_48h", 0.25), ("tcn_72h", 0.15)]),
                HorizonWeights::new(48, [("tcn_48h", 0.6), ("tcn_72h", 0.3), ("catboost", 0.1)]),
                HorizonWeights::new(72, [("tcn_72h", 0.7), ("tcn_48h", 0.3)]),
            ],
            uncertainty: UncertaintyPolicy::default(),
        }
    }
}

impl EnsemblePolicy {
    pub fn row(&self, hours: u32) -> Option<&HorizonWeights> {
        self.weights.iter().find(|w| w.hours == hours)
    }

    /// Every model the weight table expects at some horizon.
    pub fn configured_models(&self) -> BTreeSet<&str> {
        self.weights.iter().flat_map(HorizonWeights::expected).collect()
    }

    pub fn validate(&self) -> PipelineResult<()> {
        let mut seen = BTreeSet::new();
        for row in &self.weights {
            if row.hours == 0 {
                return Err(PipelineError::Configuration(
                    "weight table horizon must be at least 1 hour".into(),
                ));
            }
            if !seen.insert(row.hours) {
                return Err(PipelineError::Configuration(format!(
                    "duplicate weight row for {}h horizon",
                    row.hours
                )));
            }
            if let Some((model, w)) = row.models.iter().find(|(_, w)| !w.is_finite() || **w < 0.0) {
                return Err(PipelineError::Configuration(format!(
                    "invalid weight {w} for model '{model}' at {}h",
                    row.hours
                )));
            }
            if row.models.values().sum::<f64>() <= 0.0 {
                return Err(PipelineError::Configuration(format!(
                    "weights for {}h horizon sum to zero",
                    row.hours
                )));
            }
        }
        let u = &self.uncertainty;
        let params = [u.z, u.degraded_widening, u.min_half_width, u.relative_floor];
        if params.iter().any(|p| !p.is_finite() || *p < 0.0) || u.degraded_widening < 1.0 {
            return Err(PipelineError::Configuration(
                "uncertainty parameters must be finite and non-negative, with degraded_widening >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Normalized weights over the `covering` models for `hours`.
    ///
    /// Returns `(contributors, missing_expected_models)`; contributors are
    /// empty when no usable model is present.
    pub fn normalized(&self, hours: u32, covering: &[&str]) -> (Vec<(String, f64)>, Vec<String>) {
        let Some(row) = self.row(hours) else {
            #[allow(clippy::cast_precision_loss)]
            let w = 1.0 / covering.len().max(1) as f64;
            let missing = self
                .configured_models()
                .into_iter()
                .filter(|m| !covering.contains(m))
                .map(str::to_string)
                .collect();
            return (covering.iter().map(|m| ((*m).to_string(), w)).collect(), missing);
        };

        let present: Vec<(String, f64)> = row
            .models
            .iter()
            .filter(|(m, w)| **w > 0.0 && covering.contains(&m.as_str()))
            .map(|(m, w)| (m.clone(), *w))
            .collect();
        let missing = row
            .expected()
            .filter(|m| !covering.contains(m))
            .map(str::to_string)
            .collect();

        let total: f64 = present.iter().map(|(_, w)| w).sum();
        let normalized = present.into_iter().map(|(m, w)| (m, w / total)).collect();
        (normalized, missing)
    }
}

/// Combines per-model predictions into one multi-horizon forecast.
#[derive(Debug, Clone, Default)]
pub struct ForecastEnsembleEngine {
    policy: EnsemblePolicy,
}

impl ForecastEnsembleEngine {
    pub fn new(policy: EnsemblePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &EnsemblePolicy {
        &self.policy
    }

    /// Combine `outputs` for every requested horizon.
    pub fn combine(
        &self,
        base_time: DateTime<Utc>,
        outputs: &[ModelOutput],
        horizons: &[u32],
    ) -> PipelineResult<ForecastResult> {
        let buckets = buckets(horizons)?;

        let mut series: BTreeMap<&str, FxHashMap<DateTime<Utc>, f64>> = BTreeMap::new();
        let mut confidence: FxHashMap<&str, f64> = FxHashMap::default();
        for output in outputs {
            let entry = series.entry(output.model_id.as_str()).or_default();
            for p in output.predictions.iter().filter(|p| p.value.is_finite()) {
                entry.insert(p.timestamp, p.value);
            }
            if let Some(c) = output.confidence {
                confidence.insert(output.model_id.as_str(), c);
            }
        }

        let mut result_horizons = Vec::with_capacity(horizons.len());
        let mut unavailable = Vec::new();
        let mut warnings = Vec::new();
        let mut models = BTreeSet::new();

        for &hours in horizons {
            let (first, last) = buckets[&hours];
            let timestamps: Vec<DateTime<Utc>> = (first..=last)
                .map(|h| base_time + Duration::hours(i64::from(h)))
                .collect();

            let covering: Vec<&str> = series
                .iter()
                .filter(|(_, values)| timestamps.iter().all(|t| values.contains_key(t)))
                .map(|(m, _)| *m)
                .collect();

            let (contributors, missing) = self.policy.normalized(hours, &covering);
            for model in &missing {
                let warning = PipelineError::ModelUnavailable {
                    horizon_hours: hours,
                    model: model.clone(),
                };
                tracing::warn!(horizon_hours = hours, model = %model, "Model unavailable, renormalizing weights");
                warnings.push(warning.to_string());
            }

            if contributors.is_empty() {
                tracing::warn!(horizon_hours = hours, "No model covers horizon, omitting it");
                unavailable.push(hours);
                continue;
            }

            // Without a row, a lone contributor is never a full ensemble.
            let degraded = !missing.is_empty()
                || (contributors.len() == 1 && self.policy.row(hours).is_none());
            let points = timestamps
                .iter()
                .map(|t| {
                    let samples: Vec<(f64, f64)> = contributors
                        .iter()
                        .map(|(m, w)| (*w, series[m.as_str()][t]))
                        .collect();
                    let value: f64 = samples.iter().map(|(w, x)| w * x).sum();
                    let (lower, upper) = self.policy.uncertainty.bounds(value, &samples, degraded);
                    ForecastPoint {
                        timestamp: *t,
                        value,
                        lower,
                        upper,
                    }
                })
                .collect();

            models.extend(contributors.iter().map(|(m, _)| m.clone()));
            result_horizons.push(HorizonForecast {
                horizon_hours: hours,
                points,
                contributors: contributors
                    .into_iter()
                    .map(|(model_id, weight)| ModelContribution {
                        confidence: confidence.get(model_id.as_str()).copied(),
                        model_id,
                        weight,
                    })
                    .collect(),
                degraded,
                missing_models: missing,
            });
        }

        if result_horizons.is_empty() {
            return Err(PipelineError::ForecastUnavailable(format!(
                "no model output covers any of the requested horizons {horizons:?}"
            )));
        }

        let degraded = !unavailable.is_empty() || result_horizons.iter().any(|h| h.degraded);
        Ok(ForecastResult {
            id: format!("fc_{}", uuid::Uuid::new_v4().simple()),
            generated_at: Utc::now(),
            base_time,
            horizons: result_horizons,
            models: models.into_iter().collect(),
            degraded,
            unavailable_horizons: unavailable,
            warnings,
        })
    }
}

/// Map each requested horizon to its inclusive lead-hour range.
fn buckets(horizons: &[u32]) -> PipelineResult<FxHashMap<u32, (u32, u32)>> {
    if horizons.is_empty() {
        return Err(PipelineError::Validation("no horizons requested".into()));
    }
    let sorted: BTreeSet<u32> = horizons.iter().copied().collect();
    if sorted.len() != horizons.len() {
        return Err(PipelineError::Validation(format!(
            "duplicate horizons in {horizons:?}"
        )));
    }
    if sorted.contains(&0) {
        return Err(PipelineError::Validation("horizon must be at least 1 hour".into()));
    }
    let mut prev = 0;
    let mut out = FxHashMap::default();
    for h in sorted {
        out.insert(h, (prev + 1, h));
        prev = h;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
    }

    fn first_hour() -> DateTime<Utc> {
        base() + Duration::hours(1)
    }

    fn engine_3h(weights: &[(&str, f64)]) -> ForecastEnsembleEngine {
        ForecastEnsembleEngine::new(EnsemblePolicy {
            weights: vec![HorizonWeights::new(3, weights.iter().map(|(m, w)| (*m, *w)))],
            uncertainty: UncertaintyPolicy::default(),
        })
    }

    fn values(h: &HorizonForecast) -> Vec<f64> {
        h.points.iter().map(|p| p.value).collect()
    }

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-9, "{actual:?} != {expected:?}");
        }
    }

    #[test]
    fn test_weighted_combination() {
        let engine = engine_3h(&[("a", 0.6), ("b", 0.4)]);
        let outputs = [
            ModelOutput::hourly("a", first_hour(), &[50.0, 52.0, 54.0]),
            ModelOutput::hourly("b", first_hour(), &[48.0, 50.0, 56.0]),
        ];
        let result = engine.combine(base(), &outputs, &[3]).unwrap();
        let h = result.horizon(3).unwrap();
        assert_close(&values(h), &[49.2, 51.2, 54.8]);
        assert!(!h.degraded);
        assert!(!result.degraded);
        assert_eq!(result.models, vec!["a", "b"]);
    }

    #[test]
    fn test_single_model_is_raw_and_degraded() {
        let engine = engine_3h(&[("a", 0.6), ("b", 0.4)]);
        let outputs = [ModelOutput::hourly("b", first_hour(), &[48.0, 50.0, 56.0])];
        let result = engine.combine(base(), &outputs, &[3]).unwrap();
        let h = result.horizon(3).unwrap();
        assert_close(&values(h), &[48.0, 50.0, 56.0]);
        assert!(h.degraded);
        assert_eq!(h.missing_models, vec!["a"]);
        assert!((h.contributors[0].weight - 1.0).abs() < WEIGHT_TOLERANCE);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("'a'"));
    }

    #[test]
    fn test_weights_sum_to_one_for_every_subset() {
        let policy = EnsemblePolicy::default();
        let all = ["catboost", "tcn_48h", "tcn_72h"];
        for mask in 1u8..8 {
            let subset: Vec<&str> = all
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << *i) != 0)
                .map(|(_, m)| *m)
                .collect();
            for hours in [24, 48, 72] {
                let (weights, _) = policy.normalized(hours, &subset);
                if weights.is_empty() {
                    continue;
                }
                let total: f64 = weights.iter().map(|(_, w)| w).sum();
                assert!((total - 1.0).abs() < WEIGHT_TOLERANCE, "{subset:?} @ {hours}h");
            }
        }
    }

    #[test]
    fn test_uncovered_horizon_is_omitted() {
        let engine = ForecastEnsembleEngine::default();
        // 24 values cover the first bucket only.
        let outputs = [ModelOutput::hourly("catboost", first_hour(), &[40.0; 24])];
        let result = engine.combine(base(), &outputs, &[24, 48]).unwrap();
        assert_eq!(result.horizons.len(), 1);
        assert!(result.horizon(48).is_none());
        assert_eq!(result.unavailable_horizons, vec![48]);
        assert!(result.is_partial());
        assert!(result.degraded);
    }

    #[test]
    fn test_no_usable_output_is_unavailable() {
        let engine = ForecastEnsembleEngine::default();
        let err = engine.combine(base(), &[], &[24, 48, 72]).unwrap_err();
        assert!(matches!(err, PipelineError::ForecastUnavailable(_)));

        let nan = [ModelOutput::hourly("catboost", first_hour(), &[f64::NAN; 24])];
        assert!(engine.combine(base(), &nan, &[24]).is_err());
    }

    #[test]
    fn test_horizon_order_and_cadence() {
        let engine = ForecastEnsembleEngine::default();
        let outputs = [
            ModelOutput::hourly("tcn_72h", first_hour(), &[60.0; 72]),
            ModelOutput::hourly("tcn_48h", first_hour(), &[50.0; 48]),
        ];
        let result = engine.combine(base(), &outputs, &[72, 48]).unwrap();
        let order: Vec<u32> = result.horizons.iter().map(|h| h.horizon_hours).collect();
        assert_eq!(order, vec![72, 48]);

        let h72 = result.horizon(72).unwrap();
        assert_eq!(h72.points.len(), 24);
        assert_eq!(h72.points[0].timestamp, base() + Duration::hours(49));
        assert!(
            h72.points
                .windows(2)
                .all(|w| w[1].timestamp - w[0].timestamp == Duration::hours(1))
        );
        // catboost is expected at 48h but sent nothing.
        assert!(result.horizon(48).unwrap().degraded);
    }

    #[test]
    fn test_model_without_table_entry_is_ignored() {
        let engine = engine_3h(&[("a", 1.0)]);
        let outputs = [
            ModelOutput::hourly("a", first_hour(), &[10.0, 10.0, 10.0]),
            ModelOutput::hourly("rogue", first_hour(), &[99.0, 99.0, 99.0]),
        ];
        let result = engine.combine(base(), &outputs, &[3]).unwrap();
        assert_close(&values(result.horizon(3).unwrap()), &[10.0, 10.0, 10.0]);
        assert_eq!(result.models, vec!["a"]);
        // A row that names one model is fully served by it.
        assert!(!result.horizon(3).unwrap().degraded);
    }

    #[test]
    fn test_horizon_without_row_uses_equal_weights() {
        let engine = ForecastEnsembleEngine::new(EnsemblePolicy {
            weights: vec![],
            uncertainty: UncertaintyPolicy::default(),
        });
        let outputs = [
            ModelOutput::hourly("a", first_hour(), &[10.0, 20.0]),
            ModelOutput::hourly("b", first_hour(), &[30.0, 40.0]),
        ];
        let result = engine.combine(base(), &outputs, &[2]).unwrap();
        let h = result.horizon(2).unwrap();
        assert_close(&values(h), &[20.0, 30.0]);
        assert!(!h.degraded);
    }

    #[test]
    fn test_horizon_without_row_degrades_on_missing_models() {
        // The table only has a 3h row; 6h falls back to equal weights.
        let engine = engine_3h(&[("a", 0.5), ("b", 0.5)]);

        let single = [ModelOutput::hourly("a", first_hour(), &[10.0; 6])];
        let result = engine.combine(base(), &single, &[6]).unwrap();
        let h = result.horizon(6).unwrap();
        assert_close(&values(h), &[10.0; 6]);
        assert!(h.degraded);
        assert_eq!(h.missing_models, vec!["b"]);

        let both = [
            ModelOutput::hourly("a", first_hour(), &[10.0; 6]),
            ModelOutput::hourly("b", first_hour(), &[20.0; 6]),
        ];
        let result = engine.combine(base(), &both, &[6]).unwrap();
        assert!(!result.horizon(6).unwrap().degraded);

        // Without any table, one model alone is still degraded.
        let bare = ForecastEnsembleEngine::new(EnsemblePolicy {
            weights: vec![],
            uncertainty: UncertaintyPolicy::default(),
        });
        let result = bare.combine(base(), &single, &[6]).unwrap();
        assert!(result.horizon(6).unwrap().degraded);
    }

    #[test]
    fn test_bounds_widen_when_degraded() {
        let policy = UncertaintyPolicy::default();
        let samples = [(0.5, 40.0), (0.5, 60.0)];
        let (lo, hi) = policy.bounds(50.0, &samples, false);
        assert!((hi - 50.0 - 1.96 * 10.0).abs() < 1e-9);
        assert!((50.0 - lo - 1.96 * 10.0).abs() < 1e-9);

        let (dlo, dhi) = policy.bounds(50.0, &samples, true);
        assert!(dhi - dlo > hi - lo);

        // A single model has no spread, so the floor applies.
        let (lo, hi) = policy.bounds(100.0, &[(1.0, 100.0)], false);
        assert!((hi - 105.0).abs() < 1e-9);
        assert!((lo - 95.0).abs() < 1e-9);
    }

    #[test]
    fn test_bounds_clamped_at_zero() {
        let policy = UncertaintyPolicy::default();
        let (lo, _) = policy.bounds(1.0, &[(1.0, 1.0)], true);
        assert_eq!(lo, 0.0);
    }

    #[test]
    fn test_half_range_dispersion() {
        let policy = UncertaintyPolicy {
            method: DispersionMethod::HalfRange,
            z: 1.0,
            min_half_width: 0.0,
            relative_floor: 0.0,
            ..UncertaintyPolicy::default()
        };
        let (lo, hi) = policy.bounds(50.0, &[(0.5, 44.0), (0.5, 56.0)], false);
        assert!((lo - 44.0).abs() < 1e-9);
        assert!((hi - 56.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_horizons_rejected() {
        let engine = ForecastEnsembleEngine::default();
        assert!(matches!(
            engine.combine(base(), &[], &[]),
            Err(PipelineError::Validation(_))
        ));
        assert!(matches!(
            engine.combine(base(), &[], &[24, 24]),
            Err(PipelineError::Validation(_))
        ));
        assert!(matches!(
            engine.combine(base(), &[], &[0]),
            Err(PipelineError::Validation(_))
        ));
    }

    #[test]
    fn test_policy_validation() {
        assert!(EnsemblePolicy::default().validate().is_ok());

        let mut bad = EnsemblePolicy::default();
        bad.weights.push(HorizonWeights::new(24, [("x", 1.0)]));
        assert!(bad.validate().is_err());

        let bad = EnsemblePolicy {
            weights: vec![HorizonWeights::new(24, [("x", -0.5), ("y", 1.0)])],
            ..EnsemblePolicy::default()
        };
        assert!(bad.validate().is_err());

        let bad = EnsemblePolicy {
            weights: vec![HorizonWeights::new(24, [("x", 0.0)])],
            ..EnsemblePolicy::default()
        };
        assert!(bad.validate().is_err());
    }
}
