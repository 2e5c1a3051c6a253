use std::fmt::{Display, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub const ANALYSIS_ARTIFACT_VERSION: &str = "analysis_summary.v1";
pub const LATENCY_TEST_FAMILY: &str = "welch_t";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ExperimentError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("inference error: {0}")]
    Inference(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum VariantLabel {
    A,
    B,
}

impl VariantLabel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "A" => Some(Self::A),
            "B" => Some(Self::B),
            _ => None,
        }
    }
}

impl Display for VariantLabel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentMode {
    Sticky,
    UniformRandom,
}

impl AssignmentMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sticky => "sticky",
            Self::UniformRandom => "uniform_random",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sticky" => Some(Self::Sticky),
            "uniform_random" => Some(Self::UniformRandom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionEvent {
    pub event_seq: i64,
    pub request_id: Ulid,
    pub recorded_at: OffsetDateTime,
    pub variant: VariantLabel,
    pub input_features: Vec<f64>,
    pub prediction: f64,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionEventInput {
    pub request_id: Ulid,
    pub variant: VariantLabel,
    pub input_features: Vec<f64>,
    pub prediction: f64,
    pub latency_ms: f64,
}

impl PredictionEventInput {
    /// Validates a prediction record before append.
    ///
    /// # Errors
    /// Returns [`ExperimentError::Validation`] when a field violates the
    /// event schema constraints.
    pub fn validate(&self) -> Result<(), ExperimentError> {
        if self.input_features.is_empty() {
            return Err(ExperimentError::Validation(
                "input_features MUST contain at least one feature".to_string(),
            ));
        }

        if self.input_features.iter().any(|value| !value.is_finite()) {
            return Err(ExperimentError::Validation(
                "input_features MUST all be finite numbers".to_string(),
            ));
        }

        if !self.prediction.is_finite() {
            return Err(ExperimentError::Validation(
                "prediction MUST be a finite number".to_string(),
            ));
        }

        if !self.latency_ms.is_finite() || self.latency_ms < 0.0 {
            return Err(ExperimentError::Validation(
                "latency_ms MUST be finite and >= 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Opaque scoring capability: one trained variant behind a fixed contract.
pub trait Scorer: Send + Sync {
    fn feature_arity(&self) -> usize;

    /// # Errors
    /// Returns [`ExperimentError::Inference`] when the underlying model
    /// cannot produce a prediction for the given features.
    fn score(&self, features: &[f64]) -> Result<f64, ExperimentError>;
}

/// The two ready-to-serve scorer handles, validated as a matched pair.
#[derive(Clone)]
pub struct ScorerPair {
    variant_a: Arc<dyn Scorer>,
    variant_b: Arc<dyn Scorer>,
    feature_arity: usize,
}

impl ScorerPair {
    /// # Errors
    /// Returns [`ExperimentError::Configuration`] when the two scorers
    /// disagree on arity or declare a zero-width feature vector.
    pub fn new(
        variant_a: Arc<dyn Scorer>,
        variant_b: Arc<dyn Scorer>,
    ) -> Result<Self, ExperimentError> {
        let arity_a = variant_a.feature_arity();
        let arity_b = variant_b.feature_arity();

        if arity_a == 0 || arity_b == 0 {
            return Err(ExperimentError::Configuration(
                "scorer feature arity MUST be >= 1".to_string(),
            ));
        }

        if arity_a != arity_b {
            return Err(ExperimentError::Configuration(format!(
                "scorer pair arity mismatch: variant A expects {arity_a}, variant B expects {arity_b}"
            )));
        }

        Ok(Self { variant_a, variant_b, feature_arity: arity_a })
    }

    #[must_use]
    pub fn feature_arity(&self) -> usize {
        self.feature_arity
    }

    #[must_use]
    pub fn scorer(&self, variant: VariantLabel) -> Arc<dyn Scorer> {
        match variant {
            VariantLabel::A => Arc::clone(&self.variant_a),
            VariantLabel::B => Arc::clone(&self.variant_b),
        }
    }
}

impl std::fmt::Debug for ScorerPair {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScorerPair").field("feature_arity", &self.feature_arity).finish()
    }
}

#[must_use]
pub fn stable_identity_digest(identity: &str) -> u64 {
    // FNV-1a over bytes, then a SplitMix64 finalizer for bit diffusion.
    // Stable across processes and platforms; never a randomized hasher.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in identity.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    splitmix64(hash)
}

fn splitmix64(value: u64) -> u64 {
    let mut z = value.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Sticky assignment: the same trimmed identity always maps to the same
/// variant, across restarts and across the fleet.
///
/// # Errors
/// Returns [`ExperimentError::Validation`] for an empty or blank identity;
/// identity-less callers are a pipeline policy decision, not a default here.
pub fn assign_variant(identity: &str) -> Result<VariantLabel, ExperimentError> {
    let trimmed = identity.trim();
    if trimmed.is_empty() {
        return Err(ExperimentError::Validation(
            "identity MUST be non-empty for sticky assignment".to_string(),
        ));
    }

    if stable_identity_digest(trimmed) & 1 == 0 {
        Ok(VariantLabel::A)
    } else {
        Ok(VariantLabel::B)
    }
}

/// Uniform-random assignment: a fair coin drawn from the request ULID's
/// random component, decided once per request.
#[must_use]
pub fn assign_by_coin(request_id: Ulid) -> VariantLabel {
    if request_id.random() & 1 == 0 {
        VariantLabel::A
    } else {
        VariantLabel::B
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AnalysisPolicy {
    pub significance_level: f64,
    pub confidence_level: f64,
}

impl Default for AnalysisPolicy {
    fn default() -> Self {
        Self { significance_level: 0.05, confidence_level: 0.95 }
    }
}

impl AnalysisPolicy {
    /// # Errors
    /// Returns [`ExperimentError::Configuration`] when a level is outside
    /// the open interval (0, 1).
    pub fn validate(&self) -> Result<(), ExperimentError> {
        if !(self.significance_level > 0.0 && self.significance_level < 1.0) {
            return Err(ExperimentError::Configuration(
                "significance_level MUST be in (0.0, 1.0)".to_string(),
            ));
        }

        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(ExperimentError::Configuration(
                "confidence_level MUST be in (0.0, 1.0)".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonStatus {
    Compared,
    InsufficientData,
}

impl ComparisonStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compared => "compared",
            Self::InsufficientData => "insufficient_data",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "compared" => Some(Self::Compared),
            "insufficient_data" => Some(Self::InsufficientData),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariantGroupSummary {
    pub variant: VariantLabel,
    pub request_count: usize,
    pub mean_prediction: Option<f64>,
    pub mean_latency_ms: Option<f64>,
    pub prediction_ci_half_width: f64,
    pub latency_ci_half_width_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LatencyComparison {
    pub status: ComparisonStatus,
    pub t_statistic: Option<f64>,
    pub degrees_of_freedom: Option<f64>,
    pub p_value: Option<f64>,
    pub significant: bool,
    pub winner: Option<VariantLabel>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisSummary {
    pub generated_at: OffsetDateTime,
    pub significance_level: f64,
    pub confidence_level: f64,
    pub event_count: usize,
    pub group_a: VariantGroupSummary,
    pub group_b: VariantGroupSummary,
    pub latency_comparison: LatencyComparison,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WelchTest {
    pub t_statistic: f64,
    pub degrees_of_freedom: f64,
    pub p_value: f64,
}

/// Batch analysis over an event snapshot: per-variant descriptive
/// statistics plus Welch's t-test on the latency metric.
///
/// Deterministic given its input: the same snapshot always produces the
/// same statistics. Insufficient data is a reported status, never an error.
///
/// # Errors
/// Returns [`ExperimentError::Configuration`] only when the policy levels
/// are out of range.
pub fn analyze_events(
    events: &[PredictionEvent],
    policy: &AnalysisPolicy,
) -> Result<AnalysisSummary, ExperimentError> {
    policy.validate()?;

    let mut predictions_a = Vec::new();
    let mut latencies_a = Vec::new();
    let mut predictions_b = Vec::new();
    let mut latencies_b = Vec::new();

    for event in events {
        match event.variant {
            VariantLabel::A => {
                predictions_a.push(event.prediction);
                latencies_a.push(event.latency_ms);
            }
            VariantLabel::B => {
                predictions_b.push(event.prediction);
                latencies_b.push(event.latency_ms);
            }
        }
    }

    let group_a = summarize_group(
        VariantLabel::A,
        &predictions_a,
        &latencies_a,
        policy.confidence_level,
    );
    let group_b = summarize_group(
        VariantLabel::B,
        &predictions_b,
        &latencies_b,
        policy.confidence_level,
    );

    let latency_comparison = match welch_t_test(&latencies_a, &latencies_b) {
        Some(test) => {
            let significant = test.p_value < policy.significance_level;
            let winner = if significant {
                lower_latency_variant(&group_a, &group_b)
            } else {
                None
            };
            LatencyComparison {
                status: ComparisonStatus::Compared,
                t_statistic: Some(test.t_statistic),
                degrees_of_freedom: Some(test.degrees_of_freedom),
                p_value: Some(test.p_value),
                significant,
                winner,
            }
        }
        None => LatencyComparison {
            status: ComparisonStatus::InsufficientData,
            t_statistic: None,
            degrees_of_freedom: None,
            p_value: None,
            significant: false,
            winner: None,
        },
    };

    Ok(AnalysisSummary {
        generated_at: now_utc(),
        significance_level: policy.significance_level,
        confidence_level: policy.confidence_level,
        event_count: events.len(),
        group_a,
        group_b,
        latency_comparison,
    })
}

fn lower_latency_variant(
    group_a: &VariantGroupSummary,
    group_b: &VariantGroupSummary,
) -> Option<VariantLabel> {
    match (group_a.mean_latency_ms, group_b.mean_latency_ms) {
        (Some(mean_a), Some(mean_b)) if mean_a < mean_b => Some(VariantLabel::A),
        (Some(mean_a), Some(mean_b)) if mean_b < mean_a => Some(VariantLabel::B),
        _ => None,
    }
}

fn summarize_group(
    variant: VariantLabel,
    predictions: &[f64],
    latencies: &[f64],
    confidence_level: f64,
) -> VariantGroupSummary {
    let request_count = latencies.len();
    let mean_prediction = (request_count > 0).then(|| mean(predictions));
    let mean_latency_ms = (request_count > 0).then(|| mean(latencies));

    VariantGroupSummary {
        variant,
        request_count,
        mean_prediction,
        mean_latency_ms,
        prediction_ci_half_width: ci_half_width(predictions, confidence_level),
        latency_ci_half_width_ms: ci_half_width(latencies, confidence_level),
    }
}

/// Canonical JSON rendering of a summary, shared by the artifact writer and
/// the service endpoint. Timestamps are RFC3339 strings; non-finite
/// statistics render as null.
///
/// # Errors
/// Returns [`ExperimentError::Validation`] when the timestamp cannot be
/// formatted.
pub fn analysis_summary_to_json(summary: &AnalysisSummary) -> Result<Value, ExperimentError> {
    Ok(json!({
        "artifact_version": ANALYSIS_ARTIFACT_VERSION,
        "generated_at": format_rfc3339(summary.generated_at)?,
        "significance_level": summary.significance_level,
        "confidence_level": summary.confidence_level,
        "event_count": summary.event_count,
        "groups": {
            "A": group_to_json(&summary.group_a),
            "B": group_to_json(&summary.group_b),
        },
        "latency_comparison": {
            "test": LATENCY_TEST_FAMILY,
            "status": summary.latency_comparison.status.as_str(),
            "t_statistic": finite_or_null(summary.latency_comparison.t_statistic),
            "degrees_of_freedom": finite_or_null(summary.latency_comparison.degrees_of_freedom),
            "p_value": finite_or_null(summary.latency_comparison.p_value),
            "significant": summary.latency_comparison.significant,
            "winner": summary.latency_comparison.winner.map(VariantLabel::as_str),
        },
    }))
}

fn group_to_json(group: &VariantGroupSummary) -> Value {
    json!({
        "request_count": group.request_count,
        "mean_prediction": finite_or_null(group.mean_prediction),
        "mean_latency_ms": finite_or_null(group.mean_latency_ms),
        "prediction_ci_half_width": group.prediction_ci_half_width,
        "latency_ci_half_width_ms": group.latency_ci_half_width_ms,
    })
}

fn finite_or_null(value: Option<f64>) -> Value {
    match value {
        Some(inner) if inner.is_finite() => json!(inner),
        _ => Value::Null,
    }
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn sample_variance(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let sum_sq: f64 = values.iter().map(|value| (value - mean) * (value - mean)).sum();
    sum_sq / (values.len() - 1) as f64
}

/// Confidence-interval half-width for a sample mean: standard error times
/// the Student-t critical value at n-1 degrees of freedom. Zero-width when
/// fewer than two observations exist.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn ci_half_width(values: &[f64], confidence_level: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }

    let n = values.len() as f64;
    let variance = sample_variance(values, mean(values));
    let standard_error = (variance / n).sqrt();
    standard_error * student_t_critical(n - 1.0, confidence_level)
}

/// Welch's two-sample t-test (unequal variance) with Welch-Satterthwaite
/// degrees of freedom. Returns `None` when either sample has fewer than two
/// observations: the caller reports insufficient data instead of a
/// fabricated p-value.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn welch_t_test(sample_a: &[f64], sample_b: &[f64]) -> Option<WelchTest> {
    if sample_a.len() < 2 || sample_b.len() < 2 {
        return None;
    }

    let n_a = sample_a.len() as f64;
    let n_b = sample_b.len() as f64;
    let mean_a = mean(sample_a);
    let mean_b = mean(sample_b);
    let variance_ratio_a = sample_variance(sample_a, mean_a) / n_a;
    let variance_ratio_b = sample_variance(sample_b, mean_b) / n_b;
    let pooled = variance_ratio_a + variance_ratio_b;

    if pooled == 0.0 {
        // Zero-variance groups reduce to direct equality of means.
        let difference = mean_a - mean_b;
        let degrees_of_freedom = n_a + n_b - 2.0;
        if difference == 0.0 {
            return Some(WelchTest { t_statistic: 0.0, degrees_of_freedom, p_value: 1.0 });
        }
        return Some(WelchTest {
            t_statistic: f64::INFINITY.copysign(difference),
            degrees_of_freedom,
            p_value: 0.0,
        });
    }

    let t_statistic = (mean_a - mean_b) / pooled.sqrt();
    let degrees_of_freedom = (pooled * pooled)
        / (variance_ratio_a * variance_ratio_a / (n_a - 1.0)
            + variance_ratio_b * variance_ratio_b / (n_b - 1.0));
    let p_value = student_t_two_sided_p(t_statistic, degrees_of_freedom);

    Some(WelchTest { t_statistic, degrees_of_freedom, p_value })
}

/// Two-sided p-value for a Student-t statistic: the regularized incomplete
/// beta of the tail mass, `I_{v/(v+t^2)}(v/2, 1/2)`.
#[must_use]
pub fn student_t_two_sided_p(t_statistic: f64, degrees_of_freedom: f64) -> f64 {
    if degrees_of_freedom <= 0.0 || !t_statistic.is_finite() {
        return if t_statistic.is_nan() { f64::NAN } else { 0.0 };
    }

    let x = degrees_of_freedom / (degrees_of_freedom + t_statistic * t_statistic);
    regularized_incomplete_beta(degrees_of_freedom / 2.0, 0.5, x)
}

/// Two-sided Student-t critical value at the given confidence level, found
/// by monotone bisection on the tail mass.
#[must_use]
pub fn student_t_critical(degrees_of_freedom: f64, confidence_level: f64) -> f64 {
    if degrees_of_freedom <= 0.0 || !(confidence_level > 0.0 && confidence_level < 1.0) {
        return 0.0;
    }

    let alpha = 1.0 - confidence_level;
    let mut lo = 0.0_f64;
    let mut hi = 1.0_f64;
    while student_t_two_sided_p(hi, degrees_of_freedom) > alpha {
        lo = hi;
        hi *= 2.0;
        if hi > 1.0e12 {
            break;
        }
    }

    for _ in 0..128 {
        let mid = 0.5 * (lo + hi);
        if student_t_two_sided_p(mid, degrees_of_freedom) > alpha {
            lo = mid;
        } else {
            hi = mid;
        }
    }

    0.5 * (lo + hi)
}

// Lanczos approximation (g = 7, n = 9), reflection below 0.5.
#[allow(clippy::excessive_precision, clippy::cast_precision_loss)]
fn ln_gamma(value: f64) -> f64 {
    const COEFFICIENTS: [f64; 9] = [
        0.999_999_999_999_809_93,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_9,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_571_6e-6,
        1.505_632_735_149_311_6e-7,
    ];
    const LANCZOS_G: f64 = 7.0;

    if value <= 0.0 {
        return 0.0;
    }

    if value < 0.5 {
        let pi = std::f64::consts::PI;
        return pi.ln() - (pi * value).sin().ln() - ln_gamma(1.0 - value);
    }

    let shifted = value - 1.0;
    let mut series = COEFFICIENTS[0];
    for (index, coefficient) in COEFFICIENTS.iter().enumerate().skip(1) {
        series += coefficient / (shifted + index as f64);
    }

    let t = shifted + LANCZOS_G + 0.5;
    let log_two_pi = (2.0 * std::f64::consts::PI).ln();
    0.5 * log_two_pi + (shifted + 0.5) * t.ln() - t + series.ln()
}

/// Regularized incomplete beta `I_x(a, b)` via the Lentz continued
/// fraction, with the symmetry transform for the slow-convergence half.
#[must_use]
pub fn regularized_incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }

    let ln_front =
        ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let front = ln_front.exp();

    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(a, b, x) / a
    } else {
        1.0 - front * beta_continued_fraction(b, a, 1.0 - x) / b
    }
}

#[allow(clippy::cast_precision_loss)]
fn beta_continued_fraction(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITERATIONS: usize = 200;
    const EPSILON: f64 = 1.0e-14;
    const FLOOR: f64 = 1.0e-300;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;

    let mut c = 1.0_f64;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < FLOOR {
        d = FLOOR;
    }
    d = 1.0 / d;
    let mut h = d;

    for m in 1..=MAX_ITERATIONS {
        let m_f = m as f64;
        let m2 = 2.0 * m_f;

        let even_term = m_f * (b - m_f) * x / ((qam + m2) * (a + m2));
        d = 1.0 + even_term * d;
        if d.abs() < FLOOR {
            d = FLOOR;
        }
        c = 1.0 + even_term / c;
        if c.abs() < FLOOR {
            c = FLOOR;
        }
        d = 1.0 / d;
        h *= d * c;

        let odd_term = -(a + m_f) * (qab + m_f) * x / ((a + m2) * (qap + m2));
        d = 1.0 + odd_term * d;
        if d.abs() < FLOOR {
            d = FLOOR;
        }
        c = 1.0 + odd_term / c;
        if c.abs() < FLOOR {
            c = FLOOR;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;

        if (delta - 1.0).abs() < EPSILON {
            break;
        }
    }

    h
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`ExperimentError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ExperimentError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ExperimentError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ExperimentError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ExperimentError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ExperimentError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            ExperimentError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
