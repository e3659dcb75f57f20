use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScalingError {
    #[error("unsupported scaling method: {0}")]
    UnsupportedMethod(String),
}

impl ScalingError {
    pub fn code(&self) -> &'static str {
        match self {
            ScalingError::UnsupportedMethod(_) => "unsupported_method",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScalingMethod {
    BellCurve,
    LinearNormalization,
    MinMaxNormalization,
    Percentile,
}

impl ScalingMethod {
    pub const ALL: [ScalingMethod; 4] = [
        ScalingMethod::BellCurve,
        ScalingMethod::LinearNormalization,
        ScalingMethod::MinMaxNormalization,
        ScalingMethod::Percentile,
    ];

    pub fn parse(s: &str) -> Result<Self, ScalingError> {
        match s {
            "bellCurve" => Ok(Self::BellCurve),
            "linearNormalization" => Ok(Self::LinearNormalization),
            "minMaxNormalization" => Ok(Self::MinMaxNormalization),
            "percentile" => Ok(Self::Percentile),
            other => Err(ScalingError::UnsupportedMethod(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BellCurve => "bellCurve",
            Self::LinearNormalization => "linearNormalization",
            Self::MinMaxNormalization => "minMaxNormalization",
            Self::Percentile => "percentile",
        }
    }
}

impl fmt::Display for ScalingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The slice of an exam's configuration the engine needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingConfig {
    pub total_marks: f64,
    pub scaling_target: Option<f64>,
}

impl ScalingConfig {
    /// Ceiling that scaled marks are mapped onto.
    pub fn target(&self) -> f64 {
        self.scaling_target.unwrap_or(self.total_marks)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortEntry {
    pub student_id: String,
    pub raw_mark: Option<f64>,
}

impl CohortEntry {
    pub fn new(student_id: impl Into<String>, raw_mark: Option<f64>) -> Self {
        Self {
            student_id: student_id.into(),
            raw_mark,
        }
    }

    fn valid_mark(&self) -> Option<f64> {
        self.raw_mark.filter(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaledMark {
    pub student_id: String,
    pub scaled_mark: f64,
}

/// Round half away from zero at the second decimal place.
///
/// Works on the shortest decimal representation of `x` rather than on
/// `x * 100.0`, so inputs like `1.005` (stored as 1.00499999...) still round
/// as the decimal tie they were written as.
pub fn round_to_2_decimals(x: f64) -> f64 {
    if !x.is_finite() || x.abs() >= 1e15 {
        return x;
    }
    let repr = x.abs().to_string();
    let (whole, frac) = repr.split_once('.').unwrap_or((repr.as_str(), ""));
    if frac.len() <= 2 {
        return x;
    }
    let Ok(whole) = whole.parse::<i64>() else {
        return x;
    };
    let digits = frac.as_bytes();
    let mut cents = whole * 100 + i64::from(digits[0] - b'0') * 10 + i64::from(digits[1] - b'0');
    if digits[2] >= b'5' {
        cents += 1;
    }
    if cents == 0 {
        return 0.0;
    }
    let magnitude = cents as f64 / 100.0;
    if x.is_sign_negative() {
        -magnitude
    } else {
        magnitude
    }
}

fn clamp_to_target(x: f64, target: f64) -> f64 {
    x.max(0.0).min(target)
}

fn valid_marks(cohort: &[CohortEntry]) -> Vec<f64> {
    cohort.iter().filter_map(CohortEntry::valid_mark).collect()
}

fn all_equal(marks: &[f64]) -> bool {
    marks.windows(2).all(|w| w[0] == w[1])
}

/// Every valid entry gets the same mark; used for degenerate cohorts.
fn uniform(cohort: &[CohortEntry], value: f64) -> Vec<ScaledMark> {
    let value = round_to_2_decimals(value);
    cohort
        .iter()
        .filter(|e| e.valid_mark().is_some())
        .map(|e| ScaledMark {
            student_id: e.student_id.clone(),
            scaled_mark: value,
        })
        .collect()
}

fn map_valid<F>(cohort: &[CohortEntry], f: F) -> Vec<ScaledMark>
where
    F: Fn(f64) -> f64,
{
    cohort
        .iter()
        .filter_map(|e| {
            e.valid_mark().map(|raw| ScaledMark {
                student_id: e.student_id.clone(),
                scaled_mark: round_to_2_decimals(f(raw)),
            })
        })
        .collect()
}

/// Population mean and standard deviation. `None` for an empty slice.
pub fn mean_and_std_dev(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some((mean, variance.sqrt()))
}

fn bell_curve(cohort: &[CohortEntry], config: &ScalingConfig) -> Vec<ScaledMark> {
    let target = config.target();
    let marks = valid_marks(cohort);
    let Some((mean, std_dev)) = mean_and_std_dev(&marks) else {
        return Vec::new();
    };
    // Identical marks are degenerate even when float drift leaves sigma a
    // few ulps above zero.
    if all_equal(&marks) || std_dev == 0.0 {
        return uniform(cohort, target / 2.0);
    }
    // +/-3 standard deviations land on the range boundaries.
    map_valid(cohort, |raw| {
        let z = (raw - mean) / std_dev;
        clamp_to_target(target / 2.0 + z * target / 6.0, target)
    })
}

fn linear_normalization(cohort: &[CohortEntry], config: &ScalingConfig) -> Vec<ScaledMark> {
    let target = config.target();
    let total = config.total_marks;
    map_valid(cohort, |raw| clamp_to_target(raw / total * target, target))
}

fn min_max_normalization(cohort: &[CohortEntry], config: &ScalingConfig) -> Vec<ScaledMark> {
    let target = config.target();
    let marks = valid_marks(cohort);
    if marks.is_empty() {
        return Vec::new();
    }
    let min = marks.iter().copied().fold(f64::INFINITY, f64::min);
    let max = marks.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    if range == 0.0 {
        return uniform(cohort, target / 2.0);
    }
    map_valid(cohort, |raw| (raw - min) / range * target)
}

fn percentile(cohort: &[CohortEntry], config: &ScalingConfig) -> Vec<ScaledMark> {
    let target = config.target();
    let mut ranked: Vec<(usize, f64)> = cohort
        .iter()
        .enumerate()
        .filter_map(|(i, e)| e.valid_mark().map(|v| (i, v)))
        .collect();
    if ranked.is_empty() {
        return Vec::new();
    }
    // Stable: equal raw marks keep cohort order.
    ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

    let n = ranked.len();
    let mut by_position: Vec<Option<f64>> = vec![None; cohort.len()];
    for (rank, (pos, _)) in ranked.iter().enumerate() {
        let p = if n == 1 {
            0.5
        } else {
            rank as f64 / (n - 1) as f64
        };
        by_position[*pos] = Some(round_to_2_decimals(p * target));
    }

    cohort
        .iter()
        .zip(by_position)
        .filter_map(|(e, scaled)| {
            scaled.map(|scaled_mark| ScaledMark {
                student_id: e.student_id.clone(),
                scaled_mark,
            })
        })
        .collect()
}

/// Scale one exam's cohort. Entries without a finite raw mark are left out
/// of both the statistics and the result; output follows cohort order.
pub fn scale(
    cohort: &[CohortEntry],
    config: &ScalingConfig,
    method: ScalingMethod,
) -> Vec<ScaledMark> {
    match method {
        ScalingMethod::BellCurve => bell_curve(cohort, config),
        ScalingMethod::LinearNormalization => linear_normalization(cohort, config),
        ScalingMethod::MinMaxNormalization => min_max_normalization(cohort, config),
        ScalingMethod::Percentile => percentile(cohort, config),
    }
}

/// String-keyed entry point for callers that receive the method over the wire.
pub fn scale_by_name(
    cohort: &[CohortEntry],
    config: &ScalingConfig,
    method: &str,
) -> Result<Vec<ScaledMark>, ScalingError> {
    Ok(scale(cohort, config, ScalingMethod::parse(method)?))
}
