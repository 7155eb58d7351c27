//! Lagged correlation between a driver stress and a response series

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{EngineError, Result};
use crate::resample::Frequency;
use crate::series::ResampledSeries;

/// Confidence level for Fisher-z intervals. A closed set so the critical
/// value is a constant, not a lookup in a stats crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfidenceLevel {
    P90,
    P95,
    P99,
}

impl ConfidenceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceLevel::P90 => "90",
            ConfidenceLevel::P95 => "95",
            ConfidenceLevel::P99 => "99",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "90" => Some(ConfidenceLevel::P90),
            "95" => Some(ConfidenceLevel::P95),
            "99" => Some(ConfidenceLevel::P99),
            _ => None,
        }
    }

    /// Two-sided standard-normal critical value.
    fn z(&self) -> f64 {
        match self {
            ConfidenceLevel::P90 => 1.6448536269514722,
            ConfidenceLevel::P95 => 1.959963984540054,
            ConfidenceLevel::P99 => 2.5758293035489004,
        }
    }
}

/// Parameters of one lag sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LagConfig {
    /// Half-range of the sweep: lags run from `-max_lag` to `+max_lag`.
    pub max_lag: usize,
    /// Step between candidate lags, in grid bins.
    pub step: usize,
    /// Minimum overlapping points for a lag to enter the table.
    pub min_overlap: usize,
    pub confidence: ConfidenceLevel,
}

impl LagConfig {
    pub fn new(max_lag: usize, step: usize) -> Self {
        Self {
            max_lag,
            step,
            min_overlap: 3,
            confidence: ConfidenceLevel::P95,
        }
    }

    /// The sweep the original analysis used for each frequency.
    pub fn for_frequency(frequency: Frequency) -> Option<Self> {
        frequency.default_lag_range().map(|range| Self::new(range, 1))
    }
}

/// One row of the lag table.
///
/// The CI pair is absent when the overlap is too small for the Fisher
/// transform (n ≤ 3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LagPoint {
    pub lag: i64,
    pub r: f64,
    pub n: usize,
    pub ci_lower: Option<f64>,
    pub ci_upper: Option<f64>,
}

/// Lag sweep result, rows ascending by lag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LagCorrelationTable {
    pub points: Vec<LagPoint>,
    /// Lag maximizing |R|; ties break toward the smallest |lag|, then the
    /// smaller signed lag.
    pub optimal_lag: i64,
    pub optimal_r: f64,
}

/// Sweep signed lags and correlate the response against the driver.
///
/// A positive lag means the response trails the driver: at lag `L` the
/// driver value at `t` is paired with the response value at `t + L` grid
/// bins. Lags whose post-shift overlap falls below `min_overlap` are
/// omitted from the table, not zero-filled; if no lag qualifies the sweep
/// fails with `InsufficientOverlap`.
pub fn lag_correlation(
    driver: &ResampledSeries,
    response: &ResampledSeries,
    config: &LagConfig,
) -> Result<LagCorrelationTable> {
    if config.step == 0 {
        return Err(EngineError::InvalidParameter(
            "lag step must be at least 1".to_string(),
        ));
    }
    if config.min_overlap < 2 {
        return Err(EngineError::InvalidParameter(
            "minimum overlap must be at least 2 points".to_string(),
        ));
    }
    if driver.frequency == Frequency::Raw {
        return Err(EngineError::InvalidParameter(
            "lag sweep requires a fixed-frequency grid, not Raw".to_string(),
        ));
    }
    if driver.frequency != response.frequency {
        return Err(EngineError::InvalidParameter(format!(
            "driver is {} but response is {}; both series must share one grid",
            driver.frequency.as_str(),
            response.frequency.as_str()
        )));
    }

    let driver_by_ts: BTreeMap<_, f64> = driver
        .points
        .iter()
        .map(|p| (p.timestamp, p.value))
        .collect();

    let mut points = Vec::new();
    let mut best_overlap = 0;
    let max = config.max_lag as i64;
    let mut lag = -max;
    while lag <= max {
        let mut xs = Vec::new();
        let mut ys = Vec::new();
        for p in &response.points {
            // Pair response(t) with driver(t - lag).
            let driver_ts = driver.frequency.shift(p.timestamp, -lag);
            if let Some(&x) = driver_by_ts.get(&driver_ts) {
                xs.push(x);
                ys.push(p.value);
            }
        }
        best_overlap = best_overlap.max(xs.len());

        if xs.len() >= config.min_overlap {
            if let Some(r) = pearson(&xs, &ys) {
                let (ci_lower, ci_upper) = fisher_interval(r, xs.len(), config.confidence);
                points.push(LagPoint {
                    lag,
                    r,
                    n: xs.len(),
                    ci_lower,
                    ci_upper,
                });
            }
        }
        lag += config.step as i64;
    }

    if points.is_empty() {
        return Err(EngineError::InsufficientOverlap {
            needed: config.min_overlap,
            best: best_overlap,
        });
    }

    let optimal = points
        .iter()
        .copied()
        .reduce(|best, p| {
            let better = p.r.abs() > best.r.abs()
                || (p.r.abs() == best.r.abs()
                    && (p.lag.abs() < best.lag.abs()
                        || (p.lag.abs() == best.lag.abs() && p.lag < best.lag)));
            if better {
                p
            } else {
                best
            }
        })
        .expect("points is non-empty");

    log::debug!(
        "lag sweep over {} candidates: optimal lag {} (r={:.3})",
        points.len(),
        optimal.lag,
        optimal.r
    );

    Ok(LagCorrelationTable {
        points,
        optimal_lag: optimal.lag,
        optimal_r: optimal.r,
    })
}

/// Pearson correlation; `None` when either side has zero variance.
fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let n = xs.len() as f64;
    let x_mean = xs.iter().sum::<f64>() / n;
    let y_mean = ys.iter().sum::<f64>() / n;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - x_mean;
        let dy = y - y_mean;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx == 0.0 || syy == 0.0 {
        return None;
    }
    Some(sxy / (sxx * syy).sqrt())
}

/// Fisher-z confidence interval for R. Undefined below four points; a
/// perfect correlation collapses to a zero-width interval.
fn fisher_interval(r: f64, n: usize, level: ConfidenceLevel) -> (Option<f64>, Option<f64>) {
    if n <= 3 {
        return (None, None);
    }
    if (1.0 - r * r) < 1e-15 {
        return (Some(r), Some(r));
    }
    let z = r.atanh();
    let se = 1.0 / ((n - 3) as f64).sqrt();
    let half = level.z() * se;
    (Some((z - half).tanh()), Some((z + half).tanh()))
}
