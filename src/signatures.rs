//! Per-sensor shape descriptors ("groundwater signatures")

use chrono::{DateTime, Datelike, Timelike, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Sender;

use crate::error::{EngineError, Result};
use crate::progress::{report, BatchStage, ProgressEvent};
use crate::resample::Frequency;
use crate::series::ResampledSeries;
use crate::transform::{mean, percentile, sample_std};

/// Version of the descriptor catalog. Bump when descriptors are added,
/// removed, or change meaning; cached matrices from other versions must not
/// be mixed.
pub const SIGNATURE_VERSION: u32 = 1;

/// The fixed descriptor catalog, in column order.
pub const DESCRIPTORS: [&str; 12] = [
    "mean",
    "median",
    "min",
    "max",
    "range",
    "std",
    "iqr",
    "roc_p10",
    "roc_p90",
    "trend_slope",
    "seasonal_amplitude",
    "lag1_autocorr",
];

/// sensor × descriptor matrix. Cells are `Option<f64>`: a descriptor that
/// is undefined for a series (too short, no seasonal period) is missing,
/// never zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureMatrix {
    pub version: u32,
    rows: BTreeMap<String, Vec<Option<f64>>>,
}

impl SignatureMatrix {
    /// Build the matrix for a set of resampled series sharing one
    /// frequency/statistic.
    ///
    /// Rows are independent and computed in parallel; the matrix is only
    /// returned once every row is done, so callers never observe a partial
    /// build. Row completion is reported on `progress`.
    pub fn compute(
        series: &BTreeMap<String, ResampledSeries>,
        progress: Option<&Sender<ProgressEvent>>,
    ) -> SignatureMatrix {
        let total = series.len();
        let done = AtomicUsize::new(0);

        let rows: Vec<(String, Vec<Option<f64>>)> = series
            .par_iter()
            .map(|(sensor_id, s)| {
                let row = signature_row(s);
                let completed = done.fetch_add(1, Ordering::Relaxed) + 1;
                report(progress, BatchStage::Signatures, completed, total);
                (sensor_id.clone(), row)
            })
            .collect();

        log::info!("computed signatures for {} sensors", total);

        SignatureMatrix {
            version: SIGNATURE_VERSION,
            rows: rows.into_iter().collect(),
        }
    }

    pub fn descriptors(&self) -> &'static [&'static str] {
        &DESCRIPTORS
    }

    pub fn sensors(&self) -> Vec<&str> {
        self.rows.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Full descriptor row for one sensor.
    pub fn row(&self, sensor_id: &str) -> Result<&[Option<f64>]> {
        self.rows
            .get(sensor_id)
            .map(Vec::as_slice)
            .ok_or_else(|| EngineError::MissingKey {
                key: sensor_id.to_string(),
            })
    }

    /// One cell; `Ok(None)` is an explicitly missing value.
    pub fn cell(&self, sensor_id: &str, descriptor: &str) -> Result<Option<f64>> {
        let column = DESCRIPTORS
            .iter()
            .position(|d| *d == descriptor)
            .ok_or_else(|| EngineError::MissingKey {
                key: descriptor.to_string(),
            })?;
        Ok(self.row(sensor_id)?[column])
    }

    /// Companion matrix with each column min-max-scaled across sensors.
    ///
    /// Missing cells stay missing. A zero-range column maps to zeros, the
    /// same policy as the per-series normalize.
    pub fn normalized(&self) -> SignatureMatrix {
        let mut columns: Vec<Vec<f64>> = vec![Vec::new(); DESCRIPTORS.len()];
        for row in self.rows.values() {
            for (j, cell) in row.iter().enumerate() {
                if let Some(v) = cell {
                    columns[j].push(*v);
                }
            }
        }
        let scales: Vec<Option<(f64, f64)>> = columns
            .iter()
            .map(|col| {
                if col.is_empty() {
                    return None;
                }
                let min = col.iter().copied().fold(f64::INFINITY, f64::min);
                let max = col.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                Some((min, max - min))
            })
            .collect();

        let rows = self
            .rows
            .iter()
            .map(|(sensor_id, row)| {
                let scaled = row
                    .iter()
                    .enumerate()
                    .map(|(j, cell)| {
                        let v = (*cell)?;
                        let (min, range) = scales[j]?;
                        if range == 0.0 {
                            Some(0.0)
                        } else {
                            Some((v - min) / range)
                        }
                    })
                    .collect();
                (sensor_id.clone(), scaled)
            })
            .collect();

        SignatureMatrix {
            version: self.version,
            rows,
        }
    }
}

/// Compute every descriptor for one series. Each descriptor degrades to
/// `None` on its own; a short or degenerate series never fails the row.
fn signature_row(series: &ResampledSeries) -> Vec<Option<f64>> {
    let values = series.values();
    let n = values.len();

    let mut sorted = values.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("finite values"));

    let diffs: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    let mut sorted_diffs = diffs.clone();
    sorted_diffs.sort_by(|a, b| a.partial_cmp(b).expect("finite values"));

    vec![
        (n >= 1).then(|| mean(&values)),
        (n >= 1).then(|| percentile(&sorted, 50.0)),
        (n >= 1).then(|| sorted[0]),
        (n >= 1).then(|| sorted[n - 1]),
        (n >= 1).then(|| sorted[n - 1] - sorted[0]),
        sample_std(&values),
        (n >= 1).then(|| percentile(&sorted, 75.0) - percentile(&sorted, 25.0)),
        (!sorted_diffs.is_empty()).then(|| percentile(&sorted_diffs, 10.0)),
        (!sorted_diffs.is_empty()).then(|| percentile(&sorted_diffs, 90.0)),
        trend_slope(&values),
        seasonal_amplitude(series),
        lag1_autocorr(&values),
    ]
}

/// Least-squares slope of value against step index.
fn trend_slope(values: &[f64]) -> Option<f64> {
    let n = values.len();
    if n < 2 {
        return None;
    }
    let x_mean = (n - 1) as f64 / 2.0;
    let y_mean = mean(values);
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - x_mean;
        num += dx * (y - y_mean);
        den += dx * dx;
    }
    Some(num / den)
}

/// Lag-1 autocorrelation; undefined below three points or at zero variance.
fn lag1_autocorr(values: &[f64]) -> Option<f64> {
    let n = values.len();
    if n < 3 {
        return None;
    }
    let m = mean(values);
    let den: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    if den == 0.0 {
        return None;
    }
    let num: f64 = values
        .windows(2)
        .map(|w| (w[0] - m) * (w[1] - m))
        .sum();
    Some(num / den)
}

/// Peak-to-trough height of the mean annual cycle, from calendar phases.
///
/// Requires a frequency with a seasonal period and at least two periods of
/// points.
fn seasonal_amplitude(series: &ResampledSeries) -> Option<f64> {
    let period = series.frequency.seasonal_period()?;
    if series.len() < 2 * period {
        return None;
    }

    let mut phase_sums: BTreeMap<usize, (f64, usize)> = BTreeMap::new();
    for p in &series.points {
        let phase = calendar_phase(series.frequency, p.timestamp)?;
        let entry = phase_sums.entry(phase).or_insert((0.0, 0));
        entry.0 += p.value;
        entry.1 += 1;
    }

    let phase_means: Vec<f64> = phase_sums
        .values()
        .map(|(sum, count)| sum / *count as f64)
        .collect();
    let min = phase_means.iter().copied().fold(f64::INFINITY, f64::min);
    let max = phase_means
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    Some(max - min)
}

/// Position of a bin within its seasonal cycle.
fn calendar_phase(frequency: Frequency, ts: DateTime<Utc>) -> Option<usize> {
    match frequency {
        Frequency::Hourly => Some(ts.hour() as usize),
        Frequency::Daily => Some(ts.ordinal0() as usize),
        Frequency::Weekly => Some(ts.iso_week().week0() as usize),
        Frequency::Monthly => Some(ts.month0() as usize),
        Frequency::Raw | Frequency::Yearly => None,
    }
}
