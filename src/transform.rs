//! Per-series value transforms and shared numeric helpers

use serde::{Deserialize, Serialize};

use crate::series::{ResampledSeries, Series};

/// Value transform applied per series before distance or display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    Raw,
    Normalized,
    Standardized,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Raw => "raw",
            Mode::Normalized => "normalized",
            Mode::Standardized => "standardized",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "raw" => Some(Mode::Raw),
            "normalized" => Some(Mode::Normalized),
            "standardized" => Some(Mode::Standardized),
            _ => None,
        }
    }

    /// Apply this transform to a value slice.
    pub fn apply(&self, values: &[f64]) -> Vec<f64> {
        match self {
            Mode::Raw => values.to_vec(),
            Mode::Normalized => normalize(values),
            Mode::Standardized => standardize(values),
        }
    }
}

/// Min-max scale to [0, 1] using the series' own extremes.
///
/// Zero-range input maps to all zeros (fixed engine policy).
pub fn normalize(values: &[f64]) -> Vec<f64> {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    if values.is_empty() || range == 0.0 {
        return vec![0.0; values.len()];
    }
    values.iter().map(|v| (v - min) / range).collect()
}

/// Scale to zero mean and unit standard deviation.
///
/// Zero-variance input maps to all zeros (fixed engine policy).
pub fn standardize(values: &[f64]) -> Vec<f64> {
    let std = match sample_std(values) {
        Some(std) if std > 0.0 => std,
        _ => return vec![0.0; values.len()],
    };
    let mean = mean(values);
    values.iter().map(|v| (v - mean) / std).collect()
}

/// Transform a series' values in place of the raw ones.
pub fn apply_mode(series: &Series, mode: Mode) -> Series {
    series.with_values(mode.apply(&series.values()))
}

/// Running total of a resampled stress series (typically after a `Sum`
/// resample of rainfall).
pub fn cumulative_sum(series: &ResampledSeries) -> ResampledSeries {
    let mut total = 0.0;
    let points = series
        .points
        .iter()
        .map(|p| {
            total += p.value;
            crate::series::SeriesPoint {
                timestamp: p.timestamp,
                value: total,
            }
        })
        .collect();
    ResampledSeries {
        points,
        ..series.clone()
    }
}

/// Cumulative departure from the series mean.
///
/// The standard rainfall-state transform: subtract the mean from each bin
/// and accumulate, so wet and dry spells show as rising and falling limbs.
pub fn cumulative_departure(series: &ResampledSeries) -> ResampledSeries {
    let values = series.values();
    if values.is_empty() {
        return series.clone();
    }
    let mean = mean(&values);
    let mut total = 0.0;
    let points = series
        .points
        .iter()
        .map(|p| {
            total += p.value - mean;
            crate::series::SeriesPoint {
                timestamp: p.timestamp,
                value: total,
            }
        })
        .collect();
    ResampledSeries {
        points,
        ..series.clone()
    }
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n-1 denominator); `None` below two points.
pub(crate) fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

/// Linearly interpolated percentile over an ascending-sorted slice.
pub(crate) fn percentile(sorted: &[f64], q: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    debug_assert!((0.0..=100.0).contains(&q));
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = q / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let weight = rank - lower as f64;
        sorted[lower] * (1.0 - weight) + sorted[upper] * weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_bounds() {
        let out = normalize(&[2.0, 4.0, 6.0, 10.0]);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[3], 1.0);
        for v in &out {
            assert!((0.0..=1.0).contains(v));
        }
    }

    #[test]
    fn test_standardize_moments() {
        let out = standardize(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let m = mean(&out);
        let s = sample_std(&out).unwrap();
        assert!(m.abs() < 1e-12);
        assert!((s - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_range_policy_emits_zeros() {
        assert_eq!(normalize(&[3.0, 3.0, 3.0]), vec![0.0, 0.0, 0.0]);
        assert_eq!(standardize(&[3.0, 3.0, 3.0]), vec![0.0, 0.0, 0.0]);
        assert_eq!(standardize(&[7.0]), vec![0.0]);
    }

    #[test]
    fn test_percentile_interpolates() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&sorted, 0.0), 1.0);
        assert_eq!(percentile(&sorted, 100.0), 4.0);
        assert_eq!(percentile(&sorted, 50.0), 2.5);
    }

    #[test]
    fn test_cumulative_departure_ends_near_zero() {
        use crate::resample::{Frequency, Statistic};
        use crate::series::{ResampledSeries, SeriesPoint};
        use chrono::TimeZone;

        let points = (0..4u32)
            .map(|i| SeriesPoint {
                timestamp: chrono::Utc.with_ymd_and_hms(2021, 1, 1 + i, 0, 0, 0).unwrap(),
                value: [2.0, 0.0, 4.0, 2.0][i as usize],
            })
            .collect();
        let series = ResampledSeries {
            sensor_id: "Rain".to_string(),
            frequency: Frequency::Daily,
            statistic: Statistic::Sum,
            points,
        };
        let dep = cumulative_departure(&series);
        // Mean is 2.0, so departures are [0, -2, 2, 0] accumulated.
        assert_eq!(dep.values(), vec![0.0, -2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_mode_round_trip() {
        for mode in [Mode::Raw, Mode::Normalized, Mode::Standardized] {
            assert_eq!(Mode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(Mode::parse("log"), None);
    }
}
