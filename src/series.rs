//! Core data model: raw ingestion records, per-sensor series, resampled series

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{EngineError, Result};
use crate::resample::{Frequency, Statistic};
use crate::transform::{percentile, sample_std};

/// One raw reading as delivered by the ingestion collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    /// Optional secondary threshold level carried alongside the reading.
    #[serde(default)]
    pub threshold: Option<f64>,
}

/// Sensor metadata table row. Passed explicitly where needed, never held as
/// ambient shared state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorMeta {
    pub sensor_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// External stress table row (e.g. rainfall).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StressRecord {
    pub stress_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub unit: String,
}

/// One observation within a series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub threshold: Option<f64>,
}

/// Ordered sequence of observations for one sensor.
///
/// Sorted ascending by timestamp on construction; duplicate timestamps are
/// permitted here and collapsed by the resampler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Series {
    pub sensor_id: String,
    observations: Vec<Observation>,
}

impl Series {
    pub fn new(sensor_id: impl Into<String>, mut observations: Vec<Observation>) -> Self {
        observations.sort_by_key(|o| o.timestamp);
        Self {
            sensor_id: sensor_id.into(),
            observations,
        }
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn values(&self) -> Vec<f64> {
        self.observations.iter().map(|o| o.value).collect()
    }

    /// Restrict to observations with `start <= timestamp <= end`.
    pub fn window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Series {
        let observations = self
            .observations
            .iter()
            .filter(|o| o.timestamp >= start && o.timestamp <= end)
            .copied()
            .collect();
        Series {
            sensor_id: self.sensor_id.clone(),
            observations,
        }
    }

    /// Replace values in place of the existing ones, keeping timestamps.
    ///
    /// Used by the per-series transforms; `values` must match the series
    /// length.
    pub fn with_values(&self, values: Vec<f64>) -> Series {
        debug_assert_eq!(values.len(), self.observations.len());
        let observations = self
            .observations
            .iter()
            .zip(values)
            .map(|(o, value)| Observation { value, ..*o })
            .collect();
        Series {
            sensor_id: self.sensor_id.clone(),
            observations,
        }
    }
}

/// Group raw observation records into per-sensor series.
pub fn build_series(records: &[ObservationRecord]) -> BTreeMap<String, Series> {
    let mut grouped: BTreeMap<String, Vec<Observation>> = BTreeMap::new();
    for record in records {
        grouped
            .entry(record.sensor_id.clone())
            .or_default()
            .push(Observation {
                timestamp: record.timestamp,
                value: record.value,
                threshold: record.threshold,
            });
    }
    grouped
        .into_iter()
        .map(|(sensor_id, obs)| {
            let series = Series::new(sensor_id.clone(), obs);
            (sensor_id, series)
        })
        .collect()
}

/// Group stress records into per-stress series.
pub fn build_stress_series(records: &[StressRecord]) -> BTreeMap<String, Series> {
    let mut grouped: BTreeMap<String, Vec<Observation>> = BTreeMap::new();
    for record in records {
        grouped
            .entry(record.stress_id.clone())
            .or_default()
            .push(Observation {
                timestamp: record.timestamp,
                value: record.value,
                threshold: None,
            });
    }
    grouped
        .into_iter()
        .map(|(stress_id, obs)| {
            let series = Series::new(stress_id.clone(), obs);
            (stress_id, series)
        })
        .collect()
}

/// Look up a series by key, failing with `MissingKey` when absent.
pub fn series_for<'a>(map: &'a BTreeMap<String, Series>, key: &str) -> Result<&'a Series> {
    map.get(key).ok_or_else(|| EngineError::MissingKey {
        key: key.to_string(),
    })
}

/// One point on a fixed-frequency grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// A series re-expressed on a calendar-aligned, fixed-frequency grid.
///
/// Invariant: timestamps are strictly increasing, unique, and grid-aligned
/// to `frequency`. Bins with no contributing observations are absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResampledSeries {
    pub sensor_id: String,
    pub frequency: Frequency,
    pub statistic: Statistic,
    pub points: Vec<SeriesPoint>,
}

impl ResampledSeries {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.points.iter().map(|p| p.timestamp).collect()
    }

    /// Fill absent interior bins by linear interpolation in time.
    ///
    /// Walks the full grid between the first and last present bin and
    /// interpolates each missing bin between its nearest present
    /// neighbours. Leading/trailing coverage is unchanged. `Raw` series
    /// have no grid and are returned as-is.
    pub fn fill_gaps_linear(&self) -> ResampledSeries {
        if self.frequency == Frequency::Raw || self.points.len() < 2 {
            return self.clone();
        }

        let mut filled = Vec::with_capacity(self.points.len());
        filled.push(self.points[0]);

        for pair in self.points.windows(2) {
            let (prev, next) = (pair[0], pair[1]);
            let mut expected = self.frequency.advance(prev.timestamp);
            while expected < next.timestamp {
                let span = (next.timestamp - prev.timestamp).num_seconds() as f64;
                let offset = (expected - prev.timestamp).num_seconds() as f64;
                let value = prev.value + (next.value - prev.value) * (offset / span);
                filled.push(SeriesPoint {
                    timestamp: expected,
                    value,
                });
                expected = self.frequency.advance(expected);
            }
            filled.push(next);
        }

        ResampledSeries {
            sensor_id: self.sensor_id.clone(),
            frequency: self.frequency,
            statistic: self.statistic,
            points: filled,
        }
    }
}

/// Per-sensor summary over a date window, as exported alongside metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryStats {
    pub count: usize,
    pub mean: f64,
    pub std: Option<f64>,
    pub min: f64,
    pub q25: f64,
    pub median: f64,
    pub q75: f64,
    pub max: f64,
}

impl SummaryStats {
    pub fn from_values(values: &[f64]) -> Option<SummaryStats> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).expect("finite values"));
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        Some(SummaryStats {
            count: values.len(),
            mean,
            std: sample_std(values),
            min: sorted[0],
            q25: percentile(&sorted, 25.0),
            median: percentile(&sorted, 50.0),
            q75: percentile(&sorted, 75.0),
            max: sorted[sorted.len() - 1],
        })
    }
}
