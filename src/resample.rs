//! Calendar-aligned resampling of irregular series onto fixed-frequency grids

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, Timelike, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Sender;

use crate::progress::{report, BatchStage, ProgressEvent};
use crate::series::{ResampledSeries, Series, SeriesPoint};
use crate::transform::percentile;

/// Target resample frequency. `Raw` is a passthrough that only collapses
/// exact-duplicate timestamps so the grid invariant still holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frequency {
    Raw,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Raw => "Raw",
            Frequency::Hourly => "H",
            Frequency::Daily => "D",
            Frequency::Weekly => "W",
            Frequency::Monthly => "M",
            Frequency::Yearly => "Y",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Raw" => Some(Frequency::Raw),
            "H" => Some(Frequency::Hourly),
            "D" => Some(Frequency::Daily),
            "W" => Some(Frequency::Weekly),
            "M" => Some(Frequency::Monthly),
            "Y" => Some(Frequency::Yearly),
            _ => None,
        }
    }

    pub fn all() -> [Frequency; 6] {
        [
            Frequency::Raw,
            Frequency::Hourly,
            Frequency::Daily,
            Frequency::Weekly,
            Frequency::Monthly,
            Frequency::Yearly,
        ]
    }

    /// Bins per seasonal cycle (annual; diurnal for hourly data), as
    /// supplied to the seasonal decomposer.
    pub fn seasonal_period(&self) -> Option<usize> {
        match self {
            Frequency::Hourly => Some(24),
            Frequency::Daily => Some(365),
            Frequency::Weekly => Some(53),
            Frequency::Monthly => Some(13),
            Frequency::Raw | Frequency::Yearly => None,
        }
    }

    /// Default half-range for the lag-correlation sweep, in grid steps.
    pub fn default_lag_range(&self) -> Option<usize> {
        match self {
            Frequency::Daily => Some(182),
            Frequency::Weekly => Some(48),
            Frequency::Monthly => Some(11),
            _ => None,
        }
    }

    /// Start of the calendar bin containing `ts`.
    ///
    /// Weeks start Monday, months on the 1st, years on Jan 1, all at
    /// 00:00 UTC. The bin label is the bin start.
    pub fn bin_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let date = ts.date_naive();
        match self {
            Frequency::Raw => ts,
            Frequency::Hourly => {
                let naive = date
                    .and_hms_opt(ts.hour(), 0, 0)
                    .expect("hour start exists");
                naive.and_utc()
            }
            Frequency::Daily => midnight(date),
            Frequency::Weekly => {
                let monday = date - Days::new(u64::from(date.weekday().num_days_from_monday()));
                midnight(monday)
            }
            Frequency::Monthly => {
                let first = NaiveDate::from_ymd_opt(date.year(), date.month(), 1)
                    .expect("first of month exists");
                midnight(first)
            }
            Frequency::Yearly => {
                let jan1 = NaiveDate::from_ymd_opt(date.year(), 1, 1).expect("Jan 1 exists");
                midnight(jan1)
            }
        }
    }

    /// Move a grid timestamp by a signed number of bins.
    ///
    /// `Raw` has no grid and returns the timestamp unchanged.
    pub fn shift(&self, bin: DateTime<Utc>, steps: i64) -> DateTime<Utc> {
        match self {
            Frequency::Raw => bin,
            Frequency::Hourly => bin + chrono::Duration::hours(steps),
            Frequency::Daily => bin + chrono::Duration::days(steps),
            Frequency::Weekly => bin + chrono::Duration::days(7 * steps),
            Frequency::Monthly => shift_months(bin, steps),
            Frequency::Yearly => shift_months(bin, steps * 12),
        }
    }

    /// Start of the bin after the one beginning at `bin`.
    pub fn advance(&self, bin: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Frequency::Raw => bin,
            Frequency::Hourly => bin + chrono::Duration::hours(1),
            Frequency::Daily => bin + chrono::Duration::days(1),
            Frequency::Weekly => bin + chrono::Duration::days(7),
            Frequency::Monthly => bin
                .checked_add_months(Months::new(1))
                .expect("date in range"),
            Frequency::Yearly => bin
                .checked_add_months(Months::new(12))
                .expect("date in range"),
        }
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0).expect("midnight exists").and_utc()
}

fn shift_months(bin: DateTime<Utc>, months: i64) -> DateTime<Utc> {
    let shifted = if months >= 0 {
        bin.checked_add_months(Months::new(months as u32))
    } else {
        bin.checked_sub_months(Months::new((-months) as u32))
    };
    shifted.expect("date in range")
}

/// Aggregation statistic applied to the observations within a bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Statistic {
    Mean,
    Median,
    Min,
    Max,
    Sum,
}

impl Statistic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Statistic::Mean => "mean",
            Statistic::Median => "median",
            Statistic::Min => "min",
            Statistic::Max => "max",
            Statistic::Sum => "sum",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mean" => Some(Statistic::Mean),
            "median" => Some(Statistic::Median),
            "min" => Some(Statistic::Min),
            "max" => Some(Statistic::Max),
            "sum" => Some(Statistic::Sum),
            _ => None,
        }
    }

    /// Aggregate a non-empty bin.
    fn aggregate(&self, values: &mut Vec<f64>) -> f64 {
        match self {
            Statistic::Mean => values.iter().sum::<f64>() / values.len() as f64,
            Statistic::Median => {
                values.sort_by(|a, b| a.partial_cmp(b).expect("finite values"));
                percentile(values, 50.0)
            }
            Statistic::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Statistic::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Statistic::Sum => values.iter().sum(),
        }
    }
}

/// Bin one series onto the calendar grid of `frequency`.
///
/// Observations sharing a bin (including duplicate timestamps) are
/// aggregated with `statistic`. Bins with no observations are absent from
/// the output. An empty input yields an empty output.
pub fn resample(series: &Series, frequency: Frequency, statistic: Statistic) -> ResampledSeries {
    let mut bins: BTreeMap<DateTime<Utc>, Vec<f64>> = BTreeMap::new();
    for obs in series.observations() {
        bins.entry(frequency.bin_start(obs.timestamp))
            .or_default()
            .push(obs.value);
    }

    let points = bins
        .into_iter()
        .map(|(timestamp, mut values)| SeriesPoint {
            timestamp,
            value: statistic.aggregate(&mut values),
        })
        .collect();

    ResampledSeries {
        sensor_id: series.sensor_id.clone(),
        frequency,
        statistic,
        points,
    }
}

/// Resample every series in a keyed set.
///
/// Keys are independent, so the work fans out across threads; the returned
/// map is only assembled once every series has been binned. Completion of
/// each series is reported on `progress`.
pub fn resample_all(
    series: &BTreeMap<String, Series>,
    frequency: Frequency,
    statistic: Statistic,
    progress: Option<&Sender<ProgressEvent>>,
) -> BTreeMap<String, ResampledSeries> {
    let total = series.len();
    let done = AtomicUsize::new(0);

    let resampled: Vec<(String, ResampledSeries)> = series
        .par_iter()
        .map(|(key, s)| {
            let out = resample(s, frequency, statistic);
            let completed = done.fetch_add(1, Ordering::Relaxed) + 1;
            report(progress, BatchStage::Resample, completed, total);
            (key.clone(), out)
        })
        .collect();

    log::debug!(
        "resampled {} series to {}/{}",
        total,
        frequency.as_str(),
        statistic.as_str()
    );

    resampled.into_iter().collect()
}
