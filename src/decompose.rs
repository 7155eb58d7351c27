//! Trend/seasonal/residual decomposition of one resampled series

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::series::ResampledSeries;
use crate::transform::mean;

/// Decomposition method selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    MovingAverage,
    Stl,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::MovingAverage => "MA",
            Method::Stl => "STL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MA" => Some(Method::MovingAverage),
            "STL" => Some(Method::Stl),
            _ => None,
        }
    }
}

/// Four aligned components over one timestamp index.
///
/// `observed[i] ≈ trend[i] + seasonal[i] + residual[i]` wherever all three
/// components are defined. The moving-average method leaves trend (and so
/// residual) undefined within half a period of each edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decomposition {
    pub sensor_id: String,
    pub method: Method,
    pub period: usize,
    pub timestamps: Vec<DateTime<Utc>>,
    pub observed: Vec<f64>,
    pub trend: Vec<Option<f64>>,
    pub seasonal: Vec<Option<f64>>,
    pub residual: Vec<Option<f64>>,
}

/// Variance of each component over its defined cells, used as
/// decomposition signatures in site exports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ComponentVariances {
    pub observed: f64,
    pub trend: f64,
    pub seasonal: f64,
    pub residual: f64,
}

impl Decomposition {
    pub fn len(&self) -> usize {
        self.observed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observed.is_empty()
    }

    pub fn component_variances(&self) -> ComponentVariances {
        ComponentVariances {
            observed: population_variance(self.observed.iter().copied()),
            trend: population_variance(self.trend.iter().flatten().copied()),
            seasonal: population_variance(self.seasonal.iter().flatten().copied()),
            residual: population_variance(self.residual.iter().flatten().copied()),
        }
    }
}

fn population_variance(values: impl Iterator<Item = f64>) -> f64 {
    let collected: Vec<f64> = values.collect();
    if collected.is_empty() {
        return 0.0;
    }
    let m = mean(&collected);
    collected.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / collected.len() as f64
}

/// Decompose one series with an explicit seasonal period.
///
/// The period is always supplied by the caller (53 for weekly/annual, 365
/// for daily/annual, 13 for monthly/annual), never inferred. The input must
/// be gap-free — interpolate first, e.g. with
/// [`ResampledSeries::fill_gaps_linear`] — and at least two periods long,
/// else `InsufficientData` with no partial result.
pub fn decompose(series: &ResampledSeries, period: usize, method: Method) -> Result<Decomposition> {
    if period < 2 {
        return Err(EngineError::InvalidParameter(format!(
            "seasonal period must be at least 2, got {}",
            period
        )));
    }
    let n = series.len();
    if n < 2 * period {
        return Err(EngineError::InsufficientData {
            entity: format!("sensor {}", series.sensor_id),
            needed: 2 * period,
            actual: n,
        });
    }

    let values = series.values();
    let (trend, seasonal) = match method {
        Method::MovingAverage => moving_average_components(&values, period),
        Method::Stl => {
            let (t, s) = stl_components(&values, period);
            (
                t.into_iter().map(Some).collect::<Vec<_>>(),
                s.into_iter().map(Some).collect::<Vec<_>>(),
            )
        }
    };

    let residual = values
        .iter()
        .zip(trend.iter().zip(seasonal.iter()))
        .map(|(y, (t, s))| Some(y - (*t)? - (*s)?))
        .collect();

    Ok(Decomposition {
        sensor_id: series.sensor_id.clone(),
        method,
        period,
        timestamps: series.timestamps(),
        observed: values,
        trend,
        seasonal,
        residual,
    })
}

/// Classical decomposition: centered moving-average trend, phase-mean
/// seasonal replicated across cycles.
fn moving_average_components(
    values: &[f64],
    period: usize,
) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
    let trend = centered_moving_average(values, period);

    // Phase means of the detrended series, centered to sum to zero.
    let mut phase_sums = vec![(0.0, 0usize); period];
    for (i, (y, t)) in values.iter().zip(trend.iter()).enumerate() {
        if let Some(t) = t {
            let entry = &mut phase_sums[i % period];
            entry.0 += y - t;
            entry.1 += 1;
        }
    }
    let phase_means: Vec<Option<f64>> = phase_sums
        .iter()
        .map(|(sum, count)| (*count > 0).then(|| sum / *count as f64))
        .collect();
    let defined: Vec<f64> = phase_means.iter().flatten().copied().collect();
    let offset = if defined.is_empty() { 0.0 } else { mean(&defined) };

    let seasonal = (0..values.len())
        .map(|i| phase_means[i % period].map(|m| m - offset))
        .collect();

    (trend, seasonal)
}

/// Centered rolling mean over one period; edge bins are undefined. Even
/// periods use the standard 2×p window with half-weighted endpoints.
fn centered_moving_average(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let n = values.len();
    let mut trend = vec![None; n];
    if period % 2 == 1 {
        let half = period / 2;
        for i in half..n - half {
            let window = &values[i - half..=i + half];
            trend[i] = Some(window.iter().sum::<f64>() / period as f64);
        }
    } else {
        let half = period / 2;
        for i in half..n - half {
            let mut sum = 0.5 * values[i - half] + 0.5 * values[i + half];
            sum += values[i - half + 1..i + half].iter().sum::<f64>();
            trend[i] = Some(sum / period as f64);
        }
    }
    trend
}

// STL parameters per Cleveland et al. (1990): default seasonal smoother,
// derived trend and low-pass windows, two inner passes, non-robust.
const STL_SEASONAL_SMOOTHER: usize = 7;
const STL_INNER_PASSES: usize = 2;

/// Additive STL: cycle-subseries loess with one-period extension, 3-stage
/// low-pass, trend loess.
fn stl_components(values: &[f64], period: usize) -> (Vec<f64>, Vec<f64>) {
    let n = values.len();
    let trend_window = next_odd(
        ((1.5 * period as f64) / (1.0 - 1.5 / STL_SEASONAL_SMOOTHER as f64)).ceil() as usize,
    );
    let lowpass_window = next_odd(period);

    let mut trend = vec![0.0; n];
    let mut seasonal = vec![0.0; n];

    for _ in 0..STL_INNER_PASSES {
        let detrended: Vec<f64> = values.iter().zip(trend.iter()).map(|(y, t)| y - t).collect();

        // Cycle-subseries smoothing, extended one period at each end so the
        // low-pass filter returns to full length.
        let mut extended = vec![0.0; n + 2 * period];
        for phase in 0..period {
            let subseries: Vec<f64> = detrended
                .iter()
                .skip(phase)
                .step_by(period)
                .copied()
                .collect();
            let k = subseries.len();
            for sub_idx in 0..k {
                let smoothed = loess_point(&subseries, STL_SEASONAL_SMOOTHER, sub_idx as f64);
                extended[phase + (sub_idx + 1) * period] = smoothed;
            }
            extended[phase] = loess_point(&subseries, STL_SEASONAL_SMOOTHER, -1.0);
            extended[phase + (k + 1) * period] = loess_point(&subseries, STL_SEASONAL_SMOOTHER, k as f64);
        }

        // Low-pass: two period-length moving averages, one of length 3,
        // then a loess pass; removes any trend leaked into the subseries.
        let lowpass = {
            let ma1 = moving_average(&extended, period);
            let ma2 = moving_average(&ma1, period);
            let ma3 = moving_average(&ma2, 3);
            loess_smooth(&ma3, lowpass_window)
        };
        debug_assert_eq!(lowpass.len(), n);

        for i in 0..n {
            seasonal[i] = extended[period + i] - lowpass[i];
        }

        let deseasonalized: Vec<f64> = values
            .iter()
            .zip(seasonal.iter())
            .map(|(y, s)| y - s)
            .collect();
        trend = loess_smooth(&deseasonalized, trend_window);
    }

    (trend, seasonal)
}

fn next_odd(x: usize) -> usize {
    if x % 2 == 0 {
        x + 1
    } else {
        x
    }
}

/// Plain moving average; output length is `len - window + 1`.
fn moving_average(values: &[f64], window: usize) -> Vec<f64> {
    values
        .windows(window)
        .map(|w| w.iter().sum::<f64>() / window as f64)
        .collect()
}

/// Loess-smooth a series at every index.
fn loess_smooth(values: &[f64], window: usize) -> Vec<f64> {
    (0..values.len())
        .map(|i| loess_point(values, window, i as f64))
        .collect()
}

/// Degree-1 local regression with tricube weights over the `window`
/// nearest integer positions, evaluated at `x0` (which may lie outside the
/// data, as in the STL subseries extension).
fn loess_point(values: &[f64], window: usize, x0: f64) -> f64 {
    let n = values.len();
    if n == 1 {
        return values[0];
    }
    let w = window.min(n);

    // Integer x grid: the nearest w points form a contiguous block.
    let ideal = x0 - (w as f64 - 1.0) / 2.0;
    let start = (ideal.round().max(0.0) as usize).min(n - w);
    let block = &values[start..start + w];

    let dmax = block
        .iter()
        .enumerate()
        .map(|(j, _)| ((start + j) as f64 - x0).abs())
        .fold(0.0, f64::max);
    if dmax == 0.0 {
        return block[0];
    }

    let mut sw = 0.0;
    let mut swx = 0.0;
    let mut swy = 0.0;
    let mut swxx = 0.0;
    let mut swxy = 0.0;
    for (j, y) in block.iter().enumerate() {
        let x = (start + j) as f64;
        let weight = tricube(((x - x0).abs() / dmax).min(1.0));
        sw += weight;
        swx += weight * x;
        swy += weight * y;
        swxx += weight * x * x;
        swxy += weight * x * y;
    }

    let den = sw * swxx - swx * swx;
    if den.abs() < 1e-12 * sw.max(1.0) {
        // Degenerate neighborhood: fall back to the weighted mean.
        return swy / sw;
    }
    let slope = (sw * swxy - swx * swy) / den;
    let intercept = (swy - slope * swx) / sw;
    intercept + slope * x0
}

fn tricube(u: f64) -> f64 {
    if u >= 1.0 {
        return 0.0;
    }
    let a = 1.0 - u * u * u;
    a * a * a
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resample::{Frequency, Statistic};
    use crate::series::SeriesPoint;
    use chrono::TimeZone;

    const PERIOD: usize = 12;

    fn monthly_series(values: &[f64]) -> ResampledSeries {
        let start = Utc.with_ymd_and_hms(2015, 1, 1, 0, 0, 0).unwrap();
        let mut t = start;
        let points = values
            .iter()
            .map(|&value| {
                let point = SeriesPoint {
                    timestamp: t,
                    value,
                };
                t = Frequency::Monthly.advance(t);
                point
            })
            .collect();
        ResampledSeries {
            sensor_id: "BH-01".to_string(),
            frequency: Frequency::Monthly,
            statistic: Statistic::Median,
            points,
        }
    }

    /// Slow ramp plus a period-12 sine: both methods should recover it.
    fn seasonal_signal(cycles: usize) -> Vec<f64> {
        (0..cycles * PERIOD)
            .map(|i| {
                let phase = 2.0 * std::f64::consts::PI * (i % PERIOD) as f64 / PERIOD as f64;
                10.0 + 0.02 * i as f64 + 1.5 * phase.sin()
            })
            .collect()
    }

    #[test]
    fn test_too_short_fails_without_partial_result() {
        let series = monthly_series(&seasonal_signal(4)[..20]);
        let err = decompose(&series, PERIOD, Method::MovingAverage).unwrap_err();
        match err {
            EngineError::InsufficientData { needed, actual, .. } => {
                assert_eq!(needed, 24);
                assert_eq!(actual, 20);
            }
            other => panic!("expected InsufficientData, got {:?}", other),
        }
    }

    #[test]
    fn test_ma_reconstruction_on_interior() {
        let series = monthly_series(&seasonal_signal(5));
        let d = decompose(&series, PERIOD, Method::MovingAverage).unwrap();
        let mut interior = 0;
        for i in 0..d.len() {
            if let (Some(t), Some(s), Some(r)) = (d.trend[i], d.seasonal[i], d.residual[i]) {
                interior += 1;
                assert!((d.observed[i] - (t + s + r)).abs() < 1e-9);
            }
        }
        assert!(interior > 0);
    }

    #[test]
    fn test_ma_edges_undefined() {
        let series = monthly_series(&seasonal_signal(5));
        let d = decompose(&series, PERIOD, Method::MovingAverage).unwrap();
        // Even period: half a 2×p window at each edge has no trend.
        assert!(d.trend[0].is_none());
        assert!(d.trend[d.len() - 1].is_none());
        assert!(d.trend[PERIOD / 2].is_some());
    }

    #[test]
    fn test_stl_reconstruction_everywhere() {
        let series = monthly_series(&seasonal_signal(5));
        let d = decompose(&series, PERIOD, Method::Stl).unwrap();
        for i in 0..d.len() {
            let t = d.trend[i].unwrap();
            let s = d.seasonal[i].unwrap();
            let r = d.residual[i].unwrap();
            assert!((d.observed[i] - (t + s + r)).abs() < 1e-9);
        }
    }

    #[test]
    fn test_stl_finds_the_seasonal_cycle() {
        let series = monthly_series(&seasonal_signal(6));
        let d = decompose(&series, PERIOD, Method::Stl).unwrap();
        // The seasonal component should carry most of the sine's variance
        // and the residual should be small.
        let v = d.component_variances();
        assert!(
            v.seasonal > 0.5,
            "seasonal variance too small: {}",
            v.seasonal
        );
        assert!(
            v.residual < 0.2 * v.seasonal,
            "residual {} vs seasonal {}",
            v.residual,
            v.seasonal
        );
    }

    #[test]
    fn test_ma_seasonal_is_phase_periodic() {
        let series = monthly_series(&seasonal_signal(5));
        let d = decompose(&series, PERIOD, Method::MovingAverage).unwrap();
        for i in 0..PERIOD {
            let a = d.seasonal[i].unwrap();
            let b = d.seasonal[i + PERIOD].unwrap();
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_invalid_period_rejected() {
        let series = monthly_series(&seasonal_signal(5));
        assert!(matches!(
            decompose(&series, 1, Method::Stl),
            Err(EngineError::InvalidParameter(_))
        ));
    }
}
