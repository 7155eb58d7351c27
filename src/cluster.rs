//! DTW distances and agglomerative clustering of sensors

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Sender;

use crate::error::{EngineError, Result};
use crate::progress::{report, BatchStage, ProgressEvent};
use crate::resample::{resample, Frequency, Statistic};
use crate::series::{ResampledSeries, Series};
use crate::transform::{apply_mode, Mode};

/// Dynamic Time Warping distance: minimal cumulative absolute-difference
/// cost over all monotonic, boundary-anchored alignments.
///
/// `band` is a Sakoe-Chiba half-width in grid steps; `None` means the full
/// warping window. A band narrower than the length difference between the
/// sequences admits no alignment, so it is widened to that difference.
/// Two empty sequences are at distance zero; an empty sequence is
/// infinitely far from a non-empty one.
pub fn dtw_distance(a: &[f64], b: &[f64], band: Option<usize>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    if a.is_empty() || b.is_empty() {
        return f64::INFINITY;
    }

    let (la, lb) = (a.len(), b.len());
    let band = band.map(|w| w.max(la.abs_diff(lb)));

    let mut prev = vec![f64::INFINITY; lb];
    let mut curr = vec![f64::INFINITY; lb];
    for i in 0..la {
        let (j_lo, j_hi) = match band {
            Some(w) => (i.saturating_sub(w), (i + w).min(lb - 1)),
            None => (0, lb - 1),
        };
        for v in curr.iter_mut() {
            *v = f64::INFINITY;
        }
        for j in j_lo..=j_hi {
            let step = if i == 0 && j == 0 {
                0.0
            } else {
                let mut best = f64::INFINITY;
                if i > 0 {
                    best = best.min(prev[j]);
                }
                if j > 0 {
                    best = best.min(curr[j - 1]);
                }
                if i > 0 && j > 0 {
                    best = best.min(prev[j - 1]);
                }
                best
            };
            curr[j] = (a[i] - b[j]).abs() + step;
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[lb - 1]
}

/// Parameters of one clustering request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRequest {
    pub mode: Mode,
    pub k: usize,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub frequency: Frequency,
    pub statistic: Statistic,
    /// Sakoe-Chiba half-width; `None` keeps the full warping window.
    pub dtw_band: Option<usize>,
}

/// Result of a clustering request.
///
/// Every eligible sensor carries exactly one group in `[1, k]`, numbered
/// without gaps. Each group has one representative: the medoid, the member
/// with minimal mean intra-group DTW distance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub groups: BTreeMap<String, usize>,
    pub representatives: BTreeMap<usize, ResampledSeries>,
    /// Sensors with no observations inside the date window. Reported, not
    /// failed.
    pub excluded: Vec<String>,
}

impl ClusterAssignment {
    pub fn group_count(&self) -> usize {
        self.representatives.len()
    }

    pub fn members(&self, group: usize) -> Vec<&str> {
        self.groups
            .iter()
            .filter(|(_, g)| **g == group)
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

/// Cluster sensors by elastic similarity of their (windowed, transformed,
/// resampled) series.
///
/// Identical inputs always yield the identical assignment: ties in the
/// linkage and medoid selection break toward the smallest sensor index,
/// and there is no randomness anywhere.
pub fn dtw_cluster(
    series: &BTreeMap<String, Series>,
    request: &ClusterRequest,
    progress: Option<&Sender<ProgressEvent>>,
) -> Result<ClusterAssignment> {
    // Window, transform, resample; sensors empty in the window are set
    // aside rather than failing the request.
    let mut eligible: Vec<ResampledSeries> = Vec::new();
    let mut excluded: Vec<String> = Vec::new();
    for (sensor_id, s) in series {
        let windowed = s.window(request.start, request.end);
        if windowed.is_empty() {
            excluded.push(sensor_id.clone());
            continue;
        }
        let transformed = apply_mode(&windowed, request.mode);
        let resampled = resample(&transformed, request.frequency, request.statistic);
        if resampled.is_empty() {
            excluded.push(sensor_id.clone());
        } else {
            eligible.push(resampled);
        }
    }

    if request.k == 0 {
        return Err(EngineError::InvalidParameter(
            "cluster count k must be at least 1".to_string(),
        ));
    }
    if request.k > eligible.len() {
        return Err(EngineError::InvalidParameter(format!(
            "k={} exceeds the {} sensors eligible in the window",
            request.k,
            eligible.len()
        )));
    }

    let distances = pairwise_distances(&eligible, request.dtw_band, progress);
    let clusters = average_linkage(&distances, request.k);

    log::info!(
        "clustered {} sensors into {} groups ({} excluded)",
        eligible.len(),
        request.k,
        excluded.len()
    );

    // Groups are numbered 1..=k by their smallest member index, which is
    // deterministic because the input map iterates in key order.
    let mut groups = BTreeMap::new();
    let mut representatives = BTreeMap::new();
    for (group_idx, members) in clusters.iter().enumerate() {
        let group = group_idx + 1;
        for &m in members {
            groups.insert(eligible[m].sensor_id.clone(), group);
        }
        let medoid = medoid_of(members, &distances);
        representatives.insert(group, eligible[medoid].clone());
    }

    Ok(ClusterAssignment {
        groups,
        representatives,
        excluded,
    })
}

/// Full symmetric DTW distance matrix over the eligible sensors.
///
/// Pairs are independent and fan out across threads; each pair writes a
/// disjoint cell and the matrix is only used once all pairs are done.
fn pairwise_distances(
    eligible: &[ResampledSeries],
    band: Option<usize>,
    progress: Option<&Sender<ProgressEvent>>,
) -> Vec<Vec<f64>> {
    let s = eligible.len();
    let values: Vec<Vec<f64>> = eligible.iter().map(|r| r.values()).collect();

    let pairs: Vec<(usize, usize)> = (0..s)
        .flat_map(|i| (i + 1..s).map(move |j| (i, j)))
        .collect();
    let total = pairs.len();
    let done = AtomicUsize::new(0);

    let computed: Vec<(usize, usize, f64)> = pairs
        .par_iter()
        .map(|&(i, j)| {
            let d = dtw_distance(&values[i], &values[j], band);
            let completed = done.fetch_add(1, Ordering::Relaxed) + 1;
            report(progress, BatchStage::DtwPairs, completed, total);
            (i, j, d)
        })
        .collect();

    let mut matrix = vec![vec![0.0; s]; s];
    for (i, j, d) in computed {
        matrix[i][j] = d;
        matrix[j][i] = d;
    }
    matrix
}

/// Agglomerative average-linkage partition into `k` clusters.
///
/// Lance-Williams update for the average linkage; merge ties break toward
/// the smallest pair of cluster indices. Returned clusters are ordered by
/// smallest member, members ascending.
fn average_linkage(distances: &[Vec<f64>], k: usize) -> Vec<Vec<usize>> {
    let s = distances.len();
    let mut members: Vec<Vec<usize>> = (0..s).map(|i| vec![i]).collect();
    let mut linkage: Vec<Vec<f64>> = distances.to_vec();
    let mut active: Vec<usize> = (0..s).collect();

    while active.len() > k {
        let mut best = (f64::INFINITY, 0usize, 0usize);
        for (ai, &a) in active.iter().enumerate() {
            for &b in &active[ai + 1..] {
                let d = linkage[a][b];
                if d < best.0 {
                    best = (d, a, b);
                }
            }
        }
        let (_, a, b) = best;

        // Average-linkage update of every remaining cluster against the
        // merged one.
        let (na, nb) = (members[a].len() as f64, members[b].len() as f64);
        for &other in &active {
            if other == a || other == b {
                continue;
            }
            let d = (na * linkage[a][other] + nb * linkage[b][other]) / (na + nb);
            linkage[a][other] = d;
            linkage[other][a] = d;
        }

        let absorbed = std::mem::take(&mut members[b]);
        members[a].extend(absorbed);
        members[a].sort_unstable();
        active.retain(|&c| c != b);
    }

    let mut clusters: Vec<Vec<usize>> = active.into_iter().map(|a| members[a].clone()).collect();
    clusters.sort_by_key(|c| c[0]);
    clusters
}

/// Member with minimal mean distance to the rest of its cluster.
fn medoid_of(members: &[usize], distances: &[Vec<f64>]) -> usize {
    let mut best = (f64::INFINITY, members[0]);
    for &m in members {
        let total: f64 = members.iter().map(|&o| distances[m][o]).sum();
        let mean = total / members.len() as f64;
        if mean < best.0 {
            best = (mean, m);
        }
    }
    best.1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::Observation;
    use chrono::TimeZone;

    fn day(i: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::days(i)
    }

    fn daily_series(sensor_id: &str, values: &[f64]) -> Series {
        Series::new(
            sensor_id,
            values
                .iter()
                .enumerate()
                .map(|(i, &value)| Observation {
                    timestamp: day(i as i64),
                    value,
                    threshold: None,
                })
                .collect(),
        )
    }

    fn request(k: usize) -> ClusterRequest {
        ClusterRequest {
            mode: Mode::Raw,
            k,
            start: day(0),
            end: day(400),
            frequency: Frequency::Daily,
            statistic: Statistic::Mean,
            dtw_band: None,
        }
    }

    fn sine(n: usize, period: f64, amplitude: f64) -> Vec<f64> {
        (0..n)
            .map(|i| amplitude * (2.0 * std::f64::consts::PI * i as f64 / period).sin())
            .collect()
    }

    #[test]
    fn test_dtw_identity_and_symmetry() {
        let a = sine(40, 12.0, 1.0);
        let b: Vec<f64> = sine(40, 12.0, 1.0).iter().map(|v| v + 0.3).collect();
        assert_eq!(dtw_distance(&a, &a, None), 0.0);
        assert_eq!(dtw_distance(&a, &b, None), dtw_distance(&b, &a, None));
    }

    #[test]
    fn test_dtw_padding_sanity_property() {
        // Identical padding on both ends of both sequences leaves the
        // distance unchanged (sanity property, not a metric guarantee).
        let a = vec![1.0, 2.0, 3.0, 2.0];
        let b = vec![2.0, 3.0, 4.0, 3.0];
        let base = dtw_distance(&a, &b, None);

        let pad = |xs: &[f64]| {
            let mut padded = vec![9.0, 9.0];
            padded.extend_from_slice(xs);
            padded.extend_from_slice(&[9.0, 9.0]);
            padded
        };
        assert_eq!(dtw_distance(&pad(&a), &pad(&b), None), base);
    }

    #[test]
    fn test_dtw_warps_over_a_shift() {
        // A shifted copy is much closer under DTW than pointwise.
        let a = sine(60, 20.0, 1.0);
        let mut b = vec![0.0; 3];
        b.extend_from_slice(&a[..57]);
        let dtw = dtw_distance(&a, &b, None);
        let pointwise: f64 = a.iter().zip(&b).map(|(x, y)| (x - y).abs()).sum();
        assert!(dtw < 0.5 * pointwise);
    }

    #[test]
    fn test_band_widens_to_length_difference() {
        let a = sine(30, 10.0, 1.0);
        let b = sine(50, 10.0, 1.0);
        let d = dtw_distance(&a, &b, Some(0));
        assert!(d.is_finite());
    }

    #[test]
    fn test_twin_sine_sensors_share_a_cluster() {
        // Scenario A: two identical period-12 sines are at DTW distance 0
        // and always land in the same group.
        let twin = sine(48, 12.0, 1.0);
        let mut map = BTreeMap::new();
        map.insert("BH-01".to_string(), daily_series("BH-01", &twin));
        map.insert("BH-02".to_string(), daily_series("BH-02", &twin));
        let offset: Vec<f64> = twin.iter().map(|v| v + 10.0).collect();
        map.insert("BH-03".to_string(), daily_series("BH-03", &offset));

        assert_eq!(dtw_distance(&twin, &twin, None), 0.0);
        for k in 1..=2 {
            let assignment = dtw_cluster(&map, &request(k), None).unwrap();
            assert_eq!(
                assignment.groups["BH-01"], assignment.groups["BH-02"],
                "k={}",
                k
            );
        }
    }

    #[test]
    fn test_k1_and_k_eq_sensor_count() {
        let mut map = BTreeMap::new();
        map.insert("BH-01".to_string(), daily_series("BH-01", &sine(30, 6.0, 1.0)));
        map.insert("BH-02".to_string(), daily_series("BH-02", &sine(30, 15.0, 2.0)));
        map.insert("BH-03".to_string(), daily_series("BH-03", &[5.0; 30]));

        let all_in_one = dtw_cluster(&map, &request(1), None).unwrap();
        assert!(all_in_one.groups.values().all(|&g| g == 1));
        assert_eq!(all_in_one.group_count(), 1);

        let singletons = dtw_cluster(&map, &request(3), None).unwrap();
        let mut groups: Vec<usize> = singletons.groups.values().copied().collect();
        groups.sort_unstable();
        assert_eq!(groups, vec![1, 2, 3]);
    }

    #[test]
    fn test_groups_numbered_without_gaps() {
        let mut map = BTreeMap::new();
        for i in 0..5 {
            let id = format!("BH-0{}", i + 1);
            let values = sine(40, 8.0 + i as f64 * 7.0, 1.0 + i as f64);
            map.insert(id.clone(), daily_series(&id, &values));
        }
        let assignment = dtw_cluster(&map, &request(3), None).unwrap();
        let mut seen: Vec<usize> = assignment.groups.values().copied().collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(assignment.representatives.len(), 3);
    }

    #[test]
    fn test_empty_window_sensor_excluded_not_failed() {
        let mut map = BTreeMap::new();
        map.insert("BH-01".to_string(), daily_series("BH-01", &sine(30, 6.0, 1.0)));
        map.insert("BH-02".to_string(), daily_series("BH-02", &sine(30, 9.0, 1.0)));
        // All observations after the window.
        let late = Series::new(
            "BH-03",
            vec![Observation {
                timestamp: day(500),
                value: 1.0,
                threshold: None,
            }],
        );
        map.insert("BH-03".to_string(), late);

        let assignment = dtw_cluster(&map, &request(2), None).unwrap();
        assert_eq!(assignment.excluded, vec!["BH-03".to_string()]);
        assert!(!assignment.groups.contains_key("BH-03"));
    }

    #[test]
    fn test_k_exceeding_eligible_is_invalid_parameter() {
        let mut map = BTreeMap::new();
        map.insert("BH-01".to_string(), daily_series("BH-01", &sine(30, 6.0, 1.0)));
        let err = dtw_cluster(&map, &request(2), None).unwrap_err();
        assert!(matches!(err, EngineError::InvalidParameter(_)));
    }

    #[test]
    fn test_identical_requests_identical_assignments() {
        let mut map = BTreeMap::new();
        for i in 0..6 {
            let id = format!("BH-0{}", i + 1);
            let values = sine(50, 5.0 + i as f64 * 4.0, 1.5);
            map.insert(id.clone(), daily_series(&id, &values));
        }
        let first = dtw_cluster(&map, &request(3), None).unwrap();
        let second = dtw_cluster(&map, &request(3), None).unwrap();
        assert_eq!(first.groups, second.groups);
        let first_medoids: Vec<&String> = first
            .representatives
            .values()
            .map(|r| &r.sensor_id)
            .collect();
        let second_medoids: Vec<&String> = second
            .representatives
            .values()
            .map(|r| &r.sensor_id)
            .collect();
        assert_eq!(first_medoids, second_medoids);
    }

    #[test]
    fn test_standardized_mode_clusters_by_shape_not_level() {
        // Same shape at very different levels: standardization should put
        // the two shape-twins together against the third sensor.
        let shape = sine(40, 10.0, 1.0);
        let scaled: Vec<f64> = shape.iter().map(|v| 100.0 + 50.0 * v).collect();
        let other: Vec<f64> = (0..40).map(|i| i as f64 * 0.6).collect();

        let mut map = BTreeMap::new();
        map.insert("BH-01".to_string(), daily_series("BH-01", &shape));
        map.insert("BH-02".to_string(), daily_series("BH-02", &scaled));
        map.insert("BH-03".to_string(), daily_series("BH-03", &other));

        let mut req = request(2);
        req.mode = Mode::Standardized;
        let assignment = dtw_cluster(&map, &req, None).unwrap();
        assert_eq!(assignment.groups["BH-01"], assignment.groups["BH-02"]);
        assert_ne!(assignment.groups["BH-01"], assignment.groups["BH-03"]);
    }
}
