//! Delimited tabular views of engine results for the presentation layer

use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Write};

use crate::cluster::ClusterAssignment;
use crate::decompose::{ComponentVariances, Decomposition};
use crate::lagcorr::LagCorrelationTable;
use crate::series::{ResampledSeries, SensorMeta, SummaryStats};
use crate::signatures::SignatureMatrix;

/// A materialized result table: one header row plus string cells.
///
/// Timestamps are ISO-8601, floats are shortest-round-trip (full
/// precision), missing cells are empty strings.
#[derive(Debug, Clone, Serialize)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Render as delimited text, one record per line.
    pub fn to_delimited(&self, delimiter: char) -> String {
        let mut out = String::new();
        push_record(&mut out, &self.headers, delimiter);
        for row in &self.rows {
            push_record(&mut out, row, delimiter);
        }
        out
    }

    pub fn write_delimited<W: Write>(&self, writer: &mut W, delimiter: char) -> io::Result<()> {
        writer.write_all(self.to_delimited(delimiter).as_bytes())
    }
}

fn push_record(out: &mut String, cells: &[String], delimiter: char) {
    for (i, cell) in cells.iter().enumerate() {
        if i > 0 {
            out.push(delimiter);
        }
        out.push_str(&escape(cell, delimiter));
    }
    out.push('\n');
}

/// Quote a field that contains the delimiter, a quote, or a newline.
fn escape(cell: &str, delimiter: char) -> String {
    if cell.contains(delimiter) || cell.contains('"') || cell.contains('\n') {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

fn fmt_float(v: f64) -> String {
    format!("{}", v)
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(fmt_float).unwrap_or_default()
}

/// Long-format table of resampled series: one row per (sensor, bin).
pub fn resampled_table(series: &[&ResampledSeries]) -> Table {
    let headers = vec![
        "sensor_id".to_string(),
        "timestamp".to_string(),
        "value".to_string(),
    ];
    let mut rows = Vec::new();
    for s in series {
        for p in &s.points {
            rows.push(vec![
                s.sensor_id.clone(),
                p.timestamp.to_rfc3339(),
                fmt_float(p.value),
            ]);
        }
    }
    Table { headers, rows }
}

/// One row per sensor, one column per descriptor.
pub fn signature_table(matrix: &SignatureMatrix) -> Table {
    let mut headers = vec!["sensor_id".to_string()];
    headers.extend(matrix.descriptors().iter().map(|d| d.to_string()));

    let rows = matrix
        .sensors()
        .iter()
        .map(|sensor_id| {
            let mut row = vec![sensor_id.to_string()];
            let cells = matrix.row(sensor_id).expect("sensor listed by the matrix");
            row.extend(cells.iter().map(|c| fmt_opt(*c)));
            row
        })
        .collect();

    Table { headers, rows }
}

/// The four aligned components of one decomposition.
pub fn decomposition_table(d: &Decomposition) -> Table {
    let headers = vec![
        "sensor_id".to_string(),
        "timestamp".to_string(),
        "observed".to_string(),
        "trend".to_string(),
        "seasonal".to_string(),
        "residual".to_string(),
    ];
    let rows = (0..d.len())
        .map(|i| {
            vec![
                d.sensor_id.clone(),
                d.timestamps[i].to_rfc3339(),
                fmt_float(d.observed[i]),
                fmt_opt(d.trend[i]),
                fmt_opt(d.seasonal[i]),
                fmt_opt(d.residual[i]),
            ]
        })
        .collect();
    Table { headers, rows }
}

/// Group membership per sensor; excluded sensors keep an empty group cell.
pub fn cluster_table(assignment: &ClusterAssignment) -> Table {
    let headers = vec![
        "sensor_id".to_string(),
        "group".to_string(),
        "is_representative".to_string(),
    ];
    let mut rows: Vec<Vec<String>> = assignment
        .groups
        .iter()
        .map(|(sensor_id, group)| {
            let is_medoid = assignment
                .representatives
                .get(group)
                .map(|r| &r.sensor_id == sensor_id)
                .unwrap_or(false);
            vec![
                sensor_id.clone(),
                group.to_string(),
                if is_medoid { "true" } else { "false" }.to_string(),
            ]
        })
        .collect();
    for sensor_id in &assignment.excluded {
        rows.push(vec![sensor_id.clone(), String::new(), "false".to_string()]);
    }
    Table { headers, rows }
}

/// Lag sweep rows, ascending by lag.
pub fn lag_table(table: &LagCorrelationTable) -> Table {
    let headers = vec![
        "lag".to_string(),
        "r".to_string(),
        "ci_lower".to_string(),
        "ci_upper".to_string(),
        "n".to_string(),
    ];
    let rows = table
        .points
        .iter()
        .map(|p| {
            vec![
                p.lag.to_string(),
                fmt_float(p.r),
                fmt_opt(p.ci_lower),
                fmt_opt(p.ci_upper),
                p.n.to_string(),
            ]
        })
        .collect();
    Table { headers, rows }
}

/// Per-sensor site table: metadata joined with window statistics and,
/// when supplied, cluster groups, signatures, and decomposition variances.
///
/// Sensors missing from a joined input keep empty cells; the join never
/// invents values.
pub fn site_summary(
    meta: &BTreeMap<String, SensorMeta>,
    stats: &BTreeMap<String, SummaryStats>,
    assignment: Option<&ClusterAssignment>,
    signatures: Option<&SignatureMatrix>,
    variances: Option<&BTreeMap<String, ComponentVariances>>,
) -> Table {
    let mut headers = vec![
        "sensor_id".to_string(),
        "latitude".to_string(),
        "longitude".to_string(),
        "elevation".to_string(),
        "count".to_string(),
        "mean".to_string(),
        "std".to_string(),
        "min".to_string(),
        "q25".to_string(),
        "median".to_string(),
        "q75".to_string(),
        "max".to_string(),
    ];
    if assignment.is_some() {
        headers.push("group".to_string());
    }
    if let Some(matrix) = signatures {
        headers.extend(matrix.descriptors().iter().map(|d| format!("sig_{}", d)));
    }
    if variances.is_some() {
        for c in ["trend", "seasonal", "residual"] {
            headers.push(format!("var_{}", c));
        }
    }

    let rows = meta
        .values()
        .map(|m| {
            let mut row = vec![
                m.sensor_id.clone(),
                fmt_float(m.latitude),
                fmt_float(m.longitude),
                fmt_float(m.elevation),
            ];
            match stats.get(&m.sensor_id) {
                Some(s) => {
                    row.push(s.count.to_string());
                    row.push(fmt_float(s.mean));
                    row.push(fmt_opt(s.std));
                    row.push(fmt_float(s.min));
                    row.push(fmt_float(s.q25));
                    row.push(fmt_float(s.median));
                    row.push(fmt_float(s.q75));
                    row.push(fmt_float(s.max));
                }
                None => row.extend(std::iter::repeat(String::new()).take(8)),
            }
            if let Some(a) = assignment {
                row.push(
                    a.groups
                        .get(&m.sensor_id)
                        .map(|g| g.to_string())
                        .unwrap_or_default(),
                );
            }
            if let Some(matrix) = signatures {
                match matrix.row(&m.sensor_id) {
                    Ok(cells) => row.extend(cells.iter().map(|c| fmt_opt(*c))),
                    Err(_) => row.extend(
                        std::iter::repeat(String::new()).take(matrix.descriptors().len()),
                    ),
                }
            }
            if let Some(vars) = variances {
                match vars.get(&m.sensor_id) {
                    Some(v) => {
                        row.push(fmt_float(v.trend));
                        row.push(fmt_float(v.seasonal));
                        row.push(fmt_float(v.residual));
                    }
                    None => row.extend(std::iter::repeat(String::new()).take(3)),
                }
            }
            row
        })
        .collect();

    Table { headers, rows }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resample::{Frequency, Statistic};
    use crate::series::SeriesPoint;
    use chrono::TimeZone;

    fn sample_resampled() -> ResampledSeries {
        ResampledSeries {
            sensor_id: "BH-01".to_string(),
            frequency: Frequency::Daily,
            statistic: Statistic::Mean,
            points: vec![
                SeriesPoint {
                    timestamp: chrono::Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap(),
                    value: 1.25,
                },
                SeriesPoint {
                    timestamp: chrono::Utc.with_ymd_and_hms(2021, 1, 2, 0, 0, 0).unwrap(),
                    value: 2.5,
                },
            ],
        }
    }

    #[test]
    fn test_resampled_table_iso_timestamps() {
        let series = sample_resampled();
        let table = resampled_table(&[&series]);
        let text = table.to_delimited(',');
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "sensor_id,timestamp,value");
        assert_eq!(lines.next().unwrap(), "BH-01,2021-01-01T00:00:00+00:00,1.25");
    }

    #[test]
    fn test_escaping_of_delimiter_in_cells() {
        let table = Table {
            headers: vec!["a".to_string(), "b".to_string()],
            rows: vec![vec!["x,y".to_string(), "plain".to_string()]],
        };
        assert_eq!(table.to_delimited(','), "a,b\n\"x,y\",plain\n");
    }

    #[test]
    fn test_write_delimited_to_file() {
        let series = sample_resampled();
        let table = resampled_table(&[&series]);

        let mut file = tempfile::tempfile().unwrap();
        table.write_delimited(&mut file, '\t').unwrap();

        use std::io::{Read, Seek};
        let mut text = String::new();
        file.rewind().unwrap();
        file.read_to_string(&mut text).unwrap();
        assert!(text.starts_with("sensor_id\ttimestamp\tvalue\n"));
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn test_site_summary_join_keeps_missing_cells_empty() {
        let mut meta = BTreeMap::new();
        for id in ["BH-01", "BH-02"] {
            meta.insert(
                id.to_string(),
                SensorMeta {
                    sensor_id: id.to_string(),
                    latitude: -43.5,
                    longitude: 172.6,
                    elevation: 12.0,
                    attributes: BTreeMap::new(),
                },
            );
        }
        let mut stats = BTreeMap::new();
        stats.insert(
            "BH-01".to_string(),
            SummaryStats::from_values(&[1.0, 2.0, 3.0]).unwrap(),
        );

        let table = site_summary(&meta, &stats, None, None, None);
        assert_eq!(table.rows.len(), 2);
        // BH-02 has no stats: its stat cells are empty, not zero.
        let bh02 = &table.rows[1];
        assert_eq!(bh02[0], "BH-02");
        assert!(bh02[4..12].iter().all(String::is_empty));
    }
}
