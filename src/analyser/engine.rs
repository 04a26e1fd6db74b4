//! Derives an [`AnalysisResult`] from aggregated sufficient statistics.
//!
//! Everything here is a pure function of the aggregation output: no I/O and
//! no access to raw rows. Anomaly screening works on the reservoir sample and
//! the exact min/max.

use super::types::{
    AnalysisResult, AnomalyReport, BooleanStats, ColumnStats, ColumnSummary, CorrelationMatrix,
    DataQuality, NumericStats, StrongCorrelation, TextStats,
};
use crate::aggregate::AggregationOutput;
use crate::aggregate::reservoir::quantile;
use crate::aggregate::stats::{ColumnAccumulator, NumericAccumulator, SufficientStatistics};
use crate::config::AnalysisConfig;
use crate::error::InsufficientData;
use crate::ingest::Schema;

const TOP_VALUES: usize = 10;
const MAX_ANOMALY_EXAMPLES: usize = 20;
const IQR_MULTIPLIER: f64 = 1.5;

pub fn analyse(output: &AggregationOutput, config: &AnalysisConfig) -> AnalysisResult {
    let dataset = &output.dataset;
    let stats = &output.stats;
    let mut insufficient = Vec::new();
    let mut anomalies = Vec::new();

    let columns: Vec<ColumnSummary> = dataset
        .schema
        .columns()
        .iter()
        .zip(stats.columns())
        .map(|(col, acc)| {
            let summary_stats = match acc {
                ColumnAccumulator::Numeric(num) => {
                    let (numeric, sorted) = numeric_stats(&col.name, num, &mut insufficient);
                    if let Some(report) = anomaly_report(&col.name, num, &numeric, &sorted, config)
                    {
                        anomalies.push(report);
                    }
                    ColumnStats::Numeric(numeric)
                }
                ColumnAccumulator::Boolean(b) => ColumnStats::Boolean(BooleanStats {
                    true_count: b.trues,
                    false_count: b.falses,
                }),
                ColumnAccumulator::Text(t) => {
                    let top_values = t.categories.top(TOP_VALUES);
                    ColumnStats::Text(TextStats {
                        distinct: t.categories.distinct(),
                        distinct_is_lower_bound: t.categories.is_saturated(),
                        top_value: top_values.first().cloned(),
                        top_values,
                    })
                }
            };
            ColumnSummary {
                name: col.name.clone(),
                kind: col.ty,
                count: acc.non_null(),
                nulls: acc.nulls(),
                stats: summary_stats,
            }
        })
        .collect();

    let correlations = correlation_matrix(&dataset.schema, stats, &mut insufficient);
    let strong_correlations = strong_correlations(&correlations, config.strong_correlation);
    let quality = data_quality(&columns, stats.rows);

    AnalysisResult {
        fingerprint: dataset.fingerprint.clone(),
        dataset_name: dataset.name.clone(),
        row_count: dataset.row_count,
        rows_aggregated: stats.rows,
        columns,
        correlations,
        strong_correlations,
        anomalies,
        quality,
        coverage: output.coverage,
        row_errors: output.row_errors.clone(),
        partition_errors: output.partition_errors.clone(),
        insufficient,
        aggregation_ms: u64::try_from(output.elapsed.as_millis()).unwrap_or(u64::MAX),
    }
}

fn numeric_stats(
    column: &str,
    acc: &NumericAccumulator,
    insufficient: &mut Vec<InsufficientData>,
) -> (NumericStats, Vec<f64>) {
    let m = &acc.moments;
    if m.count == 0 {
        insufficient.push(InsufficientData {
            column: column.to_owned(),
            statistic: "mean".to_owned(),
            reason: "no non-null values".to_owned(),
        });
    }
    if m.count < 2 {
        insufficient.push(InsufficientData {
            column: column.to_owned(),
            statistic: "variance".to_owned(),
            reason: format!("needs at least 2 values, found {}", m.count),
        });
    }

    let sorted = acc.sample.sorted_values();
    let stats = NumericStats {
        mean: m.mean(),
        variance: m.variance(),
        std_dev: m.std_dev(),
        min: acc.min(),
        max: acc.max(),
        skew: m.skewness(),
        kurtosis: m.kurtosis(),
        sum: m.sum(),
        sum_of_squares: m.sum_of_squares(),
        q1: quantile(&sorted, 0.25),
        median: quantile(&sorted, 0.5),
        q3: quantile(&sorted, 0.75),
        sample_size: sorted.len(),
    };
    (stats, sorted)
}

fn anomaly_report(
    column: &str,
    acc: &NumericAccumulator,
    stats: &NumericStats,
    sorted: &[f64],
    config: &AnalysisConfig,
) -> Option<AnomalyReport> {
    let mean = stats.mean?;
    let std_dev = stats.std_dev?;
    if sorted.is_empty() {
        return None;
    }

    let k = config.outlier_k;
    let z_bounds = (mean - k * std_dev, mean + k * std_dev);
    let iqr_fences = match (stats.q1, stats.q3) {
        (Some(q1), Some(q3)) => {
            let iqr = q3 - q1;
            Some((q1 - IQR_MULTIPLIER * iqr, q3 + IQR_MULTIPLIER * iqr))
        }
        _ => None,
    };

    let outside_z = |v: f64| v < z_bounds.0 || v > z_bounds.1;
    let outside_iqr = |v: f64| iqr_fences.is_some_and(|(lo, hi)| v < lo || v > hi);

    let mut z_outliers = 0;
    let mut iqr_outliers = 0;
    let mut flagged = 0;
    let mut examples = Vec::new();
    for &v in sorted {
        let z = outside_z(v);
        let iqr = outside_iqr(v);
        z_outliers += usize::from(z);
        iqr_outliers += usize::from(iqr);
        if z || iqr {
            flagged += 1;
            if examples.len() < MAX_ANOMALY_EXAMPLES {
                examples.push(v);
            }
        }
    }

    let estimated_fraction = flagged as f64 / sorted.len() as f64;
    let min_is_outlier = acc.min().is_some_and(|v| outside_z(v) || outside_iqr(v));
    let max_is_outlier = acc.max().is_some_and(|v| outside_z(v) || outside_iqr(v));

    Some(AnomalyReport {
        column: column.to_owned(),
        k,
        z_bounds,
        iqr_fences,
        sampled: sorted.len(),
        z_outliers,
        iqr_outliers,
        flagged,
        estimated_fraction,
        estimated_count: (estimated_fraction * acc.moments.count as f64).round() as u64,
        examples,
        min_is_outlier,
        max_is_outlier,
    })
}

fn correlation_matrix(
    schema: &Schema,
    stats: &SufficientStatistics,
    insufficient: &mut Vec<InsufficientData>,
) -> CorrelationMatrix {
    let numeric = stats.numeric_indices();
    let columns: Vec<String> = numeric
        .iter()
        .map(|&i| schema.columns()[i].name.clone())
        .collect();
    let m = columns.len();
    let mut data = vec![vec![None; m]; m];

    for a in 0..m {
        data[a][a] = Some(1.0);
        for b in (a + 1)..m {
            let Some(pair) = stats.pair(a, b) else {
                continue;
            };
            let r = pair.correlation();
            if r.is_none() {
                let reason = if pair.count < 2 {
                    format!("needs at least 2 paired values, found {}", pair.count)
                } else {
                    "one side has zero variance".to_owned()
                };
                insufficient.push(InsufficientData {
                    column: format!("{} ~ {}", columns[a], columns[b]),
                    statistic: "correlation".to_owned(),
                    reason,
                });
            }
            data[a][b] = r;
            data[b][a] = r;
        }
    }

    CorrelationMatrix { columns, data }
}

fn strong_correlations(matrix: &CorrelationMatrix, threshold: f64) -> Vec<StrongCorrelation> {
    let mut strong = Vec::new();
    for (i, row) in matrix.data.iter().enumerate() {
        for (j, r) in row.iter().enumerate().skip(i + 1) {
            if let Some(r) = *r
                && r.abs() > threshold
            {
                strong.push(StrongCorrelation {
                    a: matrix.columns[i].clone(),
                    b: matrix.columns[j].clone(),
                    r,
                });
            }
        }
    }
    strong.sort_by(|x, y| y.r.abs().total_cmp(&x.r.abs()));
    strong
}

fn data_quality(columns: &[ColumnSummary], rows: u64) -> DataQuality {
    let total_cells = rows * columns.len() as u64;
    let missing_cells: u64 = columns.iter().map(|c| c.nulls).sum();
    let missing_pct = if total_cells == 0 {
        0.0
    } else {
        missing_cells as f64 / total_cells as f64 * 100.0
    };
    DataQuality {
        total_cells,
        missing_cells,
        missing_pct,
        completeness_pct: 100.0 - missing_pct,
    }
}
