//! Plain-text renderings of an [`AnalysisResult`], used for structured answers
//! and as the context summary handed to the LLM collaborator.

use super::types::{AnalysisResult, ColumnStats, ColumnSummary};
use crate::memory::DatasetSummary;
use crate::router::QuestionKind;
use crate::utils::fmt_opt;
use std::fmt::Write as _;

fn selected<'a>(
    items: impl Iterator<Item = &'a ColumnSummary>,
    filter: &'a [String],
) -> impl Iterator<Item = &'a ColumnSummary> {
    items.filter(move |c| filter.is_empty() || filter.iter().any(|f| f == &c.name))
}

fn coverage_note(result: &AnalysisResult, out: &mut String) {
    if result.is_partial() {
        let _ = writeln!(
            out,
            "Note: based on {:.1}% of rows ({} of {} partitions read).",
            result.coverage.fraction * 100.0,
            result.coverage.partitions_read,
            result.coverage.partitions_total
        );
    }
    if result.row_errors.count > 0 {
        let _ = writeln!(
            out,
            "Note: {} malformed rows were skipped.",
            result.row_errors.count
        );
    }
}

/// Descriptive statistics, optionally narrowed to `columns`.
pub fn descriptive(result: &AnalysisResult, columns: &[String]) -> String {
    let mut out = format!(
        "Dataset '{}': {} rows, {} columns.\n",
        result.dataset_name,
        result.row_count,
        result.columns.len()
    );

    for col in selected(result.columns.iter(), columns) {
        match &col.stats {
            ColumnStats::Numeric(s) => {
                let sampled = if s.median.is_some() && !s.quartiles_exact(col.count) {
                    format!(" (quartiles from a sample of {})", s.sample_size)
                } else {
                    String::new()
                };
                let _ = writeln!(
                    out,
                    "- {} ({}): mean {}, std {}, min {}, Q1 {}, median {}, Q3 {}, max {}, nulls {:.1}%{sampled}",
                    col.name,
                    col.kind,
                    fmt_opt(s.mean),
                    fmt_opt(s.std_dev),
                    fmt_opt(s.min),
                    fmt_opt(s.q1),
                    fmt_opt(s.median),
                    fmt_opt(s.q3),
                    fmt_opt(s.max),
                    col.null_fraction() * 100.0
                );
            }
            ColumnStats::Boolean(s) => {
                let _ = writeln!(
                    out,
                    "- {} (boolean): {} true, {} false, nulls {:.1}%",
                    col.name,
                    s.true_count,
                    s.false_count,
                    col.null_fraction() * 100.0
                );
            }
            ColumnStats::Text(s) => {
                let bound = if s.distinct_is_lower_bound { "at least " } else { "" };
                let top = s
                    .top_value
                    .as_ref()
                    .map_or_else(|| "—".to_owned(), |(v, n)| format!("'{v}' ({n})"));
                let _ = writeln!(
                    out,
                    "- {} (text): {bound}{} distinct, most frequent {top}, nulls {:.1}%",
                    col.name,
                    s.distinct,
                    col.null_fraction() * 100.0
                );
            }
        }
    }

    let _ = writeln!(
        out,
        "Completeness: {:.1}% ({} of {} cells missing).",
        result.quality.completeness_pct, result.quality.missing_cells, result.quality.total_cells
    );
    coverage_note(result, &mut out);
    out
}

/// Correlation answer. With named columns, lists their pairwise coefficients;
/// otherwise the strong correlations.
pub fn correlations(result: &AnalysisResult, columns: &[String]) -> String {
    let matrix = &result.correlations;
    let mut out = String::new();
    if matrix.columns.len() < 2 {
        out.push_str("Correlation needs at least two numeric columns.\n");
        coverage_note(result, &mut out);
        return out;
    }

    let named: Vec<&String> = matrix
        .columns
        .iter()
        .filter(|c| columns.iter().any(|f| f == *c))
        .collect();

    if named.len() >= 2 {
        for (i, a) in named.iter().enumerate() {
            for b in &named[i + 1..] {
                let _ = writeln!(
                    out,
                    "- {a} vs {b}: r = {}",
                    fmt_opt(matrix.get(a, b))
                );
            }
        }
    } else if let [one] = named.as_slice() {
        let _ = writeln!(out, "Correlations with {one}:");
        for other in matrix.columns.iter().filter(|c| c != one) {
            let _ = writeln!(out, "- {other}: r = {}", fmt_opt(matrix.get(one, other)));
        }
    } else if result.strong_correlations.is_empty() {
        out.push_str("No strong correlations (|r| > 0.5) between numeric columns.\n");
    } else {
        out.push_str("Strong correlations:\n");
        for s in &result.strong_correlations {
            let _ = writeln!(
                out,
                "- {} vs {}: r = {:.4} ({} {})",
                s.a,
                s.b,
                s.r,
                s.strength(),
                s.direction()
            );
        }
    }

    let undefined = result
        .insufficient
        .iter()
        .filter(|e| e.statistic == "correlation")
        .count();
    if undefined > 0 {
        let _ = writeln!(out, "{undefined} pairs are undefined (constant or too few values).");
    }
    coverage_note(result, &mut out);
    out
}

/// Outlier answer, optionally narrowed to `columns`.
pub fn anomalies(result: &AnalysisResult, columns: &[String]) -> String {
    let mut out = String::new();
    let reports: Vec<_> = result
        .anomalies
        .iter()
        .filter(|a| columns.is_empty() || columns.iter().any(|c| c == &a.column))
        .collect();

    if reports.is_empty() {
        out.push_str("No numeric columns with enough data for outlier screening.\n");
    }
    for r in reports {
        if r.has_outliers() {
            let examples: Vec<String> = r.examples.iter().take(5).map(|v| format!("{v}")).collect();
            let _ = writeln!(
                out,
                "- {}: ~{} outliers ({:.2}% of sampled values), e.g. {}",
                r.column,
                r.estimated_count,
                r.estimated_fraction * 100.0,
                if examples.is_empty() { "min/max only".to_owned() } else { examples.join(", ") }
            );
        } else {
            let _ = writeln!(out, "- {}: no outliers detected", r.column);
        }
        let _ = write!(
            out,
            "  bounds: mean ± {}σ = [{:.4}, {:.4}]",
            r.k, r.z_bounds.0, r.z_bounds.1
        );
        if let Some((lo, hi)) = r.iqr_fences {
            let _ = write!(out, ", IQR fences = [{lo:.4}, {hi:.4}]");
        }
        out.push('\n');
    }
    coverage_note(result, &mut out);
    out
}

/// Short overview for the LLM prompt.
pub fn compact(result: &AnalysisResult) -> String {
    let mut out = format!(
        "Dataset '{}' with {} rows and {} columns ({:.1}% complete).\nColumns:\n",
        result.dataset_name,
        result.row_count,
        result.columns.len(),
        result.quality.completeness_pct
    );
    for col in &result.columns {
        match &col.stats {
            ColumnStats::Numeric(s) => {
                let _ = writeln!(
                    out,
                    "- {} ({}): mean={}, std={}, min={}, max={}",
                    col.name,
                    col.kind,
                    fmt_opt(s.mean),
                    fmt_opt(s.std_dev),
                    fmt_opt(s.min),
                    fmt_opt(s.max)
                );
            }
            ColumnStats::Boolean(s) => {
                let _ = writeln!(
                    out,
                    "- {} (boolean): {} true / {} false",
                    col.name, s.true_count, s.false_count
                );
            }
            ColumnStats::Text(s) => {
                let _ = writeln!(out, "- {} (text): {} distinct", col.name, s.distinct);
            }
        }
    }
    if !result.strong_correlations.is_empty() {
        out.push_str("Strong correlations:\n");
        for s in result.strong_correlations.iter().take(5) {
            let _ = writeln!(out, "- {} ~ {}: {:.3}", s.a, s.b, s.r);
        }
    }
    let flagged: Vec<&str> = result
        .anomalies
        .iter()
        .filter(|a| a.has_outliers())
        .map(|a| a.column.as_str())
        .collect();
    if !flagged.is_empty() {
        let _ = writeln!(out, "Columns with outliers: {}", flagged.join(", "));
    }
    coverage_note(result, &mut out);
    out
}

/// Conclusions for a dataset, drawn from what has been asked about it and
/// from the strong correlations and outliers in the analysis.
pub fn conclusions(result: &AnalysisResult, history: &DatasetSummary) -> Vec<String> {
    let mut out = Vec::new();
    let strongest = result
        .strong_correlations
        .iter()
        .max_by(|x, y| x.r.abs().total_cmp(&y.r.abs()));
    let flagged: Vec<_> = result.anomalies.iter().filter(|a| a.has_outliers()).collect();
    let outliers: u64 = flagged.iter().map(|a| a.estimated_count).sum();

    if history.asked(QuestionKind::Descriptive) > 0 {
        out.push(format!(
            "Descriptive statistics were reviewed for {} columns; the data is {:.1}% complete.",
            result.columns.len(),
            result.quality.completeness_pct
        ));
    }
    if history.asked(QuestionKind::Correlation) > 0 {
        out.push(match strongest {
            Some(s) => format!(
                "Correlation questions found {} and {} most closely related (r = {:.4}, {} {}).",
                s.a,
                s.b,
                s.r,
                s.strength(),
                s.direction()
            ),
            None => "Correlation questions found no strong relationships between numeric columns."
                .to_owned(),
        });
    }
    if history.asked(QuestionKind::Anomaly) > 0 {
        out.push(format!(
            "Outlier questions screened {} numeric columns; {} of them have atypical values worth a closer look.",
            result.anomalies.len(),
            flagged.len()
        ));
    }

    if !result.strong_correlations.is_empty() {
        out.push(format!(
            "{} strong correlations between numeric columns point to real relationships in the data.",
            result.strong_correlations.len()
        ));
    }
    if outliers > 0 {
        let columns: Vec<&str> = flagged.iter().map(|a| a.column.as_str()).collect();
        out.push(format!(
            "About {outliers} outliers in {} may be special cases or data errors.",
            columns.join(", ")
        ));
    }

    if !out.is_empty() && result.is_partial() {
        out.push(format!(
            "These conclusions rest on {:.1}% of the rows.",
            result.coverage.fraction * 100.0
        ));
    }
    out
}
