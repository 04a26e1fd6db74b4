use crate::aggregate::{Coverage, RowErrorLog};
use crate::error::{InsufficientData, PartitionReadError};
use crate::ingest::{ColumnType, Fingerprint};
use serde::{Deserialize, Serialize};

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct CorrelationMatrix {
    pub columns: Vec<String>,
    /// `None` where the coefficient is undefined.
    pub data: Vec<Vec<Option<f64>>>,
}

impl CorrelationMatrix {
    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        let i = self.columns.iter().position(|c| c == a)?;
        let j = self.columns.iter().position(|c| c == b)?;
        self.data.get(i)?.get(j).copied().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

#[derive(Clone, Deserialize, Serialize, Debug, PartialEq)]
pub enum ColumnStats {
    Numeric(NumericStats),
    Boolean(BooleanStats),
    Text(TextStats),
}

#[derive(Clone, Deserialize, Serialize, Debug, Default, PartialEq)]
pub struct NumericStats {
    pub mean: Option<f64>,
    pub variance: Option<f64>,
    pub std_dev: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub skew: Option<f64>,
    /// Excess kurtosis.
    pub kurtosis: Option<f64>,
    pub sum: f64,
    pub sum_of_squares: f64,
    /// Quartiles are estimated from a uniform sample of `sample_size` values.
    pub q1: Option<f64>,
    pub median: Option<f64>,
    pub q3: Option<f64>,
    pub sample_size: usize,
}

impl NumericStats {
    pub fn iqr(&self) -> Option<f64> {
        Some(self.q3? - self.q1?)
    }

    /// True when every non-null value lies in the sample, so quartiles are exact.
    pub fn quartiles_exact(&self, count: u64) -> bool {
        self.sample_size as u64 == count
    }
}

#[derive(Clone, Deserialize, Serialize, Debug, Default, PartialEq, Eq)]
pub struct BooleanStats {
    pub true_count: u64,
    pub false_count: u64,
}

#[derive(Clone, Deserialize, Serialize, Debug, Default, PartialEq, Eq)]
pub struct TextStats {
    pub distinct: usize,
    /// The category tracker filled up, so `distinct` undercounts.
    pub distinct_is_lower_bound: bool,
    pub top_value: Option<(String, u64)>,
    pub top_values: Vec<(String, u64)>,
}

#[derive(Clone, Deserialize, Serialize, Debug, PartialEq)]
pub struct ColumnSummary {
    pub name: String,
    pub kind: ColumnType,
    /// Non-null values.
    pub count: u64,
    pub nulls: u64,
    pub stats: ColumnStats,
}

impl ColumnSummary {
    pub fn null_fraction(&self) -> f64 {
        let total = self.count + self.nulls;
        if total == 0 {
            0.0
        } else {
            self.nulls as f64 / total as f64
        }
    }

    pub fn numeric(&self) -> Option<&NumericStats> {
        match &self.stats {
            ColumnStats::Numeric(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Clone, Deserialize, Serialize, Debug, PartialEq)]
pub struct StrongCorrelation {
    pub a: String,
    pub b: String,
    pub r: f64,
}

impl StrongCorrelation {
    pub fn strength(&self) -> &'static str {
        match self.r.abs() {
            r if r >= 0.9 => "very strong",
            r if r >= 0.7 => "strong",
            _ => "moderate",
        }
    }

    pub fn direction(&self) -> &'static str {
        if self.r >= 0.0 { "positive" } else { "negative" }
    }
}

/// Outlier screening for one numeric column.
#[derive(Clone, Deserialize, Serialize, Debug, PartialEq)]
pub struct AnomalyReport {
    pub column: String,
    pub k: f64,
    /// `mean ± k·stddev`
    pub z_bounds: (f64, f64),
    /// `[Q1 - 1.5·IQR, Q3 + 1.5·IQR]`, when quartiles are known.
    pub iqr_fences: Option<(f64, f64)>,
    pub sampled: usize,
    pub z_outliers: usize,
    pub iqr_outliers: usize,
    /// Sampled values outside either rule.
    pub flagged: usize,
    pub estimated_fraction: f64,
    pub estimated_count: u64,
    pub examples: Vec<f64>,
    pub min_is_outlier: bool,
    pub max_is_outlier: bool,
}

impl AnomalyReport {
    pub fn has_outliers(&self) -> bool {
        self.flagged > 0 || self.min_is_outlier || self.max_is_outlier
    }
}

#[derive(Clone, Copy, Deserialize, Serialize, Debug, Default, PartialEq)]
pub struct DataQuality {
    pub total_cells: u64,
    pub missing_cells: u64,
    pub missing_pct: f64,
    pub completeness_pct: f64,
}

/// Read-only snapshot of one dataset's statistics. Never patched; a rerun
/// produces a fresh value.
#[derive(Clone, Deserialize, Serialize, Debug, PartialEq)]
pub struct AnalysisResult {
    pub fingerprint: Fingerprint,
    pub dataset_name: String,
    pub row_count: u64,
    /// Rows that contributed to the statistics.
    pub rows_aggregated: u64,
    pub columns: Vec<ColumnSummary>,
    pub correlations: CorrelationMatrix,
    pub strong_correlations: Vec<StrongCorrelation>,
    pub anomalies: Vec<AnomalyReport>,
    pub quality: DataQuality,
    pub coverage: Coverage,
    pub row_errors: RowErrorLog,
    pub partition_errors: Vec<PartitionReadError>,
    pub insufficient: Vec<InsufficientData>,
    pub aggregation_ms: u64,
}

impl AnalysisResult {
    pub fn column(&self, name: &str) -> Option<&ColumnSummary> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn numeric(&self, name: &str) -> Option<&NumericStats> {
        self.column(name)?.numeric()
    }

    pub fn numeric_columns(&self) -> impl Iterator<Item = &ColumnSummary> {
        self.columns.iter().filter(|c| c.kind.is_numeric())
    }

    pub fn anomaly(&self, column: &str) -> Option<&AnomalyReport> {
        self.anomalies.iter().find(|a| a.column == column)
    }

    /// Built from fewer rows than the dataset holds.
    pub fn is_partial(&self) -> bool {
        !self.coverage.is_complete()
    }
}
