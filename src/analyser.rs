//! Exploratory analysis derived from aggregated statistics.

pub mod cache;
pub mod engine;
pub mod summary;
pub mod types;

pub use cache::AnalysisCache;
pub use engine::analyse;
pub use types::{
    AnalysisResult, AnomalyReport, BooleanStats, ColumnStats, ColumnSummary, CorrelationMatrix,
    DataQuality, NumericStats, StrongCorrelation, TextStats,
};
