//! Streaming aggregation of sufficient statistics across partitions.

pub mod reservoir;
pub mod runner;
pub mod stats;

pub use runner::{
    AggregationOutput, AggregatorOptions, CancelHandle, Coverage, Progress, ProgressFn,
    RowErrorLog, StreamingAggregator,
};
pub use stats::{Moments, StatsOptions, SufficientStatistics};
