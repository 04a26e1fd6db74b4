//! Bounded-concurrency aggregation over a partitioned dataset.
//!
//! Each partition is parsed on the blocking pool into local statistics. The
//! coordinating task owns the global accumulator and merges results in
//! partition order, holding back any that finish early, so the outcome does
//! not depend on the worker count. Failed partitions are recorded and skipped.

use super::stats::{StatsOptions, SufficientStatistics};
use crate::config::Settings;
use crate::error::{EdaError, PartitionFailure, PartitionReadError, Result, RowError};
use crate::ingest::{Dataset, Partition, PartitionOutcome, Partitioner};
use rand::SeedableRng as _;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Row errors kept verbatim per run; the rest are only counted.
pub const MAX_ROW_ERROR_SAMPLES: usize = 100;

/// Slack given to the cooperative deadline before the outer timeout fires.
const TIMEOUT_GRACE: Duration = Duration::from_millis(250);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub partitions_done: usize,
    pub partitions_total: usize,
}

pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

/// Cooperative cancellation flag, checked between partitions.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AggregatorOptions {
    pub workers: usize,
    pub partition_timeout: Duration,
    pub seed: u64,
    pub stats: StatsOptions,
}

impl AggregatorOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            workers: settings.aggregate.effective_workers(),
            partition_timeout: settings.aggregate.partition_timeout(),
            seed: settings.aggregate.seed,
            stats: StatsOptions {
                sample_size: settings.aggregate.sample_size,
                category_cap: settings.analysis.category_cap,
            },
        }
    }
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// How much of the dataset a result was built from.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coverage {
    pub partitions_total: usize,
    pub partitions_read: usize,
    pub rows_total: u64,
    /// Rows in partitions that were read successfully, malformed rows included.
    pub rows_covered: u64,
    /// Rows folded into the statistics.
    pub rows_aggregated: u64,
    /// `rows_aggregated / rows_total`.
    pub fraction: f64,
}

impl Coverage {
    fn new(partitions_total: usize, rows_total: u64) -> Self {
        Self {
            partitions_total,
            partitions_read: 0,
            rows_total,
            rows_covered: 0,
            rows_aggregated: 0,
            fraction: if rows_total == 0 { 1.0 } else { 0.0 },
        }
    }

    fn record(&mut self, partition: &Partition, rows_aggregated: u64) {
        self.partitions_read += 1;
        self.rows_covered += partition.len();
        self.rows_aggregated += rows_aggregated;
        if self.rows_total > 0 {
            self.fraction = self.rows_aggregated as f64 / self.rows_total as f64;
        }
    }

    /// Every partition was read and every row in it was aggregated.
    pub fn is_complete(&self) -> bool {
        self.partitions_read == self.partitions_total && self.rows_aggregated >= self.rows_total
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowErrorLog {
    pub count: u64,
    pub samples: Vec<RowError>,
}

impl RowErrorLog {
    fn extend(&mut self, errors: Vec<RowError>) {
        self.count += errors.len() as u64;
        let room = MAX_ROW_ERROR_SAMPLES.saturating_sub(self.samples.len());
        self.samples.extend(errors.into_iter().take(room));
    }
}

#[derive(Clone, Debug)]
pub struct AggregationOutput {
    pub dataset: Arc<Dataset>,
    pub stats: SufficientStatistics,
    pub coverage: Coverage,
    pub row_errors: RowErrorLog,
    pub partition_errors: Vec<PartitionReadError>,
    pub elapsed: Duration,
}

type PartitionResult =
    std::result::Result<(SufficientStatistics, PartitionOutcome), PartitionFailure>;

fn partition_seed(seed: u64, index: usize) -> u64 {
    seed ^ (index as u64 + 1).wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

fn fold_partition(
    partitioner: &Partitioner,
    partition: &Partition,
    options: &AggregatorOptions,
) -> PartitionResult {
    let dataset = partitioner.dataset();
    let mut stats = SufficientStatistics::new(&dataset.schema, options.stats);
    let mut rng = StdRng::seed_from_u64(partition_seed(options.seed, partition.index));
    let outcome = partitioner.read_partition(partition, Some(options.partition_timeout), |cells| {
        stats.observe_row(cells, &mut rng);
    })?;
    Ok((stats, outcome))
}

pub struct StreamingAggregator {
    options: AggregatorOptions,
}

impl StreamingAggregator {
    pub fn new(options: AggregatorOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &AggregatorOptions {
        &self.options
    }

    /// Aggregates every partition. A cancelled run returns
    /// [`EdaError::Cancelled`] and discards everything accumulated so far.
    pub async fn run(
        &self,
        partitioner: Arc<Partitioner>,
        cancel: &CancelHandle,
        progress: Option<ProgressFn>,
    ) -> Result<AggregationOutput> {
        let started = Instant::now();
        let dataset = partitioner.dataset();
        let total = partitioner.partition_count();
        let workers = self.options.workers.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let outer_timeout = self.options.partition_timeout + TIMEOUT_GRACE;

        let mut global = SufficientStatistics::new(&dataset.schema, self.options.stats);
        let mut coverage = Coverage::new(total, dataset.row_count);
        let mut row_errors = RowErrorLog::default();
        let mut partition_errors = Vec::new();

        tracing::debug!(
            fingerprint = %dataset.fingerprint.short(),
            partitions = total,
            workers,
            "Starting aggregation"
        );

        // finished partitions waiting for their predecessors; `None` marks a failure
        let mut finished: BTreeMap<usize, Option<(SufficientStatistics, Vec<RowError>)>> =
            BTreeMap::new();
        let mut next_merge = 0;

        let mut pending = partitioner.partitions();
        let mut join_set: JoinSet<(Partition, PartitionResult)> = JoinSet::new();
        let mut done = 0;

        loop {
            while join_set.len() < workers && !cancel.is_cancelled() {
                let Some(partition) = pending.next() else {
                    break;
                };
                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|e| EdaError::Other(format!("Worker pool closed: {e}")))?;
                let worker_partitioner = Arc::clone(&partitioner);
                let options = self.options.clone();

                join_set.spawn(async move {
                    let blocking = tokio::task::spawn_blocking(move || {
                        // held until parsing really stops, even after the outer timeout
                        let _permit = permit;
                        fold_partition(&worker_partitioner, &partition, &options)
                    });
                    let result = match tokio::time::timeout(outer_timeout, blocking).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(e)) => Err(PartitionFailure::Io(format!("worker failed: {e}"))),
                        Err(_) => Err(PartitionFailure::Timeout {
                            after_ms: u64::try_from(outer_timeout.as_millis())
                                .unwrap_or(u64::MAX),
                        }),
                    };
                    (partition, result)
                });
            }

            if cancel.is_cancelled() {
                join_set.abort_all();
                tracing::info!(
                    fingerprint = %dataset.fingerprint.short(),
                    "Aggregation cancelled after {done} of {total} partitions"
                );
                return Err(EdaError::Cancelled);
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            let (partition, result) =
                joined.map_err(|e| EdaError::Other(format!("Aggregation task failed: {e}")))?;

            match result {
                Ok((stats, outcome)) => {
                    coverage.record(&partition, outcome.rows_read);
                    finished.insert(partition.index, Some((stats, outcome.row_errors)));
                }
                Err(failure) => {
                    let err = PartitionReadError {
                        partition_index: partition.index,
                        failure,
                    };
                    tracing::warn!("Skipping {err}");
                    partition_errors.push(err);
                    finished.insert(partition.index, None);
                }
            }
            while let Some(entry) = finished.remove(&next_merge) {
                if let Some((stats, errors)) = entry {
                    global.merge(stats);
                    row_errors.extend(errors);
                }
                next_merge += 1;
            }

            done += 1;
            if let Some(callback) = &progress {
                callback(Progress {
                    partitions_done: done,
                    partitions_total: total,
                });
            }
        }

        let elapsed = started.elapsed();
        tracing::info!(
            fingerprint = %dataset.fingerprint.short(),
            rows = global.rows,
            row_errors = row_errors.count,
            failed_partitions = partition_errors.len(),
            "Aggregated {}/{} partitions in {:?} (coverage {:.1}%)",
            coverage.partitions_read,
            total,
            elapsed,
            coverage.fraction * 100.0
        );

        partition_errors.sort_by_key(|e| e.partition_index);
        Ok(AggregationOutput {
            dataset,
            stats: global,
            coverage,
            row_errors,
            partition_errors,
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::stats::ColumnAccumulator;
    use crate::config::IngestConfig;
    use crate::ingest::DataSource;
    use crate::ingest::classifier::MB;
    use std::fmt::Write as _;
    use std::io::Write as _;
    use std::sync::atomic::AtomicUsize;
    use tempfile::NamedTempFile;

    fn numeric_csv(rows: usize) -> NamedTempFile {
        let mut csv = String::from("a,b\n");
        for i in 0..rows {
            writeln!(csv, "{i},{}", i % 7).expect("format");
        }
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(csv.as_bytes()).expect("write");
        file.flush().expect("flush");
        file
    }

    fn partitioner_for(file: &NamedTempFile) -> Arc<Partitioner> {
        let source = DataSource::from_path(file.path())
            .expect("source")
            .with_declared_size(200 * MB);
        Arc::new(Partitioner::scan(Arc::new(source), &IngestConfig::default()).expect("scan"))
    }

    fn options(workers: usize) -> AggregatorOptions {
        AggregatorOptions {
            workers,
            partition_timeout: Duration::from_secs(30),
            ..AggregatorOptions::default()
        }
    }

    #[tokio::test]
    async fn test_full_coverage_and_progress() {
        let file = numeric_csv(9000);
        let partitioner = partitioner_for(&file);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let progress: ProgressFn = Arc::new(move |p: Progress| {
            assert_eq!(p.partitions_total, 5);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let output = StreamingAggregator::new(options(3))
            .run(partitioner, &CancelHandle::new(), Some(progress))
            .await
            .expect("aggregate");

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(output.stats.rows, 9000);
        assert!(output.coverage.is_complete());
        assert!((output.coverage.fraction - 1.0).abs() < f64::EPSILON);
        assert!(output.partition_errors.is_empty());
    }

    #[tokio::test]
    async fn test_worker_count_does_not_change_result() {
        let file = numeric_csv(7000);
        let one = StreamingAggregator::new(options(1))
            .run(partitioner_for(&file), &CancelHandle::new(), None)
            .await
            .expect("aggregate");
        let many = StreamingAggregator::new(options(4))
            .run(partitioner_for(&file), &CancelHandle::new(), None)
            .await
            .expect("aggregate");

        let pair_one = one.stats.pair(0, 1).expect("pair");
        let pair_many = many.stats.pair(0, 1).expect("pair");
        assert_eq!(pair_one.count, pair_many.count);
        let diff = (pair_one.correlation().expect("r") - pair_many.correlation().expect("r")).abs();
        assert!(diff < 1e-12);
    }

    #[tokio::test]
    async fn test_saturated_categories_do_not_depend_on_workers() {
        let mut csv = String::from("n,tag\n");
        for i in 0..10_000 {
            writeln!(csv, "{i},t{}", (i * 7919) % 3001).expect("format");
        }
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(csv.as_bytes()).expect("write");
        file.flush().expect("flush");

        let mut outputs = Vec::new();
        for workers in [1, 4] {
            let mut opts = options(workers);
            opts.stats.category_cap = 500;
            let output = StreamingAggregator::new(opts)
                .run(partitioner_for(&file), &CancelHandle::new(), None)
                .await
                .expect("aggregate");
            outputs.push(output);
        }
        let (one, many) = (&outputs[0], &outputs[1]);

        let tags = |output: &AggregationOutput| match &output.stats.columns()[1] {
            ColumnAccumulator::Text(t) => (t.categories.top(20), t.categories.untracked()),
            other => panic!("tag should be text, got {other:?}"),
        };
        assert_eq!(tags(one), tags(many));
        assert_eq!(one.row_errors, many.row_errors);
    }

    #[tokio::test]
    async fn test_zero_timeout_fails_every_partition() {
        let file = numeric_csv(4500);
        let aggregator = StreamingAggregator::new(AggregatorOptions {
            partition_timeout: Duration::ZERO,
            ..options(2)
        });
        let output = aggregator
            .run(partitioner_for(&file), &CancelHandle::new(), None)
            .await
            .expect("aggregate");

        assert_eq!(output.partition_errors.len(), 3);
        assert!(
            output
                .partition_errors
                .iter()
                .all(|e| matches!(e.failure, PartitionFailure::Timeout { .. }))
        );
        assert_eq!(output.coverage.partitions_read, 0);
        assert_eq!(output.coverage.fraction, 0.0);
        assert_eq!(output.stats.rows, 0);
    }

    #[tokio::test]
    async fn test_malformed_rows_lower_coverage() {
        let mut csv = String::from("a,b\n");
        for i in 0..4000 {
            if i < 2000 {
                writeln!(csv, "{i},{}", i % 7).expect("format");
            } else {
                csv.push_str("bad,row\n");
            }
        }
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(csv.as_bytes()).expect("write");
        file.flush().expect("flush");

        let output = StreamingAggregator::new(options(2))
            .run(partitioner_for(&file), &CancelHandle::new(), None)
            .await
            .expect("aggregate");

        assert_eq!(output.stats.rows, 2000);
        assert_eq!(output.row_errors.count, 2000);
        assert_eq!(output.coverage.partitions_read, 2);
        assert_eq!(output.coverage.rows_covered, 4000);
        assert_eq!(output.coverage.rows_aggregated, 2000);
        assert!((output.coverage.fraction - 0.5).abs() < f64::EPSILON);
        assert!(!output.coverage.is_complete());
    }

    #[tokio::test]
    async fn test_missing_file_is_partial_failure() {
        let file = numeric_csv(4500);
        let partitioner = partitioner_for(&file);
        file.close().expect("remove file");

        let output = StreamingAggregator::new(options(2))
            .run(partitioner, &CancelHandle::new(), None)
            .await
            .expect("aggregate");
        assert_eq!(output.partition_errors.len(), 3);
        assert!(matches!(
            output.partition_errors[0].failure,
            PartitionFailure::Io(_)
        ));
        assert_eq!(output.partition_errors[0].partition_index, 0);
    }

    #[tokio::test]
    async fn test_cancel_between_partitions() {
        let file = numeric_csv(20_000);
        let cancel = CancelHandle::new();
        let trigger = cancel.clone();
        let progress: ProgressFn = Arc::new(move |p: Progress| {
            if p.partitions_done == 2 {
                trigger.cancel();
            }
        });

        let result = StreamingAggregator::new(options(1))
            .run(partitioner_for(&file), &cancel, Some(progress))
            .await;
        assert!(matches!(result, Err(EdaError::Cancelled)));
    }

    #[test]
    fn test_row_error_log_keeps_bounded_samples() {
        let mut log = RowErrorLog::default();
        let errors = |n: usize| -> Vec<RowError> {
            (0..n)
                .map(|row_offset| RowError {
                    partition_index: 0,
                    row_offset,
                    reason: "bad".to_owned(),
                })
                .collect()
        };
        log.extend(errors(60));
        log.extend(errors(90));
        assert_eq!(log.count, 150);
        assert_eq!(log.samples.len(), MAX_ROW_ERROR_SAMPLES);
    }
}
