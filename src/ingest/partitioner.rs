//! Row-range partitioning over a CSV source.
//!
//! [`Partitioner::scan`] makes one sequential pass over the file. It counts
//! records, infers the schema from the first partition and remembers the byte
//! offset where each partition starts. Reading a partition later seeks straight
//! to that offset, so partitions can be read in any order, concurrently, and
//! as many times as needed.

use super::classifier::{PartitionPolicy, classify};
use super::dataset::{Dataset, Fingerprint};
use super::schema::{Cell, Schema, SchemaInference};
use super::source::DataSource;
use crate::config::IngestConfig;
use crate::error::{EdaError, PartitionFailure, Result, ResultExt as _, RowError};
use csv::{ByteRecord, ReaderBuilder};
use std::fs::File;
use std::io::{Read, Seek as _, SeekFrom};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Rows between deadline checks while reading a partition.
const DEADLINE_CHECK_INTERVAL: usize = 256;

/// A contiguous row range `[start_row, end_row)` of a dataset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partition {
    pub index: usize,
    pub start_row: u64,
    pub end_row: u64,
    /// Byte position of the partition's first record.
    pub byte_offset: u64,
}

impl Partition {
    pub fn len(&self) -> u64 {
        self.end_row - self.start_row
    }

    pub fn is_empty(&self) -> bool {
        self.start_row == self.end_row
    }
}

/// What reading one partition produced, besides the rows handed to the visitor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionOutcome {
    /// Rows that coerced cleanly and were visited.
    pub rows_read: u64,
    pub row_errors: Vec<RowError>,
}

#[derive(Debug)]
pub struct Partitioner {
    source: Arc<DataSource>,
    dataset: Arc<Dataset>,
    delimiter: u8,
    rows_per_partition: u64,
    offsets: Vec<u64>,
}

fn csv_reader<R: Read>(delimiter: u8, has_headers: bool, rdr: R) -> csv::Reader<R> {
    ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(has_headers)
        .flexible(true)
        .from_reader(rdr)
}

fn utf8_fields(record: &ByteRecord) -> std::result::Result<Vec<&str>, String> {
    record
        .iter()
        .map(|field| std::str::from_utf8(field).map_err(|e| format!("invalid UTF-8: {e}")))
        .collect()
}

impl Partitioner {
    /// Performs the first full scan and fingerprints the dataset.
    pub fn scan(source: Arc<DataSource>, config: &IngestConfig) -> Result<Self> {
        let policy = classify(source.size_hint())?;
        if !config.delimiter.is_ascii() {
            return Err(EdaError::Configuration(format!(
                "delimiter must be a single ASCII character, got {:?}",
                config.delimiter
            )));
        }
        let delimiter = config.delimiter as u8;

        let file = File::open(source.path())
            .with_context(|| format!("Failed to open {}", source.path().display()))?;
        let mut reader = csv_reader(delimiter, config.has_header, file);

        let mut names: Vec<String> = if config.has_header {
            reader
                .byte_headers()?
                .iter()
                .map(|h| String::from_utf8_lossy(h).trim().to_owned())
                .collect()
        } else {
            Vec::new()
        };

        let mut inference: Option<SchemaInference> =
            config.has_header.then(|| SchemaInference::new(names.clone()));
        let inference_rows = policy.rows_per_partition().map_or(u64::MAX, |n| n as u64);
        let rows_per_partition = policy.rows_per_partition().map(|n| n as u64);

        let mut record = ByteRecord::new();
        let mut offsets = Vec::new();
        let mut row_count: u64 = 0;

        while reader.read_byte_record(&mut record)? {
            let offset = record.position().map_or(0, csv::Position::byte);
            let starts_partition = match rows_per_partition {
                Some(rpp) => row_count % rpp == 0,
                None => row_count == 0,
            };
            if starts_partition {
                offsets.push(offset);
            }

            if row_count == 0 && names.is_empty() {
                names = (1..=record.len()).map(|i| format!("column_{i}")).collect();
                inference = Some(SchemaInference::new(names.clone()));
            }
            if row_count < inference_rows
                && let Some(inference) = inference.as_mut()
                && let Ok(fields) = utf8_fields(&record)
            {
                inference.observe(&fields);
            }
            row_count += 1;
        }

        let schema = match inference {
            Some(inference) => inference.finish(),
            None => SchemaInference::new(names).finish(),
        };
        let fingerprint = Fingerprint::compute(&schema, row_count);
        let dataset = Dataset {
            fingerprint,
            name: source.name().to_owned(),
            schema,
            row_count,
            byte_size: source.byte_size(),
            policy,
            partition_count: offsets.len(),
        };

        tracing::info!(
            dataset = %dataset.name,
            fingerprint = %dataset.fingerprint.short(),
            rows = row_count,
            columns = dataset.schema.len(),
            partitions = offsets.len(),
            "Scanned dataset, policy: {}",
            policy.describe()
        );

        Ok(Self {
            source,
            dataset: Arc::new(dataset),
            delimiter,
            rows_per_partition: rows_per_partition.unwrap_or(row_count.max(1)),
            offsets,
        })
    }

    pub fn dataset(&self) -> Arc<Dataset> {
        Arc::clone(&self.dataset)
    }

    pub fn policy(&self) -> PartitionPolicy {
        self.dataset.policy
    }

    pub fn partition_count(&self) -> usize {
        self.offsets.len()
    }

    /// The ordered partition descriptors. Each call starts a fresh sequence.
    pub fn partitions(&self) -> impl Iterator<Item = Partition> + '_ {
        let rows = self.dataset.row_count;
        let rpp = self.rows_per_partition;
        self.offsets
            .iter()
            .enumerate()
            .map(move |(index, &byte_offset)| {
                let start_row = index as u64 * rpp;
                Partition {
                    index,
                    start_row,
                    end_row: (start_row + rpp).min(rows),
                    byte_offset,
                }
            })
    }

    /// Reads one partition, handing every row that coerces to the schema to
    /// `visit`. Rows that do not coerce are returned as [`RowError`]s.
    ///
    /// With a `budget`, the read gives up with [`PartitionFailure::Timeout`]
    /// once the budget is spent.
    pub fn read_partition<F>(
        &self,
        partition: &Partition,
        budget: Option<Duration>,
        mut visit: F,
    ) -> std::result::Result<PartitionOutcome, PartitionFailure>
    where
        F: FnMut(&[Cell<'_>]),
    {
        let started = Instant::now();
        let timed_out = || PartitionFailure::Timeout {
            after_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };

        let mut file =
            File::open(self.source.path()).map_err(|e| PartitionFailure::Io(e.to_string()))?;
        file.seek(SeekFrom::Start(partition.byte_offset))
            .map_err(|e| PartitionFailure::Io(e.to_string()))?;
        let mut reader = csv_reader(self.delimiter, false, file);

        let expected = usize::try_from(partition.len()).unwrap_or(usize::MAX);
        let schema: &Schema = &self.dataset.schema;
        let mut record = ByteRecord::new();
        let mut outcome = PartitionOutcome::default();

        for row_offset in 0..expected {
            if let Some(budget) = budget
                && row_offset % DEADLINE_CHECK_INTERVAL == 0
                && started.elapsed() >= budget
            {
                return Err(timed_out());
            }

            match reader.read_byte_record(&mut record) {
                Ok(true) => {}
                Ok(false) => {
                    return Err(PartitionFailure::Io(format!(
                        "unexpected end of data after {row_offset} of {expected} rows"
                    )));
                }
                Err(e) => return Err(PartitionFailure::Io(e.to_string())),
            }

            let mut cells = Vec::with_capacity(schema.len());
            let coerced = utf8_fields(&record).and_then(|fields| {
                schema.coerce(&fields, &mut cells)?;
                visit(&cells);
                Ok(())
            });
            match coerced {
                Ok(()) => outcome.rows_read += 1,
                Err(reason) => outcome.row_errors.push(RowError {
                    partition_index: partition.index,
                    row_offset,
                    reason,
                }),
            }
        }

        if let Some(budget) = budget
            && started.elapsed() >= budget
        {
            return Err(timed_out());
        }

        Ok(outcome)
    }
}
