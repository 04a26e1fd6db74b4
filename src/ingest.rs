//! Ingestion: size classification, schema inference and row-range partitioning.

pub mod classifier;
pub mod dataset;
pub mod partitioner;
pub mod schema;
pub mod source;

pub use classifier::{PartitionPolicy, classify};
pub use dataset::{Dataset, Fingerprint};
pub use partitioner::{Partition, PartitionOutcome, Partitioner};
pub use schema::{Cell, ColumnDef, ColumnType, Schema};
pub use source::DataSource;
