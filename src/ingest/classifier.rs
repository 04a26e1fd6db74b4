//! Picks a partition policy from the size of the input.

use crate::error::{EdaError, Result};
use serde::{Deserialize, Serialize};

pub const MB: i64 = 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionPolicy {
    /// More than 100 MB
    Large,
    /// 50 to 100 MB
    Medium,
    /// 20 to 50 MB
    Small,
    /// Under 20 MB: the whole dataset is a single partition
    Whole,
}

impl PartitionPolicy {
    /// Rows per partition, or `None` for a single partition.
    pub fn rows_per_partition(self) -> Option<usize> {
        match self {
            Self::Large => Some(2000),
            Self::Medium => Some(3000),
            Self::Small => Some(5000),
            Self::Whole => None,
        }
    }

    pub fn describe(self) -> String {
        match self.rows_per_partition() {
            Some(rows) => format!("{rows} rows per partition"),
            None => "single partition".to_owned(),
        }
    }
}

/// Classifies a dataset by byte size.
///
/// An unknown size (a stream without a declared length) is treated as the
/// largest class. A negative size is a configuration error.
pub fn classify(size: Option<i64>) -> Result<PartitionPolicy> {
    let Some(size) = size else {
        return Ok(PartitionPolicy::Large);
    };
    if size < 0 {
        return Err(EdaError::Configuration(format!(
            "dataset size cannot be negative ({size} bytes)"
        )));
    }

    Ok(if size > 100 * MB {
        PartitionPolicy::Large
    } else if size >= 50 * MB {
        PartitionPolicy::Medium
    } else if size >= 20 * MB {
        PartitionPolicy::Small
    } else {
        PartitionPolicy::Whole
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds() {
        assert_eq!(classify(Some(0)).ok(), Some(PartitionPolicy::Whole));
        assert_eq!(classify(Some(20 * MB - 1)).ok(), Some(PartitionPolicy::Whole));
        assert_eq!(classify(Some(20 * MB)).ok(), Some(PartitionPolicy::Small));
        assert_eq!(classify(Some(50 * MB - 1)).ok(), Some(PartitionPolicy::Small));
        assert_eq!(classify(Some(50 * MB)).ok(), Some(PartitionPolicy::Medium));
        assert_eq!(classify(Some(100 * MB)).ok(), Some(PartitionPolicy::Medium));
        assert_eq!(classify(Some(100 * MB + 1)).ok(), Some(PartitionPolicy::Large));
    }

    #[test]
    fn test_rows_per_partition() {
        assert_eq!(PartitionPolicy::Large.rows_per_partition(), Some(2000));
        assert_eq!(PartitionPolicy::Medium.rows_per_partition(), Some(3000));
        assert_eq!(PartitionPolicy::Small.rows_per_partition(), Some(5000));
        assert_eq!(PartitionPolicy::Whole.rows_per_partition(), None);
    }

    #[test]
    fn test_unknown_size_is_conservative() {
        assert_eq!(classify(None).ok(), Some(PartitionPolicy::Large));
    }

    #[test]
    fn test_negative_size_is_configuration_error() {
        assert!(matches!(classify(Some(-1)), Err(EdaError::Configuration(_))));
    }
}
