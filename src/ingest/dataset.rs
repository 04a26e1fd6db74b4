use super::classifier::PartitionPolicy;
use super::schema::Schema;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// Stable identity of a dataset, derived from its schema and row count.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// SHA-256 over column names, declared types and the row count.
    ///
    /// Field and record separators keep `["ab", "c"]` and `["a", "bc"]` apart.
    pub fn compute(schema: &Schema, row_count: u64) -> Self {
        let mut hasher = Sha256::new();
        for col in schema.columns() {
            hasher.update(col.name.as_bytes());
            hasher.update([0x1f]);
            hasher.update(col.ty.as_str().as_bytes());
            hasher.update([0x1e]);
        }
        hasher.update(row_count.to_le_bytes());
        let hash = hasher.finalize();
        Self(format!("{hash:x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for logs and CLI output.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// A fingerprinted dataset. Created by the first full scan and never mutated;
/// a changed file produces a new `Dataset`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub fingerprint: Fingerprint,
    pub name: String,
    pub schema: Schema,
    pub row_count: u64,
    pub byte_size: u64,
    pub policy: PartitionPolicy,
    pub partition_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::schema::{ColumnDef, ColumnType};

    fn schema(cols: &[(&str, ColumnType)]) -> Schema {
        Schema::new(
            cols.iter()
                .map(|(name, ty)| ColumnDef {
                    name: (*name).to_owned(),
                    ty: *ty,
                })
                .collect(),
        )
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let s = schema(&[("a", ColumnType::Integer), ("b", ColumnType::Text)]);
        let fp1 = Fingerprint::compute(&s, 10);
        let fp2 = Fingerprint::compute(&s, 10);
        assert_eq!(fp1, fp2);
        assert_eq!(fp1.as_str().len(), 64);
        assert_eq!(fp1.short().len(), 12);
    }

    #[test]
    fn test_fingerprint_changes_with_shape() {
        let s = schema(&[("a", ColumnType::Integer)]);
        let other_type = schema(&[("a", ColumnType::Float)]);
        assert_ne!(Fingerprint::compute(&s, 10), Fingerprint::compute(&s, 11));
        assert_ne!(
            Fingerprint::compute(&s, 10),
            Fingerprint::compute(&other_type, 10)
        );

        let split1 = schema(&[("ab", ColumnType::Text), ("c", ColumnType::Text)]);
        let split2 = schema(&[("a", ColumnType::Text), ("bc", ColumnType::Text)]);
        assert_ne!(
            Fingerprint::compute(&split1, 1),
            Fingerprint::compute(&split2, 1)
        );
    }
}
