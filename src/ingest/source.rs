//! Input sources: a file on disk, or a byte stream spooled to a private
//! temporary file so partitions can be re-read.

use crate::error::{EdaError, Result, ResultExt as _};
use std::io::{Read, Write as _};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[derive(Debug)]
pub struct DataSource {
    name: String,
    path: PathBuf,
    byte_size: u64,
    declared_size: Option<i64>,
    /// A stream's length is only known if the caller declares it.
    discoverable: bool,
    // Deleted on drop, so spooled uploads never outlive the session.
    _spool: Option<NamedTempFile>,
}

impl DataSource {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to open dataset: {}", path.display()))?;
        if !metadata.is_file() {
            return Err(EdaError::Configuration(format!(
                "not a regular file: {}",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("dataset")
            .to_owned();

        Ok(Self {
            name,
            path: path.to_path_buf(),
            byte_size: metadata.len(),
            declared_size: None,
            discoverable: true,
            _spool: None,
        })
    }

    /// Spools a byte stream to a temp file.
    pub fn from_reader(
        name: impl Into<String>,
        mut reader: impl Read,
        declared_size: Option<i64>,
    ) -> Result<Self> {
        let mut spool = NamedTempFile::new().context("Failed to create spool file")?;
        let byte_size =
            std::io::copy(&mut reader, spool.as_file_mut()).context("Failed to spool input")?;
        spool.as_file_mut().flush()?;

        Ok(Self {
            name: name.into(),
            path: spool.path().to_path_buf(),
            byte_size,
            declared_size,
            discoverable: false,
            _spool: Some(spool),
        })
    }

    /// Overrides the size used for partition policy selection.
    #[must_use]
    pub fn with_declared_size(mut self, size: i64) -> Self {
        self.declared_size = Some(size);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes actually on disk.
    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    /// Size to classify by: the declared size, else the file length when the
    /// source is a file, else unknown.
    pub fn size_hint(&self) -> Option<i64> {
        self.declared_size.or_else(|| {
            self.discoverable
                .then(|| i64::try_from(self.byte_size).unwrap_or(i64::MAX))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_size_is_discoverable() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        file.write_all(b"a,b\n1,2\n")?;
        file.flush()?;

        let source = DataSource::from_path(file.path())?;
        assert_eq!(source.byte_size(), 8);
        assert_eq!(source.size_hint(), Some(8));

        let declared = source.with_declared_size(150 * 1024 * 1024);
        assert_eq!(declared.size_hint(), Some(150 * 1024 * 1024));
        Ok(())
    }

    #[test]
    fn test_stream_without_declared_size_is_unknown() -> Result<()> {
        let source = DataSource::from_reader("upload.csv", &b"a\n1\n"[..], None)?;
        assert_eq!(source.byte_size(), 4);
        assert_eq!(source.size_hint(), None);
        assert!(source.path().exists());

        let spool_path = source.path().to_path_buf();
        drop(source);
        assert!(!spool_path.exists(), "spool file should be removed on drop");
        Ok(())
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(DataSource::from_path("/nonexistent/data.csv").is_err());
    }
}
