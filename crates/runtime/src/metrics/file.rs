//! File-based metrics exporter.
//!
//! Writes JSON snapshots atomically using `tempfile` + rename to prevent
//! partial reads by monitoring tools.

use std::path::PathBuf;

use thiserror::Error;

use super::MetricsSnapshot;

/// Errors from the file exporter.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("metrics export failed: {0}")]
    Failed(String),
}

/// Exports metrics snapshots as JSON files using atomic writes.
pub struct FileExporter {
    path: PathBuf,
    pretty_print: bool,
}

impl FileExporter {
    /// Create a new file exporter, ensuring the parent directory exists.
    pub fn new(path: PathBuf, pretty_print: bool) -> Result<Self, ExportError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path, pretty_print })
    }

    /// Write a snapshot. The rename is atomic so readers never observe a
    /// partial file.
    pub async fn export(&self, snapshot: &MetricsSnapshot) -> Result<(), ExportError> {
        let json = if self.pretty_print {
            serde_json::to_string_pretty(snapshot)?
        } else {
            serde_json::to_string(snapshot)?
        };

        let path = self.path.clone();

        // Blocking filesystem work stays off the async worker threads.
        tokio::task::spawn_blocking(move || -> Result<(), ExportError> {
            use std::io::Write;

            let parent = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
            tmp.write_all(json.as_bytes())?;
            tmp.flush()?;
            tmp.persist(&path)
                .map_err(|e| ExportError::Failed(format!("persist {}: {}", path.display(), e)))?;
            Ok(())
        })
        .await
        .map_err(|e| ExportError::Failed(format!("blocking task panicked: {e}")))??;

        tracing::debug!("metrics snapshot written to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;

    #[tokio::test]
    async fn write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");

        let registry = MetricsRegistry::new();
        registry.incr("llm.calls.total", 7);

        let exporter = FileExporter::new(path.clone(), true).unwrap();
        exporter.export(&registry.snapshot()).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let loaded: MetricsSnapshot = serde_json::from_str(&content).unwrap();
        assert_eq!(loaded.counters["llm.calls.total"], 7);
    }

    #[tokio::test]
    async fn creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deep").join("metrics.json");

        let exporter = FileExporter::new(path.clone(), false).unwrap();
        exporter
            .export(&MetricsRegistry::new().snapshot())
            .await
            .unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn overwrites_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overwrite.json");
        let exporter = FileExporter::new(path.clone(), false).unwrap();

        let registry = MetricsRegistry::new();
        exporter.export(&registry.snapshot()).await.unwrap();
        registry.incr("events.published", 1);
        exporter.export(&registry.snapshot()).await.unwrap();

        let loaded: MetricsSnapshot =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.counters["events.published"], 1);
    }
}
