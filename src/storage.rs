use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// Destination for generated images. Returns the public URL of the object.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, local_path: &Path, destination_key: &str) -> Result<String, StorageError>;
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// One row of the per-batch usage log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageLogEntry {
    #[serde(rename = "loja")]
    pub store: String,
    #[serde(rename = "url_count")]
    pub item_count: usize,
    pub total_tokens: u64,
    #[serde(rename = "total_cost_brl")]
    pub total_cost: f64,
}

#[async_trait]
pub trait UsageLogSink: Send + Sync {
    async fn record(&self, entry: &UsageLogEntry) -> Result<(), SinkError>;
}

/// Copies objects under a local directory. Used when no remote bucket is configured.
#[derive(Debug, Clone)]
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for LocalDirStore {
    async fn upload(&self, local_path: &Path, destination_key: &str) -> Result<String, StorageError> {
        let target = self.root.join(destination_key.trim_start_matches('/'));
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::Io(err.to_string()))?;
        }
        tokio::fs::copy(local_path, &target)
            .await
            .map_err(|err| StorageError::Io(err.to_string()))?;
        Ok(format!("file://{}", target.display()))
    }
}

/// Sink that only writes the entry to the log stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageLog;

#[async_trait]
impl UsageLogSink for TracingUsageLog {
    async fn record(&self, entry: &UsageLogEntry) -> Result<(), SinkError> {
        info!(
            target = "vitrine.pipeline",
            store = %entry.store,
            items = entry.item_count,
            total_tokens = entry.total_tokens,
            total_cost = entry.total_cost,
            "usage_logged"
        );
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_store_copies_under_key() {
        let root = tempfile::tempdir().unwrap();
        let source = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(source.path(), b"png").unwrap();
        let store = LocalDirStore::new(root.path());
        let url = store
            .upload(source.path(), "products/produto_1/20250101_000000_front_view.png")
            .await
            .expect("upload");
        let target = root.path().join("products/produto_1/20250101_000000_front_view.png");
        assert_eq!(std::fs::read(&target).unwrap(), b"png");
        assert!(url.starts_with("file://"));
    }

    #[test]
    fn usage_entry_uses_log_column_names() {
        let entry = UsageLogEntry {
            store: "leroy_merlin".into(),
            item_count: 2,
            total_tokens: 10,
            total_cost: 0.5,
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["loja"], "leroy_merlin");
        assert_eq!(value["url_count"], 2);
        assert_eq!(value["total_cost_brl"], 0.5);
    }
}
