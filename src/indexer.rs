//! Indexer interface (spec.md §6). The core ships one concrete backend — a
//! newline-delimited-JSON file sink — the OpenSearch/Prometheus backends named
//! in spec.md §1 stay external collaborators behind this trait.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use crate::error::IndexError;

/// Outcome of one `index()` call, matching the external interface in spec.md §6.
#[derive(Debug, Clone, Serialize, Default)]
pub struct IndexSummary {
    pub indexed: usize,
    pub errored: usize,
    pub message: String,
}

#[async_trait]
pub trait Indexer: Send + Sync {
    async fn index(&self, docs: &[serde_json::Value], metric_name: &str) -> Result<IndexSummary, IndexError>;
}

/// Appends one JSON document per line to `<dir>/<metric_name>.ndjson`.
pub struct LocalFileIndexer {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl LocalFileIndexer {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, lock: Mutex::new(()) })
    }
}

#[async_trait]
impl Indexer for LocalFileIndexer {
    async fn index(&self, docs: &[serde_json::Value], metric_name: &str) -> Result<IndexSummary, IndexError> {
        let _guard = self.lock.lock().unwrap();
        let path = self.dir.join(format!("{metric_name}.ndjson"));
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;

        let mut indexed = 0;
        let mut errored = 0;
        for doc in docs {
            match serde_json::to_string(doc) {
                Ok(line) => {
                    if writeln!(file, "{line}").is_ok() {
                        indexed += 1;
                    } else {
                        errored += 1;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to serialize document for indexing");
                    errored += 1;
                }
            }
        }

        Ok(IndexSummary {
            indexed,
            errored,
            message: format!("wrote {indexed} documents to {}", path.display()),
        })
    }
}

/// No-op indexer used by tests and by `destroy`/`version` CLI paths that never index.
pub struct NullIndexer;

#[async_trait]
impl Indexer for NullIndexer {
    async fn index(&self, docs: &[serde_json::Value], _metric_name: &str) -> Result<IndexSummary, IndexError> {
        Ok(IndexSummary { indexed: docs.len(), errored: 0, message: "discarded (null indexer)".to_string() })
    }
}
