//! Durable destination for consolidated pixel results.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::consolidator::{SelectedResult, Selection};
use crate::error::SinkError;
use crate::message::{JobKey, Score};

/// Receives the one selected result of each completed pixel.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn write(&self, selected: &SelectedResult) -> Result<(), SinkError>;
}

/// Metadata written next to each result payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSidecar {
    pub nside: u32,
    pub pixel: u64,
    pub variant: u32,
    pub score: Score,
    pub selection: Selection,
    pub fit_failed: bool,
    pub variants_seen: usize,
    pub arrivals: usize,
}

/// Writes each result as `<root>/nside{NNNNNN}/pix{NNNNNNNNNNNN}.bin` with a
/// `.json` sidecar alongside.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the payload file for `key`, without extension.
    pub fn base_path(&self, key: &JobKey) -> PathBuf {
        self.root
            .join(format!("nside{:06}", key.nside))
            .join(format!("pix{:012}", key.pixel))
    }
}

/// Writes `contents` next to `path` and renames it into place.
async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}

#[async_trait]
impl ResultSink for DirectorySink {
    async fn write(&self, selected: &SelectedResult) -> Result<(), SinkError> {
        let result = &selected.result;
        let base = self.base_path(&result.job_key);
        if let Some(parent) = base.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let sidecar = ResultSidecar {
            nside: result.job_key.nside,
            pixel: result.job_key.pixel,
            variant: result.variant,
            score: result.score,
            selection: selected.selection,
            fit_failed: selected.selection == Selection::AllFailed,
            variants_seen: selected.variants_seen,
            arrivals: selected.arrivals,
        };
        let metadata = serde_json::to_vec_pretty(&sidecar)?;

        write_atomic(&base.with_extension("bin"), &result.payload)
            .await
            .map_err(|e| SinkError::WriteFailed {
                key: result.job_key.to_string(),
                reason: e.to_string(),
            })?;
        write_atomic(&base.with_extension("json"), &metadata).await?;

        debug!(key = %result.job_key, path = %base.display(), "Wrote pixel result");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ResultMessage;

    fn selected(score: Score, selection: Selection) -> SelectedResult {
        SelectedResult {
            result: ResultMessage::new(JobKey::new(8, 123), 4, score, b"best".to_vec()),
            selection,
            variants_seen: 7,
            arrivals: 8,
        }
    }

    #[test]
    fn test_path_layout() {
        let sink = DirectorySink::new("/data/out");
        assert_eq!(
            sink.base_path(&JobKey::new(8, 123)),
            PathBuf::from("/data/out/nside000008/pix000000000123")
        );
    }

    #[tokio::test]
    async fn test_write_payload_and_sidecar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = DirectorySink::new(dir.path());

        sink.write(&selected(Score::new(10.25), Selection::BestFit))
            .await
            .expect("write");

        let base = sink.base_path(&JobKey::new(8, 123));
        let payload = std::fs::read(base.with_extension("bin")).expect("payload");
        assert_eq!(payload, b"best");

        let sidecar: ResultSidecar =
            serde_json::from_slice(&std::fs::read(base.with_extension("json")).expect("sidecar"))
                .expect("parse sidecar");
        assert_eq!(sidecar.variant, 4);
        assert_eq!(sidecar.score.value(), 10.25);
        assert_eq!(sidecar.selection, Selection::BestFit);
        assert!(!sidecar.fit_failed);
        assert_eq!(sidecar.arrivals, 8);
    }

    #[tokio::test]
    async fn test_all_failed_marks_sidecar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = DirectorySink::new(dir.path());

        sink.write(&selected(Score::undefined(), Selection::AllFailed))
            .await
            .expect("write");

        let text = std::fs::read_to_string(
            sink.base_path(&JobKey::new(8, 123)).with_extension("json"),
        )
        .expect("sidecar");
        let value: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert!(value["score"].is_null());
        assert_eq!(value["selection"], "all_failed");
        assert_eq!(value["fit_failed"], true);
    }
}
