//! File-backed artifact storage.
//!
//! Stage outputs land as JSON files under one root directory; the ledger
//! stores only the relative path (the `output_ref`). Writes go through a
//! temp file and rename so a crash never leaves a half-written artifact
//! behind a succeeded ledger row.

use recordflow_orchestration::ExecutorError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Write one artifact and return its `output_ref`.
    pub async fn write<T: Serialize>(
        &self,
        stage: &str,
        key: &str,
        value: &T,
    ) -> Result<String, ExecutorError> {
        let relative = format!("{stage}/{}.json", sanitize_key(key));
        let path = self.root.join(&relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(ExecutorError::transient)?;
        }

        let body = serde_json::to_vec_pretty(value).map_err(ExecutorError::permanent)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(ExecutorError::transient)?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(ExecutorError::transient)?;

        debug!(artifact = %relative, bytes = body.len(), "wrote artifact");
        Ok(relative)
    }

    /// Read back an artifact by the `output_ref` a previous stage stored.
    pub async fn read<T: DeserializeOwned>(&self, output_ref: &str) -> Result<T, ExecutorError> {
        let body = tokio::fs::read(self.root.join(output_ref))
            .await
            .map_err(|e| ExecutorError::permanent(format!("artifact {output_ref}: {e}")))?;
        serde_json::from_slice(&body).map_err(ExecutorError::permanent)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Keys come from record ids and normalized URLs; flatten them into safe
/// single-segment file names.
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());

        let output_ref = store
            .write("places", "d-1", &json!({ "name": "Sunny Days" }))
            .await
            .unwrap();
        assert_eq!(output_ref, "places/d-1.json");

        let value: serde_json::Value = store.read(&output_ref).await.unwrap();
        assert_eq!(value["name"], "Sunny Days");
    }

    #[tokio::test]
    async fn test_url_key_is_flattened() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());

        let output_ref = store
            .write("scrape", "https://host.example/a/b", &json!({}))
            .await
            .unwrap();
        assert_eq!(output_ref, "scrape/https---host-example-a-b.json");
        // The URL must not have created nested directories.
        assert!(dir.path().join(&output_ref).is_file());
    }

    #[tokio::test]
    async fn test_missing_artifact_is_permanent() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());

        let result: Result<serde_json::Value, _> = store.read("places/nope.json").await;
        assert!(result.unwrap_err().is_permanent());
    }
}
