use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Canonical result for a content fingerprint. Created on the first
/// successful execution for that fingerprint, read-only afterward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupEntry {
    pub fingerprint: String,
    pub output_ref: String,
    /// The record whose execution produced the canonical artifact.
    pub source_record_id: String,
}

impl DedupEntry {
    pub fn new(
        fingerprint: impl Into<String>,
        output_ref: impl Into<String>,
        source_record_id: impl Into<String>,
    ) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            output_ref: output_ref.into(),
            source_record_id: source_record_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// This writer committed the canonical entry.
    Published,
    /// Another writer won; the caller adopts this canonical entry.
    AlreadyPublished(DedupEntry),
}

/// Maps content fingerprints to canonical results so records sharing one
/// underlying source produce one unit of external work. First committed
/// write wins; later writers adopt the canonical reference.
#[async_trait]
pub trait DedupIndex: Send + Sync {
    async fn lookup(&self, fingerprint: &str) -> Result<Option<DedupEntry>>;

    async fn publish(&self, entry: DedupEntry) -> Result<PublishOutcome>;
}

/// In-memory index, interface-identical to the SQLite backend.
#[derive(Default)]
pub struct MemoryDedupIndex {
    entries: DashMap<String, DedupEntry>,
}

impl MemoryDedupIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DedupIndex for MemoryDedupIndex {
    async fn lookup(&self, fingerprint: &str) -> Result<Option<DedupEntry>> {
        Ok(self.entries.get(fingerprint).map(|e| e.clone()))
    }

    async fn publish(&self, entry: DedupEntry) -> Result<PublishOutcome> {
        match self.entries.entry(entry.fingerprint.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                Ok(PublishOutcome::AlreadyPublished(existing.get().clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(PublishOutcome::Published)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_absent() {
        let index = MemoryDedupIndex::new();
        assert!(index.lookup("example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_first_writer_wins() {
        let index = MemoryDedupIndex::new();

        let first = index
            .publish(DedupEntry::new("example.com", "artifact-1", "d-1"))
            .await
            .unwrap();
        assert_eq!(first, PublishOutcome::Published);

        let second = index
            .publish(DedupEntry::new("example.com", "artifact-2", "d-2"))
            .await
            .unwrap();
        match second {
            PublishOutcome::AlreadyPublished(canonical) => {
                assert_eq!(canonical.output_ref, "artifact-1");
                assert_eq!(canonical.source_record_id, "d-1");
            }
            other => panic!("Expected AlreadyPublished, got {other:?}"),
        }

        // The canonical entry is untouched by the losing publish.
        let entry = index.lookup("example.com").await.unwrap().unwrap();
        assert_eq!(entry.output_ref, "artifact-1");
    }

    #[tokio::test]
    async fn test_concurrent_publish_single_canonical() {
        use std::sync::Arc;

        let index = Arc::new(MemoryDedupIndex::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let index = index.clone();
            handles.push(tokio::spawn(async move {
                index
                    .publish(DedupEntry::new(
                        "example.com",
                        format!("artifact-{i}"),
                        format!("d-{i}"),
                    ))
                    .await
                    .unwrap()
            }));
        }

        let mut published = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), PublishOutcome::Published) {
                published += 1;
            }
        }
        assert_eq!(published, 1);
    }
}
