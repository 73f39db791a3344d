//! In-memory [`ArchiveSink`] for tests and ephemeral deployments.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::archive::{ArchiveObject, ArchiveSink};

/// Archive sink that keeps every object in a concurrent map.
#[derive(Default)]
pub struct MemoryArchive {
    objects: DashMap<String, ArchiveObject>,
}

impl MemoryArchive {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the sink holds no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// All stored object paths, sorted. Test helper.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.objects.iter().map(|o| o.key().clone()).collect();
        paths.sort_unstable();
        paths
    }
}

#[async_trait]
impl ArchiveSink for MemoryArchive {
    async fn put(&self, path: &str, object: ArchiveObject) -> anyhow::Result<()> {
        self.objects.insert(path.to_string(), object);
        Ok(())
    }

    async fn get(&self, path: &str) -> anyhow::Result<Option<ArchiveObject>> {
        Ok(self.objects.get(path).map(|o| o.clone()))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::archive::{archive_metadata, ARCHIVE_CONTENT_TYPE};

    #[tokio::test]
    async fn put_get_round_trip() {
        let sink = MemoryArchive::new();
        let object = ArchiveObject {
            data: Bytes::from_static(b"{\"key\":\"k1\"}\n"),
            content_type: ARCHIVE_CONTENT_TYPE.to_string(),
            metadata: archive_metadata("tenant-a", chrono::Utc::now()),
        };

        sink.put("instance-archives/2024-06-01/tenant-a.jsonl", object)
            .await
            .unwrap();

        let fetched = sink
            .get("instance-archives/2024-06-01/tenant-a.jsonl")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.content_type, ARCHIVE_CONTENT_TYPE);
        assert_eq!(fetched.metadata["instance-id"], "tenant-a");
        assert!(fetched.data.starts_with(b"{"));
    }

    #[tokio::test]
    async fn get_absent_returns_none() {
        let sink = MemoryArchive::new();
        assert!(sink.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_overwrites() {
        let sink = MemoryArchive::new();
        for payload in ["one", "two"] {
            sink.put(
                "p",
                ArchiveObject {
                    data: Bytes::copy_from_slice(payload.as_bytes()),
                    content_type: ARCHIVE_CONTENT_TYPE.to_string(),
                    metadata: std::collections::HashMap::new(),
                },
            )
            .await
            .unwrap();
        }
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.get("p").await.unwrap().unwrap().data, "two");
    }
}
