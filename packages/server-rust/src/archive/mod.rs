//! Archive sink (L4): where instance dumps go when an instance is cleaned up.
//!
//! Object storage is an external collaborator; the core only needs a narrow
//! put/get surface and the fixed object-key layout
//! `instance-archives/{YYYY-MM-DD}/{instance_id}.jsonl`.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

pub mod fs;
pub mod memory;

pub use fs::FsArchive;
pub use memory::MemoryArchive;

/// Content type for JSON Lines instance dumps.
pub const ARCHIVE_CONTENT_TYPE: &str = "application/x-jsonlines";

/// Object metadata key carrying the archived instance id.
pub const META_INSTANCE_ID: &str = "instance-id";

/// Object metadata key carrying the archive timestamp.
pub const META_ARCHIVE_TIME: &str = "archive-time";

/// One stored archive object.
#[derive(Debug, Clone)]
pub struct ArchiveObject {
    /// Raw object bytes (JSON Lines).
    pub data: Bytes,
    /// MIME content type.
    pub content_type: String,
    /// Free-form object metadata.
    pub metadata: HashMap<String, String>,
}

/// Narrow interface over an object store.
///
/// Shared as `Arc<dyn ArchiveSink>`. `get` exists so cleanup tests and
/// restore tooling can read archives back; production sinks may serve it
/// from the same bucket they write to.
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    /// Stores one object, overwriting any previous object at `path`.
    async fn put(&self, path: &str, object: ArchiveObject) -> anyhow::Result<()>;

    /// Fetches one object, or `None` when absent.
    async fn get(&self, path: &str) -> anyhow::Result<Option<ArchiveObject>>;
}

/// Builds the object key for one instance dump:
/// `instance-archives/{YYYY-MM-DD}/{instance_id}.jsonl`.
#[must_use]
pub fn archive_path(archived_at: DateTime<Utc>, instance_id: &str) -> String {
    format!(
        "instance-archives/{}/{instance_id}.jsonl",
        archived_at.format("%Y-%m-%d"),
    )
}

/// Builds the standard metadata map for one instance dump.
#[must_use]
pub fn archive_metadata(
    instance_id: &str,
    archived_at: DateTime<Utc>,
) -> HashMap<String, String> {
    HashMap::from([
        (META_INSTANCE_ID.to_string(), instance_id.to_string()),
        (META_ARCHIVE_TIME.to_string(), archived_at.to_rfc3339()),
    ])
}
