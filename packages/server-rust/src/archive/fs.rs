//! Filesystem [`ArchiveSink`]: a local object-store stand-in.
//!
//! Objects land under a root directory using their object key as a relative
//! path; content type and metadata go to a `.meta.json` sidecar so a later
//! upload job can replay them against a real object store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::archive::{ArchiveObject, ArchiveSink};

#[derive(Serialize, Deserialize)]
struct Sidecar {
    content_type: String,
    metadata: HashMap<String, String>,
}

/// Archive sink writing objects beneath `root`.
pub struct FsArchive {
    root: PathBuf,
}

impl FsArchive {
    /// Creates a sink rooted at `root`. The directory is created lazily on
    /// the first `put`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, path: &str) -> PathBuf {
        // Object keys use forward slashes; join them as path components so
        // the layout is identical on every platform.
        path.split('/').fold(self.root.clone(), |p, seg| p.join(seg))
    }

    fn sidecar_path(object: &Path) -> PathBuf {
        let mut name = object.file_name().unwrap_or_default().to_os_string();
        name.push(".meta.json");
        object.with_file_name(name)
    }
}

#[async_trait]
impl ArchiveSink for FsArchive {
    async fn put(&self, path: &str, object: ArchiveObject) -> anyhow::Result<()> {
        let file = self.object_path(path);
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file, &object.data).await?;

        let sidecar = Sidecar {
            content_type: object.content_type,
            metadata: object.metadata,
        };
        tokio::fs::write(
            Self::sidecar_path(&file),
            serde_json::to_vec_pretty(&sidecar)?,
        )
        .await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> anyhow::Result<Option<ArchiveObject>> {
        let file = self.object_path(path);
        let data = match tokio::fs::read(&file).await {
            Ok(data) => Bytes::from(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let sidecar: Sidecar = match tokio::fs::read(Self::sidecar_path(&file)).await {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Sidecar {
                content_type: "application/octet-stream".to_string(),
                metadata: HashMap::new(),
            },
            Err(err) => return Err(err.into()),
        };

        Ok(Some(ArchiveObject {
            data,
            content_type: sidecar.content_type,
            metadata: sidecar.metadata,
        }))
    }
}
