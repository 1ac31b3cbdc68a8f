//! Metadata store over a directory of JSON record documents.
//!
//! Ingestion writes one `<path>.json` [`FileRecord`] document per
//! logical file, mirroring the logical hierarchy under a metadata root;
//! this store consumes that layout read-only. Directories are real
//! directories, so `readdir` is a filesystem listing.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::warn;

use spoolfs_core::{DirEntry, FileRecord, MetadataError, MetadataStore};

/// Suffix of record documents.
const RECORD_SUFFIX: &str = ".json";

/// Read-only [`MetadataStore`] over a metadata directory.
pub struct DirMetadataStore {
    root: PathBuf,
}

impl DirMetadataStore {
    /// Store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a logical path under the root, rejecting traversal.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let mut out = self.root.clone();
        for component in path.split('/') {
            match component {
                "" => continue,
                "." | ".." => return None,
                c if c.contains('\0') => return None,
                c => out.push(c),
            }
        }
        Some(out)
    }
}

#[async_trait]
impl MetadataStore for DirMetadataStore {
    async fn stat(&self, path: &str) -> Result<Option<FileRecord>, MetadataError> {
        let Some(resolved) = self.resolve(path) else {
            return Ok(None);
        };
        let record_path = PathBuf::from(format!("{}{RECORD_SUFFIX}", resolved.display()));
        let bytes = match tokio::fs::read(&record_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| MetadataError::Corrupt {
                path: path.to_string(),
                reason: e.to_string(),
            })
    }

    async fn readdir(&self, path: &str) -> Result<Option<Vec<DirEntry>>, MetadataError> {
        let Some(dir) = self.resolve(path) else {
            return Ok(None);
        };
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                let mtime = entry
                    .metadata()
                    .await
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                entries.push(DirEntry {
                    name: name.to_string(),
                    is_dir: true,
                    size: 0,
                    mtime,
                });
            } else if let Some(stem) = name.strip_suffix(RECORD_SUFFIX) {
                let bytes = tokio::fs::read(entry.path()).await?;
                let record: FileRecord = match serde_json::from_slice(&bytes) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(file = name, error = %e, "skipping corrupt record document");
                        continue;
                    }
                };
                entries.push(DirEntry {
                    name: stem.to_string(),
                    is_dir: false,
                    size: record.size,
                    mtime: record.mtime,
                });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Some(entries))
    }
}

/// Write a record document where [`DirMetadataStore`] will find it.
/// Test/tooling helper; the daemon never writes metadata.
pub fn write_record(root: &Path, path: &str, record: &FileRecord) -> io::Result<()> {
    let full = root.join(format!("{path}{RECORD_SUFFIX}"));
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(full, serde_json::to_vec_pretty(record)?)
}
