//! File handles for Chunkway.
//!
//! This module handles:
//! - Backing files selected for upload (on disk or in memory)
//! - Reference token generation from file identity
//! - Byte-range reads used for chunking
//! - Name sanitization for endpoints that write to disk
//!
//! ## Reference Tokens
//!
//! A reference token is a hex-encoded xxh3 hash over the file's name, size,
//! last-modified timestamp and MIME type. Reselecting the same file yields
//! the same token.

use std::borrow::Borrow;
use std::fmt;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{Error, Result};

/// MIME type used when none can be guessed.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Stable reference token identifying one selected file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileRef(String);

impl FileRef {
    /// Generate the token for a file from its identity attributes.
    #[must_use]
    pub fn generate(file: &UploadFile) -> Self {
        let mut identity = Vec::with_capacity(file.name.len() + file.mime_type.len() + 32);
        identity.extend_from_slice(file.name.as_bytes());
        identity.push(0);
        identity.extend_from_slice(&file.size.to_le_bytes());
        identity.push(0);
        identity.extend_from_slice(&file.last_modified.to_le_bytes());
        identity.push(0);
        identity.extend_from_slice(file.mime_type.as_bytes());

        Self(format!("{:016x}", xxhash_rust::xxh3::xxh3_64(&identity)))
    }

    /// The token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for FileRef {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FileRef {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for FileRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Where the bytes of an upload file live.
#[derive(Clone)]
pub enum FileSource {
    /// A file on the local filesystem
    Path(PathBuf),
    /// An in-memory buffer
    Memory(Arc<[u8]>),
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Memory(bytes) => write!(f, "Memory({} bytes)", bytes.len()),
        }
    }
}

/// A file selected for upload.
///
/// The handle is read-only; multiple byte ranges may be read from it
/// concurrently.
#[derive(Debug, Clone)]
pub struct UploadFile {
    name: String,
    relative_path: Option<String>,
    size: u64,
    last_modified: i64,
    mime_type: String,
    source: FileSource,
}

impl UploadFile {
    /// Select a file from disk, capturing its identity attributes.
    ///
    /// # Errors
    ///
    /// Returns an error if the path does not exist or is not a regular file.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::InvalidPath(format!("{} does not exist", path.display()))
            } else {
                Error::Io(e)
            }
        })?;

        if !metadata.is_file() {
            return Err(Error::InvalidPath(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::InvalidPath(path.display().to_string()))?;

        let last_modified = metadata
            .modified()
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp_millis())
            .unwrap_or_default();

        let mime_type = mime_guess::from_path(path)
            .first()
            .map_or_else(|| DEFAULT_MIME_TYPE.to_string(), |m| m.essence_str().to_string());

        Ok(Self {
            name,
            relative_path: None,
            size: metadata.len(),
            last_modified,
            mime_type,
            source: FileSource::Path(path.to_path_buf()),
        })
    }

    /// Create a file backed by an in-memory buffer.
    #[must_use]
    pub fn from_bytes(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        last_modified: i64,
        bytes: impl Into<Arc<[u8]>>,
    ) -> Self {
        let bytes = bytes.into();
        Self {
            name: name.into(),
            relative_path: None,
            size: bytes.len() as u64,
            last_modified,
            mime_type: mime_type.into(),
            source: FileSource::Memory(bytes),
        }
    }

    /// Attach the path of the file relative to a selected directory.
    #[must_use]
    pub fn with_relative_path(mut self, relative_path: impl Into<String>) -> Self {
        self.relative_path = Some(relative_path.into());
        self
    }

    /// File name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path relative to a selected directory, if any.
    pub fn relative_path(&self) -> Option<&str> {
        self.relative_path.as_deref()
    }

    /// Size in bytes at selection time.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Last-modified timestamp in milliseconds since the Unix epoch.
    pub fn last_modified(&self) -> i64 {
        self.last_modified
    }

    /// MIME type.
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Backing source.
    pub fn source(&self) -> &FileSource {
        &self.source
    }

    /// Read the byte range `[start, start + len)`, clamped to the file size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadFailed`] if the backing file cannot be read.
    pub async fn read_range(&self, start: u64, len: u64) -> Result<Vec<u8>> {
        let end = start.saturating_add(len).min(self.size);
        if start >= end {
            return Ok(Vec::new());
        }

        match &self.source {
            FileSource::Memory(bytes) => {
                let (start, end) = (
                    usize::try_from(start).unwrap_or(usize::MAX),
                    usize::try_from(end).unwrap_or(usize::MAX),
                );
                Ok(bytes.get(start..end.min(bytes.len())).unwrap_or_default().to_vec())
            }
            FileSource::Path(path) => read_path_range(path, start, end)
                .await
                .map_err(|source| Error::ReadFailed {
                    file: self.name.clone(),
                    start,
                    end,
                    source,
                }),
        }
    }

    /// Read the whole file into memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadFailed`] if the backing file cannot be read.
    pub async fn read_all(&self) -> Result<Vec<u8>> {
        self.read_range(0, self.size).await
    }
}

async fn read_path_range(path: &Path, start: u64, end: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;

    let capacity = usize::try_from(end - start).unwrap_or_default();
    let mut buffer = Vec::with_capacity(capacity);
    file.take(end - start).read_to_end(&mut buffer).await?;
    Ok(buffer)
}

/// Sanitize a file name supplied by a client before writing it under `base`.
///
/// Returns `None` for names that would escape `base`.
#[must_use]
pub fn sanitize_file_name(base: &Path, name: &str) -> Option<PathBuf> {
    let relative = Path::new(name);
    let mut components = relative.components();

    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Some(base.join(relative)),
        _ => None,
    }
}

/// Format a file size for display.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn memory_file(name: &str, len: usize) -> UploadFile {
        UploadFile::from_bytes(name, "text/plain", 1_700_000_000_000, vec![7u8; len])
    }

    #[test]
    fn test_file_ref_is_deterministic() {
        let a = memory_file("report.txt", 100);
        let b = memory_file("report.txt", 100);
        assert_eq!(FileRef::generate(&a), FileRef::generate(&b));
        assert_eq!(FileRef::generate(&a).as_str().len(), 16);
    }

    #[test]
    fn test_file_ref_changes_with_identity() {
        let base = FileRef::generate(&memory_file("report.txt", 100));
        assert_ne!(base, FileRef::generate(&memory_file("report.txt", 101)));
        assert_ne!(base, FileRef::generate(&memory_file("other.txt", 100)));

        let retyped = UploadFile::from_bytes("report.txt", "text/csv", 1_700_000_000_000, vec![7u8; 100]);
        assert_ne!(base, FileRef::generate(&retyped));
    }

    #[tokio::test]
    async fn test_read_range_clamps_to_size() {
        let bytes: Vec<u8> = (0..=255).collect();
        let file = UploadFile::from_bytes("bytes.bin", DEFAULT_MIME_TYPE, 0, bytes);

        let chunk = file.read_range(250, 100).await.unwrap();
        assert_eq!(chunk, vec![250, 251, 252, 253, 254, 255]);

        assert!(file.read_range(256, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_from_path_and_read_range() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.txt");
        std::fs::write(&path, b"0123456789").unwrap();

        let file = UploadFile::from_path(&path).await.unwrap();
        assert_eq!(file.name(), "data.txt");
        assert_eq!(file.size(), 10);
        assert_eq!(file.mime_type(), "text/plain");

        assert_eq!(file.read_range(3, 4).await.unwrap(), b"3456");
        assert_eq!(file.read_range(8, 4).await.unwrap(), b"89");
    }

    #[tokio::test]
    async fn test_read_range_reports_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.bin");
        std::fs::write(&path, b"abc").unwrap();

        let file = UploadFile::from_path(&path).await.unwrap();
        std::fs::remove_file(&path).unwrap();

        let err = file.read_range(0, 3).await.unwrap_err();
        assert!(matches!(err, Error::ReadFailed { start: 0, end: 3, .. }));
    }

    #[tokio::test]
    async fn test_from_path_rejects_directory() {
        let dir = TempDir::new().unwrap();
        let err = UploadFile::from_path(dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidPath(_)));
    }

    #[test]
    fn test_sanitize_file_name() {
        let base = Path::new("/srv/uploads");
        assert_eq!(
            sanitize_file_name(base, "photo.png"),
            Some(PathBuf::from("/srv/uploads/photo.png"))
        );
        assert!(sanitize_file_name(base, "../etc/passwd").is_none());
        assert!(sanitize_file_name(base, "nested/photo.png").is_none());
        assert!(sanitize_file_name(base, "/etc/passwd").is_none());
        assert!(sanitize_file_name(base, "").is_none());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }
}
