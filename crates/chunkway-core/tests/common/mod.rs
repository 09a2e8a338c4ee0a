//! Common test utilities for `Chunkway` integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chunkway_core::entry::UploadEntry;
use chunkway_core::file::UploadFile;
use chunkway_core::preflight::EntryMeta;
use chunkway_core::view::{MemoryView, UploadSlot};

/// Create a temporary directory for test files.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent directories");
    }
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// A slot with its recording view.
pub struct Fixture {
    pub slot: Arc<UploadSlot>,
    pub view: Arc<MemoryView>,
}

impl Fixture {
    pub fn new(name: &str) -> Self {
        Self {
            slot: Arc::new(UploadSlot::new(name)),
            view: Arc::new(MemoryView::new()),
        }
    }

    /// Select an in-memory file of `len` random bytes.
    pub fn select_bytes(&self, name: &str, len: usize) -> Arc<UploadEntry> {
        let file =
            UploadFile::from_bytes(name, "application/octet-stream", 0, random_bytes(len));
        self.select(file)
    }

    /// Select `file` through the slot.
    pub fn select(&self, file: UploadFile) -> Arc<UploadEntry> {
        let entry = UploadEntry::new(file, Arc::clone(&self.slot), self.view.clone());
        self.slot.track(entry.entry_ref().clone());
        entry
    }

    /// Select an in-memory file with metadata already attached.
    pub fn ready_bytes(&self, name: &str, len: usize) -> Arc<UploadEntry> {
        let entry = self.select_bytes(name, len);
        entry.set_metadata(EntryMeta::default());
        entry
    }
}
