//! UI utilities for Chunkway CLI.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chunkway_core::file::FileRef;
use chunkway_core::view::{ProgressUpdate, UploadSlot, UploadView};

/// Step between printed progress lines, in percent.
const PROGRESS_STEP: u8 = 10;

#[derive(Default)]
struct FileLine {
    name: String,
    printed: Option<u8>,
    failed: Option<String>,
}

/// Prints per-file progress to the terminal.
#[derive(Default)]
pub struct TerminalView {
    quiet: bool,
    files: Mutex<HashMap<FileRef, FileLine>>,
}

impl TerminalView {
    /// Create a view; a quiet view only prints failures.
    #[must_use]
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Name the file shown for `entry_ref`.
    pub fn register(&self, entry_ref: &FileRef, name: &str) {
        self.lock().insert(
            entry_ref.clone(),
            FileLine {
                name: name.to_string(),
                ..FileLine::default()
            },
        );
    }

    /// Failure reason reported for `entry_ref`, if any.
    pub fn failure(&self, entry_ref: &FileRef) -> Option<String> {
        self.lock().get(entry_ref).and_then(|line| line.failed.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<FileRef, FileLine>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide whether `percent` is worth a line after `printed`.
    fn should_print(printed: Option<u8>, percent: u8) -> bool {
        match printed {
            None => true,
            Some(last) => percent == 100 || percent / PROGRESS_STEP > last / PROGRESS_STEP,
        }
    }
}

impl UploadView for TerminalView {
    fn push_file_progress(&self, _slot: &UploadSlot, entry_ref: &FileRef, update: ProgressUpdate) {
        let mut files = self.lock();
        let line = files.entry(entry_ref.clone()).or_insert_with(|| FileLine {
            name: entry_ref.to_string(),
            ..FileLine::default()
        });

        match update {
            ProgressUpdate::Percent(percent) => {
                if !self.quiet && Self::should_print(line.printed, percent) {
                    line.printed = Some(percent);
                    println!("  [{:>3}%] {}", percent, line.name);
                }
            }
            ProgressUpdate::Error { reason } => {
                eprintln!("  [fail] {}: {}", line.name, reason);
                line.failed = Some(reason);
            }
        }
    }

    fn untrack_file(&self, slot: &UploadSlot, entry_ref: &FileRef) {
        slot.untrack(entry_ref);
    }

    fn clear_files(&self, slot: &UploadSlot) {
        slot.clear_tracked();
    }
}

/// Parse a bounding box like "800x600".
pub fn parse_resize(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .trim()
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{s}'"))?;
    let w: u32 = w.parse().map_err(|e| format!("invalid width '{w}': {e}"))?;
    let h: u32 = h.parse().map_err(|e| format!("invalid height '{h}': {e}"))?;
    if w == 0 || h == 0 {
        return Err("width and height must be greater than zero".to_string());
    }
    Ok((w, h))
}
