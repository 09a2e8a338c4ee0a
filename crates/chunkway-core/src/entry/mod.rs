//! Upload entries.
//!
//! An [`UploadEntry`] is one file selected through an [`UploadSlot`]. It is
//! owned by the UI layer and mutated by the engine: uploaders report
//! progress through it, and it forwards each new integer percentage to the
//! [`UploadView`] exactly once.
//!
//! ## Lifecycle
//!
//! ```text
//! selected --zip_postflight--> ready --progress(100)--> done
//!                                 \---cancel()-------> done + cancelled
//! ```
//!
//! The entry observes its slot's active set from construction until it
//! reaches a terminal state (or errors). Dropping its token from the active
//! set cancels it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio_util::sync::CancellationToken;

use crate::file::{FileRef, UploadFile};
use crate::preflight::{EntryMeta, PreflightPayload, PreflightResponse};
use crate::view::{ObserverId, ProgressUpdate, UploadSlot, UploadView};

/// Completion callback for an entry or uploader.
pub type DoneCallback = Box<dyn FnOnce() + Send>;

struct EntryState {
    file: UploadFile,
    meta: Option<EntryMeta>,
    progress: u8,
    last_progress_sent: Option<u8>,
    done: bool,
    cancelled: bool,
    errored: bool,
    on_done: Option<DoneCallback>,
    observer: Option<ObserverId>,
}

/// One selected file and its transfer progress.
pub struct UploadEntry {
    entry_ref: FileRef,
    slot: Arc<UploadSlot>,
    view: Arc<dyn UploadView>,
    cancellation: CancellationToken,
    state: Mutex<EntryState>,
}

impl std::fmt::Debug for UploadEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("UploadEntry")
            .field("ref", &self.entry_ref)
            .field("slot", &self.slot.name())
            .field("file", &state.file.name())
            .field("progress", &state.progress)
            .field("done", &state.done)
            .field("cancelled", &state.cancelled)
            .finish_non_exhaustive()
    }
}

impl UploadEntry {
    /// Select `file` through `slot`, deriving the token from the file.
    pub fn new(file: UploadFile, slot: Arc<UploadSlot>, view: Arc<dyn UploadView>) -> Arc<Self> {
        let entry_ref = FileRef::generate(&file);
        Self::with_ref(entry_ref, file, slot, view)
    }

    /// Select `file` under an explicitly chosen token.
    pub fn with_ref(
        entry_ref: FileRef,
        file: UploadFile,
        slot: Arc<UploadSlot>,
        view: Arc<dyn UploadView>,
    ) -> Arc<Self> {
        let entry = Arc::new(Self {
            entry_ref,
            slot,
            view,
            cancellation: CancellationToken::new(),
            state: Mutex::new(EntryState {
                file,
                meta: None,
                progress: 0,
                last_progress_sent: None,
                done: false,
                cancelled: false,
                errored: false,
                on_done: None,
                observer: None,
            }),
        });

        let weak: Weak<Self> = Arc::downgrade(&entry);
        let id = entry.slot.observe(Arc::new(move |active| {
            if let Some(entry) = weak.upgrade() {
                if !active.contains(&entry.entry_ref) {
                    entry.cancel();
                }
            }
        }));
        entry.state().observer = Some(id);

        entry
    }

    fn state(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reference token.
    pub fn entry_ref(&self) -> &FileRef {
        &self.entry_ref
    }

    /// Slot the entry was selected through.
    pub fn slot(&self) -> &Arc<UploadSlot> {
        &self.slot
    }

    /// Backing file (a cheap clone of the handle).
    pub fn file(&self) -> UploadFile {
        self.state().file.clone()
    }

    /// Replace the backing file, e.g. with a transformed version.
    pub fn replace_file(&self, file: UploadFile) {
        self.state().file = file;
    }

    /// Negotiated metadata, if preflight has run.
    pub fn metadata(&self) -> Option<EntryMeta> {
        self.state().meta.clone()
    }

    /// Assign metadata directly.
    pub fn set_metadata(&self, meta: EntryMeta) {
        self.state().meta = Some(meta);
    }

    /// Last integer percentage recorded.
    pub fn progress_percent(&self) -> u8 {
        self.state().progress
    }

    /// Whether the entry reached 100% or was cancelled.
    pub fn is_done(&self) -> bool {
        self.state().done
    }

    /// Whether the entry was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state().cancelled
    }

    /// Whether a failure was reported for the entry.
    pub fn is_errored(&self) -> bool {
        self.state().errored
    }

    /// Token cancelled together with the entry.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Register the completion callback, replacing any previous one.
    ///
    /// It runs at most once, on reaching 100% or on cancellation.
    pub fn on_done(&self, callback: impl FnOnce() + Send + 'static) {
        self.state().on_done = Some(Box::new(callback));
    }

    /// Record fractional progress in `[0, 100]`.
    ///
    /// Only integer percentages above the last one reported reach the UI.
    /// Reaching 100 completes the entry.
    pub fn progress(&self, progress: f64) {
        let percent = whole_percent(progress);

        let (completed, on_done, observer) = {
            let mut state = self.state();
            if state.done || state.errored {
                return;
            }
            if state.last_progress_sent.is_some_and(|sent| percent <= sent) {
                return;
            }

            state.progress = percent;
            state.last_progress_sent = Some(percent);
            if percent < 100 {
                (false, None, None)
            } else {
                state.done = true;
                (true, state.on_done.take(), state.observer.take())
            }
        };

        self.view.push_file_progress(
            &self.slot,
            &self.entry_ref,
            ProgressUpdate::Percent(percent),
        );

        if completed {
            tracing::debug!("Entry {} complete", self.entry_ref);
            if let Some(id) = observer {
                self.slot.unobserve(id);
            }
            self.view.untrack_file(&self.slot, &self.entry_ref);
            if let Some(callback) = on_done {
                callback();
            }
        }
    }

    /// Cancel the entry. Terminal; later calls and calls after completion
    /// are no-ops.
    pub fn cancel(&self) {
        let (on_done, observer) = {
            let mut state = self.state();
            if state.done {
                return;
            }
            state.cancelled = true;
            state.done = true;
            (state.on_done.take(), state.observer.take())
        };

        tracing::debug!("Entry {} cancelled", self.entry_ref);
        self.cancellation.cancel();
        if let Some(id) = observer {
            self.slot.unobserve(id);
        }
        if let Some(callback) = on_done {
            callback();
        }
    }

    /// Report a terminal failure and reset the slot's tracked files.
    ///
    /// `None` reports the default reason. Only the first call has an effect.
    pub fn error(&self, reason: Option<&str>) {
        let observer = {
            let mut state = self.state();
            if state.errored {
                return;
            }
            state.errored = true;
            state.observer.take()
        };

        if let Some(id) = observer {
            self.slot.unobserve(id);
        }

        let reason = reason.unwrap_or(crate::DEFAULT_ERROR_REASON).to_string();
        tracing::debug!("Entry {} failed: {}", self.entry_ref, reason);
        self.view
            .push_file_progress(&self.slot, &self.entry_ref, ProgressUpdate::Error { reason });
        self.view.clear_files(&self.slot);
    }

    /// Description of the entry for the preflight request.
    pub fn to_preflight_payload(&self) -> PreflightPayload {
        let state = self.state();
        PreflightPayload {
            last_modified: state.file.last_modified(),
            name: state.file.name().to_string(),
            relative_path: state.file.relative_path().map(str::to_string),
            size: state.file.size(),
            mime_type: state.file.mime_type().to_string(),
            entry_ref: self.entry_ref.clone(),
        }
    }

    /// Attach this entry's metadata from a preflight response.
    ///
    /// Returns `false` (and logs) when the response has no metadata for it.
    pub fn zip_postflight(&self, resp: &PreflightResponse) -> bool {
        self.zip_entries(&resp.entries)
    }

    pub(crate) fn zip_entries(&self, entries: &HashMap<FileRef, EntryMeta>) -> bool {
        if let Some(meta) = entries.get(&self.entry_ref) {
            self.state().meta = Some(meta.clone());
            true
        } else {
            tracing::error!(
                "no preflight upload response returned with ref {} (slot {})",
                self.entry_ref,
                self.slot.name()
            );
            false
        }
    }

    /// Name of the uploader that should carry this entry, if metadata is set.
    pub fn uploader_name(&self) -> Option<String> {
        self.state()
            .meta
            .as_ref()
            .map(|meta| meta.uploader_name().to_string())
    }
}

// Clamped to [0, 100] first, so the cast cannot truncate.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn whole_percent(progress: f64) -> u8 {
    if progress.is_nan() {
        0
    } else {
        progress.clamp(0.0, 100.0).floor() as u8
    }
}
