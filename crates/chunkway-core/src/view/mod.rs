//! UI layer interface for Chunkway.
//!
//! The UI layer owns upload slots (one per file input) and renders the
//! progress reported by entries. The engine talks to it through
//! [`UploadView`] and observes the slot's active reference set to detect
//! entries the UI has withdrawn.
//!
//! ## Reference Sets
//!
//! Each slot carries two reference sets, both readable from and writable as
//! comma-separated lists:
//!
//! - **active**: entries the UI still wants uploaded; dropping a token from
//!   this set cancels the matching entry
//! - **preflighted**: entries the endpoint has accepted during preflight

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::file::{FileRef, UploadFile};

/// A set of reference tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveRefs(BTreeSet<FileRef>);

impl ActiveRefs {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a comma-separated list of tokens, ignoring blanks.
    #[must_use]
    pub fn parse(list: &str) -> Self {
        list.split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(FileRef::from)
            .collect()
    }

    /// Whether the set contains the token.
    pub fn contains(&self, entry_ref: &FileRef) -> bool {
        self.0.contains(entry_ref)
    }

    /// Add a token.
    pub fn insert(&mut self, entry_ref: FileRef) -> bool {
        self.0.insert(entry_ref)
    }

    /// Remove a token.
    pub fn remove(&mut self, entry_ref: &FileRef) -> bool {
        self.0.remove(entry_ref)
    }

    /// Number of tokens.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the tokens in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &FileRef> {
        self.0.iter()
    }
}

impl fmt::Display for ActiveRefs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for entry_ref in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            f.write_str(entry_ref.as_str())?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for ActiveRefs {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl FromIterator<FileRef> for ActiveRefs {
    fn from_iter<I: IntoIterator<Item = FileRef>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Progress update delivered to the UI layer.
///
/// Serializes as a bare percentage or as `{"error": reason}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressUpdate {
    /// Integer completion percentage (0-100)
    Percent(u8),
    /// Terminal failure
    Error {
        /// Failure reason
        #[serde(rename = "error")]
        reason: String,
    },
}

/// The UI layer as seen by the engine.
pub trait UploadView: Send + Sync {
    /// Report progress or a failure for one entry of a slot.
    fn push_file_progress(&self, slot: &UploadSlot, entry_ref: &FileRef, update: ProgressUpdate);

    /// Stop tracking a finished entry.
    fn untrack_file(&self, slot: &UploadSlot, entry_ref: &FileRef);

    /// Discard every file tracked by the slot.
    fn clear_files(&self, slot: &UploadSlot);
}

/// Observer invoked with the new active set whenever the slot is updated.
pub type SlotObserver = Arc<dyn Fn(&ActiveRefs) + Send + Sync>;

/// Handle for removing a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Debug, Default)]
struct SlotRefs {
    tracked: Vec<FileRef>,
    active: ActiveRefs,
    preflighted: ActiveRefs,
}

/// A UI-owned file input that entries are selected through.
pub struct UploadSlot {
    name: String,
    refs: Mutex<SlotRefs>,
    observers: Mutex<Vec<(ObserverId, SlotObserver)>>,
    next_observer: AtomicU64,
}

impl fmt::Debug for UploadSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadSlot")
            .field("name", &self.name)
            .field("refs", &*self.refs())
            .finish_non_exhaustive()
    }
}

impl UploadSlot {
    /// Create an empty slot.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            refs: Mutex::new(SlotRefs::default()),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(0),
        }
    }

    /// Slot name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn refs(&self) -> MutexGuard<'_, SlotRefs> {
        self.refs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a newly selected entry and mark it active.
    ///
    /// Does not notify observers.
    pub fn track(&self, entry_ref: FileRef) {
        let mut refs = self.refs();
        if !refs.tracked.contains(&entry_ref) {
            refs.tracked.push(entry_ref.clone());
        }
        refs.active.insert(entry_ref);
    }

    /// Stop tracking one entry.
    pub fn untrack(&self, entry_ref: &FileRef) {
        self.refs().tracked.retain(|r| r != entry_ref);
    }

    /// Discard every tracked entry.
    pub fn clear_tracked(&self) {
        self.refs().tracked.clear();
    }

    /// Tracked entries in selection order.
    pub fn tracked(&self) -> Vec<FileRef> {
        self.refs().tracked.clone()
    }

    /// Current active set.
    pub fn active_refs(&self) -> ActiveRefs {
        self.refs().active.clone()
    }

    /// Current preflighted set.
    pub fn preflighted_refs(&self) -> ActiveRefs {
        self.refs().preflighted.clone()
    }

    /// Replace the preflighted set.
    pub fn set_preflighted_refs(&self, refs: ActiveRefs) {
        self.refs().preflighted = refs;
    }

    /// Replace the active set and notify every observer.
    pub fn set_active_refs(&self, active: ActiveRefs) {
        self.refs().active = active.clone();
        self.notify(&active);
    }

    /// Replace the active set from its comma-separated form.
    pub fn set_active_attribute(&self, list: &str) {
        self.set_active_refs(ActiveRefs::parse(list));
    }

    /// Register an observer for active-set updates.
    pub fn observe(&self, observer: SlotObserver) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));
        id
    }

    /// Remove an observer. Unknown ids are ignored.
    pub fn unobserve(&self, id: ObserverId) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(existing, _)| *existing != id);
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn notify(&self, active: &ActiveRefs) {
        // Observers may unregister themselves, so call them without the lock.
        let observers: Vec<SlotObserver> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();

        for observer in observers {
            observer(active);
        }
    }

    /// Whether a file should be uploaded from this slot.
    ///
    /// Empty files are never active. A file not yet seen by the endpoint is
    /// active; otherwise it must be in the active set.
    pub fn is_active(&self, file: &UploadFile, is_new: bool) -> bool {
        file.size() > 0 && (is_new || self.refs().active.contains(&FileRef::generate(file)))
    }

    /// Whether a file is active and was accepted during preflight.
    pub fn is_preflighted(&self, file: &UploadFile, is_new: bool) -> bool {
        let preflighted = self.refs().preflighted.contains(&FileRef::generate(file));
        preflighted && self.is_active(file, is_new)
    }
}

/// A recorded call made on a [`MemoryView`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEvent {
    /// `push_file_progress`
    Progress {
        /// Entry token
        entry_ref: FileRef,
        /// Reported update
        update: ProgressUpdate,
    },
    /// `untrack_file`
    Untracked(FileRef),
    /// `clear_files`
    Cleared(String),
}

/// Headless [`UploadView`] that records every call in order.
///
/// Untrack and clear are applied to the slot's tracked list.
#[derive(Debug, Default)]
pub struct MemoryView {
    events: Mutex<Vec<ViewEvent>>,
}

impl MemoryView {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded events.
    pub fn events(&self) -> Vec<ViewEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Progress updates reported for one entry, in order.
    pub fn updates_for(&self, entry_ref: &FileRef) -> Vec<ProgressUpdate> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ViewEvent::Progress {
                    entry_ref: r,
                    update,
                } if &r == entry_ref => Some(update),
                _ => None,
            })
            .collect()
    }

    /// Percentages reported for one entry, in order.
    pub fn percents_for(&self, entry_ref: &FileRef) -> Vec<u8> {
        self.updates_for(entry_ref)
            .into_iter()
            .filter_map(|update| match update {
                ProgressUpdate::Percent(p) => Some(p),
                ProgressUpdate::Error { .. } => None,
            })
            .collect()
    }

    /// Failure reasons reported for one entry, in order.
    pub fn errors_for(&self, entry_ref: &FileRef) -> Vec<String> {
        self.updates_for(entry_ref)
            .into_iter()
            .filter_map(|update| match update {
                ProgressUpdate::Error { reason } => Some(reason),
                ProgressUpdate::Percent(_) => None,
            })
            .collect()
    }

    fn record(&self, event: ViewEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl UploadView for MemoryView {
    fn push_file_progress(&self, _slot: &UploadSlot, entry_ref: &FileRef, update: ProgressUpdate) {
        self.record(ViewEvent::Progress {
            entry_ref: entry_ref.clone(),
            update,
        });
    }

    fn untrack_file(&self, slot: &UploadSlot, entry_ref: &FileRef) {
        slot.untrack(entry_ref);
        self.record(ViewEvent::Untracked(entry_ref.clone()));
    }

    fn clear_files(&self, slot: &UploadSlot) {
        slot.clear_tracked();
        self.record(ViewEvent::Cleared(slot.name().to_string()));
    }
}
