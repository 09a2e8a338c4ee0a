//! Concurrency-capped scheduling of entry uploaders.
//!
//! A [`BatchCoordinator`] owns the uploaders of one preflight batch. When the
//! batch fits within `max_concurrency` every uploader starts at once.
//! Otherwise the coordinator runs scheduling passes: each pass counts the
//! uploaders in flight (started and not done) and starts candidates, in
//! selection order, until the cap is reached. Every uploader started by a
//! pass triggers another pass when it finishes, fails, or stops.
//!
//! Passes are serialized, so two completions racing each other never start
//! more uploaders than there are free slots.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use crate::channel::ChannelTransport;
use crate::entry::UploadEntry;
use crate::preflight::UploadSettings;
use crate::transform::BeforeUpload;
use crate::uploader::EntryUploader;

/// Drives a batch of uploaders under a concurrency cap.
pub struct BatchCoordinator {
    uploaders: Vec<Arc<EntryUploader>>,
    max_concurrency: usize,
    batched: AtomicBool,
    pass: Mutex<()>,
    peak_in_flight: AtomicUsize,
    finished: watch::Sender<usize>,
}

impl std::fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("uploaders", &self.uploaders.len())
            .field("max_concurrency", &self.max_concurrency)
            .field("batched", &self.is_batched())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl BatchCoordinator {
    /// Build uploaders for `entries` and start them.
    ///
    /// Must be called within a Tokio runtime.
    pub fn channel_uploader(
        entries: Vec<Arc<UploadEntry>>,
        settings: UploadSettings,
        transport: Arc<dyn ChannelTransport>,
        before_upload: Option<Arc<dyn BeforeUpload>>,
    ) -> Arc<Self> {
        let uploaders = entries
            .into_iter()
            .map(|entry| {
                EntryUploader::with_before_upload(
                    entry,
                    settings.chunk_size,
                    Arc::clone(&transport),
                    before_upload.clone(),
                )
            })
            .collect();

        let coordinator = Self::new(uploaders, settings.max_concurrency);
        coordinator.start();
        coordinator
    }

    /// Coordinate already-built uploaders without starting them.
    pub fn new(uploaders: Vec<Arc<EntryUploader>>, max_concurrency: usize) -> Arc<Self> {
        let (finished, _) = watch::channel(0);
        Arc::new(Self {
            uploaders,
            max_concurrency: max_concurrency.max(1),
            batched: AtomicBool::new(false),
            pass: Mutex::new(()),
            peak_in_flight: AtomicUsize::new(0),
            finished,
        })
    }

    /// Start the batch: everything at once when it fits, otherwise the
    /// first scheduling pass.
    pub fn start(self: &Arc<Self>) {
        if self.uploaders.len() <= self.max_concurrency {
            tracing::debug!("Starting {} uploaders unbatched", self.uploaders.len());
            for uploader in &self.uploaders {
                let coordinator = Arc::clone(self);
                uploader.upload(move || coordinator.on_finished(false));
            }
            self.record_peak();
        } else {
            tracing::debug!(
                "Batching {} uploaders, {} at a time",
                self.uploaders.len(),
                self.max_concurrency
            );
            self.batched.store(true, Ordering::SeqCst);
            self.schedule();
        }
    }

    /// Run one scheduling pass.
    pub fn schedule(self: &Arc<Self>) {
        let _pass = self.pass.lock().unwrap_or_else(PoisonError::into_inner);

        let candidates: Vec<&Arc<EntryUploader>> = self
            .uploaders
            .iter()
            .filter(|u| {
                !u.has_started()
                    && !u.is_done()
                    && !u.is_errored()
                    && !u.is_finished()
                    && !u.entry().is_cancelled()
            })
            .collect();
        if candidates.is_empty() {
            return;
        }

        let in_flight = self.in_flight();
        let slots = self.max_concurrency.saturating_sub(in_flight);
        tracing::trace!(
            "Scheduling pass: {} candidates, {in_flight} in flight, {slots} slots",
            candidates.len()
        );

        for uploader in candidates.into_iter().take(slots) {
            let coordinator = Arc::clone(self);
            uploader.upload(move || coordinator.on_finished(true));
        }
        self.record_peak();
    }

    fn on_finished(self: &Arc<Self>, reschedule: bool) {
        self.finished.send_modify(|n| *n += 1);
        if reschedule {
            self.schedule();
        }
    }

    fn record_peak(&self) {
        self.peak_in_flight
            .fetch_max(self.in_flight(), Ordering::SeqCst);
    }

    /// Uploaders started and not done.
    pub fn in_flight(&self) -> usize {
        self.uploaders
            .iter()
            .filter(|u| u.has_started() && !u.is_done())
            .count()
    }

    /// Highest in-flight count observed right after a start.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Whether the batch exceeded the cap and is being scheduled in passes.
    pub fn is_batched(&self) -> bool {
        self.batched.load(Ordering::SeqCst)
    }

    /// The coordinated uploaders, in selection order.
    pub fn uploaders(&self) -> &[Arc<EntryUploader>] {
        &self.uploaders
    }

    /// Whether every uploader has finished or will never start.
    pub fn is_settled(&self) -> bool {
        self.uploaders
            .iter()
            .all(|u| u.is_finished() || (!u.has_started() && u.entry().is_cancelled()))
    }

    /// Wait until the batch is settled.
    ///
    /// A stalled uploader never settles; cancel its entry to release it.
    pub async fn wait(&self) {
        let mut rx = self.finished.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|_| self.is_settled()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory::MemoryTransport;
    use crate::file::UploadFile;
    use crate::preflight::EntryMeta;
    use crate::view::{ActiveRefs, MemoryView, UploadSlot};

    fn entries(n: usize, len: usize) -> (Arc<UploadSlot>, Arc<MemoryView>, Vec<Arc<UploadEntry>>) {
        let slot = Arc::new(UploadSlot::new("files"));
        let view = Arc::new(MemoryView::new());
        let entries = (0..n)
            .map(|i| {
                let file = UploadFile::from_bytes(
                    format!("f{i}.bin"),
                    "application/octet-stream",
                    i as i64,
                    vec![i as u8; len],
                );
                let entry = UploadEntry::new(file, Arc::clone(&slot), view.clone());
                slot.track(entry.entry_ref().clone());
                entry.set_metadata(EntryMeta::default());
                entry
            })
            .collect();
        (slot, view, entries)
    }

    fn settings(chunk_size: u64, max_concurrency: usize) -> UploadSettings {
        UploadSettings {
            chunk_size,
            max_concurrency,
        }
    }

    #[tokio::test]
    async fn test_small_batch_starts_everything() {
        let (_slot, _view, entries) = entries(3, 10);
        let transport = MemoryTransport::gated();

        let coordinator = BatchCoordinator::channel_uploader(
            entries,
            settings(10, 3),
            Arc::new(transport.clone()),
            None,
        );

        assert!(!coordinator.is_batched());
        assert_eq!(coordinator.in_flight(), 3);

        transport.release(3);
        coordinator.wait().await;
        assert_eq!(transport.counters().joins, 3);
    }

    #[tokio::test]
    async fn test_cap_holds_and_slots_refill_in_order() {
        let (_slot, view, entries) = entries(5, 10);
        let refs: Vec<_> = entries.iter().map(|e| e.entry_ref().clone()).collect();
        let transport = MemoryTransport::gated();

        let coordinator = BatchCoordinator::channel_uploader(
            entries,
            settings(10, 2),
            Arc::new(transport.clone()),
            None,
        );
        assert!(coordinator.is_batched());

        transport.wait_until(|c| c.joins == 2).await;
        assert_eq!(coordinator.in_flight(), 2);
        assert_eq!(transport.joined_refs(), refs[..2].to_vec());

        transport.release(1);
        transport.wait_until(|c| c.joins == 3).await;
        assert_eq!(transport.joined_refs(), refs[..3].to_vec());

        transport.release(4);
        coordinator.wait().await;

        let mut joined = transport.joined_refs();
        joined.sort();
        let mut expected = refs.clone();
        expected.sort();
        assert_eq!(joined, expected);
        assert_eq!(coordinator.peak_in_flight(), 2);
        for r in &refs {
            assert_eq!(view.percents_for(r), vec![100]);
        }
    }

    #[tokio::test]
    async fn test_failure_releases_slot() {
        let (_slot, view, entries) = entries(3, 10);
        let refs: Vec<_> = entries.iter().map(|e| e.entry_ref().clone()).collect();
        let transport = MemoryTransport::new();
        transport.fail_join(&refs[0], "denied");

        let coordinator = BatchCoordinator::channel_uploader(
            entries,
            settings(4, 1),
            Arc::new(transport.clone()),
            None,
        );
        coordinator.wait().await;

        assert_eq!(view.errors_for(&refs[0]), vec!["denied".to_string()]);
        assert_eq!(view.percents_for(&refs[1]).last(), Some(&100));
        assert_eq!(view.percents_for(&refs[2]).last(), Some(&100));
        assert_eq!(coordinator.peak_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_candidates_are_skipped() {
        let (slot, _view, entries) = entries(3, 10);
        let refs: Vec<_> = entries.iter().map(|e| e.entry_ref().clone()).collect();
        let transport = MemoryTransport::gated();

        let coordinator = BatchCoordinator::channel_uploader(
            entries,
            settings(10, 1),
            Arc::new(transport.clone()),
            None,
        );
        transport.wait_until(|c| c.joins == 1).await;

        // Withdraw the second entry before it gets a slot.
        let keep: ActiveRefs = [refs[0].clone(), refs[2].clone()].into_iter().collect();
        slot.set_active_refs(keep);

        transport.release(2);
        coordinator.wait().await;

        assert_eq!(transport.joined_refs(), vec![refs[0].clone(), refs[2].clone()]);
    }

    #[tokio::test]
    async fn test_empty_batch_is_settled() {
        let coordinator = BatchCoordinator::new(Vec::new(), 2);
        coordinator.start();
        coordinator.wait().await;
        assert_eq!(coordinator.peak_in_flight(), 0);
    }
}
