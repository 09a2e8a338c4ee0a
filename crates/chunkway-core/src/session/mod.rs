//! Preflight-to-dispatch orchestration.
//!
//! An [`UploadSession`] takes the entries selected through a slot, asks the
//! preflight collaborator for settings and metadata, and hands every entry
//! to the uploader its metadata names:
//!
//! - `"channel"` (the default) - a [`BatchCoordinator`] over the session's
//!   [`ChannelTransport`]
//! - any other name - the [`ExternalUploader`] registered under it
//!
//! Entries the preflight response says nothing about are logged and left
//! alone. Entries naming an unregistered uploader fail with `no_uploader`.
//! A failed preflight fails only the entries of its slot; uploads already
//! started for other slots stay reachable through the returned [`UploadRun`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::batch::BatchCoordinator;
use crate::channel::ChannelTransport;
use crate::entry::UploadEntry;
use crate::error::{Error, Result};
use crate::preflight::{Preflight, PreflightPayload, PreflightResponse};
use crate::transform::BeforeUpload;
use crate::view::UploadSlot;

/// Uploader for entries whose metadata names something other than the
/// channel uploader.
#[async_trait]
pub trait ExternalUploader: Send + Sync {
    /// Upload `entries`, reporting progress through each entry.
    ///
    /// An `Err` fails every entry of the group with the error's reason.
    async fn upload(&self, entries: Vec<Arc<UploadEntry>>, response: &PreflightResponse)
        -> Result<()>;
}

/// Handle on the uploads started by [`UploadSession::run`].
#[derive(Debug, Default)]
pub struct UploadRun {
    coordinators: Vec<Arc<BatchCoordinator>>,
    external: Vec<JoinHandle<()>>,
    errors: Vec<Error>,
}

impl UploadRun {
    /// Batch coordinators started for channel entries.
    pub fn coordinators(&self) -> &[Arc<BatchCoordinator>] {
        &self.coordinators
    }

    /// Preflight failures, one per slot whose entries were failed.
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Wait for every coordinator to settle and every external uploader to
    /// return.
    pub async fn wait(self) {
        for coordinator in &self.coordinators {
            coordinator.wait().await;
        }
        for handle in self.external {
            if let Err(e) = handle.await {
                tracing::error!("External uploader task failed: {e}");
            }
        }
    }
}

/// Runs preflight and dispatches entries to their uploaders.
pub struct UploadSession {
    transport: Arc<dyn ChannelTransport>,
    preflight: Arc<dyn Preflight>,
    uploaders: HashMap<String, Arc<dyn ExternalUploader>>,
    before_upload: Option<Arc<dyn BeforeUpload>>,
}

impl std::fmt::Debug for UploadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.uploaders.keys().collect();
        names.sort();
        f.debug_struct("UploadSession")
            .field("uploaders", &names)
            .field("before_upload", &self.before_upload.is_some())
            .finish_non_exhaustive()
    }
}

impl UploadSession {
    /// Create a session over `transport`, negotiating through `preflight`.
    pub fn new(transport: Arc<dyn ChannelTransport>, preflight: Arc<dyn Preflight>) -> Self {
        Self {
            transport,
            preflight,
            uploaders: HashMap::new(),
            before_upload: None,
        }
    }

    /// Register an external uploader under `name`.
    #[must_use]
    pub fn with_uploader(
        mut self,
        name: impl Into<String>,
        uploader: Arc<dyn ExternalUploader>,
    ) -> Self {
        self.uploaders.insert(name.into(), uploader);
        self
    }

    /// Run `hook` on every channel entry before its channel is joined.
    #[must_use]
    pub fn with_before_upload(mut self, hook: Arc<dyn BeforeUpload>) -> Self {
        self.before_upload = Some(hook);
        self
    }

    /// Preflight `entries` and start their uploads.
    ///
    /// Entries are preflighted per slot, in selection order. A preflight
    /// failure fails every entry of that slot, is recorded in
    /// [`UploadRun::errors`], and the remaining slots are still processed.
    pub async fn run(&self, entries: Vec<Arc<UploadEntry>>) -> UploadRun {
        let mut run = UploadRun::default();

        for group in group_by_slot(entries) {
            let Some(first) = group.first() else {
                continue;
            };
            let slot = Arc::clone(first.slot());
            let payloads = group.iter().map(|e| e.to_preflight_payload()).collect();

            let response = match self.negotiate(&slot, payloads).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!("Preflight for slot {} failed: {e}", slot.name());
                    let reason = e.reason();
                    for entry in &group {
                        entry.error(Some(&reason));
                    }
                    run.errors.push(e);
                    continue;
                }
            };

            let ready: Vec<_> = group
                .into_iter()
                .filter(|entry| entry.zip_postflight(&response))
                .collect();

            self.dispatch(ready, &response, &mut run);
        }

        run
    }

    async fn negotiate(
        &self,
        slot: &UploadSlot,
        payloads: Vec<PreflightPayload>,
    ) -> Result<PreflightResponse> {
        let response = self.preflight.preflight(slot, payloads).await?;
        response.config.validate()?;
        Ok(response)
    }

    fn dispatch(
        &self,
        entries: Vec<Arc<UploadEntry>>,
        response: &PreflightResponse,
        run: &mut UploadRun,
    ) {
        let mut groups: Vec<(String, Vec<Arc<UploadEntry>>)> = Vec::new();
        for entry in entries {
            let name = entry
                .uploader_name()
                .unwrap_or_else(|| crate::CHANNEL_UPLOADER.to_string());
            match groups.iter_mut().find(|(n, _)| *n == name) {
                Some((_, group)) => group.push(entry),
                None => groups.push((name, vec![entry])),
            }
        }

        for (name, group) in groups {
            if name == crate::CHANNEL_UPLOADER {
                tracing::debug!("Dispatching {} entries to the channel uploader", group.len());
                run.coordinators.push(BatchCoordinator::channel_uploader(
                    group,
                    response.config,
                    Arc::clone(&self.transport),
                    self.before_upload.clone(),
                ));
            } else if let Some(uploader) = self.uploaders.get(&name) {
                tracing::debug!("Dispatching {} entries to uploader {name}", group.len());
                let uploader = Arc::clone(uploader);
                let response = response.clone();
                run.external.push(tokio::spawn(async move {
                    if let Err(e) = uploader.upload(group.clone(), &response).await {
                        tracing::warn!("Uploader {name} failed: {e}");
                        let reason = e.reason();
                        for entry in &group {
                            entry.error(Some(&reason));
                        }
                    }
                }));
            } else {
                let err = Error::NoUploader(name);
                tracing::error!("{err}");
                let reason = err.reason();
                for entry in &group {
                    entry.error(Some(&reason));
                }
            }
        }
    }
}

fn group_by_slot(entries: Vec<Arc<UploadEntry>>) -> Vec<Vec<Arc<UploadEntry>>> {
    let mut groups: Vec<Vec<Arc<UploadEntry>>> = Vec::new();
    for entry in entries {
        match groups
            .iter_mut()
            .find(|group| Arc::ptr_eq(group[0].slot(), entry.slot()))
        {
            Some(group) => group.push(entry),
            None => groups.push(vec![entry]),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory::MemoryTransport;
    use crate::file::{FileRef, UploadFile};
    use crate::preflight::{EntryMeta, StaticPreflight, UploadSettings};
    use crate::view::MemoryView;
    use std::sync::Mutex;

    fn entry(slot: &Arc<UploadSlot>, view: &Arc<MemoryView>, name: &str) -> Arc<UploadEntry> {
        let file = UploadFile::from_bytes(name, "text/plain", 0, name.as_bytes().to_vec());
        let entry = UploadEntry::new(file, Arc::clone(slot), view.clone());
        slot.track(entry.entry_ref().clone());
        entry
    }

    struct Recording {
        seen: Mutex<Vec<FileRef>>,
        fail: bool,
    }

    #[async_trait]
    impl ExternalUploader for Recording {
        async fn upload(
            &self,
            entries: Vec<Arc<UploadEntry>>,
            _response: &PreflightResponse,
        ) -> Result<()> {
            if self.fail {
                return Err(Error::PreflightFailed("bucket unavailable".into()));
            }
            for entry in entries {
                self.seen.lock().unwrap().push(entry.entry_ref().clone());
                entry.progress(100.0);
            }
            Ok(())
        }
    }

    /// Preflight that answers only for the first payload.
    struct Partial;

    #[async_trait]
    impl Preflight for Partial {
        async fn preflight(
            &self,
            _slot: &UploadSlot,
            payloads: Vec<PreflightPayload>,
        ) -> Result<PreflightResponse> {
            let entries = payloads
                .into_iter()
                .take(1)
                .map(|p| (p.entry_ref, EntryMeta::default()))
                .collect();
            Ok(PreflightResponse {
                config: UploadSettings::default(),
                entries,
            })
        }
    }

    #[tokio::test]
    async fn test_channel_entries_upload() {
        let slot = Arc::new(UploadSlot::new("docs"));
        let view = Arc::new(MemoryView::new());
        let entries = vec![entry(&slot, &view, "a.txt"), entry(&slot, &view, "b.txt")];
        let transport = MemoryTransport::new();

        let session = UploadSession::new(
            Arc::new(transport.clone()),
            Arc::new(StaticPreflight::new(UploadSettings::default())),
        );
        let run = session.run(entries.clone()).await;
        assert_eq!(run.coordinators().len(), 1);
        run.wait().await;

        for entry in &entries {
            assert!(entry.is_done());
            assert_eq!(transport.received(entry.entry_ref()), entry.file().read_all().await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_external_uploader_dispatch() {
        let slot = Arc::new(UploadSlot::new("docs"));
        let view = Arc::new(MemoryView::new());
        let a = entry(&slot, &view, "a.txt");
        let external = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            fail: false,
        });

        let session = UploadSession::new(
            Arc::new(MemoryTransport::new()),
            Arc::new(StaticPreflight::new(UploadSettings::default()).with_uploader("S3")),
        )
        .with_uploader("S3", external.clone());

        let run = session.run(vec![Arc::clone(&a)]).await;
        assert!(run.coordinators().is_empty());
        run.wait().await;

        assert_eq!(*external.seen.lock().unwrap(), vec![a.entry_ref().clone()]);
        assert!(a.is_done());
    }

    #[tokio::test]
    async fn test_external_failure_errors_entries() {
        let slot = Arc::new(UploadSlot::new("docs"));
        let view = Arc::new(MemoryView::new());
        let a = entry(&slot, &view, "a.txt");
        let external = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            fail: true,
        });

        let session = UploadSession::new(
            Arc::new(MemoryTransport::new()),
            Arc::new(StaticPreflight::new(UploadSettings::default()).with_uploader("S3")),
        )
        .with_uploader("S3", external);

        session.run(vec![Arc::clone(&a)]).await.wait().await;
        assert_eq!(view.errors_for(a.entry_ref()), vec!["failed".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_uploader_fails_entries() {
        let slot = Arc::new(UploadSlot::new("docs"));
        let view = Arc::new(MemoryView::new());
        let a = entry(&slot, &view, "a.txt");

        let session = UploadSession::new(
            Arc::new(MemoryTransport::new()),
            Arc::new(StaticPreflight::new(UploadSettings::default()).with_uploader("GCS")),
        );
        session.run(vec![Arc::clone(&a)]).await.wait().await;

        assert_eq!(view.errors_for(a.entry_ref()), vec!["no_uploader".to_string()]);
    }

    #[tokio::test]
    async fn test_entries_missing_from_response_are_skipped() {
        let slot = Arc::new(UploadSlot::new("docs"));
        let view = Arc::new(MemoryView::new());
        let a = entry(&slot, &view, "a.txt");
        let b = entry(&slot, &view, "b.txt");
        let transport = MemoryTransport::new();

        let session = UploadSession::new(Arc::new(transport.clone()), Arc::new(Partial));
        session
            .run(vec![Arc::clone(&a), Arc::clone(&b)])
            .await
            .wait()
            .await;

        assert!(a.is_done());
        assert!(!b.is_done());
        assert!(view.errors_for(b.entry_ref()).is_empty());
        assert_eq!(transport.joined_refs(), vec![a.entry_ref().clone()]);
    }

    #[tokio::test]
    async fn test_invalid_settings_fail_run() {
        let slot = Arc::new(UploadSlot::new("docs"));
        let view = Arc::new(MemoryView::new());
        let a = entry(&slot, &view, "a.txt");

        let bad = UploadSettings {
            chunk_size: 0,
            max_concurrency: 1,
        };
        let session = UploadSession::new(
            Arc::new(MemoryTransport::new()),
            Arc::new(StaticPreflight::new(bad)),
        );

        let run = session.run(vec![Arc::clone(&a)]).await;
        assert!(matches!(run.errors(), [Error::PreflightFailed(_)]));
        assert!(run.coordinators().is_empty());
        assert_eq!(view.errors_for(a.entry_ref()), vec!["failed".to_string()]);
    }

    /// Preflight that refuses one slot by name.
    struct RefuseSlot(&'static str);

    #[async_trait]
    impl Preflight for RefuseSlot {
        async fn preflight(
            &self,
            slot: &UploadSlot,
            payloads: Vec<PreflightPayload>,
        ) -> Result<PreflightResponse> {
            if slot.name() == self.0 {
                return Err(Error::PreflightFailed(format!("{} is closed", self.0)));
            }
            StaticPreflight::new(UploadSettings::default())
                .preflight(slot, payloads)
                .await
        }
    }

    #[tokio::test]
    async fn test_failed_slot_keeps_earlier_slots_running() {
        let view = Arc::new(MemoryView::new());
        let open = Arc::new(UploadSlot::new("open"));
        let closed = Arc::new(UploadSlot::new("closed"));
        let a = entry(&open, &view, "a.txt");
        let b = entry(&closed, &view, "b.txt");
        let c = entry(&open, &view, "c.txt");
        let transport = MemoryTransport::new();

        let session = UploadSession::new(Arc::new(transport.clone()), Arc::new(RefuseSlot("closed")));
        let run = session
            .run(vec![Arc::clone(&a), Arc::clone(&b), Arc::clone(&c)])
            .await;

        assert_eq!(run.errors().len(), 1);
        assert_eq!(run.coordinators().len(), 1);
        run.wait().await;

        assert!(a.is_done());
        assert!(c.is_done());
        assert!(!b.is_done());
        assert_eq!(view.errors_for(b.entry_ref()), vec!["failed".to_string()]);
        assert_eq!(transport.received(a.entry_ref()), b"a.txt".to_vec());
    }

    #[tokio::test]
    async fn test_empty_run() {
        let session = UploadSession::new(
            Arc::new(MemoryTransport::new()),
            Arc::new(StaticPreflight::default()),
        );
        let run = session.run(Vec::new()).await;
        assert!(run.errors().is_empty());
        assert!(run.coordinators().is_empty());
        run.wait().await;
    }
}
