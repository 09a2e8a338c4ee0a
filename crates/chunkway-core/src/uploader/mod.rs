//! Per-entry chunk transfer.
//!
//! An [`EntryUploader`] carries one [`UploadEntry`] over its own session
//! channel:
//!
//! ```text
//! Idle --upload()--> Joining --join ok--> Transferring --last ack--> Done
//!                       |                      |
//!                       +--join error----------+--push error / channel error--> Errored
//! ```
//!
//! Chunks are strictly sequential: chunk N is read only after chunk N-1 was
//! acknowledged, and the offset advances by the exact length of each chunk
//! read. Cancellation of the entry is checked before every read; in-flight
//! reads and pushes are never aborted.
//!
//! ## Stalls
//!
//! Two situations stop a transfer without reporting an error, leaving the
//! uploader started but not done:
//!
//! - a failed local read (logged at `error`)
//! - a chunk read while the channel is not joined (dropped, logged at `warn`)

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::channel::{entry_topic, ChannelTransport, SessionChannel};
use crate::entry::{DoneCallback, UploadEntry};
use crate::error::Error;
use crate::transform::BeforeUpload;

/// Observable state of an uploader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploaderPhase {
    /// Not started
    Idle,
    /// Waiting for the channel join reply
    Joining,
    /// Reading and pushing chunks
    Transferring,
    /// Every byte acknowledged
    Done,
    /// Failed; no further reads or pushes
    Errored,
}

struct UploaderState {
    phase: UploaderPhase,
    offset: u64,
    started: bool,
    errored: bool,
    finished: bool,
    on_done: Option<DoneCallback>,
}

/// Uploads one entry chunk by chunk.
pub struct EntryUploader {
    entry: Arc<UploadEntry>,
    chunk_size: u64,
    transport: Arc<dyn ChannelTransport>,
    before_upload: Option<Arc<dyn BeforeUpload>>,
    halt: CancellationToken,
    state: Mutex<UploaderState>,
}

impl std::fmt::Debug for EntryUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("EntryUploader")
            .field("entry", self.entry.entry_ref())
            .field("chunk_size", &self.chunk_size)
            .field("phase", &state.phase)
            .field("offset", &state.offset)
            .field("started", &state.started)
            .finish_non_exhaustive()
    }
}

impl EntryUploader {
    /// Create an idle uploader for `entry`.
    pub fn new(
        entry: Arc<UploadEntry>,
        chunk_size: u64,
        transport: Arc<dyn ChannelTransport>,
    ) -> Arc<Self> {
        Self::with_before_upload(entry, chunk_size, transport, None)
    }

    /// Create an idle uploader that runs `before_upload` before joining.
    pub fn with_before_upload(
        entry: Arc<UploadEntry>,
        chunk_size: u64,
        transport: Arc<dyn ChannelTransport>,
        before_upload: Option<Arc<dyn BeforeUpload>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            entry,
            chunk_size: chunk_size.max(1),
            transport,
            before_upload,
            halt: CancellationToken::new(),
            state: Mutex::new(UploaderState {
                phase: UploaderPhase::Idle,
                offset: 0,
                started: false,
                errored: false,
                finished: false,
                on_done: None,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, UploaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The entry being uploaded.
    pub fn entry(&self) -> &Arc<UploadEntry> {
        &self.entry
    }

    /// Current phase.
    pub fn phase(&self) -> UploaderPhase {
        self.state().phase
    }

    /// Bytes read and handed to the channel so far.
    pub fn offset(&self) -> u64 {
        self.state().offset
    }

    /// Whether the offset reached the end of the file.
    pub fn is_done(&self) -> bool {
        self.state().offset >= self.entry.file().size()
    }

    /// Whether the uploader is started and has neither failed nor stopped.
    pub fn has_started(&self) -> bool {
        self.state().started
    }

    /// Whether the uploader failed.
    pub fn is_errored(&self) -> bool {
        self.state().errored
    }

    /// Whether the completion callback has run.
    pub fn is_finished(&self) -> bool {
        self.state().finished
    }

    /// Start the transfer on a background task.
    ///
    /// `on_done` runs exactly once, when the transfer completes, fails, or
    /// stops because the entry was cancelled. It never runs before this
    /// method returns. Must be called within a Tokio runtime.
    pub fn upload(self: &Arc<Self>, on_done: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.state();
            if state.started || state.errored || state.finished {
                tracing::warn!("Uploader for {} already started", self.entry.entry_ref());
                return;
            }
            state.on_done = Some(Box::new(on_done));
            state.started = true;
            state.phase = UploaderPhase::Joining;
        }

        let uploader = Arc::clone(self);
        tokio::spawn(async move { uploader.run().await });
    }

    async fn run(self: Arc<Self>) {
        if let Some(hook) = &self.before_upload {
            let file = self.entry.file();
            match hook.before_upload(&file).await {
                Ok(Some(transformed)) => self.entry.replace_file(transformed),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Pre-upload transform failed: {e}");
                    self.error(&e.reason());
                    return;
                }
            }
        }

        let Some(meta) = self.entry.metadata() else {
            let err = Error::MissingMetadata(self.entry.entry_ref().to_string());
            tracing::error!("{err}");
            self.error(&err.reason());
            return;
        };

        if self.entry.is_cancelled() {
            self.state().started = false;
            tracing::debug!(
                "Upload of {} stopped before join: entry cancelled",
                self.entry.entry_ref()
            );
            self.complete();
            return;
        }

        let topic = entry_topic(self.entry.entry_ref());
        let channel = self.transport.channel(&topic, meta.to_token());

        let weak = Arc::downgrade(&self);
        channel.on_error(Box::new(move |reason| {
            if let Some(uploader) = weak.upgrade() {
                uploader.error(&reason);
            }
        }));

        tracing::debug!("Joining {topic}");
        if let Err(rejection) = channel.join().await {
            let err = Error::JoinFailed {
                topic,
                reason: rejection.reason,
            };
            tracing::warn!("{err}");
            self.error(&err.reason());
            return;
        }

        if self.halt.is_cancelled() {
            return;
        }
        self.state().phase = UploaderPhase::Transferring;
        self.transfer(channel.as_ref()).await;
    }

    async fn transfer(&self, channel: &dyn SessionChannel) {
        let cancelled = self.entry.cancellation();

        loop {
            if self.entry.is_cancelled() {
                self.stop(channel).await;
                return;
            }

            let file = self.entry.file();
            let size = file.size();
            let offset = self.offset();

            if size == 0 {
                self.entry.progress(100.0);
                self.finish(channel).await;
                return;
            }

            let chunk = match file.read_range(offset, self.chunk_size).await {
                Ok(chunk) if !chunk.is_empty() => chunk,
                Ok(_) => {
                    tracing::error!(
                        "Read error: no bytes at offset {offset} of {} ({size} bytes expected)",
                        file.name()
                    );
                    return;
                }
                Err(e) => {
                    tracing::error!("Read error: {e}");
                    return;
                }
            };

            if self.halt.is_cancelled() {
                return;
            }

            let offset = {
                let mut state = self.state();
                state.offset += chunk.len() as u64;
                state.offset
            };

            if !channel.is_joined() {
                tracing::warn!(
                    "Dropping chunk for {}: channel not joined",
                    channel.topic()
                );
                return;
            }

            match channel.push(crate::CHUNK_EVENT, chunk).await {
                Ok(_) => {
                    if self.halt.is_cancelled() {
                        return;
                    }

                    self.entry.progress(offset as f64 / size as f64 * 100.0);
                    if offset >= size {
                        self.finish(channel).await;
                        return;
                    }

                    if let Some(delay) = self.transport.latency_sim() {
                        tokio::select! {
                            () = self.halt.cancelled() => return,
                            () = cancelled.cancelled() => {}
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                }
                Err(rejection) => {
                    let err = Error::ChunkRejected(rejection.reason);
                    tracing::warn!("{} at offset {offset}: {err}", channel.topic());
                    self.error(&err.reason());
                    return;
                }
            }
        }
    }

    async fn finish(&self, channel: &dyn SessionChannel) {
        self.state().phase = UploaderPhase::Done;
        channel.leave().await;
        tracing::debug!("Upload of {} complete", self.entry.entry_ref());
        self.complete();
    }

    async fn stop(&self, channel: &dyn SessionChannel) {
        self.state().started = false;
        channel.leave().await;
        tracing::debug!("Upload of {} stopped: entry cancelled", self.entry.entry_ref());
        self.complete();
    }

    fn complete(&self) {
        let on_done = {
            let mut state = self.state();
            state.finished = true;
            state.on_done.take()
        };
        if let Some(callback) = on_done {
            callback();
        }
    }

    /// Fail the transfer.
    ///
    /// Stops any scheduled chunk read, reports `reason` through the entry
    /// and runs the completion callback. Only the first call has an effect.
    pub fn error(&self, reason: &str) {
        {
            let mut state = self.state();
            if state.errored {
                return;
            }
            state.errored = true;
            state.started = false;
            state.phase = UploaderPhase::Errored;
        }

        self.halt.cancel();
        tracing::warn!("Upload of {} failed: {reason}", self.entry.entry_ref());
        self.entry.error(Some(reason));
        self.complete();
    }
}
