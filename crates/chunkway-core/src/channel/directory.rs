//! Local-directory endpoint.
//!
//! [`DirectoryTransport`] plays the server side of the channel protocol on
//! the local machine: joining an entry's channel creates
//! `<root>/<name>` (the name comes from the join token), and every pushed
//! chunk is appended to it. An optional byte quota is shared by all
//! channels of the transport; a chunk that would exceed it is rejected with
//! `quota_exceeded`.
//!
//! Each destination is claimed by the first channel that joins for it. A
//! later join for the same name is rejected with `name_taken`, so two
//! entries never write into one file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;

use super::{ChannelTransport, ErrorObserver, Rejection, Reply, SessionChannel};
use crate::file::sanitize_file_name;

/// Reason returned when a chunk would exceed the quota.
pub const QUOTA_EXCEEDED: &str = "quota_exceeded";

/// Reason returned when another channel already writes the same file.
pub const NAME_TAKEN: &str = "name_taken";

/// Endpoint writing uploads into a directory.
#[derive(Debug, Clone)]
pub struct DirectoryTransport {
    root: PathBuf,
    quota: Option<u64>,
    latency: Option<Duration>,
    used: Arc<AtomicU64>,
    claimed: Arc<Mutex<HashSet<PathBuf>>>,
}

impl DirectoryTransport {
    /// Write uploads under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            quota: None,
            latency: None,
            used: Arc::new(AtomicU64::new(0)),
            claimed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Limit the total bytes accepted across all channels.
    #[must_use]
    pub fn with_quota(mut self, quota: Option<u64>) -> Self {
        self.quota = quota;
        self
    }

    /// Report a latency simulation delay between chunks.
    #[must_use]
    pub fn with_latency(mut self, latency: Option<Duration>) -> Self {
        self.latency = latency.filter(|d| !d.is_zero());
        self
    }

    /// Output directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bytes accepted so far.
    pub fn bytes_used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }
}

impl ChannelTransport for DirectoryTransport {
    fn channel(&self, topic: &str, join_token: Value) -> Arc<dyn SessionChannel> {
        Arc::new(DirectoryChannel {
            topic: topic.to_string(),
            join_token,
            root: self.root.clone(),
            quota: self.quota,
            used: Arc::clone(&self.used),
            claimed: Arc::clone(&self.claimed),
            dest: Mutex::new(None),
            joined: AtomicBool::new(false),
            observers: Mutex::new(Vec::new()),
        })
    }

    fn latency_sim(&self) -> Option<Duration> {
        self.latency
    }
}

struct DirectoryChannel {
    topic: String,
    join_token: Value,
    root: PathBuf,
    quota: Option<u64>,
    used: Arc<AtomicU64>,
    claimed: Arc<Mutex<HashSet<PathBuf>>>,
    dest: Mutex<Option<PathBuf>>,
    joined: AtomicBool,
    observers: Mutex<Vec<ErrorObserver>>,
}

impl DirectoryChannel {
    fn fail(&self, reason: &str) {
        self.joined.store(false, Ordering::SeqCst);
        let observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        for observer in observers.iter() {
            observer(reason.to_string());
        }
    }

    fn claim(&self, dest: &Path) -> bool {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(dest.to_path_buf())
    }

    fn release(&self, dest: &Path) {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(dest);
    }

    fn reserve(&self, len: u64) -> bool {
        let total = self.used.fetch_add(len, Ordering::SeqCst) + len;
        match self.quota {
            Some(quota) if total > quota => {
                self.used.fetch_sub(len, Ordering::SeqCst);
                false
            }
            _ => true,
        }
    }
}

#[async_trait]
impl SessionChannel for DirectoryChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn join(&self) -> Reply {
        let name = self
            .join_token
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Rejection::new("invalid_token"))?;

        let dest =
            sanitize_file_name(&self.root, name).ok_or_else(|| Rejection::new("invalid_name"))?;

        if !self.claim(&dest) {
            tracing::warn!("{} rejected: {} already in use", self.topic, dest.display());
            return Err(Rejection::new(NAME_TAKEN));
        }

        let created = async {
            tokio::fs::create_dir_all(&self.root).await?;
            tokio::fs::File::create(&dest).await
        }
        .await;
        if let Err(e) = created {
            self.release(&dest);
            return Err(Rejection::new(e.to_string()));
        }

        tracing::debug!("{} writing to {}", self.topic, dest.display());
        *self.dest.lock().unwrap_or_else(PoisonError::into_inner) = Some(dest.clone());
        self.joined.store(true, Ordering::SeqCst);

        Ok(json!({ "path": dest }))
    }

    async fn push(&self, event: &str, payload: Vec<u8>) -> Reply {
        if event != crate::CHUNK_EVENT {
            return Err(Rejection::new("unknown_event"));
        }

        let dest = self
            .dest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| Rejection::new("not_joined"))?;

        let len = payload.len() as u64;
        if !self.reserve(len) {
            return Err(Rejection::new(QUOTA_EXCEEDED));
        }

        let written = async {
            let mut file = tokio::fs::OpenOptions::new()
                .append(true)
                .open(&dest)
                .await?;
            file.write_all(&payload).await?;
            file.flush().await
        }
        .await;

        match written {
            Ok(()) => Ok(json!({ "bytes": len })),
            Err(e) => {
                self.used.fetch_sub(len, Ordering::SeqCst);
                let reason = e.to_string();
                self.fail(&reason);
                Err(Rejection::new(reason))
            }
        }
    }

    fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    fn on_error(&self, observer: ErrorObserver) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    async fn leave(&self) {
        self.joined.store(false, Ordering::SeqCst);
    }
}
