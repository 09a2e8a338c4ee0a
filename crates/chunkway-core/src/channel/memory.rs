//! In-process session channel endpoint.
//!
//! [`MemoryTransport`] accepts joins and chunks in memory and records
//! everything it receives. Failures, disconnects and back-pressure can be
//! scripted per entry, which makes it the transport of choice for tests and
//! for simulating an endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{watch, Semaphore};

use super::{entry_topic, ChannelTransport, ErrorObserver, Rejection, Reply, SessionChannel};
use crate::file::FileRef;

/// Running totals, observable while a transfer is in progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryCounters {
    /// Successful joins
    pub joins: usize,
    /// Push attempts that reached the endpoint
    pub pushes: usize,
    /// Channels left
    pub leaves: usize,
}

#[derive(Default)]
struct MemoryState {
    join_failures: HashMap<String, String>,
    push_failures: HashMap<String, (usize, String)>,
    joined: HashMap<String, bool>,
    join_order: Vec<String>,
    join_tokens: HashMap<String, Value>,
    chunks: HashMap<String, Vec<Vec<u8>>>,
    observers: HashMap<String, Vec<Arc<dyn Fn(String) + Send + Sync>>>,
}

struct MemoryInner {
    state: Mutex<MemoryState>,
    counters: watch::Sender<MemoryCounters>,
    gate: Option<Arc<Semaphore>>,
    latency: Option<Duration>,
}

impl MemoryInner {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory endpoint.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::build(None, None)
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("counters", &self.counters())
            .field("gated", &self.inner.gate.is_some())
            .finish_non_exhaustive()
    }
}

impl MemoryTransport {
    /// Endpoint that acknowledges every chunk immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoint that holds every push until [`release`](Self::release)
    /// grants it.
    #[must_use]
    pub fn gated() -> Self {
        Self::build(Some(Arc::new(Semaphore::new(0))), None)
    }

    /// Endpoint that reports a latency simulation delay between chunks.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self::build(None, Some(latency))
    }

    fn build(gate: Option<Arc<Semaphore>>, latency: Option<Duration>) -> Self {
        let (counters, _) = watch::channel(MemoryCounters::default());
        Self {
            inner: Arc::new(MemoryInner {
                state: Mutex::new(MemoryState::default()),
                counters,
                gate,
                latency,
            }),
        }
    }

    /// Let `n` held pushes through. No-op for ungated endpoints.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.inner.gate {
            gate.add_permits(n);
        }
    }

    /// Reject the join of an entry's channel.
    pub fn fail_join(&self, entry_ref: &FileRef, reason: impl Into<String>) {
        self.inner
            .state()
            .join_failures
            .insert(entry_topic(entry_ref), reason.into());
    }

    /// Reject the push of chunk `chunk_index` (zero-based) of an entry.
    pub fn fail_push(&self, entry_ref: &FileRef, chunk_index: usize, reason: impl Into<String>) {
        self.inner
            .state()
            .push_failures
            .insert(entry_topic(entry_ref), (chunk_index, reason.into()));
    }

    /// Mark an entry's channel as no longer joined without telling anyone.
    pub fn disconnect(&self, entry_ref: &FileRef) {
        self.inner
            .state()
            .joined
            .insert(entry_topic(entry_ref), false);
    }

    /// Fail an entry's channel and notify its error observers.
    pub fn raise_error(&self, entry_ref: &FileRef, reason: &str) {
        let topic = entry_topic(entry_ref);
        let observers = {
            let mut state = self.inner.state();
            state.joined.insert(topic.clone(), false);
            state.observers.get(&topic).cloned().unwrap_or_default()
        };
        for observer in observers {
            observer(reason.to_string());
        }
    }

    /// Current totals.
    pub fn counters(&self) -> MemoryCounters {
        *self.inner.counters.borrow()
    }

    /// Wait until the totals satisfy `predicate`.
    pub async fn wait_until(&self, predicate: impl FnMut(&MemoryCounters) -> bool) {
        let mut rx = self.inner.counters.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(predicate).await;
    }

    /// Entries whose channel was joined, in join order.
    pub fn joined_refs(&self) -> Vec<FileRef> {
        let prefix = format!("{}:", crate::CHANNEL_TOPIC_PREFIX);
        self.inner
            .state()
            .join_order
            .iter()
            .filter_map(|topic| topic.strip_prefix(&prefix))
            .map(FileRef::from)
            .collect()
    }

    /// Join token presented by an entry's channel.
    pub fn join_token(&self, entry_ref: &FileRef) -> Option<Value> {
        self.inner
            .state()
            .join_tokens
            .get(&entry_topic(entry_ref))
            .cloned()
    }

    /// Lengths of the accepted chunks of an entry, in order.
    pub fn chunk_lengths(&self, entry_ref: &FileRef) -> Vec<usize> {
        self.inner
            .state()
            .chunks
            .get(&entry_topic(entry_ref))
            .map(|chunks| chunks.iter().map(Vec::len).collect())
            .unwrap_or_default()
    }

    /// Concatenation of the accepted chunks of an entry.
    pub fn received(&self, entry_ref: &FileRef) -> Vec<u8> {
        self.inner
            .state()
            .chunks
            .get(&entry_topic(entry_ref))
            .map(|chunks| chunks.concat())
            .unwrap_or_default()
    }
}

impl ChannelTransport for MemoryTransport {
    fn channel(&self, topic: &str, join_token: Value) -> Arc<dyn SessionChannel> {
        Arc::new(MemoryChannel {
            topic: topic.to_string(),
            join_token,
            inner: Arc::clone(&self.inner),
        })
    }

    fn latency_sim(&self) -> Option<Duration> {
        self.inner.latency
    }
}

struct MemoryChannel {
    topic: String,
    join_token: Value,
    inner: Arc<MemoryInner>,
}

#[async_trait]
impl SessionChannel for MemoryChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn join(&self) -> Reply {
        {
            let mut state = self.inner.state();
            if let Some(reason) = state.join_failures.get(&self.topic) {
                return Err(Rejection::new(reason.clone()));
            }
            state.joined.insert(self.topic.clone(), true);
            state.join_order.push(self.topic.clone());
            state
                .join_tokens
                .insert(self.topic.clone(), self.join_token.clone());
        }

        self.inner.counters.send_modify(|c| c.joins += 1);
        tracing::debug!("memory endpoint joined {}", self.topic);
        Ok(json!({}))
    }

    async fn push(&self, event: &str, payload: Vec<u8>) -> Reply {
        if let Some(gate) = &self.inner.gate {
            match gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(Rejection::new("closed")),
            }
        }

        let reply = {
            let mut state = self.inner.state();
            let index = state.chunks.get(&self.topic).map_or(0, Vec::len);

            if event != crate::CHUNK_EVENT {
                Err(Rejection::new("unknown_event"))
            } else if !state.joined.get(&self.topic).copied().unwrap_or(false) {
                Err(Rejection::new("not_joined"))
            } else if let Some((_, reason)) = state
                .push_failures
                .get(&self.topic)
                .filter(|(at, _)| *at == index)
            {
                Err(Rejection::new(reason.clone()))
            } else {
                state
                    .chunks
                    .entry(self.topic.clone())
                    .or_default()
                    .push(payload);
                Ok(json!({}))
            }
        };

        self.inner.counters.send_modify(|c| c.pushes += 1);
        reply
    }

    fn is_joined(&self) -> bool {
        self.inner
            .state()
            .joined
            .get(&self.topic)
            .copied()
            .unwrap_or(false)
    }

    fn on_error(&self, observer: ErrorObserver) {
        self.inner
            .state()
            .observers
            .entry(self.topic.clone())
            .or_default()
            .push(Arc::from(observer));
    }

    async fn leave(&self) {
        self.inner.state().joined.insert(self.topic.clone(), false);
        self.inner.counters.send_modify(|c| c.leaves += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_push_and_record() {
        let transport = MemoryTransport::new();
        let entry_ref = FileRef::from("r1");
        let channel = transport.channel(&entry_topic(&entry_ref), json!({"k": 1}));

        assert!(!channel.is_joined());
        channel.join().await.unwrap();
        assert!(channel.is_joined());

        channel.push("chunk", b"abc".to_vec()).await.unwrap();
        channel.push("chunk", b"de".to_vec()).await.unwrap();

        assert_eq!(transport.received(&entry_ref), b"abcde");
        assert_eq!(transport.chunk_lengths(&entry_ref), vec![3, 2]);
        assert_eq!(transport.join_token(&entry_ref), Some(json!({"k": 1})));
        assert_eq!(transport.joined_refs(), vec![entry_ref]);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let transport = MemoryTransport::new();
        let a = FileRef::from("a");
        let b = FileRef::from("b");
        transport.fail_join(&a, "unauthorized");
        transport.fail_push(&b, 1, "quota_exceeded");

        let ca = transport.channel(&entry_topic(&a), Value::Null);
        assert_eq!(ca.join().await.unwrap_err().reason, "unauthorized");

        let cb = transport.channel(&entry_topic(&b), Value::Null);
        cb.join().await.unwrap();
        cb.push("chunk", vec![1]).await.unwrap();
        let err = cb.push("chunk", vec![2]).await.unwrap_err();
        assert_eq!(err.reason, "quota_exceeded");
        assert_eq!(transport.received(&b), vec![1]);
    }

    #[tokio::test]
    async fn test_raise_error_notifies_observers() {
        let transport = MemoryTransport::new();
        let entry_ref = FileRef::from("r");
        let channel = transport.channel(&entry_topic(&entry_ref), Value::Null);
        channel.join().await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        channel.on_error(Box::new(move |reason| sink.lock().unwrap().push(reason)));

        transport.raise_error(&entry_ref, "closed");
        assert_eq!(*seen.lock().unwrap(), vec!["closed".to_string()]);
        assert!(!channel.is_joined());
    }

    #[tokio::test]
    async fn test_gate_holds_pushes() {
        let transport = MemoryTransport::gated();
        let entry_ref = FileRef::from("g");
        let channel = transport.channel(&entry_topic(&entry_ref), Value::Null);
        channel.join().await.unwrap();

        let pushing = tokio::spawn(async move { channel.push("chunk", vec![9]).await });
        tokio::task::yield_now().await;
        assert_eq!(transport.counters().pushes, 0);

        transport.release(1);
        pushing.await.unwrap().unwrap();
        assert_eq!(transport.counters().pushes, 1);
    }
}
