//! Session channel interface.
//!
//! Every entry is uploaded over its own channel, joined on the topic
//! `lvu:<ref>` with the entry's preflight metadata as join token. The engine
//! only needs four things from a channel: join it, push a chunk, ask whether
//! it is still joined, and be told when it fails. Connection setup, framing
//! and reconnection belong to the transport.
//!
//! Two transports ship with the crate:
//!
//! - [`memory::MemoryTransport`] - in-process endpoint for tests and
//!   simulation
//! - [`directory::DirectoryTransport`] - writes each entry to a local
//!   directory

pub mod directory;
pub mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::file::FileRef;

/// Refusal returned by the endpoint for a join or push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Endpoint-supplied reason
    pub reason: String,
}

impl Rejection {
    /// Create a rejection with the given reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Outcome of a join or push.
pub type Reply = std::result::Result<Value, Rejection>;

/// Callback invoked when a channel fails outside of a join or push reply.
pub type ErrorObserver = Box<dyn Fn(String) + Send + Sync>;

/// One per-entry bidirectional channel.
#[async_trait]
pub trait SessionChannel: Send + Sync {
    /// Channel topic.
    fn topic(&self) -> &str;

    /// Join the channel.
    async fn join(&self) -> Reply;

    /// Push an event with a raw byte payload and wait for the reply.
    async fn push(&self, event: &str, payload: Vec<u8>) -> Reply;

    /// Whether the channel is currently joined.
    fn is_joined(&self) -> bool;

    /// Register an observer for channel-level failures.
    fn on_error(&self, observer: ErrorObserver);

    /// Leave the channel. Leaving twice is harmless.
    async fn leave(&self);
}

/// Factory for session channels.
pub trait ChannelTransport: Send + Sync {
    /// Open (but do not join) a channel.
    fn channel(&self, topic: &str, join_token: Value) -> Arc<dyn SessionChannel>;

    /// Artificial delay inserted between chunks, for simulation.
    fn latency_sim(&self) -> Option<Duration> {
        None
    }
}

/// Topic of the channel carrying an entry.
#[must_use]
pub fn entry_topic(entry_ref: &FileRef) -> String {
    format!("{}:{entry_ref}", crate::CHANNEL_TOPIC_PREFIX)
}
