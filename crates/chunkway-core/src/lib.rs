//! # Chunkway Core Library
//!
//! `chunkway-core` moves large file payloads to a remote endpoint in
//! fixed-size chunks, one session channel per file, under a global
//! concurrency cap.
//!
//! ## Features
//!
//! - **Sequential chunking**: each file is read and pushed one byte range at
//!   a time, advancing only on acknowledgment
//! - **Bounded concurrency**: at most `max_concurrency` files transfer at once,
//!   with replacements started as slots free
//! - **Progress reporting**: integer percentages, each reported once
//! - **Cooperative cancellation**: the UI can withdraw an entry at any time
//!
//! ## Modules
//!
//! - [`batch`] - Concurrency-capped scheduling of entry uploaders
//! - [`channel`] - Session channel interfaces and reference transports
//! - [`config`] - Configuration management
//! - [`entry`] - Upload entries (one selected file each)
//! - [`mod@file`] - File handles, reference tokens, byte-range reads
//! - [`preflight`] - Preflight negotiation interface
//! - [`session`] - Preflight-to-dispatch orchestration
//! - [`transform`] - Optional pre-transfer transforms
//! - [`uploader`] - Per-entry chunk transfer state machine
//! - [`view`] - UI layer interface and upload slots
//!
//! ## Example
//!
//! ```rust,ignore
//! use chunkway_core::session::UploadSession;
//!
//! let session = UploadSession::new(transport, preflight);
//! let run = session.run(entries).await;
//! run.wait().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod batch;
pub mod channel;
pub mod config;
pub mod entry;
pub mod error;
pub mod file;
pub mod preflight;
pub mod session;
pub mod transform;
pub mod uploader;
pub mod view;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default chunk size for uploads (64 KB)
pub const DEFAULT_CHUNK_SIZE: u64 = 64_000;

/// Default number of entries transferring at once
pub const DEFAULT_MAX_CONCURRENCY: usize = 3;

/// Topic prefix for per-entry upload channels
pub const CHANNEL_TOPIC_PREFIX: &str = "lvu";

/// Event name used for chunk pushes
pub const CHUNK_EVENT: &str = "chunk";

/// Reason reported when no more specific one is available
pub const DEFAULT_ERROR_REASON: &str = "failed";

/// Name of the built-in channel uploader
pub const CHANNEL_UPLOADER: &str = "channel";
