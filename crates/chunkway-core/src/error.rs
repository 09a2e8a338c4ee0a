//! Error types for Chunkway.
//!
//! This module provides a unified error type for all Chunkway operations,
//! with specific error variants for different failure modes.

use std::io;

use thiserror::Error;

/// A specialized `Result` type for Chunkway operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Chunkway.
#[derive(Error, Debug)]
pub enum Error {
    /// Session channel could not be joined
    #[error("failed to join channel '{topic}': {reason}")]
    JoinFailed {
        /// Channel topic
        topic: String,
        /// Reason given by the endpoint
        reason: String,
    },

    /// Endpoint rejected a pushed chunk
    #[error("chunk rejected: {0}")]
    ChunkRejected(String),

    /// Local byte-range read failed
    #[error("failed to read bytes {start}..{end} of '{file}': {source}")]
    ReadFailed {
        /// File name
        file: String,
        /// Range start
        start: u64,
        /// Range end (exclusive)
        end: u64,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Preflight returned no metadata for an entry
    #[error("no preflight upload response returned with ref {0}")]
    MissingMetadata(String),

    /// Entry names an uploader that is not registered
    #[error("no uploader configured for {0}")]
    NoUploader(String),

    /// Preflight negotiation failed
    #[error("preflight failed: {0}")]
    PreflightFailed(String),

    /// Pre-transfer transform failed
    #[error("failed to transform '{file}': {reason}")]
    TransformFailed {
        /// File name
        file: String,
        /// Reason for failure
        reason: String,
    },

    /// Invalid file name for the endpoint
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Returns the short reason reported to the UI layer for this error.
    ///
    /// Endpoint-supplied reasons are passed through verbatim; local failures
    /// map onto fixed machine-readable strings.
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::JoinFailed { reason, .. } | Self::ChunkRejected(reason) => reason.clone(),
            Self::MissingMetadata(_) => "no_metadata".to_string(),
            Self::NoUploader(_) => "no_uploader".to_string(),
            Self::TransformFailed { .. } => "transform_failed".to_string(),
            _ => crate::DEFAULT_ERROR_REASON.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
