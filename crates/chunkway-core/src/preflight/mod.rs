//! Preflight negotiation.
//!
//! Before any bytes move, the endpoint is told which files are about to be
//! uploaded and answers with the transfer settings (chunk size, concurrency
//! limit) and per-entry metadata. The metadata travels back to the endpoint
//! as the join token of each entry's session channel.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::file::FileRef;
use crate::view::UploadSlot;

/// Description of one entry sent to the endpoint during preflight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightPayload {
    /// Last-modified timestamp (ms since epoch)
    pub last_modified: i64,
    /// File name
    pub name: String,
    /// Path relative to a selected directory
    pub relative_path: Option<String>,
    /// Size in bytes
    pub size: u64,
    /// MIME type
    #[serde(rename = "type")]
    pub mime_type: String,
    /// Reference token
    #[serde(rename = "ref")]
    pub entry_ref: FileRef,
}

/// Transfer settings negotiated for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSettings {
    /// Chunk size in bytes
    pub chunk_size: u64,
    /// Maximum entries transferring at once
    pub max_concurrency: usize,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            max_concurrency: crate::DEFAULT_MAX_CONCURRENCY,
        }
    }
}

impl UploadSettings {
    /// Check that both limits are positive.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::PreflightFailed("chunk_size must be positive".into()));
        }
        if self.max_concurrency == 0 {
            return Err(Error::PreflightFailed(
                "max_concurrency must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Endpoint-assigned metadata for one entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryMeta {
    /// Name of a custom uploader; `None` selects the channel uploader
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploader: Option<String>,
    /// Arbitrary endpoint fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl EntryMeta {
    /// Name of the uploader responsible for this entry.
    pub fn uploader_name(&self) -> &str {
        self.uploader.as_deref().unwrap_or(crate::CHANNEL_UPLOADER)
    }

    /// The metadata as a channel join token.
    #[must_use]
    pub fn to_token(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Settings wrapper as returned by the endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreflightResponse {
    /// Batch settings
    pub config: UploadSettings,
    /// Metadata keyed by reference token
    pub entries: HashMap<FileRef, EntryMeta>,
}

/// Preflight collaborator.
#[async_trait]
pub trait Preflight: Send + Sync {
    /// Negotiate settings and metadata for the given entries of a slot.
    async fn preflight(
        &self,
        slot: &UploadSlot,
        payloads: Vec<PreflightPayload>,
    ) -> Result<PreflightResponse>;
}

/// Local preflight that accepts every entry with fixed settings.
///
/// Each entry's metadata carries its `name` and `size`, which is what
/// [`DirectoryTransport`](crate::channel::directory::DirectoryTransport)
/// expects in the join token.
#[derive(Debug, Clone, Default)]
pub struct StaticPreflight {
    settings: UploadSettings,
    uploader: Option<String>,
}

impl StaticPreflight {
    /// Accept every entry with `settings`.
    #[must_use]
    pub fn new(settings: UploadSettings) -> Self {
        Self {
            settings,
            uploader: None,
        }
    }

    /// Designate a custom uploader for every entry.
    #[must_use]
    pub fn with_uploader(mut self, uploader: impl Into<String>) -> Self {
        self.uploader = Some(uploader.into());
        self
    }
}

#[async_trait]
impl Preflight for StaticPreflight {
    async fn preflight(
        &self,
        slot: &UploadSlot,
        payloads: Vec<PreflightPayload>,
    ) -> Result<PreflightResponse> {
        self.settings.validate()?;

        let entries: HashMap<FileRef, EntryMeta> = payloads
            .into_iter()
            .map(|payload| {
                let mut fields = Map::new();
                fields.insert("name".into(), Value::String(payload.name));
                fields.insert("size".into(), Value::from(payload.size));
                let meta = EntryMeta {
                    uploader: self.uploader.clone(),
                    fields,
                };
                (payload.entry_ref, meta)
            })
            .collect();

        slot.set_preflighted_refs(entries.keys().cloned().collect());
        tracing::debug!(
            "Preflight accepted {} entries for slot {}",
            entries.len(),
            slot.name()
        );

        Ok(PreflightResponse {
            config: self.settings,
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(name: &str) -> PreflightPayload {
        PreflightPayload {
            last_modified: 0,
            name: name.to_string(),
            relative_path: None,
            size: 10,
            mime_type: "text/plain".into(),
            entry_ref: FileRef::from(name),
        }
    }

    #[test]
    fn test_payload_wire_names() {
        let json = serde_json::to_value(payload("a.txt")).unwrap();
        assert_eq!(json["type"], "text/plain");
        assert_eq!(json["ref"], "a.txt");
        assert!(json["relative_path"].is_null());
    }

    #[test]
    fn test_response_deserialization() {
        let json = r#"{
            "config": {"chunk_size": 100000, "max_concurrency": 2},
            "entries": {
                "r1": {"uploader": "S3", "url": "https://example.test/put"},
                "r2": {"token": "abc"}
            }
        }"#;
        let resp: PreflightResponse = serde_json::from_str(json).unwrap();

        assert_eq!(resp.config.chunk_size, 100_000);
        assert_eq!(resp.entries[&FileRef::from("r1")].uploader_name(), "S3");
        assert_eq!(resp.entries[&FileRef::from("r2")].uploader_name(), "channel");
        assert_eq!(resp.entries[&FileRef::from("r2")].fields["token"], "abc");
    }

    #[test]
    fn test_settings_validation() {
        assert!(UploadSettings::default().validate().is_ok());
        let zero = UploadSettings {
            chunk_size: 0,
            max_concurrency: 1,
        };
        assert!(zero.validate().is_err());
    }

    #[tokio::test]
    async fn test_static_preflight_accepts_all() {
        let slot = UploadSlot::new("docs");
        let preflight = StaticPreflight::new(UploadSettings::default());

        let resp = preflight
            .preflight(&slot, vec![payload("a.txt"), payload("b.txt")])
            .await
            .unwrap();

        assert_eq!(resp.entries.len(), 2);
        assert_eq!(resp.entries[&FileRef::from("a.txt")].fields["name"], "a.txt");
        assert_eq!(slot.preflighted_refs().len(), 2);
    }
}
