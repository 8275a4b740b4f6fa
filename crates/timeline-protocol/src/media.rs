//! Reference-only media payloads.
//!
//! A [`MediaSidecar`] points at media stored elsewhere (object store, artifact
//! registry, CDN). Inline content is never carried on the timeline: `data:`
//! URIs and embedded base64 are rejected both by the constructor and by
//! deserialization, so an invalid sidecar can never be observed.

use crate::error::{TimelineError, TimelineResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Raw sidecar fields, as supplied by producers or read off the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaSidecarFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Validated reference to external media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MediaSidecarFields", into = "MediaSidecarFields")]
pub struct MediaSidecar {
    fields: MediaSidecarFields,
}

impl MediaSidecar {
    pub fn try_new(fields: MediaSidecarFields) -> TimelineResult<Self> {
        let references = [
            ("uri", fields.uri.as_deref()),
            ("object_id", fields.object_id.as_deref()),
            ("artifact_id", fields.artifact_id.as_deref()),
        ];

        let mut has_reference = false;
        for (name, value) in references {
            let Some(value) = value else {
                continue;
            };
            if value.trim().is_empty() {
                continue;
            }
            if is_inline_media(value) {
                return Err(TimelineError::UnsafePayload(format!(
                    "unsafe media: {name} embeds inline content; reference media by uri, object_id or artifact_id"
                )));
            }
            has_reference = true;
        }

        if !has_reference {
            return Err(TimelineError::UnsafePayload(
                "unsafe media: sidecar requires a uri, object_id or artifact_id".to_owned(),
            ));
        }

        Ok(Self { fields })
    }

    pub fn from_uri(uri: impl Into<String>) -> TimelineResult<Self> {
        Self::try_new(MediaSidecarFields {
            uri: Some(uri.into()),
            ..MediaSidecarFields::default()
        })
    }

    pub fn from_object_id(object_id: impl Into<String>) -> TimelineResult<Self> {
        Self::try_new(MediaSidecarFields {
            object_id: Some(object_id.into()),
            ..MediaSidecarFields::default()
        })
    }

    pub fn from_artifact_id(artifact_id: impl Into<String>) -> TimelineResult<Self> {
        Self::try_new(MediaSidecarFields {
            artifact_id: Some(artifact_id.into()),
            ..MediaSidecarFields::default()
        })
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.fields.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_size_bytes(mut self, size_bytes: u64) -> Self {
        self.fields.size_bytes = Some(size_bytes);
        self
    }

    pub fn uri(&self) -> Option<&str> {
        self.fields.uri.as_deref()
    }

    pub fn object_id(&self) -> Option<&str> {
        self.fields.object_id.as_deref()
    }

    pub fn artifact_id(&self) -> Option<&str> {
        self.fields.artifact_id.as_deref()
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.fields.mime_type.as_deref()
    }

    pub fn size_bytes(&self) -> Option<u64> {
        self.fields.size_bytes
    }
}

impl TryFrom<MediaSidecarFields> for MediaSidecar {
    type Error = TimelineError;

    fn try_from(fields: MediaSidecarFields) -> Result<Self, Self::Error> {
        Self::try_new(fields)
    }
}

impl From<MediaSidecar> for MediaSidecarFields {
    fn from(sidecar: MediaSidecar) -> Self {
        sidecar.fields
    }
}

fn is_inline_media(value: &str) -> bool {
    let lowered = value.trim_start().to_ascii_lowercase();
    lowered.starts_with("data:") || lowered.contains(";base64,")
}

/// Structured metadata for a canvas atom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomMetadata {
    pub atom_id: String,
    pub atom_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaSidecar>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

impl AtomMetadata {
    pub fn new(atom_id: impl Into<String>, atom_type: impl Into<String>) -> Self {
        Self {
            atom_id: atom_id.into(),
            atom_type: atom_type.into(),
            media: None,
            attributes: Map::new(),
        }
    }

    pub fn with_media(mut self, media: MediaSidecar) -> Self {
        self.media = Some(media);
        self
    }
}
