use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::error::{Error, Result};
use crate::vector::Vector;

/// Open key/value metadata attached to a record
pub type Metadata = serde_json::Map<String, Value>;

/// A record as written by the caller
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub embedding: Vector,
    pub metadata: Option<Metadata>,
    pub document: Option<String>,
}

impl Record {
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>, embedding: Vector) -> Self {
        Self {
            id: id.into(),
            embedding,
            metadata: None,
            document: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_document(mut self, document: impl Into<String>) -> Self {
        self.document = Some(document.into());
        self
    }

    /// The portion of the record owned by the metadata store
    pub fn meta(&self) -> RecordMeta {
        RecordMeta {
            metadata: self.metadata.clone(),
            document: self.document.clone(),
        }
    }
}

/// Metadata and document of a record, without the embedding
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
}

/// Which fields a read should hydrate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Include {
    pub embeddings: bool,
    pub metadatas: bool,
    pub documents: bool,
    pub distances: bool,
}

impl Include {
    pub const ALL: Include = Include {
        embeddings: true,
        metadatas: true,
        documents: true,
        distances: true,
    };

    pub const NONE: Include = Include {
        embeddings: false,
        metadatas: false,
        documents: false,
        distances: false,
    };

    /// True when metadata or documents must be read from the metadata store
    #[inline]
    pub fn needs_meta(&self) -> bool {
        self.metadatas || self.documents
    }
}

/// Longest record id accepted, in bytes. Keeps `collection:id` keys within
/// LMDB's 511-byte key limit so every backend accepts the same ids.
pub const MAX_ID_BYTES: usize = 256;

pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::Validation("ids must be non-empty".to_string()));
    }
    if id.len() > MAX_ID_BYTES {
        return Err(Error::Validation(format!(
            "id of {} bytes exceeds the {} byte limit",
            id.len(),
            MAX_ID_BYTES
        )));
    }
    Ok(())
}

/// Check metadata written through add/upsert. Values must be scalars;
/// `allow_null` admits JSON null, which update uses to delete a key.
pub fn validate_metadata(metadata: &Metadata, allow_null: bool) -> Result<()> {
    for (key, value) in metadata {
        if key.is_empty() {
            return Err(Error::Validation("metadata keys must be non-empty".to_string()));
        }
        if key.starts_with('#') || key.starts_with('$') {
            return Err(Error::Validation(format!(
                "metadata key '{}' uses a reserved prefix",
                key
            )));
        }
        match value {
            Value::String(_) | Value::Number(_) | Value::Bool(_) => {}
            Value::Null if allow_null => {}
            other => {
                return Err(Error::Validation(format!(
                    "metadata value for '{}' must be a string, number or boolean, got {}",
                    key, other
                )))
            }
        }
    }
    Ok(())
}
