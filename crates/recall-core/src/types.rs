use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{ErrorKind, RecallError};

// =============================================================================
// Identifiers and enums
// =============================================================================

/// Store-assigned record identifier. Ascending in insertion order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a stored record represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// A chunk of a larger source document.
    Chunk,
    /// A generation log entry supplied by the upstream generation service.
    Log,
    /// A single text inserted directly, outside any document.
    Standalone,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Chunk => "chunk",
            RecordKind::Log => "log",
            RecordKind::Standalone => "standalone",
        }
    }

    pub fn parse(value: &str) -> Result<Self, RecallError> {
        match value {
            "chunk" => Ok(RecordKind::Chunk),
            "log" => Ok(RecordKind::Log),
            "standalone" => Ok(RecordKind::Standalone),
            other => Err(RecallError::Storage(format!(
                "unknown record kind: {}",
                other
            ))),
        }
    }
}

// =============================================================================
// Metadata
// =============================================================================

/// Key under which a blob store reference is kept in [`Metadata`].
pub const BLOB_REF_KEY: &str = "blob_ref";

/// Opaque key-value metadata attached to a record.
///
/// The core never interprets the values, except for the optional blob
/// reference string stored under [`BLOB_REF_KEY`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(Map<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build metadata from a JSON value. Only objects (and `null`) are accepted.
    pub fn from_value(value: Value) -> Result<Self, RecallError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::new()),
            other => Err(RecallError::InvalidInput(format!(
                "metadata must be a JSON object, got {}",
                other
            ))),
        }
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Attach a blob store reference.
    pub fn with_blob_ref(self, blob_ref: impl Into<String>) -> Self {
        self.with(BLOB_REF_KEY, blob_ref.into())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// The blob store reference, if one was attached.
    pub fn blob_ref(&self) -> Option<&str> {
        self.0.get(BLOB_REF_KEY).and_then(Value::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn to_json_string(&self) -> Result<String, RecallError> {
        Ok(serde_json::to_string(&self.0)?)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, RecallError> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(value)
    }
}

// =============================================================================
// Records
// =============================================================================

/// A stored record: text, metadata, and the one embedding derived from that text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub kind: RecordKind,
    pub text: String,
    pub metadata: Metadata,
    pub embedding: Vec<f32>,
    /// Set for chunk records only.
    pub source_document_id: Option<Uuid>,
    /// Position within the source document (chunk records only).
    pub ordinal: Option<u32>,
    /// Length of `text` in chars.
    pub char_count: usize,
    pub created_at: DateTime<Utc>,
}

impl Record {
    /// View this record as a document chunk, if it is one.
    pub fn as_chunk(&self) -> Option<Chunk> {
        match (self.kind, self.source_document_id, self.ordinal) {
            (RecordKind::Chunk, Some(source_document_id), Some(ordinal)) => Some(Chunk {
                id: self.id,
                source_document_id,
                ordinal,
                text: self.text.clone(),
                char_count: self.char_count,
                created_at: self.created_at,
            }),
            _ => None,
        }
    }
}

/// A bounded, ordered slice of a source document, as persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: RecordId,
    pub source_document_id: Uuid,
    pub ordinal: u32,
    pub text: String,
    pub char_count: usize,
    pub created_at: DateTime<Utc>,
}

/// A record that has not been written yet.
#[derive(Clone, Debug, PartialEq)]
pub struct NewRecord {
    pub kind: RecordKind,
    pub text: String,
    pub metadata: Metadata,
    pub embedding: Vec<f32>,
    pub source_document_id: Option<Uuid>,
    pub ordinal: Option<u32>,
}

impl NewRecord {
    /// A text inserted on its own.
    pub fn standalone(text: impl Into<String>, metadata: Metadata, embedding: Vec<f32>) -> Self {
        Self {
            kind: RecordKind::Standalone,
            text: text.into(),
            metadata,
            embedding,
            source_document_id: None,
            ordinal: None,
        }
    }

    /// One chunk of a document.
    pub fn chunk(
        source_document_id: Uuid,
        ordinal: u32,
        text: impl Into<String>,
        metadata: Metadata,
        embedding: Vec<f32>,
    ) -> Self {
        Self {
            kind: RecordKind::Chunk,
            text: text.into(),
            metadata,
            embedding,
            source_document_id: Some(source_document_id),
            ordinal: Some(ordinal),
        }
    }

    /// A generation log entry. `embedding` must be the embedding of
    /// `entry.user_context`.
    pub fn log(entry: LogEntry, embedding: Vec<f32>) -> Self {
        let (text, metadata) = entry.into_parts();
        Self {
            kind: RecordKind::Log,
            text,
            metadata,
            embedding,
            source_document_id: None,
            ordinal: None,
        }
    }
}

/// A search hit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub record: Record,
    /// Cosine similarity in [-1, 1].
    pub similarity: f64,
}

/// A generation log produced by the upstream generation service.
///
/// Only `user_context` is embedded; everything else rides along as metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub system_prompt: String,
    pub user_context: String,
    pub result: String,
    pub blob_ref: Option<String>,
    pub response_time_ms: Option<u64>,
}

impl LogEntry {
    /// Split into the embedded text and the metadata stored beside it.
    pub fn into_parts(self) -> (String, Metadata) {
        let mut metadata = Metadata::new()
            .with("system_prompt", self.system_prompt)
            .with("result", self.result);
        if let Some(blob_ref) = self.blob_ref {
            metadata.insert(BLOB_REF_KEY, blob_ref);
        }
        if let Some(ms) = self.response_time_ms {
            metadata.insert("response_time_ms", ms);
        }
        (self.user_context, metadata)
    }
}

// =============================================================================
// Health
// =============================================================================

/// Health of a single component, as a tagged variant rather than a loose map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy {
        component: String,
        detail: String,
    },
    Unhealthy {
        component: String,
        kind: ErrorKind,
        message: String,
    },
}

impl HealthStatus {
    pub fn healthy(component: impl Into<String>, detail: impl Into<String>) -> Self {
        HealthStatus::Healthy {
            component: component.into(),
            detail: detail.into(),
        }
    }

    pub fn from_error(component: impl Into<String>, err: &RecallError) -> Self {
        HealthStatus::Unhealthy {
            component: component.into(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy { .. })
    }
}

/// Aggregate health of every component.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub components: Vec<HealthStatus>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.components.iter().all(HealthStatus::is_healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_kind_round_trip() {
        for kind in [RecordKind::Chunk, RecordKind::Log, RecordKind::Standalone] {
            assert_eq!(RecordKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(RecordKind::parse("frame").is_err());
    }

    #[test]
    fn test_metadata_rejects_non_object() {
        assert!(Metadata::from_value(json!([1, 2])).is_err());
        assert!(Metadata::from_value(json!("text")).is_err());
        assert!(Metadata::from_value(Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_metadata_blob_ref() {
        let meta = Metadata::new()
            .with("source", "upload")
            .with_blob_ref("s3://bucket/report.txt");
        assert_eq!(meta.blob_ref(), Some("s3://bucket/report.txt"));
        assert_eq!(meta.get("source"), Some(&json!("upload")));
    }

    #[test]
    fn test_metadata_json_round_trip() {
        let meta = Metadata::new().with("n", 3).with("nested", json!({"a": [1, 2]}));
        let raw = meta.to_json_string().unwrap();
        assert_eq!(Metadata::from_json_str(&raw).unwrap(), meta);
    }

    #[test]
    fn test_log_entry_into_parts() {
        let entry = LogEntry {
            system_prompt: "You are terse.".to_string(),
            user_context: "Summarize the quarterly report".to_string(),
            result: "Revenue grew.".to_string(),
            blob_ref: Some("reports/q3.txt".to_string()),
            response_time_ms: Some(420),
        };
        let (text, meta) = entry.into_parts();
        assert_eq!(text, "Summarize the quarterly report");
        assert_eq!(meta.blob_ref(), Some("reports/q3.txt"));
        assert_eq!(meta.get("response_time_ms"), Some(&json!(420)));
        assert_eq!(meta.get("result"), Some(&json!("Revenue grew.")));
    }

    #[test]
    fn test_record_as_chunk() {
        let doc = Uuid::new_v4();
        let record = Record {
            id: RecordId(7),
            kind: RecordKind::Chunk,
            text: "hello".to_string(),
            metadata: Metadata::new(),
            embedding: vec![1.0],
            source_document_id: Some(doc),
            ordinal: Some(2),
            char_count: 5,
            created_at: Utc::now(),
        };
        let chunk = record.as_chunk().unwrap();
        assert_eq!(chunk.source_document_id, doc);
        assert_eq!(chunk.ordinal, 2);

        let standalone = Record {
            kind: RecordKind::Standalone,
            source_document_id: None,
            ordinal: None,
            ..record
        };
        assert!(standalone.as_chunk().is_none());
    }

    #[test]
    fn test_health_status_tagged_serialization() {
        let err = RecallError::EmbeddingUnavailable("model disabled".to_string());
        let status = HealthStatus::from_error("embedding", &err);
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["status"], "unhealthy");
        assert_eq!(value["kind"], "embedding_unavailable");
        assert!(!status.is_healthy());

        let report = HealthReport {
            components: vec![HealthStatus::healthy("store", "12 records"), status],
        };
        assert!(!report.is_healthy());
    }
}
