//! Recall ingestion pipeline.
//!
//! Documents pass through chunking, embedding, and a single transactional
//! insert. Nothing is written unless every chunk embedded successfully, so
//! a failure at any stage leaves the store untouched.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use recall_core::error::Result;
use recall_core::types::{LogEntry, Metadata, NewRecord, RecordId};
use recall_storage::VectorStore;

use crate::chunker::{Chunker, TextChunk};
use crate::generator::EmbeddingGenerator;

/// Outcome of ingesting one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub document_id: Uuid,
    /// Ids of the stored chunk records, in ordinal order.
    pub record_ids: Vec<RecordId>,
    /// Chunks produced by the chunker, stored or not.
    pub chunk_count: usize,
    /// Ordinals of whitespace-only chunks that were not stored.
    pub skipped_chunks: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct Ingestor {
    chunker: Chunker,
    generator: Arc<EmbeddingGenerator>,
    store: Arc<VectorStore>,
}

impl Ingestor {
    pub fn new(chunker: Chunker, generator: Arc<EmbeddingGenerator>, store: Arc<VectorStore>) -> Self {
        Self {
            chunker,
            generator,
            store,
        }
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    /// Chunk, embed and store a new document under a fresh document id.
    ///
    /// An empty document yields an empty report.
    pub async fn ingest_document(&self, text: &str, metadata: Metadata) -> Result<IngestReport> {
        let document_id = Uuid::new_v4();
        let started = Instant::now();
        let (records, report) = self.prepare(document_id, text, &metadata).await?;

        let record_ids = if records.is_empty() {
            Vec::new()
        } else {
            self.store.insert_batch(records).await?
        };

        info!(
            %document_id,
            chunks = report.chunk_count,
            stored = record_ids.len(),
            skipped = report.skipped_chunks.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Document ingested"
        );
        Ok(IngestReport {
            record_ids,
            ..report
        })
    }

    /// Replace a document's chunks with those of `text`, atomically.
    pub async fn reingest_document(
        &self,
        document_id: Uuid,
        text: &str,
        metadata: Metadata,
    ) -> Result<IngestReport> {
        let started = Instant::now();
        let (records, report) = self.prepare(document_id, text, &metadata).await?;
        let record_ids = self.store.replace_document(document_id, records).await?;

        info!(
            %document_id,
            chunks = report.chunk_count,
            stored = record_ids.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Document re-ingested"
        );
        Ok(IngestReport {
            record_ids,
            ..report
        })
    }

    /// Embed and store a single text on its own.
    pub async fn ingest_text(&self, text: &str, metadata: Metadata) -> Result<RecordId> {
        let embedding = self.generator.embed(text).await?;
        self.store.insert(text, metadata, embedding).await
    }

    /// Store a generation log entry, embedding its user context.
    pub async fn ingest_log_entry(&self, entry: LogEntry) -> Result<RecordId> {
        let embedding = self.generator.embed(&entry.user_context).await?;
        let id = self
            .store
            .insert_record(NewRecord::log(entry, embedding))
            .await?;
        debug!(%id, "Log entry ingested");
        Ok(id)
    }

    /// Chunk and embed, producing the records to write.
    async fn prepare(
        &self,
        document_id: Uuid,
        text: &str,
        metadata: &Metadata,
    ) -> Result<(Vec<NewRecord>, IngestReport)> {
        let chunks = self.chunker.chunk(text);
        let chunk_count = chunks.len();

        let (embeddable, skipped): (Vec<TextChunk>, Vec<TextChunk>) = chunks
            .into_iter()
            .partition(|chunk| !chunk.text.trim().is_empty());
        let skipped_chunks: Vec<u32> = skipped.iter().map(|c| c.ordinal).collect();
        for ordinal in &skipped_chunks {
            debug!(%document_id, ordinal, "Skipping whitespace-only chunk");
        }

        let texts: Vec<&str> = embeddable.iter().map(|c| c.text.as_str()).collect();
        let embeddings = self.generator.embed_batch(&texts).await?;

        let records = embeddable
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| {
                NewRecord::chunk(
                    document_id,
                    chunk.ordinal,
                    chunk.text,
                    metadata.clone(),
                    embedding,
                )
            })
            .collect();

        Ok((
            records,
            IngestReport {
                document_id,
                record_ids: Vec::new(),
                chunk_count,
                skipped_chunks,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recall_core::config::{EmbeddingBackendKind, EmbeddingConfig, IndexConfig};
    use recall_core::error::RecallError;
    use recall_core::types::RecordKind;
    use recall_storage::Database;

    async fn ingestor(backend: EmbeddingBackendKind, chunker: Chunker) -> (Ingestor, Arc<VectorStore>) {
        let generator = Arc::new(EmbeddingGenerator::from_config(&EmbeddingConfig {
            backend,
            dimensions: 64,
            workers: 2,
            ..EmbeddingConfig::default()
        }));
        let db = Arc::new(Database::in_memory().unwrap());
        let store = Arc::new(VectorStore::open(db, 64, IndexConfig::default()).await.unwrap());
        (Ingestor::new(chunker, generator, Arc::clone(&store)), store)
    }

    #[tokio::test]
    async fn test_ingest_document_stores_chunks_in_order() {
        let (ingestor, store) =
            ingestor(EmbeddingBackendKind::Hashing, Chunker::new(40, 0).unwrap()).await;
        let text = "First paragraph about rivers.\n\nSecond paragraph about mountains.\n\nThird about deserts.";
        let meta = Metadata::new().with_blob_ref("docs/geo.txt");

        let report = ingestor.ingest_document(text, meta).await.unwrap();
        assert_eq!(report.chunk_count, 3);
        assert_eq!(report.record_ids.len(), 3);
        assert!(report.skipped_chunks.is_empty());

        let chunks = store.chunks_for_document(report.document_id).await.unwrap();
        let joined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(joined, text);

        let record = store.get(report.record_ids[1]).await.unwrap();
        assert_eq!(record.kind, RecordKind::Chunk);
        assert_eq!(record.ordinal, Some(1));
        assert_eq!(record.metadata.blob_ref(), Some("docs/geo.txt"));
    }

    #[tokio::test]
    async fn test_empty_document_gives_empty_report() {
        let (ingestor, store) = ingestor(EmbeddingBackendKind::Hashing, Chunker::default()).await;
        let report = ingestor.ingest_document("", Metadata::new()).await.unwrap();
        assert_eq!(report.chunk_count, 0);
        assert!(report.record_ids.is_empty());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_whitespace_chunks_skipped() {
        let (ingestor, store) =
            ingestor(EmbeddingBackendKind::Hashing, Chunker::new(10, 0).unwrap()).await;
        let text = format!("short one\n{}\nend text", " ".repeat(12));
        let report = ingestor.ingest_document(&text, Metadata::new()).await.unwrap();

        assert!(!report.skipped_chunks.is_empty());
        assert_eq!(
            report.record_ids.len() + report.skipped_chunks.len(),
            report.chunk_count
        );
        assert_eq!(store.count().await.unwrap() as usize, report.record_ids.len());
    }

    #[tokio::test]
    async fn test_unavailable_backend_writes_nothing() {
        let (ingestor, store) = ingestor(EmbeddingBackendKind::Disabled, Chunker::default()).await;
        assert!(matches!(
            ingestor.ingest_document("some text", Metadata::new()).await,
            Err(RecallError::EmbeddingUnavailable(_))
        ));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reingest_replaces_chunks() {
        let (ingestor, store) =
            ingestor(EmbeddingBackendKind::Hashing, Chunker::new(20, 0).unwrap()).await;
        let first = ingestor
            .ingest_document("one two three four five six seven eight nine", Metadata::new())
            .await
            .unwrap();
        assert!(first.record_ids.len() > 1);

        let second = ingestor
            .reingest_document(first.document_id, "just one chunk", Metadata::new())
            .await
            .unwrap();
        assert_eq!(second.document_id, first.document_id);
        assert_eq!(second.record_ids.len(), 1);

        let chunks = store.chunks_for_document(first.document_id).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "just one chunk");
    }

    #[tokio::test]
    async fn test_ingest_log_entry() {
        let (ingestor, store) = ingestor(EmbeddingBackendKind::Hashing, Chunker::default()).await;
        let id = ingestor
            .ingest_log_entry(LogEntry {
                system_prompt: "Be brief.".to_string(),
                user_context: "Summarize the meeting notes".to_string(),
                result: "Decisions were made.".to_string(),
                blob_ref: Some("notes/2024-05-01.md".to_string()),
                response_time_ms: Some(840),
            })
            .await
            .unwrap();

        let record = store.get(id).await.unwrap();
        assert_eq!(record.kind, RecordKind::Log);
        assert_eq!(record.text, "Summarize the meeting notes");
        assert_eq!(record.metadata.blob_ref(), Some("notes/2024-05-01.md"));

        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.log_records, 1);
        assert_eq!(stats.avg_response_time_ms, Some(840.0));
    }

    #[tokio::test]
    async fn test_ingest_text_is_searchable() {
        let (ingestor, store) = ingestor(EmbeddingBackendKind::Hashing, Chunker::default()).await;
        let id = ingestor
            .ingest_text("standalone note about tea", Metadata::new())
            .await
            .unwrap();
        let record = store.get(id).await.unwrap();
        let hits = store
            .similarity_search(&record.embedding, 1, None)
            .await
            .unwrap();
        assert_eq!(hits[0].record.id, id);
    }
}
