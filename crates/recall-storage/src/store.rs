//! The Vector Store: records, their embeddings, and similarity search.
//!
//! Rows live in SQLite; an in-memory [`VectorIndex`] mirrors the embedding
//! column for search. Every write runs in a single transaction and the
//! index is updated right after the commit, under one write lock, so a
//! batch becomes searchable all at once or not at all.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use recall_core::config::IndexConfig;
use recall_core::error::{RecallError, Result};
use recall_core::types::{
    Chunk, HealthStatus, Metadata, NewRecord, Record, RecordId, RecordKind, ScoredRecord,
};

use crate::codec::{decode_embedding, encode_embedding, validate_embedding};
use crate::db::Database;
use crate::index::{IndexStats, VectorIndex};
use crate::migrations;

const RECORD_COLUMNS: &str =
    "id, kind, source_document_id, ordinal, text, char_count, metadata, embedding, created_at";

const MS_PER_DAY: i64 = 86_400_000;

/// Aggregate counters over the stored records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_records: u64,
    pub chunk_records: u64,
    pub log_records: u64,
    pub standalone_records: u64,
    pub documents: u64,
    pub records_with_blob_ref: u64,
    /// Mean `response_time_ms` over log records that carry one.
    pub avg_response_time_ms: Option<f64>,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
    pub db_size_bytes: u64,
}

/// A validated record ready for insertion.
struct PreparedRecord {
    kind: RecordKind,
    source_document_id: Option<String>,
    ordinal: Option<i64>,
    text: String,
    char_count: i64,
    metadata: String,
    blob: Vec<u8>,
    embedding: Vec<f32>,
}

impl PreparedRecord {
    fn new(record: NewRecord, dimensions: usize) -> Result<Self> {
        if record.text.trim().is_empty() {
            return Err(RecallError::InvalidInput(
                "record text must not be empty".to_string(),
            ));
        }
        validate_embedding(&record.embedding, dimensions)?;

        let is_chunk = record.kind == RecordKind::Chunk;
        let has_position = record.source_document_id.is_some() && record.ordinal.is_some();
        let has_any_position = record.source_document_id.is_some() || record.ordinal.is_some();
        if is_chunk && !has_position {
            return Err(RecallError::InvalidInput(
                "chunk records need a source document id and an ordinal".to_string(),
            ));
        }
        if !is_chunk && has_any_position {
            return Err(RecallError::InvalidInput(format!(
                "{} records cannot carry a source document position",
                record.kind.as_str()
            )));
        }

        Ok(Self {
            kind: record.kind,
            source_document_id: record.source_document_id.map(|id| id.to_string()),
            ordinal: record.ordinal.map(i64::from),
            char_count: record.text.chars().count() as i64,
            metadata: record.metadata.to_json_string()?,
            blob: encode_embedding(&record.embedding),
            text: record.text,
            embedding: record.embedding,
        })
    }
}

/// SQLite-backed vector store with an in-memory search index.
pub struct VectorStore {
    db: Arc<Database>,
    index: Arc<VectorIndex>,
    dimensions: usize,
    exact_scan_max_rows: usize,
    /// Serializes writers so index updates land in commit order.
    writes: Arc<Mutex<()>>,
    training: Arc<AtomicBool>,
}

impl VectorStore {
    /// Open the store on `db`, pinning or checking the embedding dimension
    /// and loading every stored embedding into the index.
    pub async fn open(db: Arc<Database>, dimensions: usize, config: IndexConfig) -> Result<Self> {
        if dimensions == 0 {
            return Err(RecallError::Config(
                "embedding dimensions must be greater than 0".to_string(),
            ));
        }

        db.with_conn(move |conn| migrations::ensure_dimensions(conn, dimensions))
            .await?;

        let store = Self {
            db,
            index: Arc::new(VectorIndex::new(dimensions, config.clone())),
            dimensions,
            exact_scan_max_rows: config.exact_scan_max_rows,
            writes: Arc::new(Mutex::new(())),
            training: Arc::new(AtomicBool::new(false)),
        };
        let stats = store.rebuild_index().await?;

        info!(
            dimensions,
            vectors = stats.vectors,
            strategy = ?stats.strategy,
            "Vector store opened"
        );
        Ok(store)
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Insert a standalone text with its embedding.
    pub async fn insert(
        &self,
        text: &str,
        metadata: Metadata,
        embedding: Vec<f32>,
    ) -> Result<RecordId> {
        self.insert_record(NewRecord::standalone(text, metadata, embedding))
            .await
    }

    pub async fn insert_record(&self, record: NewRecord) -> Result<RecordId> {
        let ids = self.insert_batch(vec![record]).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| RecallError::Storage("Insert returned no id".to_string()))
    }

    /// Insert every record in one transaction.
    ///
    /// All records are validated before the transaction starts; any failure,
    /// during validation or inside the transaction, leaves zero rows written.
    pub async fn insert_batch(&self, records: Vec<NewRecord>) -> Result<Vec<RecordId>> {
        self.write_records(None, records).await
    }

    /// Atomically swap a document's chunk set for `records`.
    pub async fn replace_document(
        &self,
        document_id: Uuid,
        records: Vec<NewRecord>,
    ) -> Result<Vec<RecordId>> {
        if let Some(stray) = records
            .iter()
            .find(|r| r.kind != RecordKind::Chunk || r.source_document_id != Some(document_id))
        {
            return Err(RecallError::InvalidInput(format!(
                "replacement for document {} contains a {} record from another source",
                document_id,
                stray.kind.as_str()
            )));
        }
        self.write_records(Some(document_id), records).await
    }

    async fn write_records(
        &self,
        replace: Option<Uuid>,
        records: Vec<NewRecord>,
    ) -> Result<Vec<RecordId>> {
        let prepared = records
            .into_iter()
            .map(|record| PreparedRecord::new(record, self.dimensions))
            .collect::<Result<Vec<_>>>()?;
        if prepared.is_empty() && replace.is_none() {
            return Ok(Vec::new());
        }

        let guard = Arc::clone(&self.writes).lock_owned().await;
        let index = Arc::clone(&self.index);
        let batch_size = prepared.len();

        let ids = self
            .db
            .with_conn(move |conn| {
                let _guard = guard;
                let tx = begin(conn)?;
                let removed = match replace {
                    Some(document_id) => delete_document_rows(&tx, document_id)?,
                    None => Vec::new(),
                };
                let ids = insert_rows(&tx, &prepared)?;
                tx.commit()
                    .map_err(|e| RecallError::Storage(format!("Failed to commit batch: {}", e)))?;

                let added = ids
                    .iter()
                    .copied()
                    .zip(prepared.into_iter().map(|p| p.embedding))
                    .collect();
                index.apply(&removed, added)?;
                Ok(ids)
            })
            .await?;

        debug!(records = batch_size, replaced = replace.is_some(), "Records written");
        self.schedule_training();
        Ok(ids)
    }

    pub async fn get(&self, id: RecordId) -> Result<Record> {
        let dimensions = self.dimensions;
        self.db
            .with_conn(move |conn| {
                let sql = format!("SELECT {} FROM records WHERE id = ?1", RECORD_COLUMNS);
                let record = conn
                    .query_row(&sql, rusqlite::params![id.0], |row| {
                        Ok(row_to_record(row, dimensions))
                    })
                    .optional()
                    .map_err(|e| RecallError::Storage(format!("Failed to fetch record: {}", e)))?;
                match record {
                    Some(record) => record,
                    None => Err(RecallError::NotFound(format!("record {}", id))),
                }
            })
            .await
    }

    pub async fn delete(&self, id: RecordId) -> Result<()> {
        let guard = Arc::clone(&self.writes).lock_owned().await;
        let index = Arc::clone(&self.index);
        self.db
            .with_conn(move |conn| {
                let _guard = guard;
                let deleted = conn
                    .execute("DELETE FROM records WHERE id = ?1", rusqlite::params![id.0])
                    .map_err(|e| RecallError::Storage(format!("Failed to delete record: {}", e)))?;
                if deleted == 0 {
                    return Err(RecallError::NotFound(format!("record {}", id)));
                }
                index.apply(&[id], Vec::new())
            })
            .await
    }

    /// Delete every record of a document. Returns how many were removed.
    pub async fn delete_document(&self, document_id: Uuid) -> Result<usize> {
        let guard = Arc::clone(&self.writes).lock_owned().await;
        let index = Arc::clone(&self.index);
        let removed = self
            .db
            .with_conn(move |conn| {
                let _guard = guard;
                let tx = begin(conn)?;
                let removed = delete_document_rows(&tx, document_id)?;
                tx.commit()
                    .map_err(|e| RecallError::Storage(format!("Failed to commit delete: {}", e)))?;
                index.apply(&removed, Vec::new())?;
                Ok(removed.len())
            })
            .await?;
        debug!(%document_id, removed, "Document deleted");
        Ok(removed)
    }

    /// Retention purge: delete records created more than `days` days ago.
    pub async fn delete_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now().timestamp_millis() - i64::from(days) * MS_PER_DAY;
        let guard = Arc::clone(&self.writes).lock_owned().await;
        let index = Arc::clone(&self.index);
        let removed = self
            .db
            .with_conn(move |conn| {
                let _guard = guard;
                let tx = begin(conn)?;
                let ids = select_ids(
                    &tx,
                    "SELECT id FROM records WHERE created_at < ?1",
                    rusqlite::params![cutoff],
                )?;
                tx.execute(
                    "DELETE FROM records WHERE created_at < ?1",
                    rusqlite::params![cutoff],
                )
                .map_err(|e| RecallError::Storage(format!("Retention purge failed: {}", e)))?;
                tx.commit()
                    .map_err(|e| RecallError::Storage(format!("Failed to commit purge: {}", e)))?;
                index.apply(&ids, Vec::new())?;
                Ok(ids.len())
            })
            .await?;
        info!(days, removed, "Retention purge complete");
        Ok(removed)
    }

    /// Top-`k` records most similar to `query`, best first, ties by id.
    ///
    /// `k == 0` yields an empty result. Records scoring below
    /// `min_similarity` are excluded, so fewer than `k` may come back.
    /// Hits deleted between the index scan and the row fetch are replaced
    /// by one wider scan.
    pub async fn similarity_search(
        &self,
        query: &[f32],
        k: usize,
        min_similarity: Option<f64>,
    ) -> Result<Vec<ScoredRecord>> {
        let mut wanted = k;
        let mut rescanned = false;
        loop {
            let index = Arc::clone(&self.index);
            let owned = query.to_vec();
            let hits =
                tokio::task::spawn_blocking(move || index.search(&owned, wanted, min_similarity))
                    .await
                    .map_err(|e| RecallError::Storage(format!("Search task failed: {}", e)))??;
            if hits.is_empty() {
                return Ok(Vec::new());
            }
            let exhausted = hits.len() < wanted;

            let dimensions = self.dimensions;
            let ids: Vec<i64> = hits.iter().map(|(id, _)| id.0).collect();
            let mut records = self
                .db
                .with_conn(move |conn| fetch_records(conn, &ids, dimensions))
                .await?;

            let mut results = Vec::with_capacity(hits.len());
            let mut missing = 0;
            for (id, similarity) in hits {
                match records.remove(&id) {
                    Some(record) => results.push(ScoredRecord { record, similarity }),
                    None => {
                        missing += 1;
                        debug!(%id, "Search hit vanished before fetch");
                    }
                }
            }

            if missing == 0 || exhausted || rescanned {
                results.truncate(k);
                return Ok(results);
            }
            debug!(missing, "Rescanning index to replace vanished hits");
            wanted = k + missing;
            rescanned = true;
        }
    }

    /// Records newest first.
    pub async fn list(&self, limit: usize, offset: usize) -> Result<Vec<Record>> {
        let dimensions = self.dimensions;
        self.db
            .with_conn(move |conn| {
                let sql = format!(
                    "SELECT {} FROM records ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2",
                    RECORD_COLUMNS
                );
                query_records(
                    conn,
                    &sql,
                    rusqlite::params![limit as i64, offset as i64],
                    dimensions,
                )
            })
            .await
    }

    /// A document's chunks in ordinal order.
    pub async fn chunks_for_document(&self, document_id: Uuid) -> Result<Vec<Chunk>> {
        let dimensions = self.dimensions;
        let records = self
            .db
            .with_conn(move |conn| {
                let sql = format!(
                    "SELECT {} FROM records
                     WHERE kind = 'chunk' AND source_document_id = ?1
                     ORDER BY ordinal ASC",
                    RECORD_COLUMNS
                );
                query_records(
                    conn,
                    &sql,
                    rusqlite::params![document_id.to_string()],
                    dimensions,
                )
            })
            .await?;
        Ok(records.iter().filter_map(Record::as_chunk).collect())
    }

    pub async fn count(&self) -> Result<u64> {
        self.db
            .with_conn(|conn| {
                let count: i64 = conn
                    .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
                    .map_err(|e| RecallError::Storage(format!("Failed to count records: {}", e)))?;
                Ok(count as u64)
            })
            .await
    }

    pub async fn statistics(&self) -> Result<StoreStats> {
        self.db
            .with_conn(|conn| {
                let stats = conn
                    .query_row(
                        "SELECT
                            COUNT(*),
                            COUNT(*) FILTER (WHERE kind = 'chunk'),
                            COUNT(*) FILTER (WHERE kind = 'log'),
                            COUNT(*) FILTER (WHERE kind = 'standalone'),
                            COUNT(DISTINCT source_document_id),
                            COUNT(json_extract(metadata, '$.blob_ref')),
                            AVG(json_extract(metadata, '$.response_time_ms'))
                                FILTER (WHERE kind = 'log'),
                            MIN(created_at),
                            MAX(created_at)
                         FROM records",
                        [],
                        |row| {
                            Ok((
                                row.get::<_, i64>(0)?,
                                row.get::<_, i64>(1)?,
                                row.get::<_, i64>(2)?,
                                row.get::<_, i64>(3)?,
                                row.get::<_, i64>(4)?,
                                row.get::<_, i64>(5)?,
                                row.get::<_, Option<f64>>(6)?,
                                row.get::<_, Option<i64>>(7)?,
                                row.get::<_, Option<i64>>(8)?,
                            ))
                        },
                    )
                    .map_err(|e| RecallError::Storage(format!("Failed to compute statistics: {}", e)))?;

                // page_count * page_size gives approximate DB size.
                let page_count: i64 = conn
                    .query_row("PRAGMA page_count", [], |row| row.get(0))
                    .map_err(|e| RecallError::Storage(e.to_string()))?;
                let page_size: i64 = conn
                    .query_row("PRAGMA page_size", [], |row| row.get(0))
                    .map_err(|e| RecallError::Storage(e.to_string()))?;

                let (total, chunks, logs, standalone, documents, with_blob, avg, first, last) =
                    stats;
                Ok(StoreStats {
                    total_records: total as u64,
                    chunk_records: chunks as u64,
                    log_records: logs as u64,
                    standalone_records: standalone as u64,
                    documents: documents as u64,
                    records_with_blob_ref: with_blob as u64,
                    avg_response_time_ms: avg,
                    earliest: first.map(millis_to_datetime).transpose()?,
                    latest: last.map(millis_to_datetime).transpose()?,
                    db_size_bytes: (page_count * page_size) as u64,
                })
            })
            .await
    }

    /// Reload the index from the table and re-partition it if the store has
    /// outgrown exact scan.
    pub async fn rebuild_index(&self) -> Result<IndexStats> {
        let guard = Arc::clone(&self.writes).lock_owned().await;
        let index = Arc::clone(&self.index);
        let dimensions = self.dimensions;
        let exact_scan_max_rows = self.exact_scan_max_rows;

        self.db
            .with_conn(move |conn| {
                let _guard = guard;
                let entries = load_embeddings(conn, dimensions)?;
                let rows = entries.len();
                index.reload(entries)?;
                if rows > exact_scan_max_rows {
                    index.train()?;
                }
                index.stats()
            })
            .await
    }

    pub fn index_stats(&self) -> Result<IndexStats> {
        self.index.stats()
    }

    pub async fn health_check(&self) -> HealthStatus {
        match self.count().await.and_then(|n| Ok((n, self.index.stats()?))) {
            Ok((records, stats)) => {
                let pool = self.db.pool_status();
                HealthStatus::healthy(
                    "vector_store",
                    format!(
                        "{} records, {} indexed, {:?}, {}/{} connections free",
                        records, stats.vectors, stats.strategy, pool.available, pool.max_size
                    ),
                )
            }
            Err(e) => HealthStatus::from_error("vector_store", &e),
        }
    }

    /// Kick off background training once the index outgrows exact scan.
    fn schedule_training(&self) {
        if !self.index.needs_training() || self.training.swap(true, Ordering::AcqRel) {
            return;
        }
        let index = Arc::clone(&self.index);
        let training = Arc::clone(&self.training);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = index.train() {
                warn!(error = %e, "Background index training failed");
            }
            training.store(false, Ordering::Release);
        });
    }
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore")
            .field("db", &self.db)
            .field("dimensions", &self.dimensions)
            .field("indexed", &self.index.len())
            .finish()
    }
}

fn begin(conn: &mut Connection) -> Result<Transaction<'_>> {
    conn.transaction()
        .map_err(|e| RecallError::Storage(format!("Failed to begin transaction: {}", e)))
}

fn insert_rows(tx: &Transaction<'_>, rows: &[PreparedRecord]) -> Result<Vec<RecordId>> {
    let now = Utc::now().timestamp_millis();
    let mut stmt = tx
        .prepare_cached(
            "INSERT INTO records
                (kind, source_document_id, ordinal, text, char_count, metadata, embedding, dimensions, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .map_err(|e| RecallError::Storage(e.to_string()))?;

    let mut ids = Vec::with_capacity(rows.len());
    for row in rows {
        stmt.execute(rusqlite::params![
            row.kind.as_str(),
            row.source_document_id,
            row.ordinal,
            row.text,
            row.char_count,
            row.metadata,
            row.blob,
            row.embedding.len() as i64,
            now,
        ])
        .map_err(|e| RecallError::Storage(format!("Failed to insert record: {}", e)))?;
        ids.push(RecordId(tx.last_insert_rowid()));
    }
    Ok(ids)
}

fn delete_document_rows(tx: &Transaction<'_>, document_id: Uuid) -> Result<Vec<RecordId>> {
    let key = document_id.to_string();
    let ids = select_ids(
        tx,
        "SELECT id FROM records WHERE source_document_id = ?1",
        rusqlite::params![key],
    )?;
    tx.execute(
        "DELETE FROM records WHERE source_document_id = ?1",
        rusqlite::params![key],
    )
    .map_err(|e| RecallError::Storage(format!("Failed to delete document: {}", e)))?;
    Ok(ids)
}

fn select_ids(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<RecordId>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| RecallError::Storage(e.to_string()))?;
    let rows = stmt
        .query_map(params, |row| row.get::<_, i64>(0))
        .map_err(|e| RecallError::Storage(e.to_string()))?;

    let mut ids = Vec::new();
    for row in rows {
        ids.push(RecordId(row.map_err(|e| RecallError::Storage(e.to_string()))?));
    }
    Ok(ids)
}

fn load_embeddings(conn: &Connection, dimensions: usize) -> Result<Vec<(RecordId, Vec<f32>)>> {
    let mut stmt = conn
        .prepare("SELECT id, embedding FROM records ORDER BY id")
        .map_err(|e| RecallError::Storage(e.to_string()))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)))
        .map_err(|e| RecallError::Storage(e.to_string()))?;

    let mut entries = Vec::new();
    for row in rows {
        let (id, blob) = row.map_err(|e| RecallError::Storage(e.to_string()))?;
        entries.push((RecordId(id), decode_embedding(&blob, dimensions)?));
    }
    Ok(entries)
}

fn query_records(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    dimensions: usize,
) -> Result<Vec<Record>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| RecallError::Storage(e.to_string()))?;
    let rows = stmt
        .query_map(params, |row| Ok(row_to_record(row, dimensions)))
        .map_err(|e| RecallError::Storage(e.to_string()))?;

    let mut records = Vec::new();
    for row in rows {
        let record = row.map_err(|e| RecallError::Storage(e.to_string()))??;
        records.push(record);
    }
    Ok(records)
}

fn fetch_records(
    conn: &Connection,
    ids: &[i64],
    dimensions: usize,
) -> Result<HashMap<RecordId, Record>> {
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!(
        "SELECT {} FROM records WHERE id IN ({})",
        RECORD_COLUMNS, placeholders
    );
    let records = query_records(
        conn,
        &sql,
        rusqlite::params_from_iter(ids.iter()),
        dimensions,
    )?;
    Ok(records.into_iter().map(|r| (r.id, r)).collect())
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| RecallError::Storage(format!("Invalid timestamp: {}", ms)))
}

fn row_to_record(row: &rusqlite::Row<'_>, dimensions: usize) -> Result<Record> {
    let id: i64 = row.get(0).map_err(|e| RecallError::Storage(e.to_string()))?;
    let kind: String = row.get(1).map_err(|e| RecallError::Storage(e.to_string()))?;
    let source_document_id: Option<String> =
        row.get(2).map_err(|e| RecallError::Storage(e.to_string()))?;
    let ordinal: Option<i64> = row.get(3).map_err(|e| RecallError::Storage(e.to_string()))?;
    let text: String = row.get(4).map_err(|e| RecallError::Storage(e.to_string()))?;
    let char_count: i64 = row.get(5).map_err(|e| RecallError::Storage(e.to_string()))?;
    let metadata: String = row.get(6).map_err(|e| RecallError::Storage(e.to_string()))?;
    let blob: Vec<u8> = row.get(7).map_err(|e| RecallError::Storage(e.to_string()))?;
    let created_at: i64 = row.get(8).map_err(|e| RecallError::Storage(e.to_string()))?;

    let source_document_id = source_document_id
        .map(|raw| {
            Uuid::parse_str(&raw)
                .map_err(|e| RecallError::Storage(format!("Invalid document UUID: {}", e)))
        })
        .transpose()?;
    let ordinal = ordinal
        .map(|raw| {
            u32::try_from(raw)
                .map_err(|_| RecallError::Storage(format!("Invalid ordinal: {}", raw)))
        })
        .transpose()?;

    Ok(Record {
        id: RecordId(id),
        kind: RecordKind::parse(&kind)?,
        text,
        metadata: Metadata::from_json_str(&metadata)?,
        embedding: decode_embedding(&blob, dimensions)?,
        source_document_id,
        ordinal,
        char_count: char_count as usize,
        created_at: millis_to_datetime(created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use recall_core::types::LogEntry;
    use serde_json::json;

    fn unit(values: &[f32]) -> Vec<f32> {
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        values.iter().map(|v| v / norm).collect()
    }

    async fn open_store(dimensions: usize) -> VectorStore {
        let db = Arc::new(Database::in_memory().unwrap());
        VectorStore::open(db, dimensions, IndexConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_get_round_trip() {
        let store = open_store(3).await;
        let meta = Metadata::new()
            .with("source", "upload")
            .with("nested", json!({"pages": [1, 2]}))
            .with_blob_ref("blobs/report.pdf");
        let embedding = unit(&[1.0, 2.0, 2.0]);

        let id = store
            .insert("quarterly report", meta.clone(), embedding.clone())
            .await
            .unwrap();
        let record = store.get(id).await.unwrap();

        assert_eq!(record.id, id);
        assert_eq!(record.kind, RecordKind::Standalone);
        assert_eq!(record.text, "quarterly report");
        assert_eq!(record.metadata, meta);
        assert_eq!(record.embedding, embedding);
        assert_eq!(record.char_count, 16);
        assert!(record.source_document_id.is_none());
    }

    #[tokio::test]
    async fn test_ids_ascend() {
        let store = open_store(2).await;
        let a = store
            .insert("first", Metadata::new(), vec![1.0, 0.0])
            .await
            .unwrap();
        let b = store
            .insert("second", Metadata::new(), vec![0.0, 1.0])
            .await
            .unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = open_store(2).await;
        assert!(matches!(
            store.get(RecordId(404)).await,
            Err(RecallError::NotFound(_))
        ));
        assert!(matches!(
            store.delete(RecordId(404)).await,
            Err(RecallError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_insert_validation() {
        let store = open_store(2).await;
        assert!(matches!(
            store.insert("x", Metadata::new(), vec![1.0, 0.0, 0.0]).await,
            Err(RecallError::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));
        assert!(matches!(
            store.insert("x", Metadata::new(), vec![2.0, 0.0]).await,
            Err(RecallError::InvalidInput(_))
        ));
        assert!(matches!(
            store.insert("x", Metadata::new(), vec![f32::NAN, 1.0]).await,
            Err(RecallError::InvalidInput(_))
        ));
        assert!(matches!(
            store.insert("  ", Metadata::new(), vec![1.0, 0.0]).await,
            Err(RecallError::InvalidInput(_))
        ));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_self_match_and_threshold() {
        let store = open_store(3).await;
        let target = unit(&[0.2, 0.9, 0.1]);
        let id = store
            .insert("target", Metadata::new(), target.clone())
            .await
            .unwrap();
        store
            .insert("other", Metadata::new(), unit(&[-0.9, 0.1, 0.3]))
            .await
            .unwrap();

        let hits = store.similarity_search(&target, 5, None).await.unwrap();
        assert_eq!(hits[0].record.id, id);
        assert!((hits[0].similarity - 1.0).abs() < 1e-5);
        assert_eq!(hits.len(), 2);

        let hits = store
            .similarity_search(&target, 5, Some(0.9))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(store
            .similarity_search(&target, 0, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_search_rejects_malformed_threshold() {
        let store = open_store(2).await;
        store
            .insert("east", Metadata::new(), vec![1.0, 0.0])
            .await
            .unwrap();
        store
            .insert("west", Metadata::new(), vec![-1.0, 0.0])
            .await
            .unwrap();

        for threshold in [f64::NAN, f64::INFINITY, 1.5, -1.01] {
            assert!(matches!(
                store.similarity_search(&[1.0, 0.0], 5, Some(threshold)).await,
                Err(RecallError::InvalidInput(_))
            ));
        }

        let hits = store
            .similarity_search(&[1.0, 0.0], 5, Some(-1.0))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        let hits = store
            .similarity_search(&[1.0, 0.0], 5, Some(0.0))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.text, "east");
    }

    #[tokio::test]
    async fn test_search_fills_k_when_a_hit_vanishes() {
        let store = open_store(2).await;
        let best = store
            .insert("best", Metadata::new(), vec![1.0, 0.0])
            .await
            .unwrap();
        store
            .insert("near", Metadata::new(), unit(&[0.9, 0.1]))
            .await
            .unwrap();
        store
            .insert("far", Metadata::new(), unit(&[0.1, 0.9]))
            .await
            .unwrap();

        // Remove the top row behind the index's back so the scan still
        // returns it but the fetch cannot.
        store
            .database()
            .with_conn(move |conn| {
                conn.execute("DELETE FROM records WHERE id = ?1", [best.0])
                    .map_err(|e| RecallError::Storage(e.to_string()))?;
                Ok(())
            })
            .await
            .unwrap();

        let hits = store.similarity_search(&[1.0, 0.0], 2, None).await.unwrap();
        let texts: Vec<&str> = hits.iter().map(|h| h.record.text.as_str()).collect();
        assert_eq!(texts, vec!["near", "far"]);
    }

    #[tokio::test]
    async fn test_search_rejects_wrong_dimension() {
        let store = open_store(3).await;
        store
            .insert("a", Metadata::new(), vec![1.0, 0.0, 0.0])
            .await
            .unwrap();
        assert!(matches!(
            store.similarity_search(&[1.0, 0.0], 5, None).await,
            Err(RecallError::DimensionMismatch { .. })
        ));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_batch_rolls_back_on_constraint_violation() {
        let store = open_store(2).await;
        let doc = Uuid::new_v4();
        let batch = vec![
            NewRecord::chunk(doc, 0, "one", Metadata::new(), vec![1.0, 0.0]),
            NewRecord::chunk(doc, 1, "two", Metadata::new(), vec![0.0, 1.0]),
            NewRecord::chunk(doc, 1, "dup", Metadata::new(), vec![0.0, 1.0]),
        ];
        assert!(matches!(
            store.insert_batch(batch).await,
            Err(RecallError::Storage(_))
        ));
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store.index_stats().unwrap().vectors == 0);
    }

    #[tokio::test]
    async fn test_batch_validated_before_writing() {
        let store = open_store(2).await;
        let batch = vec![
            NewRecord::standalone("ok", Metadata::new(), vec![1.0, 0.0]),
            NewRecord::standalone("bad", Metadata::new(), vec![3.0, 4.0]),
        ];
        assert!(store.insert_batch(batch).await.is_err());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replace_document() {
        let store = open_store(2).await;
        let doc = Uuid::new_v4();
        store
            .insert_batch(vec![
                NewRecord::chunk(doc, 0, "old zero", Metadata::new(), vec![1.0, 0.0]),
                NewRecord::chunk(doc, 1, "old one", Metadata::new(), vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let ids = store
            .replace_document(
                doc,
                vec![NewRecord::chunk(doc, 0, "new zero", Metadata::new(), vec![1.0, 0.0])],
            )
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);

        let chunks = store.chunks_for_document(doc).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "new zero");
        assert_eq!(store.index_stats().unwrap().vectors, 1);

        let foreign = NewRecord::chunk(Uuid::new_v4(), 0, "x", Metadata::new(), vec![1.0, 0.0]);
        assert!(matches!(
            store.replace_document(doc, vec![foreign]).await,
            Err(RecallError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_and_delete_document() {
        let store = open_store(2).await;
        let doc = Uuid::new_v4();
        store
            .insert_batch(vec![
                NewRecord::chunk(doc, 0, "a", Metadata::new(), vec![1.0, 0.0]),
                NewRecord::chunk(doc, 1, "b", Metadata::new(), vec![0.0, 1.0]),
            ])
            .await
            .unwrap();
        let lone = store
            .insert("lone", Metadata::new(), vec![1.0, 0.0])
            .await
            .unwrap();

        assert_eq!(store.delete_document(doc).await.unwrap(), 2);
        assert_eq!(store.delete_document(doc).await.unwrap(), 0);

        store.delete(lone).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store
            .similarity_search(&[1.0, 0.0], 5, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let store = open_store(2).await;
        let mut ids = Vec::new();
        for text in ["one", "two", "three"] {
            ids.push(
                store
                    .insert(text, Metadata::new(), vec![1.0, 0.0])
                    .await
                    .unwrap(),
            );
        }
        let page = store.list(2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, ids[2]);
        assert_eq!(page[1].id, ids[1]);

        let rest = store.list(10, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, ids[0]);
    }

    #[tokio::test]
    async fn test_statistics() {
        let store = open_store(2).await;
        let entry = LogEntry {
            system_prompt: "sys".to_string(),
            user_context: "ctx".to_string(),
            result: "out".to_string(),
            blob_ref: Some("blobs/1".to_string()),
            response_time_ms: Some(100),
        };
        store
            .insert_record(NewRecord::log(entry.clone(), vec![1.0, 0.0]))
            .await
            .unwrap();
        store
            .insert_record(NewRecord::log(
                LogEntry {
                    blob_ref: None,
                    response_time_ms: Some(300),
                    ..entry
                },
                vec![0.0, 1.0],
            ))
            .await
            .unwrap();
        store
            .insert_record(NewRecord::chunk(
                Uuid::new_v4(),
                0,
                "chunk",
                Metadata::new(),
                vec![1.0, 0.0],
            ))
            .await
            .unwrap();

        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.total_records, 3);
        assert_eq!(stats.log_records, 2);
        assert_eq!(stats.chunk_records, 1);
        assert_eq!(stats.standalone_records, 0);
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.records_with_blob_ref, 1);
        assert_eq!(stats.avg_response_time_ms, Some(200.0));
        assert!(stats.earliest.is_some());
        assert!(stats.earliest <= stats.latest);
    }

    #[tokio::test]
    async fn test_empty_statistics() {
        let store = open_store(2).await;
        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.total_records, 0);
        assert_eq!(stats.avg_response_time_ms, None);
        assert_eq!(stats.earliest, None);
    }

    #[tokio::test]
    async fn test_delete_older_than() {
        let store = open_store(2).await;
        let id = store
            .insert("old", Metadata::new(), vec![1.0, 0.0])
            .await
            .unwrap();
        let ten_days_ago = Utc::now().timestamp_millis() - 10 * MS_PER_DAY;
        store
            .database()
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE records SET created_at = ?1 WHERE id = ?2",
                    rusqlite::params![ten_days_ago, id.0],
                )
                .map_err(|e| RecallError::Storage(e.to_string()))?;
                Ok(())
            })
            .await
            .unwrap();
        store
            .insert("fresh", Metadata::new(), vec![0.0, 1.0])
            .await
            .unwrap();

        assert_eq!(store.delete_older_than(30).await.unwrap(), 0);
        assert_eq!(store.delete_older_than(7).await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.index_stats().unwrap().vectors, 1);
    }

    #[tokio::test]
    async fn test_reopen_checks_dimensions_and_reloads_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let db = Arc::new(Database::new(&path).unwrap());
            let store = VectorStore::open(db, 2, IndexConfig::default())
                .await
                .unwrap();
            store
                .insert("persisted", Metadata::new(), vec![0.0, 1.0])
                .await
                .unwrap();
        }

        let db = Arc::new(Database::new(&path).unwrap());
        let store = VectorStore::open(Arc::clone(&db), 2, IndexConfig::default())
            .await
            .unwrap();
        let hits = store.similarity_search(&[0.0, 1.0], 1, None).await.unwrap();
        assert_eq!(hits[0].record.text, "persisted");

        assert!(matches!(
            VectorStore::open(db, 3, IndexConfig::default()).await,
            Err(RecallError::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));
    }

    #[tokio::test]
    async fn test_rebuild_index_trains_past_threshold() {
        let db = Arc::new(Database::in_memory().unwrap());
        let config = IndexConfig {
            exact_scan_max_rows: 8,
            partitions: Some(3),
            probes: Some(3),
            kmeans_iterations: 5,
        };
        let store = VectorStore::open(db, 2, config).await.unwrap();

        let records: Vec<NewRecord> = (0..12)
            .map(|i| {
                let angle = i as f32 * 0.5;
                NewRecord::standalone(
                    format!("point {}", i),
                    Metadata::new(),
                    vec![angle.cos(), angle.sin()],
                )
            })
            .collect();
        store.insert_batch(records).await.unwrap();

        let stats = store.rebuild_index().await.unwrap();
        assert_eq!(stats.vectors, 12);
        assert!(matches!(
            stats.strategy,
            crate::index::IndexStrategy::Ivf {
                partitions: 3,
                probes: 3
            }
        ));

        let hits = store
            .similarity_search(&[1.0, 0.0], 1, None)
            .await
            .unwrap();
        assert_eq!(hits[0].record.text, "point 0");
    }

    #[tokio::test]
    async fn test_health_check() {
        let store = open_store(2).await;
        assert!(store.health_check().await.is_healthy());
    }
}
