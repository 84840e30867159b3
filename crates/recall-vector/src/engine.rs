//! Composition root wiring configuration into the store, generator,
//! retriever and ingestor.

use std::sync::Arc;

use tracing::info;

use recall_core::config::RecallConfig;
use recall_core::error::Result;
use recall_core::types::HealthReport;
use recall_storage::{Database, VectorStore};

use crate::chunker::Chunker;
use crate::generator::EmbeddingGenerator;
use crate::pipeline::Ingestor;
use crate::retrieval::Retriever;

/// Owns every long-lived component. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RecallEngine {
    generator: Arc<EmbeddingGenerator>,
    store: Arc<VectorStore>,
    retriever: Retriever,
    ingestor: Ingestor,
}

impl RecallEngine {
    /// Open the configured database and build the embedding backend.
    ///
    /// The model is loaded lazily on first use; call
    /// [`EmbeddingGenerator::preload`] to load it eagerly.
    pub async fn open(config: &RecallConfig) -> Result<Self> {
        config.validate()?;

        let db = Arc::new(Database::open(&config.storage)?);
        let store = Arc::new(
            VectorStore::open(db, config.embedding.dimensions, config.index.clone()).await?,
        );
        let generator = Arc::new(EmbeddingGenerator::from_config(&config.embedding));
        let chunker = Chunker::from_config(&config.chunking)?;

        info!(
            backend = generator.backend_name(),
            dimensions = generator.dimensions(),
            workers = generator.worker_count(),
            database = %config.storage.database_path,
            "Recall engine opened"
        );
        Ok(Self::from_parts(generator, store, chunker, config))
    }

    /// Assemble an engine from already-built components.
    pub fn from_parts(
        generator: Arc<EmbeddingGenerator>,
        store: Arc<VectorStore>,
        chunker: Chunker,
        config: &RecallConfig,
    ) -> Self {
        let retriever = Retriever::new(
            Arc::clone(&generator),
            Arc::clone(&store),
            config.search.clone(),
        );
        let ingestor = Ingestor::new(chunker, Arc::clone(&generator), Arc::clone(&store));
        Self {
            generator,
            store,
            retriever,
            ingestor,
        }
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    pub fn generator(&self) -> &Arc<EmbeddingGenerator> {
        &self.generator
    }

    /// Probe the store and the embedding model concurrently.
    pub async fn health(&self) -> HealthReport {
        let (store, embedding) =
            tokio::join!(self.store.health_check(), self.generator.health_check());
        HealthReport {
            components: vec![store, embedding],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recall_core::config::EmbeddingBackendKind;
    use recall_core::error::{ErrorKind, RecallError};
    use recall_core::types::{HealthStatus, Metadata};

    fn config(backend: EmbeddingBackendKind) -> RecallConfig {
        let mut config = RecallConfig::default();
        config.storage.database_path = ":memory:".to_string();
        config.embedding.backend = backend;
        config.embedding.dimensions = 96;
        config
    }

    #[tokio::test]
    async fn test_open_ingest_and_search() {
        let engine = RecallEngine::open(&config(EmbeddingBackendKind::Hashing))
            .await
            .unwrap();
        engine
            .ingestor()
            .ingest_document("Tide tables for the northern harbor.", Metadata::new())
            .await
            .unwrap();

        let hits = engine
            .retriever()
            .search("Tide tables for the northern harbor.", 3, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].similarity > 0.99);
        assert_eq!(engine.store().dimensions(), 96);
    }

    #[tokio::test]
    async fn test_health_reports_both_components() {
        let engine = RecallEngine::open(&config(EmbeddingBackendKind::Hashing))
            .await
            .unwrap();
        let report = engine.health().await;
        assert!(report.is_healthy());
        assert_eq!(report.components.len(), 2);
    }

    #[tokio::test]
    async fn test_health_flags_disabled_backend() {
        let engine = RecallEngine::open(&config(EmbeddingBackendKind::Disabled))
            .await
            .unwrap();
        let report = engine.health().await;
        assert!(!report.is_healthy());
        assert!(report.components.iter().any(|c| matches!(
            c,
            HealthStatus::Unhealthy {
                component,
                kind: ErrorKind::EmbeddingUnavailable,
                ..
            } if component == "embedding"
        )));
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let mut bad = config(EmbeddingBackendKind::Hashing);
        bad.chunking.overlap = bad.chunking.target_size;
        assert!(matches!(
            RecallEngine::open(&bad).await,
            Err(RecallError::Config(_))
        ));
    }
}
