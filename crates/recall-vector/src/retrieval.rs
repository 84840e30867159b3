//! Retrieval: embed a query, then rank stored records by cosine similarity.
//!
//! Queries are embedded fresh on every call. Scores come straight from the
//! store and are cosine similarities in [-1, 1] regardless of index strategy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use recall_core::config::SearchConfig;
use recall_core::error::{RecallError, Result};
use recall_core::types::ScoredRecord;
use recall_storage::codec::validate_min_similarity;
use recall_storage::VectorStore;

use crate::generator::EmbeddingGenerator;

fn default_k() -> usize {
    5
}

/// A similarity query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub min_similarity: Option<f64>,
    /// Deadline for embedding plus search.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            k: default_k(),
            min_similarity: None,
            timeout_ms: None,
        }
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_min_similarity(mut self, min_similarity: f64) -> Self {
        self.min_similarity = Some(min_similarity);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Retriever {
    generator: Arc<EmbeddingGenerator>,
    store: Arc<VectorStore>,
    defaults: SearchConfig,
}

impl Retriever {
    pub fn new(
        generator: Arc<EmbeddingGenerator>,
        store: Arc<VectorStore>,
        defaults: SearchConfig,
    ) -> Self {
        Self {
            generator,
            store,
            defaults,
        }
    }

    /// A request pre-filled with the configured defaults.
    pub fn request(&self, query: impl Into<String>) -> SearchRequest {
        SearchRequest {
            query: query.into(),
            k: self.defaults.default_k,
            min_similarity: self.defaults.default_min_similarity,
            timeout_ms: self.defaults.default_timeout_ms,
        }
    }

    /// Top-`k` records for `query_text`, best first.
    pub async fn search(
        &self,
        query_text: &str,
        k: usize,
        min_similarity: Option<f64>,
    ) -> Result<Vec<ScoredRecord>> {
        self.search_request(SearchRequest {
            query: query_text.to_string(),
            k,
            min_similarity,
            timeout_ms: None,
        })
        .await
    }

    pub async fn search_request(&self, request: SearchRequest) -> Result<Vec<ScoredRecord>> {
        validate_min_similarity(request.min_similarity)?;

        match request.timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), self.run(&request))
                .await
                .map_err(|_| RecallError::Timeout {
                    operation: "search".to_string(),
                    after_ms: ms,
                })?,
            None => self.run(&request).await,
        }
    }

    async fn run(&self, request: &SearchRequest) -> Result<Vec<ScoredRecord>> {
        let started = Instant::now();
        let query_vector = self.generator.embed(&request.query).await?;
        if query_vector.len() != self.store.dimensions() {
            return Err(RecallError::DimensionMismatch {
                expected: self.store.dimensions(),
                actual: query_vector.len(),
            });
        }

        let results = self
            .store
            .similarity_search(&query_vector, request.k, request.min_similarity)
            .await?;

        debug!(
            k = request.k,
            min_similarity = ?request.min_similarity,
            results = results.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Search complete"
        );
        Ok(results)
    }
}
