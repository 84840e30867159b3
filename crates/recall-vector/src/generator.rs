//! The Embedding Generator.
//!
//! Owns the model handle behind a once-guard, so the model is loaded lazily
//! exactly once no matter how many callers race on the first request. All
//! blocking work (load and inference) goes through `spawn_blocking`, gated
//! by a fair semaphore sized to the worker count. When every worker is busy
//! the configured [`SaturationPolicy`] decides whether inference callers
//! queue or are turned away. The model load always queues.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info, warn};

use recall_core::config::{expand_home, EmbeddingBackendKind, EmbeddingConfig, SaturationPolicy};
use recall_core::error::{ErrorKind, RecallError, Result};
use recall_core::types::HealthStatus;

use crate::embedding::{
    EmbeddingBackend, EmbeddingModel, HashingBackend, OnnxBackend, UnavailableBackend,
};

/// Text embedded by [`EmbeddingGenerator::health_check`].
const HEALTH_PROBE: &str = "health check";

/// Lifecycle of the model handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Unloaded,
    Loading,
    Ready,
}

/// Per-item result of [`EmbeddingGenerator::embed_each`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EmbeddingOutcome {
    Success { vector: Vec<f32> },
    Failure { kind: ErrorKind, message: String },
}

impl EmbeddingOutcome {
    fn failure(err: &RecallError) -> Self {
        EmbeddingOutcome::Failure {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, EmbeddingOutcome::Success { .. })
    }

    pub fn into_result(self) -> std::result::Result<Vec<f32>, (ErrorKind, String)> {
        match self {
            EmbeddingOutcome::Success { vector } => Ok(vector),
            EmbeddingOutcome::Failure { kind, message } => Err((kind, message)),
        }
    }
}

/// Clears the loading flag even if the loading future is dropped.
struct LoadingFlag<'a>(&'a AtomicBool);

impl<'a> LoadingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for LoadingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Turns text into unit-length vectors of a fixed dimension.
pub struct EmbeddingGenerator {
    backend: Arc<dyn EmbeddingBackend>,
    model: OnceCell<Arc<dyn EmbeddingModel>>,
    loading: AtomicBool,
    workers: Arc<Semaphore>,
    worker_count: usize,
    saturation: SaturationPolicy,
    batch_size: usize,
    dimensions: usize,
    instruction_prefix: Option<String>,
}

impl EmbeddingGenerator {
    /// Build a generator around `backend`. Nothing is loaded until first use.
    pub fn new(backend: Arc<dyn EmbeddingBackend>, config: &EmbeddingConfig) -> Self {
        let worker_count = config.resolved_workers().max(1);
        Self {
            backend,
            model: OnceCell::new(),
            loading: AtomicBool::new(false),
            workers: Arc::new(Semaphore::new(worker_count)),
            worker_count,
            saturation: config.saturation,
            batch_size: config.batch_size.max(1),
            dimensions: config.dimensions,
            instruction_prefix: config.instruction_prefix.clone(),
        }
    }

    /// Build a generator with the backend named in the configuration.
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        let backend: Arc<dyn EmbeddingBackend> = match config.backend {
            EmbeddingBackendKind::Onnx => Arc::new(OnnxBackend::new(
                config.model_name.clone(),
                expand_home(&config.model_dir),
                config.intra_threads,
                config.dimensions,
            )),
            EmbeddingBackendKind::Hashing => Arc::new(HashingBackend::new(config.dimensions)),
            EmbeddingBackendKind::Disabled => Arc::new(UnavailableBackend::new(
                "embedding backend disabled by configuration",
            )),
        };
        Self::new(backend, config)
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn state(&self) -> ModelState {
        if self.model.initialized() {
            ModelState::Ready
        } else if self.loading.load(Ordering::Acquire) {
            ModelState::Loading
        } else {
            ModelState::Unloaded
        }
    }

    /// Identifier of the loaded model, if one is loaded.
    pub fn model_id(&self) -> Option<String> {
        self.model.get().map(|m| m.model_id().to_string())
    }

    /// Load the model now instead of on first use.
    pub async fn preload(&self) -> Result<()> {
        self.model().await.map(|_| ())
    }

    /// The loaded model, loading it first if needed.
    ///
    /// Concurrent first callers wait on the same load. A failed load leaves
    /// the generator unloaded, so a later call tries again.
    async fn model(&self) -> Result<Arc<dyn EmbeddingModel>> {
        let model = self
            .model
            .get_or_try_init(|| async {
                let _flag = LoadingFlag::raise(&self.loading);
                self.load_model().await
            })
            .await?;
        Ok(Arc::clone(model))
    }

    async fn load_model(&self) -> Result<Arc<dyn EmbeddingModel>> {
        let backend = Arc::clone(&self.backend);
        let started = Instant::now();
        info!(backend = backend.name(), "Loading embedding model");

        // The load always queues for a worker; the saturation policy only
        // applies to inference.
        let permit = Arc::clone(&self.workers)
            .acquire_owned()
            .await
            .map_err(|e| RecallError::EmbeddingUnavailable(format!("Worker pool closed: {}", e)))?;
        let loaded = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            backend.load()
        })
        .await
            .map_err(|e| RecallError::EmbeddingUnavailable(format!("Model load task failed: {}", e)))?;

        let model = match loaded {
            Ok(model) => model,
            Err(RecallError::EmbeddingUnavailable(msg)) => {
                warn!(error = %msg, "Embedding model unavailable");
                return Err(RecallError::EmbeddingUnavailable(msg));
            }
            Err(e) => {
                warn!(error = %e, "Embedding model failed to load");
                return Err(RecallError::EmbeddingUnavailable(e.to_string()));
            }
        };

        if model.dimensions() != self.dimensions {
            warn!(
                model = model.model_id(),
                model_dimensions = model.dimensions(),
                expected = self.dimensions,
                "Embedding model dimension does not match configuration"
            );
            return Err(RecallError::EmbeddingUnavailable(format!(
                "model {} produces {}-dimensional vectors, configured for {}",
                model.model_id(),
                model.dimensions(),
                self.dimensions
            )));
        }

        info!(
            model = model.model_id(),
            dimensions = model.dimensions(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Embedding model ready"
        );
        Ok(model)
    }

    async fn acquire_worker(&self) -> Result<OwnedSemaphorePermit> {
        match self.saturation {
            SaturationPolicy::Queue => Arc::clone(&self.workers)
                .acquire_owned()
                .await
                .map_err(|e| RecallError::EmbeddingGeneration(format!("Worker pool closed: {}", e))),
            SaturationPolicy::Reject => {
                Arc::clone(&self.workers)
                    .try_acquire_owned()
                    .map_err(|e| match e {
                        TryAcquireError::NoPermits => RecallError::Saturated(format!(
                            "all {} embedding workers are busy",
                            self.worker_count
                        )),
                        TryAcquireError::Closed => {
                            RecallError::EmbeddingGeneration("Worker pool closed".to_string())
                        }
                    })
            }
        }
    }

    /// Embed a single text.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text]).await?;
        vectors
            .pop()
            .ok_or_else(|| RecallError::EmbeddingGeneration("Model returned no vector".to_string()))
    }

    /// Embed many texts, in order.
    ///
    /// Every text is validated before the model is touched; one empty text
    /// rejects the whole batch. Texts are dispatched `batch_size` at a time.
    pub async fn embed_batch<S: AsRef<str>>(&self, texts: &[S]) -> Result<Vec<Vec<f32>>> {
        if let Some(position) = texts.iter().position(|t| t.as_ref().trim().is_empty()) {
            return Err(RecallError::InvalidInput(format!(
                "text at position {} is empty or whitespace",
                position
            )));
        }
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let model = self.model().await?;
        let prepared: Vec<String> = texts
            .iter()
            .map(|t| match &self.instruction_prefix {
                Some(prefix) => format!("{}{}", prefix, t.as_ref()),
                None => t.as_ref().to_string(),
            })
            .collect();

        let mut vectors = Vec::with_capacity(prepared.len());
        for batch in prepared.chunks(self.batch_size) {
            let permit = self.acquire_worker().await?;
            let model = Arc::clone(&model);
            let batch = batch.to_vec();
            let expected = batch.len();

            let raw = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                model.embed_batch(&batch)
            })
            .await
            .map_err(|e| RecallError::EmbeddingGeneration(format!("Embedding task failed: {}", e)))??;

            if raw.len() != expected {
                return Err(RecallError::EmbeddingGeneration(format!(
                    "model returned {} vectors for {} texts",
                    raw.len(),
                    expected
                )));
            }
            for vector in raw {
                vectors.push(normalize(vector, self.dimensions)?);
            }
        }

        debug!(texts = texts.len(), "Embedded batch");
        Ok(vectors)
    }

    /// [`embed`](Self::embed) with a deadline. On expiry any in-flight
    /// inference finishes in the background and its result is dropped.
    pub async fn embed_with_timeout(&self, text: &str, timeout: Duration) -> Result<Vec<f32>> {
        tokio::time::timeout(timeout, self.embed(text))
            .await
            .map_err(|_| RecallError::Timeout {
                operation: "embed".to_string(),
                after_ms: timeout.as_millis() as u64,
            })?
    }

    pub async fn embed_batch_with_timeout<S: AsRef<str>>(
        &self,
        texts: &[S],
        timeout: Duration,
    ) -> Result<Vec<Vec<f32>>> {
        tokio::time::timeout(timeout, self.embed_batch(texts))
            .await
            .map_err(|_| RecallError::Timeout {
                operation: "embed_batch".to_string(),
                after_ms: timeout.as_millis() as u64,
            })?
    }

    /// Embed every text, reporting success or failure per item instead of
    /// failing the whole call.
    pub async fn embed_each<S: AsRef<str>>(&self, texts: &[S]) -> Vec<EmbeddingOutcome> {
        let mut outcomes: Vec<Option<EmbeddingOutcome>> = vec![None; texts.len()];
        let mut valid = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            if text.as_ref().trim().is_empty() {
                let err = RecallError::InvalidInput("text is empty or whitespace".to_string());
                outcomes[i] = Some(EmbeddingOutcome::failure(&err));
            } else {
                valid.push(i);
            }
        }

        let batch: Vec<&str> = valid.iter().map(|&i| texts[i].as_ref()).collect();
        match self.embed_batch(&batch).await {
            Ok(vectors) => {
                for (i, vector) in valid.into_iter().zip(vectors) {
                    outcomes[i] = Some(EmbeddingOutcome::Success { vector });
                }
            }
            Err(e) => {
                for i in valid {
                    outcomes[i] = Some(EmbeddingOutcome::failure(&e));
                }
            }
        }

        outcomes
            .into_iter()
            .map(|o| {
                o.unwrap_or_else(|| {
                    EmbeddingOutcome::failure(&RecallError::EmbeddingGeneration(
                        "no result produced".to_string(),
                    ))
                })
            })
            .collect()
    }

    /// Embed a probe text end to end.
    pub async fn health_check(&self) -> HealthStatus {
        match self.embed(HEALTH_PROBE).await {
            Ok(vector) => HealthStatus::healthy(
                "embedding",
                format!(
                    "model {} ready, {} dimensions",
                    self.model_id().unwrap_or_default(),
                    vector.len()
                ),
            ),
            Err(e) => HealthStatus::from_error("embedding", &e),
        }
    }
}

impl std::fmt::Debug for EmbeddingGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingGenerator")
            .field("backend", &self.backend.name())
            .field("state", &self.state())
            .field("dimensions", &self.dimensions)
            .field("workers", &self.worker_count)
            .field("saturation", &self.saturation)
            .finish()
    }
}

/// Enforce the output contract: right length, finite, unit L2 norm.
fn normalize(mut vector: Vec<f32>, dimensions: usize) -> Result<Vec<f32>> {
    if vector.len() != dimensions {
        return Err(RecallError::EmbeddingGeneration(format!(
            "model produced {} values, expected {}",
            vector.len(),
            dimensions
        )));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(RecallError::EmbeddingGeneration(
            "model produced non-finite values".to_string(),
        ));
    }
    let norm = vector
        .iter()
        .map(|v| f64::from(*v) * f64::from(*v))
        .sum::<f64>()
        .sqrt();
    if norm <= f64::EPSILON {
        return Err(RecallError::EmbeddingGeneration(
            "model produced a zero vector".to_string(),
        ));
    }
    for val in &mut vector {
        *val = (f64::from(*val) / norm) as f32;
    }
    Ok(vector)
}
