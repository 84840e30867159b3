//! Embedding backends.
//!
//! A backend is a factory whose blocking [`EmbeddingBackend::load`] produces
//! a ready [`EmbeddingModel`]. Models run blocking batch inference; the
//! [`EmbeddingGenerator`](crate::generator::EmbeddingGenerator) owns
//! scheduling, validation and normalization.
//!
//! - `OnnxBackend` loads a sentence-transformer ONNX export (e.g.
//!   all-MiniLM-L6-v2) via ort and tokenizes with the HuggingFace
//!   tokenizers crate. This is the production backend.
//! - `HashingBackend` hashes words and character trigrams into a fixed
//!   number of signed buckets. Deterministic, model-free, lexical only.
//! - `UnavailableBackend` never loads. It stands in for a disabled model so
//!   callers get `EmbeddingUnavailable` rather than a placeholder vector.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ort::session::Session;
use ort::value::TensorRef;
use sha2::{Digest, Sha256};
use tokenizers::{Tokenizer, TruncationParams};
use tracing::{debug, info};

use recall_core::error::{RecallError, Result};

/// A loaded model. Calls block; run them off the async runtime.
pub trait EmbeddingModel: Send + Sync {
    /// Identifier reported in health checks and logs.
    fn model_id(&self) -> &str;

    /// Length of every vector this model produces.
    fn dimensions(&self) -> usize;

    /// Embed each text, in order. Output need not be normalized.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Produces an [`EmbeddingModel`]. Loading may be slow and blocks.
pub trait EmbeddingBackend: Send + Sync {
    fn name(&self) -> &str;

    fn load(&self) -> Result<Arc<dyn EmbeddingModel>>;
}

// ---------------------------------------------------------------------------
// OnnxBackend - ONNX Runtime inference
// ---------------------------------------------------------------------------

/// Longest token sequence fed to the model.
const MAX_SEQUENCE_LENGTH: usize = 512;

/// Sentence-transformer ONNX model on disk.
///
/// The directory must contain:
/// - `model.onnx`: the sentence-transformer ONNX export
/// - `tokenizer.json`: the HuggingFace fast-tokenizer file
///
/// The model takes `input_ids`, `attention_mask`, and optionally
/// `token_type_ids` as i64 inputs and produces token-level embeddings.
#[derive(Debug, Clone)]
pub struct OnnxBackend {
    model_name: String,
    model_dir: PathBuf,
    intra_threads: usize,
    /// Used when the model's hidden size is dynamic in its metadata.
    fallback_dimensions: usize,
}

impl OnnxBackend {
    pub fn new(
        model_name: impl Into<String>,
        model_dir: impl Into<PathBuf>,
        intra_threads: usize,
        fallback_dimensions: usize,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            model_dir: model_dir.into(),
            intra_threads: intra_threads.max(1),
            fallback_dimensions,
        }
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }
}

impl EmbeddingBackend for OnnxBackend {
    fn name(&self) -> &str {
        "onnx"
    }

    fn load(&self) -> Result<Arc<dyn EmbeddingModel>> {
        let model_path = self.model_dir.join("model.onnx");
        let tokenizer_path = self.model_dir.join("tokenizer.json");
        if !model_path.exists() {
            return Err(RecallError::EmbeddingUnavailable(format!(
                "ONNX model not found at {}",
                model_path.display()
            )));
        }
        if !tokenizer_path.exists() {
            return Err(RecallError::EmbeddingUnavailable(format!(
                "Tokenizer not found at {}",
                tokenizer_path.display()
            )));
        }

        let session = Session::builder()
            .map_err(|e| RecallError::EmbeddingUnavailable(format!("ONNX session builder: {}", e)))?
            .with_intra_threads(self.intra_threads)
            .map_err(|e| RecallError::EmbeddingUnavailable(format!("ONNX set threads: {}", e)))?
            .commit_from_file(&model_path)
            .map_err(|e| RecallError::EmbeddingUnavailable(format!("ONNX load model: {}", e)))?;

        // Sentence-transformer output is [batch, seq_len, hidden_dim].
        let dimensions = session
            .outputs()
            .first()
            .and_then(|out| out.dtype().tensor_shape())
            .and_then(|shape| shape.last().copied())
            .filter(|d| *d > 0)
            .map(|d| d as usize)
            .unwrap_or(self.fallback_dimensions);
        let uses_token_types = session.inputs().len() > 2;

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            RecallError::EmbeddingUnavailable(format!("Failed to load tokenizer: {}", e))
        })?;
        tokenizer.with_padding(None);
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: MAX_SEQUENCE_LENGTH,
                ..TruncationParams::default()
            }))
            .map_err(|e| {
                RecallError::EmbeddingUnavailable(format!("Failed to configure truncation: {}", e))
            })?;

        info!(
            model = %model_path.display(),
            dimensions,
            intra_threads = self.intra_threads,
            "Loaded ONNX embedding model"
        );

        Ok(Arc::new(OnnxModel {
            model_id: self.model_name.clone(),
            session: Mutex::new(session),
            tokenizer,
            dimensions,
            uses_token_types,
        }))
    }
}

struct OnnxModel {
    model_id: String,
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    dimensions: usize,
    uses_token_types: bool,
}

impl OnnxModel {
    /// Tokenize the batch and pad every row to the longest sequence.
    fn encode(&self, texts: &[String]) -> Result<(usize, Vec<i64>, Vec<i64>, Vec<i64>)> {
        let mut encodings = Vec::with_capacity(texts.len());
        for text in texts {
            let encoding = self
                .tokenizer
                .encode(text.as_str(), true)
                .map_err(|e| RecallError::EmbeddingGeneration(format!("Tokenization failed: {}", e)))?;
            encodings.push(encoding);
        }

        let seq_len = encodings
            .iter()
            .map(|e| e.get_ids().len())
            .max()
            .unwrap_or(0)
            .max(1);
        let cells = texts.len() * seq_len;
        let mut input_ids = vec![0i64; cells];
        let mut attention_mask = vec![0i64; cells];
        let mut token_type_ids = vec![0i64; cells];

        for (row, encoding) in encodings.iter().enumerate() {
            let base = row * seq_len;
            for (col, &id) in encoding.get_ids().iter().enumerate() {
                input_ids[base + col] = i64::from(id);
            }
            for (col, &m) in encoding.get_attention_mask().iter().enumerate() {
                attention_mask[base + col] = i64::from(m);
            }
            for (col, &t) in encoding.get_type_ids().iter().enumerate() {
                token_type_ids[base + col] = i64::from(t);
            }
        }

        Ok((seq_len, input_ids, attention_mask, token_type_ids))
    }
}

impl EmbeddingModel for OnnxModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let batch = texts.len();
        let (seq_len, input_ids, attention_mask, token_type_ids) = self.encode(texts)?;

        let ids_array = ndarray::Array2::from_shape_vec((batch, seq_len), input_ids)
            .map_err(|e| RecallError::EmbeddingGeneration(format!("input_ids array: {}", e)))?;
        let mask_array = ndarray::Array2::from_shape_vec((batch, seq_len), attention_mask.clone())
            .map_err(|e| {
                RecallError::EmbeddingGeneration(format!("attention_mask array: {}", e))
            })?;
        let type_array = ndarray::Array2::from_shape_vec((batch, seq_len), token_type_ids)
            .map_err(|e| {
                RecallError::EmbeddingGeneration(format!("token_type_ids array: {}", e))
            })?;

        let ids_ref = TensorRef::from_array_view(&ids_array)
            .map_err(|e| RecallError::EmbeddingGeneration(format!("TensorRef input_ids: {}", e)))?;
        let mask_ref = TensorRef::from_array_view(&mask_array).map_err(|e| {
            RecallError::EmbeddingGeneration(format!("TensorRef attention_mask: {}", e))
        })?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| RecallError::EmbeddingGeneration(format!("Session lock poisoned: {}", e)))?;
        let outputs = if self.uses_token_types {
            let type_ref = TensorRef::from_array_view(&type_array).map_err(|e| {
                RecallError::EmbeddingGeneration(format!("TensorRef token_type_ids: {}", e))
            })?;
            session.run(ort::inputs![ids_ref, mask_ref, type_ref])
        } else {
            session.run(ort::inputs![ids_ref, mask_ref])
        }
        .map_err(|e| RecallError::EmbeddingGeneration(format!("ONNX inference failed: {}", e)))?;

        // ort 2.0 try_extract_tensor returns (&Shape, &[f32]).
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecallError::EmbeddingGeneration(format!("Extract embeddings: {}", e)))?;
        let shape_dims: Vec<i64> = shape.iter().copied().collect();
        let hidden_dim = match shape_dims.as_slice() {
            [b, s, h] if *b as usize == batch && *s as usize == seq_len => *h as usize,
            other => {
                return Err(RecallError::EmbeddingGeneration(format!(
                    "Unexpected output shape: {:?}",
                    other
                )))
            }
        };

        // Mean pooling over the sequence, masked by attention_mask.
        let mut pooled = Vec::with_capacity(batch);
        for row in 0..batch {
            let mut sum = vec![0.0f32; hidden_dim];
            let mut count = 0.0f32;
            for tok in 0..seq_len {
                if attention_mask[row * seq_len + tok] > 0 {
                    let offset = (row * seq_len + tok) * hidden_dim;
                    for (acc, v) in sum.iter_mut().zip(&data[offset..offset + hidden_dim]) {
                        *acc += v;
                    }
                    count += 1.0;
                }
            }
            if count > 0.0 {
                for val in &mut sum {
                    *val /= count;
                }
            }
            pooled.push(sum);
        }

        debug!(batch, seq_len, "ONNX batch embedded");
        Ok(pooled)
    }
}

// ---------------------------------------------------------------------------
// HashingBackend - deterministic lexical feature hashing
// ---------------------------------------------------------------------------

/// Weight of a whole-word feature relative to a character trigram.
const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct HashingBackend {
    dimensions: usize,
}

impl HashingBackend {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl EmbeddingBackend for HashingBackend {
    fn name(&self) -> &str {
        "hashing"
    }

    fn load(&self) -> Result<Arc<dyn EmbeddingModel>> {
        if self.dimensions == 0 {
            return Err(RecallError::EmbeddingUnavailable(
                "hashing backend needs at least one dimension".to_string(),
            ));
        }
        Ok(Arc::new(HashingModel {
            model_id: format!("feature-hashing-{}", self.dimensions),
            dimensions: self.dimensions,
        }))
    }
}

struct HashingModel {
    model_id: String,
    dimensions: usize,
}

impl HashingModel {
    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut bucket_bytes = [0u8; 8];
        bucket_bytes.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimensions as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let lowered = text.to_lowercase();
        let mut tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.is_empty() {
            tokens.push(lowered.trim());
        }

        let mut vector = vec![0.0f32; self.dimensions];
        for token in tokens {
            self.add_feature(&mut vector, &format!("w:{}", token), WORD_WEIGHT);
            let padded: Vec<char> = format!("#{}#", token).chars().collect();
            for tri in padded.windows(3) {
                let gram: String = tri.iter().collect();
                self.add_feature(&mut vector, &format!("t:{}", gram), TRIGRAM_WEIGHT);
            }
        }
        vector
    }
}

impl EmbeddingModel for HashingModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ---------------------------------------------------------------------------
// UnavailableBackend - explicit disabled mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct UnavailableBackend {
    reason: String,
}

impl UnavailableBackend {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl EmbeddingBackend for UnavailableBackend {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn load(&self) -> Result<Arc<dyn EmbeddingModel>> {
        Err(RecallError::EmbeddingUnavailable(self.reason.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        dot / (na * nb)
    }

    #[test]
    fn test_hashing_dimensions_and_determinism() {
        let model = HashingBackend::new(128).load().unwrap();
        let texts = vec!["same text".to_string(), "same text".to_string()];
        let out = model.embed_batch(&texts).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), 128);
        assert_eq!(out[0], out[1]);
        assert_eq!(model.dimensions(), 128);
        assert_eq!(model.model_id(), "feature-hashing-128");
    }

    #[test]
    fn test_hashing_lexical_overlap_scores_higher() {
        let model = HashingBackend::new(384).load().unwrap();
        let out = model
            .embed_batch(&[
                "the cat sat on the mat".to_string(),
                "a cat sat on a mat".to_string(),
                "quarterly revenue projections".to_string(),
            ])
            .unwrap();
        assert!(cosine(&out[0], &out[1]) > cosine(&out[0], &out[2]));
    }

    #[test]
    fn test_hashing_case_insensitive() {
        let model = HashingBackend::new(64).load().unwrap();
        let out = model
            .embed_batch(&["Hello World".to_string(), "hello world".to_string()])
            .unwrap();
        assert_eq!(out[0], out[1]);
    }

    #[test]
    fn test_hashing_punctuation_only_is_nonzero() {
        let model = HashingBackend::new(64).load().unwrap();
        let out = model.embed_batch(&["?!".to_string()]).unwrap();
        assert!(out[0].iter().any(|v| *v != 0.0));
    }

    #[test]
    fn test_hashing_zero_dimensions_fails_to_load() {
        assert!(matches!(
            HashingBackend::new(0).load(),
            Err(RecallError::EmbeddingUnavailable(_))
        ));
    }

    #[test]
    fn test_unavailable_backend_never_loads() {
        let backend = UnavailableBackend::new("model disabled");
        assert!(matches!(
            backend.load(),
            Err(RecallError::EmbeddingUnavailable(msg)) if msg == "model disabled"
        ));
    }

    #[test]
    fn test_onnx_missing_model() {
        let backend = OnnxBackend::new("missing", "/nonexistent", 1, 384);
        assert!(matches!(
            backend.load(),
            Err(RecallError::EmbeddingUnavailable(_))
        ));
    }
}
