//! Embedding blob encoding and vector validation.
//!
//! Embeddings are persisted as packed little-endian `f32` values, exactly
//! `dimensions * 4` bytes per row.

use recall_core::error::{RecallError, Result};

/// Largest tolerated deviation of a stored vector's L2 norm from 1.0.
pub const NORM_TOLERANCE: f64 = 1e-3;

pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(vector));
    for &value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub fn decode_embedding(blob: &[u8], dimensions: usize) -> Result<Vec<f32>> {
    let expected_len = dimensions * std::mem::size_of::<f32>();
    if blob.len() != expected_len {
        return Err(RecallError::Storage(format!(
            "Invalid embedding byte length: expected {}, got {}",
            expected_len,
            blob.len()
        )));
    }

    let mut out = Vec::with_capacity(dimensions);
    for chunk in blob.chunks_exact(4) {
        let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if !value.is_finite() {
            return Err(RecallError::Storage(
                "Stored embedding contains non-finite values".to_string(),
            ));
        }
        out.push(value);
    }
    Ok(out)
}

pub fn l2_norm(vector: &[f32]) -> f64 {
    vector
        .iter()
        .map(|v| f64::from(*v) * f64::from(*v))
        .sum::<f64>()
        .sqrt()
}

/// Dot product, accumulated in f64.
pub fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum()
}

/// Check a query vector: right length, finite values.
pub fn validate_query(vector: &[f32], dimensions: usize) -> Result<()> {
    if vector.len() != dimensions {
        return Err(RecallError::DimensionMismatch {
            expected: dimensions,
            actual: vector.len(),
        });
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(RecallError::InvalidInput(
            "query vector contains non-finite values".to_string(),
        ));
    }
    Ok(())
}

/// Check a similarity threshold: finite and within [-1, 1].
pub fn validate_min_similarity(min_similarity: Option<f64>) -> Result<()> {
    match min_similarity {
        Some(min) if !min.is_finite() || !(-1.0..=1.0).contains(&min) => {
            Err(RecallError::InvalidInput(format!(
                "min_similarity must be within [-1, 1], got {}",
                min
            )))
        }
        _ => Ok(()),
    }
}

/// Check a vector about to be written: a valid query vector that is also
/// unit length.
pub fn validate_embedding(vector: &[f32], dimensions: usize) -> Result<()> {
    validate_query(vector, dimensions)?;
    let norm = l2_norm(vector);
    if (norm - 1.0).abs() > NORM_TOLERANCE {
        return Err(RecallError::InvalidInput(format!(
            "embedding must be L2-normalized (norm = {:.6})",
            norm
        )));
    }
    Ok(())
}
