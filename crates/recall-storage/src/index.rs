//! In-memory vector index mirrored from the `records` table.
//!
//! Small stores are searched by exact linear scan. Once the row count
//! crosses `exact_scan_max_rows` the index is partitioned IVF-style:
//! spherical k-means groups the vectors around centroids and a query only
//! scores the `probes` partitions whose centroids are nearest. Partitioning
//! trades recall for speed; scores are always the true dot product.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use recall_core::config::IndexConfig;
use recall_core::error::{RecallError, Result};
use recall_core::types::RecordId;

use crate::codec::{dot, l2_norm, validate_min_similarity, validate_query};

/// Vectors sampled per partition when training centroids.
const TRAINING_SAMPLES_PER_PARTITION: usize = 256;

/// Above this many rows the partition count grows with sqrt(rows).
const LINEAR_PARTITION_LIMIT: usize = 1_000_000;

/// How queries are currently answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum IndexStrategy {
    Exact,
    Ivf { partitions: usize, probes: usize },
}

/// Index counters reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub vectors: usize,
    pub dimensions: usize,
    pub strategy: IndexStrategy,
    /// Row count at the last training, 0 if never trained.
    pub trained_rows: usize,
}

/// Trained IVF state.
#[derive(Debug)]
struct Partitions {
    centroids: Vec<Vec<f32>>,
    lists: Vec<Vec<RecordId>>,
    assignment: HashMap<RecordId, usize>,
    probes: usize,
    trained_rows: usize,
}

impl Partitions {
    fn assign(&mut self, id: RecordId, vector: &[f32]) {
        let slot = nearest_centroid(&self.centroids, vector);
        self.lists[slot].push(id);
        self.assignment.insert(id, slot);
    }

    fn unassign(&mut self, id: RecordId) {
        if let Some(slot) = self.assignment.remove(&id) {
            self.lists[slot].retain(|member| *member != id);
        }
    }
}

#[derive(Debug, Default)]
struct IndexInner {
    vectors: BTreeMap<RecordId, Arc<[f32]>>,
    partitions: Option<Partitions>,
}

/// Thread-safe vector index keyed by record id.
#[derive(Debug)]
pub struct VectorIndex {
    dimensions: usize,
    config: IndexConfig,
    inner: RwLock<IndexInner>,
}

impl VectorIndex {
    pub fn new(dimensions: usize, config: IndexConfig) -> Self {
        Self {
            dimensions,
            config,
            inner: RwLock::new(IndexInner::default()),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, IndexInner>> {
        self.inner
            .read()
            .map_err(|e| RecallError::Storage(format!("Index lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, IndexInner>> {
        self.inner
            .write()
            .map_err(|e| RecallError::Storage(format!("Index lock poisoned: {}", e)))
    }

    /// Remove and add vectors under a single write lock, so concurrent
    /// searches see either none or all of the change.
    pub fn apply(&self, removed: &[RecordId], added: Vec<(RecordId, Vec<f32>)>) -> Result<()> {
        let mut inner = self.write()?;
        let IndexInner {
            vectors,
            partitions,
        } = &mut *inner;

        for id in removed {
            vectors.remove(id);
            if let Some(parts) = partitions.as_mut() {
                parts.unassign(*id);
            }
        }
        for (id, vector) in added {
            let vector: Arc<[f32]> = vector.into();
            if let Some(parts) = partitions.as_mut() {
                parts.unassign(id);
                parts.assign(id, &vector);
            }
            vectors.insert(id, vector);
        }
        Ok(())
    }

    /// Replace the whole contents, dropping any trained partitions.
    pub fn reload(&self, entries: Vec<(RecordId, Vec<f32>)>) -> Result<()> {
        let vectors = entries
            .into_iter()
            .map(|(id, vector)| (id, Arc::from(vector)))
            .collect();
        let mut inner = self.write()?;
        inner.vectors = vectors;
        inner.partitions = None;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.vectors.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Result<IndexStats> {
        let inner = self.read()?;
        let (strategy, trained_rows) = match &inner.partitions {
            Some(parts) => (
                IndexStrategy::Ivf {
                    partitions: parts.centroids.len(),
                    probes: parts.probes,
                },
                parts.trained_rows,
            ),
            None => (IndexStrategy::Exact, 0),
        };
        Ok(IndexStats {
            vectors: inner.vectors.len(),
            dimensions: self.dimensions,
            strategy,
            trained_rows,
        })
    }

    /// Whether the row count warrants (re)training: the store has outgrown
    /// exact scan and is either untrained or has doubled since training.
    pub fn needs_training(&self) -> bool {
        let Ok(inner) = self.inner.read() else {
            return false;
        };
        let rows = inner.vectors.len();
        if rows <= self.config.exact_scan_max_rows {
            return false;
        }
        match &inner.partitions {
            None => true,
            Some(parts) => rows >= parts.trained_rows.saturating_mul(2),
        }
    }

    /// Top-`k` records by similarity to `query`, best first, ties by id.
    ///
    /// The query is normalized before scoring, so scores are cosine
    /// similarities clamped to [-1, 1]. Rows scoring below `min_similarity`
    /// are dropped; a threshold that is not a finite value in [-1, 1] is
    /// rejected.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        min_similarity: Option<f64>,
    ) -> Result<Vec<(RecordId, f64)>> {
        validate_query(query, self.dimensions)?;
        validate_min_similarity(min_similarity)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let norm = l2_norm(query);
        if norm <= f64::EPSILON {
            return Err(RecallError::InvalidInput(
                "query vector has zero norm".to_string(),
            ));
        }
        let query: Vec<f32> = query.iter().map(|v| (f64::from(*v) / norm) as f32).collect();

        let inner = self.read()?;
        let score = |id: &RecordId, vector: &[f32]| -> Option<(RecordId, f64)> {
            let similarity = dot(&query, vector).clamp(-1.0, 1.0);
            match min_similarity {
                Some(min) if similarity < min => None,
                _ => Some((*id, similarity)),
            }
        };

        let mut hits: Vec<(RecordId, f64)> = match &inner.partitions {
            None => inner
                .vectors
                .iter()
                .filter_map(|(id, vector)| score(id, vector))
                .collect(),
            Some(parts) => probe_order(&parts.centroids, &query)
                .into_iter()
                .take(parts.probes)
                .flat_map(move |slot| parts.lists[slot].iter())
                .filter_map(|id| inner.vectors.get(id).and_then(|v| score(id, v)))
                .collect(),
        };

        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hits.truncate(k);
        Ok(hits)
    }

    /// Train IVF partitions over the current vectors.
    ///
    /// Centroids are computed from a snapshot without holding the lock;
    /// the result is installed under the write lock and every vector present
    /// at that point (including ones added meanwhile) is assigned.
    pub fn train(&self) -> Result<IndexStrategy> {
        let snapshot: Vec<Arc<[f32]>> = {
            let inner = self.read()?;
            inner.vectors.values().cloned().collect()
        };
        let rows = snapshot.len();
        if rows == 0 {
            self.write()?.partitions = None;
            return Ok(IndexStrategy::Exact);
        }

        let partitions = self
            .config
            .partitions
            .unwrap_or_else(|| default_partitions(rows))
            .clamp(1, rows);
        let probes = self
            .config
            .probes
            .unwrap_or_else(|| default_probes(partitions))
            .clamp(1, partitions);

        let sample = training_sample(&snapshot, partitions);
        let centroids = spherical_kmeans(&sample, partitions, self.config.kmeans_iterations);
        let partitions = centroids.len();
        let probes = probes.min(partitions);

        let mut inner = self.write()?;
        let mut parts = Partitions {
            centroids,
            lists: vec![Vec::new(); partitions],
            assignment: HashMap::with_capacity(inner.vectors.len()),
            probes,
            trained_rows: inner.vectors.len(),
        };
        for (id, vector) in &inner.vectors {
            parts.assign(*id, vector);
        }
        inner.partitions = Some(parts);

        info!(rows, partitions, probes, "Trained IVF index");
        Ok(IndexStrategy::Ivf { partitions, probes })
    }

    /// Fall back to exact scan, discarding any trained partitions.
    pub fn reset_to_exact(&self) -> Result<()> {
        self.write()?.partitions = None;
        debug!("Index reset to exact scan");
        Ok(())
    }
}

/// `max(1, rows / 1000)` up to one million rows, `sqrt(rows)` above.
pub fn default_partitions(rows: usize) -> usize {
    if rows <= LINEAR_PARTITION_LIMIT {
        (rows / 1000).max(1)
    } else {
        ((rows as f64).sqrt() as usize).max(1)
    }
}

/// `max(1, sqrt(partitions))`.
pub fn default_probes(partitions: usize) -> usize {
    ((partitions as f64).sqrt().round() as usize).max(1)
}

fn nearest_centroid(centroids: &[Vec<f32>], vector: &[f32]) -> usize {
    let mut best = 0;
    let mut best_score = f64::NEG_INFINITY;
    for (slot, centroid) in centroids.iter().enumerate() {
        let score = dot(centroid, vector);
        if score > best_score {
            best = slot;
            best_score = score;
        }
    }
    best
}

/// Partition slots ordered by centroid similarity to the query, best first.
fn probe_order(centroids: &[Vec<f32>], query: &[f32]) -> Vec<usize> {
    let mut ranked: Vec<(usize, f64)> = centroids
        .iter()
        .enumerate()
        .map(|(slot, centroid)| (slot, dot(centroid, query)))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().map(|(slot, _)| slot).collect()
}

/// Evenly strided sample of the snapshot (which is in id order).
fn training_sample(vectors: &[Arc<[f32]>], partitions: usize) -> Vec<Arc<[f32]>> {
    let budget = partitions.saturating_mul(TRAINING_SAMPLES_PER_PARTITION);
    if vectors.len() <= budget {
        return vectors.to_vec();
    }
    (0..budget)
        .map(|i| Arc::clone(&vectors[i * vectors.len() / budget]))
        .collect()
}

/// Spherical k-means: centroids are unit vectors, assignment by dot product.
///
/// Seeds are evenly spaced samples, so training is deterministic for a
/// given input. Empty clusters keep their previous centroid.
fn spherical_kmeans(sample: &[Arc<[f32]>], k: usize, max_iterations: usize) -> Vec<Vec<f32>> {
    let n = sample.len();
    let k = k.min(n).max(1);
    let dims = sample.first().map(|v| v.len()).unwrap_or(0);

    let mut centroids: Vec<Vec<f32>> = (0..k).map(|i| sample[i * n / k].to_vec()).collect();
    let mut assignment = vec![usize::MAX; n];

    for iteration in 0..max_iterations.max(1) {
        let mut changed = false;
        for (i, vector) in sample.iter().enumerate() {
            let slot = nearest_centroid(&centroids, vector);
            if assignment[i] != slot {
                assignment[i] = slot;
                changed = true;
            }
        }
        if !changed {
            debug!(iteration, "k-means converged");
            break;
        }

        let mut sums = vec![vec![0.0f64; dims]; k];
        let mut counts = vec![0usize; k];
        for (i, vector) in sample.iter().enumerate() {
            let slot = assignment[i];
            counts[slot] += 1;
            for (acc, v) in sums[slot].iter_mut().zip(vector.iter()) {
                *acc += f64::from(*v);
            }
        }
        for (slot, sum) in sums.into_iter().enumerate() {
            if counts[slot] == 0 {
                continue;
            }
            let norm = sum.iter().map(|v| v * v).sum::<f64>().sqrt();
            if norm > f64::EPSILON {
                centroids[slot] = sum.iter().map(|v| (v / norm) as f32).collect();
            }
        }
    }

    centroids
}
