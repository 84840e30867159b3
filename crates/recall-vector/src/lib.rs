//! Recall vector crate - chunking, embedding generation, ingestion, and
//! retrieval on top of the persistent vector store.
//!
//! [`RecallEngine`] wires everything together from a [`RecallConfig`].
//!
//! [`RecallConfig`]: recall_core::RecallConfig

pub mod chunker;
pub mod embedding;
pub mod engine;
pub mod generator;
pub mod pipeline;
pub mod retrieval;

pub use chunker::{Chunker, TextChunk};
pub use embedding::{
    EmbeddingBackend, EmbeddingModel, HashingBackend, OnnxBackend, UnavailableBackend,
};
pub use engine::RecallEngine;
pub use generator::{EmbeddingGenerator, EmbeddingOutcome, ModelState};
pub use pipeline::{IngestReport, Ingestor};
pub use retrieval::{Retriever, SearchRequest};
