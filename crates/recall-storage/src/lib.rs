//! Recall storage crate - SQLite persistence and the Vector Store.
//!
//! Provides a pooled SQLite database with migrations, the record table with
//! its f32 embedding blobs, and an in-memory exact/IVF index used to answer
//! similarity queries.

pub mod codec;
pub mod db;
pub mod index;
pub mod migrations;
pub mod store;

pub use db::{Database, PoolStatus};
pub use index::{IndexStats, IndexStrategy, VectorIndex};
pub use store::{StoreStats, VectorStore};
