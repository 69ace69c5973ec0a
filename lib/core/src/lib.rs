//! # quiver Core
//!
//! Core library for the quiver vector database.
//!
//! This crate provides the data model and the engine behind a collection:
//!
//! - [`Vector`] - Dense vector representation with SIMD operations
//! - [`Record`] - An embedding with id, metadata and document
//! - [`Collection`] - Catalog entry with metric and dimensionality
//! - [`HnswIndex`] - HNSW approximate nearest neighbor index
//! - [`IndexCache`] - Bounded LRU of loaded indices
//! - [`WritePipeline`] / [`QueryExecutor`] - Batched writes and filtered queries
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use quiver_core::{
//!     Collection, CollectionConfig, CollectionLocks, IndexCache, QueryConfig, QueryExecutor,
//!     QueryRequest, RecordBatch, Stores, WritePipeline,
//! };
//!
//! let stores = Stores::in_memory();
//! let cache = Arc::new(IndexCache::new(8).unwrap());
//! let locks = Arc::new(CollectionLocks::new());
//!
//! let collection = Collection::new("docs", "default_tenant", "default_database", CollectionConfig::default(), None);
//! stores.metadata.create_collection(&collection).unwrap();
//!
//! let writer = WritePipeline::new(stores.clone(), cache.clone(), locks.clone());
//! writer
//!     .add(&collection, RecordBatch::new(vec!["a".to_string()], vec![vec![1.0, 0.0, 0.0]]))
//!     .unwrap();
//!
//! let executor = QueryExecutor::new(stores, cache, locks, QueryConfig::default());
//! let result = executor.query(&collection, &QueryRequest::new(vec![1.0, 0.0, 0.0], 1)).unwrap();
//! assert_eq!(result.ids, vec!["a"]);
//! ```

pub mod cache;
pub mod collection;
pub mod error;
pub mod filter;
pub mod hnsw;
pub mod query;
pub mod record;
pub mod store;
pub mod vector;
pub mod write;

/// SIMD-optimized vector operations
///
/// Provides hardware-accelerated distance calculations:
/// - AVX2/FMA on x86_64
/// - NEON on ARM64/Apple Silicon
pub mod simd;

pub use cache::{CollectionLocks, IndexCache, SharedIndex};
pub use collection::{
    Collection, CollectionConfig, Database, HnswParams, Space, DEFAULT_DATABASE, DEFAULT_TENANT, MAX_EF,
};
pub use error::{Error, ErrorCode, Result};
pub use filter::{Filter, RecordFilter, Where, WhereDocument};
pub use hnsw::{HnswIndex, Neighbor};
pub use query::{GetRequest, QueryConfig, QueryExecutor, QueryRequest, QueryResult};
pub use record::{Include, Metadata, Record, RecordMeta, MAX_ID_BYTES};
pub use store::{
    MemoryMetadataStore, MemoryRecordWriter, MemoryVectorStore, MetadataStore, RecordWriter, Stores, VectorStore, WriteSet,
};
pub use vector::Vector;
pub use write::{RecordBatch, WritePipeline};
