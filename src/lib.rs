//! # quiver
//!
//! An embeddable vector database: collection-scoped HNSW indices, metadata
//! and document filtering, and a bounded LRU of loaded indices, reachable
//! from Rust through [`Client`] and from C through `quiver-ffi`.
//!
//! ## Quick Start
//!
//! ### As a Library
//!
//! ```rust
//! use quiver::prelude::*;
//!
//! let client = Client::new(ClientConfig::in_memory()).unwrap();
//! let collection = client
//!     .create_collection("docs", None, None, false, DEFAULT_TENANT, DEFAULT_DATABASE)
//!     .unwrap();
//!
//! let batch = RecordBatch::new(
//!     vec!["a".to_string(), "b".to_string()],
//!     vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]],
//! );
//! client.add(&collection, batch).unwrap();
//!
//! let result = client
//!     .query(&collection, &QueryRequest::new(vec![1.0, 0.0, 0.0], 1))
//!     .unwrap();
//! assert_eq!(result.ids, vec!["a"]);
//! ```
//!
//! ### From the Command Line
//!
//! ```bash
//! quiver --persist-path ./data create-collection docs
//! quiver --persist-path ./data add docs --file records.jsonl
//! quiver --persist-path ./data query docs --embedding 1,0,0 -k 5
//! ```
//!
//! ## Crate Structure
//!
//! - `quiver-core` - Records, metrics, HNSW, filters, index cache, write pipeline and query executor
//! - `quiver-storage` - LMDB-backed stores, schema checksum and the [`Client`]
//! - `quiver-ffi` - C ABI with opaque handles and caller-freed results

// Re-export core types
pub use quiver_core::{
    Collection, CollectionConfig, Database, Error, ErrorCode, Filter, GetRequest, HnswIndex, HnswParams, Include,
    IndexCache, Metadata, QueryConfig, QueryRequest, QueryResult, Record, RecordBatch, RecordFilter, Result, Space,
    Vector, Where, WhereDocument, DEFAULT_DATABASE, DEFAULT_TENANT, MAX_ID_BYTES,
};

// Re-export storage
pub use quiver_storage::{Client, ClientConfig, MigrationHash, MigrationMode, StorageConfig};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        Client, ClientConfig, Collection, CollectionConfig, Error, GetRequest, Include, Metadata, QueryRequest,
        QueryResult, Record, RecordBatch, RecordFilter, Result, Space, Vector, DEFAULT_DATABASE, DEFAULT_TENANT,
    };
}

/// SIMD-optimized distance kernels
pub mod simd {
    pub use quiver_core::simd::{dot_product_simd, l2_squared_simd, norm_simd};
}
