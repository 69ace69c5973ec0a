//! # quiver FFI
//!
//! C ABI over [`quiver_storage::Client`]. Every entry point returns a
//! status code (`0` on success, see [`quiver_core::ErrorCode`]) and writes
//! its result through an out-pointer. Clients and collections are opaque
//! handles; every string, array and result structure handed back is owned
//! by the caller and must be released with the matching `quiver_free_*`
//! function. The detail of the last failure on a thread is available from
//! [`quiver_last_error_message`].
//!
//! The declarations for C callers live in `include/quiver.h`.

mod client;
mod error;
mod marshal;
mod records;

pub use client::{
    quiver_collection_id, quiver_create_client, quiver_create_collection, quiver_create_database,
    quiver_delete_collection, quiver_delete_database, quiver_destroy_client, quiver_destroy_collection,
    quiver_free_result_set, quiver_get_collection, quiver_get_collection_by_id, quiver_get_database,
    quiver_heartbeat, quiver_init_logging, quiver_list_collections, quiver_reset, QuiverClient, QuiverCollection,
    QuiverResultSet, QuiverStorageConfig,
};
pub use error::quiver_last_error_message;
pub use marshal::{quiver_free_string, quiver_free_string_array};
pub use records::{
    quiver_add, quiver_count, quiver_delete, quiver_free_query_result, quiver_get, quiver_query, quiver_update,
    quiver_upsert, QuiverQueryResult,
};
