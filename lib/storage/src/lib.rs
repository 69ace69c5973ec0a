pub mod client;
pub mod config;
pub mod lmdb_storage;
pub mod schema;

pub use client::Client;
pub use config::{ClientConfig, MigrationHash, MigrationMode, StorageConfig};
pub use lmdb_storage::LmdbStorage;
pub use schema::schema_checksum;
