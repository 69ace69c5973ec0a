use quiver_core::{Error, QueryConfig, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// File name of the LMDB environment under a persist directory
pub const LMDB_DIR_NAME: &str = "quiver.lmdb";

const DEFAULT_CACHE_SIZE: usize = 100;

/// Hash used for the schema checksum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MigrationHash {
    #[default]
    Sha256,
    Md5,
}

impl MigrationHash {
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(MigrationHash::Sha256),
            1 => Ok(MigrationHash::Md5),
            other => Err(Error::InvalidArgument(format!("unknown hash type {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MigrationMode {
    /// Record the current schema checksum
    #[default]
    Apply,
    /// Refuse to open a store whose checksum is missing or stale
    Validate,
}

impl MigrationMode {
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(MigrationMode::Apply),
            1 => Ok(MigrationMode::Validate),
            other => Err(Error::InvalidArgument(format!("unknown migration mode {}", other))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Explicit location of the LMDB environment. `:memory:` forces an
    /// in-memory store.
    pub url: Option<String>,
    pub hash: MigrationHash,
    pub migration_mode: MigrationMode,
    /// LMDB map size in bytes; the storage default when absent
    #[serde(default)]
    pub map_size: Option<usize>,
}

/// Everything a [`crate::Client`] needs at construction
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub allow_reset: bool,
    pub storage: StorageConfig,
    /// Maximum number of resident indices
    pub hnsw_cache_size: usize,
    pub persist_path: Option<PathBuf>,
    pub query: QueryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            allow_reset: false,
            storage: StorageConfig::default(),
            hnsw_cache_size: DEFAULT_CACHE_SIZE,
            persist_path: None,
            query: QueryConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Self {
            persist_path: Some(path.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.hnsw_cache_size = size;
        self
    }

    #[must_use]
    pub fn with_allow_reset(mut self, allow: bool) -> Self {
        self.allow_reset = allow;
        self
    }

    #[must_use]
    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    #[must_use]
    pub fn with_query(mut self, query: QueryConfig) -> Self {
        self.query = query;
        self
    }

    /// Where the LMDB environment lives, or `None` for an in-memory client.
    /// An explicit url wins over the persist path.
    pub fn lmdb_path(&self) -> Option<PathBuf> {
        match self.storage.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            Some(":memory:") => None,
            Some(url) => {
                let path = url
                    .strip_prefix("lmdb://")
                    .or_else(|| url.strip_prefix("file://"))
                    .unwrap_or(url);
                Some(PathBuf::from(path))
            }
            None => self.persist_path.as_ref().map(|p| p.join(LMDB_DIR_NAME)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lmdb_path_resolution() {
        assert_eq!(ClientConfig::in_memory().lmdb_path(), None);
        assert_eq!(
            ClientConfig::persistent("/data").lmdb_path(),
            Some(PathBuf::from("/data/quiver.lmdb"))
        );

        let mut config = ClientConfig::persistent("/data");
        config.storage.url = Some("lmdb:///elsewhere/db".to_string());
        assert_eq!(config.lmdb_path(), Some(PathBuf::from("/elsewhere/db")));

        config.storage.url = Some(":memory:".to_string());
        assert_eq!(config.lmdb_path(), None);
    }

    #[test]
    fn test_selector_codes() {
        assert_eq!(MigrationHash::from_code(0).unwrap(), MigrationHash::Sha256);
        assert_eq!(MigrationHash::from_code(1).unwrap(), MigrationHash::Md5);
        assert!(MigrationHash::from_code(7).is_err());
        assert_eq!(MigrationMode::from_code(1).unwrap(), MigrationMode::Validate);
        assert!(matches!(MigrationMode::from_code(-1), Err(Error::InvalidArgument(_))));
    }
}
