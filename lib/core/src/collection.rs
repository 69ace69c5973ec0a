use crate::error::{Error, Result};
use crate::record::Metadata;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use uuid::Uuid;

pub const DEFAULT_TENANT: &str = "default_tenant";
pub const DEFAULT_DATABASE: &str = "default_database";

/// Legacy metadata key that selects the metric when no config is given
const SPACE_METADATA_KEY: &str = "hnsw:space";

/// Distance metric of a collection. Smaller is closer for every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Space {
    /// Squared Euclidean distance
    #[default]
    L2,
    /// `1 - cos(a, b)`; vectors are normalized before they reach the index
    Cosine,
    /// `1 - a·b`
    Ip,
}

impl Space {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "l2" | "euclidean" => Ok(Space::L2),
            "cosine" => Ok(Space::Cosine),
            "ip" | "dot" => Ok(Space::Ip),
            other => Err(Error::Validation(format!("unknown distance space '{}'", other))),
        }
    }

    #[inline]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Space::L2 => crate::simd::l2_squared_simd(a, b),
            Space::Cosine | Space::Ip => 1.0 - crate::simd::dot_product_simd(a, b),
        }
    }

    #[inline]
    pub fn normalizes(&self) -> bool {
        matches!(self, Space::Cosine)
    }
}

/// Graph construction and search parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswParams {
    pub space: Space,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub max_neighbors: usize,
    /// Seed for level assignment; a fixed seed makes builds reproducible
    pub seed: u64,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            space: Space::L2,
            ef_construction: 100,
            ef_search: 100,
            max_neighbors: 16,
            seed: 0,
        }
    }
}

/// Upper bound for `ef_construction` and `ef_search`
pub const MAX_EF: usize = 10_000;
/// Upper bound for `max_neighbors`
pub const MAX_NEIGHBORS: usize = 512;

impl HnswParams {
    pub fn validate(&self) -> Result<()> {
        if !(2..=MAX_NEIGHBORS).contains(&self.max_neighbors) {
            return Err(Error::Validation(format!(
                "max_neighbors must be between 2 and {}",
                MAX_NEIGHBORS
            )));
        }
        for (name, ef) in [("ef_construction", self.ef_construction), ("ef_search", self.ef_search)] {
            if !(1..=MAX_EF).contains(&ef) {
                return Err(Error::Validation(format!("{} must be between 1 and {}", name, MAX_EF)));
            }
        }
        Ok(())
    }
}

/// Configuration supplied when a collection is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    pub hnsw: HnswParams,
    /// Fixed dimensionality. When absent the first add decides it.
    pub dimension: Option<usize>,
}

impl CollectionConfig {
    /// Build a config from optional JSON, falling back to the legacy
    /// `hnsw:space` metadata key when no JSON is supplied.
    pub fn resolve(config_json: Option<&str>, metadata: Option<&Metadata>) -> Result<Self> {
        let config = match config_json.map(str::trim).filter(|s| !s.is_empty()) {
            Some(json) => serde_json::from_str::<CollectionConfig>(json)
                .map_err(|e| Error::Validation(format!("invalid collection configuration: {}", e)))?,
            None => {
                let mut config = CollectionConfig::default();
                if let Some(space) = metadata
                    .and_then(|m| m.get(SPACE_METADATA_KEY))
                    .and_then(|v| v.as_str())
                {
                    config.hnsw.space = Space::parse(space)?;
                }
                config
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.hnsw.validate()?;
        if self.dimension == Some(0) {
            return Err(Error::Validation("dimension must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Database {
    pub id: Uuid,
    pub name: String,
    pub tenant: String,
}

/// Catalog entry for a collection. Cheap to clone; serves as the handle
/// callers pass back into record operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: Uuid,
    pub name: String,
    pub tenant: String,
    pub database: String,
    pub config: CollectionConfig,
    #[serde(default)]
    pub metadata: Option<Metadata>,
    /// Dimensionality once known
    #[serde(default)]
    pub dimension: Option<usize>,
}

impl Collection {
    pub fn new(
        name: impl Into<String>,
        tenant: impl Into<String>,
        database: impl Into<String>,
        config: CollectionConfig,
        metadata: Option<Metadata>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            tenant: tenant.into(),
            database: database.into(),
            dimension: config.dimension,
            config,
            metadata,
        }
    }

    #[inline]
    pub fn space(&self) -> Space {
        self.config.hnsw.space
    }

    /// `tenant/database/name`, used in logs and error messages
    pub fn qualified_name(&self) -> String {
        format!("{}/{}/{}", self.tenant, self.database, self.name)
    }
}

pub fn parse_collection_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).map_err(|e| Error::InvalidIdentifier(format!("'{}': {}", id, e)))
}

pub fn validate_collection_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| Err(Error::Validation(format!("invalid collection name '{}': {}", name, reason)));

    if name.len() < 3 || name.len() > 512 {
        return invalid("length must be between 3 and 512 characters");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return invalid("only [a-zA-Z0-9._-] are allowed");
    }
    let first = name.chars().next().unwrap_or('.');
    let last = name.chars().last().unwrap_or('.');
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        return invalid("must start and end with an alphanumeric character");
    }
    if name.contains("..") {
        return invalid("must not contain two consecutive periods");
    }
    if name.parse::<Ipv4Addr>().is_ok() {
        return invalid("must not be a valid IPv4 address");
    }
    Ok(())
}

pub fn validate_database_name(name: &str) -> Result<()> {
    if name.chars().count() < 3 {
        return Err(Error::Validation(format!(
            "database name '{}' must be at least 3 characters",
            name
        )));
    }
    Ok(())
}

pub fn validate_tenant(tenant: &str) -> Result<()> {
    if tenant.is_empty() {
        return Err(Error::InvalidArgument("tenant must not be empty".to_string()));
    }
    Ok(())
}
