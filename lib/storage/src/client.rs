use crate::config::ClientConfig;
use crate::lmdb_storage::{LmdbStorage, DEFAULT_MAP_SIZE};
use crate::schema::schema_checksum;
use quiver_core::collection::{validate_collection_name, validate_database_name, validate_tenant};
use quiver_core::record::validate_metadata;
use quiver_core::{
    Collection, CollectionConfig, CollectionLocks, Database, Error, GetRequest, IndexCache, Metadata, QueryExecutor,
    QueryRequest, QueryResult, RecordBatch, RecordFilter, Result, Stores, WritePipeline, DEFAULT_DATABASE,
    DEFAULT_TENANT,
};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Entry point for every database operation. Owns the stores, the index
/// cache and the per-collection locks; one client per process or test.
pub struct Client {
    config: ClientConfig,
    stores: Stores,
    cache: Arc<IndexCache>,
    locks: Arc<CollectionLocks>,
    writer: WritePipeline,
    executor: QueryExecutor,
    lmdb: Option<Arc<LmdbStorage>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let cache = Arc::new(IndexCache::new(config.hnsw_cache_size)?);
        config.query.validate()?;
        // surfaces an unsupported hash even for in-memory clients
        schema_checksum(config.storage.hash)?;

        let (stores, lmdb) = match config.lmdb_path() {
            Some(path) => {
                let map_size = config.storage.map_size.unwrap_or(DEFAULT_MAP_SIZE);
                let storage = Arc::new(LmdbStorage::open_with_map_size(&path, map_size)?);
                storage.migrate(config.storage.migration_mode, config.storage.hash)?;
                let stores = Stores::new(storage.clone(), storage.clone(), storage.clone());
                (stores, Some(storage))
            }
            None => (Stores::in_memory(), None),
        };

        let locks = Arc::new(CollectionLocks::new());
        let client = Self {
            writer: WritePipeline::new(stores.clone(), cache.clone(), locks.clone()),
            executor: QueryExecutor::new(stores.clone(), cache.clone(), locks.clone(), config.query),
            config,
            stores,
            cache,
            locks,
            lmdb,
        };
        client.ensure_defaults()?;

        info!(
            persistent = client.lmdb.is_some(),
            cache_size = client.cache.capacity(),
            "client started"
        );
        Ok(client)
    }

    fn ensure_defaults(&self) -> Result<()> {
        if self.stores.metadata.get_database(DEFAULT_TENANT, DEFAULT_DATABASE)?.is_none() {
            self.create_database(DEFAULT_DATABASE, DEFAULT_TENANT)?;
        }
        Ok(())
    }

    #[inline]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[inline]
    pub fn index_cache(&self) -> &IndexCache {
        &self.cache
    }

    /// Directory of the LMDB environment, if persistent
    pub fn storage_path(&self) -> Option<&Path> {
        self.lmdb.as_deref().map(LmdbStorage::path)
    }

    /// Nanoseconds since the Unix epoch
    pub fn heartbeat(&self) -> Result<u64> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::Internal(format!("system clock before epoch: {}", e)))?;
        Ok(now.as_nanos() as u64)
    }

    /// Wipe every database, collection and record, then recreate the defaults
    pub fn reset(&self) -> Result<()> {
        if !self.config.allow_reset {
            return Err(Error::InvalidArgument(
                "reset is disabled; construct the client with allow_reset".to_string(),
            ));
        }
        self.stores.vectors.clear()?;
        self.stores.metadata.clear()?;
        self.cache.clear();
        self.locks.clear();
        self.ensure_defaults()?;
        warn!("client reset, all data removed");
        Ok(())
    }

    // ==================== Databases ====================

    pub fn create_database(&self, name: &str, tenant: &str) -> Result<Database> {
        validate_tenant(tenant)?;
        validate_database_name(name)?;
        let database = Database {
            id: Uuid::new_v4(),
            name: name.to_string(),
            tenant: tenant.to_string(),
        };
        self.stores.metadata.create_database(&database)?;
        debug!(tenant, name, "created database");
        Ok(database)
    }

    pub fn get_database(&self, name: &str, tenant: &str) -> Result<Database> {
        self.stores
            .metadata
            .get_database(tenant, name)?
            .ok_or_else(|| Error::DatabaseNotFound(format!("{}/{}", tenant, name)))
    }

    /// Delete a database and every collection in it
    pub fn delete_database(&self, name: &str, tenant: &str) -> Result<()> {
        let database = self.get_database(name, tenant)?;
        for collection in self.stores.metadata.list_collections(tenant, name)? {
            self.drop_collection(&collection)?;
        }
        self.stores.metadata.delete_database(&database.tenant, &database.name)?;
        debug!(tenant, name, "deleted database");
        Ok(())
    }

    // ==================== Collections ====================

    /// Create a collection. When `config` is `None` the metric may still be
    /// chosen through the `hnsw:space` metadata key.
    pub fn create_collection(
        &self,
        name: &str,
        config: Option<CollectionConfig>,
        metadata: Option<Metadata>,
        get_or_create: bool,
        tenant: &str,
        database: &str,
    ) -> Result<Collection> {
        validate_collection_name(name)?;
        if let Some(metadata) = &metadata {
            validate_metadata(metadata, false)?;
        }
        let config = match config {
            Some(config) => {
                config.validate()?;
                config
            }
            None => CollectionConfig::resolve(None, metadata.as_ref())?,
        };
        self.get_database(database, tenant)?;

        if let Some(existing) = self.stores.metadata.get_collection(tenant, database, name)? {
            if get_or_create {
                return Ok(existing);
            }
            return Err(Error::CollectionExists(existing.qualified_name()));
        }

        let collection = Collection::new(name, tenant, database, config, metadata);
        match self.stores.metadata.create_collection(&collection) {
            Ok(()) => {
                info!(collection = %collection.qualified_name(), id = %collection.id, space = ?collection.space(), "created collection");
                Ok(collection)
            }
            // lost a race with a concurrent creator
            Err(Error::CollectionExists(_)) if get_or_create => self.get_collection(name, tenant, database),
            Err(e) => Err(e),
        }
    }

    pub fn get_collection(&self, name: &str, tenant: &str, database: &str) -> Result<Collection> {
        self.stores
            .metadata
            .get_collection(tenant, database, name)?
            .ok_or_else(|| Error::CollectionNotFound(format!("{}/{}/{}", tenant, database, name)))
    }

    pub fn get_collection_by_id(&self, id: &str) -> Result<Collection> {
        let uuid = quiver_core::collection::parse_collection_id(id)?;
        self.stores
            .metadata
            .get_collection_by_id(uuid)?
            .ok_or_else(|| Error::CollectionNotFound(id.to_string()))
    }

    pub fn list_collections(&self, tenant: &str, database: &str) -> Result<Vec<Collection>> {
        self.get_database(database, tenant)?;
        self.stores.metadata.list_collections(tenant, database)
    }

    pub fn delete_collection(&self, name: &str, tenant: &str, database: &str) -> Result<()> {
        let collection = self.get_collection(name, tenant, database)?;
        self.drop_collection(&collection)
    }

    fn drop_collection(&self, collection: &Collection) -> Result<()> {
        {
            let lock = self.locks.lock_for(collection.id);
            let _guard = lock.write();
            self.stores.metadata.delete_collection(collection.id)?;
            self.stores.vectors.drop_collection(collection.id)?;
            self.stores.metadata.drop_records(collection.id)?;
            self.cache.invalidate(collection.id);
        }
        self.locks.remove(collection.id);
        info!(collection = %collection.qualified_name(), "deleted collection");
        Ok(())
    }

    // ==================== Records ====================

    pub fn add(&self, collection: &Collection, batch: RecordBatch) -> Result<()> {
        self.writer.add(collection, batch)
    }

    pub fn upsert(&self, collection: &Collection, batch: RecordBatch) -> Result<()> {
        self.writer.upsert(collection, batch)
    }

    pub fn update(&self, collection: &Collection, batch: RecordBatch) -> Result<usize> {
        self.writer.update(collection, batch)
    }

    pub fn delete(
        &self,
        collection: &Collection,
        ids: Option<&[String]>,
        filter: Option<&RecordFilter>,
    ) -> Result<usize> {
        self.writer.delete(collection, ids, filter)
    }

    pub fn query(&self, collection: &Collection, request: &QueryRequest) -> Result<QueryResult> {
        self.executor.query(collection, request)
    }

    pub fn get(&self, collection: &Collection, request: &GetRequest) -> Result<QueryResult> {
        self.executor.get(collection, request)
    }

    pub fn count(&self, collection: &Collection) -> Result<usize> {
        self.executor.count(collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MigrationHash, MigrationMode, StorageConfig};
    use serde_json::json;
    use tempfile::TempDir;

    fn client() -> Client {
        Client::new(ClientConfig::in_memory().with_allow_reset(true)).unwrap()
    }

    fn default_collection(client: &Client, name: &str) -> Collection {
        client
            .create_collection(name, None, None, false, DEFAULT_TENANT, DEFAULT_DATABASE)
            .unwrap()
    }

    #[test]
    fn test_defaults_and_heartbeat() {
        let client = client();
        assert!(client.get_database(DEFAULT_DATABASE, DEFAULT_TENANT).is_ok());
        assert!(client.heartbeat().unwrap() > 0);
        assert!(client.storage_path().is_none());
    }

    #[test]
    fn test_zero_cache_rejected() {
        assert!(matches!(
            Client::new(ClientConfig::in_memory().with_cache_size(0)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_md5_not_implemented() {
        let storage = StorageConfig {
            hash: MigrationHash::Md5,
            ..Default::default()
        };
        assert!(matches!(
            Client::new(ClientConfig::in_memory().with_storage(storage)),
            Err(Error::NotImplemented(_))
        ));
    }

    #[test]
    fn test_database_lifecycle() {
        let client = client();
        assert!(matches!(client.create_database("ab", "t"), Err(Error::Validation(_))));
        let db = client.create_database("analytics", "t").unwrap();
        assert_eq!(client.get_database("analytics", "t").unwrap(), db);
        assert!(matches!(client.create_database("analytics", "t"), Err(Error::DatabaseExists(_))));

        let coll = client.create_collection("events", None, None, false, "t", "analytics").unwrap();
        client
            .add(&coll, RecordBatch::new(vec!["e1".to_string()], vec![vec![1.0, 2.0]]))
            .unwrap();

        client.delete_database("analytics", "t").unwrap();
        assert!(matches!(client.get_database("analytics", "t"), Err(Error::DatabaseNotFound(_))));
        assert!(matches!(
            client.get_collection_by_id(&coll.id.to_string()),
            Err(Error::CollectionNotFound(_))
        ));
        assert!(matches!(client.delete_database("analytics", "t"), Err(Error::DatabaseNotFound(_))));
    }

    #[test]
    fn test_collection_lifecycle() {
        let client = client();
        let coll = default_collection(&client, "docs");
        assert!(matches!(
            client.create_collection("docs", None, None, false, DEFAULT_TENANT, DEFAULT_DATABASE),
            Err(Error::CollectionExists(_))
        ));
        let same = client
            .create_collection("docs", None, None, true, DEFAULT_TENANT, DEFAULT_DATABASE)
            .unwrap();
        assert_eq!(same.id, coll.id);

        assert!(matches!(
            client.create_collection("x", None, None, false, DEFAULT_TENANT, DEFAULT_DATABASE),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            client.create_collection("docs2", None, None, false, DEFAULT_TENANT, "nowhere"),
            Err(Error::DatabaseNotFound(_))
        ));
        assert!(matches!(
            client.get_collection_by_id("not-a-uuid"),
            Err(Error::InvalidIdentifier(_))
        ));
        assert_eq!(client.get_collection_by_id(&coll.id.to_string()).unwrap().name, "docs");

        default_collection(&client, "alpha");
        let names: Vec<String> = client
            .list_collections(DEFAULT_TENANT, DEFAULT_DATABASE)
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["alpha", "docs"]);

        client
            .add(&coll, RecordBatch::new(vec!["a".to_string()], vec![vec![1.0]]))
            .unwrap();
        client.query(&coll, &QueryRequest::new(vec![1.0], 1)).unwrap();
        assert!(client.index_cache().contains(coll.id));

        client.delete_collection("docs", DEFAULT_TENANT, DEFAULT_DATABASE).unwrap();
        assert!(!client.index_cache().contains(coll.id));
        assert!(matches!(
            client.query(&coll, &QueryRequest::new(vec![1.0], 1)),
            Err(Error::CollectionNotFound(_))
        ));
    }

    #[test]
    fn test_prebuilt_config_is_validated() {
        let client = client();
        let zero_dim = CollectionConfig {
            dimension: Some(0),
            ..CollectionConfig::default()
        };
        assert!(matches!(
            client.create_collection("flat", Some(zero_dim), None, false, DEFAULT_TENANT, DEFAULT_DATABASE),
            Err(Error::Validation(_))
        ));
        let mut wide_ef = CollectionConfig::default();
        wide_ef.hnsw.ef_search = usize::MAX;
        assert!(matches!(
            client.create_collection("wide", Some(wide_ef), None, false, DEFAULT_TENANT, DEFAULT_DATABASE),
            Err(Error::Validation(_))
        ));
        assert!(client.list_collections(DEFAULT_TENANT, DEFAULT_DATABASE).unwrap().is_empty());
    }

    #[test]
    fn test_space_from_metadata() {
        let client = client();
        let metadata = json!({"hnsw:space": "cosine"}).as_object().cloned();
        let coll = client
            .create_collection("cos", None, metadata, false, DEFAULT_TENANT, DEFAULT_DATABASE)
            .unwrap();
        assert_eq!(coll.space(), quiver_core::Space::Cosine);
    }

    #[test]
    fn test_reset() {
        let client = client();
        let coll = default_collection(&client, "docs");
        client
            .add(&coll, RecordBatch::new(vec!["a".to_string()], vec![vec![1.0]]))
            .unwrap();
        client.reset().unwrap();
        assert!(client.list_collections(DEFAULT_TENANT, DEFAULT_DATABASE).unwrap().is_empty());
        assert!(client.index_cache().is_empty());

        let locked = Client::new(ClientConfig::in_memory()).unwrap();
        assert!(matches!(locked.reset(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_persistent_client_reopens() {
        let dir = TempDir::new().unwrap();
        let id = {
            let client = Client::new(ClientConfig::persistent(dir.path())).unwrap();
            assert!(client.storage_path().is_some());
            let coll = default_collection(&client, "docs");
            client
                .add(
                    &coll,
                    RecordBatch::new(
                        vec!["a".to_string(), "b".to_string()],
                        vec![vec![1.0, 0.0], vec![0.0, 1.0]],
                    ),
                )
                .unwrap();
            coll.id
        };

        let mut config = ClientConfig::persistent(dir.path());
        config.storage.migration_mode = MigrationMode::Validate;
        let client = Client::new(config).unwrap();
        let coll = client.get_collection("docs", DEFAULT_TENANT, DEFAULT_DATABASE).unwrap();
        assert_eq!(coll.id, id);
        assert_eq!(coll.dimension, Some(2));
        assert_eq!(client.count(&coll).unwrap(), 2);

        let result = client.query(&coll, &QueryRequest::new(vec![0.0, 1.0], 1)).unwrap();
        assert_eq!(result.ids, vec!["b"]);
    }

    #[test]
    fn test_validate_mode_rejects_fresh_store() {
        let dir = TempDir::new().unwrap();
        let mut config = ClientConfig::persistent(dir.path());
        config.storage.migration_mode = MigrationMode::Validate;
        assert!(matches!(Client::new(config), Err(Error::Internal(_))));
    }
}
