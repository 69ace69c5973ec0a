// Storage seams. The write pipeline and query executor only talk to these
// traits; `quiver-storage` provides LMDB-backed implementations and the
// in-memory ones below back ephemeral clients and tests.

use crate::collection::{Collection, Database};
use crate::error::{Error, Result};
use crate::record::RecordMeta;
use crate::vector::Vector;
use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use uuid::Uuid;

/// Raw embeddings per collection; the source of truth for index rebuilds
pub trait VectorStore: Send + Sync {
    /// Insert or replace rows. A replaced row moves to the end of the
    /// insertion order.
    fn put(&self, collection: Uuid, rows: &[(String, Vector)]) -> Result<()>;

    fn get(&self, collection: Uuid, ids: &[String]) -> Result<Vec<Option<Vector>>>;

    /// Returns how many of `ids` existed
    fn delete(&self, collection: Uuid, ids: &[String]) -> Result<usize>;

    /// Every row in insertion order
    fn scan(&self, collection: Uuid) -> Result<Vec<(String, Vector)>>;

    /// Every id in insertion order
    fn ids(&self, collection: Uuid) -> Result<Vec<String>>;

    fn count(&self, collection: Uuid) -> Result<usize>;

    fn drop_collection(&self, collection: Uuid) -> Result<()>;

    fn clear(&self) -> Result<()>;
}

/// Catalog bookkeeping plus per-record metadata and documents
pub trait MetadataStore: Send + Sync {
    /// Fails with `DatabaseExists` on a duplicate (tenant, name)
    fn create_database(&self, database: &Database) -> Result<()>;

    fn get_database(&self, tenant: &str, name: &str) -> Result<Option<Database>>;

    fn delete_database(&self, tenant: &str, name: &str) -> Result<bool>;

    /// Fails with `CollectionExists` on a duplicate (tenant, database, name)
    fn create_collection(&self, collection: &Collection) -> Result<()>;

    /// Overwrite the catalog entry with the same id
    fn update_collection(&self, collection: &Collection) -> Result<()>;

    fn get_collection(&self, tenant: &str, database: &str, name: &str) -> Result<Option<Collection>>;

    fn get_collection_by_id(&self, id: Uuid) -> Result<Option<Collection>>;

    fn list_collections(&self, tenant: &str, database: &str) -> Result<Vec<Collection>>;

    fn delete_collection(&self, id: Uuid) -> Result<bool>;

    fn put_records(&self, collection: Uuid, records: &[(String, RecordMeta)]) -> Result<()>;

    fn get_records(&self, collection: Uuid, ids: &[String]) -> Result<Vec<Option<RecordMeta>>>;

    fn delete_records(&self, collection: Uuid, ids: &[String]) -> Result<usize>;

    fn drop_records(&self, collection: Uuid) -> Result<()>;

    fn clear(&self) -> Result<()>;
}

/// Everything one write changes across both stores
#[derive(Debug, Default)]
pub struct WriteSet<'a> {
    /// Catalog entry stored with the rows, e.g. a dimension fixed by this write
    pub catalog: Option<&'a Collection>,
    pub vectors: &'a [(String, Vector)],
    pub records: &'a [(String, RecordMeta)],
    /// Ids removed from both stores, applied before the puts
    pub removals: &'a [String],
}

/// Applies a [`WriteSet`] all-or-nothing
pub trait RecordWriter: Send + Sync {
    /// Returns how many of `write.removals` had a vector row
    fn commit(&self, collection: Uuid, write: &WriteSet<'_>) -> Result<usize>;
}

/// The stores a client is built over, plus the writer that spans them
#[derive(Clone)]
pub struct Stores {
    pub vectors: Arc<dyn VectorStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub writer: Arc<dyn RecordWriter>,
}

impl Stores {
    pub fn new(
        vectors: Arc<dyn VectorStore>,
        metadata: Arc<dyn MetadataStore>,
        writer: Arc<dyn RecordWriter>,
    ) -> Self {
        Self {
            vectors,
            metadata,
            writer,
        }
    }

    pub fn in_memory() -> Self {
        let vectors = Arc::new(MemoryVectorStore::new());
        let metadata = Arc::new(MemoryMetadataStore::new());
        let writer = Arc::new(MemoryRecordWriter {
            vectors: vectors.clone(),
            metadata: metadata.clone(),
        });
        Self::new(vectors, metadata, writer)
    }

    /// Re-read the catalog entry so callers act on the persisted dimension
    pub fn current_collection(&self, collection: &Collection) -> Result<Collection> {
        self.metadata
            .get_collection_by_id(collection.id)?
            .ok_or_else(|| Error::CollectionNotFound(collection.qualified_name()))
    }
}

#[derive(Default)]
struct VectorPartition {
    next_seq: u64,
    rows: AHashMap<String, (u64, Vector)>,
}

impl VectorPartition {
    fn ordered(&self) -> Vec<(&String, &Vector)> {
        let mut rows: Vec<(u64, &String, &Vector)> =
            self.rows.iter().map(|(id, (seq, v))| (*seq, id, v)).collect();
        rows.sort_unstable_by_key(|(seq, _, _)| *seq);
        rows.into_iter().map(|(_, id, v)| (id, v)).collect()
    }
}

#[derive(Default)]
pub struct MemoryVectorStore {
    partitions: RwLock<AHashMap<Uuid, VectorPartition>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VectorStore for MemoryVectorStore {
    fn put(&self, collection: Uuid, rows: &[(String, Vector)]) -> Result<()> {
        let mut partitions = self.partitions.write();
        let partition = partitions.entry(collection).or_default();
        for (id, vector) in rows {
            let seq = partition.next_seq;
            partition.next_seq += 1;
            partition.rows.insert(id.clone(), (seq, vector.clone()));
        }
        Ok(())
    }

    fn get(&self, collection: Uuid, ids: &[String]) -> Result<Vec<Option<Vector>>> {
        let partitions = self.partitions.read();
        let partition = partitions.get(&collection);
        Ok(ids
            .iter()
            .map(|id| partition.and_then(|p| p.rows.get(id)).map(|(_, v)| v.clone()))
            .collect())
    }

    fn delete(&self, collection: Uuid, ids: &[String]) -> Result<usize> {
        let mut partitions = self.partitions.write();
        let Some(partition) = partitions.get_mut(&collection) else {
            return Ok(0);
        };
        Ok(ids.iter().filter(|id| partition.rows.remove(*id).is_some()).count())
    }

    fn scan(&self, collection: Uuid) -> Result<Vec<(String, Vector)>> {
        let partitions = self.partitions.read();
        Ok(partitions
            .get(&collection)
            .map(|p| p.ordered().into_iter().map(|(id, v)| (id.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn ids(&self, collection: Uuid) -> Result<Vec<String>> {
        let partitions = self.partitions.read();
        Ok(partitions
            .get(&collection)
            .map(|p| p.ordered().into_iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default())
    }

    fn count(&self, collection: Uuid) -> Result<usize> {
        Ok(self.partitions.read().get(&collection).map(|p| p.rows.len()).unwrap_or(0))
    }

    fn drop_collection(&self, collection: Uuid) -> Result<()> {
        self.partitions.write().remove(&collection);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.partitions.write().clear();
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryMetadataStore {
    databases: RwLock<AHashMap<(String, String), Database>>,
    collections: RwLock<AHashMap<Uuid, Collection>>,
    records: RwLock<AHashMap<Uuid, AHashMap<String, RecordMeta>>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn create_database(&self, database: &Database) -> Result<()> {
        let mut databases = self.databases.write();
        let key = (database.tenant.clone(), database.name.clone());
        if databases.contains_key(&key) {
            return Err(Error::DatabaseExists(format!("{}/{}", database.tenant, database.name)));
        }
        databases.insert(key, database.clone());
        Ok(())
    }

    fn get_database(&self, tenant: &str, name: &str) -> Result<Option<Database>> {
        Ok(self
            .databases
            .read()
            .get(&(tenant.to_string(), name.to_string()))
            .cloned())
    }

    fn delete_database(&self, tenant: &str, name: &str) -> Result<bool> {
        Ok(self
            .databases
            .write()
            .remove(&(tenant.to_string(), name.to_string()))
            .is_some())
    }

    fn create_collection(&self, collection: &Collection) -> Result<()> {
        let mut collections = self.collections.write();
        let duplicate = collections.values().any(|c| {
            c.tenant == collection.tenant && c.database == collection.database && c.name == collection.name
        });
        if duplicate {
            return Err(Error::CollectionExists(collection.qualified_name()));
        }
        collections.insert(collection.id, collection.clone());
        Ok(())
    }

    fn update_collection(&self, collection: &Collection) -> Result<()> {
        let mut collections = self.collections.write();
        match collections.get_mut(&collection.id) {
            Some(existing) => {
                *existing = collection.clone();
                Ok(())
            }
            None => Err(Error::CollectionNotFound(collection.qualified_name())),
        }
    }

    fn get_collection(&self, tenant: &str, database: &str, name: &str) -> Result<Option<Collection>> {
        Ok(self
            .collections
            .read()
            .values()
            .find(|c| c.tenant == tenant && c.database == database && c.name == name)
            .cloned())
    }

    fn get_collection_by_id(&self, id: Uuid) -> Result<Option<Collection>> {
        Ok(self.collections.read().get(&id).cloned())
    }

    fn list_collections(&self, tenant: &str, database: &str) -> Result<Vec<Collection>> {
        let mut found: Vec<Collection> = self
            .collections
            .read()
            .values()
            .filter(|c| c.tenant == tenant && c.database == database)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    fn delete_collection(&self, id: Uuid) -> Result<bool> {
        Ok(self.collections.write().remove(&id).is_some())
    }

    fn put_records(&self, collection: Uuid, records: &[(String, RecordMeta)]) -> Result<()> {
        let mut all = self.records.write();
        let partition = all.entry(collection).or_default();
        for (id, meta) in records {
            partition.insert(id.clone(), meta.clone());
        }
        Ok(())
    }

    fn get_records(&self, collection: Uuid, ids: &[String]) -> Result<Vec<Option<RecordMeta>>> {
        let all = self.records.read();
        let partition = all.get(&collection);
        Ok(ids
            .iter()
            .map(|id| partition.and_then(|p| p.get(id)).cloned())
            .collect())
    }

    fn delete_records(&self, collection: Uuid, ids: &[String]) -> Result<usize> {
        let mut all = self.records.write();
        let Some(partition) = all.get_mut(&collection) else {
            return Ok(0);
        };
        Ok(ids.iter().filter(|id| partition.remove(*id).is_some()).count())
    }

    fn drop_records(&self, collection: Uuid) -> Result<()> {
        self.records.write().remove(&collection);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.databases.write().clear();
        self.collections.write().clear();
        self.records.write().clear();
        Ok(())
    }
}

/// Writer over the in-memory stores. Only the catalog update can fail, and
/// it runs first, so a failed commit changes nothing.
pub struct MemoryRecordWriter {
    vectors: Arc<MemoryVectorStore>,
    metadata: Arc<MemoryMetadataStore>,
}

impl RecordWriter for MemoryRecordWriter {
    fn commit(&self, collection: Uuid, write: &WriteSet<'_>) -> Result<usize> {
        if let Some(catalog) = write.catalog {
            self.metadata.update_collection(catalog)?;
        }
        let mut removed = 0;
        if !write.removals.is_empty() {
            removed = self.vectors.delete(collection, write.removals)?;
            self.metadata.delete_records(collection, write.removals)?;
        }
        if !write.vectors.is_empty() {
            self.vectors.put(collection, write.vectors)?;
        }
        if !write.records.is_empty() {
            self.metadata.put_records(collection, write.records)?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionConfig;

    fn v(x: f32) -> Vector {
        Vector::new(vec![x])
    }

    #[test]
    fn test_vector_store_insertion_order() {
        let store = MemoryVectorStore::new();
        let c = Uuid::new_v4();
        store
            .put(c, &[("a".to_string(), v(1.0)), ("b".to_string(), v(2.0)), ("c".to_string(), v(3.0))])
            .unwrap();
        store.put(c, &[("a".to_string(), v(9.0))]).unwrap();

        assert_eq!(store.ids(c).unwrap(), vec!["b", "c", "a"]);
        assert_eq!(store.count(c).unwrap(), 3);
        assert_eq!(store.get(c, &["a".to_string(), "zz".to_string()]).unwrap(), vec![Some(v(9.0)), None]);

        assert_eq!(store.delete(c, &["b".to_string(), "zz".to_string()]).unwrap(), 1);
        assert_eq!(store.scan(c).unwrap(), vec![("c".to_string(), v(3.0)), ("a".to_string(), v(9.0))]);

        store.drop_collection(c).unwrap();
        assert_eq!(store.count(c).unwrap(), 0);
    }

    #[test]
    fn test_metadata_store_catalog() {
        let store = MemoryMetadataStore::new();
        let db = Database {
            id: Uuid::new_v4(),
            name: "main".to_string(),
            tenant: "t".to_string(),
        };
        store.create_database(&db).unwrap();
        assert!(matches!(store.create_database(&db), Err(Error::DatabaseExists(_))));
        assert_eq!(store.get_database("t", "main").unwrap(), Some(db));

        let coll = Collection::new("docs", "t", "main", CollectionConfig::default(), None);
        store.create_collection(&coll).unwrap();
        let dup = Collection::new("docs", "t", "main", CollectionConfig::default(), None);
        assert!(matches!(store.create_collection(&dup), Err(Error::CollectionExists(_))));

        let mut updated = coll.clone();
        updated.dimension = Some(4);
        store.update_collection(&updated).unwrap();
        assert_eq!(store.get_collection_by_id(coll.id).unwrap().unwrap().dimension, Some(4));
        assert_eq!(store.list_collections("t", "main").unwrap().len(), 1);
        assert!(store.delete_collection(coll.id).unwrap());
        assert!(store.get_collection("t", "main", "docs").unwrap().is_none());
    }

    #[test]
    fn test_metadata_store_records() {
        let store = MemoryMetadataStore::new();
        let c = Uuid::new_v4();
        let meta = RecordMeta {
            metadata: None,
            document: Some("doc".to_string()),
        };
        store.put_records(c, &[("a".to_string(), meta.clone())]).unwrap();
        assert_eq!(store.get_records(c, &["a".to_string(), "b".to_string()]).unwrap(), vec![Some(meta), None]);
        assert_eq!(store.delete_records(c, &["a".to_string()]).unwrap(), 1);
        assert_eq!(store.get_records(c, &["a".to_string()]).unwrap(), vec![None]);
    }

    #[test]
    fn test_writer_applies_nothing_when_catalog_update_fails() {
        let stores = Stores::in_memory();
        let missing = Collection::new("gone", "t", "main", CollectionConfig::default(), None);
        let rows = vec![("a".to_string(), v(1.0))];
        let metas = vec![("a".to_string(), RecordMeta::default())];

        let err = stores
            .writer
            .commit(
                missing.id,
                &WriteSet {
                    catalog: Some(&missing),
                    vectors: &rows,
                    records: &metas,
                    ..WriteSet::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::CollectionNotFound(_)));
        assert_eq!(stores.vectors.count(missing.id).unwrap(), 0);
        assert_eq!(stores.metadata.get_records(missing.id, &["a".to_string()]).unwrap(), vec![None]);
    }

    #[test]
    fn test_writer_removes_then_puts() {
        let stores = Stores::in_memory();
        let c = Uuid::new_v4();
        let rows = vec![("a".to_string(), v(1.0)), ("b".to_string(), v(2.0))];
        stores
            .writer
            .commit(c, &WriteSet { vectors: &rows, ..WriteSet::default() })
            .unwrap();

        let removals = vec!["a".to_string(), "zz".to_string()];
        let removed = stores
            .writer
            .commit(c, &WriteSet { removals: &removals, ..WriteSet::default() })
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(stores.vectors.ids(c).unwrap(), vec!["b"]);
    }
}
