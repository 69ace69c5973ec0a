// LMDB-backed vector and metadata stores sharing one environment
use crate::config::{MigrationHash, MigrationMode};
use crate::schema::schema_checksum;
use anyhow::Context;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions, RwTxn};
use quiver_core::store::{MetadataStore, RecordWriter, VectorStore, WriteSet};
use quiver_core::{Collection, Error, RecordMeta, Result, Vector};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const DB_META: &str = "meta";
const DB_DATABASES: &str = "databases";
const DB_COLLECTIONS: &str = "collections";
const DB_RECORDS: &str = "records";
const DB_VECTORS: &str = "vectors";

const KEY_SCHEMA_CHECKSUM: &str = "schema_checksum";
const KEY_VECTOR_SEQ: &str = "vector_seq";

pub const DEFAULT_MAP_SIZE: usize = 10 * 1024 * 1024 * 1024; // 10GB

#[derive(Serialize, Deserialize)]
struct VectorRow {
    seq: u64,
    data: Vec<f32>,
}

fn storage_err(e: anyhow::Error) -> Error {
    Error::Storage(format!("{:#}", e))
}

/// `collection:` prefix shared by record and vector keys
fn partition_prefix(collection: Uuid) -> String {
    format!("{}:", collection)
}

fn record_key(collection: Uuid, id: &str) -> String {
    format!("{}:{}", collection, id)
}

fn database_key(tenant: &str, name: &str) -> String {
    format!("{}\0{}", tenant, name)
}

pub struct LmdbStorage {
    env: Arc<Env>,
    path: PathBuf,
    meta_db: Database<Str, Bytes>,
    databases_db: Database<Str, Bytes>,
    collections_db: Database<Str, Bytes>,
    records_db: Database<Str, Bytes>,
    vectors_db: Database<Str, Bytes>,
}

impl LmdbStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_map_size(path, DEFAULT_MAP_SIZE)
    }

    /// Open with an explicit LMDB map size; writes that would grow the
    /// environment past it fail and are rolled back.
    pub fn open_with_map_size<P: AsRef<Path>>(path: P, map_size: usize) -> Result<Self> {
        Self::open_env(path.as_ref(), map_size).map_err(storage_err)
    }

    fn open_env(path: &Path, map_size: usize) -> anyhow::Result<Self> {
        let path = path.to_path_buf();
        std::fs::create_dir_all(&path).with_context(|| format!("creating {}", path.display()))?;

        let env = Arc::new(unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(8)
                .open(&path)
                .with_context(|| format!("opening LMDB environment at {}", path.display()))?
        });

        let mut wtxn = env.write_txn()?;
        let meta_db = env.create_database(&mut wtxn, Some(DB_META))?;
        let databases_db = env.create_database(&mut wtxn, Some(DB_DATABASES))?;
        let collections_db = env.create_database(&mut wtxn, Some(DB_COLLECTIONS))?;
        let records_db = env.create_database(&mut wtxn, Some(DB_RECORDS))?;
        let vectors_db = env.create_database(&mut wtxn, Some(DB_VECTORS))?;
        wtxn.commit()?;

        info!(path = %path.display(), "opened LMDB storage");
        Ok(Self {
            env,
            path,
            meta_db,
            databases_db,
            collections_db,
            records_db,
            vectors_db,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reconcile the stored schema checksum with this build's schema
    pub fn migrate(&self, mode: MigrationMode, hash: MigrationHash) -> Result<()> {
        let expected = schema_checksum(hash)?;
        let stored = self.stored_checksum().map_err(storage_err)?;

        match mode {
            MigrationMode::Validate => match stored {
                Some(ref found) if *found == expected => Ok(()),
                Some(found) => Err(Error::Internal(format!(
                    "schema checksum mismatch at {}: stored {}, expected {}",
                    self.path.display(),
                    found,
                    expected
                ))),
                None => Err(Error::Internal(format!(
                    "no schema checksum recorded at {}; open it once with migrations applied",
                    self.path.display()
                ))),
            },
            MigrationMode::Apply => {
                if stored.as_deref() != Some(expected.as_str()) {
                    self.write_checksum(&expected).map_err(storage_err)?;
                    info!(path = %self.path.display(), checksum = %expected, "applied schema checksum");
                }
                Ok(())
            }
        }
    }

    fn stored_checksum(&self) -> anyhow::Result<Option<String>> {
        let rtxn = self.env.read_txn()?;
        match self.meta_db.get(&rtxn, KEY_SCHEMA_CHECKSUM)? {
            Some(bytes) => Ok(Some(String::from_utf8(bytes.to_vec())?)),
            None => Ok(None),
        }
    }

    fn write_checksum(&self, checksum: &str) -> anyhow::Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.meta_db.put(&mut wtxn, KEY_SCHEMA_CHECKSUM, checksum.as_bytes())?;
        wtxn.commit()?;
        Ok(())
    }

    fn put_vectors(&self, collection: Uuid, rows: &[(String, Vector)]) -> anyhow::Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.write_vectors(&mut wtxn, collection, rows)?;
        wtxn.commit()?;
        Ok(())
    }

    fn write_vectors(&self, wtxn: &mut RwTxn, collection: Uuid, rows: &[(String, Vector)]) -> anyhow::Result<()> {
        let mut seq = match self.meta_db.get(wtxn, KEY_VECTOR_SEQ)? {
            Some(bytes) => u64::from_be_bytes(bytes.try_into().context("corrupt vector sequence")?),
            None => 0,
        };
        for (id, vector) in rows {
            let row = VectorRow {
                seq,
                data: vector.as_slice().to_vec(),
            };
            seq += 1;
            self.vectors_db
                .put(wtxn, &record_key(collection, id), &bincode::serialize(&row)?)?;
        }
        self.meta_db.put(wtxn, KEY_VECTOR_SEQ, &seq.to_be_bytes())?;
        Ok(())
    }

    fn get_vectors(&self, collection: Uuid, ids: &[String]) -> anyhow::Result<Vec<Option<Vector>>> {
        let rtxn = self.env.read_txn()?;
        ids.iter()
            .map(|id| {
                self.vectors_db
                    .get(&rtxn, &record_key(collection, id))?
                    .map(|bytes| bincode::deserialize::<VectorRow>(bytes).map(|row| Vector::new(row.data)))
                    .transpose()
                    .map_err(anyhow::Error::from)
            })
            .collect()
    }

    /// Rows of one collection sorted by write sequence
    fn scan_vectors(&self, collection: Uuid) -> anyhow::Result<Vec<(String, VectorRow)>> {
        let rtxn = self.env.read_txn()?;
        let prefix = partition_prefix(collection);
        let mut rows = Vec::new();
        for entry in self.vectors_db.prefix_iter(&rtxn, &prefix)? {
            let (key, bytes) = entry?;
            let id = key[prefix.len()..].to_string();
            rows.push((id, bincode::deserialize::<VectorRow>(bytes)?));
        }
        rows.sort_unstable_by_key(|(_, row)| row.seq);
        Ok(rows)
    }

    fn delete_keys(&self, db: &Database<Str, Bytes>, collection: Uuid, ids: &[String]) -> anyhow::Result<usize> {
        let mut wtxn = self.env.write_txn()?;
        let deleted = Self::remove_keys(&mut wtxn, db, collection, ids)?;
        wtxn.commit()?;
        Ok(deleted)
    }

    fn remove_keys(wtxn: &mut RwTxn, db: &Database<Str, Bytes>, collection: Uuid, ids: &[String]) -> anyhow::Result<usize> {
        let mut deleted = 0;
        for id in ids {
            if db.delete(wtxn, &record_key(collection, id))? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn drop_partition(&self, db: &Database<Str, Bytes>, collection: Uuid) -> anyhow::Result<usize> {
        let prefix = partition_prefix(collection);
        let keys: Vec<String> = {
            let rtxn = self.env.read_txn()?;
            let mut keys = Vec::new();
            for entry in db.prefix_iter(&rtxn, &prefix)? {
                let (key, _) = entry?;
                keys.push(key.to_string());
            }
            keys
        };
        let mut wtxn = self.env.write_txn()?;
        for key in &keys {
            db.delete(&mut wtxn, key)?;
        }
        wtxn.commit()?;
        Ok(keys.len())
    }

    fn count_partition(&self, db: &Database<Str, Bytes>, collection: Uuid) -> anyhow::Result<usize> {
        let rtxn = self.env.read_txn()?;
        let prefix = partition_prefix(collection);
        let mut count = 0;
        for entry in db.prefix_iter(&rtxn, &prefix)? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, db: &Database<Str, Bytes>, key: &str) -> anyhow::Result<Option<T>> {
        let rtxn = self.env.read_txn()?;
        match db.get(&rtxn, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    fn all_json<T: serde::de::DeserializeOwned>(&self, db: &Database<Str, Bytes>) -> anyhow::Result<Vec<T>> {
        let rtxn = self.env.read_txn()?;
        let mut values = Vec::new();
        for entry in db.iter(&rtxn)? {
            let (_, bytes) = entry?;
            values.push(serde_json::from_slice(bytes)?);
        }
        Ok(values)
    }

    /// Insert `value` under `key` unless present; returns whether it was written
    fn insert_json<T: Serialize>(&self, db: &Database<Str, Bytes>, key: &str, value: &T) -> anyhow::Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        if db.get(&wtxn, key)?.is_some() {
            return Ok(false);
        }
        db.put(&mut wtxn, key, &serde_json::to_vec(value)?)?;
        wtxn.commit()?;
        Ok(true)
    }

    fn find_collection(&self, tenant: &str, database: &str, name: &str) -> anyhow::Result<Option<Collection>> {
        Ok(self
            .all_json::<Collection>(&self.collections_db)?
            .into_iter()
            .find(|c| c.tenant == tenant && c.database == database && c.name == name))
    }

    fn create_collection_entry(&self, collection: &Collection) -> anyhow::Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        for entry in self.collections_db.iter(&wtxn)? {
            let (_, bytes) = entry?;
            let existing: Collection = serde_json::from_slice(bytes)?;
            if existing.tenant == collection.tenant
                && existing.database == collection.database
                && existing.name == collection.name
            {
                return Ok(false);
            }
        }
        self.collections_db
            .put(&mut wtxn, &collection.id.to_string(), &serde_json::to_vec(collection)?)?;
        wtxn.commit()?;
        Ok(true)
    }

    fn replace_collection_entry(&self, collection: &Collection) -> anyhow::Result<bool> {
        let key = collection.id.to_string();
        let mut wtxn = self.env.write_txn()?;
        if self.collections_db.get(&wtxn, &key)?.is_none() {
            return Ok(false);
        }
        self.collections_db.put(&mut wtxn, &key, &serde_json::to_vec(collection)?)?;
        wtxn.commit()?;
        Ok(true)
    }

    fn delete_key(&self, db: &Database<Str, Bytes>, key: &str) -> anyhow::Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        let existed = db.delete(&mut wtxn, key)?;
        wtxn.commit()?;
        Ok(existed)
    }

    fn put_records_json(&self, collection: Uuid, records: &[(String, RecordMeta)]) -> anyhow::Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.write_records(&mut wtxn, collection, records)?;
        wtxn.commit()?;
        Ok(())
    }

    fn write_records(&self, wtxn: &mut RwTxn, collection: Uuid, records: &[(String, RecordMeta)]) -> anyhow::Result<()> {
        for (id, meta) in records {
            self.records_db
                .put(wtxn, &record_key(collection, id), &serde_json::to_vec(meta)?)?;
        }
        Ok(())
    }

    /// Apply a whole write in one transaction; an error aborts all of it
    fn commit_write(&self, collection: Uuid, write: &WriteSet<'_>) -> anyhow::Result<Result<usize>> {
        let mut wtxn = self.env.write_txn()?;
        if let Some(catalog) = write.catalog {
            let key = catalog.id.to_string();
            if self.collections_db.get(&wtxn, &key)?.is_none() {
                return Ok(Err(Error::CollectionNotFound(catalog.qualified_name())));
            }
            self.collections_db.put(&mut wtxn, &key, &serde_json::to_vec(catalog)?)?;
        }
        let removed = Self::remove_keys(&mut wtxn, &self.vectors_db, collection, write.removals)?;
        Self::remove_keys(&mut wtxn, &self.records_db, collection, write.removals)?;
        if !write.vectors.is_empty() {
            self.write_vectors(&mut wtxn, collection, write.vectors)?;
        }
        self.write_records(&mut wtxn, collection, write.records)?;
        wtxn.commit()?;
        Ok(Ok(removed))
    }

    fn get_records_json(&self, collection: Uuid, ids: &[String]) -> anyhow::Result<Vec<Option<RecordMeta>>> {
        let rtxn = self.env.read_txn()?;
        ids.iter()
            .map(|id| match self.records_db.get(&rtxn, &record_key(collection, id))? {
                Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
                None => Ok(None),
            })
            .collect()
    }

    fn clear_all(&self, dbs: &[&Database<Str, Bytes>]) -> anyhow::Result<()> {
        let mut wtxn = self.env.write_txn()?;
        for db in dbs {
            db.clear(&mut wtxn)?;
        }
        wtxn.commit()?;
        Ok(())
    }
}

impl VectorStore for LmdbStorage {
    fn put(&self, collection: Uuid, rows: &[(String, Vector)]) -> Result<()> {
        self.put_vectors(collection, rows).map_err(storage_err)
    }

    fn get(&self, collection: Uuid, ids: &[String]) -> Result<Vec<Option<Vector>>> {
        self.get_vectors(collection, ids).map_err(storage_err)
    }

    fn delete(&self, collection: Uuid, ids: &[String]) -> Result<usize> {
        self.delete_keys(&self.vectors_db, collection, ids).map_err(storage_err)
    }

    fn scan(&self, collection: Uuid) -> Result<Vec<(String, Vector)>> {
        Ok(self
            .scan_vectors(collection)
            .map_err(storage_err)?
            .into_iter()
            .map(|(id, row)| (id, Vector::new(row.data)))
            .collect())
    }

    fn ids(&self, collection: Uuid) -> Result<Vec<String>> {
        Ok(self
            .scan_vectors(collection)
            .map_err(storage_err)?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    fn count(&self, collection: Uuid) -> Result<usize> {
        self.count_partition(&self.vectors_db, collection).map_err(storage_err)
    }

    fn drop_collection(&self, collection: Uuid) -> Result<()> {
        let dropped = self.drop_partition(&self.vectors_db, collection).map_err(storage_err)?;
        debug!(%collection, dropped, "dropped vector partition");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.clear_all(&[&self.vectors_db]).map_err(storage_err)
    }
}

impl RecordWriter for LmdbStorage {
    fn commit(&self, collection: Uuid, write: &WriteSet<'_>) -> Result<usize> {
        let removed = self.commit_write(collection, write).map_err(storage_err)??;
        debug!(
            %collection,
            vectors = write.vectors.len(),
            records = write.records.len(),
            removed,
            "committed write"
        );
        Ok(removed)
    }
}

impl MetadataStore for LmdbStorage {
    fn create_database(&self, database: &quiver_core::Database) -> Result<()> {
        let key = database_key(&database.tenant, &database.name);
        if self.insert_json(&self.databases_db, &key, database).map_err(storage_err)? {
            Ok(())
        } else {
            Err(Error::DatabaseExists(format!("{}/{}", database.tenant, database.name)))
        }
    }

    fn get_database(&self, tenant: &str, name: &str) -> Result<Option<quiver_core::Database>> {
        self.get_json(&self.databases_db, &database_key(tenant, name))
            .map_err(storage_err)
    }

    fn delete_database(&self, tenant: &str, name: &str) -> Result<bool> {
        self.delete_key(&self.databases_db, &database_key(tenant, name))
            .map_err(storage_err)
    }

    fn create_collection(&self, collection: &Collection) -> Result<()> {
        if self.create_collection_entry(collection).map_err(storage_err)? {
            Ok(())
        } else {
            Err(Error::CollectionExists(collection.qualified_name()))
        }
    }

    fn update_collection(&self, collection: &Collection) -> Result<()> {
        if self.replace_collection_entry(collection).map_err(storage_err)? {
            Ok(())
        } else {
            Err(Error::CollectionNotFound(collection.qualified_name()))
        }
    }

    fn get_collection(&self, tenant: &str, database: &str, name: &str) -> Result<Option<Collection>> {
        self.find_collection(tenant, database, name).map_err(storage_err)
    }

    fn get_collection_by_id(&self, id: Uuid) -> Result<Option<Collection>> {
        self.get_json(&self.collections_db, &id.to_string())
            .map_err(storage_err)
    }

    fn list_collections(&self, tenant: &str, database: &str) -> Result<Vec<Collection>> {
        let mut found: Vec<Collection> = self
            .all_json::<Collection>(&self.collections_db)
            .map_err(storage_err)?
            .into_iter()
            .filter(|c| c.tenant == tenant && c.database == database)
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    fn delete_collection(&self, id: Uuid) -> Result<bool> {
        self.delete_key(&self.collections_db, &id.to_string())
            .map_err(storage_err)
    }

    fn put_records(&self, collection: Uuid, records: &[(String, RecordMeta)]) -> Result<()> {
        self.put_records_json(collection, records).map_err(storage_err)
    }

    fn get_records(&self, collection: Uuid, ids: &[String]) -> Result<Vec<Option<RecordMeta>>> {
        self.get_records_json(collection, ids).map_err(storage_err)
    }

    fn delete_records(&self, collection: Uuid, ids: &[String]) -> Result<usize> {
        self.delete_keys(&self.records_db, collection, ids).map_err(storage_err)
    }

    fn drop_records(&self, collection: Uuid) -> Result<()> {
        self.drop_partition(&self.records_db, collection).map_err(storage_err)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.clear_all(&[&self.databases_db, &self.collections_db, &self.records_db])
            .map_err(storage_err)
    }
}
