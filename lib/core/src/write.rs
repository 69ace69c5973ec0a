use crate::cache::{CollectionLocks, IndexCache};
use crate::collection::Collection;
use crate::error::{Error, Result};
use crate::filter::{Filter, RecordFilter};
use crate::record::{validate_id, validate_metadata, Metadata, Record, RecordMeta, MAX_ID_BYTES};
use crate::store::{Stores, WriteSet};
use crate::vector::Vector;
use ahash::AHashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// One batched write as parallel arrays
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordBatch {
    pub ids: Vec<String>,
    pub embeddings: Option<Vec<Vec<f32>>>,
    pub metadatas: Option<Vec<Option<Metadata>>>,
    pub documents: Option<Vec<Option<String>>>,
}

impl RecordBatch {
    pub fn new(ids: Vec<String>, embeddings: Vec<Vec<f32>>) -> Self {
        Self {
            ids,
            embeddings: Some(embeddings),
            metadatas: None,
            documents: None,
        }
    }

    pub fn from_records(records: Vec<Record>) -> Self {
        let mut batch = Self {
            ids: Vec::with_capacity(records.len()),
            embeddings: Some(Vec::with_capacity(records.len())),
            metadatas: Some(Vec::with_capacity(records.len())),
            documents: Some(Vec::with_capacity(records.len())),
        };
        for record in records {
            batch.ids.push(record.id);
            batch.embeddings.get_or_insert_with(Vec::new).push(record.embedding.into_inner());
            batch.metadatas.get_or_insert_with(Vec::new).push(record.metadata);
            batch.documents.get_or_insert_with(Vec::new).push(record.document);
        }
        batch
    }

    /// A batch that touches only the given ids; used by update
    pub fn for_ids(ids: Vec<String>) -> Self {
        Self {
            ids,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_embeddings(mut self, embeddings: Vec<Vec<f32>>) -> Self {
        self.embeddings = Some(embeddings);
        self
    }

    #[must_use]
    pub fn with_metadatas(mut self, metadatas: Vec<Option<Metadata>>) -> Self {
        self.metadatas = Some(metadatas);
        self
    }

    #[must_use]
    pub fn with_documents(mut self, documents: Vec<Option<String>>) -> Self {
        self.documents = Some(documents);
        self
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn metadata(&self, i: usize) -> Option<&Metadata> {
        self.metadatas.as_ref().and_then(|m| m[i].as_ref())
    }

    fn document(&self, i: usize) -> Option<&String> {
        self.documents.as_ref().and_then(|d| d[i].as_ref())
    }

    /// Everything that can be checked without the catalog: array lengths,
    /// id uniqueness, metadata shape and finite, uniform embeddings.
    pub fn validate(&self, allow_null_metadata: bool) -> Result<()> {
        if self.ids.is_empty() {
            return Err(Error::InvalidArgument("batch must contain at least one id".to_string()));
        }
        let n = self.ids.len();
        let check_len = |what: &str, len: usize| {
            if len != n {
                Err(Error::InvalidArgument(format!(
                    "{} has {} entries but ids has {}",
                    what, len, n
                )))
            } else {
                Ok(())
            }
        };
        if let Some(embeddings) = &self.embeddings {
            check_len("embeddings", embeddings.len())?;
        }
        if let Some(metadatas) = &self.metadatas {
            check_len("metadatas", metadatas.len())?;
        }
        if let Some(documents) = &self.documents {
            check_len("documents", documents.len())?;
        }

        let mut seen = AHashSet::with_capacity(n);
        for id in &self.ids {
            validate_id(id)?;
            if !seen.insert(id.as_str()) {
                return Err(Error::Validation(format!("duplicate id '{}' in batch", id)));
            }
        }

        for metadata in self.metadatas.iter().flatten().flatten() {
            validate_metadata(metadata, allow_null_metadata)?;
        }

        if let Some(embeddings) = &self.embeddings {
            let dim = embeddings[0].len();
            if dim == 0 {
                return Err(Error::Validation("embeddings must not be empty".to_string()));
            }
            for (id, embedding) in self.ids.iter().zip(embeddings) {
                if embedding.len() != dim {
                    return Err(Error::InvalidDimension {
                        expected: dim,
                        actual: embedding.len(),
                    });
                }
                if embedding.iter().any(|x| !x.is_finite()) {
                    return Err(Error::Validation(format!(
                        "embedding for '{}' contains a non-finite value",
                        id
                    )));
                }
            }
        }
        Ok(())
    }
}

fn check_dimension(collection: &Collection, embeddings: &[Vec<f32>]) -> Result<usize> {
    let actual = embeddings.first().map(Vec::len).unwrap_or(0);
    match collection.dimension {
        Some(expected) if expected != actual => Err(Error::InvalidDimension { expected, actual }),
        _ => Ok(actual),
    }
}

/// Apply a partial metadata update; a null value removes the key
fn merge_metadata(target: &mut Option<Metadata>, patch: &Metadata) {
    let map = target.get_or_insert_with(Metadata::new);
    for (key, value) in patch {
        if value.is_null() {
            map.remove(key);
        } else {
            map.insert(key.clone(), value.clone());
        }
    }
    if map.is_empty() {
        *target = None;
    }
}

/// Applies batched writes to both stores and keeps a resident index in step.
///
/// Every mutation runs under the collection's write lock. Non-resident
/// indices are left alone; the next query rebuilds them from the vector store.
pub struct WritePipeline {
    stores: Stores,
    cache: Arc<IndexCache>,
    locks: Arc<CollectionLocks>,
}

impl WritePipeline {
    pub fn new(stores: Stores, cache: Arc<IndexCache>, locks: Arc<CollectionLocks>) -> Self {
        Self { stores, cache, locks }
    }

    /// Insert records; an id that already exists is replaced entirely
    pub fn add(&self, collection: &Collection, batch: RecordBatch) -> Result<()> {
        self.put(collection, batch, "add")
    }

    pub fn upsert(&self, collection: &Collection, batch: RecordBatch) -> Result<()> {
        self.put(collection, batch, "upsert")
    }

    fn put(&self, collection: &Collection, batch: RecordBatch, op: &'static str) -> Result<()> {
        let Some(embeddings) = batch.embeddings.as_deref() else {
            return Err(Error::InvalidArgument(format!("{} requires embeddings", op)));
        };
        batch.validate(false)?;

        let lock = self.locks.lock_for(collection.id);
        let _guard = lock.write();

        let mut current = self.stores.current_collection(collection)?;
        let dim = check_dimension(&current, embeddings)?;
        let fixes_dimension = current.dimension.is_none();
        current.dimension = Some(dim);

        let rows: Vec<(String, Vector)> = batch
            .ids
            .iter()
            .zip(embeddings)
            .map(|(id, e)| (id.clone(), Vector::from_slice(e)))
            .collect();
        let metas: Vec<(String, RecordMeta)> = batch
            .ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let meta = RecordMeta {
                    metadata: batch.metadata(i).cloned(),
                    document: batch.document(i).cloned(),
                };
                (id.clone(), meta)
            })
            .collect();

        self.stores.writer.commit(
            current.id,
            &WriteSet {
                catalog: fixes_dimension.then_some(&current),
                vectors: &rows,
                records: &metas,
                ..WriteSet::default()
            },
        )?;
        if fixes_dimension {
            debug!(collection = %current.qualified_name(), dim, "collection dimension fixed by first write");
        }
        self.apply_to_index(current.id, &rows, &[])?;

        debug!(collection = %current.qualified_name(), records = rows.len(), op, "write applied");
        Ok(())
    }

    /// Partially update existing records. Embeddings replace, metadata is
    /// merged key by key and documents replace. Missing ids are skipped.
    /// Returns how many records were updated.
    pub fn update(&self, collection: &Collection, batch: RecordBatch) -> Result<usize> {
        batch.validate(true)?;

        let lock = self.locks.lock_for(collection.id);
        let _guard = lock.write();

        let current = self.stores.current_collection(collection)?;
        if let (Some(embeddings), Some(_)) = (batch.embeddings.as_deref(), current.dimension) {
            check_dimension(&current, embeddings)?;
        }

        let existing = self.stores.vectors.get(current.id, &batch.ids)?;
        let touches_meta = batch.metadatas.is_some() || batch.documents.is_some();
        let metas = if touches_meta {
            self.stores.metadata.get_records(current.id, &batch.ids)?
        } else {
            Vec::new()
        };

        let mut rows = Vec::new();
        let mut meta_rows = Vec::new();
        let mut updated = 0;
        for (i, id) in batch.ids.iter().enumerate() {
            if existing[i].is_none() {
                warn!(collection = %current.qualified_name(), id = %id, "update skipped missing record");
                continue;
            }
            updated += 1;
            if let Some(embeddings) = &batch.embeddings {
                rows.push((id.clone(), Vector::from_slice(&embeddings[i])));
            }
            if touches_meta {
                let mut meta = metas[i].clone().unwrap_or_default();
                if let Some(patch) = batch.metadata(i) {
                    merge_metadata(&mut meta.metadata, patch);
                }
                if let Some(document) = batch.document(i) {
                    meta.document = Some(document.clone());
                }
                meta_rows.push((id.clone(), meta));
            }
        }

        if !rows.is_empty() || !meta_rows.is_empty() {
            self.stores.writer.commit(
                current.id,
                &WriteSet {
                    vectors: &rows,
                    records: &meta_rows,
                    ..WriteSet::default()
                },
            )?;
        }
        self.apply_to_index(current.id, &rows, &[])?;

        debug!(collection = %current.qualified_name(), updated, "update applied");
        Ok(updated)
    }

    /// Remove the records selected by `ids`, `filter`, or both (intersected).
    /// Returns how many records were deleted.
    pub fn delete(
        &self,
        collection: &Collection,
        ids: Option<&[String]>,
        filter: Option<&RecordFilter>,
    ) -> Result<usize> {
        if ids.is_none() && filter.is_none() {
            return Err(Error::InvalidArgument(
                "delete requires ids, a where filter, or both".to_string(),
            ));
        }

        let lock = self.locks.lock_for(collection.id);
        let _guard = lock.write();

        let current = self.stores.current_collection(collection)?;
        let mut targets: Vec<String> = match ids {
            Some(ids) => {
                // ids past the limit can never have been written
                let mut seen = AHashSet::with_capacity(ids.len());
                ids.iter()
                    .filter(|id| id.len() <= MAX_ID_BYTES && seen.insert(id.as_str()))
                    .cloned()
                    .collect()
            }
            None => self.stores.vectors.ids(current.id)?,
        };

        if let Some(filter) = filter {
            let metas = self.stores.metadata.get_records(current.id, &targets)?;
            targets = targets
                .into_iter()
                .zip(metas)
                .filter(|(_, meta)| filter.matches(&meta.clone().unwrap_or_default()))
                .map(|(id, _)| id)
                .collect();
        }
        if targets.is_empty() {
            return Ok(0);
        }

        let deleted = self.stores.writer.commit(
            current.id,
            &WriteSet {
                removals: &targets,
                ..WriteSet::default()
            },
        )?;
        self.apply_to_index(current.id, &[], &targets)?;

        debug!(collection = %current.qualified_name(), deleted, "delete applied");
        Ok(deleted)
    }

    /// Mirror a write into the resident index, if any. A failure drops the
    /// index from the cache so the next query rebuilds it from the store.
    fn apply_to_index(&self, collection: uuid::Uuid, inserts: &[(String, Vector)], removals: &[String]) -> Result<()> {
        let Some(index) = self.cache.resident(collection) else {
            return Ok(());
        };
        let mut index = index.write();
        for id in removals {
            index.remove(id);
        }
        for (id, vector) in inserts {
            if let Err(e) = index.insert(id, vector.as_slice()) {
                drop(index);
                self.cache.invalidate(collection);
                return Err(Error::Internal(format!("index update failed for '{}': {}", id, e)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{CollectionConfig, HnswParams};
    use crate::hnsw::HnswIndex;
    use crate::store::RecordWriter;
    use serde_json::json;
    use uuid::Uuid;

    struct Fixture {
        stores: Stores,
        cache: Arc<IndexCache>,
        pipeline: WritePipeline,
        collection: Collection,
    }

    fn fixture() -> Fixture {
        let stores = Stores::in_memory();
        let cache = Arc::new(IndexCache::new(4).unwrap());
        let locks = Arc::new(CollectionLocks::new());
        let collection = Collection::new("docs", "t", "db", CollectionConfig::default(), None);
        stores.metadata.create_collection(&collection).unwrap();
        let pipeline = WritePipeline::new(stores.clone(), cache.clone(), locks);
        Fixture {
            stores,
            cache,
            pipeline,
            collection,
        }
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn meta(v: serde_json::Value) -> Option<Metadata> {
        v.as_object().cloned()
    }

    fn axis_batch() -> RecordBatch {
        RecordBatch::new(
            ids(&["a", "b", "c"]),
            vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 1.0]],
        )
    }

    #[test]
    fn test_add_persists_and_fixes_dimension() {
        let f = fixture();
        f.pipeline.add(&f.collection, axis_batch()).unwrap();

        assert_eq!(f.stores.vectors.count(f.collection.id).unwrap(), 3);
        let stored = f.stores.current_collection(&f.collection).unwrap();
        assert_eq!(stored.dimension, Some(3));

        // no index was loaded eagerly
        assert_eq!(f.cache.builds(), 0);

        let err = f
            .pipeline
            .add(&f.collection, RecordBatch::new(ids(&["d"]), vec![vec![1.0, 2.0]]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDimension { expected: 3, actual: 2 }));
    }

    #[test]
    fn test_length_mismatch_persists_nothing() {
        let f = fixture();
        let batch = RecordBatch::new(ids(&["a", "b", "c"]), vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]]);
        let err = f.pipeline.add(&f.collection, batch).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(f.stores.vectors.count(f.collection.id).unwrap(), 0);
        assert_eq!(f.stores.current_collection(&f.collection).unwrap().dimension, None);
    }

    #[test]
    fn test_batch_validation() {
        let f = fixture();
        let dup = RecordBatch::new(ids(&["a", "a"]), vec![vec![1.0], vec![2.0]]);
        assert!(matches!(f.pipeline.add(&f.collection, dup), Err(Error::Validation(_))));

        let empty_id = RecordBatch::new(ids(&[""]), vec![vec![1.0]]);
        assert!(matches!(f.pipeline.add(&f.collection, empty_id), Err(Error::Validation(_))));

        let nan = RecordBatch::new(ids(&["a"]), vec![vec![f32::NAN]]);
        assert!(matches!(f.pipeline.add(&f.collection, nan), Err(Error::Validation(_))));

        let ragged = RecordBatch::new(ids(&["a", "b"]), vec![vec![1.0], vec![1.0, 2.0]]);
        assert!(matches!(
            f.pipeline.add(&f.collection, ragged),
            Err(Error::InvalidDimension { .. })
        ));

        let nested = RecordBatch::new(ids(&["a"]), vec![vec![1.0]]).with_metadatas(vec![meta(json!({"k": [1, 2]}))]);
        assert!(matches!(f.pipeline.add(&f.collection, nested), Err(Error::Validation(_))));

        assert!(matches!(
            f.pipeline.add(&f.collection, RecordBatch::for_ids(ids(&["a"]))),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            f.pipeline.add(&f.collection, RecordBatch::default()),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(f.stores.vectors.count(f.collection.id).unwrap(), 0);
    }

    #[test]
    fn test_upsert_replaces_in_resident_index() {
        let f = fixture();
        f.pipeline.add(&f.collection, axis_batch()).unwrap();
        let index = f
            .cache
            .get_or_load(f.collection.id, || {
                let mut index = HnswIndex::new(3, HnswParams::default());
                for (id, v) in f.stores.vectors.scan(f.collection.id)? {
                    index.insert(&id, v.as_slice())?;
                }
                Ok(index)
            })
            .unwrap();

        let batch = RecordBatch::new(ids(&["a"]), vec![vec![0.0, 0.0, 5.0]])
            .with_documents(vec![Some("moved".to_string())]);
        f.pipeline.upsert(&f.collection, batch).unwrap();

        let hits = index.read().search(&[0.0, 0.0, 5.0], 1).unwrap();
        assert_eq!(hits[0].id, "a");
        assert_eq!(index.read().len(), 3);

        let meta = f.stores.metadata.get_records(f.collection.id, &ids(&["a"])).unwrap();
        assert_eq!(meta[0].as_ref().unwrap().document.as_deref(), Some("moved"));
        assert_eq!(meta[0].as_ref().unwrap().metadata, None);
    }

    #[test]
    fn test_update_merges_metadata_and_skips_missing() {
        let f = fixture();
        let batch = RecordBatch::new(ids(&["a"]), vec![vec![1.0, 0.0, 0.0]])
            .with_metadatas(vec![meta(json!({"keep": 1, "drop": "x"}))])
            .with_documents(vec![Some("doc".to_string())]);
        f.pipeline.add(&f.collection, batch).unwrap();

        let update = RecordBatch::for_ids(ids(&["a", "ghost"]))
            .with_metadatas(vec![meta(json!({"drop": null, "new": true})), meta(json!({"x": 1}))]);
        assert_eq!(f.pipeline.update(&f.collection, update).unwrap(), 1);

        let stored = f.stores.metadata.get_records(f.collection.id, &ids(&["a", "ghost"])).unwrap();
        let a = stored[0].as_ref().unwrap();
        assert_eq!(a.metadata, meta(json!({"keep": 1, "new": true})));
        assert_eq!(a.document.as_deref(), Some("doc"));
        assert!(stored[1].is_none());
    }

    #[test]
    fn test_update_checks_dimension() {
        let f = fixture();
        f.pipeline.add(&f.collection, axis_batch()).unwrap();
        let update = RecordBatch::for_ids(ids(&["a"])).with_embeddings(vec![vec![1.0]]);
        assert!(matches!(
            f.pipeline.update(&f.collection, update),
            Err(Error::InvalidDimension { .. })
        ));
    }

    #[test]
    fn test_delete_by_ids_and_filter() {
        let f = fixture();
        let batch = axis_batch().with_metadatas(vec![
            meta(json!({"group": 1})),
            meta(json!({"group": 2})),
            meta(json!({"group": 1})),
        ]);
        f.pipeline.add(&f.collection, batch).unwrap();

        assert!(matches!(
            f.pipeline.delete(&f.collection, None, None),
            Err(Error::InvalidArgument(_))
        ));

        let filter = RecordFilter::parse(Some(r#"{"group": 1}"#), None).unwrap().unwrap();
        let only_a = ids(&["a", "b"]);
        assert_eq!(f.pipeline.delete(&f.collection, Some(only_a.as_slice()), Some(&filter)).unwrap(), 1);
        assert_eq!(f.stores.vectors.ids(f.collection.id).unwrap(), ids(&["b", "c"]));

        assert_eq!(f.pipeline.delete(&f.collection, None, Some(&filter)).unwrap(), 1);
        assert_eq!(f.pipeline.delete(&f.collection, Some(ids(&["b", "b", "zz"]).as_slice()), None).unwrap(), 1);
        assert_eq!(f.stores.vectors.count(f.collection.id).unwrap(), 0);
    }

    #[test]
    fn test_batch_from_records() {
        let records = vec![
            Record::new("a", Vector::new(vec![1.0, 2.0])).with_document("first"),
            Record::new("b", Vector::new(vec![3.0, 4.0])).with_metadata(meta(json!({"k": 1})).unwrap()),
        ];
        let batch = RecordBatch::from_records(records);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.embeddings, Some(vec![vec![1.0, 2.0], vec![3.0, 4.0]]));
        assert_eq!(batch.documents, Some(vec![Some("first".to_string()), None]));
        assert!(batch.validate(false).is_ok());
    }

    #[test]
    fn test_write_to_deleted_collection() {
        let f = fixture();
        f.stores.metadata.delete_collection(f.collection.id).unwrap();
        assert!(matches!(
            f.pipeline.add(&f.collection, axis_batch()),
            Err(Error::CollectionNotFound(_))
        ));
    }

    struct RejectingWriter;

    impl RecordWriter for RejectingWriter {
        fn commit(&self, _collection: Uuid, _write: &WriteSet<'_>) -> Result<usize> {
            Err(Error::Storage("map full".to_string()))
        }
    }

    #[test]
    fn test_failed_commit_changes_nothing() {
        let memory = Stores::in_memory();
        let stores = Stores::new(memory.vectors.clone(), memory.metadata.clone(), Arc::new(RejectingWriter));
        let cache = Arc::new(IndexCache::new(4).unwrap());
        let collection = Collection::new("docs", "t", "db", CollectionConfig::default(), None);
        stores.metadata.create_collection(&collection).unwrap();
        let pipeline = WritePipeline::new(stores.clone(), cache.clone(), Arc::new(CollectionLocks::new()));
        let index = cache
            .get_or_load(collection.id, || Ok(HnswIndex::new(3, HnswParams::default())))
            .unwrap();

        assert!(matches!(pipeline.add(&collection, axis_batch()), Err(Error::Storage(_))));
        assert_eq!(stores.vectors.count(collection.id).unwrap(), 0);
        assert_eq!(stores.current_collection(&collection).unwrap().dimension, None);
        assert!(index.read().is_empty());
    }

    #[test]
    fn test_id_length_limit() {
        let f = fixture();
        let long = "x".repeat(MAX_ID_BYTES + 1);
        let batch = RecordBatch::new(vec![long.clone()], vec![vec![1.0]]);
        assert!(matches!(f.pipeline.add(&f.collection, batch), Err(Error::Validation(_))));

        let longest = "x".repeat(MAX_ID_BYTES);
        f.pipeline
            .add(&f.collection, RecordBatch::new(vec![longest.clone()], vec![vec![1.0]]))
            .unwrap();
        // over-long ids cannot exist, so deleting one is a no-op
        assert_eq!(f.pipeline.delete(&f.collection, Some(&[long][..]), None).unwrap(), 0);
        assert_eq!(f.pipeline.delete(&f.collection, Some(&[longest][..]), None).unwrap(), 1);
    }
}
