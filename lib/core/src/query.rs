use crate::cache::{CollectionLocks, IndexCache, SharedIndex};
use crate::collection::Collection;
use crate::error::{Error, Result};
use crate::filter::{Filter, RecordFilter};
use crate::hnsw::{HnswIndex, Neighbor};
use crate::record::{Include, Metadata, RecordMeta, MAX_ID_BYTES};
use crate::store::{Stores, VectorStore};
use crate::vector::Vector;
use ahash::{AHashMap, AHashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Tuning for filtered searches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryConfig {
    /// Candidates fetched per requested result, multiplied again each round
    pub overfetch_factor: usize,
    pub max_rounds: usize,
    /// Wall-clock budget after which no further round starts
    pub round_budget: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            overfetch_factor: 4,
            max_rounds: 4,
            round_budget: Duration::from_secs(2),
        }
    }
}

impl QueryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.overfetch_factor < 2 {
            return Err(Error::InvalidArgument("overfetch_factor must be at least 2".to_string()));
        }
        if self.max_rounds == 0 {
            return Err(Error::InvalidArgument("max_rounds must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub embedding: Vec<f32>,
    pub k: usize,
    pub filter: Option<RecordFilter>,
    pub include: Include,
}

impl QueryRequest {
    pub fn new(embedding: Vec<f32>, k: usize) -> Self {
        Self {
            embedding,
            k,
            filter: None,
            include: Include {
                distances: true,
                ..Include::NONE
            },
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Option<RecordFilter>) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn with_include(mut self, include: Include) -> Self {
        self.include = include;
        self
    }
}

/// Listing request; `ids` and `filter` intersect when both are given
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetRequest {
    pub ids: Option<Vec<String>>,
    pub filter: Option<RecordFilter>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub include: Include,
}

/// Parallel arrays of a read. Arrays for fields that were not requested are
/// `None`; requested ones line up with `ids`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub ids: Vec<String>,
    pub distances: Option<Vec<f32>>,
    pub embeddings: Option<Vec<Vector>>,
    pub metadatas: Option<Vec<Option<Metadata>>>,
    pub documents: Option<Vec<Option<String>>>,
}

impl QueryResult {
    fn empty(include: Include) -> Self {
        Self {
            ids: Vec::new(),
            distances: include.distances.then(Vec::new),
            embeddings: include.embeddings.then(Vec::new),
            metadatas: include.metadatas.then(Vec::new),
            documents: include.documents.then(Vec::new),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Data already read while selecting candidates, reused during hydration
#[derive(Default)]
struct Prefetched {
    metas: AHashMap<String, RecordMeta>,
    vectors: AHashMap<String, Vector>,
}

/// Replay a collection's stored embeddings into a fresh index
pub fn build_index(collection: &Collection, dim: usize, vectors: &dyn VectorStore) -> Result<HnswIndex> {
    let started = Instant::now();
    let rows = vectors.scan(collection.id)?;
    let mut index = HnswIndex::new(dim, collection.config.hnsw);
    for (id, vector) in &rows {
        index.insert(id, vector.as_slice()).map_err(|e| {
            Error::Internal(format!(
                "stored embedding '{}' in {} cannot be indexed: {}",
                id,
                collection.qualified_name(),
                e
            ))
        })?;
    }
    index.check_integrity()?;
    debug!(
        collection = %collection.qualified_name(),
        points = rows.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "replayed collection into index"
    );
    Ok(index)
}

/// Runs similarity queries and filtered listings over a collection
pub struct QueryExecutor {
    stores: Stores,
    cache: Arc<IndexCache>,
    locks: Arc<CollectionLocks>,
    config: QueryConfig,
}

impl QueryExecutor {
    pub fn new(stores: Stores, cache: Arc<IndexCache>, locks: Arc<CollectionLocks>, config: QueryConfig) -> Self {
        Self {
            stores,
            cache,
            locks,
            config,
        }
    }

    #[inline]
    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// k nearest records to `request.embedding` that satisfy the filter,
    /// ascending by distance.
    pub fn query(&self, collection: &Collection, request: &QueryRequest) -> Result<QueryResult> {
        if request.k == 0 {
            return Err(Error::InvalidArgument("n_results must be at least 1".to_string()));
        }
        if request.embedding.is_empty() || request.embedding.iter().any(|x| !x.is_finite()) {
            return Err(Error::Validation(
                "query embedding must be non-empty and finite".to_string(),
            ));
        }

        let (current, index) = {
            let lock = self.locks.lock_for(collection.id);
            let _guard = lock.read();

            let current = self.stores.current_collection(collection)?;
            let Some(dim) = current.dimension else {
                return Ok(QueryResult::empty(request.include));
            };
            if request.embedding.len() != dim {
                return Err(Error::InvalidDimension {
                    expected: dim,
                    actual: request.embedding.len(),
                });
            }
            let index = self
                .cache
                .get_or_load(current.id, || build_index(&current, dim, self.stores.vectors.as_ref()))?;
            (current, index)
        };

        let (hits, prefetched) = match &request.filter {
            None => (index.read().search(&request.embedding, request.k)?, Prefetched::default()),
            Some(filter) => self.filtered_search(&current, &index, &request.embedding, request.k, filter)?,
        };

        let (ids, distances): (Vec<String>, Vec<f32>) = hits.into_iter().map(|n| (n.id, n.distance)).unzip();
        self.hydrate(current.id, ids, Some(distances), request.include, prefetched)
    }

    /// Over-fetch from the index and post-filter, widening the candidate
    /// count each round until k matches are found, the index is exhausted,
    /// or the round cap or time budget is reached.
    fn filtered_search(
        &self,
        collection: &Collection,
        index: &SharedIndex,
        query: &[f32],
        k: usize,
        filter: &RecordFilter,
    ) -> Result<(Vec<Neighbor>, Prefetched)> {
        let started = Instant::now();
        let mut prefetched = Prefetched::default();
        let mut evaluated: AHashSet<String> = AHashSet::new();
        let mut matched: Vec<Neighbor> = Vec::new();
        let mut fetch = k.saturating_mul(self.config.overfetch_factor);
        let mut exhausted = false;
        let mut rounds = 0;

        while rounds < self.config.max_rounds {
            rounds += 1;
            let (hits, live) = {
                let index = index.read();
                (index.search(query, fetch)?, index.len())
            };
            exhausted = fetch >= live;

            let fresh: Vec<Neighbor> = hits.into_iter().filter(|n| evaluated.insert(n.id.clone())).collect();
            let fresh_ids: Vec<String> = fresh.iter().map(|n| n.id.clone()).collect();
            let metas = self.stores.metadata.get_records(collection.id, &fresh_ids)?;

            for (neighbor, meta) in fresh.into_iter().zip(metas) {
                let meta = meta.unwrap_or_default();
                if filter.matches(&meta) {
                    prefetched.metas.insert(neighbor.id.clone(), meta);
                    matched.push(neighbor);
                }
            }

            if matched.len() >= k || exhausted {
                break;
            }
            if started.elapsed() >= self.config.round_budget {
                warn!(
                    collection = %collection.qualified_name(),
                    rounds,
                    matched = matched.len(),
                    k,
                    "filtered query hit its time budget"
                );
                break;
            }
            fetch = fetch.saturating_mul(self.config.overfetch_factor);
        }

        if matched.len() < k && !exhausted {
            warn!(
                collection = %collection.qualified_name(),
                rounds,
                matched = matched.len(),
                k,
                "filtered query returned fewer results than requested"
            );
        }

        matched.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        matched.truncate(k);
        Ok((matched, prefetched))
    }

    /// Records selected by ids and/or filter, in insertion order (or
    /// requested-id order), after offset and limit.
    pub fn get(&self, collection: &Collection, request: &GetRequest) -> Result<QueryResult> {
        let current = self.stores.current_collection(collection)?;
        let mut prefetched = Prefetched::default();

        let mut ids: Vec<String> = match &request.ids {
            Some(requested) => {
                let mut seen = AHashSet::with_capacity(requested.len());
                let unique: Vec<String> = requested
                    .iter()
                    .filter(|id| id.len() <= MAX_ID_BYTES && seen.insert(id.as_str()))
                    .cloned()
                    .collect();
                let stored = self.stores.vectors.get(current.id, &unique)?;
                unique
                    .into_iter()
                    .zip(stored)
                    .filter_map(|(id, vector)| {
                        let vector = vector?;
                        if request.include.embeddings {
                            prefetched.vectors.insert(id.clone(), vector);
                        }
                        Some(id)
                    })
                    .collect()
            }
            None => self.stores.vectors.ids(current.id)?,
        };

        if let Some(filter) = &request.filter {
            let metas = self.stores.metadata.get_records(current.id, &ids)?;
            ids = ids
                .into_iter()
                .zip(metas)
                .filter_map(|(id, meta)| {
                    let meta = meta.unwrap_or_default();
                    if !filter.matches(&meta) {
                        return None;
                    }
                    prefetched.metas.insert(id.clone(), meta);
                    Some(id)
                })
                .collect();
        }

        let ids: Vec<String> = ids
            .into_iter()
            .skip(request.offset)
            .take(request.limit.unwrap_or(usize::MAX))
            .collect();
        let include = Include {
            distances: false,
            ..request.include
        };
        self.hydrate(current.id, ids, None, include, prefetched)
    }

    pub fn count(&self, collection: &Collection) -> Result<usize> {
        let current = self.stores.current_collection(collection)?;
        self.stores.vectors.count(current.id)
    }

    /// Fill in the requested fields. Unrequested fields are never read.
    /// Records that vanished since selection are dropped.
    fn hydrate(
        &self,
        collection: Uuid,
        mut ids: Vec<String>,
        mut distances: Option<Vec<f32>>,
        include: Include,
        mut prefetched: Prefetched,
    ) -> Result<QueryResult> {
        let mut embeddings = None;
        if include.embeddings {
            let missing: Vec<String> = ids
                .iter()
                .filter(|id| !prefetched.vectors.contains_key(*id))
                .cloned()
                .collect();
            if !missing.is_empty() {
                let fetched = self.stores.vectors.get(collection, &missing)?;
                for (id, vector) in missing.into_iter().zip(fetched) {
                    if let Some(vector) = vector {
                        prefetched.vectors.insert(id, vector);
                    }
                }
            }

            let keep: Vec<bool> = ids.iter().map(|id| prefetched.vectors.contains_key(id)).collect();
            if keep.iter().any(|k| !k) {
                debug!(%collection, "dropping records deleted during the read");
                let mut flags = keep.iter();
                ids.retain(|_| flags.next().copied().unwrap_or(false));
                if let Some(d) = distances.as_mut() {
                    let mut flags = keep.iter();
                    d.retain(|_| flags.next().copied().unwrap_or(false));
                }
            }
            embeddings = Some(
                ids.iter()
                    .filter_map(|id| prefetched.vectors.remove(id))
                    .collect::<Vec<Vector>>(),
            );
        }

        let (mut metadatas, mut documents) = (None, None);
        if include.needs_meta() {
            let missing: Vec<String> = ids
                .iter()
                .filter(|id| !prefetched.metas.contains_key(*id))
                .cloned()
                .collect();
            if !missing.is_empty() {
                let fetched = self.stores.metadata.get_records(collection, &missing)?;
                for (id, meta) in missing.into_iter().zip(fetched) {
                    prefetched.metas.insert(id, meta.unwrap_or_default());
                }
            }
            let metas: Vec<RecordMeta> = ids
                .iter()
                .map(|id| prefetched.metas.remove(id).unwrap_or_default())
                .collect();
            if include.metadatas {
                metadatas = Some(metas.iter().map(|m| m.metadata.clone()).collect());
            }
            if include.documents {
                documents = Some(metas.into_iter().map(|m| m.document).collect());
            }
        }

        Ok(QueryResult {
            ids,
            distances: if include.distances { distances } else { None },
            embeddings,
            metadatas,
            documents,
        })
    }
}
