use crate::error::{Error, Result};
use crate::hnsw::HnswIndex;
use ahash::AHashMap;
use lru::LruCache;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub type SharedIndex = Arc<RwLock<HnswIndex>>;

/// One cache entry. The index is built at most once per slot; concurrent
/// loaders of the same slot block on the first builder.
struct IndexSlot {
    cell: OnceCell<SharedIndex>,
}

/// Bounded LRU of loaded indices keyed by collection id.
///
/// The LRU bookkeeping sits behind its own mutex, held only while the order
/// is touched; builds run outside it. An evicted index is simply dropped,
/// since it can always be replayed from the vector store.
pub struct IndexCache {
    capacity: NonZeroUsize,
    slots: Mutex<LruCache<Uuid, Arc<IndexSlot>>>,
    builds: AtomicU64,
}

impl IndexCache {
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| Error::InvalidArgument("hnsw cache size must be at least 1".to_string()))?;
        Ok(Self {
            capacity,
            slots: Mutex::new(LruCache::new(capacity)),
            builds: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Number of resident slots
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many indices have been constructed over the cache's lifetime
    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    /// Whether `collection` holds a slot, without touching recency
    pub fn contains(&self, collection: Uuid) -> bool {
        self.slots.lock().contains(&collection)
    }

    /// Fetch the index for `collection`, marking it most recently used.
    /// On a miss `build` replays the collection; a failed build gives its
    /// slot back so it holds no capacity and the next caller retries.
    pub fn get_or_load<F>(&self, collection: Uuid, build: F) -> Result<SharedIndex>
    where
        F: FnOnce() -> Result<HnswIndex>,
    {
        let slot = {
            let mut slots = self.slots.lock();
            match slots.get(&collection) {
                Some(slot) => slot.clone(),
                None => {
                    let slot = Arc::new(IndexSlot {
                        cell: OnceCell::new(),
                    });
                    if let Some((evicted, _)) = slots.push(collection, slot.clone()) {
                        debug!(%evicted, capacity = self.capacity.get(), "evicted index from cache");
                    }
                    slot
                }
            }
        };

        let built = slot.cell.get_or_try_init(|| {
            self.builds.fetch_add(1, Ordering::Relaxed);
            let index = build()?;
            debug!(%collection, points = index.len(), "built index");
            Ok::<_, Error>(Arc::new(RwLock::new(index)))
        });
        match built {
            Ok(index) => Ok(index.clone()),
            Err(e) => {
                let mut slots = self.slots.lock();
                let ours = slots
                    .peek(&collection)
                    .is_some_and(|s| Arc::ptr_eq(s, &slot) && s.cell.get().is_none());
                if ours {
                    slots.pop(&collection);
                }
                Err(e)
            }
        }
    }

    /// The index for `collection` if it is loaded. Does not affect recency
    /// and never triggers a build.
    pub fn resident(&self, collection: Uuid) -> Option<SharedIndex> {
        self.slots
            .lock()
            .peek(&collection)
            .and_then(|slot| slot.cell.get().cloned())
    }

    pub fn invalidate(&self, collection: Uuid) -> bool {
        self.slots.lock().pop(&collection).is_some()
    }

    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}

/// Per-collection reader/writer locks guarding the index mutation path.
/// parking_lot's RwLock is fair, so a queued writer is not starved by a
/// stream of readers.
#[derive(Default)]
pub struct CollectionLocks {
    locks: Mutex<AHashMap<Uuid, Arc<RwLock<()>>>>,
}

impl CollectionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, collection: Uuid) -> Arc<RwLock<()>> {
        self.locks.lock().entry(collection).or_default().clone()
    }

    pub fn remove(&self, collection: Uuid) {
        self.locks.lock().remove(&collection);
    }

    pub fn clear(&self) {
        self.locks.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::HnswParams;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn empty_index() -> Result<HnswIndex> {
        Ok(HnswIndex::new(2, HnswParams::default()))
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(IndexCache::new(0), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = IndexCache::new(2).unwrap();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        cache.get_or_load(a, empty_index).unwrap();
        cache.get_or_load(b, empty_index).unwrap();
        // touch a so b becomes least recently used
        cache.get_or_load(a, empty_index).unwrap();
        cache.get_or_load(c, empty_index).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(a));
        assert!(!cache.contains(b));
        assert!(cache.contains(c));
        assert_eq!(cache.builds(), 3);
    }

    #[test]
    fn test_resident_does_not_build_or_promote() {
        let cache = IndexCache::new(2).unwrap();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert!(cache.resident(a).is_none());
        assert_eq!(cache.builds(), 0);

        cache.get_or_load(a, empty_index).unwrap();
        cache.get_or_load(b, empty_index).unwrap();
        assert!(cache.resident(a).is_some());
        cache.get_or_load(c, empty_index).unwrap();
        assert!(!cache.contains(a));
    }

    #[test]
    fn test_failed_build_is_retried() {
        let cache = IndexCache::new(1).unwrap();
        let a = Uuid::new_v4();
        let err = cache.get_or_load(a, || Err(Error::Storage("boom".into())));
        assert!(err.is_err());
        assert!(cache.resident(a).is_none());
        cache.get_or_load(a, empty_index).unwrap();
        assert!(cache.resident(a).is_some());
    }

    #[test]
    fn test_failed_build_releases_its_slot() {
        let cache = IndexCache::new(2).unwrap();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        cache.get_or_load(b, empty_index).unwrap();

        assert!(cache.get_or_load(a, || Err(Error::Storage("boom".into()))).is_err());
        assert!(!cache.contains(a));
        assert_eq!(cache.len(), 1);

        // the failed slot must not push b out
        cache.get_or_load(c, empty_index).unwrap();
        assert!(cache.contains(b));
        assert!(cache.contains(c));
    }

    #[test]
    fn test_concurrent_miss_builds_once() {
        let cache = Arc::new(IndexCache::new(4).unwrap());
        let id = Uuid::new_v4();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get_or_load(id, || {
                            thread::sleep(Duration::from_millis(20));
                            empty_index()
                        })
                        .unwrap()
                })
            })
            .collect();

        let indices: Vec<SharedIndex> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(cache.builds(), 1);
        assert_eq!(cache.len(), 1);
        assert!(indices.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn test_invalidate() {
        let cache = IndexCache::new(2).unwrap();
        let a = Uuid::new_v4();
        cache.get_or_load(a, empty_index).unwrap();
        assert!(cache.invalidate(a));
        assert!(!cache.invalidate(a));
        cache.get_or_load(a, empty_index).unwrap();
        assert_eq!(cache.builds(), 2);
    }

    #[test]
    fn test_collection_locks_are_shared_per_id() {
        let locks = CollectionLocks::new();
        let id = Uuid::new_v4();
        assert!(Arc::ptr_eq(&locks.lock_for(id), &locks.lock_for(id)));
        assert!(!Arc::ptr_eq(&locks.lock_for(id), &locks.lock_for(Uuid::new_v4())));
    }
}
