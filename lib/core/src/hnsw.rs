use crate::collection::{HnswParams, Space};
use crate::error::{Error, Result};
use ahash::AHashMap;
use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use smallvec::SmallVec;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tracing::debug;

/// Hard cap on the number of graph layers
const MAX_LEVEL: usize = 16;

/// Exhaustive scans switch to rayon above this many nodes
const PARALLEL_SCAN_THRESHOLD: usize = 4096;

type Links = SmallVec<[u32; 32]>;

/// Bit set of node indices touched during one graph walk
struct VisitedSet {
    bits: Vec<u64>,
}

impl VisitedSet {
    #[inline]
    fn new(capacity: usize) -> Self {
        Self {
            bits: vec![0; capacity.div_ceil(64)],
        }
    }

    /// Returns true if `idx` was not yet visited
    #[inline]
    fn insert(&mut self, idx: u32) -> bool {
        let word = idx as usize / 64;
        let mask = 1u64 << (idx % 64);
        if word >= self.bits.len() {
            self.bits.resize(word + 1, 0);
        }
        let fresh = self.bits[word] & mask == 0;
        self.bits[word] |= mask;
        fresh
    }
}

/// Ordered by distance, then by insertion index so ties resolve the same
/// way on every run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Candidate {
    dist: OrderedFloat<f32>,
    idx: u32,
}

impl Candidate {
    #[inline]
    fn new(idx: u32, dist: f32) -> Self {
        Self {
            dist: OrderedFloat(dist),
            idx,
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    id: String,
    /// Adjacency per layer; `links.len() - 1` is the node's level
    links: Vec<Links>,
    deleted: bool,
}

/// A search hit
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: String,
    pub distance: f32,
}

/// Hierarchical navigable small world graph over one collection's embeddings.
///
/// Nodes are appended in insertion order and vectors live in one contiguous
/// buffer. Removal leaves a tombstone that keeps the graph navigable; once
/// tombstones outnumber live nodes the graph is rebuilt from the survivors.
pub struct HnswIndex {
    params: HnswParams,
    dim: usize,
    nodes: Vec<Node>,
    vectors: Vec<f32>,
    id_to_index: AHashMap<String, u32>,
    entry_point: Option<u32>,
    max_level: usize,
    deleted: usize,
    rng: StdRng,
    level_mult: f64,
}

impl HnswIndex {
    pub fn new(dim: usize, params: HnswParams) -> Self {
        Self {
            params,
            dim,
            nodes: Vec::new(),
            vectors: Vec::new(),
            id_to_index: AHashMap::new(),
            entry_point: None,
            max_level: 0,
            deleted: 0,
            rng: StdRng::seed_from_u64(params.seed),
            level_mult: 1.0 / (params.max_neighbors.max(2) as f64).ln(),
        }
    }

    /// Number of live (non-deleted) points
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.id_to_index.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.id_to_index.is_empty()
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline]
    pub fn space(&self) -> Space {
        self.params.space
    }

    #[inline]
    pub fn contains(&self, id: &str) -> bool {
        self.id_to_index.contains_key(id)
    }

    #[inline]
    fn vector(&self, idx: u32) -> &[f32] {
        let start = idx as usize * self.dim;
        &self.vectors[start..start + self.dim]
    }

    #[inline]
    fn distance_to(&self, query: &[f32], idx: u32) -> f32 {
        self.params.space.distance(query, self.vector(idx))
    }

    #[inline]
    fn max_links(&self, level: usize) -> usize {
        if level == 0 {
            self.params.max_neighbors * 2
        } else {
            self.params.max_neighbors
        }
    }

    fn random_level(&mut self) -> usize {
        let u: f64 = self.rng.random::<f64>();
        let level = (-(1.0 - u).ln() * self.level_mult).floor() as usize;
        level.min(MAX_LEVEL)
    }

    fn prepare(&self, vector: &[f32]) -> Vec<f32> {
        let mut v = vector.to_vec();
        if self.params.space.normalizes() {
            let norm = crate::simd::norm_simd(&v);
            if norm > f32::EPSILON {
                v.iter_mut().for_each(|x| *x /= norm);
            }
        }
        v
    }

    /// Insert or replace the point stored under `id`
    pub fn insert(&mut self, id: &str, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dim {
            return Err(Error::InvalidDimension {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        if self.id_to_index.contains_key(id) {
            self.remove(id);
        }
        let prepared = self.prepare(vector);
        self.insert_prepared(id.to_string(), prepared);
        Ok(())
    }

    fn insert_prepared(&mut self, id: String, vector: Vec<f32>) {
        let level = self.random_level();
        let idx = self.nodes.len() as u32;

        self.vectors.extend_from_slice(&vector);
        self.nodes.push(Node {
            id: id.clone(),
            links: vec![Links::new(); level + 1],
            deleted: false,
        });
        self.id_to_index.insert(id, idx);

        let Some(entry) = self.entry_point else {
            self.entry_point = Some(idx);
            self.max_level = level;
            return;
        };

        let mut closest = Candidate::new(entry, self.distance_to(&vector, entry));
        for lc in (level + 1..=self.max_level).rev() {
            closest = self.greedy_closest(&vector, closest, lc);
        }

        let mut entries = vec![closest];
        for lc in (0..=level.min(self.max_level)).rev() {
            let found = self.search_layer(&vector, &entries, self.params.ef_construction, lc);
            let neighbors = self.select_neighbors(&found, self.params.max_neighbors);
            for &n in &neighbors {
                self.connect(n, idx, lc);
            }
            self.nodes[idx as usize].links[lc] = neighbors;
            entries = found;
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(idx);
        }
    }

    /// Add the edge `from -> to` on `level`, pruning `from`'s list if it
    /// overflows.
    fn connect(&mut self, from: u32, to: u32, level: usize) {
        let max_links = self.max_links(level);
        {
            let links = &mut self.nodes[from as usize].links[level];
            if links.contains(&to) {
                return;
            }
            links.push(to);
            if links.len() <= max_links {
                return;
            }
        }

        let base = self.vector(from);
        let mut candidates: Vec<Candidate> = self.nodes[from as usize].links[level]
            .iter()
            .map(|&n| Candidate::new(n, self.params.space.distance(base, self.vector(n))))
            .collect();
        candidates.sort_unstable();
        let pruned = self.select_neighbors(&candidates, max_links);
        self.nodes[from as usize].links[level] = pruned;
    }

    /// Diversity heuristic: keep a candidate only if it is closer to the
    /// base than to every neighbor already kept, then top up with the
    /// nearest rejects. `candidates` must be sorted ascending.
    fn select_neighbors(&self, candidates: &[Candidate], m: usize) -> Links {
        let mut selected = Links::new();
        let mut rejected: SmallVec<[u32; 32]> = SmallVec::new();

        for c in candidates {
            if selected.len() >= m {
                break;
            }
            let diverse = selected.iter().all(|&s| {
                self.params.space.distance(self.vector(c.idx), self.vector(s)) > c.dist.0
            });
            if diverse {
                selected.push(c.idx);
            } else {
                rejected.push(c.idx);
            }
        }
        for idx in rejected {
            if selected.len() >= m {
                break;
            }
            selected.push(idx);
        }
        selected
    }

    fn greedy_closest(&self, query: &[f32], start: Candidate, level: usize) -> Candidate {
        let mut best = start;
        let mut changed = true;
        while changed {
            changed = false;
            let node = &self.nodes[best.idx as usize];
            if level >= node.links.len() {
                break;
            }
            for &n in &node.links[level] {
                let c = Candidate::new(n, self.distance_to(query, n));
                if c < best {
                    best = c;
                    changed = true;
                }
            }
        }
        best
    }

    /// Best-first walk of one layer. Returns up to `ef` candidates sorted
    /// ascending; tombstoned nodes are included so callers can route through
    /// them.
    fn search_layer(&self, query: &[f32], entries: &[Candidate], ef: usize, level: usize) -> Vec<Candidate> {
        let mut visited = VisitedSet::new(self.nodes.len());
        // ef may exceed the graph; never reserve more than it can hold
        let cap = ef.min(self.nodes.len());
        let mut frontier: BinaryHeap<Reverse<Candidate>> = BinaryHeap::with_capacity(cap * 2);
        let mut results: BinaryHeap<Candidate> = BinaryHeap::with_capacity(cap + 1);

        for &e in entries {
            if visited.insert(e.idx) {
                frontier.push(Reverse(e));
                results.push(e);
            }
        }
        while results.len() > ef {
            results.pop();
        }

        while let Some(Reverse(current)) = frontier.pop() {
            if let Some(worst) = results.peek() {
                if results.len() >= ef && current.dist > worst.dist {
                    break;
                }
            }

            let node = &self.nodes[current.idx as usize];
            if level >= node.links.len() {
                continue;
            }
            for &n in &node.links[level] {
                if !visited.insert(n) {
                    continue;
                }
                let c = Candidate::new(n, self.distance_to(query, n));
                let admit = results.len() < ef || results.peek().map(|w| c < *w).unwrap_or(true);
                if admit {
                    frontier.push(Reverse(c));
                    results.push(c);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        results.into_sorted_vec()
    }

    fn exhaustive(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        let score = |idx: usize| -> Option<Candidate> {
            let node = &self.nodes[idx];
            (!node.deleted).then(|| Candidate::new(idx as u32, self.distance_to(query, idx as u32)))
        };
        let mut all: Vec<Candidate> = if self.nodes.len() >= PARALLEL_SCAN_THRESHOLD {
            (0..self.nodes.len()).into_par_iter().filter_map(score).collect()
        } else {
            (0..self.nodes.len()).filter_map(score).collect()
        };
        all.sort_unstable();
        all.truncate(k);
        self.to_neighbors(&all)
    }

    fn to_neighbors(&self, candidates: &[Candidate]) -> Vec<Neighbor> {
        candidates
            .iter()
            .map(|c| Neighbor {
                id: self.nodes[c.idx as usize].id.clone(),
                distance: c.dist.0,
            })
            .collect()
    }

    /// k nearest neighbors with the configured `ef_search`
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.search_with_ef(query, k, self.params.ef_search)
    }

    /// k nearest neighbors, ascending by distance. Returns every live point
    /// when `k` reaches the index size and an empty list for an empty index.
    pub fn search_with_ef(&self, query: &[f32], k: usize, ef: usize) -> Result<Vec<Neighbor>> {
        if query.len() != self.dim {
            return Err(Error::InvalidDimension {
                expected: self.dim,
                actual: query.len(),
            });
        }
        let live = self.len();
        if k == 0 || live == 0 {
            return Ok(Vec::new());
        }

        let query = self.prepare(query);
        if k >= live {
            return Ok(self.exhaustive(&query, k));
        }

        let entry = self
            .entry_point
            .filter(|&e| (e as usize) < self.nodes.len())
            .ok_or_else(|| Error::Internal("index holds live points but has no valid entry point".to_string()))?;

        let mut closest = Candidate::new(entry, self.distance_to(&query, entry));
        for lc in (1..=self.max_level).rev() {
            closest = self.greedy_closest(&query, closest, lc);
        }

        let found = self.search_layer(&query, &[closest], ef.max(k), 0);
        let hits: Vec<Candidate> = found
            .into_iter()
            .filter(|c| !self.nodes[c.idx as usize].deleted)
            .take(k)
            .collect();

        if hits.len() < k {
            debug!(found = hits.len(), k, live, "graph walk came up short, scanning exhaustively");
            return Ok(self.exhaustive(&query, k));
        }
        Ok(self.to_neighbors(&hits))
    }

    /// Tombstone `id`. Unknown ids are a no-op and return false.
    pub fn remove(&mut self, id: &str) -> bool {
        let Some(idx) = self.id_to_index.remove(id) else {
            return false;
        };
        self.nodes[idx as usize].deleted = true;
        self.deleted += 1;

        if self.deleted * 2 > self.nodes.len() {
            self.compact();
        }
        true
    }

    /// Rebuild the graph from live nodes in insertion order
    fn compact(&mut self) {
        let survivors: Vec<(String, Vec<f32>)> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| !node.deleted)
            .map(|(idx, node)| (node.id.clone(), self.vector(idx as u32).to_vec()))
            .collect();

        debug!(
            live = survivors.len(),
            tombstones = self.deleted,
            "compacting hnsw graph"
        );

        *self = HnswIndex::new(self.dim, self.params);
        for (id, vector) in survivors {
            self.insert_prepared(id, vector);
        }
    }

    /// Verify the structural invariants the search relies on
    pub fn check_integrity(&self) -> Result<()> {
        let broken = |msg: String| Err(Error::Internal(format!("hnsw invariant violated: {}", msg)));

        if self.vectors.len() != self.nodes.len() * self.dim {
            return broken(format!(
                "{} floats stored for {} nodes of dimension {}",
                self.vectors.len(),
                self.nodes.len(),
                self.dim
            ));
        }
        match self.entry_point {
            None if !self.nodes.is_empty() => return broken("missing entry point".to_string()),
            Some(e) if e as usize >= self.nodes.len() => return broken(format!("entry point {} out of range", e)),
            Some(e) if self.nodes[e as usize].links.len() != self.max_level + 1 => {
                return broken("entry point is not on the top layer".to_string())
            }
            _ => {}
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            if node.links.is_empty() {
                return broken(format!("node {} has no layers", idx));
            }
            for (level, links) in node.links.iter().enumerate() {
                for &n in links {
                    let Some(target) = self.nodes.get(n as usize) else {
                        return broken(format!("node {} links to missing node {}", idx, n));
                    };
                    if n as usize == idx {
                        return broken(format!("node {} links to itself", idx));
                    }
                    if target.links.len() <= level {
                        return broken(format!("node {} links to {} above its level", idx, n));
                    }
                }
            }
        }
        let live = self.nodes.iter().filter(|n| !n.deleted).count();
        if live != self.id_to_index.len() || live + self.deleted != self.nodes.len() {
            return broken("live node bookkeeping out of sync".to_string());
        }
        for (id, &idx) in &self.id_to_index {
            match self.nodes.get(idx as usize) {
                Some(node) if node.id == *id && !node.deleted => {}
                _ => return broken(format!("id map entry '{}' is stale", id)),
            }
        }
        Ok(())
    }
}
