//! Graph state and the insert/search/delete/resize operations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smallvec::SmallVec;

use crate::error::{ProximaError, Result};
use crate::persistence::streams::{
    read_exact, read_f64, read_i32, read_u32, read_u64, write_all, InputStream, OutputStream,
};
use crate::spaces::DistanceFn;
use crate::storage::Element;
use crate::visited::VisitedPool;

use super::search::{Closest, Furthest};

/// On-disk deleted flag: the most significant bit of the stored label.
const DELETED_MASK: u64 = 1 << 63;

/// Construction parameters for a graph.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GraphOptions {
    /// Target neighbors per node per level; layer 0 holds up to `2M`.
    pub m: usize,
    /// Dynamic candidate list size during construction.
    pub ef_construction: usize,
    /// Seed for the level generator.
    pub seed: u64,
    /// Initial capacity in elements.
    pub capacity: usize,
}

/// Per-level neighbor lists of one node. The node's maximum level is the
/// number of upper lists.
#[derive(Default)]
#[derive(Debug)]
struct Links {
    level0: Vec<u32>,
    upper: Vec<Vec<u32>>,
}

impl Links {
    #[inline]
    fn level(&self) -> usize {
        self.upper.len()
    }

    #[inline]
    fn at(&self, level: usize) -> &Vec<u32> {
        if level == 0 {
            &self.level0
        } else {
            &self.upper[level - 1]
        }
    }

    #[inline]
    fn at_mut(&mut self, level: usize) -> &mut Vec<u32> {
        if level == 0 {
            &mut self.level0
        } else {
            &mut self.upper[level - 1]
        }
    }
}

/// Everything the per-node lock protects: the stored vector and the
/// neighbor lists on all levels.
#[derive(Default)]
#[derive(Debug)]
struct NodeData<E> {
    vector: Vec<E>,
    links: Links,
}

/// One element slot. Slots are pre-allocated up to the capacity and become
/// live only when an insertion publishes them through `current_count`; an
/// unpublished slot is never reachable by traversal.
#[derive(Debug)]
struct Node<E> {
    /// Serializes structural mutation of this element: held for the whole
    /// of an initial insertion's link step and of an overwrite. Traversals
    /// never take it.
    update: Mutex<()>,
    data: RwLock<NodeData<E>>,
    label: AtomicU64,
    deleted: AtomicBool,
}

impl<E: Element> Node<E> {
    fn vacant() -> Self {
        Self {
            update: Mutex::new(()),
            data: RwLock::new(NodeData::default()),
            label: AtomicU64::new(0),
            deleted: AtomicBool::new(false),
        }
    }
}

/// The single node every search starts from. Always at the top level.
#[derive(Debug, Clone, Copy)]
struct EntryPoint {
    node: u32,
    level: usize,
}

/// The HNSW graph.
///
/// Lock order, outermost first: slot array (read for insert/search/delete,
/// write for resize) → label map → the mutated element's own update mutex →
/// entry point → per-node data locks. An operation holds at most one data
/// lock at a time and only ever its own element's update mutex, so no lock
/// cycle can form.
#[derive(Debug)]
pub(crate) struct HierarchicalNsw<E: Element> {
    m: usize,
    /// Neighbor capacity on upper layers.
    max_m: usize,
    /// Neighbor capacity on layer 0.
    max_m0: usize,
    ef_construction: usize,
    /// `1 / ln(M)`, the level sampling multiplier.
    mult: f64,
    storage_dim: usize,
    distance: DistanceFn<E>,
    nodes: RwLock<Vec<Node<E>>>,
    count: AtomicUsize,
    num_deleted: AtomicUsize,
    entry: RwLock<Option<EntryPoint>>,
    labels: RwLock<HashMap<u64, u32>>,
    level_rng: Mutex<StdRng>,
    visited: VisitedPool,
}

impl<E: Element> HierarchicalNsw<E> {
    pub fn new(options: GraphOptions, storage_dim: usize, distance: DistanceFn<E>) -> Self {
        let mut nodes = Vec::new();
        nodes.resize_with(options.capacity, Node::vacant);
        Self {
            m: options.m,
            max_m: options.m,
            max_m0: options.m * 2,
            ef_construction: options.ef_construction,
            mult: 1.0 / (options.m as f64).ln(),
            storage_dim,
            distance,
            nodes: RwLock::new(nodes),
            count: AtomicUsize::new(0),
            num_deleted: AtomicUsize::new(0),
            entry: RwLock::new(None),
            labels: RwLock::new(HashMap::new()),
            level_rng: Mutex::new(StdRng::seed_from_u64(options.seed)),
            visited: VisitedPool::new(),
        }
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn ef_construction(&self) -> usize {
        self.ef_construction
    }

    pub fn storage_dim(&self) -> usize {
        self.storage_dim
    }

    /// Capacity in elements (`max_elements`).
    pub fn capacity(&self) -> usize {
        self.nodes.read().len()
    }

    /// Number of occupied slots, deleted ones included.
    pub fn slot_count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn num_deleted(&self) -> usize {
        self.num_deleted.load(Ordering::Acquire)
    }

    /// Number of non-deleted elements.
    pub fn live_count(&self) -> usize {
        self.slot_count() - self.num_deleted()
    }

    /// Sample an insertion level: `floor(-ln(U) · mult)` with `U ∈ (0, 1]`.
    fn sample_level(&self) -> usize {
        let mut rng = self.level_rng.lock();
        let uniform: f64 = 1.0 - rng.random::<f64>();
        (-uniform.ln() * self.mult) as usize
    }

    #[inline]
    fn distance_to(&self, nodes: &[Node<E>], query: &[E], id: u32) -> f32 {
        let data = nodes[id as usize].data.read();
        (self.distance)(query, &data.vector)
    }

    fn neighbor_capacity(&self, level: usize) -> usize {
        if level == 0 {
            self.max_m0
        } else {
            self.max_m
        }
    }

    /// Insert a vector under `label`, or overwrite the existing element if
    /// the label is already present.
    pub fn insert(&self, vector: &[E], label: u64) -> Result<()> {
        debug_assert_eq!(vector.len(), self.storage_dim);
        let guard = self.nodes.read();
        let nodes: &[Node<E>] = &guard;

        // Claiming the slot and taking its update mutex happen under the
        // label-map lock, so a racing re-add of the same label serializes
        // behind this insertion instead of relinking a half-built node.
        let (index, _update) = {
            let mut labels = self.labels.write();
            if let Some(&existing) = labels.get(&label) {
                drop(labels);
                return self.relink(nodes, existing, vector);
            }
            let index = self.count.load(Ordering::Acquire);
            if index >= nodes.len() {
                return Err(ProximaError::IndexFull { max_elements: nodes.len() });
            }
            labels.insert(label, index as u32);
            self.count.store(index + 1, Ordering::Release);
            (index as u32, nodes[index].update.lock())
        };

        let level = self.sample_level();
        let node = &nodes[index as usize];
        node.label.store(label, Ordering::Relaxed);
        node.deleted.store(false, Ordering::Release);
        {
            let mut data = node.data.write();
            data.vector = vector.to_vec();
            data.links.level0.clear();
            data.links.upper = vec![Vec::new(); level];
        }

        // The entry-point lock is taken only when this node may become the
        // new top. The snapshot may be stale, so the promotion condition is
        // re-checked under the write lock. The snapshot binding matters:
        // it releases the read guard before the write arm runs.
        let snapshot = *self.entry.read();
        let mut entry_guard = None;
        let entry = match snapshot {
            Some(entry) if level <= entry.level => entry,
            _ => {
                let mut guard = self.entry.write();
                match *guard {
                    None => {
                        *guard = Some(EntryPoint { node: index, level });
                        return Ok(());
                    }
                    Some(entry) => {
                        if level > entry.level {
                            entry_guard = Some(guard);
                        }
                        entry
                    }
                }
            }
        };

        let mut current = entry.node;
        let mut current_dist = self.distance_to(nodes, vector, current);
        if entry.level > level {
            for layer in (level + 1..=entry.level).rev() {
                (current, current_dist) =
                    self.greedy_closest(nodes, vector, current, current_dist, layer);
            }
        }

        for layer in (0..=level.min(entry.level)).rev() {
            let candidates =
                self.search_layer(nodes, vector, current, layer, self.ef_construction, false);
            current = self.link_element(nodes, index, vector, layer, &candidates);
        }

        if let Some(mut guard) = entry_guard {
            *guard = Some(EntryPoint { node: index, level });
        }
        Ok(())
    }

    /// Overwrite path: replace the stored vector in place, clear any delete
    /// mark, and re-run the link step at every level the node already has.
    /// The node's update mutex is held throughout, so concurrent overwrites
    /// of one label run one at a time.
    fn relink(&self, nodes: &[Node<E>], index: u32, vector: &[E]) -> Result<()> {
        let node = &nodes[index as usize];
        let _update = node.update.lock();

        node.data.write().vector = vector.to_vec();
        if node.deleted.swap(false, Ordering::AcqRel) {
            self.num_deleted.fetch_sub(1, Ordering::AcqRel);
        }

        let level = node.data.read().links.level();
        let Some(entry) = *self.entry.read() else {
            return Ok(());
        };

        let mut current = entry.node;
        let mut current_dist = self.distance_to(nodes, vector, current);
        if entry.level > level {
            for layer in (level + 1..=entry.level).rev() {
                (current, current_dist) =
                    self.greedy_closest(nodes, vector, current, current_dist, layer);
            }
        }

        for layer in (0..=level.min(entry.level)).rev() {
            let mut candidates =
                self.search_layer(nodes, vector, current, layer, self.ef_construction, false);
            // The node finds itself during the search; it must not become
            // its own neighbor.
            candidates.retain(|&(_, id)| id != index);
            if candidates.is_empty() {
                continue;
            }
            current = self.link_element(nodes, index, vector, layer, &candidates);
        }
        Ok(())
    }

    /// Select neighbors for the new element, write its own list, and add
    /// the reverse edges, pruning any list that would exceed its capacity.
    /// Returns the closest selected neighbor as the entry for the next
    /// lower layer.
    fn link_element(
        &self,
        nodes: &[Node<E>],
        index: u32,
        vector: &[E],
        level: usize,
        candidates: &[(f32, u32)],
    ) -> u32 {
        let selected = self.select_neighbors(nodes, candidates, self.m);
        debug_assert!(!selected.is_empty());

        {
            let mut data = nodes[index as usize].data.write();
            let list = data.links.at_mut(level);
            list.clear();
            list.extend(selected.iter().map(|&(_, id)| id));
        }

        let capacity = self.neighbor_capacity(level);
        for &(distance, neighbor) in &selected {
            self.add_reverse_edge(nodes, neighbor, index, distance, level, capacity);
        }

        selected[0].1
    }

    /// Insert `index` into `neighbor`'s level-`level` list, re-selecting
    /// the combined list when it would exceed `capacity`.
    ///
    /// Distances are computed against a snapshot with the neighbor's lock
    /// released (holding it while locking other nodes could cycle); the
    /// write-back retries if the list changed in the meantime.
    fn add_reverse_edge(
        &self,
        nodes: &[Node<E>],
        neighbor: u32,
        index: u32,
        distance: f32,
        level: usize,
        capacity: usize,
    ) {
        loop {
            let (pivot_vector, snapshot) = {
                let mut data = nodes[neighbor as usize].data.write();
                {
                    let list = data.links.at_mut(level);
                    if list.iter().any(|&id| id == index) {
                        return;
                    }
                    if list.len() < capacity {
                        list.push(index);
                        return;
                    }
                }
                // Over capacity: re-select with the neighbor as pivot.
                (data.vector.clone(), data.links.at(level).clone())
            };

            let mut combined: Vec<(f32, u32)> = Vec::with_capacity(snapshot.len() + 1);
            combined.push((distance, index));
            for &other in &snapshot {
                combined.push((self.distance_to(nodes, &pivot_vector, other), other));
            }
            combined.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
            let pruned = self.select_neighbors(nodes, &combined, capacity);

            let mut data = nodes[neighbor as usize].data.write();
            let list = data.links.at_mut(level);
            if *list == snapshot {
                list.clear();
                list.extend(pruned.iter().map(|&(_, id)| id));
                return;
            }
            // Another insertion edited the list while distances were being
            // computed; start over from the fresh list.
        }
    }

    /// Heuristic neighbor selection: walk candidates in ascending distance
    /// order and keep a candidate only if it is strictly closer to the
    /// pivot than to every neighbor kept so far. Breaks connectivity to
    /// overly clustered regions; ties on distance resolve by internal index
    /// so output is deterministic.
    ///
    /// `candidates` must be sorted ascending by `(distance, id)`.
    fn select_neighbors(
        &self,
        nodes: &[Node<E>],
        candidates: &[(f32, u32)],
        target: usize,
    ) -> Vec<(f32, u32)> {
        let mut selected: Vec<(f32, u32)> = Vec::with_capacity(target.min(candidates.len()));
        for &(dist_to_pivot, candidate) in candidates {
            if selected.len() >= target {
                break;
            }
            if selected.is_empty() {
                selected.push((dist_to_pivot, candidate));
                continue;
            }
            // Lift the candidate's vector out first; data locks are only
            // ever held one at a time.
            let candidate_vector = nodes[candidate as usize].data.read().vector.clone();
            let keep = selected.iter().all(|&(_, kept)| {
                self.distance_to(nodes, &candidate_vector, kept) > dist_to_pivot
            });
            if keep {
                selected.push((dist_to_pivot, candidate));
            }
        }
        selected
    }

    /// Move greedily toward `query` within one layer, ef = 1.
    fn greedy_closest(
        &self,
        nodes: &[Node<E>],
        query: &[E],
        mut current: u32,
        mut current_dist: f32,
        level: usize,
    ) -> (u32, f32) {
        loop {
            let neighbors: SmallVec<[u32; 64]> = {
                let data = nodes[current as usize].data.read();
                data.links.at(level).iter().copied().collect()
            };
            let mut changed = false;
            for neighbor in neighbors {
                let distance = self.distance_to(nodes, query, neighbor);
                if distance < current_dist {
                    current = neighbor;
                    current_dist = distance;
                    changed = true;
                }
            }
            if !changed {
                return (current, current_dist);
            }
        }
    }

    /// Bounded best-first search within one layer, returning up to `ef`
    /// results sorted ascending by `(distance, id)`.
    ///
    /// With `filter_deleted`, deleted nodes still route the traversal but
    /// are kept out of the result set.
    fn search_layer(
        &self,
        nodes: &[Node<E>],
        query: &[E],
        entry: u32,
        level: usize,
        ef: usize,
        filter_deleted: bool,
    ) -> Vec<(f32, u32)> {
        let mut visited = self.visited.acquire(nodes.len());
        let mut candidates: std::collections::BinaryHeap<Closest> =
            std::collections::BinaryHeap::with_capacity(ef * 2);
        let mut results: std::collections::BinaryHeap<Furthest> =
            std::collections::BinaryHeap::with_capacity(ef + 1);

        let entry_dist = self.distance_to(nodes, query, entry);
        visited.insert(entry);
        candidates.push(Closest { distance: entry_dist, id: entry });
        let mut lower_bound = f32::INFINITY;
        if !filter_deleted || !nodes[entry as usize].deleted.load(Ordering::Acquire) {
            results.push(Furthest { distance: entry_dist, id: entry });
            lower_bound = entry_dist;
        }

        while let Some(candidate) = candidates.pop() {
            if candidate.distance > lower_bound && results.len() >= ef {
                break;
            }
            let neighbors: SmallVec<[u32; 64]> = {
                let data = nodes[candidate.id as usize].data.read();
                data.links.at(level).iter().copied().collect()
            };
            for neighbor in neighbors {
                if !visited.insert(neighbor) {
                    continue;
                }
                let distance = self.distance_to(nodes, query, neighbor);
                if results.len() < ef || distance < lower_bound {
                    candidates.push(Closest { distance, id: neighbor });
                    if !filter_deleted
                        || !nodes[neighbor as usize].deleted.load(Ordering::Acquire)
                    {
                        results.push(Furthest { distance, id: neighbor });
                        if results.len() > ef {
                            results.pop();
                        }
                        if let Some(worst) = results.peek() {
                            lower_bound = worst.distance;
                        }
                    }
                }
            }
        }

        let mut output: Vec<(f32, u32)> =
            results.into_iter().map(|r| (r.distance, r.id)).collect();
        output.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        output
    }

    /// k-nearest-neighbor search. Returns up to `k` `(distance, label)`
    /// pairs ascending; fewer when the reachable non-deleted graph is
    /// smaller than `k`.
    pub fn search(&self, query: &[E], k: usize, ef: usize) -> Vec<(f32, u64)> {
        debug_assert_eq!(query.len(), self.storage_dim);
        let guard = self.nodes.read();
        let nodes: &[Node<E>] = &guard;

        let Some(entry) = *self.entry.read() else {
            return Vec::new();
        };

        let mut current = entry.node;
        let mut current_dist = self.distance_to(nodes, query, current);
        for layer in (1..=entry.level).rev() {
            (current, current_dist) =
                self.greedy_closest(nodes, query, current, current_dist, layer);
        }

        let mut results = self.search_layer(nodes, query, current, 0, ef.max(k), true);
        results.truncate(k);
        results
            .into_iter()
            .map(|(distance, id)| {
                (distance, nodes[id as usize].label.load(Ordering::Relaxed))
            })
            .collect()
    }

    fn lookup(&self, label: u64) -> Result<u32> {
        self.labels
            .read()
            .get(&label)
            .copied()
            .ok_or(ProximaError::LabelNotFound(label))
    }

    /// The stored vector for a live label.
    pub fn get_vector(&self, label: u64) -> Result<Vec<E>> {
        let nodes = self.nodes.read();
        let index = self.lookup(label)?;
        let node = &nodes[index as usize];
        if node.deleted.load(Ordering::Acquire) {
            return Err(ProximaError::LabelNotFound(label));
        }
        let vector = node.data.read().vector.clone();
        Ok(vector)
    }

    /// Whether `label` is present and not deleted.
    pub fn contains(&self, label: u64) -> bool {
        let nodes = self.nodes.read();
        match self.labels.read().get(&label) {
            Some(&index) => !nodes[index as usize].deleted.load(Ordering::Acquire),
            None => false,
        }
    }

    /// All non-deleted labels, in unspecified order.
    pub fn labels(&self) -> Vec<u64> {
        let nodes = self.nodes.read();
        self.labels
            .read()
            .iter()
            .filter(|&(_, &index)| !nodes[index as usize].deleted.load(Ordering::Acquire))
            .map(|(&label, _)| label)
            .collect()
    }

    /// Soft-delete: the node keeps routing traversals but is filtered from
    /// results. Marking an already-deleted label is a no-op.
    pub fn mark_deleted(&self, label: u64) -> Result<()> {
        let nodes = self.nodes.read();
        let index = self.lookup(label)?;
        if !nodes[index as usize].deleted.swap(true, Ordering::AcqRel) {
            self.num_deleted.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Clear a delete mark. Unmarking a live label is a no-op.
    pub fn unmark_deleted(&self, label: u64) -> Result<()> {
        let nodes = self.nodes.read();
        let index = self.lookup(label)?;
        if nodes[index as usize].deleted.swap(false, Ordering::AcqRel) {
            self.num_deleted.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Grow to at least `min` slots. Unlike [`resize`](Self::resize) this
    /// never shrinks, so concurrent growers cannot undo each other.
    pub fn ensure_capacity(&self, min: usize) {
        let mut nodes = self.nodes.write();
        if min > nodes.len() {
            nodes.resize_with(min, Node::vacant);
        }
    }

    /// Grow (or trim unused slots of) the slot array. Excludes all readers
    /// for its duration; never shrinks below the occupied count.
    pub fn resize(&self, new_size: usize) -> Result<()> {
        let mut nodes = self.nodes.write();
        let count = self.count.load(Ordering::Acquire);
        if new_size < count {
            return Err(ProximaError::IndexCannotShrink { requested: new_size, current: count });
        }
        nodes.resize_with(new_size, Node::vacant);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Payload serialization
    // ------------------------------------------------------------------

    fn size_links_level0(&self) -> usize {
        4 + 4 * self.max_m0
    }

    fn size_links_upper(&self) -> usize {
        4 + 4 * self.max_m
    }

    fn size_data_per_element(&self) -> usize {
        self.size_links_level0() + E::BYTES * self.storage_dim + 8
    }

    /// Write the graph payload: the POD header, `current_count` fixed-size
    /// element blocks, then the variable-length upper-layer blocks.
    pub fn save_payload(&self, stream: &mut dyn OutputStream) -> Result<()> {
        let guard = self.nodes.read();
        let nodes: &[Node<E>] = &guard;
        let count = self.count.load(Ordering::Acquire);
        let entry = *self.entry.read();

        let size_data = self.size_data_per_element();
        let offset_data = self.size_links_level0() as u64;
        let label_offset = offset_data + (E::BYTES * self.storage_dim) as u64;

        write_all(stream, &0u64.to_le_bytes())?; // offset_level_0
        write_all(stream, &(nodes.len() as u64).to_le_bytes())?;
        write_all(stream, &(count as u64).to_le_bytes())?;
        write_all(stream, &(size_data as u64).to_le_bytes())?;
        write_all(stream, &label_offset.to_le_bytes())?;
        write_all(stream, &offset_data.to_le_bytes())?;
        let (top_level, entry_index) = match entry {
            Some(e) => (e.level as i32, e.node as i32),
            None => (-1, -1),
        };
        write_all(stream, &top_level.to_le_bytes())?;
        write_all(stream, &entry_index.to_le_bytes())?;
        write_all(stream, &(self.max_m0 as u64).to_le_bytes())?;
        write_all(stream, &(self.m as u64).to_le_bytes())?;
        write_all(stream, &self.mult.to_le_bytes())?;
        write_all(stream, &(self.ef_construction as u64).to_le_bytes())?;

        let mut block = vec![0u8; size_data];
        for node in nodes.iter().take(count) {
            block.fill(0);
            {
                let data = node.data.read();
                let list = &data.links.level0;
                block[0..4].copy_from_slice(&(list.len() as u32).to_le_bytes());
                for (i, &id) in list.iter().enumerate() {
                    let at = 4 + i * 4;
                    block[at..at + 4].copy_from_slice(&id.to_le_bytes());
                }
                let mut at = offset_data as usize;
                for &value in data.vector.iter() {
                    value.to_wire(&mut block[at..at + E::BYTES]);
                    at += E::BYTES;
                }
            }
            let mut label = node.label.load(Ordering::Relaxed);
            if node.deleted.load(Ordering::Acquire) {
                label |= DELETED_MASK;
            }
            let at = label_offset as usize;
            block[at..at + 8].copy_from_slice(&label.to_le_bytes());
            write_all(stream, &block)?;
        }

        let per_level = self.size_links_upper();
        for node in nodes.iter().take(count) {
            let data = node.data.read();
            let byte_len = (data.links.level() * per_level) as u32;
            write_all(stream, &byte_len.to_le_bytes())?;
            for list in &data.links.upper {
                let mut level_block = vec![0u8; per_level];
                level_block[0..4].copy_from_slice(&(list.len() as u32).to_le_bytes());
                for (i, &id) in list.iter().enumerate() {
                    let at = 4 + i * 4;
                    level_block[at..at + 4].copy_from_slice(&id.to_le_bytes());
                }
                write_all(stream, &level_block)?;
            }
        }
        Ok(())
    }

    /// Reconstruct a graph from a payload written by
    /// [`Self::save_payload`] (or by the legacy format, which shares the
    /// layout).
    ///
    /// Every structural field is validated before the graph is returned, so
    /// a truncated or inconsistent payload surfaces as `Corrupt` rather
    /// than a panic later.
    pub fn load_payload(
        stream: &mut dyn InputStream,
        storage_dim: usize,
        distance: DistanceFn<E>,
        seed: u64,
    ) -> Result<Self> {
        let _offset_level0 = read_u64(stream)?;
        let max_elements = read_u64(stream)? as usize;
        let count = read_u64(stream)? as usize;
        if count > max_elements {
            return Err(ProximaError::Corrupt(format!(
                "element count {count} exceeds capacity {max_elements}"
            )));
        }
        let size_data = read_u64(stream)? as usize;
        let label_offset = read_u64(stream)? as usize;
        let offset_data = read_u64(stream)? as usize;
        let top_level = read_i32(stream)?;
        let entry_index = read_i32(stream)?;
        let max_m0 = read_u64(stream)? as usize;
        let m = read_u64(stream)? as usize;
        let mult = read_f64(stream)?;
        let ef_construction = read_u64(stream)? as usize;

        if m == 0 || max_m0 != m.checked_mul(2).unwrap_or(usize::MAX) {
            return Err(ProximaError::Corrupt(format!(
                "inconsistent neighbor capacities (M = {m}, layer-0 = {max_m0})"
            )));
        }
        let size_links0 = 4 + 4 * max_m0;
        let vector_bytes = E::BYTES * storage_dim;
        if offset_data != size_links0
            || label_offset != size_links0 + vector_bytes
            || size_data != size_links0 + vector_bytes + 8
        {
            return Err(ProximaError::Corrupt(format!(
                "element layout ({size_data} bytes, data at {offset_data}, label at \
                 {label_offset}) does not match {storage_dim} dimensions of this storage type"
            )));
        }

        let mut graph = Self::new(
            GraphOptions { m, ef_construction, seed, capacity: max_elements },
            storage_dim,
            distance,
        );
        graph.mult = mult;

        let mut label_map: HashMap<u64, u32> = HashMap::with_capacity(count);
        let mut num_deleted = 0usize;
        {
            let nodes = graph.nodes.get_mut();
            let mut block = vec![0u8; size_data];
            for (index, node) in nodes.iter_mut().enumerate().take(count) {
                read_exact(stream, &mut block)?;

                let list_len =
                    u32::from_le_bytes([block[0], block[1], block[2], block[3]]) as usize;
                if list_len > max_m0 {
                    return Err(ProximaError::Corrupt(format!(
                        "node {index} has {list_len} layer-0 neighbors (capacity {max_m0})"
                    )));
                }
                let mut level0 = Vec::with_capacity(list_len);
                for i in 0..list_len {
                    let at = 4 + i * 4;
                    let id = u32::from_le_bytes([
                        block[at],
                        block[at + 1],
                        block[at + 2],
                        block[at + 3],
                    ]);
                    if id as usize >= count {
                        return Err(ProximaError::Corrupt(format!(
                            "node {index} links to nonexistent node {id}"
                        )));
                    }
                    level0.push(id);
                }

                let mut vector = Vec::with_capacity(storage_dim);
                let mut at = offset_data;
                for _ in 0..storage_dim {
                    vector.push(E::from_wire(&block[at..at + E::BYTES]));
                    at += E::BYTES;
                }

                let raw_label = u64::from_le_bytes(
                    block[label_offset..label_offset + 8].try_into().expect("8-byte slice"),
                );
                let deleted = raw_label & DELETED_MASK != 0;
                let label = raw_label & !DELETED_MASK;
                if label_map.insert(label, index as u32).is_some() {
                    return Err(ProximaError::Corrupt(format!(
                        "label {label} appears more than once"
                    )));
                }
                if deleted {
                    num_deleted += 1;
                }

                let data = node.data.get_mut();
                data.links.level0 = level0;
                data.vector = vector;
                *node.label.get_mut() = label;
                *node.deleted.get_mut() = deleted;
            }

            let per_level = 4 + 4 * m;
            let mut level_block = vec![0u8; per_level];
            for (index, node) in nodes.iter_mut().enumerate().take(count) {
                let byte_len = read_u32(stream)? as usize;
                if byte_len % per_level != 0 {
                    return Err(ProximaError::Corrupt(format!(
                        "node {index} has a {byte_len}-byte upper-layer block, not a \
                         multiple of {per_level}"
                    )));
                }
                let levels = byte_len / per_level;
                let mut upper = Vec::with_capacity(levels);
                for _ in 0..levels {
                    read_exact(stream, &mut level_block)?;
                    let list_len = u32::from_le_bytes([
                        level_block[0],
                        level_block[1],
                        level_block[2],
                        level_block[3],
                    ]) as usize;
                    if list_len > m {
                        return Err(ProximaError::Corrupt(format!(
                            "node {index} has {list_len} upper-layer neighbors (capacity {m})"
                        )));
                    }
                    let mut list = Vec::with_capacity(list_len);
                    for i in 0..list_len {
                        let at = 4 + i * 4;
                        let id = u32::from_le_bytes([
                            level_block[at],
                            level_block[at + 1],
                            level_block[at + 2],
                            level_block[at + 3],
                        ]);
                        if id as usize >= count {
                            return Err(ProximaError::Corrupt(format!(
                                "node {index} links to nonexistent node {id}"
                            )));
                        }
                        list.push(id);
                    }
                    upper.push(list);
                }
                node.data.get_mut().links.upper = upper;
            }

            let entry = if count == 0 {
                None
            } else {
                if entry_index < 0 || entry_index as usize >= count {
                    return Err(ProximaError::Corrupt(format!(
                        "entry point {entry_index} is outside the occupied range 0..{count}"
                    )));
                }
                let entry_level = nodes[entry_index as usize].data.get_mut().links.level();
                if top_level < 0 || entry_level != top_level as usize {
                    return Err(ProximaError::Corrupt(format!(
                        "entry point level {entry_level} does not match top level {top_level}"
                    )));
                }
                Some(EntryPoint { node: entry_index as u32, level: entry_level })
            };
            *graph.entry.get_mut() = entry;
        }

        *graph.labels.get_mut() = label_map;
        *graph.count.get_mut() = count;
        *graph.num_deleted.get_mut() = num_deleted;
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::streams::{MemoryInputStream, MemoryOutputStream};
    use crate::spaces::{distance_fn, Space};

    fn small_graph(capacity: usize, seed: u64) -> HierarchicalNsw<f32> {
        HierarchicalNsw::new(
            GraphOptions { m: 4, ef_construction: 32, seed, capacity },
            2,
            distance_fn::<f32>(Space::Euclidean, 2),
        )
    }

    fn grid_points(n: usize) -> Vec<[f32; 2]> {
        (0..n).map(|i| [(i % 10) as f32, (i / 10) as f32]).collect()
    }

    #[test]
    fn insert_and_exact_search() {
        let graph = small_graph(64, 1);
        for (i, p) in grid_points(50).iter().enumerate() {
            graph.insert(p, i as u64 + 100).unwrap();
        }
        for (i, p) in grid_points(50).iter().enumerate() {
            let results = graph.search(p, 1, 20);
            assert_eq!(results[0].1, i as u64 + 100, "query {p:?}");
            assert!(results[0].0.abs() < 1e-6);
        }
    }

    #[test]
    fn search_respects_k_and_orders_ascending() {
        let graph = small_graph(64, 1);
        for (i, p) in grid_points(30).iter().enumerate() {
            graph.insert(p, i as u64).unwrap();
        }
        let results = graph.search(&[0.0, 0.0], 5, 30);
        assert_eq!(results.len(), 5);
        for pair in results.windows(2) {
            assert!(pair[0].0 <= pair[1].0);
        }
    }

    #[test]
    fn capacity_is_enforced() {
        let graph = small_graph(2, 1);
        graph.insert(&[0.0, 0.0], 0).unwrap();
        graph.insert(&[1.0, 0.0], 1).unwrap();
        let err = graph.insert(&[2.0, 0.0], 2).unwrap_err();
        assert!(matches!(err, ProximaError::IndexFull { max_elements: 2 }));

        graph.resize(3).unwrap();
        graph.insert(&[2.0, 0.0], 2).unwrap();
        assert_eq!(graph.slot_count(), 3);
    }

    #[test]
    fn resize_cannot_shrink_below_count() {
        let graph = small_graph(8, 1);
        for (i, p) in grid_points(4).iter().enumerate() {
            graph.insert(p, i as u64).unwrap();
        }
        let err = graph.resize(3).unwrap_err();
        assert!(matches!(
            err,
            ProximaError::IndexCannotShrink { requested: 3, current: 4 }
        ));
        // Trimming unused slots is allowed.
        graph.resize(4).unwrap();
        assert_eq!(graph.capacity(), 4);
    }

    #[test]
    fn deleted_nodes_are_filtered_but_still_route() {
        let graph = small_graph(32, 1);
        for (i, p) in grid_points(20).iter().enumerate() {
            graph.insert(p, i as u64).unwrap();
        }
        graph.mark_deleted(0).unwrap();
        let results = graph.search(&[0.0, 0.0], 3, 20);
        assert!(results.iter().all(|&(_, label)| label != 0));

        graph.unmark_deleted(0).unwrap();
        let results = graph.search(&[0.0, 0.0], 1, 20);
        assert_eq!(results[0].1, 0);
    }

    #[test]
    fn delete_counters_ignore_repeated_marks() {
        let graph = small_graph(8, 1);
        graph.insert(&[0.0, 0.0], 7).unwrap();
        graph.mark_deleted(7).unwrap();
        graph.mark_deleted(7).unwrap();
        assert_eq!(graph.num_deleted(), 1);
        graph.unmark_deleted(7).unwrap();
        graph.unmark_deleted(7).unwrap();
        assert_eq!(graph.num_deleted(), 0);
        assert!(matches!(
            graph.mark_deleted(99).unwrap_err(),
            ProximaError::LabelNotFound(99)
        ));
    }

    #[test]
    fn overwriting_a_label_replaces_its_vector() {
        let graph = small_graph(32, 1);
        for (i, p) in grid_points(10).iter().enumerate() {
            graph.insert(p, i as u64).unwrap();
        }
        assert_eq!(graph.slot_count(), 10);

        graph.insert(&[50.0, 50.0], 3).unwrap();
        assert_eq!(graph.slot_count(), 10, "overwrite must reuse the slot");
        assert_eq!(graph.get_vector(3).unwrap(), vec![50.0, 50.0]);

        let results = graph.search(&[50.0, 50.0], 1, 20);
        assert_eq!(results[0].1, 3);
    }

    #[test]
    fn overwrite_clears_delete_mark() {
        let graph = small_graph(8, 1);
        graph.insert(&[1.0, 1.0], 5).unwrap();
        graph.insert(&[2.0, 2.0], 6).unwrap();
        graph.mark_deleted(5).unwrap();
        graph.insert(&[3.0, 3.0], 5).unwrap();
        assert_eq!(graph.num_deleted(), 0);
        assert!(graph.contains(5));
    }

    #[test]
    fn identical_seeds_build_identical_graphs() {
        let build = || {
            let graph = small_graph(64, 42);
            for (i, p) in grid_points(40).iter().enumerate() {
                graph.insert(p, i as u64).unwrap();
            }
            let mut out = MemoryOutputStream::new();
            graph.save_payload(&mut out).unwrap();
            out.into_bytes()
        };
        assert_eq!(build(), build(), "construction must be deterministic");
    }

    #[test]
    fn payload_round_trip_preserves_results() {
        let graph = small_graph(64, 7);
        for (i, p) in grid_points(40).iter().enumerate() {
            graph.insert(p, i as u64).unwrap();
        }
        graph.mark_deleted(11).unwrap();

        let mut out = MemoryOutputStream::new();
        graph.save_payload(&mut out).unwrap();
        let bytes = out.into_bytes();

        let mut input = MemoryInputStream::new(bytes.clone());
        let loaded = HierarchicalNsw::<f32>::load_payload(
            &mut input,
            2,
            distance_fn::<f32>(Space::Euclidean, 2),
            7,
        )
        .unwrap();

        assert_eq!(loaded.slot_count(), 40);
        assert_eq!(loaded.num_deleted(), 1);
        for p in grid_points(40) {
            assert_eq!(graph.search(&p, 3, 20), loaded.search(&p, 3, 20));
        }

        // And the reloaded graph serializes to the same bytes.
        let mut again = MemoryOutputStream::new();
        loaded.save_payload(&mut again).unwrap();
        assert_eq!(bytes, again.into_bytes());
    }

    #[test]
    fn truncated_payload_is_corrupt() {
        let graph = small_graph(16, 1);
        for (i, p) in grid_points(8).iter().enumerate() {
            graph.insert(p, i as u64).unwrap();
        }
        let mut out = MemoryOutputStream::new();
        graph.save_payload(&mut out).unwrap();
        let mut bytes = out.into_bytes();
        bytes.truncate(bytes.len() - 5);

        let err = HierarchicalNsw::<f32>::load_payload(
            &mut MemoryInputStream::new(bytes),
            2,
            distance_fn::<f32>(Space::Euclidean, 2),
            1,
        )
        .unwrap_err();
        assert!(matches!(err, ProximaError::Corrupt(_)), "got {err:?}");
    }

    #[test]
    fn neighbor_lists_respect_capacity_invariants() {
        let graph = small_graph(128, 3);
        for (i, p) in grid_points(100).iter().enumerate() {
            graph.insert(p, i as u64).unwrap();
        }
        let nodes = graph.nodes.read();
        for (index, node) in nodes.iter().enumerate().take(graph.slot_count()) {
            let data = node.data.read();
            assert!(data.links.level0.len() <= graph.max_m0);
            let mut seen = data.links.level0.clone();
            seen.sort_unstable();
            seen.dedup();
            assert_eq!(seen.len(), data.links.level0.len(), "duplicate neighbors");
            assert!(!data.links.level0.contains(&(index as u32)), "self-link");
            for list in &data.links.upper {
                assert!(list.len() <= graph.max_m);
            }
        }
    }

    #[test]
    fn level_sampling_is_deterministic_per_seed() {
        let a = small_graph(4, 9);
        let b = small_graph(4, 9);
        let levels_a: Vec<usize> = (0..20).map(|_| a.sample_level()).collect();
        let levels_b: Vec<usize> = (0..20).map(|_| b.sample_level()).collect();
        assert_eq!(levels_a, levels_b);
        assert!(levels_a.iter().any(|&l| l == 0), "level 0 should dominate");
    }
}
