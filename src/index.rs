//! The typed index facade.
//!
//! [`Index`] pairs a distance space with a storage type and owns everything
//! between the caller's f32 vectors and the graph engine: validation,
//! normalization, the order-preserving transform, quantization, label
//! bookkeeping, batch execution, and (de)serialization.

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{ProximaError, Result};
use crate::hnsw::{GraphOptions, HierarchicalNsw};
use crate::parallel::parallel_for;
use crate::persistence::streams::{
    FileInputStream, FileOutputStream, InputStream, OutputStream,
};
use crate::persistence::Metadata;
use crate::spaces::{self, distance_fn, DistanceFn, Space};
use crate::storage::{decode_vector, encode_vector, Element, StorageDataType, E4M3};

/// Default dynamic candidate-list size for queries.
const DEFAULT_EF: usize = 10;

/// Construction parameters for an [`Index`].
#[derive(Debug, Clone, Copy)]
pub struct IndexOptions {
    /// Target neighbors per node per level; layer 0 holds up to `2M`.
    pub m: usize,
    /// Dynamic candidate-list size during construction.
    pub ef_construction: usize,
    /// Seed for the deterministic level generator.
    pub seed: u64,
    /// Initial capacity. The index grows on demand, so this is a hint.
    pub max_elements: usize,
    /// On-disk precision for stored vectors.
    pub storage: StorageDataType,
    /// Reduce maximum-inner-product search to nearest-neighbor search by
    /// storing vectors with one extra coordinate. Only honored for
    /// [`Space::InnerProduct`]; other spaces ignore the flag.
    pub use_order_preserving_transform: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            m: 12,
            ef_construction: 200,
            seed: 1,
            max_elements: 1,
            storage: StorageDataType::Float32,
            use_order_preserving_transform: false,
        }
    }
}

/// Metadata needed to interpret a legacy (pre-versioned) index file, which
/// carries no header of its own.
#[derive(Debug, Clone, Copy)]
pub struct LoadOverrides {
    pub space: Space,
    pub num_dimensions: usize,
    pub storage: StorageDataType,
}

/// An approximate-nearest-neighbor index over dense f32 vectors.
///
/// All operations take `&self` and are safe to call from multiple threads
/// concurrently; see the module docs for the ordering guarantees.
#[derive(Debug)]
pub struct Index {
    inner: Typed,
}

#[derive(Debug)]
enum Typed {
    Float8(TypedIndex<i8>),
    Float32(TypedIndex<f32>),
    E4M3(TypedIndex<E4M3>),
}

macro_rules! dispatch {
    ($self:expr, $inner:ident => $body:expr) => {
        match &$self.inner {
            Typed::Float8($inner) => $body,
            Typed::Float32($inner) => $body,
            Typed::E4M3($inner) => $body,
        }
    };
}

impl Index {
    /// Create an empty index.
    pub fn new(space: Space, num_dimensions: usize, options: IndexOptions) -> Index {
        let inner = match options.storage {
            StorageDataType::Float8 => {
                Typed::Float8(TypedIndex::new(space, num_dimensions, options))
            }
            StorageDataType::Float32 => {
                Typed::Float32(TypedIndex::new(space, num_dimensions, options))
            }
            StorageDataType::E4M3 => {
                Typed::E4M3(TypedIndex::new(space, num_dimensions, options))
            }
        };
        Index { inner }
    }

    /// Load an index from a stream.
    ///
    /// V1 files carry their own metadata; `overrides` may be passed to
    /// assert the expected shape and must be passed for legacy files, which
    /// have none.
    pub fn load(
        stream: &mut dyn InputStream,
        overrides: Option<LoadOverrides>,
    ) -> Result<Index> {
        let metadata = match Metadata::detect(stream)? {
            Some(metadata) => {
                if let Some(overrides) = overrides {
                    if overrides.num_dimensions != metadata.num_dimensions
                        || overrides.space != metadata.space
                        || overrides.storage != metadata.storage
                    {
                        return Err(ProximaError::Corrupt(format!(
                            "file holds a {}-dimensional {} index stored as {}, but \
                             {}-dimensional {} stored as {} was requested",
                            metadata.num_dimensions,
                            metadata.space,
                            metadata.storage,
                            overrides.num_dimensions,
                            overrides.space,
                            overrides.storage,
                        )));
                    }
                }
                metadata
            }
            // Legacy payload: no header at all, the caller supplies the
            // shape and the transform is pre-metadata, hence inactive.
            None => {
                let Some(overrides) = overrides else {
                    return Err(ProximaError::Corrupt(
                        "file has no metadata header; space, dimensions, and storage \
                         type must be provided to load it"
                            .into(),
                    ));
                };
                Metadata {
                    num_dimensions: overrides.num_dimensions,
                    space: overrides.space,
                    storage: overrides.storage,
                    max_norm: 0.0,
                    use_order_preserving_transform: false,
                }
            }
        };

        let inner = match metadata.storage {
            StorageDataType::Float8 => Typed::Float8(TypedIndex::load(stream, metadata)?),
            StorageDataType::Float32 => Typed::Float32(TypedIndex::load(stream, metadata)?),
            StorageDataType::E4M3 => Typed::E4M3(TypedIndex::load(stream, metadata)?),
        };
        Ok(Index { inner })
    }

    /// Load an index from a file on disk.
    pub fn load_from_file(
        path: impl AsRef<Path>,
        overrides: Option<LoadOverrides>,
    ) -> Result<Index> {
        let mut stream = FileInputStream::open(path)?;
        Index::load(&mut stream, overrides)
    }

    /// Serialize the index to a stream.
    pub fn save(&self, stream: &mut dyn OutputStream) -> Result<()> {
        dispatch!(self, inner => inner.save(stream))
    }

    /// Serialize the index to a file on disk.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut stream = FileOutputStream::create(path)?;
        self.save(&mut stream)
    }

    /// Add one vector. Without an explicit id a label is generated from a
    /// monotonic counter. Re-adding an existing label overwrites that
    /// element in place.
    pub fn add_item(&self, vector: &[f32], id: Option<u64>) -> Result<u64> {
        dispatch!(self, inner => inner.add_item(vector, id))
    }

    /// Add a batch of vectors across `num_threads` workers (0 = one per
    /// core). Falls back to a single thread for small batches. The first
    /// error stops further scheduling and is returned.
    pub fn add_items(
        &self,
        vectors: &[Vec<f32>],
        ids: Option<&[u64]>,
        num_threads: usize,
    ) -> Result<Vec<u64>> {
        dispatch!(self, inner => inner.add_items(vectors, ids, num_threads))
    }

    /// k-nearest-neighbor query. Returns labels and distances in ascending
    /// distance order.
    pub fn query(
        &self,
        vector: &[f32],
        k: usize,
        ef_override: Option<usize>,
    ) -> Result<(Vec<u64>, Vec<f32>)> {
        dispatch!(self, inner => inner.query(vector, k, ef_override))
    }

    /// Batched k-nearest-neighbor query.
    #[allow(clippy::type_complexity)]
    pub fn query_batch(
        &self,
        vectors: &[Vec<f32>],
        k: usize,
        num_threads: usize,
        ef_override: Option<usize>,
    ) -> Result<(Vec<Vec<u64>>, Vec<Vec<f32>>)> {
        dispatch!(self, inner => inner.query_batch(vectors, k, num_threads, ef_override))
    }

    /// The stored vector for `label`, decoded to f32. Vectors come back as
    /// stored: normalized for the Cosine space, quantized through the
    /// storage codec.
    pub fn get_vector(&self, label: u64) -> Result<Vec<f32>> {
        dispatch!(self, inner => inner.get_vector(label))
    }

    /// [`get_vector`](Self::get_vector) for several labels.
    pub fn get_vectors(&self, labels: &[u64]) -> Result<Vec<Vec<f32>>> {
        labels.iter().map(|&label| self.get_vector(label)).collect()
    }

    /// Distance between two vectors under this index's space and storage
    /// type (both are encoded through the codec first).
    pub fn get_distance(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        dispatch!(self, inner => inner.get_distance(a, b))
    }

    /// All non-deleted labels, in unspecified order.
    pub fn ids(&self) -> Vec<u64> {
        dispatch!(self, inner => inner.graph.labels())
    }

    /// Whether `label` is present and not deleted.
    pub fn contains(&self, label: u64) -> bool {
        dispatch!(self, inner => inner.graph.contains(label))
    }

    /// Number of non-deleted elements.
    pub fn len(&self) -> usize {
        dispatch!(self, inner => inner.graph.live_count())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of non-deleted elements (alias of [`len`](Self::len)).
    pub fn num_elements(&self) -> usize {
        self.len()
    }

    /// Soft-delete `label`: it stops appearing in results but keeps routing
    /// graph traversals.
    pub fn mark_deleted(&self, label: u64) -> Result<()> {
        dispatch!(self, inner => inner.graph.mark_deleted(label))
    }

    /// Undo a soft delete.
    pub fn unmark_deleted(&self, label: u64) -> Result<()> {
        dispatch!(self, inner => inner.graph.unmark_deleted(label))
    }

    /// Resize the backing storage. Fails when shrinking below the occupied
    /// element count.
    pub fn resize(&self, new_size: usize) -> Result<()> {
        dispatch!(self, inner => inner.graph.resize(new_size))
    }

    /// Current capacity in elements.
    pub fn max_elements(&self) -> usize {
        dispatch!(self, inner => inner.graph.capacity())
    }

    /// The default query-time candidate-list size.
    pub fn ef(&self) -> usize {
        dispatch!(self, inner => inner.ef.load(Ordering::Acquire))
    }

    pub fn set_ef(&self, ef: usize) {
        dispatch!(self, inner => inner.ef.store(ef, Ordering::Release))
    }

    pub fn m(&self) -> usize {
        dispatch!(self, inner => inner.graph.m())
    }

    pub fn ef_construction(&self) -> usize {
        dispatch!(self, inner => inner.graph.ef_construction())
    }

    pub fn space(&self) -> Space {
        dispatch!(self, inner => inner.space)
    }

    pub fn storage(&self) -> StorageDataType {
        dispatch!(self, inner => inner.storage)
    }

    pub fn num_dimensions(&self) -> usize {
        dispatch!(self, inner => inner.dimensions)
    }

    /// The running maximum norm maintained by the order-preserving
    /// transform. Zero when the transform is inactive.
    pub fn max_norm(&self) -> f32 {
        dispatch!(self, inner => inner.load_max_norm())
    }
}

/// The space/storage-specialized implementation behind [`Index`].
#[derive(Debug)]
struct TypedIndex<E: Element> {
    space: Space,
    storage: StorageDataType,
    dimensions: usize,
    /// L2-normalize inputs before encoding (Cosine space).
    normalize: bool,
    /// Append the order-preserving extra coordinate (InnerProduct only).
    use_transform: bool,
    graph: HierarchicalNsw<E>,
    /// Kernel over the plain (un-augmented) dimensionality, for
    /// `get_distance`.
    plain_distance: DistanceFn<E>,
    /// f32 bits of the running maximum norm; CAS-updated, monotone.
    max_norm_bits: AtomicU32,
    ef: AtomicUsize,
    next_label: AtomicU64,
}

impl<E: Element> TypedIndex<E> {
    fn new(space: Space, dimensions: usize, options: IndexOptions) -> Self {
        let use_transform =
            space == Space::InnerProduct && options.use_order_preserving_transform;
        let storage_dim = dimensions + use_transform as usize;
        let graph = HierarchicalNsw::new(
            GraphOptions {
                m: options.m,
                ef_construction: options.ef_construction,
                seed: options.seed,
                capacity: options.max_elements,
            },
            storage_dim,
            distance_fn::<E>(space, storage_dim),
        );
        Self {
            space,
            storage: E::DATA_TYPE,
            dimensions,
            normalize: space == Space::Cosine,
            use_transform,
            graph,
            plain_distance: distance_fn::<E>(space, dimensions),
            max_norm_bits: AtomicU32::new(0.0f32.to_bits()),
            ef: AtomicUsize::new(DEFAULT_EF),
            next_label: AtomicU64::new(0),
        }
    }

    fn load(stream: &mut dyn InputStream, metadata: Metadata) -> Result<Self> {
        let use_transform =
            metadata.space == Space::InnerProduct && metadata.use_order_preserving_transform;
        let storage_dim = metadata.num_dimensions + use_transform as usize;
        let options = IndexOptions::default();
        let graph = HierarchicalNsw::load_payload(
            stream,
            storage_dim,
            distance_fn::<E>(metadata.space, storage_dim),
            options.seed,
        )?;
        let next_label = graph.slot_count() as u64;
        Ok(Self {
            space: metadata.space,
            storage: E::DATA_TYPE,
            dimensions: metadata.num_dimensions,
            normalize: metadata.space == Space::Cosine,
            use_transform,
            graph,
            plain_distance: distance_fn::<E>(metadata.space, metadata.num_dimensions),
            max_norm_bits: AtomicU32::new(metadata.max_norm.to_bits()),
            ef: AtomicUsize::new(DEFAULT_EF),
            next_label: AtomicU64::new(next_label),
        })
    }

    fn save(&self, stream: &mut dyn OutputStream) -> Result<()> {
        let metadata = Metadata {
            num_dimensions: self.dimensions,
            space: self.space,
            storage: self.storage,
            max_norm: self.load_max_norm(),
            use_order_preserving_transform: self.use_transform,
        };
        metadata.write(stream)?;
        self.graph.save_payload(stream)?;
        stream.flush();
        Ok(())
    }

    fn load_max_norm(&self) -> f32 {
        f32::from_bits(self.max_norm_bits.load(Ordering::Acquire))
    }

    /// Raise the running maximum norm to at least `norm` and return the
    /// post-update value. Norms are non-negative, so comparing f32 bit
    /// patterns as integers preserves ordering.
    fn update_max_norm(&self, norm: f32) -> f32 {
        let mut observed = self.max_norm_bits.load(Ordering::Acquire);
        loop {
            if norm <= f32::from_bits(observed) {
                return f32::from_bits(observed);
            }
            match self.max_norm_bits.compare_exchange_weak(
                observed,
                norm.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return norm,
                Err(actual) => observed = actual,
            }
        }
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(ProximaError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Normalize/augment and encode a vector headed for storage.
    ///
    /// The transform coordinate is `sqrt(N² - ‖x‖²)` against the running
    /// maximum norm N, updated first, so every stored vector has norm N at
    /// the time it is written.
    fn prepare_insert(&self, vector: &[f32]) -> Result<Vec<E>> {
        self.check_dimensions(vector)?;
        let storage_dim = self.graph.storage_dim();
        let mut staged = vec![0.0f32; storage_dim];
        if self.normalize {
            spaces::normalize_into(vector, &mut staged[..self.dimensions]);
        } else {
            staged[..self.dimensions].copy_from_slice(vector);
        }
        if self.use_transform {
            let norm = spaces::l2_norm(vector);
            let max_norm = self.update_max_norm(norm);
            staged[self.dimensions] = (max_norm * max_norm - norm * norm).max(0.0).sqrt();
        }
        let mut encoded = vec![E::default(); storage_dim];
        encode_vector(&staged, &mut encoded)?;
        Ok(encoded)
    }

    /// Normalize/augment and encode a query vector. The transform
    /// coordinate of a query is always zero.
    fn prepare_query(&self, vector: &[f32]) -> Result<Vec<E>> {
        self.check_dimensions(vector)?;
        let storage_dim = self.graph.storage_dim();
        let mut staged = vec![0.0f32; storage_dim];
        if self.normalize {
            spaces::normalize_into(vector, &mut staged[..self.dimensions]);
        } else {
            staged[..self.dimensions].copy_from_slice(vector);
        }
        let mut encoded = vec![E::default(); storage_dim];
        encode_vector(&staged, &mut encoded)?;
        Ok(encoded)
    }

    fn insert_encoded(&self, encoded: &[E], label: u64) -> Result<()> {
        loop {
            match self.graph.insert(encoded, label) {
                Err(ProximaError::IndexFull { .. }) => {
                    self.graph.ensure_capacity(self.graph.slot_count() + 1);
                }
                result => return result,
            }
        }
    }

    fn add_item(&self, vector: &[f32], id: Option<u64>) -> Result<u64> {
        let encoded = self.prepare_insert(vector)?;
        let label = id.unwrap_or_else(|| self.next_label.fetch_add(1, Ordering::Relaxed));
        self.insert_encoded(&encoded, label)?;
        Ok(label)
    }

    fn add_items(
        &self,
        vectors: &[Vec<f32>],
        ids: Option<&[u64]>,
        num_threads: usize,
    ) -> Result<Vec<u64>> {
        let rows = vectors.len();
        let labels: Vec<u64> = match ids {
            Some(ids) => {
                if ids.len() != rows {
                    return Err(ProximaError::IdsLengthMismatch { ids: ids.len(), rows });
                }
                ids.to_vec()
            }
            None => {
                let start = self.next_label.fetch_add(rows as u64, Ordering::Relaxed);
                (start..start + rows as u64).collect()
            }
        };

        // One up-front grow instead of a resize race per insertion.
        self.graph.ensure_capacity(self.graph.slot_count() + rows);

        let num_threads = effective_threads(rows, num_threads);
        parallel_for(0, rows, num_threads, |row, _thread| {
            let encoded = self.prepare_insert(&vectors[row])?;
            self.insert_encoded(&encoded, labels[row])
        })?;
        Ok(labels)
    }

    /// Negative distances within tolerance are rounding noise and clamp to
    /// zero; beyond it they indicate a corrupted index. The tolerance is
    /// wide for E4M3, whose 3-bit mantissa loses that much under the
    /// normalized inner product.
    fn ensure_not_negative(&self, distance: f32, label: u64) -> Result<f32> {
        let tolerance = match self.storage {
            StorageDataType::E4M3 => -0.14,
            _ => -1e-5,
        };
        if distance < 0.0 {
            if distance >= tolerance {
                return Ok(0.0);
            }
            return Err(ProximaError::Corrupt(format!(
                "potential candidate (with label '{label}') had negative distance \
                 {distance}; this may indicate a corrupted index file"
            )));
        }
        Ok(distance)
    }

    fn query_ef(&self, k: usize, ef_override: Option<usize>) -> Result<usize> {
        if let Some(ef) = ef_override {
            if ef < k {
                return Err(ProximaError::QueryEfTooSmall { ef, k });
            }
            return Ok(ef);
        }
        Ok(self.ef.load(Ordering::Acquire).max(k))
    }

    fn query(
        &self,
        vector: &[f32],
        k: usize,
        ef_override: Option<usize>,
    ) -> Result<(Vec<u64>, Vec<f32>)> {
        let ef = self.query_ef(k, ef_override)?;
        let encoded = self.prepare_query(vector)?;
        let results = self.graph.search(&encoded, k, ef);
        if results.len() < k {
            return Err(ProximaError::InsufficientResults {
                found: results.len(),
                requested: k,
            });
        }
        let mut labels = Vec::with_capacity(k);
        let mut distances = Vec::with_capacity(k);
        for (distance, label) in results {
            let distance = if self.normalize {
                self.ensure_not_negative(distance, label)?
            } else {
                distance
            };
            labels.push(label);
            distances.push(distance);
        }
        Ok((labels, distances))
    }

    #[allow(clippy::type_complexity)]
    fn query_batch(
        &self,
        vectors: &[Vec<f32>],
        k: usize,
        num_threads: usize,
        ef_override: Option<usize>,
    ) -> Result<(Vec<Vec<u64>>, Vec<Vec<f32>>)> {
        // Validate once so a bad override fails before any work runs.
        self.query_ef(k, ef_override)?;

        let rows = vectors.len();
        let cells: Vec<Mutex<Option<(Vec<u64>, Vec<f32>)>>> =
            (0..rows).map(|_| Mutex::new(None)).collect();

        let num_threads = effective_threads(rows, num_threads);
        parallel_for(0, rows, num_threads, |row, _thread| {
            let result = self.query(&vectors[row], k, ef_override)?;
            *cells[row].lock() = Some(result);
            Ok(())
        })?;

        let mut all_labels = Vec::with_capacity(rows);
        let mut all_distances = Vec::with_capacity(rows);
        for cell in cells {
            let (labels, distances) =
                cell.into_inner().expect("every row completed without error");
            all_labels.push(labels);
            all_distances.push(distances);
        }
        Ok((all_labels, all_distances))
    }

    fn get_vector(&self, label: u64) -> Result<Vec<f32>> {
        let stored = self.graph.get_vector(label)?;
        let mut decoded = vec![0.0f32; stored.len()];
        decode_vector(&stored, &mut decoded);
        decoded.truncate(self.dimensions);
        Ok(decoded)
    }

    fn get_distance(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        self.check_dimensions(a)?;
        self.check_dimensions(b)?;
        let encode = |vector: &[f32]| -> Result<Vec<E>> {
            let mut staged = vec![0.0f32; self.dimensions];
            if self.normalize {
                spaces::normalize_into(vector, &mut staged);
            } else {
                staged.copy_from_slice(vector);
            }
            let mut encoded = vec![E::default(); self.dimensions];
            encode_vector(&staged, &mut encoded)?;
            Ok(encoded)
        };
        let ea = encode(a)?;
        let eb = encode(b)?;
        Ok((self.plain_distance)(&ea, &eb))
    }
}

/// Small batches run on one thread: spawning workers costs more than the
/// work itself.
fn effective_threads(rows: usize, num_threads: usize) -> usize {
    let num_threads = if num_threads == 0 {
        std::thread::available_parallelism().map_or(1, |n| n.get())
    } else {
        num_threads
    };
    if rows <= num_threads * 4 {
        1
    } else {
        num_threads
    }
}
