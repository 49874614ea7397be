//! proxima: approximate nearest-neighbor search over dense vectors.
//!
//! An in-process [HNSW](https://arxiv.org/abs/1603.09320) index supporting
//! concurrent insertion and search, soft deletion, growth-only resize,
//! three distance spaces, three on-disk storage precisions, and a
//! stream-based serialization format.
//!
//! # Choosing a space and storage type
//!
//! | Situation | Space | Storage |
//! |-----------|-------|---------|
//! | General-purpose similarity | [`Space::Euclidean`] | [`StorageDataType::Float32`] |
//! | Normalized embeddings | [`Space::Cosine`] | `Float32` or `E4M3` |
//! | Recommendation scores (MIPS) | [`Space::InnerProduct`] + transform | `Float32` |
//! | Memory-constrained, inputs in `[-1, 1]` | any | [`StorageDataType::Float8`] |
//!
//! The 8-bit storage types quarter the memory per vector at a documented
//! precision cost; distances are computed in the storage domain and
//! rescaled once per distance.
//!
//! # Usage
//!
//! ```rust
//! use proxima::{Index, IndexOptions, Space};
//!
//! # fn main() -> proxima::Result<()> {
//! let index = Index::new(Space::Euclidean, 4, IndexOptions::default());
//! index.add_item(&[1.0, 0.0, 0.0, 0.0], Some(10))?;
//! index.add_item(&[0.0, 1.0, 0.0, 0.0], Some(20))?;
//!
//! let (labels, distances) = index.query(&[0.9, 0.1, 0.0, 0.0], 1, None)?;
//! assert_eq!(labels, vec![10]);
//! # let _ = distances;
//! # Ok(())
//! # }
//! ```
//!
//! Indices round-trip through any byte stream via [`Index::save`] and
//! [`Index::load`]; see [`persistence`] for the stream adapters.
//!
//! # Concurrency
//!
//! Every operation takes `&self`. Insertions use per-node locking and run
//! concurrently with each other and with queries; `resize` briefly
//! excludes everything else. Deletions are soft marks, immediately visible
//! to queries that start after the call returns.

mod hnsw;
mod parallel;

pub mod error;
pub mod persistence;
pub mod spaces;
pub mod storage;
pub mod visited;

mod index;

pub use error::{ProximaError, Result};
pub use index::{Index, IndexOptions, LoadOverrides};
pub use persistence::{
    FileInputStream, FileOutputStream, InputStream, MemoryInputStream, MemoryOutputStream,
    OutputStream, ReaderInputStream,
};
pub use spaces::Space;
pub use storage::{StorageDataType, E4M3};
