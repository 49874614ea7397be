//! Hierarchical Navigable Small World (HNSW) graph engine.
//!
//! A multilayer proximity graph: sparse upper layers route long-range hops,
//! the dense base layer holds every node with up to `2M` neighbors. Search
//! descends greedily from the single entry point at the top layer, then
//! runs a bounded best-first expansion at layer 0.
//!
//! The engine supports concurrent insertion and search with per-node locks,
//! soft deletion, grow-only resize, and a byte-stable payload format. It
//! works purely on storage-domain vectors; normalization, quantization, and
//! the order-preserving transform happen in the facade before vectors reach
//! this module.
//!
//! # References
//!
//! - Malkov & Yashunin (2016): "Efficient and robust approximate nearest
//!   neighbor search using Hierarchical Navigable Small World graphs"

mod graph;
mod search;

pub(crate) use graph::{GraphOptions, HierarchicalNsw};
