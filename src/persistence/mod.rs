//! Stream serialization for indices.
//!
//! A saved index is a single byte stream: the [`metadata::Metadata`] header
//! (magic, version, space, storage, transform state) followed by the graph
//! payload, whose layout is owned by the graph engine. Everything is
//! little-endian and byte-stable across platforms of identical endianness.
//!
//! Readers also accept the legacy pre-versioned format: when the magic is
//! absent, the stream is interpreted as a bare graph payload and the caller
//! supplies the space, dimensionality, and storage type.

pub mod metadata;
pub mod streams;

pub use metadata::Metadata;
pub use streams::{
    FileInputStream, FileOutputStream, InputStream, MemoryInputStream, MemoryOutputStream,
    OutputStream, ReaderInputStream,
};
