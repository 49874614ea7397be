//! Versioned file-header metadata.
//!
//! A V1 index file starts with the four magic bytes `VOYA`, a little-endian
//! i32 format version, and the metadata block: dimensionality, space,
//! storage type, the running maximum norm, and whether the
//! order-preserving transform is active. Files without the magic are
//! legacy graph payloads with no metadata at all; [`Metadata::detect`]
//! distinguishes the two without consuming legacy bytes.

use crate::error::{ProximaError, Result};
use crate::spaces::Space;
use crate::storage::StorageDataType;

use super::streams::{
    read_exact, read_f32, read_i32, read_u8, write_all, InputStream, OutputStream,
};

/// The file magic, `VOYA` in ASCII.
pub const MAGIC: [u8; 4] = *b"VOYA";

/// The newest format version this library writes and reads.
pub const FORMAT_VERSION: i32 = 1;

/// Metadata block V1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metadata {
    pub num_dimensions: usize,
    pub space: Space,
    pub storage: StorageDataType,
    pub max_norm: f32,
    pub use_order_preserving_transform: bool,
}

impl Metadata {
    /// Serialized size in bytes, including magic and version.
    pub const SERIALIZED_SIZE: usize = 4 + 4 + 4 + 1 + 1 + 4 + 1;

    /// Write magic, version, and the metadata block.
    pub fn write(&self, stream: &mut dyn OutputStream) -> Result<()> {
        write_all(stream, &MAGIC)?;
        write_all(stream, &FORMAT_VERSION.to_le_bytes())?;
        write_all(stream, &(self.num_dimensions as i32).to_le_bytes())?;
        write_all(stream, &[self.space as u8])?;
        write_all(stream, &[self.storage as u8])?;
        write_all(stream, &self.max_norm.to_le_bytes())?;
        write_all(stream, &[self.use_order_preserving_transform as u8])?;
        Ok(())
    }

    /// Sniff the stream for the magic. Returns the parsed metadata for a
    /// V1 file, `None` for a legacy payload (stream untouched), or
    /// [`ProximaError::UnsupportedVersion`] for versions this library
    /// cannot read.
    pub fn detect(stream: &mut dyn InputStream) -> Result<Option<Self>> {
        if stream.peek_u32()? != u32::from_le_bytes(MAGIC) {
            return Ok(None);
        }

        let mut magic = [0u8; 4];
        read_exact(stream, &mut magic)?;

        let version = read_i32(stream)?;
        if version != FORMAT_VERSION {
            return Err(ProximaError::UnsupportedVersion(version));
        }

        let num_dimensions = read_i32(stream)?;
        if num_dimensions <= 0 {
            return Err(ProximaError::Corrupt(format!(
                "metadata declares {num_dimensions} dimensions"
            )));
        }
        let space = Space::from_byte(read_u8(stream)?)?;
        let storage = StorageDataType::from_byte(read_u8(stream)?)?;
        let max_norm = read_f32(stream)?;
        let use_order_preserving_transform = read_u8(stream)? != 0;

        Ok(Some(Metadata {
            num_dimensions: num_dimensions as usize,
            space,
            storage,
            max_norm,
            use_order_preserving_transform,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::streams::{MemoryInputStream, MemoryOutputStream};

    fn sample() -> Metadata {
        Metadata {
            num_dimensions: 128,
            space: Space::Cosine,
            storage: StorageDataType::E4M3,
            max_norm: 2.5,
            use_order_preserving_transform: false,
        }
    }

    #[test]
    fn header_is_nineteen_bytes() {
        let mut out = MemoryOutputStream::new();
        sample().write(&mut out).unwrap();
        assert_eq!(out.as_bytes().len(), 19);
        assert_eq!(Metadata::SERIALIZED_SIZE, 19);
    }

    #[test]
    fn round_trip() {
        let metadata = sample();
        let mut out = MemoryOutputStream::new();
        metadata.write(&mut out).unwrap();

        let mut input = MemoryInputStream::new(out.into_bytes());
        let parsed = Metadata::detect(&mut input).unwrap().unwrap();
        assert_eq!(parsed, metadata);
    }

    #[test]
    fn legacy_payload_leaves_stream_untouched() {
        let mut input = MemoryInputStream::new(vec![0u8; 32]);
        assert!(Metadata::detect(&mut input).unwrap().is_none());
        assert_eq!(input.position(), 0);
    }

    #[test]
    fn unknown_version_is_rejected_with_hex() {
        let mut out = MemoryOutputStream::new();
        write_all(&mut out, &MAGIC).unwrap();
        write_all(&mut out, &99i32.to_le_bytes()).unwrap();

        let mut input = MemoryInputStream::new(out.into_bytes());
        let err = Metadata::detect(&mut input).unwrap_err();
        match err {
            ProximaError::UnsupportedVersion(version) => assert_eq!(version, 99),
            other => panic!("expected UnsupportedVersion, got {other:?}"),
        }
    }
}
