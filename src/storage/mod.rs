//! On-disk vector storage types and their codecs.
//!
//! An index stores every vector in one of three precisions:
//!
//! - [`f32`]: full 32-bit floats (identity codec),
//! - [`i8`]: signed 8-bit fixed point with scale 1/127, covering
//!   `[-128/127, 1.0]`,
//! - [`E4M3`]: an 8-bit floating-point format (1 sign, 4 exponent, 3
//!   mantissa bits) covering `[-448, 448]`.
//!
//! Distance kernels operate directly on storage values via
//! [`Element::raw`] and rescale accumulated distances once by
//! [`Element::SCALE`]², so the fixed-point codec pays no per-component
//! division during search.

mod e4m3;

pub use e4m3::E4M3;

use crate::error::{ProximaError, Result};

/// The datatype used when storing vectors. Affects precision and memory
/// usage. The discriminants are the on-disk byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StorageDataType {
    /// Signed 8-bit fixed point on `[-128/127, 1.0]` with scale 1/127.
    Float8 = 1 << 4,
    /// 32-bit IEEE floats.
    Float32 = 2 << 4,
    /// 8-bit floating point: 4 exponent bits, 3 mantissa bits, bias 7.
    E4M3 = 3 << 4,
}

impl StorageDataType {
    /// Parse the on-disk byte value.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x10 => Ok(StorageDataType::Float8),
            0x20 => Ok(StorageDataType::Float32),
            0x30 => Ok(StorageDataType::E4M3),
            other => Err(ProximaError::Corrupt(format!(
                "unknown storage data type byte 0x{other:02x}"
            ))),
        }
    }
}

impl std::fmt::Display for StorageDataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StorageDataType::Float8 => "Float8",
            StorageDataType::Float32 => "Float32",
            StorageDataType::E4M3 => "E4M3",
        };
        f.write_str(name)
    }
}

/// A single stored vector component.
///
/// `raw()` exposes the value in the *storage domain*: the fixed-point codec
/// returns the quantized integer as a float, so kernels can accumulate
/// cheaply and apply `SCALE`² once per distance instead of per component.
/// `decode()` recovers the user-facing f32 value.
pub trait Element: Copy + Default + Send + Sync + 'static {
    /// The [`StorageDataType`] this element implements.
    const DATA_TYPE: StorageDataType;

    /// Serialized size in bytes.
    const BYTES: usize;

    /// Multiplier mapping a storage-domain unit back to user space.
    const SCALE: f32;

    /// Smallest encodable value, reported in range errors.
    const MIN_VALUE: f32;

    /// Largest encodable value, reported in range errors.
    const MAX_VALUE: f32;

    /// The storage-domain value used by distance kernels.
    fn raw(self) -> f32;

    /// Encode a user-space value. `None` means the value is outside the
    /// representable range.
    fn encode(value: f32) -> Option<Self>;

    /// Recover the user-space value.
    #[inline]
    fn decode(self) -> f32 {
        self.raw() * Self::SCALE
    }

    /// Write the wire representation into `dst` (`dst.len() == BYTES`).
    fn to_wire(self, dst: &mut [u8]);

    /// Read the wire representation from `src` (`src.len() == BYTES`).
    fn from_wire(src: &[u8]) -> Self;
}

impl Element for f32 {
    const DATA_TYPE: StorageDataType = StorageDataType::Float32;
    const BYTES: usize = 4;
    const SCALE: f32 = 1.0;
    const MIN_VALUE: f32 = f32::NEG_INFINITY;
    const MAX_VALUE: f32 = f32::INFINITY;

    #[inline]
    fn raw(self) -> f32 {
        self
    }

    #[inline]
    fn encode(value: f32) -> Option<Self> {
        Some(value)
    }

    #[inline]
    fn to_wire(self, dst: &mut [u8]) {
        dst.copy_from_slice(&self.to_le_bytes());
    }

    #[inline]
    fn from_wire(src: &[u8]) -> Self {
        f32::from_le_bytes([src[0], src[1], src[2], src[3]])
    }
}

impl Element for i8 {
    const DATA_TYPE: StorageDataType = StorageDataType::Float8;
    const BYTES: usize = 1;
    const SCALE: f32 = 1.0 / 127.0;
    const MIN_VALUE: f32 = i8::MIN as f32 / 127.0;
    const MAX_VALUE: f32 = i8::MAX as f32 / 127.0;

    #[inline]
    fn raw(self) -> f32 {
        self as f32
    }

    #[inline]
    fn encode(value: f32) -> Option<Self> {
        // NaN fails the range check as well. Truncation toward zero (rather
        // than rounding) keeps quantized norms bounded by the input norm,
        // which the cosine path's negative-distance tolerance relies on.
        if !(Self::MIN_VALUE..=Self::MAX_VALUE).contains(&value) {
            return None;
        }
        Some((value * 127.0) as i8)
    }

    #[inline]
    fn to_wire(self, dst: &mut [u8]) {
        dst[0] = self as u8;
    }

    #[inline]
    fn from_wire(src: &[u8]) -> Self {
        src[0] as i8
    }
}

/// Encode a float slice into storage values.
///
/// Fails closed: the first out-of-range component aborts the call and the
/// destination contents are unspecified.
pub fn encode_vector<E: Element>(src: &[f32], dst: &mut [E]) -> Result<()> {
    debug_assert_eq!(src.len(), dst.len());
    for (index, (&value, out)) in src.iter().zip(dst.iter_mut()).enumerate() {
        *out = E::encode(value).ok_or(ProximaError::OutOfRange {
            index,
            value,
            lo: E::MIN_VALUE,
            hi: E::MAX_VALUE,
        })?;
    }
    Ok(())
}

/// Decode storage values back into user-space floats.
pub fn decode_vector<E: Element>(src: &[E], dst: &mut [f32]) {
    debug_assert_eq!(src.len(), dst.len());
    for (&value, out) in src.iter().zip(dst.iter_mut()) {
        *out = value.decode();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn float32_is_identity() {
        let src = [0.25f32, -3.5, 1e30, f32::NAN];
        let mut enc = [0.0f32; 4];
        encode_vector(&src, &mut enc).unwrap();
        assert_eq!(enc[0], 0.25);
        assert!(enc[3].is_nan());
    }

    #[test]
    fn float8_round_trips_within_step() {
        let src = [0.5f32, -1.0, 0.0, 1.0, -128.0 / 127.0];
        let mut enc = [0i8; 5];
        encode_vector(&src, &mut enc).unwrap();
        let mut dec = [0.0f32; 5];
        decode_vector(&enc, &mut dec);
        for (a, b) in src.iter().zip(&dec) {
            assert!((a - b).abs() <= 1.0 / 127.0, "{a} decoded to {b}");
        }
    }

    #[test]
    fn float8_rejects_out_of_range() {
        let err = encode_vector(&[0.5f32, 1.5], &mut [0i8; 2]).unwrap_err();
        match err {
            ProximaError::OutOfRange { index, value, .. } => {
                assert_eq!(index, 1);
                assert_eq!(value, 1.5);
            }
            other => panic!("expected OutOfRange, got {other:?}"),
        }
    }

    #[test]
    fn float8_rejects_nan() {
        assert!(<i8 as Element>::encode(f32::NAN).is_none());
    }

    #[test]
    fn float8_bounds_are_exact() {
        assert_eq!(<i8 as Element>::encode(1.0), Some(127));
        assert_eq!(<i8 as Element>::encode(-128.0 / 127.0), Some(-128));
        assert!(<i8 as Element>::encode(1.001).is_none());
    }

    #[test]
    fn storage_type_bytes_round_trip() {
        for ty in [
            StorageDataType::Float8,
            StorageDataType::Float32,
            StorageDataType::E4M3,
        ] {
            assert_eq!(StorageDataType::from_byte(ty as u8).unwrap(), ty);
        }
        assert!(StorageDataType::from_byte(0x40).is_err());
    }

    proptest! {
        #[test]
        fn float8_round_trip_error_bounded(x in -1.0f32..=1.0) {
            let q = <i8 as Element>::encode(x).unwrap();
            prop_assert!((q.decode() - x).abs() < 1.0 / 127.0);
        }

        /// Truncation never inflates magnitudes, so quantized norms are
        /// bounded by the input norm.
        #[test]
        fn float8_encoding_never_grows_magnitude(x in -1.0f32..=1.0) {
            let q = <i8 as Element>::encode(x).unwrap();
            prop_assert!(q.decode().abs() <= x.abs() + 1e-7);
        }

        #[test]
        fn float8_wire_round_trip(q in i8::MIN..=i8::MAX) {
            let mut buf = [0u8; 1];
            q.to_wire(&mut buf);
            prop_assert_eq!(<i8 as Element>::from_wire(&buf), q);
        }
    }
}
