//! Distance spaces: metric selection, normalization, and the unrolled
//! scalar kernels.
//!
//! Each kernel is generic over the storage [`Element`] and a const unroll
//! factor `K`. At index creation the largest `K` in
//! `{128, 64, 32, 16, 8, 4}` dividing the dimensionality is chosen;
//! otherwise the kernel runs the `K`-wide body over the largest multiple of
//! `K` and finishes with a scalar tail. The bodies are written so the
//! compiler can vectorize them; there is no hand-written SIMD path.

mod euclidean;
mod inner_product;

pub use euclidean::euclidean_distance_fn;
pub use inner_product::{cosine_distance_fn, inner_product_distance_fn};

use crate::error::{ProximaError, Result};
use crate::storage::Element;

/// The space (i.e. distance metric) to use for searching. The
/// discriminants are the on-disk byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Space {
    /// Squared Euclidean (L2) distance.
    Euclidean = 0,
    /// Inner product distance `1 - a·b`.
    InnerProduct = 1,
    /// Cosine distance `1 - cos(a, b)`.
    Cosine = 2,
}

impl Space {
    /// Parse the on-disk byte value.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Space::Euclidean),
            1 => Ok(Space::InnerProduct),
            2 => Ok(Space::Cosine),
            other => {
                Err(ProximaError::Corrupt(format!("unknown space type byte {other}")))
            }
        }
    }
}

impl std::fmt::Display for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Space::Euclidean => "Euclidean",
            Space::InnerProduct => "InnerProduct",
            Space::Cosine => "Cosine",
        };
        f.write_str(name)
    }
}

/// A distance kernel chosen at index creation time.
pub type DistanceFn<E> = fn(&[E], &[E]) -> f32;

/// Select the kernel for a space and dimensionality.
///
/// The `Cosine` space uses the inner-product kernel: the index normalizes
/// vectors before encoding, which makes `1 - a·b` equal to the cosine
/// distance while skipping the norm computation.
pub fn distance_fn<E: Element>(space: Space, dim: usize) -> DistanceFn<E> {
    match space {
        Space::Euclidean => euclidean_distance_fn::<E>(dim),
        Space::InnerProduct | Space::Cosine => inner_product_distance_fn::<E>(dim),
    }
}

/// L2 norm of a vector.
#[inline]
#[must_use]
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Normalize `src` to unit L2 norm, writing into `dst`.
///
/// The epsilon keeps the all-zero vector finite instead of dividing by
/// zero.
pub fn normalize_into(src: &[f32], dst: &mut [f32]) {
    debug_assert_eq!(src.len(), dst.len());
    let inv = 1.0 / (l2_norm(src) + 1e-30);
    for (x, out) in src.iter().zip(dst.iter_mut()) {
        *out = x * inv;
    }
}

/// Normalize a vector to unit L2 norm.
#[must_use]
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let mut out = vec![0.0; v.len()];
    normalize_into(v, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_produces_unit_norm() {
        let v = normalize(&[3.0, 4.0]);
        assert!((l2_norm(&v) - 1.0).abs() < 1e-6);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn normalize_handles_zero_vector() {
        let v = normalize(&[0.0, 0.0, 0.0]);
        assert!(v.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn space_bytes_round_trip() {
        for space in [Space::Euclidean, Space::InnerProduct, Space::Cosine] {
            assert_eq!(Space::from_byte(space as u8).unwrap(), space);
        }
        assert!(Space::from_byte(3).is_err());
    }

    #[test]
    fn cosine_space_uses_inner_product_kernel() {
        // Normalized inputs: the two kernels must agree.
        let a = normalize(&[1.0, 2.0, 3.0, 4.0]);
        let b = normalize(&[4.0, 3.0, 2.0, 1.0]);
        let ip = distance_fn::<f32>(Space::Cosine, 4);
        let cos = cosine_distance_fn::<f32>(4);
        assert!((ip(&a, &b) - cos(&a, &b)).abs() < 1e-6);
    }
}
