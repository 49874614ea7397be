//! Inner-product and cosine distance kernels.

use super::DistanceFn;
use crate::storage::Element;

/// Unscaled dot product with a `K`-wide unrolled body and a scalar tail.
#[inline]
fn dot_unscaled<E: Element, const K: usize>(a: &[E], b: &[E]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let main = a.len() - a.len() % K;
    let mut sum = 0.0f32;
    for (ca, cb) in a[..main].chunks_exact(K).zip(b[..main].chunks_exact(K)) {
        for j in 0..K {
            sum += ca[j].raw() * cb[j].raw();
        }
    }
    for (x, y) in a[main..].iter().zip(b[main..].iter()) {
        sum += x.raw() * y.raw();
    }
    sum
}

/// Inner product distance: `1 - a·b·scale²`.
fn inner_product<E: Element, const K: usize>(a: &[E], b: &[E]) -> f32 {
    1.0 - dot_unscaled::<E, K>(a, b) * (E::SCALE * E::SCALE)
}

/// Cosine distance: `1 - (a·b·scale²) / (‖a‖·‖b‖)`.
///
/// The norms stay in the storage domain while the numerator is rescaled,
/// mirroring how the inner-product kernel reports distances.
fn cosine<E: Element, const K: usize>(a: &[E], b: &[E]) -> f32 {
    let dot = dot_unscaled::<E, K>(a, b);
    let mag_sq_a = dot_unscaled::<E, K>(a, a);
    let mag_sq_b = dot_unscaled::<E, K>(b, b);
    let denominator = mag_sq_a.sqrt() * mag_sq_b.sqrt();
    1.0 - dot * (E::SCALE * E::SCALE) / denominator
}

macro_rules! unroll_dispatch {
    ($kernel:ident, $dim:expr) => {
        if $dim % 128 == 0 {
            $kernel::<E, 128>
        } else if $dim % 64 == 0 {
            $kernel::<E, 64>
        } else if $dim % 32 == 0 {
            $kernel::<E, 32>
        } else if $dim % 16 == 0 {
            $kernel::<E, 16>
        } else if $dim % 8 == 0 {
            $kernel::<E, 8>
        } else if $dim % 4 == 0 {
            $kernel::<E, 4>
        } else if $dim > 128 {
            $kernel::<E, 128>
        } else if $dim > 64 {
            $kernel::<E, 64>
        } else if $dim > 32 {
            $kernel::<E, 32>
        } else if $dim > 16 {
            $kernel::<E, 16>
        } else if $dim > 8 {
            $kernel::<E, 8>
        } else if $dim > 4 {
            $kernel::<E, 4>
        } else {
            $kernel::<E, 1>
        }
    };
}

/// Pick the inner-product kernel for `dim` once, at index construction.
pub fn inner_product_distance_fn<E: Element>(dim: usize) -> DistanceFn<E> {
    unroll_dispatch!(inner_product, dim)
}

/// Pick the cosine kernel for `dim` once, at index construction.
pub fn cosine_distance_fn<E: Element>(dim: usize) -> DistanceFn<E> {
    unroll_dispatch!(cosine, dim)
}
