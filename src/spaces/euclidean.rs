//! Squared Euclidean distance kernels.

use super::DistanceFn;
use crate::storage::Element;

/// Squared L2 distance with a `K`-wide unrolled body and a scalar tail.
///
/// Accumulates in the storage domain and rescales once at the end, so
/// fixed-point storage pays no per-component division.
fn l2_sqr<E: Element, const K: usize>(a: &[E], b: &[E]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let main = a.len() - a.len() % K;
    let mut sum = 0.0f32;
    for (ca, cb) in a[..main].chunks_exact(K).zip(b[..main].chunks_exact(K)) {
        for j in 0..K {
            let d = ca[j].raw() - cb[j].raw();
            sum += d * d;
        }
    }
    for (x, y) in a[main..].iter().zip(b[main..].iter()) {
        let d = x.raw() - y.raw();
        sum += d * d;
    }
    sum * (E::SCALE * E::SCALE)
}

/// Pick the unroll factor for `dim` once, at index construction.
pub fn euclidean_distance_fn<E: Element>(dim: usize) -> DistanceFn<E> {
    if dim % 128 == 0 {
        l2_sqr::<E, 128>
    } else if dim % 64 == 0 {
        l2_sqr::<E, 64>
    } else if dim % 32 == 0 {
        l2_sqr::<E, 32>
    } else if dim % 16 == 0 {
        l2_sqr::<E, 16>
    } else if dim % 8 == 0 {
        l2_sqr::<E, 8>
    } else if dim % 4 == 0 {
        l2_sqr::<E, 4>
    } else if dim > 128 {
        l2_sqr::<E, 128>
    } else if dim > 64 {
        l2_sqr::<E, 64>
    } else if dim > 32 {
        l2_sqr::<E, 32>
    } else if dim > 16 {
        l2_sqr::<E, 16>
    } else if dim > 8 {
        l2_sqr::<E, 8>
    } else if dim > 4 {
        l2_sqr::<E, 4>
    } else {
        l2_sqr::<E, 1>
    }
}
