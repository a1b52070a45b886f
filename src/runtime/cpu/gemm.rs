//! Tile GEMM reference kernel
//!
//! Computes `C = beta * C + alpha * A * B^T` on square row-major tiles. With
//! the `rayon` feature, rows of C are processed in parallel.

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Reference tile GEMM: `C = beta * C + alpha * A * B^T`
///
/// # Arguments
/// * `a` - Tile A (dim × dim), row-major
/// * `b` - Tile B (dim × dim), row-major, used transposed
/// * `c` - Tile C (dim × dim), row-major, updated in place
/// * `dim` - Tile dimension
///
/// # Panics
/// Panics if any slice does not hold exactly `dim * dim` elements.
pub fn gemm_nt(a: &[f32], b: &[f32], c: &mut [f32], dim: usize, alpha: f32, beta: f32) {
    let len = dim * dim;
    assert_eq!(a.len(), len, "gemm_nt: A must hold {len} elements");
    assert_eq!(b.len(), len, "gemm_nt: B must hold {len} elements");
    assert_eq!(c.len(), len, "gemm_nt: C must hold {len} elements");
    if dim == 0 {
        return;
    }

    #[cfg(feature = "rayon")]
    c.par_chunks_mut(dim)
        .enumerate()
        .for_each(|(i, row)| gemm_row(a, b, row, i, dim, alpha, beta));

    #[cfg(not(feature = "rayon"))]
    c.chunks_mut(dim)
        .enumerate()
        .for_each(|(i, row)| gemm_row(a, b, row, i, dim, alpha, beta));
}

/// One output row: both A's row and B's row are contiguous, so the inner
/// product walks memory linearly.
#[inline]
fn gemm_row(a: &[f32], b: &[f32], row: &mut [f32], i: usize, dim: usize, alpha: f32, beta: f32) {
    let a_row = &a[i * dim..(i + 1) * dim];
    for (j, out) in row.iter_mut().enumerate() {
        let b_row = &b[j * dim..(j + 1) * dim];
        let dot: f32 = a_row.iter().zip(b_row).map(|(x, y)| x * y).sum();
        *out = beta * *out + alpha * dot;
    }
}
