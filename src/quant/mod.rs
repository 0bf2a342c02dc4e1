//! Quantization kernels: per-format `quantize`/`dequantize` and the shared
//! dequantize-and-multiply dot product.

pub mod bits;
pub mod dense;
pub mod kquant;
pub mod q8k;

use crate::dtype::Type;

/// Dot product of two rows of `n` logical scalars, one encoded as `tx`, the
/// other as `ty`. Accumulates in fp32 regardless of either operand's
/// storage type. Dequantizes the whole row up front rather than
/// block-at-a-time, which is numerically equivalent for any block size
/// that evenly divides `n` — true of every type in the registry — and lets
/// both operands share the same inner product loop no matter which pair of
/// types they're encoded as. `matmul`'s hot path avoids paying this cost
/// for `x` on every call by pre-converting it into `y`'s `vec_dot_type`
/// once per row instead.
pub fn generic_vec_dot(n: usize, tx: Type, x: &[u8], ty: Type, y: &[u8]) -> f32 {
    let mut xf = vec![0f32; n];
    let mut yf = vec![0f32; n];
    (tx.descriptor().to_float)(x, &mut xf);
    (ty.descriptor().to_float)(y, &mut yf);
    xf.iter().zip(yf.iter()).map(|(a, b)| a * b).sum()
}

/// Quantizes an entire row-major buffer of `n_elements` scalars (whose
/// leading dimension is `n_elements_0`) into `ty`'s packed form, one row at
/// a time.
pub fn quantize_rows(src: &[f32], n_elements: usize, n_elements_0: usize, ty: Type) -> Vec<u8> {
    assert_eq!(src.len(), n_elements);
    assert_eq!(n_elements % n_elements_0, 0, "row length must be exact");
    let desc = ty.descriptor();
    assert_eq!(
        n_elements_0 % desc.block_size,
        0,
        "block size must divide the row length"
    );
    let row_blocks = n_elements_0 / desc.block_size;
    let row_bytes = row_blocks * desc.type_size;
    let n_rows = n_elements / n_elements_0;
    let mut out = vec![0u8; n_rows * row_bytes];
    let from_float = desc
        .from_float
        .expect("type has no quantize function (write-once/repack-only format)");
    for row in 0..n_rows {
        from_float(
            &src[row * n_elements_0..(row + 1) * n_elements_0],
            &mut out[row * row_bytes..(row + 1) * row_bytes],
        );
    }
    out
}

/// Dequantizes the inverse of [`quantize_rows`].
pub fn dequantize_rows(src: &[u8], n_elements: usize, n_elements_0: usize, ty: Type) -> Vec<f32> {
    let desc = ty.descriptor();
    assert_eq!(n_elements % n_elements_0, 0);
    let row_blocks = n_elements_0 / desc.block_size;
    let row_bytes = row_blocks * desc.type_size;
    let n_rows = n_elements / n_elements_0;
    let mut out = vec![0f32; n_elements];
    for row in 0..n_rows {
        (desc.to_float)(
            &src[row * row_bytes..(row + 1) * row_bytes],
            &mut out[row * n_elements_0..(row + 1) * n_elements_0],
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_then_dequantize_rows_bounded_error() {
        let ty = Type::Q4_0;
        let n0 = 64usize; // 2 blocks of 32
        let n_rows = 3;
        let src: Vec<f32> = (0..n0 * n_rows).map(|i| (i as f32 * 0.1).sin()).collect();
        let packed = quantize_rows(&src, src.len(), n0, ty);
        let back = dequantize_rows(&packed, src.len(), n0, ty);
        let max_err = src
            .iter()
            .zip(back.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(max_err < 0.2, "max_err={max_err}");
    }

    #[test]
    fn generic_vec_dot_matches_f32_reference() {
        let a = [1.0f32, 2.0, 3.0, 4.0];
        let b = [10.0f32, 0.0, 0.0, 0.0];
        let mut ab = vec![0u8; a.len() * 4];
        let mut bb = vec![0u8; b.len() * 4];
        (Type::F32.descriptor().from_float.unwrap())(&a, &mut ab);
        (Type::F32.descriptor().from_float.unwrap())(&b, &mut bb);
        let got = generic_vec_dot(a.len(), Type::F32, &ab, Type::F32, &bb);
        assert_eq!(got, 10.0);
    }
}
