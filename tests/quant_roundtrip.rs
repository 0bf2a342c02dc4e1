//! Quantize-then-dequantize accuracy for a representative sample of the
//! dense and K-quant formats. Not an exhaustive grid — one dense, one
//! asymmetric-dense, and one K-quant format, checked against a
//! format-appropriate tolerance.

use cgml::dtype::Type;
use cgml::quant::{dequantize_rows, quantize_rows};

fn ramp(n: usize) -> Vec<f32> {
    (0..n).map(|i| (i as f32 - n as f32 / 2.0) * 0.1).collect()
}

fn max_abs_err(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}

#[test]
fn q8_0_round_trips_within_tight_tolerance() {
    let src = ramp(32 * 4);
    let packed = quantize_rows(&src, src.len(), src.len(), Type::Q8_0);
    let back = dequantize_rows(&packed, src.len(), src.len(), Type::Q8_0);
    assert_eq!(back.len(), src.len());
    assert!(max_abs_err(&src, &back) < 0.02, "Q8_0 error too large: {:?}", max_abs_err(&src, &back));
}

#[test]
fn q4_1_round_trips_within_block_range_tolerance() {
    let src = ramp(32 * 4);
    let packed = quantize_rows(&src, src.len(), src.len(), Type::Q4_1);
    let back = dequantize_rows(&packed, src.len(), src.len(), Type::Q4_1);
    assert_eq!(back.len(), src.len());
    // 4-bit codes span a 32-element block; error is coarser than Q8_0.
    assert!(max_abs_err(&src, &back) < 0.3, "Q4_1 error too large: {:?}", max_abs_err(&src, &back));
}

#[test]
fn q4_k_round_trips_within_superblock_tolerance() {
    let src = ramp(256 * 2);
    let packed = quantize_rows(&src, src.len(), src.len(), Type::Q4_K);
    let back = dequantize_rows(&packed, src.len(), src.len(), Type::Q4_K);
    assert_eq!(back.len(), src.len());
    assert!(max_abs_err(&src, &back) < 0.3, "Q4_K error too large: {:?}", max_abs_err(&src, &back));
}

#[test]
fn vec_dot_of_identical_quantized_rows_matches_dequantized_fp32_dot() {
    let src = ramp(32 * 2);
    let packed = quantize_rows(&src, src.len(), src.len(), Type::Q8_0);
    let dequantized = dequantize_rows(&packed, src.len(), src.len(), Type::Q8_0);
    let expected: f32 = dequantized.iter().map(|v| v * v).sum();
    let dot = cgml::quant::generic_vec_dot(src.len(), Type::Q8_0, &packed, Type::Q8_0, &packed);
    assert!((dot - expected).abs() < 1e-2);
}
