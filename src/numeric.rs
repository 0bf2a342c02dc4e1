//! Numeric primitives: fp16/bf16 conversions, the GELU lookup table, and the
//! scalar math used by the unary kernels.

use half::{bf16, f16};
use std::sync::OnceLock;

/// Convert an IEEE-754 half-precision bit pattern to `f32`.
#[inline]
pub fn fp16_to_fp32(bits: u16) -> f32 {
    f16::from_bits(bits).to_f32()
}

/// Convert an `f32` to an IEEE-754 half-precision bit pattern.
#[inline]
pub fn fp32_to_fp16(x: f32) -> u16 {
    f16::from_f32(x).to_bits()
}

/// Convert a bfloat16 bit pattern to `f32`.
#[inline]
pub fn bf16_to_fp32(bits: u16) -> f32 {
    bf16::from_bits(bits).to_f32()
}

/// Convert an `f32` to a bfloat16 bit pattern (round-to-nearest-even, via
/// the `half` crate).
#[inline]
pub fn fp32_to_bf16(x: f32) -> u16 {
    bf16::from_f32(x).to_bits()
}

const GELU_COEF_A: f32 = 0.044715;
const SQRT_2_OVER_PI: f32 = 0.797_884_560_802_865_4;

/// `GELU(x) = 0.5 x (1 + tanh(sqrt(2/pi) (x + 0.044715 x^3)))`.
#[inline]
pub fn gelu_f32(x: f32) -> f32 {
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + GELU_COEF_A * x * x * x)).tanh())
}

/// `GELU_quick(x) = x * sigmoid(1.702 x)`.
#[inline]
pub fn gelu_quick_f32(x: f32) -> f32 {
    x * sigmoid_f32(1.702 * x)
}

#[inline]
pub fn sigmoid_f32(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[inline]
pub fn silu_f32(x: f32) -> f32 {
    x * sigmoid_f32(x)
}

#[inline]
pub fn hardswish_f32(x: f32) -> f32 {
    x * (x + 3.0).clamp(0.0, 6.0) / 6.0
}

#[inline]
pub fn hardsigmoid_f32(x: f32) -> f32 {
    (x + 3.0).clamp(0.0, 6.0) / 6.0
}

/// A 65536-entry lookup table keyed on an fp16 bit pattern, built once and
/// shared process-wide: GELU kernels over fp16 data look up a result instead
/// of paying a `tanh` per element, at the cost of fp16-rounding the output.
struct GeluLut {
    gelu: Box<[u16; 65536]>,
    gelu_quick: Box<[u16; 65536]>,
}

static GELU_LUT: OnceLock<GeluLut> = OnceLock::new();

fn gelu_lut() -> &'static GeluLut {
    GELU_LUT.get_or_init(|| {
        let mut gelu = vec![0u16; 65536].into_boxed_slice();
        let mut gelu_quick = vec![0u16; 65536].into_boxed_slice();
        for bits in 0..=u16::MAX {
            let x = fp16_to_fp32(bits);
            gelu[bits as usize] = fp32_to_fp16(gelu_f32(x));
            gelu_quick[bits as usize] = fp32_to_fp16(gelu_quick_f32(x));
        }
        GeluLut {
            gelu: gelu.try_into().unwrap(),
            gelu_quick: gelu_quick.try_into().unwrap(),
        }
    })
}

/// Looks up `GELU` for an fp16 input via the process-wide table.
#[inline]
pub fn gelu_f16_lut(bits: u16) -> u16 {
    gelu_lut().gelu[bits as usize]
}

/// Looks up `GELU_quick` for an fp16 input via the process-wide table.
#[inline]
pub fn gelu_quick_f16_lut(bits: u16) -> u16 {
    gelu_lut().gelu_quick[bits as usize]
}

/// Forces one-shot initialization of the process-wide lookup tables. Called
/// from [`crate::context::Context::init`] the first time a context is
/// created, so the 256KB table build happens once per process rather than
/// racing lazily on the first GELU kernel dispatch.
pub fn ensure_luts_initialized() {
    gelu_lut();
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn fp16_round_trip_preserves_exact_values_and_bounds_rounding_error() {
        let xs = [0.0f32, 1.0, -1.0, 65504.0, 1e-5];
        let mut got = Vec::new();
        for &x in &xs {
            let bits = fp32_to_fp16(x);
            got.push(fp16_to_fp32(bits));
        }
        assert_eq!(got[0], 0.0);
        assert_eq!(got[1], 1.0);
        assert_eq!(got[2], -1.0);
        assert_eq!(got[3], 65504.0);
        // 1e-5 quantizes to one of its two fp16 neighbors.
        assert!((got[4] - 9.89e-06).abs() < 1e-7 || (got[4] - 1e-5).abs() < 2e-7);
    }

    #[test]
    fn gelu_lut_matches_scalar_within_fp16_precision() {
        for bits in [0u16, 0x3C00, 0xBC00, 0x3800, 0x4200] {
            let x = fp16_to_fp32(bits);
            let exact = fp32_to_fp16(gelu_f32(x));
            assert_eq!(gelu_f16_lut(bits), exact);
        }
    }

    #[test]
    fn silu_matches_definition() {
        assert_relative_eq!(silu_f32(0.0), 0.0);
        assert_relative_eq!(silu_f32(1.0), 1.0 * sigmoid_f32(1.0), epsilon = 1e-6);
    }
}
