//! The "K-quant" super-block family: `Q2_K` .. `Q6_K`.
//!
//! Each block covers [`SUPERBLOCK`] elements, split into [`N_SUBBLOCKS`]
//! sub-blocks of [`SUBBLOCK`] elements. Every sub-block carries its own fp16
//! `(scale, min)` pair; elements within a sub-block are asymmetric `bits`-wide
//! codes. Each format's per-sub-block scale and min are stored as their own
//! plain bit-packed fields here rather than sharing a byte region the way a
//! SIMD-oriented layout would, trading some size efficiency for a decode
//! path that's the same shape across all five formats.

use super::bits::{pack_nbit, unpack_nbit};
use half::f16;

pub const SUPERBLOCK: usize = 256;
pub const SUBBLOCK: usize = 16;
pub const N_SUBBLOCKS: usize = SUPERBLOCK / SUBBLOCK;
const HEADER_LEN: usize = N_SUBBLOCKS * 4; // f16 scale + f16 min, per sub-block

/// Byte size of a superblock encoded at `bits` per element.
pub const fn type_size_for_bits(bits: u32) -> usize {
    HEADER_LEN + (SUPERBLOCK * bits as usize).div_ceil(8)
}

fn minmax(xs: &[f32]) -> (f32, f32) {
    xs.iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &x| {
            (lo.min(x), hi.max(x))
        })
}

pub fn quantize_block(bits: u32, src: &[f32], dst: &mut [u8]) {
    debug_assert_eq!(src.len(), SUPERBLOCK);
    debug_assert_eq!(dst.len(), type_size_for_bits(bits));
    let max_code = (1u32 << bits) - 1;
    let mut codes = [0u8; SUPERBLOCK];
    for sb in 0..N_SUBBLOCKS {
        let chunk = &src[sb * SUBBLOCK..(sb + 1) * SUBBLOCK];
        let (min, max) = minmax(chunk);
        let scale = (max - min) / max_code as f32;
        let id = if scale != 0.0 { 1.0 / scale } else { 0.0 };
        let off = sb * 4;
        dst[off..off + 2].copy_from_slice(&f16::from_f32(scale).to_bits().to_le_bytes());
        dst[off + 2..off + 4].copy_from_slice(&f16::from_f32(min).to_bits().to_le_bytes());
        for (i, &x) in chunk.iter().enumerate() {
            codes[sb * SUBBLOCK + i] =
                (((x - min) * id).round() as i32).clamp(0, max_code as i32) as u8;
        }
    }
    let packed = pack_nbit(&codes, bits);
    dst[HEADER_LEN..].copy_from_slice(&packed);
}

pub fn dequantize_block(bits: u32, src: &[u8], dst: &mut [f32]) {
    debug_assert_eq!(src.len(), type_size_for_bits(bits));
    debug_assert_eq!(dst.len(), SUPERBLOCK);
    let codes = unpack_nbit(&src[HEADER_LEN..], bits, SUPERBLOCK);
    for sb in 0..N_SUBBLOCKS {
        let off = sb * 4;
        let scale = f16::from_bits(u16::from_le_bytes([src[off], src[off + 1]])).to_f32();
        let min = f16::from_bits(u16::from_le_bytes([src[off + 2], src[off + 3]])).to_f32();
        for i in 0..SUBBLOCK {
            dst[sb * SUBBLOCK + i] = codes[sb * SUBBLOCK + i] as f32 * scale + min;
        }
    }
}

macro_rules! kquant_module {
    ($name:ident, $bits:expr) => {
        #[doc = concat!("`", stringify!($name), "`: ", stringify!($bits), "-bit codes over a 256-element superblock.")]
        pub mod $name {
            use super::*;
            /// Bits per element.
            pub const BITS: u32 = $bits;
            /// Encoded byte size per 256-element block.
            pub const TYPE_SIZE: usize = type_size_for_bits(BITS);

            pub fn quantize_block(src: &[f32], dst: &mut [u8]) {
                super::quantize_block(BITS, src, dst)
            }

            pub fn dequantize_block(src: &[u8], dst: &mut [f32]) {
                super::dequantize_block(BITS, src, dst)
            }
        }
    };
}

kquant_module!(q2_k, 2);
kquant_module!(q3_k, 3);
kquant_module!(q4_k, 4);
kquant_module!(q5_k, 5);
kquant_module!(q6_k, 6);

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> Vec<f32> {
        (0..SUPERBLOCK).map(|i| (i as f32 - 128.0) * 0.05).collect()
    }

    macro_rules! round_trip_test {
        ($name:ident, $module:ident) => {
            #[test]
            fn $name() {
                let src = ramp();
                let mut enc = vec![0u8; $module::TYPE_SIZE];
                $module::quantize_block(&src, &mut enc);
                let mut dec = vec![0.0f32; SUPERBLOCK];
                $module::dequantize_block(&enc, &mut dec);
                let span = src
                    .iter()
                    .cloned()
                    .fold(0.0f32, f32::max)
                    - src.iter().cloned().fold(0.0f32, f32::min);
                for (a, b) in src.iter().zip(dec.iter()) {
                    assert!((a - b).abs() / span.max(1e-6) < 0.15, "{a} vs {b}");
                }
            }
        };
    }

    round_trip_test!(q2_k_round_trips, q2_k);
    round_trip_test!(q3_k_round_trips, q3_k);
    round_trip_test!(q4_k_round_trips, q4_k);
    round_trip_test!(q5_k_round_trips, q5_k);
    round_trip_test!(q6_k_round_trips, q6_k);

    #[test]
    fn smaller_bit_width_is_lossier() {
        let src = ramp();
        let mut err_for = |bits: u32| -> f32 {
            let size = type_size_for_bits(bits);
            let mut enc = vec![0u8; size];
            quantize_block(bits, &src, &mut enc);
            let mut dec = vec![0.0f32; SUPERBLOCK];
            dequantize_block(bits, &enc, &mut dec);
            src.iter()
                .zip(dec.iter())
                .map(|(a, b)| (a - b).abs())
                .fold(0.0f32, f32::max)
        };
        assert!(err_for(2) >= err_for(6));
    }
}
