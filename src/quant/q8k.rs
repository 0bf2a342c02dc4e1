//! `Q8_K`: the 256-wide 8-bit type that `Q2_K..Q6_K` convert their second
//! matmul operand to before the inner dot-product loop.

use crate::quant::kquant::{N_SUBBLOCKS, SUBBLOCK, SUPERBLOCK};

pub const BLOCK: usize = SUPERBLOCK;
/// `d: f32` + `qs: [i8; 256]` + `bsums: [i16; 16]`.
pub const TYPE_SIZE: usize = 4 + SUPERBLOCK + N_SUBBLOCKS * 2;

pub fn quantize_block(src: &[f32], dst: &mut [u8]) {
    debug_assert_eq!(src.len(), BLOCK);
    debug_assert_eq!(dst.len(), TYPE_SIZE);
    let amax = src.iter().fold(0.0f32, |a, &b| a.max(b.abs()));
    let d = amax / 127.0;
    let id = if d != 0.0 { 1.0 / d } else { 0.0 };
    let mut qs = [0i8; SUPERBLOCK];
    for (i, &x) in src.iter().enumerate() {
        qs[i] = (x * id).round().clamp(-128.0, 127.0) as i8;
    }
    let mut bsums = [0i16; N_SUBBLOCKS];
    for sb in 0..N_SUBBLOCKS {
        bsums[sb] = qs[sb * SUBBLOCK..(sb + 1) * SUBBLOCK]
            .iter()
            .map(|&q| q as i32)
            .sum::<i32>() as i16;
    }
    dst[0..4].copy_from_slice(&d.to_le_bytes());
    for i in 0..SUPERBLOCK {
        dst[4 + i] = qs[i] as u8;
    }
    let bsum_off = 4 + SUPERBLOCK;
    for (sb, &s) in bsums.iter().enumerate() {
        dst[bsum_off + sb * 2..bsum_off + sb * 2 + 2].copy_from_slice(&s.to_le_bytes());
    }
}

pub fn dequantize_block(src: &[u8], dst: &mut [f32]) {
    debug_assert_eq!(src.len(), TYPE_SIZE);
    debug_assert_eq!(dst.len(), BLOCK);
    let d = f32::from_le_bytes([src[0], src[1], src[2], src[3]]);
    for i in 0..SUPERBLOCK {
        dst[i] = (src[4 + i] as i8) as f32 * d;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_within_one_code() {
        let src: Vec<f32> = (0..BLOCK).map(|i| (i as f32 - 128.0) * 0.1).collect();
        let mut enc = vec![0u8; TYPE_SIZE];
        quantize_block(&src, &mut enc);
        let mut dec = vec![0.0f32; BLOCK];
        dequantize_block(&enc, &mut dec);
        let amax = src.iter().fold(0.0f32, |a, &b| a.max(b.abs())).max(1e-6);
        let step = amax / 127.0;
        for (a, b) in src.iter().zip(dec.iter()) {
            assert!((a - b).abs() <= step * 1.01, "{a} vs {b} step={step}");
        }
    }
}
