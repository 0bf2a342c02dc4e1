//! SOFT_MAX: row-wise softmax with an optional additive mask and ALiBi
//! position bias.

use super::{gather_f32, row_partition, write_f32_one};
use crate::context::Context;
use crate::tensor::TensorIndex;

/// ALiBi's per-head slope: heads below the nearest power-of-two bucket get
/// one geometric schedule, heads above get a second, finer one, so slopes
/// stay well-behaved for head counts that aren't themselves a power of two.
pub(crate) fn alibi_slope(h: usize, n_head: usize, max_bias: f32) -> f32 {
    if max_bias <= 0.0 {
        return 1.0;
    }
    let n_head_log2 = 2f32.powf((n_head.max(1) as f32).log2().floor()) as usize;
    let m0 = 2f32.powf(-max_bias / n_head_log2 as f32);
    let m1 = 2f32.powf(-(max_bias / 2.0) / n_head_log2 as f32);
    if h < n_head_log2 {
        m0.powi((h + 1) as i32)
    } else {
        m1.powi((2 * (h - n_head_log2) + 1) as i32)
    }
}

pub fn eval(ctx: &Context, node: TensorIndex, ith: usize, nth: usize, scale: f32, max_bias: f32) {
    let t = ctx.tensor(node);
    let ne = t.ne;
    let a_idx = t.src[0];
    let mask_idx = t.src.get(1).copied();

    let a = gather_f32(ctx, a_idx);
    let mask = mask_idx.map(|m| (gather_f32(ctx, m), ctx.tensor(m).ne));

    let row_len = ne[0] as usize;
    let n_rows = t.nrows() as usize;
    let n_head = ne[2] as usize;
    let (r0, r1) = row_partition(n_rows as i64, ith, nth);

    let mut buf = vec![0f32; row_len];
    for row in r0..r1 {
        let i1 = row % ne[1] as usize;
        let rest = row / ne[1] as usize;
        let i2 = rest % ne[2] as usize;
        let i3 = rest / ne[2] as usize;
        let slope = alibi_slope(i2, n_head, max_bias);

        let row_slice = &a[row * row_len..(row + 1) * row_len];
        for (i0, &x) in row_slice.iter().enumerate() {
            let mut v = x * scale;
            if let Some((mvals, mne)) = &mask {
                let mi0 = i0 % mne[0] as usize;
                let mi1 = i1 % mne[1] as usize;
                let mi2 = i2 % mne[2] as usize;
                let mi3 = i3 % mne[3] as usize;
                let mflat = mi0
                    + mne[0] as usize * (mi1 + mne[1] as usize * (mi2 + mne[2] as usize * mi3));
                v += slope * mvals[mflat];
            }
            buf[i0] = v;
        }

        let max = buf.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0f32;
        for v in buf.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        for v in buf.iter_mut() {
            *v /= sum;
        }
        for (i0, &v) in buf.iter().enumerate() {
            write_f32_one(ctx, node, row * row_len + i0, v);
        }
    }
}
