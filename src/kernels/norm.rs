//! NORM / RMS_NORM / GROUP_NORM: row- and group-wise normalization.

use super::{gather_f32, row_partition, write_f32_one, write_f32_range};
use crate::context::Context;
use crate::tensor::TensorIndex;

fn generic_norm(
    ctx: &Context,
    node: TensorIndex,
    ith: usize,
    nth: usize,
    eps: f32,
    subtract_mean: bool,
) {
    let t = ctx.tensor(node);
    let ne = t.ne;
    let a_idx = t.src[0];
    let a = gather_f32(ctx, a_idx);
    let row_len = ne[0] as usize;
    let n_rows = t.nrows() as usize;
    let (r0, r1) = row_partition(n_rows as i64, ith, nth);

    let mut out = Vec::with_capacity((r1 - r0) * row_len);
    for row in r0..r1 {
        let row_slice = &a[row * row_len..(row + 1) * row_len];
        let mean = if subtract_mean {
            row_slice.iter().sum::<f32>() / row_len as f32
        } else {
            0.0
        };
        let var = row_slice
            .iter()
            .map(|&x| {
                let d = x - mean;
                d * d
            })
            .sum::<f32>()
            / row_len as f32;
        let scale = 1.0 / (var + eps).sqrt();
        out.extend(row_slice.iter().map(|&x| (x - mean) * scale));
    }
    write_f32_range(ctx, node, r0 * row_len, &out);
}

/// `NORM(a, eps)`: per-row mean/variance normalization.
pub fn norm(ctx: &Context, node: TensorIndex, ith: usize, nth: usize, eps: f32) {
    generic_norm(ctx, node, ith, nth, eps, true);
}

/// `RMS_NORM(a, eps)`: per-row scale by `1/sqrt(mean(x^2) + eps)`, no mean
/// subtraction.
pub fn rms_norm(ctx: &Context, node: TensorIndex, ith: usize, nth: usize, eps: f32) {
    generic_norm(ctx, node, ith, nth, eps, false);
}

/// `GROUP_NORM(a, n_groups, eps)`: normalizes each of `n_groups` contiguous
/// slices of the channel dimension (`ne[2]`) independently, over the
/// channel's whole `(ne[0], ne[1])` plane.
pub fn group_norm(ctx: &Context, node: TensorIndex, ith: usize, nth: usize, n_groups: usize, eps: f32) {
    let t = ctx.tensor(node);
    let ne = t.ne;
    let a_idx = t.src[0];
    let a = gather_f32(ctx, a_idx);

    let channels = ne[2] as usize;
    let group_size = (channels / n_groups.max(1)).max(1);
    let plane = (ne[0] * ne[1]) as usize;
    let batch = ne[3] as usize;

    let total_groups = n_groups * batch;
    let (g0, g1) = row_partition(total_groups as i64, ith, nth);

    for gi in g0..g1 {
        let b = gi / n_groups;
        let g = gi % n_groups;
        let c_start = g * group_size;
        let c_end = (c_start + group_size).min(channels);
        let base = b * channels * plane;

        let mut sum = 0f32;
        let mut count = 0usize;
        for c in c_start..c_end {
            let off = base + c * plane;
            sum += a[off..off + plane].iter().sum::<f32>();
            count += plane;
        }
        let mean = if count > 0 { sum / count as f32 } else { 0.0 };

        let mut var = 0f32;
        for c in c_start..c_end {
            let off = base + c * plane;
            var += a[off..off + plane]
                .iter()
                .map(|&x| (x - mean) * (x - mean))
                .sum::<f32>();
        }
        var = if count > 0 { var / count as f32 } else { 0.0 };
        let scale = 1.0 / (var + eps).sqrt();

        for c in c_start..c_end {
            let off = base + c * plane;
            for k in 0..plane {
                write_f32_one(ctx, node, off + k, (a[off + k] - mean) * scale);
            }
        }
    }
}
