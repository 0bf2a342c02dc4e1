//! IM2COL and SSM_CONV: patch extraction for convolution-as-matmul, and the
//! depthwise causal convolution used by selective-scan models.

use super::{gather_f32, partition, write_f32_one};
use crate::context::Context;
use crate::tensor::TensorIndex;

#[allow(clippy::too_many_arguments)]
pub fn im2col(
    ctx: &Context,
    node: TensorIndex,
    ith: usize,
    nth: usize,
    stride_w: usize,
    stride_h: usize,
    pad_w: usize,
    pad_h: usize,
    dilation_w: usize,
    dilation_h: usize,
    is_2d: bool,
) {
    let t = ctx.tensor(node);
    let (in_idx, k_idx) = (t.src[0], t.src[1]);
    let ti = ctx.tensor(in_idx).clone();
    let tk = ctx.tensor(k_idx).clone();

    let (iw, ih, ic) = (ti.ne[0], ti.ne[1], ti.ne[2]);
    let (kw, kh) = (tk.ne[0], tk.ne[1].max(1));
    let ow = t.ne[1];
    let oh = if is_2d { t.ne[2] } else { 1 };
    let patch = t.ne[0] as usize;

    let input = gather_f32(ctx, in_idx);

    let total_px = t.nelements() as usize / patch;
    let (r0, r1) = partition(total_px, ith, nth);

    for flat in r0..r1 {
        let ow_i = flat as i64 % ow;
        let rest = flat as i64 / ow;
        let (oh_i, b_i) = if is_2d { (rest % oh, rest / oh) } else { (0, rest) };

        let mut out_row = vec![0f32; patch];
        let mut p = 0usize;
        for c in 0..ic {
            for khh in 0..kh {
                for kww in 0..kw {
                    let in_x = ow_i * stride_w as i64 - pad_w as i64 + kww * dilation_w as i64;
                    let in_y = if is_2d {
                        oh_i * stride_h as i64 - pad_h as i64 + khh * dilation_h as i64
                    } else {
                        0
                    };
                    let v = if in_x >= 0 && in_x < iw && in_y >= 0 && in_y < ih.max(1) {
                        let flat_in = (in_x + iw * (in_y + ih.max(1) * (c + ic * b_i))) as usize;
                        input[flat_in]
                    } else {
                        0.0
                    };
                    out_row[p] = v;
                    p += 1;
                }
            }
        }
        let out_base = flat * patch;
        for (i, &v) in out_row.iter().enumerate() {
            write_f32_one(ctx, node, out_base + i, v);
        }
    }
}

/// `SSM_CONV(x, conv_weight)`: causal depthwise convolution over the
/// sequence dimension, one kernel per channel.
pub fn ssm_conv(ctx: &Context, node: TensorIndex, ith: usize, nth: usize) {
    let t = ctx.tensor(node);
    let (x_idx, w_idx) = (t.src[0], t.src[1]);
    let tx = ctx.tensor(x_idx).clone();
    let tw = ctx.tensor(w_idx).clone();

    let seq = tx.ne[0] as usize;
    let channels = tx.ne[1] as usize;
    let ksize = tw.ne[0] as usize;

    let x = gather_f32(ctx, x_idx);
    let w = gather_f32(ctx, w_idx);

    let (c0, c1) = partition(channels, ith, nth);
    for c in c0..c1 {
        for time in 0..seq {
            let mut acc = 0f32;
            for k in 0..ksize {
                let src_t = time as i64 - (ksize as i64 - 1) + k as i64;
                if src_t >= 0 {
                    acc += x[c * seq + src_t as usize] * w[c * ksize + k];
                }
            }
            write_f32_one(ctx, node, c * seq + time, acc);
        }
    }
}
