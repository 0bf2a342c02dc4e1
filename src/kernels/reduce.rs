//! SUM / MEAN / REPEAT / GET_ROWS: full-tensor reductions, broadcast
//! expansion, and row gather by index.

use super::{gather_f32, partition, write_f32_one, write_f32_range};
use crate::context::Context;
use crate::tensor::TensorIndex;

pub fn sum(ctx: &Context, node: TensorIndex, ith: usize, _nth: usize) {
    if ith != 0 {
        return;
    }
    let a_idx = ctx.tensor(node).src[0];
    let total: f32 = gather_f32(ctx, a_idx).iter().sum();
    write_f32_one(ctx, node, 0, total);
}

pub fn mean(ctx: &Context, node: TensorIndex, ith: usize, _nth: usize) {
    if ith != 0 {
        return;
    }
    let a_idx = ctx.tensor(node).src[0];
    let a = gather_f32(ctx, a_idx);
    let n = a.len().max(1) as f32;
    write_f32_one(ctx, node, 0, a.iter().sum::<f32>() / n);
}

pub fn repeat(ctx: &Context, node: TensorIndex, ith: usize, nth: usize) {
    let t = ctx.tensor(node);
    let ne = t.ne;
    let a_idx = t.src[0];
    let ane = ctx.tensor(a_idx).ne;
    let a = gather_f32(ctx, a_idx);

    let n = t.nelements() as usize;
    let (r0, r1) = partition(n, ith, nth);
    let mut out = Vec::with_capacity(r1 - r0);
    for flat in r0..r1 {
        let i0 = flat % ne[0] as usize;
        let mut r = flat / ne[0] as usize;
        let i1 = r % ne[1] as usize;
        r /= ne[1] as usize;
        let i2 = r % ne[2] as usize;
        r /= ne[2] as usize;
        let i3 = r;

        let ai0 = i0 % ane[0] as usize;
        let ai1 = i1 % ane[1] as usize;
        let ai2 = i2 % ane[2] as usize;
        let ai3 = i3 % ane[3] as usize;
        let a_flat =
            ai0 + ane[0] as usize * (ai1 + ane[1] as usize * (ai2 + ane[2] as usize * ai3));
        out.push(a[a_flat]);
    }
    write_f32_range(ctx, node, r0, &out);
}

/// `GET_ROWS(a, ids)`: gathers whole rows of `a` (dequantized through its
/// own dtype) indexed by the i32 tensor `ids`.
pub fn get_rows(ctx: &Context, node: TensorIndex, ith: usize, nth: usize) {
    let t = ctx.tensor(node);
    let (a_idx, ids_idx) = (t.src[0], t.src[1]);
    let ta = ctx.tensor(a_idx).clone();
    let row_len = ta.ne[0] as usize;
    let row_bytes = ta.dtype.row_size(row_len);

    let ids = ctx.get_f32_1d(ids_idx);
    let (r0, r1) = partition(ids.len(), ith, nth);

    let mut row_f32 = vec![0f32; row_len];
    for i in r0..r1 {
        let row = ids[i] as usize;
        let row_off = row * ta.nb[1];
        let bytes = ctx.raw_bytes_at(a_idx, row_off, row_bytes);
        (ta.dtype.descriptor().to_float)(bytes, &mut row_f32);
        write_f32_range(ctx, node, i * row_len, &row_f32);
    }
}
