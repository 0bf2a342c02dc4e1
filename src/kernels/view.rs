//! CONT / CPY / SET / DIAG_MASK_INF / DIAG_MASK_ZERO.
//! VIEW/RESHAPE/PERMUTE/TRANSPOSE need no kernel at all: the
//! factory already aliased their bytes into the source tensor when the
//! node was built, so there's nothing left to compute.

use super::{gather_f32, partition, row_partition, write_f32_range};
use crate::context::Context;
use crate::tensor::TensorIndex;

/// `CONT(a)`: a physical copy of `a` into fresh contiguous storage,
/// following whatever strides `a` currently has.
pub fn cont(ctx: &Context, node: TensorIndex, ith: usize, nth: usize) {
    let t = ctx.tensor(node);
    let a_idx = t.src[0];
    let a = gather_f32(ctx, a_idx);
    let n = t.nelements() as usize;
    let (r0, r1) = partition(n, ith, nth);
    write_f32_range(ctx, node, r0, &a[r0..r1]);
}

/// `CPY(a, b)`: copies `a`'s elements into `b`'s storage (the node is a
/// view of `b`).
pub fn cpy(ctx: &Context, node: TensorIndex, ith: usize, nth: usize) {
    let t = ctx.tensor(node);
    let a_idx = t.src[0];
    let a = gather_f32(ctx, a_idx);
    let n = t.nelements() as usize;
    let (r0, r1) = partition(n, ith, nth);
    write_f32_range(ctx, node, r0, &a[r0..r1]);
}

/// `SET(a, b, offset)`: writes `b`'s elements into `a`'s storage at
/// `offset` (the node is a view of `a` already positioned at `offset`).
pub fn set(ctx: &Context, node: TensorIndex, ith: usize, nth: usize, _offset: usize) {
    let t = ctx.tensor(node);
    let b_idx = t.src[1];
    let b = gather_f32(ctx, b_idx);
    let n = ctx.tensor(b_idx).nelements() as usize;
    let (r0, r1) = partition(n, ith, nth);
    write_f32_range(ctx, node, r0, &b[r0..r1]);
}

/// `DIAG_MASK_INF` / `DIAG_MASK_ZERO`: replaces elements above the
/// `n_past`-shifted diagonal (`i0 > i1 + n_past`) with `fill`.
pub fn diag_mask(ctx: &Context, node: TensorIndex, ith: usize, nth: usize, n_past: usize, fill: f32) {
    let t = ctx.tensor(node);
    let ne = t.ne;
    let a_idx = t.src[0];
    let a = gather_f32(ctx, a_idx);
    let row_len = ne[0] as usize;
    let n_rows = t.nrows() as usize;
    let (r0, r1) = row_partition(n_rows as i64, ith, nth);

    let mut out = Vec::with_capacity((r1 - r0) * row_len);
    for row in r0..r1 {
        let i1 = row % ne[1] as usize;
        for i0 in 0..row_len {
            out.push(if i0 > i1 + n_past { fill } else { a[row * row_len + i0] });
        }
    }
    write_f32_range(ctx, node, r0 * row_len, &out);
}
