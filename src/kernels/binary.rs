//! Elementwise binary kernels: ADD/SUB/MUL/DIV with right-hand-side
//! broadcast repeat.

use super::{gather_f32, partition, write_f32_range};
use crate::context::Context;
use crate::tensor::TensorIndex;

pub fn eval(ctx: &Context, node: TensorIndex, ith: usize, nth: usize, f: impl Fn(f32, f32) -> f32) {
    let t = ctx.tensor(node);
    let ane = t.ne;
    let (a_idx, b_idx) = (t.src[0], t.src[1]);
    let bne = ctx.tensor(b_idx).ne;

    let a = gather_f32(ctx, a_idx);
    let b = gather_f32(ctx, b_idx);

    let n = t.nelements() as usize;
    let (start, end) = partition(n, ith, nth);
    let mut out = Vec::with_capacity(end - start);
    for flat in start..end {
        let i0 = flat % ane[0] as usize;
        let mut r = flat / ane[0] as usize;
        let i1 = r % ane[1] as usize;
        r /= ane[1] as usize;
        let i2 = r % ane[2] as usize;
        r /= ane[2] as usize;
        let i3 = r;

        let bi0 = i0 % bne[0] as usize;
        let bi1 = i1 % bne[1] as usize;
        let bi2 = i2 % bne[2] as usize;
        let bi3 = i3 % bne[3] as usize;
        let b_flat = bi0
            + bne[0] as usize * (bi1 + bne[1] as usize * (bi2 + bne[2] as usize * bi3));

        out.push(f(a[flat], b[b_flat]));
    }
    write_f32_range(ctx, node, start, &out);
}
