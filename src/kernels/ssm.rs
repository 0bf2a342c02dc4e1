//! SSM_SCAN: the selective-scan recurrence
//! `s_t = exp(dt·A)·s_{t-1} + dt·B·x_t`, `y_t = <C, s_t>`, run independently
//! per inner channel so it parallelizes the same way `ssm_conv` does.
//!
//! `ids` (per-token sequence grouping) is read off the graph but not
//! applied — every token is treated as belonging to one continuous sequence
//! sharing `s`'s initial state. Multi-sequence batching would need `ids` to
//! reset the recurrence at sequence boundaries, which this kernel doesn't do.

use super::{gather_f32, partition, write_f32_one};
use crate::context::Context;
use crate::tensor::TensorIndex;

pub fn ssm_scan(ctx: &Context, node: TensorIndex, ith: usize, nth: usize) {
    let t = ctx.tensor(node);
    let (s_idx, x_idx, dt_idx, a_idx, b_idx, c_idx, _ids_idx) =
        (t.src[0], t.src[1], t.src[2], t.src[3], t.src[4], t.src[5], t.src[6]);

    let ts = ctx.tensor(s_idx).clone();
    let tx = ctx.tensor(x_idx).clone();

    let d_state = ts.ne[0] as usize;
    let d_inner = ts.ne[1] as usize;
    let seq_len = tx.ne[1] as usize;

    let s0 = gather_f32(ctx, s_idx);
    let x = gather_f32(ctx, x_idx);
    let dt = gather_f32(ctx, dt_idx);
    let a = gather_f32(ctx, a_idx);
    let b = gather_f32(ctx, b_idx);
    let c = gather_f32(ctx, c_idx);

    let n_state_elems = d_state * d_inner;
    let (ch0, ch1) = partition(d_inner, ith, nth);

    for ch in ch0..ch1 {
        let mut state = s0[ch * d_state..(ch + 1) * d_state].to_vec();
        for time in 0..seq_len {
            let dt_v = dt[ch + d_inner * time];
            let x_v = x[ch + d_inner * time];
            let mut y = 0f32;
            for st in 0..d_state {
                let a_v = a[st + d_state * ch];
                let b_v = b[st + d_state * time];
                let c_v = c[st + d_state * time];
                state[st] = (dt_v * a_v).exp() * state[st] + dt_v * b_v * x_v;
                y += c_v * state[st];
            }
            write_f32_one(ctx, node, n_state_elems + time * d_inner + ch, y);
        }
        for (st, &v) in state.iter().enumerate() {
            write_f32_one(ctx, node, ch * d_state + st, v);
        }
    }
}
