//! ROPE: rotary position embedding, with the YaRN extrapolation/
//! interpolation ramp blend that lets a model trained at one context length
//! run coherently at a longer one.

use super::{gather_f32, row_partition, write_f32_one};
use crate::context::Context;
use crate::op::RopeMode;
use crate::tensor::TensorIndex;

fn rope_yarn_ramp(low: f32, high: f32, i0: f32) -> f32 {
    let y = (i0 / 2.0 - low) / (high - low).max(0.001);
    1.0 - y.clamp(0.0, 1.0)
}

/// `ggml_rope_yarn_corr_dim`'s pair: the channel range over which the ramp
/// blends interpolated and extrapolated frequencies.
fn corr_dims(n_dims: usize, n_ctx_orig: i32, base: f32, beta_fast: f32, beta_slow: f32) -> (f32, f32) {
    let find_dim = |n_rot: f32| {
        (n_dims as f32 * (n_ctx_orig as f32 / (n_rot * 2.0 * std::f32::consts::PI)).ln())
            / (2.0 * base.ln())
    };
    let low = find_dim(beta_fast).floor().max(0.0);
    let high = find_dim(beta_slow).ceil().min(n_dims.saturating_sub(1) as f32);
    (low, high)
}

#[allow(clippy::too_many_arguments)]
pub fn eval(
    ctx: &Context,
    node: TensorIndex,
    ith: usize,
    nth: usize,
    n_dims: usize,
    mode: RopeMode,
    n_ctx_orig: i32,
    base: f32,
    ext_factor: f32,
    attn_factor: f32,
    beta_fast: f32,
    beta_slow: f32,
    freq_scale: f32,
) {
    let t = ctx.tensor(node);
    let ne = t.ne;
    let a_idx = t.src[0];
    let pos_idx = t.src[1];
    let freq_factors_idx = t.src.get(2).copied();

    let a = gather_f32(ctx, a_idx);
    let pos = ctx.get_f32_1d(pos_idx);
    let freq_factors = freq_factors_idx.map(|f| gather_f32(ctx, f));

    let (dims_low, dims_high) = corr_dims(n_dims, n_ctx_orig, base, beta_fast, beta_slow);

    let row_len = ne[0] as usize;
    let n_rows = t.nrows() as usize;
    let (r0, r1) = row_partition(n_rows as i64, ith, nth);
    let half = n_dims / 2;

    for row in r0..r1 {
        let rest = row / ne[1] as usize;
        let i2 = rest % ne[2] as usize;
        let p = pos[i2];

        let row_slice = &a[row * row_len..(row + 1) * row_len];
        let mut out = row_slice.to_vec();

        for i in 0..half {
            let freq_factor = freq_factors.as_ref().map(|f| f[i]).unwrap_or(1.0);
            let theta_extrap = p / freq_factor * base.powf(-2.0 * i as f32 / n_dims as f32);
            let theta_interp = freq_scale * theta_extrap;
            let theta = if ext_factor != 0.0 {
                let ramp_mix = rope_yarn_ramp(dims_low, dims_high, (2 * i) as f32) * ext_factor;
                theta_interp * (1.0 - ramp_mix) + theta_extrap * ramp_mix
            } else {
                theta_interp
            };
            let (c, s) = (theta.cos() * attn_factor, theta.sin() * attn_factor);

            let (j0, j1) = match mode {
                RopeMode::Normal => (2 * i, 2 * i + 1),
                RopeMode::NeoX => (i, i + half),
            };
            if j1 >= row_len {
                continue;
            }
            let (x0, x1) = (row_slice[j0], row_slice[j1]);
            out[j0] = x0 * c - x1 * s;
            out[j1] = x0 * s + x1 * c;
        }

        for (k, &v) in out.iter().enumerate() {
            write_f32_one(ctx, node, row * row_len + k, v);
        }
    }
}
