//! The executor's per-op dispatch table. Each submodule owns one operator
//! family; this module owns the shared row/flat-index bookkeeping and the
//! `dispatch` entry point the executor calls once per node per thread.
//!
//! Every elementwise, norm, softmax, RoPE, attention, conv and scan kernel
//! below reads its operands through `to_float` and writes fp32, regardless
//! of the source tensor's declared dtype — the same "dequantize on read"
//! contract `Context::get_f32_1d` exposes to callers. Only the matmul
//! family dispatches through `quant::generic_vec_dot` to honor a quantized
//! `src[0]` directly, since that's the one family where avoiding a full
//! dequantize of the (typically much larger) weight matrix matters.

mod attention;
mod binary;
mod conv;
mod matmul;
mod norm;
mod reduce;
mod rope;
mod softmax;
mod ssm;
mod unary;
mod view;

use crate::context::Context;
use crate::op::Op;
use crate::tensor::TensorIndex;
use std::sync::atomic::AtomicUsize;

/// Splits `n` items into `nth` contiguous, roughly-equal chunks and returns
/// the `[start, end)` half-open range belonging to `ith`.
pub(crate) fn partition(n: usize, ith: usize, nth: usize) -> (usize, usize) {
    let nth = nth.max(1);
    let chunk = n.div_ceil(nth);
    let start = (ith * chunk).min(n);
    let end = (start + chunk).min(n);
    (start, end)
}

pub(crate) fn row_partition(n_rows: i64, ith: usize, nth: usize) -> (usize, usize) {
    partition(n_rows.max(0) as usize, ith, nth)
}

/// Reads `idx`'s full contents into an fp32 buffer in the tensor's own
/// `(i0 fastest, ..., i3 slowest)` logical order, whether or not it's
/// contiguous. A block-quantized tensor can only be strided at row
/// granularity (a block never splits across a stride boundary), so a
/// non-contiguous *and* quantized combination isn't something any factory
/// function produces.
pub(crate) fn gather_f32(ctx: &Context, idx: TensorIndex) -> Vec<f32> {
    let t = ctx.tensor(idx);
    if t.is_contiguous() {
        return ctx.get_f32_1d(idx);
    }
    assert_eq!(
        t.dtype.block_size(),
        1,
        "strided gather requires a dense (non-block-quantized) element type"
    );
    let (ne, nb) = (t.ne, t.nb);
    let mut out = Vec::with_capacity(t.nelements().max(0) as usize);
    for i3 in 0..ne[3] {
        for i2 in 0..ne[2] {
            for i1 in 0..ne[1] {
                for i0 in 0..ne[0] {
                    let off = i0 as usize * nb[0]
                        + i1 as usize * nb[1]
                        + i2 as usize * nb[2]
                        + i3 as usize * nb[3];
                    out.push(ctx.read_scalar_f32(idx, off));
                }
            }
        }
    }
    out
}

/// Writes `values` into `idx`'s own (contiguous, fp32) storage starting at
/// flat element index `start`.
pub(crate) fn write_f32_range(ctx: &Context, idx: TensorIndex, start: usize, values: &[f32]) {
    let ts = ctx.tensor(idx).dtype.descriptor().type_size;
    debug_assert_eq!(ts, 4, "kernel output expected to be fp32");
    // SAFETY: callers partition `start..start+values.len()` disjointly
    // across threads for a single node, so no two workers touch the same
    // byte range concurrently.
    let bytes = unsafe { ctx.data_mut_shared(idx) };
    for (i, v) in values.iter().enumerate() {
        let off = (start + i) * 4;
        bytes[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }
}

/// Writes a single fp32 scalar at flat element index `at`.
pub(crate) fn write_f32_one(ctx: &Context, idx: TensorIndex, at: usize, v: f32) {
    let ts = ctx.tensor(idx).dtype.descriptor().type_size;
    debug_assert_eq!(ts, 4, "kernel output expected to be fp32");
    // SAFETY: see `write_f32_range`.
    let bytes = unsafe { ctx.data_mut_shared(idx) };
    let off = at * 4;
    bytes[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

/// Dispatches one graph node to its kernel. `thread_work` is this worker's
/// own cache-line-padded slice of the plan's scratch buffer; only the
/// matmul family uses it, as a landing pad for converting a row of `B`
/// into `A`'s `vec_dot_type` before the dot product.
pub fn dispatch(
    ctx: &Context,
    node: TensorIndex,
    ith: usize,
    nth: usize,
    chunk_counter: &AtomicUsize,
    thread_work: &mut [u8],
) {
    let op = ctx.tensor(node).op.clone();
    match op {
        Op::None => {}

        Op::Add => binary::eval(ctx, node, ith, nth, |a, b| a + b),
        Op::Sub => binary::eval(ctx, node, ith, nth, |a, b| a - b),
        Op::Mul => binary::eval(ctx, node, ith, nth, |a, b| a * b),
        Op::Div => binary::eval(ctx, node, ith, nth, |a, b| a / b),

        Op::Sqr => unary::eval(ctx, node, ith, nth, |x| x * x),
        Op::Sqrt => unary::eval(ctx, node, ith, nth, f32::sqrt),
        Op::Log => unary::eval(ctx, node, ith, nth, f32::ln),
        Op::Scale(s) => unary::eval(ctx, node, ith, nth, move |x| x * s),
        Op::Unary(u) => unary::eval_named(ctx, node, ith, nth, u),

        Op::Sum => reduce::sum(ctx, node, ith, nth),
        Op::Mean => reduce::mean(ctx, node, ith, nth),
        Op::Repeat => reduce::repeat(ctx, node, ith, nth),
        Op::GetRows => reduce::get_rows(ctx, node, ith, nth),

        Op::MulMat => matmul::mul_mat(ctx, node, ith, nth, chunk_counter, thread_work),
        Op::MulMatId { .. } => matmul::mul_mat_id(ctx, node, ith, nth, thread_work),
        Op::OutProd => matmul::out_prod(ctx, node, ith, nth, thread_work),

        Op::Norm { eps } => norm::norm(ctx, node, ith, nth, eps),
        Op::RmsNorm { eps } => norm::rms_norm(ctx, node, ith, nth, eps),
        Op::GroupNorm { n_groups, eps } => norm::group_norm(ctx, node, ith, nth, n_groups, eps),

        Op::SoftMax { scale, max_bias } => softmax::eval(ctx, node, ith, nth, scale, max_bias),
        Op::DiagMaskInf { n_past } => view::diag_mask(ctx, node, ith, nth, n_past, f32::NEG_INFINITY),
        Op::DiagMaskZero { n_past } => view::diag_mask(ctx, node, ith, nth, n_past, 0.0),

        Op::Rope {
            n_dims,
            mode,
            n_ctx_orig,
            base,
            ext_factor,
            attn_factor,
            beta_fast,
            beta_slow,
            freq_scale,
        } => rope::eval(
            ctx, node, ith, nth, n_dims, mode, n_ctx_orig, base, ext_factor, attn_factor,
            beta_fast, beta_slow, freq_scale,
        ),

        Op::FlashAttnExt { scale, max_bias } => {
            attention::flash_attn_ext(ctx, node, ith, nth, scale, max_bias)
        }

        Op::Im2Col {
            stride_w,
            stride_h,
            pad_w,
            pad_h,
            dilation_w,
            dilation_h,
            is_2d,
        } => conv::im2col(
            ctx, node, ith, nth, stride_w, stride_h, pad_w, pad_h, dilation_w, dilation_h, is_2d,
        ),
        Op::SsmConv => conv::ssm_conv(ctx, node, ith, nth),
        Op::SsmScan => ssm::ssm_scan(ctx, node, ith, nth),

        Op::View { .. } | Op::Reshape | Op::Permute { .. } | Op::Transpose => {
            // Pure metadata: the factory already aliased this node's bytes
            // into its source at graph-build time. Nothing to do.
        }
        Op::Cont => view::cont(ctx, node, ith, nth),
        Op::Cpy => view::cpy(ctx, node, ith, nth),
        Op::Set { offset } => view::set(ctx, node, ith, nth, offset),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_covers_every_index_exactly_once_across_threads() {
        let n = 17;
        let nth = 4;
        let mut seen = vec![false; n];
        for ith in 0..nth {
            let (start, end) = partition(n, ith, nth);
            for i in start..end {
                assert!(!seen[i], "index {i} covered twice");
                seen[i] = true;
            }
        }
        assert!(seen.iter().all(|&b| b));
    }

    #[test]
    fn partition_handles_more_threads_than_items() {
        let (start, end) = partition(2, 5, 8);
        assert_eq!(start, end);
    }
}
