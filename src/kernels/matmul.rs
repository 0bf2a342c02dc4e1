//! MUL_MAT / MUL_MAT_ID / OUT_PROD: the matmul family, the only kernels
//! that dispatch through a quantized vec_dot instead of dequantizing every
//! operand eagerly.
//!
//! `MUL_MAT` claims work over a 2-D grid of `(A-row, B-row)` chunks rather
//! than splitting `A`'s rows alone: a batch with few `A` rows but many `B`
//! columns (a single decoded token attending over a whole prefill-sized
//! cache, say) still spreads across every thread instead of leaving all but
//! one idle. Below a chunk-count floor, claiming one 16x16 chunk at a time
//! from a shared atomic counter costs more in contention than it saves in
//! balance, so the grid collapses to a single static split along whichever
//! of the two axes has more rows.

use super::write_f32_one;
use crate::context::Context;
use crate::dtype::Type;
use crate::quant::generic_vec_dot;
use crate::tensor::TensorIndex;
use std::sync::atomic::{AtomicUsize, Ordering};

const CHUNK_EDGE: usize = 16;

/// Converts `raw` (`n` scalars encoded as `from`) into `to`'s packed form,
/// landing the bytes in `buf`. `scratch` is reused across calls to avoid an
/// allocation per row.
fn convert_row(raw: &[u8], from: Type, to: Type, n: usize, scratch: &mut [f32], buf: &mut [u8]) {
    (from.descriptor().to_float)(raw, &mut scratch[..n]);
    (to.descriptor().from_float.expect("vec_dot_type is always quantizable"))(&scratch[..n], buf);
}

/// Splits `nr0 x nr1` into a chunk grid sized to `nth` worker threads: when
/// there are enough 16-row chunks to keep every thread busy with some slack
/// for load balancing, use them; otherwise collapse to one chunk per thread
/// along whichever axis has more rows, so a static per-thread split still
/// covers the whole grid without any claim-overhead of its own.
fn chunk_grid(nr0: usize, nr1: usize, nth: usize) -> (usize, usize) {
    let mut nchunk0 = nr0.div_ceil(CHUNK_EDGE).max(1);
    let mut nchunk1 = nr1.div_ceil(CHUNK_EDGE).max(1);
    if nchunk0 * nchunk1 < 4 * nth {
        if nr0 > nr1 {
            nchunk0 = nth;
            nchunk1 = 1;
        } else {
            nchunk0 = 1;
            nchunk1 = nth;
        }
    }
    (nchunk0, nchunk1)
}

pub fn mul_mat(
    ctx: &Context,
    node: TensorIndex,
    ith: usize,
    nth: usize,
    chunk_counter: &AtomicUsize,
    thread_work: &mut [u8],
) {
    let t = ctx.tensor(node);
    let (a_idx, b_idx) = (t.src[0], t.src[1]);
    let ta = ctx.tensor(a_idx).clone();
    let tb = ctx.tensor(b_idx).clone();

    let k = ta.ne[0] as usize;
    let m = ta.ne[1] as usize;
    let n = tb.ne[1] as usize;
    let out_batch2 = tb.ne[2] as usize;
    let out_batch3 = tb.ne[3] as usize;
    let a_type = ta.dtype;
    let b_type = tb.dtype;
    let a_row_bytes = a_type.row_size(k);
    let b_row_bytes = b_type.row_size(k);

    let nr0 = m;
    let nr1 = n * out_batch2 * out_batch3;
    if nr0 == 0 || nr1 == 0 {
        return;
    }
    let nth = nth.max(1);

    let vdt = a_type.vec_dot_type();
    let needs_conversion = a_type.is_quantized() && b_type != vdt;
    let vdt_row_bytes = vdt.row_size(k);
    let mut conv_scratch = vec![0f32; if needs_conversion { k } else { 0 }];

    let (nchunk0, nchunk1) = chunk_grid(nr0, nr1, nth);
    let dr0 = nr0.div_ceil(nchunk0);
    let dr1 = nr1.div_ceil(nchunk1);
    let total_chunks = nchunk0 * nchunk1;

    let mut process_chunk = |chunk_idx: usize| {
        let c0 = chunk_idx % nchunk0;
        let c1 = chunk_idx / nchunk0;
        let row0 = (c0 * dr0).min(nr0)..(c0 * dr0 + dr0).min(nr0);
        let row1 = (c1 * dr1).min(nr1)..(c1 * dr1 + dr1).min(nr1);

        for flat_n in row1 {
            let jn = flat_n % n;
            let rest = flat_n / n;
            let i2 = rest % out_batch2;
            let i3 = rest / out_batch2;

            let b_row_off = jn * tb.nb[1] + i2 * tb.nb[2] + i3 * tb.nb[3];
            let b_raw = ctx.raw_bytes_at(b_idx, b_row_off, b_row_bytes);
            let (b_bytes, b_dtype) = if needs_conversion {
                let buf = &mut thread_work[..vdt_row_bytes];
                convert_row(b_raw, b_type, vdt, k, &mut conv_scratch, buf);
                (&*buf, vdt)
            } else {
                (b_raw, b_type)
            };

            let a_i2 = i2 % ta.ne[2] as usize;
            let a_i3 = i3 % ta.ne[3] as usize;
            for im in row0.clone() {
                let a_row_off = im * ta.nb[1] + a_i2 * ta.nb[2] + a_i3 * ta.nb[3];
                let a_bytes = ctx.raw_bytes_at(a_idx, a_row_off, a_row_bytes);
                let dot = generic_vec_dot(k, a_type, a_bytes, b_dtype, b_bytes);
                let out_flat = im + m * (jn + n * (i2 + out_batch2 * i3));
                write_f32_one(ctx, node, out_flat, dot);
            }
        }
    };

    if total_chunks >= 4 * nth {
        loop {
            let chunk_idx = chunk_counter.fetch_add(1, Ordering::Relaxed);
            if chunk_idx >= total_chunks {
                break;
            }
            process_chunk(chunk_idx);
        }
    } else if ith < total_chunks {
        process_chunk(ith);
    }
}

/// `MUL_MAT_ID(experts, x, ids)`: routed MoE matmul. Each `(used, token)`
/// slot picks its own expert row out of `experts` and dot-products against
/// `x`'s column for that token.
pub fn mul_mat_id(
    ctx: &Context,
    node: TensorIndex,
    ith: usize,
    nth: usize,
    thread_work: &mut [u8],
) {
    let t = ctx.tensor(node);
    let (e_idx, x_idx, ids_idx) = (t.src[0], t.src[1], t.src[2]);
    let te = ctx.tensor(e_idx).clone();
    let tx = ctx.tensor(x_idx).clone();
    let tids = ctx.tensor(ids_idx).clone();

    let k = te.ne[0] as usize;
    let m = te.ne[1] as usize;
    let n_used = tids.ne[0] as usize;
    let n_tokens = tids.ne[1] as usize;
    let ids = ctx.get_f32_1d(ids_idx);
    let x_row_bytes = tx.dtype.row_size(k);
    let e_row_bytes = te.dtype.row_size(k);

    let vdt = te.dtype.vec_dot_type();
    let needs_conversion = te.dtype.is_quantized() && tx.dtype != vdt;
    let vdt_row_bytes = vdt.row_size(k);
    let mut conv_scratch = vec![0f32; if needs_conversion { k } else { 0 }];

    let total = n_used * n_tokens;
    let (r0, r1) = super::partition(total, ith, nth);
    for idx in r0..r1 {
        let used = idx % n_used;
        let token = idx / n_used;
        let expert = ids[token * n_used + used] as usize;

        let x_col = used % tx.ne[1].max(1) as usize;
        let x_row_off = x_col * tx.nb[1] + (token % tx.ne[2].max(1) as usize) * tx.nb[2];
        let x_raw = ctx.raw_bytes_at(x_idx, x_row_off, x_row_bytes);
        let (x_bytes, x_dtype) = if needs_conversion {
            let buf = &mut thread_work[..vdt_row_bytes];
            convert_row(x_raw, tx.dtype, vdt, k, &mut conv_scratch, buf);
            (&*buf, vdt)
        } else {
            (x_raw, tx.dtype)
        };

        for im in 0..m {
            let e_off = im * te.nb[1] + expert * te.nb[2];
            let e_bytes = ctx.raw_bytes_at(e_idx, e_off, e_row_bytes);
            let dot = generic_vec_dot(k, te.dtype, e_bytes, x_dtype, x_bytes);
            let out_flat = im + m * (used + n_used * token);
            write_f32_one(ctx, node, out_flat, dot);
        }
    }
}

/// `OUT_PROD(a, b)`: same contraction-over-`ne[0]` shape contract as
/// `MUL_MAT`, so it shares the same dense dot-product loop rather than
/// duplicating it under a different name.
pub fn out_prod(ctx: &Context, node: TensorIndex, ith: usize, nth: usize, thread_work: &mut [u8]) {
    let dummy = AtomicUsize::new(0);
    mul_mat(ctx, node, ith, nth, &dummy, thread_work);
}
