//! Operator-factory functions: one per graph-building call. Each validates
//! its operand shapes/types, synthesizes the result descriptor, and records
//! the operator plus its operands on it. None of these execute anything —
//! execution happens later, in [`crate::executor`].

use crate::context::Context;
use crate::dtype::Type;
use crate::op::{Op, RopeMode, UnaryOp};
use crate::tensor::{contiguous_strides, TensorIndex};

fn binary_result(ctx: &mut Context, a: TensorIndex, b: TensorIndex, op: Op) -> TensorIndex {
    let (ane, bne) = (ctx.tensor(a).ne, ctx.tensor(b).ne);
    assert!(
        (0..4).all(|i| ane[i] % bne[i] == 0),
        "{}: rhs shape {bne:?} does not repeat into lhs shape {ane:?}",
        op.name()
    );
    let dtype = ctx.tensor(a).dtype;
    let out = ctx.new_tensor(dtype, ane);
    ctx.tensor_mut(out).op = op;
    ctx.tensor_mut(out).src = smallvec::smallvec![a, b];
    out
}

macro_rules! binary_op {
    ($name:ident, $op:expr) => {
        pub fn $name(ctx: &mut Context, a: TensorIndex, b: TensorIndex) -> TensorIndex {
            binary_result(ctx, a, b, $op)
        }
    };
}

binary_op!(add, Op::Add);
binary_op!(sub, Op::Sub);
binary_op!(mul, Op::Mul);
binary_op!(div, Op::Div);

fn unary_result(ctx: &mut Context, a: TensorIndex, op: Op) -> TensorIndex {
    let ta = ctx.tensor(a);
    let (ne, dtype) = (ta.ne, ta.dtype);
    let out = ctx.new_tensor(dtype, ne);
    ctx.tensor_mut(out).op = op;
    ctx.tensor_mut(out).src = smallvec::smallvec![a];
    out
}

pub fn sqr(ctx: &mut Context, a: TensorIndex) -> TensorIndex {
    unary_result(ctx, a, Op::Sqr)
}
pub fn sqrt(ctx: &mut Context, a: TensorIndex) -> TensorIndex {
    unary_result(ctx, a, Op::Sqrt)
}
pub fn log(ctx: &mut Context, a: TensorIndex) -> TensorIndex {
    unary_result(ctx, a, Op::Log)
}
pub fn scale(ctx: &mut Context, a: TensorIndex, s: f32) -> TensorIndex {
    unary_result(ctx, a, Op::Scale(s))
}

pub fn unary(ctx: &mut Context, a: TensorIndex, which: UnaryOp) -> TensorIndex {
    unary_result(ctx, a, Op::Unary(which))
}

/// `SUM`: reduces all elements to a scalar.
pub fn sum(ctx: &mut Context, a: TensorIndex) -> TensorIndex {
    let dtype = ctx.tensor(a).dtype;
    let out = ctx.new_tensor(dtype, [1, 1, 1, 1]);
    ctx.tensor_mut(out).op = Op::Sum;
    ctx.tensor_mut(out).src = smallvec::smallvec![a];
    out
}

pub fn mean(ctx: &mut Context, a: TensorIndex) -> TensorIndex {
    let dtype = ctx.tensor(a).dtype;
    let out = ctx.new_tensor(dtype, [1, 1, 1, 1]);
    ctx.tensor_mut(out).op = Op::Mean;
    ctx.tensor_mut(out).src = smallvec::smallvec![a];
    out
}

/// `REPEAT(a, like)`: broadcasts `a` up to `like`'s shape.
pub fn repeat(ctx: &mut Context, a: TensorIndex, like: TensorIndex) -> TensorIndex {
    let (ane, lne) = (ctx.tensor(a).ne, ctx.tensor(like).ne);
    assert!(
        (0..4).all(|i| lne[i] % ane[i] == 0),
        "REPEAT: {ane:?} cannot repeat into {lne:?}"
    );
    let dtype = ctx.tensor(a).dtype;
    let out = ctx.new_tensor(dtype, lne);
    ctx.tensor_mut(out).op = Op::Repeat;
    ctx.tensor_mut(out).src = smallvec::smallvec![a];
    out
}

/// `MUL_MAT(a, b)`: `a` is `(K, M, ...)`, `b` is `(K, N, ...)`; output is
/// `(M, N, b.ne[2], b.ne[3])` fp32.
pub fn mul_mat(ctx: &mut Context, a: TensorIndex, b: TensorIndex) -> TensorIndex {
    let (ta, tb) = (ctx.tensor(a), ctx.tensor(b));
    assert!(ta.can_mul_mat(tb), "MUL_MAT: {:?} incompatible with {:?}", ta.ne, tb.ne);
    let ne = [ta.ne[1], tb.ne[1], tb.ne[2], tb.ne[3]];
    let out = ctx.new_tensor(Type::F32, ne);
    ctx.tensor_mut(out).op = Op::MulMat;
    ctx.tensor_mut(out).src = smallvec::smallvec![a, b];
    out
}

/// `MUL_MAT_ID(experts, x, ids)`: routed MoE matmul. `experts` holds one
/// matrix per expert in dim 2 (`experts.ne[3] == 1`); `ids` is
/// `(n_used, n_tokens)` i32.
pub fn mul_mat_id(
    ctx: &mut Context,
    experts: TensorIndex,
    x: TensorIndex,
    ids: TensorIndex,
) -> TensorIndex {
    let (te, tx, tids) = (ctx.tensor(experts), ctx.tensor(x), ctx.tensor(ids));
    assert_eq!(te.ne[3], 1, "MUL_MAT_ID: experts.ne[3] must be 1");
    assert_eq!(tids.dtype, Type::I32, "MUL_MAT_ID: ids must be i32");
    assert_eq!(te.ne[0], tx.ne[0], "MUL_MAT_ID: contraction dim mismatch");
    let n_used = tids.ne[0];
    let n_tokens = tids.ne[1];
    let n_as = te.ne[2] as usize;
    let ne = [te.ne[1], n_used, n_tokens, 1];
    let out = ctx.new_tensor(Type::F32, ne);
    ctx.tensor_mut(out).op = Op::MulMatId { n_as };
    ctx.tensor_mut(out).src = smallvec::smallvec![experts, x, ids];
    out
}

pub fn out_prod(ctx: &mut Context, a: TensorIndex, b: TensorIndex) -> TensorIndex {
    let (ta, tb) = (ctx.tensor(a), ctx.tensor(b));
    let ne = [ta.ne[1], tb.ne[1], tb.ne[2], tb.ne[3]];
    let out = ctx.new_tensor(Type::F32, ne);
    ctx.tensor_mut(out).op = Op::OutProd;
    ctx.tensor_mut(out).src = smallvec::smallvec![a, b];
    out
}

pub fn norm(ctx: &mut Context, a: TensorIndex, eps: f32) -> TensorIndex {
    unary_result(ctx, a, Op::Norm { eps })
}
pub fn rms_norm(ctx: &mut Context, a: TensorIndex, eps: f32) -> TensorIndex {
    unary_result(ctx, a, Op::RmsNorm { eps })
}
pub fn group_norm(ctx: &mut Context, a: TensorIndex, n_groups: usize, eps: f32) -> TensorIndex {
    unary_result(ctx, a, Op::GroupNorm { n_groups, eps })
}

/// `SOFT_MAX(a, mask?, scale, max_bias)`. `max_bias > 0` requires a mask,
/// since the ALiBi bias it controls is only meaningful alongside one.
pub fn soft_max(
    ctx: &mut Context,
    a: TensorIndex,
    mask: Option<TensorIndex>,
    scale: f32,
    max_bias: f32,
) -> TensorIndex {
    assert!(
        max_bias == 0.0 || mask.is_some(),
        "SOFT_MAX: max_bias > 0 requires a mask"
    );
    let ta = ctx.tensor(a);
    let (ne, dtype) = (ta.ne, ta.dtype);
    let out = ctx.new_tensor(dtype, ne);
    ctx.tensor_mut(out).op = Op::SoftMax { scale, max_bias };
    let mut src = smallvec::smallvec![a];
    if let Some(m) = mask {
        src.push(m);
    }
    ctx.tensor_mut(out).src = src;
    out
}

pub fn diag_mask_inf(ctx: &mut Context, a: TensorIndex, n_past: usize) -> TensorIndex {
    unary_result(ctx, a, Op::DiagMaskInf { n_past })
}
pub fn diag_mask_zero(ctx: &mut Context, a: TensorIndex, n_past: usize) -> TensorIndex {
    unary_result(ctx, a, Op::DiagMaskZero { n_past })
}

/// `ROPE`. `pos` is a 1-D i32 of length `a.ne[2]`; `freq_factors` is an
/// optional fp32 tensor of length `n_dims/2`.
#[allow(clippy::too_many_arguments)]
pub fn rope(
    ctx: &mut Context,
    a: TensorIndex,
    pos: TensorIndex,
    freq_factors: Option<TensorIndex>,
    n_dims: usize,
    mode: RopeMode,
    n_ctx_orig: i32,
    base: f32,
    freq_scale: f32,
    ext_factor: f32,
    attn_factor: f32,
    beta_fast: f32,
    beta_slow: f32,
) -> TensorIndex {
    let ta = ctx.tensor(a);
    assert_eq!(
        ctx.tensor(pos).ne[0],
        ta.ne[2],
        "ROPE: pos length must equal a.ne[2]"
    );
    let (ne, dtype) = (ta.ne, ta.dtype);
    let out = ctx.new_tensor(dtype, ne);
    ctx.tensor_mut(out).op = Op::Rope {
        n_dims,
        mode,
        n_ctx_orig,
        base,
        ext_factor,
        attn_factor,
        beta_fast,
        beta_slow,
        freq_scale,
    };
    let mut src = smallvec::smallvec![a, pos];
    if let Some(f) = freq_factors {
        src.push(f);
    }
    ctx.tensor_mut(out).src = src;
    out
}

/// `FLASH_ATTN_EXT(Q, K, V, mask?, scale, max_bias)`. `Q` is `(D, N, H, B)`;
/// `K, V` are `(D, M, Hkv, B)`, `H % Hkv == 0`. Output is `(D, H, N, B)`
/// fp32.
pub fn flash_attn_ext(
    ctx: &mut Context,
    q: TensorIndex,
    k: TensorIndex,
    v: TensorIndex,
    mask: Option<TensorIndex>,
    scale: f32,
    max_bias: f32,
) -> TensorIndex {
    let (tq, tk) = (ctx.tensor(q), ctx.tensor(k));
    assert_eq!(tq.ne[0], tk.ne[0], "FLASH_ATTN_EXT: D mismatch between Q and K");
    assert_eq!(
        tq.ne[2] % tk.ne[2],
        0,
        "FLASH_ATTN_EXT: H must be a multiple of Hkv"
    );
    let ne = [tq.ne[0], tq.ne[2], tq.ne[1], tq.ne[3]];
    let out = ctx.new_tensor(Type::F32, ne);
    ctx.tensor_mut(out).op = Op::FlashAttnExt { scale, max_bias };
    let mut src = smallvec::smallvec![q, k, v];
    if let Some(m) = mask {
        src.push(m);
    }
    ctx.tensor_mut(out).src = src;
    out
}

/// `IM2COL`: reshapes a 4-D input window for conv-as-matmul.
#[allow(clippy::too_many_arguments)]
pub fn im2col(
    ctx: &mut Context,
    input: TensorIndex,
    kernel: TensorIndex,
    stride_w: usize,
    stride_h: usize,
    pad_w: usize,
    pad_h: usize,
    dilation_w: usize,
    dilation_h: usize,
    is_2d: bool,
) -> TensorIndex {
    let (ti, tk) = (ctx.tensor(input), ctx.tensor(kernel));
    let (iw, ih, ic, n) = (ti.ne[0], ti.ne[1], ti.ne[2], ti.ne[3]);
    let (kw, kh) = (tk.ne[0], tk.ne[1]);
    let ow = (iw + 2 * pad_w as i64 - dilation_w as i64 * (kw - 1) - 1) / stride_w as i64 + 1;
    let oh = if is_2d {
        (ih + 2 * pad_h as i64 - dilation_h as i64 * (kh - 1) - 1) / stride_h as i64 + 1
    } else {
        1
    };
    let ne = [ic * kw * kh.max(1), ow, if is_2d { oh } else { n }, if is_2d { n } else { 1 }];
    let out = ctx.new_tensor(Type::F32, ne);
    ctx.tensor_mut(out).op = Op::Im2Col {
        stride_w,
        stride_h,
        pad_w,
        pad_h,
        dilation_w,
        dilation_h,
        is_2d,
    };
    ctx.tensor_mut(out).src = smallvec::smallvec![input, kernel];
    out
}

/// `SSM_CONV(x, conv_weight)`: causal depthwise convolution used by the
/// Mamba short-conv stage.
pub fn ssm_conv(ctx: &mut Context, x: TensorIndex, conv_weight: TensorIndex) -> TensorIndex {
    let tx = ctx.tensor(x);
    let ne = tx.ne;
    let out = ctx.new_tensor(Type::F32, ne);
    ctx.tensor_mut(out).op = Op::SsmConv;
    ctx.tensor_mut(out).src = smallvec::smallvec![x, conv_weight];
    out
}

/// `SSM_SCAN(s, x, dt, a, b, c, ids)`: the selective-scan recurrence.
/// Output packs the final state followed by the `y` sequence.
pub fn ssm_scan(
    ctx: &mut Context,
    s: TensorIndex,
    x: TensorIndex,
    dt: TensorIndex,
    a: TensorIndex,
    b: TensorIndex,
    c: TensorIndex,
    ids: TensorIndex,
) -> TensorIndex {
    let ts = ctx.tensor(s);
    let tx = ctx.tensor(x);
    let n_elem_s = ts.nelements();
    let ne = [n_elem_s + tx.nelements(), 1, 1, 1];
    let out = ctx.new_tensor(Type::F32, ne);
    ctx.tensor_mut(out).op = Op::SsmScan;
    ctx.tensor_mut(out).src = smallvec::smallvec![s, x, dt, a, b, c, ids];
    out
}

/// `GET_ROWS(a, ids)`: gathers rows of `a` indexed by the i32 tensor `ids`.
pub fn get_rows(ctx: &mut Context, a: TensorIndex, ids: TensorIndex) -> TensorIndex {
    let (ta, tids) = (ctx.tensor(a), ctx.tensor(ids));
    assert_eq!(tids.dtype, Type::I32, "GET_ROWS: ids must be i32");
    let ne = [ta.ne[0], tids.ne[0], tids.ne[1], 1];
    let out = ctx.new_tensor(Type::F32, ne);
    ctx.tensor_mut(out).op = Op::GetRows;
    ctx.tensor_mut(out).src = smallvec::smallvec![a, ids];
    out
}

/// `VIEW`: a metadata-only descriptor aliasing `a`'s bytes at `offset` with
/// caller-supplied shape/strides. The constructed view's own byte range
/// must land entirely inside `a`'s storage — callers can request any
/// `ne`/`nb` combination, so both ends of that range are checked here
/// rather than trusted.
pub fn view(
    ctx: &mut Context,
    a: TensorIndex,
    ne: [i64; 4],
    nb: [usize; 4],
    offset: usize,
) -> TensorIndex {
    let dtype = ctx.tensor(a).dtype;
    let nbytes_a = ctx.tensor(a).nbytes();
    assert!(
        offset <= nbytes_a,
        "VIEW: offset {offset} exceeds source tensor of {nbytes_a} bytes"
    );
    let view_nbytes = crate::tensor::view_footprint_bytes(dtype, ne, nb);
    assert!(
        offset + view_nbytes <= nbytes_a,
        "VIEW: byte range [{offset}, {}) exceeds source tensor of {nbytes_a} bytes",
        offset + view_nbytes
    );
    let out = ctx.new_view_tensor(dtype, ne, nb, a, offset);
    ctx.tensor_mut(out).op = Op::View { offset };
    ctx.tensor_mut(out).src = smallvec::smallvec![a];
    out
}

/// `RESHAPE(a, ne)`: requires `a` be contiguous and element-count-preserving.
pub fn reshape(ctx: &mut Context, a: TensorIndex, ne: [i64; 4]) -> TensorIndex {
    let ta = ctx.tensor(a);
    assert!(ta.is_contiguous(), "RESHAPE requires a contiguous source");
    assert_eq!(
        ta.nelements(),
        ne[0] * ne[1] * ne[2] * ne[3],
        "RESHAPE must preserve element count"
    );
    let dtype = ta.dtype;
    let nb = contiguous_strides(dtype, ne);
    let out = ctx.new_view_tensor(dtype, ne, nb, a, 0);
    ctx.tensor_mut(out).op = Op::Reshape;
    ctx.tensor_mut(out).src = smallvec::smallvec![a];
    out
}

/// `PERMUTE(a, axes)`: reorders `a`'s `ne`/`nb` by `axes` (`axes[i]` says
/// which new axis slot the old axis `i` moves to).
pub fn permute(ctx: &mut Context, a: TensorIndex, axes: [usize; 4]) -> TensorIndex {
    let ta = ctx.tensor(a);
    let (dtype, old_ne, old_nb) = (ta.dtype, ta.ne, ta.nb);
    let mut ne = [0i64; 4];
    let mut nb = [0usize; 4];
    for i in 0..4 {
        ne[axes[i]] = old_ne[i];
        nb[axes[i]] = old_nb[i];
    }
    let out = ctx.new_view_tensor(dtype, ne, nb, a, 0);
    ctx.tensor_mut(out).op = Op::Permute { axes };
    ctx.tensor_mut(out).src = smallvec::smallvec![a];
    out
}

/// `TRANSPOSE(a)`: swaps dims 0 and 1 (`permute` specialized to the
/// matmul-orientation-flip case).
pub fn transpose(ctx: &mut Context, a: TensorIndex) -> TensorIndex {
    let ta = ctx.tensor(a);
    let (dtype, mut ne, mut nb) = (ta.dtype, ta.ne, ta.nb);
    ne.swap(0, 1);
    nb.swap(0, 1);
    let out = ctx.new_view_tensor(dtype, ne, nb, a, 0);
    ctx.tensor_mut(out).op = Op::Transpose;
    ctx.tensor_mut(out).src = smallvec::smallvec![a];
    out
}

/// `CONT(a)`: a physical copy of `a` into a freshly allocated contiguous
/// tensor of the same shape.
pub fn cont(ctx: &mut Context, a: TensorIndex) -> TensorIndex {
    let ta = ctx.tensor(a);
    let (dtype, ne) = (ta.dtype, ta.ne);
    let out = ctx.new_tensor(dtype, ne);
    ctx.tensor_mut(out).op = Op::Cont;
    ctx.tensor_mut(out).src = smallvec::smallvec![a];
    out
}

/// `CPY(a, b)`: physically copies `a`'s elements into `b`'s storage
/// (shapes must have equal element count), returning a view of `b`.
pub fn cpy(ctx: &mut Context, a: TensorIndex, b: TensorIndex) -> TensorIndex {
    assert_eq!(
        ctx.tensor(a).nelements(),
        ctx.tensor(b).nelements(),
        "CPY requires equal element counts"
    );
    let (dtype, ne, nb) = {
        let tb = ctx.tensor(b);
        (tb.dtype, tb.ne, tb.nb)
    };
    let out = ctx.new_view_tensor(dtype, ne, nb, b, 0);
    ctx.tensor_mut(out).op = Op::Cpy;
    ctx.tensor_mut(out).src = smallvec::smallvec![a, b];
    out
}

/// `SET(a, b, offset)`: writes `b`'s elements into `a`'s storage starting
/// at byte `offset`, returning a view of `a`.
pub fn set(ctx: &mut Context, a: TensorIndex, b: TensorIndex, offset: usize) -> TensorIndex {
    let (dtype, ne, nb) = {
        let ta = ctx.tensor(a);
        (ta.dtype, ta.ne, ta.nb)
    };
    let out = ctx.new_view_tensor(dtype, ne, nb, a, offset);
    ctx.tensor_mut(out).op = Op::Set { offset };
    ctx.tensor_mut(out).src = smallvec::smallvec![a, b];
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextParams;

    fn ctx() -> Context {
        Context::new(ContextParams {
            mem_size: 1 << 20,
            no_alloc: false,
        })
    }

    #[test]
    fn add_requires_repeatable_rhs_and_preserves_lhs_shape() {
        let mut ctx = ctx();
        let a = ctx.new_tensor(Type::F32, [4, 1, 1, 1]);
        let b = ctx.new_tensor(Type::F32, [1, 1, 1, 1]);
        let c = add(&mut ctx, a, b);
        assert_eq!(ctx.tensor(c).ne, [4, 1, 1, 1]);
        assert_eq!(ctx.tensor(c).op, Op::Add);
    }

    #[test]
    #[should_panic(expected = "ADD")]
    fn add_rejects_non_repeatable_shapes() {
        let mut ctx = ctx();
        let a = ctx.new_tensor(Type::F32, [4, 1, 1, 1]);
        let b = ctx.new_tensor(Type::F32, [3, 1, 1, 1]);
        add(&mut ctx, a, b);
    }

    #[test]
    fn mul_mat_output_shape_is_m_by_n() {
        let mut ctx = ctx();
        let a = ctx.new_tensor(Type::F32, [2, 3, 1, 1]);
        let b = ctx.new_tensor(Type::F32, [2, 3, 1, 1]);
        let c = mul_mat(&mut ctx, a, b);
        assert_eq!(ctx.tensor(c).ne, [3, 3, 1, 1]);
        assert_eq!(ctx.tensor(c).dtype, Type::F32);
    }

    #[test]
    fn reshape_round_trips_to_original_shape() {
        let mut ctx = ctx();
        let a = ctx.new_tensor(Type::F32, [4, 3, 1, 1]);
        let r = reshape(&mut ctx, a, [12, 1, 1, 1]);
        let back = reshape(&mut ctx, r, [4, 3, 1, 1]);
        assert_eq!(ctx.tensor(back).ne, ctx.tensor(a).ne);
        assert_eq!(ctx.resolve_offset(back), ctx.resolve_offset(a));
    }

    #[test]
    fn permute_then_inverse_permute_restores_strides() {
        let mut ctx = ctx();
        let a = ctx.new_tensor(Type::F32, [4, 3, 2, 1]);
        let p = permute(&mut ctx, a, [1, 0, 2, 3]);
        let inv = permute(&mut ctx, p, [1, 0, 2, 3]);
        assert_eq!(ctx.tensor(inv).ne, ctx.tensor(a).ne);
        assert_eq!(ctx.tensor(inv).nb, ctx.tensor(a).nb);
    }

    #[test]
    fn soft_max_requires_mask_when_alibi_active() {
        let mut ctx = ctx();
        let a = ctx.new_tensor(Type::F32, [4, 1, 1, 1]);
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            soft_max(&mut ctx, a, None, 1.0, 2.0);
        }))
        .expect_err("max_bias > 0 without a mask must panic");
    }

    #[test]
    fn view_at_the_exact_boundary_is_accepted() {
        let mut ctx = ctx();
        // a: 4 x f32 = 16 bytes. A 2-element view at byte offset 8 with a
        // tight row stride touches bytes [8, 16) — exactly the boundary.
        let a = ctx.new_tensor(Type::F32, [4, 1, 1, 1]);
        let v = view(&mut ctx, a, [2, 1, 1, 1], [4, 8, 8, 8], 8);
        assert_eq!(ctx.tensor(v).ne, [2, 1, 1, 1]);
    }

    #[test]
    #[should_panic(expected = "VIEW")]
    fn view_rejects_byte_range_exceeding_source() {
        let mut ctx = ctx();
        // a: 4 x f32 = 16 bytes. ne0=3 with nb[1]=12 means the view's last
        // touched byte is 8 + 4 + (3-1)*4 = 20, past the 16-byte source.
        let a = ctx.new_tensor(Type::F32, [4, 1, 1, 1]);
        view(&mut ctx, a, [3, 1, 1, 1], [4, 12, 12, 12], 8);
    }
}
