//! Elementwise unary kernels: SQR/SQRT/LOG/SCALE plus the `UnaryOp` family.
//! GELU/GELU_quick route through the fp16 lookup tables in [`crate::numeric`]
//! instead of evaluating `tanh`/`exp` per element.

use super::{gather_f32, partition, write_f32_range};
use crate::context::Context;
use crate::numeric;
use crate::op::UnaryOp;
use crate::tensor::TensorIndex;

pub fn eval(ctx: &Context, node: TensorIndex, ith: usize, nth: usize, f: impl Fn(f32) -> f32) {
    let t = ctx.tensor(node);
    let a_idx = t.src[0];
    let a = gather_f32(ctx, a_idx);
    let n = t.nelements() as usize;
    let (start, end) = partition(n, ith, nth);
    let out: Vec<f32> = a[start..end].iter().map(|&x| f(x)).collect();
    write_f32_range(ctx, node, start, &out);
}

fn gelu_via_lut(x: f32) -> f32 {
    numeric::fp16_to_fp32(numeric::gelu_f16_lut(numeric::fp32_to_fp16(x)))
}

fn gelu_quick_via_lut(x: f32) -> f32 {
    numeric::fp16_to_fp32(numeric::gelu_quick_f16_lut(numeric::fp32_to_fp16(x)))
}

pub fn eval_named(ctx: &Context, node: TensorIndex, ith: usize, nth: usize, op: UnaryOp) {
    match op {
        UnaryOp::Relu => eval(ctx, node, ith, nth, |x| x.max(0.0)),
        UnaryOp::Gelu => eval(ctx, node, ith, nth, gelu_via_lut),
        UnaryOp::GeluQuick => eval(ctx, node, ith, nth, gelu_quick_via_lut),
        UnaryOp::Silu => eval(ctx, node, ith, nth, numeric::silu_f32),
        UnaryOp::Tanh => eval(ctx, node, ith, nth, f32::tanh),
        UnaryOp::Elu => eval(ctx, node, ith, nth, |x| if x > 0.0 { x } else { x.exp() - 1.0 }),
        UnaryOp::HardSwish => eval(ctx, node, ith, nth, numeric::hardswish_f32),
        UnaryOp::HardSigmoid => eval(ctx, node, ith, nth, numeric::hardsigmoid_f32),
        UnaryOp::Sigmoid => eval(ctx, node, ith, nth, numeric::sigmoid_f32),
        UnaryOp::Sgn => eval(ctx, node, ith, nth, |x| {
            if x > 0.0 {
                1.0
            } else if x < 0.0 {
                -1.0
            } else {
                0.0
            }
        }),
        UnaryOp::Step => eval(ctx, node, ith, nth, |x| if x > 0.0 { 1.0 } else { 0.0 }),
        UnaryOp::Neg => eval(ctx, node, ith, nth, |x| -x),
        UnaryOp::Abs => eval(ctx, node, ith, nth, f32::abs),
    }
}
