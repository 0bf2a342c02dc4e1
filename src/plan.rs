//! The compute plan: sizes the scratch work buffer the executor needs
//! before a graph can run.

use crate::context::Context;
use crate::dtype::Type;
use crate::error::PlanError;
use crate::graph::Graph;
use crate::op::Op;

/// Bytes one worker thread needs, padded up to a cache line so adjacent
/// threads' scratch regions never share a line and the executor can hand
/// out equal-sized slices with a single division.
const CACHE_LINE: usize = 64;

/// Result of [`plan`]: thread count plus the work buffer the caller must
/// allocate before calling [`crate::executor::compute`].
#[derive(Debug, Clone)]
pub struct ComputePlan {
    pub n_threads: usize,
    pub work_size: usize,
}

impl ComputePlan {
    /// Validates a caller-supplied buffer is large enough.
    pub fn check_work_buffer(&self, have: usize) -> Result<(), PlanError> {
        if have < self.work_size {
            return Err(PlanError::WorkBufferTooSmall {
                needed: self.work_size,
                have,
            });
        }
        Ok(())
    }
}

/// Bytes of conversion scratch one worker needs for a MUL_MAT-shaped op:
/// a single row of `B` (or `x`/experts, for MUL_MAT_ID) converted into `A`'s
/// `vec_dot_type`, or zero if `A` isn't quantized or `B` already stores
/// that type. Sized per row, not per matrix — each worker converts only
/// the row it's about to dot against, claimed one at a time off the shared
/// chunk counter, so the buffer never needs to hold more than one
/// converted row per thread.
fn conversion_row_bytes(a_type: Type, b_type: Type, k: usize) -> usize {
    if !a_type.is_quantized() {
        return 0;
    }
    let vdt = a_type.vec_dot_type();
    if vdt == b_type {
        0
    } else {
        vdt.row_size(k)
    }
}

fn per_thread_bytes(ctx: &Context, graph: &Graph, node_idx: usize) -> usize {
    let node = graph.nodes[node_idx];
    let t = ctx.tensor(node);
    match &t.op {
        Op::MulMat | Op::OutProd => {
            let a_type = ctx.tensor(t.src[0]).dtype;
            let b_type = ctx.tensor(t.src[1]).dtype;
            let k = ctx.tensor(t.src[0]).ne[0] as usize;
            conversion_row_bytes(a_type, b_type, k)
        }
        Op::MulMatId { n_as } => {
            let a_type = ctx.tensor(t.src[0]).dtype;
            let b_type = ctx.tensor(t.src[1]).dtype;
            let k = ctx.tensor(t.src[0]).ne[0] as usize;
            // Plus per-expert row-count / row-index scratch arrays.
            conversion_row_bytes(a_type, b_type, k) + *n_as * std::mem::size_of::<i32>() * 2
        }
        Op::Im2Col { .. } => 0,
        Op::FlashAttnExt { .. } => {
            let d = t.ne[0] as usize;
            3 * d * std::mem::size_of::<f32>()
        }
        Op::SoftMax { .. } | Op::Rope { .. } => t.ne[0] as usize * std::mem::size_of::<f32>(),
        _ => 0,
    }
}

/// Sizes one thread's scratch slot to the largest requirement across every
/// node in the graph, then multiplies by thread count — a single buffer
/// reused node-by-node, not one allocation per op.
pub fn plan(ctx: &Context, graph: &Graph, n_threads: usize) -> ComputePlan {
    let n_threads = n_threads.max(1);
    let mut max_per_thread = 0usize;
    for i in 0..graph.nodes.len() {
        max_per_thread = max_per_thread.max(per_thread_bytes(ctx, graph, i));
    }
    let padded_per_thread = max_per_thread.div_ceil(CACHE_LINE) * CACHE_LINE;
    ComputePlan {
        n_threads,
        work_size: padded_per_thread * n_threads,
    }
}
