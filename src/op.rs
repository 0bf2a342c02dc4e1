//! The operator tag recorded on every non-leaf tensor.
//!
//! A tagged enum sized to each operator's actual parameters, rather than a
//! fixed-size parameter blob shared by every variant: `Op::Scale(f32)` is
//! four bytes, `Op::Rope { .. }` is a handful of fields, and there's no
//! blob layout to interpret at dispatch time.

/// Bias direction used by [`Op::Rope`]'s NeoX-vs-default pairing bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RopeMode {
    /// Pairs channel `i` with `i + 1`.
    Normal,
    /// Pairs channel `i` with `i + n_dims / 2`.
    NeoX,
}

/// Elementwise unary functions sharing one shape-preserving contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Relu,
    Gelu,
    GeluQuick,
    Silu,
    Tanh,
    Elu,
    HardSwish,
    HardSigmoid,
    Sigmoid,
    Sgn,
    Step,
    Neg,
    Abs,
}

/// The operator that produced a tensor. `None` marks a leaf.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    None,

    Add,
    Sub,
    Mul,
    Div,
    Sqr,
    Sqrt,
    Log,
    Scale(f32),

    Sum,
    Mean,
    Repeat,

    MulMat,
    MulMatId {
        n_as: usize,
    },
    OutProd,

    Norm {
        eps: f32,
    },
    RmsNorm {
        eps: f32,
    },
    GroupNorm {
        n_groups: usize,
        eps: f32,
    },

    SoftMax {
        scale: f32,
        max_bias: f32,
    },
    DiagMaskInf {
        n_past: usize,
    },
    DiagMaskZero {
        n_past: usize,
    },

    Rope {
        n_dims: usize,
        mode: RopeMode,
        n_ctx_orig: i32,
        base: f32,
        ext_factor: f32,
        attn_factor: f32,
        beta_fast: f32,
        beta_slow: f32,
        /// `freq_scale` from the caller; `1.0` disables YaRN scaling.
        freq_scale: f32,
    },

    FlashAttnExt {
        scale: f32,
        max_bias: f32,
    },

    Im2Col {
        stride_w: usize,
        stride_h: usize,
        pad_w: usize,
        pad_h: usize,
        dilation_w: usize,
        dilation_h: usize,
        is_2d: bool,
    },

    SsmConv,
    SsmScan,

    GetRows,

    Unary(UnaryOp),

    View {
        offset: usize,
    },
    Reshape,
    Permute {
        axes: [usize; 4],
    },
    Transpose,
    Cont,
    Cpy,
    Set {
        offset: usize,
    },
}

impl Op {
    /// Is this op in the table `build_backward_expand` knows how to
    /// differentiate? Ops outside the table abort if they reach backward.
    pub fn supports_backward(&self) -> bool {
        matches!(
            self,
            Op::Add
                | Op::Sub
                | Op::Mul
                | Op::Div
                | Op::Sqr
                | Op::Sqrt
                | Op::Log
                | Op::Sum
                | Op::Mean
                | Op::Repeat
                | Op::RmsNorm { .. }
                | Op::MulMat
                | Op::Scale(_)
                | Op::Set { .. }
                | Op::Cpy
                | Op::Cont
                | Op::Reshape
                | Op::View { .. }
                | Op::Permute { .. }
                | Op::Transpose
                | Op::GetRows
                | Op::DiagMaskInf { .. }
                | Op::DiagMaskZero { .. }
                | Op::SoftMax { .. }
                | Op::Rope { .. }
                | Op::Unary(
                    UnaryOp::Neg
                        | UnaryOp::Relu
                        | UnaryOp::Silu
                        | UnaryOp::Step
                        | UnaryOp::Sgn
                        | UnaryOp::Abs
                )
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Op::None => "NONE",
            Op::Add => "ADD",
            Op::Sub => "SUB",
            Op::Mul => "MUL",
            Op::Div => "DIV",
            Op::Sqr => "SQR",
            Op::Sqrt => "SQRT",
            Op::Log => "LOG",
            Op::Scale(_) => "SCALE",
            Op::Sum => "SUM",
            Op::Mean => "MEAN",
            Op::Repeat => "REPEAT",
            Op::MulMat => "MUL_MAT",
            Op::MulMatId { .. } => "MUL_MAT_ID",
            Op::OutProd => "OUT_PROD",
            Op::Norm { .. } => "NORM",
            Op::RmsNorm { .. } => "RMS_NORM",
            Op::GroupNorm { .. } => "GROUP_NORM",
            Op::SoftMax { .. } => "SOFT_MAX",
            Op::DiagMaskInf { .. } => "DIAG_MASK_INF",
            Op::DiagMaskZero { .. } => "DIAG_MASK_ZERO",
            Op::Rope { .. } => "ROPE",
            Op::FlashAttnExt { .. } => "FLASH_ATTN_EXT",
            Op::Im2Col { .. } => "IM2COL",
            Op::SsmConv => "SSM_CONV",
            Op::SsmScan => "SSM_SCAN",
            Op::GetRows => "GET_ROWS",
            Op::Unary(_) => "UNARY",
            Op::View { .. } => "VIEW",
            Op::Reshape => "RESHAPE",
            Op::Permute { .. } => "PERMUTE",
            Op::Transpose => "TRANSPOSE",
            Op::Cont => "CONT",
            Op::Cpy => "CPY",
            Op::Set { .. } => "SET",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backward_table_covers_the_differentiable_ops() {
        assert!(Op::Add.supports_backward());
        assert!(Op::MulMat.supports_backward());
        assert!(Op::Rope {
            n_dims: 0,
            mode: RopeMode::Normal,
            n_ctx_orig: 0,
            base: 10000.0,
            ext_factor: 0.0,
            attn_factor: 1.0,
            beta_fast: 32.0,
            beta_slow: 1.0,
            freq_scale: 1.0
        }
        .supports_backward());
        assert!(!Op::SsmScan.supports_backward());
        assert!(!Op::Im2Col {
            stride_w: 1,
            stride_h: 1,
            pad_w: 0,
            pad_h: 0,
            dilation_w: 1,
            dilation_h: 1,
            is_2d: true
        }
        .supports_backward());
    }
}
