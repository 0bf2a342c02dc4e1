//! A CPU tensor-computation engine: typed multidimensional tensors with
//! block-quantized element types, a deferred-execution computation graph,
//! a fork-join parallel executor, and the GGUF container format used to
//! persist and load tensors.
//!
//! The graph is arena-*indexed* (a [`tensor::TensorIndex`] into a
//! `Vec<Tensor>` owned by one [`Context`]) rather than pointer-linked, so
//! operand references stay `Copy` and valid across the arena's own growth.
//! Each tensor records a tagged [`op::Op`] describing how it was produced,
//! sized to that operator's actual parameters instead of a fixed-size
//! payload blob shared by every variant.
//!
//! ```text
//! dtype/quant/numeric -> tensor -> op -> context -> factory -> graph
//!   -> backward -> plan -> executor -> kernels
//! gguf (independent: reads/writes tensors through `context`)
//! ```

pub mod backward;
pub mod context;
pub mod dtype;
pub mod error;
pub mod executor;
pub mod factory;
pub mod gguf;
pub mod graph;
mod kernels;
pub mod numeric;
pub mod op;
pub mod plan;
pub mod quant;
pub mod tensor;

pub use context::{Context, ContextParams};
pub use dtype::Type;
pub use error::{ComputeStatus, GgufError, PlanError};
pub use executor::{compute, enumerate_numa_nodes, NumaStrategy};
pub use graph::{Graph, GraphOrder};
pub use op::{Op, RopeMode, UnaryOp};
pub use plan::{plan, ComputePlan};
pub use tensor::{Tensor, TensorIndex};
