//! The computation graph: a topologically ordered view over a [`Context`]'s
//! tensors, built by a depth-first post-order walk from one or more roots.

use crate::context::Context;
use crate::op::Op;
use crate::tensor::TensorIndex;
use std::collections::HashSet;

/// Sibling visitation order within [`build_forward_expand`]; biases how
/// the parallel executor's work ends up interleaved across threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GraphOrder {
    #[default]
    LeftToRight,
    RightToLeft,
}

/// A built graph: leaves first, then nodes in dependency order, optionally
/// paired with a gradient tensor per node.
#[derive(Debug, Default)]
pub struct Graph {
    pub leafs: Vec<TensorIndex>,
    pub nodes: Vec<TensorIndex>,
    pub grads: Option<Vec<Option<TensorIndex>>>,
    visited: HashSet<TensorIndex>,
    pub order: GraphOrder,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    /// `nodes`/`leafs` grow as plain `Vec`s with no preallocation hint
    /// needed; `with_grads` decides whether a parallel gradient array is
    /// tracked alongside them.
    pub fn with_grads(with_grads: bool) -> Graph {
        let mut g = Graph::new();
        if with_grads {
            g.grads = Some(Vec::new());
        }
        g
    }

    /// Zeroes every tracked gradient slot. Callers
    /// still own reallocating the gradient tensors' bytes to zero in the
    /// context; this only clears the graph's own bookkeeping so the next
    /// `build_backward_expand` starts the "first contribution" tracking
    /// fresh.
    pub fn reset(&mut self) {
        if let Some(grads) = &mut self.grads {
            grads.clear();
            grads.resize(self.nodes.len(), None);
        }
    }

    fn visit(&mut self, ctx: &Context, idx: TensorIndex) {
        if self.visited.contains(&idx) {
            return;
        }
        self.visited.insert(idx);

        let srcs: Vec<TensorIndex> = ctx.tensor(idx).src.iter().copied().collect();
        let ordered: Box<dyn Iterator<Item = TensorIndex>> = match self.order {
            GraphOrder::LeftToRight => Box::new(srcs.into_iter()),
            GraphOrder::RightToLeft => Box::new(srcs.into_iter().rev()),
        };
        for src in ordered {
            self.visit(ctx, src);
        }

        let t = ctx.tensor(idx);
        let is_leaf = t.op == Op::None;
        if is_leaf {
            self.leafs.push(idx);
        } else {
            self.nodes.push(idx);
        }
    }

    /// Depth-first post-order traversal from `root`. Already-visited
    /// tensors are skipped (shared
    /// subgraphs are only recorded once); `src[i]` slots are walked in the
    /// order `self.order` selects.
    pub fn build_forward_expand(&mut self, ctx: &Context, root: TensorIndex) {
        self.visit(ctx, root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextParams;
    use crate::dtype::Type;
    use crate::factory;

    #[test]
    fn diamond_shaped_graph_visits_shared_leaf_once() {
        let mut ctx = Context::new(ContextParams {
            mem_size: 1 << 16,
            no_alloc: false,
        });
        let leaf = ctx.new_tensor(Type::F32, [4, 1, 1, 1]);
        let a = factory::sqr(&mut ctx, leaf);
        let b = factory::sqrt(&mut ctx, leaf);
        let c = factory::add(&mut ctx, a, b);

        let mut g = Graph::new();
        g.build_forward_expand(&ctx, c);

        assert_eq!(g.leafs, vec![leaf]);
        assert_eq!(g.nodes.last().copied(), Some(c));
        assert_eq!(g.nodes.len(), 3);
    }

    #[test]
    fn every_src_precedes_its_node_or_is_a_leaf() {
        let mut ctx = Context::new(ContextParams {
            mem_size: 1 << 16,
            no_alloc: false,
        });
        let a = ctx.new_tensor(Type::F32, [4, 1, 1, 1]);
        let b = ctx.new_tensor(Type::F32, [4, 1, 1, 1]);
        let c = factory::add(&mut ctx, a, b);
        let d = factory::sqr(&mut ctx, c);

        let mut g = Graph::new();
        g.build_forward_expand(&ctx, d);

        let leafset: HashSet<_> = g.leafs.iter().copied().collect();
        for (i, &n) in g.nodes.iter().enumerate() {
            for &s in ctx.tensor(n).src.iter() {
                let earlier = g.nodes[..i].contains(&s);
                assert!(leafset.contains(&s) || earlier, "src {s:?} of node {n:?} out of order");
            }
        }
    }
}
