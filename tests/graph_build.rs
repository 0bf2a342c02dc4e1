//! Graph construction semantics independent of execution: topological
//! ordering, shared-subgraph dedup, and `graph_reset`.

use cgml::dtype::Type;
use cgml::{factory, Context, ContextParams, Graph};

fn ctx() -> Context {
    Context::new(ContextParams { mem_size: 1 << 16, no_alloc: false })
}

#[test]
fn nodes_are_ordered_before_their_dependents() {
    let mut ctx = ctx();
    let a = ctx.new_tensor(Type::F32, [4, 1, 1, 1]);
    let b = ctx.new_tensor(Type::F32, [4, 1, 1, 1]);
    let sum = factory::add(&mut ctx, a, b);
    let squared = factory::sqr(&mut ctx, sum);

    let mut graph = Graph::new();
    graph.build_forward_expand(&ctx, squared);

    let sum_pos = graph.nodes.iter().position(|&n| n == sum).unwrap();
    let sq_pos = graph.nodes.iter().position(|&n| n == squared).unwrap();
    assert!(sum_pos < sq_pos, "a node must be ordered before its dependent");
    assert!(graph.leafs.contains(&a));
    assert!(graph.leafs.contains(&b));
}

#[test]
fn shared_subgraphs_are_recorded_once() {
    let mut ctx = ctx();
    let a = ctx.new_tensor(Type::F32, [4, 1, 1, 1]);
    let b = ctx.new_tensor(Type::F32, [4, 1, 1, 1]);
    let sum = factory::add(&mut ctx, a, b);
    // Both `left` and `right` depend on `sum`; building from a root that
    // uses `sum` twice must not duplicate it in `nodes`.
    let left = factory::sqr(&mut ctx, sum);
    let right = factory::sqrt(&mut ctx, sum);
    let root = factory::add(&mut ctx, left, right);

    let mut graph = Graph::new();
    graph.build_forward_expand(&ctx, root);

    let occurrences = graph.nodes.iter().filter(|&&n| n == sum).count();
    assert_eq!(occurrences, 1, "shared subtree must be visited once");
}

#[test]
fn graph_reset_clears_gradient_slots() {
    let mut ctx = ctx();
    let a = ctx.new_tensor(Type::F32, [4, 1, 1, 1]);
    let b = ctx.new_tensor(Type::F32, [4, 1, 1, 1]);
    let sum = factory::add(&mut ctx, a, b);

    let mut graph = Graph::with_grads(true);
    graph.build_forward_expand(&ctx, sum);
    graph.reset();

    let grads = graph.grads.as_ref().unwrap();
    assert_eq!(grads.len(), graph.nodes.len());
    assert!(grads.iter().all(Option::is_none));
}
