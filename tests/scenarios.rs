//! End-to-end behavior tests against the public API: build tensors and a
//! graph, plan, compute, check results.

use cgml::dtype::Type;
use cgml::tensor::TensorIndex;
use cgml::{factory, Context, ContextParams, Graph};

fn ctx_with(mem_size: usize) -> Context {
    Context::new(ContextParams { mem_size, no_alloc: false })
}

fn fill_f32(ctx: &mut Context, idx: TensorIndex, values: &[f32]) {
    let bytes = ctx.data_mut(idx);
    for (chunk, v) in bytes.chunks_exact_mut(4).zip(values) {
        chunk.copy_from_slice(&v.to_le_bytes());
    }
}

fn run(ctx: &mut Context, root: TensorIndex, n_threads: usize) {
    let mut graph = Graph::new();
    graph.build_forward_expand(ctx, root);
    let plan = cgml::plan(ctx, &graph, n_threads);
    let mut work = vec![0u8; plan.work_size.max(1)];
    let status = cgml::compute(ctx, &graph, &plan, &mut work, None);
    assert_eq!(status, cgml::ComputeStatus::Success);
}

#[test]
fn elementwise_add_broadcasts_scalar_rhs() {
    let mut ctx = ctx_with(1 << 16);
    let a = ctx.new_tensor(Type::F32, [4, 1, 1, 1]);
    let b = ctx.new_tensor(Type::F32, [1, 1, 1, 1]);
    fill_f32(&mut ctx, a, &[1.0, 2.0, 3.0, 4.0]);
    fill_f32(&mut ctx, b, &[10.0]);

    let c = factory::add(&mut ctx, a, b);
    run(&mut ctx, c, 2);

    assert_eq!(ctx.get_f32_1d(c), vec![11.0, 12.0, 13.0, 14.0]);
}

#[test]
fn dense_fp32_matmul_produces_expected_rows() {
    let mut ctx = ctx_with(1 << 16);
    // A: K=2, M=3 -> rows [1,2],[3,4],[5,6]
    let a = ctx.new_tensor(Type::F32, [2, 3, 1, 1]);
    fill_f32(&mut ctx, a, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    // B: K=2, N=3 -> rows [1,0],[0,1],[0,0]
    let b = ctx.new_tensor(Type::F32, [2, 3, 1, 1]);
    fill_f32(&mut ctx, b, &[1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);

    let c = factory::mul_mat(&mut ctx, a, b);
    assert_eq!(ctx.tensor(c).ne, [3, 3, 1, 1]);
    run(&mut ctx, c, 2);

    assert_eq!(ctx.get_f32_1d(c), vec![1.0, 3.0, 5.0, 2.0, 4.0, 6.0, 0.0, 0.0, 0.0]);
}

#[test]
fn softmax_with_mask_zeroes_masked_positions() {
    let mut ctx = ctx_with(1 << 16);
    // X: ne0=3 (row length), ne1=2 (two rows).
    let x = ctx.new_tensor(Type::F32, [3, 2, 1, 1]);
    fill_f32(&mut ctx, x, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let mask = ctx.new_tensor(Type::F32, [3, 2, 1, 1]);
    fill_f32(&mut ctx, mask, &[0.0, f32::NEG_INFINITY, 0.0, 0.0, 0.0, 0.0]);

    let sm = factory::soft_max(&mut ctx, x, Some(mask), 1.0, 0.0);
    run(&mut ctx, sm, 1);

    let out = ctx.get_f32_1d(sm);
    let row0 = &out[0..3];
    let row1 = &out[3..6];

    assert!((row0[0] - 0.11920292).abs() < 1e-4);
    assert_eq!(row0[1], 0.0);
    assert!((row0[2] - 0.88079708).abs() < 1e-4);

    assert!((row1[0] - 0.09003057).abs() < 1e-4);
    assert!((row1[1] - 0.24472847).abs() < 1e-4);
    assert!((row1[2] - 0.66524096).abs() < 1e-4);
}

#[test]
fn fp16_round_trip_preserves_exact_values() {
    let xs = [0.0f32, 1.0, -1.0, 65504.0, 1e-5];
    for &x in &xs {
        let bits = cgml::numeric::fp32_to_fp16(x);
        let back = cgml::numeric::fp16_to_fp32(bits);
        if x == 1e-5 {
            // One of the two fp16 neighbors of 1e-5.
            assert!((back - 9.894_371e-6).abs() < 1e-9 || (back - 1e-5).abs() < 2e-6);
        } else {
            assert_eq!(back, x);
        }
    }
}

#[test]
fn concurrent_matmul_is_deterministic_across_thread_counts() {
    const N: usize = 64;
    let data_a: Vec<f32> = (0..N * N).map(|i| ((i * 31 + 7) % 97) as f32 - 48.0).collect();
    let data_b: Vec<f32> = (0..N * N).map(|i| ((i * 17 + 3) % 89) as f32 - 44.0).collect();

    let mut reference: Option<Vec<f32>> = None;
    for &n_threads in &[1usize, 2, 4, 8] {
        let mut ctx = ctx_with(4 << 20);
        let a = ctx.new_tensor(Type::F32, [N as i64, N as i64, 1, 1]);
        let b = ctx.new_tensor(Type::F32, [N as i64, N as i64, 1, 1]);
        fill_f32(&mut ctx, a, &data_a);
        fill_f32(&mut ctx, b, &data_b);
        let c = factory::mul_mat(&mut ctx, a, b);
        run(&mut ctx, c, n_threads);
        let out = ctx.get_f32_1d(c);
        match &reference {
            None => reference = Some(out),
            Some(r) => assert_eq!(r, &out, "n_threads={n_threads} diverged from the n_threads=1 baseline"),
        }
    }
}
