//! The parallel executor: a fixed-size team of OS threads forked per
//! `compute` call via [`std::thread::scope`], rather than a persistent pool
//! kept alive across calls — simpler lifetime management at the cost of a
//! thread-spawn per graph run. Barriers and the matmul chunk-claim counter
//! are the only cross-thread synchronization primitives.

use crate::context::Context;
use crate::error::ComputeStatus;
use crate::graph::Graph;
use crate::kernels;
use crate::plan::ComputePlan;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Policy for pinning worker threads to NUMA nodes. Only `Disabled`
/// does anything deterministic cross-platform; the others degrade to
/// `Disabled` off Linux.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NumaStrategy {
    #[default]
    Disabled,
    Distribute,
    Isolate,
    Numactl,
}

/// Enumerates `/sys/devices/system/node*` on Linux; returns an empty list
/// (and logs a fallback warning for non-`Disabled` strategies) everywhere
/// else.
pub fn enumerate_numa_nodes(strategy: NumaStrategy) -> Vec<u32> {
    if strategy == NumaStrategy::Disabled {
        return Vec::new();
    }
    #[cfg(target_os = "linux")]
    {
        let mut nodes = Vec::new();
        if let Ok(entries) = std::fs::read_dir("/sys/devices/system/node") {
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Some(rest) = name.strip_prefix("node") {
                        if let Ok(id) = rest.parse::<u32>() {
                            nodes.push(id);
                        }
                    }
                }
            }
        }
        if nodes.is_empty() {
            log::warn!("NUMA strategy {strategy:?} requested but no nodes found under /sys/devices/system/node; falling back to single-node behavior");
        }
        nodes.sort_unstable();
        nodes
    }
    #[cfg(not(target_os = "linux"))]
    {
        log::warn!("NUMA strategy {strategy:?} requested on a non-Linux platform; falling back to disabled");
        Vec::new()
    }
}

/// Two-counter spin/yield barrier: `arrived` counts arrivals,
/// `passed` toggles so a thread can tell "did the barrier I'm waiting on
/// actually complete" without needing a separate entry/exit counter.
struct Barrier {
    arrived: AtomicUsize,
    passed: AtomicUsize,
    n: usize,
}

impl Barrier {
    fn new(n: usize) -> Self {
        Barrier {
            arrived: AtomicUsize::new(0),
            passed: AtomicUsize::new(0),
            n,
        }
    }

    fn wait(&self) {
        if self.n <= 1 {
            return;
        }
        let my_epoch = self.passed.load(Ordering::Acquire);
        if self.arrived.fetch_add(1, Ordering::AcqRel) + 1 == self.n {
            self.arrived.store(0, Ordering::Release);
            self.passed.fetch_add(1, Ordering::Release);
        } else {
            let mut spins = 0;
            while self.passed.load(Ordering::Acquire) == my_epoch {
                if spins < 1000 {
                    std::hint::spin_loop();
                    spins += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        }
    }
}

/// Splits the caller's work buffer into disjoint, cache-line-padded
/// per-thread regions without a lock: [`ComputePlan`] already
/// guarantees `work_size == per_thread * n_threads`, so each worker only
/// ever touches the slice at its own `ith` offset.
struct WorkBuffer {
    ptr: *mut u8,
    len: usize,
    per_thread: usize,
}

// SAFETY: workers only index into their own `ith`-th slice (see
// `thread_slice`), so concurrent access across threads never overlaps.
unsafe impl Sync for WorkBuffer {}

impl WorkBuffer {
    fn new(buf: &mut [u8], n_threads: usize) -> WorkBuffer {
        let per_thread = if n_threads == 0 { 0 } else { buf.len() / n_threads.max(1) };
        WorkBuffer {
            ptr: buf.as_mut_ptr(),
            len: buf.len(),
            per_thread,
        }
    }

    /// Returns the byte range belonging to worker `ith`. Empty if the plan
    /// decided this op needs no scratch.
    fn thread_slice(&self, ith: usize) -> &mut [u8] {
        if self.per_thread == 0 {
            return &mut [];
        }
        let start = ith * self.per_thread;
        let start = start.min(self.len);
        let end = (start + self.per_thread).min(self.len);
        // SAFETY: [start, end) lies within the buffer passed to `new`, and
        // per-thread ranges for distinct `ith` never overlap.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(start), end - start) }
    }
}

/// State shared by every worker across the whole graph compute.
struct Shared<'a> {
    ctx: &'a Context,
    graph: &'a Graph,
    work: WorkBuffer,
    plan: &'a ComputePlan,
    barrier: Barrier,
    status: AtomicBool, // true == aborted
    abort_callback: Option<&'a (dyn Fn() -> bool + Sync)>,
    chunk_counter: AtomicUsize,
}

/// Runs every node in `graph.nodes` order, parallelized internally, with a
/// barrier between nodes. Single-threaded execution (`n_threads == 1`)
/// takes the same code path with barriers reduced to no-ops.
pub fn compute(
    ctx: &mut Context,
    graph: &Graph,
    plan: &ComputePlan,
    work: &mut [u8],
    abort_callback: Option<&(dyn Fn() -> bool + Sync)>,
) -> ComputeStatus {
    if let Err(e) = plan.check_work_buffer(work.len()) {
        log::error!("graph_compute: {e}");
        return ComputeStatus::Failed;
    }

    let n_threads = plan.n_threads;
    let shared = Shared {
        ctx,
        graph,
        work: WorkBuffer::new(work, n_threads),
        plan,
        barrier: Barrier::new(n_threads),
        status: AtomicBool::new(false),
        abort_callback,
        chunk_counter: AtomicUsize::new(0),
    };

    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(n_threads - 1);
        for ith in 1..n_threads {
            let shared_ref = &shared;
            handles.push(scope.spawn(move || worker_loop(shared_ref, ith, n_threads)));
        }
        worker_loop(&shared, 0, n_threads);
        for h in handles {
            let _ = h.join();
        }
    });

    if shared.status.load(Ordering::Acquire) {
        ComputeStatus::Aborted
    } else {
        ComputeStatus::Success
    }
}

fn worker_loop(shared: &Shared, ith: usize, nth: usize) {
    for node_idx in 0..shared.graph.nodes.len() {
        if shared.status.load(Ordering::Acquire) {
            break;
        }

        if ith == 0 {
            shared.chunk_counter.store(nth, Ordering::Release);
        }
        shared.barrier.wait();

        let node = shared.graph.nodes[node_idx];
        // SAFETY: every kernel partitions its output index range disjointly
        // across `ith`; the immutable `&Context` borrow here is shared read
        // access to operand tensors, and kernels write only their own
        // node's output bytes via interior, partition-disjoint access.
        kernels::dispatch(
            shared.ctx,
            node,
            ith,
            nth,
            &shared.chunk_counter,
            shared.work.thread_slice(ith),
        );

        shared.barrier.wait();

        if ith == 0 {
            if let Some(cb) = shared.abort_callback {
                if cb() {
                    shared.status.store(true, Ordering::Release);
                }
            }
        }
        shared.barrier.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barrier_releases_all_waiting_threads() {
        use std::sync::Arc;
        let barrier = Arc::new(Barrier::new(4));
        let counter = Arc::new(AtomicUsize::new(0));
        std::thread::scope(|scope| {
            for _ in 0..4 {
                let b = barrier.clone();
                let c = counter.clone();
                scope.spawn(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                    b.wait();
                    assert_eq!(c.load(Ordering::SeqCst), 4);
                });
            }
        });
    }

    #[test]
    fn single_thread_barrier_is_a_no_op() {
        let barrier = Barrier::new(1);
        barrier.wait();
    }

    #[test]
    fn numa_disabled_returns_no_nodes() {
        assert!(enumerate_numa_nodes(NumaStrategy::Disabled).is_empty());
    }
}
