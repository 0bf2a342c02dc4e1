//! The arena-allocated context: one bump allocator backing every tensor's
//! element bytes, plus the `Vec<Tensor>` that is the graph's node storage.

use crate::dtype::Type;
use crate::numeric;
use crate::tensor::{Tensor, TensorData, TensorIndex};

/// Alignment every arena allocation is bumped up to. 16 covers the widest
/// SIMD load width any element type's `to_float`/`from_float` might want to
/// use on the first element of a row.
pub const MEM_ALIGN: usize = 16;

/// Parameters to [`Context::new`].
#[derive(Debug, Clone, Copy)]
pub struct ContextParams {
    /// Size in bytes of the arena buffer backing element data.
    pub mem_size: usize,
    /// If set, `new_tensor` allocates descriptors only; callers attach
    /// element bytes out of band (e.g. the GGUF reader in `no_alloc` mode).
    pub no_alloc: bool,
}

fn align_up(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

/// Bump allocator owning every [`Tensor`] and element byte created through
/// it. Tensors live until the `Context` is dropped; there is no per-tensor
/// destructor or free list.
pub struct Context {
    params: ContextParams,
    buffer: Vec<u8>,
    used: usize,
    tensors: Vec<Tensor>,
    /// Backs tensors allocated while scratch mode is active. Persists for
    /// the context's lifetime once sized, so a tensor allocated under
    /// scratch stays valid even after the caller deactivates it — only the
    /// *destination* of future allocations toggles, never past ones.
    scratch_buffer: Vec<u8>,
    scratch_used: usize,
    scratch_active: bool,
}

impl Context {
    /// Allocate the arena buffer. On first-ever call in the process,
    /// initializes the fp16/bf16 lookup tables and GELU LUTs (see
    /// [`numeric::ensure_luts_initialized`]).
    pub fn new(params: ContextParams) -> Context {
        numeric::ensure_luts_initialized();
        log::debug!(
            "new context: mem_size={} no_alloc={}",
            params.mem_size,
            params.no_alloc
        );
        Context {
            params,
            buffer: vec![0u8; params.mem_size],
            used: 0,
            tensors: Vec::new(),
            scratch_buffer: Vec::new(),
            scratch_used: 0,
            scratch_active: false,
        }
    }

    pub fn no_alloc(&self) -> bool {
        self.params.no_alloc
    }

    /// Bytes consumed in the main arena so far.
    pub fn used_mem(&self) -> usize {
        self.used
    }

    /// Activate (or, passing `None`, deactivate) scratch-region
    /// allocation, sizing the region to `size` bytes the first time it's
    /// requested. Returns whether scratch was active before this call, so
    /// callers can restore it — `set_scratch` toggles a context-wide
    /// switch, so a caller that activates it for a few allocations must put
    /// it back the way they found it when done.
    pub fn set_scratch(&mut self, size: Option<usize>) -> bool {
        let was_active = self.scratch_active;
        match size {
            Some(size) => {
                if self.scratch_buffer.len() < size {
                    self.scratch_buffer.resize(size, 0);
                }
                self.scratch_active = true;
            }
            None => self.scratch_active = false,
        }
        was_active
    }

    /// Bump-allocate `size` bytes aligned to [`MEM_ALIGN`], from the
    /// scratch region if one is active, else the main arena. Aborts if the
    /// remaining space can't fit the request: an arena sized too small for
    /// the graph it's asked to hold is a caller bug, not a condition a
    /// library function should paper over.
    fn alloc_bytes(&mut self, size: usize) -> (usize, bool) {
        let size = align_up(size, MEM_ALIGN);
        if self.scratch_active {
            let offset = align_up(self.scratch_used, MEM_ALIGN);
            if offset + size > self.scratch_buffer.len() {
                log::error!(
                    "scratch exhausted: need {size} bytes at offset {offset}, capacity {}",
                    self.scratch_buffer.len()
                );
                panic!("ggml scratch exhausted");
            }
            self.scratch_used = offset + size;
            return (offset, true);
        }
        let offset = align_up(self.used, MEM_ALIGN);
        if offset + size > self.buffer.len() {
            log::error!(
                "context arena exhausted: need {size} bytes at offset {offset}, capacity {}",
                self.buffer.len()
            );
            panic!("ggml context arena exhausted");
        }
        self.used = offset + size;
        (offset, false)
    }

    /// Allocate a tensor descriptor and, unless `no_alloc` is set, reserve
    /// its element storage.
    pub fn new_tensor(&mut self, dtype: Type, ne: [i64; 4]) -> TensorIndex {
        let mut tensor = Tensor::leaf(dtype, ne);
        if !self.params.no_alloc && tensor.nelements() > 0 {
            let (offset, in_scratch) = self.alloc_bytes(tensor.nbytes());
            tensor.data = if in_scratch {
                TensorData::OwnedScratch { offset }
            } else {
                TensorData::Owned { offset }
            };
        }
        self.push(tensor)
    }

    /// A tensor descriptor aliasing `base`'s bytes at `view_offs`, with
    /// caller-supplied shape/strides. Used by view/reshape/permute/
    /// transpose — each is responsible for validating its own `ne`/`nb`
    /// before calling this; it does not re-derive or check them.
    pub fn new_view_tensor(
        &mut self,
        dtype: Type,
        ne: [i64; 4],
        nb: [usize; 4],
        base: TensorIndex,
        view_offs: usize,
    ) -> TensorIndex {
        let mut tensor = Tensor::leaf(dtype, ne);
        tensor.nb = nb;
        tensor.data = TensorData::View { base, view_offs };
        self.push(tensor)
    }

    fn push(&mut self, tensor: Tensor) -> TensorIndex {
        let idx = TensorIndex(self.tensors.len() as u32);
        self.tensors.push(tensor);
        idx
    }

    pub fn tensor(&self, idx: TensorIndex) -> &Tensor {
        &self.tensors[idx.0 as usize]
    }

    pub fn tensor_mut(&mut self, idx: TensorIndex) -> &mut Tensor {
        &mut self.tensors[idx.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Resolve `idx`'s absolute byte offset, walking the view chain.
    /// `None` if unallocated (no_alloc leaf, or an op result pending
    /// execution). The `bool` is `true` when the offset is into the
    /// scratch buffer rather than the main arena.
    fn resolve_location(&self, idx: TensorIndex) -> Option<(bool, usize)> {
        match self.tensor(idx).data {
            TensorData::Owned { offset } => Some((false, offset)),
            TensorData::OwnedScratch { offset } => Some((true, offset)),
            TensorData::Unallocated => None,
            TensorData::View { base, view_offs } => self
                .resolve_location(base)
                .map(|(scratch, b)| (scratch, b + view_offs)),
        }
    }

    /// Resolve `idx`'s absolute byte offset into whichever buffer backs
    /// it. `None` if unallocated.
    pub fn resolve_offset(&self, idx: TensorIndex) -> Option<usize> {
        self.resolve_location(idx).map(|(_, off)| off)
    }

    pub fn data(&self, idx: TensorIndex) -> &[u8] {
        let (in_scratch, offset) = self
            .resolve_location(idx)
            .expect("tensor has no backing storage");
        let len = self.tensor(idx).nbytes();
        let buf = if in_scratch { &self.scratch_buffer } else { &self.buffer };
        &buf[offset..offset + len]
    }

    /// Mutable access to `idx`'s bytes through a shared `&Context`, for the
    /// parallel executor: every worker holds only `&Context`, but each op's
    /// output region is partitioned disjointly across threads by the
    /// kernel itself, so no two callers ever alias the same bytes. Callers
    /// outside `crate::kernels` should use [`Context::data_mut`].
    ///
    /// # Safety
    /// The caller must guarantee the returned slice does not overlap any
    /// other live reference into this context's buffers.
    pub unsafe fn data_mut_shared(&self, idx: TensorIndex) -> &mut [u8] {
        let (in_scratch, offset) = self
            .resolve_location(idx)
            .expect("tensor has no backing storage");
        let len = self.tensor(idx).nbytes();
        let base = if in_scratch {
            self.scratch_buffer.as_ptr()
        } else {
            self.buffer.as_ptr()
        } as *mut u8;
        std::slice::from_raw_parts_mut(base.add(offset), len)
    }

    pub fn data_mut(&mut self, idx: TensorIndex) -> &mut [u8] {
        let (in_scratch, offset) = self
            .resolve_location(idx)
            .expect("tensor has no backing storage");
        let len = self.tensor(idx).nbytes();
        let buf = if in_scratch {
            &mut self.scratch_buffer
        } else {
            &mut self.buffer
        };
        &mut buf[offset..offset + len]
    }

    /// Reads one scalar at `elem_byte_offset` past `idx`'s resolved base
    /// offset, converting through the element type's `to_float`. Used by
    /// the kernels to walk strided (permuted/transposed) dense tensors
    /// element-by-element; callers must ensure `idx`'s dtype has
    /// `block_size == 1` (quantized formats can't be addressed mid-block).
    pub fn read_scalar_f32(&self, idx: TensorIndex, elem_byte_offset: usize) -> f32 {
        let (in_scratch, base) = self
            .resolve_location(idx)
            .expect("tensor has no backing storage");
        let t = self.tensor(idx);
        debug_assert_eq!(t.dtype.block_size(), 1, "strided read requires a dense element type");
        let ts = t.dtype.descriptor().type_size;
        let buf = if in_scratch { &self.scratch_buffer } else { &self.buffer };
        let off = base + elem_byte_offset;
        let mut out = [0f32; 1];
        (t.dtype.descriptor().to_float)(&buf[off..off + ts], &mut out);
        out[0]
    }

    /// Reads `len` raw bytes starting `byte_offset` past `idx`'s resolved
    /// base offset, from whichever buffer backs it. Lets the matmul/attention
    /// kernels address rows via a tensor's own `nb` strides directly,
    /// independent of `idx`'s own (possibly stride-assuming) `nbytes()`.
    pub fn raw_bytes_at(&self, idx: TensorIndex, byte_offset: usize, len: usize) -> &[u8] {
        let (in_scratch, base) = self
            .resolve_location(idx)
            .expect("tensor has no backing storage");
        let buf = if in_scratch { &self.scratch_buffer } else { &self.buffer };
        let off = base + byte_offset;
        &buf[off..off + len]
    }

    /// Fills an fp32 leaf with a constant value.
    pub fn set_f32(&mut self, idx: TensorIndex, v: f32) {
        assert_eq!(self.tensor(idx).dtype, Type::F32, "set_f32 requires an f32 tensor");
        let n = self.tensor(idx).nelements() as usize;
        let bytes = self.data_mut(idx);
        for chunk in bytes.chunks_exact_mut(4).take(n) {
            chunk.copy_from_slice(&v.to_le_bytes());
        }
    }

    /// Fills an i32 leaf with a constant value.
    pub fn set_i32(&mut self, idx: TensorIndex, v: i32) {
        assert_eq!(self.tensor(idx).dtype, Type::I32, "set_i32 requires an i32 tensor");
        let n = self.tensor(idx).nelements() as usize;
        let bytes = self.data_mut(idx);
        for chunk in bytes.chunks_exact_mut(4).take(n) {
            chunk.copy_from_slice(&v.to_le_bytes());
        }
    }

    /// Reads a contiguous fp32 tensor's contents as a flat row, converting
    /// through the element type's `to_float`.
    pub fn get_f32_1d(&self, idx: TensorIndex) -> Vec<f32> {
        let t = self.tensor(idx);
        let n = t.nelements() as usize;
        let mut out = vec![0f32; n];
        (t.dtype.descriptor().to_float)(self.data(idx), &mut out);
        out
    }

    /// `ne`-shaped read: same data as [`Context::get_f32_1d`], indexable by
    /// the tensor's own extents. Requires the tensor be contiguous.
    pub fn get_f32_nd(&self, idx: TensorIndex) -> (Vec<f32>, [i64; 4]) {
        let t = self.tensor(idx);
        assert!(t.is_contiguous(), "get_f32_nd requires a contiguous tensor");
        (self.get_f32_1d(idx), t.ne)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_ctx() -> Context {
        Context::new(ContextParams {
            mem_size: 1 << 16,
            no_alloc: false,
        })
    }

    #[test]
    fn new_tensor_allocates_distinct_non_overlapping_regions() {
        let mut ctx = small_ctx();
        let a = ctx.new_tensor(Type::F32, [4, 1, 1, 1]);
        let b = ctx.new_tensor(Type::F32, [4, 1, 1, 1]);
        let oa = ctx.resolve_offset(a).unwrap();
        let ob = ctx.resolve_offset(b).unwrap();
        assert_ne!(oa, ob);
        assert!(ob >= oa + ctx.tensor(a).nbytes());
    }

    #[test]
    fn no_alloc_tensor_has_no_storage() {
        let mut ctx = Context::new(ContextParams {
            mem_size: 1024,
            no_alloc: true,
        });
        let a = ctx.new_tensor(Type::F32, [4, 1, 1, 1]);
        assert_eq!(ctx.resolve_offset(a), None);
    }

    #[test]
    fn set_and_get_f32_round_trips() {
        let mut ctx = small_ctx();
        let a = ctx.new_tensor(Type::F32, [4, 1, 1, 1]);
        ctx.set_f32(a, 2.5);
        assert_eq!(ctx.get_f32_1d(a), vec![2.5; 4]);
    }

    #[test]
    fn view_tensor_resolves_through_base() {
        let mut ctx = small_ctx();
        let base = ctx.new_tensor(Type::F32, [8, 1, 1, 1]);
        let base_offset = ctx.resolve_offset(base).unwrap();
        let view = ctx.new_view_tensor(Type::F32, [4, 1, 1, 1], [4, 16, 16, 16], base, 16);
        assert_eq!(ctx.resolve_offset(view), Some(base_offset + 16));
    }

    #[test]
    #[should_panic(expected = "arena exhausted")]
    fn arena_exhaustion_aborts() {
        let mut ctx = Context::new(ContextParams {
            mem_size: 8,
            no_alloc: false,
        });
        ctx.new_tensor(Type::F32, [1024, 1, 1, 1]);
    }

    #[test]
    fn scratch_region_is_used_while_installed() {
        let mut ctx = small_ctx();
        let main_used_before = ctx.used_mem();
        let was_active = ctx.set_scratch(Some(256));
        assert!(!was_active);
        let t = ctx.new_tensor(Type::F32, [4, 1, 1, 1]);
        assert_eq!(ctx.used_mem(), main_used_before, "scratch tensor must not touch main arena");
        let off = ctx.resolve_offset(t).unwrap();
        assert!(off < 256);
        ctx.set_scratch(None);
        let t2 = ctx.new_tensor(Type::F32, [4, 1, 1, 1]);
        assert!(ctx.used_mem() > main_used_before, "post-restore tensor goes to main arena");
        assert_eq!(ctx.data(t).len(), 16);
        assert_eq!(ctx.data(t2).len(), 16);
    }
}
