//! Command list recording.

use crate::device::DeviceError;
use crate::memory::ResourceState;
use crate::Backend;

use std::any::Any;
use std::fmt::Debug;

/// Root descriptor table families of the compute signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableKind {
    /// Unordered access views.
    Uav,
    /// Shader resource views.
    Srv,
    /// Samplers.
    Sampler,
}

/// One state transition record.
#[derive(Debug)]
pub struct MemoryBarrier<'a, B: Backend> {
    /// Allocation being transitioned.
    pub memory: &'a B::Memory,
    /// State the GPU last saw it in.
    pub before: ResourceState,
    /// State required by the next command.
    pub after: ResourceState,
}

/// A recordable, recyclable buffer of GPU commands.
///
/// A list is recorded by exactly one thread. After `close` it may be handed
/// to [`crate::Queue::execute`]; `reset` against a fresh allocator returns
/// it to the recording state.
pub trait CommandList<B: Backend>: Debug + Any + Send + Sync {
    /// Reopen a closed list for recording, backed by `allocator`.
    fn reset(&mut self, allocator: &B::CommandAllocator) -> Result<(), DeviceError>;

    /// Finish recording.
    fn close(&mut self) -> Result<(), DeviceError>;

    /// Bind the shader-visible heaps for subsequent table binds.
    fn set_descriptor_heaps(
        &mut self,
        view_heap: &B::DescriptorHeap,
        sampler_heap: Option<&B::DescriptorHeap>,
    );

    /// Flush a batch of state transitions.
    fn resource_barrier(&mut self, barriers: &[MemoryBarrier<B>]);

    /// Copy `size` bytes between buffer allocations.
    fn copy_buffer(
        &mut self,
        src: &B::Memory,
        src_offset: u64,
        dst: &B::Memory,
        dst_offset: u64,
        size: u64,
    );

    /// Fill `size` bytes of `dst` with `pattern` repeated.
    fn fill_buffer(&mut self, dst: &B::Memory, offset: u64, size: u64, pattern: &[u8]);

    /// Bind a compute pipeline.
    fn set_pipeline(&mut self, pipeline: &B::PipelineState);

    /// Point a root table at `base_slot` of the bound shader-visible heap.
    fn set_root_table(&mut self, table: TableKind, base_slot: u32);

    /// Bind a root constant-buffer view. `offset` is in bytes and must be
    /// aligned to the adapter's CB placement alignment.
    fn set_root_cbv(&mut self, index: u32, memory: &B::Memory, offset: u64);

    /// Launch a grid of thread groups with the bound pipeline.
    fn dispatch(&mut self, x: u32, y: u32, z: u32);

    /// Write the GPU timestamp into query `index`.
    fn end_timestamp(&mut self, heap: &B::QueryHeap, index: u32);

    /// Resolve queries `[start, start + count)` into `dst` as little-endian
    /// u64 ticks.
    fn resolve_timestamps(
        &mut self,
        heap: &B::QueryHeap,
        start: u32,
        count: u32,
        dst: &B::Memory,
        dst_offset: u64,
    );
}
