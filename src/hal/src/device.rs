//! The logical device.

use crate::memory::BufferDesc;
use crate::pso::{Descriptor, DescriptorKind};
use crate::Backend;

use std::any::Any;
use std::fmt::Debug;
use thiserror::Error;

/// Errors surfaced by the native device.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// Host allocation failed.
    #[error("out of host memory")]
    OutOfHostMemory,
    /// Device allocation failed; the caller may trim pools and retry.
    #[error("out of device memory")]
    OutOfDeviceMemory,
    /// The device was removed or the fence will never advance.
    #[error("device lost")]
    DeviceLost,
}

/// Errors from pipeline creation.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// The bytecode was rejected by the driver.
    #[error("invalid shader bytecode: {0}")]
    InvalidBytecode(String),
    /// Underlying device failure.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Resource creation and residency control.
///
/// Creation methods are free-threaded. Map/unmap of upload and readback
/// memory is persistent-map friendly: a mapping stays valid until `unmap`
/// and the caller is responsible for not racing the GPU.
pub trait Device<B: Backend>: Debug + Any + Send + Sync {
    /// Create a fence starting at `initial`.
    fn create_fence(&self, initial: u64) -> Result<B::Fence, DeviceError>;

    /// Create a command allocator.
    fn create_command_allocator(&self) -> Result<B::CommandAllocator, DeviceError>;

    /// Create a command list in the recording state, backed by `allocator`.
    fn create_command_list(
        &self,
        allocator: &B::CommandAllocator,
    ) -> Result<B::CommandList, DeviceError>;

    /// Allocate a buffer.
    fn create_buffer(&self, desc: &BufferDesc) -> Result<B::Memory, DeviceError>;

    /// Create a descriptor heap with `capacity` slots.
    fn create_descriptor_heap(
        &self,
        kind: DescriptorKind,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<B::DescriptorHeap, DeviceError>;

    /// Write one descriptor into a CPU-visible slot.
    fn write_descriptor(&self, heap: &B::DescriptorHeap, slot: u32, desc: Descriptor<B>);

    /// Copy `count` descriptors between heaps, typically staging CPU slots
    /// into the shader-visible heap.
    fn copy_descriptors(
        &self,
        dst: &B::DescriptorHeap,
        dst_slot: u32,
        src: &B::DescriptorHeap,
        src_slot: u32,
        count: u32,
    );

    /// Create a compute pipeline from signed native bytecode.
    fn create_compute_pipeline(&self, bytecode: &[u8]) -> Result<B::PipelineState, PipelineError>;

    /// Create a heap of `count` timestamp queries.
    fn create_query_heap(&self, count: u32) -> Result<B::QueryHeap, DeviceError>;

    /// Map the whole allocation. Only valid for upload/readback memory.
    fn map(&self, memory: &B::Memory) -> Result<*mut u8, DeviceError>;

    /// Release a mapping obtained from [`Device::map`].
    fn unmap(&self, memory: &B::Memory);

    /// Page the given allocations into GPU-addressable memory. Blocks until
    /// the paging operation is queued, not until it completes.
    fn make_resident(&self, memory: &[&B::Memory]) -> Result<(), DeviceError>;

    /// Demote the given allocations to system memory.
    fn evict(&self, memory: &[&B::Memory]);
}
