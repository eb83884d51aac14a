//! Contract with the native GPU API.
//!
//! The runtime sits on top of an explicit, D3D12-class compute API: command
//! queues with monotonic fences, command lists recorded from recyclable
//! allocators, descriptor heaps addressed by slot, resource state barriers,
//! and compute pipelines created from signed shader bytecode. The concrete
//! API is an external collaborator; this crate only defines the shape of it,
//! the way a backend would implement it. Everything above (`rocl-engine`,
//! `rocl`) is generic over [`Backend`].

pub mod adapter;
pub mod command;
pub mod device;
pub mod memory;
pub mod pso;
pub mod queue;

pub use crate::adapter::{Adapter, AdapterInfo, MemoryBudget};
pub use crate::command::{CommandList, MemoryBarrier, TableKind};
pub use crate::device::{Device, DeviceError, PipelineError};
pub use crate::memory::{BufferDesc, HeapKind, ResourceState};
pub use crate::pso::{AddressMode, Descriptor, DescriptorKind, FilterMode, SamplerDesc};
pub use crate::queue::{Fence, Queue};

use std::any::Any;
use std::fmt::Debug;

/// The family of types making up one native API implementation.
///
/// Mirrors the associated-type pattern used for graphics HALs: a zero-sized
/// backend type ties together the concrete device, queue, and resource types
/// so the layers above can be written once.
pub trait Backend: 'static + Sized + Debug {
    /// Entry point used to discover adapters.
    type Instance: Instance<Self>;
    /// One physical GPU (or software rasterizer).
    type Adapter: Adapter<Self>;
    /// Logical device for resource creation and residency control.
    type Device: Device<Self>;
    /// Hardware execution queue.
    type Queue: Queue<Self>;
    /// Monotonic 64-bit GPU timeline counter.
    type Fence: Fence + Debug + Any + Send + Sync;
    /// Recorded buffer of GPU commands.
    type CommandList: CommandList<Self>;
    /// Backing storage for an in-flight command list, recyclable once the
    /// GPU has passed the fence value it was submitted with.
    type CommandAllocator: Debug + Any + Send + Sync;
    /// A GPU buffer allocation, either committed or a heap that gets
    /// suballocated by the layers above.
    type Memory: Debug + Any + Send + Sync;
    /// A slot-addressed descriptor heap, CPU-only or shader-visible.
    type DescriptorHeap: Debug + Any + Send + Sync;
    /// Compute pipeline created from signed native bytecode.
    type PipelineState: Debug + Any + Send + Sync;
    /// Pool of timestamp queries.
    type QueryHeap: Debug + Any + Send + Sync;
}

/// Discovers the adapters present on the system.
pub trait Instance<B: Backend>: Any + Send + Sync {
    /// Enumerate all available adapters, hardware first.
    fn enumerate_adapters(&self) -> Vec<B::Adapter>;
}

/// An opened adapter: the logical device plus its compute queue.
#[derive(Debug)]
pub struct Gpu<B: Backend> {
    /// Logical device.
    pub device: B::Device,
    /// The device's compute queue.
    pub queue: B::Queue,
}

/// Hard limits reported by an adapter.
///
/// The launch pipeline shapes NDRanges around these: thread-group dimension
/// caps, the thread-per-group product cap, and the bounded per-dimension
/// dispatch group count that forces large launches to be tiled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    /// Maximum thread-group size per dimension.
    pub max_group_dims: [u32; 3],
    /// Maximum product of thread-group dimensions.
    pub max_threads_per_group: u32,
    /// Maximum number of thread groups per dispatch dimension.
    pub max_dispatch_groups_per_dim: u32,
    /// Placement alignment for constant-buffer views, in bytes.
    pub cb_alignment: u64,
    /// Groupshared memory available to one thread group, in bytes.
    pub local_memory_size: u32,
    /// Alignment guaranteed by buffer suballocation, in bytes.
    pub buffer_alignment: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_group_dims: [1024, 1024, 64],
            max_threads_per_group: 1024,
            max_dispatch_groups_per_dim: 65535,
            cb_alignment: 256,
            local_memory_size: 32 * 1024,
            buffer_alignment: 256,
        }
    }
}

/// Optional capabilities of an adapter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Features {
    /// Native 16-bit integer ops; when absent the compiler lowers them.
    pub int16_native: bool,
    /// Typed UAV loads of additional formats (read-write images).
    pub typed_uav_load: bool,
    /// Whether the adapter can sample images at all. Compute-only adapters
    /// report false and the runtime exposes a buffers-only device.
    pub images: bool,
    /// Unified memory architecture.
    pub uma: bool,
    /// Highest supported shader model, encoded as `major * 10 + minor`.
    pub shader_model: u32,
}
