//! Resource, residency, and command submission engine.
//!
//! This crate is the machinery between the task graph and the native GPU
//! API: fence-recycled object pools, a buddy suballocator for the staging
//! heaps, CPU and shader-visible descriptor management, per-subresource
//! state tracking with barrier coalescing, LRU residency under an OS
//! budget, and the command-list manager that stitches it all into
//! submissions. Everything is generic over [`rocl_hal::Backend`].

pub mod buddy;
pub mod buffer;
pub mod command;
pub mod context;
pub mod deferred;
pub mod descriptors;
pub mod pool;
pub mod residency;
pub mod ring;
pub mod state;

pub use crate::buddy::{BuddyAllocator, ConditionalAllocator, Placement, Suballocation};
pub use crate::buffer::GpuBuffer;
pub use crate::command::CommandListManager;
pub use crate::context::{DeviceResources, DeviceShared, EngineOptions, ImmediateContext};
pub use crate::deferred::{DeferredDeletionQueue, RetiredPayload};
pub use crate::descriptors::{CpuSlot, DescriptorHeapManager};
pub use crate::pool::{BoundedFencePool, FencePool, MultiLevelPool};
pub use crate::residency::{ResidencyHandle, ResidencyManager, ResidencyOptions, ResidencySet};
pub use crate::ring::FencedRingBuffer;
pub use crate::state::{
    BarrierRecord, ResourceStateManager, StateId, TransitionFlags, ALL_SUBRESOURCES,
};
