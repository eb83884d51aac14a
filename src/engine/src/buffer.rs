//! Engine-level buffer handles.

use crate::buddy::Suballocation;
use crate::residency::ResidencyHandle;
use crate::state::StateId;

use rocl_hal::{Backend, HeapKind};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub(crate) struct BufferInner<B: Backend> {
    pub memory: Arc<B::Memory>,
    pub offset: u64,
    pub size: u64,
    pub kind: HeapKind,
    pub state: Option<StateId>,
    pub residency: Option<ResidencyHandle>,
    /// Set when the buffer is carved out of a pooled heap.
    pub sub: Option<Suballocation>,
    /// Whether `memory` is exclusively ours (vs. a shared pooled heap).
    pub owns_memory: bool,
    pub last_used_fence: AtomicU64,
}

/// A cheap, clonable handle to one GPU buffer allocation, committed or
/// suballocated.
///
/// Destruction is explicit: handles must be given back through
/// [`crate::DeviceResources::destroy_buffer`] so the memory survives until
/// the GPU has passed the last command list that referenced it.
#[derive(Debug)]
pub struct GpuBuffer<B: Backend> {
    pub(crate) inner: Arc<BufferInner<B>>,
}

impl<B: Backend> Clone for GpuBuffer<B> {
    fn clone(&self) -> Self {
        GpuBuffer {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> GpuBuffer<B> {
    pub fn memory(&self) -> &B::Memory {
        &self.inner.memory
    }

    pub(crate) fn shared_memory(&self) -> Arc<B::Memory> {
        Arc::clone(&self.inner.memory)
    }

    /// Offset of this buffer inside its backing allocation.
    pub fn offset(&self) -> u64 {
        self.inner.offset
    }

    pub fn size(&self) -> u64 {
        self.inner.size
    }

    pub fn kind(&self) -> HeapKind {
        self.inner.kind
    }

    pub fn state_id(&self) -> Option<StateId> {
        self.inner.state
    }

    pub fn residency(&self) -> Option<ResidencyHandle> {
        self.inner.residency
    }

    /// Id of the last command list that recorded a reference to this
    /// buffer.
    pub fn last_used_fence(&self) -> u64 {
        self.inner.last_used_fence.load(Ordering::Acquire)
    }

    pub(crate) fn mark_used(&self, fence: u64) {
        self.inner.last_used_fence.fetch_max(fence, Ordering::AcqRel);
    }
}
