//! GPU memory objects and state tracking vocabulary.

use bitflags::bitflags;

/// Which heap a buffer allocation lives in.
///
/// Upload and readback heaps are CPU-mappable; the layers above carve them
/// up with a suballocator. Default-heap memory is GPU-only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// GPU-local, not CPU-accessible.
    Default,
    /// CPU write-combined, GPU read.
    Upload,
    /// GPU write, CPU read.
    Readback,
}

impl HeapKind {
    /// The state buffers in this heap permanently occupy, if fixed.
    ///
    /// Upload-heap memory must stay in a generic read state and readback
    /// memory in copy-dest; only default-heap memory transitions.
    pub fn fixed_state(self) -> Option<ResourceState> {
        match self {
            HeapKind::Default => None,
            HeapKind::Upload => Some(ResourceState::GENERIC_READ),
            HeapKind::Readback => Some(ResourceState::COPY_DEST),
        }
    }
}

bitflags! {
    /// Usage states a resource (or one subresource of it) can be in.
    ///
    /// Read states may be combined; write states are exclusive. This mirrors
    /// the native API's barrier vocabulary closely enough that the state
    /// manager can hand its records straight to `resource_barrier`.
    pub struct ResourceState: u32 {
        /// No pending access.
        const COMMON = 0;
        /// Bound for unordered (read/write) access.
        const UNORDERED_ACCESS = 0x1;
        /// Read through a shader resource view from a compute shader.
        const NON_PIXEL_SHADER_RESOURCE = 0x2;
        /// Source of a copy.
        const COPY_SOURCE = 0x4;
        /// Destination of a copy.
        const COPY_DEST = 0x8;
        /// Bound as a constant buffer.
        const CONSTANT_BUFFER = 0x10;
        /// Union of the read-only states; what upload-heap memory stays in.
        const GENERIC_READ = Self::NON_PIXEL_SHADER_RESOURCE.bits
            | Self::COPY_SOURCE.bits
            | Self::CONSTANT_BUFFER.bits;
    }
}

impl ResourceState {
    /// Whether the state grants GPU writes. Write states never accumulate.
    pub fn is_write(self) -> bool {
        self.intersects(ResourceState::UNORDERED_ACCESS | ResourceState::COPY_DEST)
    }
}

/// Creation parameters for a buffer allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferDesc {
    /// Size in bytes.
    pub size: u64,
    /// Which heap to place it in.
    pub kind: HeapKind,
    /// Whether simultaneous-access semantics are requested: the resource
    /// skips state transitions except for write-after-write hazards.
    pub simultaneous_access: bool,
}

impl BufferDesc {
    /// A plain default-heap buffer.
    pub fn gpu(size: u64) -> Self {
        BufferDesc {
            size,
            kind: HeapKind::Default,
            simultaneous_access: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_read_is_read_only() {
        assert!(!ResourceState::GENERIC_READ.is_write());
        assert!(ResourceState::COPY_DEST.is_write());
        assert!((ResourceState::UNORDERED_ACCESS | ResourceState::COPY_SOURCE).is_write());
    }
}
