//! Device-side objects: memory, descriptors, fences, pipelines.

use crate::shader::ShaderBlob;
use crate::{Backend, CommandAllocatorState};

use rocl_hal as hal;
use rocl_hal::{BufferDesc, Descriptor, DescriptorKind, DeviceError, PipelineError, SamplerDesc};

use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Host-memory "GPU" allocation.
#[derive(Clone)]
pub struct Memory(pub(crate) Arc<MemoryInner>);

pub(crate) struct MemoryInner {
    data: UnsafeCell<Box<[u8]>>,
    pub kind: rocl_hal::HeapKind,
    pub size: u64,
    pub resident: AtomicBool,
    usage: Arc<AtomicU64>,
}

// The engine serializes GPU-side access through fences; mapping rules are
// the caller's responsibility, exactly as with a real driver.
unsafe impl Send for MemoryInner {}
unsafe impl Sync for MemoryInner {}

impl MemoryInner {
    /// Raw access to the backing store.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn bytes(&self) -> &mut [u8] {
        &mut *self.data.get()
    }
}

impl Drop for MemoryInner {
    fn drop(&mut self) {
        if self.resident.load(Ordering::Relaxed) {
            self.usage.fetch_sub(self.size, Ordering::Relaxed);
        }
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Memory")
            .field("kind", &self.0.kind)
            .field("size", &self.0.size)
            .field("resident", &self.0.resident.load(Ordering::Relaxed))
            .finish()
    }
}

/// What a descriptor slot holds.
#[derive(Clone, Debug)]
pub(crate) enum DescriptorData {
    Buffer {
        memory: Memory,
        offset: u64,
        size: u64,
        writable: bool,
    },
    Sampler(SamplerDesc),
}

#[derive(Debug)]
pub(crate) struct DescriptorHeapInner {
    pub kind: DescriptorKind,
    pub shader_visible: bool,
    pub slots: Mutex<Vec<Option<DescriptorData>>>,
}

/// Slot-table descriptor heap.
#[derive(Clone, Debug)]
pub struct DescriptorHeap(pub(crate) Arc<DescriptorHeapInner>);

impl DescriptorHeap {
    pub(crate) fn read(&self, slot: u32) -> Option<DescriptorData> {
        self.0.slots.lock()[slot as usize].clone()
    }
}

/// Compute pipeline: a parsed shader blob.
#[derive(Clone, Debug)]
pub struct PipelineState(pub(crate) Arc<ShaderBlob>);

impl PipelineState {
    pub fn blob(&self) -> &ShaderBlob {
        &self.0
    }
}

/// Timestamp query storage.
#[derive(Clone, Debug)]
pub struct QueryHeap(pub(crate) Arc<Mutex<Vec<u64>>>);

#[derive(Debug, Default)]
pub(crate) struct FenceInner {
    pub value: Mutex<u64>,
    pub cv: Condvar,
}

/// CPU-signaled fence; queues signal it synchronously at execution.
#[derive(Clone, Debug)]
pub struct Fence(pub(crate) Arc<FenceInner>);

impl hal::Fence for Fence {
    fn completed(&self) -> u64 {
        *self.0.value.lock()
    }

    fn wait(&self, value: u64) -> bool {
        let mut current = self.0.value.lock();
        while *current < value {
            self.0.cv.wait(&mut current);
        }
        true
    }
}

/// Backing for one in-flight command list. The null backend has nothing to
/// recycle, but tracks reset state to catch misuse.
#[derive(Debug)]
pub struct CommandAllocator {
    pub(crate) state: Arc<Mutex<CommandAllocatorState>>,
}

/// The logical device.
#[derive(Debug)]
pub struct Device {
    usage: Arc<AtomicU64>,
}

impl Device {
    pub(crate) fn new(usage: Arc<AtomicU64>) -> Self {
        Device { usage }
    }
}

impl hal::Device<Backend> for Device {
    fn create_fence(&self, initial: u64) -> Result<Fence, DeviceError> {
        let inner = FenceInner::default();
        *inner.value.lock() = initial;
        Ok(Fence(Arc::new(inner)))
    }

    fn create_command_allocator(&self) -> Result<CommandAllocator, DeviceError> {
        Ok(CommandAllocator {
            state: Arc::new(Mutex::new(CommandAllocatorState::Free)),
        })
    }

    fn create_command_list(
        &self,
        allocator: &CommandAllocator,
    ) -> Result<crate::CommandList, DeviceError> {
        Ok(crate::CommandList::new(allocator))
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Memory, DeviceError> {
        let data = vec![0u8; desc.size as usize].into_boxed_slice();
        self.usage.fetch_add(desc.size, Ordering::Relaxed);
        Ok(Memory(Arc::new(MemoryInner {
            data: UnsafeCell::new(data),
            kind: desc.kind,
            size: desc.size,
            resident: AtomicBool::new(true),
            usage: Arc::clone(&self.usage),
        })))
    }

    fn create_descriptor_heap(
        &self,
        kind: DescriptorKind,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<DescriptorHeap, DeviceError> {
        Ok(DescriptorHeap(Arc::new(DescriptorHeapInner {
            kind,
            shader_visible,
            slots: Mutex::new(vec![None; capacity as usize]),
        })))
    }

    fn write_descriptor(&self, heap: &DescriptorHeap, slot: u32, desc: Descriptor<Backend>) {
        let data = match desc {
            Descriptor::UavBuffer {
                memory,
                offset,
                size,
            } => DescriptorData::Buffer {
                memory: memory.clone(),
                offset,
                size,
                writable: true,
            },
            Descriptor::SrvBuffer {
                memory,
                offset,
                size,
            } => DescriptorData::Buffer {
                memory: memory.clone(),
                offset,
                size,
                writable: false,
            },
            Descriptor::Sampler(sampler) => DescriptorData::Sampler(sampler),
        };
        heap.0.slots.lock()[slot as usize] = Some(data);
    }

    fn copy_descriptors(
        &self,
        dst: &DescriptorHeap,
        dst_slot: u32,
        src: &DescriptorHeap,
        src_slot: u32,
        count: u32,
    ) {
        for i in 0..count {
            let data = src.read(src_slot + i);
            dst.0.slots.lock()[(dst_slot + i) as usize] = data;
        }
    }

    fn create_compute_pipeline(&self, bytecode: &[u8]) -> Result<PipelineState, PipelineError> {
        ShaderBlob::from_bytes(bytecode)
            .map(|blob| PipelineState(Arc::new(blob)))
            .map_err(PipelineError::InvalidBytecode)
    }

    fn create_query_heap(&self, count: u32) -> Result<QueryHeap, DeviceError> {
        Ok(QueryHeap(Arc::new(Mutex::new(vec![0; count as usize]))))
    }

    fn map(&self, memory: &Memory) -> Result<*mut u8, DeviceError> {
        if memory.0.kind == rocl_hal::HeapKind::Default {
            return Err(DeviceError::OutOfHostMemory);
        }
        Ok(unsafe { memory.0.bytes().as_mut_ptr() })
    }

    fn unmap(&self, _memory: &Memory) {}

    fn make_resident(&self, memory: &[&Memory]) -> Result<(), DeviceError> {
        for m in memory {
            if !m.0.resident.swap(true, Ordering::Relaxed) {
                self.usage.fetch_add(m.0.size, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    fn evict(&self, memory: &[&Memory]) {
        for m in memory {
            if m.0.resident.swap(false, Ordering::Relaxed) {
                self.usage.fetch_sub(m.0.size, Ordering::Relaxed);
            }
        }
    }
}
