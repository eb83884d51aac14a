//! The immediate context: single-threaded composition of the engine.

use crate::buddy::{ConditionalAllocator, Placement, Suballocation};
use crate::buffer::{BufferInner, GpuBuffer};
use crate::command::CommandListManager;
use crate::deferred::{DeferredDeletionQueue, RetiredPayload, TrimSinks};
use crate::descriptors::{CpuSlot, DescriptorHeapManager};
use crate::pool::MultiLevelPool;
use crate::residency::{ResidencyManager, ResidencyOptions, ResidencySet};
use crate::ring::FencedRingBuffer;
use crate::state::{ResourceStateManager, StateId, TransitionFlags};

use rocl_hal as hal;
use rocl_hal::{
    Backend, BufferDesc, CommandList as _, Descriptor, DescriptorKind, DeviceError, Fence as _,
    HeapKind, Limits, MemoryBarrier, ResourceState, TableKind,
};

use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// Everything threads share about one opened native device.
#[derive(Debug)]
pub struct DeviceShared<B: Backend> {
    pub device: B::Device,
    pub queue: B::Queue,
    pub adapter: Arc<B::Adapter>,
    pub limits: Limits,
}

/// Engine tunables. Defaults match the sizes the runtime ships with.
#[derive(Clone, Copy, Debug)]
pub struct EngineOptions {
    /// Span of each pooled upload/readback heap.
    pub staging_pool_span: u64,
    /// Requests above this go to dedicated allocations.
    pub suballoc_threshold: u64,
    /// Smallest buddy block.
    pub min_suballoc_block: u64,
    /// Slots per CPU descriptor heap.
    pub descriptor_heap_size: u32,
    /// Slots per shader-visible heap.
    pub online_heap_size: u32,
    /// Bucket granularity of the dynamic constant-buffer pool.
    pub dynamic_cb_bucket: u64,
    /// Fence-age threshold for trimming pools.
    pub pool_trim_threshold: u64,
    pub residency: ResidencyOptions,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            staging_pool_span: 256 * 1024 * 1024,
            suballoc_threshold: 32 * 1024 * 1024,
            min_suballoc_block: 64 * 1024,
            descriptor_heap_size: 1024,
            online_heap_size: 4096,
            dynamic_cb_bucket: 64 * 1024,
            pool_trim_threshold: 100,
            residency: ResidencyOptions::default(),
        }
    }
}

// One pooled staging heap plus its carve-up state.
struct HeapPool<B: Backend> {
    alloc: ConditionalAllocator,
    heap: Option<Arc<B::Memory>>,
    heap_residency: Option<crate::residency::ResidencyHandle>,
    span: u64,
}

impl<B: Backend> HeapPool<B> {
    fn new(options: &EngineOptions) -> Self {
        HeapPool {
            alloc: ConditionalAllocator::new(
                options.staging_pool_span,
                options.min_suballoc_block,
                options.suballoc_threshold,
            ),
            heap: None,
            heap_residency: None,
            span: options.staging_pool_span,
        }
    }
}

/// The free-threaded half of a device: allocators, descriptor pools, state
/// and residency tracking, deferred deletion. Everything here is reachable
/// from API threads while the recording worker owns the
/// [`ImmediateContext`].
pub struct DeviceResources<B: Backend> {
    pub shared: Arc<DeviceShared<B>>,
    options: EngineOptions,
    state: Mutex<ResourceStateManager>,
    state_memories: Mutex<Vec<Option<Arc<B::Memory>>>>,
    pub(crate) residency: Mutex<ResidencyManager<B>>,
    upload: Mutex<HeapPool<B>>,
    readback: Mutex<HeapPool<B>>,
    view_descriptors: Mutex<DescriptorHeapManager<B>>,
    sampler_descriptors: Mutex<DescriptorHeapManager<B>>,
    deferred: Mutex<DeferredDeletionQueue<B>>,
    dynamic_cbs: Mutex<MultiLevelPool<Arc<B::Memory>>>,
}

impl<B: Backend> DeviceResources<B> {
    pub fn new(shared: Arc<DeviceShared<B>>, options: EngineOptions) -> Self {
        DeviceResources {
            options,
            state: Mutex::new(ResourceStateManager::new()),
            state_memories: Mutex::new(Vec::new()),
            residency: Mutex::new(ResidencyManager::new(options.residency)),
            upload: Mutex::new(HeapPool::new(&options)),
            readback: Mutex::new(HeapPool::new(&options)),
            view_descriptors: Mutex::new(DescriptorHeapManager::new(
                DescriptorKind::View,
                options.descriptor_heap_size,
            )),
            sampler_descriptors: Mutex::new(DescriptorHeapManager::new(
                DescriptorKind::Sampler,
                options.descriptor_heap_size,
            )),
            deferred: Mutex::new(DeferredDeletionQueue::new()),
            dynamic_cbs: Mutex::new(MultiLevelPool::new(
                options.dynamic_cb_bucket,
                options.pool_trim_threshold,
            )),
            shared,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Create a GPU-only buffer with state and residency tracking.
    pub fn create_buffer(
        &self,
        size: u64,
        simultaneous_access: bool,
    ) -> Result<GpuBuffer<B>, DeviceError> {
        let desc = BufferDesc {
            size,
            kind: HeapKind::Default,
            simultaneous_access,
        };
        let memory = Arc::new(hal::Device::create_buffer(&self.shared.device, &desc)?);
        let state = {
            let mut table = self.state.lock();
            let id = table.register(1, simultaneous_access);
            let mut memories = self.state_memories.lock();
            let index = id.index() as usize;
            if memories.len() <= index {
                memories.resize(index + 1, None);
            }
            memories[index] = Some(Arc::clone(&memory));
            id
        };
        let residency = self.residency.lock().track(Arc::clone(&memory), size);
        Ok(GpuBuffer {
            inner: Arc::new(BufferInner {
                memory,
                offset: 0,
                size,
                kind: HeapKind::Default,
                state: Some(state),
                residency: Some(residency),
                sub: None,
                owns_memory: true,
                last_used_fence: AtomicU64::new(0),
            }),
        })
    }

    /// Carve a staging block out of the upload or readback pool, or fall
    /// back to a dedicated allocation.
    pub fn allocate_staging(
        &self,
        kind: HeapKind,
        size: u64,
        cannot_be_offset: bool,
    ) -> Result<GpuBuffer<B>, DeviceError> {
        assert!(kind != HeapKind::Default);
        let pool = match kind {
            HeapKind::Upload => &self.upload,
            HeapKind::Readback => &self.readback,
            HeapKind::Default => unreachable!(),
        };
        let mut pool = pool.lock();
        match pool.alloc.allocate(size, cannot_be_offset) {
            Placement::Pooled(block) => {
                if pool.heap.is_none() {
                    let desc = BufferDesc {
                        size: pool.span,
                        kind,
                        simultaneous_access: false,
                    };
                    let memory =
                        Arc::new(hal::Device::create_buffer(&self.shared.device, &desc)?);
                    pool.heap_residency = Some(
                        self.residency
                            .lock()
                            .track(Arc::clone(&memory), pool.span),
                    );
                    pool.heap = Some(memory);
                }
                Ok(GpuBuffer {
                    inner: Arc::new(BufferInner {
                        memory: Arc::clone(pool.heap.as_ref().unwrap()),
                        offset: block.offset,
                        size,
                        kind,
                        state: None,
                        residency: pool.heap_residency,
                        sub: Some(block),
                        owns_memory: false,
                        last_used_fence: AtomicU64::new(0),
                    }),
                })
            }
            Placement::Direct(size) => {
                let desc = BufferDesc {
                    size,
                    kind,
                    simultaneous_access: false,
                };
                let memory = Arc::new(hal::Device::create_buffer(&self.shared.device, &desc)?);
                let residency = self.residency.lock().track(Arc::clone(&memory), size);
                Ok(GpuBuffer {
                    inner: Arc::new(BufferInner {
                        memory,
                        offset: 0,
                        size,
                        kind,
                        state: None,
                        residency: Some(residency),
                        sub: None,
                        owns_memory: true,
                        last_used_fence: AtomicU64::new(0),
                    }),
                })
            }
        }
    }

    /// Grab a recycled dynamic constant buffer of at least `size` bytes.
    pub fn acquire_dynamic_cb(
        &self,
        size: u64,
        completed_fence: u64,
    ) -> Result<GpuBuffer<B>, DeviceError> {
        let device = &self.shared.device;
        let memory = self.dynamic_cbs.lock().retrieve(size, completed_fence, |rounded| {
            let desc = BufferDesc {
                size: rounded,
                kind: HeapKind::Upload,
                simultaneous_access: false,
            };
            hal::Device::create_buffer(device, &desc).map(Arc::new)
        })?;
        Ok(GpuBuffer {
            inner: Arc::new(BufferInner {
                memory,
                offset: 0,
                size,
                kind: HeapKind::Upload,
                state: None,
                residency: None,
                sub: None,
                owns_memory: true,
                last_used_fence: AtomicU64::new(0),
            }),
        })
    }

    /// Return a dynamic constant buffer for recycling once `fence` passes.
    pub fn release_dynamic_cb(&self, buffer: GpuBuffer<B>, fence: u64) {
        let mut pool = self.dynamic_cbs.lock();
        let rounded = pool.rounded_size(buffer.size());
        pool.return_to_pool(rounded, buffer.shared_memory(), fence);
    }

    /// Queue a buffer for destruction once the GPU passes the last command
    /// list that used it.
    pub fn destroy_buffer(&self, buffer: GpuBuffer<B>) {
        let inner = &buffer.inner;
        let payload = if inner.owns_memory {
            RetiredPayload::Owned(Arc::clone(&inner.memory))
        } else {
            match inner.sub {
                Some(block) => RetiredPayload::Suballocated {
                    heap: inner.kind,
                    block,
                },
                None => RetiredPayload::Owned(Arc::clone(&inner.memory)),
            }
        };
        // Pooled blocks share the heap's residency handle; only dedicated
        // allocations untrack on destruction.
        let residency = if inner.owns_memory { inner.residency } else { None };
        self.deferred.lock().retire(
            buffer.last_used_fence(),
            payload,
            residency,
            inner.state,
        );
    }

    /// Allocate a CPU descriptor slot of the given kind.
    pub fn allocate_descriptor(&self, kind: DescriptorKind) -> Result<CpuSlot, DeviceError> {
        let mgr = match kind {
            DescriptorKind::View => &self.view_descriptors,
            DescriptorKind::Sampler => &self.sampler_descriptors,
        };
        mgr.lock().allocate_slot(&self.shared.device)
    }

    pub fn free_descriptor(&self, kind: DescriptorKind, slot: CpuSlot) {
        let mgr = match kind {
            DescriptorKind::View => &self.view_descriptors,
            DescriptorKind::Sampler => &self.sampler_descriptors,
        };
        mgr.lock().free_slot(slot);
    }

    /// Write a descriptor into a previously allocated CPU slot.
    pub fn write_descriptor(&self, kind: DescriptorKind, slot: CpuSlot, desc: Descriptor<B>) {
        let mgr = match kind {
            DescriptorKind::View => &self.view_descriptors,
            DescriptorKind::Sampler => &self.sampler_descriptors,
        };
        mgr.lock().write(&self.shared.device, slot, desc);
    }

    /// Request a whole-resource state transition before the next submission.
    pub fn transition(&self, buffer: &GpuBuffer<B>, state: ResourceState, flags: TransitionFlags) {
        if let Some(id) = buffer.state_id() {
            self.state.lock().transition(id, state, flags);
        }
    }

    /// Request a transition of a single subresource of a tracked resource.
    pub fn transition_subresource(
        &self,
        id: StateId,
        subresource: u32,
        state: ResourceState,
        flags: TransitionFlags,
    ) {
        self.state
            .lock()
            .transition_subresource(id, subresource, state, flags);
    }

    /// Register extra subresource tracking for an image-shaped resource.
    pub fn register_subresource_states(
        &self,
        buffer: &GpuBuffer<B>,
        subresources: u32,
    ) -> StateId {
        let mut table = self.state.lock();
        let id = table.register(subresources, false);
        let mut memories = self.state_memories.lock();
        let index = id.index() as usize;
        if memories.len() <= index {
            memories.resize(index + 1, None);
        }
        memories[index] = Some(buffer.shared_memory());
        id
    }

    /// Current tracked state of a subresource, mainly for validation and
    /// tests.
    pub fn current_state(&self, id: StateId, subresource: u32) -> ResourceState {
        self.state.lock().current_state(id, subresource)
    }

    fn trim_deferred(&self, completed_fence: u64) {
        let mut deferred = self.deferred.lock();
        if deferred.is_empty() {
            return;
        }
        let mut residency = self.residency.lock();
        let mut state = self.state.lock();
        let mut memories = self.state_memories.lock();
        let mut upload = self.upload.lock();
        let mut readback = self.readback.lock();
        let state = &mut *state;
        let memories = &mut *memories;
        let upload = &mut *upload;
        let readback = &mut *readback;
        let mut release_state = |id: StateId| {
            state.unregister(id);
            if let Some(slot) = memories.get_mut(id.index() as usize) {
                *slot = None;
            }
        };
        let mut release_block = |kind: HeapKind, block: Suballocation| match kind {
            HeapKind::Upload => upload.alloc.deallocate(block),
            HeapKind::Readback => readback.alloc.deallocate(block),
            HeapKind::Default => unreachable!("default-heap memory is never suballocated"),
        };
        deferred.trim(
            completed_fence,
            &mut TrimSinks {
                residency: &mut residency,
                release_state: &mut release_state,
                release_block: &mut release_block,
            },
        );
    }

    fn trim_pools(&self, completed_fence: u64) {
        self.dynamic_cbs.lock().trim(completed_fence);
    }

    /// Drain every deferred object regardless of fences. Only valid once
    /// the GPU is idle, at device teardown.
    pub fn drain_deferred(&self) {
        self.trim_deferred(u64::MAX);
    }
}

struct OnlineHeap<B: Backend> {
    heap: Arc<B::DescriptorHeap>,
    ring: FencedRingBuffer,
    capacity: u32,
}

impl<B: Backend> OnlineHeap<B> {
    fn new(device: &B::Device, kind: DescriptorKind, capacity: u32) -> Result<Self, DeviceError> {
        Ok(OnlineHeap {
            heap: Arc::new(hal::Device::create_descriptor_heap(
                device, kind, capacity, true,
            )?),
            ring: FencedRingBuffer::new(capacity),
            capacity,
        })
    }
}

/// The single-threaded recording surface of one native device.
///
/// One recording worker drives this at a time: it records task work into
/// the open command list, stages descriptor tables, and submits. Everything
/// that must be reachable from API threads lives in [`DeviceResources`].
pub struct ImmediateContext<B: Backend> {
    pub resources: Arc<DeviceResources<B>>,
    lists: CommandListManager<B>,
    online_views: OnlineHeap<B>,
    online_samplers: OnlineHeap<B>,
}

impl<B: Backend> ImmediateContext<B> {
    pub fn new(resources: Arc<DeviceResources<B>>) -> Result<Self, DeviceError> {
        let device = &resources.shared.device;
        let lists = CommandListManager::new(device)?;
        let online_views =
            OnlineHeap::new(device, DescriptorKind::View, resources.options.online_heap_size)?;
        let online_samplers = OnlineHeap::new(
            device,
            DescriptorKind::Sampler,
            resources.options.online_heap_size,
        )?;
        let mut ctx = ImmediateContext {
            resources,
            lists,
            online_views,
            online_samplers,
        };
        ctx.rebind_heaps();
        Ok(ctx)
    }

    pub fn shared(&self) -> &Arc<DeviceShared<B>> {
        &self.resources.shared
    }

    /// Id the open command list will signal when it completes.
    pub fn current_list_id(&self) -> u64 {
        self.lists.id()
    }

    pub fn completed_fence(&self) -> u64 {
        self.lists.completed_fence()
    }

    fn rebind_heaps(&mut self) {
        self.lists.list_mut().set_descriptor_heaps(
            &self.online_views.heap,
            Some(&self.online_samplers.heap),
        );
    }

    /// Note that the open command list references `buffer`.
    pub fn note_use(&mut self, buffer: &GpuBuffer<B>) {
        buffer.mark_used(self.lists.id());
        if let Some(handle) = buffer.residency() {
            self.resources
                .residency
                .lock()
                .insert(&mut self.lists.residency_set, handle);
        }
    }

    /// Resolve pending state transitions into barriers on the open list.
    pub fn apply_transitions(&mut self) {
        let records: Vec<_> = {
            let mut state = self.resources.state.lock();
            state.apply_all(self.lists.id()).to_vec()
        };
        if records.is_empty() {
            return;
        }
        let memories = self.resources.state_memories.lock();
        let resolved: Vec<(Arc<B::Memory>, ResourceState, ResourceState)> = records
            .iter()
            .filter_map(|record| {
                memories
                    .get(record.resource.index() as usize)
                    .and_then(|m| m.clone())
                    .map(|memory| (memory, record.before, record.after))
            })
            .collect();
        drop(memories);
        if resolved.is_empty() {
            return;
        }
        let barriers: Vec<MemoryBarrier<B>> = resolved
            .iter()
            .map(|(memory, before, after)| MemoryBarrier {
                memory: &**memory,
                before: *before,
                after: *after,
            })
            .collect();
        self.lists.list_mut().resource_barrier(&barriers);
        self.lists.command_added();
    }

    /// Copy CPU bytes into a staging block.
    pub fn write_staging(&mut self, staging: &GpuBuffer<B>, data: &[u8]) -> Result<(), DeviceError> {
        debug_assert_eq!(staging.kind(), HeapKind::Upload);
        debug_assert!(data.len() as u64 <= staging.size());
        let device = &self.resources.shared.device;
        let ptr = hal::Device::map(device, staging.memory())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                ptr.add(staging.offset() as usize),
                data.len(),
            );
        }
        hal::Device::unmap(device, staging.memory());
        Ok(())
    }

    /// Read a staging block back into a CPU vector. Only valid once the
    /// GPU has passed the fence of the list that filled it.
    pub fn read_staging(&mut self, staging: &GpuBuffer<B>) -> Result<Vec<u8>, DeviceError> {
        debug_assert_eq!(staging.kind(), HeapKind::Readback);
        self.lists.readback_initiated();
        let device = &self.resources.shared.device;
        let ptr = hal::Device::map(device, staging.memory())?;
        let mut out = vec![0u8; staging.size() as usize];
        unsafe {
            std::ptr::copy_nonoverlapping(
                ptr.add(staging.offset() as usize),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        hal::Device::unmap(device, staging.memory());
        Ok(out)
    }

    /// Upload `data` into `dst` at `dst_offset` through the upload pool.
    pub fn upload_to_buffer(
        &mut self,
        dst: &GpuBuffer<B>,
        dst_offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        if data.is_empty() {
            return Ok(());
        }
        let staging =
            self.resources
                .allocate_staging(HeapKind::Upload, data.len() as u64, false)?;
        self.write_staging(&staging, data)?;
        self.copy_buffer(&staging, 0, dst, dst_offset, data.len() as u64)?;
        self.lists.upload_allocated(data.len() as u64);
        staging.mark_used(self.lists.id());
        self.resources.destroy_buffer(staging);
        Ok(())
    }

    /// Record a copy into a fresh readback block and hand it back; map it
    /// with [`ImmediateContext::read_staging`] after the fence passes.
    pub fn copy_to_readback(
        &mut self,
        src: &GpuBuffer<B>,
        src_offset: u64,
        size: u64,
    ) -> Result<GpuBuffer<B>, DeviceError> {
        let staging = self
            .resources
            .allocate_staging(HeapKind::Readback, size, false)?;
        self.copy_buffer(src, src_offset, &staging, 0, size)?;
        Ok(staging)
    }

    /// Record a buffer-to-buffer copy, with transitions.
    pub fn copy_buffer(
        &mut self,
        src: &GpuBuffer<B>,
        src_offset: u64,
        dst: &GpuBuffer<B>,
        dst_offset: u64,
        size: u64,
    ) -> Result<(), DeviceError> {
        self.resources
            .transition(src, ResourceState::COPY_SOURCE, TransitionFlags::empty());
        self.resources
            .transition(dst, ResourceState::COPY_DEST, TransitionFlags::empty());
        self.apply_transitions();
        self.note_use(src);
        self.note_use(dst);
        self.lists.list_mut().copy_buffer(
            src.memory(),
            src.offset() + src_offset,
            dst.memory(),
            dst.offset() + dst_offset,
            size,
        );
        self.lists.command_added();
        Ok(())
    }

    /// Record a pattern fill.
    pub fn fill_buffer(
        &mut self,
        dst: &GpuBuffer<B>,
        offset: u64,
        size: u64,
        pattern: &[u8],
    ) -> Result<(), DeviceError> {
        self.resources
            .transition(dst, ResourceState::COPY_DEST, TransitionFlags::empty());
        self.apply_transitions();
        self.note_use(dst);
        self.lists
            .list_mut()
            .fill_buffer(dst.memory(), dst.offset() + offset, size, pattern);
        self.lists.command_added();
        Ok(())
    }

    /// Copy a table of CPU descriptor slots into the online heap, rolling
    /// the heap over when the ring is exhausted. Returns the base slot.
    pub fn stage_table(
        &mut self,
        kind: DescriptorKind,
        slots: &[Option<CpuSlot>],
    ) -> Result<u32, DeviceError> {
        let count = slots.len() as u32;
        let list_id = self.lists.id();
        let completed = self.lists.completed_fence();
        let capacity = match kind {
            DescriptorKind::View => self.online_views.capacity,
            DescriptorKind::Sampler => self.online_samplers.capacity,
        };

        let base = {
            let online = match kind {
                DescriptorKind::View => &mut self.online_views,
                DescriptorKind::Sampler => &mut self.online_samplers,
            };
            online.ring.deallocate(completed);
            online.ring.allocate(count, list_id)
        };
        let base = match base {
            Some(base) => base,
            None => {
                // Ring exhausted: roll over to a brand-new heap and retire
                // the old one once the GPU is done with it.
                debug!("online {:?} heap rollover", kind);
                let fresh = OnlineHeap::new(&self.resources.shared.device, kind, capacity)?;
                let online = match kind {
                    DescriptorKind::View => &mut self.online_views,
                    DescriptorKind::Sampler => &mut self.online_samplers,
                };
                let old = std::mem::replace(online, fresh);
                self.resources.deferred.lock().retire(
                    list_id,
                    RetiredPayload::DescriptorHeap(old.heap),
                    None,
                    None,
                );
                self.rebind_heaps();
                let online = match kind {
                    DescriptorKind::View => &mut self.online_views,
                    DescriptorKind::Sampler => &mut self.online_samplers,
                };
                online
                    .ring
                    .allocate(count, list_id)
                    .expect("fresh ring must satisfy a table allocation")
            }
        };

        let (online, cpu_mgr) = match kind {
            DescriptorKind::View => (&self.online_views, &self.resources.view_descriptors),
            DescriptorKind::Sampler => (&self.online_samplers, &self.resources.sampler_descriptors),
        };
        let cpu_mgr = cpu_mgr.lock();
        for (i, slot) in slots.iter().enumerate() {
            if let Some(slot) = slot {
                hal::Device::copy_descriptors(
                    &self.resources.shared.device,
                    &online.heap,
                    base + i as u32,
                    cpu_mgr.heap(slot.heap),
                    slot.slot,
                    1,
                );
            }
        }
        Ok(base)
    }

    /// Bind the compute pipeline.
    pub fn set_pipeline(&mut self, pipeline: &B::PipelineState) {
        self.lists.list_mut().set_pipeline(pipeline);
        self.lists.command_added();
    }

    /// Point a root table at a staged base slot.
    pub fn set_root_table(&mut self, table: TableKind, base_slot: u32) {
        self.lists.list_mut().set_root_table(table, base_slot);
        self.lists.command_added();
    }

    /// Bind a root constant-buffer view at `extra_offset` into `buffer`.
    pub fn set_root_cbv(&mut self, index: u32, buffer: &GpuBuffer<B>, extra_offset: u64) {
        self.note_use(buffer);
        self.lists
            .list_mut()
            .set_root_cbv(index, buffer.memory(), buffer.offset() + extra_offset);
        self.lists.command_added();
    }

    /// Record a dispatch, applying any still-pending transitions first.
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.apply_transitions();
        self.lists.list_mut().dispatch(x, y, z);
        self.lists.dispatch_added();
    }

    /// Record a GPU timestamp into `heap[index]`.
    pub fn end_timestamp(&mut self, heap: &B::QueryHeap, index: u32) {
        self.lists.list_mut().end_timestamp(heap, index);
        self.lists.command_added();
    }

    /// Resolve `count` timestamps into a readback block.
    pub fn resolve_timestamps(
        &mut self,
        heap: &B::QueryHeap,
        start: u32,
        count: u32,
        dst: &GpuBuffer<B>,
    ) {
        self.note_use(dst);
        self.lists.list_mut().resolve_timestamps(
            heap,
            start,
            count,
            dst.memory(),
            dst.offset(),
        );
        self.lists.command_added();
    }

    fn residency_closure<'a>(
        resources: &'a DeviceResources<B>,
    ) -> impl FnOnce(&mut ResidencySet, u64, u64, &B::Fence) + 'a {
        move |set, list_id, completed, fence| {
            let shared = &resources.shared;
            let result = resources.residency.lock().process_paging(
                set,
                &shared.device,
                &shared.adapter,
                list_id,
                completed,
                |value| {
                    if !fence.wait(value) {
                        warn!("fence wait failed during residency paging");
                    }
                    fence.completed()
                },
            );
            if let Err(err) = result {
                warn!("residency paging failed: {}", err);
            }
        }
    }

    /// Submit the open command list if it has any commands.
    pub fn flush(&mut self) -> Result<(), DeviceError> {
        if !self.lists.has_commands() {
            return Ok(());
        }
        let shared = Arc::clone(&self.resources.shared);
        let resources = Arc::clone(&self.resources);
        self.lists.submit(
            &shared.queue,
            &shared.device,
            Self::residency_closure(&resources),
        )?;
        self.post_submit();
        Ok(())
    }

    /// Submit early when the heuristics say the GPU could use the work.
    pub fn flush_if_needed(&mut self) -> Result<(), DeviceError> {
        if self.lists.should_flush_opportunistically() {
            self.flush()?;
        }
        Ok(())
    }

    /// Flush and block until everything submitted so far has completed.
    pub fn wait_for_completion(&mut self) -> Result<(), DeviceError> {
        let shared = Arc::clone(&self.resources.shared);
        let resources = Arc::clone(&self.resources);
        let value = self.lists.ensure_flushed_and_fenced(
            &shared.queue,
            &shared.device,
            Self::residency_closure(&resources),
        )?;
        self.post_submit();
        if value == 0 {
            return Ok(());
        }
        if !self.lists.fence().wait(value) {
            return Err(DeviceError::DeviceLost);
        }
        self.post_submit();
        Ok(())
    }

    /// Block until the GPU passes `value`, submitting first if `value` is
    /// the open list's own id.
    pub fn wait_for_fence_value(&mut self, value: u64) -> Result<(), DeviceError> {
        let shared = Arc::clone(&self.resources.shared);
        let resources = Arc::clone(&self.resources);
        let ok = self.lists.wait_for_fence_value(
            value,
            &shared.queue,
            &shared.device,
            Self::residency_closure(&resources),
        )?;
        self.post_submit();
        if ok {
            Ok(())
        } else {
            Err(DeviceError::DeviceLost)
        }
    }

    fn post_submit(&mut self) {
        let completed = self.lists.completed_fence();
        self.resources.trim_deferred(completed);
        self.resources.trim_pools(completed);
        self.rebind_heaps();
    }
}
