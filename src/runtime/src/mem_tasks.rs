//! Memory-transfer task variants and their enqueue entry points.

use crate::error::{self, ClError, Result, StatusCode};
use crate::device::NativeDevice;
use crate::queue::CommandQueue;
use crate::refs::OwnedRef;
use crate::resource::{MapFlags, MapRegion, MigrationFlags, Resource, ResourceKind};
use crate::task::{CommandType, Event, NullPayload, Task, TaskPayload};

use rocl_engine::{GpuBuffer, ImmediateContext};
use rocl_hal::Backend;

use std::sync::Arc;

/// Raw destination pointer that rides along with an asynchronous read.
/// The caller guarantees it stays valid until the task completes, the same
/// contract the C API imposes.
pub(crate) struct SendPtr(pub *mut u8);
unsafe impl Send for SendPtr {}

pub(crate) fn enqueue<B: Backend>(
    queue: &OwnedRef<CommandQueue<B>>,
    command_type: CommandType,
    payload: Box<dyn TaskPayload<B>>,
    wait_list: &[Event<B>],
) -> Result<Event<B>> {
    let platform = queue.context().platform().clone();
    let lock = platform.task_pool_lock();
    let task = Task::new(queue.context().clone(), queue, command_type, payload);
    Task::add_dependencies(&task, wait_list, &lock)?;
    queue.queue_task(&task, &lock)?;
    Ok(task)
}

fn check_buffer_range<B: Backend>(
    queue: &CommandQueue<B>,
    buffer: &Resource<B>,
    offset: u64,
    size: u64,
) -> Result<()> {
    if !std::ptr::eq(buffer.context().as_raw(), queue.context().as_raw()) {
        return Err(ClError::new(
            error::INVALID_CONTEXT,
            "buffer and queue belong to different contexts",
        ));
    }
    if buffer.kind != ResourceKind::Buffer {
        return Err(ClError::new(error::INVALID_MEM_OBJECT, "not a buffer"));
    }
    if size == 0 || offset.checked_add(size).map_or(true, |end| end > buffer.size()) {
        return Err(ClError::new(error::INVALID_VALUE, "range out of bounds"));
    }
    Ok(())
}

// --- read ---------------------------------------------------------------

struct ReadBufferPayload<B: Backend> {
    buffer: OwnedRef<Resource<B>>,
    offset: u64,
    size: u64,
    dst: SendPtr,
    staging: Option<GpuBuffer<B>>,
}

impl<B: Backend> TaskPayload<B> for ReadBufferPayload<B> {
    fn record(
        &mut self,
        native: &Arc<NativeDevice<B>>,
        ctx: &mut ImmediateContext<B>,
    ) -> Result<()> {
        let (gpu, extra) = self.buffer.ensure_on_device(native, ctx)?;
        let staging = ctx.copy_to_readback(&gpu, extra + self.offset, self.size)?;
        self.staging = Some(staging);
        Ok(())
    }

    fn on_complete(&mut self, status: StatusCode, ctx: Option<&mut ImmediateContext<B>>) {
        let staging = match self.staging.take() {
            Some(staging) => staging,
            None => return,
        };
        if let Some(ctx) = ctx {
            if status == error::SUCCESS {
                if let Ok(bytes) = ctx.read_staging(&staging) {
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            bytes.as_ptr(),
                            self.dst.0,
                            self.size as usize,
                        );
                    }
                }
            }
            ctx.resources.destroy_buffer(staging);
        }
    }
}

/// Read `size` bytes at `offset` into `dst`.
///
/// # Safety
/// `dst` must point to `size` writable bytes that stay valid until the
/// returned event completes.
pub unsafe fn enqueue_read_buffer<B: Backend>(
    queue: &OwnedRef<CommandQueue<B>>,
    buffer: &OwnedRef<Resource<B>>,
    blocking: bool,
    offset: u64,
    size: u64,
    dst: *mut u8,
    wait_list: &[Event<B>],
) -> Result<Event<B>> {
    check_buffer_range(queue, buffer, offset, size)?;
    let event = enqueue(
        queue,
        CommandType::ReadBuffer,
        Box::new(ReadBufferPayload {
            buffer: buffer.clone(),
            offset,
            size,
            dst: SendPtr(dst),
            staging: None,
        }),
        wait_list,
    )?;
    if blocking {
        finish_blocking(queue, &event)?;
    }
    Ok(event)
}

/// Safe blocking read into a slice.
pub fn read_buffer_blocking<B: Backend>(
    queue: &OwnedRef<CommandQueue<B>>,
    buffer: &OwnedRef<Resource<B>>,
    offset: u64,
    out: &mut [u8],
    wait_list: &[Event<B>],
) -> Result<()> {
    unsafe {
        enqueue_read_buffer(
            queue,
            buffer,
            true,
            offset,
            out.len() as u64,
            out.as_mut_ptr(),
            wait_list,
        )?;
    }
    Ok(())
}

pub(crate) fn finish_blocking<B: Backend>(
    queue: &OwnedRef<CommandQueue<B>>,
    event: &Event<B>,
) -> Result<()> {
    {
        let platform = queue.context().platform().clone();
        let lock = platform.task_pool_lock();
        queue.flush(&lock, true)?;
    }
    let status = event.wait_for_completion();
    if status < 0 {
        Err(ClError::code_only(status))
    } else {
        Ok(())
    }
}

// --- write --------------------------------------------------------------

struct WriteBufferPayload<B: Backend> {
    buffer: OwnedRef<Resource<B>>,
    offset: u64,
    data: Vec<u8>,
}

impl<B: Backend> TaskPayload<B> for WriteBufferPayload<B> {
    fn record(
        &mut self,
        native: &Arc<NativeDevice<B>>,
        ctx: &mut ImmediateContext<B>,
    ) -> Result<()> {
        let (gpu, extra) = self.buffer.ensure_on_device(native, ctx)?;
        ctx.upload_to_buffer(&gpu, extra + self.offset, &self.data)?;
        Ok(())
    }
}

/// Write `data` into the buffer at `offset`. The data is captured at
/// enqueue time, so the caller's storage is free immediately.
pub fn enqueue_write_buffer<B: Backend>(
    queue: &OwnedRef<CommandQueue<B>>,
    buffer: &OwnedRef<Resource<B>>,
    blocking: bool,
    offset: u64,
    data: &[u8],
    wait_list: &[Event<B>],
) -> Result<Event<B>> {
    check_buffer_range(queue, buffer, offset, data.len() as u64)?;
    let event = enqueue(
        queue,
        CommandType::WriteBuffer,
        Box::new(WriteBufferPayload {
            buffer: buffer.clone(),
            offset,
            data: data.to_vec(),
        }),
        wait_list,
    )?;
    if blocking {
        finish_blocking(queue, &event)?;
    }
    Ok(event)
}

// --- copy ---------------------------------------------------------------

struct CopyBufferPayload<B: Backend> {
    src: OwnedRef<Resource<B>>,
    dst: OwnedRef<Resource<B>>,
    src_offset: u64,
    dst_offset: u64,
    size: u64,
}

impl<B: Backend> TaskPayload<B> for CopyBufferPayload<B> {
    fn record(
        &mut self,
        native: &Arc<NativeDevice<B>>,
        ctx: &mut ImmediateContext<B>,
    ) -> Result<()> {
        let (src, src_extra) = self.src.ensure_on_device(native, ctx)?;
        let (dst, dst_extra) = self.dst.ensure_on_device(native, ctx)?;
        ctx.copy_buffer(
            &src,
            src_extra + self.src_offset,
            &dst,
            dst_extra + self.dst_offset,
            self.size,
        )?;
        Ok(())
    }
}

pub fn enqueue_copy_buffer<B: Backend>(
    queue: &OwnedRef<CommandQueue<B>>,
    src: &OwnedRef<Resource<B>>,
    dst: &OwnedRef<Resource<B>>,
    src_offset: u64,
    dst_offset: u64,
    size: u64,
    wait_list: &[Event<B>],
) -> Result<Event<B>> {
    check_buffer_range(queue, src, src_offset, size)?;
    check_buffer_range(queue, dst, dst_offset, size)?;
    if std::ptr::eq(src.as_raw(), dst.as_raw()) {
        let (a, b) = (src_offset, dst_offset);
        if a < b + size && b < a + size {
            return Err(ClError::new(
                error::MEM_COPY_OVERLAP,
                "source and destination regions overlap",
            ));
        }
    }
    enqueue(
        queue,
        CommandType::CopyBuffer,
        Box::new(CopyBufferPayload {
            src: src.clone(),
            dst: dst.clone(),
            src_offset,
            dst_offset,
            size,
        }),
        wait_list,
    )
}

// --- fill ---------------------------------------------------------------

pub(crate) struct FillBufferPayload<B: Backend> {
    pub(crate) buffer: OwnedRef<Resource<B>>,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) pattern: Vec<u8>,
}

impl<B: Backend> TaskPayload<B> for FillBufferPayload<B> {
    fn record(
        &mut self,
        native: &Arc<NativeDevice<B>>,
        ctx: &mut ImmediateContext<B>,
    ) -> Result<()> {
        let (gpu, extra) = self.buffer.ensure_on_device(native, ctx)?;
        ctx.fill_buffer(&gpu, extra + self.offset, self.size, &self.pattern)?;
        Ok(())
    }
}

pub fn enqueue_fill_buffer<B: Backend>(
    queue: &OwnedRef<CommandQueue<B>>,
    buffer: &OwnedRef<Resource<B>>,
    pattern: &[u8],
    offset: u64,
    size: u64,
    wait_list: &[Event<B>],
) -> Result<Event<B>> {
    check_buffer_range(queue, buffer, offset, size)?;
    let valid_pattern = matches!(pattern.len(), 1 | 2 | 4 | 8 | 16 | 32 | 64 | 128);
    if !valid_pattern {
        return Err(ClError::new(error::INVALID_VALUE, "invalid pattern size"));
    }
    if offset % pattern.len() as u64 != 0 || size % pattern.len() as u64 != 0 {
        return Err(ClError::new(
            error::INVALID_VALUE,
            "offset and size must be multiples of the pattern size",
        ));
    }
    enqueue(
        queue,
        CommandType::FillBuffer,
        Box::new(FillBufferPayload {
            buffer: buffer.clone(),
            offset,
            size,
            pattern: pattern.to_vec(),
        }),
        wait_list,
    )
}

// --- rect copies --------------------------------------------------------

/// Geometry of a rectangular buffer transfer.
#[derive(Clone, Copy, Debug)]
pub struct BufferRect {
    pub buffer_origin: [u64; 3],
    pub host_origin: [u64; 3],
    pub region: [u64; 3],
    pub buffer_row_pitch: u64,
    pub buffer_slice_pitch: u64,
    pub host_row_pitch: u64,
    pub host_slice_pitch: u64,
}

impl BufferRect {
    pub(crate) fn normalized(mut self) -> Result<Self> {
        if self.region.iter().any(|&r| r == 0) {
            return Err(ClError::new(error::INVALID_VALUE, "empty rect region"));
        }
        if self.buffer_row_pitch == 0 {
            self.buffer_row_pitch = self.region[0];
        }
        if self.buffer_slice_pitch == 0 {
            self.buffer_slice_pitch = self.buffer_row_pitch * self.region[1];
        }
        if self.host_row_pitch == 0 {
            self.host_row_pitch = self.region[0];
        }
        if self.host_slice_pitch == 0 {
            self.host_slice_pitch = self.host_row_pitch * self.region[1];
        }
        Ok(self)
    }

    fn buffer_offset(&self, y: u64, z: u64) -> u64 {
        self.buffer_origin[0]
            + (self.buffer_origin[1] + y) * self.buffer_row_pitch
            + (self.buffer_origin[2] + z) * self.buffer_slice_pitch
    }

    fn host_offset(&self, y: u64, z: u64) -> u64 {
        self.host_origin[0]
            + (self.host_origin[1] + y) * self.host_row_pitch
            + (self.host_origin[2] + z) * self.host_slice_pitch
    }

    fn buffer_end(&self) -> u64 {
        self.buffer_offset(self.region[1] - 1, self.region[2] - 1) + self.region[0]
    }

    fn rows(&self) -> impl Iterator<Item = (u64, u64)> {
        let (h, d) = (self.region[1], self.region[2]);
        (0..d).flat_map(move |z| (0..h).map(move |y| (y, z)))
    }
}

pub(crate) struct ReadBufferRectPayload<B: Backend> {
    pub(crate) buffer: OwnedRef<Resource<B>>,
    pub(crate) rect: BufferRect,
    pub(crate) dst: SendPtr,
    pub(crate) staging: Option<GpuBuffer<B>>,
}

impl<B: Backend> TaskPayload<B> for ReadBufferRectPayload<B> {
    fn record(
        &mut self,
        native: &Arc<NativeDevice<B>>,
        ctx: &mut ImmediateContext<B>,
    ) -> Result<()> {
        let (gpu, extra) = self.buffer.ensure_on_device(native, ctx)?;
        // Gather rows into one packed staging block.
        let row = self.rect.region[0];
        let rows = self.rect.region[1] * self.rect.region[2];
        let staging = ctx
            .resources
            .allocate_staging(rocl_hal::HeapKind::Readback, row * rows, false)?;
        for (index, (y, z)) in self.rect.rows().enumerate() {
            ctx.copy_buffer(
                &gpu,
                extra + self.rect.buffer_offset(y, z),
                &staging,
                index as u64 * row,
                row,
            )?;
        }
        self.staging = Some(staging);
        Ok(())
    }

    fn on_complete(&mut self, status: StatusCode, ctx: Option<&mut ImmediateContext<B>>) {
        let staging = match self.staging.take() {
            Some(staging) => staging,
            None => return,
        };
        if let Some(ctx) = ctx {
            if status == error::SUCCESS {
                if let Ok(bytes) = ctx.read_staging(&staging) {
                    let row = self.rect.region[0] as usize;
                    for (index, (y, z)) in self.rect.rows().enumerate() {
                        let host_at = self.rect.host_offset(y, z) as usize;
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                bytes[index * row..].as_ptr(),
                                self.dst.0.add(host_at),
                                row,
                            );
                        }
                    }
                }
            }
            ctx.resources.destroy_buffer(staging);
        }
    }
}

/// Rectangular read.
///
/// # Safety
/// `dst` must stay valid for the host extent of `rect` until completion.
pub unsafe fn enqueue_read_buffer_rect<B: Backend>(
    queue: &OwnedRef<CommandQueue<B>>,
    buffer: &OwnedRef<Resource<B>>,
    blocking: bool,
    rect: BufferRect,
    dst: *mut u8,
    wait_list: &[Event<B>],
) -> Result<Event<B>> {
    let rect = rect.normalized()?;
    check_buffer_range(queue, buffer, 0, rect.buffer_end())?;
    let event = enqueue(
        queue,
        CommandType::ReadBufferRect,
        Box::new(ReadBufferRectPayload {
            buffer: buffer.clone(),
            rect,
            dst: SendPtr(dst),
            staging: None,
        }),
        wait_list,
    )?;
    if blocking {
        finish_blocking(queue, &event)?;
    }
    Ok(event)
}

pub(crate) struct WriteBufferRectPayload<B: Backend> {
    pub(crate) buffer: OwnedRef<Resource<B>>,
    pub(crate) rect: BufferRect,
    // Rows packed tight at enqueue time.
    pub(crate) data: Vec<u8>,
}

impl<B: Backend> TaskPayload<B> for WriteBufferRectPayload<B> {
    fn record(
        &mut self,
        native: &Arc<NativeDevice<B>>,
        ctx: &mut ImmediateContext<B>,
    ) -> Result<()> {
        let (gpu, extra) = self.buffer.ensure_on_device(native, ctx)?;
        let row = self.rect.region[0];
        let staging = ctx
            .resources
            .allocate_staging(rocl_hal::HeapKind::Upload, self.data.len() as u64, false)?;
        ctx.write_staging(&staging, &self.data)?;
        for (index, (y, z)) in self.rect.rows().enumerate() {
            ctx.copy_buffer(
                &staging,
                index as u64 * row,
                &gpu,
                extra + self.rect.buffer_offset(y, z),
                row,
            )?;
        }
        ctx.resources.destroy_buffer(staging);
        Ok(())
    }
}

/// Rectangular write; the host region is captured at enqueue time.
pub fn enqueue_write_buffer_rect<B: Backend>(
    queue: &OwnedRef<CommandQueue<B>>,
    buffer: &OwnedRef<Resource<B>>,
    blocking: bool,
    rect: BufferRect,
    src: &[u8],
    wait_list: &[Event<B>],
) -> Result<Event<B>> {
    let rect = rect.normalized()?;
    check_buffer_range(queue, buffer, 0, rect.buffer_end())?;
    let row = rect.region[0] as usize;
    let mut data = Vec::with_capacity(row * (rect.region[1] * rect.region[2]) as usize);
    for (y, z) in rect.rows() {
        let at = rect.host_offset(y, z) as usize;
        let line = src
            .get(at..at + row)
            .ok_or_else(|| ClError::new(error::INVALID_VALUE, "host region out of bounds"))?;
        data.extend_from_slice(line);
    }
    let event = enqueue(
        queue,
        CommandType::WriteBufferRect,
        Box::new(WriteBufferRectPayload {
            buffer: buffer.clone(),
            rect,
            data,
        }),
        wait_list,
    )?;
    if blocking {
        finish_blocking(queue, &event)?;
    }
    Ok(event)
}

pub(crate) struct CopyBufferRectPayload<B: Backend> {
    pub(crate) src: OwnedRef<Resource<B>>,
    pub(crate) dst: OwnedRef<Resource<B>>,
    pub(crate) rect: BufferRect,
}

impl<B: Backend> TaskPayload<B> for CopyBufferRectPayload<B> {
    fn record(
        &mut self,
        native: &Arc<NativeDevice<B>>,
        ctx: &mut ImmediateContext<B>,
    ) -> Result<()> {
        let (src, src_extra) = self.src.ensure_on_device(native, ctx)?;
        let (dst, dst_extra) = self.dst.ensure_on_device(native, ctx)?;
        let row = self.rect.region[0];
        for (y, z) in self.rect.rows() {
            ctx.copy_buffer(
                &src,
                src_extra + self.rect.buffer_offset(y, z),
                &dst,
                dst_extra + self.rect.host_offset(y, z),
                row,
            )?;
        }
        Ok(())
    }
}

/// Rectangular buffer-to-buffer copy. The rect's "host" half addresses the
/// destination buffer.
pub fn enqueue_copy_buffer_rect<B: Backend>(
    queue: &OwnedRef<CommandQueue<B>>,
    src: &OwnedRef<Resource<B>>,
    dst: &OwnedRef<Resource<B>>,
    rect: BufferRect,
    wait_list: &[Event<B>],
) -> Result<Event<B>> {
    let rect = rect.normalized()?;
    check_buffer_range(queue, src, 0, rect.buffer_end())?;
    enqueue(
        queue,
        CommandType::CopyBufferRect,
        Box::new(CopyBufferRectPayload {
            src: src.clone(),
            dst: dst.clone(),
            rect,
        }),
        wait_list,
    )
}

// --- map / unmap --------------------------------------------------------

struct MapBufferPayload<B: Backend> {
    buffer: OwnedRef<Resource<B>>,
    ptr: SendPtr,
    offset: u64,
    size: u64,
    needs_read: bool,
    staging: Option<GpuBuffer<B>>,
}

impl<B: Backend> TaskPayload<B> for MapBufferPayload<B> {
    fn record(
        &mut self,
        native: &Arc<NativeDevice<B>>,
        ctx: &mut ImmediateContext<B>,
    ) -> Result<()> {
        if !self.needs_read {
            return Ok(());
        }
        let (gpu, extra) = self.buffer.ensure_on_device(native, ctx)?;
        self.staging = Some(ctx.copy_to_readback(&gpu, extra + self.offset, self.size)?);
        Ok(())
    }

    fn on_complete(&mut self, status: StatusCode, ctx: Option<&mut ImmediateContext<B>>) {
        let staging = match self.staging.take() {
            Some(staging) => staging,
            None => return,
        };
        if let Some(ctx) = ctx {
            if status == error::SUCCESS {
                if let Ok(bytes) = ctx.read_staging(&staging) {
                    self.buffer.with_map_region(self.ptr.0, |region| {
                        region.data.copy_from_slice(&bytes[..region.size as usize]);
                    });
                }
            }
            ctx.resources.destroy_buffer(staging);
        }
    }
}

/// Map a buffer region. The returned pointer is valid immediately but its
/// contents are defined only once the event completes.
pub fn enqueue_map_buffer<B: Backend>(
    queue: &OwnedRef<CommandQueue<B>>,
    buffer: &OwnedRef<Resource<B>>,
    blocking: bool,
    flags: MapFlags,
    offset: u64,
    size: u64,
    wait_list: &[Event<B>],
) -> Result<(Event<B>, *mut u8)> {
    check_buffer_range(queue, buffer, offset, size)?;
    let region = MapRegion {
        data: vec![0u8; size as usize].into_boxed_slice(),
        offset,
        size,
        flags: flags.bits(),
    };
    let ptr = buffer.insert_map_region(region);
    let needs_read = !flags.contains(MapFlags::WRITE_INVALIDATE_REGION);
    let event = enqueue(
        queue,
        CommandType::MapBuffer,
        Box::new(MapBufferPayload {
            buffer: buffer.clone(),
            ptr: SendPtr(ptr),
            offset,
            size,
            needs_read,
            staging: None,
        }),
        wait_list,
    )?;
    if blocking {
        finish_blocking(queue, &event)?;
    }
    Ok((event, ptr))
}

struct UnmapPayload<B: Backend> {
    buffer: OwnedRef<Resource<B>>,
    ptr: SendPtr,
}

impl<B: Backend> TaskPayload<B> for UnmapPayload<B> {
    fn record(
        &mut self,
        native: &Arc<NativeDevice<B>>,
        ctx: &mut ImmediateContext<B>,
    ) -> Result<()> {
        let write_back = self
            .buffer
            .with_map_region(self.ptr.0, |region| {
                let flags = MapFlags::from_bits_truncate(region.flags);
                if flags.intersects(MapFlags::WRITE | MapFlags::WRITE_INVALIDATE_REGION) {
                    Some((region.offset, region.data.to_vec()))
                } else {
                    None
                }
            })
            .flatten();
        if let Some((offset, data)) = write_back {
            let (gpu, extra) = self.buffer.ensure_on_device(native, ctx)?;
            ctx.upload_to_buffer(&gpu, extra + offset, &data)?;
        }
        Ok(())
    }

    fn on_complete(&mut self, _status: StatusCode, _ctx: Option<&mut ImmediateContext<B>>) {
        self.buffer.remove_map_region(self.ptr.0);
    }
}

/// Unmap a previously mapped region. Write-mapped contents reach the
/// buffer when the returned event completes; the pointer dies with it.
pub fn enqueue_unmap<B: Backend>(
    queue: &OwnedRef<CommandQueue<B>>,
    buffer: &OwnedRef<Resource<B>>,
    ptr: *mut u8,
    wait_list: &[Event<B>],
) -> Result<Event<B>> {
    if buffer.with_map_region(ptr, |_| ()).is_none() {
        return Err(ClError::new(
            error::INVALID_VALUE,
            "pointer does not name a mapped region",
        ));
    }
    enqueue(
        queue,
        CommandType::UnmapMemObject,
        Box::new(UnmapPayload {
            buffer: buffer.clone(),
            ptr: SendPtr(ptr),
        }),
        wait_list,
    )
}

// --- migration ----------------------------------------------------------

struct MigratePayload<B: Backend> {
    resources: Vec<OwnedRef<Resource<B>>>,
    flags: MigrationFlags,
}

impl<B: Backend> TaskPayload<B> for MigratePayload<B> {
    fn record(
        &mut self,
        native: &Arc<NativeDevice<B>>,
        ctx: &mut ImmediateContext<B>,
    ) -> Result<()> {
        for resource in &self.resources {
            if self.flags.contains(MigrationFlags::CONTENT_UNDEFINED) {
                // Allocation without content; drop stale copies elsewhere.
                resource.ensure_on_device(native, ctx)?;
                resource.invalidate_other_devices(native);
            } else {
                resource.refresh_shadow(native, ctx)?;
                resource.invalidate_other_devices(native);
                resource.ensure_on_device(native, ctx)?;
            }
        }
        Ok(())
    }
}

/// Migrate memory objects to the queue's device.
pub fn enqueue_migrate_mem_objects<B: Backend>(
    queue: &OwnedRef<CommandQueue<B>>,
    resources: &[OwnedRef<Resource<B>>],
    flags: MigrationFlags,
    wait_list: &[Event<B>],
) -> Result<Event<B>> {
    if resources.is_empty() {
        return Err(ClError::new(error::INVALID_VALUE, "no objects to migrate"));
    }
    for resource in resources {
        if !std::ptr::eq(resource.context().as_raw(), queue.context().as_raw()) {
            return Err(ClError::new(
                error::INVALID_CONTEXT,
                "object belongs to a different context",
            ));
        }
    }
    enqueue(
        queue,
        CommandType::MigrateMemObjects,
        Box::new(MigratePayload {
            resources: resources.to_vec(),
            flags,
        }),
        wait_list,
    )
}

// --- markers and barriers ----------------------------------------------

/// Enqueue a marker. An empty wait list makes it depend on everything
/// currently in the queue.
pub fn enqueue_marker<B: Backend>(
    queue: &OwnedRef<CommandQueue<B>>,
    wait_list: &[Event<B>],
) -> Result<Event<B>> {
    enqueue_marker_or_barrier(queue, CommandType::Marker, wait_list)
}

/// Enqueue a barrier: like a marker, but every later task in the queue
/// also chains behind it.
pub fn enqueue_barrier<B: Backend>(
    queue: &OwnedRef<CommandQueue<B>>,
    wait_list: &[Event<B>],
) -> Result<Event<B>> {
    enqueue_marker_or_barrier(queue, CommandType::Barrier, wait_list)
}

fn enqueue_marker_or_barrier<B: Backend>(
    queue: &OwnedRef<CommandQueue<B>>,
    command_type: CommandType,
    wait_list: &[Event<B>],
) -> Result<Event<B>> {
    let platform = queue.context().platform().clone();
    let lock = platform.task_pool_lock();
    let task = Task::new(
        queue.context().clone(),
        queue,
        command_type,
        Box::new(NullPayload),
    );
    if wait_list.is_empty() {
        queue.add_all_tasks_as_dependencies(&task, &lock)?;
    } else {
        Task::add_dependencies(&task, wait_list, &lock)?;
    }
    queue.queue_task(&task, &lock)?;
    Ok(task)
}
