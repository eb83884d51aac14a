//! Buffers and images.

use crate::context::Context;
use crate::device::NativeDevice;
use crate::error::{self, ClError, Result};
use crate::refs::{InternalRef, OwnedRef};

use rocl_engine::{CpuSlot, GpuBuffer, ImmediateContext};
use rocl_hal::{Backend, Descriptor, DescriptorKind};

use parking_lot::Mutex;
use std::sync::Arc;

bitflags::bitflags! {
    /// CL memory flags.
    pub struct MemFlags: u64 {
        const READ_WRITE = 1 << 0;
        const WRITE_ONLY = 1 << 1;
        const READ_ONLY = 1 << 2;
        const USE_HOST_PTR = 1 << 3;
        const ALLOC_HOST_PTR = 1 << 4;
        const COPY_HOST_PTR = 1 << 5;
        const HOST_WRITE_ONLY = 1 << 7;
        const HOST_READ_ONLY = 1 << 8;
        const HOST_NO_ACCESS = 1 << 9;
    }
}

bitflags::bitflags! {
    /// CL map flags.
    pub struct MapFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const WRITE_INVALIDATE_REGION = 1 << 2;
    }
}

bitflags::bitflags! {
    /// CL migration flags.
    pub struct MigrationFlags: u64 {
        const HOST = 1 << 0;
        const CONTENT_UNDEFINED = 1 << 1;
    }
}

/// Shape of a memory object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Buffer,
    Image1D,
    Image2D,
    Image3D,
}

/// Channel layout of an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelOrder {
    R,
    Rg,
    Rgba,
    Bgra,
}

impl ChannelOrder {
    pub fn channel_count(self) -> u32 {
        match self {
            ChannelOrder::R => 1,
            ChannelOrder::Rg => 2,
            ChannelOrder::Rgba | ChannelOrder::Bgra => 4,
        }
    }
}

/// Per-channel data type of an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelType {
    Unorm8,
    Snorm8,
    Uint8,
    Int8,
    Unorm16,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Half,
    Float,
}

impl ChannelType {
    pub fn byte_size(self) -> u32 {
        match self {
            ChannelType::Unorm8 | ChannelType::Snorm8 | ChannelType::Uint8 | ChannelType::Int8 => 1,
            ChannelType::Unorm16 | ChannelType::Uint16 | ChannelType::Int16 | ChannelType::Half => 2,
            ChannelType::Uint32 | ChannelType::Int32 | ChannelType::Float => 4,
        }
    }
}

/// An image format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageFormat {
    pub order: ChannelOrder,
    pub channel_type: ChannelType,
}

impl ImageFormat {
    pub fn element_size(&self) -> u32 {
        self.order.channel_count() * self.channel_type.byte_size()
    }
}

/// Resolved image geometry; pitches are tight row-major.
#[derive(Clone, Copy, Debug)]
pub struct ImageDesc {
    pub kind: ResourceKind,
    pub width: u64,
    pub height: u64,
    pub depth: u64,
    pub row_pitch: u64,
    pub slice_pitch: u64,
}

struct DeviceSlot<B: Backend> {
    native: Arc<NativeDevice<B>>,
    buffer: GpuBuffer<B>,
    uav_slot: Option<CpuSlot>,
    srv_slot: Option<CpuSlot>,
    initialized: bool,
}

#[derive(Default)]
pub(crate) struct MapRegion {
    pub data: Box<[u8]>,
    pub offset: u64,
    pub size: u64,
    pub flags: u64,
}

/// A buffer or image memory object.
///
/// GPU backing is allocated lazily per device at first recorded use, which
/// keeps creation free-threaded; initial host data rides along in the host
/// shadow until then.
pub struct Resource<B: Backend> {
    context: InternalRef<Context<B>>,
    pub kind: ResourceKind,
    pub flags: MemFlags,
    size: u64,
    format: Option<ImageFormat>,
    image: Option<ImageDesc>,
    parent: Option<(OwnedRef<Resource<B>>, u64)>,
    host_shadow: Mutex<Option<Box<[u8]>>>,
    per_device: Mutex<Vec<DeviceSlot<B>>>,
    maps: Mutex<Vec<MapRegion>>,
}

fn validate_flags(flags: MemFlags) -> Result<()> {
    let access = flags & (MemFlags::READ_WRITE | MemFlags::READ_ONLY | MemFlags::WRITE_ONLY);
    if access.bits().count_ones() > 1 {
        return Err(ClError::new(
            error::INVALID_VALUE,
            "conflicting access flags",
        ));
    }
    let host_access =
        flags & (MemFlags::HOST_READ_ONLY | MemFlags::HOST_WRITE_ONLY | MemFlags::HOST_NO_ACCESS);
    if host_access.bits().count_ones() > 1 {
        return Err(ClError::new(
            error::INVALID_VALUE,
            "conflicting host access flags",
        ));
    }
    if flags.contains(MemFlags::USE_HOST_PTR)
        && flags.intersects(MemFlags::ALLOC_HOST_PTR | MemFlags::COPY_HOST_PTR)
    {
        return Err(ClError::new(
            error::INVALID_VALUE,
            "USE_HOST_PTR excludes ALLOC/COPY_HOST_PTR",
        ));
    }
    Ok(())
}

impl<B: Backend> Resource<B> {
    /// Create a buffer. `host_data` must be given exactly when
    /// `USE_HOST_PTR` or `COPY_HOST_PTR` is set.
    pub fn create_buffer(
        context: &OwnedRef<Context<B>>,
        flags: MemFlags,
        size: u64,
        host_data: Option<&[u8]>,
    ) -> Result<OwnedRef<Resource<B>>> {
        validate_flags(flags)?;
        if size == 0 {
            return Err(context.report_error("buffer size is zero", error::INVALID_BUFFER_SIZE));
        }
        let wants_host = flags.intersects(MemFlags::USE_HOST_PTR | MemFlags::COPY_HOST_PTR);
        match host_data {
            Some(data) if data.len() as u64 != size => {
                return Err(context.report_error(
                    "host data length disagrees with buffer size",
                    error::INVALID_HOST_PTR,
                ));
            }
            Some(_) if !wants_host => {
                return Err(context.report_error(
                    "host data given without USE/COPY_HOST_PTR",
                    error::INVALID_HOST_PTR,
                ));
            }
            None if wants_host => {
                return Err(context.report_error(
                    "USE/COPY_HOST_PTR requires host data",
                    error::INVALID_HOST_PTR,
                ));
            }
            _ => {}
        }

        Ok(OwnedRef::new(Resource {
            context: context.internal(),
            kind: ResourceKind::Buffer,
            flags,
            size,
            format: None,
            image: None,
            parent: None,
            host_shadow: Mutex::new(host_data.map(|d| d.to_vec().into_boxed_slice())),
            per_device: Mutex::new(Vec::new()),
            maps: Mutex::new(Vec::new()),
        }))
    }

    /// Create a sub-buffer over `[origin, origin + size)` of `parent`.
    pub fn create_sub_buffer(
        parent: &OwnedRef<Resource<B>>,
        flags: MemFlags,
        origin: u64,
        size: u64,
    ) -> Result<OwnedRef<Resource<B>>> {
        validate_flags(flags)?;
        if parent.parent.is_some() || parent.kind != ResourceKind::Buffer {
            return Err(ClError::new(
                error::INVALID_MEM_OBJECT,
                "sub-buffers require a root buffer",
            ));
        }
        if size == 0 || origin.checked_add(size).map_or(true, |end| end > parent.size) {
            return Err(ClError::new(
                error::INVALID_VALUE,
                "sub-buffer region out of range",
            ));
        }
        let shadow = parent
            .host_shadow
            .lock()
            .as_ref()
            .map(|data| data[origin as usize..(origin + size) as usize].to_vec().into_boxed_slice());
        Ok(OwnedRef::new(Resource {
            context: parent.context.clone(),
            kind: ResourceKind::Buffer,
            flags,
            size,
            format: None,
            image: None,
            parent: Some((parent.clone(), origin)),
            // Sub-buffers alias the parent's storage; the shadow is only
            // consulted if the parent never reached the GPU.
            host_shadow: Mutex::new(shadow),
            per_device: Mutex::new(Vec::new()),
            maps: Mutex::new(Vec::new()),
        }))
    }

    /// Create an image. Host data, when present, must be tightly packed.
    pub fn create_image(
        context: &OwnedRef<Context<B>>,
        flags: MemFlags,
        format: ImageFormat,
        kind: ResourceKind,
        width: u64,
        height: u64,
        depth: u64,
        host_data: Option<&[u8]>,
    ) -> Result<OwnedRef<Resource<B>>> {
        validate_flags(flags)?;
        if kind == ResourceKind::Buffer {
            return Err(ClError::new(error::INVALID_VALUE, "not an image kind"));
        }
        if !context.devices().iter().any(|d| d.supports_images()) {
            return Err(context.report_error(
                "no device in this context supports images",
                error::INVALID_OPERATION,
            ));
        }
        let (height, depth) = match kind {
            ResourceKind::Image1D => (1, 1),
            ResourceKind::Image2D => (height, 1),
            _ => (height, depth),
        };
        if width == 0 || height == 0 || depth == 0 {
            return Err(context.report_error("empty image extent", error::INVALID_IMAGE_SIZE));
        }
        let element = u64::from(format.element_size());
        let row_pitch = width * element;
        let slice_pitch = row_pitch * height;
        let size = slice_pitch * depth;
        if let Some(data) = host_data {
            if (data.len() as u64) < size {
                return Err(context.report_error(
                    "host data too small for image",
                    error::INVALID_HOST_PTR,
                ));
            }
        }
        Ok(OwnedRef::new(Resource {
            context: context.internal(),
            kind,
            flags,
            size,
            format: Some(format),
            image: Some(ImageDesc {
                kind,
                width,
                height,
                depth,
                row_pitch,
                slice_pitch,
            }),
            parent: None,
            host_shadow: Mutex::new(host_data.map(|d| d[..size as usize].to_vec().into_boxed_slice())),
            per_device: Mutex::new(Vec::new()),
            maps: Mutex::new(Vec::new()),
        }))
    }

    pub fn context(&self) -> &InternalRef<Context<B>> {
        &self.context
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn format(&self) -> Option<ImageFormat> {
        self.format
    }

    pub fn image_desc(&self) -> Option<ImageDesc> {
        self.image
    }

    pub fn parent(&self) -> Option<&OwnedRef<Resource<B>>> {
        self.parent.as_ref().map(|(p, _)| p)
    }

    pub fn sub_buffer_origin(&self) -> Option<u64> {
        self.parent.as_ref().map(|(_, origin)| *origin)
    }

    pub fn map_count(&self) -> usize {
        self.maps.lock().len()
    }

    /// Ensure GPU backing on `native` and return `(buffer, extra_offset)`,
    /// uploading any pending host data first. Recording-worker only.
    pub(crate) fn ensure_on_device(
        &self,
        native: &Arc<NativeDevice<B>>,
        ctx: &mut ImmediateContext<B>,
    ) -> Result<(GpuBuffer<B>, u64)> {
        if let Some((parent, origin)) = &self.parent {
            let (buffer, extra) = parent.ensure_on_device(native, ctx)?;
            return Ok((buffer, extra + origin));
        }

        let mut slots = self.per_device.lock();
        let index = match slots.iter().position(|s| Arc::ptr_eq(&s.native, native)) {
            Some(index) => index,
            None => {
                let buffer = ctx.resources.create_buffer(self.size, false)?;
                slots.push(DeviceSlot {
                    native: Arc::clone(native),
                    buffer,
                    uav_slot: None,
                    srv_slot: None,
                    initialized: false,
                });
                slots.len() - 1
            }
        };

        if !slots[index].initialized {
            slots[index].initialized = true;
            let buffer = slots[index].buffer.clone();
            let shadow = self.host_shadow.lock();
            if let Some(data) = shadow.as_ref() {
                ctx.upload_to_buffer(&buffer, 0, data)?;
            }
        }
        Ok((slots[index].buffer.clone(), 0))
    }

    /// CPU descriptor slot viewing this resource as a UAV on `native`.
    pub(crate) fn uav_slot(
        &self,
        native: &Arc<NativeDevice<B>>,
        ctx: &mut ImmediateContext<B>,
    ) -> Result<CpuSlot> {
        self.view_slot(native, ctx, true)
    }

    /// CPU descriptor slot viewing this resource as an SRV on `native`.
    pub(crate) fn srv_slot(
        &self,
        native: &Arc<NativeDevice<B>>,
        ctx: &mut ImmediateContext<B>,
    ) -> Result<CpuSlot> {
        self.view_slot(native, ctx, false)
    }

    fn view_slot(
        &self,
        native: &Arc<NativeDevice<B>>,
        ctx: &mut ImmediateContext<B>,
        writable: bool,
    ) -> Result<CpuSlot> {
        let (buffer, extra) = self.ensure_on_device(native, ctx)?;

        // Sub-buffer views live on the child object, windowed into the
        // parent's storage.
        let mut slots = self.per_device.lock();
        let index = match slots.iter().position(|s| Arc::ptr_eq(&s.native, native)) {
            Some(index) => index,
            None => {
                slots.push(DeviceSlot {
                    native: Arc::clone(native),
                    buffer: buffer.clone(),
                    uav_slot: None,
                    srv_slot: None,
                    initialized: true,
                });
                slots.len() - 1
            }
        };

        let cached = if writable {
            slots[index].uav_slot
        } else {
            slots[index].srv_slot
        };
        if let Some(slot) = cached {
            return Ok(slot);
        }

        let resources = ctx.resources.clone();
        let slot = resources.allocate_descriptor(DescriptorKind::View)?;
        let desc = if writable {
            Descriptor::UavBuffer {
                memory: buffer.memory(),
                offset: buffer.offset() + extra,
                size: self.size,
            }
        } else {
            Descriptor::SrvBuffer {
                memory: buffer.memory(),
                offset: buffer.offset() + extra,
                size: self.size,
            }
        };
        resources.write_descriptor(DescriptorKind::View, slot, desc);
        if writable {
            slots[index].uav_slot = Some(slot);
        } else {
            slots[index].srv_slot = Some(slot);
        }
        Ok(slot)
    }

    /// The engine buffer for `native`, if already materialized.
    pub(crate) fn buffer_for(&self, native: &Arc<NativeDevice<B>>) -> Option<GpuBuffer<B>> {
        if let Some((parent, _)) = &self.parent {
            return parent.buffer_for(native);
        }
        self.per_device
            .lock()
            .iter()
            .find(|s| Arc::ptr_eq(&s.native, native))
            .map(|s| s.buffer.clone())
    }

    pub(crate) fn insert_map_region(&self, region: MapRegion) -> *mut u8 {
        let mut maps = self.maps.lock();
        maps.push(region);
        maps.last_mut().unwrap().data.as_mut_ptr()
    }

    pub(crate) fn with_map_region<R>(
        &self,
        ptr: *const u8,
        f: impl FnOnce(&mut MapRegion) -> R,
    ) -> Option<R> {
        let mut maps = self.maps.lock();
        maps.iter_mut()
            .find(|r| r.data.as_ptr() == ptr)
            .map(f)
    }

    pub(crate) fn remove_map_region(&self, ptr: *const u8) -> Option<MapRegion> {
        let mut maps = self.maps.lock();
        let index = maps.iter().position(|r| r.data.as_ptr() == ptr)?;
        Some(maps.swap_remove(index))
    }

    /// Pull the freshest contents into the host shadow. Used by migration.
    pub(crate) fn refresh_shadow(
        &self,
        native: &Arc<NativeDevice<B>>,
        ctx: &mut ImmediateContext<B>,
    ) -> Result<()> {
        let (buffer, extra) = self.ensure_on_device(native, ctx)?;
        let staging = ctx.copy_to_readback(&buffer, extra, self.size)?;
        ctx.wait_for_completion()?;
        let bytes = ctx.read_staging(&staging)?;
        ctx.resources.destroy_buffer(staging);
        *self.host_shadow.lock() = Some(bytes.into_boxed_slice());
        Ok(())
    }

    /// Drop the GPU backing on every device except `keep`, so the next use
    /// re-uploads from the shadow.
    pub(crate) fn invalidate_other_devices(&self, keep: &Arc<NativeDevice<B>>) {
        let mut slots = self.per_device.lock();
        slots.retain(|slot| {
            if Arc::ptr_eq(&slot.native, keep) {
                true
            } else {
                release_slot(slot);
                false
            }
        });
    }
}

fn release_slot<B: Backend>(slot: &DeviceSlot<B>) {
    let resources = slot.native.resources();
    if let Some(view) = slot.uav_slot {
        resources.free_descriptor(DescriptorKind::View, view);
    }
    if let Some(view) = slot.srv_slot {
        resources.free_descriptor(DescriptorKind::View, view);
    }
    resources.destroy_buffer(slot.buffer.clone());
}

impl<B: Backend> Drop for Resource<B> {
    fn drop(&mut self) {
        let slots = self.per_device.get_mut();
        for slot in slots.iter() {
            if self.parent.is_none() {
                release_slot(slot);
            } else {
                // Sub-buffers own their descriptor slots but not the
                // backing memory.
                let resources = slot.native.resources();
                if let Some(view) = slot.uav_slot {
                    resources.free_descriptor(DescriptorKind::View, view);
                }
                if let Some(view) = slot.srv_slot {
                    resources.free_descriptor(DescriptorKind::View, view);
                }
            }
        }
    }
}

impl<B: Backend> std::fmt::Debug for Resource<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("kind", &self.kind)
            .field("size", &self.size)
            .finish()
    }
}
