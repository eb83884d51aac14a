//! Image transfer entry points.
//!
//! Images are stored row-major in their backing allocation, so every image
//! transfer lowers to the rectangular buffer machinery with offsets scaled
//! by the element size.

use crate::error::{self, ClError, Result};
use crate::mem_tasks::{
    enqueue, finish_blocking, BufferRect, CopyBufferRectPayload, ReadBufferRectPayload, SendPtr,
    WriteBufferRectPayload,
};
use crate::queue::CommandQueue;
use crate::refs::OwnedRef;
use crate::resource::{Resource, ResourceKind};
use crate::task::{CommandType, Event};

use rocl_hal::Backend;

fn check_image<B: Backend>(
    queue: &CommandQueue<B>,
    image: &Resource<B>,
    origin: [u64; 3],
    region: [u64; 3],
) -> Result<()> {
    if !std::ptr::eq(image.context().as_raw(), queue.context().as_raw()) {
        return Err(ClError::new(
            error::INVALID_CONTEXT,
            "image and queue belong to different contexts",
        ));
    }
    let desc = image
        .image_desc()
        .ok_or_else(|| ClError::new(error::INVALID_MEM_OBJECT, "not an image"))?;
    if region.iter().any(|&r| r == 0) {
        return Err(ClError::new(error::INVALID_VALUE, "empty image region"));
    }
    let extent = [desc.width, desc.height, desc.depth];
    for dim in 0..3 {
        if origin[dim]
            .checked_add(region[dim])
            .map_or(true, |end| end > extent[dim])
        {
            return Err(ClError::new(
                error::INVALID_VALUE,
                "image region out of bounds",
            ));
        }
    }
    match image.kind {
        ResourceKind::Image1D if origin[1] != 0 || origin[2] != 0 => {
            Err(ClError::new(error::INVALID_VALUE, "1D images have no y/z"))
        }
        ResourceKind::Image2D if origin[2] != 0 => {
            Err(ClError::new(error::INVALID_VALUE, "2D images have no z"))
        }
        _ => Ok(()),
    }
}

fn image_rect<B: Backend>(
    image: &Resource<B>,
    origin: [u64; 3],
    region: [u64; 3],
    host_row_pitch: u64,
    host_slice_pitch: u64,
) -> BufferRect {
    let desc = image.image_desc().expect("caller validated image");
    let element = u64::from(image.format().expect("images carry formats").element_size());
    BufferRect {
        buffer_origin: [origin[0] * element, origin[1], origin[2]],
        host_origin: [0, 0, 0],
        region: [region[0] * element, region[1], region[2]],
        buffer_row_pitch: desc.row_pitch,
        buffer_slice_pitch: desc.slice_pitch,
        host_row_pitch,
        host_slice_pitch,
    }
}

/// Read an image region into `dst`, tightly packed unless pitches are
/// given.
///
/// # Safety
/// `dst` must stay valid for the host extent until the event completes.
pub unsafe fn enqueue_read_image<B: Backend>(
    queue: &OwnedRef<CommandQueue<B>>,
    image: &OwnedRef<Resource<B>>,
    blocking: bool,
    origin: [u64; 3],
    region: [u64; 3],
    host_row_pitch: u64,
    host_slice_pitch: u64,
    dst: *mut u8,
    wait_list: &[Event<B>],
) -> Result<Event<B>> {
    check_image(queue, image, origin, region)?;
    let rect = image_rect(image, origin, region, host_row_pitch, host_slice_pitch).normalized()?;
    let event = enqueue(
        queue,
        CommandType::ReadImage,
        Box::new(ReadBufferRectPayload {
            buffer: image.clone(),
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

/// Write a host region into an image.
pub fn enqueue_write_image<B: Backend>(
    queue: &OwnedRef<CommandQueue<B>>,
    image: &OwnedRef<Resource<B>>,
    blocking: bool,
    origin: [u64; 3],
    region: [u64; 3],
    host_row_pitch: u64,
    host_slice_pitch: u64,
    src: &[u8],
    wait_list: &[Event<B>],
) -> Result<Event<B>> {
    check_image(queue, image, origin, region)?;
    let rect = image_rect(image, origin, region, host_row_pitch, host_slice_pitch).normalized()?;

    let row = rect.region[0] as usize;
    let mut data = Vec::with_capacity(row * (rect.region[1] * rect.region[2]) as usize);
    for z in 0..rect.region[2] {
        for y in 0..rect.region[1] {
            let at = (y * rect.host_row_pitch + z * rect.host_slice_pitch) as usize;
            let line = src
                .get(at..at + row)
                .ok_or_else(|| ClError::new(error::INVALID_VALUE, "host region out of bounds"))?;
            data.extend_from_slice(line);
        }
    }

    let event = enqueue(
        queue,
        CommandType::WriteImage,
        Box::new(WriteBufferRectPayload {
            buffer: image.clone(),
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

/// Copy a region between two images of the same format.
pub fn enqueue_copy_image<B: Backend>(
    queue: &OwnedRef<CommandQueue<B>>,
    src: &OwnedRef<Resource<B>>,
    dst: &OwnedRef<Resource<B>>,
    src_origin: [u64; 3],
    dst_origin: [u64; 3],
    region: [u64; 3],
    wait_list: &[Event<B>],
) -> Result<Event<B>> {
    check_image(queue, src, src_origin, region)?;
    check_image(queue, dst, dst_origin, region)?;
    if src.format() != dst.format() {
        return Err(ClError::new(
            error::INVALID_IMAGE_FORMAT_DESCRIPTOR,
            "image copies require matching formats",
        ));
    }
    let dst_desc = dst.image_desc().expect("validated");
    let element = u64::from(src.format().expect("validated").element_size());
    let mut rect = image_rect(src, src_origin, region, 0, 0);
    // The "host" half of the rect addresses the destination image.
    rect.host_origin = [dst_origin[0] * element, dst_origin[1], dst_origin[2]];
    rect.host_row_pitch = dst_desc.row_pitch;
    rect.host_slice_pitch = dst_desc.slice_pitch;

    enqueue(
        queue,
        CommandType::CopyImage,
        Box::new(CopyBufferRectPayload {
            src: src.clone(),
            dst: dst.clone(),
            rect,
        }),
        wait_list,
    )
}

/// Fill an image region with one element value, already encoded in the
/// image's format.
pub fn enqueue_fill_image<B: Backend>(
    queue: &OwnedRef<CommandQueue<B>>,
    image: &OwnedRef<Resource<B>>,
    element: &[u8],
    origin: [u64; 3],
    region: [u64; 3],
    wait_list: &[Event<B>],
) -> Result<Event<B>> {
    check_image(queue, image, origin, region)?;
    let format = image.format().expect("validated");
    if element.len() != format.element_size() as usize {
        return Err(ClError::new(
            error::INVALID_VALUE,
            "fill color size disagrees with the image format",
        ));
    }
    let desc = image.image_desc().expect("validated");
    let element_size = u64::from(format.element_size());

    // One fill per row keeps the pattern aligned regardless of pitch; a
    // region spanning whole slices collapses to a single fill.
    let mut rows: Vec<(u64, u64)> = Vec::new();
    let full_rows = origin[0] == 0 && region[0] == desc.width;
    if full_rows && origin[1] == 0 && region[1] == desc.height {
        rows.push((origin[2] * desc.slice_pitch, region[2] * desc.slice_pitch));
    } else {
        for z in 0..region[2] {
            for y in 0..region[1] {
                let offset = origin[0] * element_size
                    + (origin[1] + y) * desc.row_pitch
                    + (origin[2] + z) * desc.slice_pitch;
                rows.push((offset, region[0] * element_size));
            }
        }
    }

    enqueue(
        queue,
        CommandType::FillImage,
        Box::new(FillImagePayload {
            image: image.clone(),
            rows,
            pattern: element.to_vec(),
        }),
        wait_list,
    )
}

struct FillImagePayload<B: Backend> {
    image: OwnedRef<Resource<B>>,
    rows: Vec<(u64, u64)>,
    pattern: Vec<u8>,
}

impl<B: Backend> crate::task::TaskPayload<B> for FillImagePayload<B> {
    fn record(
        &mut self,
        native: &std::sync::Arc<crate::device::NativeDevice<B>>,
        ctx: &mut rocl_engine::ImmediateContext<B>,
    ) -> Result<()> {
        let (gpu, extra) = self.image.ensure_on_device(native, ctx)?;
        for &(offset, len) in &self.rows {
            ctx.fill_buffer(&gpu, extra + offset, len, &self.pattern)?;
        }
        Ok(())
    }
}
