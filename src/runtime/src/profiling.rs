//! GPU timestamp plumbing for profiled tasks.

use crate::task::GpuTimestamps;

use rocl_engine::ImmediateContext;
use rocl_hal::{Backend, DeviceError, HeapKind};

/// Allocate a two-query timestamp heap plus the readback block the values
/// resolve into.
pub(crate) fn begin_gpu_timestamps<B: Backend>(
    ctx: &mut ImmediateContext<B>,
) -> Result<GpuTimestamps<B>, DeviceError> {
    let device = &ctx.resources.shared.device;
    let heap = rocl_hal::Device::create_query_heap(device, 2)?;
    let staging = ctx.resources.allocate_staging(HeapKind::Readback, 16, false)?;
    Ok(GpuTimestamps { heap, staging })
}

/// Read back `(start, end)` ticks once the GPU has passed the task's fence.
pub(crate) fn read_gpu_timestamps<B: Backend>(
    ctx: &mut ImmediateContext<B>,
    queries: &GpuTimestamps<B>,
) -> Option<(u64, u64)> {
    let bytes = ctx.read_staging(&queries.staging).ok()?;
    if bytes.len() < 16 {
        return None;
    }
    let mut start = [0u8; 8];
    let mut end = [0u8; 8];
    start.copy_from_slice(&bytes[0..8]);
    end.copy_from_slice(&bytes[8..16]);
    Some((u64::from_le_bytes(start), u64::from_le_bytes(end)))
}

/// Retire the staging block; the query heap dies with the value.
pub(crate) fn release_gpu_timestamps<B: Backend>(
    ctx: &mut ImmediateContext<B>,
    queries: GpuTimestamps<B>,
) {
    let GpuTimestamps { heap, staging } = queries;
    drop(heap);
    ctx.resources.destroy_buffer(staging);
}
