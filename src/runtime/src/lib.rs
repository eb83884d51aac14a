//! An OpenCL 1.2 compute runtime layered on an explicit, D3D12-class
//! native GPU API.
//!
//! The externally visible surface mirrors the OpenCL object model:
//! platforms, devices, contexts, command queues, memory objects, programs,
//! kernels, and events. Underneath, enqueued work flows through a task
//! graph into per-device recording workers, which drive the
//! [`rocl_engine`] immediate context against whichever [`rocl_hal`]
//! backend the platform was created with.
//!
//! Out of scope by design: shared virtual memory, device-side queues,
//! pipes, native kernels, sub-groups, and device fission all fail with
//! `INVALID_OPERATION`.

pub mod cache;
pub mod compiler;
pub mod context;
pub mod device;
pub mod error;
pub mod image_tasks;
pub mod kernel;
pub mod launch;
pub mod mem_tasks;
pub mod platform;
pub mod printf;
pub mod program;
pub mod queue;
pub mod refs;
pub mod resource;
pub mod sampler;
pub mod scheduler;
pub mod sync;
pub mod task;

mod profiling;

pub use crate::context::Context;
pub use crate::device::{Device, DeviceInfo};
pub use crate::error::{ClError, Result, StatusCode};
pub use crate::image_tasks::{
    enqueue_copy_image, enqueue_fill_image, enqueue_read_image, enqueue_write_image,
};
pub use crate::kernel::{ArgValue, Kernel};
pub use crate::launch::{enqueue_nd_range_kernel, enqueue_task_kernel};
pub use crate::mem_tasks::{
    enqueue_barrier, enqueue_copy_buffer, enqueue_copy_buffer_rect, enqueue_fill_buffer,
    enqueue_map_buffer, enqueue_marker, enqueue_migrate_mem_objects, enqueue_read_buffer,
    enqueue_read_buffer_rect, enqueue_unmap, enqueue_write_buffer, enqueue_write_buffer_rect,
    read_buffer_blocking, BufferRect,
};
pub use crate::platform::{Platform, PlatformOptions, TaskPoolLock};
pub use crate::program::{BinaryType, BuildStatus, Program};
pub use crate::queue::{CommandQueue, QueueProperties};
pub use crate::refs::{InternalRef, OwnedRef};
pub use crate::resource::{
    ChannelOrder, ChannelType, ImageFormat, MapFlags, MemFlags, MigrationFlags, Resource,
    ResourceKind,
};
pub use crate::sampler::Sampler;
pub use crate::task::{
    set_user_event_status, wait_for_events, CommandType, Event, ProfilingInfo, Task,
};

use rocl_hal::Backend;

/// Explicitly unsupported entry points. Each returns `INVALID_OPERATION`
/// so callers probing for the features fail cleanly.
pub mod unsupported {
    use crate::context::Context;
    use crate::error::{Result, INVALID_OPERATION};
    use crate::refs::OwnedRef;
    use rocl_hal::Backend;

    /// Shared virtual memory allocation.
    pub fn svm_alloc<B: Backend>(context: &OwnedRef<Context<B>>, _size: u64) -> Result<*mut u8> {
        Err(context.report_error("SVM is not supported", INVALID_OPERATION))
    }

    /// Device-side command queues.
    pub fn create_device_queue<B: Backend>(context: &OwnedRef<Context<B>>) -> Result<()> {
        Err(context.report_error("device queues are not supported", INVALID_OPERATION))
    }

    /// Pipe memory objects.
    pub fn create_pipe<B: Backend>(context: &OwnedRef<Context<B>>) -> Result<()> {
        Err(context.report_error("pipes are not supported", INVALID_OPERATION))
    }

    /// Native (host-function) kernel enqueue.
    pub fn enqueue_native_kernel<B: Backend>(context: &OwnedRef<Context<B>>) -> Result<()> {
        Err(context.report_error("native kernels are not supported", INVALID_OPERATION))
    }

    /// Device fission.
    pub fn create_sub_devices<B: Backend>(context: &OwnedRef<Context<B>>) -> Result<()> {
        Err(context.report_error("device fission is not supported", INVALID_OPERATION))
    }
}

/// Convenience: create a context over every device of the platform.
pub fn create_default_context<B: Backend>(
    platform: &std::sync::Arc<Platform<B>>,
) -> Result<OwnedRef<Context<B>>> {
    let devices = platform.devices().to_vec();
    Context::create(platform, &devices, Vec::new(), None)
}
