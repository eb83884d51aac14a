//! The platform singleton: device list, schedulers, compiler handles.

use crate::compiler::{Compiler, Validator};
use crate::device::Device;
use crate::error::{ClError, Result, INVALID_PLATFORM};
use crate::refs::OwnedRef;
use crate::scheduler::{Priority, Scheduler, SchedulerTask, SchedulingMode};

use rocl_hal::{Adapter as _, Backend, Instance as _};

use log::{debug, info};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, MutexGuard};
use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

/// Keep only the software rasterizer when set to `1`.
pub const ENV_FORCE_WARP: &str = "CLON12_FORCE_WARP";
/// Discard the software rasterizer when set to `1`.
pub const ENV_FORCE_HARDWARE: &str = "CLON12_FORCE_HARDWARE";

/// Proof that the global task-pool mutex is held. Every task-graph
/// mutation takes one of these by reference, which both serializes the
/// graph and documents the locking discipline in signatures.
pub struct TaskPoolLock<'a> {
    _guard: MutexGuard<'a, ()>,
}

/// Platform construction options.
#[derive(Clone, Debug, Default)]
pub struct PlatformOptions {
    /// Root of the on-disk shader cache; `None` disables caching.
    pub cache_dir: Option<PathBuf>,
}

/// The root object: owns the devices, the global task-pool lock, the
/// user-callback scheduler, and the compile/link scheduler.
pub struct Platform<B: Backend> {
    instance: B::Instance,
    devices: Vec<OwnedRef<Device<B>>>,
    task_mutex: Mutex<()>,
    callback_scheduler: Scheduler,
    compile_scheduler: Scheduler,
    compiler: Arc<dyn Compiler>,
    validator: Arc<dyn Validator>,
    options: PlatformOptions,
}

impl<B: Backend> Platform<B> {
    pub const PROFILE: &'static str = "FULL_PROFILE";
    pub const VERSION: &'static str = "OpenCL 1.2 rocl";
    pub const NAME: &'static str = "rocl";
    pub const VENDOR: &'static str = "rocl project";
    pub const EXTENSIONS: &'static str = "cl_khr_icd";

    pub fn new(
        instance: B::Instance,
        compiler: Arc<dyn Compiler>,
        validator: Arc<dyn Validator>,
        options: PlatformOptions,
    ) -> Arc<Self> {
        let force_warp = std::env::var(ENV_FORCE_WARP).map_or(false, |v| v == "1");
        let force_hardware = std::env::var(ENV_FORCE_HARDWARE).map_or(false, |v| v == "1");

        Arc::new_cyclic(|weak| {
            let mut adapters = instance.enumerate_adapters();
            adapters.retain(|adapter| {
                let software = adapter.info().software;
                if force_warp {
                    software
                } else if force_hardware {
                    !software
                } else {
                    true
                }
            });
            info!("platform created with {} device(s)", adapters.len());

            let devices: Vec<_> = adapters
                .into_iter()
                .enumerate()
                .map(|(index, adapter)| {
                    OwnedRef::new(Device::new(weak.clone(), Arc::new(adapter), index == 0))
                })
                .collect();

            let callback_scheduler = Scheduler::new("rocl-callback");
            callback_scheduler.set_scheduling_mode(SchedulingMode::new(1, Priority::Normal));
            let compile_scheduler = Scheduler::new("rocl-compile");
            compile_scheduler
                .set_scheduling_mode(SchedulingMode::new(num_cpus::get(), Priority::Normal));

            Platform {
                instance,
                devices,
                task_mutex: Mutex::new(()),
                callback_scheduler,
                compile_scheduler,
                compiler,
                validator,
                options,
            }
        })
    }

    pub fn instance(&self) -> &B::Instance {
        &self.instance
    }

    pub fn devices(&self) -> &[OwnedRef<Device<B>>] {
        &self.devices
    }

    /// Devices matching a CL device-type query mask.
    pub fn devices_of_type(&self, mask: u64) -> Vec<OwnedRef<Device<B>>> {
        self.devices
            .iter()
            .filter(|d| d.device_type() & mask != 0)
            .cloned()
            .collect()
    }

    /// Acquire the global task-pool lock.
    pub fn task_pool_lock(&self) -> TaskPoolLock {
        TaskPoolLock {
            _guard: self.task_mutex.lock(),
        }
    }

    /// Run a user callback on the callback worker so API calls never block
    /// on application code.
    pub fn queue_callback(&self, f: impl FnOnce() + Send + 'static) {
        self.callback_scheduler.queue_task(SchedulerTask::new(f));
    }

    /// Run a compile/link/specialize job on the compile pool.
    pub fn queue_program_op(&self, f: impl FnOnce() + Send + 'static) {
        self.compile_scheduler.queue_task(SchedulerTask::new(f));
    }

    /// Like [`Platform::queue_program_op`], with a cancellation callback
    /// invoked instead of the job when the pool discards it; waiters on
    /// the job's result must be unblocked from there.
    pub fn queue_program_op_cancellable(
        &self,
        f: impl FnOnce() + Send + 'static,
        cancel: impl FnOnce() + Send + 'static,
    ) {
        self.compile_scheduler
            .queue_task(SchedulerTask::with_cancel(f, cancel));
    }

    pub fn compiler(&self) -> &Arc<dyn Compiler> {
        &self.compiler
    }

    pub fn validator(&self) -> &Arc<dyn Validator> {
        &self.validator
    }

    pub fn cache_dir(&self) -> Option<&PathBuf> {
        self.options.cache_dir.as_ref()
    }

    /// Kick every device's recording submission to its completion worker.
    pub fn flush_all_devices(&self, lock: &TaskPoolLock) {
        for device in &self.devices {
            device.flush_all_natives(lock);
        }
    }

    /// Stop the background schedulers. Called when the embedder is done
    /// with the platform; contexts must already be released.
    pub fn teardown(&self) {
        debug!("platform teardown");
        self.compile_scheduler.shutdown();
        self.callback_scheduler.shutdown();
    }
}

// The process-wide platform, initialized lazily on first use and torn down
// explicitly. Stored type-erased so the runtime stays generic over the
// backend.
static GLOBAL_PLATFORM: OnceCell<Arc<dyn Any + Send + Sync>> = OnceCell::new();

impl<B: Backend> Platform<B> {
    /// Install `platform` as the process-wide platform. Fails if one is
    /// already installed.
    pub fn install_global(platform: Arc<Platform<B>>) -> Result<()> {
        GLOBAL_PLATFORM
            .set(platform)
            .map_err(|_| ClError::new(INVALID_PLATFORM, "global platform already installed"))
    }

    /// The process-wide platform, if installed with this backend type.
    pub fn global() -> Option<Arc<Platform<B>>> {
        GLOBAL_PLATFORM
            .get()
            .and_then(|any| Arc::downcast::<Platform<B>>(Arc::clone(any)).ok())
    }
}
