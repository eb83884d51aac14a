//! Devices and their per-context native API state.

use crate::cache::ShaderCache;
use crate::error::{self, ClError, Result};
use crate::platform::{Platform, TaskPoolLock};
use crate::refs::InternalRef;
use crate::scheduler::{Priority, Scheduler, SchedulerTask, SchedulingMode};
use crate::task::Task;

use rocl_engine::{DeviceResources, DeviceShared, EngineOptions, ImmediateContext};
use rocl_hal::{Adapter as _, AdapterInfo, Backend, Features, Limits};

use log::{debug, error, warn};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

pub const DEVICE_TYPE_DEFAULT: u64 = 1 << 0;
pub const DEVICE_TYPE_CPU: u64 = 1 << 1;
pub const DEVICE_TYPE_GPU: u64 = 1 << 2;
pub const DEVICE_TYPE_ACCELERATOR: u64 = 1 << 3;
pub const DEVICE_TYPE_ALL: u64 = 0xffff_ffff;

/// Device attribute report, the `clGetDeviceInfo` surface in struct form.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub device_type: u64,
    pub name: String,
    pub vendor_id: u32,
    pub max_compute_units: u32,
    pub max_work_item_dimensions: u32,
    pub max_work_item_sizes: [usize; 3],
    pub max_work_group_size: usize,
    pub max_mem_alloc_size: u64,
    pub global_mem_size: u64,
    pub local_mem_size: u64,
    pub max_constant_buffer_size: u64,
    pub images_supported: bool,
    pub address_bits: u32,
    pub available: bool,
    pub compiler_available: bool,
    pub linker_available: bool,
    pub host_unified_memory: bool,
    pub printf_buffer_size: usize,
    pub preferred_work_group_size_multiple: usize,
    pub profiling_timer_resolution: usize,
    pub extensions: String,
    pub il_version: String,
    pub opencl_c_version: String,
}

/// One enumerated GPU (or the software rasterizer).
pub struct Device<B: Backend> {
    platform: Weak<Platform<B>>,
    adapter: Arc<B::Adapter>,
    info: AdapterInfo,
    features: Features,
    limits: Limits,
    is_default: bool,
    natives: Mutex<Vec<NativeEntry<B>>>,
}

struct NativeEntry<B: Backend> {
    native: Arc<NativeDevice<B>>,
    context_count: u32,
}

impl<B: Backend> Device<B> {
    pub(crate) fn new(
        platform: Weak<Platform<B>>,
        adapter: Arc<B::Adapter>,
        is_default: bool,
    ) -> Self {
        let info = adapter.info();
        let features = adapter.features();
        let limits = adapter.limits();
        Device {
            platform,
            adapter,
            info,
            features,
            limits,
            is_default,
            natives: Mutex::new(Vec::new()),
        }
    }

    pub fn platform(&self) -> Arc<Platform<B>> {
        self.platform.upgrade().expect("platform outlives devices")
    }

    pub fn adapter(&self) -> &Arc<B::Adapter> {
        &self.adapter
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn is_software(&self) -> bool {
        self.info.software
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn features(&self) -> &Features {
        &self.features
    }

    pub fn wave_sizes(&self) -> (u32, u32) {
        self.adapter.wave_sizes()
    }

    pub fn device_type(&self) -> u64 {
        let default = if self.is_default { DEVICE_TYPE_DEFAULT } else { 0 };
        if !self.features.images {
            DEVICE_TYPE_ACCELERATOR | default
        } else if self.info.software {
            DEVICE_TYPE_CPU | default
        } else {
            DEVICE_TYPE_GPU | default
        }
    }

    /// Images are exposed only when the adapter supports them.
    pub fn supports_images(&self) -> bool {
        self.features.images
    }

    pub fn global_mem_size(&self) -> u64 {
        self.adapter.global_memory_size()
    }

    pub fn info(&self) -> DeviceInfo {
        let global = self.global_mem_size();
        let extensions = concat!(
            "cl_khr_global_int32_base_atomics ",
            "cl_khr_global_int32_extended_atomics ",
            "cl_khr_local_int32_base_atomics ",
            "cl_khr_local_int32_extended_atomics ",
            "cl_khr_byte_addressable_store ",
            "cl_khr_il_program ",
            "cl_khr_gl_sharing ",
            "cl_khr_gl_event",
        );
        DeviceInfo {
            device_type: self.device_type(),
            name: self.info.name.clone(),
            vendor_id: self.info.vendor_id,
            max_compute_units: 1,
            max_work_item_dimensions: 3,
            max_work_item_sizes: [
                self.limits.max_group_dims[0] as usize,
                self.limits.max_group_dims[1] as usize,
                self.limits.max_group_dims[2] as usize,
            ],
            max_work_group_size: self.limits.max_threads_per_group as usize,
            max_mem_alloc_size: (global / 4).min(1 << 30),
            global_mem_size: global,
            local_mem_size: u64::from(self.limits.local_memory_size),
            max_constant_buffer_size: 64 * 1024,
            images_supported: self.supports_images(),
            address_bits: 64,
            available: true,
            compiler_available: true,
            linker_available: true,
            host_unified_memory: self.features.uma,
            printf_buffer_size: crate::printf::PRINTF_BUFFER_SIZE as usize,
            preferred_work_group_size_multiple: self.wave_sizes().1 as usize,
            profiling_timer_resolution: 80,
            extensions: extensions.to_string(),
            il_version: "SPIR-V_1.0".to_string(),
            opencl_c_version: "OpenCL C 1.2".to_string(),
        }
    }

    /// Acquire the native device for a new context, creating it on first
    /// use.
    pub(crate) fn init_native(&self) -> Result<Arc<NativeDevice<B>>> {
        let mut natives = self.natives.lock();
        if let Some(entry) = natives.first_mut() {
            entry.context_count += 1;
            return Ok(Arc::clone(&entry.native));
        }
        let platform = self.platform();
        let native = NativeDevice::new(&platform, &self.adapter, self.info.luid)?;
        natives.push(NativeEntry {
            native: Arc::clone(&native),
            context_count: 1,
        });
        Ok(native)
    }

    /// Release a context's hold; tears the native device down on the last
    /// one.
    pub(crate) fn release_native(&self, native: &Arc<NativeDevice<B>>) {
        let mut natives = self.natives.lock();
        if let Some(index) = natives
            .iter()
            .position(|e| Arc::ptr_eq(&e.native, native))
        {
            natives[index].context_count -= 1;
            if natives[index].context_count == 0 {
                let entry = natives.remove(index);
                drop(natives);
                entry.native.teardown();
            }
        }
    }

    pub(crate) fn flush_all_natives(&self, lock: &TaskPoolLock) {
        let natives: Vec<_> = self
            .natives
            .lock()
            .iter()
            .map(|e| Arc::clone(&e.native))
            .collect();
        for native in natives {
            native.flush(lock);
        }
    }
}

impl<B: Backend> std::fmt::Debug for Device<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Device").field("name", &self.info.name).finish()
    }
}

/// The per-(context, device) native API state: the immediate context, the
/// completion worker that records ready tasks, the shader cache, and the
/// submission being assembled.
pub struct NativeDevice<B: Backend> {
    platform: Weak<Platform<B>>,
    resources: Arc<DeviceResources<B>>,
    context: Mutex<ImmediateContext<B>>,
    completion: Scheduler,
    cache: ShaderCache,
    recording: Mutex<Vec<InternalRef<Task<B>>>>,
    pso_lock: Mutex<()>,
    timestamp_frequency: u64,
}

impl<B: Backend> NativeDevice<B> {
    fn new(
        platform: &Arc<Platform<B>>,
        adapter: &Arc<B::Adapter>,
        luid: u64,
    ) -> Result<Arc<Self>> {
        let gpu = adapter.open()?;
        let shared = Arc::new(DeviceShared {
            device: gpu.device,
            queue: gpu.queue,
            adapter: Arc::clone(adapter),
            limits: adapter.limits(),
        });
        let resources = Arc::new(DeviceResources::new(shared, EngineOptions::default()));
        let context = ImmediateContext::new(Arc::clone(&resources))?;

        let completion = Scheduler::new("rocl-completion");
        completion.set_scheduling_mode(SchedulingMode::new(1, Priority::Normal));

        let cache = ShaderCache::new(
            platform.cache_dir().cloned(),
            luid,
            platform.compiler().version_for_cache(),
        );

        let timestamp_frequency = adapter.timestamp_frequency();

        Ok(Arc::new(NativeDevice {
            platform: Arc::downgrade(platform),
            resources,
            context: Mutex::new(context),
            completion,
            cache,
            recording: Mutex::new(Vec::new()),
            pso_lock: Mutex::new(()),
            timestamp_frequency,
        }))
    }

    pub fn platform(&self) -> Arc<Platform<B>> {
        self.platform.upgrade().expect("platform outlives native devices")
    }

    pub fn resources(&self) -> &Arc<DeviceResources<B>> {
        &self.resources
    }

    pub fn cache(&self) -> &ShaderCache {
        &self.cache
    }

    pub fn timestamp_frequency(&self) -> u64 {
        self.timestamp_frequency
    }

    /// Run `f` with the recording surface. Only the completion worker and
    /// teardown take this lock for long stretches.
    pub fn with_context<R>(&self, f: impl FnOnce(&mut ImmediateContext<B>) -> R) -> R {
        f(&mut self.context.lock())
    }

    /// Create a pipeline from signed bytecode. Serialized because driver
    /// PSO creation is expensive and the compile pool is wide.
    pub fn create_pipeline(&self, bytecode: &[u8]) -> Result<Arc<B::PipelineState>> {
        let _guard = self.pso_lock.lock();
        let shared = &self.resources.shared;
        rocl_hal::Device::create_compute_pipeline(&shared.device, bytecode)
            .map(Arc::new)
            .map_err(|e| ClError::new(error::OUT_OF_RESOURCES, e.to_string()))
    }

    /// Move a task from Queued to Submitted; if its dependencies are
    /// already satisfied it becomes Ready, otherwise any still-queued
    /// dependencies get their queues flushed so they can make progress.
    pub fn submit_task(&self, task: &InternalRef<Task<B>>, lock: &TaskPoolLock) -> Result<()> {
        task.submit(lock);

        if task.has_pending_dependencies(lock) {
            for queue in task.queued_dependency_queues(lock) {
                // Recursive flushes are bounded: each dependency was
                // removed from its queue before its own submit, so a cycle
                // ends at an already-empty queue.
                queue.flush(lock, false)?;
            }
        } else {
            self.ready_task(task.clone(), lock);
        }
        Ok(())
    }

    /// Append a dependency-free task to the recording submission.
    pub fn ready_task(&self, task: InternalRef<Task<B>>, lock: &TaskPoolLock) {
        task.migrate_resources(lock);
        task.mark_ready(lock);
        self.recording.lock().push(task);
    }

    /// Post the recording submission to the completion worker.
    pub fn flush(self: &Arc<Self>, _lock: &TaskPoolLock) {
        let tasks: Vec<InternalRef<Task<B>>> = {
            let mut recording = self.recording.lock();
            if recording.is_empty() {
                return;
            }
            std::mem::take(&mut *recording)
        };
        let this = Arc::clone(self);
        self.completion.queue_task(SchedulerTask::new(move || {
            this.execute_tasks(tasks);
        }));
    }

    fn execute_tasks(self: &Arc<Self>, mut tasks: Vec<InternalRef<Task<B>>>) {
        let platform = self.platform();

        let mut failed_at = None;
        for (index, task) in tasks.iter().enumerate() {
            let result = {
                let mut context = self.context.lock();
                task.record(&mut context)
            };
            match result {
                Ok(()) => {
                    // Between tasks is a safe point to let the command-list
                    // heuristics kick work off early.
                    if let Err(err) = self.context.lock().flush_if_needed() {
                        warn!("opportunistic flush failed: {}", err);
                    }
                    let lock = platform.task_pool_lock();
                    task.started(&lock);
                }
                Err(err) => {
                    error!("task record failed: {}", err);
                    let lock = platform.task_pool_lock();
                    if task.status_code() > 0 {
                        let code = if err.code < 0 { err.code } else { error::OUT_OF_RESOURCES };
                        task.complete(code, &lock, None);
                    }
                    for rest in &tasks[index + 1..] {
                        rest.complete(
                            error::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST,
                            &lock,
                            None,
                        );
                    }
                    failed_at = Some(index);
                    break;
                }
            }
        }
        if let Some(index) = failed_at {
            tasks.truncate(index);
        }

        let wait_result = {
            let mut context = self.context.lock();
            context.wait_for_completion()
        };

        let lock = platform.task_pool_lock();
        match wait_result {
            Ok(()) => {
                let mut context = self.context.lock();
                for task in &tasks {
                    task.complete(error::SUCCESS, &lock, Some(&mut context));
                }
            }
            Err(err) => {
                // Fence never advanced; everything outstanding dies.
                warn!("device wait failed: {}", err);
                for task in &tasks {
                    task.complete(error::OUT_OF_RESOURCES, &lock, None);
                }
            }
        }

        // Completions may have unblocked tasks on other queues; go look
        // for more work to launch.
        platform.flush_all_devices(&lock);
    }

    /// Block until the GPU has drained everything submitted so far.
    pub fn wait_idle(&self) {
        if let Err(err) = self.context.lock().wait_for_completion() {
            warn!("wait_idle failed: {}", err);
        }
    }

    fn teardown(&self) {
        debug!("native device teardown");
        self.completion.shutdown();
        self.wait_idle();
        self.resources.drain_deferred();
    }
}
