//! NDRange kernel launches: local-size selection, dispatch tiling,
//! argument packing, specialization, and the record step.

use crate::compiler::{ArgBinding, ArgConfig, KernelConfig, PrintfInfo, WorkProperties};
use crate::error::{self, ClError, Result, StatusCode};
use crate::kernel::{BoundArg, Kernel};
use crate::mem_tasks::enqueue;
use crate::printf::{process_printf_buffer, PRINTF_BUFFER_SIZE};
use crate::program::{Program, SpecKey, SpecValue};
use crate::queue::CommandQueue;
use crate::refs::OwnedRef;
use crate::resource::{MemFlags, Resource};
use crate::sampler::Sampler;
use crate::sync::Promise;
use crate::task::{CommandType, Event, NullPayload, TaskPayload};
use crate::device::NativeDevice;

use rocl_engine::{CpuSlot, GpuBuffer, ImmediateContext, TransitionFlags};
use rocl_hal::{Backend, DescriptorKind, ResourceState, TableKind};

use log::debug;
use std::io::Write as _;
use std::sync::Arc;

// No device has a SIMD wave wider than 128.
const PRIMES: [u16; 30] = [
    2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89,
    97, 101, 107, 109, 113, 127,
];

struct LaunchShape {
    dispatch: [u32; 3],
    local: [u16; 3],
}

// Choose thread-group sizes for a launch that specified none: greedily move
// prime factors of the dispatch count into the group size, front dimension
// first, aiming inside the device's [min_wave, max_wave] window without
// blowing the per-dimension or per-group caps, and without leaving a
// dispatch count that cannot fit a single-iteration plan when it could.
fn choose_local_size(
    mut dispatch: [u32; 3],
    work_dim: u32,
    max_dims: [u16; 3],
    max_threads: u32,
    max_groups: u32,
    wave_sizes: (u32, u32),
) -> LaunchShape {
    let mut local = [1u16; 3];
    let (min_wave, max_wave) = wave_sizes;
    let mut threads_in_group = 1u32;
    let mut progress_index = [0usize; 3];

    let mut progress = true;
    'outer: while progress {
        progress = false;
        for dim in 0..work_dim as usize {
            // Find the next factor that divides this dimension's count.
            loop {
                if progress_index[dim] >= PRIMES.len() {
                    break;
                }
                let factor = u32::from(PRIMES[progress_index[dim]]);
                if dispatch[dim] < factor
                    // Overshoot the wave max only while still under the
                    // minimum and only if it reduces dispatch iterations.
                    || (threads_in_group * factor > max_wave
                        && threads_in_group < min_wave
                        && dispatch[dim] <= max_groups)
                    || threads_in_group * factor > max_threads
                    || u32::from(local[dim]) * factor > u32::from(max_dims[dim])
                {
                    // No later factor can match either; dimension is done.
                    progress_index[dim] = PRIMES.len();
                    break;
                }
                if dispatch[dim] % factor == 0 {
                    break;
                }
                progress_index[dim] += 1;
            }
            if progress_index[dim] >= PRIMES.len() {
                continue;
            }

            let factor = u32::from(PRIMES[progress_index[dim]]);
            local[dim] = (u32::from(local[dim]) * factor) as u16;
            threads_in_group *= factor;
            dispatch[dim] /= factor;
            progress = true;

            if (threads_in_group == min_wave || threads_in_group > max_wave)
                && dispatch[dim] <= max_groups
            {
                break 'outer;
            }
        }
    }

    // Not even one full wave: when a leftover prime dimension fits inside a
    // group outright, absorb it.
    for dim in 0..work_dim as usize {
        if threads_in_group >= min_wave {
            break;
        }
        if dispatch[dim] > 1
            && dispatch[dim] <= max_threads
            && dispatch[dim] * threads_in_group <= max_threads
            && dispatch[dim] * u32::from(local[dim]) <= u32::from(max_dims[dim])
        {
            local[dim] = (u32::from(local[dim]) * dispatch[dim]) as u16;
            threads_in_group *= dispatch[dim];
            dispatch[dim] = 1;
        }
    }

    LaunchShape { dispatch, local }
}

struct PrintfState<B: Backend> {
    buffer: OwnedRef<Resource<B>>,
    uav_id: u32,
    formats: Vec<PrintfInfo>,
    staging: Option<GpuBuffer<B>>,
}

struct ExecuteKernelPayload<B: Backend> {
    kernel: Option<OwnedRef<Kernel<B>>>,
    program: OwnedRef<Program<B>>,
    dispatch: [u32; 3],
    iterations: [u32; 3],
    max_groups: u32,
    cb_data: Vec<u8>,
    wp_offset: u64,
    chunk: u64,
    inputs_cbv: u32,
    wp_cbv: u32,
    uav_args: Vec<Option<OwnedRef<Resource<B>>>>,
    srv_args: Vec<Option<OwnedRef<Resource<B>>>>,
    sampler_args: Vec<Option<OwnedRef<Sampler<B>>>>,
    // (cb cell offset, kernel arg index) for local pointers, patched with
    // the specialized groupshared offsets.
    local_cells: Vec<(u32, usize)>,
    printf: Option<PrintfState<B>>,
    specialized: Promise<std::result::Result<Arc<SpecValue<B>>, ClError>>,
    dynamic_cb: Option<(GpuBuffer<B>, u64)>,
    resources: Option<Arc<rocl_engine::DeviceResources<B>>>,
}

impl<B: Backend> TaskPayload<B> for ExecuteKernelPayload<B> {
    fn record(
        &mut self,
        native: &Arc<NativeDevice<B>>,
        ctx: &mut ImmediateContext<B>,
    ) -> Result<()> {
        // Specialization resolves on the compile pool; this worker sleeps
        // on the future, not under the platform lock.
        let spec = self.specialized.wait()?;

        // Local pointer args read their groupshared offset from the
        // constant buffer; only the specialized compile knows it.
        for &(cell, arg_index) in &self.local_cells {
            if let ArgBinding::Local { sharedmem_offset } =
                &spec.kernel.info.args[arg_index].binding
            {
                let at = cell as usize;
                self.cb_data[at..at + 4].copy_from_slice(&sharedmem_offset.to_le_bytes());
            }
        }

        let cb = ctx
            .resources
            .acquire_dynamic_cb(self.cb_data.len() as u64, ctx.completed_fence())?;
        ctx.write_staging(&cb, &self.cb_data)?;

        // Bind and transition every referenced resource.
        let mut uav_slots: Vec<Option<CpuSlot>> = Vec::with_capacity(self.uav_args.len());
        for resource in &self.uav_args {
            match resource {
                Some(resource) => {
                    let slot = resource.uav_slot(native, ctx)?;
                    let (buffer, _) = resource.ensure_on_device(native, ctx)?;
                    ctx.resources.transition(
                        &buffer,
                        ResourceState::UNORDERED_ACCESS,
                        TransitionFlags::empty(),
                    );
                    ctx.note_use(&buffer);
                    uav_slots.push(Some(slot));
                }
                None => uav_slots.push(None),
            }
        }
        if let Some(printf) = &self.printf {
            let slot = printf.buffer.uav_slot(native, ctx)?;
            let (buffer, _) = printf.buffer.ensure_on_device(native, ctx)?;
            ctx.resources.transition(
                &buffer,
                ResourceState::UNORDERED_ACCESS,
                TransitionFlags::empty(),
            );
            ctx.note_use(&buffer);
            uav_slots[printf.uav_id as usize] = Some(slot);
        }

        let mut srv_slots: Vec<Option<CpuSlot>> = Vec::with_capacity(self.srv_args.len());
        for resource in &self.srv_args {
            match resource {
                Some(resource) => {
                    let slot = resource.srv_slot(native, ctx)?;
                    let (buffer, _) = resource.ensure_on_device(native, ctx)?;
                    ctx.resources.transition(
                        &buffer,
                        ResourceState::NON_PIXEL_SHADER_RESOURCE,
                        TransitionFlags::empty(),
                    );
                    ctx.note_use(&buffer);
                    srv_slots.push(Some(slot));
                }
                None => srv_slots.push(None),
            }
        }

        let mut sampler_slots: Vec<Option<CpuSlot>> = Vec::with_capacity(self.sampler_args.len());
        for sampler in &self.sampler_args {
            match sampler {
                Some(sampler) => sampler_slots.push(Some(sampler.descriptor_slot(native, ctx)?)),
                None => sampler_slots.push(None),
            }
        }

        let uav_base = ctx.stage_table(DescriptorKind::View, &uav_slots)?;
        let srv_base = ctx.stage_table(DescriptorKind::View, &srv_slots)?;
        let sampler_base = ctx.stage_table(DescriptorKind::Sampler, &sampler_slots)?;

        ctx.set_pipeline(&spec.pso);
        ctx.set_root_table(TableKind::Uav, uav_base);
        ctx.set_root_table(TableKind::Srv, srv_base);
        ctx.set_root_table(TableKind::Sampler, sampler_base);

        // The sub-dispatch loop: each iteration rebinds the constant
        // buffers, with the work-properties view bumped to the record that
        // carries this tile's group id offset.
        let mut iteration = 0u64;
        for x in 0..self.iterations[0] {
            for y in 0..self.iterations[1] {
                for z in 0..self.iterations[2] {
                    let tile = [x, y, z];
                    let mut dims = [0u32; 3];
                    for dim in 0..3 {
                        let remaining =
                            self.dispatch[dim] - tile[dim] * self.max_groups;
                        dims[dim] = remaining.min(self.max_groups);
                    }

                    ctx.set_root_cbv(self.inputs_cbv, &cb, 0);
                    ctx.set_root_cbv(
                        self.wp_cbv,
                        &cb,
                        self.wp_offset + iteration * self.chunk,
                    );
                    ctx.dispatch(dims[0], dims[1], dims[2]);
                    iteration += 1;
                }
            }
        }

        if let Some(printf) = &mut self.printf {
            let (buffer, extra) = printf.buffer.ensure_on_device(native, ctx)?;
            printf.staging =
                Some(ctx.copy_to_readback(&buffer, extra, u64::from(PRINTF_BUFFER_SIZE))?);
        }

        self.dynamic_cb = Some((cb, ctx.current_list_id()));
        self.resources = Some(Arc::clone(&ctx.resources));
        Ok(())
    }

    fn on_complete(&mut self, status: StatusCode, mut ctx: Option<&mut ImmediateContext<B>>) {
        if let Some(printf) = &mut self.printf {
            if let Some(staging) = printf.staging.take() {
                if let Some(ctx) = ctx.as_deref_mut() {
                    if status == error::SUCCESS {
                        if let Ok(bytes) = ctx.read_staging(&staging) {
                            let stdout = std::io::stdout();
                            let mut out = stdout.lock();
                            let _ = process_printf_buffer(&bytes, &printf.formats, &mut out);
                            let _ = out.flush();
                        }
                    }
                    ctx.resources.destroy_buffer(staging);
                }
            }
        }

        if let Some((cb, fence)) = self.dynamic_cb.take() {
            if let Some(resources) = &self.resources {
                resources.release_dynamic_cb(cb, fence);
            }
        }

        // Launches pin their kernel (and through it the program) only
        // until completion.
        self.kernel = None;
        let _ = &self.program;
    }
}

/// Enqueue an NDRange launch.
pub fn enqueue_nd_range_kernel<B: Backend>(
    queue: &OwnedRef<CommandQueue<B>>,
    kernel: &OwnedRef<Kernel<B>>,
    work_dim: u32,
    global_offset: Option<&[u64]>,
    global_size: &[u64],
    local_size: Option<&[u64]>,
    wait_list: &[Event<B>],
) -> Result<Event<B>> {
    let context = queue.context();
    if !std::ptr::eq(
        kernel.program().context().as_raw(),
        context.as_raw(),
    ) {
        return Err(ClError::new(
            error::INVALID_CONTEXT,
            "kernel was not created on the queue's context",
        ));
    }
    if work_dim == 0 || work_dim > 3 {
        return Err(ClError::new(
            error::INVALID_WORK_DIMENSION,
            "work_dim must be between 1 and 3",
        ));
    }
    if global_size.len() < work_dim as usize {
        return Err(ClError::new(
            error::INVALID_GLOBAL_WORK_SIZE,
            "global_work_size must cover work_dim dimensions",
        ));
    }
    if !kernel.all_args_set() {
        return Err(ClError::new(
            error::INVALID_KERNEL_ARGS,
            "kernel has unset arguments",
        ));
    }

    let device = queue.device().clone();
    let device_key = device.as_raw() as usize;
    let program = kernel.program().to_owned();
    if program.kernel_data(device_key, kernel.name()).is_none() {
        return Err(ClError::new(
            error::INVALID_PROGRAM_EXECUTABLE,
            "program is not built for the queue's device",
        ));
    }

    let mut offsets = [0u32; 3];
    if let Some(global_offset) = global_offset {
        for dim in 0..work_dim as usize {
            let end = global_offset[dim]
                .checked_add(global_size[dim])
                .unwrap_or(u64::MAX);
            if end > u64::from(u32::MAX) {
                return Err(ClError::new(
                    error::INVALID_GLOBAL_OFFSET,
                    "global offset plus size exceeds the addressable range",
                ));
            }
            offsets[dim] = global_offset[dim] as u32;
        }
    }

    let limits = *device.limits();
    let max_dims = [
        limits.max_group_dims[0].min(u32::from(u16::MAX)) as u16,
        limits.max_group_dims[1].min(u32::from(u16::MAX)) as u16,
        limits.max_group_dims[2].min(u32::from(u16::MAX)) as u16,
    ];
    let required = kernel.required_work_group_size();

    let mut local = [1u16; 3];
    for dim in 0..work_dim as usize {
        if let Some(user) = local_size {
            if user[dim] > u64::from(u16::MAX) {
                return Err(ClError::new(
                    error::INVALID_WORK_GROUP_SIZE,
                    "local_work_size is too large",
                ));
            }
        }
        local[dim] = match (local_size, required) {
            (Some(user), Some(required)) => {
                if u64::from(required[dim]) != user[dim] {
                    return Err(ClError::new(
                        error::INVALID_WORK_GROUP_SIZE,
                        "local_work_size disagrees with the kernel's required size",
                    ));
                }
                required[dim]
            }
            (Some(user), None) => user[dim] as u16,
            (None, Some(required)) => required[dim],
            (None, None) => 1,
        };
        if local[dim] == 0 {
            return Err(ClError::new(
                error::INVALID_WORK_GROUP_SIZE,
                "local_work_size contains a zero",
            ));
        }
        if global_size[dim] % u64::from(local[dim]) != 0 {
            return Err(ClError::new(
                error::INVALID_WORK_GROUP_SIZE,
                "local_work_size must evenly divide global_work_size",
            ));
        }
        if local[dim] > max_dims[dim] {
            return Err(ClError::new(
                error::INVALID_WORK_ITEM_SIZE,
                "local_work_size exceeds a dimension cap",
            ));
        }
    }

    let mut dispatch = [1u32; 3];
    for dim in 0..work_dim as usize {
        let groups = global_size[dim] / u64::from(local[dim]);
        if groups > u64::from(u32::MAX) {
            return Err(ClError::new(
                error::INVALID_GLOBAL_WORK_SIZE,
                "global_work_size is too large",
            ));
        }
        dispatch[dim] = groups as u32;
    }

    let shape = if required.is_some() || local_size.is_some() {
        let product = u64::from(local[0]) * u64::from(local[1]) * u64::from(local[2]);
        if product > u64::from(limits.max_threads_per_group) {
            return Err(ClError::new(
                error::INVALID_WORK_GROUP_SIZE,
                "local_work_size exceeds the threads-per-group cap",
            ));
        }
        LaunchShape { dispatch, local }
    } else {
        choose_local_size(
            dispatch,
            work_dim,
            max_dims,
            limits.max_threads_per_group,
            limits.max_dispatch_groups_per_dim,
            device.wave_sizes(),
        )
    };

    if shape.dispatch.contains(&0) {
        // Nothing to launch; the event must still behave like a launch.
        return enqueue(
            queue,
            CommandType::NdRangeKernel,
            Box::new(NullPayload),
            wait_list,
        );
    }

    let payload = prepare_launch(queue, kernel, &program, work_dim, offsets, shape)?;
    enqueue(queue, CommandType::NdRangeKernel, payload, wait_list)
}

fn prepare_launch<B: Backend>(
    queue: &OwnedRef<CommandQueue<B>>,
    kernel: &OwnedRef<Kernel<B>>,
    program: &OwnedRef<Program<B>>,
    work_dim: u32,
    offsets: [u32; 3],
    shape: LaunchShape,
) -> Result<Box<dyn TaskPayload<B>>> {
    let device = queue.device();
    let device_key = device.as_raw() as usize;
    let native = queue.native().clone();
    let context = queue.context().to_owned();
    let platform = context.platform().clone();
    let compiler = platform.compiler().clone();
    let limits = *device.limits();
    let max_groups = limits.max_dispatch_groups_per_dim;

    let data = program
        .kernel_data(device_key, kernel.name())
        .expect("checked by caller");
    let meta = &data.generic.info;

    let iterations = [
        (shape.dispatch[0] - 1) / max_groups + 1,
        (shape.dispatch[1] - 1) / max_groups + 1,
        (shape.dispatch[2] - 1) / max_groups + 1,
    ];
    let iteration_count = u64::from(iterations[0]) * u64::from(iterations[1]) * u64::from(iterations[2]);

    let chunk = compiler.work_properties_chunk_size() as u64;
    let wp_offset = align_up(u64::from(meta.kernel_inputs_buf_size), limits.cb_alignment);
    let mut cb_data = vec![0u8; (wp_offset + chunk * iteration_count) as usize];

    // Argument cells, binding lists, and the specialization shape all come
    // from the same walk over the bound arguments.
    let mut uav_args: Vec<Option<OwnedRef<Resource<B>>>> =
        (0..meta.num_uavs).map(|_| None).collect();
    let mut srv_args: Vec<Option<OwnedRef<Resource<B>>>> =
        (0..meta.num_srvs).map(|_| None).collect();
    let mut sampler_args: Vec<Option<OwnedRef<Sampler<B>>>> =
        (0..meta.num_samplers).map(|_| None).collect();
    let mut local_cells = Vec::new();
    let mut arg_configs = Vec::with_capacity(meta.args.len());

    {
        let bound = kernel.args.lock();
        for (index, (arg_meta, bound_arg)) in meta.args.iter().zip(bound.iter()).enumerate() {
            let cell = arg_meta.offset as usize;
            match (&arg_meta.binding, bound_arg) {
                (ArgBinding::None, BoundArg::Bytes(bytes)) => {
                    cb_data[cell..cell + bytes.len()].copy_from_slice(bytes);
                    arg_configs.push(ArgConfig::None);
                }
                (ArgBinding::Memory { buffer_id }, BoundArg::Buffer(resource)) => {
                    cb_data[cell..cell + 4].copy_from_slice(&buffer_id.to_le_bytes());
                    if let Some(resource) = resource {
                        uav_args[*buffer_id as usize] = Some(resource.clone());
                    }
                    arg_configs.push(ArgConfig::None);
                }
                (ArgBinding::Image { buffer_ids, used }, BoundArg::Buffer(resource)) => {
                    cb_data[cell..cell + 4].copy_from_slice(&buffer_ids[0].to_le_bytes());
                    if let Some(resource) = resource {
                        for plane in 0..*used as usize {
                            let id = buffer_ids[plane];
                            let writable = resource.flags.intersects(
                                MemFlags::READ_WRITE | MemFlags::WRITE_ONLY,
                            );
                            if writable {
                                uav_args[id as usize] = Some(resource.clone());
                            } else {
                                srv_args[id as usize] = Some(resource.clone());
                            }
                        }
                    }
                    arg_configs.push(ArgConfig::None);
                }
                (ArgBinding::Sampler { sampler_id }, BoundArg::Sampler(sampler)) => {
                    sampler_args[*sampler_id as usize] = Some(sampler.clone());
                    arg_configs.push(ArgConfig::Sampler {
                        normalized_coords: sampler.desc().normalized_coords,
                        linear_filtering: sampler.desc().filter
                            == rocl_hal::FilterMode::Linear,
                        addressing_mode: sampler.addressing_mode_bits(),
                    });
                }
                (ArgBinding::Local { .. }, BoundArg::Local(size)) => {
                    local_cells.push((arg_meta.offset, index));
                    arg_configs.push(ArgConfig::Local { size: *size as u32 });
                }
                _ => {
                    return Err(ClError::new(
                        error::INVALID_KERNEL_ARGS,
                        "bound argument disagrees with kernel metadata",
                    ));
                }
            }
        }
    }

    // One work-properties record per sub-dispatch, in loop order.
    let mut props = WorkProperties {
        global_offset: offsets,
        work_dim,
        group_count_total: shape.dispatch,
        group_id_offset: [0; 3],
    };
    let mut cursor = wp_offset as usize;
    for x in 0..iterations[0] {
        for y in 0..iterations[1] {
            for z in 0..iterations[2] {
                props.group_id_offset = [x * max_groups, y * max_groups, z * max_groups];
                compiler
                    .copy_work_properties(&mut cb_data[cursor..cursor + chunk as usize], &props);
                cursor += chunk as usize;
            }
        }
    }

    // Printf buffer: header {next_write_offset = 8, total_size}.
    let printf = match meta.printf_uav_id {
        Some(uav_id) => {
            let mut initial = vec![0u8; PRINTF_BUFFER_SIZE as usize];
            initial[0..4].copy_from_slice(&8u32.to_le_bytes());
            initial[4..8].copy_from_slice(&PRINTF_BUFFER_SIZE.to_le_bytes());
            let buffer = Resource::create_buffer(
                &context,
                MemFlags::READ_WRITE | MemFlags::ALLOC_HOST_PTR | MemFlags::COPY_HOST_PTR,
                u64::from(PRINTF_BUFFER_SIZE),
                Some(&initial),
            )?;
            Some(PrintfState {
                buffer,
                uav_id,
                formats: meta.printfs.clone(),
                staging: None,
            })
        }
        None => None,
    };

    // Specialize for this launch shape, through the cache.
    let config = KernelConfig {
        local_size: shape.local,
        args: arg_configs,
        lower_int64: true,
        lower_int16: !device.features().int16_native,
        support_global_work_offsets: offsets.iter().any(|&o| o != 0),
        support_work_group_offsets: iteration_count != 1,
        shader_model: device.features().shader_model,
    };
    let key = SpecKey::new(&native, &config);
    let promise: Promise<std::result::Result<Arc<SpecValue<B>>, ClError>> = Promise::new();

    if let Some(existing) = program.find_specialization(device_key, kernel.name(), &key) {
        promise.set(Ok(existing));
    } else {
        debug!("queueing specialization for kernel '{}'", kernel.name());
        let job_promise = promise.clone();
        let job_program = program.clone();
        let job_native = Arc::clone(&native);
        let name = kernel.name().to_string();
        let validator = platform.validator().clone();
        let job_compiler = compiler.clone();
        let cancel_promise = promise.clone();
        let cancel = move || {
            // A discarded job must still wake the recording worker.
            cancel_promise.set(Err(ClError::new(
                error::OUT_OF_RESOURCES,
                "specialization cancelled",
            )));
        };
        platform.queue_program_op_cancellable(move || {
            let result = (|| -> std::result::Result<Arc<SpecValue<B>>, String> {
                let il = job_program
                    .il_for_device(device_key)
                    .ok_or_else(|| "program lost its intermediate code".to_string())?;
                let mut specialized =
                    job_compiler.get_kernel(&name, &*il, Some(&config), None)?;
                validator.validate_inplace(&mut specialized.bytecode)?;
                let pso = job_native
                    .create_pipeline(&specialized.bytecode)
                    .map_err(|e| e.message)?;
                job_program
                    .store_specialization(
                        device_key,
                        &name,
                        key,
                        SpecValue {
                            kernel: specialized,
                            pso,
                        },
                    )
                    .ok_or_else(|| "kernel disappeared during specialization".to_string())
            })();
            job_promise.set(
                result.map_err(|message| ClError::new(error::BUILD_PROGRAM_FAILURE, message)),
            );
        }, cancel);
    }

    Ok(Box::new(ExecuteKernelPayload {
        kernel: Some(kernel.clone()),
        program: program.clone(),
        dispatch: shape.dispatch,
        iterations,
        max_groups,
        cb_data,
        wp_offset,
        chunk,
        inputs_cbv: meta.kernel_inputs_cbv_id,
        wp_cbv: meta.work_properties_cbv_id,
        uav_args,
        srv_args,
        sampler_args,
        local_cells,
        printf,
        specialized: promise,
        dynamic_cb: None,
        resources: None,
    }))
}

fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) / alignment * alignment
}

/// Single-work-item convenience launch (`clEnqueueTask` semantics).
pub fn enqueue_task_kernel<B: Backend>(
    queue: &OwnedRef<CommandQueue<B>>,
    kernel: &OwnedRef<Kernel<B>>,
    wait_list: &[Event<B>],
) -> Result<Event<B>> {
    enqueue_nd_range_kernel(queue, kernel, 1, None, &[1], Some(&[1]), wait_list)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factors_into_wave_sized_groups() {
        let shape = choose_local_size([1024, 1, 1], 1, [1024, 1024, 64], 1024, 65535, (4, 64));
        let threads = u32::from(shape.local[0]) * u32::from(shape.local[1]) * u32::from(shape.local[2]);
        assert!(threads >= 4 && threads <= 64);
        assert_eq!(u64::from(shape.dispatch[0]) * u64::from(shape.local[0]), 1024);
    }

    #[test]
    fn small_launches_become_one_group() {
        let shape = choose_local_size([4, 1, 1], 1, [1024, 1024, 64], 1024, 65535, (4, 64));
        assert_eq!(shape.dispatch, [1, 1, 1]);
        assert_eq!(shape.local, [4, 1, 1]);
    }

    #[test]
    fn prime_remainder_is_absorbed_when_it_fits() {
        // 127 is prime and bigger than the max wave; with the dispatch
        // under the cap it stays a dispatch count; a small prime under the
        // group cap is absorbed instead.
        let shape = choose_local_size([131, 1, 1], 1, [1024, 1024, 64], 1024, 65535, (4, 64));
        assert_eq!(shape.dispatch, [1, 1, 1]);
        assert_eq!(shape.local, [131, 1, 1]);
    }

    #[test]
    fn never_exceeds_group_caps() {
        let shape = choose_local_size([512, 512, 1], 2, [1024, 1024, 64], 1024, 65535, (32, 64));
        let threads = u32::from(shape.local[0]) * u32::from(shape.local[1]);
        assert!(threads <= 1024);
        assert!(shape.local[0] <= 1024 && shape.local[1] <= 1024);
        assert_eq!(
            u64::from(shape.dispatch[0]) * u64::from(shape.local[0]),
            512
        );
        assert_eq!(
            u64::from(shape.dispatch[1]) * u64::from(shape.local[1]),
            512
        );
    }
}
