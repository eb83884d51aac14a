//! Command recording and synchronous execution.

use crate::device::{
    CommandAllocator, DescriptorData, DescriptorHeap, Fence, Memory, PipelineState, QueryHeap,
};
use crate::shader::{KernelBody, ShaderBlob, WorkProperties};
use crate::Backend;

use rocl_hal as hal;
use rocl_hal::{DeviceError, MemoryBarrier, TableKind};

use log::trace;
use std::time::Instant;

/// Whether an allocator currently backs an open list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandAllocatorState {
    Free,
    InUse,
}

#[derive(Clone, Debug, Default)]
struct Bindings {
    pipeline: Option<PipelineState>,
    view_heap: Option<DescriptorHeap>,
    sampler_heap: Option<DescriptorHeap>,
    uav_base: Option<u32>,
    srv_base: Option<u32>,
    sampler_base: Option<u32>,
    cbvs: Vec<Option<(Memory, u64)>>,
}

#[derive(Debug)]
enum Command {
    CopyBuffer {
        src: Memory,
        src_offset: u64,
        dst: Memory,
        dst_offset: u64,
        size: u64,
    },
    FillBuffer {
        dst: Memory,
        offset: u64,
        size: u64,
        pattern: Vec<u8>,
    },
    Dispatch {
        bindings: Bindings,
        groups: [u32; 3],
    },
    Timestamp {
        heap: QueryHeap,
        index: u32,
    },
    ResolveTimestamps {
        heap: QueryHeap,
        start: u32,
        count: u32,
        dst: Memory,
        dst_offset: u64,
    },
}

/// A recorded command buffer.
#[derive(Debug)]
pub struct CommandList {
    commands: Vec<Command>,
    bindings: Bindings,
    closed: bool,
}

impl CommandList {
    pub(crate) fn new(allocator: &CommandAllocator) -> Self {
        *allocator.state.lock() = CommandAllocatorState::InUse;
        CommandList {
            commands: Vec::new(),
            bindings: Bindings::default(),
            closed: false,
        }
    }

    fn set_cbv(&mut self, index: u32, binding: Option<(Memory, u64)>) {
        let index = index as usize;
        if self.bindings.cbvs.len() <= index {
            self.bindings.cbvs.resize(index + 1, None);
        }
        self.bindings.cbvs[index] = binding;
    }
}

impl hal::CommandList<Backend> for CommandList {
    fn reset(&mut self, allocator: &CommandAllocator) -> Result<(), DeviceError> {
        *allocator.state.lock() = CommandAllocatorState::InUse;
        self.commands.clear();
        self.bindings = Bindings::default();
        self.closed = false;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        debug_assert!(!self.closed, "command list closed twice");
        self.closed = true;
        Ok(())
    }

    fn set_descriptor_heaps(
        &mut self,
        view_heap: &DescriptorHeap,
        sampler_heap: Option<&DescriptorHeap>,
    ) {
        self.bindings.view_heap = Some(view_heap.clone());
        self.bindings.sampler_heap = sampler_heap.cloned();
    }

    fn resource_barrier(&mut self, _barriers: &[MemoryBarrier<Backend>]) {
        // Host memory needs no transitions; the records still validated the
        // state-tracking path above.
    }

    fn copy_buffer(
        &mut self,
        src: &Memory,
        src_offset: u64,
        dst: &Memory,
        dst_offset: u64,
        size: u64,
    ) {
        self.commands.push(Command::CopyBuffer {
            src: src.clone(),
            src_offset,
            dst: dst.clone(),
            dst_offset,
            size,
        });
    }

    fn fill_buffer(&mut self, dst: &Memory, offset: u64, size: u64, pattern: &[u8]) {
        self.commands.push(Command::FillBuffer {
            dst: dst.clone(),
            offset,
            size,
            pattern: pattern.to_vec(),
        });
    }

    fn set_pipeline(&mut self, pipeline: &PipelineState) {
        self.bindings.pipeline = Some(pipeline.clone());
    }

    fn set_root_table(&mut self, table: TableKind, base_slot: u32) {
        match table {
            TableKind::Uav => self.bindings.uav_base = Some(base_slot),
            TableKind::Srv => self.bindings.srv_base = Some(base_slot),
            TableKind::Sampler => self.bindings.sampler_base = Some(base_slot),
        }
    }

    fn set_root_cbv(&mut self, index: u32, memory: &Memory, offset: u64) {
        self.set_cbv(index, Some((memory.clone(), offset)));
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.commands.push(Command::Dispatch {
            bindings: self.bindings.clone(),
            groups: [x, y, z],
        });
    }

    fn end_timestamp(&mut self, heap: &QueryHeap, index: u32) {
        self.commands.push(Command::Timestamp {
            heap: heap.clone(),
            index,
        });
    }

    fn resolve_timestamps(
        &mut self,
        heap: &QueryHeap,
        start: u32,
        count: u32,
        dst: &Memory,
        dst_offset: u64,
    ) {
        self.commands.push(Command::ResolveTimestamps {
            heap: heap.clone(),
            start,
            count,
            dst: dst.clone(),
            dst_offset,
        });
    }
}

/// Synchronous execution queue.
#[derive(Debug)]
pub struct Queue {
    epoch: Instant,
}

impl Queue {
    pub(crate) fn new(epoch: Instant) -> Self {
        Queue { epoch }
    }

    fn now_ticks(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

impl hal::Queue<Backend> for Queue {
    fn execute(&self, lists: &[&CommandList]) {
        for list in lists {
            debug_assert!(list.closed, "executing an open command list");
            for command in &list.commands {
                run_command(self, command);
            }
        }
    }

    fn signal(&self, fence: &Fence, value: u64) {
        // Execution is synchronous, so the signal lands immediately.
        let mut current = fence.0.value.lock();
        debug_assert!(*current <= value);
        *current = value;
        fence.0.cv.notify_all();
    }

    fn clock_calibration(&self) -> (u64, u64) {
        let ticks = self.now_ticks();
        (ticks, ticks)
    }
}

fn run_command(queue: &Queue, command: &Command) {
    match command {
        Command::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        } => unsafe {
            // Raw-pointer memmove: source and destination may be disjoint
            // ranges of the same allocation.
            let src_ptr = src.0.bytes().as_ptr().add(*src_offset as usize);
            let dst_ptr = dst.0.bytes().as_mut_ptr().add(*dst_offset as usize);
            std::ptr::copy(src_ptr, dst_ptr, *size as usize);
        },
        Command::FillBuffer {
            dst,
            offset,
            size,
            pattern,
        } => unsafe {
            let bytes = dst.0.bytes();
            for i in 0..*size as usize {
                bytes[*offset as usize + i] = pattern[i % pattern.len()];
            }
        },
        Command::Dispatch { bindings, groups } => run_dispatch(bindings, *groups),
        Command::Timestamp { heap, index } => {
            heap.0.lock()[*index as usize] = queue.now_ticks();
        }
        Command::ResolveTimestamps {
            heap,
            start,
            count,
            dst,
            dst_offset,
        } => unsafe {
            let values = heap.0.lock();
            let bytes = dst.0.bytes();
            for i in 0..*count as usize {
                let value = values[*start as usize + i];
                let at = *dst_offset as usize + i * 8;
                bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
            }
        },
    }
}

struct BufferView {
    memory: Memory,
    offset: u64,
    size: u64,
}

impl BufferView {
    fn read_u32(&self, index: u64) -> u32 {
        let at = (self.offset + index * 4) as usize;
        unsafe {
            let bytes = self.memory.0.bytes();
            if at + 4 > (self.offset + self.size) as usize {
                return 0;
            }
            let mut quad = [0u8; 4];
            quad.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(quad)
        }
    }

    fn write_u32(&self, index: u64, value: u32) {
        let at = (self.offset + index * 4) as usize;
        unsafe {
            let bytes = self.memory.0.bytes();
            if at + 4 > (self.offset + self.size) as usize {
                return;
            }
            bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    fn read_bytes_at(&self, offset: u64, out: &mut [u8]) {
        let at = (self.offset + offset) as usize;
        unsafe {
            let bytes = self.memory.0.bytes();
            out.copy_from_slice(&bytes[at..at + out.len()]);
        }
    }
}

fn resolve_table_view(bindings: &Bindings, base: Option<u32>, id: u32) -> Option<BufferView> {
    let heap = bindings.view_heap.as_ref()?;
    let slot = base? + id;
    match heap.read(slot)? {
        DescriptorData::Buffer {
            memory,
            offset,
            size,
            ..
        } => Some(BufferView {
            memory,
            offset,
            size,
        }),
        DescriptorData::Sampler(_) => None,
    }
}

fn resolve_cbv(bindings: &Bindings, index: u32) -> Option<BufferView> {
    let (memory, offset) = bindings.cbvs.get(index as usize)?.clone()?;
    let size = memory.0.size - offset;
    Some(BufferView {
        memory,
        offset,
        size,
    })
}

fn run_dispatch(bindings: &Bindings, groups: [u32; 3]) {
    let pipeline = match &bindings.pipeline {
        Some(p) => p,
        None => return,
    };
    let blob: &ShaderBlob = pipeline.blob();

    let props = match resolve_cbv(bindings, blob.work_properties_cbv) {
        Some(view) => {
            let mut raw = [0u8; WorkProperties::SIZE];
            view.read_bytes_at(0, &mut raw);
            WorkProperties::from_bytes(&raw)
        }
        None => WorkProperties::default(),
    };
    let inputs = resolve_cbv(bindings, blob.inputs_cbv);
    let uav = |id: u32| resolve_table_view(bindings, bindings.uav_base, id);

    let local = [
        u32::from(blob.local_size[0].max(1)),
        u32::from(blob.local_size[1].max(1)),
        u32::from(blob.local_size[2].max(1)),
    ];
    trace!(
        "null dispatch: groups {:?} local {:?} offsets {:?}",
        groups,
        local,
        props.group_id_offset
    );

    let read_scalar_u32 = |arg: u32| -> u32 {
        let inputs = match &inputs {
            Some(view) => view,
            None => return 0,
        };
        let slot = &blob.args[arg as usize];
        let mut raw = [0u8; 4];
        inputs.read_bytes_at(u64::from(slot.offset), &mut raw);
        u32::from_le_bytes(raw)
    };

    // Only the x dimension carries data in the built-in bodies; y/z still
    // iterate so group id reconstruction is exercised.
    for gz in 0..groups[2] {
        for gy in 0..groups[1] {
            for gx in 0..groups[0] {
                let _ = (gy, gz);
                for lx in 0..local[0] {
                    let gid_x = u64::from(props.global_offset[0])
                        + u64::from(props.group_id_offset[0] + gx) * u64::from(local[0])
                        + u64::from(lx);
                    // The buffers are indexed by global id minus the global
                    // offset, matching `buf[get_global_id(0)]` kernels that
                    // are launched with a zero offset, and offset kernels
                    // that index the same way.
                    run_thread(blob, gid_x, &uav, &read_scalar_u32);
                }
            }
        }
    }
}

fn run_thread(
    blob: &ShaderBlob,
    gid_x: u64,
    uav: &dyn Fn(u32) -> Option<BufferView>,
    read_scalar_u32: &dyn Fn(u32) -> u32,
) {
    match blob.body {
        KernelBody::Nop => {}
        KernelBody::StoreGlobalId { dst_uav } => {
            if let Some(dst) = uav(dst_uav) {
                dst.write_u32(gid_x, gid_x as u32);
            }
        }
        KernelBody::AddU32 {
            a_uav,
            b_uav,
            dst_uav,
        } => {
            if let (Some(a), Some(b), Some(dst)) = (uav(a_uav), uav(b_uav), uav(dst_uav)) {
                let sum = a.read_u32(gid_x).wrapping_add(b.read_u32(gid_x));
                dst.write_u32(gid_x, sum);
            }
        }
        KernelBody::CopyU32 { src_uav, dst_uav } => {
            if let (Some(src), Some(dst)) = (uav(src_uav), uav(dst_uav)) {
                dst.write_u32(gid_x, src.read_u32(gid_x));
            }
        }
        KernelBody::ScaleU32 {
            src_uav,
            dst_uav,
            factor_arg,
        } => {
            if let (Some(src), Some(dst)) = (uav(src_uav), uav(dst_uav)) {
                let factor = read_scalar_u32(factor_arg);
                dst.write_u32(gid_x, src.read_u32(gid_x).wrapping_mul(factor));
            }
        }
        KernelBody::PrintfGlobalId { format_id } => {
            let printf = match blob.printf_uav.and_then(|id| uav(id)) {
                Some(view) => view,
                None => return,
            };
            // Header: { next_write_offset, total_size }.
            let next = printf.read_u32(0);
            let total = printf.read_u32(1);
            if u64::from(next) + 8 <= u64::from(total) {
                printf.write_u32(u64::from(next) / 4, format_id);
                printf.write_u32(u64::from(next) / 4 + 1, gid_x as u32);
                printf.write_u32(0, next + 8);
            }
        }
    }
}
