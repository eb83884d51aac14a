//! The in-flight command list and its bookkeeping.

use crate::pool::BoundedFencePool;
use crate::residency::ResidencySet;

use rocl_hal as hal;
use rocl_hal::{Backend, CommandList as _, DeviceError, Fence as _, Queue as _};

use log::warn;

// Heuristics for opportunistic flushing. Submitting early keeps the GPU
// busy, but only pays off while the application isn't reading back every
// submission anyway.
const MIN_COMMANDS_FOR_SUBMIT: u32 = 1000;
const MIN_DISPATCHES_FOR_SUBMIT: u32 = 512;
const MIN_FLUSHES_WITH_NO_READBACK: u32 = 50;

// Upload-heap memory referenced by an open command list cannot be recycled;
// cap how much a single list may pin before forcing a flush.
const MAX_UPLOAD_PER_COMMAND_LIST: u64 = 256 * 1024 * 1024;

const MAX_IN_FLIGHT_ALLOCATORS: usize = 1024;

/// Owns the one open command list of an immediate context, the allocator
/// pool backing it, and the monotonically increasing command-list id that
/// doubles as the fence value signaled at submission.
pub struct CommandListManager<B: Backend> {
    list: B::CommandList,
    allocator: Option<B::CommandAllocator>,
    allocator_pool: BoundedFencePool<B::CommandAllocator>,
    fence: B::Fence,
    /// Fence value the current list will signal; starts at 1.
    id: u64,
    pub residency_set: ResidencySet,
    num_commands: u32,
    num_dispatches: u32,
    upload_bytes: u64,
    flushes_with_no_readback: u32,
}

impl<B: Backend> CommandListManager<B> {
    pub fn new(device: &B::Device) -> Result<Self, DeviceError> {
        let allocator = hal::Device::create_command_allocator(device)?;
        let list = hal::Device::create_command_list(device, &allocator)?;
        let fence = hal::Device::create_fence(device, 0)?;
        let mut residency_set = ResidencySet::default();
        residency_set.open();
        Ok(CommandListManager {
            list,
            allocator: Some(allocator),
            allocator_pool: BoundedFencePool::new(MAX_IN_FLIGHT_ALLOCATORS),
            fence,
            id: 1,
            residency_set,
            num_commands: 0,
            num_dispatches: 0,
            upload_bytes: 0,
            flushes_with_no_readback: 0,
        })
    }

    /// Id of the open command list; also the fence value it will signal.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn completed_fence(&self) -> u64 {
        self.fence.completed()
    }

    pub fn has_commands(&self) -> bool {
        self.num_commands > 0
    }

    pub fn list_mut(&mut self) -> &mut B::CommandList {
        &mut self.list
    }

    pub fn command_added(&mut self) {
        self.num_commands += 1;
    }

    pub fn dispatch_added(&mut self) {
        self.num_commands += 1;
        self.num_dispatches += 1;
    }

    pub fn upload_allocated(&mut self, bytes: u64) {
        self.upload_bytes += bytes;
    }

    pub fn readback_initiated(&mut self) {
        self.flushes_with_no_readback = 0;
    }

    /// Whether the heuristics say this is a good moment to submit early.
    /// The caller performs the actual submission so it can run the full
    /// submit sequence.
    pub fn should_flush_opportunistically(&self) -> bool {
        let enough_commands = self.num_commands > MIN_COMMANDS_FOR_SUBMIT
            || self.num_dispatches > MIN_DISPATCHES_FOR_SUBMIT;
        let app_still_benefits = self.flushes_with_no_readback < MIN_FLUSHES_WITH_NO_READBACK;
        let too_much_upload = self.upload_bytes > MAX_UPLOAD_PER_COMMAND_LIST;
        if (enough_commands && app_still_benefits) || too_much_upload {
            // Only pile on if the GPU has drained everything we've sent.
            return self.fence.completed() == self.id - 1;
        }
        false
    }

    /// Close and execute the current list, signal its fence, and prepare a
    /// fresh list on a recycled allocator. `process_residency` runs between
    /// close and execute, with the closed residency set.
    pub fn submit(
        &mut self,
        queue: &B::Queue,
        device: &B::Device,
        process_residency: impl FnOnce(&mut ResidencySet, u64, u64, &B::Fence),
    ) -> Result<(), DeviceError> {
        self.flushes_with_no_readback += 1;
        self.list.close()?;

        self.residency_set.close();
        process_residency(
            &mut self.residency_set,
            self.id,
            self.fence.completed(),
            &self.fence,
        );

        queue.execute(&[&self.list]);

        let allocator = self.allocator.take().expect("allocator always present");
        self.allocator_pool.return_to_pool(allocator, self.id);

        queue.signal(&self.fence, self.id);
        self.id += 1;

        self.prepare_new_list(device)
    }

    fn prepare_new_list(&mut self, device: &B::Device) -> Result<(), DeviceError> {
        let completed = self.fence.completed();
        let fence = &self.fence;
        let allocator = self.allocator_pool.retrieve(
            completed,
            |value| {
                if !fence.wait(value) {
                    warn!("fence wait failed while recycling a command allocator");
                }
            },
            || hal::Device::create_command_allocator(device),
        )?;
        self.list.reset(&allocator)?;
        self.allocator = Some(allocator);

        self.residency_set.open();
        self.num_commands = 0;
        self.num_dispatches = 0;
        self.upload_bytes = 0;
        Ok(())
    }

    /// Wait for the given fence value, submitting first if it is the open
    /// list's own id.
    pub fn wait_for_fence_value(
        &mut self,
        value: u64,
        queue: &B::Queue,
        device: &B::Device,
        process_residency: impl FnOnce(&mut ResidencySet, u64, u64, &B::Fence),
    ) -> Result<bool, DeviceError> {
        self.flushes_with_no_readback = 0;
        if self.id <= value {
            debug_assert_eq!(self.id, value);
            self.submit(queue, device, process_residency)?;
        }
        if self.fence.completed() >= value {
            return Ok(true);
        }
        Ok(self.fence.wait(value))
    }

    /// Submit any pending work and return the fence value that marks the
    /// point everything so far completes at.
    pub fn ensure_flushed_and_fenced(
        &mut self,
        queue: &B::Queue,
        device: &B::Device,
        process_residency: impl FnOnce(&mut ResidencySet, u64, u64, &B::Fence),
    ) -> Result<u64, DeviceError> {
        self.flushes_with_no_readback = 0;
        if self.has_commands() {
            self.submit(queue, device, process_residency)?;
        }
        Ok(self.id - 1)
    }

    pub fn fence(&self) -> &B::Fence {
        &self.fence
    }
}
