//! Command queues.

use crate::context::Context;
use crate::device::{Device, NativeDevice};
use crate::error::{self, ClError, Result};
use crate::platform::TaskPoolLock;
use crate::refs::{InternalRef, OwnedRef};
use crate::task::{CommandType, Event, NullPayload, Task};

use rocl_hal::Backend;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

bitflags::bitflags! {
    /// Queue property bits, CL encoding.
    pub struct QueueProperties: u64 {
        const OUT_OF_ORDER = 1 << 0;
        const PROFILING = 1 << 1;
    }
}

struct QueueState<B: Backend> {
    queued: VecDeque<Event<B>>,
    outstanding: Vec<InternalRef<Task<B>>>,
    last_queued: Option<InternalRef<Task<B>>>,
    last_barrier: Option<InternalRef<Task<B>>>,
}

/// An ordered stream of tasks bound to one (context, device) pair.
pub struct CommandQueue<B: Backend> {
    context: InternalRef<Context<B>>,
    device: OwnedRef<Device<B>>,
    native: Arc<NativeDevice<B>>,
    properties: QueueProperties,
    properties_array: Vec<u64>,
    properties_synthesized: bool,
    state: Mutex<QueueState<B>>,
}

impl<B: Backend> CommandQueue<B> {
    /// Create a queue from a CL-style property array
    /// (`[key, value, ..., 0]`).
    pub fn create(
        context: &OwnedRef<Context<B>>,
        device: &OwnedRef<Device<B>>,
        properties_array: Vec<u64>,
        properties_synthesized: bool,
    ) -> Result<OwnedRef<CommandQueue<B>>> {
        const QUEUE_PROPERTIES_KEY: u64 = 0x1093;

        let native = context.native_for(device).ok_or_else(|| {
            context.report_error(
                "provided device not associated with provided context",
                error::INVALID_DEVICE,
            )
        })?;

        let mut bits = 0u64;
        let mut cursor = properties_array.as_slice();
        while let [key, value, rest @ ..] = cursor {
            if *key == 0 {
                break;
            }
            if *key != QUEUE_PROPERTIES_KEY {
                return Err(context.report_error("unknown property", error::INVALID_PROPERTY));
            }
            bits = *value;
            cursor = rest;
        }
        let properties = QueueProperties::from_bits(bits).ok_or_else(|| {
            context.report_error("invalid properties specified", error::INVALID_QUEUE_PROPERTIES)
        })?;

        Ok(OwnedRef::new(CommandQueue {
            context: context.internal(),
            device: device.clone(),
            native,
            properties,
            properties_array,
            properties_synthesized,
            state: Mutex::new(QueueState {
                queued: VecDeque::new(),
                outstanding: Vec::new(),
                last_queued: None,
                last_barrier: None,
            }),
        }))
    }

    pub fn context(&self) -> &InternalRef<Context<B>> {
        &self.context
    }

    pub fn device(&self) -> &OwnedRef<Device<B>> {
        &self.device
    }

    pub(crate) fn native(&self) -> &Arc<NativeDevice<B>> {
        &self.native
    }

    pub fn properties(&self) -> QueueProperties {
        self.properties
    }

    /// The property array the queue was created with, or `None` when it
    /// was synthesized from the scalar-properties entry point.
    pub fn properties_array(&self) -> Option<&[u64]> {
        if self.properties_synthesized {
            None
        } else {
            Some(&self.properties_array)
        }
    }

    pub fn is_out_of_order(&self) -> bool {
        self.properties.contains(QueueProperties::OUT_OF_ORDER)
    }

    pub fn profiling_enabled(&self) -> bool {
        self.properties.contains(QueueProperties::PROFILING)
    }

    /// Insert a task at the tail, chaining the implicit in-order and
    /// barrier edges.
    pub(crate) fn queue_task(&self, task: &Event<B>, lock: &TaskPoolLock) -> Result<()> {
        {
            let state = self.state.lock();
            let mut implicit: Vec<Event<B>> = Vec::with_capacity(2);
            if let Some(last) = &state.last_queued {
                implicit.push(last.to_owned());
            }
            if let Some(barrier) = &state.last_barrier {
                implicit.push(barrier.to_owned());
            }
            drop(state);
            Task::add_dependencies(task, &implicit, lock)?;
        }

        let mut state = self.state.lock();
        state.queued.push_back(task.clone());
        if !self.is_out_of_order() {
            state.last_queued = Some(task.internal());
        }
        if task.command_type == CommandType::Barrier {
            state.last_barrier = Some(task.internal());
        }
        Ok(())
    }

    /// Add every task currently in the queue as a dependency of `task`,
    /// the empty-wait-list semantics of markers and barriers.
    pub(crate) fn add_all_tasks_as_dependencies(
        &self,
        task: &Event<B>,
        lock: &TaskPoolLock,
    ) -> Result<()> {
        let deps: Vec<Event<B>> = {
            let state = self.state.lock();
            let skip = |candidate: *const Task<B>| {
                state
                    .last_queued
                    .as_ref()
                    .map_or(false, |l| std::ptr::eq(l.as_raw(), candidate))
                    || state
                        .last_barrier
                        .as_ref()
                        .map_or(false, |l| std::ptr::eq(l.as_raw(), candidate))
            };
            state
                .outstanding
                .iter()
                .filter(|t| !skip(t.as_raw()))
                .map(|t| t.to_owned())
                .chain(
                    state
                        .queued
                        .iter()
                        .filter(|t| !skip(t.as_raw()))
                        .cloned(),
                )
                .collect()
        };
        Task::add_dependencies(task, &deps, lock)
    }

    /// Drain the queued deque into the device. A queue with nothing queued
    /// is a no-op, which is also what bounds recursive flushes.
    pub fn flush(&self, lock: &TaskPoolLock, flush_device: bool) -> Result<()> {
        loop {
            let front = {
                let mut state = self.state.lock();
                match state.queued.pop_front() {
                    Some(task) => {
                        state.outstanding.push(task.internal());
                        task
                    }
                    None => break,
                }
            };
            self.native.submit_task(&front.internal(), lock)?;
        }
        if flush_device {
            self.native.flush(lock);
        }
        Ok(())
    }

    /// Flush and wait until every task enqueued so far has completed.
    pub fn finish(this: &OwnedRef<CommandQueue<B>>) -> Result<()> {
        let marker = {
            let platform = this.context.platform().clone();
            let lock = platform.task_pool_lock();
            let marker = Task::new(
                this.context.clone(),
                this,
                CommandType::Marker,
                Box::new(NullPayload),
            );
            this.add_all_tasks_as_dependencies(&marker, &lock)?;
            this.queue_task(&marker, &lock)?;
            this.flush(&lock, true)?;
            marker
        };
        let status = marker.wait_for_completion();
        if status < 0 {
            Err(ClError::code_only(status))
        } else {
            Ok(())
        }
    }

    /// Remove a finished task from the bookkeeping.
    pub(crate) fn notify_task_completion(&self, task: &Task<B>, _lock: &TaskPoolLock) {
        let mut state = self.state.lock();
        let ptr = task as *const Task<B>;
        state.outstanding.retain(|t| !std::ptr::eq(t.as_raw(), ptr));
        state.queued.retain(|t| !std::ptr::eq(t.as_raw(), ptr));
        if state
            .last_queued
            .as_ref()
            .map_or(false, |t| std::ptr::eq(t.as_raw(), ptr))
        {
            state.last_queued = None;
        }
        if state
            .last_barrier
            .as_ref()
            .map_or(false, |t| std::ptr::eq(t.as_raw(), ptr))
        {
            state.last_barrier = None;
        }
    }

    /// Number of queued-but-not-flushed tasks, for tests.
    pub fn queued_len(&self) -> usize {
        self.state.lock().queued.len()
    }
}

impl<B: Backend> std::fmt::Debug for CommandQueue<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("out_of_order", &self.is_out_of_order())
            .field("profiling", &self.profiling_enabled())
            .finish()
    }
}
