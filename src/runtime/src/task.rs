//! Tasks: the unit of work flowing through command queues.
//!
//! A task is anything that can be enqueued and/or waited on (the event
//! surface). It moves through Queued → Submitted → Ready → Running →
//! Complete, where Ready is internal and reported to callers as Submitted.
//! Tasks carry their dependency edges in both directions; the backward
//! list shrinks as dependencies complete and the forward list is cleared
//! on completion, which is also what breaks the reference cycles.

use crate::context::Context;
use crate::device::NativeDevice;
use crate::error::{self, ClError, Result, StatusCode};
use crate::platform::TaskPoolLock;
use crate::queue::CommandQueue;
use crate::refs::{InternalRef, OwnedRef};
use crate::sync::Promise;

use rocl_engine::{GpuBuffer, ImmediateContext};
use rocl_hal::Backend;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::Instant;

/// An event handle is an externally referenced task.
pub type Event<B> = OwnedRef<Task<B>>;

/// What kind of command a task performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandType {
    ReadBuffer,
    WriteBuffer,
    CopyBuffer,
    FillBuffer,
    ReadBufferRect,
    WriteBufferRect,
    CopyBufferRect,
    ReadImage,
    WriteImage,
    CopyImage,
    FillImage,
    MapBuffer,
    MapImage,
    UnmapMemObject,
    MigrateMemObjects,
    NdRangeKernel,
    Marker,
    Barrier,
    User,
}

/// Profiling timestamp slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProfilingInfo {
    Queued,
    Submit,
    Start,
    End,
}

/// Callback stages an application can observe.
pub const CALLBACK_SUBMITTED: StatusCode = 2;
pub const CALLBACK_RUNNING: StatusCode = 1;
pub const CALLBACK_COMPLETE: StatusCode = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Queued,
    Submitted,
    Ready,
    Running,
    Finished(StatusCode),
}

impl Lifecycle {
    fn status_code(self) -> StatusCode {
        match self {
            Lifecycle::Queued => 3,
            // Ready is not an API-visible state.
            Lifecycle::Submitted | Lifecycle::Ready => 2,
            Lifecycle::Running => 1,
            Lifecycle::Finished(code) => code,
        }
    }
}

type EventCallback = Box<dyn FnOnce(StatusCode) + Send>;

/// GPU timestamp bracket recorded around a profiled task.
pub(crate) struct GpuTimestamps<B: Backend> {
    pub heap: B::QueryHeap,
    pub staging: GpuBuffer<B>,
}

struct TaskState<B: Backend> {
    lifecycle: Lifecycle,
    timestamps: [u64; 4],
    waiting_on: Vec<Event<B>>,
    dependents: Vec<InternalRef<Task<B>>>,
    submitted_callbacks: SmallVec<[EventCallback; 1]>,
    running_callbacks: SmallVec<[EventCallback; 1]>,
    completion_callbacks: SmallVec<[EventCallback; 1]>,
    gpu_timestamps: Option<GpuTimestamps<B>>,
}

/// Behavior of one task variant.
pub trait TaskPayload<B: Backend>: Send {
    /// Record the task's GPU work into the immediate context of `native`.
    /// Runs on the device's completion worker, outside the task-pool lock.
    fn record(
        &mut self,
        native: &Arc<NativeDevice<B>>,
        ctx: &mut ImmediateContext<B>,
    ) -> Result<()>;

    /// CPU-side completion work (staging copies, printf replay). `ctx` is
    /// present for successful completions reached from the completion
    /// worker.
    fn on_complete(&mut self, _status: StatusCode, _ctx: Option<&mut ImmediateContext<B>>) {}

    /// Pre-ready hook for cross-device resource migration.
    fn migrate(&mut self, _lock: &TaskPoolLock) {}
}

/// A payload with no GPU work: markers, barriers, user events, and
/// zero-size launches.
pub struct NullPayload;

impl<B: Backend> TaskPayload<B> for NullPayload {
    fn record(
        &mut self,
        _native: &Arc<NativeDevice<B>>,
        _ctx: &mut ImmediateContext<B>,
    ) -> Result<()> {
        Ok(())
    }
}

static TIMEBASE: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic host timestamp in nanoseconds.
pub(crate) fn host_timestamp_ns() -> u64 {
    TIMEBASE.elapsed().as_nanos() as u64
}

pub struct Task<B: Backend> {
    pub command_type: CommandType,
    context: InternalRef<Context<B>>,
    queue: Option<InternalRef<CommandQueue<B>>>,
    native: Option<Arc<NativeDevice<B>>>,
    profiling: bool,
    state: Mutex<TaskState<B>>,
    completion: Promise<StatusCode>,
    payload: Mutex<Box<dyn TaskPayload<B>>>,
}

impl<B: Backend> std::fmt::Debug for Task<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("command_type", &self.command_type)
            .field("status_code", &self.status_code())
            .finish()
    }
}

impl<B: Backend> Task<B> {
    /// Create a task bound to a queue, in the Queued state.
    pub(crate) fn new(
        context: InternalRef<Context<B>>,
        queue: &OwnedRef<CommandQueue<B>>,
        command_type: CommandType,
        payload: Box<dyn TaskPayload<B>>,
    ) -> Event<B> {
        let profiling = queue.profiling_enabled();
        let mut timestamps = [0u64; 4];
        if profiling {
            // Never zero: a zero queued timestamp means "not profiled".
            timestamps[0] = host_timestamp_ns().max(1);
        }
        OwnedRef::new(Task {
            command_type,
            context,
            native: Some(queue.native().clone()),
            queue: Some(queue.internal()),
            profiling,
            state: Mutex::new(TaskState {
                lifecycle: Lifecycle::Queued,
                timestamps,
                waiting_on: Vec::new(),
                dependents: Vec::new(),
                submitted_callbacks: SmallVec::new(),
                running_callbacks: SmallVec::new(),
                completion_callbacks: SmallVec::new(),
                gpu_timestamps: None,
            }),
            completion: Promise::new(),
            payload: Mutex::new(payload),
        })
    }

    /// Create a user event: queue-less, born Submitted.
    pub fn new_user_event(context: &OwnedRef<Context<B>>) -> Event<B> {
        OwnedRef::new(Task {
            command_type: CommandType::User,
            context: context.internal(),
            queue: None,
            native: None,
            profiling: false,
            state: Mutex::new(TaskState {
                lifecycle: Lifecycle::Submitted,
                timestamps: [0; 4],
                waiting_on: Vec::new(),
                dependents: Vec::new(),
                submitted_callbacks: SmallVec::new(),
                running_callbacks: SmallVec::new(),
                completion_callbacks: SmallVec::new(),
                gpu_timestamps: None,
            }),
            completion: Promise::new(),
            payload: Mutex::new(Box::new(NullPayload)),
        })
    }

    pub fn context(&self) -> &InternalRef<Context<B>> {
        &self.context
    }

    pub fn queue(&self) -> Option<&InternalRef<CommandQueue<B>>> {
        self.queue.as_ref()
    }

    pub(crate) fn native(&self) -> Option<&Arc<NativeDevice<B>>> {
        self.native.as_ref()
    }

    /// API-visible execution status.
    pub fn status_code(&self) -> StatusCode {
        self.state.lock().lifecycle.status_code()
    }

    pub fn is_queued(&self) -> bool {
        self.state.lock().lifecycle == Lifecycle::Queued
    }

    /// Add dependency edges to every event in `wait_list`. Fails without
    /// side effects when an event belongs to a different context.
    pub fn add_dependencies(
        this: &Event<B>,
        wait_list: &[Event<B>],
        _lock: &TaskPoolLock,
    ) -> Result<()> {
        for event in wait_list {
            if !std::ptr::eq(event.context().as_raw(), this.context.as_raw()) {
                return Err(ClError::new(
                    error::INVALID_CONTEXT,
                    "event wait list spans contexts",
                ));
            }
        }
        for event in wait_list {
            event.state.lock().dependents.push(this.internal());
            this.state.lock().waiting_on.push(event.clone());
        }
        Ok(())
    }

    pub(crate) fn has_pending_dependencies(&self, _lock: &TaskPoolLock) -> bool {
        !self.state.lock().waiting_on.is_empty()
    }

    /// Queues of dependencies that are still Queued and must be flushed
    /// for this task to ever become ready.
    pub(crate) fn queued_dependency_queues(
        &self,
        _lock: &TaskPoolLock,
    ) -> Vec<OwnedRef<CommandQueue<B>>> {
        let state = self.state.lock();
        state
            .waiting_on
            .iter()
            .filter(|dep| dep.is_queued())
            .filter_map(|dep| dep.queue.as_ref().map(|q| q.to_owned()))
            .collect()
    }

    pub(crate) fn submit(&self, _lock: &TaskPoolLock) {
        debug_assert!(self.command_type != CommandType::User);
        let mut state = self.state.lock();
        state.lifecycle = Lifecycle::Submitted;
        if self.profiling {
            state.timestamps[1] = host_timestamp_ns();
        }
        let callbacks = std::mem::take(&mut state.submitted_callbacks);
        drop(state);
        self.fire_callbacks(callbacks, CALLBACK_SUBMITTED);
    }

    pub(crate) fn mark_ready(&self, _lock: &TaskPoolLock) {
        let mut state = self.state.lock();
        debug_assert!(state.waiting_on.is_empty());
        state.lifecycle = Lifecycle::Ready;
    }

    pub(crate) fn started(&self, _lock: &TaskPoolLock) {
        let mut state = self.state.lock();
        state.lifecycle = Lifecycle::Running;
        let callbacks = std::mem::take(&mut state.running_callbacks);
        drop(state);
        self.fire_callbacks(callbacks, CALLBACK_RUNNING);
    }

    pub(crate) fn migrate_resources(&self, lock: &TaskPoolLock) {
        self.payload.lock().migrate(lock);
    }

    /// Record GPU work, bracketed by timestamp queries when profiling.
    pub(crate) fn record(&self, ctx: &mut ImmediateContext<B>) -> Result<()> {
        let queries = if self.profiling {
            crate::profiling::begin_gpu_timestamps(ctx).ok()
        } else {
            None
        };
        if let Some(queries) = &queries {
            ctx.end_timestamp(&queries.heap, 0);
        }

        let native = self
            .native
            .as_ref()
            .expect("queue-less tasks are never recorded")
            .clone();
        let result = self.payload.lock().record(&native, ctx);

        if let Some(queries) = queries {
            ctx.end_timestamp(&queries.heap, 1);
            ctx.resolve_timestamps(&queries.heap, 0, 2, &queries.staging);
            self.state.lock().gpu_timestamps = Some(queries);
        }
        result
    }

    /// Transition to Complete (or an error state), fire callbacks, release
    /// edges, and ready newly unblocked dependents.
    pub(crate) fn complete(
        &self,
        status: StatusCode,
        lock: &TaskPoolLock,
        mut ctx: Option<&mut ImmediateContext<B>>,
    ) {
        debug_assert!(status <= 0);
        let already_finished = {
            let state = self.state.lock();
            matches!(state.lifecycle, Lifecycle::Finished(_))
        };
        if already_finished {
            return;
        }
        self.state.lock().lifecycle = Lifecycle::Finished(status);

        if let Some(queue) = &self.queue {
            queue.notify_task_completion(self, lock);
        }

        // Pull GPU timestamps out of the resolved query buffer.
        let gpu_timestamps = self.state.lock().gpu_timestamps.take();
        if let Some(queries) = gpu_timestamps {
            if let Some(ctx) = ctx.as_deref_mut() {
                if status == error::SUCCESS {
                    if let Some((start, end)) =
                        crate::profiling::read_gpu_timestamps(ctx, &queries)
                    {
                        let frequency = self
                            .native
                            .as_ref()
                            .map_or(1_000_000_000, |n| n.timestamp_frequency());
                        let mut state = self.state.lock();
                        state.timestamps[2] = ticks_to_ns(start, frequency);
                        state.timestamps[3] = ticks_to_ns(end, frequency);
                    }
                }
                crate::profiling::release_gpu_timestamps(ctx, queries);
            }
        }

        self.payload.lock().on_complete(status, ctx.as_deref_mut());

        let (completion_callbacks, running_callbacks, submitted_callbacks, dependents) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.completion_callbacks),
                std::mem::take(&mut state.running_callbacks),
                std::mem::take(&mut state.submitted_callbacks),
                std::mem::take(&mut state.dependents),
            )
        };
        // A terminal state implies the earlier ones; flush any callbacks
        // the task skipped past, most-advanced last.
        self.fire_callbacks(submitted_callbacks, CALLBACK_SUBMITTED);
        self.fire_callbacks(running_callbacks, CALLBACK_RUNNING);
        self.fire_callbacks(completion_callbacks, status);

        if status < 0 {
            for dependent in &dependents {
                dependent.complete(
                    error::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST,
                    lock,
                    None,
                );
            }
        } else {
            for dependent in &dependents {
                let now_unblocked = {
                    let mut dep_state = dependent.state.lock();
                    dep_state
                        .waiting_on
                        .retain(|w| !std::ptr::eq(w.as_raw(), self as *const _));
                    dep_state.waiting_on.is_empty()
                        && dep_state.lifecycle == Lifecycle::Submitted
                };
                if now_unblocked {
                    if let Some(native) = &dependent.native {
                        native.ready_task(dependent.clone(), lock);
                    } else {
                        // Queue-less dependents (user events) never run.
                    }
                }
            }
        }

        self.state.lock().waiting_on.clear();
        self.completion.set(status);
    }

    fn fire_callbacks(&self, callbacks: impl IntoIterator<Item = EventCallback>, status: StatusCode) {
        let platform = self.context.platform().clone();
        for callback in callbacks {
            platform.queue_callback(move || callback(status));
        }
    }

    /// Register a state-change callback; fires immediately (through the
    /// callback worker) if the state has already been reached.
    pub fn set_callback(
        &self,
        callback_type: StatusCode,
        callback: impl FnOnce(StatusCode) + Send + 'static,
    ) -> Result<()> {
        if !matches!(
            callback_type,
            CALLBACK_SUBMITTED | CALLBACK_RUNNING | CALLBACK_COMPLETE
        ) {
            return Err(ClError::new(error::INVALID_VALUE, "invalid callback type"));
        }
        let platform = self.context.platform().clone();
        let _lock = platform.task_pool_lock();

        let current = self.status_code();
        if current <= callback_type {
            let status = if callback_type == CALLBACK_COMPLETE {
                current
            } else {
                callback_type
            };
            platform.queue_callback(move || callback(status));
            return Ok(());
        }

        let mut state = self.state.lock();
        let list = match callback_type {
            CALLBACK_SUBMITTED => &mut state.submitted_callbacks,
            CALLBACK_RUNNING => &mut state.running_callbacks,
            _ => &mut state.completion_callbacks,
        };
        list.push(Box::new(callback));
        Ok(())
    }

    /// Block until the task reaches a terminal state.
    pub fn wait_for_completion(&self) -> StatusCode {
        self.completion.wait()
    }

    /// Profiling timestamp in nanoseconds.
    pub fn profiling_info(&self, which: ProfilingInfo) -> Result<u64> {
        let state = self.state.lock();
        if state.timestamps[0] == 0 {
            return Err(ClError::new(
                error::PROFILING_INFO_NOT_AVAILABLE,
                "profiling was not enabled on the queue",
            ));
        }
        if !matches!(state.lifecycle, Lifecycle::Finished(0)) {
            return Err(ClError::new(
                error::PROFILING_INFO_NOT_AVAILABLE,
                "event is not complete",
            ));
        }
        let index = match which {
            ProfilingInfo::Queued => 0,
            ProfilingInfo::Submit => 1,
            ProfilingInfo::Start => 2,
            ProfilingInfo::End => 3,
        };
        Ok(state.timestamps[index])
    }
}

pub(crate) fn ticks_to_ns(ticks: u64, frequency: u64) -> u64 {
    ((ticks as f64) * (1_000_000_000.0 / frequency as f64)) as u64
}

/// Resolve a user event. `status` must be zero (complete) or negative.
pub fn set_user_event_status<B: Backend>(event: &Event<B>, status: StatusCode) -> Result<()> {
    if event.command_type != CommandType::User {
        return Err(ClError::new(
            error::INVALID_EVENT,
            "only user events can be resolved explicitly",
        ));
    }
    if status > 0 {
        return Err(ClError::new(
            error::INVALID_VALUE,
            "status must be Complete or a negative error",
        ));
    }
    let platform = event.context().platform().clone();
    let lock = platform.task_pool_lock();
    if event.status_code() != 2 {
        return Err(ClError::new(
            error::INVALID_OPERATION,
            "user event status already set",
        ));
    }
    event.complete(status, &lock, None);
    // Completion may have readied tasks; get them moving.
    platform.flush_all_devices(&lock);
    Ok(())
}

/// Wait for every event in `events` to reach a terminal state.
///
/// Queued events get their queues flushed first so the wait can make
/// progress, then each completion future is awaited in turn.
pub fn wait_for_events<B: Backend>(events: &[Event<B>]) -> Result<()> {
    if events.is_empty() {
        return Err(ClError::new(error::INVALID_VALUE, "empty event list"));
    }
    let context = events[0].context();
    for event in events {
        if !std::ptr::eq(event.context().as_raw(), context.as_raw()) {
            return Err(ClError::new(
                error::INVALID_CONTEXT,
                "events must share a context",
            ));
        }
    }

    let platform = context.platform().clone();
    {
        let lock = platform.task_pool_lock();
        for event in events {
            if event.is_queued() {
                if let Some(queue) = event.queue() {
                    queue.flush(&lock, true)?;
                }
            }
        }
    }

    let mut failed = false;
    for event in events {
        failed |= event.wait_for_completion() < 0;
    }
    if failed {
        Err(ClError::new(
            error::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST,
            "event in list finished with an error",
        ))
    } else {
        Ok(())
    }
}
