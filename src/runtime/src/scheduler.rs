//! Reconfigurable background worker pool.
//!
//! The platform runs two of these (user-callback and compile/link pools)
//! and every native device runs one as its completion worker. The pool can
//! be resized and reprioritized on the fly, supports cancelling queued
//! work, and can signal an event once everything submitted so far has
//! drained.

use crate::sync::ManualEvent;

use log::trace;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

/// Worker thread priority. Applied best-effort: on hosts without
/// per-thread priority control the hint is recorded but not enforced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Idle,
    Normal,
}

/// Pool shape: worker count and priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulingMode {
    pub threads: usize,
    pub priority: Priority,
}

impl SchedulingMode {
    pub fn new(threads: usize, priority: Priority) -> Self {
        SchedulingMode { threads, priority }
    }
}

/// A queued work item: the work itself plus an optional cancellation
/// callback invoked instead of the work when the item is discarded.
pub struct SchedulerTask {
    pub run: Box<dyn FnOnce() + Send>,
    pub cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl SchedulerTask {
    pub fn new(run: impl FnOnce() + Send + 'static) -> Self {
        SchedulerTask {
            run: Box::new(run),
            cancel: None,
        }
    }

    pub fn with_cancel(
        run: impl FnOnce() + Send + 'static,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        SchedulerTask {
            run: Box::new(run),
            cancel: Some(Box::new(cancel)),
        }
    }
}

struct QueuedTask {
    task: SchedulerTask,
    epoch: u64,
}

struct DrainSignal {
    epoch: u64,
    remaining: usize,
    event: Arc<ManualEvent>,
    mode_after: Option<SchedulingMode>,
}

struct State {
    tasks: VecDeque<QueuedTask>,
    in_progress: usize,
    // Ids 0..spawned are alive; workers with id >= target exit.
    spawned: usize,
    target: usize,
    priority: Priority,
    shutdown: bool,
    epoch: u64,
    signals: Vec<DrainSignal>,
}

struct Inner {
    state: Mutex<State>,
    cv: Condvar,
    idle_cv: Condvar,
}

/// The pool.
pub struct Scheduler {
    inner: Arc<Inner>,
    name: &'static str,
}

impl Scheduler {
    pub fn new(name: &'static str) -> Self {
        Scheduler {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    tasks: VecDeque::new(),
                    in_progress: 0,
                    spawned: 0,
                    target: 0,
                    priority: Priority::Normal,
                    shutdown: false,
                    epoch: 0,
                    signals: Vec::new(),
                }),
                cv: Condvar::new(),
                idle_cv: Condvar::new(),
            }),
            name,
        }
    }

    pub fn current_mode(&self) -> SchedulingMode {
        let state = self.inner.state.lock();
        SchedulingMode::new(state.target, state.priority)
    }

    /// Resize/reprioritize the pool. Grows take effect immediately; shrinks
    /// are picked up by workers as they come off a task.
    pub fn set_scheduling_mode(&self, mode: SchedulingMode) {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return;
        }
        state.priority = mode.priority;
        state.target = mode.threads;
        while state.spawned < state.target {
            let id = state.spawned;
            state.spawned += 1;
            self.spawn_worker(id);
        }
        drop(state);
        self.inner.cv.notify_all();
    }

    fn spawn_worker(&self, id: usize) {
        let inner = Arc::clone(&self.inner);
        let name = self.name;
        thread::Builder::new()
            .name(format!("{}-{}", name, id))
            .spawn(move || worker_loop(&inner, id))
            .expect("failed to spawn scheduler worker");
    }

    /// Queue a task. When the pool has no workers (or is shut down) the
    /// task is cancelled on the spot.
    pub fn queue_task(&self, task: SchedulerTask) {
        let cancelled = {
            let mut state = self.inner.state.lock();
            if state.target == 0 || state.shutdown {
                Some(task)
            } else {
                let epoch = state.epoch;
                state.tasks.push_back(QueuedTask { task, epoch });
                None
            }
        };
        match cancelled {
            Some(task) => {
                if let Some(cancel) = task.cancel {
                    cancel();
                }
            }
            None => {
                self.inner.cv.notify_one();
            }
        }
    }

    /// Arrange for `event` to be set once every task submitted so far has
    /// finished, then switch to `mode_after` if given.
    pub fn signal_event_on_completion(
        &self,
        event: Arc<ManualEvent>,
        mode_after: Option<SchedulingMode>,
    ) {
        let mut state = self.inner.state.lock();
        let outstanding = state.tasks.len() + state.in_progress;
        if state.target == 0 || outstanding == 0 {
            event.set();
            if let Some(mode) = mode_after {
                state.priority = mode.priority;
                state.target = mode.threads;
                while state.spawned < state.target {
                    let id = state.spawned;
                    state.spawned += 1;
                    self.spawn_worker(id);
                }
            }
            drop(state);
            self.inner.cv.notify_all();
            return;
        }
        let epoch = state.epoch;
        state.epoch += 1;
        state.signals.push(DrainSignal {
            epoch,
            remaining: outstanding,
            event,
            mode_after,
        });
    }

    /// Discard queued-but-not-started items, invoking their cancel
    /// callbacks.
    pub fn cancel_existing_tasks(&self) {
        let drained: Vec<QueuedTask> = {
            let mut state = self.inner.state.lock();
            state.tasks.drain(..).collect()
        };
        trace!("{}: cancelling {} queued tasks", self.name, drained.len());
        let mut epochs = Vec::with_capacity(drained.len());
        for queued in drained {
            if let Some(cancel) = queued.task.cancel {
                cancel();
            }
            epochs.push(queued.epoch);
        }
        let mut state = self.inner.state.lock();
        for epoch in epochs {
            retire(&mut state, epoch);
        }
    }

    /// Cancel queued work, stop every worker, and wait for them to exit.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
        }
        self.cancel_existing_tasks();
        let mut state = self.inner.state.lock();
        state.target = 0;
        self.inner.cv.notify_all();
        while state.spawned > 0 {
            self.inner.idle_cv.wait(&mut state);
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn retire(state: &mut State, task_epoch: u64) {
    let mut fired = false;
    for signal in &mut state.signals {
        if task_epoch <= signal.epoch {
            signal.remaining -= 1;
            if signal.remaining == 0 {
                signal.event.set();
                fired = true;
            }
        }
    }
    if fired {
        let mut mode_changes = Vec::new();
        state.signals.retain(|signal| {
            if signal.remaining == 0 {
                if let Some(mode) = signal.mode_after {
                    mode_changes.push(mode);
                }
                false
            } else {
                true
            }
        });
        for mode in mode_changes {
            state.priority = mode.priority;
            state.target = mode.threads;
            // Workers pick the change up on their next wait; grows are
            // handled by set_scheduling_mode, which drain-and-regrow
            // callers use directly.
        }
    }
}

fn worker_loop(inner: &Inner, id: usize) {
    let mut state = inner.state.lock();
    loop {
        let queued = loop {
            if state.shutdown || id >= state.target {
                state.spawned = state.spawned.saturating_sub(1);
                inner.idle_cv.notify_all();
                return;
            }
            if let Some(queued) = state.tasks.pop_front() {
                state.in_progress += 1;
                break queued;
            }
            inner.cv.wait(&mut state);
        };

        drop(state);
        (queued.task.run)();
        state = inner.state.lock();

        state.in_progress -= 1;
        retire(&mut state, queued.epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn runs_queued_tasks() {
        let scheduler = Scheduler::new("test");
        scheduler.set_scheduling_mode(SchedulingMode::new(2, Priority::Normal));
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            scheduler.queue_task(SchedulerTask::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let drained = ManualEvent::new();
        scheduler.signal_event_on_completion(Arc::clone(&drained), None);
        drained.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn zero_workers_cancels_instead_of_running() {
        let scheduler = Scheduler::new("test");
        let cancelled = Arc::new(AtomicUsize::new(0));
        let cancelled2 = Arc::clone(&cancelled);
        scheduler.queue_task(SchedulerTask::with_cancel(
            || panic!("must not run"),
            move || {
                cancelled2.fetch_add(1, Ordering::SeqCst);
            },
        ));
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_discards_queued_work() {
        let scheduler = Scheduler::new("test");
        scheduler.set_scheduling_mode(SchedulingMode::new(1, Priority::Normal));

        // Park the single worker so everything behind stays queued.
        let gate = ManualEvent::new();
        let gate2 = Arc::clone(&gate);
        scheduler.queue_task(SchedulerTask::new(move || gate2.wait()));

        let ran = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let ran = Arc::clone(&ran);
            let cancelled = Arc::clone(&cancelled);
            // Give the worker a moment to take the gate task.
            std::thread::sleep(Duration::from_millis(1));
            scheduler.queue_task(SchedulerTask::with_cancel(
                move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                },
                move || {
                    cancelled.fetch_add(1, Ordering::SeqCst);
                },
            ));
        }
        scheduler.cancel_existing_tasks();
        gate.set();
        scheduler.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(cancelled.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn drain_event_waits_for_in_flight_work() {
        let scheduler = Scheduler::new("test");
        scheduler.set_scheduling_mode(SchedulingMode::new(1, Priority::Normal));
        let gate = ManualEvent::new();
        let gate2 = Arc::clone(&gate);
        scheduler.queue_task(SchedulerTask::new(move || gate2.wait()));
        std::thread::sleep(Duration::from_millis(5));

        let drained = ManualEvent::new();
        scheduler.signal_event_on_completion(Arc::clone(&drained), None);
        assert!(!drained.is_set());
        gate.set();
        drained.wait();
    }
}
