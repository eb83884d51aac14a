//! Small synchronization primitives used across the runtime.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

struct PromiseInner<T> {
    value: Mutex<Option<T>>,
    cv: Condvar,
}

/// A one-shot value with blocking waiters.
///
/// Task completion and kernel specialization both resolve through one of
/// these: the producer sets the value once, every waiter (the recording
/// worker, `finish`, `wait_for_events`) wakes.
pub struct Promise<T> {
    inner: Arc<PromiseInner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Promise {
            inner: Arc::new(PromiseInner {
                value: Mutex::new(None),
                cv: Condvar::new(),
            }),
        }
    }

    /// Resolve the promise. Later calls are ignored; the first value wins.
    pub fn set(&self, value: T) {
        let mut slot = self.inner.value.lock();
        if slot.is_none() {
            *slot = Some(value);
            self.inner.cv.notify_all();
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.value.lock().is_some()
    }
}

impl<T: Clone> Promise<T> {
    /// Block until resolved.
    pub fn wait(&self) -> T {
        let mut slot = self.inner.value.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return value.clone();
            }
            self.inner.cv.wait(&mut slot);
        }
    }

    pub fn try_get(&self) -> Option<T> {
        self.inner.value.lock().clone()
    }
}

/// A manually reset boolean event, used by the scheduler's drain primitive.
#[derive(Default)]
pub struct ManualEvent {
    state: Mutex<bool>,
    cv: Condvar,
}

impl ManualEvent {
    pub fn new() -> Arc<Self> {
        Arc::new(ManualEvent::default())
    }

    pub fn set(&self) {
        *self.state.lock() = true;
        self.cv.notify_all();
    }

    pub fn wait(&self) {
        let mut state = self.state.lock();
        while !*state {
            self.cv.wait(&mut state);
        }
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn promise_wakes_waiters() {
        let promise = Promise::new();
        let waiter = promise.clone();
        let handle = thread::spawn(move || waiter.wait());
        promise.set(42);
        assert_eq!(handle.join().unwrap(), 42);
        // First value wins.
        promise.set(7);
        assert_eq!(promise.try_get(), Some(42));
    }
}
