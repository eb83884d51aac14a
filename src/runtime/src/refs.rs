//! Two-level reference counting.
//!
//! API objects carry two counts packed into one atomic: the external count
//! (application retain/release) in the low half and the internal count
//! (holds from other runtime objects, e.g. a queue holding its tasks) in
//! the high half. An object is destroyed only when both reach zero, so an
//! application releasing its last handle cannot tear an object out from
//! under the task graph.

use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU64, Ordering};

const INTERNAL_UNIT: u64 = 1 << 32;

struct Shared<T: ?Sized> {
    counts: AtomicU64,
    value: T,
}

/// An externally held (application-visible) reference.
pub struct OwnedRef<T> {
    ptr: NonNull<Shared<T>>,
}

/// A reference held by another runtime object.
pub struct InternalRef<T> {
    ptr: NonNull<Shared<T>>,
}

unsafe impl<T: Send + Sync> Send for OwnedRef<T> {}
unsafe impl<T: Send + Sync> Sync for OwnedRef<T> {}
unsafe impl<T: Send + Sync> Send for InternalRef<T> {}
unsafe impl<T: Send + Sync> Sync for InternalRef<T> {}

impl<T> OwnedRef<T> {
    /// Allocate with one external reference.
    pub fn new(value: T) -> Self {
        let shared = Box::new(Shared {
            counts: AtomicU64::new(1),
            value,
        });
        OwnedRef {
            ptr: NonNull::from(Box::leak(shared)),
        }
    }

    fn shared(&self) -> &Shared<T> {
        unsafe { self.ptr.as_ref() }
    }

    /// The application-visible reference count.
    pub fn external_count(&self) -> u32 {
        (self.shared().counts.load(Ordering::Relaxed) & 0xffff_ffff) as u32
    }

    /// Take an internal reference to the same object.
    pub fn internal(&self) -> InternalRef<T> {
        self.shared().counts.fetch_add(INTERNAL_UNIT, Ordering::Relaxed);
        InternalRef { ptr: self.ptr }
    }

    /// Pointer identity, for handle comparisons.
    pub fn as_raw(&self) -> *const T {
        &self.shared().value
    }
}

impl<T> InternalRef<T> {
    fn shared(&self) -> &Shared<T> {
        unsafe { self.ptr.as_ref() }
    }

    /// Promote to an external reference (a retain on behalf of the app).
    pub fn to_owned(&self) -> OwnedRef<T> {
        self.shared().counts.fetch_add(1, Ordering::Relaxed);
        OwnedRef { ptr: self.ptr }
    }

    pub fn as_raw(&self) -> *const T {
        &self.shared().value
    }
}

impl<T> Clone for OwnedRef<T> {
    fn clone(&self) -> Self {
        self.shared().counts.fetch_add(1, Ordering::Relaxed);
        OwnedRef { ptr: self.ptr }
    }
}

impl<T> Clone for InternalRef<T> {
    fn clone(&self) -> Self {
        self.shared().counts.fetch_add(INTERNAL_UNIT, Ordering::Relaxed);
        InternalRef { ptr: self.ptr }
    }
}

fn release<T>(ptr: NonNull<Shared<T>>, unit: u64) {
    let shared = unsafe { ptr.as_ref() };
    if shared.counts.fetch_sub(unit, Ordering::Release) == unit {
        fence(Ordering::Acquire);
        drop(unsafe { Box::from_raw(ptr.as_ptr()) });
    }
}

impl<T> Drop for OwnedRef<T> {
    fn drop(&mut self) {
        release(self.ptr, 1);
    }
}

impl<T> Drop for InternalRef<T> {
    fn drop(&mut self) {
        release(self.ptr, INTERNAL_UNIT);
    }
}

impl<T> Deref for OwnedRef<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.shared().value
    }
}

impl<T> Deref for InternalRef<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.shared().value
    }
}

impl<T: fmt::Debug> fmt::Debug for OwnedRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: fmt::Debug> fmt::Debug for InternalRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T> PartialEq for OwnedRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> PartialEq for InternalRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    struct DropFlag(Arc<AtomicBool>);
    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn object_survives_until_both_counts_drop() {
        let dropped = Arc::new(AtomicBool::new(false));
        let owned = OwnedRef::new(DropFlag(Arc::clone(&dropped)));
        let internal = owned.internal();

        // Application released every handle; the queue still holds one.
        drop(owned);
        assert!(!dropped.load(Ordering::SeqCst));

        drop(internal);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn external_count_ignores_internal_refs() {
        let owned = OwnedRef::new(17u32);
        let _internal = owned.internal();
        let second = owned.clone();
        assert_eq!(owned.external_count(), 2);
        drop(second);
        assert_eq!(owned.external_count(), 1);
        assert_eq!(*owned, 17);
    }

    #[test]
    fn internal_promotes_to_owned() {
        let owned = OwnedRef::new(5u32);
        let internal = owned.internal();
        drop(owned);
        let revived = internal.to_owned();
        assert_eq!(*revived, 5);
        assert_eq!(revived.external_count(), 1);
    }
}
