use std::sync::atomic::{AtomicPtr, Ordering};

/// A thin raw-pointer wrapper.
///
/// The collector owns every object it hands out; the mutator only ever
/// borrows. Side tables and intrusive lists therefore traffic in raw
/// addresses, and this wrapper keeps the unsafety in one place.
#[repr(transparent)]
pub struct Ptr<T: ?Sized>(pub *mut T);

impl<T: ?Sized> Ptr<T> {
    pub fn get(&self) -> &mut T {
        unsafe { &mut *self.0 }
    }
}

impl<T> Ptr<T> {
    pub fn from_ref(x: &T) -> Self {
        Self(x as *const T as *mut T)
    }

    pub fn from_pointer(x: *mut T) -> Self {
        Self(x)
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    pub fn null() -> Self {
        Self(std::ptr::null_mut())
    }

    pub fn raw(&self) -> *mut T {
        self.0
    }

    /// Offsets the pointer by `count` elements.
    pub fn add(&self, count: usize) -> Self {
        Self(unsafe { self.0.add(count) })
    }

    pub fn offset_from(&self, base: Ptr<T>) -> usize {
        debug_assert!(self.0 >= base.0);

        (self.0 as usize - base.0 as usize) / std::mem::size_of::<T>()
    }

    pub fn compare_and_swap(&self, current: *mut T, other: *mut T) -> bool {
        self.as_atomic()
            .compare_exchange(current, other, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Atomically replaces the current pointer with the given one.
    pub fn atomic_store(&self, other: *mut T) {
        self.as_atomic().store(other, Ordering::Release);
    }

    /// Atomically loads the pointer.
    pub fn atomic_load(&self) -> Self {
        Self(self.as_atomic().load(Ordering::Acquire))
    }

    fn as_atomic(&self) -> &AtomicPtr<T> {
        unsafe { &*(self as *const Ptr<T> as *const AtomicPtr<T>) }
    }
}

impl<T> std::fmt::Debug for Ptr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Ptr({:p})", self.0)
    }
}

use std::hash::*;

impl<T> Hash for Ptr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<T> PartialEq for Ptr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T> Eq for Ptr<T> {}

impl<T> Copy for Ptr<T> {}
impl<T> Clone for Ptr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> std::ops::Deref for Ptr<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.get()
    }
}

impl<T> std::ops::DerefMut for Ptr<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.get()
    }
}

unsafe impl<T> Send for Ptr<T> {}
unsafe impl<T> Sync for Ptr<T> {}
