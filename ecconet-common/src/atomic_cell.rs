//! A small cell with atomic load/store semantics
//!
//! Built on `critical_section` so it is usable from both thread and
//! interrupt context on single-core targets, as well as on std hosts.

use core::cell::RefCell;

use critical_section::Mutex;

/// A value cell which can be shared between an ISR and thread context.
///
/// All accesses copy the value in or out under a critical section.
#[derive(Debug)]
pub struct AtomicCell<T> {
    inner: Mutex<RefCell<T>>,
}

impl<T: Copy> AtomicCell<T> {
    /// Create a new cell holding `value`
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(value)),
        }
    }

    /// Read the current value
    pub fn load(&self) -> T {
        critical_section::with(|cs| *self.inner.borrow_ref(cs))
    }

    /// Replace the current value
    pub fn store(&self, value: T) {
        critical_section::with(|cs| *self.inner.borrow_ref_mut(cs) = value);
    }
}

impl<T: Copy + Default> AtomicCell<T> {
    /// Read the current value, leaving the default in its place
    pub fn take(&self) -> T {
        critical_section::with(|cs| core::mem::take(&mut *self.inner.borrow_ref_mut(cs)))
    }
}

impl<T: Copy + Default> Default for AtomicCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
