//! Interrupt-safe cell.
//!
//! Every structure shared between thread and interrupt context lives in an
//! [`IrqCell`]. Mutable access requires a [`CriticalSection`] token, which
//! can only be obtained with interrupts masked.

use core::cell::{RefCell, RefMut};

use critical_section::CriticalSection;

pub struct IrqCell<T> {
    inner: critical_section::Mutex<RefCell<T>>,
}

impl<T> IrqCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: critical_section::Mutex::new(RefCell::new(value)),
        }
    }

    /// Borrow the contents for the lifetime of the critical section.
    ///
    /// # Panics
    /// If the cell is already borrowed inside the same critical section.
    #[inline]
    pub fn borrow_mut<'cs>(&'cs self, cs: CriticalSection<'cs>) -> RefMut<'cs, T> {
        self.inner.borrow(cs).borrow_mut()
    }

    /// Run `f` on the contents inside a fresh critical section.
    #[inline]
    pub fn lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        critical_section::with(|cs| f(&mut self.borrow_mut(cs)))
    }
}
