//! Descriptor slot cells.
//!
//! Every element of a [`PageArena`](crate::arena::PageArena) is wrapped in a
//! [`SlotCell`]. Access is *always unsafe*: the owning pool guarantees
//! exclusivity either by holding its lock (free-list manipulation, flag
//! updates) or by the single-owner rule for an allocated descriptor. In debug
//! builds a runtime borrow counter enforces the discipline:
//!   * `>= 0` => number of shared borrows
//!   * `-1`   => an exclusive (mutable) borrow is active
//!
//! In release builds the counter remains present but is never consulted.

use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut};

pub struct SlotCell<T> {
    value: UnsafeCell<T>,
    // Present in all builds. Checked/updated only in debug builds.
    borrow: Cell<isize>,
}

impl<T> SlotCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            value: UnsafeCell::new(value),
            borrow: Cell::new(0),
        }
    }

    /// SAFETY: The caller must ensure no mutable borrow is active and that
    /// aliasing rules are upheld for the returned shared reference.
    pub unsafe fn borrow<'a>(&'a self) -> SlotRef<'a, T> {
        #[cfg(debug_assertions)]
        {
            let b = self.borrow.get();
            debug_assert!(b >= 0, "slot already mutably borrowed");
            self.borrow.set(b + 1);
        }

        SlotRef {
            value: unsafe { &*self.value.get() },
            cell: self,
        }
    }

    /// SAFETY: The caller must ensure no other borrows (shared or mutable)
    /// overlap with the returned mutable reference. For descriptor slots this
    /// means either holding the owning pool's lock or owning the allocated
    /// descriptor's id exclusively.
    pub unsafe fn borrow_mut<'a>(&'a self) -> SlotRefMut<'a, T> {
        #[cfg(debug_assertions)]
        {
            let b = self.borrow.get();
            debug_assert!(b == 0, "slot already borrowed");
            self.borrow.set(-1);
        }

        SlotRefMut {
            value: unsafe { &mut *self.value.get() },
            cell: self,
        }
    }

    /// Get a unique mutable reference when you have `&mut self` (always safe).
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

/// Shared-borrow RAII guard, used only to maintain debug borrow counts.
/// In release builds it's effectively zero-cost.
pub struct SlotRef<'a, T> {
    value: &'a T,
    cell: &'a SlotCell<T>,
}

impl<'a, T> Deref for SlotRef<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.value
    }
}

impl<'a, T> Drop for SlotRef<'a, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            let b = self.cell.borrow.get();
            debug_assert!(b > 0, "slot borrow counter underflow");
            self.cell.borrow.set(b - 1);
        }
    }
}

/// Unique-borrow RAII guard, used only to maintain debug borrow counts.
pub struct SlotRefMut<'a, T> {
    value: &'a mut T,
    cell: &'a SlotCell<T>,
}

impl<'a, T> Deref for SlotRefMut<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.value
    }
}

impl<'a, T> DerefMut for SlotRefMut<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.value
    }
}

impl<'a, T> Drop for SlotRefMut<'a, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            let b = self.cell.borrow.get();
            debug_assert!(b == -1, "slot borrow counter corrupted");
            self.cell.borrow.set(0);
        }
    }
}

unsafe impl<T: Send> Send for SlotCell<T> {}
// Slots are shared between producer and completion contexts; every access
// path goes through the owning pool's lock or an exclusively-owned id.
unsafe impl<T: Send> Sync for SlotCell<T> {}
