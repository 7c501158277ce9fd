// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Single-borrow static storage for the boot core.
//!
//! Boot-stage code runs on one core, but trace buffers still need interior
//! mutability without `static mut`. A [`StaticCell`] hands out at most one
//! [`Guard`] at a time. A second borrow while the first is alive (a trace
//! recorded from a fault handler, say) gets `None` and the caller drops its
//! entry.

#![cfg_attr(not(test), no_std)]

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

pub struct StaticCell<T> {
    taken: AtomicBool,
    cell: UnsafeCell<T>,
}

// Safety: access to the contents is serialized by `taken`.
unsafe impl<T: Send> Sync for StaticCell<T> {}

impl<T> StaticCell<T> {
    pub const fn new(contents: T) -> Self {
        Self {
            taken: AtomicBool::new(false),
            cell: UnsafeCell::new(contents),
        }
    }

    /// Exclusive access to the contents, or `None` if a [`Guard`] is alive.
    pub fn try_borrow_mut(&self) -> Option<Guard<'_, T>> {
        if self.taken.swap(true, Ordering::Acquire) {
            return None;
        }
        // Safety: `taken` was clear, so no other reference to the contents
        // exists until the guard releases it.
        let contents = unsafe { &mut *self.cell.get() };
        Some(Guard {
            contents,
            taken: &self.taken,
        })
    }
}

/// Exclusive access to a [`StaticCell`]'s contents; released on drop.
pub struct Guard<'a, T> {
    contents: &'a mut T,
    taken: &'a AtomicBool,
}

impl<T> Drop for Guard<'_, T> {
    fn drop(&mut self) {
        self.taken.store(false, Ordering::Release);
    }
}

impl<T> Deref for Guard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.contents
    }
}

impl<T> DerefMut for Guard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.contents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static COUNTER: StaticCell<u32> = StaticCell::new(0);

    #[test]
    fn second_borrow_is_refused_until_release() {
        let mut g = COUNTER.try_borrow_mut().unwrap();
        *g += 1;
        assert!(COUNTER.try_borrow_mut().is_none());
        drop(g);
        assert_eq!(*COUNTER.try_borrow_mut().unwrap(), 1);
    }
}
