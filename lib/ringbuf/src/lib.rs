// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trace ring buffers for boot-stage drivers
//!
//! Boot firmware has no console it can count on while the memory subsystem
//! is still coming up, so each module records what it did into a small
//! static ring buffer that can be read out afterwards over JTAG or from a
//! crash dump.
//!
//! ## Constraints
//!
//! The type in the ring buffer must implement both `Copy` and `PartialEq`.
//!
//! If you use the variants of the `ringbuf!` macro that leave the name of the
//! data structure implicit, you can only have one per module. (You can lift
//! this constraint by providing a name.)
//!
//! ## Creating a ring buffer
//!
//! ```
//! ringbuf!(Trace, 16, Trace::None);
//! ringbuf_entry!(Trace::PhyInit { mss: 0 });
//! ```
//!
//! A named buffer is declared and fed the same way:
//!
//! ```
//! ringbuf!(REPORTS, Report, 32, Report::None);
//! ringbuf_entry!(REPORTS, Report::IndirectTimeout { reg: 0x0d });
//! ```
//!
//! ## Host builds
//!
//! When built for a hosted target (anything but `target_os = "none"`) the
//! buffers are thread-local instead of `static`, so that unit tests running
//! in parallel each see only their own entries. Tests read them back with
//! [`Ringbuf::iter`]:
//!
//! ```
//! REPORTS.with(|r| r.borrow().iter().count())
//! ```
//!
//! ## Inspecting a ring buffer via GDB
//!
//! Assuming symbols are loaded, print the static by its full path:
//!
//! ```console
//! (gdb) set print pretty on
//! (gdb) print drv_bluefield_ddr::nvdimm::__RINGBUF
//! ```

#![cfg_attr(target_os = "none", no_std)]

/// Re-export the bits we use from `static_cell` so that code generated by the
/// macros is guaranteed to be able to find them.
pub use static_cell::StaticCell;

#[cfg(not(target_os = "none"))]
#[doc(hidden)]
pub use std::thread_local as __thread_local;

/// Declares a ringbuffer in the current module or context.
///
/// `ringbuf!(NAME, Type, N, expr)` makes a ringbuffer named `NAME`,
/// containing entries of type `Type`, with room for `N` such entries, all of
/// which are initialized to `expr`.
///
/// On target the type of `NAME` is `StaticCell<Ringbuf<T, N>>`; on a hosted
/// build it is a `thread_local!` key holding a `RefCell<Ringbuf<T, N>>`.
///
/// If you omit the name, it will default to `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[cfg(target_os = "none")]
        #[used]
        static $name: $crate::StaticCell<$crate::Ringbuf<$t, $n>> =
            $crate::StaticCell::new($crate::Ringbuf::new($init));

        #[cfg(not(target_os = "none"))]
        $crate::__thread_local! {
            static $name: ::core::cell::RefCell<$crate::Ringbuf<$t, $n>> =
                const { ::core::cell::RefCell::new($crate::Ringbuf::new($init)) };
        }
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
    ($t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
}

/// Inserts data into a named ringbuffer (which should have been declared with
/// the `ringbuf!` macro).
///
/// `ringbuf_entry!(NAME, expr)` will insert `expr` into the ringbuffer called
/// `NAME`. Without a name it defaults to `__RINGBUF`.
///
/// On target, an entry made while the buffer is already borrowed (from a
/// fault handler interrupting a trace, say) is dropped.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate both buf and payload, without letting them access each
        // other, by evaluating them in a tuple where each cannot
        // accidentally use the other's binding.
        let (p, buf) = ($payload, &$buf);
        #[cfg(target_os = "none")]
        if let Some(mut rb) = $crate::StaticCell::try_borrow_mut(buf) {
            $crate::Ringbuf::entry(&mut *rb, line!() as u16, p);
        }
        #[cfg(not(target_os = "none"))]
        buf.with(|rb| {
            $crate::Ringbuf::entry(&mut *rb.borrow_mut(), line!() as u16, p)
        });
    }};
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let _ = &$buf;
        let _ = &$payload;
    }};
    ($payload:expr) => {{
        let _ = &$payload;
    }};
}

/// Inserts data into a ringbuffer at the root of this crate.
#[cfg(not(feature = "disabled"))]
#[allow(clippy::crate_in_macro_def)]
#[macro_export]
macro_rules! ringbuf_entry_root {
    ($buf:ident, $payload:expr) => {
        $crate::ringbuf_entry!(crate::$buf, $payload);
    };
    ($payload:expr) => {
        $crate::ringbuf_entry!(crate::__RINGBUF, $payload);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry_root {
    ($buf:ident, $payload:expr) => {{
        let _ = &$payload;
    }};
    ($payload:expr) => {{
        let _ = &$payload;
    }};
}

/// A single [`Ringbuf`] entry. When an entry is generated with an identical
/// payload to the most recent entry (same `line` and `payload`), `count` is
/// incremented rather than generating a new entry.
#[derive(Debug, Copy, Clone)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

/// A ring buffer of parametrized type and size. See the [`ringbuf!`] macro.
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    pub const fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: T) {
        // None is treated as an out-of-range index: nothing is reused and
        // the first entry lands in slot 0.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        // Not a remainder: usize::MAX must wrap to 0, and most boot cores
        // would rather not divide.
        let ndx = {
            let last_plus_1 = last.wrapping_add(1);
            if last_plus_1 >= self.buffer.len() {
                0
            } else {
                last_plus_1
            }
        };

        let ent = &mut self.buffer[ndx];
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };

        self.last = Some(ndx);
    }

    /// Walks the populated entries from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &RingbufEntry<T>> + '_ {
        let start = match self.last {
            Some(last) => last.wrapping_add(1) % N.max(1),
            None => 0,
        };
        self.buffer[start..]
            .iter()
            .chain(self.buffer[..start].iter())
            .filter(|e| e.count != 0)
    }

    /// Empties the buffer, keeping generations so a debugger can still tell
    /// old slots from new ones.
    pub fn clear(&mut self) {
        for ent in self.buffer.iter_mut() {
            ent.count = 0;
        }
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, PartialEq)]
    enum Trace {
        None,
        Step(u8),
    }

    #[test]
    fn coalesces_repeats() {
        let mut rb = Ringbuf::<Trace, 4>::new(Trace::None);
        rb.entry(10, Trace::Step(1));
        rb.entry(10, Trace::Step(1));
        rb.entry(11, Trace::Step(1));
        let v: Vec<_> = rb.iter().map(|e| (e.line, e.count)).collect();
        assert_eq!(v, [(10, 2), (11, 1)]);
    }

    #[test]
    fn iterates_oldest_first_after_wrap() {
        let mut rb = Ringbuf::<Trace, 3>::new(Trace::None);
        for i in 0..5 {
            rb.entry(1, Trace::Step(i));
        }
        let v: Vec<_> = rb.iter().map(|e| e.payload).collect();
        assert_eq!(v, [Trace::Step(2), Trace::Step(3), Trace::Step(4)]);
    }

    #[test]
    fn clear_empties() {
        let mut rb = Ringbuf::<Trace, 3>::new(Trace::None);
        rb.entry(1, Trace::Step(0));
        rb.clear();
        assert_eq!(rb.iter().count(), 0);
        rb.entry(1, Trace::Step(0));
        assert_eq!(rb.buffer[0].generation, 2);
    }

    ringbuf!(LOCAL, Trace, 8, Trace::None);

    #[test]
    fn macros_record_on_host() {
        for _ in 0..2 {
            ringbuf_entry!(LOCAL, Trace::Step(7));
        }
        ringbuf_entry!(LOCAL, Trace::Step(7));
        LOCAL.with(|r| {
            let r = r.borrow();
            let e: Vec<_> = r.iter().map(|e| (e.payload, e.count)).collect();
            // Repeats coalesce only when recorded from the same line.
            assert_eq!(e, [(Trace::Step(7), 2), (Trace::Step(7), 1)]);
        });
    }
}
