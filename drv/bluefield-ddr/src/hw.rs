// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The one place the engine touches the SoC: 32-bit register access and a
//! busy-wait delay.

use core::time::Duration;

/// Smallest delay the engine will ask for. Zero-length poll intervals are
/// rounded up to this.
pub const MIN_DELAY: Duration = Duration::from_nanos(1);

pub trait Hardware {
    fn read32(&mut self, addr: usize) -> u32;
    fn write32(&mut self, addr: usize, value: u32);
    fn delay(&mut self, d: Duration);

    fn modify32(&mut self, addr: usize, f: impl FnOnce(u32) -> u32)
    where
        Self: Sized,
    {
        let v = self.read32(addr);
        self.write32(addr, f(v));
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "aarch64", target_os = "none"))] {
        use aarch64_cpu::registers::{Readable, CNTFRQ_EL0, CNTPCT_EL0};

        /// Memory-mapped register access on the boot core, timed by the
        /// architected generic timer.
        pub struct BlueFieldHw {
            _private: (),
        }

        impl BlueFieldHw {
            /// # Safety
            ///
            /// The caller must be running at EL3 with the register map in
            /// `regs` identity-mapped as device memory, and must not create
            /// a second `BlueFieldHw` while this one is alive.
            pub unsafe fn new() -> Self {
                Self { _private: () }
            }
        }

        impl Hardware for BlueFieldHw {
            fn read32(&mut self, addr: usize) -> u32 {
                // Safety: `new`'s contract makes every address in the
                // register map a valid, aligned device location.
                unsafe { core::ptr::read_volatile(addr as *const u32) }
            }

            fn write32(&mut self, addr: usize, value: u32) {
                // Safety: as for `read32`.
                unsafe { core::ptr::write_volatile(addr as *mut u32, value) }
            }

            fn delay(&mut self, d: Duration) {
                let freq = u128::from(CNTFRQ_EL0.get());
                let ticks = (d.as_nanos() * freq).div_ceil(1_000_000_000);
                let ticks = u64::try_from(ticks).unwrap_or(u64::MAX);
                let start = CNTPCT_EL0.get();
                while CNTPCT_EL0.get().wrapping_sub(start) < ticks {
                    core::hint::spin_loop();
                }
            }
        }
    }
}
