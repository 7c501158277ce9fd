// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The always-on RSHIM block: power-loss watchdog, the ADR save handshake
//! and the scratch words the memory handoff is left in.

use core::time::Duration;
use drv_bluefield_ddr_api::MemCtrlHandoff;
use ringbuf::*;
use zerocopy::IntoBytes;

use crate::hw::Hardware;
use crate::regs::rsh::{self, AdrCtl, AdrStatus, PwrWdog};
use crate::regs::rshim_addr;

/// Interval between ADR status samples during a save.
pub const ADR_TICK: Duration = Duration::from_micros(100);

/// Budget for each ADR step on one controller.
pub const ADR_STEP_BUDGET: Duration = Duration::from_millis(20);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    Watchdog(u32),
    Step { mss: u8, step: AdrStep },
    Handoff { mss: u8, word: u8, value: u32 },
}

ringbuf!(Trace, 16, Trace::None);

/// The three ADR steps, in the order they are run.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AdrStep {
    Flush,
    SelfRefresh,
    Save,
}

impl AdrStep {
    fn request(self) -> AdrCtl {
        match self {
            AdrStep::Flush => AdrCtl::FLUSH,
            AdrStep::SelfRefresh => AdrCtl::SELF_REFRESH,
            AdrStep::Save => AdrCtl::SAVE,
        }
    }

    fn done(self) -> AdrStatus {
        match self {
            AdrStep::Flush => AdrStatus::FLUSH_DONE,
            AdrStep::SelfRefresh => AdrStatus::SR_DONE,
            AdrStep::Save => AdrStatus::SAVE_DONE,
        }
    }

    fn next(self) -> Option<AdrStep> {
        match self {
            AdrStep::Flush => Some(AdrStep::SelfRefresh),
            AdrStep::SelfRefresh => Some(AdrStep::Save),
            AdrStep::Save => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SaveOutcome {
    /// The controller was never brought up.
    NotNeeded,
    Saved,
    /// The step that ran out of budget. The controller is treated as done.
    TimedOut(AdrStep),
}

/// Lets a power loss flush and save memory without software: the
/// autonomous flush path on, the interrupt path and software override off.
pub fn enable_power_watchdog<H: Hardware>(hw: &mut H) {
    hw.modify32(rshim_addr(rsh::PWR_WDOG_CTL), |v| {
        let mut w = PwrWdog::from_bits_retain(v);
        w.insert(PwrWdog::FLUSH_EN);
        w.remove(PwrWdog::INTR_EN | PwrWdog::SW_OVERRIDE);
        ringbuf_entry!(Trace::Watchdog(w.bits()));
        w.bits()
    });
}

fn request<H: Hardware>(hw: &mut H, mss: usize, step: AdrStep) {
    ringbuf_entry!(Trace::Step {
        mss: mss as u8,
        step
    });
    hw.write32(rshim_addr(rsh::adr_ctl(mss)), step.request().bits());
}

/// One controller's progress through flush, self-refresh and save. Several
/// of these are serviced in turn so that a slow controller does not hold up
/// the others.
pub struct AdrSequence {
    mss: usize,
    step: AdrStep,
    waited: Duration,
}

impl AdrSequence {
    pub fn start<H: Hardware>(hw: &mut H, mss: usize) -> Self {
        request(hw, mss, AdrStep::Flush);
        Self {
            mss,
            step: AdrStep::Flush,
            waited: Duration::ZERO,
        }
    }

    /// Samples the current step once, `elapsed` after the previous sample,
    /// and moves on if it is done. Returns the outcome when the sequence
    /// has finished, one way or the other.
    pub fn service<H: Hardware>(
        &mut self,
        hw: &mut H,
        elapsed: Duration,
    ) -> Option<SaveOutcome> {
        self.waited += elapsed;
        let status = AdrStatus::from_bits_retain(
            hw.read32(rshim_addr(rsh::adr_status(self.mss))),
        );
        if status.contains(self.step.done()) {
            let Some(next) = self.step.next() else {
                return Some(SaveOutcome::Saved);
            };
            self.step = next;
            self.waited = Duration::ZERO;
            request(hw, self.mss, next);
            None
        } else if self.waited >= ADR_STEP_BUDGET {
            Some(SaveOutcome::TimedOut(self.step))
        } else {
            None
        }
    }
}

/// Words of scratch space a handoff record takes.
pub const HANDOFF_WORDS: usize = core::mem::size_of::<MemCtrlHandoff>() / 4;

/// Leaves `h` in controller `mss`'s scratch words for the next stage.
pub fn write_handoff<H: Hardware>(hw: &mut H, mss: usize, h: &MemCtrlHandoff) {
    for (i, chunk) in h.as_bytes().chunks_exact(4).enumerate() {
        let value = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        ringbuf_entry!(Trace::Handoff {
            mss: mss as u8,
            word: i as u8,
            value
        });
        hw.write32(rshim_addr(rsh::scratch(mss, i)), value);
    }
}
