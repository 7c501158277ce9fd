// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Failure reporting.
//!
//! Everything that goes wrong is reported here rather than returned up to the
//! boot stage, which only cares whether memory came up. Speculative probing
//! mutes the sink; muted reports are counted and dropped.

use bitflags::Flags;
use drv_bluefield_ddr_api::{Candidate, DdrError, Operation};
use ringbuf::*;

use crate::regs::Pgsr0;
use crate::rshim::AdrStep;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FieldKind {
    NotDone,
    Error,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NvdimmOp {
    Idle,
    Restore,
    Arm,
    Abort,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Report {
    None,
    IndirectTimeout {
        mss: u8,
        target: u8,
        addr: u32,
        write: bool,
    },
    TrainingTimeout {
        mss: u8,
        op: Operation,
    },
    TrainingField {
        mss: u8,
        op: Operation,
        kind: FieldKind,
        name: &'static str,
    },
    SchedulerTimeout {
        mss: u8,
    },
    HostAccessInvalid {
        mss: u8,
    },
    HostAccessTimeout {
        mss: u8,
    },
    DataMismatch {
        mss: u8,
        rank: u8,
        word: u8,
    },
    SpdRejected {
        mss: u8,
        slot: u8,
    },
    CandidateFailed {
        mss: u8,
        candidate: Candidate,
        reduced_freq: bool,
        err: DdrError,
    },
    ControllerAbsent {
        mss: u8,
    },
    BoardRevoked {
        id: Option<u32>,
    },
    NvdimmTimeout {
        mss: u8,
        dimm: u8,
        op: NvdimmOp,
    },
    NvdimmAborted {
        mss: u8,
        dimm: u8,
        recovered: bool,
    },
    SaveTimeout {
        mss: u8,
        step: AdrStep,
    },
}

ringbuf!(REPORTS, Report, 64, Report::None);

pub struct Diagnostics {
    quiet: bool,
    suppressed: u32,
}

impl Diagnostics {
    pub const fn new() -> Self {
        Self {
            quiet: false,
            suppressed: 0,
        }
    }

    pub fn report(&mut self, r: Report) {
        if self.quiet {
            self.suppressed = self.suppressed.saturating_add(1);
        } else {
            ringbuf_entry!(REPORTS, r);
        }
    }

    /// Mutes or unmutes reporting, returning the previous setting so that
    /// nested probes can restore it.
    pub fn set_quiet(&mut self, quiet: bool) -> bool {
        core::mem::replace(&mut self.quiet, quiet)
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Reports dropped while muted.
    pub fn suppressed(&self) -> u32 {
        self.suppressed
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterates over the set bits of a word, lowest first, yielding each as a
/// single-bit mask.
#[derive(Copy, Clone, Debug)]
pub struct SetBits(u32);

impl SetBits {
    pub const fn new(word: u32) -> Self {
        Self(word)
    }
}

impl Iterator for SetBits {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.0 == 0 {
            return None;
        }
        let low = self.0 & self.0.wrapping_neg();
        self.0 ^= low;
        Some(low)
    }
}

/// Name of the single bit `bit` in the register described by `F`.
pub fn field_name<F: Flags<Bits = u32>>(bit: u32) -> &'static str {
    F::FLAGS
        .iter()
        .find(|f| f.value().bits() == bit)
        .map(|f| f.name())
        .unwrap_or("RESERVED")
}

/// Yields `(bit, name)` for every set bit of a PGSR0 snapshot.
pub fn pgsr0_fields(bits: Pgsr0) -> impl Iterator<Item = (u32, &'static str)> {
    SetBits::new(bits.bits()).map(|b| (b, field_name::<Pgsr0>(b)))
}

/// Everything reported on this thread so far, oldest first, with coalesced
/// repeats expanded.
#[cfg(test)]
pub fn reported() -> Vec<Report> {
    REPORTS.with(|r| {
        r.borrow()
            .iter()
            .flat_map(|e| core::iter::repeat(e.payload).take(e.count as usize))
            .collect()
    })
}

/// Forgets everything reported on this thread.
#[cfg(test)]
pub fn clear_reported() {
    REPORTS.with(|r| r.borrow_mut().clear())
}
