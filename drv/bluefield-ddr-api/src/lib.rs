// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared between the DDR bring-up engine and the boot stages that
//! consume its results (secure boot, the debug console, and the handoff to
//! the OS loader).

#![cfg_attr(not(test), no_std)]

use num_derive::FromPrimitive;
use static_assertions::const_assert_eq;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Number of memory controllers (MSS instances) on the SoC.
pub const MSS_COUNT: usize = 2;

/// DIMM slots behind each memory controller.
pub const DIMMS_PER_MSS: usize = 2;

/// A named memory configuration strategy.
///
/// Exactly one candidate is active per controller attempt. `Spd` derives the
/// configuration from the DIMM's own identification data; the `Soldered*`
/// variants are fixed profiles for memory-down boards with no SPD; `NoMemory`
/// is the terminal choice for an empty controller.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum Candidate {
    Spd = 0,
    Soldered8GbX8TwoRank = 1,
    Soldered8GbX8OneRank = 2,
    Soldered8GbX16OneRank = 3,
    NoMemory = 0xff,
}

impl Candidate {
    /// Soldered profiles in the order the search tries them.
    pub const SOLDERED: [Candidate; 3] = [
        Candidate::Soldered8GbX8TwoRank,
        Candidate::Soldered8GbX8OneRank,
        Candidate::Soldered8GbX16OneRank,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Candidate::Spd => "spd",
            Candidate::Soldered8GbX8TwoRank => "soldered-8gb-x8-2r",
            Candidate::Soldered8GbX8OneRank => "soldered-8gb-x8-1r",
            Candidate::Soldered8GbX16OneRank => "soldered-8gb-x16-1r",
            Candidate::NoMemory => "none",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [
            Candidate::Spd,
            Candidate::Soldered8GbX8TwoRank,
            Candidate::Soldered8GbX8OneRank,
            Candidate::Soldered8GbX16OneRank,
            Candidate::NoMemory,
        ]
        .into_iter()
        .find(|c| c.name() == name)
    }
}

/// A PHY training step, as named in diagnostics.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Operation {
    PhyInit = 1,
    DramInit,
    DataTraining,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HostAccessError {
    /// Rank, bank, column or row outside the active geometry, or a column
    /// not aligned to a burst. No register was touched.
    InvalidAddress = 1,
    /// ECC data was supplied but the controller runs without ECC.
    EccUnavailable,
    /// The controller never reported the access complete.
    Timeout,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SpdError {
    /// Nothing answered at the slot's SPD address.
    Absent = 1,
    /// The device answered but a transfer failed part way.
    Bus,
    NotDdr4,
    /// Checksum or field encoding is invalid.
    Malformed,
    /// Populated slots on one controller disagree on geometry.
    Mismatch,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DdrError {
    NoSuchController,
    /// The controller has no DIMMs, or was declared absent.
    ControllerAbsent,
    IndirectTimeout,
    Training(Operation),
    TrainingTimeout(Operation),
    SchedulerTimeout,
    ControllerEnableTimeout,
    HostAccess(HostAccessError),
    DataMismatch,
    Spd(SpdError),
    UnsupportedConfig,
    UnknownBoard,
    /// The board's fixed configuration failed earlier in this boot; its
    /// identity is no longer trusted.
    BoardRevoked,
}

impl From<SpdError> for DdrError {
    fn from(e: SpdError) -> Self {
        DdrError::Spd(e)
    }
}

impl From<HostAccessError> for DdrError {
    fn from(e: HostAccessError) -> Self {
        DdrError::HostAccess(e)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NvdimmError {
    IllegalTransition = 1,
    NotAnNvdimm,
    /// The NVDIMM controller stayed busy past the idle wait.
    Busy,
    /// The operation did not complete in the module's own timeout and was
    /// aborted.
    Timeout,
    /// The operation timed out and the abort failed too.
    AbortFailed,
    Transport,
}

/// What a successful bring-up produced for one controller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Summary {
    pub candidate: Candidate,
    pub dimm_count: u8,
    pub ranks_per_dimm: u8,
    pub capacity_mib: u32,
    /// Effective data rate, after any reduced-frequency fallback.
    pub speed_mts: u16,
    pub reduced_freq: bool,
    pub ecc: bool,
    /// Bit `n` set if slot `n` holds an NVDIMM.
    pub nvdimm_mask: u8,
}

pub const HANDOFF_VERSION: u8 = 1;

const HANDOFF_REDUCED_FREQ: u8 = 1 << 0;
const HANDOFF_ECC: u8 = 1 << 1;

/// Per-controller record left in scratch memory for the OS loader.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct MemCtrlHandoff {
    pub capacity_mib: u32,
    pub speed_mts: u16,
    pub dimm_count: u8,
    pub ranks_per_dimm: u8,
    pub nvdimm_mask: u8,
    pub flags: u8,
    pub candidate: u8,
    pub version: u8,
}

const_assert_eq!(core::mem::size_of::<MemCtrlHandoff>(), 12);

impl MemCtrlHandoff {
    /// The record for a controller with no memory behind it.
    pub const fn absent() -> Self {
        Self {
            capacity_mib: 0,
            speed_mts: 0,
            dimm_count: 0,
            ranks_per_dimm: 0,
            nvdimm_mask: 0,
            flags: 0,
            candidate: Candidate::NoMemory as u8,
            version: HANDOFF_VERSION,
        }
    }

    pub fn candidate(&self) -> Option<Candidate> {
        num_traits::FromPrimitive::from_u8(self.candidate)
    }

    pub fn reduced_freq(&self) -> bool {
        self.flags & HANDOFF_REDUCED_FREQ != 0
    }

    pub fn ecc(&self) -> bool {
        self.flags & HANDOFF_ECC != 0
    }
}

impl From<&Summary> for MemCtrlHandoff {
    fn from(s: &Summary) -> Self {
        let mut flags = 0;
        if s.reduced_freq {
            flags |= HANDOFF_REDUCED_FREQ;
        }
        if s.ecc {
            flags |= HANDOFF_ECC;
        }
        Self {
            capacity_mib: s.capacity_mib,
            speed_mts: s.speed_mts,
            dimm_count: s.dimm_count,
            ranks_per_dimm: s.ranks_per_dimm,
            nvdimm_mask: s.nvdimm_mask,
            flags,
            candidate: s.candidate as u8,
            version: HANDOFF_VERSION,
        }
    }
}

impl From<Option<Summary>> for MemCtrlHandoff {
    fn from(s: Option<Summary>) -> Self {
        match s {
            Some(s) => Self::from(&s),
            None => Self::absent(),
        }
    }
}
