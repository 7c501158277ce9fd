// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DDR bring-up and NVDIMM persistence for BlueField memory subsystems.
//!
//! The boot stage hands an [`Engine`] the hardware, an SPD bus and (if it
//! knows one) the board identity, then calls [`Engine::bring_up`] for each
//! controller. Once memory is up, [`Engine::restore_and_arm_all_nvdimms`]
//! brings back any saved NVDIMM contents and arms the modules for the next
//! power loss; the reset and power-loss paths call
//! [`Engine::save_all_nvdimms`].
//!
//! Nothing here fails the boot. A controller that cannot be brought up is
//! reported absent and the caller carries on with whatever memory it has.

#![cfg_attr(target_os = "none", no_std)]

pub mod board;
pub mod bringup;
pub mod candidate;
pub mod diag;
pub mod hw;
pub mod nvdimm;
pub mod params;
pub mod regs;
pub mod rshim;
pub mod sequencer;
pub mod spd;
pub mod transport;

#[cfg(test)]
mod fake;

use core::time::Duration;
use drv_bluefield_ddr_api::{
    Candidate, DdrError, MemCtrlHandoff, NvdimmError, Summary, DIMMS_PER_MSS,
    MSS_COUNT,
};
use ringbuf::*;

use crate::board::{BoardId, KnownSystem, KNOWN_SYSTEMS};
use crate::candidate::{spd_dev, Strategy};
use crate::diag::{Diagnostics, Report};
use crate::hw::Hardware;
use crate::nvdimm::NvdimmState;
use crate::params::DdrParams;
use crate::rshim::{AdrSequence, SaveOutcome, ADR_TICK};
use crate::spd::SpdBus;
use crate::transport::Mss;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    Attempt {
        mss: u8,
        candidate: Candidate,
        reduced_freq: bool,
    },
    Up {
        mss: u8,
        candidate: Candidate,
        capacity_mib: u32,
    },
    Absent(u8),
    SpdProbe {
        mss: u8,
        readable: bool,
    },
    KnownSystem {
        mss: u8,
        candidate: Candidate,
    },
    Revoked,
    NvdimmFailed {
        mss: u8,
        dimm: u8,
        err: NvdimmError,
    },
    WatchdogEnabled,
    Save {
        mss: u8,
        outcome: SaveOutcome,
    },
}

ringbuf!(Trace, 32, Trace::None);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Status {
    Unknown,
    Up(Summary),
    Absent,
}

struct Controller {
    params: DdrParams,
    status: Status,
    nvdimm: [NvdimmState; DIMMS_PER_MSS],
}

impl Controller {
    fn new(index: usize) -> Self {
        Self {
            params: DdrParams::new(index),
            status: Status::Unknown,
            nvdimm: [NvdimmState::default(); DIMMS_PER_MSS],
        }
    }
}

pub struct Engine<H: Hardware, S: SpdBus> {
    hw: H,
    spd: S,
    diag: Diagnostics,
    board: Option<BoardId>,
    revoked: bool,
    systems: &'static [KnownSystem],
    ctrl: [Controller; MSS_COUNT],
}

impl<H: Hardware, S: SpdBus> Engine<H, S> {
    pub fn new(hw: H, spd: S, board: Option<BoardId>) -> Self {
        Self::with_systems(hw, spd, board, KNOWN_SYSTEMS)
    }

    /// As [`Engine::new`], looking boards up in `systems` instead of the
    /// built-in table.
    pub fn with_systems(
        hw: H,
        spd: S,
        board: Option<BoardId>,
        systems: &'static [KnownSystem],
    ) -> Self {
        Self {
            hw,
            spd,
            diag: Diagnostics::new(),
            board,
            revoked: false,
            systems,
            ctrl: core::array::from_fn(Controller::new),
        }
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diag
    }

    /// The board identity, unless a failed known-system configuration
    /// revoked it.
    pub fn board(&self) -> Option<&BoardId> {
        self.board.as_ref()
    }

    pub fn summary(&self, index: usize) -> Option<Summary> {
        match self.ctrl.get(index)?.status {
            Status::Up(s) => Some(s),
            _ => None,
        }
    }

    pub fn nvdimm_state(&self, index: usize, dimm: usize) -> Option<NvdimmState> {
        self.ctrl.get(index)?.nvdimm.get(dimm).copied()
    }

    /// Makes controller `index` the active one. Fails for a controller with
    /// no DIMMs behind it.
    pub fn select_controller(
        &mut self,
        index: usize,
    ) -> Result<Mss<'_, H>, DdrError> {
        let c = self.ctrl.get_mut(index).ok_or(DdrError::NoSuchController)?;
        if c.params.dimm_count == 0 {
            return Err(DdrError::ControllerAbsent);
        }
        Ok(Mss::new(
            index,
            &mut self.hw,
            &mut self.diag,
            &mut c.params,
            &mut c.nvdimm,
        ))
    }

    /// Brings up controller `index`, returning what it found. A controller
    /// already up or already found absent is not touched again.
    pub fn bring_up(&mut self, index: usize) -> Option<Summary> {
        match self.ctrl.get(index)?.status {
            Status::Up(s) => return Some(s),
            Status::Absent => return None,
            Status::Unknown => {}
        }

        // An unknown board, or a known one whose configuration failed and
        // was revoked, goes on to the search.
        if self.board.is_some() {
            if let Ok(found) = self.apply_known_system_config(index) {
                return found;
            }
        }

        match self.search(index) {
            Some(s) => {
                self.ctrl[index].status = Status::Up(s);
                Some(s)
            }
            None => {
                self.mark_absent(index);
                None
            }
        }
    }

    /// Applies the board's fixed configuration to controller `index`, if the
    /// board is a known system. Returns `Ok(None)` if the board has no memory
    /// on this controller. A failed configuration revokes the board identity.
    pub fn apply_known_system_config(
        &mut self,
        index: usize,
    ) -> Result<Option<Summary>, DdrError> {
        if index >= MSS_COUNT {
            return Err(DdrError::NoSuchController);
        }
        if self.revoked {
            return Err(DdrError::BoardRevoked);
        }
        let board = self.board.as_ref().ok_or(DdrError::UnknownBoard)?;
        let system = board::lookup(self.systems, board.id, &board.name)
            .ok_or(DdrError::UnknownBoard)?;
        let candidate = system.mss[index];
        ringbuf_entry!(Trace::KnownSystem {
            mss: index as u8,
            candidate
        });

        if candidate == Candidate::NoMemory {
            self.mark_absent(index);
            return Ok(None);
        }
        match self.try_candidate(index, candidate, false) {
            Ok(s) => {
                self.ctrl[index].status = Status::Up(s);
                Ok(Some(s))
            }
            Err(e) => {
                self.revoke();
                Err(e)
            }
        }
    }

    fn revoke(&mut self) {
        ringbuf_entry!(Trace::Revoked);
        let id = self.board.take().and_then(|b| b.id);
        self.revoked = true;
        self.diag.report(Report::BoardRevoked { id });
    }

    fn mark_absent(&mut self, index: usize) {
        ringbuf_entry!(Trace::Absent(index as u8));
        let c = &mut self.ctrl[index];
        c.params = DdrParams::new(index);
        c.status = Status::Absent;
        self.diag.report(Report::ControllerAbsent { mss: index as u8 });
    }

    /// True if any slot on controller `index` answers a one-byte SPD read.
    /// Nothing is reported either way.
    pub fn probe_spd(&mut self, index: usize) -> bool {
        let was_quiet = self.diag.set_quiet(true);
        let mut byte = [0u8; 1];
        let readable = (0..DIMMS_PER_MSS)
            .any(|slot| self.spd.read(spd_dev(index, slot), 0, &mut byte).is_ok());
        self.diag.set_quiet(was_quiet);
        ringbuf_entry!(Trace::SpdProbe {
            mss: index as u8,
            readable
        });
        readable
    }

    fn search(&mut self, index: usize) -> Option<Summary> {
        if self.probe_spd(index) {
            for reduced in [false, true] {
                if let Ok(s) = self.try_candidate(index, Candidate::Spd, reduced)
                {
                    return Some(s);
                }
            }
            return None;
        }

        let was_quiet = self.diag.set_quiet(true);
        let mut found = None;
        'search: for reduced in [false, true] {
            for candidate in Candidate::SOLDERED {
                if let Ok(s) = self.try_candidate(index, candidate, reduced) {
                    found = Some(s);
                    break 'search;
                }
            }
        }
        self.diag.set_quiet(was_quiet);
        found
    }

    /// One bring-up attempt of `candidate` on controller `index`, from fresh
    /// parameters.
    pub fn try_candidate(
        &mut self,
        index: usize,
        candidate: Candidate,
        reduced_freq: bool,
    ) -> Result<Summary, DdrError> {
        ringbuf_entry!(Trace::Attempt {
            mss: index as u8,
            candidate,
            reduced_freq
        });
        let r = self.attempt(index, candidate, reduced_freq);
        match r {
            Ok(s) => ringbuf_entry!(Trace::Up {
                mss: index as u8,
                candidate,
                capacity_mib: s.capacity_mib
            }),
            Err(err) => self.diag.report(Report::CandidateFailed {
                mss: index as u8,
                candidate,
                reduced_freq,
                err,
            }),
        }
        r
    }

    fn attempt(
        &mut self,
        index: usize,
        candidate: Candidate,
        reduced_freq: bool,
    ) -> Result<Summary, DdrError> {
        let c = self.ctrl.get_mut(index).ok_or(DdrError::NoSuchController)?;
        c.params = DdrParams::new(index);
        c.nvdimm = [NvdimmState::default(); DIMMS_PER_MSS];
        candidate.identify(&mut self.spd, &mut self.diag, &mut c.params)?;
        candidate.fill_params(&mut c.params)?;
        candidate.board_overrides(&mut c.params);
        if reduced_freq {
            c.params.apply_reduced_frequency();
        }

        let mut m = self.select_controller(index)?;
        let r = m.init_memory();
        if r.is_err() {
            // Leave nothing behind that looks like usable memory.
            self.ctrl[index].params.dimm_count = 0;
        }
        r?;
        Ok(self.ctrl[index].params.summary(candidate))
    }

    /// Restores and arms every NVDIMM on every controller that is up.
    /// Returns how many ended up armed. The power-loss watchdog is enabled
    /// if any restore or arm succeeded.
    pub fn restore_and_arm_all_nvdimms(&mut self) -> usize {
        let mut armed = 0;
        let mut progress = false;
        for index in 0..MSS_COUNT {
            if !matches!(self.ctrl[index].status, Status::Up(_)) {
                continue;
            }
            let Ok(mut m) = self.select_controller(index) else {
                continue;
            };
            for dimm in 0..DIMMS_PER_MSS {
                if !m.params().nvdimm[dimm] {
                    continue;
                }
                if m.nvdimm_state(dimm) == Some(NvdimmState::default()) {
                    match m.nvdimm_restore(dimm) {
                        Ok(()) => progress = true,
                        Err(err) => ringbuf_entry!(Trace::NvdimmFailed {
                            mss: index as u8,
                            dimm: dimm as u8,
                            err
                        }),
                    }
                }
                if m.nvdimm_state(dimm) == Some(NvdimmState::Restored) {
                    match m.nvdimm_arm(dimm) {
                        Ok(()) => progress = true,
                        Err(err) => ringbuf_entry!(Trace::NvdimmFailed {
                            mss: index as u8,
                            dimm: dimm as u8,
                            err
                        }),
                    }
                }
                if m.nvdimm_state(dimm) == Some(NvdimmState::Armed) {
                    armed += 1;
                }
            }
        }
        if progress {
            ringbuf_entry!(Trace::WatchdogEnabled);
            rshim::enable_power_watchdog(&mut self.hw);
        }
        armed
    }

    /// Flushes, self-refreshes and saves every controller that is up,
    /// servicing them round-robin. A controller that runs out of budget is
    /// reported and marked saved anyway; the rest still complete.
    pub fn save_all_nvdimms(&mut self) -> [SaveOutcome; MSS_COUNT] {
        let mut outcome = [SaveOutcome::NotNeeded; MSS_COUNT];
        let mut seq: [Option<AdrSequence>; MSS_COUNT] =
            core::array::from_fn(|_| None);
        for (index, s) in seq.iter_mut().enumerate() {
            let c = &mut self.ctrl[index];
            if !matches!(c.status, Status::Up(_)) {
                continue;
            }
            for nv in c.nvdimm.iter_mut() {
                if *nv == NvdimmState::Armed {
                    // Armed to SaveInProgress is always allowed.
                    let _ = nv.advance(NvdimmState::SaveInProgress);
                }
            }
            *s = Some(AdrSequence::start(&mut self.hw, index));
        }

        let mut elapsed = Duration::ZERO;
        loop {
            let mut running = false;
            for (index, s) in seq.iter_mut().enumerate() {
                let Some(sq) = s else { continue };
                let Some(o) = sq.service(&mut self.hw, elapsed) else {
                    running = true;
                    continue;
                };
                *s = None;
                outcome[index] = o;
                ringbuf_entry!(Trace::Save {
                    mss: index as u8,
                    outcome: o
                });
                if let SaveOutcome::TimedOut(step) = o {
                    self.diag.report(Report::SaveTimeout {
                        mss: index as u8,
                        step,
                    });
                }
                // A controller out of budget is done all the same.
                for nv in self.ctrl[index].nvdimm.iter_mut() {
                    if *nv == NvdimmState::SaveInProgress {
                        let _ = nv.advance(NvdimmState::Saved);
                    }
                }
            }
            if !running {
                break;
            }
            self.hw.delay(ADR_TICK);
            elapsed = ADR_TICK;
        }
        outcome
    }

    /// The handoff record for controller `index`.
    pub fn handoff(&self, index: usize) -> MemCtrlHandoff {
        MemCtrlHandoff::from(self.summary(index))
    }

    /// Leaves every controller's handoff record in RSHIM scratch.
    pub fn publish_handoff(&mut self) {
        for index in 0..MSS_COUNT {
            let h = self.handoff(index);
            rshim::write_handoff(&mut self.hw, index, &h);
        }
    }

    #[cfg(test)]
    pub(crate) fn hw(&mut self) -> &mut H {
        &mut self.hw
    }
}
