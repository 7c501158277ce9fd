// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! What each configuration candidate contributes to a bring-up attempt.

use drv_bluefield_ddr_api::{Candidate, DdrError, SpdError, DIMMS_PER_MSS};
use ringbuf::*;

use crate::diag::{Diagnostics, Report};
use crate::params::{DdrParams, ModuleType, SpeedBin, Termination};
use crate::spd::{self, SpdBus, SpdInfo, SPD_READ_LEN};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    Slot { mss: u8, slot: u8, present: bool },
    Identified { mss: u8, dimms: u8, ranks: u8, nvdimm: u8 },
    Speed { mss: u8, bin: SpeedBin },
}

ringbuf!(Trace, 16, Trace::None);

/// Board flight time used for the PHY round-trip delay when a strategy has
/// nothing better.
const DEFAULT_BOARD_DELAY_PS: u32 = 600;

/// Base clock skew, per controller, in PHY delay-line steps.
const BASE_CLK_SKEW: [u8; 2] = [0x10, 0x18];

/// A candidate's three contributions to a bring-up attempt. Each starts from
/// the parameters the previous one left.
pub trait Strategy {
    /// Establishes which slots are populated and, where identity data
    /// exists, what is in them.
    fn identify<S: SpdBus>(
        &self,
        spd: &mut S,
        diag: &mut Diagnostics,
        params: &mut DdrParams,
    ) -> Result<(), DdrError>;

    /// Fixes the electrical and timing parameters.
    fn fill_params(&self, params: &mut DdrParams) -> Result<(), DdrError>;

    /// Applies board-specific analog settings.
    fn board_overrides(&self, params: &mut DdrParams);
}

/// A fixed memory-down profile.
struct Soldered {
    ranks: u8,
    width: u8,
    ecc: bool,
    speed: SpeedBin,
}

/// The fixed profile behind a soldered candidate.
fn soldered(c: Candidate) -> Option<Soldered> {
    match c {
        Candidate::Soldered8GbX8TwoRank => Some(Soldered {
            ranks: 2,
            width: 8,
            ecc: true,
            speed: SpeedBin::Ddr4_2400,
        }),
        Candidate::Soldered8GbX8OneRank => Some(Soldered {
            ranks: 1,
            width: 8,
            ecc: true,
            speed: SpeedBin::Ddr4_2400,
        }),
        Candidate::Soldered8GbX16OneRank => Some(Soldered {
            ranks: 1,
            width: 16,
            ecc: false,
            speed: SpeedBin::Ddr4_2133,
        }),
        Candidate::Spd | Candidate::NoMemory => None,
    }
}

/// SPD device number of `slot` on controller `mss`.
pub fn spd_dev(mss: usize, slot: usize) -> u8 {
    (mss * DIMMS_PER_MSS + slot) as u8
}

/// Reads and decodes every populated slot on `params.mss`. Slots that do not
/// answer are empty; any other failure fails the whole controller.
fn identify_from_spd<S: SpdBus>(
    spd: &mut S,
    diag: &mut Diagnostics,
    params: &mut DdrParams,
) -> Result<[Option<SpdInfo>; DIMMS_PER_MSS], DdrError> {
    let mss = params.mss;
    let mut found = [None; DIMMS_PER_MSS];
    for (slot, f) in found.iter_mut().enumerate() {
        let dev = spd_dev(mss, slot);
        let mut buf = [0u8; SPD_READ_LEN];
        match spd.read(dev, 0, &mut buf) {
            Ok(()) => {}
            Err(SpdError::Absent) => {
                ringbuf_entry!(Trace::Slot {
                    mss: mss as u8,
                    slot: slot as u8,
                    present: false
                });
                continue;
            }
            Err(e) => {
                diag.report(Report::SpdRejected {
                    mss: mss as u8,
                    slot: slot as u8,
                });
                return Err(e.into());
            }
        }
        ringbuf_entry!(Trace::Slot {
            mss: mss as u8,
            slot: slot as u8,
            present: true
        });
        match spd::parse(&buf) {
            Ok(info) => *f = Some(info),
            Err(e) => {
                diag.report(Report::SpdRejected {
                    mss: mss as u8,
                    slot: slot as u8,
                });
                return Err(e.into());
            }
        }
    }
    Ok(found)
}

impl Strategy for Candidate {
    fn identify<S: SpdBus>(
        &self,
        spd: &mut S,
        diag: &mut Diagnostics,
        params: &mut DdrParams,
    ) -> Result<(), DdrError> {
        match self {
            Candidate::Spd => {
                let found = identify_from_spd(spd, diag, params)?;
                let mut first: Option<SpdInfo> = None;
                for (slot, info) in found.iter().enumerate() {
                    let Some(info) = info else { continue };
                    match &mut first {
                        None => first = Some(*info),
                        Some(f) => {
                            if !f.compatible(info) {
                                diag.report(Report::SpdRejected {
                                    mss: params.mss as u8,
                                    slot: slot as u8,
                                });
                                return Err(SpdError::Mismatch.into());
                            }
                            f.tck_min_ps = f.tck_min_ps.max(info.tck_min_ps);
                            f.taa_min_ps = f.taa_min_ps.max(info.taa_min_ps);
                        }
                    }
                    params.dimm_present[slot] = true;
                    params.nvdimm[slot] = info.nvdimm;
                    params.dimm_count += 1;
                }
                let Some(info) = first else {
                    return Err(SpdError::Absent.into());
                };
                params.module = info.module;
                params.ranks_per_dimm = info.ranks;
                params.density_mbit = info.density_mbit;
                params.device_width = info.device_width;
                params.stack_height = info.stack_height;
                params.bank_groups = info.bank_groups;
                params.banks_per_group = info.banks_per_group;
                params.row_bits = info.row_bits;
                params.col_bits = info.col_bits;
                params.ecc = info.ecc;
                params.tck_ps = info.tck_min_ps;
                params.taa_ps = info.taa_min_ps;
            }
            Candidate::NoMemory => {
                params.dimm_count = 0;
            }
            _ => {
                params.module = ModuleType::Soldered;
                params.dimm_present = [true, false];
                params.dimm_count = 1;
            }
        }
        let mut nvdimm = 0;
        for (i, nv) in params.nvdimm.iter().enumerate() {
            nvdimm |= u8::from(*nv) << i;
        }
        ringbuf_entry!(Trace::Identified {
            mss: params.mss as u8,
            dimms: params.dimm_count,
            ranks: params.ranks_per_dimm,
            nvdimm
        });
        Ok(())
    }

    fn fill_params(&self, params: &mut DdrParams) -> Result<(), DdrError> {
        match (self, soldered(*self)) {
            (Candidate::Spd, _) => {
                // identify() left the DIMM's fastest clock in tck_ps.
                let bin = SpeedBin::for_tck_min(params.tck_ps)
                    .ok_or(DdrError::UnsupportedConfig)?;
                if params.device_width == 4 && params.stack_height > 1 {
                    // 3DS x4 needs more chip selects than the controller has.
                    return Err(DdrError::UnsupportedConfig);
                }
                params.board_delay_ps = DEFAULT_BOARD_DELAY_PS;
                params.set_speed(bin);
            }
            (_, Some(s)) => {
                params.ranks_per_dimm = s.ranks;
                params.density_mbit = 8192;
                params.device_width = s.width;
                params.stack_height = 1;
                params.bank_groups = if s.width == 16 { 2 } else { 4 };
                params.banks_per_group = 4;
                params.row_bits = if s.width == 16 { 17 } else { 16 };
                params.col_bits = 10;
                params.ecc = s.ecc;
                params.taa_ps = 13_750;
                // Memory-down routes are short.
                params.board_delay_ps = 300;
                params.set_speed(s.speed);
            }
            (_, None) => {}
        }
        ringbuf_entry!(Trace::Speed {
            mss: params.mss as u8,
            bin: params.speed
        });
        Ok(())
    }

    fn board_overrides(&self, params: &mut DdrParams) {
        if *self == Candidate::NoMemory {
            return;
        }
        params.clk_skew = BASE_CLK_SKEW[params.mss % BASE_CLK_SKEW.len()];
        params.vref_ca = 0x32;
        let (vref_dq, term) = match params.module {
            ModuleType::Rdimm | ModuleType::Lrdimm => (
                0x1c,
                Termination {
                    rtt_nom: 0,
                    rtt_wr: 2,
                    rtt_park: 3,
                    drive: 0,
                },
            ),
            ModuleType::Udimm | ModuleType::SoDimm => (
                0x20,
                Termination {
                    rtt_nom: 1,
                    rtt_wr: 1,
                    rtt_park: 0,
                    drive: 0,
                },
            ),
            ModuleType::Soldered => (
                0x24,
                Termination {
                    rtt_nom: 0,
                    rtt_wr: 0,
                    rtt_park: 4,
                    drive: 1,
                },
            ),
        };
        params.vref_dq = vref_dq;
        params.term = term;
        if params.dimm_count > 1 {
            // Two loads on the bus: terminate the idle DIMM harder.
            params.term.rtt_nom = 3;
        }
    }
}
