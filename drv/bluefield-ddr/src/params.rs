// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Discovered and derived configuration of one memory controller.

use drv_bluefield_ddr_api::{Candidate, Summary, DIMMS_PER_MSS};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ModuleType {
    Rdimm,
    Udimm,
    SoDimm,
    Lrdimm,
    Soldered,
}

impl ModuleType {
    pub fn registered(self) -> bool {
        matches!(self, ModuleType::Rdimm | ModuleType::Lrdimm)
    }
}

/// DDR4 speed bins the controller supports.
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum SpeedBin {
    Ddr4_1600,
    Ddr4_1866,
    Ddr4_2133,
    Ddr4_2400,
    Ddr4_2666,
    Ddr4_2933,
    Ddr4_3200,
}

impl SpeedBin {
    /// Fastest first.
    pub const ALL: [SpeedBin; 7] = [
        SpeedBin::Ddr4_3200,
        SpeedBin::Ddr4_2933,
        SpeedBin::Ddr4_2666,
        SpeedBin::Ddr4_2400,
        SpeedBin::Ddr4_2133,
        SpeedBin::Ddr4_1866,
        SpeedBin::Ddr4_1600,
    ];

    pub const fn tck_ps(self) -> u32 {
        match self {
            SpeedBin::Ddr4_1600 => 1250,
            SpeedBin::Ddr4_1866 => 1071,
            SpeedBin::Ddr4_2133 => 938,
            SpeedBin::Ddr4_2400 => 833,
            SpeedBin::Ddr4_2666 => 750,
            SpeedBin::Ddr4_2933 => 682,
            SpeedBin::Ddr4_3200 => 625,
        }
    }

    pub const fn mts(self) -> u16 {
        match self {
            SpeedBin::Ddr4_1600 => 1600,
            SpeedBin::Ddr4_1866 => 1866,
            SpeedBin::Ddr4_2133 => 2133,
            SpeedBin::Ddr4_2400 => 2400,
            SpeedBin::Ddr4_2666 => 2666,
            SpeedBin::Ddr4_2933 => 2933,
            SpeedBin::Ddr4_3200 => 3200,
        }
    }

    /// The fastest bin whose clock period is no shorter than `tck_min_ps`.
    pub fn for_tck_min(tck_min_ps: u32) -> Option<SpeedBin> {
        Self::ALL.into_iter().find(|b| b.tck_ps() >= tck_min_ps)
    }
}

/// CAS write latency for a data rate (JEDEC DDR4, 1tCK write preamble).
fn cwl_for_mts(mts: u32) -> u8 {
    match mts {
        0..=1600 => 9,
        1601..=1866 => 10,
        1867..=2133 => 11,
        2134..=2400 => 12,
        2401..=2666 => 14,
        _ => 16,
    }
}

pub const CL_MIN: u8 = 9;
pub const CL_MAX: u8 = 24;

/// Fixed PHY pipeline overhead in clocks, added to CL and the board flight
/// time to get the read round-trip delay.
const PHY_RTD_OVERHEAD: u32 = 4;

/// On-die termination and drive settings, in mode register encodings.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Termination {
    pub rtt_nom: u8,
    pub rtt_wr: u8,
    pub rtt_park: u8,
    pub drive: u8,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DdrParams {
    pub mss: usize,
    pub dimm_count: u8,
    pub dimm_present: [bool; DIMMS_PER_MSS],
    pub nvdimm: [bool; DIMMS_PER_MSS],
    pub module: ModuleType,
    pub ranks_per_dimm: u8,
    /// Per-die density in megabits.
    pub density_mbit: u32,
    /// Device data width: 4, 8 or 16.
    pub device_width: u8,
    /// Dies per package; above one for 3DS parts.
    pub stack_height: u8,
    pub bank_groups: u8,
    pub banks_per_group: u8,
    pub row_bits: u8,
    pub col_bits: u8,
    pub ecc: bool,

    pub speed: SpeedBin,
    pub tck_ps: u32,
    pub taa_ps: u32,
    pub cl: u8,
    pub cwl: u8,
    pub phy_rtd: u8,
    pub board_delay_ps: u32,

    /// VREF settings in the PHY's 0.5%-of-VDD steps.
    pub vref_dq: u8,
    pub vref_ca: u8,
    pub term: Termination,
    pub clk_skew: u8,
    pub reduced_freq: bool,
}

impl DdrParams {
    pub const fn new(mss: usize) -> Self {
        Self {
            mss,
            dimm_count: 0,
            dimm_present: [false; DIMMS_PER_MSS],
            nvdimm: [false; DIMMS_PER_MSS],
            module: ModuleType::Soldered,
            ranks_per_dimm: 0,
            density_mbit: 0,
            device_width: 0,
            stack_height: 1,
            bank_groups: 0,
            banks_per_group: 0,
            row_bits: 0,
            col_bits: 0,
            ecc: false,
            speed: SpeedBin::Ddr4_1600,
            tck_ps: 0,
            taa_ps: 0,
            cl: 0,
            cwl: 0,
            phy_rtd: 0,
            board_delay_ps: 0,
            vref_dq: 0,
            vref_ca: 0,
            term: Termination {
                rtt_nom: 0,
                rtt_wr: 0,
                rtt_park: 0,
                drive: 0,
            },
            clk_skew: 0,
            reduced_freq: false,
        }
    }

    pub fn total_ranks(&self) -> u8 {
        self.dimm_count * self.ranks_per_dimm
    }

    pub fn banks(&self) -> u32 {
        u32::from(self.bank_groups) * u32::from(self.banks_per_group)
    }

    /// Sets the clock from `speed` and derives the latencies.
    pub fn set_speed(&mut self, speed: SpeedBin) {
        self.speed = speed;
        self.tck_ps = speed.tck_ps();
        self.derive_latencies();
    }

    /// Effective data rate in MT/s.
    pub fn speed_mts(&self) -> u16 {
        if self.reduced_freq {
            self.speed.mts() / 2
        } else {
            self.speed.mts()
        }
    }

    fn derive_latencies(&mut self) {
        let tck = self.tck_ps.max(1);
        let cl = self.taa_ps.div_ceil(tck);
        self.cl = (cl.min(u32::from(CL_MAX)) as u8).max(CL_MIN);
        let mts = 2_000_000 / tck;
        self.cwl = cwl_for_mts(mts);
        let flight = (2 * self.board_delay_ps).div_ceil(tck);
        let rtd = u32::from(self.cl) + flight + PHY_RTD_OVERHEAD;
        self.phy_rtd = rtd.min(u32::from(u8::MAX)) as u8;
    }

    /// Halves the data rate: the clock period doubles and CAS latency, CAS
    /// write latency and PHY round-trip delay are re-derived for it.
    pub fn apply_reduced_frequency(&mut self) {
        self.tck_ps *= 2;
        self.reduced_freq = true;
        self.derive_latencies();
    }

    /// Installed capacity across all populated slots, in MiB.
    pub fn capacity_mib(&self) -> u32 {
        if self.device_width == 0 {
            return 0;
        }
        let devices = 64 / u32::from(self.device_width);
        let per_rank = self.density_mbit / 8 * devices
            * u32::from(self.stack_height);
        per_rank * u32::from(self.total_ranks())
    }

    /// DDR4 mode registers MR0 through MR6 for this configuration.
    pub fn mode_registers(&self) -> [u32; 7] {
        let cl = cl_code(self.cl);
        let mr0 = (cl & 0x1) << 2 | (cl >> 1 & 0x7) << 4 | (cl >> 4) << 12;
        let mr1 = 1 // DLL enable
            | u32::from(self.term.drive & 0x3) << 1
            | u32::from(self.term.rtt_nom & 0x7) << 8;
        let mr2 = u32::from(cwl_code(self.cwl)) << 3
            | u32::from(self.term.rtt_wr & 0x7) << 9;
        let mr3 = 0;
        let mr4 = 0;
        let mr5 = u32::from(self.term.rtt_park & 0x7) << 6;
        let mr6 = u32::from(self.vref_dq & 0x3f) | 1 << 10;
        [mr0, mr1, mr2, mr3, mr4, mr5, mr6]
    }

    pub fn summary(&self, candidate: Candidate) -> Summary {
        let mut nvdimm_mask = 0;
        for (i, nv) in self.nvdimm.iter().enumerate() {
            if *nv {
                nvdimm_mask |= 1 << i;
            }
        }
        Summary {
            candidate,
            dimm_count: self.dimm_count,
            ranks_per_dimm: self.ranks_per_dimm,
            capacity_mib: self.capacity_mib(),
            speed_mts: self.speed_mts(),
            reduced_freq: self.reduced_freq,
            ecc: self.ecc,
            nvdimm_mask,
        }
    }
}

/// MR0 CAS latency encoding, five bits: A12, A6:A4, A2.
fn cl_code(cl: u8) -> u32 {
    match cl {
        9..=16 => u32::from(cl - 9),
        18 => 0b01000,
        20 => 0b01001,
        22 => 0b01010,
        24 => 0b01011,
        23 => 0b01100,
        17 => 0b01101,
        19 => 0b01110,
        21 => 0b01111,
        _ => 0,
    }
}

fn cwl_code(cwl: u8) -> u8 {
    match cwl {
        9 => 0,
        10 => 1,
        11 => 2,
        12 => 3,
        14 => 4,
        16 => 5,
        18 => 6,
        _ => 7,
    }
}
