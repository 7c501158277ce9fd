// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The fixed sequence that takes one controller from reset to trained,
//! enabled memory, given a complete set of parameters.

use core::time::Duration;
use drv_bluefield_ddr_api::{DdrError, Operation};
use ringbuf::*;

use crate::diag::Report;
use crate::hw::Hardware;
use crate::params::DdrParams;
use crate::regs::{emc, emc_addr, ind, phy, Pgsr0, Pir};
use crate::sequencer::{Burst, DramCmd, EccBurst, HostOp};
use crate::transport::{poll, Block, Mss};

const PHY_INIT_TIMEOUT: Duration = Duration::from_millis(10);
const DRAM_INIT_TIMEOUT: Duration = Duration::from_millis(10);
const DATA_TRAINING_TIMEOUT: Duration = Duration::from_millis(100);
const EMC_ENABLE_TIMEOUT: Duration = Duration::from_millis(1);
const EMC_ENABLE_INTERVAL: Duration = Duration::from_micros(10);

/// tMOD in clocks: the gap required after each mode register write.
const TMOD_CLOCKS: u16 = 24;

/// The order DDR4 wants its mode registers loaded in.
const MR_ORDER: [u8; 7] = [3, 6, 5, 4, 2, 1, 0];

const PHY_INIT: Pir = Pir::PLLINIT
    .union(Pir::DCAL)
    .union(Pir::ZCAL)
    .union(Pir::PHYRST);
const PHY_INIT_DONE: Pgsr0 = Pgsr0::IDONE
    .union(Pgsr0::PLDONE)
    .union(Pgsr0::DCDONE)
    .union(Pgsr0::ZCDONE);

const DATA_TRAINING: Pir = Pir::WL
    .union(Pir::QSGATE)
    .union(Pir::WLADJ)
    .union(Pir::RDDSKW)
    .union(Pir::WRDSKW)
    .union(Pir::RDEYE)
    .union(Pir::WREYE)
    .union(Pir::VREF);
const DATA_TRAINING_DONE: Pgsr0 = Pgsr0::IDONE
    .union(Pgsr0::WLDONE)
    .union(Pgsr0::QSGDONE)
    .union(Pgsr0::WLADONE)
    .union(Pgsr0::RDDONE)
    .union(Pgsr0::WDDONE)
    .union(Pgsr0::REDONE)
    .union(Pgsr0::WEDONE)
    .union(Pgsr0::VDONE);
const DATA_TRAINING_ERRORS: Pgsr0 = Pgsr0::WLERR
    .union(Pgsr0::QSGERR)
    .union(Pgsr0::WLAERR)
    .union(Pgsr0::RDERR)
    .union(Pgsr0::WDERR)
    .union(Pgsr0::REERR)
    .union(Pgsr0::WEERR)
    .union(Pgsr0::VERR);

/// Seed for the per-rank sanity pattern.
const SANITY_PATTERN: u32 = 0x5aa5_c33c;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    Start { mss: u8, ranks: u8, tck_ps: u32 },
    Emc { dimm_cfg: u32, timing1: u32 },
    Step { mss: u8, step: Step },
    Enabled { mss: u8 },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Step {
    PhyInit,
    DramInit,
    ModeRegisters,
    DataTraining,
    Precharge,
    Enable,
    Sanity,
}

ringbuf!(Trace, 32, Trace::None);

fn dimm_cfg(p: &DdrParams) -> u32 {
    let mut present = 0;
    for (slot, populated) in p.dimm_present.iter().enumerate() {
        if *populated {
            present |= 1 << slot;
        }
    }
    let width = match p.device_width {
        4 => 0,
        8 => 1,
        _ => 2,
    };
    let density = (p.density_mbit / 256).max(1).trailing_zeros();
    let mut cfg = present << emc::DIMM_CFG_PRESENT_SHIFT
        | u32::from(p.ranks_per_dimm.saturating_sub(1) & 0x3)
            << emc::DIMM_CFG_RANKS_SHIFT
        | width << emc::DIMM_CFG_WIDTH_SHIFT
        | (density & 0xf) << emc::DIMM_CFG_DENSITY_SHIFT
        | u32::from(p.stack_height.saturating_sub(1) & 0x7)
            << emc::DIMM_CFG_STACK_SHIFT;
    if p.module.registered() {
        cfg |= emc::DIMM_CFG_REGISTERED;
    }
    if p.ecc {
        cfg |= emc::DIMM_CFG_ECC;
    }
    cfg
}

fn sanity_burst(rank: u8) -> Burst {
    core::array::from_fn(|i| {
        SANITY_PATTERN.rotate_left(i as u32 + u32::from(rank)) ^ i as u32
    })
}

impl<H: Hardware> Mss<'_, H> {
    /// Runs the whole bring-up sequence against the current parameters.
    pub fn init_memory(&mut self) -> Result<(), DdrError> {
        let mss = self.index as u8;
        ringbuf_entry!(Trace::Start {
            mss,
            ranks: self.params.total_ranks(),
            tck_ps: self.params.tck_ps
        });

        self.program_emc()?;
        self.program_pub()?;

        ringbuf_entry!(Trace::Step {
            mss,
            step: Step::PhyInit
        });
        self.train(
            PHY_INIT,
            PHY_INIT_TIMEOUT,
            Operation::PhyInit,
            PHY_INIT_DONE,
            Pgsr0::ZCERR,
        )?;

        ringbuf_entry!(Trace::Step {
            mss,
            step: Step::DramInit
        });
        let mut dram_init = Pir::DRAMRST | Pir::DRAMINIT;
        if self.params.module.registered() {
            dram_init |= Pir::RDIMMINIT;
        }
        self.train(
            dram_init,
            DRAM_INIT_TIMEOUT,
            Operation::DramInit,
            Pgsr0::IDONE | Pgsr0::DIDONE,
            Pgsr0::empty(),
        )?;

        ringbuf_entry!(Trace::Step {
            mss,
            step: Step::ModeRegisters
        });
        self.load_mode_registers()?;

        ringbuf_entry!(Trace::Step {
            mss,
            step: Step::DataTraining
        });
        self.train(
            DATA_TRAINING,
            DATA_TRAINING_TIMEOUT,
            Operation::DataTraining,
            DATA_TRAINING_DONE,
            DATA_TRAINING_ERRORS,
        )?;

        ringbuf_entry!(Trace::Step {
            mss,
            step: Step::Precharge
        });
        let ranks = (1u32 << self.params.total_ranks()) - 1;
        let cmd0 = (DramCmd::PrechargeAll as u32) << phy::SCHCR0_CMD_SHIFT
            | ranks << phy::SCHCR0_RANK_SHIFT;
        self.scheduler_single_op(cmd0, 0)?;
        self.scheduler_nop(cmd0)?;

        ringbuf_entry!(Trace::Step {
            mss,
            step: Step::Enable
        });
        self.enable_controller()?;

        ringbuf_entry!(Trace::Step {
            mss,
            step: Step::Sanity
        });
        self.sanity_check()?;

        ringbuf_entry!(Trace::Enabled { mss });
        Ok(())
    }

    fn program_emc(&mut self) -> Result<(), DdrError> {
        let p = &*self.params;
        let cfg = dimm_cfg(p);
        let timing1 = u32::from(p.cl)
            | u32::from(p.cwl) << 8
            | u32::from(p.phy_rtd) << 16;
        let addr_map = u32::from(p.col_bits)
            | u32::from(p.row_bits) << 8
            | p.banks() << 16;
        let odt = u32::from(p.term.rtt_nom)
            | u32::from(p.term.rtt_wr) << 4
            | u32::from(p.term.rtt_park) << 8
            | u32::from(p.term.drive) << 12;
        let ctl = if p.ecc { emc::Ctl::ECC } else { emc::Ctl::empty() };
        let (tck, skew) = (p.tck_ps, u32::from(p.clk_skew));
        ringbuf_entry!(Trace::Emc {
            dimm_cfg: cfg,
            timing1
        });

        let regs = [
            (emc::CTL, ctl.bits()),
            (emc::DIMM_CFG, cfg),
            (emc::TIMING0, tck),
            (emc::TIMING1, timing1),
            (emc::ADDR_MAP, addr_map),
            (emc::ODT, odt),
            (emc::SKEW, skew),
        ];
        for (reg, value) in regs {
            self.write(Block::Emc, reg as u32, value)?;
        }
        Ok(())
    }

    fn program_pub(&mut self) -> Result<(), DdrError> {
        let mut dcr = phy::DCR_DDR4;
        if self.params.module.registered() {
            dcr |= phy::DCR_REGISTERED;
        }
        let dtpr0 = u32::from(self.params.cl)
            | u32::from(self.params.cwl) << 8
            | u32::from(self.params.phy_rtd) << 16;
        let iovcr0 =
            u32::from(self.params.vref_dq) | u32::from(self.params.vref_ca) << 8;
        let skew = u32::from(self.params.clk_skew);
        let mrs = self.params.mode_registers();

        self.write(Block::Pub, phy::DCR, dcr)?;
        self.write(Block::Pub, phy::DTPR0, dtpr0)?;
        for (n, value) in mrs.iter().enumerate() {
            self.write(Block::Pub, phy::mr(n as u8), *value)?;
        }
        self.write(Block::Pub, phy::IOVCR0, iovcr0)?;
        self.write(Block::Pub, phy::ACBDLR0, skew)
    }

    fn load_mode_registers(&mut self) -> Result<(), DdrError> {
        let mrs = self.params.mode_registers();
        let registered = self.params.module.registered();
        for rank in 0..self.params.total_ranks() {
            for (i, &mr) in MR_ORDER.iter().enumerate() {
                let last = i == MR_ORDER.len() - 1;
                let data = mrs[usize::from(mr)];
                self.mode_register_write(
                    rank,
                    mr,
                    data,
                    DramCmd::Mrs,
                    TMOD_CLOCKS,
                    last && !registered,
                )?;
                if registered {
                    self.mode_register_write_b_side(
                        rank,
                        mr,
                        data,
                        DramCmd::Mrs,
                        TMOD_CLOCKS,
                        last,
                    )?;
                }
            }
        }
        Ok(())
    }

    fn enable_controller(&mut self) -> Result<(), DdrError> {
        self.modify(Block::Emc, emc::CTL as u32, |v| {
            v | emc::Ctl::ENABLE.bits()
        })?;
        let status = emc_addr(self.index, emc::STATUS);
        let done = emc::Status::INIT_DONE.bits();
        poll(
            &mut *self.hw,
            |hw| hw.read32(status),
            done,
            done,
            EMC_ENABLE_TIMEOUT,
            EMC_ENABLE_INTERVAL,
        )
        .map(|_| ())
        .ok_or(DdrError::ControllerEnableTimeout)
    }

    /// Writes a distinct burst to every rank, then reads them all back.
    fn sanity_check(&mut self) -> Result<(), DdrError> {
        let ranks = self.params.total_ranks();
        let mut ecc: EccBurst = [0; ind::ECC_WORDS];
        for rank in 0..ranks {
            let mut burst = sanity_burst(rank);
            self.direct_host_access(
                HostOp::Write,
                false,
                &mut burst,
                &mut ecc,
                rank,
                0,
                0,
                0,
            )?;
        }
        for rank in 0..ranks {
            let mut burst = [0; ind::DATA_WORDS];
            self.direct_host_access(
                HostOp::Read,
                false,
                &mut burst,
                &mut ecc,
                rank,
                0,
                0,
                0,
            )?;
            let expected = sanity_burst(rank);
            if let Some(word) = (0..burst.len()).find(|&i| burst[i] != expected[i]) {
                self.diag.report(Report::DataMismatch {
                    mss: self.index as u8,
                    rank,
                    word: word as u8,
                });
                return Err(DdrError::DataMismatch);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{Ctx, FakeSoc};
    use crate::params::{ModuleType, SpeedBin};

    fn rdimm(ctx: &mut Ctx<'_>) {
        let p = &mut ctx.params;
        p.module = ModuleType::Rdimm;
        p.dimm_count = 2;
        p.dimm_present = [true, true];
        p.ranks_per_dimm = 2;
        p.density_mbit = 8192;
        p.device_width = 8;
        p.bank_groups = 4;
        p.banks_per_group = 4;
        p.row_bits = 16;
        p.col_bits = 10;
        p.ecc = true;
        p.taa_ps = 13_750;
        p.set_speed(SpeedBin::Ddr4_2400);
    }

    #[test]
    fn full_sequence_on_an_rdimm_pair() {
        let mut soc = FakeSoc::new();
        let mut ctx = soc.context(0);
        rdimm(&mut ctx);
        ctx.mss().init_memory().unwrap();

        // Every rank gets every mode register on both sides, in order, and
        // only the final B-side write of a rank is flagged last.
        let log = &ctx.soc.mrs_log;
        assert_eq!(log.len(), 4 * 7 * 2);
        for (rank, writes) in log.chunks(14).enumerate() {
            let a: Vec<u8> =
                writes.iter().filter(|w| !w.b_side).map(|w| w.mr).collect();
            assert_eq!(a, MR_ORDER);
            assert!(writes.iter().all(|w| w.rank as usize == rank));
            let lasts: Vec<bool> = writes.iter().map(|w| w.last).collect();
            assert_eq!(lasts.iter().filter(|l| **l).count(), 1);
            assert!(writes[13].last && writes[13].b_side);
        }

        assert_eq!(ctx.soc.sched_log.len(), 2);
        assert_eq!(
            ctx.soc.sched_log[0].1,
            (DramCmd::PrechargeAll as u32) << phy::SCHCR0_CMD_SHIFT
                | 0xf << phy::SCHCR0_RANK_SHIFT
        );
        assert_eq!(ctx.soc.pub_reg(0, phy::DCR), phy::DCR_DDR4 | phy::DCR_REGISTERED);
    }

    #[test]
    fn failed_training_stops_before_enable() {
        let mut soc = FakeSoc::new();
        soc.trains = Box::new(|_| false);
        let mut ctx = soc.context(1);
        rdimm(&mut ctx);
        assert_eq!(
            ctx.mss().init_memory(),
            Err(DdrError::Training(Operation::DataTraining))
        );
        assert!(ctx.soc.sched_log.is_empty());
        assert!(crate::diag::reported().contains(&Report::TrainingField {
            mss: 1,
            op: Operation::DataTraining,
            kind: crate::diag::FieldKind::Error,
            name: "QSGERR",
        }));
    }

    #[test]
    fn dimm_cfg_encodes_geometry() {
        let mut p = DdrParams::new(0);
        p.dimm_present = [true, false];
        p.ranks_per_dimm = 2;
        p.device_width = 16;
        p.density_mbit = 8192;
        p.stack_height = 1;
        let cfg = dimm_cfg(&p);
        assert_eq!(cfg & 0x3, 0b01);
        assert_eq!(cfg >> emc::DIMM_CFG_RANKS_SHIFT & 0x3, 1);
        assert_eq!(cfg >> emc::DIMM_CFG_WIDTH_SHIFT & 0x3, 2);
        assert_eq!(cfg >> emc::DIMM_CFG_DENSITY_SHIFT & 0xf, 5);
        assert_eq!(cfg & emc::DIMM_CFG_REGISTERED, 0);
    }
}
