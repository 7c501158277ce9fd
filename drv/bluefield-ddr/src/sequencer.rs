// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PHY training, mode register and scheduler operations on the active
//! controller.

use core::time::Duration;
use drv_bluefield_ddr_api::{DdrError, HostAccessError, Operation};
use ringbuf::*;

use crate::diag::{pgsr0_fields, FieldKind, Report};
use crate::hw::{Hardware, MIN_DELAY};
use crate::regs::{self, ind, phy, Pgsr0, Pir};
use crate::transport::{poll, pub_read_raw, Block, IndTarget, Mss, Op};

/// The scheduler trigger self-clears within a handful of controller clocks.
pub const SCHED_TIMEOUT: Duration = Duration::from_micros(1);
pub const SCHED_INTERVAL: Duration = Duration::from_nanos(100);

/// Number of samples a training poll spreads its budget over.
const TRAINING_POLL_STEPS: u32 = 100;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    Training {
        mss: u8,
        op: Operation,
        pir: u32,
    },
    TrainingStatus {
        mss: u8,
        op: Operation,
        pgsr0: u32,
    },
    Mrs {
        mss: u8,
        rank: u8,
        mr: u8,
        data: u32,
        b_side: bool,
    },
    Scheduler {
        mss: u8,
        cmd0: u32,
        cmd1: u32,
    },
    HostAccess {
        mss: u8,
        write: bool,
        rank: u8,
        row: u32,
    },
}

ringbuf!(Trace, 64, Trace::None);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TrainingResult {
    Success,
    /// PGSR0 never showed IDONE.
    TimedOut,
    /// Done bits that were expected but missing, and error bits that were
    /// set, from one status snapshot.
    Failed { missing: Pgsr0, errors: Pgsr0 },
}

/// DRAM command opcodes, as used in mode register and scheduler commands.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum DramCmd {
    Nop = 0,
    Mrs = 1,
    PrechargeAll = 2,
    Refresh = 3,
    Zqcl = 4,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HostOp {
    Read,
    Write,
}

/// One burst of host data: eight beats of 64 bits, plus the ECC byte lanes.
pub type Burst = [u32; ind::DATA_WORDS];
pub type EccBurst = [u32; ind::ECC_WORDS];

/// DDR4 burst length; host access columns must be aligned to it.
const BURST_LENGTH: u32 = 8;

impl<H: Hardware> Mss<'_, H> {
    /// Starts `command` in the PUB and waits for it to finish. The outcome is
    /// judged from a single PGSR0 snapshot: every bit in `done_mask` set and
    /// none in `error_mask`. Missing and error bits are each reported once.
    pub fn issue_training_command(
        &mut self,
        command: Pir,
        timeout: Duration,
        operation: Operation,
        done_mask: Pgsr0,
        error_mask: Pgsr0,
    ) -> TrainingResult {
        let mss = self.index as u8;
        let pir = (command | Pir::INIT).bits();
        ringbuf_entry!(Trace::Training {
            mss,
            op: operation,
            pir
        });
        if self.write(Block::Pub, phy::PIR, pir).is_err() {
            return TrainingResult::TimedOut;
        }

        let interval = (timeout / TRAINING_POLL_STEPS).max(MIN_DELAY);
        let index = self.index;
        let idone = Pgsr0::IDONE.bits();
        let Some(status) = poll(
            &mut *self.hw,
            |hw| pub_read_raw(hw, index, phy::PGSR0),
            idone,
            idone,
            timeout,
            interval,
        ) else {
            self.diag
                .report(Report::TrainingTimeout { mss, op: operation });
            return TrainingResult::TimedOut;
        };
        ringbuf_entry!(Trace::TrainingStatus {
            mss,
            op: operation,
            pgsr0: status
        });

        let status = Pgsr0::from_bits_retain(status);
        let missing = done_mask.difference(status);
        let errors = status.intersection(error_mask);
        if missing.is_empty() && errors.is_empty() {
            return TrainingResult::Success;
        }

        for (kind, bits) in
            [(FieldKind::NotDone, missing), (FieldKind::Error, errors)]
        {
            for (_, name) in pgsr0_fields(bits) {
                self.diag.report(Report::TrainingField {
                    mss,
                    op: operation,
                    kind,
                    name,
                });
            }
        }
        TrainingResult::Failed { missing, errors }
    }

    /// Runs a training command and converts the outcome into an error.
    pub(crate) fn train(
        &mut self,
        command: Pir,
        timeout: Duration,
        operation: Operation,
        done_mask: Pgsr0,
        error_mask: Pgsr0,
    ) -> Result<(), DdrError> {
        match self.issue_training_command(
            command, timeout, operation, done_mask, error_mask,
        ) {
            TrainingResult::Success => Ok(()),
            TrainingResult::TimedOut => {
                Err(DdrError::TrainingTimeout(operation))
            }
            TrainingResult::Failed { .. } => {
                Err(DdrError::Training(operation))
            }
        }
    }

    /// Sends one mode register write to `rank`.
    pub fn mode_register_write(
        &mut self,
        rank: u8,
        number: u8,
        data: u32,
        command: DramCmd,
        delay: u16,
        is_last: bool,
    ) -> Result<(), DdrError> {
        self.mrs(rank, number, data, command, delay, is_last, false)
    }

    /// Sends a mode register write to the B-side outputs of the rank's
    /// RCD. Unless the RCD reports inversion disabled, it will invert the
    /// B-side address and bank bits, so they are pre-inverted here to land
    /// as intended.
    pub fn mode_register_write_b_side(
        &mut self,
        rank: u8,
        number: u8,
        data: u32,
        command: DramCmd,
        delay: u16,
        is_last: bool,
    ) -> Result<(), DdrError> {
        let dimm = rank / self.params.ranks_per_dimm.max(1);
        let rc00 = self.rcd_read(dimm, regs::RCD_RC00)?;
        let (number, data) = if rc00 & regs::RCD_RC00_INVERSION_DISABLED != 0
        {
            (number, data)
        } else {
            (
                number ^ regs::B_SIDE_BANK_INVERT,
                data ^ regs::B_SIDE_ADDR_INVERT,
            )
        };
        self.mrs(rank, number, data, command, delay, is_last, true)
    }

    fn mrs(
        &mut self,
        rank: u8,
        number: u8,
        data: u32,
        command: DramCmd,
        delay: u16,
        is_last: bool,
        b_side: bool,
    ) -> Result<(), DdrError> {
        ringbuf_entry!(Trace::Mrs {
            mss: self.index as u8,
            rank,
            mr: number,
            data,
            b_side
        });
        let w0 = data | u32::from(number & 0xf) << ind::MRS_NUMBER_SHIFT;
        let mut w1 = u32::from(rank)
            | (command as u32) << ind::MRS_CMD_SHIFT
            | u32::from(delay.min(ind::MRS_DELAY_MAX)) << ind::MRS_DELAY_SHIFT;
        if b_side {
            w1 |= ind::MRS_B_SIDE;
        }
        if is_last {
            w1 |= ind::MRS_LAST;
        }
        self.stage(0, w0);
        self.stage(1, w1);
        self.indirect(IndTarget::Mrs, 0, Op::Write, 0)
    }

    /// Reads RCD control word `word` of `dimm`.
    pub fn rcd_read(&mut self, dimm: u8, word: u32) -> Result<u32, DdrError> {
        let addr = u32::from(dimm) << ind::DIMM_SHIFT | word;
        self.indirect(IndTarget::Rcd, addr, Op::Read, 0)?;
        Ok(self.staged(0))
    }

    /// Reads or writes one burst of DRAM directly, bypassing the host
    /// interface. The address is checked against the active geometry
    /// before any register is touched.
    pub fn direct_host_access(
        &mut self,
        op: HostOp,
        ecc_enabled: bool,
        data: &mut Burst,
        ecc_data: &mut EccBurst,
        rank: u8,
        bank: u32,
        column: u32,
        row: u32,
    ) -> Result<(), HostAccessError> {
        let mss = self.index as u8;
        let p = &*self.params;
        if rank >= p.total_ranks()
            || bank >= p.banks()
            || column >= 1 << p.col_bits
            || column % BURST_LENGTH != 0
            || row >= 1 << p.row_bits
        {
            self.diag.report(Report::HostAccessInvalid { mss });
            return Err(HostAccessError::InvalidAddress);
        }
        if ecc_enabled && !p.ecc {
            self.diag.report(Report::HostAccessInvalid { mss });
            return Err(HostAccessError::EccUnavailable);
        }

        let write = op == HostOp::Write;
        ringbuf_entry!(Trace::HostAccess {
            mss,
            write,
            rank,
            row
        });
        if write {
            for (i, w) in data.iter().enumerate() {
                self.stage(i, *w);
            }
            if ecc_enabled {
                for (i, w) in ecc_data.iter().enumerate() {
                    self.hw.write32(regs::emi_addr(self.index, ind::ecc(i)), *w);
                }
            }
        }

        let addr = column
            | bank << ind::HOST_BANK_SHIFT
            | u32::from(rank) << ind::HOST_RANK_SHIFT;
        self.hw
            .write32(regs::emi_addr(self.index, ind::ADDR_HI), row);
        let flags = if ecc_enabled { ind::CMD_ECC } else { 0 };
        let op = if write { Op::Write } else { Op::Read };
        if self.indirect(IndTarget::Host, addr, op, flags).is_err() {
            self.diag.report(Report::HostAccessTimeout { mss });
            return Err(HostAccessError::Timeout);
        }

        if !write {
            for (i, w) in data.iter_mut().enumerate() {
                *w = self.staged(i);
            }
            if ecc_enabled {
                for (i, w) in ecc_data.iter_mut().enumerate() {
                    *w = self.hw.read32(regs::emi_addr(self.index, ind::ecc(i)));
                }
            }
        }
        Ok(())
    }

    /// Runs one transaction through the PUB's scheduler: PUB mode on, load
    /// both command words, trigger, wait for the trigger to self-clear, PUB
    /// mode off.
    pub fn scheduler_single_op(
        &mut self,
        cmd0: u32,
        cmd1: u32,
    ) -> Result<(), DdrError> {
        ringbuf_entry!(Trace::Scheduler {
            mss: self.index as u8,
            cmd0,
            cmd1
        });
        self.modify(Block::Pub, phy::PGCR1, |v| v | phy::PGCR1_PUBMODE)?;
        let r = self.scheduler_trigger(cmd0, cmd1);
        // PUB mode must come off even if the transaction never finished.
        let off = self.modify(Block::Pub, phy::PGCR1, |v| v & !phy::PGCR1_PUBMODE);
        r.and(off)
    }

    fn scheduler_trigger(&mut self, cmd0: u32, cmd1: u32) -> Result<(), DdrError> {
        self.write(Block::Pub, phy::SCHCR1, cmd1)?;
        self.write(Block::Pub, phy::SCHCR0, cmd0 | phy::SCHCR0_TRIG)?;
        let index = self.index;
        let cleared = poll(
            &mut *self.hw,
            |hw| pub_read_raw(hw, index, phy::SCHCR0) | pending_on_error(hw, index),
            phy::SCHCR0_TRIG,
            0,
            SCHED_TIMEOUT,
            SCHED_INTERVAL,
        );
        if cleared.is_none() {
            self.diag.report(Report::SchedulerTimeout {
                mss: self.index as u8,
            });
            return Err(DdrError::SchedulerTimeout);
        }
        Ok(())
    }

    /// Issues a NOP carrying `cmd0`'s rank and configuration fields.
    pub fn scheduler_nop(&mut self, cmd0: u32) -> Result<(), DdrError> {
        self.scheduler_single_op(cmd0 & phy::SCHCR0_CFG_MASK, 0)
    }
}

/// A failed indirect read comes back as zero, which would look like a
/// cleared trigger; keep it looking pending instead.
fn pending_on_error<H: Hardware + ?Sized>(hw: &mut H, mss: usize) -> u32 {
    let status = hw.read32(regs::emi_addr(mss, ind::STATUS));
    let ok = ind::STATUS_READY | ind::STATUS_SUCCESS;
    if status & ok == ok {
        0
    } else {
        phy::SCHCR0_TRIG
    }
}
