// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register transport for one memory controller.
//!
//! EMC and EMI registers are memory mapped. Everything else (the PUB, mode
//! registers, RCD control words, host memory and NVDIMM controllers) sits
//! behind the EMI indirect interface: stage data, write the target address,
//! write the command, then wait for READY and SUCCESS.

use core::time::Duration;
use drv_bluefield_ddr_api::{DdrError, DIMMS_PER_MSS};
use ringbuf::*;

use crate::diag::{Diagnostics, Report};
use crate::hw::{Hardware, MIN_DELAY};
use crate::nvdimm::NvdimmState;
use crate::params::DdrParams;
use crate::regs::{emc_addr, emi_addr, ind};

/// Budget for one indirect access.
pub const IND_TIMEOUT: Duration = Duration::from_millis(100);
pub const IND_INTERVAL: Duration = Duration::from_micros(100);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    Indirect {
        mss: u8,
        target: IndTarget,
        addr: u32,
        write: bool,
    },
    IndirectFailed {
        mss: u8,
        status: u32,
    },
}

ringbuf!(Trace, 32, Trace::None);

/// A register block within one memory controller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Block {
    Emc,
    Emi,
    Pub,
    PubRank(u8),
}

/// Indirect interface targets, as encoded in the command word.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum IndTarget {
    Pub = 0,
    PubRank = 1,
    Mrs = 2,
    Rcd = 3,
    Host = 4,
    Nvdimm = 5,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Op {
    Read,
    Write,
}

/// Samples `sample` until `value & mask == expected`, sleeping `interval`
/// between samples, and returns the matching value.
///
/// A `max_wait` of zero waits forever. Otherwise `None` is returned once the
/// accumulated wait reaches `max_wait`, after one final sample; the caller
/// has waited less than `max_wait + interval` in total.
pub fn poll<H: Hardware + ?Sized>(
    hw: &mut H,
    mut sample: impl FnMut(&mut H) -> u32,
    mask: u32,
    expected: u32,
    max_wait: Duration,
    interval: Duration,
) -> Option<u32> {
    let interval = interval.max(MIN_DELAY);
    let mut waited = Duration::ZERO;
    loop {
        let v = sample(hw);
        if v & mask == expected {
            return Some(v);
        }
        if !max_wait.is_zero() && waited >= max_wait {
            return None;
        }
        hw.delay(interval);
        waited = waited.saturating_add(interval);
    }
}

/// Runs one indirect command on controller `mss` with its payload already
/// staged. Returns the status word on failure.
pub(crate) fn indirect_raw<H: Hardware + ?Sized>(
    hw: &mut H,
    mss: usize,
    target: IndTarget,
    addr: u32,
    flags: u32,
) -> Result<(), u32> {
    hw.write32(emi_addr(mss, ind::ADDR), addr);
    hw.write32(emi_addr(mss, ind::CMD), ind::CMD_GO | flags | target as u32);
    let done = ind::STATUS_READY | ind::STATUS_SUCCESS;
    let status = emi_addr(mss, ind::STATUS);
    match poll(
        hw,
        |hw| hw.read32(status),
        done,
        done,
        IND_TIMEOUT,
        IND_INTERVAL,
    ) {
        Some(_) => Ok(()),
        None => Err(hw.read32(status)),
    }
}

/// Reads a PUB register with nothing but the hardware handle, for use
/// inside poll closures. Failed accesses read as zero.
pub(crate) fn pub_read_raw<H: Hardware + ?Sized>(
    hw: &mut H,
    mss: usize,
    reg: u32,
) -> u32 {
    match indirect_raw(hw, mss, IndTarget::Pub, reg, 0) {
        Ok(()) => hw.read32(emi_addr(mss, ind::data(0))),
        Err(_) => 0,
    }
}

/// The active memory controller: its hardware, its discovered parameters and
/// its NVDIMM states, borrowed together for the length of one sequence.
pub struct Mss<'a, H: Hardware> {
    pub(crate) index: usize,
    pub(crate) hw: &'a mut H,
    pub(crate) diag: &'a mut Diagnostics,
    pub(crate) params: &'a mut DdrParams,
    pub(crate) nvdimm: &'a mut [NvdimmState; DIMMS_PER_MSS],
}

impl<'a, H: Hardware> Mss<'a, H> {
    pub(crate) fn new(
        index: usize,
        hw: &'a mut H,
        diag: &'a mut Diagnostics,
        params: &'a mut DdrParams,
        nvdimm: &'a mut [NvdimmState; DIMMS_PER_MSS],
    ) -> Self {
        Self {
            index,
            hw,
            diag,
            params,
            nvdimm,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn params(&self) -> &DdrParams {
        self.params
    }

    pub fn write(
        &mut self,
        block: Block,
        reg: u32,
        data: u32,
    ) -> Result<(), DdrError> {
        match block {
            Block::Emc => {
                self.hw.write32(emc_addr(self.index, reg as usize), data);
                Ok(())
            }
            Block::Emi => {
                self.hw.write32(emi_addr(self.index, reg as usize), data);
                Ok(())
            }
            Block::Pub | Block::PubRank(_) => {
                self.pub_access(Op::Write, block, reg, data).map(|_| ())
            }
        }
    }

    pub fn read(&mut self, block: Block, reg: u32) -> Result<u32, DdrError> {
        match block {
            Block::Emc => Ok(self.hw.read32(emc_addr(self.index, reg as usize))),
            Block::Emi => Ok(self.hw.read32(emi_addr(self.index, reg as usize))),
            Block::Pub | Block::PubRank(_) => {
                self.pub_access(Op::Read, block, reg, 0)
            }
        }
    }

    pub fn modify(
        &mut self,
        block: Block,
        reg: u32,
        f: impl FnOnce(u32) -> u32,
    ) -> Result<(), DdrError> {
        let v = self.read(block, reg)?;
        self.write(block, reg, f(v))
    }

    /// One PUB register access through the indirect interface.
    pub fn pub_access(
        &mut self,
        op: Op,
        block: Block,
        reg: u32,
        data: u32,
    ) -> Result<u32, DdrError> {
        let (target, addr) = match block {
            Block::PubRank(rank) => {
                (IndTarget::PubRank, reg | u32::from(rank) << ind::RANK_SHIFT)
            }
            _ => (IndTarget::Pub, reg),
        };
        if op == Op::Write {
            self.stage(0, data);
        }
        self.indirect(target, addr, op, 0)?;
        Ok(match op {
            Op::Read => self.staged(0),
            Op::Write => data,
        })
    }

    pub(crate) fn stage(&mut self, word: usize, data: u32) {
        self.hw.write32(emi_addr(self.index, ind::data(word)), data);
    }

    pub(crate) fn staged(&mut self, word: usize) -> u32 {
        self.hw.read32(emi_addr(self.index, ind::data(word)))
    }

    /// Issues an indirect command whose payload is already staged, and
    /// reports a timeout.
    pub(crate) fn indirect(
        &mut self,
        target: IndTarget,
        addr: u32,
        op: Op,
        extra: u32,
    ) -> Result<(), DdrError> {
        let write = op == Op::Write;
        ringbuf_entry!(Trace::Indirect {
            mss: self.index as u8,
            target,
            addr,
            write
        });
        let flags = extra | if write { ind::CMD_WRITE } else { 0 };
        indirect_raw(self.hw, self.index, target, addr, flags).map_err(
            |status| {
                ringbuf_entry!(Trace::IndirectFailed {
                    mss: self.index as u8,
                    status
                });
                self.diag.report(Report::IndirectTimeout {
                    mss: self.index as u8,
                    target: target as u8,
                    addr,
                    write,
                });
                DdrError::IndirectTimeout
            },
        )
    }
}
