// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! NVDIMM-N restore, arm and abort, over the indirect interface.
//!
//! Each NVDIMM slot carries an [`NvdimmState`]. Restore and arm run a
//! bounded loop against the module's own advertised timeout; a loop that
//! runs out of budget aborts the operation, and the DIMM then sits in
//! `Idle` for the rest of the boot stage with either `Failed` (the abort
//! worked) or `Unrecoverable` (it did not).

use core::time::Duration;
use drv_bluefield_ddr_api::{NvdimmError, DIMMS_PER_MSS};
use ringbuf::*;

use crate::diag::{NvdimmOp, Report};
use crate::hw::Hardware;
use crate::regs::{ind, nv, nv::CmdStatus0, nv::FuncCmd, nv::MgtCmd0};
use crate::transport::{indirect_raw, poll, IndTarget, Mss, Op};

/// Interval between status samples while an NVDIMM operation runs.
pub const NV_POLL_TICK: Duration = Duration::from_millis(10);

/// How long a module may stay busy with a previous operation before a new
/// one is refused.
pub const NV_IDLE_WAIT: Duration = Duration::from_millis(500);

/// Longest operation timeout honored, whatever the module advertises.
pub const NV_TIMEOUT_MAX: Duration = Duration::from_secs(300);

/// Status bits that mean the module will not accept a new operation.
const BUSY: CmdStatus0 = CmdStatus0::CONTROLLER_BUSY
    .union(CmdStatus0::SAVE_IN_PROGRESS)
    .union(CmdStatus0::RESTORE_IN_PROGRESS)
    .union(CmdStatus0::ERASE_IN_PROGRESS)
    .union(CmdStatus0::ABORT_IN_PROGRESS)
    .union(CmdStatus0::ARM_IN_PROGRESS);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    State {
        mss: u8,
        dimm: u8,
        from: NvdimmState,
        to: NvdimmState,
    },
    Start {
        mss: u8,
        dimm: u8,
        op: NvdimmOp,
        budget_ms: u32,
    },
    Reissue {
        mss: u8,
        dimm: u8,
        op: NvdimmOp,
    },
    Done {
        mss: u8,
        dimm: u8,
        op: NvdimmOp,
        status: u8,
    },
}

ringbuf!(Trace, 32, Trace::None);

/// How a DIMM that is not (or no longer) in service got there.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Not yet restored this boot.
    Pending,
    /// An operation timed out and was aborted cleanly.
    Failed,
    /// An operation timed out and the abort failed as well.
    Unrecoverable,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NvdimmState {
    Idle(Outcome),
    Restoring,
    Restored,
    Arming,
    Armed,
    Aborting,
    SaveInProgress,
    Saved,
}

impl Default for NvdimmState {
    fn default() -> Self {
        NvdimmState::Idle(Outcome::Pending)
    }
}

impl NvdimmState {
    /// The lifecycle only moves forward, except through `Aborting`.
    pub fn can_transition(self, to: NvdimmState) -> bool {
        use NvdimmState::*;
        matches!(
            (self, to),
            (Idle(Outcome::Pending), Restoring)
                | (Restoring, Restored)
                | (Restored, Arming)
                | (Arming, Armed)
                | (Armed, SaveInProgress)
                | (SaveInProgress, Saved)
                | (Restoring | Arming, Aborting)
                | (Aborting, Idle(Outcome::Failed | Outcome::Unrecoverable))
        )
    }

    pub fn advance(&mut self, to: NvdimmState) -> Result<(), NvdimmError> {
        if !self.can_transition(to) {
            return Err(NvdimmError::IllegalTransition);
        }
        *self = to;
        Ok(())
    }
}

/// Decodes a JESD245 timeout register pair: the low fifteen bits count
/// milliseconds, or seconds if bit 15 is set. The result is clamped to
/// something the engine is willing to wait.
pub fn decode_timeout(raw: u16) -> Duration {
    let count = u64::from(raw & !nv::TIMEOUT_SECONDS);
    let d = if raw & nv::TIMEOUT_SECONDS != 0 {
        Duration::from_secs(count)
    } else {
        Duration::from_millis(count)
    };
    d.clamp(NV_POLL_TICK, NV_TIMEOUT_MAX)
}

/// The registers one long-running operation is driven through.
struct LongOp {
    kind: NvdimmOp,
    timeout: u8,
    clear: MgtCmd0,
    start_reg: u8,
    start: u8,
    in_progress: CmdStatus0,
    status: u8,
}

const RESTORE: LongOp = LongOp {
    kind: NvdimmOp::Restore,
    timeout: nv::RESTORE_TIMEOUT,
    clear: MgtCmd0::CL_RESTORE,
    start_reg: nv::FUNC_CMD,
    start: FuncCmd::START_RESTORE.bits(),
    in_progress: CmdStatus0::RESTORE_IN_PROGRESS,
    status: nv::RESTORE_STATUS,
};

const ARM: LongOp = LongOp {
    kind: NvdimmOp::Arm,
    timeout: nv::ARM_TIMEOUT,
    clear: MgtCmd0::CL_ARM,
    start_reg: nv::ARM_CMD,
    start: nv::ARM_SAVE_N_ARM,
    in_progress: CmdStatus0::ARM_IN_PROGRESS,
    status: nv::ARM_STATUS,
};

fn nv_addr(dimm: usize, reg: u8) -> u32 {
    (dimm as u32) << ind::DIMM_SHIFT | u32::from(reg)
}

/// Reads CMD_STATUS0 with nothing but the hardware handle, for poll
/// closures. A failed access reads as busy.
fn cmd_status_raw<H: Hardware + ?Sized>(
    hw: &mut H,
    mss: usize,
    dimm: usize,
) -> u32 {
    match indirect_raw(
        hw,
        mss,
        IndTarget::Nvdimm,
        nv_addr(dimm, nv::CMD_STATUS0),
        0,
    ) {
        Ok(()) => {
            hw.read32(crate::regs::emi_addr(mss, ind::data(0))) & 0xff
        }
        Err(_) => u32::from(BUSY.bits()),
    }
}

impl<H: Hardware> Mss<'_, H> {
    pub fn nvdimm_state(&self, dimm: usize) -> Option<NvdimmState> {
        self.nvdimm.get(dimm).copied()
    }

    fn nv_advance(
        &mut self,
        dimm: usize,
        to: NvdimmState,
    ) -> Result<(), NvdimmError> {
        let from = self.nvdimm[dimm];
        self.nvdimm[dimm].advance(to)?;
        ringbuf_entry!(Trace::State {
            mss: self.index as u8,
            dimm: dimm as u8,
            from,
            to
        });
        Ok(())
    }

    fn nv_check(&self, dimm: usize) -> Result<(), NvdimmError> {
        if dimm < DIMMS_PER_MSS && self.params.nvdimm[dimm] {
            Ok(())
        } else {
            Err(NvdimmError::NotAnNvdimm)
        }
    }

    pub fn nv_read(&mut self, dimm: usize, reg: u8) -> Result<u8, NvdimmError> {
        self.indirect(IndTarget::Nvdimm, nv_addr(dimm, reg), Op::Read, 0)
            .map_err(|_| NvdimmError::Transport)?;
        Ok(self.staged(0) as u8)
    }

    pub fn nv_write(
        &mut self,
        dimm: usize,
        reg: u8,
        value: u8,
    ) -> Result<(), NvdimmError> {
        self.stage(0, u32::from(value));
        self.indirect(IndTarget::Nvdimm, nv_addr(dimm, reg), Op::Write, 0)
            .map_err(|_| NvdimmError::Transport)
    }

    fn nv_timeout(
        &mut self,
        dimm: usize,
        reg: u8,
    ) -> Result<Duration, NvdimmError> {
        let lo = self.nv_read(dimm, reg)?;
        let hi = self.nv_read(dimm, reg + 1)?;
        Ok(decode_timeout(u16::from_le_bytes([lo, hi])))
    }

    /// Waits for the module to finish whatever it was doing.
    fn nv_wait_idle(&mut self, dimm: usize) -> Result<(), NvdimmError> {
        let index = self.index;
        poll(
            &mut *self.hw,
            |hw| cmd_status_raw(hw, index, dimm),
            u32::from(BUSY.bits()),
            0,
            NV_IDLE_WAIT,
            NV_POLL_TICK,
        )
        .map(|_| ())
        .ok_or(NvdimmError::Busy)
    }

    /// Restores the DIMM's saved image into DRAM. On success the DIMM is
    /// `Restored`; on timeout it has been aborted.
    pub fn nvdimm_restore(&mut self, dimm: usize) -> Result<(), NvdimmError> {
        self.nv_check(dimm)?;
        if !self.nvdimm[dimm].can_transition(NvdimmState::Restoring) {
            return Err(NvdimmError::IllegalTransition);
        }
        self.nv_wait_idle(dimm)?;
        self.nv_advance(dimm, NvdimmState::Restoring)?;
        self.long_op(dimm, &RESTORE, NvdimmState::Restored)
    }

    /// Arms a restored DIMM to save on the next power loss.
    pub fn nvdimm_arm(&mut self, dimm: usize) -> Result<(), NvdimmError> {
        self.nv_check(dimm)?;
        if !self.nvdimm[dimm].can_transition(NvdimmState::Arming) {
            return Err(NvdimmError::IllegalTransition);
        }
        self.nv_wait_idle(dimm)?;
        self.nv_advance(dimm, NvdimmState::Arming)?;
        self.long_op(dimm, &ARM, NvdimmState::Armed)
    }

    fn long_op(
        &mut self,
        dimm: usize,
        op: &LongOp,
        success: NvdimmState,
    ) -> Result<(), NvdimmError> {
        match self.run_long_op(dimm, op) {
            Ok(()) => self.nv_advance(dimm, success),
            Err(e) => {
                if e == NvdimmError::Timeout {
                    self.diag.report(Report::NvdimmTimeout {
                        mss: self.index as u8,
                        dimm: dimm as u8,
                        op: op.kind,
                    });
                }
                match self.nvdimm_abort(dimm) {
                    Ok(()) => Err(e),
                    Err(abort) => Err(abort),
                }
            }
        }
    }

    fn run_long_op(
        &mut self,
        dimm: usize,
        op: &LongOp,
    ) -> Result<(), NvdimmError> {
        let mss = self.index as u8;
        self.nv_write(dimm, nv::MGT_CMD0, op.clear.bits())?;
        let budget = self.nv_timeout(dimm, op.timeout)?;
        ringbuf_entry!(Trace::Start {
            mss,
            dimm: dimm as u8,
            op: op.kind,
            budget_ms: budget.as_millis() as u32
        });
        self.nv_write(dimm, op.start_reg, op.start)?;

        let mut waited = Duration::ZERO;
        while waited < budget {
            self.hw.delay(NV_POLL_TICK);
            waited += NV_POLL_TICK;

            let busy = CmdStatus0::from_bits_retain(
                self.nv_read(dimm, nv::CMD_STATUS0)?,
            );
            if busy.intersects(op.in_progress) {
                continue;
            }
            let status = self.nv_read(dimm, op.status)?;
            if status & nv::OP_SUCCESS != 0 {
                ringbuf_entry!(Trace::Done {
                    mss,
                    dimm: dimm as u8,
                    op: op.kind,
                    status
                });
                return Ok(());
            }
            // Neither running nor done: the start was lost.
            ringbuf_entry!(Trace::Reissue {
                mss,
                dimm: dimm as u8,
                op: op.kind
            });
            self.nv_write(dimm, op.start_reg, op.start)?;
        }
        Err(NvdimmError::Timeout)
    }

    /// Aborts a running restore or arm. Either way the DIMM ends in `Idle`;
    /// only a failed abort is an error.
    pub fn nvdimm_abort(&mut self, dimm: usize) -> Result<(), NvdimmError> {
        self.nv_check(dimm)?;
        self.nv_advance(dimm, NvdimmState::Aborting)?;
        let recovered = self.run_abort(dimm).unwrap_or(false);
        self.diag.report(Report::NvdimmAborted {
            mss: self.index as u8,
            dimm: dimm as u8,
            recovered,
        });
        if recovered {
            self.nv_advance(dimm, NvdimmState::Idle(Outcome::Failed))
        } else {
            self.nv_advance(dimm, NvdimmState::Idle(Outcome::Unrecoverable))?;
            Err(NvdimmError::AbortFailed)
        }
    }

    fn run_abort(&mut self, dimm: usize) -> Result<bool, NvdimmError> {
        let budget = self.nv_timeout(dimm, nv::ABORT_TIMEOUT)?;
        ringbuf_entry!(Trace::Start {
            mss: self.index as u8,
            dimm: dimm as u8,
            op: NvdimmOp::Abort,
            budget_ms: budget.as_millis() as u32
        });
        self.nv_write(dimm, nv::MGT_CMD0, MgtCmd0::CL_ABORT.bits())?;
        self.nv_write(dimm, nv::FUNC_CMD, FuncCmd::ABORT_CURRENT_OP.bits())?;

        let index = self.index;
        let abort = u32::from(CmdStatus0::ABORT_IN_PROGRESS.bits());
        if poll(
            &mut *self.hw,
            |hw| cmd_status_raw(hw, index, dimm),
            abort,
            0,
            budget,
            NV_POLL_TICK,
        )
        .is_none()
        {
            self.diag.report(Report::NvdimmTimeout {
                mss: self.index as u8,
                dimm: dimm as u8,
                op: NvdimmOp::Abort,
            });
            return Ok(false);
        }
        let status = self.nv_read(dimm, nv::ABORT_STATUS)?;
        ringbuf_entry!(Trace::Done {
            mss: self.index as u8,
            dimm: dimm as u8,
            op: NvdimmOp::Abort,
            status
        });
        Ok(status & nv::OP_SUCCESS != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::reported;
    use crate::fake::{FakeNvdimm, FakeSoc, Script};
    use proptest::prelude::*;

    const ALL: [NvdimmState; 10] = [
        NvdimmState::Idle(Outcome::Pending),
        NvdimmState::Idle(Outcome::Failed),
        NvdimmState::Idle(Outcome::Unrecoverable),
        NvdimmState::Restoring,
        NvdimmState::Restored,
        NvdimmState::Arming,
        NvdimmState::Armed,
        NvdimmState::Aborting,
        NvdimmState::SaveInProgress,
        NvdimmState::Saved,
    ];

    #[test]
    fn abort_only_from_restoring_or_arming() {
        for s in ALL {
            assert_eq!(
                s.can_transition(NvdimmState::Aborting),
                matches!(s, NvdimmState::Restoring | NvdimmState::Arming),
                "{s:?}"
            );
        }
    }

    #[test]
    fn saved_only_through_save_in_progress() {
        for s in ALL {
            assert_eq!(
                s.can_transition(NvdimmState::Saved),
                s == NvdimmState::SaveInProgress
            );
            assert_eq!(
                s.can_transition(NvdimmState::SaveInProgress),
                s == NvdimmState::Armed
            );
        }
    }

    #[test]
    fn failed_dimms_stay_out_of_service() {
        for outcome in [Outcome::Failed, Outcome::Unrecoverable] {
            let mut s = NvdimmState::Idle(outcome);
            assert_eq!(
                s.advance(NvdimmState::Restoring),
                Err(NvdimmError::IllegalTransition)
            );
            assert_eq!(s, NvdimmState::Idle(outcome));
        }
    }

    proptest! {
        #[test]
        fn timeouts_are_clamped_and_unit_aware(raw: u16) {
            let d = decode_timeout(raw);
            prop_assert!(d >= NV_POLL_TICK && d <= NV_TIMEOUT_MAX);
            let count = u64::from(raw & 0x7fff);
            if raw & 0x8000 == 0 && count >= 10 {
                prop_assert_eq!(d, Duration::from_millis(count));
            }
            if raw & 0x8000 != 0 && (1..=300).contains(&count) {
                prop_assert_eq!(d, Duration::from_secs(count));
            }
        }
    }

    fn nvdimm_soc(nv: FakeNvdimm) -> FakeSoc {
        let mut soc = FakeSoc::new();
        soc.nvdimms.insert((0, 1), nv);
        soc
    }

    #[test]
    fn restore_then_arm() {
        let mut soc = nvdimm_soc(FakeNvdimm::default());
        let mut ctx = soc.context(0);
        ctx.params.nvdimm = [false, true];
        let mut m = ctx.mss();
        m.nvdimm_restore(1).unwrap();
        assert_eq!(m.nvdimm_state(1), Some(NvdimmState::Restored));
        m.nvdimm_arm(1).unwrap();
        assert_eq!(m.nvdimm_state(1), Some(NvdimmState::Armed));
        assert_eq!(
            m.nvdimm_restore(1),
            Err(NvdimmError::IllegalTransition)
        );
        assert_eq!(m.nvdimm_restore(0), Err(NvdimmError::NotAnNvdimm));
    }

    #[test]
    fn dropped_start_pulse_is_reissued() {
        let mut soc = nvdimm_soc(FakeNvdimm {
            restore: Script::DropFirstPulse(Duration::from_millis(30)),
            ..FakeNvdimm::default()
        });
        let mut ctx = soc.context(0);
        ctx.params.nvdimm = [false, true];
        ctx.mss().nvdimm_restore(1).unwrap();
        assert_eq!(ctx.nv[1], NvdimmState::Restored);
        assert_eq!(ctx.soc.nvdimms[&(0, 1)].restore_starts, 2);
    }

    #[test]
    fn restore_that_never_finishes_is_aborted() {
        let mut soc = nvdimm_soc(FakeNvdimm {
            restore: Script::Never,
            ..FakeNvdimm::default()
        });
        let start = soc.now;
        let mut ctx = soc.context(0);
        ctx.params.nvdimm = [false, true];
        assert_eq!(
            ctx.mss().nvdimm_restore(1),
            Err(NvdimmError::Timeout)
        );
        assert_eq!(ctx.nv[1], NvdimmState::Idle(Outcome::Failed));
        // The module advertised two seconds.
        assert!(ctx.soc.now - start >= Duration::from_secs(2));
        assert_eq!(ctx.soc.nvdimms[&(0, 1)].abort_starts, 1);
        assert!(reported().contains(&Report::NvdimmAborted {
            mss: 0,
            dimm: 1,
            recovered: true
        }));
        assert_eq!(
            ctx.mss().nvdimm_arm(1),
            Err(NvdimmError::IllegalTransition)
        );
    }

    #[test]
    fn failed_abort_is_unrecoverable() {
        let mut soc = nvdimm_soc(FakeNvdimm {
            arm: Script::Never,
            abort_ok: false,
            ..FakeNvdimm::default()
        });
        let mut ctx = soc.context(0);
        ctx.params.nvdimm = [false, true];
        let mut m = ctx.mss();
        m.nvdimm_restore(1).unwrap();
        assert_eq!(m.nvdimm_arm(1), Err(NvdimmError::AbortFailed));
        assert_eq!(
            m.nvdimm_state(1),
            Some(NvdimmState::Idle(Outcome::Unrecoverable))
        );
    }

    #[test]
    fn busy_module_is_refused_without_state_change() {
        let mut soc = nvdimm_soc(FakeNvdimm {
            stuck_busy: true,
            ..FakeNvdimm::default()
        });
        let mut ctx = soc.context(0);
        ctx.params.nvdimm = [false, true];
        assert_eq!(ctx.mss().nvdimm_restore(1), Err(NvdimmError::Busy));
        assert_eq!(ctx.nv[1], NvdimmState::Idle(Outcome::Pending));
        assert_eq!(ctx.soc.nvdimms[&(0, 1)].restore_starts, 0);
    }

    #[test]
    fn abort_outside_an_operation_is_rejected() {
        let mut soc = nvdimm_soc(FakeNvdimm::default());
        let mut ctx = soc.context(0);
        ctx.params.nvdimm = [false, true];
        assert_eq!(
            ctx.mss().nvdimm_abort(1),
            Err(NvdimmError::IllegalTransition)
        );
        assert_eq!(ctx.soc.nvdimms[&(0, 1)].abort_starts, 0);
    }
}
