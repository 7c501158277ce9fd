// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simulated SoC for host tests.
//!
//! Models just enough of the memory subsystem to run the engine end to end:
//! the EMC/EMI register file, the indirect handshake and what sits behind
//! it (PUB registers, mode register writes, RCD control words, host memory,
//! NVDIMM controllers), the RSHIM ADR handshake, and time, which only moves
//! when the engine delays.

use std::collections::HashMap;
use std::time::Duration;

use drv_bluefield_ddr_api::{DIMMS_PER_MSS, MSS_COUNT};

use crate::diag::{clear_reported, Diagnostics, SetBits};
use crate::hw::Hardware;
use crate::nvdimm::NvdimmState;
use crate::params::DdrParams;
use crate::regs::nv::{CmdStatus0, FuncCmd, MgtCmd0};
use crate::regs::{
    emc, emc_addr, emi_addr, ind, nv, phy, rsh, rshim_addr, Pgsr0, Pir,
};
use crate::spd::{SpdBus, SPD_READ_LEN};
use crate::transport::{IndTarget, Mss};
use drv_bluefield_ddr_api::SpdError;

const INIT_DONE: Pgsr0 = Pgsr0::IDONE
    .union(Pgsr0::PLDONE)
    .union(Pgsr0::DCDONE)
    .union(Pgsr0::ZCDONE)
    .union(Pgsr0::DIDONE);

const TRAINING_DONE: Pgsr0 = Pgsr0::WLDONE
    .union(Pgsr0::QSGDONE)
    .union(Pgsr0::WLADONE)
    .union(Pgsr0::RDDONE)
    .union(Pgsr0::WDDONE)
    .union(Pgsr0::REDONE)
    .union(Pgsr0::WEDONE)
    .union(Pgsr0::VDONE);

/// How long an NVDIMM abort takes.
const ABORT_TAKES: Duration = Duration::from_millis(1);

/// What the PHY sees when asked to train: decoded from the EMC registers
/// the engine programmed.
#[derive(Copy, Clone, Debug)]
pub struct TrainView {
    pub mss: usize,
    pub tck_ps: u32,
    pub device_width: u8,
    pub ranks: u8,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MrsRecord {
    pub mss: usize,
    pub rank: u8,
    pub mr: u8,
    pub data: u32,
    pub b_side: bool,
    pub last: bool,
}

/// How an NVDIMM responds to a start command.
#[derive(Copy, Clone, Debug)]
pub enum Script {
    SucceedAfter(Duration),
    Never,
    /// Ignores the first start, then succeeds after the given time.
    DropFirstPulse(Duration),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Kind {
    Restore,
    Arm,
    Abort,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct Running {
    kind: Kind,
    started: Duration,
    takes: Option<Duration>,
}

/// One NVDIMM-N controller.
#[derive(Clone, Debug)]
pub struct FakeNvdimm {
    pub restore: Script,
    pub arm: Script,
    pub abort_ok: bool,
    pub stuck_busy: bool,
    pub restore_timeout: u16,
    pub arm_timeout: u16,
    pub abort_timeout: u16,
    pub restore_starts: u32,
    pub arm_starts: u32,
    pub abort_starts: u32,
    pub(crate) running: Option<Running>,
    pub(crate) restore_status: u8,
    pub(crate) arm_status: u8,
    pub(crate) abort_status: u8,
}

impl Default for FakeNvdimm {
    fn default() -> Self {
        Self {
            restore: Script::SucceedAfter(Duration::from_millis(50)),
            arm: Script::SucceedAfter(Duration::from_millis(20)),
            abort_ok: true,
            stuck_busy: false,
            // 2 s, 1 s, 100 ms
            restore_timeout: 0x8002,
            arm_timeout: 0x8001,
            abort_timeout: 100,
            restore_starts: 0,
            arm_starts: 0,
            abort_starts: 0,
            running: None,
            restore_status: 0,
            arm_status: 0,
            abort_status: 0,
        }
    }
}

impl FakeNvdimm {
    fn start(&mut self, kind: Kind, script: Script, starts: u32, now: Duration) {
        let takes = match script {
            Script::SucceedAfter(d) => Some(d),
            Script::Never => None,
            Script::DropFirstPulse(_) if starts == 1 => return,
            Script::DropFirstPulse(d) => Some(d),
        };
        self.running = Some(Running {
            kind,
            started: now,
            takes,
        });
    }

    fn settle(&mut self, now: Duration) {
        let Some(r) = self.running else { return };
        let Some(takes) = r.takes else { return };
        if now - r.started < takes {
            return;
        }
        self.running = None;
        let ok = r.kind != Kind::Abort || self.abort_ok;
        let status = if ok { nv::OP_SUCCESS } else { nv::OP_ERROR };
        match r.kind {
            Kind::Restore => self.restore_status = status,
            Kind::Arm => self.arm_status = status,
            Kind::Abort => self.abort_status = status,
        }
    }

    fn write(&mut self, reg: u8, value: u8, now: Duration) {
        self.settle(now);
        match reg {
            nv::MGT_CMD0 => {
                let c = MgtCmd0::from_bits_retain(value);
                if c.contains(MgtCmd0::CL_RESTORE) {
                    self.restore_status = 0;
                }
                if c.contains(MgtCmd0::CL_ARM) {
                    self.arm_status = 0;
                }
                if c.contains(MgtCmd0::CL_ABORT) {
                    self.abort_status = 0;
                }
            }
            nv::FUNC_CMD => {
                let f = FuncCmd::from_bits_retain(value);
                if f.contains(FuncCmd::ABORT_CURRENT_OP) {
                    self.abort_starts += 1;
                    self.running = Some(Running {
                        kind: Kind::Abort,
                        started: now,
                        takes: Some(ABORT_TAKES),
                    });
                } else if f.contains(FuncCmd::START_RESTORE) {
                    self.restore_starts += 1;
                    let (script, starts) = (self.restore, self.restore_starts);
                    self.start(Kind::Restore, script, starts, now);
                }
            }
            nv::ARM_CMD if value & nv::ARM_SAVE_N_ARM != 0 => {
                self.arm_starts += 1;
                let (script, starts) = (self.arm, self.arm_starts);
                self.start(Kind::Arm, script, starts, now);
            }
            _ => {}
        }
    }

    fn read(&mut self, reg: u8, now: Duration) -> u8 {
        self.settle(now);
        let pair = |t: u16, base: u8| t.to_le_bytes()[usize::from(reg - base)];
        match reg {
            nv::CMD_STATUS0 => {
                let mut s = CmdStatus0::empty();
                if self.stuck_busy {
                    s |= CmdStatus0::CONTROLLER_BUSY;
                }
                if let Some(r) = self.running {
                    s |= match r.kind {
                        Kind::Restore => CmdStatus0::RESTORE_IN_PROGRESS,
                        Kind::Arm => CmdStatus0::ARM_IN_PROGRESS,
                        Kind::Abort => CmdStatus0::ABORT_IN_PROGRESS,
                    };
                }
                s.bits()
            }
            nv::RESTORE_STATUS => self.restore_status,
            nv::ARM_STATUS => self.arm_status,
            nv::ABORT_STATUS => self.abort_status,
            r if r == nv::RESTORE_TIMEOUT || r == nv::RESTORE_TIMEOUT + 1 => {
                pair(self.restore_timeout, nv::RESTORE_TIMEOUT)
            }
            r if r == nv::ARM_TIMEOUT || r == nv::ARM_TIMEOUT + 1 => {
                pair(self.arm_timeout, nv::ARM_TIMEOUT)
            }
            r if r == nv::ABORT_TIMEOUT || r == nv::ABORT_TIMEOUT + 1 => {
                pair(self.abort_timeout, nv::ABORT_TIMEOUT)
            }
            _ => 0,
        }
    }
}

type Host = ([u32; ind::DATA_WORDS], [u32; ind::ECC_WORDS]);

pub struct FakeSoc {
    pub now: Duration,
    pub indirect_stuck: bool,
    pub sched_stuck: bool,
    /// Replaces whatever PGSR0 would otherwise read.
    pub pgsr0_override: Option<u32>,
    /// Decides whether data training passes.
    pub trains: Box<dyn Fn(&TrainView) -> bool>,
    pub mrs_log: Vec<MrsRecord>,
    /// `(mss, cmd0 without the trigger, cmd1, PUB mode on)` per trigger.
    pub sched_log: Vec<(usize, u32, u32, bool)>,
    pub nvdimms: HashMap<(usize, usize), FakeNvdimm>,
    /// Controllers whose ADR flush never completes.
    pub adr_stuck: [bool; MSS_COUNT],
    pub adr_latency: Duration,
    regs: HashMap<usize, u32>,
    pub_regs: HashMap<(usize, u32, u32), u32>,
    rcd: HashMap<(usize, u32), u32>,
    host: HashMap<(usize, u32, u32), Host>,
    adr_started: HashMap<(usize, u32), Duration>,
    reads: u64,
    writes: u64,
}

impl FakeSoc {
    pub fn new() -> Self {
        clear_reported();
        Self {
            now: Duration::ZERO,
            indirect_stuck: false,
            sched_stuck: false,
            pgsr0_override: None,
            trains: Box::new(|_| true),
            mrs_log: Vec::new(),
            sched_log: Vec::new(),
            nvdimms: HashMap::new(),
            adr_stuck: [false; MSS_COUNT],
            adr_latency: Duration::from_micros(300),
            regs: HashMap::new(),
            pub_regs: HashMap::new(),
            rcd: HashMap::new(),
            host: HashMap::new(),
            adr_started: HashMap::new(),
            reads: 0,
            writes: 0,
        }
    }

    /// A controller context over this SoC with fresh parameters.
    pub fn context(&mut self, mss: usize) -> Ctx<'_> {
        Ctx {
            soc: self,
            diag: Diagnostics::new(),
            params: DdrParams::new(mss),
            nv: [NvdimmState::default(); DIMMS_PER_MSS],
            index: mss,
        }
    }

    /// Register reads and writes so far.
    pub fn accesses(&self) -> u64 {
        self.reads + self.writes
    }

    pub fn pub_reg(&self, mss: usize, reg: u32) -> u32 {
        self.pub_regs
            .get(&(mss, IndTarget::Pub as u32, reg))
            .copied()
            .unwrap_or(0)
    }

    pub fn rshim(&self, reg: usize) -> u32 {
        self.reg(rshim_addr(reg))
    }

    pub fn set_rcd(&mut self, mss: usize, dimm: u8, word: u32, value: u32) {
        self.rcd
            .insert((mss, u32::from(dimm) << ind::DIMM_SHIFT | word), value);
    }

    fn reg(&self, addr: usize) -> u32 {
        self.regs.get(&addr).copied().unwrap_or(0)
    }

    fn adr_status(&self, mss: usize) -> u32 {
        if self.adr_stuck[mss] {
            return 0;
        }
        self.adr_started
            .iter()
            .filter(|((m, _), start)| {
                *m == mss && self.now - **start >= self.adr_latency
            })
            .fold(0, |acc, ((_, bit), _)| acc | bit)
    }

    fn indirect(&mut self, mss: usize, cmd: u32) {
        let status = emi_addr(mss, ind::STATUS);
        if self.indirect_stuck {
            self.regs.insert(status, 0);
            return;
        }
        let addr = self.reg(emi_addr(mss, ind::ADDR));
        let write = cmd & ind::CMD_WRITE != 0;
        let ecc = cmd & ind::CMD_ECC != 0;
        let ok = match cmd & ind::CMD_TARGET_MASK {
            t if t == IndTarget::Pub as u32 || t == IndTarget::PubRank as u32 => {
                self.pub_access(mss, t, addr, write);
                true
            }
            t if t == IndTarget::Mrs as u32 => {
                self.mode_register(mss);
                true
            }
            t if t == IndTarget::Rcd as u32 => {
                let data0 = emi_addr(mss, ind::data(0));
                if write {
                    let v = self.reg(data0);
                    self.rcd.insert((mss, addr), v);
                } else {
                    let v = self.rcd.get(&(mss, addr)).copied().unwrap_or(0);
                    self.regs.insert(data0, v);
                }
                true
            }
            t if t == IndTarget::Host as u32 => {
                self.host_access(mss, addr, write, ecc);
                true
            }
            t if t == IndTarget::Nvdimm as u32 => {
                self.nvdimm_access(mss, addr, write)
            }
            _ => false,
        };
        let mut s = ind::STATUS_READY;
        if ok {
            s |= ind::STATUS_SUCCESS;
        }
        self.regs.insert(status, s);
    }

    fn pub_access(&mut self, mss: usize, target: u32, addr: u32, write: bool) {
        let data0 = emi_addr(mss, ind::data(0));
        let is_pub = target == IndTarget::Pub as u32;
        if !write {
            let stored =
                self.pub_regs.get(&(mss, target, addr)).copied().unwrap_or(0);
            let v = match self.pgsr0_override {
                Some(o) if is_pub && addr == phy::PGSR0 => o,
                _ => stored,
            };
            self.regs.insert(data0, v);
            return;
        }

        let mut v = self.reg(data0);
        if is_pub && addr == phy::PIR {
            self.run_pir(mss, v);
        }
        if is_pub && addr == phy::SCHCR0 && v & phy::SCHCR0_TRIG != 0 {
            let pubmode = self.pub_reg(mss, phy::PGCR1) & phy::PGCR1_PUBMODE;
            self.sched_log.push((
                mss,
                v & !phy::SCHCR0_TRIG,
                self.pub_reg(mss, phy::SCHCR1),
                pubmode != 0,
            ));
            if !self.sched_stuck {
                v &= !phy::SCHCR0_TRIG;
            }
        }
        self.pub_regs.insert((mss, target, addr), v);
    }

    fn run_pir(&mut self, mss: usize, pir: u32) {
        let pir = Pir::from_bits_retain(pir);
        let status = if pir.contains(Pir::WL) {
            let cfg = self.reg(emc_addr(mss, emc::DIMM_CFG));
            let view = TrainView {
                mss,
                tck_ps: self.reg(emc_addr(mss, emc::TIMING0)),
                device_width: 4 << ((cfg >> emc::DIMM_CFG_WIDTH_SHIFT) & 0x3),
                ranks: ((cfg >> emc::DIMM_CFG_RANKS_SHIFT) & 0x3) as u8 + 1,
            };
            if (self.trains)(&view) {
                INIT_DONE | TRAINING_DONE
            } else {
                INIT_DONE | TRAINING_DONE.difference(Pgsr0::QSGDONE) | Pgsr0::QSGERR
            }
        } else {
            INIT_DONE
        };
        self.pub_regs
            .insert((mss, IndTarget::Pub as u32, phy::PGSR0), status.bits());
    }

    fn mode_register(&mut self, mss: usize) {
        let w0 = self.reg(emi_addr(mss, ind::data(0)));
        let w1 = self.reg(emi_addr(mss, ind::data(1)));
        self.mrs_log.push(MrsRecord {
            mss,
            rank: w1 as u8,
            mr: ((w0 >> ind::MRS_NUMBER_SHIFT) & 0xf) as u8,
            data: w0 & ((1 << ind::MRS_NUMBER_SHIFT) - 1),
            b_side: w1 & ind::MRS_B_SIDE != 0,
            last: w1 & ind::MRS_LAST != 0,
        });
    }

    fn host_access(&mut self, mss: usize, addr: u32, write: bool, ecc: bool) {
        let row = self.reg(emi_addr(mss, ind::ADDR_HI));
        let key = (mss, addr, row);
        if write {
            let data = core::array::from_fn(|i| self.reg(emi_addr(mss, ind::data(i))));
            let check = if ecc {
                core::array::from_fn(|i| self.reg(emi_addr(mss, ind::ecc(i))))
            } else {
                [0; ind::ECC_WORDS]
            };
            self.host.insert(key, (data, check));
        } else {
            let (data, check) = self
                .host
                .get(&key)
                .copied()
                .unwrap_or(([0; ind::DATA_WORDS], [0; ind::ECC_WORDS]));
            for (i, w) in data.iter().enumerate() {
                self.regs.insert(emi_addr(mss, ind::data(i)), *w);
            }
            if ecc {
                for (i, w) in check.iter().enumerate() {
                    self.regs.insert(emi_addr(mss, ind::ecc(i)), *w);
                }
            }
        }
    }

    fn nvdimm_access(&mut self, mss: usize, addr: u32, write: bool) -> bool {
        let dimm = (addr >> ind::DIMM_SHIFT) as usize;
        let reg = addr as u8;
        let data0 = emi_addr(mss, ind::data(0));
        let value = self.reg(data0) as u8;
        let now = self.now;
        let Some(nvdimm) = self.nvdimms.get_mut(&(mss, dimm)) else {
            return false;
        };
        if write {
            nvdimm.write(reg, value, now);
        } else {
            let v = nvdimm.read(reg, now);
            self.regs.insert(data0, u32::from(v));
        }
        true
    }
}

impl Hardware for FakeSoc {
    fn read32(&mut self, addr: usize) -> u32 {
        self.reads += 1;
        for mss in 0..MSS_COUNT {
            if addr == rshim_addr(rsh::adr_status(mss)) {
                return self.adr_status(mss);
            }
        }
        self.reg(addr)
    }

    fn write32(&mut self, addr: usize, value: u32) {
        self.writes += 1;
        self.regs.insert(addr, value);
        for mss in 0..MSS_COUNT {
            if addr == emi_addr(mss, ind::CMD) && value & ind::CMD_GO != 0 {
                self.indirect(mss, value);
            }
            if addr == emc_addr(mss, emc::CTL) {
                let done = if emc::Ctl::from_bits_retain(value)
                    .contains(emc::Ctl::ENABLE)
                {
                    emc::Status::INIT_DONE.bits()
                } else {
                    0
                };
                self.regs.insert(emc_addr(mss, emc::STATUS), done);
            }
            if addr == rshim_addr(rsh::adr_ctl(mss)) {
                for bit in SetBits::new(value) {
                    self.adr_started.insert((mss, bit), self.now);
                }
            }
        }
    }

    fn delay(&mut self, d: Duration) {
        self.now += d;
    }
}

/// One controller's borrowed state, as `Engine::select_controller` would
/// hand it out.
pub struct Ctx<'s> {
    pub soc: &'s mut FakeSoc,
    pub diag: Diagnostics,
    pub params: DdrParams,
    pub nv: [NvdimmState; DIMMS_PER_MSS],
    index: usize,
}

impl Ctx<'_> {
    pub fn mss(&mut self) -> Mss<'_, FakeSoc> {
        Mss::new(
            self.index,
            &mut *self.soc,
            &mut self.diag,
            &mut self.params,
            &mut self.nv,
        )
    }
}

/// SPD EEPROMs, by controller and slot.
#[derive(Default)]
pub struct FakeSpd {
    images: HashMap<u8, [u8; SPD_READ_LEN]>,
    pub reads: u32,
}

impl FakeSpd {
    pub fn insert(&mut self, mss: usize, slot: usize, image: [u8; SPD_READ_LEN]) {
        self.images.insert(crate::candidate::spd_dev(mss, slot), image);
    }
}

impl SpdBus for FakeSpd {
    fn read(
        &mut self,
        dev: u8,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<(), SpdError> {
        self.reads += 1;
        let image = self.images.get(&dev).ok_or(SpdError::Absent)?;
        let src = image
            .get(offset..offset + buf.len())
            .ok_or(SpdError::Malformed)?;
        buf.copy_from_slice(src);
        Ok(())
    }
}
