// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register map for the memory subsystem and the RSHIM block.
//!
//! Only the registers and fields the bring-up engine touches are declared.
//! Addresses are byte addresses for directly mapped blocks (EMC, EMI, RSHIM)
//! and word indices for PUB registers, which are only reachable through the
//! EMI indirect interface.

use bitflags::bitflags;
use drv_bluefield_ddr_api::MSS_COUNT;

/// Base of each memory subsystem (MSS) instance.
pub const MSS_BASE: [usize; MSS_COUNT] = [0x0280_0000, 0x0290_0000];

pub const EMC_OFFSET: usize = 0x0000;
pub const EMI_OFFSET: usize = 0x4000;

pub const RSHIM_BASE: usize = 0x0080_0000;

pub const fn emc_addr(mss: usize, reg: usize) -> usize {
    MSS_BASE[mss] + EMC_OFFSET + reg
}

pub const fn emi_addr(mss: usize, reg: usize) -> usize {
    MSS_BASE[mss] + EMI_OFFSET + reg
}

pub const fn rshim_addr(reg: usize) -> usize {
    RSHIM_BASE + reg
}

pub mod emc {
    use bitflags::bitflags;

    pub const CTL: usize = 0x00;
    pub const DIMM_CFG: usize = 0x04;
    /// Clock period in picoseconds.
    pub const TIMING0: usize = 0x08;
    /// CL [7:0], CWL [15:8], PHY round-trip delay [23:16].
    pub const TIMING1: usize = 0x0c;
    pub const ADDR_MAP: usize = 0x10;
    pub const ODT: usize = 0x14;
    pub const SKEW: usize = 0x18;
    pub const STATUS: usize = 0x1c;

    bitflags! {
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub struct Ctl: u32 {
            const ENABLE = 1 << 0;
            const ECC = 1 << 1;
        }
    }

    bitflags! {
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub struct Status: u32 {
            const INIT_DONE = 1 << 0;
        }
    }

    /// DIMM_CFG fields.
    pub const DIMM_CFG_PRESENT_SHIFT: u32 = 0;
    pub const DIMM_CFG_RANKS_SHIFT: u32 = 2;
    pub const DIMM_CFG_WIDTH_SHIFT: u32 = 4;
    pub const DIMM_CFG_DENSITY_SHIFT: u32 = 6;
    pub const DIMM_CFG_REGISTERED: u32 = 1 << 10;
    pub const DIMM_CFG_ECC: u32 = 1 << 11;
    pub const DIMM_CFG_STACK_SHIFT: u32 = 12;
}

/// EMI indirect access interface.
pub mod ind {
    /// Staging words for data in either direction.
    pub const fn data(n: usize) -> usize {
        0x100 + 4 * n
    }
    pub const fn ecc(n: usize) -> usize {
        0x140 + 4 * n
    }
    pub const DATA_WORDS: usize = 16;
    pub const ECC_WORDS: usize = 2;

    pub const ADDR: usize = 0x150;
    pub const CMD: usize = 0x154;
    pub const STATUS: usize = 0x158;
    pub const ADDR_HI: usize = 0x15c;

    pub const CMD_TARGET_MASK: u32 = 0xf;
    pub const CMD_WRITE: u32 = 1 << 4;
    pub const CMD_ECC: u32 = 1 << 5;
    pub const CMD_GO: u32 = 1 << 31;

    pub const STATUS_READY: u32 = 1 << 0;
    pub const STATUS_SUCCESS: u32 = 1 << 1;

    /// Rank select for rank-indirect PUB registers, in `ADDR`.
    pub const RANK_SHIFT: u32 = 12;

    /// Host access address packing.
    pub const HOST_BANK_SHIFT: u32 = 12;
    pub const HOST_RANK_SHIFT: u32 = 20;

    /// Mode register command words.
    pub const MRS_NUMBER_SHIFT: u32 = 20;
    pub const MRS_CMD_SHIFT: u32 = 8;
    pub const MRS_DELAY_SHIFT: u32 = 16;
    pub const MRS_DELAY_MAX: u16 = 0x3fff;
    pub const MRS_B_SIDE: u32 = 1 << 30;
    pub const MRS_LAST: u32 = 1 << 31;

    /// NVDIMM and RCD addresses are `(dimm << 8) | register`.
    pub const DIMM_SHIFT: u32 = 8;
}

/// PUB register word indices.
pub mod phy {
    pub const PIR: u32 = 0x01;
    pub const PGCR1: u32 = 0x05;
    pub const PGSR0: u32 = 0x0d;
    pub const DCR: u32 = 0x44;
    pub const DTPR0: u32 = 0x45;
    pub const SCHCR0: u32 = 0x5a;
    pub const SCHCR1: u32 = 0x5b;
    pub const fn mr(n: u8) -> u32 {
        0x60 + n as u32
    }
    pub const IOVCR0: u32 = 0x148;
    pub const ACBDLR0: u32 = 0x150;

    pub const PGCR1_PUBMODE: u32 = 1 << 6;

    pub const DCR_DDR4: u32 = 0x4;
    pub const DCR_REGISTERED: u32 = 1 << 29;

    pub const SCHCR0_TRIG: u32 = 1 << 0;
    pub const SCHCR0_CMD_SHIFT: u32 = 4;
    pub const SCHCR0_CMD_MASK: u32 = 0xf << SCHCR0_CMD_SHIFT;
    /// Rank mask and other per-transaction settings live above the opcode.
    pub const SCHCR0_CFG_MASK: u32 = 0xffff_ff00;
    pub const SCHCR0_RANK_SHIFT: u32 = 8;
}

bitflags! {
    /// PHY Initialization Register.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct Pir: u32 {
        const INIT = 1 << 0;
        const ZCAL = 1 << 1;
        const CA = 1 << 2;
        const PLLINIT = 1 << 4;
        const DCAL = 1 << 5;
        const PHYRST = 1 << 6;
        const DRAMRST = 1 << 7;
        const DRAMINIT = 1 << 8;
        const WL = 1 << 9;
        const QSGATE = 1 << 10;
        const WLADJ = 1 << 11;
        const RDDSKW = 1 << 12;
        const WRDSKW = 1 << 13;
        const RDEYE = 1 << 14;
        const WREYE = 1 << 15;
        const SRD = 1 << 16;
        const VREF = 1 << 17;
        const CTLDINIT = 1 << 18;
        const RDIMMINIT = 1 << 19;
    }
}

bitflags! {
    /// PHY General Status Register 0.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct Pgsr0: u32 {
        const IDONE = 1 << 0;
        const PLDONE = 1 << 1;
        const DCDONE = 1 << 2;
        const ZCDONE = 1 << 3;
        const DIDONE = 1 << 4;
        const WLDONE = 1 << 5;
        const QSGDONE = 1 << 6;
        const WLADONE = 1 << 7;
        const RDDONE = 1 << 8;
        const WDDONE = 1 << 9;
        const REDONE = 1 << 10;
        const WEDONE = 1 << 11;
        const CADONE = 1 << 12;
        const SRDDONE = 1 << 13;
        const VDONE = 1 << 14;
        const VERR = 1 << 19;
        const ZCERR = 1 << 20;
        const WLERR = 1 << 21;
        const QSGERR = 1 << 22;
        const WLAERR = 1 << 23;
        const RDERR = 1 << 24;
        const WDERR = 1 << 25;
        const REERR = 1 << 26;
        const WEERR = 1 << 27;
        const CAERR = 1 << 28;
        const CAWRN = 1 << 29;
        const SRDERR = 1 << 30;
        const APLOCK = 1 << 31;
    }
}

/// RCD control word RC00, global features.
pub const RCD_RC00: u32 = 0x00;
/// In RC00: B-side output inversion disabled.
pub const RCD_RC00_INVERSION_DISABLED: u32 = 1 << 0;

/// Address and bank bits the RCD inverts on its B-side outputs.
pub const B_SIDE_ADDR_INVERT: u32 = 0x0002_2bf8;
pub const B_SIDE_BANK_INVERT: u8 = 0xf;

/// RSHIM registers.
pub mod rsh {
    use bitflags::bitflags;

    pub const PWR_WDOG_CTL: usize = 0x500;

    pub const fn adr_ctl(mss: usize) -> usize {
        0x510 + 8 * mss
    }
    pub const fn adr_status(mss: usize) -> usize {
        0x514 + 8 * mss
    }
    pub const fn scratch(mss: usize, word: usize) -> usize {
        0x700 + 0x10 * mss + 4 * word
    }

    bitflags! {
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub struct PwrWdog: u32 {
            const INTR_EN = 1 << 0;
            const FLUSH_EN = 1 << 1;
            const SW_OVERRIDE = 1 << 2;
        }
    }

    bitflags! {
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub struct AdrCtl: u32 {
            const FLUSH = 1 << 0;
            const SELF_REFRESH = 1 << 1;
            const SAVE = 1 << 2;
        }
    }

    bitflags! {
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub struct AdrStatus: u32 {
            const FLUSH_DONE = 1 << 0;
            const SR_DONE = 1 << 1;
            const SAVE_DONE = 1 << 2;
        }
    }
}

/// Byte-addressed NVDIMM controller registers (JESD245).
pub mod nv {
    use bitflags::bitflags;

    pub const RESTORE_TIMEOUT: u8 = 0x1c;
    pub const ARM_TIMEOUT: u8 = 0x20;
    pub const ABORT_TIMEOUT: u8 = 0x24;

    /// In the high byte of a timeout: the value counts seconds, not
    /// milliseconds.
    pub const TIMEOUT_SECONDS: u16 = 1 << 15;

    pub const MGT_CMD0: u8 = 0x40;
    pub const FUNC_CMD: u8 = 0x43;
    pub const ARM_CMD: u8 = 0x45;
    pub const CMD_STATUS0: u8 = 0x61;
    pub const SAVE_STATUS: u8 = 0x64;
    pub const RESTORE_STATUS: u8 = 0x66;
    pub const ARM_STATUS: u8 = 0x6a;
    pub const ABORT_STATUS: u8 = 0x6b;

    bitflags! {
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub struct MgtCmd0: u8 {
            const CL_SAVE = 1 << 1;
            const CL_RESTORE = 1 << 2;
            const CL_ERASE = 1 << 3;
            const CL_ARM = 1 << 4;
            const CL_ABORT = 1 << 6;
        }
    }

    bitflags! {
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub struct FuncCmd: u8 {
            const START_SAVE = 1 << 1;
            const START_RESTORE = 1 << 2;
            const START_ERASE = 1 << 3;
            const ABORT_CURRENT_OP = 1 << 4;
        }
    }

    pub const ARM_SAVE_N_ARM: u8 = 1 << 0;

    bitflags! {
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub struct CmdStatus0: u8 {
            const CONTROLLER_BUSY = 1 << 0;
            const SAVE_IN_PROGRESS = 1 << 2;
            const RESTORE_IN_PROGRESS = 1 << 3;
            const ERASE_IN_PROGRESS = 1 << 4;
            const ABORT_IN_PROGRESS = 1 << 5;
            const ARM_IN_PROGRESS = 1 << 6;
        }
    }

    pub const OP_SUCCESS: u8 = 1 << 0;
    pub const OP_ERROR: u8 = 1 << 1;
}
