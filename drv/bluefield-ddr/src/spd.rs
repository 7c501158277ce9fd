// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DDR4 Serial Presence Detect: reading it over the I2C side-band and
//! decoding the parts the bring-up needs.

use crc::{Crc, CRC_16_XMODEM};
use drv_bluefield_ddr_api::SpdError;
use embedded_hal::blocking::i2c::{Write, WriteRead};
use ringbuf::*;

use crate::params::ModuleType;

/// Bytes read from each DIMM: the lower page, which holds the base
/// configuration and the module-specific section.
pub const SPD_READ_LEN: usize = ::spd::PAGE_SIZE;

/// EE1004 memory array of device 0; device `n` answers at `base + n`.
const SPD_MEMORY_BASE: u8 = 0x50;
/// EE1004 set-page addresses.
const SPD_SET_PAGE: [u8; 2] = [0x36, 0x37];

/// Timebases from byte 17 of every DDR4 SPD the controller supports.
const MTB_PS: i32 = 125;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    Page(u8),
    Read { dev: u8, offset: u16, len: u16 },
    BusError { dev: u8 },
}

ringbuf!(Trace, 16, Trace::None);

/// Access to the SPD EEPROMs. `dev` numbers DIMM slots across the whole SoC:
/// controller `m`, slot `s` is `m * DIMMS_PER_MSS + s`.
pub trait SpdBus {
    fn read(
        &mut self,
        dev: u8,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<(), SpdError>;
}

/// SPD access through an EE1004-compatible bus.
pub struct I2cSpd<I> {
    bus: I,
    page: Option<u8>,
}

impl<I, E> I2cSpd<I>
where
    I: Write<Error = E> + WriteRead<Error = E>,
{
    pub fn new(bus: I) -> Self {
        Self { bus, page: None }
    }

    fn select_page(&mut self, page: u8) -> Result<(), SpdError> {
        if self.page == Some(page) {
            return Ok(());
        }
        let addr = *SPD_SET_PAGE
            .get(usize::from(page))
            .ok_or(SpdError::Malformed)?;
        ringbuf_entry!(Trace::Page(page));
        // Both set-page addresses are write-only; the data byte is ignored.
        self.page = None;
        self.bus.write(addr, &[0]).map_err(|_| SpdError::Bus)?;
        self.page = Some(page);
        Ok(())
    }
}

impl<I, E> SpdBus for I2cSpd<I>
where
    I: Write<Error = E> + WriteRead<Error = E>,
{
    fn read(
        &mut self,
        dev: u8,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<(), SpdError> {
        if dev >= ::spd::MAX_DEVICES || offset + buf.len() > ::spd::MAX_SIZE {
            return Err(SpdError::Malformed);
        }
        let mut offset = offset;
        let mut rest = buf;
        while !rest.is_empty() {
            let page = (offset / ::spd::PAGE_SIZE) as u8;
            let within = offset % ::spd::PAGE_SIZE;
            let n = rest.len().min(::spd::PAGE_SIZE - within);
            let (chunk, tail) = rest.split_at_mut(n);
            self.select_page(page)?;
            ringbuf_entry!(Trace::Read {
                dev,
                offset: offset as u16,
                len: n as u16
            });
            self.bus
                .write_read(SPD_MEMORY_BASE + dev, &[within as u8], chunk)
                .map_err(|_| {
                    ringbuf_entry!(Trace::BusError { dev });
                    // A NAK on the very first byte is an empty slot.
                    if offset == 0 {
                        SpdError::Absent
                    } else {
                        SpdError::Bus
                    }
                })?;
            offset += n;
            rest = tail;
        }
        Ok(())
    }
}

/// The decoded identity of one DIMM.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SpdInfo {
    pub module: ModuleType,
    pub nvdimm: bool,
    pub density_mbit: u32,
    pub bank_groups: u8,
    pub banks_per_group: u8,
    pub row_bits: u8,
    pub col_bits: u8,
    pub stack_height: u8,
    pub device_width: u8,
    pub ranks: u8,
    pub ecc: bool,
    pub tck_min_ps: u32,
    pub taa_min_ps: u32,
}

impl SpdInfo {
    /// True if two DIMMs can share a controller. Timing may differ; the
    /// slower part sets the pace.
    pub fn compatible(&self, other: &SpdInfo) -> bool {
        self.module == other.module
            && self.density_mbit == other.density_mbit
            && self.bank_groups == other.bank_groups
            && self.banks_per_group == other.banks_per_group
            && self.row_bits == other.row_bits
            && self.col_bits == other.col_bits
            && self.stack_height == other.stack_height
            && self.device_width == other.device_width
            && self.ranks == other.ranks
            && self.ecc == other.ecc
    }
}

const DDR4_SDRAM: u8 = 0x0c;
const HYBRID: u8 = 1 << 7;
const HYBRID_MEDIA_NVDIMM_N: u8 = 1;
const SIGNAL_LOADING_3DS: u8 = 2;
const BUS_WIDTH_64: u8 = 3;
const BUS_EXT_ECC: u8 = 1;

fn fine(b: u8) -> i32 {
    i32::from(b as i8)
}

fn mtb_ps(coarse: u8, fine_offset: u8) -> Result<u32, SpdError> {
    let ps = i32::from(coarse) * MTB_PS + fine(fine_offset);
    u32::try_from(ps)
        .ok()
        .filter(|&ps| ps != 0)
        .ok_or(SpdError::Malformed)
}

/// Decodes the base configuration section of a DDR4 SPD.
pub fn parse(b: &[u8]) -> Result<SpdInfo, SpdError> {
    if b.len() < 128 {
        return Err(SpdError::Malformed);
    }
    let crc = u16::from_le_bytes([b[126], b[127]]);
    if CRC16.checksum(&b[..126]) != crc {
        return Err(SpdError::Malformed);
    }
    if b[2] != DDR4_SDRAM {
        return Err(SpdError::NotDdr4);
    }

    let module = match b[3] & 0xf {
        1 => ModuleType::Rdimm,
        2 => ModuleType::Udimm,
        3 => ModuleType::SoDimm,
        4 => ModuleType::Lrdimm,
        _ => return Err(SpdError::Malformed),
    };
    let nvdimm =
        b[3] & HYBRID != 0 && (b[3] >> 4) & 0x7 == HYBRID_MEDIA_NVDIMM_N;

    let density_mbit = match b[4] & 0xf {
        d @ 0..=6 => 256u32 << d,
        _ => return Err(SpdError::Malformed),
    };
    let banks_per_group = match (b[4] >> 4) & 0x3 {
        0 => 4,
        1 => 8,
        _ => return Err(SpdError::Malformed),
    };
    let bank_groups = match (b[4] >> 6) & 0x3 {
        0 => 1,
        1 => 2,
        2 => 4,
        _ => return Err(SpdError::Malformed),
    };

    let col_bits = match b[5] & 0x7 {
        c @ 0..=3 => 9 + c,
        _ => return Err(SpdError::Malformed),
    };
    let row_bits = match (b[5] >> 3) & 0x7 {
        r @ 0..=6 => 12 + r,
        _ => return Err(SpdError::Malformed),
    };

    let stack_height = if b[6] & 0x3 == SIGNAL_LOADING_3DS {
        ((b[6] >> 4) & 0x7) + 1
    } else {
        1
    };

    let device_width = match b[12] & 0x7 {
        0 => 4,
        1 => 8,
        2 => 16,
        _ => return Err(SpdError::Malformed),
    };
    let ranks = ((b[12] >> 3) & 0x7) + 1;

    if b[13] & 0x7 != BUS_WIDTH_64 {
        return Err(SpdError::Malformed);
    }
    let ecc = (b[13] >> 3) & 0x3 == BUS_EXT_ECC;

    Ok(SpdInfo {
        module,
        nvdimm,
        density_mbit,
        bank_groups,
        banks_per_group,
        row_bits,
        col_bits,
        stack_height,
        device_width,
        ranks,
        ecc,
        tck_min_ps: mtb_ps(b[18], b[125])?,
        taa_min_ps: mtb_ps(b[24], b[123])?,
    })
}
