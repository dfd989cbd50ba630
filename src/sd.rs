//! SD/MMC card protocol in SPI mode.
//!
//! Covers the power-up handshake that classifies a card as MMCv3, SDv1 or
//! SDv2, and the register reads (OCR, CID, CSD) layered on the data-token
//! framing with its CRC checks.

use std::fmt;
use std::thread;
use std::time::Duration;

use bitflags::bitflags;
use log::{info, trace, warn};

use crate::crc::{crc16, crc7, get_bits};
use crate::spi::{CS, MOSI};
use crate::utils::{now_secs, second_sync, HexSlice};
use crate::{Error, Result, SpiPort};

/// SPI-mode command indices.
const CMD0: u8 = 0; // GO_IDLE_STATE
const CMD1: u8 = 1; // SEND_OP_COND (MMC)
const CMD8: u8 = 8; // SEND_IF_COND
const CMD9: u8 = 9; // SEND_CSD
const CMD10: u8 = 10; // SEND_CID
const CMD16: u8 = 16; // SET_BLOCKLEN
const CMD55: u8 = 55; // APP_CMD
const CMD58: u8 = 58; // READ_OCR
const ACMD41: u8 = 41; // SEND_OP_COND (SDC)

/// CMD8 argument: 2.7-3.6 V supply plus the 0xAA check pattern.
const IF_COND_PATTERN: u32 = 0x0000_01AA;
/// Host-capacity-support bit in the ACMD41 argument.
const HCS: u32 = 0x4000_0000;

/// Fill bytes polled for a response before the command is declared dead.
const RESPONSE_POLL_LIMIT: u32 = 8;

/// Tokens announcing a data block.
const DATA_TOKENS: [u8; 3] = [0xFE, 0xFC, 0xF1];

bitflags! {
    /// R1 response bits. Everything above `IN_IDLE_STATE` is an error.
    pub struct R1: u8 {
        const IN_IDLE_STATE = 0x01;
        const ERASE_RESET = 0x02;
        const ILLEGAL_COMMAND = 0x04;
        const COMMAND_CRC_ERROR = 0x08;
        const ERASE_SEQUENCE_ERROR = 0x10;
        const ADDRESS_ERROR = 0x20;
        const PARAMETER_ERROR = 0x40;
        /// Must read as zero on a healthy card.
        const RESERVED = 0x80;
    }
}

impl R1 {
    /// True when any error bit, or the reserved bit, is set.
    pub fn has_error(self) -> bool {
        self.bits() & 0xFC != 0
    }
}

bitflags! {
    /// Bits of the error token a card may send instead of a data block.
    pub struct ErrorToken: u8 {
        const ERROR = 0x01;
        const CC_ERROR = 0x02;
        const ECC_FAILED = 0x04;
        const OUT_OF_RANGE = 0x08;
        const CARD_LOCKED = 0x10;
    }
}

/// Card flavours the initialisation handshake can recognise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardKind {
    MmcV3,
    SdV1,
    SdV2ByteAddr,
    SdV2BlockAddr,
}

impl fmt::Display for CardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CardKind::MmcV3 => "MMC version 3",
            CardKind::SdV1 => "SD version 1",
            CardKind::SdV2ByteAddr => "SD version 2 (byte address)",
            CardKind::SdV2BlockAddr => "SD version 2 (block address)",
        })
    }
}

/// Operating-conditions register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ocr(pub u32);

impl Ocr {
    /// Card capacity status: set on high-capacity cards.
    pub const CCS: u32 = 0x4000_0000;
    /// Power-up status: set once the card has finished initialising.
    pub const POWER_UP_DONE: u32 = 0x8000_0000;

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn high_capacity(self) -> bool {
        self.0 & Self::CCS != 0
    }

    pub fn power_up_done(self) -> bool {
        self.0 & Self::POWER_UP_DONE != 0
    }

    /// Lowest and highest supported supply voltage in volts, derived from
    /// the window bits 15..=23, or `None` when the window is empty.
    pub fn vdd_range(self) -> Option<(f64, f64)> {
        let mut min = None;
        let mut max = None;
        for i in 15..24u32 {
            if self.0 & (1 << i) != 0 {
                min.get_or_insert(i);
                max = Some(i);
            }
        }
        let (min, max) = (min?, max?);
        Some((
            2.6 + 0.1 * f64::from(min - 14),
            2.7 + 0.1 * f64::from(max - 14),
        ))
    }
}

impl fmt::Display for Ocr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OCR: {:08X}", self.0)?;
        if let Some((lo, hi)) = self.vdd_range() {
            write!(f, ", VDD range {:.1} V - {:.1} V", lo, hi)?;
        }
        Ok(())
    }
}

/// Card identification register, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cid {
    /// Manufacturer ID.
    pub mid: u8,
    /// OEM/application ID, two ASCII characters.
    pub oid: [u8; 2],
    /// Product name, ASCII padded with spaces.
    pub pnm: [u8; 6],
    /// Product revision, BCD major.minor.
    pub prv: u8,
    /// Product serial number.
    pub psn: u32,
    /// Manufacturing date: year offset from 2000 in the high byte, month in
    /// the low nibble.
    pub mdt: u16,
    /// The register's own CRC-7.
    pub crc: u8,
    /// Unparsed register image.
    pub raw: [u8; 16],
}

impl Cid {
    /// Decodes the 16-byte register image.
    pub fn from_raw(raw: [u8; 16]) -> Self {
        let byte = |bit| get_bits(&raw, bit, 8) as u8;
        Cid {
            mid: byte(120),
            oid: [byte(112), byte(104)],
            pnm: [byte(96), byte(88), byte(80), byte(72), byte(64), byte(56)],
            prv: byte(48),
            psn: get_bits(&raw, 16, 32),
            mdt: get_bits(&raw, 4, 12) as u16,
            crc: get_bits(&raw, 1, 7) as u8,
            raw,
        }
    }

    /// The OEM/application ID as text.
    pub fn oem_id(&self) -> &str {
        std::str::from_utf8(&self.oid).unwrap_or("??")
    }

    /// The product name with its space padding removed.
    pub fn product_name(&self) -> &str {
        std::str::from_utf8(&self.pnm).unwrap_or("?").trim_end()
    }

    pub fn manufacturing_month(&self) -> u8 {
        (self.mdt & 0x00F) as u8
    }

    pub fn manufacturing_year(&self) -> u16 {
        2000 + (self.mdt >> 4)
    }

    /// Manufacturer name from the registered MID/OID pairs, or `"Unknown"`.
    pub fn manufacturer(&self) -> &'static str {
        match (self.mid, &self.oid) {
            (0x01, b"PA") => "Panasonic",
            (0x02, b"TM") => "Toshiba",
            (0x03, b"SD") | (0x30, b"SD") => "Sandisk",
            (0x13, b"HG") | (0x13, b"KG") => "KingMax",
            (0x16, _) => "Matrix",
            (0x1B, b"SM") => "Samsung",
            (0x27, b"PH") => "Phison",
            (0x41, b"42") => "Kingston",
            (0x5D, b"SB") => "swissbit",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CID register: {:?}", HexSlice(&self.raw))?;
        writeln!(
            f,
            "       Manufacturer ID (MID): {:#04x} ({})",
            self.mid,
            self.manufacturer()
        )?;
        writeln!(
            f,
            "    OEM/application ID (OID): {:02X}{:02X} ({})",
            self.oid[0],
            self.oid[1],
            self.oem_id()
        )?;
        writeln!(f, "          Product name (PNM): {}", self.product_name())?;
        writeln!(
            f,
            "      Product revision (PRV): {:#04x} ({}.{})",
            self.prv,
            self.prv >> 4,
            self.prv & 0x0F
        )?;
        writeln!(f, " Product serial number (PSN): {:#010x}", self.psn)?;
        writeln!(
            f,
            "    Manufacturing date (MDT): {:#05x} ({}/{})",
            self.mdt,
            self.manufacturing_month(),
            self.manufacturing_year()
        )?;
        write!(f, "         CRC7 checksum (CRC): {:#04x}", self.crc)
    }
}

/// The structure-dependent device-size fields of the CSD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsdSize {
    /// CSD version 1.0, standard capacity.
    V0 {
        c_size: u16,
        c_size_mult: u8,
        vdd_r_curr_min: u8,
        vdd_r_curr_max: u8,
        vdd_w_curr_min: u8,
        vdd_w_curr_max: u8,
    },
    /// CSD version 2.0, high capacity.
    V1 { c_size: u32 },
}

/// Card-specific data register, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Csd {
    pub csd_structure: u8,
    /// Data read access time 1.
    pub taac: u8,
    /// Data read access time 2, in units of 100 clock cycles.
    pub nsac: u8,
    /// Maximum data transfer rate.
    pub tran_speed: u8,
    /// Card command classes.
    pub ccc: u16,
    /// Maximum read data block length, as a power of two.
    pub read_bl_len: u8,
    pub read_bl_partial: bool,
    pub write_blk_misalign: bool,
    pub read_blk_misalign: bool,
    pub dsr_imp: bool,
    /// Device size fields; layout depends on `csd_structure`.
    pub size: CsdSize,
    pub erase_blk_en: bool,
    pub sector_size: u8,
    pub wp_grp_size: u8,
    pub wp_grp_enable: bool,
    pub r2w_factor: u8,
    pub write_bl_len: u8,
    pub write_bl_partial: bool,
    pub file_format_grp: bool,
    pub copy: bool,
    pub perm_write_protect: bool,
    pub tmp_write_protect: bool,
    pub file_format: u8,
    /// The register's own CRC-7.
    pub crc: u8,
    /// Unparsed register image.
    pub raw: [u8; 16],
}

const TIME_VALUE: [f64; 16] = [
    0.0, 1.0, 1.2, 1.3, 1.5, 2.0, 2.5, 3.0, 3.5, 4.0, 4.5, 5.0, 5.5, 6.0, 7.0, 8.0,
];
const TAAC_MULT: [u32; 8] = [1, 10, 100, 1, 10, 100, 1, 10];
const TAAC_UNIT: [char; 3] = ['n', 'u', 'm'];
const TRAN_MULT: [u32; 4] = [100, 1, 10, 100];
const CURR_MIN: [f64; 8] = [0.5, 1.0, 5.0, 10.0, 25.0, 35.0, 60.0, 100.0];
const CURR_MAX: [f64; 8] = [1.0, 5.0, 10.0, 25.0, 35.0, 45.0, 80.0, 200.0];

const FILE_FORMATS: [&str; 5] = [
    "hard disk-like file system with partition table",
    "DOS FAT (floppy-like) with boot sector only",
    "universal file format",
    "others/unknown",
    "reserved",
];

impl Csd {
    /// Decodes the 16-byte register image. The offsets for `C_SIZE` and the
    /// supply-current triples depend on `CSD_STRUCTURE`; everything else is
    /// shared between the two versions.
    pub fn from_raw(raw: [u8; 16]) -> Self {
        let bits = |start, size| get_bits(&raw, start, size);
        let csd_structure = bits(126, 2) as u8;
        let size = if csd_structure == 0 {
            CsdSize::V0 {
                c_size: bits(62, 12) as u16,
                vdd_r_curr_min: bits(59, 3) as u8,
                vdd_r_curr_max: bits(56, 3) as u8,
                vdd_w_curr_min: bits(53, 3) as u8,
                vdd_w_curr_max: bits(50, 3) as u8,
                c_size_mult: bits(47, 3) as u8,
            }
        } else {
            CsdSize::V1 {
                c_size: bits(48, 22),
            }
        };
        Csd {
            csd_structure,
            taac: bits(112, 8) as u8,
            nsac: bits(104, 8) as u8,
            tran_speed: bits(96, 8) as u8,
            ccc: bits(84, 12) as u16,
            read_bl_len: bits(80, 4) as u8,
            read_bl_partial: bits(79, 1) != 0,
            write_blk_misalign: bits(78, 1) != 0,
            read_blk_misalign: bits(77, 1) != 0,
            dsr_imp: bits(76, 1) != 0,
            size,
            erase_blk_en: bits(46, 1) != 0,
            sector_size: bits(39, 7) as u8,
            wp_grp_size: bits(32, 7) as u8,
            wp_grp_enable: bits(31, 1) != 0,
            r2w_factor: bits(26, 3) as u8,
            write_bl_len: bits(22, 4) as u8,
            write_bl_partial: bits(21, 1) != 0,
            file_format_grp: bits(15, 1) != 0,
            copy: bits(14, 1) != 0,
            perm_write_protect: bits(13, 1) != 0,
            tmp_write_protect: bits(12, 1) != 0,
            file_format: bits(11, 2) as u8,
            crc: bits(1, 7) as u8,
            raw,
        }
    }

    /// CSD version number, 1 or 2.
    pub fn version(&self) -> u8 {
        self.csd_structure + 1
    }

    /// Device capacity in bytes.
    pub fn capacity(&self) -> u64 {
        match self.size {
            CsdSize::V0 {
                c_size,
                c_size_mult,
                ..
            } => {
                (u64::from(c_size) + 1)
                    * (1u64 << (c_size_mult + 2))
                    * (1u64 << self.read_bl_len)
            }
            CsdSize::V1 { c_size } => (u64::from(c_size) + 1) * 512 * 1024,
        }
    }

    /// Maximum read block length in bytes, or 0 for a reserved encoding.
    pub fn read_block_len(&self) -> u32 {
        if self.read_bl_len > 8 && self.read_bl_len < 12 {
            1 << self.read_bl_len
        } else {
            0
        }
    }

    /// Maximum write block length in bytes, or 0 for a reserved encoding.
    pub fn write_block_len(&self) -> u32 {
        if self.write_bl_len > 8 && self.write_bl_len < 12 {
            1 << self.write_bl_len
        } else {
            0
        }
    }

    /// Asynchronous part of the read access time, as a value and an SI unit
    /// prefix for seconds.
    pub fn access_time(&self) -> (f64, char) {
        let value = TIME_VALUE[usize::from(self.taac >> 3 & 0x07)]
            * f64::from(TAAC_MULT[usize::from(self.taac & 0x07)]);
        (value, TAAC_UNIT[usize::from(self.taac & 0x07) / 3])
    }

    /// Clocked part of the read access time, in clock cycles.
    pub fn access_clocks(&self) -> u32 {
        u32::from(self.nsac) * 100
    }

    /// Maximum transfer rate as a value and an SI unit prefix for bit/s.
    pub fn transfer_speed(&self) -> (f64, char) {
        let value = TIME_VALUE[usize::from(self.tran_speed >> 3 & 0x07)]
            * f64::from(TRAN_MULT[usize::from(self.tran_speed & 0x03)]);
        let unit = if self.tran_speed & 0x07 == 0 { 'k' } else { 'M' };
        (value, unit)
    }

    /// The file format the card was shipped with.
    pub fn file_format(&self) -> &'static str {
        if self.file_format_grp {
            FILE_FORMATS[4]
        } else {
            FILE_FORMATS[usize::from(self.file_format)]
        }
    }
}

fn scale_capacity(bytes: u64) -> (f64, &'static str) {
    match bytes {
        b if b >= 1 << 30 => (b as f64 / (1u64 << 30) as f64, "Gi"),
        b if b >= 1 << 20 => (b as f64 / (1u64 << 20) as f64, "Mi"),
        b if b >= 1 << 10 => (b as f64 / (1u64 << 10) as f64, "Ki"),
        b => (b as f64, ""),
    }
}

impl fmt::Display for Csd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (access, access_unit) = self.access_time();
        let (speed, speed_unit) = self.transfer_speed();
        let (capacity, capacity_unit) = scale_capacity(self.capacity());

        writeln!(f, "CSD register: {:?}", HexSlice(&self.raw))?;
        writeln!(
            f,
            "                     CSD structure: {:#04x} (v{}.0)",
            self.csd_structure,
            self.version()
        )?;
        writeln!(
            f,
            "       Data read access time (TAAC): {:#04x} ({:.1} {}s)",
            self.taac, access, access_unit
        )?;
        writeln!(
            f,
            "    Data read access clocks (NSAC): {:#04x} ({} cycles)",
            self.nsac,
            self.access_clocks()
        )?;
        writeln!(
            f,
            "   Max transfer rate (TRAN_SPEED): {:#04x} ({:.1} {}bit/s)",
            self.tran_speed, speed, speed_unit
        )?;
        write!(f, "          Card command class (CCC): {:#05x} (classes", self.ccc)?;
        for class in 0..12 {
            if self.ccc & (1 << class) != 0 {
                write!(f, " {}", class)?;
            }
        }
        writeln!(f, ")")?;
        writeln!(
            f,
            "     Max read block (READ_BL_LEN): {:#03x} ({} bytes)",
            self.read_bl_len,
            self.read_block_len()
        )?;
        writeln!(
            f,
            "  Partial reads (READ_BL_PARTIAL): {}",
            self.read_bl_partial
        )?;
        writeln!(
            f,
            " Write misalign (WRITE_BLK_MISALIGN): {}",
            self.write_blk_misalign
        )?;
        writeln!(
            f,
            "  Read misalign (READ_BLK_MISALIGN): {}",
            self.read_blk_misalign
        )?;
        writeln!(f, "          DSR implemented (DSR_IMP): {}", self.dsr_imp)?;
        match self.size {
            CsdSize::V0 {
                c_size,
                c_size_mult,
                vdd_r_curr_min,
                vdd_r_curr_max,
                vdd_w_curr_min,
                vdd_w_curr_max,
            } => {
                writeln!(
                    f,
                    "              Device size (C_SIZE): {:#05x} ({:.1} {}B)",
                    c_size, capacity, capacity_unit
                )?;
                writeln!(
                    f,
                    "   Read current min (VDD_R_CURR_MIN): {:#03x} ({} mA)",
                    vdd_r_curr_min,
                    CURR_MIN[usize::from(vdd_r_curr_min)]
                )?;
                writeln!(
                    f,
                    "   Read current max (VDD_R_CURR_MAX): {:#03x} ({} mA)",
                    vdd_r_curr_max,
                    CURR_MAX[usize::from(vdd_r_curr_max)]
                )?;
                writeln!(
                    f,
                    "  Write current min (VDD_W_CURR_MIN): {:#03x} ({} mA)",
                    vdd_w_curr_min,
                    CURR_MIN[usize::from(vdd_w_curr_min)]
                )?;
                writeln!(
                    f,
                    "  Write current max (VDD_W_CURR_MAX): {:#03x} ({} mA)",
                    vdd_w_curr_max,
                    CURR_MAX[usize::from(vdd_w_curr_max)]
                )?;
                writeln!(
                    f,
                    "     Size multiplier (C_SIZE_MULT): {:#03x} (x{})",
                    c_size_mult,
                    1u32 << c_size_mult
                )?;
            }
            CsdSize::V1 { c_size } => {
                writeln!(
                    f,
                    "              Device size (C_SIZE): {:#08x} ({:.1} {}B)",
                    c_size, capacity, capacity_unit
                )?;
            }
        }
        writeln!(
            f,
            "   Single-block erase (ERASE_BLK_EN): {}",
            self.erase_blk_en
        )?;
        writeln!(
            f,
            "    Erase sector size (SECTOR_SIZE): {:#04x} ({} blocks)",
            self.sector_size,
            u32::from(self.sector_size) + 1
        )?;
        writeln!(
            f,
            "   Write protect group (WP_GRP_SIZE): {:#04x} ({} blocks)",
            self.wp_grp_size,
            u32::from(self.wp_grp_size) + 1
        )?;
        writeln!(
            f,
            "  Group protection (WP_GRP_ENABLE): {}",
            self.wp_grp_enable
        )?;
        writeln!(
            f,
            "    Write speed factor (R2W_FACTOR): {}",
            self.r2w_factor
        )?;
        writeln!(
            f,
            "   Max write block (WRITE_BL_LEN): {:#03x} ({} bytes)",
            self.write_bl_len,
            self.write_block_len()
        )?;
        writeln!(
            f,
            " Partial writes (WRITE_BL_PARTIAL): {}",
            self.write_bl_partial
        )?;
        writeln!(
            f,
            "  File format group (FILE_FORMAT_GRP): {}",
            self.file_format_grp
        )?;
        writeln!(f, "                   Copy flag (COPY): {}", self.copy)?;
        writeln!(
            f,
            " Permanent protect (PERM_WRITE_PROTECT): {}",
            self.perm_write_protect
        )?;
        writeln!(
            f,
            " Temporary protect (TMP_WRITE_PROTECT): {}",
            self.tmp_write_protect
        )?;
        writeln!(
            f,
            "         File format (FILE_FORMAT): {} ({})",
            self.file_format,
            self.file_format()
        )?;
        write!(f, "                         CRC (CRC): {:#04x}", self.crc)
    }
}

/// An SD or MMC card spoken to in SPI mode, behind a [`SpiPort`].
///
/// [`init`](SdCard::init) asserts CS# for the whole session; the register
/// reads assume it is still asserted and [`finish`](SdCard::finish) releases
/// the bus.
#[derive(Debug)]
pub struct SdCard<'a, S: SpiPort> {
    spi: &'a mut S,
}

impl<'a, S: SpiPort> SdCard<'a, S> {
    pub fn new(spi: &'a mut S) -> Self {
        SdCard { spi }
    }

    /// Powers the card up, resets it and runs the classification handshake.
    ///
    /// On success CS# stays asserted so register reads can follow; on error
    /// the bus is released before returning.
    pub fn init(&mut self) -> Result<CardKind> {
        self.power_up()?;
        self.spi.assert_cs()?;
        let result = self.reset().and_then(|_| self.classify());
        match result {
            Ok(kind) => {
                info!("card recognised: {}", kind);
                Ok(kind)
            }
            Err(e) => {
                let _ = self.spi.release_cs();
                Err(e)
            }
        }
    }

    /// Releases the bus at the end of a session.
    pub fn finish(&mut self) -> Result<()> {
        self.spi.release_cs()
    }

    /// Holds CS# and MOSI high through the supply ramp, then runs the
    /// mandatory dummy clocks (at least 74; ten bytes gives 80).
    fn power_up(&mut self) -> Result<()> {
        self.spi.set_bits_low(MOSI | CS, MOSI | CS, MOSI | CS)?;
        thread::sleep(Duration::from_millis(1));
        self.spi.clock_bytes(10)
    }

    /// CMD0 until the card reports the idle state. Poll timeouts are
    /// retried; a response without the idle bit is a card fault.
    fn reset(&mut self) -> Result<()> {
        let r1 = loop {
            match self.command(CMD0, 0) {
                Ok(r1) => break r1,
                Err(Error::Timeout) => continue,
                Err(e) => return Err(e),
            }
        };
        if r1.contains(R1::IN_IDLE_STATE) {
            Ok(())
        } else {
            warn!("card reset produced {:?}", r1);
            Err(Error::Card(r1))
        }
    }

    /// The version-discovery state machine.
    fn classify(&mut self) -> Result<CardKind> {
        // Probe for a version 2 card first; legacy cards reject CMD8.
        match self.command_long(CMD8, IF_COND_PATTERN) {
            Err(Error::Timeout) => self.classify_legacy(),
            Err(e) => Err(e),
            Ok((r1, _)) if r1.has_error() => self.classify_legacy(),
            Ok((_, echo)) if echo == IF_COND_PATTERN => self.classify_sd2(),
            Ok((_, echo)) => {
                warn!("CMD8 echoed {:#010x}", echo);
                Err(Error::UnknownCard)
            }
        }
    }

    fn classify_legacy(&mut self) -> Result<CardKind> {
        if self.op_cond_loop(|card| {
            card.command(CMD55, 0)?;
            card.command(ACMD41, 0)
        })? {
            return Ok(CardKind::SdV1);
        }
        if self.op_cond_loop(|card| card.command(CMD1, 0))? {
            return Ok(CardKind::MmcV3);
        }
        Err(Error::UnknownCard)
    }

    fn classify_sd2(&mut self) -> Result<CardKind> {
        let initialised = self.op_cond_loop(|card| {
            card.command(CMD55, 0)?;
            card.command(ACMD41, HCS)
        })?;
        if !initialised {
            return Err(Error::UnknownCard);
        }

        let (_, ocr) = self.command_long(CMD58, 0)?;
        if Ocr(ocr).high_capacity() {
            // fix the block length at 512 bytes for FAT interoperability
            self.command(CMD16, 0x0000_0200)?;
            Ok(CardKind::SdV2ByteAddr)
        } else {
            Ok(CardKind::SdV2BlockAddr)
        }
    }

    /// Repeats an operating-condition command for up to one second of wall
    /// time. `Ok(true)` once the card leaves the idle state cleanly.
    fn op_cond_loop(
        &mut self,
        mut cmd: impl FnMut(&mut Self) -> Result<R1>,
    ) -> Result<bool> {
        let start = second_sync();
        loop {
            match cmd(self) {
                Ok(r1) if r1.is_empty() => return Ok(true),
                Ok(r1) if r1 == R1::IN_IDLE_STATE => {} // still initialising
                Ok(_) => return Ok(false),
                Err(Error::Timeout) => return Ok(false),
                Err(e) => return Err(e),
            }
            if now_secs() - start >= 1 {
                return Ok(false);
            }
        }
    }

    /// Reads and decodes the operating-conditions register.
    pub fn read_ocr(&mut self) -> Result<Ocr> {
        let (r1, ocr) = self.command_long(CMD58, 0)?;
        if r1.has_error() {
            return Err(Error::Card(r1));
        }
        Ok(Ocr(ocr))
    }

    /// Reads, checks and decodes the card-identification register.
    pub fn read_cid(&mut self) -> Result<Cid> {
        let raw = self.read_register(CMD10)?;
        Ok(Cid::from_raw(raw))
    }

    /// Reads, checks and decodes the card-specific-data register.
    pub fn read_csd(&mut self) -> Result<Csd> {
        let raw = self.read_register(CMD9)?;
        Ok(Csd::from_raw(raw))
    }

    fn read_register(&mut self, cmd: u8) -> Result<[u8; 16]> {
        let r1 = self.command(cmd, 0)?;
        if r1.has_error() {
            return Err(Error::Card(r1));
        }
        let mut raw = [0u8; 16];
        self.read_data(&mut raw)?;

        // the register carries its own CRC-7 in the trailing byte
        let computed = crc7(&raw[..15]) << 1 | 0x01;
        if computed != raw[15] {
            return Err(Error::Crc {
                received: raw[15].into(),
                computed: computed.into(),
            });
        }
        trace!("register {:?}", HexSlice(&raw));
        Ok(raw)
    }

    /// Sends a command and reads its single-byte R1 response.
    fn command(&mut self, cmd: u8, arg: u32) -> Result<R1> {
        let (r1, _) = self.command_raw(cmd, arg, false)?;
        Ok(r1)
    }

    /// Sends a command with an R3/R7 response: R1 plus four payload bytes.
    fn command_long(&mut self, cmd: u8, arg: u32) -> Result<(R1, u32)> {
        self.command_raw(cmd, arg, true)
    }

    fn command_raw(&mut self, cmd: u8, arg: u32, long: bool) -> Result<(R1, u32)> {
        self.wait_ready()?;

        let mut packet = [0u8; 6];
        packet[0] = 0x40 | (cmd & 0x3F);
        packet[1..5].copy_from_slice(&arg.to_be_bytes());
        packet[5] = crc7(&packet[..5]) << 1 | 0x01;
        self.spi.write(&packet)?;
        trace!("sent {:?}", HexSlice(&packet));

        // MOSI stays high while the card drives its response
        self.spi.set_bits_low(MOSI, MOSI, MOSI)?;

        let first = self.poll_response()?;
        let r1 = R1::from_bits_truncate(first);

        let mut payload = 0u32;
        if long {
            let mut tail = [0u8; 4];
            self.spi.read(&mut tail)?;
            payload = u32::from_be_bytes(tail);
        }
        trace!("response {:#04x}, payload {:#010x}", first, payload);
        Ok((r1, payload))
    }

    /// Clocks until the card signals ready with a 0xFF fill byte.
    fn wait_ready(&mut self) -> Result<()> {
        let mut byte = [0u8; 1];
        loop {
            self.spi.read(&mut byte)?;
            if byte[0] == 0xFF {
                return Ok(());
            }
        }
    }

    /// Polls for the first non-fill byte of a response or token. The limit
    /// counts polled bytes, not clock cycles.
    fn poll_response(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        for _ in 0..RESPONSE_POLL_LIMIT {
            self.spi.read(&mut byte)?;
            if byte[0] != 0xFF {
                return Ok(byte[0]);
            }
        }
        Err(Error::Timeout)
    }

    /// Reads one data packet: start token, `buf.len()` payload bytes and the
    /// 16-bit CRC computed over the payload only.
    fn read_data(&mut self, buf: &mut [u8]) -> Result<()> {
        let token = self.poll_response()?;
        if !DATA_TOKENS.contains(&token) {
            if token & 0xE0 == 0 {
                let token = ErrorToken::from_bits_truncate(token);
                warn!("card sent an error token: {:?}", token);
                return Err(Error::DataToken(token));
            }
            return Err(Error::BadToken(token));
        }

        self.spi.read(buf)?;

        let mut crc = [0u8; 2];
        self.spi.read(&mut crc)?;
        let received = u16::from_be_bytes(crc);
        let computed = crc16(buf);
        if received != computed {
            return Err(Error::Crc { received, computed });
        }
        Ok(())
    }
}
