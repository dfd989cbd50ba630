//! Driver for Macronix-style SPI NOR flash chips.
//!
//! The chips follow the classic 25-series command set: every mutating
//! command must be preceded by a write-enable and followed by polling the
//! status register until the write-in-progress flag clears.

use std::fmt;
use std::io;

use bitflags::bitflags;
use log::{info, warn};

use crate::utils::{now_secs, second_sync};
use crate::{Error, Result, SpiPort};

/// Bytes in one program page. Programming never crosses a page boundary;
/// the chip would wrap around inside the page.
pub const PAGE_SIZE: usize = 256;

/// Flash command opcodes (Macronix MX25 series).
#[allow(unused)]
enum Opcode {
    /// Set the write enable latch.
    WriteEnable = 0x06,
    /// Clear the write enable latch.
    WriteDisable = 0x04,
    /// Read the 8-bit status register.
    ReadStatus = 0x05,
    /// Write the 8-bit status register. Not all bits are writeable.
    WriteStatus = 0x01,
    /// Sequential read; the chip auto-increments until CS# rises.
    Read = 0x03,
    /// Sequential read with a dummy byte, usable at higher clock rates.
    FastRead = 0x0B,
    /// Program 1 to 256 bytes within one page.
    PageProgram = 0x02,
    SectorErase = 0x20,
    BlockErase = 0x52,
    ChipErase = 0xC7,
    DeepPowerDown = 0xB9,
    /// Leave deep power-down; doubles as the legacy electronic-ID read.
    ReleasePowerDown = 0xAB,
    /// Read the JEDEC manufacturer/type/density identification.
    ReadJedecId = 0x9F,
    /// Read the 8-bit manufacturer and device IDs.
    ReadMfDId = 0x90,
}

bitflags! {
    /// Status register bits.
    pub struct Status: u8 {
        /// Write in progress.
        const WIP = 0x01;
        /// Write enable latch.
        const WEL = 0x02;
        /// Block protection bits.
        const BP0 = 0x04;
        const BP1 = 0x08;
        const BP2 = 0x10;
        /// Status register write disable.
        const SRWD = 0x80;
    }
}

/// 3-byte JEDEC identification of a flash chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Id {
    pub manufacturer_id: u8,
    pub memory_type: u8,
    pub density: u8,
}

impl Id {
    /// Manufacturer name for the JEDEC ID byte, or `"Unknown"`.
    pub fn manufacturer(&self) -> &'static str {
        match self.manufacturer_id {
            0x01 => "AMD/Cypress/Spansion",
            0x04 => "Fujitsu",
            0x1C => "EON",
            0x1F => "Atmel",
            0x20 => "ST/SGS/Micron",
            0x31 => "Catalyst",
            0x37 => "AMIC",
            0x40 => "SyncMOS",
            0x4A => "ESI",
            0x52 => "Alliance Semiconductor",
            0x5E => "Tenx",
            0x62 => "ON Semiconductor",
            0x89 => "Intel",
            0x8C => "ESMT",
            0x97 => "Texas Instruments",
            0x9D => "PMC",
            0xAD => "Bright/Hyundai",
            0xB0 => "Sharp",
            0xBF => "SST",
            0xC2 => "Macronix",
            0xC8 => "ELM/GigaDevice",
            0xD5 => "ISSI",
            0xDA | 0xEF => "Winbond",
            0xF8 => "Fidelix",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "manufacturer {:#04x} ({}), type {:#04x}, density {:#04x}",
            self.manufacturer_id,
            self.manufacturer(),
            self.memory_type,
            self.density
        )
    }
}

/// Driver for a NOR flash chip behind a [`SpiPort`].
///
/// Borrows the port for the duration of the device session; every primitive
/// is exactly one chip-select transaction.
#[derive(Debug)]
pub struct Flash<'a, S: SpiPort> {
    spi: &'a mut S,
}

impl<'a, S: SpiPort> Flash<'a, S> {
    pub fn new(spi: &'a mut S) -> Self {
        Flash { spi }
    }

    /// Reads the JEDEC manufacturer/type/density identification.
    pub fn read_id(&mut self) -> Result<Id> {
        let mut id = [0u8; 3];
        self.spi.transaction(|spi| {
            spi.write(&[Opcode::ReadJedecId as u8])?;
            spi.read(&mut id)
        })?;
        Ok(Id {
            manufacturer_id: id[0],
            memory_type: id[1],
            density: id[2],
        })
    }

    /// Reads the status register.
    pub fn read_status(&mut self) -> Result<Status> {
        let mut byte = [0u8; 1];
        self.spi.transaction(|spi| {
            spi.write(&[Opcode::ReadStatus as u8])?;
            spi.read(&mut byte)
        })?;
        Ok(Status::from_bits_truncate(byte[0]))
    }

    /// Polls the status register until the write-in-progress flag clears.
    ///
    /// The chip keeps shifting the register out while CS# stays low, so one
    /// command suffices for the whole poll. There is no upper bound; the
    /// parts complete within their datasheet times.
    pub fn wait_while_busy(&mut self) -> Result<()> {
        self.spi.transaction(|spi| {
            spi.write(&[Opcode::ReadStatus as u8])?;
            let mut byte = [0u8; 1];
            loop {
                spi.read(&mut byte)?;
                if byte[0] & Status::WIP.bits() == 0 {
                    return Ok(());
                }
            }
        })
    }

    /// Sets the write enable latch. The chip silently ignores any program
    /// or erase command that is not immediately preceded by this.
    pub fn write_enable(&mut self) -> Result<()> {
        self.spi
            .transaction(|spi| spi.write(&[Opcode::WriteEnable as u8]))
    }

    /// Erases the whole array to 0xFF and waits for completion.
    pub fn chip_erase(&mut self) -> Result<()> {
        self.wait_while_busy()?;
        self.write_enable()?;
        self.spi
            .transaction(|spi| spi.write(&[Opcode::ChipErase as u8]))?;
        self.wait_while_busy()
    }

    /// Programs `data` starting at `addr`.
    ///
    /// The caller guarantees `1..=256` bytes that do not cross a page
    /// boundary.
    pub fn page_program(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        debug_assert!(!data.is_empty() && data.len() <= PAGE_SIZE);
        debug_assert_eq!(
            addr as usize / PAGE_SIZE,
            (addr as usize + data.len() - 1) / PAGE_SIZE
        );

        self.wait_while_busy()?;
        self.write_enable()?;
        self.spi.transaction(|spi| {
            spi.write(&[
                Opcode::PageProgram as u8,
                (addr >> 16) as u8,
                (addr >> 8) as u8,
                addr as u8,
            ])?;
            spi.write(data)
        })
    }

    /// Streams the whole array, starting at address zero, into `sink`.
    pub fn read_all(&mut self, size: u32, sink: &mut dyn io::Write) -> Result<()> {
        self.spi.transaction(|spi| {
            spi.write(&[Opcode::Read as u8, 0x00, 0x00, 0x00])?;
            spi.read_to(sink, size)
        })
    }

    /// Programs `size` bytes from `src`, one page at a time, and returns the
    /// number of bytes actually written.
    ///
    /// A source that ends early is reported as a warning, not an error; the
    /// erased remainder of the chip keeps its 0xFF fill. Progress is logged
    /// at most once per second.
    pub fn program_from(&mut self, src: &mut dyn io::Read, size: u32) -> Result<u32> {
        let mut page = [0u8; PAGE_SIZE];
        let mut addr = 0u32;
        let mut stamp = second_sync();

        while addr < size {
            let want = PAGE_SIZE.min((size - addr) as usize);
            let got = read_fully(src, &mut page[..want])?;
            if got > 0 {
                self.page_program(addr, &page[..got])?;
                addr += got as u32;
            }
            if got < want {
                warn!("end of input reached at address {:#08x}", addr);
                break;
            }

            let now = now_secs();
            if now - stamp >= 1 || addr == size {
                info!(
                    "{:.1}% ({} bytes written)",
                    100.0 * f64::from(addr) / f64::from(size),
                    addr
                );
                stamp = now;
            }
        }
        self.wait_while_busy()?;

        if addr >= size {
            let mut probe = [0u8; 1];
            if src.read(&mut probe)? == 1 {
                warn!("input continues past the declared size {:#08x}", size);
            }
        }
        Ok(addr)
    }

    /// Reads the chip back and compares it byte for byte against `src`.
    ///
    /// The first difference aborts with its address. A source that ends
    /// before `size` is a failure here too, never a silent pass.
    pub fn verify(&mut self, src: &mut dyn io::Read, size: u32) -> Result<()> {
        let mut readback = Vec::with_capacity(size as usize);
        self.read_all(size, &mut readback)?;

        let mut buf = [0u8; 4096];
        let mut addr = 0u32;
        while addr < size {
            let want = buf.len().min((size - addr) as usize);
            let got = read_fully(src, &mut buf[..want])?;
            for (i, &byte) in buf[..got].iter().enumerate() {
                if byte != readback[addr as usize + i] {
                    return Err(Error::VerifyMismatch {
                        addr: addr + i as u32,
                    });
                }
            }
            addr += got as u32;
            if got < want {
                return Err(Error::ShortInput { addr });
            }
        }
        info!("verified {} bytes", size);
        Ok(())
    }
}

/// Reads until `buf` is full or the source is exhausted.
fn read_fully(src: &mut dyn io::Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = src.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted port: records the byte stream and plays back MISO bytes.
    #[derive(Debug, Default)]
    struct ScriptPort {
        written: Vec<Vec<u8>>,
        miso: VecDeque<u8>,
        cs_low: bool,
    }

    impl SpiPort for ScriptPort {
        fn assert_cs(&mut self) -> Result<()> {
            assert!(!self.cs_low, "transactions must not nest");
            self.cs_low = true;
            Ok(())
        }

        fn release_cs(&mut self) -> Result<()> {
            assert!(self.cs_low);
            self.cs_low = false;
            Ok(())
        }

        fn write(&mut self, data: &[u8]) -> Result<()> {
            assert!(self.cs_low, "writes happen inside a transaction");
            self.written.push(data.to_vec());
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<()> {
            for byte in buf.iter_mut() {
                *byte = self.miso.pop_front().unwrap_or(0xFF);
            }
            Ok(())
        }

        fn read_to(&mut self, sink: &mut dyn io::Write, len: u32) -> Result<()> {
            let mut buf = vec![0u8; len as usize];
            self.read(&mut buf)?;
            sink.write_all(&buf)?;
            Ok(())
        }

        fn set_bits_low(&mut self, _mask: u8, _level: u8, _io: u8) -> Result<()> {
            Ok(())
        }

        fn clock_bytes(&mut self, _count: u16) -> Result<()> {
            Ok(())
        }
    }

    /// In-memory flash chip: executes commands the way the silicon would.
    #[derive(Debug)]
    struct MemFlash {
        mem: Vec<u8>,
        wel: bool,
        cmd: Vec<u8>,
        read_offset: usize,
        cs_low: bool,
    }

    impl MemFlash {
        fn new(size: usize) -> Self {
            MemFlash {
                mem: vec![0xFF; size],
                wel: false,
                cmd: Vec::new(),
                read_offset: 0,
                cs_low: false,
            }
        }

        fn status(&self) -> u8 {
            // WIP observes as already clear; the mock completes instantly
            (self.wel as u8) << 1
        }

        fn next_read_byte(&mut self) -> u8 {
            let byte = match self.cmd.first() {
                Some(&op) if op == Opcode::ReadStatus as u8 => self.status(),
                Some(&op) if op == Opcode::ReadJedecId as u8 => {
                    [0xC2, 0x20, 0x18][self.read_offset.min(2)]
                }
                Some(&op) if op == Opcode::Read as u8 => {
                    let addr = u32::from_be_bytes([0, self.cmd[1], self.cmd[2], self.cmd[3]]);
                    self.mem[addr as usize + self.read_offset]
                }
                _ => 0xFF,
            };
            self.read_offset += 1;
            byte
        }
    }

    impl SpiPort for MemFlash {
        fn assert_cs(&mut self) -> Result<()> {
            assert!(!self.cs_low);
            self.cs_low = true;
            self.cmd.clear();
            self.read_offset = 0;
            Ok(())
        }

        fn release_cs(&mut self) -> Result<()> {
            assert!(self.cs_low);
            self.cs_low = false;
            // mutating commands execute on the rising CS# edge
            match self.cmd.first().copied() {
                Some(op) if op == Opcode::WriteEnable as u8 => self.wel = true,
                Some(op) if op == Opcode::PageProgram as u8 => {
                    assert!(self.wel, "program without write enable");
                    let addr =
                        u32::from_be_bytes([0, self.cmd[1], self.cmd[2], self.cmd[3]]) as usize;
                    for (i, &byte) in self.cmd[4..].iter().enumerate() {
                        self.mem[addr + i] &= byte;
                    }
                    self.wel = false;
                }
                Some(op) if op == Opcode::ChipErase as u8 => {
                    assert!(self.wel, "erase without write enable");
                    for byte in self.mem.iter_mut() {
                        *byte = 0xFF;
                    }
                    self.wel = false;
                }
                _ => {}
            }
            Ok(())
        }

        fn write(&mut self, data: &[u8]) -> Result<()> {
            assert!(self.cs_low);
            self.cmd.extend_from_slice(data);
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<()> {
            for byte in buf.iter_mut() {
                *byte = self.next_read_byte();
            }
            Ok(())
        }

        fn read_to(&mut self, sink: &mut dyn io::Write, len: u32) -> Result<()> {
            let mut buf = vec![0u8; len as usize];
            self.read(&mut buf)?;
            sink.write_all(&buf)?;
            Ok(())
        }

        fn set_bits_low(&mut self, _mask: u8, _level: u8, _io: u8) -> Result<()> {
            Ok(())
        }

        fn clock_bytes(&mut self, _count: u16) -> Result<()> {
            Ok(())
        }
    }

    fn pseudo_random(len: usize) -> Vec<u8> {
        let mut seed = 0x1234_5678u32;
        (0..len)
            .map(|_| {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (seed >> 16) as u8
            })
            .collect()
    }

    #[test]
    fn read_id_decodes_the_jedec_reply() {
        let mut port = ScriptPort::default();
        port.miso.extend([0xC2, 0x20, 0x18].iter());

        let id = Flash::new(&mut port).read_id().unwrap();
        assert_eq!(
            id,
            Id {
                manufacturer_id: 0xC2,
                memory_type: 0x20,
                density: 0x18
            }
        );
        assert_eq!(id.manufacturer(), "Macronix");
        assert_eq!(port.written, vec![vec![Opcode::ReadJedecId as u8]]);
    }

    #[test]
    fn page_program_emits_the_write_enable_and_command_frames() {
        let mut port = ScriptPort::default();
        // the busy gate reads one clear status byte
        port.miso.push_back(0x00);

        let data: Vec<u8> = (0..=255).collect();
        Flash::new(&mut port).page_program(0, &data).unwrap();

        assert_eq!(
            port.written,
            vec![
                vec![Opcode::ReadStatus as u8],
                vec![Opcode::WriteEnable as u8],
                vec![Opcode::PageProgram as u8, 0x00, 0x00, 0x00],
                data,
            ]
        );
    }

    #[test]
    fn status_is_clear_after_a_completed_program() {
        let mut chip = MemFlash::new(512);
        let mut flash = Flash::new(&mut chip);
        flash.page_program(0, &[0x55; 16]).unwrap();

        let status = flash.read_status().unwrap();
        assert!(!status.contains(Status::WIP));
        assert!(!status.contains(Status::WEL));
    }

    #[test]
    fn wait_while_busy_polls_until_wip_clears() {
        let mut port = ScriptPort::default();
        port.miso.extend([0x01, 0x01, 0x03, 0x00].iter());

        Flash::new(&mut port).wait_while_busy().unwrap();
        assert!(port.miso.is_empty(), "poll stops on the first clear byte");
    }

    #[test]
    fn chip_round_trip_preserves_the_image() {
        const SIZE: u32 = 1 << 20;
        let image = pseudo_random(SIZE as usize);

        let mut chip = MemFlash::new(SIZE as usize);
        let mut flash = Flash::new(&mut chip);
        flash.chip_erase().unwrap();
        assert_eq!(flash.program_from(&mut &image[..], SIZE).unwrap(), SIZE);

        let mut readback = Vec::new();
        flash.read_all(SIZE, &mut readback).unwrap();
        assert_eq!(readback, image);

        flash.verify(&mut &image[..], SIZE).unwrap();
    }

    #[test]
    fn verify_reports_the_first_differing_address() {
        const SIZE: u32 = 4096;
        let image = pseudo_random(SIZE as usize);

        let mut chip = MemFlash::new(SIZE as usize);
        chip.mem.copy_from_slice(&image);
        chip.mem[0x123] ^= 0x40;

        match Flash::new(&mut chip).verify(&mut &image[..], SIZE) {
            Err(Error::VerifyMismatch { addr: 0x123 }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn verify_rejects_a_short_source() {
        const SIZE: u32 = 1024;
        let image = pseudo_random(SIZE as usize);

        let mut chip = MemFlash::new(SIZE as usize);
        chip.mem.copy_from_slice(&image);

        match Flash::new(&mut chip).verify(&mut &image[..100], SIZE) {
            Err(Error::ShortInput { addr: 100 }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn short_sources_program_what_they_have() {
        const SIZE: u32 = 1024;
        let image = pseudo_random(300);

        let mut chip = MemFlash::new(SIZE as usize);
        let written = Flash::new(&mut chip)
            .program_from(&mut &image[..], SIZE)
            .unwrap();

        assert_eq!(written, 300);
        assert_eq!(&chip.mem[..300], &image[..]);
        assert!(chip.mem[300..].iter().all(|&b| b == 0xFF));
    }
}
