//! The MPSSE SPI engine: frames logical SPI operations into the FT2232H's
//! opcode-prefixed command stream.

use std::io;
use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::ftdi::{BitMode, Transport, WriteCheck};
use crate::{Error, Result, SpiPort};

/// Serial clock pin on the low GPIO byte.
pub const SCLK: u8 = 0x01;
/// Master-out slave-in pin.
pub const MOSI: u8 = 0x02;
/// Master-in slave-out pin.
pub const MISO: u8 = 0x04;
/// Chip select pin.
pub const CS: u8 = 0x08;

/// SCLK, MOSI and CS# driven, MISO sampled, upper GPIOL pins don't care.
const LOW_DIRECTION: u8 = 0x0B;

/// Largest byte run a single MPSSE clocking command can carry; its length
/// field is 16 bits wide and holds `n - 1`.
const MAX_RUN_LENGTH: usize = 65_536;

/// MPSSE opcodes, as published in FTDI AN-108.
pub(crate) mod opcode {
    pub const DO_WRITE: u8 = 0x10;
    pub const DO_READ: u8 = 0x20;
    pub const WRITE_NEG: u8 = 0x01;
    pub const READ_NEG: u8 = 0x04;
    pub const LSB_FIRST: u8 = 0x08;

    pub const SET_BITS_LOW: u8 = 0x80;
    pub const GET_BITS_LOW: u8 = 0x81;
    pub const SET_BITS_HIGH: u8 = 0x82;
    pub const GET_BITS_HIGH: u8 = 0x83;
    pub const LOOPBACK_START: u8 = 0x84;
    pub const LOOPBACK_END: u8 = 0x85;
    pub const TCK_DIVISOR: u8 = 0x86;
    pub const DIS_DIV_5: u8 = 0x8A;
    pub const EN_DIV_5: u8 = 0x8B;
    pub const DIS_3_PHASE: u8 = 0x8D;
    pub const CLK_BYTES: u8 = 0x8F;
    pub const DIS_ADAPTIVE: u8 = 0x97;
}

/// SPI line configuration, fixed for the lifetime of the engine.
#[derive(Debug, Clone, Copy)]
pub struct SpiConfig {
    /// Clock polarity: SCLK level while the bus is idle.
    pub cpol: bool,
    /// Clock phase: which edge the slave samples on.
    pub cpha: bool,
    /// Clock divisor, `f = base / (2 * (1 + cdiv))`.
    pub cdiv: u16,
    /// Run the 60 MHz base clock through the divide-by-5 prescaler.
    pub cdiv5: bool,
    /// Level MOSI rests at between transfers.
    pub mosi_idle: bool,
    /// Shift written bytes least-significant bit first.
    pub write_lsb_first: bool,
    /// Shift read bytes least-significant bit first.
    pub read_lsb_first: bool,
    /// Connect TDI to TDO inside the chip (diagnostics only).
    pub loopback: bool,
}

impl SpiConfig {
    /// The SPI mode number, `CPOL << 1 | CPHA`.
    pub fn mode(&self) -> u8 {
        u8::from(self.cpol) << 1 | u8::from(self.cpha)
    }

    /// SCLK frequency in hertz derived from the divisor settings.
    pub fn frequency(&self) -> f64 {
        let base = if self.cdiv5 { 12e6 } else { 60e6 };
        base / (2.0 * (1.0 + f64::from(self.cdiv)))
    }

    /// Length of one SCLK period in seconds.
    pub fn period(&self) -> f64 {
        1.0 / self.frequency()
    }
}

/// Cached level and direction of one GPIO byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bits {
    pub level: u8,
    pub io: u8,
}

impl Bits {
    fn merge(&mut self, mask: u8, level: u8, io: u8) {
        self.level = (self.level & !mask) | (level & mask);
        self.io = (self.io & !mask) | (io & mask);
    }
}

/// The MPSSE SPI engine. Owns the transport while the bus is in use.
///
/// Not thread-safe: the GPIO mirror and the synchronised command stream are
/// global to the chip, so one transaction must finish before the next opens.
#[derive(Debug)]
pub struct Spi<T: Transport> {
    transport: T,
    config: SpiConfig,
    low_bits: Bits,
    high_bits: Bits,
}

impl<T: Transport> Spi<T> {
    /// Puts the device into MPSSE mode, synchronises the command stream and
    /// conditions clock and idle lines.
    pub fn init(transport: T, config: SpiConfig) -> Result<Self> {
        let mut spi = Spi {
            transport,
            config,
            low_bits: Bits::default(),
            high_bits: Bits::default(),
        };

        spi.transport.purge_buffers()?;
        spi.transport.set_bitmode(0x00, BitMode::Reset)?;
        spi.transport.set_bitmode(0x00, BitMode::Mpsse)?;

        // A deliberately invalid opcode; the echo it provokes synchronises
        // the command stream.
        match spi.transport.write_and_check(&[0xAA])? {
            WriteCheck::Rejected { opcode: 0xAA } => {
                info!("MPSSE synchronised on the 0xAA probe")
            }
            WriteCheck::Rejected { opcode } => return Err(Error::BadCommand { opcode }),
            WriteCheck::Accepted => return Err(Error::BadCommand { opcode: 0xAA }),
        }

        let div5 = if config.cdiv5 {
            opcode::EN_DIV_5
        } else {
            opcode::DIS_DIV_5
        };
        spi.transport.write_all(&[
            div5,
            opcode::DIS_ADAPTIVE,
            opcode::DIS_3_PHASE,
            opcode::TCK_DIVISOR,
            config.cdiv as u8,
            (config.cdiv >> 8) as u8,
        ])?;
        // AN_114 settling time
        thread::sleep(Duration::from_millis(20));

        spi.transport.write_all(&[if config.loopback {
            opcode::LOOPBACK_START
        } else {
            opcode::LOOPBACK_END
        }])?;

        spi.low_bits = Bits {
            level: spi.idle_level() | CS,
            io: LOW_DIRECTION,
        };
        spi.high_bits = Bits {
            level: 0xFF,
            io: 0xFF,
        };
        spi.transport.write_all(&[
            opcode::SET_BITS_LOW,
            spi.low_bits.level,
            spi.low_bits.io,
        ])?;
        spi.transport.write_all(&[
            opcode::SET_BITS_HIGH,
            spi.high_bits.level,
            spi.high_bits.io,
        ])?;
        thread::sleep(Duration::from_millis(30));

        info!(
            "SPI mode {} initialised at {:.3} kHz (divisor {}, divide-by-5 {})",
            config.mode(),
            config.frequency() / 1e3,
            config.cdiv,
            if config.cdiv5 { "on" } else { "off" },
        );

        Ok(spi)
    }

    /// The line configuration this engine was initialised with.
    pub fn config(&self) -> &SpiConfig {
        &self.config
    }

    /// The cached state of the low GPIO byte.
    pub fn low_bits(&self) -> Bits {
        self.low_bits
    }

    /// The cached state of the high GPIO byte.
    pub fn high_bits(&self) -> Bits {
        self.high_bits
    }

    /// Releases the underlying transport.
    pub fn free(self) -> T {
        self.transport
    }

    /// Updates level and direction of the high GPIO pins selected by `mask`.
    pub fn set_bits_high(&mut self, mask: u8, level: u8, io: u8) -> Result<()> {
        self.high_bits.merge(mask, level, io);
        self.transport.write_all(&[
            opcode::SET_BITS_HIGH,
            self.high_bits.level,
            self.high_bits.io,
        ])
    }

    /// Samples the low GPIO byte.
    pub fn get_bits_low(&mut self) -> Result<u8> {
        self.transport.write_all(&[opcode::GET_BITS_LOW])?;
        let mut byte = [0u8; 1];
        self.transport.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    /// Samples the high GPIO byte.
    pub fn get_bits_high(&mut self) -> Result<u8> {
        self.transport.write_all(&[opcode::GET_BITS_HIGH])?;
        let mut byte = [0u8; 1];
        self.transport.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    fn idle_level(&self) -> u8 {
        (if self.config.cpol { SCLK } else { 0 }) | (if self.config.mosi_idle { MOSI } else { 0 })
    }

    /// Clock-out opcode for the configured mode.
    ///
    /// AN-108: data is driven on the clock edge opposite to the sampling
    /// edge, so modes 0 and 3 write on the falling edge.
    fn write_opcode(&self) -> u8 {
        let mut op = opcode::DO_WRITE;
        if self.config.write_lsb_first {
            op |= opcode::LSB_FIRST;
        }
        if self.config.mode() == 0 || self.config.mode() == 3 {
            op |= opcode::WRITE_NEG;
        }
        op
    }

    /// Clock-in opcode for the configured mode.
    fn read_opcode(&self) -> u8 {
        let mut op = opcode::DO_READ;
        if self.config.read_lsb_first {
            op |= opcode::LSB_FIRST;
        }
        if self.config.mode() == 1 || self.config.mode() == 2 {
            op |= opcode::READ_NEG;
        }
        op
    }

    /// Emits the run headers asking the engine to clock `len` bytes in.
    fn request_read(&mut self, len: usize) -> Result<()> {
        let op = self.read_opcode();
        let mut headers = Vec::with_capacity(3 * (len / MAX_RUN_LENGTH + 1));
        let mut remaining = len;
        while remaining > 0 {
            let run = remaining.min(MAX_RUN_LENGTH);
            headers.push(op);
            headers.push(((run - 1) & 0xFF) as u8);
            headers.push(((run - 1) >> 8) as u8);
            remaining -= run;
        }
        self.transport.write_all(&headers)
    }
}

impl<T: Transport> SpiPort for Spi<T> {
    fn assert_cs(&mut self) -> Result<()> {
        let mut level = if self.config.mosi_idle { MOSI } else { 0 };
        // Modes 1 and 3 need SCLK pre-driven against its idle level, or the
        // engine produces a runt first clock pulse.
        let sclk_high = if self.config.cpha {
            !self.config.cpol
        } else {
            self.config.cpol
        };
        if sclk_high {
            level |= SCLK;
        }
        debug!("CS asserted (line level {:#04x})", level);
        self.set_bits_low(0xFF, level, LOW_DIRECTION)
    }

    fn release_cs(&mut self) -> Result<()> {
        debug!("CS released");
        self.set_bits_low(0xFF, self.idle_level() | CS, LOW_DIRECTION)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let op = self.write_opcode();
        for run in data.chunks(MAX_RUN_LENGTH) {
            let len = run.len() - 1;
            let mut frame = Vec::with_capacity(3 + run.len());
            frame.push(op);
            frame.push((len & 0xFF) as u8);
            frame.push((len >> 8) as u8);
            frame.extend_from_slice(run);
            self.transport.write_all(&frame)?;
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.request_read(buf.len())?;
        for run in buf.chunks_mut(MAX_RUN_LENGTH) {
            self.transport.read_exact(run)?;
        }
        Ok(())
    }

    fn read_to(&mut self, sink: &mut dyn io::Write, len: u32) -> Result<()> {
        self.request_read(len as usize)?;
        let mut buf = vec![0u8; MAX_RUN_LENGTH.min(len as usize)];
        let mut remaining = len as usize;
        while remaining > 0 {
            let run = remaining.min(MAX_RUN_LENGTH);
            self.transport.read_exact(&mut buf[..run])?;
            sink.write_all(&buf[..run])?;
            remaining -= run;
        }
        Ok(())
    }

    fn set_bits_low(&mut self, mask: u8, level: u8, io: u8) -> Result<()> {
        self.low_bits.merge(mask, level, io);
        self.transport.write_all(&[
            opcode::SET_BITS_LOW,
            self.low_bits.level,
            self.low_bits.io,
        ])
    }

    fn clock_bytes(&mut self, count: u16) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let len = count - 1;
        self.transport
            .write_all(&[opcode::CLK_BYTES, len as u8, (len >> 8) as u8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct MockTransport {
        written: Vec<u8>,
        reads: std::collections::VecDeque<u8>,
    }

    impl Transport for MockTransport {
        fn write_all(&mut self, data: &[u8]) -> Result<()> {
            self.written.extend_from_slice(data);
            Ok(())
        }

        fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
            for byte in buf.iter_mut() {
                *byte = self.reads.pop_front().unwrap_or(0xFF);
            }
            Ok(())
        }

        fn purge_buffers(&mut self) -> Result<()> {
            Ok(())
        }

        fn set_bitmode(&mut self, _mask: u8, _mode: BitMode) -> Result<()> {
            Ok(())
        }
    }

    fn config(mode: u8) -> SpiConfig {
        SpiConfig {
            cpol: mode & 2 != 0,
            cpha: mode & 1 != 0,
            cdiv: 0,
            cdiv5: false,
            mosi_idle: true,
            write_lsb_first: false,
            read_lsb_first: false,
            loopback: false,
        }
    }

    fn engine(mode: u8) -> Spi<MockTransport> {
        let mut transport = MockTransport::default();
        // the synchronisation probe expects the bad-command echo
        transport.reads.extend([0xFA, 0xAA].iter());
        let mut spi = Spi::init(transport, config(mode)).unwrap();
        spi.transport.written.clear();
        spi
    }

    /// Splits a captured write stream into (opcode, payload-length) runs.
    fn parse_runs(mut stream: &[u8], with_payload: bool) -> Vec<(u8, usize)> {
        let mut runs = Vec::new();
        while !stream.is_empty() {
            let op = stream[0];
            let len = usize::from(stream[1]) | usize::from(stream[2]) << 8;
            let n = len + 1;
            if with_payload {
                stream = &stream[3 + n..];
            } else {
                stream = &stream[3..];
            }
            runs.push((op, n));
        }
        runs
    }

    #[test]
    fn clock_out_opcode_table() {
        assert_eq!(engine(0).write_opcode(), opcode::DO_WRITE | opcode::WRITE_NEG);
        assert_eq!(engine(1).write_opcode(), opcode::DO_WRITE);
        assert_eq!(engine(2).write_opcode(), opcode::DO_WRITE);
        assert_eq!(engine(3).write_opcode(), opcode::DO_WRITE | opcode::WRITE_NEG);
    }

    #[test]
    fn clock_in_opcode_table() {
        assert_eq!(engine(0).read_opcode(), opcode::DO_READ);
        assert_eq!(engine(1).read_opcode(), opcode::DO_READ | opcode::READ_NEG);
        assert_eq!(engine(2).read_opcode(), opcode::DO_READ | opcode::READ_NEG);
        assert_eq!(engine(3).read_opcode(), opcode::DO_READ);
    }

    #[test]
    fn lsb_flags_are_independent() {
        let mut cfg = config(0);
        cfg.write_lsb_first = true;
        let spi = Spi {
            transport: MockTransport::default(),
            config: cfg,
            low_bits: Bits::default(),
            high_bits: Bits::default(),
        };
        assert_eq!(
            spi.write_opcode(),
            opcode::DO_WRITE | opcode::WRITE_NEG | opcode::LSB_FIRST
        );
        assert_eq!(spi.read_opcode(), opcode::DO_READ);

        let mut cfg = config(0);
        cfg.read_lsb_first = true;
        let spi = Spi {
            transport: MockTransport::default(),
            config: cfg,
            low_bits: Bits::default(),
            high_bits: Bits::default(),
        };
        assert_eq!(spi.write_opcode(), opcode::DO_WRITE | opcode::WRITE_NEG);
        assert_eq!(spi.read_opcode(), opcode::DO_READ | opcode::LSB_FIRST);
    }

    #[test]
    fn write_runs_are_chunked_at_the_length_field_limit() {
        // a small deterministic congruential sequence of sizes
        let mut seed = 0x2545_F491u32;
        let mut sizes = vec![1, 2, 255, 256, 65_535, 65_536, 65_537, 131_072, 200_000];
        for _ in 0..24 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            sizes.push((seed as usize % 200_000) + 1);
        }

        for n in sizes {
            let mut spi = engine(0);
            spi.write(&vec![0xA5; n]).unwrap();

            let runs = parse_runs(&spi.transport.written, true);
            let total: usize = runs.iter().map(|&(_, n)| n).sum();
            assert_eq!(total, n, "total payload for n = {}", n);
            for (i, &(op, run)) in runs.iter().enumerate() {
                assert_eq!(op, opcode::DO_WRITE | opcode::WRITE_NEG);
                assert!(run >= 1 && run <= MAX_RUN_LENGTH);
                if i + 1 < runs.len() {
                    assert_eq!(run, MAX_RUN_LENGTH, "only the last run may be short");
                }
            }
        }
    }

    #[test]
    fn read_requests_are_chunked_at_the_length_field_limit() {
        for &n in &[1usize, 65_536, 65_537, 200_000] {
            let mut spi = engine(3);
            let mut buf = vec![0u8; n];
            spi.read(&mut buf).unwrap();

            let runs = parse_runs(&spi.transport.written, false);
            let total: usize = runs.iter().map(|&(_, n)| n).sum();
            assert_eq!(total, n);
            for &(op, run) in &runs {
                assert_eq!(op, opcode::DO_READ);
                assert!(run >= 1 && run <= MAX_RUN_LENGTH);
            }
        }
    }

    #[test]
    fn gpio_mirror_merges_masked_updates() {
        let mut seed = 0xDEAD_BEEFu32;
        let mut spi = engine(0);
        let mut level = spi.low_bits.level;
        let mut io = spi.low_bits.io;

        for _ in 0..200 {
            let mut next = || {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (seed >> 16) as u8
            };
            let (mask, new_level, new_io) = (next(), next(), next());

            spi.set_bits_low(mask, new_level, new_io).unwrap();
            level = (level & !mask) | (new_level & mask);
            io = (io & !mask) | (new_io & mask);

            assert_eq!(spi.low_bits, Bits { level, io });
            let frame_start = spi.transport.written.len() - 3;
            assert_eq!(
                &spi.transport.written[frame_start..],
                &[opcode::SET_BITS_LOW, level, io]
            );
        }
    }

    #[test]
    fn clock_frequency_vectors() {
        let mut cfg = config(0);
        cfg.cdiv = 0;
        cfg.cdiv5 = false;
        assert!((cfg.frequency() - 30e6).abs() < 1.0);

        cfg.cdiv = 29;
        cfg.cdiv5 = true;
        assert!((cfg.frequency() - 200e3).abs() < 1.0);
        assert!((cfg.period() - 5e-6).abs() < 1e-9);
    }

    #[test]
    fn init_emits_clock_setup_and_idle_lines() {
        let mut transport = MockTransport::default();
        transport.reads.extend([0xFA, 0xAA].iter());
        let spi = Spi::init(transport, config(3)).unwrap();

        // probe, clock frame, loopback off, low and high GPIO bytes
        let idle = SCLK | MOSI | CS;
        assert_eq!(
            spi.transport.written,
            vec![
                0xAA,
                opcode::DIS_DIV_5,
                opcode::DIS_ADAPTIVE,
                opcode::DIS_3_PHASE,
                opcode::TCK_DIVISOR,
                0x00,
                0x00,
                opcode::LOOPBACK_END,
                opcode::SET_BITS_LOW,
                idle,
                LOW_DIRECTION,
                opcode::SET_BITS_HIGH,
                0xFF,
                0xFF,
            ]
        );
        assert_eq!(spi.low_bits, Bits { level: idle, io: LOW_DIRECTION });
        assert_eq!(spi.high_bits, Bits { level: 0xFF, io: 0xFF });
    }

    #[test]
    fn init_rejects_an_unexpected_echo() {
        let mut transport = MockTransport::default();
        transport.reads.extend([0xFA, 0x55].iter());
        match Spi::init(transport, config(0)) {
            Err(Error::BadCommand { opcode: 0x55 }) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn cs_assert_predrives_sclk_for_late_phase_modes() {
        for mode in 0..4u8 {
            let mut spi = engine(mode);
            spi.assert_cs().unwrap();

            let cpol = mode & 2 != 0;
            let cpha = mode & 1 != 0;
            let expect_sclk = if cpha { !cpol } else { cpol };

            let bits = spi.low_bits;
            assert_eq!(bits.level & CS, 0, "CS must be low in mode {}", mode);
            assert_eq!(
                bits.level & SCLK != 0,
                expect_sclk,
                "SCLK pre-drive wrong in mode {}",
                mode
            );
            assert_ne!(bits.level & MOSI, 0, "MOSI keeps its idle level");

            spi.release_cs().unwrap();
            let bits = spi.low_bits;
            assert_ne!(bits.level & CS, 0);
            assert_eq!(bits.level & SCLK != 0, cpol, "SCLK idles at CPOL");
        }
    }

    #[test]
    fn high_gpio_mirror_and_pin_sampling() {
        let mut spi = engine(0);

        spi.set_bits_high(0x0F, 0x05, 0xFF).unwrap();
        assert_eq!(spi.high_bits, Bits { level: 0xF5, io: 0xFF });
        let tail = spi.transport.written.len() - 3;
        assert_eq!(
            &spi.transport.written[tail..],
            &[opcode::SET_BITS_HIGH, 0xF5, 0xFF]
        );

        spi.transport.reads.push_back(0xA5);
        assert_eq!(spi.get_bits_low().unwrap(), 0xA5);
        assert_eq!(*spi.transport.written.last().unwrap(), opcode::GET_BITS_LOW);
    }

    #[test]
    fn clock_bytes_emits_a_data_less_run() {
        let mut spi = engine(0);
        spi.clock_bytes(10).unwrap();
        assert_eq!(spi.transport.written, vec![opcode::CLK_BYTES, 9, 0]);
    }
}
