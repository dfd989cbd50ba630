//! A host-side driver for SPI memories behind an FTDI FT2232H bridge.
//!
//! The FT2232H's MPSSE engine synthesises SPI from an opcode-prefixed byte
//! stream sent over USB bulk endpoints. This crate speaks that stream to two
//! families of devices: Macronix-style SPI NOR flash chips ([`flash`]) and
//! SD/MMC cards in SPI protocol mode ([`sd`]).
//!
//! The layers mirror the hardware: [`ftdi`] moves raw bytes over USB,
//! [`spi`] frames them into MPSSE commands and owns the chip-select
//! lifecycle, and the device protocol modules sit on top of the [`SpiPort`]
//! trait, which keeps them independent of the MPSSE particulars and lets the
//! tests drive them with a scripted port.

#![doc(html_root_url = "https://docs.rs/ft2232h-spi/0.1.0")]
#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod crc;
mod error;
pub mod flash;
pub mod ftdi;
pub mod sd;
pub mod spi;
mod utils;

pub use crate::error::{Error, Result};

use std::io;

/// Byte-level SPI bus operations offered to the device protocol layers.
pub trait SpiPort {
    /// Drives CS# low and conditions SCLK and MOSI for a new command.
    fn assert_cs(&mut self) -> Result<()>;

    /// Drives CS# high and restores the idle line levels.
    fn release_cs(&mut self) -> Result<()>;

    /// Clocks `data` out on MOSI.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Clocks `buf.len()` bytes in from MISO.
    fn read(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Clocks `len` bytes in from MISO, streaming them into `sink`.
    fn read_to(&mut self, sink: &mut dyn io::Write, len: u32) -> Result<()>;

    /// Updates level and direction of the low GPIO pins selected by `mask`.
    fn set_bits_low(&mut self, mask: u8, level: u8, io: u8) -> Result<()>;

    /// Runs `count * 8` clock cycles without touching the data lines.
    fn clock_bytes(&mut self, count: u16) -> Result<()>;

    /// Runs `f` with CS# asserted and releases it again on every path,
    /// including early error returns from `f`.
    fn transaction<R, F>(&mut self, f: F) -> Result<R>
    where
        Self: Sized,
        F: FnOnce(&mut Self) -> Result<R>,
    {
        self.assert_cs()?;
        let result = f(self);
        let released = self.release_cs();
        let value = result?;
        released?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Counts CS edges so the release-on-error guarantee can be observed.
    #[derive(Debug, Default)]
    struct CsRecorder {
        asserted: usize,
        released: usize,
    }

    impl SpiPort for CsRecorder {
        fn assert_cs(&mut self) -> Result<()> {
            self.asserted += 1;
            Ok(())
        }

        fn release_cs(&mut self) -> Result<()> {
            self.released += 1;
            Ok(())
        }

        fn write(&mut self, _data: &[u8]) -> Result<()> {
            Ok(())
        }

        fn read(&mut self, _buf: &mut [u8]) -> Result<()> {
            Ok(())
        }

        fn read_to(&mut self, _sink: &mut dyn io::Write, _len: u32) -> Result<()> {
            Ok(())
        }

        fn set_bits_low(&mut self, _mask: u8, _level: u8, _io: u8) -> Result<()> {
            Ok(())
        }

        fn clock_bytes(&mut self, _count: u16) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn transaction_releases_cs_on_success() {
        let mut port = CsRecorder::default();
        port.transaction(|_| Ok(())).unwrap();
        assert_eq!(port.asserted, 1);
        assert_eq!(port.released, 1);
    }

    #[test]
    fn transaction_releases_cs_on_error() {
        let mut port = CsRecorder::default();
        let result: Result<()> = port.transaction(|_| Err(Error::Timeout));
        assert!(result.is_err());
        assert_eq!(port.asserted, 1);
        assert_eq!(port.released, 1);
    }
}
