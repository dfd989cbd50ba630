//! Dump, erase, program and verify an SPI NOR flash chip behind an FT2232H.
//!
//! With only a size the chip is dumped to `EEPROM_backup.bin`; given an
//! image file it is additionally erased, programmed from the image and
//! verified against it.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;
use std::process;

use log::{error, info};
use simplelog::{Config, LevelFilter, TermLogger, TerminalMode};
use structopt::StructOpt;

use ft2232h_spi::flash::Flash;
use ft2232h_spi::ftdi::FtdiDevice;
use ft2232h_spi::spi::{Spi, SpiConfig};
use ft2232h_spi::Result;

const BACKUP_FILE: &str = "EEPROM_backup.bin";

#[derive(Debug, StructOpt)]
struct Options {
    /// Declared flash size in bytes, with an optional K/M/G suffix
    #[structopt(parse(try_from_str = parse_size))]
    size: u32,

    /// Image to program after the dump; omit to only dump
    image: Option<PathBuf>,

    /// Configure log level
    #[structopt(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: LevelFilter,
}

fn parse_size(s: &str) -> std::result::Result<u32, String> {
    let (digits, mult) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 1024u64),
        Some('m') | Some('M') => (&s[..s.len() - 1], 1024 * 1024),
        Some('g') | Some('G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let value: u64 = digits
        .parse()
        .map_err(|e| format!("invalid size '{}': {}", s, e))?;
    let bytes = value * mult;
    if bytes == 0 || bytes > u64::from(u32::MAX) {
        return Err(format!("size '{}' is out of range", s));
    }
    Ok(bytes as u32)
}

fn main() {
    let opts = Options::from_args();
    TermLogger::init(opts.log_level, Config::default(), TerminalMode::Mixed).unwrap();

    if let Err(e) = run(&opts) {
        error!("{}", e);
        process::exit(1);
    }
}

fn run(opts: &Options) -> Result<()> {
    let device = FtdiDevice::open()?;

    // SPI mode 3 at the full 30 MHz; the chip wants MSB first
    let config = SpiConfig {
        cpol: true,
        cpha: true,
        cdiv: 0x0000,
        cdiv5: false,
        mosi_idle: true,
        write_lsb_first: false,
        read_lsb_first: false,
        loopback: false,
    };
    let mut spi = Spi::init(device, config)?;
    let mut flash = Flash::new(&mut spi);

    let id = flash.read_id()?;
    info!("flash identification: {}", id);

    info!("reading flash...");
    let mut backup = File::create(BACKUP_FILE)?;
    flash.read_all(opts.size, &mut backup)?;
    info!("flash dumped to '{}'", BACKUP_FILE);

    if let Some(image) = &opts.image {
        info!("erasing flash...");
        flash.chip_erase()?;
        info!("flash erased");

        info!("writing flash from '{}'...", image.display());
        let mut src = File::open(image)?;
        flash.program_from(&mut src, opts.size)?;

        info!("verifying flash...");
        src.seek(SeekFrom::Start(0))?;
        flash.verify(&mut src, opts.size)?;
        info!("flash verified");
    }

    spi.free().close();
    Ok(())
}
