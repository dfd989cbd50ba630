//! Initialise an SD/MMC card in SPI mode and print its version and its
//! OCR, CID and CSD registers.

use std::process;

use log::error;
use simplelog::{Config, LevelFilter, TermLogger, TerminalMode};
use structopt::StructOpt;

use ft2232h_spi::ftdi::FtdiDevice;
use ft2232h_spi::sd::SdCard;
use ft2232h_spi::spi::{Spi, SpiConfig};
use ft2232h_spi::{Result, SpiPort};

#[derive(Debug, StructOpt)]
struct Options {
    /// Configure log level
    #[structopt(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: LevelFilter,
}

fn main() {
    let opts = Options::from_args();
    TermLogger::init(opts.log_level, Config::default(), TerminalMode::Mixed).unwrap();

    if let Err(e) = run() {
        error!("{}", e);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let device = FtdiDevice::open()?;

    // 400 kHz identification clock: divide-by-5 with divisor 14
    let config = SpiConfig {
        cpol: true,
        cpha: true,
        cdiv: 14,
        cdiv5: true,
        mosi_idle: true,
        write_lsb_first: false,
        read_lsb_first: false,
        loopback: false,
    };
    let mut spi = Spi::init(device, config)?;

    let mut card = SdCard::new(&mut spi);
    let kind = card.init()?;
    println!("card version: {}", kind);

    let result = print_registers(&mut card);
    card.finish()?;
    spi.free().close();
    result
}

fn print_registers<S: SpiPort>(card: &mut SdCard<'_, S>) -> Result<()> {
    let ocr = card.read_ocr()?;
    println!("{}", ocr);

    let cid = card.read_cid()?;
    println!("{}", cid);

    let csd = card.read_csd()?;
    println!("{}", csd);

    Ok(())
}
