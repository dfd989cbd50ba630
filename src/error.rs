use crate::sd::{ErrorToken, R1};

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type used by this library.
///
/// Transport and engine failures are fatal for the connection; the protocol
/// layers decide whether card-level conditions end the current pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The FTDI device could not be located, claimed or configured.
    #[error("unable to open FTDI device: {0}")]
    DeviceOpen(String),

    /// A USB transfer failed.
    #[error("USB transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The MPSSE engine echoed its bad-command marker.
    ///
    /// During stream synchronisation this echo is provoked on purpose and
    /// handled locally; anywhere else it means the command stream is corrupt.
    #[error("device rejected MPSSE command {opcode:#04x}")]
    BadCommand { opcode: u8 },

    /// The card produced no response within the polling window.
    #[error("no response from card within the polling window")]
    Timeout,

    /// A register or data block failed its CRC check.
    #[error("CRC mismatch: device sent {received:#06x}, host computed {computed:#06x}")]
    Crc { received: u16, computed: u16 },

    /// The card answered with error bits set in its R1 status.
    #[error("card signalled an error response: {0:?}")]
    Card(R1),

    /// The card replaced a data block with an error token.
    #[error("card signalled a data error token: {0:?}")]
    DataToken(ErrorToken),

    /// A byte arrived where a data token was expected but matches neither
    /// the start-token nor the error-token encoding.
    #[error("unexpected data token {0:#04x}")]
    BadToken(u8),

    /// The initialisation handshake could not classify the card.
    #[error("unable to recognise the attached card")]
    UnknownCard,

    /// Read-back data differs from the source image.
    #[error("data mismatch at address {addr:#08x}")]
    VerifyMismatch { addr: u32 },

    /// The source image ended before the declared device size.
    #[error("source data ended early at address {addr:#08x}")]
    ShortInput { addr: u32 },
}
