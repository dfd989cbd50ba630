//! USB transport to the FT2232H, speaking FTDI's vendor SIO protocol.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::thread;
use std::time::Duration;

use futures_lite::future::block_on;
use log::{debug, info, warn};
use nusb::transfer::{Control, ControlType, Recipient, RequestBuffer};

use crate::{Error, Result};

/// Default USB vendor ID of an FT2232H.
pub const VENDOR_ID: u16 = 0x0403;
/// Default USB product ID of an FT2232H.
pub const PRODUCT_ID: u16 = 0x6010;

/// Marker the MPSSE engine echoes ahead of an opcode it did not understand.
pub const BAD_COMMAND: u8 = 0xFA;

const SIO_RESET_REQUEST: u8 = 0x00;
const SIO_POLL_MODEM_STATUS_REQUEST: u8 = 0x05;
const SIO_SET_LATENCY_TIMER_REQUEST: u8 = 0x09;
const SIO_SET_BITMODE_REQUEST: u8 = 0x0B;

const SIO_RESET_SIO: u16 = 0;
const SIO_RESET_PURGE_RX: u16 = 1;
const SIO_RESET_PURGE_TX: u16 = 2;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

/// Bulk endpoints and control index of interface A.
const INTERFACE_INDEX: u16 = 1;
const READ_EP: u8 = 0x81;
const WRITE_EP: u8 = 0x02;

/// High-speed bulk packets carry at most 512 bytes, two of which are the
/// modem status prefix the chip inserts into every packet.
const MAX_PACKET_SIZE: usize = 512;

/// Bit modes of the FT2232H used by this crate.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitMode {
    Reset = 0,
    Mpsse = 2,
}

bitflags::bitflags! {
    /// The 16-bit modem status word, with the modem bits in the high byte
    /// and the line status bits in the low byte.
    pub struct ModemStatus: u16 {
        /// Data ready.
        const DR = 0x0001;
        /// Overrun error.
        const OE = 0x0002;
        /// Parity error.
        const PE = 0x0004;
        /// Framing error.
        const FE = 0x0008;
        /// Break interrupt.
        const BI = 0x0010;
        /// Transmitter holding register empty.
        const THRE = 0x0020;
        /// Transmitter buffer empty.
        const TEMT = 0x0040;
        /// Error in receiver FIFO.
        const RCVR = 0x0080;
        /// Clear to send.
        const CTS = 0x1000;
        /// Data set ready.
        const DSR = 0x2000;
        /// Ring indicator.
        const RI = 0x4000;
        /// Receive line signal detect.
        const RLSD = 0x8000;
    }
}

impl ModemStatus {
    /// Builds the status word from the two raw bytes of the poll response,
    /// first byte high. The low nibble of the first byte is reserved zero.
    fn from_raw(raw: [u8; 2]) -> Self {
        ModemStatus::from_bits_truncate(u16::from(raw[0]) << 8 | u16::from(raw[1]))
    }
}

/// Outcome of a write followed by the two-byte command echo check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCheck {
    /// The device consumed the data without complaint.
    Accepted,
    /// The device echoed the bad-command marker for `opcode`.
    Rejected { opcode: u8 },
}

/// Byte access to the MPSSE data stream.
///
/// This is the seam between the SPI engine and the USB plumbing; the engine
/// tests substitute a scripted implementation.
pub trait Transport {
    /// Writes the whole buffer, looping over partial transfers.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Fills the whole buffer, looping over partial transfers.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Clears the chip's transmit and receive buffers.
    fn purge_buffers(&mut self) -> Result<()>;

    /// Selects a bit mode with the given GPIO direction mask.
    fn set_bitmode(&mut self, mask: u8, mode: BitMode) -> Result<()>;

    /// Writes `data`, then reads the two-byte reply and checks it for the
    /// bad-command echo. Used to synchronise the MPSSE command stream.
    fn write_and_check(&mut self, data: &[u8]) -> Result<WriteCheck> {
        self.write_all(data)?;
        let mut echo = [0u8; 2];
        self.read_exact(&mut echo)?;
        if echo[0] == BAD_COMMAND {
            Ok(WriteCheck::Rejected { opcode: echo[1] })
        } else {
            Ok(WriteCheck::Accepted)
        }
    }
}

/// An open MPSSE-capable interface A of an FT2232H.
///
/// Single-threaded use only; the handle owns nothing but the USB endpoint
/// and releases it when dropped.
pub struct FtdiDevice {
    interface: nusb::Interface,
    /// Payload bytes received beyond what the last read asked for.
    pending: VecDeque<u8>,
}

impl FtdiDevice {
    /// Opens the first device matching the default FT2232H identifiers.
    pub fn open() -> Result<Self> {
        Self::open_with(VENDOR_ID, PRODUCT_ID)
    }

    /// Opens the first device matching `vid:pid`, claims interface A, resets
    /// it and sets the 1 ms latency timer the byte-polling paths rely on.
    pub fn open_with(vid: u16, pid: u16) -> Result<Self> {
        let open_err = |e: &dyn fmt::Display| Error::DeviceOpen(e.to_string());

        let info = nusb::list_devices()
            .map_err(|e| open_err(&e))?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or_else(|| Error::DeviceOpen(format!("no device {:04x}:{:04x} found", vid, pid)))?;
        let device = info.open().map_err(|e| open_err(&e))?;
        let interface = device
            .detach_and_claim_interface(0)
            .map_err(|e| open_err(&e))?;

        let mut ftdi = FtdiDevice {
            interface,
            pending: VecDeque::new(),
        };
        ftdi.usb_reset().map_err(|e| open_err(&e))?;
        ftdi.set_latency_timer(1).map_err(|e| open_err(&e))?;
        info!("FT2232H {:04x}:{:04x} interface A claimed", vid, pid);

        // AN_114 settling time after the reset
        thread::sleep(Duration::from_millis(50));

        Ok(ftdi)
    }

    /// Closes the connection, releasing the interface.
    pub fn close(self) {
        debug!("closing FTDI device");
    }

    fn sio_write(&mut self, request: u8, value: u16) -> Result<()> {
        self.interface
            .control_out_blocking(
                Control {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index: INTERFACE_INDEX,
                },
                &[],
                CONTROL_TIMEOUT,
            )
            .map_err(io::Error::from)?;
        Ok(())
    }

    fn usb_reset(&mut self) -> Result<()> {
        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_SIO)
    }

    fn set_latency_timer(&mut self, millis: u8) -> Result<()> {
        self.sio_write(SIO_SET_LATENCY_TIMER_REQUEST, u16::from(millis))
    }

    /// Polls the 16-bit modem status word.
    pub fn modem_status(&mut self) -> Result<ModemStatus> {
        let mut raw = [0u8; 2];
        self.interface
            .control_in_blocking(
                Control {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request: SIO_POLL_MODEM_STATUS_REQUEST,
                    value: 0,
                    index: INTERFACE_INDEX,
                },
                &mut raw,
                CONTROL_TIMEOUT,
            )
            .map_err(io::Error::from)?;
        Ok(ModemStatus::from_raw(raw))
    }

    /// True when the transmitter buffer has drained.
    pub fn tx_buffer_empty(&mut self) -> Result<bool> {
        Ok(self.modem_status()?.contains(ModemStatus::TEMT))
    }

    /// True when an overrun, parity or framing error has been latched.
    pub fn tx_error(&mut self) -> Result<bool> {
        let errors = ModemStatus::OE | ModemStatus::PE | ModemStatus::FE;
        let status = self.modem_status()?;
        if status.intersects(errors) {
            warn!("transmission error latched: {:?}", status & errors);
        }
        Ok(status.intersects(errors))
    }
}

impl fmt::Debug for FtdiDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtdiDevice")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Transport for FtdiDevice {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(MAX_PACKET_SIZE) {
            block_on(self.interface.bulk_out(WRITE_EP, chunk.to_vec()))
                .into_result()
                .map_err(io::Error::from)?;
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            if let Some(byte) = self.pending.pop_front() {
                buf[filled] = byte;
                filled += 1;
                continue;
            }
            let packet = block_on(
                self.interface
                    .bulk_in(READ_EP, RequestBuffer::new(MAX_PACKET_SIZE)),
            )
            .into_result()
            .map_err(io::Error::from)?;
            // every bulk-in packet leads with two modem status bytes
            if packet.len() > 2 {
                self.pending.extend(&packet[2..]);
            }
        }
        Ok(())
    }

    fn purge_buffers(&mut self) -> Result<()> {
        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_PURGE_TX)?;
        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_PURGE_RX)?;
        self.pending.clear();
        Ok(())
    }

    fn set_bitmode(&mut self, mask: u8, mode: BitMode) -> Result<()> {
        self.sio_write(
            SIO_SET_BITMODE_REQUEST,
            u16::from_le_bytes([mask, mode as u8]),
        )
    }
}
