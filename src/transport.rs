//! Byte-level access to the target device
//!
//! The protocol engine only needs four operations from the underlying link:
//! reading, writing, flushing, and toggling the DTR/RTS control lines that
//! drive the chip's reset circuitry. Anything that can provide those four
//! operations, a serial port, a USB bridge, or an in-memory test double, can
//! carry a flashing session.

use std::io;

#[cfg(feature = "serialport")]
use serialport::{ClearBuffer, SerialPort};

/// A byte stream to a target device, with reset control lines.
///
/// Implementations are synchronous. `read` must not block indefinitely:
/// returning `Ok(0)` when no data has arrived yet is the expected way to let
/// the caller enforce its own deadlines.
pub trait Transport {
    /// Discard any unread input and drain pending output.
    fn flush(&mut self) -> io::Result<()>;

    /// Read up to `buf.len()` bytes. `Ok(0)` means no data is available yet.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the entire buffer.
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Drive the DTR and RTS control lines.
    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> io::Result<()>;
}

/// [Transport] implementation backed by a [serialport] serial port.
#[cfg(feature = "serialport")]
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

#[cfg(feature = "serialport")]
impl SerialTransport {
    /// Wrap an already-opened serial port.
    ///
    /// The port should be configured with a short read timeout so that
    /// [Transport::read] polls rather than blocks.
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        SerialTransport { port }
    }

    /// Change the host-side baud rate.
    ///
    /// Only do this after the chip has acknowledged a baud-rate change,
    /// otherwise the two ends stop understanding each other.
    pub fn set_baud_rate(&mut self, baud: u32) -> io::Result<()> {
        self.port.set_baud_rate(baud).map_err(io::Error::from)
    }

    /// Recover the underlying serial port.
    pub fn into_inner(self) -> Box<dyn SerialPort> {
        self.port
    }
}

#[cfg(feature = "serialport")]
impl Transport for SerialTransport {
    fn flush(&mut self) -> io::Result<()> {
        self.port
            .clear(ClearBuffer::Input)
            .map_err(io::Error::from)?;
        self.port.flush()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(read) => Ok(read),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.port.write_all(buf)
    }

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> io::Result<()> {
        self.port
            .write_data_terminal_ready(dtr)
            .map_err(io::Error::from)?;
        self.port
            .write_request_to_send(rts)
            .map_err(io::Error::from)
    }
}
