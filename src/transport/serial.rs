//! Serial-port binding for the K-line.

use std::io;
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};

use super::ByteTransport;
use crate::error::LinkError;

/// K-line signalling rate.
pub const BAUD_RATE: u32 = 9600;

/// Poll interval for reads; short so the reader task can notice shutdown.
const READ_TIMEOUT: Duration = Duration::from_millis(1);

/// The default [`ByteTransport`]: a serial port at 9600 baud, 8 data bits,
/// odd parity, 1 stop bit.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open `path` (e.g. `COM6` or `/dev/ttyUSB0`) with the K-line line
    /// settings and both FIFOs cleared of stale bytes.
    pub fn open(path: &str) -> Result<Self, LinkError> {
        let port = serialport::new(path, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::Odd)
            .stop_bits(StopBits::One)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(io::Error::from)?;
        port.clear(ClearBuffer::All).map_err(io::Error::from)?;
        Ok(Self { port })
    }
}

impl ByteTransport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match io::Read::read(&mut self.port, buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut self.port, bytes)
    }

    fn try_clone(&self) -> io::Result<Box<dyn ByteTransport>> {
        let port = self.port.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(Self { port }))
    }
}
