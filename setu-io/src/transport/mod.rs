//! Transport layer for the flight-controller link

use crate::error::Result;

pub mod mock;
mod serial;
pub use mock::MockTransport;
pub use serial::SerialTransport;

/// Byte-level device abstraction used by the serial link
pub trait Transport: Send {
    /// Read into buffer, returns number of bytes read (0 on timeout)
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;

    /// Write data from buffer, returns number of bytes written
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Flush any pending writes (blocking until complete)
    fn flush(&mut self) -> Result<()>;

    /// Bytes ready to read without blocking
    fn available(&mut self) -> Result<usize> {
        Ok(0)
    }

    /// Independent handle to the same device.
    ///
    /// The reader thread owns the clone; the original stays behind the
    /// writer lock.
    fn try_clone(&self) -> Result<Box<dyn Transport>>;
}

/// Write the whole buffer, retrying short writes
pub fn write_all(transport: &mut dyn Transport, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        let n = transport.write(data)?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
        }
        data = &data[n..];
    }
    transport.flush()
}
