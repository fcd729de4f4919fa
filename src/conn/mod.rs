//! Traits to perform in-order, serial, byte-wise I/O with the GDB client.

mod tcpstream;

/// A byte-oriented transport carrying RSP traffic.
pub trait Connection {
    /// Transport-specific error type.
    type Error;

    /// Write a single byte.
    fn write(&mut self, byte: u8) -> Result<(), Self::Error>;

    /// Write the entire buffer, blocking until complete.
    fn write_all(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        for b in buf {
            self.write(*b)?;
        }
        Ok(())
    }

    /// Flush any buffered bytes to their destination.
    fn flush(&mut self) -> Result<(), Self::Error>;

    /// Called once before any packet is exchanged.
    fn on_session_start(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Extends [`Connection`] with blocking reads and a non-blocking probe.
///
/// `read_available` must block until at least one byte arrives;
/// `data_ready` must never block. The session loop relies on the latter
/// to service the interrupt byte while the debuggee runs free.
pub trait ConnectionExt: Connection {
    /// Read whatever is available into `buf`, blocking until at least
    /// one byte can be returned. Returns the number of bytes read;
    /// zero means the peer hung up.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Check whether a read would succeed without blocking.
    fn data_ready(&mut self) -> Result<bool, Self::Error>;
}
