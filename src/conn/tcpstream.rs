use std::net::TcpStream;

use crate::conn::Connection;
use crate::conn::ConnectionExt;

impl Connection for TcpStream {
    type Error = std::io::Error;

    fn write(&mut self, byte: u8) -> Result<(), Self::Error> {
        use std::io::Write;

        Write::write_all(self, &[byte])
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        use std::io::Write;

        Write::write_all(self, buf)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        use std::io::Write;

        Write::flush(self)
    }

    fn on_session_start(&mut self) -> Result<(), Self::Error> {
        // RSP is lots of tiny packets; leaving Nagle on makes every
        // command/reply exchange eat a delayed-ack round trip.
        self.set_nodelay(true)
    }
}

impl ConnectionExt for TcpStream {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        use std::io::Read;

        self.set_nonblocking(false)?;
        Read::read(self, buf)
    }

    fn data_ready(&mut self) -> Result<bool, Self::Error> {
        self.set_nonblocking(true)?;

        let mut buf = [0u8];
        let res = match TcpStream::peek(self, &mut buf) {
            Ok(0) => Ok(true), // hang-up is "ready" too; the read will report it
            Ok(_) => Ok(true),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        };
        self.set_nonblocking(false)?;
        res
    }
}
