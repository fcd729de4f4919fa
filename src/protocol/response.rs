use log::trace;

use crate::conn::Connection;

/// Newtype around a connection error, so handler code can tell a dead
/// transport apart from debuggee-side failures.
#[derive(Debug, Clone)]
pub struct Error<C>(pub C);

/// Incremental reply builder over a [`Connection`].
///
/// The opening `$` goes out lazily with the first payload byte, and
/// [`flush`](ResponseWriter::flush) closes the packet with `#` plus the
/// checksum of everything written since the open. Exclusive borrow of
/// the connection guarantees only one reply is ever open at a time.
/// Flushing with no payload produces the empty `$#00` packet, which is
/// how unsupported commands are answered.
pub struct ResponseWriter<'a, C: Connection> {
    inner: &'a mut C,
    started: bool,
    checksum: u8,
}

impl<'a, C: Connection + 'a> ResponseWriter<'a, C> {
    pub fn new(inner: &'a mut C) -> Self {
        Self {
            inner,
            started: false,
            checksum: 0,
        }
    }

    /// Consumes self, writing out the final `#` and checksum.
    pub fn flush(mut self) -> Result<(), Error<C::Error>> {
        // the '#' terminator is not part of the checksum
        let checksum = self.checksum;
        self.write(b'#')?;
        self.write_hex(checksum)?;

        self.inner.flush().map_err(Error)?;
        Ok(())
    }

    /// Get a mutable reference to the underlying connection.
    pub fn as_conn(&mut self) -> &mut C {
        self.inner
    }

    fn write(&mut self, byte: u8) -> Result<(), Error<C::Error>> {
        if !self.started {
            self.started = true;
            trace!("--> open reply");
            self.inner.write(b'$').map_err(Error)?;
        }

        self.checksum = self.checksum.wrapping_add(byte);
        self.inner.write(byte).map_err(Error)
    }

    /// Write an entire string into the open packet.
    pub fn write_str(&mut self, s: &str) -> Result<(), Error<C::Error>> {
        for b in s.as_bytes().iter() {
            self.write(*b)?;
        }
        Ok(())
    }

    /// Write a single byte as two lowercase hex chars.
    pub fn write_hex(&mut self, byte: u8) -> Result<(), Error<C::Error>> {
        for &digit in [(byte & 0xf0) >> 4, byte & 0x0f].iter() {
            let c = match digit {
                0..=9 => b'0' + digit,
                _ => b'a' + digit - 10,
            };
            self.write(c)?;
        }
        Ok(())
    }

    /// Write a byte buffer as a hex string (two chars per byte).
    pub fn write_hex_buf(&mut self, data: &[u8]) -> Result<(), Error<C::Error>> {
        for b in data.iter() {
            self.write_hex(*b)?;
        }
        Ok(())
    }

    /// Write a number as a big-endian hex string, trimming leading
    /// zeros down to the most compact representation.
    pub fn write_num(&mut self, num: impl Into<u64>) -> Result<(), Error<C::Error>> {
        let num: u64 = num.into();
        if num == 0 {
            return self.write_hex(0);
        }

        for b in num.to_be_bytes().iter().copied().skip_while(|&b| b == 0) {
            self.write_hex(b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct SinkConn(Vec<u8>);

    impl Connection for SinkConn {
        type Error = ();

        fn write(&mut self, byte: u8) -> Result<(), ()> {
            self.0.push(byte);
            Ok(())
        }

        fn flush(&mut self) -> Result<(), ()> {
            Ok(())
        }
    }

    #[test]
    fn empty_reply_is_well_formed() {
        let mut conn = SinkConn::default();
        ResponseWriter::new(&mut conn).flush().unwrap();
        assert_eq!(conn.0, b"$#00");
    }

    #[test]
    fn checksum_covers_payload_only() {
        let mut conn = SinkConn::default();
        let mut res = ResponseWriter::new(&mut conn);
        res.write_str("OK").unwrap();
        res.flush().unwrap();
        assert_eq!(conn.0, b"$OK#9a");
    }

    #[test]
    fn write_num_trims_leading_zeros() {
        let mut conn = SinkConn::default();
        let mut res = ResponseWriter::new(&mut conn);
        res.write_num(0x1234u64).unwrap();
        res.write_str(";").unwrap();
        res.write_num(0u64).unwrap();
        res.flush().unwrap();
        assert!(conn.0.starts_with(b"$1234;00"));
    }
}
