use log::trace;
use log::warn;

use crate::protocol::hex::decode_hex;
use crate::protocol::hex::is_hex;

/// The GDB client interrupts a free-running debuggee with this single
/// unframed byte.
pub const INTERRUPT_BYTE: u8 = 0x03;

/// Sum of the payload bytes mod 256, as used in `$<payload>#<checksum>`.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |a, x| a.wrapping_add(*x))
}

/// One item extracted from the inbound byte stream.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// An 0x03 byte outside packet framing.
    Interrupt,
    /// A syntactically complete `$...#xx` frame. The frame ack (`+`)
    /// must go out before `checksum_ok` is consulted; a frame that
    /// failed validation is dropped with no further reply.
    Frame { body: Vec<u8>, checksum_ok: bool },
}

/// Growable inbound buffer with a single-frame extraction scan.
///
/// Only one complete packet is handed out per scan. Anything still
/// buffered behind it is a stale retransmission and is discarded, so a
/// command is never answered twice.
pub struct RecvBuffer {
    buf: Vec<u8>,
}

impl RecvBuffer {
    pub fn new() -> RecvBuffer {
        RecvBuffer {
            buf: Vec::with_capacity(128),
        }
    }

    /// Append freshly received bytes. The underlying storage doubles as
    /// needed, so arbitrarily large register/memory/vCont packets are
    /// accepted.
    pub fn push(&mut self, bytes: &[u8]) {
        if self.buf.len() + bytes.len() > self.buf.capacity() {
            let want = self.buf.len() + bytes.len();
            let mut cap = self.buf.capacity().max(128);
            while cap < want {
                cap *= 2;
            }
            self.buf.reserve(cap - self.buf.len());
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Extract at most one item from the buffered bytes.
    ///
    /// Client-side `+`/`-` acknowledgements are consumed silently.
    /// Bytes preceding a frame start are junk and are skipped.
    pub fn scan(&mut self) -> Option<Inbound> {
        let mut pos = 0;

        while pos < self.buf.len() {
            match self.buf[pos] {
                INTERRUPT_BYTE => {
                    self.buf.drain(..=pos);
                    return Some(Inbound::Interrupt);
                }
                b'+' => pos += 1,
                b'-' => {
                    warn!("client sent a nack; replies are never retransmitted");
                    pos += 1;
                }
                b'$' => match self.try_frame(pos) {
                    Some(item) => return Some(item),
                    None => {
                        // incomplete frame: keep it, drop the junk before it
                        self.buf.drain(..pos);
                        return None;
                    }
                },
                other => {
                    trace!("skipping stray byte {:#04x}", other);
                    pos += 1;
                }
            }
        }

        self.buf.clear();
        None
    }

    /// Parse the frame starting at `start` (which holds `$`). Returns
    /// `None` while the trailer has not arrived yet.
    fn try_frame(&mut self, start: usize) -> Option<Inbound> {
        let hash = self.buf[start..].iter().position(|&b| b == b'#')? + start;
        if self.buf.len() < hash + 3 {
            return None;
        }

        let body = self.buf[start + 1..hash].to_vec();
        let digits = [self.buf[hash + 1], self.buf[hash + 2]];

        let checksum_ok = if digits.iter().all(|&d| is_hex(d)) {
            match decode_hex::<u8>(&digits) {
                Ok(expected) => {
                    let calculated = checksum(&body);
                    if expected != calculated {
                        warn!(
                            "checksum mismatch: packet says {:02x}, calculated {:02x}",
                            expected, calculated
                        );
                    }
                    expected == calculated
                }
                Err(_) => false,
            }
        } else {
            false
        };

        // one frame per scan: whatever follows is a stale retransmission
        self.buf.clear();

        Some(Inbound::Frame { body, checksum_ok })
    }
}

impl Default for RecvBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = vec![b'$'];
        out.extend_from_slice(payload);
        out.push(b'#');
        out.extend_from_slice(format!("{:02x}", checksum(payload)).as_bytes());
        out
    }

    #[test]
    fn extracts_valid_frame() {
        let mut rx = RecvBuffer::new();
        rx.push(&frame(b"m1000,4"));
        match rx.scan() {
            Some(Inbound::Frame { body, checksum_ok }) => {
                assert_eq!(body, b"m1000,4");
                assert!(checksum_ok);
            }
            other => panic!("unexpected scan result: {:?}", other),
        }
        assert_eq!(rx.scan(), None);
    }

    #[test]
    fn flags_bad_checksum() {
        let mut rx = RecvBuffer::new();
        rx.push(b"$?#00");
        match rx.scan() {
            Some(Inbound::Frame { checksum_ok, .. }) => assert!(!checksum_ok),
            other => panic!("unexpected scan result: {:?}", other),
        }
    }

    #[test]
    fn holds_incomplete_frame() {
        let mut rx = RecvBuffer::new();
        rx.push(b"$g#6");
        assert_eq!(rx.scan(), None);
        rx.push(b"7");
        assert!(matches!(
            rx.scan(),
            Some(Inbound::Frame {
                checksum_ok: true,
                ..
            })
        ));
    }

    #[test]
    fn one_frame_per_scan_drops_extras() {
        let mut rx = RecvBuffer::new();
        let mut bytes = frame(b"g");
        bytes.extend_from_slice(&frame(b"g"));
        rx.push(&bytes);
        assert!(matches!(rx.scan(), Some(Inbound::Frame { .. })));
        // the second copy was a retransmission; it must not be answered
        assert_eq!(rx.scan(), None);
    }

    #[test]
    fn interrupt_byte_wins_over_junk() {
        let mut rx = RecvBuffer::new();
        rx.push(&[b'+', 0x03]);
        assert_eq!(rx.scan(), Some(Inbound::Interrupt));
    }

    #[test]
    fn ack_bytes_are_consumed() {
        let mut rx = RecvBuffer::new();
        rx.push(b"++");
        rx.push(&frame(b"?"));
        assert!(matches!(rx.scan(), Some(Inbound::Frame { .. })));
    }

    #[test]
    fn checksum_validates_iff_payload_unaltered() {
        let payloads: &[&[u8]] = &[
            b"",
            b"?",
            b"m1000,4",
            b"G000102030405060708090a0b0c0d0e0f",
            b"vCont;s:1a2;c",
            &[0x20, 0x7e, 0x25, 0x2a], // printable edge bytes
        ];

        for payload in payloads {
            let encoded = frame(payload);

            let mut rx = RecvBuffer::new();
            rx.push(&encoded);
            assert!(
                matches!(
                    rx.scan(),
                    Some(Inbound::Frame {
                        checksum_ok: true,
                        ..
                    })
                ),
                "intact frame must validate: {:?}",
                payload
            );

            // flipping any payload byte must break validation
            for i in 0..payload.len() {
                let mut corrupt = encoded.clone();
                corrupt[1 + i] ^= 0x01;
                let mut rx = RecvBuffer::new();
                rx.push(&corrupt);
                match rx.scan() {
                    Some(Inbound::Frame { checksum_ok, .. }) => assert!(
                        !checksum_ok,
                        "corrupt byte {} of {:?} must not validate",
                        i, payload
                    ),
                    // corruption may legitimately break framing instead
                    _ => {}
                }
            }
        }
    }
}
