use num_traits::CheckedAdd;
use num_traits::CheckedMul;
use num_traits::FromPrimitive;
use num_traits::Zero;

#[derive(Debug)]
pub enum DecodeHexError {
    NotAscii,
    Empty,
    Overflow,
    InvalidOutput,
}

fn ascii2byte(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Decode a big-endian hex string into the specified integer.
pub fn decode_hex<I>(buf: &[u8]) -> Result<I, DecodeHexError>
where
    I: FromPrimitive + Zero + CheckedAdd + CheckedMul,
{
    use DecodeHexError::*;

    let radix = I::from_u8(16).ok_or(InvalidOutput)?;

    if buf.is_empty() {
        return Err(Empty);
    }

    let mut result = I::zero();

    for &digit in buf {
        let x = I::from_u8(ascii2byte(digit).ok_or(NotAscii)?).ok_or(InvalidOutput)?;
        result = result.checked_mul(&radix).ok_or(Overflow)?;
        result = result.checked_add(&x).ok_or(Overflow)?
    }

    Ok(result)
}

#[derive(Debug)]
pub enum DecodeHexBufError {
    NotAscii,
    OddLength,
}

/// Decode a hex string into raw bytes. The input must contain an even
/// number of hex digits.
pub fn decode_hex_buf(buf: &[u8]) -> Result<Vec<u8>, DecodeHexBufError> {
    use DecodeHexBufError::*;

    if buf.len() % 2 != 0 {
        return Err(OddLength);
    }

    buf.chunks_exact(2)
        .map(|pair| {
            let hi = ascii2byte(pair[0]).ok_or(NotAscii)?;
            let lo = ascii2byte(pair[1]).ok_or(NotAscii)?;
            Ok(hi << 4 | lo)
        })
        .collect()
}

/// Check if `c` is a valid hex digit.
pub fn is_hex(c: u8) -> bool {
    matches!(c, b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_hex_simple() {
        assert_eq!(decode_hex::<u64>(b"1000").unwrap(), 0x1000);
        assert_eq!(decode_hex::<u8>(b"ff").unwrap(), 0xff);
    }

    #[test]
    fn decode_hex_overflow() {
        assert!(matches!(
            decode_hex::<u8>(b"100"),
            Err(DecodeHexError::Overflow)
        ));
    }

    #[test]
    fn decode_hex_rejects_junk() {
        assert!(decode_hex::<u32>(b"12g4").is_err());
        assert!(decode_hex::<u32>(b"").is_err());
    }

    #[test]
    fn decode_hex_buf_roundtrip() {
        let decoded = decode_hex_buf(b"deadbeef").unwrap();
        assert_eq!(decoded, [0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn decode_hex_buf_odd_length() {
        assert!(matches!(
            decode_hex_buf(b"abc"),
            Err(DecodeHexBufError::OddLength)
        ));
    }
}
