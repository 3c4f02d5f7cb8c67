//! Variable-length integer and string packing.
//!
//! Integers are stored in 7-bit groups, least significant group first, with
//! the high bit of each byte set when another byte follows. Strings are a
//! packed length followed by the raw bytes.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut};

/// Appends `value` to `buf` as a varint.
pub fn pack_uint(buf: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Appends `bytes` to `buf` with a varint length prefix.
pub fn pack_string(buf: &mut impl BufMut, bytes: &[u8]) {
    pack_uint(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

/// Reads a varint from the front of `buf`.
pub fn unpack_uint(buf: &mut impl Buf) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(Error::corruption("truncated varint"));
        }
        let byte = buf.get_u8();
        let bits = u64::from(byte & 0x7f);
        if shift >= 64 || (shift > 0 && bits >> (64 - shift) != 0) {
            return Err(Error::corruption("varint overflows 64 bits"));
        }
        value |= bits << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Reads a varint that must fit in a `u32`.
pub fn unpack_u32(buf: &mut impl Buf) -> Result<u32> {
    let value = unpack_uint(buf)?;
    u32::try_from(value).map_err(|_| Error::corruption(format!("value {} exceeds 32 bits", value)))
}

/// Reads a length-prefixed byte string from the front of `buf`.
pub fn unpack_string(buf: &mut impl Buf) -> Result<Vec<u8>> {
    let len = unpack_uint(buf)?;
    let len = usize::try_from(len).map_err(|_| Error::corruption("string length overflow"))?;
    if buf.remaining() < len {
        return Err(Error::corruption(format!(
            "string of {} bytes truncated to {}",
            len,
            buf.remaining()
        )));
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_uint_encoding() {
        let mut buf = Vec::new();
        pack_uint(&mut buf, 0);
        pack_uint(&mut buf, 127);
        pack_uint(&mut buf, 128);
        pack_uint(&mut buf, 300);
        assert_eq!(buf, vec![0x00, 0x7f, 0x80, 0x01, 0xac, 0x02]);

        let mut rd = &buf[..];
        assert_eq!(unpack_uint(&mut rd).unwrap(), 0);
        assert_eq!(unpack_uint(&mut rd).unwrap(), 127);
        assert_eq!(unpack_uint(&mut rd).unwrap(), 128);
        assert_eq!(unpack_uint(&mut rd).unwrap(), 300);
        assert!(rd.is_empty());
    }

    #[test]
    fn test_u64_max() {
        let mut buf = Vec::new();
        pack_uint(&mut buf, u64::MAX);
        assert_eq!(buf.len(), 10);
        assert_eq!(unpack_uint(&mut &buf[..]).unwrap(), u64::MAX);
    }

    #[test]
    fn test_truncated_varint() {
        let buf = [0x80u8, 0x80];
        assert!(matches!(unpack_uint(&mut &buf[..]), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_overflowing_varint() {
        let buf = [0xffu8, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f];
        assert!(unpack_uint(&mut &buf[..]).is_err());
        let mut buf = Vec::new();
        pack_uint(&mut buf, u64::from(u32::MAX) + 1);
        assert!(unpack_u32(&mut &buf[..]).is_err());
    }

    #[test]
    fn test_string() {
        let mut buf = Vec::new();
        pack_string(&mut buf, b"postlist");
        pack_string(&mut buf, b"");
        let mut rd = &buf[..];
        assert_eq!(unpack_string(&mut rd).unwrap(), b"postlist");
        assert_eq!(unpack_string(&mut rd).unwrap(), b"");
        assert!(rd.is_empty());

        let short = [5u8, b'a', b'b'];
        assert!(unpack_string(&mut &short[..]).is_err());
    }
}
