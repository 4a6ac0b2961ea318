//! Low-level CD-1.1 field layout.
//!
//! All integers are big-endian. Variable-length byte fields are preceded by their
//! unpadded size and padded with zeros to a four-byte boundary. Fixed-width text
//! fields are null-padded on encode and trimmed of nulls and whitespace on decode.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Cd11Error, DecodeError, Result};

/// Frame type, trailer offset, creator, destination, sequence number, series.
pub const HEADER_SIZE: usize = 4 + 4 + CREATOR_LEN + DESTINATION_LEN + 8 + 4;
pub const CREATOR_LEN: usize = 8;
pub const DESTINATION_LEN: usize = 8;

/// Auth key id and auth size; the padded auth value follows.
pub const TRAILER_PREFIX_SIZE: usize = 8;
pub const CHECKSUM_SIZE: usize = 8;

/// Smallest possible frame: header, empty body, unsigned trailer.
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + TRAILER_PREFIX_SIZE + CHECKSUM_SIZE;

/// Upper bound on a single frame. Anything larger is treated as corrupt framing.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Round `len` up to the next multiple of four.
pub fn padded_len(len: usize) -> usize {
    len.div_ceil(4) * 4
}

fn ensure(buf: &[u8], needed: usize, field: &str) -> Result<(), DecodeError> {
    if buf.remaining() < needed {
        return Err(DecodeError::malformed(
            field,
            format!("need {} bytes, have {}", needed, buf.remaining()),
        ));
    }
    Ok(())
}

pub fn get_u8(buf: &mut &[u8], field: &str) -> Result<u8, DecodeError> {
    ensure(buf, 1, field)?;
    Ok(buf.get_u8())
}

pub fn get_u16(buf: &mut &[u8], field: &str) -> Result<u16, DecodeError> {
    ensure(buf, 2, field)?;
    Ok(buf.get_u16())
}

pub fn get_u32(buf: &mut &[u8], field: &str) -> Result<u32, DecodeError> {
    ensure(buf, 4, field)?;
    Ok(buf.get_u32())
}

pub fn get_u64(buf: &mut &[u8], field: &str) -> Result<u64, DecodeError> {
    ensure(buf, 8, field)?;
    Ok(buf.get_u64())
}

pub fn get_f32(buf: &mut &[u8], field: &str) -> Result<f32, DecodeError> {
    ensure(buf, 4, field)?;
    Ok(buf.get_f32())
}

/// Read a `u32` length or count and check it against what is left in `buf`.
///
/// `unit` is the minimum number of bytes each counted element occupies.
pub fn get_len(buf: &mut &[u8], unit: usize, field: &str) -> Result<usize, DecodeError> {
    let value = get_u32(buf, field)? as usize;
    let needed = value.checked_mul(unit).map(padded_len);
    match needed {
        Some(needed) if needed <= buf.remaining() => Ok(value),
        _ => Err(DecodeError::malformed(
            field,
            format!("declares {} but only {} bytes remain", value, buf.remaining()),
        )),
    }
}

/// Read a fixed-width text field.
pub fn get_fixed_str(buf: &mut &[u8], width: usize, field: &str) -> Result<String, DecodeError> {
    ensure(buf, width, field)?;
    let raw = &buf[..width];
    let text = std::str::from_utf8(raw)
        .map_err(|e| DecodeError::malformed(field, format!("not valid UTF-8: {e}")))?
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string();
    buf.advance(width);
    Ok(text)
}

/// Read `len` bytes followed by zero padding to the next four-byte boundary.
pub fn get_padded(buf: &mut &[u8], len: usize, field: &str) -> Result<Bytes, DecodeError> {
    let padded = padded_len(len);
    ensure(buf, padded, field)?;
    let value = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(padded);
    Ok(value)
}

/// Read a size-prefixed, padded byte field.
pub fn get_sized(buf: &mut &[u8], field: &str) -> Result<Bytes, DecodeError> {
    let len = get_len(buf, 1, field)?;
    get_padded(buf, len, field)
}

/// Fail unless `buf` has been fully consumed.
pub fn expect_end(buf: &[u8], context: &str) -> Result<(), DecodeError> {
    if buf.has_remaining() {
        return Err(DecodeError::malformed(
            context,
            format!("{} trailing bytes after last field", buf.remaining()),
        ));
    }
    Ok(())
}

/// Write a text field null-padded to `width`.
pub fn put_fixed_str(out: &mut BytesMut, value: &str, width: usize, field: &str) -> Result<()> {
    let bytes = value.as_bytes();
    if bytes.len() > width {
        return Err(Cd11Error::encode(
            field,
            format!("{:?} is {} bytes, field holds {}", value, bytes.len(), width),
        ));
    }
    out.put_slice(bytes);
    out.put_bytes(0, width - bytes.len());
    Ok(())
}

pub fn put_padded(out: &mut BytesMut, value: &[u8]) {
    out.put_slice(value);
    out.put_bytes(0, padded_len(value.len()) - value.len());
}

/// Write a `u32` size prefix then the padded bytes.
pub fn put_sized(out: &mut BytesMut, value: &[u8], field: &str) -> Result<()> {
    put_u32_len(out, value.len(), field)?;
    put_padded(out, value);
    Ok(())
}

pub fn put_u32_len(out: &mut BytesMut, len: usize, field: &str) -> Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| Cd11Error::encode(field, format!("length {len} exceeds u32")))?;
    out.put_u32(len);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_rounds_up_to_four() {
        assert_eq!(padded_len(0), 0);
        assert_eq!(padded_len(1), 4);
        assert_eq!(padded_len(4), 4);
        assert_eq!(padded_len(5), 8);
        assert_eq!(HEADER_SIZE, 36);
    }

    #[test]
    fn fixed_strings_pad_and_trim() {
        let mut out = BytesMut::new();
        put_fixed_str(&mut out, "IDC", 4, "type").unwrap();
        assert_eq!(&out[..], b"IDC\0");

        let mut slice: &[u8] = b"AB  \0\0\0\0rest";
        assert_eq!(get_fixed_str(&mut slice, 8, "name").unwrap(), "AB");
        assert_eq!(slice, b"rest");

        assert!(put_fixed_str(&mut out, "TOOLONGNAME", 8, "name").is_err());
    }

    #[test]
    fn sized_fields_skip_padding() {
        let mut out = BytesMut::new();
        put_sized(&mut out, b"abcde", "value").unwrap();
        assert_eq!(out.len(), 4 + 8);

        let mut slice: &[u8] = &out;
        assert_eq!(&get_sized(&mut slice, "value").unwrap()[..], b"abcde");
        assert!(expect_end(slice, "value").is_ok());
    }

    #[test]
    fn short_reads_are_malformed() {
        let mut slice: &[u8] = &[0, 0, 0];
        assert!(matches!(get_u32(&mut slice, "count"), Err(DecodeError::Malformed { .. })));

        // declares 100 bytes with 4 present
        let mut slice: &[u8] = &[0, 0, 0, 100, 1, 2, 3, 4];
        assert!(get_sized(&mut slice, "status").is_err());
    }
}
