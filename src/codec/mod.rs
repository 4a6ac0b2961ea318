//! CD-1.1 frame codec.
//!
//! [`encode`] writes header, body and trailer, then fills in the trailer offset and
//! the CRC-64 comm verification value. [`decode`] accepts exactly one frame: the
//! checksum is verified first, then every declared length must match the bytes
//! actually present. A frame either decodes completely or not at all.
//!
//! Stream transports use [`FrameReader`] to cut frames out of a byte stream and to
//! resynchronise after corrupt input.
//!
//! ## Frame Layout
//!
//! | Section | Contents |
//! |---------|----------|
//! | Header (36 bytes) | frame type, trailer offset, creator, destination, sequence number, series |
//! | Body | kind-specific, see [`crate::types::FrameBody`] |
//! | Trailer | auth key id, auth size, padded auth value, comm verification |

mod body;
mod checksum;
pub mod format;
mod reader;

pub use checksum::{CRC_64_CD11, frame_checksum};
pub use reader::{FrameReader, ReceivedFrame};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::{Cd11Error, DecodeError, Result};
use crate::types::{Frame, FrameHeader, FrameTrailer, FrameType};
use format::*;

/// Serialize a frame to its wire form.
pub fn encode(frame: &Frame) -> Result<Bytes> {
    let mut out = BytesMut::with_capacity(256);

    out.put_u32(frame.frame_type().code());
    out.put_u32(0);
    put_fixed_str(&mut out, &frame.header.creator, CREATOR_LEN, "frame creator")?;
    put_fixed_str(&mut out, &frame.header.destination, DESTINATION_LEN, "frame destination")?;
    out.put_u64(frame.header.sequence_number);
    out.put_u32(frame.header.series);

    body::encode_body(&frame.body, &mut out)?;

    let trailer_offset = u32::try_from(out.len())
        .map_err(|_| Cd11Error::encode("frame body", "body exceeds u32 offsets"))?;
    out[4..8].copy_from_slice(&trailer_offset.to_be_bytes());

    out.put_u32(frame.trailer.auth_key_id);
    put_sized(&mut out, &frame.trailer.auth_value, "auth value")?;
    out.put_u64(0);

    if out.len() > MAX_FRAME_SIZE {
        return Err(Cd11Error::encode(
            "frame",
            format!("{} bytes exceeds the {} byte frame limit", out.len(), MAX_FRAME_SIZE),
        ));
    }

    let crc = frame_checksum(&out);
    let len = out.len();
    out[len - CHECKSUM_SIZE..].copy_from_slice(&crc.to_be_bytes());

    trace!(frame_type = ?frame.frame_type(), seq = frame.header.sequence_number, len, "encoded frame");
    Ok(out.freeze())
}

/// Parse exactly one frame from `buf`.
pub fn decode(buf: &[u8]) -> Result<Frame, DecodeError> {
    if buf.len() < MIN_FRAME_SIZE || buf.len() > MAX_FRAME_SIZE {
        return Err(DecodeError::malformed(
            "frame",
            format!("{} bytes is outside {}..={}", buf.len(), MIN_FRAME_SIZE, MAX_FRAME_SIZE),
        ));
    }

    let (content, tail) = buf.split_at(buf.len() - CHECKSUM_SIZE);
    let mut expected = [0u8; CHECKSUM_SIZE];
    expected.copy_from_slice(tail);
    let expected = u64::from_be_bytes(expected);
    let computed = frame_checksum(buf);
    if expected != computed {
        return Err(DecodeError::ChecksumMismatch { expected, computed });
    }

    let mut cursor = content;
    let code = get_u32(&mut cursor, "frame type")?;
    let frame_type = FrameType::from_code(code).ok_or(DecodeError::UnknownFrameType(code))?;
    let trailer_offset = get_u32(&mut cursor, "trailer offset")? as usize;
    if trailer_offset < HEADER_SIZE || trailer_offset + TRAILER_PREFIX_SIZE > content.len() {
        return Err(DecodeError::malformed(
            "trailer offset",
            format!("{} does not fit a {} byte frame", trailer_offset, buf.len()),
        ));
    }

    let header = FrameHeader {
        creator: get_fixed_str(&mut cursor, CREATOR_LEN, "frame creator")?,
        destination: get_fixed_str(&mut cursor, DESTINATION_LEN, "frame destination")?,
        sequence_number: get_u64(&mut cursor, "sequence number")?,
        series: get_u32(&mut cursor, "series")?,
    };

    let mut body_bytes = &content[HEADER_SIZE..trailer_offset];
    let body = body::decode_body(frame_type, &mut body_bytes)?;

    let mut trailer_bytes = &content[trailer_offset..];
    let auth_key_id = get_u32(&mut trailer_bytes, "auth key id")?;
    let auth_value = get_sized(&mut trailer_bytes, "auth value")?;
    expect_end(trailer_bytes, "trailer")?;

    Ok(Frame { header, body, trailer: FrameTrailer { auth_key_id, auth_value } })
}

/// Total length of the frame at the start of `buf`, once enough of it is present.
///
/// Returns `Ok(None)` when more bytes are needed to tell. Errors mean the bytes at the
/// start of `buf` cannot begin a frame.
pub fn peek_frame_len(buf: &[u8]) -> Result<Option<usize>, DecodeError> {
    let mut cursor = buf;
    if buf.len() < 4 {
        return Ok(None);
    }
    let code = get_u32(&mut cursor, "frame type")?;
    if FrameType::from_code(code).is_none() {
        return Err(DecodeError::UnknownFrameType(code));
    }

    if buf.len() < 8 {
        return Ok(None);
    }
    let trailer_offset = get_u32(&mut cursor, "trailer offset")? as usize;
    if trailer_offset < HEADER_SIZE || trailer_offset > MAX_FRAME_SIZE {
        return Err(DecodeError::malformed("trailer offset", format!("implausible offset {trailer_offset}")));
    }

    let auth_size_at = trailer_offset + 4;
    if buf.len() < auth_size_at + 4 {
        return Ok(None);
    }
    let mut size_bytes = &buf[auth_size_at..];
    let auth_size = get_u32(&mut size_bytes, "auth size")? as usize;

    let total = trailer_offset
        .saturating_add(TRAILER_PREFIX_SIZE)
        .saturating_add(padded_len(auth_size.min(MAX_FRAME_SIZE)))
        .saturating_add(CHECKSUM_SIZE);
    if auth_size > MAX_FRAME_SIZE || total > MAX_FRAME_SIZE {
        return Err(DecodeError::malformed("frame length", format!("implausible length {total}")));
    }
    Ok(Some(total))
}
