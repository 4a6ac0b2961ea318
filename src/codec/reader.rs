//! Frame reassembly over a byte stream.

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace};

use super::{decode, peek_frame_len};
use crate::error::DecodeError;
use crate::types::Frame;

/// A decoded frame together with the exact bytes it arrived as.
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    pub frame: Frame,
    pub raw: Bytes,
}

/// Buffers stream input and yields whole frames.
///
/// On bad input the reader moves forward one byte at a time until it reaches a
/// frame that decodes, so a corrupted length field costs only the bytes before the
/// next real frame. A head frame still waiting for input is abandoned as soon as a
/// complete, valid frame shows up further along the buffer.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
    discarded: u64,
    /// Offsets below this were already ruled out as complete frames behind the head.
    searched: usize,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read target for socket reads.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Bytes thrown away while resynchronising.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Next complete frame, a decode failure, or `None` when more input is needed.
    ///
    /// A run of skipped bytes is reported as one error, ahead of the frame that ends
    /// it. Call repeatedly until it returns `None`.
    pub fn next_frame(&mut self) -> Option<Result<ReceivedFrame, DecodeError>> {
        let mut skipped: Option<DecodeError> = None;
        loop {
            let len = match peek_frame_len(&self.buf) {
                Ok(Some(len)) if len <= self.buf.len() => len,
                Ok(needed) => {
                    if let Some(offset) = self.complete_frame_after_head() {
                        debug!(offset, declared = ?needed, "incomplete frame overtaken by a later one");
                        self.skip(offset);
                        skipped.get_or_insert_with(|| {
                            DecodeError::malformed("frame length", format!("frame cut short after {offset} bytes"))
                        });
                        continue;
                    }
                    trace!(have = self.buf.len(), need = ?needed, "waiting for rest of frame");
                    return skipped.map(Err);
                }
                Err(err) => {
                    self.skip(1);
                    skipped.get_or_insert(err);
                    continue;
                }
            };

            match decode(&self.buf[..len]) {
                Ok(_) if skipped.is_some() => return skipped.map(Err),
                Ok(frame) => {
                    self.searched = 0;
                    let raw = self.buf.split_to(len).freeze();
                    return Some(Ok(ReceivedFrame { frame, raw }));
                }
                Err(err) => {
                    debug!(len, error = %err, "undecodable frame, rescanning from the next byte");
                    self.skip(1);
                    skipped.get_or_insert(err);
                }
            }
        }
    }

    fn skip(&mut self, n: usize) {
        self.buf.advance(n);
        self.discarded += n as u64;
        self.searched = self.searched.saturating_sub(n);
    }

    /// Offset of the first complete, valid frame starting after the head, if any.
    fn complete_frame_after_head(&mut self) -> Option<usize> {
        let mut offset = self.searched.max(1);
        let mut unverified = None;

        while offset + 4 <= self.buf.len() {
            let rest = &self.buf[offset..];
            match peek_frame_len(rest) {
                Ok(Some(len)) if len <= rest.len() => {
                    if decode(&rest[..len]).is_ok() {
                        self.searched = 0;
                        return Some(offset);
                    }
                }
                // may still complete once more input arrives
                Ok(_) => {
                    unverified.get_or_insert(offset);
                }
                Err(_) => {}
            }
            offset += 1;
        }

        self.searched = unverified.unwrap_or(offset);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::test_utils::encoded_data_frame;
    use crate::types::{Alert, FrameHeader};

    fn alert(seq: u64) -> Bytes {
        encode(&Frame::new(FrameHeader::new("ARCES", "0", seq), Alert::new("hello"))).unwrap()
    }

    #[test]
    fn frames_split_across_reads_are_reassembled() {
        let mut stream = alert(1).to_vec();
        stream.extend_from_slice(&alert(2));

        let mut reader = FrameReader::new();
        let mut seen = Vec::new();
        for chunk in stream.chunks(7) {
            reader.extend_from_slice(chunk);
            while let Some(result) = reader.next_frame() {
                seen.push(result.unwrap().frame.sequence_number());
            }
        }
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn garbage_between_frames_is_skipped_with_one_error() {
        let mut stream = alert(1).to_vec();
        stream.extend_from_slice(&[0xFF; 13]);
        stream.extend_from_slice(&alert(2));

        let mut reader = FrameReader::new();
        reader.extend_from_slice(&stream);

        assert_eq!(reader.next_frame().unwrap().unwrap().frame.sequence_number(), 1);
        assert!(matches!(reader.next_frame(), Some(Err(DecodeError::UnknownFrameType(_)))));
        assert_eq!(reader.next_frame().unwrap().unwrap().frame.sequence_number(), 2);
        assert!(reader.next_frame().is_none());
        assert_eq!(reader.discarded(), 13);
    }

    fn drain(reader: &mut FrameReader, seen: &mut Vec<u64>, errors: &mut usize) {
        while let Some(result) = reader.next_frame() {
            match result {
                Ok(received) => seen.push(received.frame.sequence_number()),
                Err(_) => *errors += 1,
            }
        }
    }

    /// An alert whose trailer offset points into the middle of the next data frame.
    fn alert_with_stretched_offset(next: &[u8]) -> Vec<u8> {
        let mut bad = alert(0).to_vec();
        // land the declared auth size on zeroed sample bytes so the bogus length parses
        let zeros = (next.len() / 2..next.len() - 8).step_by(4).find(|&i| next[i..i + 8] == [0; 8]).unwrap();
        let offset = (bad.len() + zeros - 4) as u32;
        bad[4..8].copy_from_slice(&offset.to_be_bytes());
        bad
    }

    #[test]
    fn bad_length_field_costs_only_its_own_frame() {
        let frames: Vec<Bytes> = (1..=6).map(|seq| encoded_data_frame("ARCES", seq)).collect();
        let bad = alert_with_stretched_offset(&frames[0]);
        assert!(matches!(peek_frame_len(&bad), Ok(None)));

        let mut stream = bad.clone();
        for frame in &frames {
            stream.extend_from_slice(frame);
        }

        for chunk in [stream.len(), 512] {
            let mut reader = FrameReader::new();
            let (mut seen, mut errors) = (Vec::new(), 0);
            for piece in stream.chunks(chunk) {
                reader.extend_from_slice(piece);
                drain(&mut reader, &mut seen, &mut errors);
            }
            assert_eq!(seen, vec![1, 2, 3, 4, 5, 6], "read size {chunk}");
            assert_eq!(errors, 1, "read size {chunk}");
            assert_eq!(reader.discarded(), bad.len() as u64);
            assert_eq!(reader.buffered(), 0);
        }
    }

    #[test]
    fn huge_declared_length_does_not_stall_the_stream() {
        let mut bad = alert(0).to_vec();
        bad[4..8].copy_from_slice(&8_000_000u32.to_be_bytes());
        let mut stream = bad.clone();
        stream.extend_from_slice(&alert(1));
        stream.extend_from_slice(&alert(2));

        let mut reader = FrameReader::new();
        reader.extend_from_slice(&stream);
        let (mut seen, mut errors) = (Vec::new(), 0);
        drain(&mut reader, &mut seen, &mut errors);

        assert_eq!(seen, vec![1, 2]);
        assert_eq!(errors, 1);
        assert_eq!(reader.discarded(), bad.len() as u64);
    }

    #[test]
    fn corrupt_frame_is_dropped_and_stream_continues() {
        // flip a byte of the alert text so framing still parses
        let mut first = alert(1).to_vec();
        first[40] ^= 0x40;
        let mut stream = first;
        stream.extend_from_slice(&alert(2));

        let mut reader = FrameReader::new();
        reader.extend_from_slice(&stream);

        assert!(matches!(reader.next_frame(), Some(Err(DecodeError::ChecksumMismatch { .. }))));
        assert_eq!(reader.next_frame().unwrap().unwrap().frame.sequence_number(), 2);
    }
}
