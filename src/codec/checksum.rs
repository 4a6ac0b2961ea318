//! CD-1.1 comm verification checksum.

use crc::{Algorithm, Crc};

use super::format::CHECKSUM_SIZE;

/// CRC-64 with the ISO polynomial, reflected, zero init and zero xor-out.
pub const CRC_64_CD11: Algorithm<u64> = Algorithm {
    width: 64,
    poly: 0x000000000000001b,
    init: 0x0000000000000000,
    refin: true,
    refout: true,
    xorout: 0x0000000000000000,
    check: 0x46a5a9388a5beffe,
    residue: 0x0000000000000000,
};

const CD11_CRC: Crc<u64> = Crc::<u64>::new(&CRC_64_CD11);

/// Checksum of a complete encoded frame, treating its last eight bytes as zero.
pub fn frame_checksum(frame: &[u8]) -> u64 {
    let split = frame.len().saturating_sub(CHECKSUM_SIZE);
    let mut digest = CD11_CRC.digest();
    digest.update(&frame[..split]);
    digest.update(&[0u8; CHECKSUM_SIZE][..frame.len() - split]);
    digest.finalize()
}
