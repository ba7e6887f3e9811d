//! The one CRC-32 in the system.
//!
//! Both the persistent store and the firmware integrity tail use the same
//! parameters: polynomial 0xEDB88320 (reflected), initial value 0xFFFFFFFF,
//! final XOR 0xFFFFFFFF. The table-driven implementation comes from the
//! `crc` crate; the part's hardware CRC block is deliberately not used.

use crc::{Crc, CRC_32_ISO_HDLC};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC of a contiguous byte run.
pub fn checksum(bytes: &[u8]) -> u32 {
    CRC32.checksum(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_value() {
        // The standard check input for CRC-32/ISO-HDLC.
        assert_eq!(checksum(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn streaming_matches_oneshot() {
        let mut digest = CRC32.digest();
        digest.update(b"1234");
        digest.update(b"56789");
        assert_eq!(digest.finalize(), checksum(b"123456789"));
    }
}
