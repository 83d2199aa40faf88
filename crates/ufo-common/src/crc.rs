// crc.rs — 16-bit CCITT CRC (polynomial 0x1021) over routing tables
// Delegates to the `crc` crate (CRC-16/IBM-3740 == CRC-16/CCITT-FALSE).

use crc::{Crc, CRC_16_IBM_3740};

const CRC_CALC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Compute CRC for an entire block of data.
pub fn crc_block(data: &[u8]) -> u16 {
    CRC_CALC.checksum(data)
}

/// Compute one CRC over several blocks as if they were concatenated.
pub fn crc_blocks(blocks: &[&[u8]]) -> u16 {
    let mut digest = CRC_CALC.digest();
    for block in blocks {
        digest.update(block);
    }
    digest.finalize()
}
