//! CRC-32 used by the lantern electronics
//!
//! MSB-first CRC-32 with generator polynomial 0x04C11DB7, initial value
//! 0xFFFFFFFF, no reflection and no final XOR (the CRC-32/MPEG-2 parameters).
//! This is not the common zlib CRC-32.

pub const CRC32_POLY: u32 = 0x04C1_1DB7;
pub const CRC32_INIT: u32 = 0xFFFF_FFFF;

/// Per-byte lookup table, built at compile time
pub static CRC32_TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut byte = 0;
    while byte < 256 {
        let mut c = (byte as u32) << 24;
        let mut i = 0;
        while i < 8 {
            c = if c & 0x8000_0000 != 0 { (c << 1) ^ CRC32_POLY } else { c << 1 };
            i += 1;
        }
        table[byte] = c;
        byte += 1;
    }
    table
}

/// Compute the CRC-32 of `data`
pub fn crc32(data: &[u8]) -> u32 {
    data.iter().fold(CRC32_INIT, |crc, &b| {
        (crc << 8) ^ CRC32_TABLE[((crc >> 24) as u8 ^ b) as usize]
    })
}
