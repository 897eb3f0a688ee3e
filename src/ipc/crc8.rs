//! CRC-8 (Dallas/Maxim) for door payload integrity
//!
//! Polynomial x^8 + x^5 + x^4 + 1 (0x31), processed LSB first (reflected
//! form 0x8C), initial value 0, no final XOR. The check value over the
//! ASCII string `123456789` is `0xA1`.

const POLY_REFLECTED: u8 = 0x8c;

const TABLE: [u8; 256] = build_table();

const fn build_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ POLY_REFLECTED
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Fold `data` into a running CRC
pub fn update(crc: u8, data: &[u8]) -> u8 {
    data.iter()
        .fold(crc, |crc, &byte| TABLE[(crc ^ byte) as usize])
}

/// CRC of `data`
pub fn checksum(data: &[u8]) -> u8 {
    update(0, data)
}

/// Whether `trailer` is the CRC of `data`
pub fn verify(data: &[u8], trailer: u8) -> bool {
    checksum(data) == trailer
}
