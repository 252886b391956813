//! CRC16 checksum calculation.
//!
//! Both the XMODEM block trailer and the merged-binary segment checksum use
//! CRC16-CCITT with polynomial 0x1021 (often written in its augmented form
//! 0x11021), MSB first, initial value 0. The table is generated at compile
//! time.

/// CRC16-CCITT polynomial (XMODEM variant).
pub const CRC16_POLY: u16 = 0x1021;

static CRC16_TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ CRC16_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Feed more data into a running CRC16 computation.
pub fn crc16_update(crc: u16, data: &[u8]) -> u16 {
    data.iter().fold(crc, |crc, &byte| {
        CRC16_TABLE[usize::from((crc >> 8) as u8 ^ byte)] ^ (crc << 8)
    })
}

/// Compute the CRC16/XMODEM checksum of `data`.
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    crc16_update(0, data)
}
