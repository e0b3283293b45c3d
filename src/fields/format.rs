//! Conversions between EMV data element formats and native types.
//!
//! `n` is BCD with leading zero padding, `cn` is BCD right-padded with 0xF,
//! `b` is big-endian binary, and the text formats (`a`, `an`, `ans`) are
//! drawn from the common character set, ISO 8859 code table 1.

use byteorder::{BigEndian, ByteOrder};
use encoding_rs::mem::decode_latin1;

/// Decodes a numeric (`n`) field into an integer. `None` on a non-BCD
/// nibble or a field longer than nine bytes (18 digits), which could not
/// fit a `u64`.
pub fn parse_n(data: &[u8]) -> Option<u64> {
    if data.len() > 9 {
        return None;
    }
    let mut out: u64 = 0;
    for &b in data {
        let (hi, lo) = (b >> 4, b & 0x0F);
        if hi > 9 || lo > 9 {
            return None;
        }
        out = out * 100 + (hi as u64 * 10) + lo as u64;
    }
    Some(out)
}

/// Encodes an integer as a numeric (`n`) field of `len` bytes, left-padded
/// with zero digits. Digits beyond the field are truncated from the left,
/// matching how numeric fields are fitted elsewhere.
pub fn to_n(mut value: u64, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    for slot in out.iter_mut().rev() {
        let pair = (value % 100) as u8;
        *slot = ((pair / 10) << 4) | (pair % 10);
        value /= 100;
    }
    out
}

/// Decodes a compressed numeric (`cn`) field: BCD digits terminated by the
/// first 0xF nibble.
pub fn parse_cn(data: &[u8]) -> Option<String> {
    let mut out = String::with_capacity(data.len() * 2);
    for &b in data {
        for nibble in [b >> 4, b & 0x0F] {
            match nibble {
                0..=9 => out.push(char::from(b'0' + nibble)),
                0xF => return Some(out),
                _ => return None,
            }
        }
    }
    Some(out)
}

/// Decodes a binary (`b`) field of up to 8 bytes into an integer.
pub fn parse_b(data: &[u8]) -> Option<u64> {
    match data.len() {
        0 => Some(0),
        1..=8 => Some(BigEndian::read_uint(data, data.len())),
        _ => None,
    }
}

/// Renders an `an` field, keeping only alphanumeric characters.
pub fn to_an(data: &[u8]) -> String {
    decode_latin1(data).chars().filter(|c| c.is_alphanumeric()).collect()
}

/// Renders an `ans` field, keeping any non-control ISO 8859 character.
pub fn to_ans(data: &[u8]) -> String {
    decode_latin1(data).chars().filter(|c| !c.is_control()).collect()
}
