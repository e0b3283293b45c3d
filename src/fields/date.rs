//! BCD date comparison.
//!
//! Card dates (application effective/expiry, tag 5F25/5F24) are three BCD
//! bytes, YYMMDD; certificate expiry dates are two BCD bytes, MMYY, and run
//! to the end of the month. Two-digit years are windowed against the
//! terminal's year: a YY at or below the terminal's is 20YY, above it 19YY.
//!
//! Undecodable or out-of-range dates are pessimistic: an invalid expiry
//! counts as expired, an invalid effective date as not yet effective.

use chrono::NaiveDate;

fn bcd(b: u8) -> Option<u32> {
    let (hi, lo) = (b >> 4, b & 0x0F);
    if hi > 9 || lo > 9 {
        return None;
    }
    Some(hi as u32 * 10 + lo as u32)
}

/// Windows a two-digit year against the terminal's two-digit year.
fn window_year(yy: u32, today_yy: u32) -> i32 {
    if yy <= today_yy {
        2000 + yy as i32
    } else {
        1900 + yy as i32
    }
}

fn decode_yymmdd(b: &[u8], today_yy: u32) -> Option<NaiveDate> {
    if b.len() != 3 {
        return None;
    }
    let (yy, mm, dd) = (bcd(b[0])?, bcd(b[1])?, bcd(b[2])?);
    NaiveDate::from_ymd_opt(window_year(yy, today_yy), mm, dd)
}

fn month_end(year: i32, month: u32) -> Option<NaiveDate> {
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(ny, nm, 1)?.pred_opt()
}

fn decode_mmyy_end(b: &[u8], today_yy: u32) -> Option<NaiveDate> {
    if b.len() != 2 {
        return None;
    }
    let (mm, yy) = (bcd(b[0])?, bcd(b[1])?);
    if mm == 0 || mm > 12 {
        return None;
    }
    month_end(window_year(yy, today_yy), mm)
}

fn today(yymmdd: &[u8]) -> Option<(NaiveDate, u32)> {
    if yymmdd.len() != 3 {
        return None;
    }
    let yy = bcd(yymmdd[0])?;
    Some((decode_yymmdd(yymmdd, yy)?, yy))
}

/// Is a YYMMDD expiry date (5F24) past, seen from the YYMMDD transaction
/// date (9A)? An undecodable date on either side counts as expired.
pub fn is_expired(today_yymmdd: &[u8], expiry_yymmdd: &[u8]) -> bool {
    let Some((now, yy)) = today(today_yymmdd) else { return true };
    match decode_yymmdd(expiry_yymmdd, yy) {
        Some(expiry) => now > expiry,
        None => true,
    }
}

/// Is a YYMMDD effective date (5F25) still in the future? An undecodable
/// date counts as not yet effective.
pub fn is_not_effective(today_yymmdd: &[u8], effective_yymmdd: &[u8]) -> bool {
    let Some((now, yy)) = today(today_yymmdd) else { return true };
    match decode_yymmdd(effective_yymmdd, yy) {
        Some(effective) => now < effective,
        None => true,
    }
}

/// Is an MMYY expiry date (certificate expiry) past? The date extends to
/// the end of its month.
pub fn mmyy_is_expired(today_yymmdd: &[u8], mmyy: &[u8]) -> bool {
    let Some((now, yy)) = today(today_yymmdd) else { return true };
    match decode_mmyy_end(mmyy, yy) {
        Some(expiry) => now > expiry,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TODAY: &[u8] = &[0x22, 0x04, 0x15]; // 2022-04-15

    #[test]
    fn test_mmyy_expiry() {
        assert!(!mmyy_is_expired(TODAY, &[0x04, 0x22])); // runs to 2022-04-30
        assert!(mmyy_is_expired(TODAY, &[0x03, 0x22])); // ended 2022-03-31
        assert!(!mmyy_is_expired(TODAY, &[0x12, 0x30]));
    }

    #[test]
    fn test_yymmdd_expiry() {
        assert!(!is_expired(TODAY, &[0x22, 0x04, 0x15])); // expires today
        assert!(is_expired(TODAY, &[0x22, 0x04, 0x14]));
        assert!(!is_expired(TODAY, &[0x25, 0x01, 0x01]));
    }

    #[test]
    fn test_effective_date() {
        assert!(!is_not_effective(TODAY, &[0x22, 0x04, 0x15]));
        assert!(is_not_effective(TODAY, &[0x22, 0x05, 0x01]));
        assert!(!is_not_effective(TODAY, &[0x19, 0x01, 0x01]));
    }

    #[test]
    fn test_century_window() {
        // 99 is above the terminal's 22: read as 1999, long expired.
        assert!(is_expired(TODAY, &[0x99, 0x12, 0x31]));
        // 22 and below are the 2000s.
        assert!(!is_expired(TODAY, &[0x22, 0x12, 0x31]));
    }

    #[test]
    fn test_invalid_dates_are_pessimistic() {
        assert!(is_expired(TODAY, &[0x22, 0x00, 0x01])); // month 0
        assert!(is_expired(TODAY, &[0x22, 0x13, 0x01])); // month 13
        assert!(is_expired(TODAY, &[0x22, 0x0A, 0x01])); // non-BCD nibble
        assert!(is_expired(TODAY, &[0x22, 0x02, 0x30])); // no Feb 30th
        assert!(is_not_effective(TODAY, &[0x00, 0x00, 0x00]));
        assert!(mmyy_is_expired(TODAY, &[0x00, 0x22])); // month 0
        assert!(mmyy_is_expired(TODAY, &[0x04])); // wrong length
    }

    #[test]
    fn test_invalid_today_is_pessimistic() {
        assert!(is_expired(&[0xFF, 0x01, 0x01], &[0x25, 0x01, 0x01]));
    }
}
