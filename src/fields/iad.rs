//! Issuer Application Data (IAD, tag 9F10) format detection.
//!
//! The IAD is proprietary to the issuer, but the major kernels can be told
//! apart from the first two bytes and the total length. Nothing here parses
//! the discretionary contents; this only answers "whose layout is this".

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IadFormat {
    /// EMVCo Common Core Definitions layout.
    Ccd,
    /// Mastercard M/Chip 4.
    MChip4,
    /// Mastercard M/Chip Advance.
    MChipAdvance,
    /// Visa Smart Debit/Credit, carrying the Visa format number (0..4).
    Vsdc(u8),
    Unknown,
}

pub fn detect(iad: &[u8]) -> IadFormat {
    let len = iad.len();
    if len < 2 {
        return IadFormat::Unknown;
    }
    let (b0, b1) = (iad[0], iad[1]);

    // CCD: fixed 32 bytes, length indicator 0x0F, Common Core Identifier
    // with format code 0xA in the high nibble.
    if len == 32 && b0 == 0x0F && b1 & 0xF0 == 0xA0 {
        return IadFormat::Ccd;
    }

    // Visa: a leading length indicator of 0x06 marks the legacy formats
    // (0, 1 and 3, told apart by the low nibble of the next byte), 0x1F the
    // 32-byte formats 2 and 4.
    if b0 == 0x06 && (7..=32).contains(&len) {
        return IadFormat::Vsdc(match b1 & 0x0F {
            1 => 1,
            3 => 3,
            _ => 0,
        });
    }
    if b0 == 0x1F && len == 32 {
        return IadFormat::Vsdc(if b1 & 0x0F == 4 { 4 } else { 2 });
    }

    // Mastercard carries no length indicator; the length decides between
    // M/Chip 4 and M/Chip Advance, with the cryptogram version number in
    // the 0x1X range confirming the family.
    if b1 & 0xF0 == 0x10 {
        match len {
            18 | 20 => return IadFormat::MChip4,
            26 | 28 => return IadFormat::MChipAdvance,
            _ => {}
        }
    }

    IadFormat::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ccd() {
        let mut iad = vec![0u8; 32];
        iad[0] = 0x0F;
        iad[1] = 0xA5;
        assert_eq!(detect(&iad), IadFormat::Ccd);
    }

    #[test]
    fn test_vsdc_legacy() {
        assert_eq!(detect(&[0x06, 0x01, 0x0A, 0x03, 0xA0, 0x00, 0x00]), IadFormat::Vsdc(1));
        assert_eq!(detect(&[0x06, 0x00, 0x0A, 0x03, 0xA0, 0x00, 0x00]), IadFormat::Vsdc(0));
        assert_eq!(detect(&[0x06, 0x03, 0x0A, 0x03, 0xA0, 0x00, 0x00]), IadFormat::Vsdc(3));
    }

    #[test]
    fn test_vsdc_32_byte() {
        let mut iad = vec![0u8; 32];
        iad[0] = 0x1F;
        iad[1] = 0x42;
        assert_eq!(detect(&iad), IadFormat::Vsdc(2));
        iad[1] = 0x44;
        assert_eq!(detect(&iad), IadFormat::Vsdc(4));
    }

    #[test]
    fn test_mchip() {
        let mut iad = vec![0u8; 18];
        iad[1] = 0x11;
        assert_eq!(detect(&iad), IadFormat::MChip4);
        let mut iad = vec![0u8; 26];
        iad[1] = 0x11;
        assert_eq!(detect(&iad), IadFormat::MChipAdvance);
    }

    #[test]
    fn test_unknown() {
        assert_eq!(detect(&[]), IadFormat::Unknown);
        assert_eq!(detect(&[0x06]), IadFormat::Unknown);
        assert_eq!(detect(&vec![0xAB; 13]), IadFormat::Unknown);
    }
}
