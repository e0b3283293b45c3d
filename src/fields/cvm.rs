//! Cardholder Verification Method (CVM) List parsing.
//!
//! The CVM List (tag 8E) opens with two 4-byte amounts, X and Y, used by the
//! amount-relative conditions, followed by 2-byte cardholder verification
//! rules. See EMV Book 3, §10.5.

use byteorder::{BigEndian, ByteOrder};
use num_enum::FromPrimitive;

use crate::errors::{Outcome, Result};

/// Verification method, from the low six bits of the first rule byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum CvMethod {
    Fail = 0x00,
    PlaintextPin = 0x01,
    EncipheredPinOnline = 0x02,
    PlaintextPinAndSignature = 0x03,
    EncipheredPin = 0x04,
    EncipheredPinAndSignature = 0x05,
    Signature = 0x1E,
    NoCvmRequired = 0x1F,
    #[num_enum(catch_all)]
    Unknown(u8) = 0x3F,
}

/// Condition under which the rule applies, from the second rule byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum CvCondition {
    Always = 0x00,
    UnattendedCash = 0x01,
    NotCashOrCashback = 0x02,
    TerminalSupportsCvm = 0x03,
    ManualCash = 0x04,
    PurchaseWithCashback = 0x05,
    UnderX = 0x06,
    OverX = 0x07,
    UnderY = 0x08,
    OverY = 0x09,
    #[num_enum(catch_all)]
    Unknown(u8) = 0xFF,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CvRule {
    pub method: CvMethod,
    pub condition: CvCondition,
    /// Bit 7 of the method byte: apply the next rule if this one fails
    /// (otherwise cardholder verification fails outright).
    pub continue_on_failure: bool,
}

impl CvRule {
    fn decode(method_byte: u8, condition_byte: u8) -> Self {
        Self {
            method: CvMethod::from(method_byte & 0b0011_1111),
            condition: CvCondition::from(condition_byte),
            continue_on_failure: method_byte & 0b0100_0000 != 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CvmList {
    pub x: u32,
    pub y: u32,
    pub rules: Vec<CvRule>,
}

impl TryFrom<&[u8]> for CvmList {
    type Error = crate::Error;

    /// Total length must be even and at least 10: two amounts plus one rule.
    fn try_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 10 || bytes.len() % 2 != 0 {
            return Err(Outcome::CardError.into());
        }
        let x = BigEndian::read_u32(&bytes[0..4]);
        let y = BigEndian::read_u32(&bytes[4..8]);
        let rules = bytes[8..]
            .chunks_exact(2)
            .map(|pair| CvRule::decode(pair[0], pair[1]))
            .collect();
        Ok(Self { x, y, rules })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let list = CvmList::try_from(
            &[
                0x00, 0x01, 0x86, 0xA0, // X = 100000
                0x00, 0x00, 0x03, 0xE8, // Y = 1000
                0x42, 0x01, // enciphered PIN online, if unattended cash
                0x44, 0x03, // enciphered PIN by ICC, if terminal supports CVM
            ][..],
        )
        .unwrap();
        assert_eq!(list.x, 100_000);
        assert_eq!(list.y, 1_000);
        assert_eq!(
            list.rules,
            vec![
                CvRule {
                    method: CvMethod::EncipheredPinOnline,
                    condition: CvCondition::UnattendedCash,
                    continue_on_failure: true,
                },
                CvRule {
                    method: CvMethod::EncipheredPin,
                    condition: CvCondition::TerminalSupportsCvm,
                    continue_on_failure: true,
                },
            ]
        );
    }

    #[test]
    fn test_fail_cvm_rule() {
        let list =
            CvmList::try_from(&[0, 0, 0, 0, 0, 0, 0, 0, 0x00, 0x00][..]).unwrap();
        assert_eq!(list.rules[0].method, CvMethod::Fail);
        assert_eq!(list.rules[0].condition, CvCondition::Always);
        assert!(!list.rules[0].continue_on_failure);
    }

    #[test]
    fn test_unknown_codes_preserved() {
        let list =
            CvmList::try_from(&[0, 0, 0, 0, 0, 0, 0, 0, 0x3D, 0x42][..]).unwrap();
        assert_eq!(list.rules[0].method, CvMethod::Unknown(0x3D));
        assert_eq!(list.rules[0].condition, CvCondition::Unknown(0x42));
    }

    #[test]
    fn test_too_short() {
        assert!(CvmList::try_from(&[0u8; 8][..]).is_err());
        assert!(CvmList::try_from(&[0u8; 9][..]).is_err());
    }

    #[test]
    fn test_odd_length() {
        assert!(CvmList::try_from(&[0u8; 11][..]).is_err());
    }
}
