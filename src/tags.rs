//! The EMV application-class tag dictionary.
//!
//! Data elements are defined in EMV Book 3, Annex A, with their formats
//! (a/an/ans, b, cn, n, ...). Unknown tags pass through the engine
//! untouched; the dictionary exists for the places behaviour depends on a
//! tag's nature: DOL building, text rendering, and the terminal/card split.

use crate::ber::Tag;

pub const AID: Tag = 0x4F;
pub const APP_LABEL: Tag = 0x50;
pub const TRACK1: Tag = 0x56;
pub const TRACK2: Tag = 0x57;
pub const PAN: Tag = 0x5A;
pub const APP_TEMPLATE: Tag = 0x61;
pub const FCI_TEMPLATE: Tag = 0x6F;
pub const RECORD_TEMPLATE: Tag = 0x70;
pub const ISSUER_SCRIPT_TEMPLATE1: Tag = 0x71;
pub const ISSUER_SCRIPT_TEMPLATE2: Tag = 0x72;
pub const DIRECTORY_DISCRETIONARY: Tag = 0x73;
pub const RESPONSE_FORMAT2: Tag = 0x77;
pub const RESPONSE_FORMAT1: Tag = 0x80;
pub const AMOUNT_AUTHORISED_BINARY: Tag = 0x81;
pub const AIP: Tag = 0x82;
pub const COMMAND_TEMPLATE: Tag = 0x83;
pub const DF_NAME: Tag = 0x84;
pub const APP_PRIORITY: Tag = 0x87;
pub const PSE_SFI: Tag = 0x88;
pub const AUTHORISATION_CODE: Tag = 0x89;
pub const AUTHORISATION_RESPONSE_CODE: Tag = 0x8A;
pub const CDOL1: Tag = 0x8C;
pub const CDOL2: Tag = 0x8D;
pub const CVM_LIST: Tag = 0x8E;
pub const CAPK_INDEX: Tag = 0x8F;
pub const ISSUER_CERT: Tag = 0x90;
pub const ISSUER_AUTHENTICATION_DATA: Tag = 0x91;
pub const ISSUER_REMAINDER: Tag = 0x92;
pub const SSAD: Tag = 0x93;
pub const AFL: Tag = 0x94;
pub const TVR: Tag = 0x95;
pub const TDOL: Tag = 0x97;
pub const TC_HASH: Tag = 0x98;
pub const TRANSACTION_PIN_DATA: Tag = 0x99;
pub const TRANSACTION_DATE: Tag = 0x9A;
pub const TSI: Tag = 0x9B;
pub const TRANSACTION_TYPE: Tag = 0x9C;
pub const DDF_NAME: Tag = 0x9D;
pub const FCI_PROPRIETARY: Tag = 0xA5;

pub const CARDHOLDER_NAME: Tag = 0x5F20;
pub const EXPIRY_DATE: Tag = 0x5F24;
pub const EFFECTIVE_DATE: Tag = 0x5F25;
pub const ISSUER_COUNTRY: Tag = 0x5F28;
pub const TRANSACTION_CURRENCY: Tag = 0x5F2A;
pub const LANGUAGE_PREFERENCE: Tag = 0x5F2D;
pub const SERVICE_CODE: Tag = 0x5F30;
pub const TRANSACTION_CURRENCY_EXPONENT: Tag = 0x5F36;
pub const PAN_SEQUENCE: Tag = 0x5F34;
pub const ISSUER_URL: Tag = 0x5F50;
pub const IBAN: Tag = 0x5F53;
pub const BANK_IDENTIFIER_CODE: Tag = 0x5F54;
pub const ISSUER_COUNTRY_A2: Tag = 0x5F55;
pub const ISSUER_COUNTRY_A3: Tag = 0x5F56;
pub const ACCOUNT_TYPE: Tag = 0x5F57;

pub const ACQUIRER_ID: Tag = 0x9F01;
pub const AMOUNT_AUTHORISED: Tag = 0x9F02;
pub const AMOUNT_OTHER: Tag = 0x9F03;
pub const AMOUNT_OTHER_BINARY: Tag = 0x9F04;
pub const APP_DISCRETIONARY_DATA: Tag = 0x9F05;
pub const TERMINAL_AID: Tag = 0x9F06;
pub const APP_USAGE_CONTROL: Tag = 0x9F07;
pub const APP_VERSION_ICC: Tag = 0x9F08;
pub const APP_VERSION_TERMINAL: Tag = 0x9F09;
pub const IAD: Tag = 0x9F10;
pub const ISSUER_CODE_TABLE: Tag = 0x9F11;
pub const APP_PREFERRED_NAME: Tag = 0x9F12;
pub const LAST_ONLINE_ATC: Tag = 0x9F13;
pub const LOWER_CONSECUTIVE_OFFLINE_LIMIT: Tag = 0x9F14;
pub const MERCHANT_CATEGORY_CODE: Tag = 0x9F15;
pub const MERCHANT_ID: Tag = 0x9F16;
pub const PIN_TRY_COUNTER: Tag = 0x9F17;
pub const ISSUER_SCRIPT_ID: Tag = 0x9F18;
pub const TERMINAL_COUNTRY: Tag = 0x9F1A;
pub const TERMINAL_FLOOR_LIMIT: Tag = 0x9F1B;
pub const TERMINAL_ID: Tag = 0x9F1C;
pub const TERMINAL_RISK_MANAGEMENT_DATA: Tag = 0x9F1D;
pub const IFD_SERIAL: Tag = 0x9F1E;
pub const TRACK1_DISCRETIONARY: Tag = 0x9F1F;
pub const TRACK2_DISCRETIONARY: Tag = 0x9F20;
pub const TRANSACTION_TIME: Tag = 0x9F21;
pub const UPPER_CONSECUTIVE_OFFLINE_LIMIT: Tag = 0x9F23;
pub const CRYPTOGRAM: Tag = 0x9F26;
pub const CID: Tag = 0x9F27;
pub const ICC_PIN_CERT: Tag = 0x9F2D;
pub const ICC_PIN_EXPONENT: Tag = 0x9F2E;
pub const ICC_PIN_REMAINDER: Tag = 0x9F2F;
pub const ISSUER_EXPONENT: Tag = 0x9F32;
pub const TERMINAL_CAPABILITIES: Tag = 0x9F33;
pub const CVM_RESULTS: Tag = 0x9F34;
pub const TERMINAL_TYPE: Tag = 0x9F35;
pub const ATC: Tag = 0x9F36;
pub const UNPREDICTABLE_NUMBER: Tag = 0x9F37;
pub const PDOL: Tag = 0x9F38;
pub const POS_ENTRY_MODE: Tag = 0x9F39;
pub const AMOUNT_REFERENCE_CURRENCY: Tag = 0x9F3A;
pub const APP_REFERENCE_CURRENCY: Tag = 0x9F3B;
pub const TRANSACTION_REFERENCE_CURRENCY: Tag = 0x9F3C;
pub const TRANSACTION_REFERENCE_EXPONENT: Tag = 0x9F3D;
pub const ADDITIONAL_CAPABILITIES: Tag = 0x9F40;
pub const TRANSACTION_SEQUENCE_COUNTER: Tag = 0x9F41;
pub const APP_CURRENCY_CODE: Tag = 0x9F42;
pub const APP_REFERENCE_CURRENCY_EXPONENT: Tag = 0x9F43;
pub const APP_CURRENCY_EXPONENT: Tag = 0x9F44;
pub const DAC: Tag = 0x9F45;
pub const ICC_CERT: Tag = 0x9F46;
pub const ICC_EXPONENT: Tag = 0x9F47;
pub const ICC_REMAINDER: Tag = 0x9F48;
pub const DDOL: Tag = 0x9F49;
pub const SDA_TAG_LIST: Tag = 0x9F4A;
pub const SDAD: Tag = 0x9F4B;
pub const ICC_DYNAMIC_NUMBER: Tag = 0x9F4C;
pub const LOG_ENTRY: Tag = 0x9F4D;
pub const MERCHANT_NAME_LOCATION: Tag = 0x9F4E;
pub const LOG_FORMAT: Tag = 0x9F4F;

pub const FCI_DISCRETIONARY: Tag = 0xBF0C;

/// EMV data element formats per Book 3, Annex A.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Alphabetic.
    A,
    /// Alphanumeric.
    An,
    /// Alphanumeric special.
    Ans,
    /// Binary.
    B,
    /// Compressed numeric (BCD, 0xF right-padded).
    Cn,
    /// Numeric (BCD, zero left-padded).
    N,
    /// Variable / proprietary.
    Var,
    /// A Data Object List.
    Dol,
    /// A concatenation of bare tags.
    TagList,
}

/// Format of a known data element, `None` for tags outside the dictionary.
pub fn format_of(tag: Tag) -> Option<Format> {
    use Format::*;
    Some(match tag {
        PAN => Cn,
        APP_LABEL | ISSUER_URL | IBAN => Ans,
        APP_PREFERRED_NAME | MERCHANT_NAME_LOCATION => Ans,
        CARDHOLDER_NAME | MERCHANT_ID | TERMINAL_ID => Ans,
        TRACK1 | TRACK1_DISCRETIONARY | TRACK2_DISCRETIONARY => Ans,
        LANGUAGE_PREFERENCE | IFD_SERIAL | BANK_IDENTIFIER_CODE | ISSUER_COUNTRY_A2
        | ISSUER_COUNTRY_A3 => An,
        CDOL1 | CDOL2 | PDOL | DDOL | TDOL => Dol,
        SDA_TAG_LIST | LOG_FORMAT => TagList,
        AMOUNT_AUTHORISED | AMOUNT_OTHER | AMOUNT_REFERENCE_CURRENCY => N,
        TRANSACTION_DATE | TRANSACTION_TIME | EXPIRY_DATE | EFFECTIVE_DATE => N,
        TRANSACTION_TYPE | ACCOUNT_TYPE | POS_ENTRY_MODE => N,
        TERMINAL_COUNTRY | ISSUER_COUNTRY | TRANSACTION_CURRENCY | APP_CURRENCY_CODE
        | APP_REFERENCE_CURRENCY | TRANSACTION_REFERENCE_CURRENCY => N,
        TRANSACTION_CURRENCY_EXPONENT | TRANSACTION_REFERENCE_EXPONENT
        | APP_CURRENCY_EXPONENT | APP_REFERENCE_CURRENCY_EXPONENT => N,
        PAN_SEQUENCE | ISSUER_CODE_TABLE | SERVICE_CODE | MERCHANT_CATEGORY_CODE
        | ACQUIRER_ID | TRANSACTION_SEQUENCE_COUNTER => N,
        APP_DISCRETIONARY_DATA | IAD | ISSUER_SCRIPT_ID | TERMINAL_RISK_MANAGEMENT_DATA => Var,
        AID | TERMINAL_AID | DF_NAME | DDF_NAME | TRACK2 => B,
        AIP | AFL | TVR | TSI | CRYPTOGRAM | CID | SSAD | ISSUER_CERT | ISSUER_REMAINDER
        | ISSUER_EXPONENT | ISSUER_AUTHENTICATION_DATA | ICC_CERT | ICC_REMAINDER
        | ICC_EXPONENT | ICC_PIN_CERT | ICC_PIN_EXPONENT | ICC_PIN_REMAINDER | SDAD
        | ICC_DYNAMIC_NUMBER | UNPREDICTABLE_NUMBER | APP_USAGE_CONTROL | APP_VERSION_ICC
        | APP_VERSION_TERMINAL | TERMINAL_CAPABILITIES | ADDITIONAL_CAPABILITIES | CVM_LIST
        | CVM_RESULTS | DAC | APP_PRIORITY | PSE_SFI | CAPK_INDEX | TERMINAL_TYPE | ATC
        | LAST_ONLINE_ATC | PIN_TRY_COUNTER | AMOUNT_AUTHORISED_BINARY | AMOUNT_OTHER_BINARY
        | TERMINAL_FLOOR_LIMIT | LOWER_CONSECUTIVE_OFFLINE_LIMIT
        | UPPER_CONSECUTIVE_OFFLINE_LIMIT | TC_HASH | TRANSACTION_PIN_DATA
        | AUTHORISATION_CODE | LOG_ENTRY => B,
        AUTHORISATION_RESPONSE_CODE => An,
        _ => return None,
    })
}

/// Data elements sourced from the terminal rather than the card. Relevant
/// when building DOL data: numeric terminal fields are right-aligned.
pub fn is_terminal_sourced(tag: Tag) -> bool {
    matches!(
        tag,
        AMOUNT_AUTHORISED
            | AMOUNT_OTHER
            | AMOUNT_AUTHORISED_BINARY
            | AMOUNT_OTHER_BINARY
            | AMOUNT_REFERENCE_CURRENCY
            | TRANSACTION_DATE
            | TRANSACTION_TIME
            | TRANSACTION_TYPE
            | TRANSACTION_CURRENCY
            | TRANSACTION_CURRENCY_EXPONENT
            | TRANSACTION_REFERENCE_CURRENCY
            | TRANSACTION_REFERENCE_EXPONENT
            | TRANSACTION_SEQUENCE_COUNTER
            | TERMINAL_COUNTRY
            | TERMINAL_TYPE
            | TERMINAL_CAPABILITIES
            | TERMINAL_FLOOR_LIMIT
            | TERMINAL_ID
            | TERMINAL_RISK_MANAGEMENT_DATA
            | ADDITIONAL_CAPABILITIES
            | UNPREDICTABLE_NUMBER
            | IFD_SERIAL
            | POS_ENTRY_MODE
            | APP_VERSION_TERMINAL
            | ACQUIRER_ID
            | MERCHANT_CATEGORY_CODE
            | MERCHANT_ID
            | MERCHANT_NAME_LOCATION
            | AUTHORISATION_CODE
            | AUTHORISATION_RESPONSE_CODE
            | TERMINAL_AID
            | TVR
            | TSI
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_of() {
        assert_eq!(format_of(AMOUNT_AUTHORISED), Some(Format::N));
        assert_eq!(format_of(PAN), Some(Format::Cn));
        assert_eq!(format_of(PDOL), Some(Format::Dol));
        assert_eq!(format_of(UNPREDICTABLE_NUMBER), Some(Format::B));
        assert_eq!(format_of(APP_LABEL), Some(Format::Ans));
        assert_eq!(format_of(SDA_TAG_LIST), Some(Format::TagList));
        assert_eq!(format_of(0xC7), None);
    }

    #[test]
    fn test_terminal_sourced() {
        assert!(is_terminal_sourced(AMOUNT_AUTHORISED));
        assert!(is_terminal_sourced(TRANSACTION_DATE));
        assert!(is_terminal_sourced(UNPREDICTABLE_NUMBER));
        assert!(!is_terminal_sourced(PAN));
        assert!(!is_terminal_sourced(AFL));
        assert!(!is_terminal_sourced(EXPIRY_DATE));
    }

    #[test]
    fn test_format_n_and_terminal_agree_for_dol_fitting() {
        // The right-alignment rule applies exactly to numeric terminal
        // fields; spot-check the ones DOLs commonly request.
        for tag in [AMOUNT_AUTHORISED, AMOUNT_OTHER, TRANSACTION_DATE, TRANSACTION_CURRENCY] {
            assert!(is_terminal_sourced(tag));
            assert_eq!(format_of(tag), Some(Format::N));
        }
    }
}
