//! ISO 7816-4 APDUs: command/response pairs, the case classification from
//! ISO 7816-3 §12.1.3, and status word interpretation.
//!
//! This engine transmits short-form commands only (data up to 255 bytes,
//! responses up to 256 plus status), which is all EMV Level 2 requires;
//! extended cases are still classified so malformed input is caught early.

use std::fmt;

use crate::errors::{Error, Result};

/// Longest wire response: 256 data bytes plus SW1-SW2.
pub const RAPDU_MAX: usize = 258;
/// Longest command data field in a short-form APDU.
pub const CAPDU_DATA_MAX: usize = 255;

/// A command APDU. `le`, when set, is the expected response length with 256
/// encoded on the wire as 0x00.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    pub le: Option<u16>,
}

impl Command {
    pub fn new<T: Into<Vec<u8>>>(cla: u8, ins: u8, p1: u8, p2: u8, data: T) -> Self {
        Self { cla, ins, p1, p2, data: data.into(), le: None }
    }

    /// Sets the expected (maximum) response length, making this a case 2 or
    /// case 4 command.
    pub fn expect(mut self, le: u16) -> Self {
        self.le = Some(le);
        self
    }

    pub fn case(&self) -> Case {
        match (self.data.is_empty(), self.le.is_some()) {
            (true, false) => Case::Case1,
            (true, true) => Case::Case2Short,
            (false, false) => Case::Case3Short,
            (false, true) => Case::Case4Short,
        }
    }

    /// Serializes to wire form. Short form only.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        if self.data.len() > CAPDU_DATA_MAX {
            return Err(Error::InvalidArgument("command data too long"));
        }
        let mut out = vec![self.cla, self.ins, self.p1, self.p2];
        if !self.data.is_empty() {
            out.push(self.data.len() as u8);
            out.extend_from_slice(&self.data);
        }
        if let Some(le) = self.le {
            if le > 256 {
                return Err(Error::InvalidArgument("Le too large for short form"));
            }
            out.push(if le == 256 { 0x00 } else { le as u8 });
        }
        Ok(out)
    }

    /// The five-byte T=0 header; P3 is Lc when there is command data,
    /// otherwise Le (0x00 when absent).
    pub fn header(&self) -> [u8; 5] {
        let p3 = if !self.data.is_empty() {
            self.data.len() as u8
        } else {
            match self.le {
                Some(256) | None => 0x00,
                Some(le) => le as u8,
            }
        };
        [self.cla, self.ins, self.p1, self.p2, p3]
    }
}

/// ISO 7816-3 command cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Case {
    /// Header only.
    Case1,
    /// Header + Le.
    Case2Short,
    /// Header + Lc + data.
    Case3Short,
    /// Header + Lc + data + Le.
    Case4Short,
    /// Header + 3-byte Le.
    Case2Extended,
    /// Header + 3-byte Lc + data.
    Case3Extended,
    /// Header + 3-byte Lc + data + 2-byte Le.
    Case4Extended,
}

impl Case {
    /// Does this case expect response data (and may therefore be chained
    /// with GET RESPONSE / Le correction)?
    pub fn expects_response(self) -> bool {
        matches!(
            self,
            Case::Case2Short | Case::Case4Short | Case::Case2Extended | Case::Case4Extended
        )
    }
}

/// Classifies a raw command APDU per the ISO 7816-3 §12.1.3 length table.
pub fn classify(raw: &[u8]) -> Result<Case> {
    match raw.len() {
        0..=3 => Err(Error::InvalidArgument("APDU shorter than a header")),
        4 => Ok(Case::Case1),
        5 => Ok(Case::Case2Short),
        len => {
            let c5 = raw[4] as usize;
            if c5 != 0 {
                if len == 5 + c5 {
                    return Ok(Case::Case3Short);
                }
                if len == 6 + c5 {
                    return Ok(Case::Case4Short);
                }
                return Err(Error::InvalidArgument("length field does not match APDU size"));
            }
            // C5 = 0 introduces the extended forms.
            if len == 7 {
                return Ok(Case::Case2Extended);
            }
            if len < 7 {
                return Err(Error::InvalidArgument("length field does not match APDU size"));
            }
            let c6c7 = u16::from_be_bytes([raw[5], raw[6]]) as usize;
            if c6c7 != 0 {
                if len == 7 + c6c7 {
                    return Ok(Case::Case3Extended);
                }
                if len == 9 + c6c7 {
                    return Ok(Case::Case4Extended);
                }
            }
            Err(Error::InvalidArgument("length field does not match APDU size"))
        }
    }
}

/// A response APDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub data: Vec<u8>,
    pub sw: Status,
}

impl Response {
    pub fn new<T: Into<Vec<u8>>>(sw: Status, data: T) -> Self {
        Self { data: data.into(), sw }
    }

    /// Splits SW1-SW2 off the end of a raw response.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 2 {
            return Err(Error::Protocol("response shorter than a status word"));
        }
        if raw.len() > RAPDU_MAX {
            return Err(Error::Protocol("response longer than an R-APDU"));
        }
        let (data, sw) = raw.split_at(raw.len() - 2);
        Ok(Self { data: data.to_vec(), sw: Status(sw[0], sw[1]) })
    }
}

/// SW1-SW2 status bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(pub u8, pub u8);

impl Status {
    pub const OK: Status = Status(0x90, 0x00);

    pub fn to_u16(self) -> u16 {
        u16::from_be_bytes([self.0, self.1])
    }

    pub fn is_ok(self) -> bool {
        self == Status::OK
    }

    /// A warning status: processing completed, with a caveat.
    pub fn is_warning(self) -> bool {
        self.0 == 0x62 || self.0 == 0x63
    }

    pub fn class(self) -> StatusClass {
        match (self.0, self.1) {
            (0x90, _) => StatusClass::Ok,
            (0x61, x) => StatusClass::BytesRemaining(x),
            (0x62, 0x83) => StatusClass::SelectedFileDeactivated,
            (0x62, _) | (0x63, _) => StatusClass::Warning(self),
            (0x69, 0x83) => StatusClass::AuthMethodBlocked,
            (0x69, 0x84) => StatusClass::RefDataUnusable,
            (0x69, 0x85) => StatusClass::ConditionsNotSatisfied,
            (0x6A, 0x81) => StatusClass::FunctionNotSupported,
            (0x6A, 0x82) => StatusClass::FileNotFound,
            (0x6A, 0x83) => StatusClass::RecordNotFound,
            (0x6B, 0x00) => StatusClass::WrongP1P2,
            (0x67, 0x00) => StatusClass::WrongLength,
            (0x6C, x) => StatusClass::RetryWithLe(x),
            (0x6D, 0x00) => StatusClass::InstructionNotSupported,
            (0x6E, 0x00) => StatusClass::ClassNotSupported,
            _ => StatusClass::Other(self),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}", self.0, self.1)
    }
}

/// The status word classes this engine reacts to. Everything else is
/// surfaced as [`StatusClass::Other`] for the caller to interpret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 9000.
    Ok,
    /// 61XX: x more bytes available via GET RESPONSE.
    BytesRemaining(u8),
    /// 6CXX: wrong Le, retry with Le = x.
    RetryWithLe(u8),
    /// 62XX/63XX: completed with a warning.
    Warning(Status),
    /// 6283: selected file invalidated (a blocked application or PSE).
    SelectedFileDeactivated,
    /// 6983: authentication method blocked (a blocked card).
    AuthMethodBlocked,
    /// 6984: referenced data unusable.
    RefDataUnusable,
    /// 6985: conditions of use not satisfied.
    ConditionsNotSatisfied,
    /// 6A81: function not supported.
    FunctionNotSupported,
    /// 6A82: file not found.
    FileNotFound,
    /// 6A83: record not found.
    RecordNotFound,
    /// 6B00.
    WrongP1P2,
    /// 6700.
    WrongLength,
    /// 6D00.
    InstructionNotSupported,
    /// 6E00.
    ClassNotSupported,
    Other(Status),
}
