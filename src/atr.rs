//! ATR (Answer-to-Reset) parsing and EMV eligibility checks.
//!
//! Structure comes from ISO 7816-3; the acceptance rules implemented by
//! [`validate_emv`] are from the EMV Level 1 Contact Interface
//! Specification, Section 8: "Answer to Reset", freely available from
//! EMVCo's website. A useful online decoder: https://smartcard-atr.apdu.fr/

use nom::combinator::{cond, map};
use nom::number::complete::be_u8;
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::errors::AtrError;

type IResult<'a, T> = nom::IResult<&'a [u8], T>;

/// Initial Character TS, a known bit pattern telling the electrical
/// transmission convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum Ts {
    /// Direct Convention, 1 is high.
    Direct = 0x3B,
    /// Inverse Convention, 1 is low. Rare, deprecated by EMV but accepted.
    Inverse = 0x3F,
    #[num_enum(catch_all)]
    Invalid(u8) = 0xFF,
}

/// Format Byte: number of historical bytes and which TX1 bytes follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct T0 {
    pub k: u8,
    pub tx1: u8,
}

impl From<u8> for T0 {
    fn from(v: u8) -> Self {
        Self { k: v & 0x0F, tx1: v >> 4 }
    }
}

/// A transmission protocol, from the low nibble of a TD byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum Protocol {
    T0 = 0,
    T1 = 1,
    /// T=15 is not a protocol: it flags global interface bytes.
    T15 = 15,
    #[num_enum(catch_all)]
    Invalid(u8) = 0xFF,
}

/// Interface Byte TDn: a protocol plus presence bits for the next cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TDn {
    pub protocol: Protocol,
    pub txn: u8,
}

impl From<u8> for TDn {
    fn from(v: u8) -> Self {
        Self { protocol: (v & 0x0F).into(), txn: v >> 4 }
    }
}

/// One cluster of interface bytes (TAn, TBn, TCn, TDn).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TXn {
    pub ta: Option<u8>,
    pub tb: Option<u8>,
    pub tc: Option<u8>,
    pub td: Option<TDn>,
}

fn parse_txn(data: &[u8], last_td: u8) -> IResult<'_, TXn> {
    let (data, ta) = cond(last_td & 1 << 0 > 0, be_u8)(data)?;
    let (data, tb) = cond(last_td & 1 << 1 > 0, be_u8)(data)?;
    let (data, tc) = cond(last_td & 1 << 2 > 0, be_u8)(data)?;
    let (data, td) = map(cond(last_td & 1 << 3 > 0, be_u8), |v| v.map(|v| v.into()))(data)?;
    Ok((data, TXn { ta, tb, tc, td }))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atr {
    pub ts: Ts,
    pub t0: T0,
    /// TA1: timing. TB1: deprecated voltage byte. TC1: extra guard time.
    pub tx1: TXn,
    /// TA2: mode negotiation. TC2: T=0 waiting time. TD2: second protocol.
    pub tx2: TXn,
    /// TA3/TB3/TC3: T=1 or T=15 parameters depending on TD2.
    pub tx3: TXn,
    pub historical: Vec<u8>,
    /// Checksum; absent when only T=0 is offered.
    pub tck: Option<u8>,
    raw: Vec<u8>,
}

impl Atr {
    /// The first offered protocol (TD1, defaulting to T=0).
    pub fn first_protocol(&self) -> Protocol {
        self.td1().map(|td| td.protocol).unwrap_or(Protocol::T0)
    }

    pub fn td1(&self) -> Option<TDn> {
        self.tx1.td
    }

    pub fn td2(&self) -> Option<TDn> {
        self.tx2.td
    }

    /// Is T=1 offered anywhere?
    pub fn offers_t1(&self) -> bool {
        self.first_protocol() == Protocol::T1
            || self.td2().map(|td| td.protocol) == Some(Protocol::T1)
    }
}

pub fn parse(data: &[u8]) -> Result<Atr, AtrError> {
    parse_inner(data).map_err(|_| AtrError::Truncated)
}

fn parse_inner(data: &[u8]) -> Result<Atr, nom::Err<nom::error::Error<&[u8]>>> {
    let raw = data.to_vec();
    let (data, ts) = map(be_u8, Ts::from)(data)?;
    let (data, t0) = map(be_u8, T0::from)(data)?;
    let (data, tx1) = parse_txn(data, t0.tx1)?;
    let (data, tx2) = parse_txn(data, tx1.td.map(|v| v.txn).unwrap_or_default())?;
    let (data, tx3) = parse_txn(data, tx2.td.map(|v| v.txn).unwrap_or_default())?;
    let (data, historical) = nom::bytes::complete::take(t0.k)(data)?;
    let (_, tck) = cond(!data.is_empty(), be_u8)(data)?;
    Ok(Atr {
        ts,
        t0,
        tx1,
        tx2,
        tx3,
        historical: historical.to_vec(),
        tck,
        raw,
    })
}

/// Applies the EMV Level 1 §8.3 acceptance rules. Anything off the allowed
/// profile means the card is not an EMV payment card (or is faulty) and the
/// transaction must not proceed.
pub fn validate_emv(atr: &Atr) -> Result<(), AtrError> {
    use AtrError::Rejected;

    if matches!(atr.ts, Ts::Invalid(_)) {
        return Err(Rejected("TS"));
    }
    if let Some(ta1) = atr.tx1.ta {
        if !matches!(ta1, 0x11 | 0x12 | 0x13) {
            return Err(Rejected("TA1"));
        }
    }
    if let Some(tc1) = atr.tx1.tc {
        if tc1 != 0x00 && tc1 != 0xFF {
            return Err(Rejected("TC1"));
        }
    }

    let first = atr.first_protocol();
    if !matches!(first, Protocol::T0 | Protocol::T1) {
        return Err(Rejected("TD1"));
    }

    if let Some(ta2) = atr.tx2.ta {
        // Specific mode, parameters defined by TA1, protocol matching TD1.
        if ta2 & 0x10 != 0 {
            return Err(Rejected("TA2 mode"));
        }
        if Protocol::from(ta2 & 0x0F) != first {
            return Err(Rejected("TA2 protocol"));
        }
    }
    if first == Protocol::T0 {
        if atr.tx2.tc != Some(0x0A) && atr.tx2.tc.is_some() {
            return Err(Rejected("TC2"));
        }
        // T=0 cards advertising a second protocol may only be flagging
        // global interface bytes; a genuine T=0/T=1 choice is rejected
        // rather than negotiated.
        if let Some(td2) = atr.td2() {
            if td2.protocol != Protocol::T15 {
                return Err(Rejected("TD2"));
            }
        }
    }

    let after_td2 = atr.td2().map(|td| td.protocol);
    if atr.offers_t1() {
        let Some(tb3) = atr.tx3.tb else {
            return Err(Rejected("TB3 missing"));
        };
        if tb3 & 0x0F > 5 {
            return Err(Rejected("TB3 CWI"));
        }
        if let Some(tc3) = atr.tx3.tc {
            if tc3 != 0x00 {
                return Err(Rejected("TC3"));
            }
        }
    }
    match after_td2 {
        Some(Protocol::T15) => {
            if let Some(ta3) = atr.tx3.ta {
                if !(1..=7).contains(&(ta3 >> 4)) {
                    return Err(Rejected("TA3 class"));
                }
            }
        }
        Some(Protocol::T1) => {
            if let Some(ta3) = atr.tx3.ta {
                if !(0x10..=0xFE).contains(&ta3) {
                    return Err(Rejected("TA3 IFSI"));
                }
            }
        }
        _ => {}
    }

    if atr.offers_t1() {
        if atr.tck.is_none() {
            return Err(Rejected("TCK missing"));
        }
        // TCK makes the exclusive-or of every byte after TS zero.
        let mut x = 0u8;
        for b in &atr.raw[1..] {
            x ^= b;
        }
        if x != 0 {
            return Err(AtrError::BadChecksum);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_curve() {
        // ATR from a 2018 Curve (UK, Gemalto) card.
        let atr = parse(&[
            0x3B, 0x8E, 0x80, 0x01, 0x80, 0x31, 0x80, 0x66, 0xB1, 0x84, 0x0C, 0x01, 0x6E, 0x01,
            0x83, 0x00, 0x90, 0x00, 0x1C,
        ])
        .expect("couldn't parse ATR");
        assert_eq!(atr.ts, Ts::Direct);
        assert_eq!(atr.t0, T0 { tx1: 0b1000, k: 14 });
        assert_eq!(atr.td1(), Some(TDn { protocol: Protocol::T0, txn: 0b1000 }));
        assert_eq!(atr.td2(), Some(TDn { protocol: Protocol::T1, txn: 0 }));
        assert_eq!(atr.historical.len(), 14);
        assert_eq!(atr.tck, Some(0x1C));
        assert!(atr.offers_t1());
    }

    #[test]
    fn test_curve_atr_not_emv_eligible() {
        // TD1 says T=0 but TD2 offers T=1: a protocol choice this engine
        // does not negotiate.
        let atr = parse(&[
            0x3B, 0x8E, 0x80, 0x01, 0x80, 0x31, 0x80, 0x66, 0xB1, 0x84, 0x0C, 0x01, 0x6E, 0x01,
            0x83, 0x00, 0x90, 0x00, 0x1C,
        ])
        .unwrap();
        assert_eq!(validate_emv(&atr), Err(AtrError::Rejected("TD2")));
    }

    #[test]
    fn test_parse_truncated() {
        assert_eq!(parse(&[0x3B, 0x8E, 0x80]), Err(AtrError::Truncated));
        assert_eq!(parse(&[]), Err(AtrError::Truncated));
    }

    #[test]
    fn test_valid_t0() {
        // TB1, TC1 present; five historical bytes; T=0 only, no TCK.
        let atr = parse(&[0x3B, 0x65, 0x00, 0x00, b'c', b'a', b'r', b'd', b'!']).unwrap();
        assert_eq!(atr.first_protocol(), Protocol::T0);
        assert_eq!(atr.tck, None);
        assert_eq!(validate_emv(&atr), Ok(()));
    }

    #[test]
    fn test_valid_t1() {
        // TD1 = T=1 with TB3 present; checksum correct.
        let atr = parse(&[0x3B, 0x80, 0x81, 0x21, 0x45, 0x65]).unwrap();
        assert_eq!(atr.first_protocol(), Protocol::T1);
        assert_eq!(validate_emv(&atr), Ok(()));
    }

    #[test]
    fn test_t1_checksum_mismatch() {
        let atr = parse(&[0x3B, 0x80, 0x81, 0x21, 0x45, 0x66]).unwrap();
        assert_eq!(validate_emv(&atr), Err(AtrError::BadChecksum));
    }

    #[test]
    fn test_t1_missing_tb3() {
        // T=1 without TB3: no CWI to check, rejected outright.
        let atr = parse(&[0x3B, 0x80, 0x01, 0x81]).unwrap();
        assert_eq!(validate_emv(&atr), Err(AtrError::Rejected("TB3 missing")));
    }

    #[test]
    fn test_t1_cwi_too_large() {
        // TB3 = 0x46: CWI 6 exceeds the EMV ceiling.
        let atr = parse(&[0x3B, 0x80, 0x81, 0x21, 0x46, 0x66]).unwrap();
        assert_eq!(validate_emv(&atr), Err(AtrError::Rejected("TB3 CWI")));
    }

    #[test]
    fn test_ta1_restriction() {
        // TA1 present (T0 flag 0x10) with a disallowed value.
        let atr = parse(&[0x3B, 0x10, 0x94]).unwrap();
        assert_eq!(validate_emv(&atr), Err(AtrError::Rejected("TA1")));
        let atr = parse(&[0x3B, 0x10, 0x13]).unwrap();
        assert_eq!(validate_emv(&atr), Ok(()));
    }

    #[test]
    fn test_tc2_restriction() {
        // TD1 = T=0 with TC2 present (TD1 flag 0x40) and wrong.
        let atr = parse(&[0x3B, 0x80, 0x40, 0x0B]).unwrap();
        assert_eq!(validate_emv(&atr), Err(AtrError::Rejected("TC2")));
        let atr = parse(&[0x3B, 0x80, 0x40, 0x0A]).unwrap();
        assert_eq!(validate_emv(&atr), Ok(()));
    }

    #[test]
    fn test_ta2_specific_mode() {
        // TD1 = T=0, TA2 present and asking for implicit parameters.
        let atr = parse(&[0x3B, 0x80, 0x10, 0x10]).unwrap();
        assert_eq!(validate_emv(&atr), Err(AtrError::Rejected("TA2 mode")));
        // TA2 protocol contradicting TD1.
        let atr = parse(&[0x3B, 0x80, 0x10, 0x01]).unwrap();
        assert_eq!(validate_emv(&atr), Err(AtrError::Rejected("TA2 protocol")));
        // TA2 matching TD1.
        let atr = parse(&[0x3B, 0x80, 0x10, 0x00]).unwrap();
        assert_eq!(validate_emv(&atr), Ok(()));
    }
}
