//! Data Object List (DOL) handling.
//!
//! A DOL is a flat sequence of (tag, length) pairs telling the terminal how
//! to concatenate data element values into a command payload (PDOL for GET
//! PROCESSING OPTIONS, CDOL1/2 for GENERATE AC, DDOL for INTERNAL
//! AUTHENTICATE). Entries carry no value; each is a BER tag followed by
//! exactly one length octet. See EMV Book 3, §5.4.

use crate::ber::Tag;
use crate::errors::{BerError, Error, Result};
use crate::tags::{self, Format};
use crate::tlv::TlvList;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DolEntry {
    pub tag: Tag,
    pub len: usize,
}

/// Iterator over the entries of a DOL.
pub fn iter(dol: &[u8]) -> DolIter<'_> {
    DolIter { rest: dol, done: false }
}

pub struct DolIter<'a> {
    rest: &'a [u8],
    done: bool,
}

impl<'a> Iterator for DolIter<'a> {
    type Item = Result<DolEntry, BerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.rest.is_empty() {
            self.done = true;
            return None;
        }
        // Tags in a DOL are encoded like any BER tag, but the length is a
        // single octet, without the long forms of a full TLV.
        let (tag, used) = match decode_dol_tag(self.rest) {
            Ok(v) => v,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        let Some(&len) = self.rest.get(used) else {
            self.done = true;
            return Some(Err(BerError::LengthTruncated));
        };
        self.rest = &self.rest[used + 1..];
        Some(Ok(DolEntry { tag, len: len as usize }))
    }
}

fn decode_dol_tag(input: &[u8]) -> Result<(Tag, usize), BerError> {
    let b0 = input[0];
    if b0 & 0b0001_1111 != 0b0001_1111 {
        return Ok((b0 as Tag, 1));
    }
    let mut tag = b0 as Tag;
    let mut used = 1;
    loop {
        let b = *input.get(used).ok_or(BerError::TagTruncated)?;
        if tag > 0x00FF_FFFF {
            return Err(BerError::TagTooLarge);
        }
        tag = (tag << 8) | b as Tag;
        used += 1;
        if b & 0x80 == 0 {
            return Ok((tag, used));
        }
    }
}

/// Total number of octets a DOL requests.
pub fn required_length(dol: &[u8]) -> Result<usize, BerError> {
    let mut total = 0;
    for entry in iter(dol) {
        total += entry?.len;
    }
    Ok(total)
}

/// Builds the concatenated DOL data into `out`, returning the length used.
///
/// For each entry the source lists are searched left to right and the first
/// hit wins. Absent tags are zero-filled (EMV Book 3, §5.4 step 2b). Present
/// values are fitted to the entry length: numeric terminal-sourced fields
/// keep their rightmost octets and are left-padded with zeros, everything
/// else keeps its leftmost octets and is right-padded with zeros.
///
/// Known limitation: for compressed-numeric fields that do not come from the
/// terminal, the correct fitting side is not defined here; they get the
/// default left-aligned treatment.
pub fn build(dol: &[u8], sources: &[&TlvList], out: &mut [u8]) -> Result<usize> {
    let mut off = 0;
    for entry in iter(dol) {
        let entry = entry?;
        if off + entry.len > out.len() {
            return Err(Error::BufferTooSmall);
        }
        let dst = &mut out[off..off + entry.len];
        match sources.iter().find_map(|list| list.get(entry.tag)) {
            None => dst.fill(0),
            Some(tlv) => fit(entry.tag, &tlv.value, dst),
        }
        off += entry.len;
    }
    Ok(off)
}

/// Like [`build`], but allocating a buffer of exactly the required size.
pub fn build_vec(dol: &[u8], sources: &[&TlvList]) -> Result<Vec<u8>> {
    let mut out = vec![0; required_length(dol)?];
    let n = build(dol, sources, &mut out)?;
    debug_assert_eq!(n, out.len());
    Ok(out)
}

fn fit(tag: Tag, value: &[u8], dst: &mut [u8]) {
    let right_aligned =
        tags::is_terminal_sourced(tag) && tags::format_of(tag) == Some(Format::N);
    let n = dst.len();
    if value.len() >= n {
        if right_aligned {
            dst.copy_from_slice(&value[value.len() - n..]);
        } else {
            dst.copy_from_slice(&value[..n]);
        }
    } else if right_aligned {
        let pad = n - value.len();
        dst[..pad].fill(0);
        dst[pad..].copy_from_slice(value);
    } else {
        dst[..value.len()].copy_from_slice(value);
        dst[value.len()..].fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags;

    #[test]
    fn test_iter() {
        let dol = [0x9F, 0x37, 0x04, 0x9F, 0x02, 0x06, 0x5A, 0x0A];
        let entries: Vec<_> = iter(&dol).collect::<Result<_, _>>().unwrap();
        assert_eq!(
            entries,
            vec![
                DolEntry { tag: 0x9F37, len: 4 },
                DolEntry { tag: 0x9F02, len: 6 },
                DolEntry { tag: 0x5A, len: 10 },
            ]
        );
    }

    #[test]
    fn test_iter_truncated_length() {
        let mut it = iter(&[0x9F, 0x37]);
        assert_eq!(it.next(), Some(Err(BerError::LengthTruncated)));
        assert_eq!(it.next(), None);
    }

    #[test]
    fn test_required_length() {
        let dol = [0x9F, 0x37, 0x04, 0x9F, 0x02, 0x06];
        assert_eq!(required_length(&dol).unwrap(), 10);
        assert_eq!(required_length(&[]).unwrap(), 0);
    }

    #[test]
    fn test_build_exact_fit() {
        let dol = [0x9F, 0x37, 0x04, 0x9F, 0x02, 0x06];
        let mut src = TlvList::new();
        src.put(tags::UNPREDICTABLE_NUMBER, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        src.put(tags::AMOUNT_AUTHORISED, vec![0x00, 0x00, 0x00, 0x12, 0x34, 0x56]);
        let data = build_vec(&dol, &[&src]).unwrap();
        assert_eq!(
            data,
            vec![0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x00, 0x00, 0x12, 0x34, 0x56]
        );
    }

    #[test]
    fn test_build_zero_fills_missing() {
        let dol = [0x9F, 0x37, 0x04, 0x9F, 0x02, 0x06];
        let src = TlvList::new();
        let data = build_vec(&dol, &[&src]).unwrap();
        assert_eq!(data, vec![0; 10]);
    }

    #[test]
    fn test_build_numeric_terminal_field_right_aligned() {
        // Amount over-long: keep the rightmost octets.
        let dol = [0x9F, 0x02, 0x04];
        let mut src = TlvList::new();
        src.put(tags::AMOUNT_AUTHORISED, vec![0x99, 0x00, 0x00, 0x00, 0x12, 0x34]);
        assert_eq!(build_vec(&dol, &[&src]).unwrap(), vec![0x00, 0x00, 0x12, 0x34]);

        // Amount short: left-pad with zero octets.
        let mut src = TlvList::new();
        src.put(tags::AMOUNT_AUTHORISED, vec![0x12, 0x34]);
        assert_eq!(build_vec(&dol, &[&src]).unwrap(), vec![0x00, 0x00, 0x12, 0x34]);
    }

    #[test]
    fn test_build_binary_field_left_aligned() {
        let dol = [0x9F, 0x37, 0x02];
        let mut src = TlvList::new();
        src.put(tags::UNPREDICTABLE_NUMBER, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(build_vec(&dol, &[&src]).unwrap(), vec![0xDE, 0xAD]);

        let dol = [0x9F, 0x37, 0x06];
        assert_eq!(
            build_vec(&dol, &[&src]).unwrap(),
            vec![0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x00]
        );
    }

    #[test]
    fn test_build_source_priority() {
        let dol = [0x9F, 0x37, 0x04];
        let mut first = TlvList::new();
        first.put(tags::UNPREDICTABLE_NUMBER, vec![0x11, 0x11, 0x11, 0x11]);
        let mut second = TlvList::new();
        second.put(tags::UNPREDICTABLE_NUMBER, vec![0x22, 0x22, 0x22, 0x22]);
        assert_eq!(
            build_vec(&dol, &[&first, &second]).unwrap(),
            vec![0x11, 0x11, 0x11, 0x11]
        );
    }

    #[test]
    fn test_build_buffer_too_small() {
        let dol = [0x9F, 0x37, 0x04];
        let src = TlvList::new();
        let mut out = [0u8; 3];
        assert!(matches!(build(&dol, &[&src], &mut out), Err(Error::BufferTooSmall)));
    }
}
