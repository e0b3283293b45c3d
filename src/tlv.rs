//! Owned TLV fields and lists.
//!
//! Parsing borrows from the wire buffer ([`crate::ber::TlvView`]); anything
//! that outlives the buffer is copied into an owned [`Tlv`] first. The
//! crossing is explicit: [`Tlv::from_view`] is the only way over.
//!
//! A [`TlvList`] is the working set of an EMV terminal: insertion-ordered,
//! duplicate-friendly, searched front to back. It never owns the buffer its
//! values were copied from.

use crate::ber::{self, Tag, TlvView};
use crate::errors::BerError;

/// An owned TLV field. `flags` carries the EMV-specific extension byte (the
/// Application Selection Indicator for terminal AID entries, zero otherwise);
/// the BER class and constructed bits live in the tag itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub tag: Tag,
    pub value: Vec<u8>,
    pub flags: u8,
}

impl Tlv {
    pub fn new<V: Into<Vec<u8>>>(tag: Tag, value: V) -> Self {
        Self { tag, value: value.into(), flags: 0 }
    }

    pub fn with_flags<V: Into<Vec<u8>>>(tag: Tag, value: V, flags: u8) -> Self {
        Self { tag, value: value.into(), flags }
    }

    /// Copies a borrowed view into an owned field.
    pub fn from_view(view: &TlvView<'_>) -> Self {
        Self::new(view.tag, view.value)
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn is_constructed(&self) -> bool {
        ber::is_constructed(self.tag)
    }

    pub fn class(&self) -> ber::Class {
        ber::class(self.tag)
    }
}

/// An insertion-ordered sequence of owned TLVs. Duplicates are allowed;
/// lookup returns the first match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlvList {
    entries: Vec<Tlv>,
}

impl TlvList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn push(&mut self, tlv: Tlv) {
        self.entries.push(tlv);
    }

    /// Convenience: push a freshly built entry.
    pub fn put<V: Into<Vec<u8>>>(&mut self, tag: Tag, value: V) {
        self.push(Tlv::new(tag, value));
    }

    /// Replaces the first entry with this tag, or appends one.
    pub fn set<V: Into<Vec<u8>>>(&mut self, tag: Tag, value: V) {
        match self.entries.iter_mut().find(|t| t.tag == tag) {
            Some(t) => t.value = value.into(),
            None => self.put(tag, value),
        }
    }

    pub fn pop_front(&mut self) -> Option<Tlv> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    /// First entry with this tag, front to back.
    pub fn get(&self, tag: Tag) -> Option<&Tlv> {
        self.entries.iter().find(|t| t.tag == tag)
    }

    pub fn get_value(&self, tag: Tag) -> Option<&[u8]> {
        self.get(tag).map(|t| t.value.as_slice())
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.get(tag).is_some()
    }

    /// Moves every entry of `other` to the back of this list.
    pub fn append(&mut self, other: &mut TlvList) {
        self.entries.append(&mut other.entries);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tlv> {
        self.entries.iter()
    }

    /// Serializes every entry back to wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for t in &self.entries {
            ber::encode_one(&mut out, t.tag, &t.value);
        }
        out
    }
}

impl<'l> IntoIterator for &'l TlvList {
    type Item = &'l Tlv;
    type IntoIter = std::slice::Iter<'l, Tlv>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl FromIterator<Tlv> for TlvList {
    fn from_iter<I: IntoIterator<Item = Tlv>>(iter: I) -> Self {
        Self { entries: iter.into_iter().collect() }
    }
}

/// Recursively parses wire data into `list`, unwrapping constructed
/// templates: only primitive fields are appended, in document order, each
/// with its value copied. On a malformed object the entries parsed so far
/// are left in the list for inspection and the error is returned.
pub fn parse_all(list: &mut TlvList, data: &[u8]) -> Result<(), BerError> {
    for item in ber::iter(data) {
        let view = item?;
        if view.is_constructed() {
            parse_all(list, view.value)?;
        } else {
            list.push(Tlv::from_view(&view));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_unwraps_templates() {
        // 70 [ 5A(5) 47 61 73 90 01 ]
        let rec = [0x70, 0x07, 0x5A, 0x05, 0x47, 0x61, 0x73, 0x90, 0x01];
        let mut list = TlvList::new();
        parse_all(&mut list, &rec).unwrap();
        assert_eq!(list.len(), 1);
        let pan = list.get(0x5A).unwrap();
        assert_eq!(pan.value, &[0x47, 0x61, 0x73, 0x90, 0x01]);
    }

    #[test]
    fn test_parse_all_nested() {
        let fci = [
            0x6F, 0x1E, 0x84, 0x0E, 0x31, 0x50, 0x41, 0x59, 0x2E, 0x53, 0x59, 0x53, 0x2E, 0x44,
            0x44, 0x46, 0x30, 0x31, 0xA5, 0x0C, 0x88, 0x01, 0x01, 0x5F, 0x2D, 0x02, 0x65, 0x6E,
            0x9F, 0x11, 0x01, 0x01,
        ];
        let mut list = TlvList::new();
        parse_all(&mut list, &fci).unwrap();
        let tags: Vec<_> = list.iter().map(|t| t.tag).collect();
        // Template tags 6F and A5 are unwrapped; children keep document order.
        assert_eq!(tags, vec![0x84, 0x88, 0x5F2D, 0x9F11]);
    }

    #[test]
    fn test_parse_all_keeps_partial_list_on_error() {
        let data = [0x5A, 0x02, 0x12, 0x34, 0x5F]; // trailing truncated tag
        let mut list = TlvList::new();
        let err = parse_all(&mut list, &data).unwrap_err();
        assert_eq!(err, BerError::TagTruncated);
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(0x5A).unwrap().value, &[0x12, 0x34]);
    }

    #[test]
    fn test_list_duplicates_and_order() {
        let mut list = TlvList::new();
        list.put(0x9F37, vec![0x01]);
        list.put(0x5A, vec![0x02]);
        list.put(0x9F37, vec![0x03]);
        assert_eq!(list.len(), 3);
        // Lookup finds the first occurrence.
        assert_eq!(list.get(0x9F37).unwrap().value, &[0x01]);
        assert_eq!(list.pop_front().unwrap().tag, 0x9F37);
        assert_eq!(list.pop_front().unwrap().tag, 0x5A);
    }

    #[test]
    fn test_list_append_splices() {
        let mut a = TlvList::new();
        a.put(0x5A, vec![0x01]);
        let mut b = TlvList::new();
        b.put(0x57, vec![0x02]);
        b.put(0x5F34, vec![0x03]);
        a.append(&mut b);
        assert_eq!(a.len(), 3);
        assert!(b.is_empty());
        assert_eq!(a.iter().map(|t| t.tag).collect::<Vec<_>>(), vec![0x5A, 0x57, 0x5F34]);
    }

    #[test]
    fn test_set_replaces_first() {
        let mut list = TlvList::new();
        list.put(0x95, vec![0; 5]);
        list.set(0x95, vec![0x80, 0, 0, 0, 0]);
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(0x95).unwrap().value, &[0x80, 0, 0, 0, 0]);
    }

    #[test]
    fn test_encode_round_trip() {
        let mut list = TlvList::new();
        list.put(0x5A, vec![0x12, 0x34]);
        list.put(0x9F37, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        let wire = list.encode();
        let mut back = TlvList::new();
        parse_all(&mut back, &wire).unwrap();
        assert_eq!(list, back);
    }
}
