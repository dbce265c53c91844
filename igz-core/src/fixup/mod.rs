//! Fixup tables: the typed side-tables that describe which bytes of the
//! object region are references rather than inert scalars.
//!
//! Nine kinds exist, grouped into four encoding families. Each table owns
//! both its raw encoded record (kept verbatim for byte-exact re-save) and
//! its decoded logical values; `update` re-derives the former from the
//! latter.

use std::fmt;

use enum_map::{Enum, EnumMap};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use strum::{EnumIter, IntoEnumIterator};

use crate::cursor::ByteWriter;
use crate::error::{Error, Result};

pub mod delta;

/// Record header: tag, item count, total size, header size.
pub const RECORD_HEADER_SIZE: usize = 16;
pub const RECORD_ALIGN: usize = 16;

/// Bit 31 of an EXNM entry's second word: set for handles into this file,
/// clear for references into another file.
pub const EXNM_HANDLE_BIT: u32 = 1 << 31;

/// The closed set of fixup kinds, in canonical on-disk order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Enum, EnumIter, Serialize, Deserialize,
)]
pub enum FixupKind {
    /// Dependency (name, path) string pairs.
    Tdep,
    /// The string table. Written even when empty.
    Tstr,
    /// The type table: one string-table index per object type.
    Tmet,
    /// External ids: raw (file hash, object hash) pairs.
    Exid,
    /// Named externals and handles: (name hash, namespace) pairs.
    Exnm,
    /// Object start offsets within the object chunk.
    Rvtb,
    /// Offsets of live string-index cells.
    Rstt,
    /// Offsets of live object-pointer cells.
    Rofs,
    /// Offsets of live handle cells.
    Rhnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupFamily {
    Strings { paired: bool },
    Ints,
    IntPairs,
    Offsets,
}

impl FixupKind {
    pub fn tag(self) -> [u8; 4] {
        match self {
            FixupKind::Tdep => *b"TDEP",
            FixupKind::Tstr => *b"TSTR",
            FixupKind::Tmet => *b"TMET",
            FixupKind::Exid => *b"EXID",
            FixupKind::Exnm => *b"EXNM",
            FixupKind::Rvtb => *b"RVTB",
            FixupKind::Rstt => *b"RSTT",
            FixupKind::Rofs => *b"ROFS",
            FixupKind::Rhnd => *b"RHND",
        }
    }

    pub fn from_tag(tag: [u8; 4]) -> Option<Self> {
        Self::iter().find(|k| k.tag() == tag)
    }

    pub fn family(self) -> FixupFamily {
        match self {
            FixupKind::Tdep => FixupFamily::Strings { paired: true },
            FixupKind::Tstr => FixupFamily::Strings { paired: false },
            FixupKind::Tmet => FixupFamily::Ints,
            FixupKind::Exid | FixupKind::Exnm => FixupFamily::IntPairs,
            FixupKind::Rvtb | FixupKind::Rstt | FixupKind::Rofs | FixupKind::Rhnd => {
                FixupFamily::Offsets
            }
        }
    }

    /// The loader cannot make sense of a file without these.
    pub fn is_mandatory(self) -> bool {
        matches!(self, FixupKind::Tmet | FixupKind::Rvtb)
    }

    /// Kinds whose offsets mark per-object reference slots.
    pub fn is_slot_kind(self) -> bool {
        matches!(self, FixupKind::Rstt | FixupKind::Rofs | FixupKind::Rhnd)
    }
}

impl fmt::Display for FixupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = self.tag();
        write!(f, "{}", String::from_utf8_lossy(&tag))
    }
}

/// Decoded logical values of one table.
#[derive(Debug, Clone, PartialEq)]
pub enum FixupData {
    Strings(Vec<String>),
    StringPairs(Vec<(String, String)>),
    Ints(Vec<u32>),
    IntPairs(Vec<(u32, u32)>),
    Offsets(Vec<u32>),
}

impl FixupData {
    pub fn len(&self) -> usize {
        match self {
            FixupData::Strings(v) => v.len(),
            FixupData::StringPairs(v) => v.len(),
            FixupData::Ints(v) => v.len(),
            FixupData::IntPairs(v) => v.len(),
            FixupData::Offsets(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn family(&self) -> FixupFamily {
        match self {
            FixupData::Strings(_) => FixupFamily::Strings { paired: false },
            FixupData::StringPairs(_) => FixupFamily::Strings { paired: true },
            FixupData::Ints(_) => FixupFamily::Ints,
            FixupData::IntPairs(_) => FixupFamily::IntPairs,
            FixupData::Offsets(_) => FixupFamily::Offsets,
        }
    }

    fn empty_for(family: FixupFamily) -> Self {
        match family {
            FixupFamily::Strings { paired: false } => FixupData::Strings(Vec::new()),
            FixupFamily::Strings { paired: true } => FixupData::StringPairs(Vec::new()),
            FixupFamily::Ints => FixupData::Ints(Vec::new()),
            FixupFamily::IntPairs => FixupData::IntPairs(Vec::new()),
            FixupFamily::Offsets => FixupData::Offsets(Vec::new()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FixupTable {
    kind: FixupKind,
    item_count: u32,
    /// Bytes between the fixed record header and `header_size`, preserved
    /// verbatim across re-encodes.
    header_extra: Vec<u8>,
    /// The full encoded record, 16-byte padded.
    raw: Vec<u8>,
    data: FixupData,
}

impl FixupTable {
    pub fn empty(kind: FixupKind) -> Self {
        let mut table = Self {
            kind,
            item_count: 0,
            header_extra: Vec::new(),
            raw: Vec::new(),
            data: FixupData::empty_for(kind.family()),
        };
        // encoding an empty table cannot fail
        table.reencode().expect("empty fixup table encode");
        table
    }

    pub fn from_record(
        kind: FixupKind,
        item_count: u32,
        header_extra: Vec<u8>,
        payload: &[u8],
        raw: Vec<u8>,
    ) -> Result<Self> {
        let data = decode_payload(kind.family(), payload, item_count as usize)?;
        Ok(Self {
            kind,
            item_count,
            header_extra,
            raw,
            data,
        })
    }

    pub fn kind(&self) -> FixupKind {
        self.kind
    }

    pub fn item_count(&self) -> u32 {
        self.item_count
    }

    pub fn data(&self) -> &FixupData {
        &self.data
    }

    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn byte_size(&self) -> u32 {
        self.raw.len() as u32
    }

    /// Whether this table is written on serialize. The string table is
    /// always emitted; every other kind only when it has items.
    pub fn is_active(&self) -> bool {
        matches!(self.kind, FixupKind::Tstr) || self.item_count > 0
    }

    /// Replaces the logical values and fully re-derives the encoded record.
    /// Offset sets are sorted and deduplicated first.
    pub fn update(&mut self, data: FixupData) -> Result<()> {
        if data.family() != self.kind.family() {
            return Err(Error::FixupDataMismatch(self.kind));
        }
        self.data = data;
        if let FixupData::Offsets(v) = &mut self.data {
            v.sort_unstable();
            v.dedup();
        }
        self.item_count = self.data.len() as u32;
        self.reencode()
    }

    fn reencode(&mut self) -> Result<()> {
        let payload = encode_payload(&self.data)?;
        let header_size = RECORD_HEADER_SIZE + self.header_extra.len();
        let mut w = ByteWriter::with_capacity(header_size + payload.len() + RECORD_ALIGN);
        w.write_bytes(&self.kind.tag());
        w.write_u32(self.item_count);
        // total size patched below, once padding is known
        w.write_u32(0);
        w.write_u32(header_size as u32);
        w.write_bytes(&self.header_extra);
        w.write_bytes(&payload);
        w.pad_to(RECORD_ALIGN);
        let total = w.len() as u32;
        w.patch_u32(8, total)?;
        self.raw = w.into_inner();
        Ok(())
    }
}

fn encode_payload(data: &FixupData) -> Result<Vec<u8>> {
    let mut w = ByteWriter::new();
    match data {
        FixupData::Strings(v) => {
            for s in v {
                write_fixup_string(&mut w, s);
            }
        }
        FixupData::StringPairs(v) => {
            for (a, b) in v {
                write_fixup_string(&mut w, a);
                write_fixup_string(&mut w, b);
            }
        }
        FixupData::Ints(v) => {
            for &i in v {
                w.write_u32(i);
            }
        }
        FixupData::IntPairs(v) => {
            for &(a, b) in v {
                w.write_u32(a);
                w.write_u32(b);
            }
        }
        FixupData::Offsets(v) => {
            w.write_bytes(&delta::encode(v)?);
        }
    }
    Ok(w.into_inner())
}

/// NUL-terminated; strings of even length get one extra padding NUL so
/// every entry spans an even number of bytes.
fn write_fixup_string(w: &mut ByteWriter, s: &str) {
    w.write_bytes(s.as_bytes());
    w.write_u8(0);
    if s.len() % 2 == 0 {
        w.write_u8(0);
    }
}

fn read_fixup_strings(payload: &[u8], count: usize) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(count);
    let mut pos = 0usize;
    for _ in 0..count {
        let rest = &payload[pos.min(payload.len())..];
        let nul = rest.iter().position(|&b| b == 0).ok_or(Error::Truncated {
            offset: pos,
            wanted: 1,
            len: payload.len(),
        })?;
        let s = String::from_utf8_lossy(&rest[..nul]).into_owned();
        pos += nul + 1;
        if s.len() % 2 == 0 {
            if pos + 1 > payload.len() {
                return Err(Error::Truncated {
                    offset: pos,
                    wanted: 1,
                    len: payload.len(),
                });
            }
            pos += 1;
        }
        out.push(s);
    }
    Ok(out)
}

fn decode_payload(family: FixupFamily, payload: &[u8], count: usize) -> Result<FixupData> {
    match family {
        FixupFamily::Strings { paired: false } => {
            Ok(FixupData::Strings(read_fixup_strings(payload, count)?))
        }
        FixupFamily::Strings { paired: true } => {
            let flat = read_fixup_strings(payload, count * 2)?;
            Ok(FixupData::StringPairs(flat.into_iter().tuples().collect()))
        }
        FixupFamily::Ints => {
            let mut r = crate::cursor::ByteReader::new(payload);
            let mut v = Vec::with_capacity(count);
            for _ in 0..count {
                v.push(r.read_u32()?);
            }
            Ok(FixupData::Ints(v))
        }
        FixupFamily::IntPairs => {
            let mut r = crate::cursor::ByteReader::new(payload);
            let mut v = Vec::with_capacity(count);
            for _ in 0..count {
                let a = r.read_u32()?;
                let b = r.read_u32()?;
                v.push((a, b));
            }
            Ok(FixupData::IntPairs(v))
        }
        FixupFamily::Offsets => Ok(FixupData::Offsets(delta::decode(payload, count)?)),
    }
}

/// The container's full set of fixup tables, one slot per kind.
#[derive(Debug, Clone, Default)]
pub struct FixupSet {
    tables: EnumMap<FixupKind, Option<FixupTable>>,
}

impl FixupSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: FixupKind) -> Option<&FixupTable> {
        self.tables[kind].as_ref()
    }

    pub fn insert(&mut self, table: FixupTable) {
        let kind = table.kind();
        self.tables[kind] = Some(table);
    }

    pub fn ensure(&mut self, kind: FixupKind) -> &mut FixupTable {
        self.tables[kind].get_or_insert_with(|| FixupTable::empty(kind))
    }

    pub fn update(&mut self, kind: FixupKind, data: FixupData) -> Result<()> {
        self.ensure(kind).update(data)
    }

    /// Active tables in canonical write order.
    pub fn active(&self) -> impl Iterator<Item = &FixupTable> + '_ {
        FixupKind::iter().filter_map(move |k| self.tables[k].as_ref().filter(|t| t.is_active()))
    }

    pub fn total_active_size(&self) -> u32 {
        self.active().map(FixupTable::byte_size).sum()
    }

    pub fn offsets(&self, kind: FixupKind) -> &[u32] {
        match self.get(kind).map(FixupTable::data) {
            Some(FixupData::Offsets(v)) => v,
            _ => &[],
        }
    }

    pub fn contains_offset(&self, kind: FixupKind, offset: u32) -> bool {
        self.offsets(kind).binary_search(&offset).is_ok()
    }

    pub fn ints(&self, kind: FixupKind) -> &[u32] {
        match self.get(kind).map(FixupTable::data) {
            Some(FixupData::Ints(v)) => v,
            _ => &[],
        }
    }

    pub fn int_pairs(&self, kind: FixupKind) -> &[(u32, u32)] {
        match self.get(kind).map(FixupTable::data) {
            Some(FixupData::IntPairs(v)) => v,
            _ => &[],
        }
    }

    pub fn strings(&self) -> &[String] {
        match self.get(FixupKind::Tstr).map(FixupTable::data) {
            Some(FixupData::Strings(v)) => v,
            _ => &[],
        }
    }

    pub fn string_pairs(&self) -> &[(String, String)] {
        match self.get(FixupKind::Tdep).map(FixupTable::data) {
            Some(FixupData::StringPairs(v)) => v,
            _ => &[],
        }
    }

    pub fn string_at(&self, index: u32) -> Result<&str> {
        self.strings()
            .get(index as usize)
            .map(String::as_str)
            .ok_or(Error::BadStringIndex(index))
    }

    pub fn find_string(&self, s: &str) -> Option<u32> {
        self.strings().iter().position(|x| x == s).map(|i| i as u32)
    }

    /// Index of `s` in the string table, appending it if absent.
    pub fn add_string(&mut self, s: &str) -> Result<u32> {
        if let Some(i) = self.find_string(s) {
            return Ok(i);
        }
        let mut strings = self.strings().to_vec();
        strings.push(s.to_owned());
        let index = strings.len() as u32 - 1;
        self.update(FixupKind::Tstr, FixupData::Strings(strings))?;
        Ok(index)
    }

    /// Rewrites one string table entry in place, keeping its index.
    pub fn set_string(&mut self, index: u32, s: &str) -> Result<()> {
        let mut strings = self.strings().to_vec();
        let slot = strings
            .get_mut(index as usize)
            .ok_or(Error::BadStringIndex(index))?;
        *slot = s.to_owned();
        self.update(FixupKind::Tstr, FixupData::Strings(strings))
    }

    /// Index of `pair` in an int-pair table, appending it if absent.
    pub fn add_int_pair(&mut self, kind: FixupKind, pair: (u32, u32)) -> Result<u32> {
        let pairs = self.int_pairs(kind);
        if let Some(i) = pairs.iter().position(|&p| p == pair) {
            return Ok(i as u32);
        }
        let mut pairs = pairs.to_vec();
        pairs.push(pair);
        let index = pairs.len() as u32 - 1;
        self.update(kind, FixupData::IntPairs(pairs))?;
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn string_padding_rule() {
        // "ab" has even length: terminator plus one pad NUL
        let mut w = ByteWriter::new();
        write_fixup_string(&mut w, "ab");
        write_fixup_string(&mut w, "abc");
        assert_eq!(w.as_slice(), b"ab\0\0abc\0");
        let back = read_fixup_strings(w.as_slice(), 2).unwrap();
        assert_eq!(back, vec!["ab".to_string(), "abc".to_string()]);
    }

    #[test]
    fn record_roundtrip_all_families() {
        let cases = vec![
            (
                FixupKind::Tstr,
                FixupData::Strings(vec!["alpha".into(), "be".into()]),
            ),
            (
                FixupKind::Tdep,
                FixupData::StringPairs(vec![("dep".into(), "path/file".into())]),
            ),
            (FixupKind::Tmet, FixupData::Ints(vec![0, 3, 5])),
            (
                FixupKind::Exnm,
                FixupData::IntPairs(vec![(0xBEEF, EXNM_HANDLE_BIT | 1)]),
            ),
            (FixupKind::Rofs, FixupData::Offsets(vec![16, 4, 64])),
        ];
        for (kind, data) in cases {
            let mut table = FixupTable::empty(kind);
            table.update(data.clone()).unwrap();
            let raw = table.raw_bytes().to_vec();
            assert_eq!(raw.len() % RECORD_ALIGN, 0);
            assert_eq!(&raw[0..4], &kind.tag());

            let count = u32::from_le_bytes(raw[4..8].try_into().unwrap());
            let total = u32::from_le_bytes(raw[8..12].try_into().unwrap()) as usize;
            let hsize = u32::from_le_bytes(raw[12..16].try_into().unwrap()) as usize;
            assert_eq!(total, raw.len());
            let back = FixupTable::from_record(
                kind,
                count,
                raw[RECORD_HEADER_SIZE..hsize].to_vec(),
                &raw[hsize..total],
                raw.clone(),
            )
            .unwrap();
            if let FixupData::Offsets(mut v) = data {
                v.sort_unstable();
                assert_eq!(back.data(), &FixupData::Offsets(v));
            } else {
                assert_eq!(back.data(), &data);
            }
        }
    }

    #[test]
    fn activity_rules() {
        assert!(FixupTable::empty(FixupKind::Tstr).is_active());
        assert!(!FixupTable::empty(FixupKind::Rofs).is_active());
        let mut t = FixupTable::empty(FixupKind::Rofs);
        t.update(FixupData::Offsets(vec![8])).unwrap();
        assert!(t.is_active());
    }

    #[test]
    fn update_rejects_wrong_family() {
        let mut t = FixupTable::empty(FixupKind::Tmet);
        assert!(matches!(
            t.update(FixupData::Offsets(vec![4])),
            Err(Error::FixupDataMismatch(FixupKind::Tmet))
        ));
    }

    #[test]
    fn set_helpers() {
        let mut set = FixupSet::new();
        let a = set.add_string("Widget").unwrap();
        let b = set.add_string("Blob").unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(set.add_string("Widget").unwrap(), 0);
        set.set_string(1, "Brick").unwrap();
        assert_eq!(set.string_at(1).unwrap(), "Brick");
        assert!(set.string_at(9).is_err());

        set.update(FixupKind::Rofs, FixupData::Offsets(vec![24, 8]))
            .unwrap();
        assert!(set.contains_offset(FixupKind::Rofs, 8));
        assert!(!set.contains_offset(FixupKind::Rofs, 12));
    }
}
