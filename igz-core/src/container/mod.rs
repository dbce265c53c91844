//! The container itself: owns the chunk table, the fixup tables and the
//! object arena, and orchestrates parse, graph derivation, mutation and
//! re-serialization.
//!
//! Lifecycle: parse -> derive_graph -> (mutate -> relayout -> derive_graph)*
//! -> serialize. Mutations leave a pending-relayout mark that serialize
//! refuses to ignore.

mod edit;
mod layout;

pub use edit::{ForeignResolver, MemoryBlock, NoForeignResolver};

use std::sync::Arc;

use crate::chunk::{ChunkInfo, ChunkTable, INTRA_CHUNK_MASK, MAX_CHUNKS, OBJECT_CHUNK};
use crate::cursor::{write_u32_at, ByteReader};
use crate::error::{Error, Result};
use crate::fixup::{FixupKind, FixupSet, FixupTable, RECORD_HEADER_SIZE};
use crate::graph::{Edge, ObjectGraph};
use crate::hash::name_hash;
use crate::meta::TypeMetadata;
use crate::object::{ObjectId, ObjectStatus, TypedObject, INTRINSIC_HEADER_SIZE};

pub const MAGIC: u32 = 0x015A_4749; // "IGZ\x01"
pub const VERSION: u32 = 10;
pub const TRAILER_MAGIC: [u8; 4] = *b"IGTL";
pub const OBJECT_ALIGN: u32 = 16;

pub const OBJECT_LIST_TYPE: &str = "igObjectList";
pub const NAME_LIST_TYPE: &str = "igNameList";

/// List objects: u32 entry count after the intrinsic header, entries from 16.
pub(crate) const LIST_COUNT_OFFSET: u32 = 8;
pub(crate) const LIST_ENTRIES_OFFSET: u32 = 16;

const CHUNK_TABLE_OFFSET: usize = 0x10;
const CHUNK_ENTRY_SIZE: usize = 16;

/// Container-level trailer state; per-object bits live on the objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailerInfo {
    pub file_kind: u32,
}

pub struct Igz {
    version: u32,
    /// Raw header bytes up to the first chunk, re-emitted with patched
    /// chunk offsets/sizes.
    header: Vec<u8>,
    chunks: ChunkTable,
    fixups: FixupSet,
    objects: Vec<Option<TypedObject>>,
    /// Object-chunk bytes before the first object, preserved verbatim.
    object_prefix: Vec<u8>,
    /// Bytes after the last fixup record in chunk 0; dropped by relayout.
    fixup_slack: Vec<u8>,
    trailer: Option<TrailerInfo>,
    metadata: Arc<dyn TypeMetadata>,
    graph: Option<ObjectGraph>,
    pending_relayout: bool,
}

impl Igz {
    pub fn parse(bytes: &[u8], metadata: Arc<dyn TypeMetadata>) -> Result<Self> {
        let mut r = ByteReader::new(bytes);
        let magic = r.read_u32()?;
        if magic != MAGIC {
            return Err(Error::BadSignature {
                found: magic,
                expected: MAGIC,
            });
        }
        let version = r.read_u32()?;
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let chunks = parse_chunk_table(bytes)?;
        let c0 = *chunks.get(0)?;
        let c1 = *chunks.get(1)?;
        check_range(bytes, c0.offset, c0.size)?;
        check_range(bytes, c1.offset, c1.size)?;

        let header = bytes[..c0.offset as usize].to_vec();

        let (fixups, fixup_slack) =
            parse_fixups(&bytes[c0.offset as usize..(c0.offset + c0.size) as usize])?;
        for kind in [FixupKind::Tmet, FixupKind::Rvtb] {
            if fixups.get(kind).is_none() {
                return Err(Error::MissingFixup(kind));
            }
        }
        if fixups.get(FixupKind::Tstr).is_none() {
            log::warn!("container carries no string table");
        }

        let object_region = &bytes[c1.offset as usize..(c1.offset + c1.size) as usize];
        let (mut objects, object_prefix) = slice_objects(&fixups, object_region, c1.size)?;

        let index = build_index(&objects);
        assign_live_slots(&mut objects, &fixups, &index);
        resolve_names(&mut objects, &fixups, &index);

        let trailer = parse_trailer(bytes, &chunks, &mut objects)?;

        Ok(Self {
            version,
            header,
            chunks,
            fixups,
            objects,
            object_prefix,
            fixup_slack,
            trailer,
            metadata,
            graph: None,
            pending_relayout: false,
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        if self.pending_relayout {
            return Err(Error::PendingRelayout);
        }
        for (_, obj) in self.live() {
            if obj.relative_offset % OBJECT_ALIGN != 0 {
                return Err(Error::UnalignedObject {
                    id: obj.id,
                    offset: obj.relative_offset,
                });
            }
        }

        let c0 = *self.chunks.get(0)?;
        let c1 = *self.chunks.get(1)?;

        let mut out = self.header.clone();
        for (i, c) in self.chunks.iter().enumerate() {
            let base = CHUNK_TABLE_OFFSET + i * CHUNK_ENTRY_SIZE;
            write_u32_at(&mut out, base + 8, c.offset)?;
            write_u32_at(&mut out, base + 12, c.size)?;
        }
        debug_assert_eq!(out.len(), c0.offset as usize);

        let mut emitted = 0u32;
        for table in self.fixups.active() {
            out.extend_from_slice(table.raw_bytes());
            emitted += table.byte_size();
        }
        out.extend_from_slice(&self.fixup_slack);
        emitted += self.fixup_slack.len() as u32;
        if emitted != c0.size {
            return Err(Error::ChunkSizeMismatch {
                chunk: 0,
                expected: c0.size,
                actual: emitted,
            });
        }

        let mut region = vec![0u8; c1.size as usize];
        if self.object_prefix.len() > region.len() {
            return Err(Error::ChunkSizeMismatch {
                chunk: 1,
                expected: c1.size,
                actual: self.object_prefix.len() as u32,
            });
        }
        region[..self.object_prefix.len()].copy_from_slice(&self.object_prefix);
        for (_, obj) in self.live() {
            let start = obj.relative_offset as usize;
            let end = start + obj.data.len();
            if end > region.len() {
                return Err(Error::ChunkSizeMismatch {
                    chunk: 1,
                    expected: c1.size,
                    actual: end as u32,
                });
            }
            region[start..end].copy_from_slice(&obj.data);
        }
        out.extend_from_slice(&region);

        if let Some(trailer) = &self.trailer {
            out.extend_from_slice(&TRAILER_MAGIC);
            let ordered = self.sorted_ids();
            for &id in &ordered {
                out.push(self.objects[id.0].as_ref().map(|o| o.status.bits()).unwrap_or(0));
            }
            for &id in &ordered {
                let obj = self.objects[id.0].as_ref();
                if let Some(obj) = obj {
                    if obj.status.contains(ObjectStatus::HAS_NAME_HASH) {
                        out.extend_from_slice(
                            &obj.original_name_hash.unwrap_or(0).to_le_bytes(),
                        );
                    }
                }
            }
            out.extend_from_slice(&trailer.file_kind.to_le_bytes());
        }

        Ok(out)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn chunks(&self) -> &ChunkTable {
        &self.chunks
    }

    pub(crate) fn chunks_mut(&mut self) -> &mut ChunkTable {
        &mut self.chunks
    }

    pub fn fixups(&self) -> &FixupSet {
        &self.fixups
    }

    pub(crate) fn fixups_mut(&mut self) -> &mut FixupSet {
        &mut self.fixups
    }

    pub fn metadata(&self) -> &Arc<dyn TypeMetadata> {
        &self.metadata
    }

    pub fn trailer(&self) -> Option<TrailerInfo> {
        self.trailer
    }

    pub fn needs_relayout(&self) -> bool {
        self.pending_relayout
    }

    pub fn is_graph_derived(&self) -> bool {
        self.graph.is_some()
    }

    pub fn object(&self, id: ObjectId) -> Result<&TypedObject> {
        self.objects
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(Error::DeadObject(id))
    }

    pub(crate) fn object_mut(&mut self, id: ObjectId) -> Result<&mut TypedObject> {
        self.objects
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(Error::DeadObject(id))
    }

    pub fn objects(&self) -> impl Iterator<Item = &TypedObject> {
        self.objects.iter().flatten()
    }

    pub(crate) fn live(&self) -> impl Iterator<Item = (ObjectId, &TypedObject)> {
        self.objects
            .iter()
            .enumerate()
            .filter_map(|(i, o)| o.as_ref().map(|o| (ObjectId(i), o)))
    }

    pub fn object_count(&self) -> usize {
        self.objects.iter().flatten().count()
    }

    /// Live object ids ordered by offset within the object chunk.
    pub fn sorted_ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self.live().map(|(id, _)| id).collect();
        ids.sort_by_key(|id| self.objects[id.0].as_ref().map(|o| o.relative_offset));
        ids
    }

    pub fn find_by_name(&self, name: &str) -> Option<ObjectId> {
        self.live()
            .find(|(_, o)| o.name.as_deref() == Some(name))
            .map(|(id, _)| id)
    }

    pub fn find_by_name_hash(&self, hash: u32) -> Option<ObjectId> {
        self.live()
            .find(|(_, o)| o.name.as_deref().map(name_hash) == Some(hash))
            .map(|(id, _)| id)
    }

    pub fn find_by_type(&self, type_name: &str) -> Option<ObjectId> {
        self.live()
            .find(|(_, o)| o.type_name == type_name)
            .map(|(id, _)| id)
    }

    /// The object covering an absolute file offset, by binary search over
    /// the offset-sorted arena. The iteration count is bounded; on a bound
    /// overrun the search degrades to a linear scan with a diagnostic
    /// instead of a silently wrong answer.
    pub fn object_at_absolute(&self, absolute: u32) -> Result<ObjectId> {
        let base = self.chunks.base(OBJECT_CHUNK)?;
        let rel = absolute
            .checked_sub(base)
            .ok_or(Error::NoObjectAt(absolute))?;
        let index = self.index();
        if index.is_empty() {
            return Err(Error::NoObjectAt(absolute));
        }
        let bound = (usize::BITS - index.len().leading_zeros()) as usize + 1;
        let mut lo = 0usize;
        let mut hi = index.len();
        let mut iterations = 0usize;
        while lo < hi {
            iterations += 1;
            if iterations > bound {
                log::warn!(
                    "object search exceeded {} iterations at offset {:#x}, using linear scan",
                    bound,
                    absolute
                );
                return index
                    .iter()
                    .find(|&&(start, size, _)| rel >= start && rel < start + size)
                    .map(|&(_, _, id)| id)
                    .ok_or(Error::NoObjectAt(absolute));
            }
            let mid = (lo + hi) / 2;
            let (start, size, id) = index[mid];
            if rel < start {
                hi = mid;
            } else if rel >= start + size {
                lo = mid + 1;
            } else {
                return Ok(id);
            }
        }
        Err(Error::NoObjectAt(absolute))
    }

    pub fn graph(&self) -> Result<&ObjectGraph> {
        self.graph.as_ref().ok_or(Error::StaleGraph)
    }

    pub(crate) fn set_graph(&mut self, graph: Option<ObjectGraph>) {
        self.graph = graph;
    }

    pub fn children_of(&self, id: ObjectId) -> Result<&[Edge]> {
        self.object(id)?;
        Ok(self.graph()?.children_of(id))
    }

    /// Referring objects, with multiplicity.
    pub fn references_of(&self, id: ObjectId) -> Result<&[ObjectId]> {
        self.object(id)?;
        Ok(self.graph()?.parents_of(id))
    }

    pub(crate) fn mark_pending(&mut self) {
        self.pending_relayout = true;
        self.graph = None;
    }

    pub(crate) fn clear_pending(&mut self) {
        self.pending_relayout = false;
    }

    pub(crate) fn fixup_slack_mut(&mut self) -> &mut Vec<u8> {
        &mut self.fixup_slack
    }

    pub(crate) fn object_prefix_len(&self) -> u32 {
        self.object_prefix.len() as u32
    }

    pub(crate) fn push_object(&mut self, build: impl FnOnce(ObjectId) -> TypedObject) -> ObjectId {
        let id = ObjectId(self.objects.len());
        self.objects.push(Some(build(id)));
        id
    }

    pub(crate) fn remove_object(&mut self, id: ObjectId) {
        if let Some(slot) = self.objects.get_mut(id.0) {
            *slot = None;
        }
    }

    pub(crate) fn arena_len(&self) -> usize {
        self.objects.len()
    }

    /// (start, size, id) for every live object, sorted by start offset.
    pub(crate) fn index(&self) -> Vec<(u32, u32, ObjectId)> {
        build_index(&self.objects)
    }
}

pub(crate) fn locate_rel(index: &[(u32, u32, ObjectId)], rel: u32) -> Option<(u32, ObjectId)> {
    let i = index.partition_point(|&(start, _, _)| start <= rel);
    if i == 0 {
        return None;
    }
    let (start, size, id) = index[i - 1];
    (rel < start + size).then_some((start, id))
}

fn check_range(bytes: &[u8], offset: u32, size: u32) -> Result<()> {
    let end = offset as usize + size as usize;
    if end > bytes.len() {
        return Err(Error::Truncated {
            offset: offset as usize,
            wanted: size as usize,
            len: bytes.len(),
        });
    }
    Ok(())
}

fn parse_chunk_table(bytes: &[u8]) -> Result<ChunkTable> {
    let mut r = ByteReader::at(bytes, CHUNK_TABLE_OFFSET);
    let mut chunks = Vec::new();
    for _ in 0..MAX_CHUNKS {
        let tag_a = r.read_u32()?;
        let tag_b = r.read_u32()?;
        let offset = r.read_u32()?;
        let size = r.read_u32()?;
        if offset == 0 {
            break;
        }
        chunks.push(ChunkInfo {
            tag_a,
            tag_b,
            offset,
            size,
        });
    }
    if chunks.len() < 2 {
        return Err(Error::TooFewChunks(chunks.len()));
    }
    Ok(ChunkTable::new(chunks))
}

fn parse_fixups(region: &[u8]) -> Result<(FixupSet, Vec<u8>)> {
    let mut fixups = FixupSet::new();
    let mut pos = 0usize;
    while pos + RECORD_HEADER_SIZE <= region.len() {
        let tag: [u8; 4] = region[pos..pos + 4].try_into().unwrap();
        if tag == [0u8; 4] {
            break;
        }
        let kind = FixupKind::from_tag(tag).ok_or(Error::UnknownFixupTag(tag))?;
        let mut r = ByteReader::at(region, pos + 4);
        let count = r.read_u32()?;
        let total = r.read_u32()? as usize;
        let header_size = r.read_u32()? as usize;
        if header_size < RECORD_HEADER_SIZE || total < header_size || pos + total > region.len() {
            return Err(Error::BadFixupRecord {
                offset: pos,
                reason: "record sizes out of range",
            });
        }
        if fixups.get(kind).is_some() {
            return Err(Error::BadFixupRecord {
                offset: pos,
                reason: "duplicate fixup table",
            });
        }
        let header_extra = region[pos + RECORD_HEADER_SIZE..pos + header_size].to_vec();
        let payload = &region[pos + header_size..pos + total];
        let raw = region[pos..pos + total].to_vec();
        fixups.insert(FixupTable::from_record(kind, count, header_extra, payload, raw)?);
        pos += total;
    }
    Ok((fixups, region[pos..].to_vec()))
}

fn slice_objects(
    fixups: &FixupSet,
    region: &[u8],
    chunk_size: u32,
) -> Result<(Vec<Option<TypedObject>>, Vec<u8>)> {
    let offsets = fixups.offsets(FixupKind::Rvtb);
    let mut objects: Vec<Option<TypedObject>> = Vec::with_capacity(offsets.len());
    let prefix_end = offsets.first().copied().unwrap_or(chunk_size);
    if prefix_end > chunk_size {
        return Err(Error::ObjectTooSmall {
            offset: prefix_end,
            size: 0,
        });
    }
    let prefix = region[..prefix_end as usize].to_vec();

    let tmet = fixups.ints(FixupKind::Tmet);
    for (i, &start) in offsets.iter().enumerate() {
        let end = offsets.get(i + 1).copied().unwrap_or(chunk_size);
        if end <= start || end > chunk_size {
            return Err(Error::ObjectTooSmall {
                offset: start,
                size: end.saturating_sub(start),
            });
        }
        let data = region[start as usize..end as usize].to_vec();
        if data.len() < INTRINSIC_HEADER_SIZE as usize {
            return Err(Error::ObjectTooSmall {
                offset: start,
                size: data.len() as u32,
            });
        }
        let type_index = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let string_index = *tmet
            .get(type_index as usize)
            .ok_or(Error::BadTypeIndex(type_index))?;
        let type_name = fixups.string_at(string_index)?.to_owned();
        objects.push(Some(TypedObject::new(
            ObjectId(i),
            type_index,
            type_name,
            start,
            data,
        )));
    }
    Ok((objects, prefix))
}

fn build_index(objects: &[Option<TypedObject>]) -> Vec<(u32, u32, ObjectId)> {
    let mut index: Vec<(u32, u32, ObjectId)> = objects
        .iter()
        .flatten()
        .map(|o| (o.relative_offset, o.size(), o.id))
        .collect();
    index.sort_unstable_by_key(|&(start, _, _)| start);
    index
}

fn assign_live_slots(
    objects: &mut [Option<TypedObject>],
    fixups: &FixupSet,
    index: &[(u32, u32, ObjectId)],
) {
    for kind in [FixupKind::Rstt, FixupKind::Rofs, FixupKind::Rhnd] {
        for &offset in fixups.offsets(kind) {
            let Some((start, id)) = locate_rel(index, offset) else {
                log::warn!("{} offset {:#x} lies outside every object", kind, offset);
                continue;
            };
            let Some(obj) = objects[id.0].as_mut() else {
                continue;
            };
            if offset + 4 > start + obj.size() {
                log::warn!("{} offset {:#x} straddles an object boundary", kind, offset);
                continue;
            }
            obj.set_slot(offset - start, kind);
        }
    }
}

fn resolve_names(
    objects: &mut [Option<TypedObject>],
    fixups: &FixupSet,
    index: &[(u32, u32, ObjectId)],
) {
    let find = |ty: &str| {
        objects
            .iter()
            .flatten()
            .find(|o| o.type_name == ty)
            .map(|o| o.id)
    };
    let (Some(list_id), Some(names_id)) = (find(OBJECT_LIST_TYPE), find(NAME_LIST_TYPE)) else {
        return;
    };

    let read_count = |id: ObjectId| {
        objects[id.0]
            .as_ref()
            .and_then(|o| o.read_u32(LIST_COUNT_OFFSET).ok())
            .unwrap_or(0)
    };
    let count_a = read_count(list_id);
    let count_b = read_count(names_id);
    if count_a != count_b {
        log::warn!(
            "object list has {} entries but name list has {}",
            count_a,
            count_b
        );
    }

    let mut assignments: Vec<(ObjectId, String)> = Vec::new();
    for i in 0..count_a.min(count_b) {
        let (Some(list), Some(names)) = (objects[list_id.0].as_ref(), objects[names_id.0].as_ref())
        else {
            return;
        };
        let Ok(ptr) = list.read_u32(LIST_ENTRIES_OFFSET + 4 * i) else {
            log::warn!("object list entry {} is out of bounds", i);
            break;
        };
        let rel = ptr & INTRA_CHUNK_MASK;
        let Some((start, target)) = locate_rel(index, rel) else {
            log::warn!("object list entry {} points at nothing", i);
            continue;
        };
        if start != rel {
            log::warn!("object list entry {} does not point at an object start", i);
            continue;
        }
        let Ok(name_index) = names.read_u32(LIST_ENTRIES_OFFSET + 8 * i) else {
            log::warn!("name list entry {} is out of bounds", i);
            break;
        };
        match fixups.string_at(name_index) {
            Ok(name) => {
                let stored_hash = names.read_u32(LIST_ENTRIES_OFFSET + 8 * i + 4).unwrap_or(0);
                if stored_hash != name_hash(name) {
                    log::warn!("name list entry {:?} carries a stale hash", name);
                }
                assignments.push((target, name.to_owned()));
            }
            Err(_) => log::warn!("name list entry {} has a bad string index", i),
        }
    }
    for (id, name) in assignments {
        if let Some(obj) = objects[id.0].as_mut() {
            obj.name = Some(name);
        }
    }
}

fn parse_trailer(
    bytes: &[u8],
    chunks: &ChunkTable,
    objects: &mut [Option<TypedObject>],
) -> Result<Option<TrailerInfo>> {
    let end = chunks
        .iter()
        .map(|c| (c.offset + c.size) as usize)
        .max()
        .unwrap_or(0);
    let rest = &bytes[end.min(bytes.len())..];
    if rest.len() < 4 || rest[0..4] != TRAILER_MAGIC {
        if !rest.is_empty() {
            log::warn!("{} trailing bytes after the last chunk ignored", rest.len());
        }
        return Ok(None);
    }

    let mut r = ByteReader::at(bytes, end + 4);
    let ordered: Vec<ObjectId> = {
        let mut ids: Vec<ObjectId> = objects.iter().flatten().map(|o| o.id).collect();
        ids.sort_by_key(|id| objects[id.0].as_ref().map(|o| o.relative_offset));
        ids
    };
    for &id in &ordered {
        let status = ObjectStatus::from_bits_retain(r.read_u8()?);
        if let Some(obj) = objects[id.0].as_mut() {
            obj.status = status;
        }
    }
    for &id in &ordered {
        let has_hash = objects[id.0]
            .as_ref()
            .map(|o| o.status.contains(ObjectStatus::HAS_NAME_HASH))
            .unwrap_or(false);
        if has_hash {
            let hash = r.read_u32()?;
            if let Some(obj) = objects[id.0].as_mut() {
                obj.original_name_hash = Some(hash);
            }
        }
    }
    let file_kind = r.read_u32()?;
    if r.remaining() > 0 {
        log::warn!("{} bytes after the trailer ignored", r.remaining());
    }
    Ok(Some(TrailerInfo { file_kind }))
}
