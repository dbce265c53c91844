//! Structural edits: create, clone, delete, rename, slot activation and
//! typed field access.
//!
//! Every operation here leaves the container in a mutated state; callers
//! must run `relayout` (which re-derives the graph) before serializing, and
//! `derive_graph` before reading edges again.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::chunk::{encode_object_offset, CHUNK_SELECTOR_SHIFT, INTRA_CHUNK_MASK, OBJECT_CHUNK};
use crate::cursor::{read_u32_at, write_u32_at};
use crate::error::{Error, Result};
use crate::fixup::{FixupData, FixupKind, EXNM_HANDLE_BIT};
use crate::hash::name_hash;
use crate::meta::{FieldDef, FieldKind, FieldValue};
use crate::object::{
    MemoryDescriptor, ObjectId, ObjectStatus, TypedObject, INTRINSIC_HEADER_SIZE,
    MEMORY_ACTIVE_BIT, REFCOUNT_OFFSET,
};

use super::{locate_rel, Igz, OBJECT_ALIGN, OBJECT_LIST_TYPE};

/// Collaborator used while cloning across containers: locates (or loads) a
/// named dependency inside the destination and hands back its id there.
pub trait ForeignResolver {
    fn find_object(&self, name: &str, name_hash: u32) -> Option<ObjectId>;
}

/// Resolver that never finds anything; unresolved slots are deactivated.
pub struct NoForeignResolver;

impl ForeignResolver for NoForeignResolver {
    fn find_object(&self, _name: &str, _name_hash: u32) -> Option<ObjectId> {
        None
    }
}

/// An inline memory payload, copied out of its owning object.
#[derive(Debug, Clone)]
pub struct MemoryBlock {
    pub descriptor: MemoryDescriptor,
    pub owner: ObjectId,
    pub data: Vec<u8>,
}

impl Igz {
    /// Index of `type_name` in the type table, interning the name and the
    /// table entry as needed.
    pub fn ensure_type(&mut self, type_name: &str) -> Result<u32> {
        let string_index = self.fixups_mut().add_string(type_name)?;
        if let Some(pos) = self
            .fixups()
            .ints(FixupKind::Tmet)
            .iter()
            .position(|&i| i == string_index)
        {
            return Ok(pos as u32);
        }
        let mut types = self.fixups().ints(FixupKind::Tmet).to_vec();
        types.push(string_index);
        let index = types.len() as u32 - 1;
        self.fixups_mut().update(FixupKind::Tmet, FixupData::Ints(types))?;
        self.mark_pending();
        Ok(index)
    }

    /// Creates a fresh zeroed object of a metadata-known type at the end of
    /// the object chunk.
    pub fn create_object(&mut self, type_name: &str, name: Option<&str>) -> Result<ObjectId> {
        let declared = self
            .metadata
            .size_of(type_name)
            .ok_or_else(|| Error::UnknownType(type_name.to_owned()))?;
        let size = declared.max(INTRINSIC_HEADER_SIZE);
        let type_index = self.ensure_type(type_name)?;
        let rel = self.next_free_offset();

        let mut data = vec![0u8; size as usize];
        data[0..4].copy_from_slice(&type_index.to_le_bytes());
        let owned_type = type_name.to_owned();
        let owned_name = name.map(str::to_owned);
        let id = self.push_object(move |id| {
            let mut obj = TypedObject::new(id, type_index, owned_type, rel, data);
            obj.status |= ObjectStatus::CUSTOM;
            obj.name = owned_name;
            obj
        });
        if name.is_some() {
            self.rebuild_named_index()?;
        }
        self.mark_pending();
        Ok(id)
    }

    /// Clones an object within this container.
    ///
    /// The data buffer is copied up to the metadata-declared size, active
    /// inline memory payloads are re-appended behind the copied header, and
    /// the live-slot mirror travels along. String and handle indices stay
    /// valid as-is inside one container; pointer slots keep referring to
    /// the original children.
    pub fn clone_object(&mut self, source: ObjectId, new_name: Option<&str>) -> Result<ObjectId> {
        let (type_name, type_index, src_data, src_slots) = {
            let src = self.object(source)?;
            (
                src.type_name.clone(),
                src.type_index,
                src.data.clone(),
                src.live_slots.clone(),
            )
        };
        let copy_len = self.clone_copy_len(&type_name, src_data.len());
        let new_rel = self.next_free_offset();
        let (mut data, live_slots) =
            self.copy_with_memory(&type_name, &src_data, &src_slots, copy_len, new_rel)?;
        write_u32_at(&mut data, REFCOUNT_OFFSET as usize, 0)?;

        let owned_name = new_name.map(str::to_owned);
        let id = self.push_object(move |id| {
            let mut obj = TypedObject::new(id, type_index, type_name, new_rel, data);
            obj.live_slots = live_slots;
            obj.status |= ObjectStatus::CUSTOM;
            obj.name = owned_name;
            obj
        });
        if new_name.is_some() {
            self.rebuild_named_index()?;
        }
        self.mark_pending();
        Ok(id)
    }

    /// Clones an object into another container, rewriting its dependencies.
    ///
    /// Only object-ref, string, handle and memory slots are remapped; a
    /// pointer whose target cannot be located in the destination (directly
    /// by name, or through the resolver) is deactivated with a diagnostic.
    pub fn clone_into(
        &self,
        source: ObjectId,
        dst: &mut Igz,
        new_name: Option<&str>,
        resolver: &dyn ForeignResolver,
    ) -> Result<ObjectId> {
        let src = self.object(source)?;
        let type_name = src.type_name.clone();
        let src_data = src.data.clone();
        let src_slots = src.live_slots.clone();
        let copy_len = self.clone_copy_len(&type_name, src_data.len());

        let new_rel = dst.next_free_offset();
        let (mut data, mut slots) =
            self.copy_with_memory(&type_name, &src_data, &src_slots, copy_len, new_rel)?;

        let type_index = dst.ensure_type(&type_name)?;
        write_u32_at(&mut data, 0, type_index)?;
        write_u32_at(&mut data, REFCOUNT_OFFSET as usize, 0)?;

        // Memory pointer words already target the clone's own payload.
        let memory_ptr_slots: HashSet<u32> = self
            .metadata
            .fields_of(&type_name)
            .unwrap_or(&[])
            .iter()
            .filter(|f| matches!(f.kind, FieldKind::Memory | FieldKind::ObjectRefArray))
            .map(|f| f.offset + 8)
            .collect();

        let old_index = self.index();
        let mut dropped: Vec<u32> = Vec::new();
        for (&slot, &kind) in slots.iter() {
            let raw = read_u32_at(&data, slot as usize)?;
            match kind {
                FixupKind::Rstt => match self.fixups.string_at(raw) {
                    Ok(s) => {
                        let remapped = dst.fixups_mut().add_string(s)?;
                        write_u32_at(&mut data, slot as usize, remapped)?;
                    }
                    Err(_) => {
                        log::warn!("clone: string index {} is out of range, slot dropped", raw);
                        dropped.push(slot);
                    }
                },
                FixupKind::Rhnd => {
                    match self.fixups.int_pairs(FixupKind::Exnm).get(raw as usize) {
                        Some(&pair) => {
                            let remapped = dst.fixups_mut().add_int_pair(FixupKind::Exnm, pair)?;
                            write_u32_at(&mut data, slot as usize, remapped)?;
                        }
                        None => {
                            log::warn!("clone: handle index {} is out of range, slot dropped", raw);
                            dropped.push(slot);
                        }
                    }
                }
                FixupKind::Rofs if !memory_ptr_slots.contains(&slot) => {
                    if (raw >> CHUNK_SELECTOR_SHIFT) as usize != OBJECT_CHUNK {
                        log::warn!("clone: pointer {:#010x} leaves the object chunk, slot dropped", raw);
                        dropped.push(slot);
                        continue;
                    }
                    let rel = raw & INTRA_CHUNK_MASK;
                    let Some((owner_start, owner)) = locate_rel(&old_index, rel) else {
                        log::warn!("clone: dangling pointer {:#010x}, slot dropped", raw);
                        dropped.push(slot);
                        continue;
                    };
                    let inner = rel - owner_start;
                    if owner == source {
                        // self reference: retarget into the clone's own data
                        if inner < data.len() as u32 {
                            write_u32_at(&mut data, slot as usize, encode_object_offset(new_rel + inner))?;
                        } else {
                            dropped.push(slot);
                        }
                        continue;
                    }
                    let child = self.object(owner)?;
                    let Some(child_name) = child.name.as_deref() else {
                        log::warn!(
                            "clone: target of slot {:#x} has no name, cannot be rewritten across files",
                            slot
                        );
                        dropped.push(slot);
                        continue;
                    };
                    let hash = name_hash(child_name);
                    let found = dst
                        .find_by_name_hash(hash)
                        .or_else(|| resolver.find_object(child_name, hash))
                        .filter(|&did| dst.object(did).is_ok());
                    match found {
                        Some(did) => {
                            let target_rel = dst.object(did)?.relative_offset + inner;
                            write_u32_at(&mut data, slot as usize, encode_object_offset(target_rel))?;
                        }
                        None => {
                            log::warn!(
                                "clone: dependency {:?} is absent from the destination, slot dropped",
                                child_name
                            );
                            dropped.push(slot);
                        }
                    }
                }
                _ => {}
            }
        }
        for slot in dropped {
            slots.remove(&slot);
            write_u32_at(&mut data, slot as usize, 0)?;
        }

        let owned_name = new_name.map(str::to_owned);
        let id = dst.push_object(move |id| {
            let mut obj = TypedObject::new(id, type_index, type_name, new_rel, data);
            obj.live_slots = slots;
            obj.status |= ObjectStatus::CUSTOM;
            obj.name = owned_name;
            obj
        });
        if new_name.is_some() {
            dst.rebuild_named_index()?;
        }
        dst.mark_pending();
        Ok(id)
    }

    fn clone_copy_len(&self, type_name: &str, stored_len: usize) -> usize {
        let declared = self
            .metadata
            .size_of(type_name)
            .unwrap_or(stored_len as u32)
            .max(INTRINSIC_HEADER_SIZE);
        (declared as usize).min(stored_len)
    }

    /// Copies the header region of an object and re-appends every active
    /// inline memory payload behind it, 16-byte padded, retargeting the
    /// descriptor pointer and carrying element liveness along.
    fn copy_with_memory(
        &self,
        type_name: &str,
        src_data: &[u8],
        src_slots: &BTreeMap<u32, FixupKind>,
        copy_len: usize,
        new_rel: u32,
    ) -> Result<(Vec<u8>, BTreeMap<u32, FixupKind>)> {
        let mut data = src_data[..copy_len].to_vec();
        let mut slots: BTreeMap<u32, FixupKind> = src_slots
            .iter()
            .filter(|&(&off, _)| off + 4 <= copy_len as u32)
            .map(|(&off, &kind)| (off, kind))
            .collect();

        let fields: Vec<FieldDef> = self
            .metadata
            .fields_of(type_name)
            .map(<[FieldDef]>::to_vec)
            .unwrap_or_default();
        let index = self.index();

        for field in fields
            .iter()
            .filter(|f| matches!(f.kind, FieldKind::Memory | FieldKind::ObjectRefArray))
        {
            let ptr_slot = field.offset + 8;
            if slots.get(&ptr_slot) != Some(&FixupKind::Rofs) {
                continue;
            }
            let size = read_u32_at(&data, field.offset as usize)?;
            let flags = read_u32_at(&data, field.offset as usize + 4)?;
            if flags & MEMORY_ACTIVE_BIT == 0 || size == 0 {
                continue;
            }
            let ptr = read_u32_at(&data, ptr_slot as usize)?;
            if (ptr >> CHUNK_SELECTOR_SHIFT) as usize != OBJECT_CHUNK {
                log::warn!("memory pointer of {:?} leaves the object chunk", field.name);
                continue;
            }
            let rel = ptr & INTRA_CHUNK_MASK;
            let Some((owner_start, owner_id)) = locate_rel(&index, rel) else {
                log::warn!("memory pointer of {:?} resolves to no object", field.name);
                continue;
            };
            let owner = self.object(owner_id)?;
            let inner = rel - owner_start;
            if inner + size > owner.size() {
                log::warn!("memory block of {:?} escapes its owner", field.name);
                continue;
            }

            while data.len() % OBJECT_ALIGN as usize != 0 {
                data.push(0);
            }
            let position = data.len() as u32;
            data.extend_from_slice(&owner.data[inner as usize..(inner + size) as usize]);
            write_u32_at(&mut data, ptr_slot as usize, encode_object_offset(new_rel + position))?;
            for cell in (0..size).step_by(4) {
                if let Some(&kind) = owner.live_slots.get(&(inner + cell)) {
                    slots.insert(position + cell, kind);
                }
            }
        }
        Ok((data, slots))
    }

    /// Removes an object. With `cascade`, descendants whose every remaining
    /// reference comes from the deleted set or the all-objects list go too.
    /// Returns the deleted ids.
    pub fn delete_object(&mut self, id: ObjectId, cascade: bool) -> Result<Vec<ObjectId>> {
        self.object(id)?;
        let list_id = self.find_by_type(OBJECT_LIST_TYPE);
        let mut victims: BTreeSet<ObjectId> = BTreeSet::from([id]);
        {
            let graph = self.graph()?;
            if cascade {
                loop {
                    let mut grew = false;
                    for (candidate, _) in self.live() {
                        if victims.contains(&candidate) || Some(candidate) == list_id {
                            continue;
                        }
                        let parents = graph.parents_of(candidate);
                        if !parents.iter().any(|p| victims.contains(p)) {
                            continue;
                        }
                        let kept_alive = parents
                            .iter()
                            .any(|p| !victims.contains(p) && Some(*p) != list_id);
                        if !kept_alive {
                            victims.insert(candidate);
                            grew = true;
                        }
                    }
                    if !grew {
                        break;
                    }
                }
            }
        }
        for &victim in &victims {
            self.remove_object(victim);
        }
        self.rebuild_named_index()?;
        self.mark_pending();
        Ok(victims.into_iter().collect())
    }

    /// Renames an object. When the old name is the sole user of its string
    /// table entry, the entry is rewritten in place so existing indices
    /// keep resolving; otherwise a fresh entry is interned. Handle entries
    /// carrying the old name hash follow the rename.
    pub fn rename_object(&mut self, id: ObjectId, new_name: &str) -> Result<()> {
        let old = self.object(id)?.name.clone();
        if new_name.is_empty() {
            self.object_mut(id)?.name = None;
            self.rebuild_named_index()?;
            self.mark_pending();
            return Ok(());
        }

        if let Some(old) = &old {
            if let Some(index) = self.fixups.find_string(old) {
                let shared = self
                    .live()
                    .any(|(other, o)| other != id && o.name.as_deref() == Some(old.as_str()))
                    || self.fixups.ints(FixupKind::Tmet).contains(&index)
                    || self
                        .fixups
                        .string_pairs()
                        .iter()
                        .any(|(a, b)| a == old || b == old);
                if !shared {
                    self.fixups_mut().set_string(index, new_name)?;
                }
            }

            let old_hash = name_hash(old);
            let new_hash = name_hash(new_name);
            let pairs = self.fixups.int_pairs(FixupKind::Exnm);
            if pairs
                .iter()
                .any(|&(h, ns)| ns & EXNM_HANDLE_BIT != 0 && h == old_hash)
            {
                let rewritten: Vec<(u32, u32)> = pairs
                    .iter()
                    .map(|&(h, ns)| {
                        if ns & EXNM_HANDLE_BIT != 0 && h == old_hash {
                            (new_hash, ns)
                        } else {
                            (h, ns)
                        }
                    })
                    .collect();
                self.fixups_mut()
                    .update(FixupKind::Exnm, FixupData::IntPairs(rewritten))?;
            }
        }

        {
            let obj = self.object_mut(id)?;
            if !obj.status.contains(ObjectStatus::HAS_NAME_HASH) {
                if let Some(old) = &old {
                    obj.original_name_hash = Some(name_hash(old));
                    obj.status |= ObjectStatus::HAS_NAME_HASH;
                }
            }
            obj.status |= ObjectStatus::MODIFIED;
            obj.name = Some(new_name.to_owned());
        }

        self.rebuild_named_index()?;
        self.mark_pending();
        Ok(())
    }

    /// Toggles one reference slot of an object.
    ///
    /// Activating writes `value` into the cell and records the slot in the
    /// object's mirror (kept sorted for the delta encoder); deactivating
    /// zeroes the cell and removes the record.
    pub fn activate_fixup(
        &mut self,
        id: ObjectId,
        kind: FixupKind,
        offset: u32,
        active: bool,
        value: u32,
    ) -> Result<()> {
        if !kind.is_slot_kind() {
            return Err(Error::NotSlotFixup(kind));
        }
        if offset % 4 != 0 {
            return Err(Error::MisalignedFixupOffset(offset));
        }
        let obj = self.object_mut(id)?;
        if active {
            obj.write_u32(offset, value)?;
            obj.set_slot(offset, kind);
        } else {
            obj.write_u32(offset, 0)?;
            obj.clear_slot(offset);
        }
        obj.status |= ObjectStatus::MODIFIED;
        self.mark_pending();
        Ok(())
    }

    pub fn read_object_field(&self, id: ObjectId, field: &FieldDef) -> Result<FieldValue> {
        self.object(id)?.read_field(field)
    }

    pub fn write_object_field(
        &mut self,
        id: ObjectId,
        field: &FieldDef,
        value: FieldValue,
    ) -> Result<()> {
        let touches_graph = field.kind.fixup_kind().is_some();
        let obj = self.object_mut(id)?;
        obj.write_field(field, value)?;
        obj.status |= ObjectStatus::MODIFIED;
        if touches_graph {
            self.set_graph(None);
        }
        Ok(())
    }

    /// Copies out the payload of an inline memory field, resolving the
    /// owning object first; `None` when the descriptor is inactive.
    pub fn read_memory(&self, id: ObjectId, field: &FieldDef) -> Result<Option<MemoryBlock>> {
        if !matches!(field.kind, FieldKind::Memory | FieldKind::ObjectRefArray) {
            return Err(Error::FieldKindMismatch("not a memory field"));
        }
        let obj = self.object(id)?;
        let descriptor = obj.memory_descriptor(field.offset)?;
        if !descriptor.is_active() || obj.slot_kind(field.offset + 8) != Some(FixupKind::Rofs) {
            return Ok(None);
        }
        if (descriptor.ptr >> CHUNK_SELECTOR_SHIFT) as usize != OBJECT_CHUNK {
            return Err(Error::NoObjectAt(descriptor.ptr));
        }
        let rel = descriptor.ptr & INTRA_CHUNK_MASK;
        let index = self.index();
        let Some((owner_start, owner)) = locate_rel(&index, rel) else {
            return Err(Error::NoObjectAt(descriptor.ptr));
        };
        let inner = rel - owner_start;
        let owner_obj = self.object(owner)?;
        if inner + descriptor.size > owner_obj.size() {
            return Err(Error::FieldOutOfBounds {
                offset: inner,
                len: descriptor.size,
                size: owner_obj.size(),
            });
        }
        Ok(Some(MemoryBlock {
            descriptor,
            owner,
            data: owner_obj.data[inner as usize..(inner + descriptor.size) as usize].to_vec(),
        }))
    }
}
