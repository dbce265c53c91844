//! Graph derivation, relayout and named-index maintenance.
//!
//! Both the edge list and the named index are rebuilt from scratch rather
//! than patched; intermediate states left behind by mutation calls are not
//! valid inputs, so nothing here trusts previously derived results.

use std::collections::HashMap;

use crate::chunk::{align_up, encode_object_offset, CHUNK_SELECTOR_SHIFT, INTRA_CHUNK_MASK, OBJECT_CHUNK};
use crate::error::{Error, Result};
use crate::fixup::{FixupData, FixupKind, EXNM_HANDLE_BIT};
use crate::graph::{Edge, ObjectGraph};
use crate::hash::name_hash;
use crate::object::{ObjectId, TypedObject};

use super::{locate_rel, Igz, LIST_COUNT_OFFSET, LIST_ENTRIES_OFFSET, NAME_LIST_TYPE, OBJECT_ALIGN, OBJECT_LIST_TYPE};

impl Igz {
    /// Rebuilds the object graph from the live-slot mirrors.
    ///
    /// Dangling pointers and unknown handles cost the offending object its
    /// valid flag and a diagnostic, never the whole derivation.
    pub fn derive_graph(&mut self) -> Result<()> {
        let index = self.index();
        let names_by_hash: HashMap<u32, ObjectId> = self
            .live()
            .filter_map(|(id, o)| o.name.as_deref().map(|n| (name_hash(n), id)))
            .collect();
        let string_count = self.fixups.strings().len() as u32;
        let handles = self.fixups.int_pairs(FixupKind::Exnm).to_vec();

        let mut edges: Vec<(ObjectId, Edge)> = Vec::new();
        let mut invalid: Vec<ObjectId> = Vec::new();
        let live_ids: Vec<ObjectId> = self.live().map(|(id, _)| id).collect();

        for (id, obj) in self.live() {
            if self.metadata.fields_of(&obj.type_name).is_none() {
                log::warn!("no metadata for type {:?} on object {}", obj.type_name, id);
            }
            for (&slot, &kind) in &obj.live_slots {
                let raw = match obj.read_u32(slot) {
                    Ok(v) => v,
                    Err(_) => {
                        log::warn!("{}: live slot {:#x} escapes the data buffer", id, slot);
                        invalid.push(id);
                        continue;
                    }
                };
                match kind {
                    FixupKind::Rofs => {
                        if (raw >> CHUNK_SELECTOR_SHIFT) as usize != OBJECT_CHUNK {
                            log::warn!("{}+{:#x}: pointer {:#010x} leaves the object chunk", id, slot, raw);
                            invalid.push(id);
                            continue;
                        }
                        match locate_rel(&index, raw & INTRA_CHUNK_MASK) {
                            Some((_, target)) if target != id => edges.push((
                                id,
                                Edge {
                                    child: target,
                                    local_offset: slot,
                                    kind,
                                },
                            )),
                            Some(_) => {} // pointer into the object's own data
                            None => {
                                log::warn!(
                                    "{}+{:#x}: pointer {:#010x} resolves to no object",
                                    id,
                                    slot,
                                    raw
                                );
                                invalid.push(id);
                            }
                        }
                    }
                    FixupKind::Rhnd => match handles.get(raw as usize) {
                        Some(&(hash, ns)) if ns & EXNM_HANDLE_BIT != 0 => {
                            match names_by_hash.get(&hash) {
                                Some(&target) => edges.push((
                                    id,
                                    Edge {
                                        child: target,
                                        local_offset: slot,
                                        kind,
                                    },
                                )),
                                None => {
                                    log::warn!(
                                        "{}+{:#x}: handle names hash {:#010x}, no such object",
                                        id,
                                        slot,
                                        hash
                                    );
                                    invalid.push(id);
                                }
                            }
                        }
                        Some(_) => {} // external reference, no local edge
                        None => {
                            log::warn!("{}+{:#x}: handle index {} is out of range", id, slot, raw);
                            invalid.push(id);
                        }
                    },
                    FixupKind::Rstt => {
                        if raw >= string_count {
                            log::warn!("{}+{:#x}: string index {} is out of range", id, slot, raw);
                            invalid.push(id);
                        }
                    }
                    _ => {}
                }
            }
        }

        let mut graph = ObjectGraph::new(self.arena_len());
        for (parent, edge) in edges {
            graph.add_edge(parent, edge);
        }
        for id in live_ids {
            self.object_mut(id)?.invalid = false;
        }
        for id in invalid {
            self.object_mut(id)?.invalid = true;
        }
        self.set_graph(Some(graph));
        Ok(())
    }

    /// Compares every stored reference count with the derived inbound edge
    /// count. Strict mode fails on the first mismatch; lenient mode repairs
    /// the stored field and logs.
    pub fn reconcile_refcounts(&mut self, strict: bool) -> Result<()> {
        let counted: Vec<(ObjectId, u32)> = {
            let graph = self.graph()?;
            self.live()
                .map(|(id, _)| (id, graph.inbound_count(id)))
                .collect()
        };
        for (id, counted) in counted {
            let obj = self.object_mut(id)?;
            let stored = obj.reference_count()?;
            if stored != counted {
                if strict {
                    return Err(Error::RefCountMismatch {
                        id,
                        stored,
                        counted,
                    });
                }
                log::warn!(
                    "{}: reference count {} disagrees with {} inbound edges, repaired",
                    id,
                    stored,
                    counted
                );
                obj.set_reference_count(counted)?;
            }
        }
        Ok(())
    }

    /// Reassigns object offsets, rewrites every live pointer cell, rebuilds
    /// the offset-set fixups and the chunk sizes, then re-derives the graph
    /// and reconciles reference counts.
    pub fn relayout(&mut self, strict: bool) -> Result<()> {
        let order = self.sorted_ids();
        let old_index = self.index();

        let mut new_rel: HashMap<ObjectId, u32> = HashMap::with_capacity(order.len());
        let mut cursor = match order.first() {
            Some(&first) => align_up(self.object(first)?.relative_offset, OBJECT_ALIGN),
            None => align_up(self.object_prefix_len(), OBJECT_ALIGN),
        };
        let mut chunk_end = self.object_prefix_len();
        for &id in &order {
            let size = self.object(id)?.size();
            new_rel.insert(id, cursor);
            chunk_end = cursor + size;
            cursor = align_up(chunk_end, OBJECT_ALIGN);
        }

        // Rewrite pointer cells against the pre-move layout.
        for &id in &order {
            let slots: Vec<u32> = self
                .object(id)?
                .live_slots
                .iter()
                .filter(|&(_, &k)| k == FixupKind::Rofs)
                .map(|(&s, _)| s)
                .collect();
            for slot in slots {
                let raw = self.object(id)?.read_u32(slot)?;
                if (raw >> CHUNK_SELECTOR_SHIFT) as usize != OBJECT_CHUNK {
                    continue;
                }
                let rel = raw & INTRA_CHUNK_MASK;
                let Some((old_start, owner)) = locate_rel(&old_index, rel) else {
                    log::warn!("{}+{:#x}: dangling pointer left untouched by relayout", id, slot);
                    continue;
                };
                let rewritten = encode_object_offset(new_rel[&owner] + (rel - old_start));
                self.object_mut(id)?.write_u32(slot, rewritten)?;
            }
        }

        for (&id, &rel) in &new_rel {
            self.object_mut(id)?.relative_offset = rel;
        }

        let table: Vec<u32> = order.iter().map(|id| new_rel[id]).collect();
        self.fixups_mut()
            .update(FixupKind::Rvtb, FixupData::Offsets(table))?;
        for kind in [FixupKind::Rstt, FixupKind::Rofs, FixupKind::Rhnd] {
            let mut offsets = Vec::new();
            for (_, obj) in self.live() {
                for (&slot, &k) in &obj.live_slots {
                    if k == kind {
                        offsets.push(obj.relative_offset + slot);
                    }
                }
            }
            self.fixups_mut().update(kind, FixupData::Offsets(offsets))?;
        }

        self.fixup_slack_mut().clear();
        let fixup_size = self.fixups().total_active_size();
        self.chunks_mut().set_size(0, fixup_size)?;
        self.chunks_mut().set_size(1, chunk_end)?;
        self.chunks_mut().repack();

        self.derive_graph()?;
        self.reconcile_refcounts(strict)?;
        self.clear_pending();
        Ok(())
    }

    /// Regenerates the object-list/name-list pair from the live set of
    /// named objects. Always a full rebuild; the parallel arrays are never
    /// patched in place.
    pub fn rebuild_named_index(&mut self) -> Result<()> {
        let mut named: Vec<(ObjectId, String)> = self
            .live()
            .filter(|(_, o)| o.type_name != OBJECT_LIST_TYPE && o.type_name != NAME_LIST_TYPE)
            .filter_map(|(id, o)| {
                o.name
                    .clone()
                    .filter(|n| !n.is_empty())
                    .map(|n| (id, n))
            })
            .collect();
        named.sort_by_key(|(id, _)| self.objects[id.0].as_ref().map(|o| o.relative_offset));

        let have_lists =
            self.find_by_type(OBJECT_LIST_TYPE).is_some() || self.find_by_type(NAME_LIST_TYPE).is_some();
        if named.is_empty() && !have_lists {
            return Ok(());
        }

        let list_id = match self.find_by_type(OBJECT_LIST_TYPE) {
            Some(id) => id,
            None => self.create_list_object(OBJECT_LIST_TYPE)?,
        };
        let names_id = match self.find_by_type(NAME_LIST_TYPE) {
            Some(id) => id,
            None => self.create_list_object(NAME_LIST_TYPE)?,
        };

        let mut entries: Vec<(u32, u32, u32)> = Vec::with_capacity(named.len());
        for (id, name) in &named {
            let string_index = self.fixups_mut().add_string(name)?;
            let target_rel = self.object(*id)?.relative_offset;
            entries.push((target_rel, string_index, name_hash(name)));
        }

        let count = entries.len() as u32;
        {
            let type_index = self.object(list_id)?.type_index;
            let mut data = vec![0u8; (LIST_ENTRIES_OFFSET + 4 * count) as usize];
            data[0..4].copy_from_slice(&type_index.to_le_bytes());
            data[LIST_COUNT_OFFSET as usize..][..4].copy_from_slice(&count.to_le_bytes());
            let obj = self.object_mut(list_id)?;
            obj.data = data;
            obj.live_slots.clear();
            for (i, &(target_rel, _, _)) in entries.iter().enumerate() {
                let slot = LIST_ENTRIES_OFFSET + 4 * i as u32;
                obj.write_u32(slot, encode_object_offset(target_rel))?;
                obj.set_slot(slot, FixupKind::Rofs);
            }
        }
        {
            let type_index = self.object(names_id)?.type_index;
            let mut data = vec![0u8; (LIST_ENTRIES_OFFSET + 8 * count) as usize];
            data[0..4].copy_from_slice(&type_index.to_le_bytes());
            data[LIST_COUNT_OFFSET as usize..][..4].copy_from_slice(&count.to_le_bytes());
            let obj = self.object_mut(names_id)?;
            obj.data = data;
            obj.live_slots.clear();
            for (i, &(_, string_index, hash)) in entries.iter().enumerate() {
                let slot = LIST_ENTRIES_OFFSET + 8 * i as u32;
                obj.write_u32(slot, string_index)?;
                obj.write_u32(slot + 4, hash)?;
                obj.set_slot(slot, FixupKind::Rstt);
            }
        }

        self.mark_pending();
        Ok(())
    }

    fn create_list_object(&mut self, type_name: &str) -> Result<ObjectId> {
        let type_index = self.ensure_type(type_name)?;
        let rel = self.next_free_offset();
        let mut data = vec![0u8; LIST_ENTRIES_OFFSET as usize];
        data[0..4].copy_from_slice(&type_index.to_le_bytes());
        let name = type_name.to_owned();
        let id = self.push_object(move |id| {
            let mut obj = TypedObject::new(id, type_index, name, rel, data);
            obj.status |= crate::object::ObjectStatus::CUSTOM;
            obj
        });
        Ok(id)
    }

    /// First 16-byte-aligned offset past every live object.
    pub(crate) fn next_free_offset(&self) -> u32 {
        let end = self
            .live()
            .map(|(_, o)| o.end_offset())
            .max()
            .unwrap_or_else(|| self.object_prefix_len());
        align_up(end, OBJECT_ALIGN)
    }
}
