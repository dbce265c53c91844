//! Typed objects: raw data buffers plus the per-instance live-slot mirror.
//!
//! An object never interprets its own bytes on its own authority. Scalar
//! reads go through the byte cursor; whether a pointer-shaped slot is a
//! real reference is decided solely by live-slot membership, which mirrors
//! the decoded fixup offset sets. A zero in an inactive slot is unused
//! scalar space, not a null pointer.

use std::collections::BTreeMap;
use std::fmt;

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};

use crate::cursor::{f32_to_half, half_to_f32};
use crate::error::{Error, Result};
use crate::fixup::FixupKind;
use crate::meta::{FieldDef, FieldKind, FieldValue, ScalarKind};

/// Stable arena index of an object within its container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub usize);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    /// Per-object status byte stored in the optional trailer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ObjectStatus: u8 {
        const CUSTOM = 1;
        const HAS_NAME_HASH = 1 << 1;
        const MODIFIED = 1 << 2;
    }
}

pub const TYPE_INDEX_OFFSET: u32 = 0;
pub const REFCOUNT_OFFSET: u32 = 4;
pub const INTRINSIC_HEADER_SIZE: u32 = 8;

/// Flags bit marking a memory descriptor's payload as present.
pub const MEMORY_ACTIVE_BIT: u32 = 1 << 0x18;

/// Three-word inline memory header: total byte size, flags, data pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDescriptor {
    pub size: u32,
    pub flags: u32,
    pub ptr: u32,
}

impl MemoryDescriptor {
    pub fn is_active(&self) -> bool {
        self.flags & MEMORY_ACTIVE_BIT != 0
    }
}

#[derive(Debug, Clone)]
pub struct TypedObject {
    pub(crate) id: ObjectId,
    pub(crate) type_index: u32,
    pub(crate) type_name: String,
    pub(crate) name: Option<String>,
    /// Offset within the object chunk.
    pub(crate) relative_offset: u32,
    pub(crate) data: Vec<u8>,
    /// Object-local byte offset of every live reference slot.
    pub(crate) live_slots: BTreeMap<u32, FixupKind>,
    pub(crate) status: ObjectStatus,
    pub(crate) original_name_hash: Option<u32>,
    pub(crate) invalid: bool,
}

impl TypedObject {
    pub(crate) fn new(
        id: ObjectId,
        type_index: u32,
        type_name: String,
        relative_offset: u32,
        data: Vec<u8>,
    ) -> Self {
        Self {
            id,
            type_index,
            type_name,
            name: None,
            relative_offset,
            data,
            live_slots: BTreeMap::new(),
            status: ObjectStatus::empty(),
            original_name_hash: None,
            invalid: false,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn type_index(&self) -> u32 {
        self.type_index
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn relative_offset(&self) -> u32 {
        self.relative_offset
    }

    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn end_offset(&self) -> u32 {
        self.relative_offset + self.size()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn status(&self) -> ObjectStatus {
        self.status
    }

    pub fn original_name_hash(&self) -> Option<u32> {
        self.original_name_hash
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid
    }

    pub fn live_slots(&self) -> &BTreeMap<u32, FixupKind> {
        &self.live_slots
    }

    pub fn slot_kind(&self, offset: u32) -> Option<FixupKind> {
        self.live_slots.get(&offset).copied()
    }

    pub(crate) fn set_slot(&mut self, offset: u32, kind: FixupKind) {
        self.live_slots.insert(offset, kind);
    }

    pub(crate) fn clear_slot(&mut self, offset: u32) {
        self.live_slots.remove(&offset);
    }

    /// Whether `rel`, an object-chunk offset, falls inside this object.
    pub fn contains_rel(&self, rel: u32) -> bool {
        rel >= self.relative_offset && rel < self.end_offset()
    }

    fn check(&self, offset: u32, len: u32) -> Result<usize> {
        if offset + len > self.size() {
            return Err(Error::FieldOutOfBounds {
                offset,
                len,
                size: self.size(),
            });
        }
        Ok(offset as usize)
    }

    pub fn read_u8(&self, offset: u32) -> Result<u8> {
        let o = self.check(offset, 1)?;
        Ok(self.data[o])
    }

    pub fn read_u16(&self, offset: u32) -> Result<u16> {
        let o = self.check(offset, 2)?;
        Ok(LittleEndian::read_u16(&self.data[o..]))
    }

    pub fn read_u32(&self, offset: u32) -> Result<u32> {
        let o = self.check(offset, 4)?;
        Ok(LittleEndian::read_u32(&self.data[o..]))
    }

    pub fn read_f32(&self, offset: u32) -> Result<f32> {
        let o = self.check(offset, 4)?;
        Ok(LittleEndian::read_f32(&self.data[o..]))
    }

    pub fn write_u8(&mut self, offset: u32, v: u8) -> Result<()> {
        let o = self.check(offset, 1)?;
        self.data[o] = v;
        Ok(())
    }

    pub fn write_u16(&mut self, offset: u32, v: u16) -> Result<()> {
        let o = self.check(offset, 2)?;
        LittleEndian::write_u16(&mut self.data[o..], v);
        Ok(())
    }

    pub fn write_u32(&mut self, offset: u32, v: u32) -> Result<()> {
        let o = self.check(offset, 4)?;
        LittleEndian::write_u32(&mut self.data[o..], v);
        Ok(())
    }

    pub fn write_f32(&mut self, offset: u32, v: f32) -> Result<()> {
        let o = self.check(offset, 4)?;
        LittleEndian::write_f32(&mut self.data[o..], v);
        Ok(())
    }

    pub fn reference_count(&self) -> Result<u32> {
        self.read_u32(REFCOUNT_OFFSET)
    }

    pub(crate) fn set_reference_count(&mut self, count: u32) -> Result<()> {
        self.write_u32(REFCOUNT_OFFSET, count)
    }

    pub fn memory_descriptor(&self, field_offset: u32) -> Result<MemoryDescriptor> {
        Ok(MemoryDescriptor {
            size: self.read_u32(field_offset)?,
            flags: self.read_u32(field_offset + 4)?,
            ptr: self.read_u32(field_offset + 8)?,
        })
    }

    pub(crate) fn write_memory_descriptor(
        &mut self,
        field_offset: u32,
        desc: &MemoryDescriptor,
    ) -> Result<()> {
        self.write_u32(field_offset, desc.size)?;
        self.write_u32(field_offset + 4, desc.flags)?;
        self.write_u32(field_offset + 8, desc.ptr)
    }

    fn read_scalar(&self, offset: u32, kind: ScalarKind) -> Result<FieldValue> {
        Ok(match kind {
            ScalarKind::U8 => FieldValue::U8(self.read_u8(offset)?),
            ScalarKind::U16 => FieldValue::U16(self.read_u16(offset)?),
            ScalarKind::U32 => FieldValue::U32(self.read_u32(offset)?),
            ScalarKind::I32 => FieldValue::I32(self.read_u32(offset)? as i32),
            ScalarKind::F32 => FieldValue::F32(self.read_f32(offset)?),
            ScalarKind::F16 => FieldValue::F32(half_to_f32(self.read_u16(offset)?)),
        })
    }

    fn read_bitfield_storage(&self, offset: u32, storage: ScalarKind) -> Result<u32> {
        match storage {
            ScalarKind::U8 => Ok(self.read_u8(offset)? as u32),
            ScalarKind::U16 => Ok(self.read_u16(offset)? as u32),
            ScalarKind::U32 | ScalarKind::I32 => self.read_u32(offset),
            ScalarKind::F32 | ScalarKind::F16 => {
                Err(Error::FieldKindMismatch("float bitfield storage"))
            }
        }
    }

    fn write_bitfield_storage(&mut self, offset: u32, storage: ScalarKind, raw: u32) -> Result<()> {
        match storage {
            ScalarKind::U8 => self.write_u8(offset, raw as u8),
            ScalarKind::U16 => self.write_u16(offset, raw as u16),
            ScalarKind::U32 | ScalarKind::I32 => self.write_u32(offset, raw),
            ScalarKind::F32 | ScalarKind::F16 => {
                Err(Error::FieldKindMismatch("float bitfield storage"))
            }
        }
    }

    pub fn read_field(&self, field: &FieldDef) -> Result<FieldValue> {
        match &field.kind {
            FieldKind::Scalar(kind) => self.read_scalar(field.offset, *kind),
            FieldKind::Bitfield {
                storage,
                bits,
                shift,
                signed,
            } => {
                let raw = self.read_bitfield_storage(field.offset, *storage)?;
                let mask = bit_mask(*bits);
                let v = (raw >> shift) & mask;
                if *signed {
                    let sign = 1u32 << (bits - 1);
                    let v = if v & sign != 0 { v | !mask } else { v };
                    Ok(FieldValue::I32(v as i32))
                } else {
                    Ok(FieldValue::U32(v))
                }
            }
            other => {
                let slot = other
                    .pointer_slot(field.offset)
                    .ok_or(Error::FieldKindMismatch("not a readable field kind"))?;
                Ok(FieldValue::U32(self.read_u32(slot)?))
            }
        }
    }

    pub fn write_field(&mut self, field: &FieldDef, value: FieldValue) -> Result<()> {
        match &field.kind {
            FieldKind::Scalar(kind) => match (kind, value) {
                (ScalarKind::U8, FieldValue::U8(v)) => self.write_u8(field.offset, v),
                (ScalarKind::U16, FieldValue::U16(v)) => self.write_u16(field.offset, v),
                (ScalarKind::U32, FieldValue::U32(v)) => self.write_u32(field.offset, v),
                (ScalarKind::I32, FieldValue::I32(v)) => self.write_u32(field.offset, v as u32),
                (ScalarKind::F32, FieldValue::F32(v)) => self.write_f32(field.offset, v),
                (ScalarKind::F16, FieldValue::F32(v)) => {
                    self.write_u16(field.offset, f32_to_half(v))
                }
                _ => Err(Error::FieldKindMismatch("scalar value of the wrong width")),
            },
            FieldKind::Bitfield {
                storage,
                bits,
                shift,
                ..
            } => {
                let v = value
                    .as_u32()
                    .ok_or(Error::FieldKindMismatch("bitfield wants an integer"))?;
                let mask = bit_mask(*bits);
                let raw = self.read_bitfield_storage(field.offset, *storage)?;
                let raw = (raw & !(mask << shift)) | ((v & mask) << shift);
                self.write_bitfield_storage(field.offset, *storage, raw)
            }
            other => {
                let slot = other
                    .pointer_slot(field.offset)
                    .ok_or(Error::FieldKindMismatch("not a writable field kind"))?;
                let v = value
                    .as_u32()
                    .ok_or(Error::FieldKindMismatch("reference slots hold a u32"))?;
                self.write_u32(slot, v)
            }
        }
    }
}

fn bit_mask(bits: u8) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(data: Vec<u8>) -> TypedObject {
        TypedObject::new(ObjectId(0), 0, "Widget".into(), 0, data)
    }

    #[test]
    fn bounds_are_enforced() {
        let o = object(vec![0; 8]);
        assert!(o.read_u32(4).is_ok());
        assert!(matches!(
            o.read_u32(6),
            Err(Error::FieldOutOfBounds { .. })
        ));
    }

    #[test]
    fn unsigned_bitfield_extract_and_replace() {
        let mut o = object(vec![0; 16]);
        let field = FieldDef {
            name: "health".into(),
            offset: 12,
            size: 4,
            kind: FieldKind::Bitfield {
                storage: ScalarKind::U32,
                bits: 7,
                shift: 3,
                signed: false,
            },
        };
        o.write_field(&field, FieldValue::U32(100)).unwrap();
        assert_eq!(o.read_u32(12).unwrap(), 100 << 3);
        assert_eq!(o.read_field(&field).unwrap(), FieldValue::U32(100));
        // neighbouring bits survive a replace
        o.write_u32(12, o.read_u32(12).unwrap() | 0x1).unwrap();
        o.write_field(&field, FieldValue::U32(5)).unwrap();
        assert_eq!(o.read_u32(12).unwrap(), (5 << 3) | 1);
    }

    #[test]
    fn signed_bitfield_sign_extends() {
        let mut o = object(vec![0; 16]);
        let field = FieldDef {
            name: "delta".into(),
            offset: 8,
            size: 4,
            kind: FieldKind::Bitfield {
                storage: ScalarKind::U32,
                bits: 5,
                shift: 2,
                signed: true,
            },
        };
        o.write_field(&field, FieldValue::I32(-3)).unwrap();
        assert_eq!(o.read_field(&field).unwrap(), FieldValue::I32(-3));
    }

    #[test]
    fn memory_descriptor_roundtrip() {
        let mut o = object(vec![0; 48]);
        let desc = MemoryDescriptor {
            size: 8,
            flags: MEMORY_ACTIVE_BIT,
            ptr: 0x0800_0030,
        };
        o.write_memory_descriptor(28, &desc).unwrap();
        let back = o.memory_descriptor(28).unwrap();
        assert_eq!(back, desc);
        assert!(back.is_active());
    }

    #[test]
    fn half_field_widens() {
        let mut o = object(vec![0; 16]);
        let field = FieldDef {
            name: "h".into(),
            offset: 8,
            size: 2,
            kind: FieldKind::Scalar(ScalarKind::F16),
        };
        o.write_field(&field, FieldValue::F32(1.5)).unwrap();
        assert_eq!(o.read_field(&field).unwrap(), FieldValue::F32(1.5));
    }
}
