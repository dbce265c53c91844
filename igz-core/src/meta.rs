//! External type metadata: per-type field layouts supplied by the host.
//!
//! The engine never owns type knowledge; it consumes a read-only lookup
//! service. [`StaticTypeRegistry`] is the HashMap-backed implementation used
//! by the tests and the CLI, which can load one from a YAML description.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::fixup::FixupKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarKind {
    U8,
    U16,
    U32,
    I32,
    F32,
    F16,
}

impl ScalarKind {
    pub fn byte_size(self) -> u32 {
        match self {
            ScalarKind::U8 => 1,
            ScalarKind::U16 | ScalarKind::F16 => 2,
            ScalarKind::U32 | ScalarKind::I32 | ScalarKind::F32 => 4,
        }
    }
}

/// Declared interpretation of a field's backing bytes.
///
/// Whether a pointer-shaped field is *live* is never decided here; that is
/// the fixup tables' call. Metadata only says what shape the bytes have.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Scalar(ScalarKind),
    Bitfield {
        storage: ScalarKind,
        bits: u8,
        shift: u8,
        signed: bool,
    },
    /// 4-byte packed pointer to another object.
    ObjectRef,
    /// Memory descriptor whose payload cells are packed object pointers.
    ObjectRefArray,
    /// 4-byte index into the string table.
    StringIndex,
    /// 4-byte index into the named-handle table.
    Handle,
    /// 4-byte packed pointer to raw bytes rather than an object header.
    RawRef,
    /// Inline memory descriptor: total size, flags, data pointer.
    Memory,
}

impl FieldKind {
    /// The fixup table that tracks liveness for this field, if any.
    pub fn fixup_kind(&self) -> Option<FixupKind> {
        match self {
            FieldKind::ObjectRef
            | FieldKind::ObjectRefArray
            | FieldKind::RawRef
            | FieldKind::Memory => Some(FixupKind::Rofs),
            FieldKind::StringIndex => Some(FixupKind::Rstt),
            FieldKind::Handle => Some(FixupKind::Rhnd),
            FieldKind::Scalar(_) | FieldKind::Bitfield { .. } => None,
        }
    }

    /// Byte offset of the pointer word inside the field, relative to the
    /// object. Memory-descriptor kinds keep their pointer in the third word.
    pub fn pointer_slot(&self, field_offset: u32) -> Option<u32> {
        match self {
            FieldKind::ObjectRef | FieldKind::RawRef => Some(field_offset),
            FieldKind::StringIndex | FieldKind::Handle => Some(field_offset),
            FieldKind::ObjectRefArray | FieldKind::Memory => Some(field_offset + 8),
            FieldKind::Scalar(_) | FieldKind::Bitfield { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub offset: u32,
    pub size: u32,
    pub kind: FieldKind,
}

/// A typed value read out of (or written into) an object field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    U8(u8),
    U16(u16),
    U32(u32),
    I32(i32),
    F32(f32),
}

impl FieldValue {
    pub fn as_u32(self) -> Option<u32> {
        match self {
            FieldValue::U8(v) => Some(v as u32),
            FieldValue::U16(v) => Some(v as u32),
            FieldValue::U32(v) => Some(v),
            FieldValue::I32(v) => Some(v as u32),
            FieldValue::F32(_) => None,
        }
    }
}

/// Read-only lookup service describing object layouts.
pub trait TypeMetadata {
    fn fields_of(&self, type_name: &str) -> Option<&[FieldDef]>;
    fn size_of(&self, type_name: &str) -> Option<u32>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TypeEntry {
    size: u32,
    fields: Vec<FieldDef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticTypeRegistry {
    types: HashMap<String, TypeEntry>,
}

impl StaticTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, size: u32, fields: Vec<FieldDef>) {
        self.types.insert(name.into(), TypeEntry { size, fields });
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }
}

impl TypeMetadata for StaticTypeRegistry {
    fn fields_of(&self, type_name: &str) -> Option<&[FieldDef]> {
        self.types.get(type_name).map(|t| t.fields.as_slice())
    }

    fn size_of(&self, type_name: &str) -> Option<u32> {
        self.types.get(type_name).map(|t| t.size)
    }
}
