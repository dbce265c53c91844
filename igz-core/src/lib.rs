//! igz-core
//!
//! Engine for the IGZ chunked object container: parse a file into chunks,
//! fixup tables and typed objects, derive the reference graph, apply
//! structural edits (create / clone / delete / rename / slot activation)
//! and serialize back out, byte-exact for untouched files.
//!
//! The crate performs no I/O and holds no type knowledge of its own: byte
//! buffers come from the embedding application, field layouts from a
//! [`meta::TypeMetadata`] service.

pub mod chunk;
pub mod container;
pub mod cursor;
pub mod error;
pub mod fixup;
pub mod graph;
pub mod hash;
pub mod meta;
pub mod object;

pub use container::{
    ForeignResolver, Igz, MemoryBlock, NoForeignResolver, TrailerInfo, MAGIC, NAME_LIST_TYPE,
    OBJECT_ALIGN, OBJECT_LIST_TYPE, TRAILER_MAGIC, VERSION,
};
pub use error::{Error, Result};
pub use fixup::{FixupData, FixupKind, FixupSet, FixupTable, EXNM_HANDLE_BIT};
pub use graph::{Edge, ObjectGraph};
pub use hash::name_hash;
pub use meta::{FieldDef, FieldKind, FieldValue, ScalarKind, StaticTypeRegistry, TypeMetadata};
pub use object::{MemoryDescriptor, ObjectId, ObjectStatus, TypedObject};
