//! Error taxonomy for the container engine.
//!
//! Variants fall into four groups:
//! - format errors (bad signature/version, truncated or corrupt tables):
//!   fatal, parsing aborts;
//! - reference errors (dangling pointers, unknown handles): recoverable,
//!   the edge is dropped and the object is marked invalid;
//! - invariant errors (refcount mismatch in strict mode, unaligned offsets
//!   at serialize time, pending structural edits): fatal unless the caller
//!   opted into lenient auto-repair;
//! - lookup errors (unknown type names, out-of-range string indices):
//!   recoverable, the caller gets an `Err` it can treat as a sentinel.

use thiserror::Error;

use crate::fixup::FixupKind;
use crate::object::ObjectId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("bad signature {found:#010x}, expected {expected:#010x}")]
    BadSignature { found: u32, expected: u32 },

    #[error("unsupported container version {0}")]
    UnsupportedVersion(u32),

    #[error("truncated data: wanted {wanted} bytes at offset {offset:#x}, buffer is {len:#x}")]
    Truncated {
        offset: usize,
        wanted: usize,
        len: usize,
    },

    #[error("container declares {0} chunks, at least two are required")]
    TooFewChunks(usize),

    #[error("chunk {0} is not in the chunk table")]
    ChunkNotFound(u32),

    #[error("unknown fixup tag {0:?}")]
    UnknownFixupTag([u8; 4]),

    #[error("corrupt fixup record at chunk offset {offset:#x}: {reason}")]
    BadFixupRecord { offset: usize, reason: &'static str },

    #[error("mandatory fixup table {0} is missing")]
    MissingFixup(FixupKind),

    #[error("delta stream exhausted after {decoded} of {expected} values")]
    DeltaUnderrun { decoded: usize, expected: usize },

    #[error("offset {0:#x} is not a multiple of 4")]
    MisalignedFixupOffset(u32),

    #[error("value family does not match fixup table {0}")]
    FixupDataMismatch(FixupKind),

    #[error("fixup {0} does not describe per-object slots")]
    NotSlotFixup(FixupKind),

    #[error("string table index {0} is out of range")]
    BadStringIndex(u32),

    #[error("type table index {0} is out of range")]
    BadTypeIndex(u32),

    #[error("object at offset {offset:#x} is {size} bytes, smaller than the intrinsic header")]
    ObjectTooSmall { offset: u32, size: u32 },

    #[error("no object covers absolute offset {0:#x}")]
    NoObjectAt(u32),

    #[error("object {0} has been deleted")]
    DeadObject(ObjectId),

    #[error("object graph is stale, call derive_graph first")]
    StaleGraph,

    #[error("structural edits are pending, call relayout before serialize")]
    PendingRelayout,

    #[error("object {id} reference count mismatch: stored {stored}, counted {counted}")]
    RefCountMismatch {
        id: ObjectId,
        stored: u32,
        counted: u32,
    },

    #[error("object {id} offset {offset:#x} is not 16-byte aligned")]
    UnalignedObject { id: ObjectId, offset: u32 },

    #[error("field range {offset:#x}+{len} escapes object data of {size} bytes")]
    FieldOutOfBounds { offset: u32, len: u32, size: u32 },

    #[error("field kind mismatch: {0}")]
    FieldKindMismatch(&'static str),

    #[error("chunk {chunk} size mismatch: table says {expected:#x}, content is {actual:#x}")]
    ChunkSizeMismatch {
        chunk: usize,
        expected: u32,
        actual: u32,
    },

    #[error("type {0:?} is not known to the metadata service")]
    UnknownType(String),
}
