use std::sync::Arc;

use pretty_assertions::assert_eq;

use igz_core::chunk::encode_object_offset;
use igz_core::cursor::ByteWriter;
use igz_core::object::MEMORY_ACTIVE_BIT;
use igz_core::{
    name_hash, Error, FieldDef, FieldKind, FixupData, FixupKind, FixupTable, Igz,
    NoForeignResolver, ObjectStatus, ScalarKind, StaticTypeRegistry, TypeMetadata,
    EXNM_HANDLE_BIT, MAGIC, TRAILER_MAGIC, VERSION,
};

fn registry() -> Arc<StaticTypeRegistry> {
    let mut reg = StaticTypeRegistry::new();
    reg.register("igObjectList", 16, vec![]);
    reg.register("igNameList", 16, vec![]);
    reg.register(
        "Widget",
        48,
        vec![
            field("flags", 8, 4, FieldKind::Scalar(ScalarKind::U32)),
            field(
                "health",
                12,
                4,
                FieldKind::Bitfield {
                    storage: ScalarKind::U32,
                    bits: 7,
                    shift: 3,
                    signed: false,
                },
            ),
            field("next", 16, 4, FieldKind::ObjectRef),
            field("label", 20, 4, FieldKind::StringIndex),
            field("buddy", 24, 4, FieldKind::Handle),
            field("payload", 28, 12, FieldKind::ObjectRefArray),
            field("scale", 40, 4, FieldKind::Scalar(ScalarKind::F32)),
            field("spare", 44, 4, FieldKind::Scalar(ScalarKind::U32)),
        ],
    );
    reg.register(
        "Blob",
        32,
        vec![field("kind", 8, 4, FieldKind::Scalar(ScalarKind::U32))],
    );
    Arc::new(reg)
}

fn field(name: &str, offset: u32, size: u32, kind: FieldKind) -> FieldDef {
    FieldDef {
        name: name.into(),
        offset,
        size,
        kind,
    }
}

fn table(kind: FixupKind, data: FixupData) -> FixupTable {
    let mut t = FixupTable::empty(kind);
    t.update(data).unwrap();
    t
}

fn put32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Two-chunk container with four objects:
/// - `root` (Widget, rel 0): pointer to `leaf`, a string label, a handle to
///   `leaf` and an inline pointer array with two more `leaf` references
/// - `leaf` (Blob, rel 64)
/// - the object list (rel 96) and name list (rel 128) naming both
fn fixture_bytes() -> Vec<u8> {
    let strings: Vec<String> = [
        "Widget",
        "Blob",
        "igObjectList",
        "igNameList",
        "root",
        "leaf",
        "label_a",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let tables = [
        table(FixupKind::Tstr, FixupData::Strings(strings)),
        table(FixupKind::Tmet, FixupData::Ints(vec![0, 1, 2, 3])),
        table(
            FixupKind::Exnm,
            FixupData::IntPairs(vec![(name_hash("leaf"), EXNM_HANDLE_BIT)]),
        ),
        table(FixupKind::Rvtb, FixupData::Offsets(vec![0, 64, 96, 128])),
        table(FixupKind::Rstt, FixupData::Offsets(vec![20, 144, 152])),
        table(
            FixupKind::Rofs,
            FixupData::Offsets(vec![16, 36, 48, 52, 112, 116]),
        ),
        table(FixupKind::Rhnd, FixupData::Offsets(vec![24])),
    ];
    let chunk0_size: u32 = tables.iter().map(|t| t.byte_size()).sum();
    let chunk0_offset = 0x40u32;
    let chunk1_offset = chunk0_offset + chunk0_size;
    let chunk1_size = 160u32;

    let mut w = ByteWriter::new();
    w.write_u32(MAGIC);
    w.write_u32(VERSION);
    w.write_u32(0xDEAD_BEEF);
    w.write_u32(0);
    w.write_u32(0x4649_5855);
    w.write_u32(0);
    w.write_u32(chunk0_offset);
    w.write_u32(chunk0_size);
    w.write_u32(0x4F42_4A53);
    w.write_u32(0);
    w.write_u32(chunk1_offset);
    w.write_u32(chunk1_size);
    w.write_bytes(&[0u8; 16]);
    assert_eq!(w.len(), chunk0_offset as usize);

    for t in &tables {
        w.write_bytes(t.raw_bytes());
    }

    let mut objs = vec![0u8; chunk1_size as usize];
    // root: Widget
    put32(&mut objs, 0, 0); // type index
    put32(&mut objs, 4, 1); // referenced by the object list
    put32(&mut objs, 8, 0xAABB_CCDD);
    put32(&mut objs, 12, 100 << 3);
    put32(&mut objs, 16, encode_object_offset(64));
    put32(&mut objs, 20, 6);
    put32(&mut objs, 24, 0);
    put32(&mut objs, 28, 8); // payload size
    put32(&mut objs, 32, MEMORY_ACTIVE_BIT);
    put32(&mut objs, 36, encode_object_offset(48));
    put32(&mut objs, 40, 1.5f32.to_bits());
    put32(&mut objs, 48, encode_object_offset(64));
    put32(&mut objs, 52, encode_object_offset(64));
    // leaf: Blob
    put32(&mut objs, 64, 1);
    put32(&mut objs, 68, 5); // list + next + two cells + handle
    put32(&mut objs, 72, 7);
    // object list
    put32(&mut objs, 96, 2);
    put32(&mut objs, 104, 2);
    put32(&mut objs, 112, encode_object_offset(0));
    put32(&mut objs, 116, encode_object_offset(64));
    // name list
    put32(&mut objs, 128, 3);
    put32(&mut objs, 136, 2);
    put32(&mut objs, 144, 4);
    put32(&mut objs, 148, name_hash("root"));
    put32(&mut objs, 152, 5);
    put32(&mut objs, 156, name_hash("leaf"));
    w.write_bytes(&objs);

    w.write_bytes(&TRAILER_MAGIC);
    w.write_bytes(&[0u8; 4]);
    w.write_u32(7);
    w.into_inner()
}

fn parse_fixture() -> Igz {
    Igz::parse(&fixture_bytes(), registry()).unwrap()
}

#[test]
fn unmodified_roundtrip_is_byte_exact() {
    let bytes = fixture_bytes();
    let igz = Igz::parse(&bytes, registry()).unwrap();
    let out = igz.serialize().unwrap();
    assert_eq!(hex::encode(&out), hex::encode(&bytes));
}

#[test]
fn parse_populates_objects_names_and_offsets() {
    let igz = parse_fixture();
    assert_eq!(igz.object_count(), 4);

    let root = igz.find_by_name("root").unwrap();
    let leaf = igz.find_by_name("leaf").unwrap();
    assert_eq!(igz.object(root).unwrap().type_name(), "Widget");
    assert_eq!(igz.object(leaf).unwrap().type_name(), "Blob");
    assert_eq!(igz.object(leaf).unwrap().relative_offset(), 64);

    let base = igz.chunks().base(1).unwrap();
    assert_eq!(igz.object_at_absolute(base + 64).unwrap(), leaf);
    assert_eq!(igz.object_at_absolute(base + 80).unwrap(), leaf);
    assert!(matches!(
        igz.object_at_absolute(base + 4096),
        Err(Error::NoObjectAt(_))
    ));

    // liveness comes from the offset sets alone
    let root_obj = igz.object(root).unwrap();
    assert_eq!(root_obj.slot_kind(16), Some(FixupKind::Rofs));
    assert_eq!(root_obj.slot_kind(20), Some(FixupKind::Rstt));
    assert_eq!(root_obj.slot_kind(24), Some(FixupKind::Rhnd));
    assert_eq!(root_obj.slot_kind(44), None);
    assert_eq!(igz.trailer().unwrap().file_kind, 7);
}

#[test]
fn graph_edges_and_reference_counts() {
    let mut igz = parse_fixture();
    assert!(matches!(igz.children_of(igz.sorted_ids()[0]), Err(Error::StaleGraph)));

    igz.derive_graph().unwrap();
    let root = igz.find_by_name("root").unwrap();
    let leaf = igz.find_by_name("leaf").unwrap();

    let children = igz.children_of(root).unwrap();
    assert_eq!(children.len(), 4);
    assert!(children.iter().all(|e| e.child == leaf));
    assert_eq!(
        children.iter().filter(|e| e.kind == FixupKind::Rhnd).count(),
        1
    );
    assert_eq!(igz.references_of(leaf).unwrap().len(), 5);
    assert_eq!(igz.object(leaf).unwrap().reference_count().unwrap(), 5);

    // stored counts agree with derived inbound edges
    igz.reconcile_refcounts(true).unwrap();
}

#[test]
fn field_reads_interpret_metadata() {
    let igz = parse_fixture();
    let root = igz.find_by_name("root").unwrap();
    let widget_fields = registry();
    let fields = widget_fields.fields_of("Widget").unwrap().to_vec();
    let by_name = |n: &str| fields.iter().find(|f| f.name == n).unwrap().clone();

    use igz_core::FieldValue;
    assert_eq!(
        igz.read_object_field(root, &by_name("flags")).unwrap(),
        FieldValue::U32(0xAABB_CCDD)
    );
    assert_eq!(
        igz.read_object_field(root, &by_name("health")).unwrap(),
        FieldValue::U32(100)
    );
    assert_eq!(
        igz.read_object_field(root, &by_name("scale")).unwrap(),
        FieldValue::F32(1.5)
    );
    // label resolves through the string table
    let label = igz.read_object_field(root, &by_name("label")).unwrap();
    assert_eq!(
        igz.fixups().string_at(label.as_u32().unwrap()).unwrap(),
        "label_a"
    );
    // inline payload is owned by root itself
    let block = igz.read_memory(root, &by_name("payload")).unwrap().unwrap();
    assert_eq!(block.owner, root);
    assert_eq!(block.data.len(), 8);
}

#[test]
fn create_relayout_and_reparse() {
    let mut igz = parse_fixture();
    let id = igz.create_object("Widget", Some("spawned")).unwrap();
    assert!(igz.needs_relayout());
    assert!(matches!(igz.serialize(), Err(Error::PendingRelayout)));

    igz.relayout(false).unwrap();
    for obj in igz.objects() {
        assert_eq!(obj.relative_offset() % 16, 0);
    }
    assert_eq!(igz.object(id).unwrap().reference_count().unwrap(), 1);

    let bytes = igz.serialize().unwrap();
    let mut back = Igz::parse(&bytes, registry()).unwrap();
    let spawned = back.find_by_name("spawned").unwrap();
    assert_eq!(back.object(spawned).unwrap().type_name(), "Widget");
    assert!(back
        .object(spawned)
        .unwrap()
        .status()
        .contains(ObjectStatus::CUSTOM));

    back.derive_graph().unwrap();
    back.reconcile_refcounts(true).unwrap();
}

#[test]
fn unknown_type_is_rejected_on_create() {
    let mut igz = parse_fixture();
    assert!(matches!(
        igz.create_object("Gadget", None),
        Err(Error::UnknownType(_))
    ));
}

#[test]
fn clone_carries_every_live_slot() {
    let mut igz = parse_fixture();
    igz.derive_graph().unwrap();
    let root = igz.find_by_name("root").unwrap();
    let leaf = igz.find_by_name("leaf").unwrap();

    let copy = igz.clone_object(root, Some("root_copy")).unwrap();
    igz.relayout(false).unwrap();

    let copy_obj = igz.object(copy).unwrap();
    // four header slots plus the two re-appended payload cells
    assert_eq!(copy_obj.live_slots().len(), 6);
    assert_eq!(copy_obj.slot_kind(48), Some(FixupKind::Rofs));

    let children = igz.children_of(copy).unwrap();
    assert_eq!(children.len(), 4);
    assert!(children.iter().all(|e| e.child == leaf));

    // the label still resolves in the (shared) string table
    let label = copy_obj.read_u32(20).unwrap();
    assert_eq!(igz.fixups().string_at(label).unwrap(), "label_a");

    // the payload pointer now targets the clone's own data
    let block_field = field("payload", 28, 12, FieldKind::ObjectRefArray);
    let block = igz.read_memory(copy, &block_field).unwrap().unwrap();
    assert_eq!(block.owner, copy);

    let bytes = igz.serialize().unwrap();
    let mut back = Igz::parse(&bytes, registry()).unwrap();
    back.derive_graph().unwrap();
    back.reconcile_refcounts(true).unwrap();
}

#[test]
fn delete_cascades_to_orphaned_children() {
    let mut igz = parse_fixture();
    igz.derive_graph().unwrap();
    let root = igz.find_by_name("root").unwrap();
    let leaf = igz.find_by_name("leaf").unwrap();

    let deleted = igz.delete_object(root, true).unwrap();
    assert!(deleted.contains(&root));
    // leaf was reachable only through root (the list does not count)
    assert!(deleted.contains(&leaf));
    assert_eq!(igz.object_count(), 2);

    igz.relayout(false).unwrap();
    let bytes = igz.serialize().unwrap();
    let back = Igz::parse(&bytes, registry()).unwrap();
    assert_eq!(back.object_count(), 2);
    assert!(back.find_by_name("root").is_none());
}

#[test]
fn delete_spares_children_with_other_parents() {
    let mut igz = parse_fixture();
    igz.derive_graph().unwrap();
    let root = igz.find_by_name("root").unwrap();
    let leaf = igz.find_by_name("leaf").unwrap();

    // a second referrer keeps leaf alive
    igz.clone_object(root, Some("root2")).unwrap();
    igz.derive_graph().unwrap();

    let deleted = igz.delete_object(root, true).unwrap();
    assert_eq!(deleted, vec![root]);
    assert!(igz.object(leaf).is_ok());
}

#[test]
fn delete_requires_a_derived_graph() {
    let mut igz = parse_fixture();
    let root = igz.find_by_name("root").unwrap();
    assert!(matches!(
        igz.delete_object(root, true),
        Err(Error::StaleGraph)
    ));
}

#[test]
fn rename_updates_the_string_table_in_place() {
    let mut igz = parse_fixture();
    let leaf = igz.find_by_name("leaf").unwrap();
    let old_index = igz.fixups().find_string("leaf").unwrap();

    igz.rename_object(leaf, "hero").unwrap();

    // sole user: the entry was rewritten, not appended
    assert_eq!(igz.fixups().string_at(old_index).unwrap(), "hero");
    assert!(igz.fixups().find_string("leaf").is_none());
    assert_eq!(igz.find_by_name("hero"), Some(leaf));

    // the handle entry follows the rename, so the edge survives
    igz.relayout(true).unwrap();
    let root = igz.find_by_name("root").unwrap();
    let children = igz.children_of(root).unwrap();
    assert_eq!(
        children.iter().filter(|e| e.kind == FixupKind::Rhnd).count(),
        1
    );

    // first rename records the original name hash in the trailer state
    let obj = igz.object(leaf).unwrap();
    assert!(obj.status().contains(ObjectStatus::HAS_NAME_HASH));
    assert!(obj.status().contains(ObjectStatus::MODIFIED));
    assert_eq!(obj.original_name_hash(), Some(name_hash("leaf")));

    let bytes = igz.serialize().unwrap();
    let back = Igz::parse(&bytes, registry()).unwrap();
    let hero = back.find_by_name("hero").unwrap();
    assert_eq!(back.object(hero).unwrap().original_name_hash(), Some(name_hash("leaf")));
}

#[test]
fn deactivating_a_slot_detaches_the_edge() {
    let mut igz = parse_fixture();
    igz.derive_graph().unwrap();
    let root = igz.find_by_name("root").unwrap();
    let leaf = igz.find_by_name("leaf").unwrap();

    igz.activate_fixup(root, FixupKind::Rofs, 16, false, 0).unwrap();
    igz.relayout(false).unwrap();

    assert_eq!(igz.references_of(leaf).unwrap().len(), 4);
    assert_eq!(igz.object(leaf).unwrap().reference_count().unwrap(), 4);
    assert_eq!(
        igz.fixups().offsets(FixupKind::Rofs).to_vec(),
        vec![36, 48, 52, 112, 116]
    );
    // an inactive zero cell is scalar space, not a null pointer
    assert_eq!(igz.object(root).unwrap().slot_kind(16), None);
}

#[test]
fn strict_relayout_reports_refcount_drift() {
    let mut igz = parse_fixture();
    igz.derive_graph().unwrap();
    let root = igz.find_by_name("root").unwrap();
    igz.activate_fixup(root, FixupKind::Rofs, 16, false, 0).unwrap();
    // leaf still claims five references but only four edges remain
    assert!(matches!(
        igz.relayout(true),
        Err(Error::RefCountMismatch { .. })
    ));
}

#[test]
fn clone_into_remaps_against_the_destination() {
    let src = {
        let mut igz = parse_fixture();
        igz.derive_graph().unwrap();
        igz
    };
    let mut dst = parse_fixture();
    let root = src.find_by_name("root").unwrap();

    let imported = src
        .clone_into(root, &mut dst, Some("root_imported"), &NoForeignResolver)
        .unwrap();
    dst.relayout(false).unwrap();

    let leaf_dst = dst.find_by_name("leaf").unwrap();
    let children = dst.children_of(imported).unwrap();
    assert_eq!(children.len(), 4);
    assert!(children.iter().all(|e| e.child == leaf_dst));

    let bytes = dst.serialize().unwrap();
    let mut back = Igz::parse(&bytes, registry()).unwrap();
    assert!(back.find_by_name("root_imported").is_some());
    back.derive_graph().unwrap();
    back.reconcile_refcounts(true).unwrap();
}

#[test]
fn clone_into_drops_unresolvable_dependencies() {
    let src = parse_fixture();
    let mut dst = parse_fixture();
    let leaf_dst = dst.find_by_name("leaf").unwrap();
    dst.rename_object(leaf_dst, "other").unwrap();

    let root = src.find_by_name("root").unwrap();
    let imported = src
        .clone_into(root, &mut dst, Some("orphan"), &NoForeignResolver)
        .unwrap();
    dst.relayout(false).unwrap();

    // the pointer and cell slots to the missing "leaf" were deactivated
    let obj = dst.object(imported).unwrap();
    assert_eq!(obj.slot_kind(16), None);
    assert_eq!(obj.read_u32(16).unwrap(), 0);
    // the handle slot survives but no longer resolves: flagged, not fatal
    assert!(obj.is_invalid());
}

#[test]
fn bad_signature_and_version_are_fatal() {
    let mut bytes = fixture_bytes();
    bytes[0] ^= 0xFF;
    assert!(matches!(
        Igz::parse(&bytes, registry()),
        Err(Error::BadSignature { .. })
    ));

    let mut bytes = fixture_bytes();
    put32(&mut bytes, 4, 11);
    assert!(matches!(
        Igz::parse(&bytes, registry()),
        Err(Error::UnsupportedVersion(11))
    ));
}

#[test]
fn missing_mandatory_table_is_fatal() {
    // a container with strings and types but no object offset table
    let tables = [
        table(FixupKind::Tstr, FixupData::Strings(vec!["Widget".into()])),
        table(FixupKind::Tmet, FixupData::Ints(vec![0])),
    ];
    let chunk0_size: u32 = tables.iter().map(|t| t.byte_size()).sum();
    let mut w = ByteWriter::new();
    w.write_u32(MAGIC);
    w.write_u32(VERSION);
    w.write_u32(0);
    w.write_u32(0);
    w.write_u32(1);
    w.write_u32(0);
    w.write_u32(0x40);
    w.write_u32(chunk0_size);
    w.write_u32(2);
    w.write_u32(0);
    w.write_u32(0x40 + chunk0_size);
    w.write_u32(0);
    w.write_bytes(&[0u8; 16]);
    for t in &tables {
        w.write_bytes(t.raw_bytes());
    }
    assert!(matches!(
        Igz::parse(w.as_slice(), registry()),
        Err(Error::MissingFixup(FixupKind::Rvtb))
    ));
}
