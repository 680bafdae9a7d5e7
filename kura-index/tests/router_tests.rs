//! # Router Tests
//!
//! This test suite covers:
//! - Binary index build / load / lookup (exact vs prefix vs miss)
//! - Validation of rejected index files
//! - Writer-mode and reader-mode router initialization
//! - Lazy open, denial handling, and reset_access

use tempfile::TempDir;

use kura_core::StoreConfig;
use kura_index::{BinaryIndex, ContextRouter, IndexBuilder};
use kura_storage::ValueBuf;

fn build_index(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("property_info");
    let mut builder = IndexBuilder::new();
    builder.add("ro.*", "u:object_r:ro_prop:s0", None, false);
    builder.add("ro.build.id", "u:object_r:build_prop:s0", Some("string"), true);
    builder.add("ctl.*", "u:object_r:ctl_prop:s0", None, false);
    builder.add("ctl.start", "u:object_r:ctl_start_prop:s0", None, true);
    builder.add("persist.*", "u:object_r:persist_prop:s0", None, false);
    builder.write_to(&path).unwrap();
    path
}

#[test]
fn exact_match_beats_prefix() {
    let dir = TempDir::new().unwrap();
    let index = BinaryIndex::load(&build_index(&dir)).unwrap();

    assert_eq!(index.context_for("ro.build.id"), Some("u:object_r:build_prop:s0"));
    assert_eq!(index.context_for("ro.other"), Some("u:object_r:ro_prop:s0"));
    assert_eq!(index.context_for("ro.build.other"), Some("u:object_r:ro_prop:s0"));
    assert_eq!(index.context_for("ctl.start"), Some("u:object_r:ctl_start_prop:s0"));
    assert_eq!(index.context_for("ctl.stop"), Some("u:object_r:ctl_prop:s0"));
    // No wildcard in this index: unrouted names miss.
    assert_eq!(index.context_for("rw.x"), None);
}

#[test]
fn wildcard_is_the_last_resort() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("property_info");
    let mut builder = IndexBuilder::new();
    builder.add("sys.*", "sys_label", None, false);
    builder.add("*", "default_label", None, false);
    builder.write_to(&path).unwrap();

    let index = BinaryIndex::load(&path).unwrap();
    assert_eq!(index.context_for("sys.anything"), Some("sys_label"));
    assert_eq!(index.context_for("rw.x"), Some("default_label"));
    assert_eq!(index.context_for("x"), Some("default_label"));
}

#[test]
fn type_indexes_resolve_alongside_contexts() {
    let dir = TempDir::new().unwrap();
    let index = BinaryIndex::load(&build_index(&dir)).unwrap();

    let (context, type_index) = index.get_indexes("ro.build.id");
    assert_eq!(index.context(context), Some("u:object_r:build_prop:s0"));
    assert_eq!(index.type_name(type_index), Some("string"));

    let (_, no_type) = index.get_indexes("persist.sys.x");
    assert_eq!(index.type_name(no_type), None);
}

#[test]
fn context_array_is_binary_searchable() {
    let dir = TempDir::new().unwrap();
    let index = BinaryIndex::load(&build_index(&dir)).unwrap();

    for i in 0..index.num_contexts() {
        let name = index.context(i as u32).unwrap().to_string();
        assert_eq!(index.find_context_index(&name), Some(i as u32));
    }
    assert_eq!(index.find_context_index("u:object_r:absent:s0"), None);
}

#[test]
fn load_rejects_bad_files() {
    let dir = TempDir::new().unwrap();

    let truncated = dir.path().join("truncated");
    std::fs::write(&truncated, &[0u8; 8]).unwrap();
    assert!(BinaryIndex::load(&truncated).is_err());

    // Recorded size must match the mapped size.
    let resized = dir.path().join("resized");
    let mut builder = IndexBuilder::new();
    builder.add("sys.*", "sys_label", None, false);
    let mut bytes = builder.build();
    bytes.extend_from_slice(&[0u8; 64]);
    std::fs::write(&resized, &bytes).unwrap();
    assert!(BinaryIndex::load(&resized).is_err());

    // A future minimum_supported_version is refused.
    let future = dir.path().join("future");
    let mut bytes = builder.build();
    bytes[4..8].copy_from_slice(&2u32.to_le_bytes());
    std::fs::write(&future, &bytes).unwrap();
    assert!(BinaryIndex::load(&future).is_err());
}

fn writer_config(dir: &TempDir) -> StoreConfig {
    let mut config = StoreConfig::for_dir(dir.path().join("__properties__"));
    config.binary_index = build_index(dir);
    config
}

#[test]
fn writer_router_creates_areas_and_routes_writes() {
    let dir = TempDir::new().unwrap();
    let config = writer_config(&dir);
    let (router, label_failed) = ContextRouter::create(&config).unwrap();
    assert!(router.is_rw());
    // In an unprivileged test environment the xattr either applies or is
    // reported; both are acceptable here.
    let _ = label_failed;

    let area = router.area_for_name("persist.sys.locale").unwrap();
    area.add("persist.sys.locale", b"en-US").unwrap();

    // Same context, same area; different context, different area.
    let again = router.area_for_name("persist.sys.timezone").unwrap();
    assert!(std::sync::Arc::ptr_eq(&area, &again));
    let ro_area = router.area_for_name("ro.build.date").unwrap();
    assert!(!std::sync::Arc::ptr_eq(&area, &ro_area));

    // Unrouted names are denied.
    assert!(router.area_for_name("rw.unrouted").is_none());

    // The label travels with the route.
    assert_eq!(
        router.label_for_name("persist.sys.locale"),
        Some("u:object_r:persist_prop:s0")
    );
}

#[test]
fn reader_router_sees_writer_state_lazily() {
    let dir = TempDir::new().unwrap();
    let config = writer_config(&dir);
    let (writer, _) = ContextRouter::create(&config).unwrap();
    writer
        .area_for_name("persist.counter")
        .unwrap()
        .add("persist.counter", b"41")
        .unwrap();

    let reader = ContextRouter::open(&config).unwrap();
    let area = reader.area_for_name("persist.counter").unwrap();
    let off = area.find("persist.counter").unwrap();
    let mut buf = ValueBuf::new();
    area.read_value(area.entry_at(off).unwrap(), &mut buf);
    assert_eq!(buf.as_str(), "41");
}

#[test]
fn foreach_skips_missing_areas_and_reset_reconsiders() {
    let dir = TempDir::new().unwrap();
    let config = writer_config(&dir);
    let (writer, _) = ContextRouter::create(&config).unwrap();
    writer
        .area_for_name("persist.kept")
        .unwrap()
        .add("persist.kept", b"1")
        .unwrap();

    // Remove one context's backing file, then enumerate from a fresh reader:
    // the missing area is skipped, the rest are visited.
    std::fs::remove_file(config.dir.join("u:object_r:ro_prop:s0")).unwrap();
    let reader = ContextRouter::open(&config).unwrap();

    let mut visited = 0usize;
    let mut names = Vec::new();
    reader.foreach_area(|area| {
        visited += 1;
        area.foreach(|_, entry| names.push(entry.name().to_string()));
    });
    assert!(visited >= 1);
    assert!(names.contains(&"persist.kept".to_string()));

    // Point lookups into the missing context are denied but keep auditing.
    assert!(reader.area_for_name("ro.build.date").is_none());
    assert!(reader.area_for_name("ro.build.date").is_none());

    // reset_access re-checks; the file is still gone, so still denied.
    reader.reset_access();
    assert!(reader.area_for_name("ro.build.date").is_none());
}
