//! # Wire Client Tests
//!
//! Exercises both protocol framings against a miniature in-process daemon
//! listening on a UNIX socket, the way the real setter daemon does.

use std::io::Write;
use std::os::unix::net::UnixListener;
use std::sync::Arc;
use std::thread;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tempfile::TempDir;

use kura_api::client::{frames, MSG_SET_V2, RESULT_SUCCESS};
use kura_api::{Protocol, PropertyStore, ServiceClient};
use kura_core::StoreConfig;
use kura_index::IndexBuilder;

fn test_config(dir: &TempDir) -> StoreConfig {
    let index_path = dir.path().join("property_info");
    let mut builder = IndexBuilder::new();
    builder.add("ro.*", "u:object_r:ro_prop:s0", None, false);
    builder.add("*", "u:object_r:default_prop:s0", None, false);
    builder.write_to(&index_path).unwrap();

    let mut config = StoreConfig::for_dir(dir.path().join("__properties__"));
    config.binary_index = index_path;
    config.socket_path = dir.path().join("property_service");
    config
}

/// Accept `connections` v2 requests, apply them through the writer store,
/// and reply with a status word.
fn spawn_v2_daemon(
    config: &StoreConfig,
    store: Arc<PropertyStore>,
    connections: usize,
) -> thread::JoinHandle<()> {
    let listener = UnixListener::bind(&config.socket_path).unwrap();
    thread::spawn(move || {
        for _ in 0..connections {
            let (mut stream, _) = listener.accept().unwrap();
            let cmd = stream.read_u32::<LittleEndian>().unwrap();
            assert_eq!(cmd, MSG_SET_V2);
            let request = frames::read_v2(&mut stream).unwrap();
            let status = match store.set(&request.name, &request.value) {
                Ok(()) => RESULT_SUCCESS,
                Err(_) => 1,
            };
            stream.write_u32::<LittleEndian>(status).unwrap();
        }
    })
}

/// Accept `connections` v1 fixed frames; the only acknowledgement is the
/// connection close on drop.
fn spawn_v1_daemon(
    config: &StoreConfig,
    store: Arc<PropertyStore>,
    connections: usize,
) -> thread::JoinHandle<()> {
    let listener = UnixListener::bind(&config.socket_path).unwrap();
    thread::spawn(move || {
        for _ in 0..connections {
            let (mut stream, _) = listener.accept().unwrap();
            let request = frames::read_v1(&mut stream).unwrap();
            let _ = store.set(&request.name, &request.value);
            stream.flush().unwrap();
        }
    })
}

#[test]
fn v2_set_round_trips_through_the_daemon() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let (store, _) = PropertyStore::init_writer(&config).unwrap();
    store.add("ro.property_service.version", "2").unwrap();
    let store = Arc::new(store);

    let daemon = spawn_v2_daemon(&config, Arc::clone(&store), 2);
    let client = ServiceClient::new(&config);

    assert_eq!(client.protocol(&store), Protocol::V2);
    client.set(&store, "sys.via.daemon", "hello").unwrap();
    assert_eq!(store.get("sys.via.daemon").as_deref(), Some("hello"));

    // Long values ride v2 as long as the name is read-only.
    let big = "z".repeat(400);
    client.set(&store, "ro.huge", &big).unwrap();
    assert_eq!(store.get("ro.huge").as_deref(), Some(big.as_str()));

    daemon.join().unwrap();
}

#[test]
fn v2_rejects_long_values_for_mutable_names_client_side() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let (store, _) = PropertyStore::init_writer(&config).unwrap();
    store.add("ro.property_service.version", "2").unwrap();

    let client = ServiceClient::new(&config);
    let err = client.set(&store, "sys.not.ro", &"w".repeat(400)).unwrap_err();
    assert_eq!(err.error_code(), "VALUE_TOO_LONG");
}

#[test]
fn v1_is_chosen_when_the_version_property_is_missing() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let (store, _) = PropertyStore::init_writer(&config).unwrap();
    let store = Arc::new(store);

    let daemon = spawn_v1_daemon(&config, Arc::clone(&store), 1);
    let client = ServiceClient::new(&config);

    assert_eq!(client.protocol(&store), Protocol::V1);
    client.set(&store, "sys.legacy.path", "ok").unwrap();
    daemon.join().unwrap();
    assert_eq!(store.get("sys.legacy.path").as_deref(), Some("ok"));
}

#[test]
fn v1_enforces_the_fixed_frame_limits() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let (store, _) = PropertyStore::init_writer(&config).unwrap();

    let client = ServiceClient::new(&config);
    let long_name = format!("sys.{}", "n".repeat(40));
    let err = client.set(&store, &long_name, "v").unwrap_err();
    assert_eq!(err.error_code(), "NAME_TOO_LONG");

    let err = client.set(&store, "sys.ok", &"v".repeat(100)).unwrap_err();
    assert_eq!(err.error_code(), "VALUE_TOO_LONG");
}

#[test]
fn v1_timeout_is_reported_as_success() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.service_timeout_ms = 50;
    let (store, _) = PropertyStore::init_writer(&config).unwrap();

    // A daemon that reads the frame but dawdles past the client's poll cap.
    let listener = UnixListener::bind(&config.socket_path).unwrap();
    let daemon = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _request = frames::read_v1(&mut stream).unwrap();
        thread::sleep(std::time::Duration::from_millis(300));
    });

    let client = ServiceClient::new(&config);
    // Timeout: the client logs a warning and reports success anyway.
    client.set(&store, "sys.slow.daemon", "v").unwrap();
    daemon.join().unwrap();
}
