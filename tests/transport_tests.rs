//! Transport lifecycle tests
//!
//! Exercise creation, opening, stale-object recovery and cleanup of the
//! named shared memory and semaphores through real POSIX objects. Each test
//! uses its own instance prefix so tests can run in parallel.

use std::time::Duration;

use llamabridge::{
    BridgeClient, BridgeConfig, BridgeError, ClientTransport, ServerTransport,
};

fn test_config(tag: &str) -> BridgeConfig {
    BridgeConfig::builder()
        .prefix(format!("lbtest_{}_{}", std::process::id(), tag))
        .build()
}

#[test]
fn server_creates_then_client_opens() {
    let config = test_config("open");

    let server = ServerTransport::create(&config).unwrap();
    let client = ClientTransport::open(&config).unwrap();

    // Both sides observe the same region.
    assert!(!server.region().shutdown_requested());
    assert!(!client.region().shutdown_requested());
}

#[test]
fn client_cannot_open_without_server() {
    let config = test_config("no_server");

    let err = ClientTransport::open(&config).unwrap_err();
    match err {
        BridgeError::ResourceSetup { resource, .. } => {
            assert!(resource.contains(&config.shm_name()));
        }
        other => panic!("expected ResourceSetup, got {other}"),
    }
}

#[test]
fn server_drop_unlinks_everything() {
    let config = test_config("unlink");

    drop(ServerTransport::create(&config).unwrap());
    assert!(ClientTransport::open(&config).is_err());
}

#[test]
fn stale_objects_are_recovered() {
    let config = test_config("stale");

    // Simulate a crashed server: objects created, destructors never run.
    let first = ServerTransport::create(&config).unwrap();
    std::mem::forget(first);

    // A fresh server must come up anyway, on clean recreated objects.
    let second = ServerTransport::create(&config).unwrap();
    second.ready().post().unwrap();

    let client = ClientTransport::open(&config).unwrap();
    assert!(client.ready().try_wait().unwrap());
}

#[test]
fn semaphores_start_at_zero() {
    let config = test_config("zero");

    let server = ServerTransport::create(&config).unwrap();
    assert!(!server.ready().try_wait().unwrap());
    assert!(!server.prompt_written().try_wait().unwrap());
    assert!(!server.response_written().try_wait().unwrap());
    assert!(!server.chunk_ready().try_wait().unwrap());
}

#[test]
fn posts_cross_the_process_boundary_abstraction() {
    let config = test_config("cross");

    let server = ServerTransport::create(&config).unwrap();
    let client = ClientTransport::open(&config).unwrap();

    server.ready().post().unwrap();
    assert!(client.ready().try_wait().unwrap());

    client.prompt_written().post().unwrap();
    assert!(server.prompt_written().try_wait().unwrap());
}

#[test]
fn region_writes_are_visible_to_the_other_side() {
    let config = test_config("visible");

    let server = ServerTransport::create(&config).unwrap();
    let mut client = ClientTransport::open(&config).unwrap();

    let truncated = client
        .region_mut()
        .write_request("system side", "user side", true);
    assert!(!truncated);

    assert_eq!(server.region().read_system_prompt(), "system side");
    assert_eq!(server.region().read_user_prompt(), "user side");
    assert!(server.region().stream_mode());
}

#[test]
fn client_timeout_surfaces_unresponsive_peer() {
    let config = BridgeConfig::builder()
        .prefix(format!("lbtest_{}_timeout", std::process::id()))
        .wait_timeout(Duration::from_millis(50))
        .build();

    // Transport exists but no server loop is posting `ready`.
    let _server = ServerTransport::create(&config).unwrap();
    let mut client = BridgeClient::connect(&config).unwrap();

    let err = client
        .send(&llamabridge::BridgeRequest::new("anyone there?"))
        .unwrap_err();
    match err {
        BridgeError::PeerUnresponsive { resource, timeout } => {
            assert!(resource.contains("sem_ready"));
            assert_eq!(timeout, Duration::from_millis(50));
        }
        other => panic!("expected PeerUnresponsive, got {other}"),
    }
}
