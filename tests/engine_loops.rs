//! End-to-end behaviour of the engine tasks over an in-memory transport.

use meshtrack::config::Config;
use meshtrack::mesh::transport::{self, MemoryLink, MemoryTransport};
use meshtrack::mesh::{
    MeshEngine, MeshHandle, MeshSnapshot, MeshTiming, SelfState, SnapshotPersister,
};
use meshtrack::node::MeshNode;
use meshtrack::storage::SnapshotFile;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn fast_timing() -> MeshTiming {
    MeshTiming {
        send_interval: Duration::from_millis(20),
        send_settle: Duration::from_millis(1),
        error_cooldown: Duration::from_millis(20),
        idle_poll: Duration::from_millis(5),
        report_interval: Duration::from_millis(30),
        stale_after: None,
        ..MeshTiming::default()
    }
}

fn engine(timing: MeshTiming) -> (MeshEngine, MemoryLink) {
    let (transport, link) = MemoryTransport::pair();
    let engine = MeshEngine::new(
        SelfState::new("001", 55.755864, 37.617698),
        transport::shared(transport),
        timing,
    );
    (engine, link)
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn has_neighbor(handle: &MeshHandle, id: &str) -> bool {
    handle.snapshot().neighbor(id).is_some()
}

#[tokio::test]
async fn transmit_loop_broadcasts_own_position() {
    let (engine, link) = engine(fast_timing());
    let handle = engine.handle();
    let tasks = engine.spawn();

    wait_until("two frames written", || link.written().len() >= 2).await;
    assert_eq!(link.written()[0], b"S001;55.755864;37.617698E".to_vec());

    handle.set_position(1.5, 2.5);
    wait_until("updated position written", || {
        link.written().iter().any(|w| w.as_slice() == b"S001;1.5;2.5E")
    })
    .await;

    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(2), tasks.join())
        .await
        .expect("tasks did not stop");
}

#[tokio::test]
async fn transmit_loop_survives_write_failures() {
    let (engine, link) = engine(fast_timing());
    link.fail_next_writes(3);
    let handle = engine.handle();
    let tasks = engine.spawn();

    wait_until("a successful write", || !link.written().is_empty()).await;
    let metrics = handle.metrics();
    assert_eq!(metrics.send_errors, 3);
    assert!(metrics.frames_sent >= 1);

    handle.shutdown();
    tasks.join().await;
}

#[tokio::test]
async fn receive_loop_reassembles_fragmented_frames() {
    let (engine, link) = engine(fast_timing());
    let handle = engine.handle();
    let tasks = engine.spawn();

    link.inject(b"noise S004;1.");
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!has_neighbor(&handle, "004"));
    link.inject(b"0;2.0E");
    wait_until("neighbor 004", || has_neighbor(&handle, "004")).await;

    let snap = handle.snapshot();
    let peer = snap.neighbor("004").unwrap();
    assert_eq!((peer.x, peer.y), (1.0, 2.0));

    handle.shutdown();
    tasks.join().await;
}

#[tokio::test]
async fn receive_loop_filters_self_malformed_and_duplicates() {
    let (engine, link) = engine(fast_timing());
    let handle = engine.handle();
    let tasks = engine.spawn();

    link.inject(b"S001;9.0;9.0ES001;abc;37ES002;55.80;37.70;-67ES002;55.80;37.70ES003;55.80;37.70E");
    wait_until("two accepted frames", || handle.metrics().frames_accepted == 2).await;

    let snap = handle.snapshot();
    assert!(snap.neighbor("001").is_none());
    assert_eq!(snap.neighbors.len(), 2);
    assert_eq!(snap.neighbor("002").unwrap().signal_strength, Some(-67.0));
    assert_eq!(snap.neighbor("003").unwrap().signal_strength, None);

    let metrics = handle.metrics();
    assert_eq!(metrics.frames_self_echo, 1);
    assert_eq!(metrics.frames_malformed, 1);
    assert_eq!(metrics.frames_duplicate, 1);
    assert_eq!(metrics.frames_accepted, 2);

    handle.shutdown();
    tasks.join().await;
}

#[tokio::test]
async fn receive_loop_recovers_from_read_errors() {
    let (engine, link) = engine(fast_timing());
    link.fail_next_reads(2);
    link.inject(b"S002;1;2E");
    let handle = engine.handle();
    let tasks = engine.spawn();

    wait_until("neighbor 002", || has_neighbor(&handle, "002")).await;
    assert_eq!(handle.metrics().read_errors, 2);

    handle.shutdown();
    tasks.join().await;
}

#[tokio::test]
async fn accepted_frames_are_persisted() {
    let dir = tempdir().unwrap();
    let file = SnapshotFile::new(dir.path().join("drone_data.json"));
    let (engine, link) = engine(fast_timing());
    let engine = engine.with_persister(Arc::new(file.clone()));
    let handle = engine.handle();
    let tasks = engine.spawn();

    link.inject(b"S002;55.80;37.70;-67E");
    wait_until("snapshot file", || {
        file.load()
            .map(|s| s.neighbor("002").is_some())
            .unwrap_or(false)
    })
    .await;

    let stored = file.load().unwrap();
    assert_eq!(stored.self_state.id, "001");
    assert_eq!(stored.neighbor("002").unwrap().signal_strength, Some(-67.0));

    handle.shutdown();
    tasks.join().await;
}

struct ReadOnlyDisk;

impl SnapshotPersister for ReadOnlyDisk {
    fn persist(&self, _snapshot: &MeshSnapshot) -> anyhow::Result<()> {
        anyhow::bail!("read-only file system")
    }
}

#[tokio::test]
async fn persist_failures_are_counted_and_do_not_stall_receiving() {
    let (engine, link) = engine(fast_timing());
    let engine = engine.with_persister(Arc::new(ReadOnlyDisk));
    let handle = engine.handle();
    let tasks = engine.spawn();

    link.inject(b"S002;1;2E");
    wait_until("first persist failure", || handle.metrics().persist_failures >= 1).await;

    link.inject(b"S003;1;2E");
    wait_until("second persist failure", || handle.metrics().persist_failures >= 2).await;

    let metrics = handle.metrics();
    assert_eq!(metrics.frames_accepted, 2);
    assert_eq!(handle.snapshot().neighbors.len(), 2);

    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(2), tasks.join())
        .await
        .expect("tasks did not stop");
}

#[tokio::test]
async fn silent_peers_are_evicted_by_the_report_loop() {
    let mut timing = fast_timing();
    timing.stale_after = Some(Duration::from_millis(50));
    let (engine, link) = engine(timing);
    let handle = engine.handle();
    let tasks = engine.spawn();

    link.inject(b"S002;1;2E");
    wait_until("neighbor 002", || has_neighbor(&handle, "002")).await;
    wait_until("eviction of 002", || handle.metrics().stale_evictions >= 1).await;
    assert!(!has_neighbor(&handle, "002"));

    handle.shutdown();
    tasks.join().await;
}

#[tokio::test]
async fn node_runs_on_supplied_transport() {
    let dir = tempdir().unwrap();
    let mut config = Config::default();
    config.node.id = "007".into();
    config.viewer.enabled = false;
    config.persist.path = dir.path().join("mesh.json").display().to_string();
    config.mesh.send_interval_ms = 20;
    config.mesh.idle_poll_ms = 5;

    let (transport, link) = MemoryTransport::pair();
    let node = MeshNode::start_with_transport(config, transport::shared(transport))
        .await
        .unwrap();
    let handle = node.handle();

    wait_until("first beacon", || !link.written().is_empty()).await;
    assert!(link.written()[0].starts_with(b"S007;"));

    link.inject(b"S008;3.25;4.75E");
    wait_until("neighbor 008", || has_neighbor(&handle, "008")).await;

    tokio::time::timeout(Duration::from_secs(3), node.shutdown())
        .await
        .expect("node did not stop");
    let stored = SnapshotFile::new(dir.path().join("mesh.json")).load().unwrap();
    assert_eq!(stored.neighbor("008").unwrap().x, 3.25);
}
