//! # Mesh Engine
//!
//! Drives the position-gossip protocol over a shared byte-stream transport.
//!
//! ## Tasks
//!
//! [`MeshEngine::spawn`] starts independent tokio tasks that share only the
//! [`NeighborTable`], the transport handle and the metrics:
//!
//! - **transmit**: encodes our own state and writes it every `send_interval`
//! - **receive**: polls the transport, feeds the [`FrameScanner`], filters frames and
//!   updates the table, notifying collaborators on every accepted frame
//! - **report**: periodically logs the neighbor list and sweeps stale peers
//! - **persist**: writes the newest snapshot through the configured persister
//!
//! All tasks watch one shutdown signal and exit at their next iteration boundary.
//! Transport errors never stop a loop; they are logged and retried after a cooldown.
//!
//! ## Example
//!
//! ```rust,no_run
//! use meshtrack::mesh::{transport, MeshEngine, MeshTiming, SelfState};
//! use meshtrack::mesh::transport::MemoryTransport;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (link, _peer) = MemoryTransport::pair();
//!     let engine = MeshEngine::new(
//!         SelfState::new("001", 55.755864, 37.617698),
//!         transport::shared(link),
//!         MeshTiming::default(),
//!     );
//!     let handle = engine.handle();
//!     let tasks = engine.spawn();
//!     handle.shutdown();
//!     tasks.join().await;
//! }
//! ```

pub mod codec;
pub mod dedup;
pub mod neighbors;
pub mod transport;

pub use codec::{Frame, FrameError, FrameScanner};
pub use dedup::Deduplicator;
pub use neighbors::{MeshSnapshot, NeighborTable, PeerState, SelfState};

use crate::logutil::escape_bytes;
use crate::metrics::{self, MeshMetrics};
use chrono::Utc;
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use transport::{with_transport, SharedTransport};

const READ_CHUNK: usize = 1024;

/// Fire-and-forget push of the current state to viewers.
pub trait SnapshotPublisher: Send + Sync {
    fn publish(&self, snapshot: &MeshSnapshot);
}

/// Idempotent overwrite of a durable record of the current state.
pub trait SnapshotPersister: Send + Sync {
    fn persist(&self, snapshot: &MeshSnapshot) -> anyhow::Result<()>;
}

/// Loop pacing and filter sizing.
#[derive(Debug, Clone)]
pub struct MeshTiming {
    pub send_interval: Duration,
    /// Extra pause after each send
    pub send_settle: Duration,
    /// Wait after a transport error before retrying
    pub error_cooldown: Duration,
    /// Wait when no bytes are available
    pub idle_poll: Duration,
    pub report_interval: Duration,
    /// Evict peers not heard from for this long; None keeps them forever
    pub stale_after: Option<Duration>,
    pub dedup_window: Duration,
    pub dedup_capacity: usize,
    pub max_buffer_bytes: usize,
}

impl Default for MeshTiming {
    fn default() -> Self {
        Self {
            send_interval: Duration::from_millis(1000),
            send_settle: Duration::from_millis(10),
            error_cooldown: Duration::from_millis(1000),
            idle_poll: Duration::from_millis(100),
            report_interval: Duration::from_secs(10),
            stale_after: Some(Duration::from_secs(300)),
            dedup_window: dedup::DEFAULT_WINDOW,
            dedup_capacity: dedup::DEFAULT_CAPACITY,
            max_buffer_bytes: codec::DEFAULT_MAX_BUFFER,
        }
    }
}

/// What happened to one complete frame on the receive path.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Accepted(String),
    Duplicate(String),
    SelfEcho,
    Malformed(FrameError),
}

#[derive(Clone)]
struct Notifier {
    publisher: Option<Arc<dyn SnapshotPublisher>>,
    persist_tx: Option<watch::Sender<Option<MeshSnapshot>>>,
}

impl Notifier {
    fn notify(&self, snapshot: MeshSnapshot) {
        if let Some(publisher) = &self.publisher {
            publisher.publish(&snapshot);
        }
        if let Some(tx) = &self.persist_tx {
            // Latest value wins; the persist task only ever writes the newest state
            tx.send_replace(Some(snapshot));
        }
    }
}

/// Cloneable accessor to a running engine.
#[derive(Clone)]
pub struct MeshHandle {
    table: Arc<NeighborTable>,
    metrics: Arc<MeshMetrics>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl MeshHandle {
    pub fn snapshot(&self) -> MeshSnapshot {
        self.table.snapshot()
    }

    pub fn self_state(&self) -> SelfState {
        self.table.self_state()
    }

    /// Update our own position; picked up by the next transmit.
    pub fn set_position(&self, x: f64, y: f64) {
        self.table.set_self_position(x, y);
    }

    pub fn metrics(&self) -> metrics::Snapshot {
        self.metrics.snapshot()
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

/// Receive-side pipeline: scanner, duplicate filter and table update.
pub struct Inbound {
    scanner: FrameScanner,
    dedup: Deduplicator,
    table: Arc<NeighborTable>,
    own_id: String,
    metrics: Arc<MeshMetrics>,
    notifier: Notifier,
}

impl Inbound {
    /// Feed freshly read bytes and process every frame they complete.
    pub fn ingest(&mut self, bytes: &[u8]) -> Vec<FrameOutcome> {
        self.metrics.add_bytes_received(bytes.len());
        self.scanner.push(bytes);
        let overflows = self.scanner.overflows();
        let mut outcomes = Vec::new();
        while let Some(result) = self.scanner.next_frame() {
            outcomes.push(self.handle_frame(result));
        }
        self.metrics
            .add_buffer_overflows(self.scanner.overflows() - overflows);
        outcomes
    }

    fn handle_frame(&mut self, result: Result<Frame, FrameError>) -> FrameOutcome {
        let frame = match result {
            Ok(frame) => frame,
            Err(e) => {
                self.metrics.inc_frames_malformed();
                debug!("Dropped malformed frame: {}", e);
                return FrameOutcome::Malformed(e);
            }
        };
        if frame.sender_id == self.own_id {
            self.metrics.inc_frames_self_echo();
            trace!("Ignored own frame {}", frame.dedup_key());
            return FrameOutcome::SelfEcho;
        }
        if self.dedup.is_duplicate(&frame) {
            self.metrics.inc_frames_duplicate();
            debug!("Duplicate frame skipped: {}", frame.dedup_key());
            return FrameOutcome::Duplicate(frame.sender_id);
        }

        match frame.signal_strength {
            Some(dbm) => info!(
                "Received from {}: x={} y={} dBm={}",
                frame.sender_id, frame.x, frame.y, dbm
            ),
            None => info!("Received from {}: x={} y={}", frame.sender_id, frame.x, frame.y),
        }
        self.table.upsert(PeerState {
            id: frame.sender_id.clone(),
            x: frame.x,
            y: frame.y,
            updated_at: Utc::now(),
            signal_strength: frame.signal_strength,
        });
        self.metrics.inc_frames_accepted();
        self.notifier.notify(self.table.snapshot());
        FrameOutcome::Accepted(frame.sender_id)
    }
}

pub struct MeshEngine {
    handle: MeshHandle,
    transport: SharedTransport,
    timing: MeshTiming,
    publisher: Option<Arc<dyn SnapshotPublisher>>,
    persister: Option<Arc<dyn SnapshotPersister>>,
}

impl MeshEngine {
    pub fn new(self_state: SelfState, transport: SharedTransport, timing: MeshTiming) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            handle: MeshHandle {
                table: Arc::new(NeighborTable::new(self_state)),
                metrics: Arc::new(MeshMetrics::default()),
                shutdown: Arc::new(shutdown),
            },
            transport,
            timing,
            publisher: None,
            persister: None,
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn SnapshotPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_persister(mut self, persister: Arc<dyn SnapshotPersister>) -> Self {
        self.persister = Some(persister);
        self
    }

    pub fn handle(&self) -> MeshHandle {
        self.handle.clone()
    }

    /// A receive pipeline bound to this engine's table, publishing but not persisting.
    pub fn inbound(&self) -> Inbound {
        self.build_inbound(Notifier {
            publisher: self.publisher.clone(),
            persist_tx: None,
        })
    }

    fn build_inbound(&self, notifier: Notifier) -> Inbound {
        Inbound {
            scanner: FrameScanner::new(self.timing.max_buffer_bytes),
            dedup: Deduplicator::new(self.timing.dedup_window, self.timing.dedup_capacity),
            table: self.handle.table.clone(),
            own_id: self.handle.table.self_state().id,
            metrics: self.handle.metrics.clone(),
            notifier,
        }
    }

    /// Start all loops on the current runtime.
    pub fn spawn(self) -> MeshTasks {
        let mut tasks = Vec::new();

        let persist_tx = self.persister.clone().map(|persister| {
            let (tx, rx) = watch::channel(None);
            tasks.push((
                "persist",
                tokio::spawn(persist_loop(
                    persister,
                    rx,
                    self.handle.metrics.clone(),
                    self.handle.shutdown_signal(),
                )),
            ));
            tx
        });
        let notifier = Notifier {
            publisher: self.publisher.clone(),
            persist_tx,
        };

        tasks.push((
            "transmit",
            tokio::spawn(transmit_loop(
                self.handle.table.clone(),
                self.transport.clone(),
                self.handle.metrics.clone(),
                self.timing.clone(),
                self.handle.shutdown_signal(),
            )),
        ));
        tasks.push((
            "receive",
            tokio::spawn(receive_loop(
                self.build_inbound(notifier.clone()),
                self.transport.clone(),
                self.timing.clone(),
                self.handle.shutdown_signal(),
            )),
        ));
        tasks.push((
            "report",
            tokio::spawn(report_loop(
                self.handle.table.clone(),
                self.handle.metrics.clone(),
                notifier,
                self.timing.clone(),
                self.handle.shutdown_signal(),
            )),
        ));

        info!(
            "Mesh engine started for node {} ({} tasks)",
            self.handle.table.self_state().id,
            tasks.len()
        );
        MeshTasks { tasks }
    }
}

/// Join handles of the engine's tasks.
pub struct MeshTasks {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl MeshTasks {
    /// Wait for every task to finish after shutdown has been signalled.
    pub async fn join(self) {
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                error!("Mesh {} task ended abnormally: {}", name, e);
            }
        }
    }
}

/// Sleep for `dur` unless shutdown arrives first. Returns true when shutting down.
pub(crate) async fn pause(shutdown: &mut watch::Receiver<bool>, dur: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = sleep(dur) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

async fn transmit_loop(
    table: Arc<NeighborTable>,
    transport: SharedTransport,
    metrics: Arc<MeshMetrics>,
    timing: MeshTiming,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Starting transmit loop");
    while !*shutdown.borrow() {
        let frame = codec::encode(&table.self_state());
        let delay = match with_transport(&transport, |t| t.write_all(&frame)) {
            Ok(()) => {
                metrics.inc_frames_sent();
                debug!("Sent: {}", escape_bytes(&frame));
                timing.send_interval + timing.send_settle
            }
            Err(e) => {
                metrics.inc_send_errors();
                warn!(
                    "Error sending frame: {} (retrying in {:?})",
                    e, timing.error_cooldown
                );
                timing.error_cooldown
            }
        };
        if pause(&mut shutdown, delay).await {
            break;
        }
    }
    info!("Transmit loop shutting down");
}

async fn receive_loop(
    mut inbound: Inbound,
    transport: SharedTransport,
    timing: MeshTiming,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Starting receive loop");
    let mut buffer = [0u8; READ_CHUNK];
    while !*shutdown.borrow() {
        let read = with_transport(&transport, |t| {
            let available = t.bytes_available()?;
            if available == 0 {
                return Ok(0);
            }
            let want = available.min(buffer.len());
            t.read(&mut buffer[..want])
        });
        match read {
            Ok(0) => {
                if pause(&mut shutdown, timing.idle_poll).await {
                    break;
                }
            }
            Ok(n) => {
                trace!("Raw {} bytes: {}", n, escape_bytes(&buffer[..n]));
                inbound.ingest(&buffer[..n]);
            }
            Err(e) => {
                inbound.metrics.inc_read_errors();
                warn!(
                    "Error receiving data: {} (retrying in {:?})",
                    e, timing.error_cooldown
                );
                if pause(&mut shutdown, timing.error_cooldown).await {
                    break;
                }
            }
        }
    }
    info!("Receive loop shutting down");
}

async fn report_loop(
    table: Arc<NeighborTable>,
    metrics: Arc<MeshMetrics>,
    notifier: Notifier,
    timing: MeshTiming,
    mut shutdown: watch::Receiver<bool>,
) {
    while !pause(&mut shutdown, timing.report_interval).await {
        let now = Utc::now();
        if let Some(max_age) = timing.stale_after {
            let removed = table.evict_stale(max_age, now);
            if !removed.is_empty() {
                metrics.add_stale_evictions(removed.len());
                info!("Evicted stale neighbors: {}", removed.join(", "));
                notifier.notify(table.snapshot());
            }
        }

        let snapshot = table.snapshot();
        if snapshot.neighbors.is_empty() {
            info!("Neighbors: none detected");
        } else {
            info!("Neighbors ({}):", snapshot.neighbors.len());
            for peer in &snapshot.neighbors {
                let dbm = peer
                    .signal_strength
                    .map(|d| format!(", dBm={}", d))
                    .unwrap_or_default();
                info!(
                    "  {}: x={}, y={}, last seen {}s ago{}",
                    peer.id,
                    peer.x,
                    peer.y,
                    peer.age(now).as_secs(),
                    dbm
                );
            }
        }
        debug!("Mesh counters: {:?}", metrics.snapshot());
    }
}

async fn persist_loop(
    persister: Arc<dyn SnapshotPersister>,
    mut rx: watch::Receiver<Option<MeshSnapshot>>,
    metrics: Arc<MeshMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let pending = rx.borrow_and_update().clone();
                if let Some(snapshot) = pending {
                    write_snapshot(&persister, snapshot, &metrics).await;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    // Flush the last state accepted before shutdown
    if rx.has_changed().unwrap_or(false) {
        let pending = rx.borrow_and_update().clone();
        if let Some(snapshot) = pending {
            write_snapshot(&persister, snapshot, &metrics).await;
        }
    }
}

async fn write_snapshot(
    persister: &Arc<dyn SnapshotPersister>,
    snapshot: MeshSnapshot,
    metrics: &MeshMetrics,
) {
    let persister = persister.clone();
    match tokio::task::spawn_blocking(move || persister.persist(&snapshot)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            metrics.inc_persist_failures();
            warn!("Failed to persist mesh snapshot: {}", e);
        }
        Err(e) => {
            metrics.inc_persist_failures();
            error!("Persist task failed: {}", e);
        }
    }
}
