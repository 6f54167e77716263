//! Frame counters for one mesh engine.
//! Owned by the engine and shared with its tasks through an `Arc`.
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct MeshMetrics {
    frames_sent: AtomicU64,
    send_errors: AtomicU64,
    bytes_received: AtomicU64,
    read_errors: AtomicU64,
    frames_accepted: AtomicU64,
    frames_malformed: AtomicU64,
    frames_duplicate: AtomicU64,
    frames_self_echo: AtomicU64,
    buffer_overflows: AtomicU64,
    persist_failures: AtomicU64,
    stale_evictions: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl MeshMetrics {
    pub fn inc_frames_sent(&self) {
        bump(&self.frames_sent, 1);
    }
    pub fn inc_send_errors(&self) {
        bump(&self.send_errors, 1);
    }
    pub fn add_bytes_received(&self, n: usize) {
        bump(&self.bytes_received, n as u64);
    }
    pub fn inc_read_errors(&self) {
        bump(&self.read_errors, 1);
    }
    pub fn inc_frames_accepted(&self) {
        bump(&self.frames_accepted, 1);
    }
    pub fn inc_frames_malformed(&self) {
        bump(&self.frames_malformed, 1);
    }
    pub fn inc_frames_duplicate(&self) {
        bump(&self.frames_duplicate, 1);
    }
    pub fn inc_frames_self_echo(&self) {
        bump(&self.frames_self_echo, 1);
    }
    pub fn add_buffer_overflows(&self, n: u64) {
        bump(&self.buffer_overflows, n);
    }
    pub fn inc_persist_failures(&self) {
        bump(&self.persist_failures, 1);
    }
    pub fn add_stale_evictions(&self, n: usize) {
        bump(&self.stale_evictions, n as u64);
    }

    pub fn snapshot(&self) -> Snapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Snapshot {
            frames_sent: load(&self.frames_sent),
            send_errors: load(&self.send_errors),
            bytes_received: load(&self.bytes_received),
            read_errors: load(&self.read_errors),
            frames_accepted: load(&self.frames_accepted),
            frames_malformed: load(&self.frames_malformed),
            frames_duplicate: load(&self.frames_duplicate),
            frames_self_echo: load(&self.frames_self_echo),
            buffer_overflows: load(&self.buffer_overflows),
            persist_failures: load(&self.persist_failures),
            stale_evictions: load(&self.stale_evictions),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub frames_sent: u64,
    pub send_errors: u64,
    pub bytes_received: u64,
    pub read_errors: u64,
    pub frames_accepted: u64,
    pub frames_malformed: u64,
    pub frames_duplicate: u64,
    pub frames_self_echo: u64,
    pub buffer_overflows: u64,
    pub persist_failures: u64,
    pub stale_evictions: u64,
}
