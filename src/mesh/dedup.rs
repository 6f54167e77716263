//! Suppression of repeated position frames.
//!
//! A key is remembered from the moment it is first accepted until `window` has passed;
//! repeats inside the window do not extend it. This lets a stationary peer's beacon be
//! accepted again once per window so its timestamp keeps advancing. At most `capacity`
//! keys are held; the oldest are forgotten first.
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::codec::Frame;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(30);
pub const DEFAULT_CAPACITY: usize = 4096;

#[derive(Debug)]
pub struct Deduplicator {
    window: Duration,
    capacity: usize,
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_CAPACITY)
    }
}

impl Deduplicator {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Report whether this frame's event was already seen; remember it if not.
    pub fn is_duplicate(&mut self, frame: &Frame) -> bool {
        self.check_key(frame.dedup_key(), Instant::now())
    }

    pub(crate) fn check_key(&mut self, key: &str, now: Instant) -> bool {
        self.expire(now);
        if self.seen.contains_key(key) {
            return true;
        }
        while self.seen.len() >= self.capacity {
            match self.order.pop_front() {
                Some((old, _)) => {
                    self.seen.remove(&old);
                }
                None => break,
            }
        }
        self.seen.insert(key.to_string(), now);
        self.order.push_back((key.to_string(), now));
        false
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn expire(&mut self, now: Instant) {
        while let Some((_, at)) = self.order.front() {
            if now.saturating_duration_since(*at) < self.window {
                break;
            }
            if let Some((key, _)) = self.order.pop_front() {
                self.seen.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &str) -> Frame {
        Frame::parse_payload(payload).unwrap()
    }

    #[test]
    fn first_sighting_is_novel_then_duplicate() {
        let mut dedup = Deduplicator::default();
        let f = frame("004;1.0;2.0");
        assert!(!dedup.is_duplicate(&f));
        for _ in 0..5 {
            assert!(dedup.is_duplicate(&f));
        }
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn signal_strength_does_not_affect_identity() {
        let mut dedup = Deduplicator::default();
        assert!(!dedup.is_duplicate(&frame("004;1.0;2.0")));
        assert!(dedup.is_duplicate(&frame("004;1.0;2.0;-50")));
        assert!(dedup.is_duplicate(&frame("004;1.0;2.0;-90")));
    }

    #[test]
    fn distinct_positions_are_distinct_events() {
        let mut dedup = Deduplicator::default();
        assert!(!dedup.is_duplicate(&frame("004;1.0;2.0")));
        assert!(!dedup.is_duplicate(&frame("004;1.0;2.5")));
        assert!(!dedup.is_duplicate(&frame("005;1.0;2.0")));
    }

    #[test]
    fn key_expires_after_window_and_repeats_do_not_extend_it() {
        let mut dedup = Deduplicator::new(Duration::from_secs(10), 16);
        let t0 = Instant::now();
        assert!(!dedup.check_key("a;1;2", t0));
        assert!(dedup.check_key("a;1;2", t0 + Duration::from_secs(9)));
        assert!(!dedup.check_key("a;1;2", t0 + Duration::from_secs(10)));
    }

    #[test]
    fn capacity_evicts_oldest_key() {
        let mut dedup = Deduplicator::new(Duration::from_secs(60), 2);
        let t0 = Instant::now();
        assert!(!dedup.check_key("a", t0));
        assert!(!dedup.check_key("b", t0));
        assert!(!dedup.check_key("c", t0));
        assert_eq!(dedup.len(), 2);
        assert!(dedup.check_key("c", t0));
        assert!(!dedup.check_key("a", t0));
    }
}
