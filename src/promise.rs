//! Correlation primitive: a process-wide table pairing asynchronous requests
//! with their eventual answers.
//!
//! Every relayed method call allocates a fresh [`Promise::next_id`], publishes
//! the call, and parks on [`Promise::load_with_timeout`] until the answering
//! frame arrives via [`Promise::store`]. Entries are single-consumer: the
//! first successful load removes the entry, a second reader sees nothing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::net::frame::RelayFrame;

/// Custom epoch for snowflake timestamps: 2023-01-01T00:00:00Z, millis.
const SNOWFLAKE_EPOCH_MS: u64 = 1_672_531_200_000;

const NODE_BITS: u64 = 10;
const SEQ_BITS: u64 = 12;

/// Initial polling interval for [`Promise::load_with_timeout`].
const BACKOFF_START: Duration = Duration::from_micros(100);
/// Polling interval ceiling; keeps worst-case added latency bounded.
const BACKOFF_CAP: Duration = Duration::from_millis(100);

fn current_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Snowflake-style ID generator: 41 bits of milliseconds since the custom
/// epoch, 10 bits of node, 12 bits of per-millisecond sequence. IDs are
/// unique within the process and roughly time-ordered.
#[derive(Debug)]
pub struct IdGenerator {
    node: u64,
    state: Mutex<(u64, u64)>, // (last millis, sequence)
}

impl IdGenerator {
    pub fn new(node: u64) -> Self {
        Self {
            node: node & ((1 << NODE_BITS) - 1),
            state: Mutex::new((0, 0)),
        }
    }

    pub fn next(&self) -> i64 {
        let mut state = self.state.lock().expect("id generator lock poisoned");
        let mut now = current_millis();
        let (last, seq) = *state;
        let seq = if now == last {
            let next = seq + 1;
            if next >= (1 << SEQ_BITS) {
                // Sequence exhausted for this millisecond; spin to the next.
                while now <= last {
                    now = current_millis();
                }
                0
            } else {
                next
            }
        } else {
            0
        };
        *state = (now, seq);
        let ts = now.saturating_sub(SNOWFLAKE_EPOCH_MS);
        ((ts << (NODE_BITS + SEQ_BITS)) | (self.node << SEQ_BITS) | seq) as i64
    }
}

/// Pending-result table keyed by correlation ID.
///
/// Stored values are the opaque frame-body strings carried by the tunnel
/// protocol; callers decode them according to the method they invoked.
#[derive(Debug)]
pub struct Promise {
    pending: Mutex<HashMap<i64, String>>,
    ids: IdGenerator,
}

impl Promise {
    pub fn new(node: u64) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            ids: IdGenerator::new(node),
        }
    }

    /// Allocate a fresh correlation ID. Never blocks, never collides within
    /// the process lifetime.
    pub fn next_id(&self) -> i64 {
        self.ids.next()
    }

    /// Insert (or overwrite) the answer for `id`, waking any poller.
    pub fn store(&self, id: i64, body: impl Into<String>) {
        self.pending
            .lock()
            .expect("promise lock poisoned")
            .insert(id, body.into());
    }

    /// Single read-and-delete. A miss leaves no side effect; a hit removes
    /// the entry so a second reader of the same ID sees `None`.
    pub fn load(&self, id: i64) -> Option<String> {
        self.pending
            .lock()
            .expect("promise lock poisoned")
            .remove(&id)
    }

    /// Poll [`load`](Self::load) with exponential backoff until an answer
    /// appears or `timeout` elapses. A timeout is a normal "no answer yet"
    /// outcome, not an error; it never returns early.
    pub async fn load_with_timeout(&self, id: i64, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        let mut backoff = BACKOFF_START;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            if let Some(v) = self.load(id) {
                return Some(v);
            }
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }
}

/// An outbound method call waiting to be carried by whichever tunnel is
/// currently open: the correlation ID plus the frame to serialize.
#[derive(Debug, Clone)]
pub struct PromiseEvent {
    pub id: i64,
    pub frame: RelayFrame,
}

impl PromiseEvent {
    pub fn new(id: i64, frame: RelayFrame) -> Self {
        Self { id, frame }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let p = Promise::new(1);
        let mut prev = p.next_id();
        for _ in 0..4096 {
            let id = p.next_id();
            assert!(id > prev, "ids must be strictly increasing");
            prev = id;
        }
    }

    #[test]
    fn load_is_single_consumer() {
        let p = Promise::new(1);
        let id = p.next_id();
        p.store(id, "answer");
        assert_eq!(p.load(id).as_deref(), Some("answer"));
        assert_eq!(p.load(id), None);
    }

    #[test]
    fn load_on_unknown_id_has_no_side_effect() {
        let p = Promise::new(1);
        assert_eq!(p.load(42), None);
        p.store(42, "late");
        assert_eq!(p.load(42).as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn load_with_timeout_returns_stored_value() {
        let p = std::sync::Arc::new(Promise::new(1));
        let id = p.next_id();
        let writer = p.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.store(id, "delayed");
        });
        let v = p.load_with_timeout(id, Duration::from_secs(1)).await;
        assert_eq!(v.as_deref(), Some("delayed"));
    }

    #[tokio::test]
    async fn load_with_timeout_respects_lower_bound() {
        let p = Promise::new(1);
        let start = std::time::Instant::now();
        let v = p.load_with_timeout(7, Duration::from_millis(50)).await;
        assert!(v.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
