//! Large-message store
//!
//! Holds payloads too big to forward over the peer transport. A spilled
//! payload gets an opaque slot id; the recipient fetches it once over the
//! HTTP sideband, after which the slot is gone. Unfetched slots expire 60
//! seconds after creation. Expiry deadlines sit in a single min-heap swept
//! by a periodic task rather than one timer per slot.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::SLOT_TTL_SECS;

/// Number of base-36 values per slot-id segment (36^8)
const SEGMENT_SPACE: u64 = 36u64.pow(8);

/// Characters per slot-id segment
const SEGMENT_LEN: usize = 8;

struct Slot {
    payload: String,
    expires_at: Instant,
}

/// Store for spilled payloads, shared across all groups
pub struct SpillStore {
    slots: DashMap<String, Slot>,
    expirations: Mutex<BinaryHeap<Reverse<(Instant, String)>>>,
    sequence: AtomicU64,
    ttl: Duration,
}

impl SpillStore {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            expirations: Mutex::new(BinaryHeap::new()),
            sequence: AtomicU64::new(0),
            ttl: Duration::from_secs(SLOT_TTL_SECS),
        }
    }

    /// Store a payload and return its slot id
    pub fn put(&self, payload: String) -> String {
        let id = self.generate_slot_id();
        let expires_at = Instant::now() + self.ttl;

        self.slots.insert(
            id.clone(),
            Slot {
                payload,
                expires_at,
            },
        );
        self.expirations.lock().push(Reverse((expires_at, id.clone())));

        debug!("Spilled payload to slot {}", id);
        id
    }

    /// Atomically remove and return a slot's payload.
    ///
    /// Returns `None` for unknown, already-taken, or expired slots. With
    /// concurrent callers exactly one receives the payload.
    pub fn take(&self, slot_id: &str) -> Option<String> {
        let (_, slot) = self.slots.remove(slot_id)?;
        if Instant::now() >= slot.expires_at {
            return None;
        }
        Some(slot.payload)
    }

    /// Drop a slot if still present
    pub fn expire(&self, slot_id: &str) {
        if self.slots.remove(slot_id).is_some() {
            debug!("Slot {} expired unread", slot_id);
        }
    }

    /// Drop every slot whose deadline has passed (call from a periodic task)
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut expirations = self.expirations.lock();
        loop {
            match expirations.peek() {
                Some(Reverse((deadline, _))) if *deadline <= now => {
                    if let Some(Reverse((_, id))) = expirations.pop() {
                        self.expire(&id);
                    }
                }
                _ => break,
            }
        }
    }

    /// Number of live slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// A slot id is three base-36 segments, each zero-padded to eight
    /// characters: the creation timestamp, a monotonic sequence and a
    /// random value.
    fn generate_slot_id(&self) -> String {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) % SEGMENT_SPACE;

        let mut bytes = [0u8; 8];
        getrandom::getrandom(&mut bytes).expect("RNG failed");
        let random = u64::from_le_bytes(bytes) % SEGMENT_SPACE;

        let mut id = String::with_capacity(3 * SEGMENT_LEN);
        id.push_str(&base36(timestamp % SEGMENT_SPACE));
        id.push_str(&base36(sequence));
        id.push_str(&base36(random));
        id
    }
}

impl Default for SpillStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a value below 36^8 as eight zero-padded base-36 characters
fn base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = [b'0'; SEGMENT_LEN];
    let mut i = SEGMENT_LEN;
    while value > 0 && i > 0 {
        i -= 1;
        out[i] = DIGITS[(value % 36) as usize];
        value /= 36;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base36_padding() {
        assert_eq!(base36(0), "00000000");
        assert_eq!(base36(35), "0000000z");
        assert_eq!(base36(36), "00000010");
        assert_eq!(base36(SEGMENT_SPACE - 1), "zzzzzzzz");
    }

    #[test]
    fn test_slot_id_shape() {
        let store = SpillStore::new();
        let id = store.put("payload".into());

        assert_eq!(id.len(), 24);
        assert!(id.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
    }

    #[test]
    fn test_slot_ids_unique() {
        let store = SpillStore::new();
        let a = store.put("a".into());
        let b = store.put("b".into());
        assert_ne!(a, b);
    }

    #[test]
    fn test_take_removes() {
        let store = SpillStore::new();
        let id = store.put("payload".into());

        assert_eq!(store.take(&id).as_deref(), Some("payload"));
        assert_eq!(store.take(&id), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_take_unknown() {
        let store = SpillStore::new();
        assert_eq!(store.take("nosuchslot"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_after_expiry() {
        let store = SpillStore::new();
        let id = store.put("payload".into());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.take(&id), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_due_slots() {
        let store = SpillStore::new();
        let old = store.put("old".into());

        tokio::time::advance(Duration::from_secs(30)).await;
        let young = store.put("young".into());

        tokio::time::advance(Duration::from_secs(31)).await;
        store.sweep();

        assert_eq!(store.len(), 1);
        assert_eq!(store.take(&old), None);
        assert_eq!(store.take(&young).as_deref(), Some("young"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_ignores_taken_slots() {
        let store = SpillStore::new();
        let id = store.put("payload".into());
        assert!(store.take(&id).is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        store.sweep();
        assert!(store.is_empty());
    }
}
