//! Event hub: synchronous fan-out to subscribers plus the bounded
//! per-session ring buffer behind `brain.step.stream`.
//!
//! Subscriber faults are isolated — a panicking subscriber is logged
//! and the fan-out continues. The ring doubles as the recovery source
//! after a restart: an empty ring is re-hydrated from the entry log.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use sk_domain::trace::TraceEvent;
use sk_sessions::entry::{Entry, EntryKind};

pub type Subscriber = Box<dyn Fn(&TraceEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StampedEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: TraceEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMeta {
    #[serde(rename = "totalEvents")]
    pub total_events: u64,
    #[serde(rename = "returnedEvents")]
    pub returned_events: usize,
    pub truncated: bool,
}

#[derive(Default)]
struct SessionRing {
    events: VecDeque<StampedEvent>,
    /// Count of every event ever observed (survives ring eviction).
    total: u64,
}

pub struct EventHub {
    capacity: usize,
    rings: Mutex<HashMap<String, SessionRing>>,
    subscribers: RwLock<Vec<Subscriber>>,
    seq: Mutex<u64>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rings: Mutex::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
            seq: Mutex::new(0),
        }
    }

    pub fn subscribe(&self, subscriber: Subscriber) {
        self.subscribers.write().push(subscriber);
    }

    /// Emit one event: structured log, ring append, subscriber fan-out.
    pub fn emit(&self, event: TraceEvent) {
        event.emit();

        let stamped = {
            let mut seq = self.seq.lock();
            *seq += 1;
            StampedEvent {
                seq: *seq,
                timestamp: Utc::now(),
                event: event.clone(),
            }
        };

        if let Some(session_id) = event.session_id() {
            let mut rings = self.rings.lock();
            let ring = rings.entry(session_id.to_owned()).or_default();
            ring.total += 1;
            if ring.events.len() >= self.capacity {
                ring.events.pop_front();
            }
            ring.events.push_back(stamped);
        }

        // Fan out synchronously; a faulting subscriber never poisons
        // the emit path.
        for subscriber in self.subscribers.read().iter() {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| subscriber(&event)));
            if result.is_err() {
                tracing::warn!(event = event.name(), "event subscriber panicked; continuing");
            }
        }
    }

    /// A truncated window of recent events for `brain.step.stream`.
    pub fn stream(
        &self,
        session_id: &str,
        max_events: Option<usize>,
        max_bytes: Option<usize>,
    ) -> (Vec<StampedEvent>, StreamMeta) {
        let rings = self.rings.lock();
        let Some(ring) = rings.get(session_id) else {
            return (
                Vec::new(),
                StreamMeta {
                    total_events: 0,
                    returned_events: 0,
                    truncated: false,
                },
            );
        };

        let take = max_events.unwrap_or(usize::MAX).min(ring.events.len());
        let mut window: Vec<StampedEvent> = ring
            .events
            .iter()
            .rev()
            .take(take)
            .cloned()
            .collect();
        window.reverse();

        // Enforce the byte budget from the oldest end so the freshest
        // events survive.
        if let Some(budget) = max_bytes {
            let mut size = 0usize;
            let mut kept: Vec<StampedEvent> = Vec::with_capacity(window.len());
            for event in window.iter().rev() {
                let bytes = serde_json::to_string(event).map_or(0, |s| s.len());
                if size + bytes > budget && !kept.is_empty() {
                    break;
                }
                size += bytes;
                kept.push(event.clone());
            }
            kept.reverse();
            window = kept;
        }

        let returned = window.len();
        let meta = StreamMeta {
            total_events: ring.total,
            returned_events: returned,
            truncated: (returned as u64) < ring.total,
        };
        (window, meta)
    }

    /// Rebuild a session's ring from its persisted log after restart.
    /// Only called when the ring is empty; synthesizes the events the
    /// entries imply (loop completions and compactions).
    pub fn rehydrate_from_entries(&self, session_id: &str, entries: &[Entry]) {
        {
            let rings = self.rings.lock();
            if rings.get(session_id).is_some_and(|r| r.total > 0) {
                return;
            }
        }

        for entry in entries {
            match &entry.kind {
                EntryKind::Compaction {
                    first_kept_entry_id,
                    tokens_before,
                    tokens_after,
                    ..
                } => {
                    self.emit(TraceEvent::SessionCompact {
                        session_id: session_id.to_owned(),
                        first_kept_entry_id: first_kept_entry_id.clone().unwrap_or_default(),
                    });
                    self.emit(TraceEvent::AutoCompactionEnd {
                        session_id: session_id.to_owned(),
                        tokens_before: *tokens_before,
                        tokens_after: *tokens_after,
                    });
                }
                EntryKind::Message { role, .. } if *role == sk_domain::tool::Role::Assistant => {
                    self.emit(TraceEvent::LoopDone {
                        session_id: session_id.to_owned(),
                        status: "done".into(),
                    });
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn event(session: &str) -> TraceEvent {
        TraceEvent::LoopDone {
            session_id: session.into(),
            status: "done".into(),
        }
    }

    #[test]
    fn ring_is_bounded_and_counts_all() {
        let hub = EventHub::new(3);
        for _ in 0..5 {
            hub.emit(event("s1"));
        }
        let (window, meta) = hub.stream("s1", None, None);
        assert_eq!(window.len(), 3);
        assert_eq!(meta.total_events, 5);
        assert!(meta.truncated);
        // Sequence numbers stay ordered.
        assert!(window.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn max_events_trims_from_the_old_end() {
        let hub = EventHub::new(16);
        for _ in 0..4 {
            hub.emit(event("s1"));
        }
        let (window, meta) = hub.stream("s1", Some(2), None);
        assert_eq!(window.len(), 2);
        assert_eq!(meta.returned_events, 2);
        assert!(meta.truncated);
        let (all, _) = hub.stream("s1", None, None);
        assert_eq!(window[1].seq, all.last().unwrap().seq);
    }

    #[test]
    fn panicking_subscriber_is_isolated() {
        let hub = EventHub::new(8);
        let delivered = Arc::new(AtomicUsize::new(0));

        hub.subscribe(Box::new(|_| panic!("bad subscriber")));
        let counter = Arc::clone(&delivered);
        hub.subscribe(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        hub.emit(event("s1"));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rehydrate_synthesizes_from_log() {
        let hub = EventHub::new(8);
        let entries = vec![
            Entry {
                id: "e1".into(),
                timestamp: Utc::now(),
                parent_id: None,
                kind: EntryKind::Message {
                    role: sk_domain::tool::Role::Assistant,
                    text: "done".into(),
                    tool_call_id: None,
                    tool_name: None,
                },
            },
            Entry {
                id: "e2".into(),
                timestamp: Utc::now(),
                parent_id: None,
                kind: EntryKind::Compaction {
                    summary: "s".into(),
                    first_kept_entry_id: Some("e1".into()),
                    tokens_before: 100,
                    tokens_after: 10,
                    reason: "threshold".into(),
                },
            },
        ];
        hub.rehydrate_from_entries("s1", &entries);
        let (window, meta) = hub.stream("s1", None, None);
        assert_eq!(meta.total_events, 3);
        assert!(window.iter().any(|e| e.event.name() == "session_compact"));

        // A second rehydrate is a no-op.
        hub.rehydrate_from_entries("s1", &entries);
        let (_, meta) = hub.stream("s1", None, None);
        assert_eq!(meta.total_events, 3);
    }
}
