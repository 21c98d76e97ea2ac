//! Scans an inbound response for active tracer payloads and emits
//! `TracerEvent`s to an external sink through a bounded, drop-oldest queue
//! so a slow sink never stalls the response stream (spec.md §4.5).

use crate::tagger::TagRecord;
use crate::tracer::Tracer;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

const CONTEXT_WINDOW: usize = 100;
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Inferred from the response `Content-Type`, per spec.md §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Html,
    Json,
    Plain,
}

impl EventKind {
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        match content_type {
            Some(ct) if ct.contains("html") => EventKind::Html,
            Some(ct) if ct.contains("json") => EventKind::Json,
            _ => EventKind::Plain,
        }
    }
}

/// A sighting of an active tracer payload in a response body or header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracerEvent {
    pub tracer_id: u64,
    pub request_id: u64,
    pub raw_context: Vec<u8>,
    pub event_kind: EventKind,
}

/// The external `AddTracerEvent` collaborator (spec.md §6). The core calls
/// this asynchronously and must never block the response stream on it; the
/// persistent store behind it is out of scope.
pub trait TracerEventSink: Send + Sync {
    fn add_tracer_event(&self, event: TracerEvent);
}

struct QueueInner {
    buffer: Mutex<VecDeque<TracerEvent>>,
    notify: Notify,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

/// A bounded, drop-oldest queue. `push` never blocks: once `capacity` is
/// reached it evicts the front of the queue (the oldest event) before
/// inserting the new one, so a slow sink never stalls the scan path and the
/// freshest events always survive.
pub struct BoundedEventQueue {
    inner: Arc<QueueInner>,
}

impl BoundedEventQueue {
    /// Spawns a task draining the queue into `downstream` as events arrive.
    pub fn new(downstream: Arc<dyn TracerEventSink>) -> (Self, Arc<AtomicU64>) {
        Self::with_capacity(downstream, EVENT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(
        downstream: Arc<dyn TracerEventSink>,
        capacity: usize,
    ) -> (Self, Arc<AtomicU64>) {
        let dropped = Arc::new(AtomicU64::new(0));
        let inner = Arc::new(QueueInner {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            dropped: dropped.clone(),
        });

        let consumer_inner = inner.clone();
        tokio::spawn(async move {
            loop {
                let next = consumer_inner
                    .buffer
                    .lock()
                    .expect("event queue poisoned")
                    .pop_front();
                match next {
                    Some(event) => downstream.add_tracer_event(event),
                    None => consumer_inner.notify.notified().await,
                }
            }
        });

        (Self { inner }, dropped)
    }

    /// Enqueue an event. If the queue is already at capacity, the oldest
    /// queued event is evicted and counted as dropped before the new one is
    /// pushed on.
    pub fn push(&self, event: TracerEvent) {
        let mut buffer = self.inner.buffer.lock().expect("event queue poisoned");
        if buffer.len() >= self.inner.capacity {
            buffer.pop_front();
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
        buffer.push_back(event);
        drop(buffer);
        self.inner.notify.notify_one();
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// The events currently buffered, oldest first. Test-only: lets a test
    /// inspect what survived an overflow without racing the consumer task.
    #[cfg(test)]
    fn snapshot(&self) -> Vec<TracerEvent> {
        self.inner.buffer.lock().expect("event queue poisoned").iter().cloned().collect()
    }
}

/// A sink that discards events. Used where no external store is wired up
/// (e.g. standalone runs, unit tests).
pub struct NullSink;

impl TracerEventSink for NullSink {
    fn add_tracer_event(&self, _event: TracerEvent) {}
}

/// Scan a response body/headers for every tracer payload the `request_id`
/// request actually tagged (not merely globally active tracers, per the
/// scan-correlation invariant: a `TracerEvent` must reference a tracer that
/// was active *when the request was tagged*). `tagged` is that request's
/// `TagRecord`s; `active` supplies payload text for each tagged tracer id.
pub fn scan(
    body: &[u8],
    content_type: Option<&str>,
    request_id: u64,
    tagged: &[TagRecord],
    active: &[Tracer],
) -> Vec<TracerEvent> {
    let tagged_ids: HashSet<u64> = tagged.iter().map(|r| r.tracer_id).collect();
    let event_kind = EventKind::from_content_type(content_type);

    let mut events = Vec::new();
    for tracer in active {
        if !tagged_ids.contains(&tracer.id) {
            continue;
        }
        if tracer.tracer_payload.is_empty() {
            continue;
        }

        let payload = tracer.tracer_payload.as_bytes();
        let mut search_from = 0usize;
        while let Some(rel_offset) = find_subslice(&body[search_from..], payload) {
            let offset = search_from + rel_offset;
            let context = context_window(body, offset, payload.len());
            events.push(TracerEvent {
                tracer_id: tracer.id,
                request_id,
                raw_context: context,
                event_kind,
            });
            search_from = offset + payload.len();
            if search_from >= body.len() {
                break;
            }
        }
    }

    events
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn context_window(body: &[u8], offset: usize, hit_len: usize) -> Vec<u8> {
    let start = offset.saturating_sub(CONTEXT_WINDOW);
    let end = (offset + hit_len + CONTEXT_WINDOW).min(body.len());
    body[start..end].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tagger::LocationKind;

    fn tracer(id: u64, payload: &str) -> Tracer {
        Tracer {
            id,
            tracer_string: "[[unused]]".to_string(),
            tracer_payload: payload.to_string(),
        }
    }

    #[test]
    fn emits_one_event_per_hit() {
        let tracers = vec![tracer(1, "<s>z</s>")];
        let tagged = vec![TagRecord {
            tracer_id: 1,
            location: LocationKind::Body,
        }];
        let body = b"<html>hi <s>z</s></html>";
        let events = scan(body, Some("text/html"), 42, &tagged, &tracers);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].request_id, 42);
        assert_eq!(events[0].tracer_id, 1);
        assert_eq!(events[0].event_kind, EventKind::Html);
        assert!(String::from_utf8_lossy(&events[0].raw_context).contains("hi <s>z</s></html>"));
    }

    #[test]
    fn only_scans_payloads_tagged_for_this_request() {
        // tracer 2 is active but was never tagged on this request's Tagger
        // pass, so a hit for it must not produce an event.
        let tracers = vec![tracer(1, "alpha"), tracer(2, "beta")];
        let tagged = vec![TagRecord {
            tracer_id: 1,
            location: LocationKind::Body,
        }];
        let body = b"alpha and beta both present";
        let events = scan(body, Some("text/plain"), 1, &tagged, &tracers);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tracer_id, 1);
    }

    #[test]
    fn context_window_is_bounded_at_body_edges() {
        let tracers = vec![tracer(1, "X")];
        let tagged = vec![TagRecord {
            tracer_id: 1,
            location: LocationKind::Body,
        }];
        let body = b"X";
        let events = scan(body, None, 1, &tagged, &tracers);
        assert_eq!(events[0].raw_context, b"X");
    }

    #[tokio::test]
    async fn bounded_queue_drops_oldest_on_overflow() {
        // capacity 4, 10 pushes with no await in between: the consumer task
        // never gets scheduled on this current-thread runtime, so the queue
        // itself must be the thing enforcing drop-oldest, not the consumer
        // racing to drain it.
        let (queue, dropped) = BoundedEventQueue::with_capacity(Arc::new(NullSink), 4);

        for i in 0..10u64 {
            queue.push(TracerEvent {
                tracer_id: 1,
                request_id: i,
                raw_context: Vec::new(),
                event_kind: EventKind::Plain,
            });
        }

        assert_eq!(dropped.load(Ordering::Relaxed), 6);

        // The 4 survivors must be the newest events (6..=9), not the oldest.
        let survivors: Vec<u64> = queue.snapshot().iter().map(|e| e.request_id).collect();
        assert_eq!(survivors, vec![6, 7, 8, 9]);
    }
}
