//! The active-tracer registry: labels Tagger substitutes and Scanner looks
//! for.
//!
//! Readers (Tagger/Scanner, on every request/response) must never block on
//! writers (tracer additions), and writers replace the whole list
//! atomically (spec.md §5) — exactly `arc_swap::ArcSwap`'s contract.

use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A marker string and what it is replaced with, as loaded from
/// `EngineConfig::tracers` or added later via the external admin API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracer {
    pub id: u64,
    pub tracer_string: String,
    pub tracer_payload: String,
}

pub struct TracerRegistry {
    active: ArcSwap<Vec<Tracer>>,
    next_id: AtomicU64,
}

impl TracerRegistry {
    pub fn new() -> Self {
        Self {
            active: ArcSwap::from_pointee(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Load the `tracerString -> tracerPayload` map from config at startup,
    /// each entry becoming one `Tracer` with a freshly assigned id.
    pub fn load_from_config(
        config_tracers: &std::collections::HashMap<String, String>,
    ) -> Self {
        let registry = Self::new();
        for (tracer_string, tracer_payload) in config_tracers {
            registry.add_tracer(tracer_string.clone(), tracer_payload.clone());
        }
        registry
    }

    /// Add a tracer, replacing the whole active list atomically. Readers
    /// already holding a snapshot (via `active_tracers`) are unaffected.
    pub fn add_tracer(&self, tracer_string: String, tracer_payload: String) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tracer = Tracer {
            id,
            tracer_string,
            tracer_payload,
        };

        let current = self.active.load();
        let mut next: Vec<Tracer> = (**current).clone();
        next.push(tracer);
        self.active.store(Arc::new(next));

        id
    }

    /// A point-in-time snapshot of the active tracer list (the
    /// `ActiveTracers()` external interface of spec.md §6). Never blocks on
    /// a concurrent `add_tracer`.
    pub fn active_tracers(&self) -> Arc<Vec<Tracer>> {
        self.active.load_full()
    }
}

impl Default for TracerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
