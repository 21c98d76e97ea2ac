//! Shared test helpers for the integration test suite.

use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tracewire::config::EngineConfig;
use tracewire::engine::ProxyEngine;
use tracewire::{TracerEvent, TracerEventSink};

/// A sink that just accumulates every event, for tests to inspect afterward.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<TracerEvent>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<TracerEvent> {
        self.events.lock().expect("collecting sink poisoned").clone()
    }
}

impl TracerEventSink for CollectingSink {
    fn add_tracer_event(&self, event: TracerEvent) {
        self.events.lock().expect("collecting sink poisoned").push(event);
    }
}

/// Build an `EngineConfig` rooted in a fresh temp directory so the cert
/// store and cert-cache file never collide between tests.
pub fn test_config(dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.proxy_server = "127.0.0.1:0".parse().unwrap();
    config.tls.root_ca_cert = dir.path().join("ca.pem");
    config.tls.root_ca_key = dir.path().join("ca.key");
    config.tls.cert_cache = dir.path().join("cert-cache.json");
    config
}

/// Construct a `ProxyEngine` in its own temp directory, wired to a
/// `CollectingSink` the caller can inspect after driving traffic through it.
pub fn test_engine_with_tracers(
    tracers: &[(&str, &str)],
) -> (Arc<ProxyEngine>, Arc<CollectingSink>, TempDir) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let mut config = test_config(&dir);
    for (tracer_string, tracer_payload) in tracers {
        config
            .tracers
            .insert(tracer_string.to_string(), tracer_payload.to_string());
    }

    let sink = CollectingSink::new();
    let engine = Arc::new(ProxyEngine::new(config, sink.clone()).expect("engine construction"));
    (engine, sink, dir)
}
