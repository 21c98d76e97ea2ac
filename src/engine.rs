//! `ProxyEngine`: the explicit value that replaces the process-wide
//! singletons (certificate cache, tracer list, proxy listener) the
//! original tool kept as globals. One engine is constructed per run (or
//! per test case); it owns every piece of shared state and is handed to
//! sessions by reference.

use crate::cert_store::CertStore;
use crate::config::EngineConfig;
use crate::error::ProxyError;
use crate::scanner::{BoundedEventQueue, NullSink, TracerEventSink};
use crate::tls_mux;
use crate::tracer::TracerRegistry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long the shutdown path waits for in-flight sessions to finish before
/// aborting their tasks outright (spec.md §5).
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct ProxyEngine {
    pub config: EngineConfig,
    pub cert_store: CertStore,
    pub tracers: TracerRegistry,
    pub event_queue: BoundedEventQueue,
    events_dropped: Arc<AtomicU64>,
    sessions: Mutex<Vec<JoinHandle<()>>>,
}

impl ProxyEngine {
    pub fn new(config: EngineConfig, sink: Arc<dyn TracerEventSink>) -> Result<Self, ProxyError> {
        let cert_store = CertStore::new(
            &config.tls.root_ca_cert,
            &config.tls.root_ca_key,
            &config.tls.cert_cache,
        )?;
        let tracers = TracerRegistry::load_from_config(&config.tracers);
        let (event_queue, events_dropped) = BoundedEventQueue::new(sink);

        Ok(Self {
            config,
            cert_store,
            tracers,
            event_queue,
            events_dropped,
            sessions: Mutex::new(Vec::new()),
        })
    }

    /// A sink-less engine for tests and standalone runs where no external
    /// store is wired up.
    pub fn with_defaults(config: EngineConfig) -> Result<Self, ProxyError> {
        Self::new(config, Arc::new(NullSink))
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn track_session(&self, handle: JoinHandle<()>) {
        let mut sessions = self.sessions.lock().expect("session list poisoned");
        sessions.retain(|h| !h.is_finished());
        sessions.push(handle);
    }

    /// Bind the listener and run the accept loop until `shutdown` fires,
    /// then drain active sessions for `SHUTDOWN_GRACE` before aborting
    /// whatever remains (spec.md §5/§9's cancellation-token redesign).
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(self.config.proxy_server)
            .await
            .map_err(ProxyError::TransientIo)?;

        tracing::info!(addr = %self.config.proxy_server, "proxy engine listening");

        tls_mux::run(listener, self.clone(), shutdown.clone()).await;

        self.drain_sessions().await;

        if let Err(e) = self.cert_store.flush_to_disk(&self.config.tls.cert_cache) {
            tracing::warn!(error = %e, "final cert-cache flush failed");
        }

        Ok(())
    }

    async fn drain_sessions(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut sessions = self.sessions.lock().expect("session list poisoned");
            std::mem::take(&mut *sessions)
        };

        if handles.is_empty() {
            return;
        }

        tracing::info!(count = handles.len(), "draining active sessions");
        let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let wait_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        if tokio::time::timeout(SHUTDOWN_GRACE, wait_all).await.is_err() {
            tracing::warn!("grace period elapsed, aborting remaining sessions");
            for abort_handle in abort_handles {
                abort_handle.abort();
            }
        }
    }
}
