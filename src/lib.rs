//! `tracewire`: a TLS-intercepting tracer proxy.
//!
//! Terminates outbound HTTPS with a locally-minted CA, stitches
//! known tracer strings into request/response traffic, and watches
//! for those tracers reappearing where they shouldn't (reflected or
//! stored XSS) to emit `TracerEvent`s to an external sink.

pub mod cert_store;
pub mod config;
pub mod engine;
pub mod error;
pub mod intercept_session;
pub mod jsonl_tracing_layer;
pub mod log_writer;
pub mod scanner;
pub mod schema;
pub mod tagger;
pub mod tls_mux;
pub mod tracer;

pub use config::EngineConfig;
pub use engine::ProxyEngine;
pub use error::{ProxyError, Result};
pub use scanner::{TracerEvent, TracerEventSink};
pub use tracer::Tracer;
