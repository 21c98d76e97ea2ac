//! The state machine for one intercepted connection:
//!
//! ```text
//!    INIT → AWAIT_TLS → RELAY ⇄ RELAY → CLOSED
//!                           (req)  (resp)
//! ```
//!
//! INIT requests a leaf cert from `CertStore`; AWAIT_TLS completes the
//! client-side handshake and opens the upstream TLS connection; RELAY reads
//! one request, tags it, forwards it, scans the response, and writes it
//! back, looping for keep-alive. Any error at any stage terminates only
//! this session (spec.md §4.3/§7) — hyper's `serve_connection` already
//! gives us the per-connection task and the keep-alive loop; this module
//! adds the cert lookup, the tag/forward/scan pipeline, and header hygiene
//! around it.

use crate::engine::ProxyEngine;
use crate::error::ProxyError;
use crate::scanner;
use crate::tagger::{self, LocationKind};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, Uri};
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

pub type BoxBody = http_body_util::combinators::UnsyncBoxBody<Bytes, hyper::Error>;

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Headers that must not be forwarded across a hop, per RFC 7230 §6.1, plus
/// the non-standard `Proxy-Connection` a lot of clients still send.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
];

fn strip_hop_by_hop(headers: &mut HeaderMap<HeaderValue>) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Flatten response headers into `name: value\r\n` pairs so Scanner can
/// search them the same way it searches the body (spec.md §4.5: "Scans the
/// serialized response body and headers").
fn serialize_headers(headers: &HeaderMap<HeaderValue>) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Per-connection state, tracked for observability; the actual transitions
/// are driven by hyper's connection loop and the calls below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Init,
    AwaitTls,
    Relay,
    Closed,
}

/// Owns the monotonic per-session requestID counter (spec.md §5: "requestID
/// is monotonically assigned per-session").
pub struct InterceptSession {
    authority: String,
    next_request_id: AtomicU64,
    state: std::sync::Mutex<SessionState>,
}

impl InterceptSession {
    fn new(authority: String) -> Self {
        Self {
            authority,
            next_request_id: AtomicU64::new(1),
            state: std::sync::Mutex::new(SessionState::Init),
        }
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().expect("session state poisoned") = state;
        tracing::debug!(authority = %self.authority, ?state, "session state transition");
    }

    fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Run the CONNECT interception path: mint/fetch a leaf for `authority`,
/// complete the client TLS handshake, then serve HTTPS requests over it,
/// tagging and scanning each exchange.
pub async fn run_https(
    upgraded: hyper::upgrade::Upgraded,
    authority: String,
    engine: Arc<ProxyEngine>,
) -> Result<(), ProxyError> {
    let session = Arc::new(InterceptSession::new(authority.clone()));
    session.set_state(SessionState::Init);

    let host = authority.split(':').next().unwrap_or(&authority).to_string();
    // Single-flight misses mint a keypair and busy-wait on the slot
    // (cert_store.rs); keep that off the async runtime's worker threads.
    let leaf = {
        let engine = engine.clone();
        let host = host.clone();
        tokio::task::spawn_blocking(move || engine.cert_store.get_cert(&host))
            .await
            .map_err(|e| ProxyError::TransientIo(std::io::Error::other(e)))??
    };

    session.set_state(SessionState::AwaitTls);

    let tls_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![leaf.cert_der.clone()], leaf.private_key_der())
        .map_err(|e| ProxyError::Crypto {
            host: host.clone(),
            source: anyhow::anyhow!(e),
        })?;
    let tls_acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let tls_stream = tls_acceptor
        .accept(TokioIo::new(upgraded))
        .await
        .map_err(|e| ProxyError::TransientIo(std::io::Error::other(e)))?;

    session.set_state(SessionState::Relay);
    let io = TokioIo::new(tls_stream);

    let service = service_fn(move |req| {
        let engine = engine.clone();
        let session = session.clone();
        let host = host.clone();
        async move { handle_https_request(req, host, engine, session).await }
    });

    let result = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .await;

    if let Err(e) = result {
        tracing::debug!(authority = %authority, error = %e, "session closed");
    }
    Ok(())
}

async fn handle_https_request(
    req: Request<Incoming>,
    host: String,
    engine: Arc<ProxyEngine>,
    session: Arc<InterceptSession>,
) -> Result<Response<BoxBody>, Box<dyn std::error::Error + Send + Sync>> {
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|q| q.to_string());
    let host_without_default_port = host.strip_suffix(":443").unwrap_or(&host);

    let full_uri = if let Some(q) = query {
        format!("https://{host_without_default_port}{path}?{q}")
    } else {
        format!("https://{host_without_default_port}{path}")
    };

    relay_one_exchange(req, full_uri.parse()?, &engine, &session).await
}

/// The plain-HTTP direct path (no CONNECT): forward the request to its
/// absolute-form URI. Tagger and Scanner run exactly as in the TLS path
/// (spec.md §4.2), sharing `relay_one_exchange`. There is no per-connection
/// `InterceptSession` lifetime to track here, so a throwaway session is
/// used purely to get a requestID counter.
pub async fn relay_direct_http(
    req: Request<Incoming>,
    engine: &Arc<ProxyEngine>,
) -> Result<Response<BoxBody>, Box<dyn std::error::Error + Send + Sync>> {
    let session = InterceptSession::new("direct".to_string());
    let uri = req.uri().clone();
    relay_one_exchange(req, uri, engine, &session).await
}

async fn relay_one_exchange(
    req: Request<Incoming>,
    uri: Uri,
    engine: &Arc<ProxyEngine>,
    session: &InterceptSession,
) -> Result<Response<BoxBody>, Box<dyn std::error::Error + Send + Sync>> {
    let request_id = session.next_request_id();
    let tracers = engine.tracers.active_tracers();

    let (mut parts, body) = req.into_parts();
    strip_hop_by_hop(&mut parts.headers);

    let content_encoding = parts
        .headers
        .get("content-encoding")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let body_bytes = body.collect().await?.to_bytes();

    let (tagged_url, mut tag_records) = tagger::tag_string(uri.as_str(), &tracers, LocationKind::Url);
    let tagged_uri: Uri = tagged_url.parse().unwrap_or(uri);

    for (name, value) in parts.headers.iter_mut() {
        if let Ok(value_str) = value.to_str() {
            let (tagged_value, mut header_records) =
                tagger::tag_string(value_str, &tracers, LocationKind::Header);
            if !header_records.is_empty() {
                if let Ok(new_value) = HeaderValue::from_str(&tagged_value) {
                    *value = new_value;
                }
                tag_records.append(&mut header_records);
            }
            let _ = name;
        }
    }

    let (tagged_body, mut body_records) =
        tagger::tag_body(&body_bytes, content_encoding.as_deref(), &tracers);
    tag_records.append(&mut body_records);

    if tagged_body.len() != body_bytes.len() {
        parts.headers.remove("content-length");
        parts
            .headers
            .insert("content-length", HeaderValue::from_str(&tagged_body.len().to_string())?);
        parts.headers.remove("content-encoding");
        parts.headers.remove("transfer-encoding");
    }

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    let client: hyper_util::client::legacy::Client<_, Full<Bytes>> =
        hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new()).build(https);

    let mut upstream_req = Request::builder().method(parts.method.clone()).uri(tagged_uri);
    for (name, value) in parts.headers.iter() {
        upstream_req = upstream_req.header(name, value);
    }
    let upstream_req = upstream_req.body(Full::new(Bytes::from(tagged_body)))?;

    let resp = client.request(upstream_req).await?;
    let (resp_parts, resp_body) = resp.into_parts();
    let resp_body_bytes = resp_body.collect().await?.to_bytes();

    let content_type = resp_parts
        .headers
        .get("content-type")
        .and_then(|v| v.to_str().ok());

    let mut events = scanner::scan(
        &resp_body_bytes,
        content_type,
        request_id,
        &tag_records,
        &tracers,
    );
    let header_bytes = serialize_headers(&resp_parts.headers);
    events.extend(scanner::scan(
        &header_bytes,
        content_type,
        request_id,
        &tag_records,
        &tracers,
    ));
    for event in events {
        engine.event_queue.push(event);
    }

    let mut response = Response::builder().status(resp_parts.status);
    for (name, value) in resp_parts.headers.iter() {
        response = response.header(name, value);
    }
    Ok(response.body(full(resp_body_bytes))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_all_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::from_static("connection"), HeaderValue::from_static("keep-alive"));
        headers.insert(HeaderName::from_static("proxy-connection"), HeaderValue::from_static("keep-alive"));
        headers.insert(HeaderName::from_static("host"), HeaderValue::from_static("example.com"));

        strip_hop_by_hop(&mut headers);

        assert!(!headers.contains_key("connection"));
        assert!(!headers.contains_key("proxy-connection"));
        assert!(headers.contains_key("host"));
    }

    #[test]
    fn session_request_ids_are_monotonic_per_session() {
        let session = InterceptSession::new("example.com:443".to_string());
        let first = session.next_request_id();
        let second = session.next_request_id();
        assert!(second > first);
    }
}
