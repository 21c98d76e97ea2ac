//! Accepts plain-TCP connections and classifies each one as a CONNECT
//! tunnel (HTTPS interception) or a direct plain-HTTP proxy request
//! (spec.md §4.2).

use crate::engine::ProxyEngine;
use crate::intercept_session::{self, BoxBody};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Accept connections on `listener` until `shutdown` is cancelled.
pub async fn run(listener: TcpListener, engine: Arc<ProxyEngine>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("accept loop stopping on shutdown signal");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                tracing::debug!(%peer_addr, "accepted connection");

                let engine = engine.clone();
                engine.track_session(tokio::spawn(async move {
                    handle_connection(stream, engine).await;
                }));
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, engine: Arc<ProxyEngine>) {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req| {
        let engine = engine.clone();
        async move { classify_and_route(req, engine).await }
    });

    if let Err(e) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        tracing::debug!(error = %e, "connection closed");
    }
}

async fn classify_and_route(
    req: Request<Incoming>,
    engine: Arc<ProxyEngine>,
) -> Result<Response<BoxBody>, Box<dyn std::error::Error + Send + Sync>> {
    if req.method() == Method::CONNECT {
        return handle_connect(req, engine).await;
    }

    if req.uri().authority().is_none() {
        tracing::warn!(uri = %req.uri(), "rejecting request with no absolute-form URI");
        return Ok(Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(full("Bad Request"))?);
    }

    intercept_session::relay_direct_http(req, &engine).await
}

async fn handle_connect(
    req: Request<Incoming>,
    engine: Arc<ProxyEngine>,
) -> Result<Response<BoxBody>, Box<dyn std::error::Error + Send + Sync>> {
    let authority = match req.uri().authority() {
        Some(authority) => authority.as_str().to_string(),
        None => {
            tracing::warn!("CONNECT missing authority");
            return Ok(Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(full("Bad Request"))?);
        }
    };

    tracing::info!(%authority, "CONNECT");

    // Extract the upgrade future before moving `req` into the spawned task:
    // hyper only resolves it if the original request is still reachable.
    let upgrade = hyper::upgrade::on(req);

    tokio::spawn(async move {
        match upgrade.await {
            Ok(upgraded) => {
                if let Err(e) = intercept_session::run_https(upgraded, authority.clone(), engine).await {
                    tracing::warn!(%authority, error = %e, "intercept session ended with error");
                }
            }
            Err(e) => tracing::warn!(%authority, error = %e, "CONNECT upgrade failed"),
        }
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(full(""))?)
}
