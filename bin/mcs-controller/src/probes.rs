//! Health, readiness and metrics listeners

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::metrics::ReconcileMetrics;

/// Flipped once the controllers are running (and, with election, leading)
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn set_ready(&self, ready: bool) {
        self.0.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn text(
    status: StatusCode,
    body: impl Into<Bytes>,
    content_type: &'static str,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// `/healthz` answers while the process is up, `/readyz` once it is ready
pub fn health_response(path: &str, readiness: &Readiness) -> Response<Full<Bytes>> {
    match path {
        "/healthz" => text(StatusCode::OK, "ok", "text/plain"),
        "/readyz" if readiness.is_ready() => text(StatusCode::OK, "ok", "text/plain"),
        "/readyz" => text(StatusCode::SERVICE_UNAVAILABLE, "not ready", "text/plain"),
        _ => text(StatusCode::NOT_FOUND, "not found", "text/plain"),
    }
}

pub fn metrics_response(path: &str, metrics: &ReconcileMetrics) -> Response<Full<Bytes>> {
    if path != "/metrics" {
        return text(StatusCode::NOT_FOUND, "not found", "text/plain");
    }
    match metrics.gather() {
        Ok(body) => text(StatusCode::OK, body, "text/plain; version=0.0.4"),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            text(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable", "text/plain")
        }
    }
}

/// Accept HTTP/1 connections on `addr`, answering every request with `handler(path)`
pub async fn serve<F>(addr: SocketAddr, handler: F) -> anyhow::Result<()>
where
    F: Fn(&str) -> Response<Full<Bytes>> + Clone + Send + Sync + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(%addr, "Listening");

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Error accepting connection");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let handler = handler.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let response = handler(req.uri().path());
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(%peer_addr, error = %e, "Error serving connection");
            }
        });
    }
}
