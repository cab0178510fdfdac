//! Control API
//!
//! HTTP/1 server exposing the share operations, the status watch stream and
//! the Kubernetes probe and metrics endpoints.
//!
//! | Method | Path                  | Operation                          |
//! |--------|-----------------------|------------------------------------|
//! | GET    | `/healthz`, `/livez`  | liveness                           |
//! | GET    | `/readyz`             | ready once the volume is exported  |
//! | GET    | `/metrics`            | Prometheus text format             |
//! | GET    | `/v1/shares`          | list share status                  |
//! | GET    | `/v1/shares/{volume}` | get share status                   |
//! | POST   | `/v1/shares/{volume}` | create share                       |
//! | DELETE | `/v1/shares/{volume}` | delete share and shut down         |
//! | GET    | `/v1/watch`           | NDJSON stream of status changes    |

mod client;

pub use client::ShareClient;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::manager::{ShareManager, ShareStatus};
use crate::metrics;

/// Default control API address
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9600";

const SHARES_PREFIX: &str = "/v1/shares";

/// Response body of every route.
pub type ApiBody = UnsyncBoxBody<Bytes, Infallible>;

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

fn full(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<ApiBody> {
    let mut response = Response::new(Full::new(body.into()).boxed_unsync());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn text(status: StatusCode, body: &'static str) -> Response<ApiBody> {
    full(status, "text/plain; charset=utf-8", body)
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<ApiBody> {
    match serde_json::to_vec(value) {
        Ok(body) => full(status, "application/json", body),
        Err(e) => text_owned(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn text_owned(status: StatusCode, body: String) -> Response<ApiBody> {
    full(status, "text/plain; charset=utf-8", body)
}

fn error_response(err: &Error) -> Response<ApiBody> {
    let status = match err {
        Error::Export { .. } => StatusCode::NOT_FOUND,
        e if e.is_config() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json(
        status,
        &ErrorBody {
            error: &err.to_string(),
        },
    )
}

fn status_response(result: Result<ShareStatus>) -> Response<ApiBody> {
    match result {
        Ok(status) => json(StatusCode::OK, &status),
        Err(e) => {
            warn!("Share operation failed: {}", e);
            error_response(&e)
        }
    }
}

/// Newline-delimited JSON stream: current status first, then every change.
fn watch_response(manager: &ShareManager) -> Response<ApiBody> {
    let rx = manager.subscribe();
    let initial = manager.status();

    let updates = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(status) => return Some((status, rx)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Watcher lagged behind status updates");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    let frames = stream::once(async move { initial })
        .chain(updates)
        .filter_map(|status| async move {
            match serde_json::to_vec(&status) {
                Ok(mut line) => {
                    line.push(b'\n');
                    Some(Ok::<_, Infallible>(Frame::data(Bytes::from(line))))
                }
                Err(e) => {
                    warn!("Failed to encode share status: {}", e);
                    None
                }
            }
        });

    let mut response = Response::new(StreamBody::new(frames).boxed_unsync());
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/x-ndjson"));
    response
}

/// Dispatch one request.
pub fn route(manager: &Arc<ShareManager>, method: &Method, path: &str) -> Response<ApiBody> {
    match (method, path) {
        (&Method::GET, "/livez") => {
            if manager.health().is_live() {
                text(StatusCode::OK, "ok")
            } else {
                text(StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
            }
        }
        (&Method::GET, "/healthz") => {
            let health = manager.health().response();
            let status = if health.live {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json(status, &health)
        }
        (&Method::GET, "/readyz") => {
            if manager.is_exported() {
                text(StatusCode::OK, "ok")
            } else {
                text(StatusCode::SERVICE_UNAVAILABLE, "not ready")
            }
        }
        (&Method::GET, "/metrics") => match metrics::encode() {
            Ok((content_type, body)) => {
                let mut response = full(StatusCode::OK, "text/plain", body);
                if let Ok(value) = HeaderValue::from_str(&content_type) {
                    response.headers_mut().insert(CONTENT_TYPE, value);
                }
                response
            }
            Err(e) => error_response(&e),
        },
        (&Method::GET, "/v1/shares") => json(StatusCode::OK, &manager.share_list()),
        (&Method::GET, "/v1/watch") => watch_response(manager),
        (method, path) => match share_volume(path) {
            Some(Ok(volume)) => match *method {
                Method::GET => status_response(manager.share_get(&volume)),
                Method::POST => status_response(manager.share_create(&volume)),
                Method::DELETE => status_response(manager.share_delete(&volume)),
                _ => text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
            },
            Some(Err(e)) => error_response(&e),
            None => text(StatusCode::NOT_FOUND, "not found"),
        },
    }
}

/// Volume name of a `/v1/shares/{volume}` path.
fn share_volume(path: &str) -> Option<Result<String>> {
    let raw = path.strip_prefix(SHARES_PREFIX)?.strip_prefix('/')?;
    if raw.is_empty() || raw.contains('/') {
        return None;
    }
    Some(
        urlencoding::decode(raw)
            .map(|v| v.into_owned())
            .map_err(|e| Error::Config(format!("invalid volume name {}: {}", raw, e))),
    )
}

async fn handle(
    manager: Arc<ShareManager>,
    req: Request<hyper::body::Incoming>,
) -> std::result::Result<Response<ApiBody>, Infallible> {
    debug!(method = %req.method(), path = %req.uri().path(), "Control API request");
    Ok(route(&manager, req.method(), req.uri().path()))
}

/// Bind `addr` and serve until `shutdown` is cancelled.
pub async fn run_server(addr: &str, manager: Arc<ShareManager>, shutdown: CancellationToken) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid control API address {}: {}", addr, e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind control API: {}", e)))?;

    serve(listener, manager, shutdown).await
}

/// Serve connections from an already bound listener.
pub async fn serve(listener: TcpListener, manager: Arc<ShareManager>, shutdown: CancellationToken) -> Result<()> {
    info!("Control API listening on {}", listener.local_addr()?);

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Control API stopped");
                return Ok(());
            }
            accepted = listener.accept() => accepted
                .map_err(|e| Error::Internal(format!("Control API accept error: {}", e)))?,
        };

        let io = TokioIo::new(stream);
        let manager = manager.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle(manager.clone(), req));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Control API connection error: {}", e);
            }
        });
    }
}
