//! HTTP listener loop and request handling for the metrics endpoint.

use std::convert::Infallible;
use std::io;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::metrics::ForexMetrics;

/// Path the registry is served on
pub const METRICS_PATH: &str = "/metrics";

/// Accept connections until `shutdown` fires (`Ok`) or the listener fails (`Err`).
///
/// Each connection runs on its own task in `connections`. On shutdown the
/// connections finish their in-flight request and close.
pub(crate) async fn serve(
    listener: TcpListener,
    metrics: Arc<ForexMetrics>,
    shutdown: CancellationToken,
    connections: TaskTracker,
) -> Result<()> {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) if is_connection_error(&e) => {
                debug!(error = %e, "Dropped connection before accept completed");
                continue;
            }
            Err(e) => return Err(Error::Serve(format!("accept error: {}", e))),
        };

        let io = TokioIo::new(stream);
        let metrics = Arc::clone(&metrics);
        let shutdown = shutdown.clone();

        connections.spawn(async move {
            let service = service_fn(move |req| {
                let metrics = Arc::clone(&metrics);
                async move { Ok::<_, Infallible>(handle_request(&req, &metrics)) }
            });

            let conn = http1::Builder::new().serve_connection(io, service);
            let mut conn = std::pin::pin!(conn);

            let result = tokio::select! {
                result = conn.as_mut() => result,
                _ = shutdown.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    conn.as_mut().await
                }
            };

            if let Err(e) = result {
                debug!(peer = %peer, error = %e, "Metrics server connection error");
            }
        });
    }
}

/// Errors that only affect the connection being accepted, not the listener.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

fn handle_request(req: &Request<Incoming>, metrics: &ForexMetrics) -> Response<Full<Bytes>> {
    if req.uri().path() != METRICS_PATH {
        return text_response(StatusCode::NOT_FOUND, "not found");
    }

    if req.method() != Method::GET && req.method() != Method::HEAD {
        let mut response = text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        response
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
        return response;
    }

    match metrics.render() {
        Ok(body) => {
            let mut response = text_response(StatusCode::OK, body);
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(metrics.content_type()));
            response
        }
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to render metrics")
        }
    }
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}
