//! Monitoring HTTP endpoint.
//!
//! `GET /monitor` returns the JSON [`StatsSnapshot`](crate::metrics::StatsSnapshot) and
//! `GET /metrics` the Prometheus text exposition. Everything else is a 404.

use crate::metrics::MetricsReader;
use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const MONITOR_PATH: &str = "/monitor";
pub const METRICS_PATH: &str = "/metrics";

/// Bind the listener up front so an unavailable port fails startup.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind monitor server to {addr}"))
}

/// Serve until `cancel` fires. Connections already accepted finish on their own.
pub async fn serve(listener: TcpListener, reader: MetricsReader, cancel: CancellationToken) {
    match listener.local_addr() {
        Ok(addr) => info!("monitor server listening on http://{addr}{MONITOR_PATH}"),
        Err(err) => warn!(error = %err, "monitor server address unavailable"),
    }

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("monitor server shutting down");
                break;
            }
            accept_result = listener.accept() => {
                let (stream, peer) = match accept_result {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(error = %err, "failed to accept monitor connection");
                        continue;
                    }
                };

                let reader = reader.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req: Request<Incoming>| {
                        let response = route(&reader, &req);
                        async move { Ok::<_, Infallible>(response) }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(%peer, error = %err, "error serving monitor connection");
                    }
                });
            }
        }
    }
}

fn route<B>(reader: &MetricsReader, req: &Request<B>) -> Response<Full<Bytes>> {
    if req.method() != Method::GET {
        return respond(
            StatusCode::METHOD_NOT_ALLOWED,
            "text/plain",
            Bytes::from_static(b"Method Not Allowed"),
        );
    }

    match req.uri().path() {
        MONITOR_PATH => match serde_json::to_vec_pretty(&reader.snapshot()) {
            Ok(body) => respond(StatusCode::OK, "application/json", Bytes::from(body)),
            Err(err) => internal_error("snapshot", &err),
        },
        METRICS_PATH => match reader.encode_prometheus() {
            Ok(body) => respond(StatusCode::OK, prometheus::TEXT_FORMAT, Bytes::from(body)),
            Err(err) => internal_error("prometheus", &err),
        },
        _ => respond(
            StatusCode::NOT_FOUND,
            "text/plain",
            Bytes::from_static(b"Not Found"),
        ),
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn internal_error(what: &str, err: &dyn std::error::Error) -> Response<Full<Bytes>> {
    error!(error = %err, "failed to encode {what}");
    respond(
        StatusCode::INTERNAL_SERVER_ERROR,
        "text/plain",
        Bytes::from_static(b"Internal Server Error"),
    )
}
