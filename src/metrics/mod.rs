//! Prometheus metrics and probe endpoints
//!
//! Serves `/metrics` on the metrics bind address and `/healthz` + `/readyz`
//! on the probe bind address. The reconcilers record counts and durations
//! labelled by reconciler name.

use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

lazy_static! {
    /// Total number of reconciliations per reconciler
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "aws_network_topology_operator_reconciliations_total",
        "Total number of reconciliations",
        &["reconciler"]
    )
    .unwrap();

    /// Total number of reconciliation errors per reconciler
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "aws_network_topology_operator_reconciliation_errors_total",
        "Total number of reconciliation errors",
        &["reconciler"]
    )
    .unwrap();

    /// Reconciliation duration histogram per reconciler
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "aws_network_topology_operator_reconcile_duration_seconds",
        "Duration of reconciliations in seconds",
        &["reconciler"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .unwrap();
}

/// Serve `/metrics` on the given address
pub async fn serve_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("metrics server listening on {addr}");
    serve(listener, handle_metrics_request).await
}

/// Serve `/healthz` and `/readyz` on the given address
pub async fn serve_probes(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("health probe server listening on {addr}");
    serve(listener, handle_probe_request).await
}

async fn serve<F>(listener: TcpListener, handler: fn(Request<hyper::body::Incoming>) -> F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = Result<Response<Full<Bytes>>, hyper::Error>> + Send + 'static,
{
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .serve_connection(io, service_fn(handler))
                .await
            {
                error!("error serving connection: {err}");
            }
        });
    }
}

async fn handle_metrics_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => metrics_response(),
        _ => not_found_response(),
    };
    Ok(response)
}

async fn handle_probe_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/healthz" | "/readyz" => ok_response(),
        _ => not_found_response(),
    };
    Ok(response)
}

fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        error!("failed to encode metrics: {err}");
        return Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Full::new(Bytes::from("failed to encode metrics")))
            .unwrap();
    }

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", encoder.format_type())
        .body(Full::new(Bytes::from(buffer)))
        .unwrap()
}

fn ok_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .body(Full::new(Bytes::from("ok")))
        .unwrap()
}

fn not_found_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Full::new(Bytes::from("not found")))
        .unwrap()
}
