use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::env;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "http_science".to_string());

    // === Replay Metrics ===

    pub static ref REPLAY_REQUESTS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("replay_requests_total", "Total number of replayed requests that were forwarded")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["job_type"]  // job_type: load, correctness
        ).unwrap();

    pub static ref REPLAY_DIFFS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("replay_diffs_total", "Number of requests whose control and experiment responses differed")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref FORWARD_ERRORS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("forward_errors_total", "Failed forwards by target side and error category")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["side", "category"]
        ).unwrap();

    pub static ref GATE_REJECTIONS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("gate_rejections_total", "Requests dropped because no concurrency permit was available")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref IN_FLIGHT_REQUESTS: IntGauge =
        IntGauge::with_opts(
            Opts::new("in_flight_requests", "Number of replayed requests currently being handled")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    // === Discovery Metrics ===

    pub static ref FILES_REPLAYED_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("files_replayed_total", "Number of traffic files handed to the generator")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    prometheus::default_registry().register(Box::new(REPLAY_REQUESTS_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(REPLAY_DIFFS_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(FORWARD_ERRORS_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(GATE_REJECTIONS_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(IN_FLIGHT_REQUESTS.clone()))?;
    prometheus::default_registry().register(Box::new(FILES_REPLAYED_TOTAL.clone()))?;

    Ok(())
}

/// HTTP handler for the Prometheus metrics endpoint.
pub async fn metrics_handler(
    _req: Request<Body>,
    registry: Arc<Mutex<Registry>>,
) -> Result<Response<Body>, hyper::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry.lock().unwrap().gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        let mut response = Response::new(Body::from("failed to encode metrics"));
        *response.status_mut() = hyper::StatusCode::INTERNAL_SERVER_ERROR;
        return Ok(response);
    }

    let mut response = Response::new(Body::from(buffer));
    if let Ok(content_type) = hyper::header::HeaderValue::from_str(encoder.format_type()) {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, content_type);
    }
    Ok(response)
}

/// Starts the Prometheus metrics HTTP server on `addr`.
pub async fn start_metrics_server(addr: SocketAddr, registry: Arc<Mutex<Registry>>) {
    let make_svc = make_service_fn(move |_conn| {
        let registry_clone = registry.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let registry_clone_inner = registry_clone.clone();
                async move { metrics_handler(req, registry_clone_inner).await }
            }))
        }
    });

    let server = match Server::try_bind(&addr) {
        Ok(builder) => builder.serve(make_svc),
        Err(e) => {
            error!(addr = %addr, error = %e, "Failed to bind metrics server");
            return;
        }
    };
    info!(addr = %addr, "Metrics server listening");

    if let Err(e) = server.await {
        error!(error = %e, "Metrics server error");
    }
}

/// Gathers and encodes metrics as a string for final output.
pub fn gather_metrics_string(registry: &Arc<Mutex<Registry>>) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.lock().unwrap().gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::from("# ERROR ENCODING METRICS");
    }
    String::from_utf8(buffer).unwrap_or_else(|e| {
        error!(error = %e, "Metrics output is not UTF-8");
        String::from("# ERROR ENCODING METRICS TO UTF-8")
    })
}
