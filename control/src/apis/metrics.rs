//! Controller metrics
//!
//! Process-wide prometheus registry plus the optional `/metrics` endpoint.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::convert::Infallible;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

lazy_static! {
    /// Controller metrics registry
    pub static ref CONTROLLER_METRICS_REGISTRY: Registry = Registry::new();

    /// Config cache refresh duration
    static ref CACHE_REFRESH_DURATION: HistogramVec = {
        let opts = HistogramOpts::new(
            "lbsync_cache_refresh_duration_seconds",
            "Config cache refresh duration in seconds",
        );
        let histogram = HistogramVec::new(opts, &["result"])
            .expect("Failed to create histogram");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("Failed to register histogram");
        histogram
    };

    /// Config cache refreshes total
    static ref CACHE_REFRESHES_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "lbsync_cache_refreshes_total",
            "Total number of config cache refreshes",
        );
        let counter = IntCounterVec::new(opts, &["result"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Per load balancer listener resolution failures
    static ref LISTENER_RESOLVE_FAILURES_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "lbsync_listener_resolve_failures_total",
            "Total number of failed listener resolutions per load balancer",
        );
        let counter = IntCounterVec::new(opts, &["load_balancer"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// ConfigTargets in the current cache snapshot
    static ref CACHE_TARGETS: IntGauge = {
        let gauge = IntGauge::new(
            "lbsync_cache_targets",
            "Number of matched config targets in the current cache snapshot",
        )
        .expect("Failed to create gauge");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(gauge.clone()))
            .expect("Failed to register gauge");
        gauge
    };

    /// Register/deregister calls
    static ref SYNC_CALLS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "lbsync_sync_calls_total",
            "Total number of batch register/deregister calls",
        );
        let counter = IntCounterVec::new(opts, &["action", "result"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Addresses carried by register/deregister calls
    static ref SYNC_TARGETS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "lbsync_sync_targets_total",
            "Total number of backend addresses sent in batch calls",
        );
        let counter = IntCounterVec::new(opts, &["action"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Pod events handled by the watch loop
    static ref POD_EVENTS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "lbsync_pod_events_total",
            "Total number of pod events handled",
        );
        let counter = IntCounterVec::new(opts, &["kind", "result"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Watch stream restarts
    static ref WATCH_RESTARTS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "lbsync_watch_restarts_total",
            "Total number of pod watch stream restarts",
        );
        let counter = IntCounterVec::new(opts, &["reason"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };
}

/// Record a config cache refresh
pub fn record_cache_refresh(duration_secs: f64, result: &str) {
    CACHE_REFRESH_DURATION
        .with_label_values(&[result])
        .observe(duration_secs);

    CACHE_REFRESHES_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_listener_resolve_failure(load_balancer_id: &str) {
    LISTENER_RESOLVE_FAILURES_TOTAL
        .with_label_values(&[load_balancer_id])
        .inc();
}

pub fn set_cache_targets(count: usize) {
    CACHE_TARGETS.set(i64::try_from(count).unwrap_or(i64::MAX));
}

/// Record one batch register/deregister call and the addresses it carried
pub fn record_sync_call(action: &str, targets: usize, result: &str) {
    SYNC_CALLS_TOTAL.with_label_values(&[action, result]).inc();
    SYNC_TARGETS_TOTAL
        .with_label_values(&[action])
        .inc_by(targets as u64);
}

pub fn record_pod_event(kind: &str, result: &str) {
    POD_EVENTS_TOTAL.with_label_values(&[kind, result]).inc();
}

pub fn record_watch_restart(reason: &str) {
    WATCH_RESTARTS_TOTAL.with_label_values(&[reason]).inc();
}

/// Gather controller metrics
pub fn gather_controller_metrics() -> Result<String, String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = CONTROLLER_METRICS_REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert to UTF-8: {}", e))
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.uri().path() != "/metrics" || *req.method() != Method::GET {
        return Ok(text_response(StatusCode::NOT_FOUND, "Not Found\n".to_string()));
    }

    match gather_controller_metrics() {
        Ok(body) => Ok(text_response(StatusCode::OK, body)),
        Err(e) => {
            error!("{}", e);
            Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, e))
        }
    }
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}

/// Serve `GET /metrics` on `listener` until `shutdown` is cancelled
pub async fn serve_metrics(listener: TcpListener, shutdown: CancellationToken) {
    let local_addr = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());
    info!("Metrics endpoint listening on {}", local_addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        debug!("Accepted metrics connection from {}", peer_addr);
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service_fn(handle_request))
                                .await
                            {
                                debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error on {}: {}", local_addr, e);
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!("Metrics endpoint on {} stopped", local_addr);
                break;
            }
        }
    }
}
