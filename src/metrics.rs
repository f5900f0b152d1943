use axum::{
    body::Body,
    extract::{Extension, MatchedPath},
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use eyre::{Result as EyreResult, WrapErr};
use http::StatusCode;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Metric families of the admission core, registered on an explicitly owned
/// registry and passed to components at construction.
pub struct Metrics {
    registry: Registry,
    pub queue_length: IntGaugeVec,
    pub wait_time_seconds: HistogramVec,
    pub release_rate: GaugeVec,
    pub admissions_total: IntCounterVec,
    pub queue_joins_total: IntCounterVec,
    pub queue_heartbeats_total: IntCounterVec,
    pub api_request_duration_seconds: HistogramVec,
    pub store_operation_duration_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> EyreResult<Arc<Self>> {
        let registry = Registry::new();

        let queue_length = IntGaugeVec::new(
            Opts::new("queue_length", "Waiting entries per event"),
            &["event_id"],
        )?;
        let wait_time_seconds = HistogramVec::new(
            HistogramOpts::new(
                "wait_time_seconds",
                "Time from join to admission, observed at admission",
            )
            .buckets(vec![
                1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0,
            ]),
            &["event_id"],
        )?;
        let release_rate = GaugeVec::new(
            Opts::new("release_rate", "Configured admissions per second"),
            &["event_id"],
        )?;
        let admissions_total = IntCounterVec::new(
            Opts::new("admissions_total", "Entries admitted"),
            &["event_id"],
        )?;
        let queue_joins_total = IntCounterVec::new(
            Opts::new("queue_joins_total", "Accepted queue joins"),
            &["event_id", "priority"],
        )?;
        let queue_heartbeats_total = IntCounterVec::new(
            Opts::new("queue_heartbeats_total", "Accepted heartbeats"),
            &["event_id"],
        )?;
        let api_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("api_request_duration_seconds", "HTTP request latency"),
            &["method", "endpoint", "status"],
        )?;
        let store_operation_duration_seconds = HistogramVec::new(
            HistogramOpts::new("store_operation_duration_seconds", "Store operation latency")
                .buckets(vec![
                    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
                ]),
            &["operation"],
        )?;

        registry.register(Box::new(queue_length.clone()))?;
        registry.register(Box::new(wait_time_seconds.clone()))?;
        registry.register(Box::new(release_rate.clone()))?;
        registry.register(Box::new(admissions_total.clone()))?;
        registry.register(Box::new(queue_joins_total.clone()))?;
        registry.register(Box::new(queue_heartbeats_total.clone()))?;
        registry.register(Box::new(api_request_duration_seconds.clone()))?;
        registry.register(Box::new(store_operation_duration_seconds.clone()))?;

        Ok(Arc::new(Self {
            registry,
            queue_length,
            wait_time_seconds,
            release_rate,
            admissions_total,
            queue_joins_total,
            queue_heartbeats_total,
            api_request_duration_seconds,
            store_operation_duration_seconds,
        }))
    }

    pub fn render(&self) -> EyreResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .wrap_err("error encoding metrics")?;
        String::from_utf8(buffer).wrap_err("metrics are not valid UTF-8")
    }
}

/// Serve the text exposition format on its own port until shutdown.
pub async fn serve(
    metrics: Arc<Metrics>,
    port: u16,
    shutdown: CancellationToken,
) -> EyreResult<()> {
    let app = Router::new()
        .route("/metrics", get(render_metrics))
        .layer(Extension(metrics));
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let server = axum::Server::try_bind(&addr)?.serve(app.into_make_service());
    info!("Metrics on http://{addr}/metrics");
    server
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

async fn render_metrics(Extension(metrics): Extension<Arc<Metrics>>) -> Response {
    match metrics.render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Request-latency middleware for the API router.
pub async fn track_requests(request: Request<Body>, next: Next<Body>) -> Response {
    let metrics = request
        .extensions()
        .get::<Arc<Metrics>>()
        .expect("Metrics extension missing")
        .clone();
    let method = request.method().clone();
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path().to_owned(), |p| p.as_str().to_owned());
    let started = Instant::now();
    let response = next.run(request).await;
    metrics
        .api_request_duration_seconds
        .with_label_values(&[method.as_str(), &endpoint, response.status().as_str()])
        .observe(started.elapsed().as_secs_f64());
    response
}
