#![doc = include_str!("../Readme.md")]
#![warn(clippy::all, clippy::pedantic, clippy::cargo, clippy::nursery)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::module_name_repetitions)]

use crate::{
    keys::Keys,
    metrics::Metrics,
    queue::QueueManager,
    release::ReleaseController,
    store::{redis::RedisStore, Store},
    token::{TokenSigner, TokenVerifier},
};
use axum::{
    extract::Extension,
    middleware,
    routing::{get, post, put},
    Router, Server,
};
use clap::Parser;
use eyre::Result as EyreResult;
use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

mod api;
pub mod entries;
pub mod events;
pub mod keys;
pub mod metrics;
pub mod queue;
pub mod release;
pub mod store;
#[cfg(test)]
pub mod test_util;
pub mod token;
mod util;

#[derive(Clone, Debug, PartialEq, Eq, Parser)]
pub struct Options {
    /// HTTP port for the public API.
    #[clap(long, env = "PORT", default_value = "8080")]
    pub port: u16,

    /// Port for the Prometheus text endpoint.
    #[clap(long, env = "METRICS_PORT", default_value = "9090")]
    pub metrics_port: u16,

    /// Log filter, e.g. `info` or `anteroom=debug`.
    #[clap(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[clap(flatten)]
    pub keys: keys::Options,

    #[clap(flatten)]
    pub store: store::Options,

    #[clap(flatten)]
    pub queue: queue::Options,

    #[clap(flatten)]
    pub release: release::Options,
}

#[allow(clippy::missing_errors_doc)]
pub async fn async_main(options: Options) -> EyreResult<()> {
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            await_shutdown().await;
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    });
    run(options, shutdown).await
}

/// Process lifecycle: open store, construct components, start the release
/// controller, serve until `shutdown`, then stop the controller.
#[allow(clippy::missing_errors_doc)]
pub async fn run(options: Options, shutdown: CancellationToken) -> EyreResult<()> {
    let metrics = Metrics::new()?;
    let keys = Arc::new(Keys::new(&options.keys)?);
    let store: Arc<dyn Store> = Arc::new(RedisStore::new(&options.store, metrics.clone()).await?);

    let signer = TokenSigner::new(keys.clone());
    let verifier = Arc::new(TokenVerifier::new(keys));
    let manager = Arc::new(QueueManager::new(
        store.clone(),
        metrics.clone(),
        options.queue.clone(),
    ));
    let controller = Arc::new(ReleaseController::new(
        store.clone(),
        signer,
        metrics.clone(),
        options.release.clone(),
    ));

    controller.start().await;
    let metrics_server = tokio::spawn(metrics::serve(
        metrics.clone(),
        options.metrics_port,
        shutdown.clone(),
    ));

    let app = router(&manager, &verifier, &store, &controller, &metrics, &shutdown);
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, options.port));
    let server = Server::try_bind(&addr)?.serve(app.into_make_service());
    info!("Listening on http://{addr}");
    server
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    controller.stop().await;
    metrics_server.await??;
    Ok(())
}

fn router(
    manager: &Arc<QueueManager>,
    verifier: &Arc<TokenVerifier>,
    store: &Arc<dyn Store>,
    controller: &Arc<ReleaseController>,
    metrics: &Arc<Metrics>,
    shutdown: &CancellationToken,
) -> Router {
    Router::new()
        .route("/v1/queue/join", post(api::v1::queue::join))
        .route("/v1/queue/heartbeat", post(api::v1::queue::heartbeat))
        .route("/v1/queue/status", get(api::v1::queue::status))
        .route("/v1/queue/leave", post(api::v1::queue::leave))
        .route("/v1/token/verify", post(api::v1::token::verify))
        .route("/health", get(api::v1::health::health))
        .route("/admin/event", put(api::v1::admin::upsert_event))
        .route("/admin/events", get(api::v1::admin::list_events))
        .route("/admin/queues", get(api::v1::admin::list_queue))
        .route("/admin/admit", post(api::v1::admin::force_admit))
        .route("/admin/revoke", post(api::v1::admin::revoke))
        .route("/admin/drain", post(api::v1::admin::drain))
        .layer(middleware::from_fn(metrics::track_requests))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(Extension(manager.clone()))
        .layer(Extension(verifier.clone()))
        .layer(Extension(store.clone()))
        .layer(Extension(controller.clone()))
        .layer(Extension(metrics.clone()))
        // In-flight requests observe process shutdown as prompt cancellation.
        .layer(Extension(shutdown.clone()))
}

async fn await_shutdown() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
