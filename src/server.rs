//! # HTTP Server Module
//!
//! The Axum server, the route table, and the background workers.
//!
//! ## Server Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Server                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Middleware Stack                   │    │
//! │  │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  │    │
//! │  │  │ TraceLayer  │─▶│  CorsLayer  │─▶│   Router    │  │    │
//! │  │  │  (Logging)  │  │ (Permissive)│  │  (Routes)   │  │    │
//! │  │  └─────────────┘  └─────────────┘  └─────────────┘  │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │                                                             │
//! │  Background workers (cooperative, snapshot-then-apply):     │
//! │  ├── idle-bucket sweeper      every cleanup_interval        │
//! │  ├── schedule evaluator       every schedule_tick (~1s)     │
//! │  └── adaptive evaluator       every evaluation_interval     │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Graceful Shutdown
//!
//! `SIGINT` (Ctrl+C) and `SIGTERM` both drain in-flight requests before
//! the process exits; the workers are aborted with the server.

use crate::config::Config;
use crate::handlers::{self, AppState, SharedState};
use crate::service::RateLimitService;
use crate::validation::RequestValidator;
use axum::routing::{get, post, put};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// HTTP server wrapper for the ratelimitd service.
pub struct Server {
    app: Router,
    bind_address: String,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

/// Builds the router with all routes and middleware configured.
///
/// Exposed separately from [`Server`] so tests can drive the app without
/// binding a socket.
pub fn create_app(service: Arc<RateLimitService>) -> Router {
    let state: SharedState = Arc::new(AppState {
        service,
        validator: RequestValidator::new(),
    });

    Router::new()
        // the decision endpoint
        .route("/check", post(handlers::check))
        // admin: limits
        .route("/admin/keys", get(handlers::list_keys))
        .route("/admin/limits/default", put(handlers::set_default_limits))
        .route(
            "/admin/limits/patterns",
            put(handlers::set_pattern_limits).delete(handlers::delete_pattern_limits),
        )
        .route(
            "/admin/limits/:key",
            get(handlers::get_key_limits)
                .put(handlers::set_key_limits)
                .delete(handlers::delete_key_limits),
        )
        .route("/admin/reload", post(handlers::reload))
        .route("/admin/cache/stats", get(handlers::cache_stats))
        // admin: schedules
        .route(
            "/admin/schedules",
            get(handlers::list_schedules).post(handlers::create_schedule),
        )
        .route(
            "/admin/schedules/:id",
            get(handlers::get_schedule)
                .put(handlers::update_schedule)
                .delete(handlers::delete_schedule),
        )
        // admin: geographic rules
        .route(
            "/admin/geo/rules",
            get(handlers::list_geo_rules).post(handlers::create_geo_rule),
        )
        .route(
            "/admin/geo/rules/:id",
            put(handlers::update_geo_rule).delete(handlers::delete_geo_rule),
        )
        .route("/admin/geo/test", post(handlers::test_geo_detection))
        // adaptive surface
        .route("/adaptive/status/:key", get(handlers::adaptive_status))
        .route("/adaptive/config", get(handlers::adaptive_config))
        .route(
            "/adaptive/override/:key",
            put(handlers::set_adaptive_override).delete(handlers::delete_adaptive_override),
        )
        // load generator
        .route("/benchmark", post(handlers::benchmark))
        // probes and expositions
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::readiness))
        .route("/metrics", get(handlers::metrics_prometheus))
        .route("/metrics/json", get(handlers::metrics_json))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

/// Spawns the cooperative background workers. Each takes a snapshot,
/// computes, and applies its updates in a short critical section; none of
/// them runs algorithm steps while sweeping.
fn spawn_workers(service: &Arc<RateLimitService>, config: &Config) -> Vec<tokio::task::JoinHandle<()>> {
    let mut workers = Vec::new();

    let sweeper = Arc::clone(service);
    let sweep_every = config.cleanup_interval;
    workers.push(tokio::spawn(async move {
        let mut tick = tokio::time::interval(sweep_every.max(Duration::from_millis(100)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            sweeper.sweep_tick();
        }
    }));

    let scheduler = Arc::clone(service);
    let schedule_every = config.schedule_tick;
    workers.push(tokio::spawn(async move {
        let mut tick = tokio::time::interval(schedule_every.max(Duration::from_millis(100)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            scheduler.schedule_tick();
        }
    }));

    let adaptive = Arc::clone(service);
    let adaptive_every = Duration::from_millis(config.adaptive.evaluation_interval_ms.max(1000));
    workers.push(tokio::spawn(async move {
        let mut tick = tokio::time::interval(adaptive_every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            adaptive.adaptive_tick().await;
        }
    }));

    workers
}

impl Server {
    /// Builds the service graph, the router, and the workers.
    pub async fn new(config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        let bind_address = config.bind_address.clone();
        let service = Arc::new(RateLimitService::build(&config).await?);
        let workers = spawn_workers(&service, &config);
        let app = create_app(service);
        Ok(Self {
            app,
            bind_address,
            workers,
        })
    }

    /// Serves until a shutdown signal arrives, then drains in-flight
    /// requests and stops the workers.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = tokio::net::TcpListener::bind(&self.bind_address).await?;

        tracing::info!("ratelimitd listening on {}", self.bind_address);
        tracing::info!("health at /health, readiness at /ready, metrics at /metrics");

        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        for worker in &self.workers {
            worker.abort();
        }
        tracing::info!("shutdown complete");
        Ok(())
    }
}

/// Resolves when either Ctrl+C or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("received terminate signal, initiating graceful shutdown");
        },
    }
}
