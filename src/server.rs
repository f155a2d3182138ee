use axum::routing::get;
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{AdmissionConfig, Cli};
use crate::error::{AdmissionError, Result};
use crate::gate::Gate;
use crate::handlers::{admission_stats, health_check, mark_start, not_found};
use crate::middleware::{admission_middleware, logging_middleware};
use crate::registry::BucketRegistry;

/// Put `api` behind the admission layer, next to the health and stats routes.
///
/// Every route, the fallback included, passes through admission; the host
/// routes sit on exempt paths by default. Layers on `api` run after admission,
/// so the layer that attaches `Authentication` must wrap the router returned
/// here, not `api`, or signed-in callers are classified as anonymous.
pub fn create_app(gate: Arc<Gate>, api: Router) -> Router {
    let ops = Router::new()
        .route("/health", get(health_check))
        .route("/actuator/admission", get(admission_stats))
        .with_state(Arc::clone(&gate));

    ops.merge(api)
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(gate, admission_middleware))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

/// Periodically drop idle buckets.
pub fn spawn_sweeper(registry: Arc<BucketRegistry>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            registry.sweep_idle();
        }
    })
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
    gate: Arc<Gate>,
    sweep_interval: Duration,
}

impl Server {
    pub fn new(cli: &Cli, config: AdmissionConfig, api: Router) -> Result<Self> {
        if cli.sweep_interval.is_zero() {
            return Err(AdmissionError::ConfigInvalid(
                "sweep interval must be greater than 0".to_string(),
            ));
        }
        let gate = Arc::new(Gate::new(config)?);
        let app = create_app(Arc::clone(&gate), api);

        Ok(Self {
            app,
            bind_addr: cli.bind_addr,
            gate,
            sweep_interval: cli.sweep_interval,
        })
    }

    pub fn gate(&self) -> &Arc<Gate> {
        &self.gate
    }

    pub async fn run(self) -> std::result::Result<(), Box<dyn std::error::Error>> {
        mark_start();
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        let tiers = self.gate.tiers();
        tracing::info!("Admission layer listening on {}", self.bind_addr);
        tracing::info!(
            strict = %tiers.strict,
            moderate = %tiers.moderate,
            lenient = %tiers.lenient,
            authenticated = %tiers.authenticated,
            max_buckets = self.gate.registry().max_entries(),
            idle_ttl = ?self.gate.registry().idle_ttl(),
            "Tier table loaded"
        );

        let sweeper = spawn_sweeper(Arc::clone(self.gate.registry()), self.sweep_interval);

        // Run server with graceful shutdown
        let served = axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await;

        sweeper.abort();
        served?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
