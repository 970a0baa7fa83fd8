// ABOUTME: Boxyard server bootstrap
// ABOUTME: Opens the database, registers providers, starts workers and the reconciler, then serves the API

use anyhow::Context;
use axum::http::HeaderValue;
use boxyard_compute::{DockerProvider, ProviderRegistry, DOCKER_PROVIDER};
use boxyard_config::{PipelineConfig, PolicyTable};
use boxyard_deploy::{BoxManager, DeployOrchestrator, HealthReconciler, LocalQueue};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub mod api;
pub mod config;

#[cfg(test)]
mod tests;

use config::AppConfig;

/// Running engine behind the HTTP surface
pub struct Services {
    pub manager: Arc<BoxManager>,
    pub queue: Arc<LocalQueue>,
    pub reconciler: Option<Arc<HealthReconciler>>,
}

impl Services {
    pub async fn shutdown(&self) {
        if let Some(reconciler) = &self.reconciler {
            reconciler.stop().await;
        }
        self.queue.shutdown().await;
    }
}

pub fn build_providers(config: &AppConfig) -> ProviderRegistry {
    let mut providers = ProviderRegistry::new();

    if config.docker_enabled {
        match DockerProvider::new() {
            Ok(docker) => providers.register(DOCKER_PROVIDER, Arc::new(docker)),
            Err(e) => warn!("Docker provider unavailable: {}", e),
        }
    }

    if providers.is_empty() {
        warn!("No compute providers registered; box creation will be rejected");
    } else if !providers.contains(&config.default_provider) {
        warn!(
            "Default provider '{}' is not registered (available: {:?}); box creation will be rejected",
            config.default_provider,
            providers.names()
        );
    }
    providers
}

/// Start workers, resume attempts a previous process left in flight, and start the reconciler
pub async fn start_services(
    pool: SqlitePool,
    providers: ProviderRegistry,
    config: &AppConfig,
) -> anyhow::Result<Services> {
    let pipeline = PipelineConfig::from_env().context("invalid pipeline configuration")?;
    let policies = PolicyTable::from_env().context("invalid step policy table")?;
    let reconcile_interval = pipeline.reconcile_interval();

    let queue = Arc::new(LocalQueue::new());
    let orchestrator = Arc::new(DeployOrchestrator::new(
        pool,
        queue.clone(),
        providers,
        policies,
        pipeline,
    ));
    orchestrator.start_workers().await?;

    let resumed = orchestrator.resume_in_flight().await?;
    if resumed > 0 {
        info!("Resumed {} in-flight deployment(s)", resumed);
    }

    let reconciler = if config.reconcile_enabled {
        let reconciler = Arc::new(HealthReconciler::new(
            orchestrator.boxes().clone(),
            orchestrator.providers().clone(),
            reconcile_interval,
        ));
        reconciler.start().await;
        Some(reconciler)
    } else {
        info!("Health reconciliation disabled");
        None
    };

    let manager = Arc::new(BoxManager::new(
        orchestrator,
        config.default_provider.clone(),
    ));

    Ok(Services {
        manager,
        queue,
        reconciler,
    })
}

pub async fn run_migrations(config: &AppConfig) -> anyhow::Result<()> {
    boxyard_storage::connect(&config.database_path)
        .await
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    info!("Database at {} is up to date", config.database_path.display());
    Ok(())
}

pub async fn run_server(config: AppConfig) -> anyhow::Result<()> {
    let pool = boxyard_storage::connect(&config.database_path)
        .await
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;

    let providers = build_providers(&config);
    let services = start_services(pool, providers, &config).await?;

    let mut app = api::create_router(api::AppState {
        manager: services.manager.clone(),
    })
    .layer(TraceLayer::new_for_http());

    if let Some(origin) = &config.cors_origin {
        let cors = CorsLayer::new()
            .allow_origin(
                origin
                    .parse::<HeaderValue>()
                    .with_context(|| format!("invalid CORS origin '{}'", origin))?,
            )
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }

    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {}", address))?;
    info!("Boxyard API listening on {}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    services.shutdown().await;
    info!("Boxyard stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
