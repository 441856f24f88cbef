use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use animserver::api;
use animserver::config::AppConfig;
use animserver::llm::{gemini::GeminiBackend, local::LocalBackend, SpecBackend, SpecOrchestrator};
use animserver::pipeline::{CoordinatorConfig, JobCoordinator, JobQueue};
use animserver::shared::state::AppState;
use animserver::shared::utils::create_conn;
use animserver::storage::{S3Storage, StorageAdapter};
use animserver::store::{DieselStore, MetadataStore};

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let config = AppConfig::load()?;

    let pool = create_conn(&config.database.url, config.database.max_connections)?;
    let store: Arc<dyn MetadataStore> = Arc::new(DieselStore::new(pool));
    let storage: Arc<dyn StorageAdapter> = Arc::new(S3Storage::connect(&config.storage).await);

    let llm_primary: Arc<dyn SpecBackend> = Arc::new(GeminiBackend::new(
        config.llm.gemini_api_key.clone(),
        config.llm.gemini_model.clone(),
    ));
    let llm_fallback: Arc<dyn SpecBackend> = Arc::new(LocalBackend::new(
        config.llm.local_url.clone(),
        config.llm.local_model.clone(),
    ));
    let orchestrator = SpecOrchestrator::new(
        llm_primary.clone(),
        llm_fallback.clone(),
        config.llm.attempt_budget,
    );

    let coordinator = Arc::new(JobCoordinator::new(
        orchestrator,
        storage.clone(),
        store.clone(),
        config.sandbox.clone(),
        config.renderer.clone(),
        CoordinatorConfig {
            attempt_cap: config.llm.attempt_budget,
            job_deadline: std::time::Duration::from_secs(config.pipeline.job_deadline_s),
        },
    ));
    let queue = JobQueue::start(
        coordinator.clone(),
        config.pipeline.worker_concurrency,
        config.pipeline.queue_max,
    );

    let state = Arc::new(AppState {
        config: config.clone(),
        coordinator,
        queue,
        store,
        storage,
        llm_primary,
        llm_fallback,
    });

    let app = api::configure()
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("animserver listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        if let Ok(mut signal) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            signal.recv().await;
        }
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
