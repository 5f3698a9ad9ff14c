use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use routing::{
    spawn_audit_logger, AdapterSet, JsonFileConfigStore, RoutingConfig, RoutingService,
    TemplateCatalog,
};
use routing_server::api::{self, AppState};
use routing_server::config::ServerArgs;
use routing_server::providers::OpenAiCompatibleAdapter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = ServerArgs::parse();

    let mut config =
        RoutingConfig::load(args.config.as_deref()).context("Failed to load routing config")?;
    if let Some(secs) = args.sweep_interval_secs {
        config.tracker.sweep_interval_secs = secs;
        config.validate().context("Invalid sweep interval")?;
    }

    let templates = match &args.templates {
        Some(path) => TemplateCatalog::load(path)
            .with_context(|| format!("Failed to load templates from {}", path.display()))?,
        None => TemplateCatalog::builtin(),
    };

    let adapters = args.openai_providers.iter().fold(AdapterSet::new(), |set, provider| {
        set.with(Arc::new(OpenAiCompatibleAdapter::new(
            provider.as_str(),
            args.openai_base_url.as_str(),
        )))
    });

    let store = JsonFileConfigStore::new(&args.store_path).shared();
    let service = RoutingService::start(config, store, adapters, templates)
        .await
        .with_context(|| format!("Failed to open model store {}", args.store_path.display()))?
        .shared();

    let _audit = spawn_audit_logger(service.events());
    let _sweeper = service.spawn_sweeper();

    let app = api::router(AppState {
        service: Arc::clone(&service),
        call_timeout: args.call_timeout(),
    })
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;
    info!(
        addr = %args.bind,
        store = %args.store_path.display(),
        "Routing server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Routing server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
    }
}
