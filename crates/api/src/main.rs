mod config;
mod error;
mod metrics;
mod routes;

use anyhow::Context;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use extract::{LlmClient, LlmExtractionProvider, RetryPolicy, TextGenerator};
use index::{CachedEmbedder, Embedder, EmbeddingClient, EntityIndex, GraphStore, MemoryGraphStore, Neo4jStore};
use pipeline::{PipelineContext, Services};

use crate::config::{AppConfig, LogConfig, StoreBackend};
use crate::metrics::Metrics;
use crate::routes::{AppState, router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("invalid configuration")?;
    init_tracing(&config.log);

    let state = build_state(&config).await?;
    let app = router(state, config.server.max_upload_bytes());

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;

    tracing::info!("Server listening on http://{}", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn build_state(config: &AppConfig) -> anyhow::Result<AppState> {
    let retry = RetryPolicy::from_config(&config.retry);
    let schema = config.schema.build()?;

    let llm_client = LlmClient::new(config.llm.clone(), retry.clone()).context("failed to create LLM client")?;
    tracing::info!(model = %llm_client.model(), api = ?config.llm.api, "LLM client ready");
    let llm: Arc<dyn TextGenerator> = Arc::new(llm_client);

    let embedding_client = Arc::new(
        EmbeddingClient::new(config.embedding.clone(), retry).context("failed to create embedding client")?,
    );
    tracing::info!(model = %embedding_client.model(), api = ?config.embedding.api, "embedding client ready");
    let cache = config
        .cache
        .enabled
        .then(|| Arc::new(CachedEmbedder::new(embedding_client.clone(), config.cache.max_entries)));
    let embedder: Arc<dyn Embedder> = match &cache {
        Some(cached) => cached.clone(),
        None => embedding_client,
    };

    let pipeline_config = config.pipeline();
    let (store, entity_index): (Arc<dyn GraphStore>, Option<Arc<dyn EntityIndex>>) = match config.store.backend {
        StoreBackend::Neo4j => {
            let neo4j = config.store.neo4j()?;
            let store = Arc::new(
                Neo4jStore::connect(&neo4j, pipeline_config.index.clone())
                    .await
                    .with_context(|| format!("failed to connect to Neo4j at {}", neo4j.uri))?,
            );
            tracing::info!(uri = %neo4j.uri, database = %neo4j.database, "connected to Neo4j");
            let entity_index: Arc<dyn EntityIndex> = store.clone();
            let store: Arc<dyn GraphStore> = store;
            (store, Some(entity_index))
        }
        StoreBackend::Memory => {
            tracing::info!("using in-memory graph store and entity index");
            let store: Arc<dyn GraphStore> = Arc::new(MemoryGraphStore::new());
            (store, None)
        }
    };

    let pipeline = PipelineContext::new(
        pipeline_config,
        schema,
        Services {
            store,
            extraction: Arc::new(LlmExtractionProvider::new(llm.clone())),
            llm,
            embedder,
            entity_index,
        },
    )?;

    Ok(AppState {
        pipeline: Arc::new(pipeline),
        metrics: Metrics::new(),
        cache,
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => tracing::info!("Received SIGTERM, starting shutdown..."),
    }
}
