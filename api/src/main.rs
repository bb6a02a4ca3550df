mod config;
mod constants;
mod domain;
mod models;
mod routes;
mod services;
mod store;
#[cfg(test)]
mod testing;
mod workflow;

use anyhow::Context;
use axum::{Router, routing::get};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use config::{Config, QueueBackend};
use services::llm::AnthropicClient;
use services::queue::QueueService;
use services::summarizer::Summarizer;
use services::transcript::YoutubeTranscripts;
use store::{MemoryStore, PgStore, QueueStore};
use workflow::RetryPolicy;
use workflow::dispatcher::{Dispatcher, InlineDispatcher, PgDispatcher};
use workflow::summarize::Pipeline;

pub struct AppState {
    pub queue: QueueService,
    pub jwt_secret: Vec<u8>,
}

async fn health() -> &'static str {
    "ok"
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(config.json_logs);

    // YouTube traffic goes through the proxy when one is configured; the model API never does
    let youtube_http =
        services::http::build_client(config.proxy_url.as_deref(), config.upstream_timeout)
            .context("Failed to build YouTube HTTP client")?;
    let model_http = services::http::build_client(None, config.model_timeout)
        .context("Failed to build model HTTP client")?;

    let transcripts = Arc::new(YoutubeTranscripts::new(
        youtube_http,
        config.youtube_base_url.clone(),
    ));
    let model = Arc::new(AnthropicClient::new(
        model_http,
        config.anthropic_api_key.clone(),
        config.anthropic_base_url.clone(),
    ));
    let summarizer = Summarizer::new(model, config.summary_model.clone());
    let policy = RetryPolicy {
        max_attempts: config.worker.step_max_attempts,
        base_backoff: config.worker.step_backoff,
        ..RetryPolicy::default()
    };

    let (store, dispatcher): (Arc<dyn QueueStore>, Arc<dyn Dispatcher>) = match config.backend {
        QueueBackend::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set")?;
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await
                .context("Failed to connect to database")?;

            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("Failed to run migrations")?;

            let store: Arc<dyn QueueStore> = Arc::new(PgStore::new(pool.clone()));
            let pipeline = Arc::new(Pipeline::new(
                store.clone(),
                transcripts,
                summarizer,
                policy,
            ));

            let worker_pool = pool.clone();
            let worker_config = config.worker.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    workflow::worker::run_workflow_worker(worker_pool, pipeline, worker_config)
                        .await
                {
                    tracing::error!(error = %e, "Workflow worker stopped");
                }
            });

            (store, Arc::new(PgDispatcher::new(pool)))
        }
        QueueBackend::Memory => {
            tracing::warn!("Using in-memory queue backend; state is lost on restart");
            let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
            let pipeline = Arc::new(Pipeline::new(
                store.clone(),
                transcripts,
                summarizer,
                policy,
            ));
            (store, Arc::new(InlineDispatcher::new(pipeline)))
        }
    };

    let state = Arc::new(AppState {
        queue: QueueService::new(store, dispatcher),
        jwt_secret: config.jwt_secret.clone(),
    });

    let app = Router::new()
        .route("/health", get(health))
        .nest("/api", routes::build_routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    tracing::info!(%addr, backend = ?config.backend, "Listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("Server failed")?;

    Ok(())
}
