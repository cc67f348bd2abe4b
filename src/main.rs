use std::sync::Arc;
use std::time::Duration;

use sea_orm_migration::MigratorTrait;
use uuid::Uuid;

use mailkeep::agent::llm::LlmClient;
use mailkeep::agent::{AgentSettings, InboxAgent};
use mailkeep::config::AppConfig;
use mailkeep::credentials::{CredentialResolver, StoreCredentialResolver};
use mailkeep::db;
use mailkeep::discovery::DiscoveryClient;
use mailkeep::embeddings::EmbeddingsClient;
use mailkeep::pool::{PoolConfig, SubmissionPool};
use mailkeep::status::{self, AppState};
use mailkeep::worker::{SendWorker, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;
    tracing::info!("mailkeep starting");
    tracing::info!("server: {}:{}", config.server.host, config.server.port);

    let db = db::connect(&config.database.url).await?;
    db::migration::Migrator::up(&db, None).await?;
    tracing::info!("database migrations complete");

    let credentials: Arc<dyn CredentialResolver> = Arc::new(StoreCredentialResolver::new(db.clone()));

    let pool = SubmissionPool::new(PoolConfig::from(&config.pool), Arc::clone(&credentials));
    let worker = SendWorker::new(
        db.clone(),
        Arc::clone(&pool),
        Arc::clone(&credentials),
        WorkerConfig::from(&config.worker),
    );
    worker.start().await?;

    let discovery = Arc::new(DiscoveryClient::new()?);

    let agent = if config.agent.enabled {
        let account_id: Option<Uuid> = config
            .agent
            .account_id
            .as_deref()
            .map(|s| s.parse())
            .transpose()
            .map_err(|e| anyhow::anyhow!("invalid MAILKEEP_AGENT_ACCOUNT_ID: {e}"))?;

        let llm = LlmClient::new(config.llm.api_key.clone(), config.llm.model.clone())?;
        let embeddings = EmbeddingsClient::new(config.llm.api_key.clone(), config.llm.embedding_model.clone())?;
        let settings = AgentSettings {
            account_id,
            poll_interval: Duration::from_secs(config.agent.poll_interval_seconds),
            escalation_email: config.agent.escalation_email.clone(),
            send_from: config.agent.send_from.clone(),
        };

        let agent = InboxAgent::new(db.clone(), Arc::clone(&credentials), Arc::clone(&pool), llm, embeddings, settings);
        agent.start().await;
        Some(agent)
    } else {
        tracing::info!("inbox agent disabled (MAILKEEP_AGENT_ENABLED=false)");
        None
    };

    let state = AppState {
        db: db.clone(),
        pool: Arc::clone(&pool),
        worker: Arc::clone(&worker),
        credentials: Arc::clone(&credentials),
        discovery,
        agent: agent.clone(),
    };
    let app = status::router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("mailkeep listening on {}", addr);

    let shutdown_worker = Arc::clone(&worker);
    let shutdown_pool = Arc::clone(&pool);
    let shutdown_agent = agent.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            if let Some(agent) = shutdown_agent {
                agent.stop().await;
            }
            shutdown_worker.stop().await;
            shutdown_pool.close_all().await;
        })
        .await?;

    Ok(())
}
