use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub pool: PoolConfigEnv,
    pub worker: WorkerConfigEnv,
    pub llm: LlmConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Tunables for the submission pool (spec §4.1 defaults).
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfigEnv {
    pub max_connections_per_account: u32,
    pub max_idle_seconds: u64,
    pub max_lifetime_seconds: u64,
    pub cleanup_interval_seconds: u64,
    pub noop_check_before_use: bool,
}

/// Tunables for the send worker (spec §4.2 constants; overridable for tests).
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfigEnv {
    pub max_retries: u32,
    pub base_delay_seconds: u64,
    pub max_delay_seconds: u64,
    pub drain_budget_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
    pub embedding_model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub enabled: bool,
    pub account_id: Option<String>,
    pub poll_interval_seconds: u64,
    pub escalation_email: Option<String>,
    pub send_from: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            server: ServerConfig {
                host: std::env::var("MAILKEEP_SERVER_HOST")
                    .unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: std::env::var("MAILKEEP_SERVER_PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()?,
            },
            database: DatabaseConfig {
                url: std::env::var("MAILKEEP_DATABASE_URL")?,
            },
            pool: PoolConfigEnv {
                max_connections_per_account: env_parse("MAILKEEP_POOL_MAX_CONNECTIONS", 2)?,
                max_idle_seconds: env_parse("MAILKEEP_POOL_MAX_IDLE_SECONDS", 270)?,
                max_lifetime_seconds: env_parse("MAILKEEP_POOL_MAX_LIFETIME_SECONDS", 3600)?,
                cleanup_interval_seconds: env_parse("MAILKEEP_POOL_CLEANUP_INTERVAL_SECONDS", 60)?,
                noop_check_before_use: env_parse("MAILKEEP_POOL_NOOP_CHECK", true)?,
            },
            worker: WorkerConfigEnv {
                max_retries: env_parse("MAILKEEP_WORKER_MAX_RETRIES", 3)?,
                base_delay_seconds: env_parse("MAILKEEP_WORKER_BASE_DELAY_SECONDS", 30)?,
                max_delay_seconds: env_parse("MAILKEEP_WORKER_MAX_DELAY_SECONDS", 600)?,
                drain_budget_seconds: env_parse("MAILKEEP_WORKER_DRAIN_BUDGET_SECONDS", 30)?,
            },
            llm: LlmConfig {
                api_key: std::env::var("MAILKEEP_LLM_API_KEY")?,
                model: std::env::var("MAILKEEP_LLM_MODEL")
                    .unwrap_or_else(|_| "anthropic/claude-sonnet-4-20250514".to_string()),
                embedding_model: std::env::var("MAILKEEP_EMBEDDING_MODEL")
                    .unwrap_or_else(|_| "openai/text-embedding-3-small".to_string()),
            },
            agent: AgentConfig {
                enabled: env_parse("MAILKEEP_AGENT_ENABLED", false)?,
                account_id: std::env::var("MAILKEEP_AGENT_ACCOUNT_ID").ok(),
                poll_interval_seconds: env_parse("MAILKEEP_AGENT_POLL_INTERVAL_SECS", 120)?,
                escalation_email: std::env::var("MAILKEEP_AGENT_ESCALATION_EMAIL").ok(),
                send_from: std::env::var("MAILKEEP_AGENT_SEND_FROM").ok(),
            },
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}")),
        Err(_) => Ok(default),
    }
}
