use anyhow::Result;
use dotenvy::dotenv;
use secrecy::Secret;
use serde::Deserialize;
use service_core::config::Config as CoreConfig;
use std::env;

#[derive(Deserialize, Clone, Debug)]
pub struct MeteringConfig {
    pub common: CoreConfig,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub webhook: WebhookConfig,
    pub worker: WorkerAuthConfig,
    pub sweeper: SweeperConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Processor webhook verification settings.
#[derive(Deserialize, Clone, Debug)]
pub struct WebhookConfig {
    pub signing_secret: Secret<String>,
    /// Maximum age of a signed timestamp before the request is refused.
    pub tolerance_secs: i64,
}

/// Shared secret for privileged internal callers (the job workers).
#[derive(Deserialize, Clone, Debug)]
pub struct WorkerAuthConfig {
    pub api_key: Secret<String>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct SweeperConfig {
    pub interval_secs: u64,
}

impl MeteringConfig {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let mut common = CoreConfig::load().map_err(|e| anyhow::anyhow!("{}", e))?;
        if let Ok(port) = env::var("METERING_PORT") {
            common.port = port.parse()?;
        }

        let db_url = env::var("METERING_DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("METERING_DATABASE_URL must be set"))?;
        let max_connections = env::var("METERING_DB_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()?;
        let min_connections = env::var("METERING_DB_MIN_CONNECTIONS")
            .unwrap_or_else(|_| "1".to_string())
            .parse()?;

        let signing_secret = env::var("METERING_WEBHOOK_SECRET")
            .map_err(|_| anyhow::anyhow!("METERING_WEBHOOK_SECRET must be set"))?;
        let tolerance_secs = env::var("METERING_WEBHOOK_TOLERANCE_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()?;

        let worker_api_key = env::var("METERING_WORKER_API_KEY")
            .map_err(|_| anyhow::anyhow!("METERING_WORKER_API_KEY must be set"))?;

        let sweep_interval_secs = env::var("METERING_SWEEP_INTERVAL_SECS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse()?;

        let log_level = env::var("METERING_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let otlp_endpoint = env::var("METERING_OTLP_ENDPOINT").ok();

        Ok(Self {
            common,
            service_name: "metering-service".to_string(),
            log_level,
            otlp_endpoint,
            database: DatabaseConfig {
                url: Secret::new(db_url),
                max_connections,
                min_connections,
            },
            webhook: WebhookConfig {
                signing_secret: Secret::new(signing_secret),
                tolerance_secs,
            },
            worker: WorkerAuthConfig {
                api_key: Secret::new(worker_api_key),
            },
            sweeper: SweeperConfig {
                interval_secs: sweep_interval_secs,
            },
        })
    }
}
