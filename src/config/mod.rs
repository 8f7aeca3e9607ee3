use anyhow::Result;
use dotenvy::dotenv;
use secrecy::Secret;
use serde::Deserialize;
use std::env;

#[derive(Deserialize, Clone, Debug)]
pub struct ReturnsConfig {
    pub service_name: String,
    pub log_level: String,
    pub database: DatabaseConfig,
    pub processor: ProcessorConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// External card processor credentials and endpoint.
#[derive(Deserialize, Clone, Debug)]
pub struct ProcessorConfig {
    pub base_url: String,
    pub key_id: String,
    pub key_secret: Secret<String>,
}

impl ReturnsConfig {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let db_url = env::var("RETURNS_DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("RETURNS_DATABASE_URL must be set"))?;
        let max_connections = env::var("RETURNS_DB_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()?;
        let min_connections = env::var("RETURNS_DB_MIN_CONNECTIONS")
            .unwrap_or_else(|_| "1".to_string())
            .parse()?;

        let processor_base_url = env::var("RETURNS_PROCESSOR_BASE_URL")
            .unwrap_or_else(|_| "https://api.processor.example".to_string());
        let processor_key_id = env::var("RETURNS_PROCESSOR_KEY_ID").unwrap_or_default();
        let processor_key_secret = env::var("RETURNS_PROCESSOR_KEY_SECRET").unwrap_or_default();

        Ok(Self {
            service_name: "returns-service".to_string(),
            log_level: env::var("RETURNS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            database: DatabaseConfig {
                url: Secret::new(db_url),
                max_connections,
                min_connections,
            },
            processor: ProcessorConfig {
                base_url: processor_base_url,
                key_id: processor_key_id,
                key_secret: Secret::new(processor_key_secret),
            },
        })
    }
}
