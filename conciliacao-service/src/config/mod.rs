//! Configuration module for conciliacao-service.

use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone)]
pub struct ConciliacaoConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub lytex: LytexConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// One credential pair ("integration slot") against the Lytex API.
#[derive(Debug, Clone)]
pub struct LytexCredentials {
    pub client_id: String,
    pub client_secret: Secret<String>,
}

#[derive(Debug, Clone)]
pub struct LytexConfig {
    pub base_url: String,
    pub primary: LytexCredentials,
    /// Second independent credential pair; absence is a supported
    /// configuration, never an error.
    pub secondary: Option<LytexCredentials>,
    pub request_timeout_secs: u64,
}

/// Reconciliation tuning knobs.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Bounds outstanding concurrent gateway requests per chunk.
    pub chunk_size: usize,
    /// Page size for the bulk-discovery invoice listing.
    pub page_limit: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: 20,
            page_limit: 50,
        }
    }
}

impl ConciliacaoConfig {
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        let common = core_config::Config::load()?;

        let primary = LytexCredentials {
            client_id: env::var("LYTEX_CLIENT_ID").map_err(|_| {
                AppError::ConfigError(anyhow::anyhow!("LYTEX_CLIENT_ID is required"))
            })?,
            client_secret: Secret::new(env::var("LYTEX_CLIENT_SECRET").map_err(|_| {
                AppError::ConfigError(anyhow::anyhow!("LYTEX_CLIENT_SECRET is required"))
            })?),
        };

        // The secondary integration is configured only when both halves
        // of the credential pair are present.
        let secondary = match (
            env::var("LYTEX_SECONDARY_CLIENT_ID").ok(),
            env::var("LYTEX_SECONDARY_CLIENT_SECRET").ok(),
        ) {
            (Some(client_id), Some(secret)) => Some(LytexCredentials {
                client_id,
                client_secret: Secret::new(secret),
            }),
            _ => None,
        };

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "conciliacao-service".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            lytex: LytexConfig {
                base_url: env::var("LYTEX_BASE_URL")
                    .unwrap_or_else(|_| "https://api.lytex.com.br/v2".to_string()),
                primary,
                secondary,
                request_timeout_secs: env::var("LYTEX_REQUEST_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            },
            sync: SyncConfig {
                chunk_size: env::var("SYNC_CHUNK_SIZE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(20),
                page_limit: env::var("SYNC_PAGE_LIMIT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(50),
            },
        })
    }
}
