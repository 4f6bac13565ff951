//! Configuration module
//!
//! Settings for the maintenance CLI: database connection, logging output and the
//! transcoding presets used when (re)creating subformats.

use std::env;
use std::str::FromStr;

use crate::constants::DEFAULT_TRANSCODE_QUALITIES;
use crate::models::Quality;

const MAX_CONNECTIONS: u32 = 5;
const CONNECTION_TIMEOUT_SECS: u64 = 30;

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(anyhow::anyhow!("Invalid log format: {}", s)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    pub environment: String,
    pub log_format: LogFormat,
    pub run_migrations: bool,
    /// Presets offered by the subformat commands, lowest first.
    pub transcode_qualities: Vec<Quality>,
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let environment = env::var("ENVIRONMENT")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string());

        let config = Config {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?,
            db_max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| MAX_CONNECTIONS.to_string())
                .parse()
                .unwrap_or(MAX_CONNECTIONS),
            db_timeout_seconds: env::var("DB_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| CONNECTION_TIMEOUT_SECS.to_string())
                .parse()
                .unwrap_or(CONNECTION_TIMEOUT_SECS),
            environment,
            log_format: env::var("LOG_FORMAT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            run_migrations: env::var("RUN_MIGRATIONS")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            transcode_qualities: parse_qualities(
                &env::var("TRANSCODE_QUALITIES")
                    .unwrap_or_else(|_| DEFAULT_TRANSCODE_QUALITIES.to_string()),
            )
            .map_err(|e| anyhow::anyhow!("TRANSCODE_QUALITIES is invalid: {}", e))?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        let env = self.environment.to_lowercase();
        env == "production" || env == "prod"
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !(self.database_url.starts_with("postgres://")
            || self.database_url.starts_with("postgresql://"))
        {
            return Err(anyhow::anyhow!(
                "DATABASE_URL must be a valid PostgreSQL connection string"
            ));
        }

        if self.db_max_connections == 0 {
            return Err(anyhow::anyhow!("DB_MAX_CONNECTIONS must be at least 1"));
        }

        if self.transcode_qualities.is_empty() {
            return Err(anyhow::anyhow!(
                "TRANSCODE_QUALITIES must list at least one preset"
            ));
        }

        Ok(())
    }

    /// Look up a configured preset by name.
    pub fn quality(&self, name: &str) -> Option<&Quality> {
        self.transcode_qualities.iter().find(|q| q.name == name)
    }
}

/// Parse a comma separated preset list (`"360p,720p"`), sorted by height with
/// duplicates removed.
pub fn parse_qualities(raw: &str) -> Result<Vec<Quality>, anyhow::Error> {
    let mut qualities = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Quality::from_str)
        .collect::<Result<Vec<_>, _>>()?;
    qualities.sort();
    qualities.dedup();
    Ok(qualities)
}
