//! Process configuration read from the environment.

use std::time::Duration;

use chorus_core::RelayConfig;
use thiserror::Error;

/// Variable holding the backbone endpoint.
pub const BACKBONE_URL_VAR: &str = "UPSTASH_REDIS_REST_URL";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing UPSTASH_REDIS_REST_URL")]
    MissingBackboneUrl,

    #[error("Invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to; also the tag stamped on fanned-out messages
    pub port: u16,
    /// Browser origin allowed to open sockets (`*` for any)
    pub cors_origin: String,
    /// Backbone endpoint (`redis://` or `rediss://`)
    pub backbone_url: String,
    /// Deadline for shutdown reconciliation
    pub shutdown_grace: Duration,
    /// Outbound frames buffered per connection
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            cors_origin: "http://localhost:3000".to_string(),
            backbone_url: String::new(),
            shutdown_grace: Duration::from_millis(500),
            broadcast_capacity: 256,
        }
    }
}

impl ServerConfig {
    /// Load from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            log::debug!("No .env file loaded: {e}");
        }
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let backbone_url = lookup(BACKBONE_URL_VAR)
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::MissingBackboneUrl)?;

        Ok(Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse(&lookup, "PORT")?.unwrap_or(defaults.port),
            cors_origin: lookup("CORS_ORIGIN").unwrap_or(defaults.cors_origin),
            backbone_url,
            shutdown_grace: parse(&lookup, "SHUTDOWN_GRACE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_grace),
            broadcast_capacity: parse(&lookup, "BROADCAST_CAPACITY")?
                .filter(|&n: &usize| n > 0)
                .unwrap_or(defaults.broadcast_capacity),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The subset the relay core consumes.
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            origin_port: self.port,
            shutdown_grace: self.shutdown_grace,
        }
    }

    /// Whether a handshake `Origin` header is acceptable.
    pub fn allows_origin(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(_) if self.cors_origin == "*" => true,
            Some(origin) => origin == self.cors_origin,
        }
    }
}

fn parse<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}
