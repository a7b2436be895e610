// Broker configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The backlog store and DB pool read their own env vars;
// this module covers the core server settings.

use std::net::SocketAddr;

/// Core broker configuration.
///
/// Constructed via [`BrokerConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Shared HS256 secret for notification and service tokens.
    pub jwt_secret: String,
    /// PostgreSQL connection string for the notification backlog.
    pub database_url: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `beacon_broker=debug`).
    pub log_filter: String,
}

impl BrokerConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `BEACON_BROKER_HOST` | `0.0.0.0` |
    /// | `BEACON_BROKER_PORT` | `8080` |
    /// | `BEACON_BROKER_JWT_SECRET` | dev-only placeholder |
    /// | `BEACON_BROKER_DATABASE_URL` | *(none; in-memory backlog)* |
    /// | `BEACON_BROKER_CORS_ORIGINS` | *(none; cors.rs uses dev defaults)* |
    /// | `BEACON_BROKER_LOG_FILTER` | `info` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("BEACON_BROKER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("BEACON_BROKER_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("BEACON_BROKER_JWT_SECRET")
            .unwrap_or_else(|_| "beacon_local_development_jwt_secret_must_be_32_chars".into());

        let database_url = env("BEACON_BROKER_DATABASE_URL").ok();
        let cors_origins = env("BEACON_BROKER_CORS_ORIGINS").ok();

        let log_filter = env("BEACON_BROKER_LOG_FILTER").unwrap_or_else(|_| "info".into());

        Self { listen_addr, jwt_secret, database_url, cors_origins, log_filter }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == "beacon_local_development_jwt_secret_must_be_32_chars"
    }
}
