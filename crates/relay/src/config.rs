// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The database pool reads its own sizing variables in
// `db::pool`.

use std::net::SocketAddr;
use std::time::Duration;

use crate::hub::HubConfig;

const DEV_JWT_SECRET: &str = "labsync_local_development_jwt_secret_must_be_32_chars";

/// Log output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// JWT secret used to validate bearer tokens.
    pub jwt_secret: String,
    /// Base URL handed to clients for WebSocket connections.
    pub ws_base_url: String,
    /// PostgreSQL connection string. Without one the relay runs on the
    /// in-memory store.
    pub database_url: Option<String>,
    /// Shared secret for `POST /v1/capture`. The endpoint is disabled when unset.
    pub ingest_token: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `labsync_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Outbound buffer per session, in events.
    pub session_buffer: usize,
    /// Retained events per lab before the backlog compacts.
    pub backlog_capacity: usize,
    pub backlog_fetch_timeout: Duration,
    /// Raw mutation keys remembered for duplicate suppression.
    pub dedupe_window: usize,
    /// How long deleted labs keep rejecting late mutations.
    pub tombstone_retention: Duration,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `LABSYNC_RELAY_HOST` | `0.0.0.0` |
    /// | `LABSYNC_RELAY_PORT` | `8080` |
    /// | `LABSYNC_RELAY_JWT_SECRET` | dev-only placeholder |
    /// | `LABSYNC_RELAY_WS_BASE_URL` | `ws://{host}:{port}` |
    /// | `LABSYNC_RELAY_DATABASE_URL` | *(none)* |
    /// | `LABSYNC_RELAY_INGEST_TOKEN` | *(none)* |
    /// | `LABSYNC_RELAY_CORS_ORIGINS` | *(none; cors.rs uses dev defaults)* |
    /// | `LABSYNC_RELAY_LOG_FILTER` | `info` |
    /// | `LABSYNC_RELAY_LOG_FORMAT` | `text` |
    /// | `LABSYNC_RELAY_HEARTBEAT_INTERVAL_MS` | `10000` |
    /// | `LABSYNC_RELAY_HEARTBEAT_TIMEOUT_MS` | `30000` |
    /// | `LABSYNC_RELAY_SESSION_BUFFER` | `256` |
    /// | `LABSYNC_RELAY_BACKLOG_CAPACITY` | `4096` |
    /// | `LABSYNC_RELAY_BACKLOG_FETCH_TIMEOUT_MS` | `5000` |
    /// | `LABSYNC_RELAY_DEDUPE_WINDOW` | `65536` |
    /// | `LABSYNC_RELAY_TOMBSTONE_RETENTION_SECS` | `86400` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let number = |key: &str, default: u64| -> u64 {
            env(key).ok().and_then(|v| v.trim().parse().ok()).filter(|v| *v > 0).unwrap_or(default)
        };

        let host = env("LABSYNC_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 =
            env("LABSYNC_RELAY_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret =
            env("LABSYNC_RELAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());

        let ws_base_url =
            env("LABSYNC_RELAY_WS_BASE_URL").unwrap_or_else(|_| format!("ws://{listen_addr}"));

        let database_url = env("LABSYNC_RELAY_DATABASE_URL").ok();
        let ingest_token =
            env("LABSYNC_RELAY_INGEST_TOKEN").ok().filter(|token| !token.trim().is_empty());
        let cors_origins = env("LABSYNC_RELAY_CORS_ORIGINS").ok();

        let log_filter = env("LABSYNC_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("LABSYNC_RELAY_LOG_FORMAT").as_deref().map(str::trim) {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Self {
            listen_addr,
            jwt_secret,
            ws_base_url,
            database_url,
            ingest_token,
            cors_origins,
            log_filter,
            log_format,
            heartbeat_interval: Duration::from_millis(number(
                "LABSYNC_RELAY_HEARTBEAT_INTERVAL_MS",
                10_000,
            )),
            heartbeat_timeout: Duration::from_millis(number(
                "LABSYNC_RELAY_HEARTBEAT_TIMEOUT_MS",
                30_000,
            )),
            session_buffer: number("LABSYNC_RELAY_SESSION_BUFFER", 256) as usize,
            backlog_capacity: number("LABSYNC_RELAY_BACKLOG_CAPACITY", 4_096) as usize,
            backlog_fetch_timeout: Duration::from_millis(number(
                "LABSYNC_RELAY_BACKLOG_FETCH_TIMEOUT_MS",
                5_000,
            )),
            dedupe_window: number("LABSYNC_RELAY_DEDUPE_WINDOW", 65_536) as usize,
            tombstone_retention: Duration::from_secs(number(
                "LABSYNC_RELAY_TOMBSTONE_RETENTION_SECS",
                86_400,
            )),
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }

    /// Tunables for the in-process hub.
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            session_buffer: self.session_buffer,
            backlog_capacity: self.backlog_capacity,
            backlog_fetch_timeout: self.backlog_fetch_timeout,
            heartbeat_timeout: self.heartbeat_timeout,
            dedupe_window: self.dedupe_window,
            tombstone_retention: self.tombstone_retention,
        }
    }
}
