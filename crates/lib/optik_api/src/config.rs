//! API server configuration.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use tracing::warn;

/// Where sessions, counters and credentials are kept.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StateBackend {
    /// PostgreSQL for everything; counters are shared across processes.
    #[default]
    Postgres,
    /// Process memory only. For development and tests.
    Memory,
}

impl FromStr for StateBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(StateBackend::Postgres),
            "memory" | "mem" => Ok(StateBackend::Memory),
            other => Err(format!("unknown state backend '{other}'")),
        }
    }
}

impl fmt::Display for StateBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StateBackend::Postgres => "postgres",
            StateBackend::Memory => "memory",
        })
    }
}

/// Configuration for the API server.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// Address to bind the HTTP listener (e.g. "127.0.0.1:3100").
    pub bind_addr: String,
    /// PostgreSQL connection URL.
    pub database_url: String,
    pub state_backend: StateBackend,
    /// Reverse proxies whose forwarding headers are believed. Requests from
    /// any other peer are identified by the peer address alone.
    pub trusted_proxies: Vec<IpAddr>,
}

impl ApiConfig {
    /// Reads configuration from environment variables with sensible defaults.
    ///
    /// | Variable        | Default                              |
    /// |-----------------|--------------------------------------|
    /// | `BIND_ADDR`     | `127.0.0.1:3100`                     |
    /// | `DATABASE_URL`  | `postgres://localhost:5432/optik`    |
    /// | `STATE_BACKEND` | `postgres`                           |
    /// | `TRUSTED_PROXIES` | empty (comma-separated IPs)        |
    pub fn from_env() -> Self {
        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:3100".into()),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost:5432/optik".into()),
            state_backend: std::env::var("STATE_BACKEND")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            trusted_proxies: std::env::var("TRUSTED_PROXIES")
                .map(|v| parse_proxies(&v))
                .unwrap_or_default(),
        }
    }
}

/// Parse a comma-separated list of proxy IPs, skipping invalid entries.
pub fn parse_proxies(value: &str) -> Vec<IpAddr> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                warn!(entry, "ignoring invalid trusted proxy");
                None
            }
        })
        .collect()
}
