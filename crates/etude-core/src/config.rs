// src/config.rs
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{EtudeError, EtudeResult};

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interface to bind (default: 0.0.0.0)
    pub host: String,

    /// Listening port (default: 8080)
    pub port: u16,

    /// Reactor batch size per `epoll_wait` (default: 1024)
    pub max_events: usize,

    /// Lower bound of the worker pool (default: 2)
    pub worker_min: usize,

    /// Upper bound of the worker pool (default: number of CPUs)
    pub worker_max: usize,

    /// Worker pool supervisor tick in milliseconds (default: 500)
    pub worker_idle_interval_ms: u64,

    /// Connections the store pool keeps warm (default: 5)
    pub db_pool_min: usize,

    /// Hard cap on store connections (default: 50)
    pub db_pool_max: usize,

    /// Store pool health-check period in seconds (default: 30)
    pub db_check_interval_secs: u64,

    /// How long a handler waits for a store connection (default: 5000)
    pub acquire_timeout_ms: u64,

    /// Largest accepted request body (default: 10MB)
    pub body_limit_bytes: usize,

    /// Serve HTTPS instead of HTTP
    pub tls: bool,

    /// PEM certificate chain (default: server.crt)
    pub tls_cert_path: PathBuf,

    /// PEM private key (default: server.key)
    pub tls_key_path: PathBuf,

    /// Seconds between metrics log lines; 0 disables (default: 5)
    pub metrics_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let worker_min = 2;
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_events: 1024,
            worker_min,
            worker_max: num_cpus::get().max(worker_min),
            worker_idle_interval_ms: 500,
            db_pool_min: 5,
            db_pool_max: 50,
            db_check_interval_secs: 30,
            acquire_timeout_ms: 5000,
            body_limit_bytes: 10 * 1024 * 1024,
            tls: false,
            tls_cert_path: PathBuf::from("server.crt"),
            tls_key_path: PathBuf::from("server.key"),
            metrics_interval_secs: 5,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

impl Config {
    /// Load configuration from environment variables (with .env support).
    /// Unparsable values fall back to their defaults.
    pub fn from_env() -> Self {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();

        let d = Config::default();
        let worker_min = env_or("WORKER_MIN", d.worker_min);
        Config {
            host: std::env::var("SERVER_HOST").unwrap_or(d.host),
            port: env_or("SERVER_PORT", d.port),
            max_events: env_or("MAX_EVENTS", d.max_events),
            worker_min,
            worker_max: env_or("WORKER_MAX", d.worker_max.max(worker_min)),
            worker_idle_interval_ms: env_or("WORKER_IDLE_INTERVAL_MS", d.worker_idle_interval_ms),
            db_pool_min: env_or("DB_POOL_MIN", d.db_pool_min),
            db_pool_max: env_or("DB_POOL_MAX", d.db_pool_max),
            db_check_interval_secs: env_or("DB_CHECK_INTERVAL_SECS", d.db_check_interval_secs),
            acquire_timeout_ms: env_or("ACQUIRE_TIMEOUT_MS", d.acquire_timeout_ms),
            body_limit_bytes: env_or("BODY_LIMIT_BYTES", d.body_limit_bytes),
            tls: env_flag("TLS_ENABLED", d.tls),
            tls_cert_path: std::env::var("TLS_CERT_PATH").map(PathBuf::from).unwrap_or(d.tls_cert_path),
            tls_key_path: std::env::var("TLS_KEY_PATH").map(PathBuf::from).unwrap_or(d.tls_key_path),
            metrics_interval_secs: env_or("METRICS_INTERVAL_SECS", d.metrics_interval_secs),
        }
    }

    /// Rejects bounds that cannot describe a working server.
    pub fn validate(&self) -> EtudeResult<()> {
        if self.worker_min == 0 {
            return Err(EtudeError::Config("worker_min must be at least 1".into()));
        }
        if self.worker_min > self.worker_max {
            return Err(EtudeError::Config(format!(
                "worker_min ({}) exceeds worker_max ({})",
                self.worker_min, self.worker_max
            )));
        }
        if self.db_pool_max == 0 {
            return Err(EtudeError::Config("db_pool_max must be at least 1".into()));
        }
        if self.db_pool_min > self.db_pool_max {
            return Err(EtudeError::Config(format!(
                "db_pool_min ({}) exceeds db_pool_max ({})",
                self.db_pool_min, self.db_pool_max
            )));
        }
        if self.max_events == 0 {
            return Err(EtudeError::Config("max_events must be at least 1".into()));
        }
        Ok(())
    }

    /// Resolves `host:port` to a socket address.
    pub fn server_addr(&self) -> EtudeResult<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| EtudeError::Config(format!("cannot resolve {}:{}", self.host, self.port)))
    }

    pub fn worker_idle_interval(&self) -> Duration {
        Duration::from_millis(self.worker_idle_interval_ms)
    }

    pub fn db_check_interval(&self) -> Duration {
        Duration::from_secs(self.db_check_interval_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.port, 8080);
        assert_eq!(c.worker_min, 2);
        assert!(c.worker_max >= c.worker_min);
        assert_eq!(c.acquire_timeout(), Duration::from_millis(5000));
        assert_eq!(c.body_limit_bytes, 10_485_760);
        assert_eq!(c.tls_cert_path, PathBuf::from("server.crt"));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        let mut c = Config::default();
        c.worker_min = 0;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.worker_min = 8;
        c.worker_max = 4;
        assert!(matches!(c.validate(), Err(EtudeError::Config(_))));

        let mut c = Config::default();
        c.db_pool_min = 3;
        c.db_pool_max = 2;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.max_events = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let c: Config = serde_json::from_str(r#"{"port": 9000, "tls": true}"#).unwrap();
        assert_eq!(c.port, 9000);
        assert!(c.tls);
        assert_eq!(c.host, "0.0.0.0");
        assert_eq!(c.db_pool_max, 50);
    }

    #[test]
    fn test_server_addr() {
        let c = Config {
            host: "127.0.0.1".into(),
            port: 0,
            ..Config::default()
        };
        assert_eq!(c.server_addr().unwrap(), "127.0.0.1:0".parse().unwrap());
    }
}
