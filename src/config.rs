//! Process configuration, read once from `SLOTBOOK_*` environment variables.
//! Unset or unparsable values fall back to the defaults.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::EngineConfig;

pub const WAL_FILE_NAME: &str = "slotbook.wal";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub default_capacity: u32,
    pub lock_timeout: Duration,
    pub request_timeout: Duration,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub seed_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "slotbook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            default_capacity: 1,
            lock_timeout: Duration::from_millis(5000),
            request_timeout: Duration::from_millis(10_000),
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            seed_file: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. `lookup` gets the full
    /// variable name, e.g. `SLOTBOOK_PORT`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(&format!("SLOTBOOK_{name}"));
        fn parse<T: FromStr>(raw: Option<String>) -> Option<T> {
            raw.and_then(|s| s.trim().parse().ok())
        }
        let defaults = Self::default();

        let default_capacity = match parse(var("DEFAULT_CAPACITY")) {
            Some(0) => {
                tracing::warn!("SLOTBOOK_DEFAULT_CAPACITY=0 ignored, using {}", defaults.default_capacity);
                defaults.default_capacity
            }
            Some(n) => n,
            None => defaults.default_capacity,
        };

        Self {
            bind: var("BIND").unwrap_or(defaults.bind),
            port: parse(var("PORT")).unwrap_or(defaults.port),
            data_dir: var("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: var("PASSWORD").unwrap_or(defaults.password),
            max_connections: parse(var("MAX_CONNECTIONS")).unwrap_or(defaults.max_connections),
            compact_threshold: parse(var("COMPACT_THRESHOLD")).unwrap_or(defaults.compact_threshold),
            default_capacity,
            lock_timeout: parse(var("LOCK_TIMEOUT_MS"))
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            request_timeout: parse(var("REQUEST_TIMEOUT_MS"))
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),
            metrics_port: parse(var("METRICS_PORT")),
            tls_cert: var("TLS_CERT").map(PathBuf::from),
            tls_key: var("TLS_KEY").map(PathBuf::from),
            seed_file: var("SEED_FILE").map(PathBuf::from),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            default_capacity: self.default_capacity,
            lock_timeout: self.lock_timeout,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(WAL_FILE_NAME)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
