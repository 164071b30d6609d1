use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read from `EQUIPLOAN_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    /// Shared connection password.
    pub password: String,
    /// Login name of the administrative service account.
    pub service_user: String,
    pub max_connections: usize,
    /// WAL appends tolerated before the compactor rewrites a tenant's log.
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "equiploan".into(),
            service_user: "equiploan".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset or unparsable numbers keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        fn number<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|v| v.trim().parse().ok())
        }

        Self {
            port: number(&lookup, "EQUIPLOAN_PORT").unwrap_or(defaults.port),
            bind: lookup("EQUIPLOAN_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("EQUIPLOAN_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("EQUIPLOAN_PASSWORD").unwrap_or(defaults.password),
            service_user: lookup("EQUIPLOAN_SERVICE_USER")
                .filter(|u| !u.is_empty())
                .unwrap_or(defaults.service_user),
            max_connections: number(&lookup, "EQUIPLOAN_MAX_CONNECTIONS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_connections),
            compact_threshold: number(&lookup, "EQUIPLOAN_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            tls_cert: lookup("EQUIPLOAN_TLS_CERT"),
            tls_key: lookup("EQUIPLOAN_TLS_KEY"),
            metrics_port: number(&lookup, "EQUIPLOAN_METRICS_PORT"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
