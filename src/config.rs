use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server settings, read once from `INNKEEP_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub admin_password: String,
    pub app_password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// `None` turns the scheduled calendar sync off.
    pub sync_interval: Option<Duration>,
    pub feed_timeout: Duration,
    pub sync_concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            admin_password: "innkeep-admin".into(),
            app_password: "innkeep".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            sync_interval: Some(Duration::from_secs(3600)),
            feed_timeout: Duration::from_secs(20),
            sync_concurrency: 8,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    TlsPair,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { var, value, reason } => {
                write!(f, "{var}={value:?} is invalid: {reason}")
            }
            ConfigError::TlsPair => {
                write!(f, "both INNKEEP_TLS_CERT and INNKEEP_TLS_KEY must be set, or neither")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, var: &str) -> Option<String> {
        (self.lookup)(var).filter(|v| !v.trim().is_empty())
    }

    fn parsed<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.string(var) {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigError::Invalid {
                    var,
                    reason: e.to_string(),
                    value,
                }),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset or blank variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup };
        let defaults = Config::default();

        let tls_cert = env.string("INNKEEP_TLS_CERT");
        let tls_key = env.string("INNKEEP_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::TlsPair);
        }

        let sync_interval = match env.parsed::<u64>("INNKEEP_SYNC_INTERVAL_SECS")? {
            None => defaults.sync_interval,
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
        };
        let sync_concurrency = env
            .parsed::<usize>("INNKEEP_SYNC_CONCURRENCY")?
            .unwrap_or(defaults.sync_concurrency);
        if sync_concurrency == 0 {
            return Err(ConfigError::Invalid {
                var: "INNKEEP_SYNC_CONCURRENCY",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        Ok(Self {
            bind: env.string("INNKEEP_BIND").unwrap_or(defaults.bind),
            port: env.parsed("INNKEEP_PORT")?.unwrap_or(defaults.port),
            data_dir: env
                .string("INNKEEP_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            admin_password: env
                .string("INNKEEP_ADMIN_PASSWORD")
                .unwrap_or(defaults.admin_password),
            app_password: env
                .string("INNKEEP_APP_PASSWORD")
                .unwrap_or(defaults.app_password),
            max_connections: env
                .parsed("INNKEEP_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections),
            compact_threshold: env
                .parsed("INNKEEP_COMPACT_THRESHOLD")?
                .unwrap_or(defaults.compact_threshold),
            metrics_port: env.parsed("INNKEEP_METRICS_PORT")?,
            tls_cert,
            tls_key,
            sync_interval,
            feed_timeout: env
                .parsed::<u64>("INNKEEP_FEED_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.feed_timeout),
            sync_concurrency,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("innkeep.wal")
    }
}
