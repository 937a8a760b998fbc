//! Layered configuration: compiled-in defaults, optionally overridden by a TOML file named in
//! `FETCH_CORE_CONFIG`, in turn overridden by `FETCH_CORE_*` environment variables. Mirrors the
//! defaults-then-env-override idiom used across the rest of the retrieved pack's service crates.

use std::env;
use std::time::Duration;

use serde::Deserialize;

/// Externalised knobs for the IPFS device, HTTPS handler, and SFTP handler.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchCoreConfig {
    pub listen_addr: String,
    pub kad_random_walk_interval: Duration,
    pub kad_query_concurrency: u16,
    pub dht_retry_deadline: Duration,
    /// `None` means unbounded retries.
    pub dht_max_retries: Option<u32>,
    pub https_port: u16,
    pub sftp_port: u16,
    pub connect_timeout: Duration,
}

impl Default for FetchCoreConfig {
    fn default() -> Self {
        FetchCoreConfig {
            listen_addr: "/ip4/127.0.0.1/tcp/40000".to_owned(),
            kad_random_walk_interval: Duration::from_secs(300),
            kad_query_concurrency: 20,
            dht_retry_deadline: Duration::from_secs(10),
            dht_max_retries: None,
            https_port: 443,
            sftp_port: 22,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Deserialisable mirror of [`FetchCoreConfig`] for the TOML file layer; every field optional so a
/// file only needs to name the knobs it overrides.
#[derive(Debug, Default, Deserialize)]
struct FileOverrides {
    listen_addr: Option<String>,
    kad_random_walk_interval_secs: Option<u64>,
    kad_query_concurrency: Option<u16>,
    dht_retry_deadline_secs: Option<u64>,
    dht_max_retries: Option<u32>,
    https_port: Option<u16>,
    sftp_port: Option<u16>,
    connect_timeout_secs: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("environment variable {name} has an invalid value {value:?}: {reason}")]
    InvalidEnv {
        name: &'static str,
        value: String,
        reason: String,
    },
}

impl FetchCoreConfig {
    /// Loads defaults, applies a TOML file named by `FETCH_CORE_CONFIG` if present, then applies
    /// `FETCH_CORE_*` environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = env::var("FETCH_CORE_CONFIG") {
            let contents =
                std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
            let overrides: FileOverrides =
                toml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })?;
            config.apply_file_overrides(overrides);
        }

        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_file_overrides(&mut self, overrides: FileOverrides) {
        if let Some(v) = overrides.listen_addr {
            self.listen_addr = v;
        }
        if let Some(v) = overrides.kad_random_walk_interval_secs {
            self.kad_random_walk_interval = Duration::from_secs(v);
        }
        if let Some(v) = overrides.kad_query_concurrency {
            self.kad_query_concurrency = v;
        }
        if let Some(v) = overrides.dht_retry_deadline_secs {
            self.dht_retry_deadline = Duration::from_secs(v);
        }
        if let Some(v) = overrides.dht_max_retries {
            self.dht_max_retries = Some(v);
        }
        if let Some(v) = overrides.https_port {
            self.https_port = v;
        }
        if let Some(v) = overrides.sftp_port {
            self.sftp_port = v;
        }
        if let Some(v) = overrides.connect_timeout_secs {
            self.connect_timeout = Duration::from_secs(v);
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = parse_env::<String>("FETCH_CORE_LISTEN_ADDR")? {
            self.listen_addr = v;
        }
        if let Some(v) = parse_env::<u16>("FETCH_CORE_HTTPS_PORT")? {
            self.https_port = v;
        }
        if let Some(v) = parse_env::<u16>("FETCH_CORE_SFTP_PORT")? {
            self.sftp_port = v;
        }
        if let Some(v) = parse_env::<u64>("FETCH_CORE_CONNECT_TIMEOUT_SECS")? {
            self.connect_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_env::<u32>("FETCH_CORE_DHT_MAX_RETRIES")? {
            self.dht_max_retries = Some(v);
        }
        Ok(())
    }
}

fn parse_env<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidEnv {
                name,
                value,
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // environment variables are process-global; serialise tests that touch them
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_match_documented_values() {
        let config = FetchCoreConfig::default();
        assert_eq!(config.listen_addr, "/ip4/127.0.0.1/tcp/40000");
        assert_eq!(config.kad_random_walk_interval, Duration::from_secs(300));
        assert_eq!(config.kad_query_concurrency, 20);
        assert_eq!(config.dht_retry_deadline, Duration::from_secs(10));
        assert_eq!(config.dht_max_retries, None);
        assert_eq!(config.https_port, 443);
        assert_eq!(config.sftp_port, 22);
    }

    #[test]
    fn env_override_wins_over_default() {
        let _lock = ENV_LOCK.lock().unwrap();
        env::set_var("FETCH_CORE_HTTPS_PORT", "8443");
        env::remove_var("FETCH_CORE_CONFIG");
        let config = FetchCoreConfig::load().unwrap();
        assert_eq!(config.https_port, 8443);
        env::remove_var("FETCH_CORE_HTTPS_PORT");
    }

    #[test]
    fn file_override_applies_then_env_overrides_file() {
        let _lock = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fetch-core.toml");
        std::fs::write(&path, "https_port = 9000\nsftp_port = 2222\n").unwrap();

        env::set_var("FETCH_CORE_CONFIG", path.to_str().unwrap());
        env::set_var("FETCH_CORE_HTTPS_PORT", "9443");

        let config = FetchCoreConfig::load().unwrap();
        assert_eq!(config.sftp_port, 2222, "file override applied");
        assert_eq!(config.https_port, 9443, "env wins over file");

        env::remove_var("FETCH_CORE_CONFIG");
        env::remove_var("FETCH_CORE_HTTPS_PORT");
    }
}
