//! Host configuration from the environment.

use std::time::Duration;

use sgl_protocol::layout::{
    DEFAULT_MAX_TRANSFER_BYTES, DEFAULT_SEGMENT_BYTES, MIN_SEGMENT_BYTES, SHARED_MEMORY_NAME,
};
use sgl_protocol::{ApiVersion, SpinPolicy};
use thiserror::Error;

use crate::dispatcher::DispatcherConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostConfig {
    pub shm_name: String,
    pub segment_size: usize,
    /// Highest version the host offers; also the default for clients that do
    /// not ask for one.
    pub version: ApiVersion,
    pub stale_lock_timeout: Duration,
    /// Largest upload a client may declare, in bytes.
    pub max_transfer: usize,
    /// Idle polling policy of the dispatcher loop. Never times out.
    pub poll: SpinPolicy,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            shm_name: SHARED_MEMORY_NAME.to_string(),
            segment_size: DEFAULT_SEGMENT_BYTES,
            version: ApiVersion::DEFAULT,
            stale_lock_timeout: DispatcherConfig::default().stale_lock_timeout,
            max_transfer: DEFAULT_MAX_TRANSFER_BYTES,
            poll: SpinPolicy::default().with_timeout(None),
        }
    }
}

impl HostConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Like [`HostConfig::from_env`], reading variables through `lookup`.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(name) = lookup("SGL_SHM_NAME") {
            let name = name.trim();
            if name.is_empty() {
                return Err(ConfigError::InvalidEnv("SGL_SHM_NAME"));
            }
            config.shm_name = name.to_string();
        }
        if let Some(size) = parse::<usize>(&lookup, "SGL_SHM_SIZE")? {
            if size < MIN_SEGMENT_BYTES {
                return Err(ConfigError::InvalidEnv("SGL_SHM_SIZE"));
            }
            config.segment_size = size;
        }
        if let Some(version) = parse::<ApiVersion>(&lookup, "SGL_GL_VERSION")? {
            config.version = version;
        }
        if let Some(ms) = parse::<u64>(&lookup, "SGL_STALE_LOCK_MS")? {
            config.stale_lock_timeout = Duration::from_millis(ms);
        }
        if let Some(bytes) = parse::<usize>(&lookup, "SGL_MAX_TRANSFER")? {
            config.max_transfer = bytes;
        }
        if let Some(spins) = parse::<u32>(&lookup, "SGL_POLL_SPINS")? {
            config.poll.spins = spins;
        }
        if let Some(us) = parse::<u64>(&lookup, "SGL_POLL_MAX_SLEEP_US")? {
            config.poll.max_sleep = Duration::from_micros(us);
        }

        Ok(config)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            default_version: self.version,
            max_version: self.version,
            stale_lock_timeout: self.stale_lock_timeout,
            max_transfer: self.max_transfer,
            ..DispatcherConfig::default()
        }
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(key)
        .map(|raw| raw.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnv(key)))
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = HostConfig::from_vars(vars(&[])).unwrap();
        assert_eq!(config, HostConfig::default());
        assert_eq!(config.shm_name, "sharedgl_shared_memory");
        assert_eq!(config.version, ApiVersion::new(4, 6));
        assert_eq!(config.poll.timeout, None);
    }

    #[test]
    fn variables_override_defaults() {
        let config = HostConfig::from_vars(vars(&[
            ("SGL_SHM_NAME", "sgl-test"),
            ("SGL_SHM_SIZE", "1048576"),
            ("SGL_GL_VERSION", "3.3"),
            ("SGL_STALE_LOCK_MS", "250"),
            ("SGL_POLL_SPINS", "0"),
            ("SGL_MAX_TRANSFER", "4096"),
            ("SGL_POLL_MAX_SLEEP_US", "50"),
        ]))
        .unwrap();
        assert_eq!(config.shm_name, "sgl-test");
        assert_eq!(config.segment_size, 1 << 20);
        assert_eq!(config.version, ApiVersion::new(3, 3));
        assert_eq!(config.stale_lock_timeout, Duration::from_millis(250));
        assert_eq!(config.poll.spins, 0);
        assert_eq!(config.poll.max_sleep, Duration::from_micros(50));

        let dispatcher = config.dispatcher_config();
        assert_eq!(dispatcher.max_version, ApiVersion::new(3, 3));
        assert_eq!(dispatcher.stale_lock_timeout, Duration::from_millis(250));
        assert_eq!(dispatcher.max_transfer, 4096);
    }

    #[test]
    fn invalid_values_name_the_variable() {
        for (key, value) in [
            ("SGL_SHM_SIZE", "lots"),
            ("SGL_SHM_SIZE", "4096"),
            ("SGL_GL_VERSION", "four"),
            ("SGL_STALE_LOCK_MS", "-1"),
            ("SGL_MAX_TRANSFER", "all of it"),
            ("SGL_SHM_NAME", "  "),
        ] {
            assert_eq!(
                HostConfig::from_vars(vars(&[(key, value)])),
                Err(ConfigError::InvalidEnv(key)),
                "{key}={value}"
            );
        }
    }
}
