use std::time::Duration;

use sgl_protocol::layout::SHARED_MEMORY_NAME;
use sgl_protocol::{ApiVersion, SpinPolicy};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    pub shm_name: String,
    /// Version to request; `None` takes the host default.
    pub version: Option<ApiVersion>,
    /// Per-wait polling policy. Its timeout bounds every lock acquisition and
    /// every cycle.
    pub poll: SpinPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            shm_name: SHARED_MEMORY_NAME.to_string(),
            version: None,
            poll: SpinPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// `SGL_TIMEOUT_MS=0` waits forever.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(name) = lookup("SGL_SHM_NAME") {
            let name = name.trim();
            if name.is_empty() {
                return Err(ConfigError::InvalidEnv("SGL_SHM_NAME"));
            }
            config.shm_name = name.to_string();
        }
        if let Some(raw) = lookup("SGL_GL_VERSION") {
            let version = raw
                .trim()
                .parse::<ApiVersion>()
                .map_err(|_| ConfigError::InvalidEnv("SGL_GL_VERSION"))?;
            config.version = Some(version);
        }
        if let Some(raw) = lookup("SGL_TIMEOUT_MS") {
            let ms = raw
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidEnv("SGL_TIMEOUT_MS"))?;
            config.poll.timeout = (ms != 0).then(|| Duration::from_millis(ms));
        }
        Ok(config)
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.poll.timeout = timeout;
        self
    }
}
