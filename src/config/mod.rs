use serde::Deserialize;
use std::time::Duration;
use std::{fs, path::Path, path::PathBuf};

use crate::core::error::ProducerError;
use crate::util::backoff::{Backoff, Growth};

pub const DEFAULT_SEGMENT_SIZE: u64 = 512 * 1024 * 1024;

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    /// Parent directory; each destination gets its own sub-directory.
    pub directory: PathBuf,
    pub segment_size_bytes: u64,
    /// fsync the active segment every N appends. `None` leaves it to the OS.
    pub fsync_every_n: Option<usize>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./filequeue"),
            segment_size_bytes: DEFAULT_SEGMENT_SIZE,
            fsync_every_n: Some(64),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BackoffConfig {
    /// max delay = `max_factor` × remote call timeout.
    pub max_factor: u32,
    pub growth: Growth,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_factor: 10,
            growth: Growth::Exponential,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ProducerConfig {
    pub queue: QueueConfig,
    /// Keep packets a previous run left on disk (`true`) or purge them.
    pub continue_send: bool,
    pub thread_pool_size: usize,
    /// Delivery attempts per packet before it is dropped.
    pub retry_times: u32,
    pub remote_timeout_ms: u64,
    pub backoff: BackoffConfig,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            continue_send: false,
            thread_pool_size: 5,
            retry_times: 5,
            remote_timeout_ms: 5000,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ProducerConfig {
    pub fn validate(&self) -> Result<(), ProducerError> {
        let invalid = |msg: &str| Err(ProducerError::InvalidConfig(msg.to_string()));
        if self.thread_pool_size == 0 {
            return invalid("thread_pool_size must be at least 1");
        }
        if self.retry_times == 0 {
            return invalid("retry_times must be at least 1");
        }
        if self.remote_timeout_ms == 0 {
            return invalid("remote_timeout_ms must be greater than 0");
        }
        if self.queue.segment_size_bytes == 0 {
            return invalid("queue.segment_size_bytes must be greater than 0");
        }
        Ok(())
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    /// Fresh per-worker backoff paced by the remote call timeout.
    pub fn backoff(&self) -> Backoff {
        Backoff::from_timeout(
            self.remote_timeout(),
            self.backoff.max_factor,
            self.backoff.growth,
        )
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryConfig {
    /// `;`-separated topic list, e.g. `"orders;payments"`.
    pub topics: String,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub producer: ProducerConfig,
    pub registry: RegistryConfig,
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, anyhow::Error> {
    let raw: String = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&raw)?;
    config.producer.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.producer.queue.segment_size_bytes, 512 * 1024 * 1024);
        assert_eq!(cfg.producer.thread_pool_size, 5);
        assert_eq!(cfg.producer.retry_times, 5);
        assert!(!cfg.producer.continue_send);
        assert_eq!(cfg.producer.backoff.max_factor, 10);
        assert!(cfg.registry.topics.is_empty());
    }

    #[test]
    fn backoff_is_derived_from_remote_timeout() {
        let cfg = ProducerConfig {
            remote_timeout_ms: 250,
            ..ProducerConfig::default()
        };
        let backoff = cfg.backoff();
        assert_eq!(backoff.base(), Duration::from_millis(250));
        assert_eq!(backoff.max(), Duration::from_millis(2500));
    }

    #[test]
    fn validation_rejects_zero_values() {
        for cfg in [
            ProducerConfig { thread_pool_size: 0, ..Default::default() },
            ProducerConfig { retry_times: 0, ..Default::default() },
            ProducerConfig { remote_timeout_ms: 0, ..Default::default() },
        ] {
            assert!(matches!(cfg.validate(), Err(ProducerError::InvalidConfig(_))));
        }
        assert!(ProducerConfig::default().validate().is_ok());
    }
}
