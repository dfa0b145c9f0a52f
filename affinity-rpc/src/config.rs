//! Node configuration.
//!
//! Every section has defaults, so an empty JSON object is a valid config
//! file. Durations are expressed in milliseconds on disk.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ring::DEFAULT_REPLICAS;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub registry: RegistryConfig,
    pub resolver: ResolverConfig,
    pub dispatch: DispatchConfig,
    pub ring: RingConfig,
}

impl NodeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("reading {}: {err}", path.display())))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| Error::Config(format!("parsing config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.registry.validate()?;
        self.resolver.validate()?;
        self.dispatch.validate()?;
        self.ring.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Prefix of every registry key, `{namespace}/{name}/{id}`.
    pub namespace: String,
    /// Lease TTL. Registries grant whole seconds, so this must be >= 1000.
    pub ttl_ms: u64,
    /// Re-registration attempts after a lease is lost.
    pub max_retry: u32,
    /// Unit of the doubling retry backoff schedule.
    pub retry_backoff_ms: u64,
    /// Bound on each grant/put/keepalive step.
    pub register_timeout_ms: u64,
    /// Delay before a discovery watch whose stream ended is re-established.
    pub watch_retry_delay_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            namespace: "/servers/node".to_string(),
            ttl_ms: 15_000,
            max_retry: 5,
            retry_backoff_ms: 1_000,
            register_timeout_ms: 3_000,
            watch_retry_delay_ms: 1_000,
        }
    }
}

impl RegistryConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_millis(self.register_timeout_ms)
    }

    pub fn watch_retry_delay(&self) -> Duration {
        Duration::from_millis(self.watch_retry_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ttl_ms < 1_000 {
            return Err(Error::Config(format!(
                "registry ttl must be at least 1s, got {}ms",
                self.ttl_ms
            )));
        }
        if self.namespace.is_empty() || !self.namespace.starts_with('/') {
            return Err(Error::Config(format!(
                "registry namespace must start with '/', got '{}'",
                self.namespace
            )));
        }
        if self.namespace.len() > 1 && self.namespace.ends_with('/') {
            return Err(Error::Config("registry namespace must not end with '/'".into()));
        }
        if self.retry_backoff_ms == 0 || self.register_timeout_ms == 0 {
            return Err(Error::Config(
                "retry backoff and register timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Endpoint scheme the resolver keeps, e.g. `grpc` or `http`.
    pub scheme: String,
    pub setup_timeout_ms: u64,
    pub retry_delay_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            scheme: "grpc".to_string(),
            setup_timeout_ms: 10_000,
            retry_delay_ms: 1_000,
        }
    }
}

impl ResolverConfig {
    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheme.is_empty() || !self.scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::Config(format!(
                "resolver scheme must be alphanumeric, got '{}'",
                self.scheme
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Soft ceiling on total workers; crossing it only logs a warning.
    pub max_workers: usize,
    /// Idle watermark kept after shrinking, and the growth batch size.
    pub max_idle: usize,
    pub shrink_interval_ms: u64,
    /// Idle workers stopped per shrink tick at most.
    pub worker_recycle_batch: usize,
    /// Key table entries examined per shrink tick at most.
    pub union_recycle_batch: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_workers: 128,
            max_idle: 128,
            shrink_interval_ms: 30_000,
            worker_recycle_batch: 64,
            union_recycle_batch: 128,
        }
    }
}

impl DispatchConfig {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn shrink_interval(&self) -> Duration {
        Duration::from_millis(self.shrink_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_idle == 0 {
            return Err(Error::Config("dispatch max_idle must be at least 1".into()));
        }
        if self.shrink_interval_ms == 0 {
            return Err(Error::Config("dispatch shrink interval must be non-zero".into()));
        }
        if self.worker_recycle_batch == 0 || self.union_recycle_batch == 0 {
            return Err(Error::Config("dispatch recycle batches must be non-zero".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    pub replicas: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            replicas: DEFAULT_REPLICAS,
        }
    }
}

impl RingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.replicas == 0 {
            return Err(Error::Config("ring replicas must be at least 1".into()));
        }
        Ok(())
    }
}
