//! Node configuration.
//!
//! [`CacheConfig`] is what a [`ScatterNode`](crate::ScatterNode) runs with.
//! [`ScatterConfigFile`] is its TOML form: every field is optional and
//! falls back to the [`CacheConfig`] default.

use std::path::Path;
use std::time::Duration;

use anyhow::bail;
use scatter_types::BiasAcquisition;
use serde::Deserialize;

/// Runtime settings of a cache node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Segments in the hash space. Must match on every node.
    pub num_segments: u32,
    /// Virtual nodes per member on the ownership ring.
    pub vnodes_per_node: u16,
    /// Entry limit of the local store.
    pub max_entries: usize,
    /// When remote writers get a read lease.
    pub bias_acquisition: BiasAcquisition,
    /// How long a granted lease lasts.
    pub bias_lifespan: Duration,
    /// A holder renews once less than this much of its lease is left.
    /// Zero disables renewal.
    pub bias_renewal_threshold: Duration,
    /// How often the owner looks for expired leases.
    pub bias_scan_interval: Duration,
    /// Queued invalidations that trigger a round before the next scan.
    pub invalidation_batch_size: usize,
    /// How often invalidation rounds run.
    pub invalidation_scan_interval: Duration,
    /// How long a node waits for another node to execute a request.
    pub remote_timeout: Duration,
    /// How long a single revocation attempt may take.
    pub revocation_timeout: Duration,
    /// Revocation attempts before an owner-originated write fails.
    pub revocation_retries: u32,
    /// Pause between revocation attempts.
    pub revocation_backoff: Duration,
    /// Times a request is re-routed after a topology mismatch.
    pub routing_retries: u32,
    /// Longest wait for a newer topology before re-routing.
    pub routing_backoff: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            num_segments: 256,
            vnodes_per_node: 64,
            max_entries: usize::MAX,
            bias_acquisition: BiasAcquisition::OnWrite,
            bias_lifespan: Duration::from_secs(300),
            bias_renewal_threshold: Duration::from_secs(30),
            bias_scan_interval: Duration::from_secs(10),
            invalidation_batch_size: 128,
            invalidation_scan_interval: Duration::from_secs(1),
            remote_timeout: Duration::from_secs(15),
            revocation_timeout: Duration::from_secs(2),
            revocation_retries: 3,
            revocation_backoff: Duration::from_millis(50),
            routing_retries: 10,
            routing_backoff: Duration::from_millis(50),
        }
    }
}

impl CacheConfig {
    /// Reject settings the node cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_segments == 0 {
            bail!("num_segments must be at least 1");
        }
        if self.vnodes_per_node == 0 {
            bail!("vnodes_per_node must be at least 1");
        }
        if self.invalidation_batch_size == 0 {
            bail!("invalidation batch_size must be at least 1");
        }
        if self.revocation_retries == 0 {
            bail!("revocation_retries must be at least 1");
        }
        if self.bias_renewal_threshold >= self.bias_lifespan {
            bail!(
                "bias renewal threshold ({:?}) must be shorter than the lifespan ({:?})",
                self.bias_renewal_threshold,
                self.bias_lifespan
            );
        }
        Ok(())
    }
}

/// Top-level configuration file, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ScatterConfigFile {
    /// Segmenting and storage.
    pub cache: CacheSection,
    /// Read leases.
    pub bias: BiasSection,
    /// Invalidation rounds.
    pub invalidation: InvalidationSection,
    /// Remote call tuning.
    pub timeouts: TimeoutSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[cache]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Segments in the hash space.
    pub num_segments: Option<u32>,
    /// Virtual nodes per member.
    pub vnodes_per_node: Option<u16>,
    /// Entry limit of the local store.
    pub max_entries: Option<usize>,
}

/// `[bias]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BiasSection {
    /// `"never"` or `"on_write"`.
    pub acquisition: Option<BiasAcquisition>,
    /// Lease duration in milliseconds.
    pub lifespan_ms: Option<u64>,
    /// Remaining lease time (ms) below which holders renew.
    pub renewal_threshold_ms: Option<u64>,
    /// Expired-lease scan interval in milliseconds.
    pub scan_interval_ms: Option<u64>,
}

/// `[invalidation]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct InvalidationSection {
    /// Queue size that triggers an early round.
    pub batch_size: Option<usize>,
    /// Round interval in milliseconds.
    pub scan_interval_ms: Option<u64>,
}

/// `[timeouts]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TimeoutSection {
    /// Remote request timeout in milliseconds.
    pub remote_ms: Option<u64>,
    /// Single revocation attempt timeout in milliseconds.
    pub revocation_ms: Option<u64>,
    /// Revocation attempts for owner-originated writes.
    pub revocation_retries: Option<u32>,
    /// Pause between revocation attempts in milliseconds.
    pub revocation_backoff_ms: Option<u64>,
    /// Re-routing attempts after topology mismatches.
    pub routing_retries: Option<u32>,
    /// Longest wait for a newer topology in milliseconds.
    pub routing_backoff_ms: Option<u64>,
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ScatterConfigFile {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse config from a TOML string.
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Effective log level.
    pub fn log_level(&self) -> &str {
        &self.log.level
    }

    /// Resolve every setting against the defaults and validate the result.
    pub fn to_cache_config(&self) -> anyhow::Result<CacheConfig> {
        let defaults = CacheConfig::default();
        let ms = |value: Option<u64>, default: Duration| value.map_or(default, Duration::from_millis);

        let config = CacheConfig {
            num_segments: self.cache.num_segments.unwrap_or(defaults.num_segments),
            vnodes_per_node: self.cache.vnodes_per_node.unwrap_or(defaults.vnodes_per_node),
            max_entries: self.cache.max_entries.unwrap_or(defaults.max_entries),
            bias_acquisition: self.bias.acquisition.unwrap_or(defaults.bias_acquisition),
            bias_lifespan: ms(self.bias.lifespan_ms, defaults.bias_lifespan),
            bias_renewal_threshold: ms(
                self.bias.renewal_threshold_ms,
                defaults.bias_renewal_threshold,
            ),
            bias_scan_interval: ms(self.bias.scan_interval_ms, defaults.bias_scan_interval),
            invalidation_batch_size: self
                .invalidation
                .batch_size
                .unwrap_or(defaults.invalidation_batch_size),
            invalidation_scan_interval: ms(
                self.invalidation.scan_interval_ms,
                defaults.invalidation_scan_interval,
            ),
            remote_timeout: ms(self.timeouts.remote_ms, defaults.remote_timeout),
            revocation_timeout: ms(self.timeouts.revocation_ms, defaults.revocation_timeout),
            revocation_retries: self
                .timeouts
                .revocation_retries
                .unwrap_or(defaults.revocation_retries),
            revocation_backoff: ms(
                self.timeouts.revocation_backoff_ms,
                defaults.revocation_backoff,
            ),
            routing_retries: self
                .timeouts
                .routing_retries
                .unwrap_or(defaults.routing_retries),
            routing_backoff: ms(self.timeouts.routing_backoff_ms, defaults.routing_backoff),
        };
        config.validate()?;
        Ok(config)
    }
}
