use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the relay.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Timeline Server connection and posting policy.
    #[serde(default)]
    pub timeline: TimelineConfig,

    /// Access-control list configuration for domain creation.
    #[serde(default)]
    pub acls: AclsConfig,

    /// Retention bounds for the session/execution tracker.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Registered extension-service type names to load, in start order.
    #[serde(default)]
    pub extensions: Vec<String>,

    /// Prometheus metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Timeline Server connection and posting policy.
#[derive(Debug, Clone, Deserialize)]
pub struct TimelineConfig {
    /// Enable forwarding to the Timeline Server. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Timeline Server HTTP endpoint (e.g. "http://ats.example:8188").
    #[serde(default)]
    pub endpoint: String,

    /// Timeline API version. 1.5 posts summary and detail entities. Default: 1.0.
    #[serde(default = "default_timeline_version")]
    pub version: f64,

    /// Events per entity flush. Default: 100.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Queued-event headroom added to `batch_size` to form the drop
    /// threshold. Default: 10000.
    #[serde(default = "default_post_queue_limit")]
    pub post_queue_limit: usize,

    /// Initial retry delay; also the linear increment. Default: 1s.
    #[serde(default = "default_post_retry_interval", with = "humantime_serde")]
    pub post_retry_interval: Duration,

    /// Retry delay cap. Default: 60s.
    #[serde(
        default = "default_post_retry_max_interval",
        with = "humantime_serde"
    )]
    pub post_retry_max_interval: Duration,

    /// Drain budget on shutdown. Default: 30s.
    #[serde(default = "default_shutdown_wait_time", with = "humantime_serde")]
    pub shutdown_wait_time: Duration,

    /// Predefined domain id; overrides ACL-driven domain creation.
    #[serde(default)]
    pub domain: String,

    /// Whether the host should register the event listener. Default: true.
    #[serde(default = "default_true")]
    pub listen: bool,

    /// Per-request HTTP timeout. Default: 10s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl TimelineConfig {
    /// True when the v1.5 protocol variant is enabled.
    pub fn version_1_5(&self) -> bool {
        self.version >= 1.5
    }

    /// Absolute queued-event cap: the configured headroom on top of one batch.
    pub fn post_event_limit(&self) -> u64 {
        (self.batch_size + self.post_queue_limit) as u64
    }
}

/// Access-control list configuration for domain creation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AclsConfig {
    /// Enable ACL-driven domain creation. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Administrator principals (readers and writers).
    #[serde(default)]
    pub admin: Vec<String>,

    /// View-only principals (readers).
    #[serde(default)]
    pub view: Vec<String>,

    /// Modify principals (readers and writers).
    #[serde(default)]
    pub modify: Vec<String>,
}

/// Retention bounds for the session/execution tracker.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Retained sessions. Default: 200.
    #[serde(default = "default_retained_sessions")]
    pub sessions: usize,

    /// Retained statement executions. Default: 200.
    #[serde(default = "default_retained_executions")]
    pub executions: usize,
}

/// Prometheus metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeline_version() -> f64 {
    1.0
}

fn default_batch_size() -> usize {
    100
}

fn default_post_queue_limit() -> usize {
    10_000
}

fn default_post_retry_interval() -> Duration {
    Duration::from_millis(1_000)
}

fn default_post_retry_max_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_shutdown_wait_time() -> Duration {
    Duration::from_secs(30)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_retained_sessions() -> usize {
    200
}

fn default_retained_executions() -> usize {
    200
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            timeline: TimelineConfig::default(),
            acls: AclsConfig::default(),
            retention: RetentionConfig::default(),
            extensions: Vec::new(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: String::new(),
            version: default_timeline_version(),
            batch_size: default_batch_size(),
            post_queue_limit: default_post_queue_limit(),
            post_retry_interval: default_post_retry_interval(),
            post_retry_max_interval: default_post_retry_max_interval(),
            shutdown_wait_time: default_shutdown_wait_time(),
            domain: String::new(),
            listen: true,
            request_timeout: default_request_timeout(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            sessions: default_retained_sessions(),
            executions: default_retained_executions(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    ///
    /// Invalid numeric configuration is fatal before the service starts.
    pub fn validate(&self) -> Result<()> {
        if self.timeline.enabled {
            if self.timeline.endpoint.is_empty() {
                bail!("timeline.endpoint is required when timeline.enabled is true");
            }

            if self.timeline.batch_size == 0 {
                bail!("timeline.batch_size must be positive");
            }

            if self.timeline.post_retry_interval.is_zero() {
                bail!("timeline.post_retry_interval must be positive");
            }

            if self.timeline.post_retry_max_interval < self.timeline.post_retry_interval {
                bail!(
                    "timeline.post_retry_max_interval must be at least timeline.post_retry_interval"
                );
            }

            if self.timeline.shutdown_wait_time.is_zero() {
                bail!("timeline.shutdown_wait_time must be positive");
            }

            if self.timeline.version != 1.0 && self.timeline.version != 1.5 {
                bail!("timeline.version must be 1.0 or 1.5");
            }
        }

        if self.retention.sessions == 0 {
            bail!("retention.sessions must be positive");
        }

        if self.retention.executions == 0 {
            bail!("retention.executions must be positive");
        }

        Ok(())
    }
}
