//! Shared configuration for the node warden daemon.
//!
//! Configuration is layered by [`ortho_config`]: built-in defaults, then a
//! TOML file (`--config-path` or `WARDEN_CONFIG_PATH`), then `WARDEN_*`
//! environment variables, then command-line flags. The resolved [`Config`]
//! carries the static settings the daemon needs before it can talk to its
//! store: where the proxy engine lives, where probe artefacts go, and the
//! timeouts that bound probe start-up, shutdown and individual measurements.
//!
//! Interval and threshold settings are deliberately absent. They are owned by
//! the store so that operators can tune them while the daemon runs.

mod defaults;
mod logging;
mod runtime;

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

pub use defaults::{
    DEFAULT_CHECK_WORKERS, DEFAULT_ENGINE_BINARY, DEFAULT_EVENT_BUFFER, DEFAULT_GEO_LOOKUP_URL,
    DEFAULT_HEALTH_CHECK_URL, DEFAULT_LOG_FILTER, DEFAULT_READINESS_TIMEOUT_MS,
    DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_STOP_GRACE_MS, default_engine_binary,
    default_geo_lookup_url, default_health_check_url, default_log_filter,
    default_log_filter_string, default_log_format, default_work_dir,
};
pub use logging::{LogFormat, LogFormatParseError};
/// Loader trait implemented by [`Config`]; bring it into scope to call
/// `Config::load` or `Config::load_from_iter`.
pub use ortho_config::OrthoConfig as ConfigLoad;
pub use runtime::{RuntimePaths, RuntimePathsError};

/// Resolved daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "WARDEN")]
pub struct Config {
    /// Tracing filter expression, for example `info,wardend::probe=debug`.
    #[ortho_config(default = defaults::default_log_filter_string())]
    pub log_filter: String,
    /// Output format of the structured log stream.
    #[ortho_config(default = defaults::default_log_format())]
    pub log_format: LogFormat,
    /// Proxy engine executable, either a path or a name looked up on `PATH`.
    #[ortho_config(default = defaults::default_engine_binary())]
    pub engine_binary: Utf8PathBuf,
    /// Directory holding probe configs and the probe log.
    pub work_dir: Option<Utf8PathBuf>,
    /// URL requested through each node by the health check.
    #[ortho_config(default = defaults::default_health_check_url())]
    pub health_check_url: String,
    /// URL queried through the auxiliary inbound to geolocate a node.
    #[ortho_config(default = defaults::default_geo_lookup_url())]
    pub geo_lookup_url: String,
    /// Timeout applied to each individual measurement request.
    #[ortho_config(default = DEFAULT_REQUEST_TIMEOUT_MS)]
    pub request_timeout_ms: u64,
    /// Upper bound on the wait for the probe control API to answer.
    #[ortho_config(default = DEFAULT_READINESS_TIMEOUT_MS)]
    pub readiness_timeout_ms: u64,
    /// Grace period between SIGTERM and SIGKILL when stopping the probe.
    #[ortho_config(default = DEFAULT_STOP_GRACE_MS)]
    pub stop_grace_ms: u64,
    /// Per-subscriber buffer of the event bus.
    #[ortho_config(default = DEFAULT_EVENT_BUFFER)]
    pub event_buffer: usize,
    /// Nodes measured concurrently by a verification cycle.
    #[ortho_config(default = DEFAULT_CHECK_WORKERS)]
    pub check_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
            engine_binary: default_engine_binary(),
            work_dir: None,
            health_check_url: default_health_check_url(),
            geo_lookup_url: default_geo_lookup_url(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            readiness_timeout_ms: DEFAULT_READINESS_TIMEOUT_MS,
            stop_grace_ms: DEFAULT_STOP_GRACE_MS,
            event_buffer: DEFAULT_EVENT_BUFFER,
            check_workers: DEFAULT_CHECK_WORKERS,
        }
    }
}

impl Config {
    /// Tracing filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_str()
    }

    /// Structured log output format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Proxy engine executable as configured.
    #[must_use]
    pub fn engine_binary(&self) -> &Utf8Path {
        self.engine_binary.as_path()
    }

    /// Explicit work directory override, if any.
    #[must_use]
    pub fn work_dir(&self) -> Option<&Utf8Path> {
        self.work_dir.as_deref()
    }

    /// Health check target URL.
    #[must_use]
    pub fn health_check_url(&self) -> &str {
        self.health_check_url.as_str()
    }

    /// Geolocation lookup URL.
    #[must_use]
    pub fn geo_lookup_url(&self) -> &str {
        self.geo_lookup_url.as_str()
    }

    /// Timeout for a single measurement request.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Bound on the probe readiness wait.
    #[must_use]
    pub const fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    /// Grace period granted to the probe on shutdown.
    #[must_use]
    pub const fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Per-subscriber event buffer, never below one slot.
    #[must_use]
    pub fn event_buffer(&self) -> usize {
        self.event_buffer.max(1)
    }

    /// Concurrent measurement workers, never fewer than one.
    #[must_use]
    pub fn check_workers(&self) -> usize {
        self.check_workers.max(1)
    }
}
