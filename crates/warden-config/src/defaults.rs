use camino::Utf8PathBuf;
use std::env;

#[cfg(unix)]
use libc::geteuid;

#[cfg(unix)]
use dirs::runtime_dir;

/// Default log filter expression used by the daemon.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Default proxy engine executable, resolved on `PATH`.
pub const DEFAULT_ENGINE_BINARY: &str = "sing-box";

/// Default URL fetched through a node to prove it forwards traffic.
pub const DEFAULT_HEALTH_CHECK_URL: &str = "https://www.gstatic.com/generate_204";

/// Default geolocation endpoint queried through the auxiliary inbound.
pub const DEFAULT_GEO_LOOKUP_URL: &str = "http://ip-api.com/json/?fields=status,country,countryCode";

/// Default timeout for a single measurement request, in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Default bound on the probe readiness wait, in milliseconds.
pub const DEFAULT_READINESS_TIMEOUT_MS: u64 = 5_000;

/// Default grace period before the probe is force-killed, in milliseconds.
pub const DEFAULT_STOP_GRACE_MS: u64 = 3_000;

/// Default per-subscriber buffer of the event bus.
pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// Default number of nodes measured concurrently during a cycle.
pub const DEFAULT_CHECK_WORKERS: usize = 8;

/// Default log filter expression used by the daemon.
#[must_use]
pub fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
#[must_use]
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format for the daemon.
#[must_use]
pub fn default_log_format() -> crate::logging::LogFormat {
    crate::logging::LogFormat::Json
}

/// Default proxy engine executable.
#[must_use]
pub fn default_engine_binary() -> Utf8PathBuf {
    Utf8PathBuf::from(DEFAULT_ENGINE_BINARY)
}

/// Default health check URL.
#[must_use]
pub fn default_health_check_url() -> String {
    DEFAULT_HEALTH_CHECK_URL.to_owned()
}

/// Default geolocation lookup URL.
#[must_use]
pub fn default_geo_lookup_url() -> String {
    DEFAULT_GEO_LOOKUP_URL.to_owned()
}

/// Computes the default work directory for probe artefacts.
#[must_use]
pub fn default_work_dir() -> Utf8PathBuf {
    default_work_dir_inner()
}

#[cfg(unix)]
fn default_work_dir_inner() -> Utf8PathBuf {
    let (mut base, apply_namespace) = match runtime_base_directory() {
        Some(dir) => (dir, false),
        None => (fallback_base_directory(), true),
    };

    base.push("warden");
    if apply_namespace {
        base.push(user_namespace());
    }
    base
}

#[cfg(unix)]
fn runtime_base_directory() -> Option<Utf8PathBuf> {
    runtime_dir().and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
}

fn fallback_base_directory() -> Utf8PathBuf {
    let candidate = env::temp_dir();
    Utf8PathBuf::from_path_buf(candidate).unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
}

#[cfg(unix)]
fn user_namespace() -> String {
    let uid = unsafe { geteuid() };
    format!("uid-{uid}")
}

#[cfg(not(unix))]
fn default_work_dir_inner() -> Utf8PathBuf {
    let mut base = fallback_base_directory();
    base.push("warden");
    base
}
