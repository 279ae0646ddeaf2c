//! Records exchanged with the store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;

/// True identity of a proxy endpoint.
///
/// Display tags are cosmetic and may collide across subscriptions, so every
/// measurement and failure counter is keyed by the address and port instead.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeKey {
    /// Server host name or IP address.
    pub address: String,
    /// Server port.
    pub port: u16,
}

impl NodeKey {
    /// Builds a key from its parts.
    #[must_use]
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:{}", self.address, self.port)
    }
}

/// Lifecycle status of a managed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Newly discovered and not yet proven.
    Pending,
    /// Currently passing checks.
    Verified,
    /// Persistently failing and excluded from active use.
    Archived,
}

impl NodeStatus {
    /// Lower-case label used in events and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verified => "verified",
            Self::Archived => "archived",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Error returned when parsing a node status fails.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown node status: {0}")]
pub struct NodeStatusParseError(String);

impl FromStr for NodeStatus {
    type Err = NodeStatusParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "verified" => Ok(Self::Verified),
            "archived" => Ok(Self::Archived),
            other => Err(NodeStatusParseError(other.to_owned())),
        }
    }
}

/// A proxy node under lifecycle management.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedNode {
    /// Display tag as delivered by the subscription.
    pub tag: String,
    /// Outbound protocol type understood by the proxy engine.
    pub protocol: String,
    /// Server host name or IP address.
    pub address: String,
    /// Server port.
    pub port: u16,
    /// Country name, when known.
    pub country: Option<String>,
    /// ISO country code, when known.
    pub country_code: Option<String>,
    /// Protocol-specific outbound fields passed to the engine verbatim.
    #[serde(default)]
    pub extra: Map<String, Value>,
    /// Current lifecycle status.
    pub status: NodeStatus,
    /// Failures observed since the last successful check.
    pub consecutive_failures: u32,
    /// Time of the most recent check.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_checked_at: Option<OffsetDateTime>,
    /// Time the node was first stored.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Time the node was last promoted to verified.
    #[serde(with = "time::serde::rfc3339::option")]
    pub promoted_at: Option<OffsetDateTime>,
    /// Time the node was archived.
    #[serde(with = "time::serde::rfc3339::option")]
    pub archived_at: Option<OffsetDateTime>,
}

impl UnifiedNode {
    /// Builds a freshly discovered pending node.
    #[must_use]
    pub fn pending(
        tag: impl Into<String>,
        protocol: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            tag: tag.into(),
            protocol: protocol.into(),
            address: address.into(),
            port,
            country: None,
            country_code: None,
            extra: Map::new(),
            status: NodeStatus::Pending,
            consecutive_failures: 0,
            last_checked_at: None,
            created_at: OffsetDateTime::now_utc(),
            promoted_at: None,
            archived_at: None,
        }
    }

    /// Returns the node with one extra outbound field set.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Returns the node with the given status.
    #[must_use]
    pub const fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    /// Identity of the node.
    #[must_use]
    pub fn key(&self) -> NodeKey {
        NodeKey::new(self.address.clone(), self.port)
    }
}

/// Lifecycle fields written back by the verification engine.
///
/// Identity and protocol data are never part of an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleUpdate {
    /// Status after the check.
    pub status: NodeStatus,
    /// Failure counter after the check.
    pub consecutive_failures: u32,
    /// Check timestamp.
    pub checked_at: OffsetDateTime,
    /// Promotion stamp, set only on promotion.
    pub promoted_at: Option<OffsetDateTime>,
    /// Archival stamp, set only on archival.
    pub archived_at: Option<OffsetDateTime>,
}

/// Append-only record of one verification run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationLog {
    /// When the run began.
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    /// Wall-clock duration of the run.
    pub duration_ms: u64,
    /// Nodes that were checked.
    pub checked: usize,
    /// Pending nodes promoted to verified.
    pub promoted: usize,
    /// Verified nodes demoted to pending.
    pub demoted: usize,
    /// Pending nodes archived.
    pub archived: usize,
    /// Failure description when the run aborted.
    pub error: Option<String>,
}

impl VerificationLog {
    /// Builds a log for a run that aborted before any node was checked.
    #[must_use]
    pub fn failed(started_at: OffsetDateTime, duration_ms: u64, error: impl Into<String>) -> Self {
        Self {
            started_at,
            duration_ms,
            checked: 0,
            promoted: 0,
            demoted: 0,
            archived: 0,
            error: Some(error.into()),
        }
    }
}

/// Append-only record of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineLog {
    /// When the run began.
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    /// Wall-clock duration of the run.
    pub duration_ms: u64,
    /// Nodes copied into the active set.
    pub copied: usize,
    /// Nodes skipped as already present.
    pub skipped: usize,
    /// Nodes removed from the active set.
    pub removed: usize,
    /// Failure description when the run aborted.
    pub error: Option<String>,
}

impl PipelineLog {
    /// Builds a log for a pipeline run that failed.
    #[must_use]
    pub fn failed(started_at: OffsetDateTime, duration_ms: u64, error: impl Into<String>) -> Self {
        Self {
            started_at,
            duration_ms,
            copied: 0,
            skipped: 0,
            removed: 0,
            error: Some(error.into()),
        }
    }
}

/// Runtime-tunable settings owned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Minutes between subscription refreshes; zero disables the loop.
    pub subscription_interval_minutes: u64,
    /// Minutes between verification runs; zero disables the loop.
    pub verification_interval_minutes: u64,
    /// Consecutive failures that archive a pending node or demote a verified one.
    pub archive_threshold: u32,
    /// Chain the pipeline after each scheduled subscription refresh.
    pub auto_pipeline: bool,
    /// Extra URLs whose reachability is checked through each healthy node.
    pub site_check_urls: Vec<String>,
    /// Geolocate verified nodes that have no cached country.
    pub geo_detection: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            subscription_interval_minutes: 60,
            verification_interval_minutes: 30,
            archive_threshold: 3,
            auto_pipeline: false,
            site_check_urls: Vec::new(),
            geo_detection: false,
        }
    }
}

/// What a measurement exercised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "url", rename_all = "snake_case")]
pub enum MeasureKind {
    /// Latency check against the health URL.
    Health,
    /// Reachability of one configured site.
    Site(String),
}

/// One measurement result keyed by node identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthMeasurement {
    /// Node that was measured.
    pub key: NodeKey,
    /// What was measured.
    pub kind: MeasureKind,
    /// Observed latency on success.
    pub latency_ms: Option<u64>,
    /// Failure description on error.
    pub error: Option<String>,
    /// Measurement timestamp.
    #[serde(with = "time::serde::rfc3339")]
    pub measured_at: OffsetDateTime,
}

impl HealthMeasurement {
    /// Whether the measurement succeeded.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        self.latency_ms.is_some()
    }
}

/// Cached geolocation of a server address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoInfo {
    /// Country name.
    pub country: String,
    /// ISO country code.
    pub country_code: String,
}
