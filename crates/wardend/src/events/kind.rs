use std::fmt;

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

/// Event types published on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    /// A verification run began.
    #[serde(rename = "verify:start")]
    VerifyStart,
    /// A verification phase reported progress.
    #[serde(rename = "verify:progress")]
    VerifyProgress,
    /// A verification run finished.
    #[serde(rename = "verify:complete")]
    VerifyComplete,
    /// A verification run aborted.
    #[serde(rename = "verify:error")]
    VerifyError,
    /// A pending node was promoted to verified.
    #[serde(rename = "node:promoted")]
    NodePromoted,
    /// A verified node was demoted to pending.
    #[serde(rename = "node:demoted")]
    NodeDemoted,
    /// A pending node was archived.
    #[serde(rename = "node:archived")]
    NodeArchived,
    /// A pipeline run began.
    #[serde(rename = "pipeline:start")]
    PipelineStart,
    /// A pipeline run finished.
    #[serde(rename = "pipeline:stop")]
    PipelineStop,
    /// The probe process started.
    #[serde(rename = "probe:start")]
    ProbeStart,
    /// The probe process stopped.
    #[serde(rename = "probe:stop")]
    ProbeStop,
}

impl EventKind {
    /// Wire label of the event type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::VerifyStart => "verify:start",
            Self::VerifyProgress => "verify:progress",
            Self::VerifyComplete => "verify:complete",
            Self::VerifyError => "verify:error",
            Self::NodePromoted => "node:promoted",
            Self::NodeDemoted => "node:demoted",
            Self::NodeArchived => "node:archived",
            Self::PipelineStart => "pipeline:start",
            Self::PipelineStop => "pipeline:stop",
            Self::ProbeStart => "probe:start",
            Self::ProbeStop => "probe:stop",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Phases reported by `verify:progress` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyPhase {
    /// Loading pending and verified nodes.
    PendingScan,
    /// Latency checks through the probe.
    HealthCheck,
    /// Reachability of configured sites.
    SiteCheck,
    /// Geolocation of verified nodes.
    GeoDetection,
}

impl VerifyPhase {
    /// Wire label of the phase.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PendingScan => "pending-scan",
            Self::HealthCheck => "health-check",
            Self::SiteCheck => "site-check",
            Self::GeoDetection => "geo-detection",
        }
    }
}

/// One published event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Event type.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// JSON-shaped payload.
    pub data: Value,
    /// Publication time.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}
