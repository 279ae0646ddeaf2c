//! Measurements taken through a running probe.

use serde_json::Value;
use thiserror::Error;

use crate::probe::{ControlClient, ControlError, GEO_SELECTOR_TAG, ProbeSession};
use crate::store::GeoInfo;

/// Failure of one measurement. Always absorbed into the node's counters.
#[derive(Debug, Clone, Error)]
pub enum MeasureError {
    /// The control API or the proxied request failed.
    #[error(transparent)]
    Control(#[from] ControlError),
    /// The node is not part of the running probe.
    #[error("node excluded from probe: {reason}")]
    NotProbed {
        /// Why the node is missing.
        reason: String,
    },
    /// The geolocation service answered without a usable result.
    #[error("geolocation lookup failed: {message}")]
    Lookup {
        /// Service response summary.
        message: String,
    },
}

/// Latency and geolocation probes against a running probe session.
#[cfg_attr(test, mockall::automock)]
pub trait Measurer: Send + Sync {
    /// Latency in milliseconds of `tag` reaching `url`.
    fn delay(&self, session: &ProbeSession, tag: &str, url: &str) -> Result<u64, MeasureError>;

    /// Country of the exit address of `tag`, looked up through `lookup_url`.
    fn geolocate(
        &self,
        session: &ProbeSession,
        tag: &str,
        lookup_url: &str,
    ) -> Result<GeoInfo, MeasureError>;
}

/// Measures through the engine's control API.
#[derive(Debug, Clone)]
pub struct ControlApiMeasurer {
    client: ControlClient,
}

impl ControlApiMeasurer {
    /// Wraps a control API client.
    #[must_use]
    pub const fn new(client: ControlClient) -> Self {
        Self { client }
    }
}

impl Measurer for ControlApiMeasurer {
    fn delay(&self, session: &ProbeSession, tag: &str, url: &str) -> Result<u64, MeasureError> {
        Ok(self.client.delay(session.control_port, tag, url)?)
    }

    fn geolocate(
        &self,
        session: &ProbeSession,
        tag: &str,
        lookup_url: &str,
    ) -> Result<GeoInfo, MeasureError> {
        self.client
            .select(session.control_port, GEO_SELECTOR_TAG, tag)?;
        let body = self.client.fetch_via_proxy(session.mixed_port, lookup_url)?;
        parse_geo(&body)
    }
}

/// Reads a geolocation response carrying `country` and `countryCode`.
pub(crate) fn parse_geo(body: &Value) -> Result<GeoInfo, MeasureError> {
    if let Some(status) = body.get("status").and_then(Value::as_str)
        && status != "success"
    {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(status)
            .to_owned();
        return Err(MeasureError::Lookup { message });
    }
    let field = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| body.get(*name).and_then(Value::as_str))
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
    };
    let country = field(&["country", "country_name"]);
    let country_code = field(&["countryCode", "country_code"]);
    match (country, country_code) {
        (Some(country), Some(country_code)) => Ok(GeoInfo {
            country,
            country_code,
        }),
        _ => Err(MeasureError::Lookup {
            message: String::from("response lacks country fields"),
        }),
    }
}
