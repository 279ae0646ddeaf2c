//! Minimal engine configuration used by probe runs.
//!
//! The document always starts with the [`SYSTEM_OUTBOUNDS`] fixed outbounds
//! (`direct`, `block`), followed by one outbound per node in candidate order,
//! followed by the auto-selecting group and the geolocation selector. Engine
//! errors address outbounds by their position in this list.

use serde_json::{Map, Value, json};

use super::tags::{ProbeTagMap, probe_tag};
use crate::store::UnifiedNode;

/// Number of always-present outbounds preceding the node outbounds.
pub const SYSTEM_OUTBOUNDS: usize = 2;

/// Tag of the auto-selecting group over every probe node.
pub const AUTO_GROUP_TAG: &str = "probe-auto";

/// Tag of the selector pinned through the control API for geolocation.
pub const GEO_SELECTOR_TAG: &str = "probe-geo";

/// Tag of the auxiliary mixed inbound.
pub const GEO_INBOUND_TAG: &str = "geo-in";

const LOOPBACK: &str = "127.0.0.1";
const URLTEST_INTERVAL: &str = "10m";

/// Listening layout of one probe run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeLayout {
    control_port: u16,
    mixed_port: u16,
    health_url: String,
}

impl ProbeLayout {
    /// Describes a probe listening on the given loopback ports.
    #[must_use]
    pub fn new(control_port: u16, mixed_port: u16, health_url: impl Into<String>) -> Self {
        Self {
            control_port,
            mixed_port,
            health_url: health_url.into(),
        }
    }

    /// Port of the engine's control API.
    #[must_use]
    pub const fn control_port(&self) -> u16 {
        self.control_port
    }

    /// Port of the auxiliary mixed inbound.
    #[must_use]
    pub const fn mixed_port(&self) -> u16 {
        self.mixed_port
    }

    /// Renders the configuration for `nodes`, each paired with its index in
    /// the original request.
    pub fn render<'a, I>(&self, nodes: I) -> Value
    where
        I: IntoIterator<Item = (usize, &'a UnifiedNode)>,
    {
        self.render_with_tags(nodes).0
    }

    /// Renders the configuration and the tag map describing it.
    pub fn render_with_tags<'a, I>(&self, nodes: I) -> (Value, ProbeTagMap)
    where
        I: IntoIterator<Item = (usize, &'a UnifiedNode)>,
    {
        let mut tags = ProbeTagMap::new();
        let mut outbounds = vec![
            json!({ "type": "direct", "tag": "direct" }),
            json!({ "type": "block", "tag": "block" }),
        ];
        let mut probe_tags = Vec::new();
        for (index, node) in nodes {
            let tag = probe_tag(index);
            outbounds.push(node_outbound(&tag, node));
            tags.insert(tag.clone(), node.key());
            probe_tags.push(Value::String(tag));
        }
        outbounds.push(json!({
            "type": "urltest",
            "tag": AUTO_GROUP_TAG,
            "outbounds": probe_tags,
            "url": self.health_url,
            "interval": URLTEST_INTERVAL,
        }));
        outbounds.push(json!({
            "type": "selector",
            "tag": GEO_SELECTOR_TAG,
            "outbounds": probe_tags,
        }));

        let document = json!({
            "log": { "level": "warn", "timestamp": true },
            "inbounds": [{
                "type": "mixed",
                "tag": GEO_INBOUND_TAG,
                "listen": LOOPBACK,
                "listen_port": self.mixed_port,
            }],
            "outbounds": outbounds,
            "route": {
                "rules": [{ "inbound": [GEO_INBOUND_TAG], "outbound": GEO_SELECTOR_TAG }],
                "final": AUTO_GROUP_TAG,
            },
            "experimental": {
                "clash_api": {
                    "external_controller": format!("{LOOPBACK}:{}", self.control_port),
                },
            },
        });
        (document, tags)
    }
}

/// Builds one node outbound. Protocol-specific fields come from the node's
/// extra map; identity fields always win over extras.
fn node_outbound(tag: &str, node: &UnifiedNode) -> Value {
    let mut outbound: Map<String, Value> = node.extra.clone();
    outbound.insert("type".to_owned(), Value::String(node.protocol.clone()));
    outbound.insert("tag".to_owned(), Value::String(tag.to_owned()));
    outbound.insert("server".to_owned(), Value::String(node.address.clone()));
    outbound.insert("server_port".to_owned(), Value::from(node.port));
    Value::Object(outbound)
}
