use std::collections::HashMap;

use crate::store::NodeKey;

/// Synthetic tag given to the node at `index` within one probe run.
#[must_use]
pub fn probe_tag(index: usize) -> String {
    format!("probe_{index}")
}

/// Parses a synthetic probe tag back into its index.
#[must_use]
pub fn probe_index(tag: &str) -> Option<usize> {
    tag.strip_prefix("probe_")?.parse().ok()
}

/// Bidirectional mapping between probe tags and node identities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeTagMap {
    by_tag: HashMap<String, NodeKey>,
    by_key: HashMap<NodeKey, String>,
}

impl ProbeTagMap {
    /// Builds an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `tag` stands for `key` in the current run.
    pub fn insert(&mut self, tag: String, key: NodeKey) {
        if let Some(previous) = self.by_key.insert(key.clone(), tag.clone()) {
            self.by_tag.remove(&previous);
        }
        self.by_tag.insert(tag, key);
    }

    /// Probe tag of the node with identity `key`.
    #[must_use]
    pub fn tag_for(&self, key: &NodeKey) -> Option<&str> {
        self.by_key.get(key).map(String::as_str)
    }

    /// Node identity behind a probe tag.
    #[must_use]
    pub fn key_for(&self, tag: &str) -> Option<&NodeKey> {
        self.by_tag.get(tag)
    }

    /// Number of mapped nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }

    /// Iterates over `(tag, key)` pairs in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &NodeKey)> {
        self.by_tag.iter().map(|(tag, key)| (tag.as_str(), key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_in_both_directions() {
        let mut map = ProbeTagMap::new();
        let key = NodeKey::new("198.51.100.4", 8388);
        map.insert(probe_tag(4), key.clone());

        assert_eq!(map.tag_for(&key), Some("probe_4"));
        assert_eq!(map.key_for("probe_4"), Some(&key));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn remapping_a_key_drops_the_stale_tag() {
        let mut map = ProbeTagMap::new();
        let key = NodeKey::new("198.51.100.4", 8388);
        map.insert(probe_tag(1), key.clone());
        map.insert(probe_tag(2), key.clone());

        assert_eq!(map.key_for("probe_1"), None);
        assert_eq!(map.tag_for(&key), Some("probe_2"));
    }

    #[test]
    fn tag_indices_round_trip() {
        assert_eq!(probe_index(&probe_tag(17)), Some(17));
        assert_eq!(probe_index("direct"), None);
        assert_eq!(probe_index("probe_x"), None);
    }
}
