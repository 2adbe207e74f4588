//! Canonical `device/control` identifiers.

use serde::{Deserialize, Serialize};

/// Identity shared by a bus control and the variable node exposing it.
///
/// Always exactly two non-empty components separated by a single `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeKey {
    key: String,
    split: usize,
}

impl NodeKey {
    /// Build a key from its components. Returns `None` if either is empty or contains `/`.
    pub fn new(device_id: &str, control_id: &str) -> Option<Self> {
        if device_id.is_empty()
            || control_id.is_empty()
            || device_id.contains('/')
            || control_id.contains('/')
        {
            return None;
        }
        Some(Self {
            key: format!("{}/{}", device_id, control_id),
            split: device_id.len(),
        })
    }

    /// Parse `device/control`. Anything else is rejected.
    pub fn parse(s: &str) -> Option<Self> {
        let (device, control) = s.split_once('/')?;
        Self::new(device, control)
    }

    pub fn device_id(&self) -> &str {
        &self.key[..self.split]
    }

    pub fn control_id(&self) -> &str {
        &self.key[self.split + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

impl std::str::FromStr for NodeKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("invalid device/control pair: '{}'", s))
    }
}

impl TryFrom<String> for NodeKey {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<NodeKey> for String {
    fn from(key: NodeKey) -> Self {
        key.key
    }
}
