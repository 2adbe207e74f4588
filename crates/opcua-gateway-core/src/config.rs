//! Gateway configuration.
//!
//! The configuration is a JSON document:
//!
//! ```json
//! {
//!   "debug": false,
//!   "mode": "static",
//!   "opcua": { "host": "", "port": 4840 },
//!   "mqtt": { "host": "localhost", "port": 1883 },
//!   "groups": [
//!     { "name": "test", "enabled": true,
//!       "controls": [ { "topic": "test/test", "enabled": true } ] }
//!   ]
//! }
//! ```
//!
//! Only enabled groups and enabled controls are loaded. The configuration is
//! immutable once loaded.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::address_space::ServerSettings;
use crate::bus::{BusError, ControlHandle, DeviceDriver, DeviceFilter};
use crate::key::NodeKey;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/wb-mqtt-opcua.conf";

/// Error type for configuration loading and generation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Config validation error: {0}")]
    Validation(String),

    #[error("Empty configuration: {0}")]
    Empty(PathBuf),

    #[error("Config generation failed: {0}")]
    Bus(#[from] BusError),
}

/// How variable nodes are provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Create every configured control's node at startup.
    #[default]
    Static,
    /// Create nodes lazily when a control of a configured device publishes a value.
    Reactive,
}

/// MQTT broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttSettings {
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,

    #[serde(default)]
    pub auth: bool,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Topic prefix prepended to `/devices/...`
    #[serde(default)]
    pub prefix: String,

    #[serde(default = "default_client_id")]
    pub client_id: String,
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keepalive() -> u64 {
    60
}

fn default_client_id() -> String {
    crate::APP_NAME.to_string()
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            keepalive: default_keepalive(),
            auth: false,
            username: String::new(),
            password: String::new(),
            prefix: String::new(),
            client_id: default_client_id(),
        }
    }
}

impl MqttSettings {
    /// Username and password, only when authentication is enabled.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        if self.auth {
            Some((&self.username, &self.password))
        } else {
            None
        }
    }

    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    debug: bool,
    #[serde(default)]
    mode: SyncMode,
    #[serde(default)]
    opcua: ServerSettings,
    #[serde(default)]
    mqtt: MqttSettings,
    groups: Vec<RawGroup>,
}

#[derive(Debug, Deserialize)]
struct RawGroup {
    name: String,
    #[serde(default)]
    enabled: bool,
    controls: Vec<RawControl>,
}

#[derive(Debug, Deserialize)]
struct RawControl {
    topic: String,
    #[serde(default)]
    enabled: bool,
}

/// Loaded gateway configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub debug: bool,
    pub mode: SyncMode,
    pub server: ServerSettings,
    pub mqtt: MqttSettings,
    /// Enabled groups and their enabled controls.
    pub groups: BTreeMap<String, Vec<NodeKey>>,
}

impl GatewayConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let value = read_config_value(path)?;
        Self::from_value(value)
    }

    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Self::from_value(serde_json::from_str(s)?)
    }

    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_value(value)?;

        if raw.opcua.port == 0 {
            return Err(ConfigError::Validation(
                "opcua.port must be in 1..=65535".to_string(),
            ));
        }
        if raw.mqtt.port == 0 {
            return Err(ConfigError::Validation(
                "mqtt.port must be in 1..=65535".to_string(),
            ));
        }

        let mut groups: BTreeMap<String, Vec<NodeKey>> = BTreeMap::new();
        for group in raw.groups {
            if group.name.is_empty() {
                return Err(ConfigError::Validation(
                    "group name must not be empty".to_string(),
                ));
            }
            if !group.enabled {
                continue;
            }
            let controls = groups.entry(group.name).or_default();
            for control in group.controls.into_iter().filter(|c| c.enabled) {
                match NodeKey::parse(&control.topic) {
                    Some(key) if !controls.contains(&key) => controls.push(key),
                    Some(_) => {}
                    None => tracing::warn!(topic = %control.topic, "Invalid topic"),
                }
            }
        }

        Ok(Self {
            debug: raw.debug,
            mode: raw.mode,
            server: raw.opcua,
            mqtt: raw.mqtt,
            groups,
        })
    }

    /// Devices the bus driver must track for this configuration.
    ///
    /// Reactive mode watches devices named after groups; static mode watches
    /// the devices of the enabled controls.
    pub fn device_ids(&self) -> BTreeSet<String> {
        match self.mode {
            SyncMode::Reactive => self.groups.keys().cloned().collect(),
            SyncMode::Static => self
                .groups
                .values()
                .flatten()
                .map(|key| key.device_id().to_string())
                .collect(),
        }
    }

    pub fn device_filter(&self) -> DeviceFilter {
        DeviceFilter::Devices(self.device_ids())
    }

    /// Group whose enabled controls list `key`.
    pub fn group_for_key(&self, key: &NodeKey) -> Option<&str> {
        self.groups
            .iter()
            .find(|(_, controls)| controls.contains(key))
            .map(|(name, _)| name.as_str())
    }

    /// Group named after `device_id`.
    pub fn group_for_device(&self, device_id: &str) -> Option<&str> {
        self.groups
            .get_key_value(device_id)
            .map(|(name, _)| name.as_str())
    }
}

/// Read a configuration file as raw JSON.
pub fn read_config_value(path: impl AsRef<Path>) -> Result<Value, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if text.trim().is_empty() {
        return Err(ConfigError::Empty(path.to_path_buf()));
    }
    Ok(serde_json::from_str(&text)?)
}

/// Write a configuration back with 4-space indentation.
pub fn write_config_value(path: impl AsRef<Path>, value: &Value) -> Result<(), ConfigError> {
    let path = path.as_ref();
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut serializer)?;
    out.push(b'\n');
    std::fs::write(path, out).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn control_config(key: &NodeKey, control: &ControlHandle) -> Value {
    let access = if control.is_readonly() {
        "read only"
    } else {
        "setup is allowed"
    };
    serde_json::json!({
        "topic": key.as_str(),
        "info": format!("{} ({})", control.control_type(), access),
        "enabled": false,
    })
}

/// Append every control known to the bus but missing from `config`.
///
/// New controls are added disabled, into a group named after their device;
/// missing groups are created disabled. Returns the number of controls added.
pub fn update_config(
    driver: &dyn DeviceDriver,
    config: &mut Value,
    timeout: Duration,
) -> Result<usize, ConfigError> {
    driver.set_filter(DeviceFilter::All)?;
    driver.wait_for_ready(timeout)?;

    let mut discovered: BTreeMap<String, BTreeMap<NodeKey, ControlHandle>> = BTreeMap::new();
    {
        let tx = driver.begin_tx();
        for device in tx.devices() {
            let controls: BTreeMap<_, _> = device
                .controls()
                .into_iter()
                .filter_map(|control| control.key().map(|key| (key, control)))
                .collect();
            if !controls.is_empty() {
                discovered.insert(device.id().to_string(), controls);
            }
        }
    }

    let root = config
        .as_object_mut()
        .ok_or_else(|| ConfigError::Validation("config root must be an object".to_string()))?;
    let groups = root
        .entry("groups")
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
        .ok_or_else(|| ConfigError::Validation("'groups' must be an array".to_string()))?;

    for group in groups.iter() {
        let Some(controls) = group.get("controls").and_then(Value::as_array) else {
            continue;
        };
        for topic in controls
            .iter()
            .filter_map(|c| c.get("topic").and_then(Value::as_str))
        {
            let Some(key) = NodeKey::parse(topic) else {
                continue;
            };
            if let Some(known) = discovered.get_mut(key.device_id()) {
                known.remove(&key);
                if known.is_empty() {
                    discovered.remove(key.device_id());
                }
            }
        }
    }

    let mut added = 0;
    for (device_id, controls) in discovered {
        let index = match groups
            .iter()
            .position(|g| g.get("name").and_then(Value::as_str) == Some(device_id.as_str()))
        {
            Some(index) => index,
            None => {
                groups.push(serde_json::json!({
                    "name": device_id.clone(),
                    "enabled": false,
                    "controls": [],
                }));
                groups.len() - 1
            }
        };
        let group = groups[index]
            .as_object_mut()
            .ok_or_else(|| ConfigError::Validation(format!("group '{}' must be an object", device_id)))?;
        let list = group
            .entry("controls")
            .or_insert_with(|| Value::Array(Vec::new()))
            .as_array_mut()
            .ok_or_else(|| {
                ConfigError::Validation(format!("group '{}' controls must be an array", device_id))
            })?;
        for (key, control) in &controls {
            list.push(control_config(key, control));
            added += 1;
        }
    }

    Ok(added)
}
