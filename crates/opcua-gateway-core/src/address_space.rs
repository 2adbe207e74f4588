//! Address-space vocabulary and the protocol-server runtime interface.
//!
//! A runtime stores object and variable nodes, dispatches client reads and
//! writes of variable nodes to their [`DataSource`], and runs a serving loop.
//! The gateway only relies on the traits in this module, so any OPC UA stack
//! can be plugged in behind them.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Namespace used for every node the gateway creates.
pub const GATEWAY_NAMESPACE: u16 = 1;

/// Numeric id of the standard Objects folder in namespace 0.
pub const OBJECTS_FOLDER_ID: u32 = 85;

/// Node identifier part.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Identifier {
    Numeric(u32),
    String(String),
}

/// Address-space node identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub namespace: u16,
    pub identifier: Identifier,
}

impl NodeId {
    pub fn numeric(namespace: u16, id: u32) -> Self {
        Self {
            namespace,
            identifier: Identifier::Numeric(id),
        }
    }

    pub fn string(namespace: u16, id: impl Into<String>) -> Self {
        Self {
            namespace,
            identifier: Identifier::String(id.into()),
        }
    }

    pub fn objects_folder() -> Self {
        Self::numeric(0, OBJECTS_FOLDER_ID)
    }

    /// The string identifier, if this is a string node id.
    pub fn as_str(&self) -> Option<&str> {
        match &self.identifier {
            Identifier::String(s) => Some(s),
            Identifier::Numeric(_) => None,
        }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.identifier {
            Identifier::Numeric(i) => write!(f, "ns={};i={}", self.namespace, i),
            Identifier::String(s) => write!(f, "ns={};s={}", self.namespace, s),
        }
    }
}

/// Scalar value as seen by protocol clients.
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    Empty,
    Boolean(bool),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    Float(f32),
    Double(f64),
    String(String),
    ByteString(Vec<u8>),
}

impl Variant {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Empty => "Empty",
            Self::Boolean(_) => "Boolean",
            Self::Int32(_) => "Int32",
            Self::UInt32(_) => "UInt32",
            Self::Int64(_) => "Int64",
            Self::Float(_) => "Float",
            Self::Double(_) => "Double",
            Self::String(_) => "String",
            Self::ByteString(_) => "ByteString",
        }
    }
}

/// Value plus status, the unit exchanged through data sources.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataValue {
    pub value: Option<Variant>,
    pub status: Option<StatusCode>,
    pub source_timestamp: Option<DateTime<Utc>>,
}

impl DataValue {
    pub fn new(value: Variant) -> Self {
        Self {
            value: Some(value),
            status: None,
            source_timestamp: Some(Utc::now()),
        }
    }

    /// A data value that carries only a status and no payload.
    pub fn from_status(status: StatusCode) -> Self {
        Self {
            value: None,
            status: Some(status),
            source_timestamp: None,
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    /// Effective status; a missing status means good.
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::Good)
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }
}

/// Subset of OPC UA status codes the gateway produces or consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StatusCode {
    Good = 0x0000_0000,
    Bad = 0x8000_0000,
    BadInternalError = 0x8002_0000,
    BadCommunicationError = 0x8005_0000,
    BadDataTypeIdUnknown = 0x8011_0000,
    BadNoCommunication = 0x8031_0000,
    BadNodeIdUnknown = 0x8034_0000,
    BadNotReadable = 0x803A_0000,
    BadNotWritable = 0x803B_0000,
    BadParentNodeIdInvalid = 0x805B_0000,
    BadNodeIdExists = 0x805E_0000,
    BadTypeMismatch = 0x8074_0000,
    BadConfigurationError = 0x8089_0000,
    BadDeviceFailure = 0x808B_0000,
}

impl StatusCode {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn is_good(self) -> bool {
        self.code() & 0xC000_0000 == 0
    }

    pub fn is_bad(self) -> bool {
        self.code() & 0x8000_0000 != 0
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Good => "Good",
            Self::Bad => "Bad",
            Self::BadInternalError => "BadInternalError",
            Self::BadCommunicationError => "BadCommunicationError",
            Self::BadDataTypeIdUnknown => "BadDataTypeIdUnknown",
            Self::BadNoCommunication => "BadNoCommunication",
            Self::BadNodeIdUnknown => "BadNodeIdUnknown",
            Self::BadNotReadable => "BadNotReadable",
            Self::BadNotWritable => "BadNotWritable",
            Self::BadParentNodeIdInvalid => "BadParentNodeIdInvalid",
            Self::BadNodeIdExists => "BadNodeIdExists",
            Self::BadTypeMismatch => "BadTypeMismatch",
            Self::BadConfigurationError => "BadConfigurationError",
            Self::BadDeviceFailure => "BadDeviceFailure",
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (0x{:08X})", self.name(), self.code())
    }
}

/// Declared data type of a variable node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Double,
    String,
    /// Generic base type; clients fall back to the value's own type.
    BaseDataType,
}

impl DataType {
    /// Standard namespace-0 node id of the type.
    pub fn node_id(self) -> NodeId {
        let id = match self {
            Self::Boolean => 1,
            Self::Double => 11,
            Self::String => 12,
            Self::BaseDataType => 24,
        };
        NodeId::numeric(0, id)
    }
}

/// Access level mask of a variable node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessLevel(u8);

impl AccessLevel {
    pub const READ: AccessLevel = AccessLevel(0x01);
    pub const WRITE: AccessLevel = AccessLevel(0x02);
    pub const READ_WRITE: AccessLevel = AccessLevel(0x03);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn can_read(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub fn can_write(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }
}

impl std::ops::BitOr for AccessLevel {
    type Output = AccessLevel;

    fn bitor(self, rhs: Self) -> Self::Output {
        AccessLevel(self.0 | rhs.0)
    }
}

/// Attributes of a variable node at creation time.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableAttributes {
    pub browse_name: String,
    pub display_name: String,
    pub data_type: DataType,
    pub access_level: AccessLevel,
}

/// Callback pair a runtime invokes for reads and writes of a variable node.
///
/// Runtimes call these from their own threads, possibly concurrently.
pub trait DataSource: Send + Sync {
    fn read(&self, node_id: &NodeId) -> DataValue;

    fn write(&self, node_id: &NodeId, value: &DataValue) -> StatusCode;
}

/// Node storage of a protocol-server runtime.
pub trait AddressSpace: Send + Sync {
    /// Find the child of `parent` with the given browse name.
    fn browse(&self, parent: &NodeId, browse_name: &str) -> Option<NodeId>;

    fn contains(&self, node_id: &NodeId) -> bool;

    fn add_object_node(
        &self,
        node_id: NodeId,
        parent: &NodeId,
        browse_name: &str,
        display_name: &str,
    ) -> Result<NodeId, StatusCode>;

    fn add_variable_node(
        &self,
        node_id: NodeId,
        parent: &NodeId,
        attributes: VariableAttributes,
        data_source: Arc<dyn DataSource>,
    ) -> Result<NodeId, StatusCode>;

    /// Replace the declared data type and access level of an existing variable node.
    fn set_variable_attributes(
        &self,
        node_id: &NodeId,
        data_type: DataType,
        access_level: AccessLevel,
    ) -> Result<(), StatusCode>;

    fn node_count(&self) -> usize;
}

/// A protocol-server runtime: address space plus serving loop.
pub trait ServerRuntime: AddressSpace {
    /// Apply endpoint, security and access-control settings. Called once before `run`.
    fn configure(&self, settings: &ServerSettings) -> Result<(), ServerError>;

    /// Serve until `running` is cleared. A non-good return is a fatal runtime failure.
    fn run(&self, running: &AtomicBool) -> StatusCode;
}

/// Default port of the OPC UA endpoint.
pub const DEFAULT_SERVER_PORT: u16 = 4840;

/// Protocol-server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Local address to bind. Empty listens on every interface.
    #[serde(default, rename = "host")]
    pub bind_host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,

    #[serde(default = "default_application_uri")]
    pub application_uri: String,

    #[serde(default = "default_product_uri")]
    pub product_uri: String,

    #[serde(default = "default_application_name")]
    pub application_name: String,

    /// Certificate store of the endpoint.
    #[serde(default = "default_pki_dir")]
    pub pki_dir: PathBuf,
}

fn default_server_port() -> u16 {
    DEFAULT_SERVER_PORT
}

fn default_application_uri() -> String {
    "urn:wb-mqtt-opcua.server.application".to_string()
}

fn default_product_uri() -> String {
    "https://wirenboard.com".to_string()
}

fn default_application_name() -> String {
    "Wiren Board MQTT to OPC UA gateway".to_string()
}

fn default_pki_dir() -> PathBuf {
    std::env::temp_dir().join("wb-mqtt-opcua").join("pki")
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_host: String::new(),
            port: default_server_port(),
            application_uri: default_application_uri(),
            product_uri: default_product_uri(),
            application_name: default_application_name(),
            pki_dir: default_pki_dir(),
        }
    }
}

impl ServerSettings {
    pub fn endpoint_url(&self) -> String {
        let host = if self.bind_host.is_empty() {
            "0.0.0.0"
        } else {
            &self.bind_host
        };
        format!("opc.tcp://{}:{}", host, self.port)
    }
}

/// Error type for runtime setup and lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Runtime rejected its settings
    #[error("Server configuration failed: {0}")]
    Configuration(String),

    /// Address-space node creation failed
    #[error("Node '{node}' creation failed: {status}")]
    NodeCreation { node: String, status: StatusCode },

    #[error("Server is already running")]
    AlreadyRunning,

    #[error("Server thread failed: {0}")]
    Thread(String),

    /// Serving loop did not exit within the grace period
    #[error("Server did not stop within {0}ms")]
    ShutdownTimeout(u64),
}

/// Log categories a runtime reports under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    Network,
    Channel,
    Session,
    Server,
    Client,
    Userland,
    SecurityPolicy,
}

impl LogCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Channel => "channel",
            Self::Session => "session",
            Self::Server => "server",
            Self::Client => "client",
            Self::Userland => "userland",
            Self::SecurityPolicy => "securitypolicy",
        }
    }
}

/// Forward a runtime log line into `tracing` under the `opcua` target.
pub fn runtime_log(level: tracing::Level, category: LogCategory, message: &str) {
    let category = category.as_str();
    match level {
        tracing::Level::TRACE | tracing::Level::DEBUG => {
            tracing::debug!(target: "opcua", category, "{}", message)
        }
        tracing::Level::INFO => tracing::info!(target: "opcua", category, "{}", message),
        tracing::Level::WARN => tracing::warn!(target: "opcua", category, "{}", message),
        tracing::Level::ERROR => tracing::error!(target: "opcua", category, "{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_display() {
        assert_eq!(NodeId::objects_folder().to_string(), "ns=0;i=85");
        assert_eq!(NodeId::string(1, "test/test").to_string(), "ns=1;s=test/test");
        assert_eq!(NodeId::string(1, "a/b").as_str(), Some("a/b"));
        assert_eq!(NodeId::numeric(0, 1).as_str(), None);
    }

    #[test]
    fn test_status_code_classes() {
        assert!(StatusCode::Good.is_good());
        assert!(!StatusCode::Good.is_bad());
        assert!(StatusCode::BadDeviceFailure.is_bad());
        assert!(StatusCode::BadNoCommunication.is_bad());
        assert_eq!(StatusCode::BadDataTypeIdUnknown.code(), 0x8011_0000);
        assert!(StatusCode::BadDeviceFailure.to_string().contains("BadDeviceFailure"));
    }

    #[test]
    fn test_access_level() {
        assert!(AccessLevel::READ.can_read());
        assert!(!AccessLevel::READ.can_write());
        assert_eq!(AccessLevel::READ | AccessLevel::WRITE, AccessLevel::READ_WRITE);
        assert!(AccessLevel::READ_WRITE.can_write());
    }

    #[test]
    fn test_data_value_status() {
        assert_eq!(DataValue::new(Variant::Double(1.0)).status(), StatusCode::Good);
        let missing = DataValue::from_status(StatusCode::BadNoCommunication);
        assert!(!missing.has_value());
        assert_eq!(missing.status(), StatusCode::BadNoCommunication);
    }

    #[test]
    fn test_server_settings_defaults() {
        let settings: ServerSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.port, DEFAULT_SERVER_PORT);
        assert_eq!(settings.endpoint_url(), "opc.tcp://0.0.0.0:4840");

        let settings: ServerSettings =
            serde_json::from_str(r#"{"host": "192.168.1.10", "port": 4841}"#).unwrap();
        assert_eq!(settings.endpoint_url(), "opc.tcp://192.168.1.10:4841");
    }
}
