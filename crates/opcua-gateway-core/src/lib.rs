//! Core types and collaborator interfaces for the MQTT to OPC UA gateway.
//!
//! This crate holds the vocabulary shared by every other gateway crate:
//! - **Bus collaborator**: traits for the MQTT device driver (`DeviceDriver`, `Control`, ...)
//!   and the value-change event channel.
//! - **Address space**: node identifiers, variants, status codes and the
//!   traits a protocol-server runtime implements (`AddressSpace`, `ServerRuntime`).
//! - **Configuration**: the JSON configuration model, loader and generator.
//!
//! Nothing in here talks to a network. Transports live in `opcua-gateway-devices`
//! and `opcua-gateway-server`.

pub mod address_space;
pub mod bus;
pub mod config;
pub mod key;
pub mod value;

pub use address_space::{
    AccessLevel, AddressSpace, DataSource, DataType, DataValue, Identifier, LogCategory, NodeId,
    ServerError, ServerRuntime, ServerSettings, StatusCode, VariableAttributes, Variant,
    runtime_log,
};
pub use bus::{
    BusError, BusResult, Control, ControlEventBus, ControlEventReceiver, ControlHandle,
    ControlValueEvent, Device, DeviceDriver, DeviceFilter, DeviceHandle, DriverTx,
};
pub use config::{ConfigError, GatewayConfig, MqttSettings, SyncMode};
pub use key::NodeKey;
pub use value::{ControlValue, ValueKind};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name used for logging, MQTT client ids and the server description.
pub const APP_NAME: &str = "wb-mqtt-opcua";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
