//! Bus collaborator implementations for the gateway.
//!
//! ## Features
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `mqtt` | ✅ | Wiren Board MQTT conventions over rumqttc |
//!
//! - **MemoryDriver**: in-process device catalog, used by tests and embedders
//! - **MqttDriver**: broker-backed driver following `/devices/<device>/controls/<control>`

pub mod memory;

#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use memory::{MemoryControl, MemoryDevice, MemoryDriver};

#[cfg(feature = "mqtt")]
pub use mqtt::{MqttControl, MqttDriver, MqttTopic};
