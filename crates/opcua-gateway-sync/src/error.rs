//! Error types for the synchronization engine and gateway lifecycle.

use thiserror::Error;

use opcua_gateway_core::address_space::ServerError;
use opcua_gateway_core::bus::BusError;
use opcua_gateway_core::config::ConfigError;

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// A protocol scalar could not be turned into a control value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoercionError {
    #[error("Unknown data type: {0}")]
    UnknownDataType(&'static str),

    #[error("Data value carries no payload")]
    Empty,
}

/// Gateway startup and shutdown errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Bus driver failed to initialize
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// Runtime setup, provisioning or shutdown failed
    #[error(transparent)]
    Server(#[from] ServerError),

    /// Operation is not allowed in the current lifecycle state
    #[error("Invalid gateway state: {0}")]
    InvalidState(String),

    /// `start` was called outside a tokio runtime
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),
}
