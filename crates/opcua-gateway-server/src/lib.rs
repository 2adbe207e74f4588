//! Protocol-server runtimes for the gateway.
//!
//! The gateway talks to its server through the `AddressSpace` and
//! `ServerRuntime` traits from `opcua-gateway-core`. This crate provides
//! [`MemoryServer`], an in-process runtime that keeps the address space in
//! memory and exposes the client-side read and write services directly, and
//! with the default `opcua` feature [`UaServer`], which serves the address
//! space over opc.tcp through async-opcua.

pub mod memory;
#[cfg(feature = "opcua")]
pub mod ua;

pub use memory::{MemoryServer, NodeClass, NodeInfo};
#[cfg(feature = "opcua")]
pub use ua::UaServer;

/// Interval at which the serving loop checks its run flag.
pub const SERVE_TICK: std::time::Duration = std::time::Duration::from_millis(50);
