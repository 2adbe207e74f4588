//! Node synchronization engine.
//!
//! Keeps a protocol-server address space in step with the MQTT device bus:
//!
//! ```text
//! ControlValueEvent ──▶ SyncEngine::handle_value_event ──▶ NodeMaterializer ──▶ AddressSpace
//!                                    │                              │
//!                                    └──────────── NodeRegistry ◀───┘
//!                                                       ▲
//! protocol runtime threads ──▶ EngineRef (DataSource) ──┘ read / write
//! ```
//!
//! [`Gateway`] wires the engine, the bus driver and a `ServerRuntime`
//! together and owns the serving thread.

pub mod coercion;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod materializer;
pub mod registry;

pub use coercion::{decode, declare_type, encode};
pub use engine::{EngineRef, EventOutcome, SyncEngine};
pub use error::{CoercionError, GatewayError, Result};
pub use lifecycle::{
    DEFAULT_STOP_TIMEOUT, DRIVER_INIT_TIMEOUT, FatalHook, Gateway, GatewayState,
};
pub use materializer::{LeafOutcome, NodeMaterializer};
pub use registry::{NodeEntry, NodeRegistry};
