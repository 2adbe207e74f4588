//! Bus collaborator interface.
//!
//! The gateway never talks to MQTT directly. It consumes a device driver that
//! exposes devices and their controls, a transactional view for lookups, and a
//! broadcast channel of value-change events.
//!
//! ```text
//! DeviceDriver ──begin_tx()──▶ DriverTx ──device()──▶ Device ──control()──▶ Control
//!      │
//!      └──subscribe()──▶ ControlEventReceiver  (ControlValueEvent { control, raw_value })
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;

use crate::key::NodeKey;
use crate::value::ControlValue;

/// Default channel capacity for control value events.
pub const DEFAULT_EVENT_CAPACITY: usize = 1000;

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Error type for bus collaborator operations.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    /// Device or control is unknown to the driver
    #[error("Control not found: {0}")]
    NotFound(String),

    /// Attempt to set a read-only control
    #[error("Control is read only: {0}")]
    ReadOnly(String),

    /// Confirmation did not arrive in time
    #[error("Operation timeout after {0}ms")]
    Timeout(u64),

    /// Transport failure
    #[error("Communication error: {0}")]
    Communication(String),

    /// Value cannot be interpreted for the control's type
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Driver has not finished its initial synchronization
    #[error("Driver is not ready: {0}")]
    NotReady(String),

    /// Driver connection is closed
    #[error("Driver is disconnected")]
    Disconnected,
}

/// A single published attribute, `/devices/<device>/controls/<control>`.
pub trait Control: Send + Sync {
    fn id(&self) -> &str;

    fn device_id(&self) -> &str;

    /// Meta type, e.g. `switch`, `value`, `text`.
    fn control_type(&self) -> String;

    /// Current value interpreted according to the control type.
    fn value(&self) -> BusResult<ControlValue>;

    /// Current value exactly as published.
    fn raw_value(&self) -> String;

    fn is_readonly(&self) -> bool;

    /// Error flags published in `meta/error`. Empty when healthy.
    fn error(&self) -> String;

    /// Publish a new value and block until the bus layer confirms it or times out.
    fn set_value(&self, value: &ControlValue) -> BusResult<()>;

    /// `device/control` identity of this control.
    fn key(&self) -> Option<NodeKey> {
        NodeKey::new(self.device_id(), self.id())
    }

    /// True if the error flags contain the read-failure marker `r`.
    fn has_read_error(&self) -> bool {
        self.error().contains('r')
    }
}

/// Shared handle to a control owned by the driver.
pub type ControlHandle = Arc<dyn Control>;

/// A device groups controls under one id.
pub trait Device: Send + Sync {
    fn id(&self) -> &str;

    fn control(&self, id: &str) -> Option<ControlHandle>;

    fn controls(&self) -> Vec<ControlHandle>;
}

/// Shared handle to a device owned by the driver.
pub type DeviceHandle = Arc<dyn Device>;

/// Consistent view of the driver's catalog.
pub trait DriverTx {
    fn device(&self, id: &str) -> Option<DeviceHandle>;

    fn devices(&self) -> Vec<DeviceHandle>;

    /// Resolve a `device/control` key in one step.
    fn control(&self, key: &NodeKey) -> Option<ControlHandle> {
        self.device(key.device_id())?.control(key.control_id())
    }
}

/// Which devices the driver should track.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceFilter {
    #[default]
    All,
    Devices(BTreeSet<String>),
}

impl DeviceFilter {
    pub fn devices<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Devices(ids.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, device_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Devices(ids) => ids.contains(device_id),
        }
    }
}

/// The device driver a gateway runs against.
pub trait DeviceDriver: Send + Sync {
    /// Restrict the tracked devices.
    fn set_filter(&self, filter: DeviceFilter) -> BusResult<()>;

    /// Block until the initial catalog is synchronized or `timeout` elapses.
    fn wait_for_ready(&self, timeout: Duration) -> BusResult<()>;

    fn begin_tx(&self) -> Box<dyn DriverTx + '_>;

    /// Subscribe to value-change events for tracked devices.
    fn subscribe(&self) -> ControlEventReceiver;
}

/// A control published a value.
#[derive(Clone)]
pub struct ControlValueEvent {
    pub control: ControlHandle,
    /// Payload as received. Empty means the value is unset.
    pub raw_value: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
}

impl ControlValueEvent {
    pub fn new(control: ControlHandle, raw_value: impl Into<String>) -> Self {
        Self {
            control,
            raw_value: raw_value.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn device_id(&self) -> &str {
        self.control.device_id()
    }

    pub fn is_empty(&self) -> bool {
        self.raw_value.is_empty()
    }
}

impl std::fmt::Debug for ControlValueEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlValueEvent")
            .field("device", &self.control.device_id())
            .field("control", &self.control.id())
            .field("raw_value", &self.raw_value)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Broadcast channel drivers use to publish value events.
#[derive(Clone)]
pub struct ControlEventBus {
    tx: broadcast::Sender<ControlValueEvent>,
}

impl ControlEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Returns `true` if at least one subscriber received it.
    pub fn publish(&self, event: ControlValueEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn subscribe(&self) -> ControlEventReceiver {
        ControlEventReceiver {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ControlEventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a [`ControlEventBus`].
pub struct ControlEventReceiver {
    rx: broadcast::Receiver<ControlValueEvent>,
}

impl ControlEventReceiver {
    /// Receive the next event. Returns `None` once the bus is closed.
    ///
    /// A lagging receiver skips the dropped events and keeps going.
    pub async fn recv(&mut self) -> Option<ControlValueEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Control event receiver lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<ControlValueEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
