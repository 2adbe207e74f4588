//! In-process device driver.
//!
//! Devices and controls are created programmatically. Publishing a value
//! updates the control and emits a value event, the same way a broker
//! round-trip would. Writes are confirmed immediately.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use opcua_gateway_core::bus::{
    BusError, BusResult, Control, ControlEventBus, ControlEventReceiver, ControlHandle,
    ControlValueEvent, Device, DeviceDriver, DeviceFilter, DeviceHandle, DriverTx,
};
use opcua_gateway_core::value::{ControlValue, ValueKind};

struct Shared {
    events: ControlEventBus,
    filter: RwLock<DeviceFilter>,
}

impl Shared {
    fn emit(&self, control: ControlHandle, raw: &str) {
        if self.filter.read().matches(control.device_id()) {
            self.events.publish(ControlValueEvent::new(control, raw));
        }
    }
}

#[derive(Debug, Default)]
struct ControlState {
    raw: String,
    error: String,
}

/// Control held by a [`MemoryDriver`].
pub struct MemoryControl {
    device_id: String,
    id: String,
    control_type: String,
    readonly: bool,
    state: Mutex<ControlState>,
    fail_writes: AtomicBool,
    shared: Arc<Shared>,
    this: std::sync::Weak<MemoryControl>,
}

impl MemoryControl {
    /// Set the raw value and emit a value event.
    pub fn publish(&self, raw: impl Into<String>) {
        let raw = raw.into();
        self.state.lock().raw = raw.clone();
        if let Some(this) = self.this.upgrade() {
            self.shared.emit(this, &raw);
        }
    }

    /// Set the `meta/error` flags.
    pub fn set_error(&self, error: impl Into<String>) {
        self.state.lock().error = error.into();
    }

    /// Make subsequent writes fail with a communication error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl Control for MemoryControl {
    fn id(&self) -> &str {
        &self.id
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn control_type(&self) -> String {
        self.control_type.clone()
    }

    fn value(&self) -> BusResult<ControlValue> {
        let raw = self.state.lock().raw.clone();
        ControlValue::parse(&raw, ValueKind::from_control_type(&self.control_type))
    }

    fn raw_value(&self) -> String {
        self.state.lock().raw.clone()
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn error(&self) -> String {
        self.state.lock().error.clone()
    }

    fn set_value(&self, value: &ControlValue) -> BusResult<()> {
        if self.readonly {
            return Err(BusError::ReadOnly(format!("{}/{}", self.device_id, self.id)));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BusError::Communication(format!(
                "write to {}/{} rejected",
                self.device_id, self.id
            )));
        }
        self.publish(value.to_raw());
        Ok(())
    }
}

/// Device held by a [`MemoryDriver`].
pub struct MemoryDevice {
    id: String,
    controls: RwLock<BTreeMap<String, Arc<MemoryControl>>>,
}

impl MemoryDevice {
    pub fn memory_control(&self, id: &str) -> Option<Arc<MemoryControl>> {
        self.controls.read().get(id).cloned()
    }
}

impl Device for MemoryDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn control(&self, id: &str) -> Option<ControlHandle> {
        self.memory_control(id).map(|c| c as ControlHandle)
    }

    fn controls(&self) -> Vec<ControlHandle> {
        self.controls
            .read()
            .values()
            .map(|c| c.clone() as ControlHandle)
            .collect()
    }
}

/// In-process [`DeviceDriver`].
pub struct MemoryDriver {
    devices: RwLock<BTreeMap<String, Arc<MemoryDevice>>>,
    shared: Arc<Shared>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(BTreeMap::new()),
            shared: Arc::new(Shared {
                events: ControlEventBus::new(),
                filter: RwLock::new(DeviceFilter::All),
            }),
        }
    }

    /// Get or create a device.
    pub fn create_device(&self, id: impl Into<String>) -> Arc<MemoryDevice> {
        let id = id.into();
        self.devices
            .write()
            .entry(id.clone())
            .or_insert_with(|| {
                Arc::new(MemoryDevice {
                    id,
                    controls: RwLock::new(BTreeMap::new()),
                })
            })
            .clone()
    }

    /// Get or create a control. The device is created on demand.
    pub fn create_control(
        &self,
        device_id: &str,
        control_id: &str,
        control_type: &str,
        readonly: bool,
    ) -> Arc<MemoryControl> {
        let device = self.create_device(device_id);
        let mut controls = device.controls.write();
        controls
            .entry(control_id.to_string())
            .or_insert_with(|| {
                Arc::new_cyclic(|this| MemoryControl {
                    device_id: device_id.to_string(),
                    id: control_id.to_string(),
                    control_type: control_type.to_string(),
                    readonly,
                    state: Mutex::new(ControlState::default()),
                    fail_writes: AtomicBool::new(false),
                    shared: self.shared.clone(),
                    this: this.clone(),
                })
            })
            .clone()
    }

    pub fn control(&self, device_id: &str, control_id: &str) -> Option<Arc<MemoryControl>> {
        self.devices.read().get(device_id)?.memory_control(control_id)
    }

    /// Publish a raw value for an existing control.
    pub fn publish_value(
        &self,
        device_id: &str,
        control_id: &str,
        raw: &str,
    ) -> Option<Arc<MemoryControl>> {
        let control = self.control(device_id, control_id)?;
        control.publish(raw);
        Some(control)
    }

    pub fn filter(&self) -> DeviceFilter {
        self.shared.filter.read().clone()
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryTx<'a> {
    driver: &'a MemoryDriver,
}

impl DriverTx for MemoryTx<'_> {
    fn device(&self, id: &str) -> Option<DeviceHandle> {
        self.driver
            .devices
            .read()
            .get(id)
            .map(|d| d.clone() as DeviceHandle)
    }

    fn devices(&self) -> Vec<DeviceHandle> {
        self.driver
            .devices
            .read()
            .values()
            .map(|d| d.clone() as DeviceHandle)
            .collect()
    }
}

impl DeviceDriver for MemoryDriver {
    fn set_filter(&self, filter: DeviceFilter) -> BusResult<()> {
        tracing::debug!(?filter, "Memory driver filter updated");
        *self.shared.filter.write() = filter;
        Ok(())
    }

    fn wait_for_ready(&self, _timeout: Duration) -> BusResult<()> {
        Ok(())
    }

    fn begin_tx(&self) -> Box<dyn DriverTx + '_> {
        Box::new(MemoryTx { driver: self })
    }

    fn subscribe(&self) -> ControlEventReceiver {
        self.shared.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opcua_gateway_core::key::NodeKey;

    #[test]
    fn test_create_is_idempotent() {
        let driver = MemoryDriver::new();
        let a = driver.create_control("dev", "ctrl", "value", false);
        let b = driver.create_control("dev", "ctrl", "switch", true);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.control_type(), "value");
    }

    #[test]
    fn test_tx_lookup() {
        let driver = MemoryDriver::new();
        driver.create_control("dev", "ctrl", "value", false);

        let tx = driver.begin_tx();
        assert_eq!(tx.devices().len(), 1);
        assert!(tx.device("missing").is_none());
        let key = NodeKey::parse("dev/ctrl").unwrap();
        assert_eq!(tx.control(&key).unwrap().id(), "ctrl");
    }

    #[test]
    fn test_value_typing() {
        let driver = MemoryDriver::new();
        let switch = driver.create_control("dev", "relay", "switch", false);
        switch.publish("1");
        assert_eq!(switch.value().unwrap(), ControlValue::Boolean(true));

        let text = driver.create_control("dev", "label", "text", true);
        text.publish("hello");
        assert_eq!(text.value().unwrap(), ControlValue::Text("hello".to_string()));

        let number = driver.create_control("dev", "temp", "temperature", true);
        assert!(number.value().is_err());
    }

    #[test]
    fn test_set_value() {
        let driver = MemoryDriver::new();
        let writable = driver.create_control("dev", "level", "range", false);
        writable.set_value(&ControlValue::Number(3.5)).unwrap();
        assert_eq!(writable.raw_value(), "3.5");

        writable.fail_writes(true);
        assert!(matches!(
            writable.set_value(&ControlValue::Number(1.0)),
            Err(BusError::Communication(_))
        ));
        assert_eq!(writable.raw_value(), "3.5");

        let readonly = driver.create_control("dev", "temp", "temperature", true);
        assert!(matches!(
            readonly.set_value(&ControlValue::Number(1.0)),
            Err(BusError::ReadOnly(_))
        ));
    }

    #[tokio::test]
    async fn test_events_respect_filter() {
        let driver = MemoryDriver::new();
        driver.create_control("a", "x", "value", false);
        driver.create_control("b", "y", "value", false);
        driver
            .set_filter(DeviceFilter::devices(["a"]))
            .unwrap();

        let mut rx = driver.subscribe();
        driver.publish_value("b", "y", "2");
        driver.publish_value("a", "x", "1");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.device_id(), "a");
        assert_eq!(event.raw_value, "1");
        assert!(rx.try_recv().is_none());
    }
}
