//! MQTT device driver following the Wiren Board conventions.
//!
//! Topic layout (with an optional prefix in front):
//!
//! ```text
//! /devices/<device>/controls/<control>              current value (retained)
//! /devices/<device>/controls/<control>/meta/type    control type
//! /devices/<device>/controls/<control>/meta/readonly
//! /devices/<device>/controls/<control>/meta/error   error flags, `r` = read failure
//! /devices/<device>/controls/<control>/on           write request
//! ```
//!
//! The rumqttc connection is driven on a dedicated thread. Retained messages
//! build the device catalog; the driver is ready once every subscription is
//! acknowledged and the retained burst has gone quiet.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use rumqttc::{Client, Connection, Event, MqttOptions, Outgoing, Packet, QoS};

use opcua_gateway_core::bus::{
    BusError, BusResult, Control, ControlEventBus, ControlEventReceiver, ControlHandle,
    ControlValueEvent, Device, DeviceDriver, DeviceFilter, DeviceHandle, DriverTx,
};
use opcua_gateway_core::config::MqttSettings;
use opcua_gateway_core::value::{ControlValue, ValueKind};

/// How long the retained burst must be silent before the driver counts as ready.
const QUIET_PERIOD: Duration = Duration::from_millis(200);

/// Default time to wait for a write to be echoed back.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// A topic of the device tree, with the prefix removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttTopic {
    Value { device: String, control: String },
    Meta { device: String, control: String, field: String },
    On { device: String, control: String },
}

impl MqttTopic {
    /// Parse `topic` relative to `prefix`. Returns `None` for topics outside the device tree.
    pub fn parse(prefix: &str, topic: &str) -> Option<Self> {
        let rest = topic.strip_prefix(prefix)?.strip_prefix("/devices/")?;
        let mut parts = rest.split('/');
        let device = parts.next().filter(|s| !s.is_empty())?.to_string();
        if parts.next()? != "controls" {
            return None;
        }
        let control = parts.next().filter(|s| !s.is_empty())?.to_string();

        let topic = match (parts.next(), parts.next(), parts.next()) {
            (None, _, _) => Self::Value { device, control },
            (Some("on"), None, _) => Self::On { device, control },
            (Some("meta"), Some(field), None) if !field.is_empty() => Self::Meta {
                device,
                control,
                field: field.to_string(),
            },
            _ => return None,
        };
        Some(topic)
    }

    pub fn device(&self) -> &str {
        match self {
            Self::Value { device, .. } | Self::Meta { device, .. } | Self::On { device, .. } => {
                device
            }
        }
    }

    pub fn control(&self) -> &str {
        match self {
            Self::Value { control, .. }
            | Self::Meta { control, .. }
            | Self::On { control, .. } => control,
        }
    }
}

fn control_topic(prefix: &str, device: &str, control: &str) -> String {
    format!("{}/devices/{}/controls/{}", prefix, device, control)
}

/// Subscriptions needed to track devices matching `filter`.
fn subscription_topics(prefix: &str, filter: &DeviceFilter) -> Vec<String> {
    let devices: Vec<&str> = match filter {
        DeviceFilter::All => vec!["+"],
        DeviceFilter::Devices(ids) => ids.iter().map(String::as_str).collect(),
    };
    devices
        .into_iter()
        .flat_map(|device| {
            let base = control_topic(prefix, device, "+");
            [base.clone(), format!("{}/meta/+", base)]
        })
        .collect()
}

#[derive(Debug, Default)]
struct ControlState {
    raw: String,
    control_type: String,
    readonly: bool,
    error: String,
    /// `meta/type` has arrived.
    typed: bool,
    /// A value arrived before the type and has not been announced.
    held: bool,
}

impl ControlState {
    /// Store a value. Returns the payload to announce, or `None` until the type is known.
    fn set_value(&mut self, raw: String) -> Option<String> {
        self.raw = raw;
        if self.typed {
            Some(self.raw.clone())
        } else {
            self.held = true;
            None
        }
    }

    /// Store the control type. Returns a held value that can be announced now.
    fn set_type(&mut self, control_type: String) -> Option<String> {
        self.control_type = control_type;
        self.typed = true;
        std::mem::take(&mut self.held).then(|| self.raw.clone())
    }
}

/// Control tracked by an [`MqttDriver`].
pub struct MqttControl {
    device_id: String,
    id: String,
    topic: String,
    client: Client,
    write_timeout: Duration,
    state: Mutex<ControlState>,
    changed: Condvar,
}

impl MqttControl {
    fn update<T>(&self, apply: impl FnOnce(&mut ControlState) -> T) -> T {
        let mut state = self.state.lock();
        let result = apply(&mut state);
        self.changed.notify_all();
        result
    }

    fn is_typed(&self) -> bool {
        self.state.lock().typed
    }
}

impl Control for MqttControl {
    fn id(&self) -> &str {
        &self.id
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn control_type(&self) -> String {
        self.state.lock().control_type.clone()
    }

    fn value(&self) -> BusResult<ControlValue> {
        let state = self.state.lock();
        ControlValue::parse(&state.raw, ValueKind::from_control_type(&state.control_type))
    }

    fn raw_value(&self) -> String {
        self.state.lock().raw.clone()
    }

    fn is_readonly(&self) -> bool {
        self.state.lock().readonly
    }

    fn error(&self) -> String {
        self.state.lock().error.clone()
    }

    fn set_value(&self, value: &ControlValue) -> BusResult<()> {
        if self.is_readonly() {
            return Err(BusError::ReadOnly(format!("{}/{}", self.device_id, self.id)));
        }

        self.client
            .publish(
                format!("{}/on", self.topic),
                QoS::AtLeastOnce,
                false,
                value.to_raw(),
            )
            .map_err(|e| BusError::Communication(e.to_string()))?;

        let deadline = Instant::now() + self.write_timeout;
        let mut state = self.state.lock();
        while !value.matches_raw(&state.raw) {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(topic = %self.topic, value = %value, "Write was not confirmed");
                return Err(BusError::Timeout(self.write_timeout.as_millis() as u64));
            }
            self.changed.wait_for(&mut state, deadline - now);
        }
        Ok(())
    }
}

struct MqttDevice {
    id: String,
    controls: RwLock<BTreeMap<String, Arc<MqttControl>>>,
}

impl Device for MqttDevice {
    fn id(&self) -> &str {
        &self.id
    }

    // Controls stay hidden until their type is known.
    fn control(&self, id: &str) -> Option<ControlHandle> {
        self.controls
            .read()
            .get(id)
            .filter(|c| c.is_typed())
            .map(|c| c.clone() as ControlHandle)
    }

    fn controls(&self) -> Vec<ControlHandle> {
        self.controls
            .read()
            .values()
            .filter(|c| c.is_typed())
            .map(|c| c.clone() as ControlHandle)
            .collect()
    }
}

#[derive(Debug)]
struct ReadyState {
    connected: bool,
    subscribed: bool,
    pending_subacks: usize,
    last_activity: Instant,
}

struct Shared {
    prefix: String,
    client: Client,
    write_timeout: Duration,
    running: AtomicBool,
    filter: RwLock<DeviceFilter>,
    devices: RwLock<BTreeMap<String, Arc<MqttDevice>>>,
    events: ControlEventBus,
    ready: Mutex<ReadyState>,
    ready_changed: Condvar,
}

impl Shared {
    fn subscribe_filter(&self) -> BusResult<()> {
        let topics = subscription_topics(&self.prefix, &self.filter.read());
        let mut ready = self.ready.lock();
        for topic in topics {
            self.client
                .try_subscribe(topic.as_str(), QoS::AtLeastOnce)
                .map_err(|e| BusError::Communication(e.to_string()))?;
            ready.pending_subacks += 1;
            tracing::debug!(%topic, "Subscribed");
        }
        ready.subscribed = true;
        ready.last_activity = Instant::now();
        Ok(())
    }

    fn control_entry(&self, device_id: &str, control_id: &str) -> Arc<MqttControl> {
        let device = self
            .devices
            .write()
            .entry(device_id.to_string())
            .or_insert_with(|| {
                Arc::new(MqttDevice {
                    id: device_id.to_string(),
                    controls: RwLock::new(BTreeMap::new()),
                })
            })
            .clone();

        let mut controls = device.controls.write();
        controls
            .entry(control_id.to_string())
            .or_insert_with(|| {
                Arc::new(MqttControl {
                    device_id: device_id.to_string(),
                    id: control_id.to_string(),
                    topic: control_topic(&self.prefix, device_id, control_id),
                    client: self.client.clone(),
                    write_timeout: self.write_timeout,
                    state: Mutex::new(ControlState::default()),
                    changed: Condvar::new(),
                })
            })
            .clone()
    }

    fn handle_publish(&self, topic: &str, payload: &[u8]) {
        self.touch();

        let Some(parsed) = MqttTopic::parse(&self.prefix, topic) else {
            return;
        };
        if !self.filter.read().matches(parsed.device()) {
            return;
        }
        let payload = String::from_utf8_lossy(payload).into_owned();

        let announce = match parsed {
            MqttTopic::Value { device, control } => {
                let entry = self.control_entry(&device, &control);
                let raw = entry.update(|s| s.set_value(payload));
                raw.map(|raw| (entry, raw))
            }
            MqttTopic::Meta { device, control, field } => {
                let entry = self.control_entry(&device, &control);
                let raw = match field.as_str() {
                    "type" => entry.update(|s| s.set_type(payload)),
                    "readonly" => entry.update(|s| {
                        s.readonly = payload.trim() == "1";
                        None
                    }),
                    "error" => entry.update(|s| {
                        s.error = payload;
                        None
                    }),
                    _ => None,
                };
                raw.map(|raw| (entry, raw))
            }
            MqttTopic::On { .. } => None,
        };

        if let Some((entry, raw)) = announce {
            self.events
                .publish(ControlValueEvent::new(entry as ControlHandle, raw));
        }
    }

    fn touch(&self) {
        self.ready.lock().last_activity = Instant::now();
        self.ready_changed.notify_all();
    }

    fn set_connected(&self, connected: bool) {
        let mut ready = self.ready.lock();
        ready.connected = connected;
        if !connected {
            ready.pending_subacks = 0;
            ready.subscribed = false;
        }
        self.ready_changed.notify_all();
    }

    fn suback(&self) {
        let mut ready = self.ready.lock();
        ready.pending_subacks = ready.pending_subacks.saturating_sub(1);
        ready.last_activity = Instant::now();
        self.ready_changed.notify_all();
    }
}

fn run_connection(shared: Arc<Shared>, mut connection: Connection) {
    for notification in connection.iter() {
        match notification {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!("Connected to MQTT broker");
                shared.set_connected(true);
                if let Err(e) = shared.subscribe_filter() {
                    tracing::error!(error = %e, "Failed to subscribe");
                }
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => shared.suback(),
            Ok(Event::Incoming(Packet::Publish(p))) => shared.handle_publish(&p.topic, &p.payload),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                shared.set_connected(false);
                if !shared.running.load(Ordering::SeqCst) {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                shared.set_connected(false);
                if !shared.running.load(Ordering::SeqCst) {
                    break;
                }
                tracing::warn!(error = %e, "MQTT connection error, reconnecting");
                std::thread::sleep(RECONNECT_DELAY);
            }
        }
    }
    tracing::debug!("MQTT connection loop finished");
}

/// Broker-backed [`DeviceDriver`].
pub struct MqttDriver {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MqttDriver {
    /// Connect to the broker described by `settings` and start tracking devices.
    pub fn connect(settings: &MqttSettings) -> BusResult<Self> {
        Self::connect_with_timeout(settings, DEFAULT_WRITE_TIMEOUT)
    }

    pub fn connect_with_timeout(
        settings: &MqttSettings,
        write_timeout: Duration,
    ) -> BusResult<Self> {
        let mut opts = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        opts.set_keep_alive(Duration::from_secs(settings.keepalive.max(5)));
        opts.set_clean_session(true);
        if let Some((username, password)) = settings.credentials() {
            opts.set_credentials(username, password);
        }

        let (client, connection) = Client::new(opts, 256);
        let shared = Arc::new(Shared {
            prefix: settings.prefix.clone(),
            client,
            write_timeout,
            running: AtomicBool::new(true),
            filter: RwLock::new(DeviceFilter::All),
            devices: RwLock::new(BTreeMap::new()),
            events: ControlEventBus::new(),
            ready: Mutex::new(ReadyState {
                connected: false,
                subscribed: false,
                pending_subacks: 0,
                last_activity: Instant::now(),
            }),
            ready_changed: Condvar::new(),
        });

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("mqtt-driver".to_string())
            .spawn(move || run_connection(worker_shared, connection))
            .map_err(|e| BusError::Communication(e.to_string()))?;

        tracing::info!(broker = %settings.broker_addr(), "MQTT driver started");
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Disconnect and join the connection thread. Safe to call more than once.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.shared.client.disconnect() {
            tracing::debug!(error = %e, "Disconnect request failed");
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!("MQTT connection thread panicked");
            }
        }
        tracing::info!("MQTT driver stopped");
    }
}

impl Drop for MqttDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

struct MqttTx<'a> {
    shared: &'a Shared,
}

impl DriverTx for MqttTx<'_> {
    fn device(&self, id: &str) -> Option<DeviceHandle> {
        self.shared
            .devices
            .read()
            .get(id)
            .map(|d| d.clone() as DeviceHandle)
    }

    fn devices(&self) -> Vec<DeviceHandle> {
        self.shared
            .devices
            .read()
            .values()
            .map(|d| d.clone() as DeviceHandle)
            .collect()
    }
}

impl DeviceDriver for MqttDriver {
    fn set_filter(&self, filter: DeviceFilter) -> BusResult<()> {
        *self.shared.filter.write() = filter;
        let connected = self.shared.ready.lock().connected;
        if connected {
            self.shared.subscribe_filter()?;
        }
        Ok(())
    }

    fn wait_for_ready(&self, timeout: Duration) -> BusResult<()> {
        let deadline = Instant::now() + timeout;
        let mut ready = self.shared.ready.lock();
        loop {
            let now = Instant::now();
            let quiet = now.saturating_duration_since(ready.last_activity);
            if ready.connected
                && ready.subscribed
                && ready.pending_subacks == 0
                && quiet >= QUIET_PERIOD
            {
                return Ok(());
            }
            if now >= deadline {
                return Err(if ready.connected {
                    BusError::Timeout(timeout.as_millis() as u64)
                } else {
                    BusError::NotReady("broker is not connected".to_string())
                });
            }
            let wait = (deadline - now)
                .min(QUIET_PERIOD.saturating_sub(quiet).max(Duration::from_millis(10)));
            self.shared.ready_changed.wait_for(&mut ready, wait);
        }
    }

    fn begin_tx(&self) -> Box<dyn DriverTx + '_> {
        Box::new(MqttTx {
            shared: &self.shared,
        })
    }

    fn subscribe(&self) -> ControlEventReceiver {
        self.shared.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value_topic() {
        assert_eq!(
            MqttTopic::parse("", "/devices/wb-gpio/controls/A1_OUT"),
            Some(MqttTopic::Value {
                device: "wb-gpio".to_string(),
                control: "A1_OUT".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_meta_and_on() {
        let meta = MqttTopic::parse("", "/devices/dev/controls/ctrl/meta/type").unwrap();
        assert_eq!(
            meta,
            MqttTopic::Meta {
                device: "dev".to_string(),
                control: "ctrl".to_string(),
                field: "type".to_string(),
            }
        );
        assert_eq!(meta.device(), "dev");
        assert_eq!(meta.control(), "ctrl");

        let on = MqttTopic::parse("", "/devices/dev/controls/ctrl/on").unwrap();
        assert!(matches!(on, MqttTopic::On { .. }));
    }

    #[test]
    fn test_parse_with_prefix() {
        let topic = MqttTopic::parse("site1", "site1/devices/dev/controls/ctrl").unwrap();
        assert_eq!(topic.device(), "dev");
        assert!(MqttTopic::parse("site1", "/devices/dev/controls/ctrl").is_none());
    }

    #[test]
    fn test_parse_rejects_foreign_topics() {
        assert!(MqttTopic::parse("", "/devices/dev/meta/name").is_none());
        assert!(MqttTopic::parse("", "/devices/dev/controls/").is_none());
        assert!(MqttTopic::parse("", "/devices/dev/controls/ctrl/meta").is_none());
        assert!(MqttTopic::parse("", "/devices/dev/controls/ctrl/meta/type/x").is_none());
        assert!(MqttTopic::parse("", "/rpc/v1/foo").is_none());
    }

    #[test]
    fn test_value_held_until_type_known() {
        let mut state = ControlState::default();
        assert_eq!(state.set_value("1".to_string()), None);
        assert_eq!(state.set_value("0".to_string()), None);
        assert_eq!(state.set_type("switch".to_string()), Some("0".to_string()));

        // Later values go out immediately; a type change alone does not.
        assert_eq!(state.set_value("1".to_string()), Some("1".to_string()));
        assert_eq!(state.set_type("switch".to_string()), None);
    }

    #[test]
    fn test_type_before_value() {
        let mut state = ControlState::default();
        assert_eq!(state.set_type("text".to_string()), None);
        assert_eq!(state.set_value("hi".to_string()), Some("hi".to_string()));
    }

    #[test]
    fn test_subscription_topics() {
        let all = subscription_topics("", &DeviceFilter::All);
        assert_eq!(all, vec!["/devices/+/controls/+", "/devices/+/controls/+/meta/+"]);

        let some = subscription_topics("p", &DeviceFilter::devices(["a", "b"]));
        assert_eq!(some.len(), 4);
        assert!(some.contains(&"p/devices/b/controls/+/meta/+".to_string()));
    }
}
