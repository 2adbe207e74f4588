//! Synchronization engine: event handling and the runtime callbacks.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use tokio::task::JoinHandle;
use tracing::{Instrument, Span};

use opcua_gateway_core::address_space::{
    AddressSpace, DataSource, DataValue, NodeId, StatusCode,
};
use opcua_gateway_core::bus::{
    ControlEventReceiver, ControlHandle, ControlValueEvent, DeviceDriver,
};
use opcua_gateway_core::config::{GatewayConfig, SyncMode};
use opcua_gateway_core::key::NodeKey;

use crate::coercion::{decode_data_value, encode};
use crate::error::Result;
use crate::materializer::{LeafOutcome, NodeMaterializer};
use crate::registry::NodeRegistry;

/// Result of handling one value event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Empty payload, the value is not known yet.
    Empty,
    /// Device or control id cannot form a node key.
    InvalidKey,
    /// No configured group covers the control.
    NotConfigured,
    /// Key already mapped.
    Existing,
    Materialized(LeafOutcome),
    /// Node creation failed; the event is dropped.
    Failed,
}

/// Resolve a node id back into its `device/control` key.
fn node_key(node_id: &NodeId) -> Option<NodeKey> {
    node_id.as_str().and_then(NodeKey::parse)
}

/// Keeps the address space in step with the bus and serves runtime callbacks.
pub struct SyncEngine {
    driver: Arc<dyn DeviceDriver>,
    materializer: NodeMaterializer,
    registry: Arc<NodeRegistry>,
    config: GatewayConfig,
    span: Span,
    this: Weak<SyncEngine>,
}

impl SyncEngine {
    pub fn new(
        config: GatewayConfig,
        driver: Arc<dyn DeviceDriver>,
        address_space: Arc<dyn AddressSpace>,
    ) -> Arc<Self> {
        Self::with_span(
            config,
            driver,
            address_space,
            tracing::info_span!("sync_engine"),
        )
    }

    /// Same as [`SyncEngine::new`] with a caller-supplied logging span.
    pub fn with_span(
        config: GatewayConfig,
        driver: Arc<dyn DeviceDriver>,
        address_space: Arc<dyn AddressSpace>,
        span: Span,
    ) -> Arc<Self> {
        let registry = Arc::new(NodeRegistry::new());
        Arc::new_cyclic(|this| Self {
            driver,
            materializer: NodeMaterializer::new(address_space, registry.clone()),
            registry,
            config,
            span,
            this: this.clone(),
        })
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn materializer(&self) -> &NodeMaterializer {
        &self.materializer
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn mode(&self) -> SyncMode {
        self.config.mode
    }

    /// Non-owning callback handle to attach to variable nodes.
    pub fn data_source(&self) -> Arc<dyn DataSource> {
        Arc::new(EngineRef(self.this.clone()))
    }

    /// Create the node tree for every configured control.
    ///
    /// Controls missing from the bus are declared and bound once they show
    /// up. Any node creation failure aborts provisioning.
    pub fn provision_static(&self) -> Result<usize> {
        let _enter = self.span.enter();
        let mut provisioned = 0;
        for (group, keys) in &self.config.groups {
            let group_node = self.materializer.ensure_group_node(group)?;
            let tx = self.driver.begin_tx();
            for key in keys {
                let control = tx.control(key);
                let outcome = self.materializer.ensure_leaf_node(
                    &group_node,
                    key,
                    control.as_ref(),
                    self.data_source(),
                )?;
                if outcome != LeafOutcome::Existing {
                    provisioned += 1;
                }
            }
        }
        tracing::info!(nodes = provisioned, "Static nodes provisioned");
        Ok(provisioned)
    }

    /// Feed every control the driver already knows through
    /// [`SyncEngine::handle_value_event`]. Returns the number of nodes materialized.
    pub fn sync_existing(&self) -> usize {
        let controls: Vec<ControlHandle> = {
            let tx = self.driver.begin_tx();
            tx.devices()
                .iter()
                .flat_map(|device| device.controls())
                .collect()
        };

        controls
            .into_iter()
            .map(|control| {
                let raw = control.raw_value();
                ControlValueEvent::new(control, raw)
            })
            .filter(|event| {
                matches!(
                    self.handle_value_event(event),
                    EventOutcome::Materialized(_)
                )
            })
            .count()
    }

    fn group_for(&self, key: &NodeKey) -> Option<&str> {
        match self.config.mode {
            SyncMode::Reactive => self.config.group_for_device(key.device_id()),
            SyncMode::Static => self.config.group_for_key(key),
        }
    }

    /// Materialize the node for an observed control value if needed.
    pub fn handle_value_event(&self, event: &ControlValueEvent) -> EventOutcome {
        let _enter = self.span.enter();
        if event.is_empty() {
            return EventOutcome::Empty;
        }
        let Some(key) = event.control.key() else {
            tracing::debug!(
                device = event.device_id(),
                control = event.control.id(),
                "Ignoring control with invalid id"
            );
            return EventOutcome::InvalidKey;
        };
        let Some(group) = self.group_for(&key) else {
            return EventOutcome::NotConfigured;
        };
        if self.registry.exists(&key) {
            return EventOutcome::Existing;
        }

        let result = self.materializer.ensure_group_node(group).and_then(|group_node| {
            self.materializer.ensure_leaf_node(
                &group_node,
                &key,
                Some(&event.control),
                self.data_source(),
            )
        });
        match result {
            Ok(LeafOutcome::Existing) => EventOutcome::Existing,
            Ok(outcome) => EventOutcome::Materialized(outcome),
            Err(e) => {
                tracing::error!(%key, error = %e, "Node creation failed, event dropped");
                EventOutcome::Failed
            }
        }
    }

    /// Mapped control for `key`, binding a declared node if its control appeared.
    fn resolve(&self, key: &NodeKey) -> Option<ControlHandle> {
        if let Some(control) = self.registry.lookup(key) {
            return Some(control);
        }
        if !self.registry.is_declared(key) {
            return None;
        }

        let control = self.driver.begin_tx().control(key)?;
        if let Err(e) = self.materializer.bind_declared(key, &control) {
            tracing::error!(%key, error = %e, "Declared node binding failed");
            return None;
        }
        self.registry.lookup(key)
    }

    /// Read callback.
    pub fn read(&self, node_id: &NodeId) -> DataValue {
        let _enter = self.span.enter();
        let Some(key) = node_key(node_id) else {
            tracing::warn!(node = %node_id, "Read of a node without a device/control id");
            return DataValue::from_status(StatusCode::BadNoCommunication);
        };
        let Some(control) = self.resolve(&key) else {
            tracing::debug!(%key, "Control is not found");
            return DataValue::from_status(StatusCode::BadNoCommunication);
        };

        match control.value() {
            Ok(value) => {
                let data = DataValue::new(encode(&value));
                if control.has_read_error() {
                    data.with_status(StatusCode::Bad)
                } else {
                    data
                }
            }
            Err(e) => {
                tracing::error!(%key, error = %e, "Variable node read error");
                DataValue::from_status(StatusCode::BadNoCommunication)
            }
        }
    }

    /// Write callback. Blocks until the bus confirms or times out.
    pub fn write(&self, node_id: &NodeId, value: &DataValue) -> StatusCode {
        let _enter = self.span.enter();
        let Some(key) = node_key(node_id) else {
            tracing::error!(node = %node_id, "Write to a node without a device/control id");
            return StatusCode::BadDeviceFailure;
        };
        let Some(control) = self.resolve(&key) else {
            tracing::error!(%key, "Variable node writing failed, it is not present on the bus");
            return StatusCode::BadDeviceFailure;
        };
        if control.is_readonly() {
            tracing::error!(%key, "Variable node writing failed, it is read only");
            return StatusCode::BadDeviceFailure;
        }

        let decoded = match decode_data_value(value) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(%key, error = %e, "Variable node write rejected");
                return StatusCode::BadDataTypeIdUnknown;
            }
        };
        match control.set_value(&decoded) {
            Ok(()) => {
                tracing::info!(%key, value = %decoded, "Variable node written");
                StatusCode::Good
            }
            Err(e) => {
                tracing::error!(%key, error = %e, "Variable node write error");
                StatusCode::BadDeviceFailure
            }
        }
    }

    /// Handle bus events on a tokio task until the channel closes or the
    /// engine is dropped.
    pub fn spawn_event_pump(self: &Arc<Self>, mut events: ControlEventReceiver) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let span = self.span.clone();
        tokio::spawn(
            async move {
                while let Some(event) = events.recv().await {
                    let Some(engine) = weak.upgrade() else {
                        break;
                    };
                    match catch_unwind(AssertUnwindSafe(|| engine.handle_value_event(&event))) {
                        Ok(outcome) => tracing::trace!(?event, ?outcome, "Value event handled"),
                        Err(_) => tracing::error!(?event, "Value event handler panicked"),
                    }
                }
                tracing::debug!("Event pump finished");
            }
            .instrument(span),
        )
    }
}

/// Weak handle registered with the runtime for each variable node.
///
/// Callbacks after the engine is gone, and panics inside the engine, are
/// answered with a bad status instead of unwinding into the runtime.
#[derive(Clone)]
pub struct EngineRef(Weak<SyncEngine>);

impl EngineRef {
    pub fn new(engine: &Arc<SyncEngine>) -> Self {
        Self(Arc::downgrade(engine))
    }

    pub fn upgrade(&self) -> Option<Arc<SyncEngine>> {
        self.0.upgrade()
    }
}

impl DataSource for EngineRef {
    fn read(&self, node_id: &NodeId) -> DataValue {
        let Some(engine) = self.upgrade() else {
            return DataValue::from_status(StatusCode::BadNoCommunication);
        };
        catch_unwind(AssertUnwindSafe(|| engine.read(node_id))).unwrap_or_else(|_| {
            tracing::error!(node = %node_id, "Read callback panicked");
            DataValue::from_status(StatusCode::BadNoCommunication)
        })
    }

    fn write(&self, node_id: &NodeId, value: &DataValue) -> StatusCode {
        let Some(engine) = self.upgrade() else {
            return StatusCode::BadDeviceFailure;
        };
        catch_unwind(AssertUnwindSafe(|| engine.write(node_id, value))).unwrap_or_else(|_| {
            tracing::error!(node = %node_id, "Write callback panicked");
            StatusCode::BadDeviceFailure
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_key_from_node_id() {
        assert_eq!(
            node_key(&NodeId::string(1, "a/b")).map(|k| k.to_string()),
            Some("a/b".to_string())
        );
        assert!(node_key(&NodeId::string(1, "a")).is_none());
        assert!(node_key(&NodeId::string(1, "a/b/c")).is_none());
        assert!(node_key(&NodeId::string(1, "/b")).is_none());
        assert!(node_key(&NodeId::numeric(0, 85)).is_none());
    }

    #[test]
    fn test_dangling_engine_ref() {
        let dangling = EngineRef(Weak::new());
        assert_eq!(
            dangling.read(&NodeId::string(1, "a/b")).status(),
            StatusCode::BadNoCommunication
        );
        assert_eq!(
            dangling.write(&NodeId::string(1, "a/b"), &DataValue::default()),
            StatusCode::BadDeviceFailure
        );
    }
}
