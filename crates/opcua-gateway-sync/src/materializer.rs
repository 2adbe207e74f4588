//! Idempotent creation of group and leaf nodes.

use std::sync::Arc;

use opcua_gateway_core::address_space::{
    AccessLevel, AddressSpace, DataSource, DataType, GATEWAY_NAMESPACE, NodeId, ServerError,
    StatusCode, VariableAttributes,
};
use opcua_gateway_core::bus::ControlHandle;
use opcua_gateway_core::key::NodeKey;

use crate::coercion::declare_type;
use crate::registry::{NodeEntry, NodeRegistry, RegistryState};

/// Node id of the object node for `group`.
pub fn group_node_id(group: &str) -> NodeId {
    NodeId::string(GATEWAY_NAMESPACE, group)
}

/// Node id of the variable node for `key`.
pub fn leaf_node_id(key: &NodeKey) -> NodeId {
    NodeId::string(GATEWAY_NAMESPACE, key.as_str())
}

/// What `ensure_leaf_node` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafOutcome {
    /// New node created and mapped.
    Created,
    /// Node already existed unmapped and is now bound to its control.
    Bound,
    /// Node created without a control; reads fail until one is bound.
    Declared,
    /// Nothing to do.
    Existing,
}

fn creation_error(node: &NodeId, status: StatusCode) -> ServerError {
    ServerError::NodeCreation {
        node: node.to_string(),
        status,
    }
}

/// Creates nodes in the address space and records them in the registry.
///
/// Every browse-then-create sequence runs under the registry lock.
pub struct NodeMaterializer {
    address_space: Arc<dyn AddressSpace>,
    registry: Arc<NodeRegistry>,
}

impl NodeMaterializer {
    pub fn new(address_space: Arc<dyn AddressSpace>, registry: Arc<NodeRegistry>) -> Self {
        Self {
            address_space,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Get or create the object node for `group` under the Objects folder.
    pub fn ensure_group_node(&self, group: &str) -> Result<NodeId, ServerError> {
        let _guard = self.registry.lock();
        let objects = NodeId::objects_folder();
        if let Some(existing) = self.address_space.browse(&objects, group) {
            return Ok(existing);
        }

        let node_id = group_node_id(group);
        let created = self
            .address_space
            .add_object_node(node_id.clone(), &objects, group, group)
            .map_err(|status| creation_error(&node_id, status))?;
        tracing::debug!(group, node = %created, "Object node created");
        Ok(created)
    }

    /// Make sure a variable node for `key` exists under `group_node`.
    ///
    /// With no `control` the node is declared with `BaseDataType` and
    /// read-only access, and bound on a later call that supplies one.
    pub fn ensure_leaf_node(
        &self,
        group_node: &NodeId,
        key: &NodeKey,
        control: Option<&ControlHandle>,
        data_source: Arc<dyn DataSource>,
    ) -> Result<LeafOutcome, ServerError> {
        let mut state = self.registry.lock();
        if state.exists(key) {
            return Ok(LeafOutcome::Existing);
        }

        let node_id = leaf_node_id(key);
        if self.address_space.contains(&node_id) {
            let Some(control) = control else {
                return Ok(LeafOutcome::Existing);
            };
            self.bind(&mut state, &node_id, key, control)?;
            return Ok(LeafOutcome::Bound);
        }

        let (data_type, access_level) = match control {
            Some(control) => declare_type(control),
            None => (DataType::BaseDataType, AccessLevel::READ),
        };
        let attributes = VariableAttributes {
            browse_name: key.control_id().to_string(),
            display_name: key.control_id().to_string(),
            data_type,
            access_level,
        };
        self.address_space
            .add_variable_node(node_id.clone(), group_node, attributes, data_source)
            .map_err(|status| creation_error(&node_id, status))?;

        match control {
            Some(control) => {
                state.insert(NodeEntry {
                    key: key.clone(),
                    control: control.clone(),
                    data_type,
                    access_level,
                });
                tracing::info!(%key, ?data_type, "Variable node created");
                Ok(LeafOutcome::Created)
            }
            None => {
                state.declare(key.clone());
                tracing::warn!(%key, "Control is not present on the bus, node declared");
                Ok(LeafOutcome::Declared)
            }
        }
    }

    /// Bind `control` to the node declared for `key`, if it is still unbound.
    pub fn bind_declared(&self, key: &NodeKey, control: &ControlHandle) -> Result<(), ServerError> {
        let mut state = self.registry.lock();
        if state.exists(key) || !state.is_declared(key) {
            return Ok(());
        }
        self.bind(&mut state, &leaf_node_id(key), key, control)
    }

    /// Map an existing node to `control` and bring its attributes in line.
    fn bind(
        &self,
        state: &mut RegistryState,
        node_id: &NodeId,
        key: &NodeKey,
        control: &ControlHandle,
    ) -> Result<(), ServerError> {
        let (data_type, access_level) = declare_type(control);
        self.address_space
            .set_variable_attributes(node_id, data_type, access_level)
            .map_err(|status| creation_error(node_id, status))?;
        state.insert(NodeEntry {
            key: key.clone(),
            control: control.clone(),
            data_type,
            access_level,
        });
        tracing::info!(%key, ?data_type, "Variable node bound to control");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_ids() {
        assert_eq!(group_node_id("room").to_string(), "ns=1;s=room");
        let key = NodeKey::parse("room/temp").unwrap();
        assert_eq!(leaf_node_id(&key).as_str(), Some("room/temp"));
    }
}
