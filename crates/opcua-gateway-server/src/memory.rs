//! In-memory protocol-server runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::Level;

use opcua_gateway_core::address_space::{
    AccessLevel, AddressSpace, DataSource, DataType, DataValue, LogCategory, NodeId, ServerError,
    ServerRuntime, ServerSettings, StatusCode, VariableAttributes, Variant, runtime_log,
};

use crate::SERVE_TICK;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeClass {
    Object,
    Variable,
}

/// Snapshot of a node's attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub node_id: NodeId,
    /// `None` only for the Objects folder.
    pub parent: Option<NodeId>,
    pub class: NodeClass,
    pub browse_name: String,
    pub display_name: String,
    pub data_type: Option<DataType>,
    pub access_level: Option<AccessLevel>,
}

struct Node {
    info: NodeInfo,
    data_source: Option<Arc<dyn DataSource>>,
}

/// Address space and serving loop kept entirely in process memory.
///
/// Client services are exposed as [`MemoryServer::read`] and
/// [`MemoryServer::write`], which behave like the OPC UA Read and Write
/// services for a single `Value` attribute.
pub struct MemoryServer {
    nodes: RwLock<HashMap<NodeId, Node>>,
    settings: RwLock<Option<ServerSettings>>,
    failure: Mutex<Option<StatusCode>>,
    serving: AtomicBool,
}

impl MemoryServer {
    pub fn new() -> Self {
        let objects = NodeId::objects_folder();
        let mut nodes = HashMap::new();
        nodes.insert(
            objects.clone(),
            Node {
                info: NodeInfo {
                    node_id: objects,
                    parent: None,
                    class: NodeClass::Object,
                    browse_name: "Objects".to_string(),
                    display_name: "Objects".to_string(),
                    data_type: None,
                    access_level: None,
                },
                data_source: None,
            },
        );

        Self {
            nodes: RwLock::new(nodes),
            settings: RwLock::new(None),
            failure: Mutex::new(None),
            serving: AtomicBool::new(false),
        }
    }

    /// Settings applied by `configure`, if any.
    pub fn settings(&self) -> Option<ServerSettings> {
        self.settings.read().clone()
    }

    pub fn node(&self, node_id: &NodeId) -> Option<NodeInfo> {
        self.nodes.read().get(node_id).map(|n| n.info.clone())
    }

    /// Direct children of `parent`, sorted by browse name.
    pub fn children(&self, parent: &NodeId) -> Vec<NodeInfo> {
        let mut children: Vec<NodeInfo> = self
            .nodes
            .read()
            .values()
            .filter(|n| n.info.parent.as_ref() == Some(parent))
            .map(|n| n.info.clone())
            .collect();
        children.sort_by(|a, b| a.browse_name.cmp(&b.browse_name));
        children
    }

    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }

    /// Make the serving loop return `status` at its next tick.
    pub fn inject_failure(&self, status: StatusCode) {
        *self.failure.lock() = Some(status);
    }

    fn variable(&self, node_id: &NodeId) -> Result<(NodeInfo, Arc<dyn DataSource>), StatusCode> {
        let nodes = self.nodes.read();
        let node = nodes.get(node_id).ok_or(StatusCode::BadNodeIdUnknown)?;
        match (&node.info.class, &node.data_source) {
            (NodeClass::Variable, Some(source)) => Ok((node.info.clone(), source.clone())),
            _ => Err(StatusCode::BadNodeIdUnknown),
        }
    }

    /// Client Read of the `Value` attribute.
    pub fn read(&self, node_id: &NodeId) -> DataValue {
        let (info, source) = match self.variable(node_id) {
            Ok(found) => found,
            Err(status) => return DataValue::from_status(status),
        };
        if !info.access_level.is_some_and(AccessLevel::can_read) {
            return DataValue::from_status(StatusCode::BadNotReadable);
        }
        source.read(node_id)
    }

    /// Client Write of the `Value` attribute.
    pub fn write(&self, node_id: &NodeId, value: DataValue) -> StatusCode {
        let (info, source) = match self.variable(node_id) {
            Ok(found) => found,
            Err(status) => return status,
        };
        if !info.access_level.is_some_and(AccessLevel::can_write) {
            return StatusCode::BadNotWritable;
        }
        if let (Some(data_type), Some(variant)) = (info.data_type, &value.value) {
            if !type_matches(data_type, variant) {
                return StatusCode::BadTypeMismatch;
            }
        }
        source.write(node_id, &value)
    }

    fn insert(&self, node: Node) -> Result<NodeId, StatusCode> {
        let mut nodes = self.nodes.write();
        let node_id = node.info.node_id.clone();
        if nodes.contains_key(&node_id) {
            return Err(StatusCode::BadNodeIdExists);
        }
        let parent = node.info.parent.as_ref().ok_or(StatusCode::BadParentNodeIdInvalid)?;
        if !nodes.contains_key(parent) {
            return Err(StatusCode::BadParentNodeIdInvalid);
        }
        tracing::trace!(node = %node_id, "Node added");
        nodes.insert(node_id.clone(), node);
        Ok(node_id)
    }
}

fn type_matches(data_type: DataType, variant: &Variant) -> bool {
    match data_type {
        DataType::Boolean => matches!(variant, Variant::Boolean(_)),
        DataType::Double => matches!(variant, Variant::Double(_)),
        DataType::String => matches!(variant, Variant::String(_)),
        DataType::BaseDataType => true,
    }
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace for MemoryServer {
    fn browse(&self, parent: &NodeId, browse_name: &str) -> Option<NodeId> {
        self.nodes
            .read()
            .values()
            .find(|n| n.info.parent.as_ref() == Some(parent) && n.info.browse_name == browse_name)
            .map(|n| n.info.node_id.clone())
    }

    fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes.read().contains_key(node_id)
    }

    fn add_object_node(
        &self,
        node_id: NodeId,
        parent: &NodeId,
        browse_name: &str,
        display_name: &str,
    ) -> Result<NodeId, StatusCode> {
        self.insert(Node {
            info: NodeInfo {
                node_id,
                parent: Some(parent.clone()),
                class: NodeClass::Object,
                browse_name: browse_name.to_string(),
                display_name: display_name.to_string(),
                data_type: None,
                access_level: None,
            },
            data_source: None,
        })
    }

    fn add_variable_node(
        &self,
        node_id: NodeId,
        parent: &NodeId,
        attributes: VariableAttributes,
        data_source: Arc<dyn DataSource>,
    ) -> Result<NodeId, StatusCode> {
        self.insert(Node {
            info: NodeInfo {
                node_id,
                parent: Some(parent.clone()),
                class: NodeClass::Variable,
                browse_name: attributes.browse_name,
                display_name: attributes.display_name,
                data_type: Some(attributes.data_type),
                access_level: Some(attributes.access_level),
            },
            data_source: Some(data_source),
        })
    }

    fn set_variable_attributes(
        &self,
        node_id: &NodeId,
        data_type: DataType,
        access_level: AccessLevel,
    ) -> Result<(), StatusCode> {
        let mut nodes = self.nodes.write();
        match nodes.get_mut(node_id) {
            Some(node) if node.info.class == NodeClass::Variable => {
                node.info.data_type = Some(data_type);
                node.info.access_level = Some(access_level);
                Ok(())
            }
            _ => Err(StatusCode::BadNodeIdUnknown),
        }
    }

    fn node_count(&self) -> usize {
        self.nodes.read().len()
    }
}

impl ServerRuntime for MemoryServer {
    fn configure(&self, settings: &ServerSettings) -> Result<(), ServerError> {
        if settings.port == 0 {
            return Err(ServerError::Configuration("port must be non-zero".to_string()));
        }
        if settings.application_uri.is_empty() {
            return Err(ServerError::Configuration(
                "application uri must not be empty".to_string(),
            ));
        }
        runtime_log(
            Level::INFO,
            LogCategory::SecurityPolicy,
            "Security policy None, anonymous access enabled",
        );
        runtime_log(
            Level::DEBUG,
            LogCategory::Server,
            &format!(
                "Application '{}' ({})",
                settings.application_name, settings.application_uri
            ),
        );
        *self.settings.write() = Some(settings.clone());
        Ok(())
    }

    fn run(&self, running: &AtomicBool) -> StatusCode {
        if self.serving.swap(true, Ordering::SeqCst) {
            runtime_log(Level::ERROR, LogCategory::Server, "Serving loop already running");
            return StatusCode::BadInternalError;
        }
        let endpoint = self.settings().unwrap_or_default().endpoint_url();
        runtime_log(
            Level::INFO,
            LogCategory::Network,
            &format!("Listening on {}", endpoint),
        );

        let mut status = StatusCode::Good;
        while running.load(Ordering::SeqCst) {
            if let Some(failure) = self.failure.lock().take() {
                runtime_log(
                    Level::ERROR,
                    LogCategory::Server,
                    &format!("Serving loop failed: {}", failure),
                );
                status = failure;
                break;
            }
            std::thread::sleep(SERVE_TICK);
        }

        runtime_log(Level::INFO, LogCategory::Network, "Server shut down");
        self.serving.store(false, Ordering::SeqCst);
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Constant(Variant);

    impl DataSource for Constant {
        fn read(&self, _node_id: &NodeId) -> DataValue {
            DataValue::new(self.0.clone())
        }

        fn write(&self, _node_id: &NodeId, _value: &DataValue) -> StatusCode {
            StatusCode::Good
        }
    }

    fn attributes(
        name: &str,
        data_type: DataType,
        access_level: AccessLevel,
    ) -> VariableAttributes {
        VariableAttributes {
            browse_name: name.to_string(),
            display_name: name.to_string(),
            data_type,
            access_level,
        }
    }

    #[test]
    fn test_objects_folder_exists() {
        let server = MemoryServer::new();
        assert_eq!(server.node_count(), 1);
        assert!(server.contains(&NodeId::objects_folder()));
    }

    #[test]
    fn test_add_and_browse() {
        let server = MemoryServer::new();
        let group = NodeId::string(1, "room");
        server
            .add_object_node(group.clone(), &NodeId::objects_folder(), "room", "room")
            .unwrap();
        assert_eq!(
            server.browse(&NodeId::objects_folder(), "room"),
            Some(group.clone())
        );
        assert_eq!(server.browse(&NodeId::objects_folder(), "hall"), None);

        assert_eq!(
            server.add_object_node(group.clone(), &NodeId::objects_folder(), "room", "room"),
            Err(StatusCode::BadNodeIdExists)
        );
        assert_eq!(
            server.add_object_node(
                NodeId::string(1, "x"),
                &NodeId::string(1, "missing"),
                "x",
                "x"
            ),
            Err(StatusCode::BadParentNodeIdInvalid)
        );
        assert_eq!(server.children(&NodeId::objects_folder()).len(), 1);
    }

    #[test]
    fn test_client_services_enforce_access_level() {
        let server = MemoryServer::new();
        let parent = NodeId::objects_folder();
        let ro = NodeId::string(1, "dev/temp");
        server
            .add_variable_node(
                ro.clone(),
                &parent,
                attributes("temp", DataType::Double, AccessLevel::READ),
                Arc::new(Constant(Variant::Double(21.5))),
            )
            .unwrap();

        assert_eq!(server.read(&ro).value, Some(Variant::Double(21.5)));
        assert_eq!(
            server.write(&ro, DataValue::new(Variant::Double(1.0))),
            StatusCode::BadNotWritable
        );
        assert_eq!(
            server.read(&NodeId::string(1, "dev/none")).status(),
            StatusCode::BadNodeIdUnknown
        );
        assert_eq!(server.read(&parent).status(), StatusCode::BadNodeIdUnknown);
    }

    #[test]
    fn test_write_type_check() {
        let server = MemoryServer::new();
        let rw = NodeId::string(1, "dev/relay");
        server
            .add_variable_node(
                rw.clone(),
                &NodeId::objects_folder(),
                attributes("relay", DataType::Boolean, AccessLevel::READ_WRITE),
                Arc::new(Constant(Variant::Boolean(false))),
            )
            .unwrap();

        assert_eq!(
            server.write(&rw, DataValue::new(Variant::Double(1.0))),
            StatusCode::BadTypeMismatch
        );
        assert_eq!(
            server.write(&rw, DataValue::new(Variant::Boolean(true))),
            StatusCode::Good
        );
    }

    #[test]
    fn test_set_variable_attributes() {
        let server = MemoryServer::new();
        let id = NodeId::string(1, "dev/late");
        server
            .add_variable_node(
                id.clone(),
                &NodeId::objects_folder(),
                attributes("late", DataType::BaseDataType, AccessLevel::READ),
                Arc::new(Constant(Variant::Double(0.0))),
            )
            .unwrap();
        assert_eq!(
            server.write(&id, DataValue::new(Variant::Double(1.0))),
            StatusCode::BadNotWritable
        );

        server
            .set_variable_attributes(&id, DataType::Double, AccessLevel::READ_WRITE)
            .unwrap();
        let info = server.node(&id).unwrap();
        assert_eq!(info.data_type, Some(DataType::Double));
        assert_eq!(info.access_level, Some(AccessLevel::READ_WRITE));
        assert_eq!(
            server.write(&id, DataValue::new(Variant::Double(1.0))),
            StatusCode::Good
        );

        assert_eq!(
            server.set_variable_attributes(
                &NodeId::objects_folder(),
                DataType::Double,
                AccessLevel::READ
            ),
            Err(StatusCode::BadNodeIdUnknown)
        );
    }

    #[test]
    fn test_configure_rejects_port_zero() {
        let server = MemoryServer::new();
        let settings = ServerSettings {
            port: 0,
            ..Default::default()
        };
        assert!(matches!(
            server.configure(&settings),
            Err(ServerError::Configuration(_))
        ));
        assert!(server.settings().is_none());

        server.configure(&ServerSettings::default()).unwrap();
        assert_eq!(server.settings().unwrap().port, 4840);
    }

    #[test]
    fn test_run_returns_injected_failure() {
        let server = MemoryServer::new();
        let running = AtomicBool::new(true);
        server.inject_failure(StatusCode::BadCommunicationError);
        assert_eq!(server.run(&running), StatusCode::BadCommunicationError);
        assert!(!server.is_serving());
    }
}
