//! OPC UA runtime backed by async-opcua.
//!
//! `configure` builds the server with one anonymous endpoint using security
//! policy None, and a simple node manager for the gateway namespace. Gateway
//! node ids in namespace 1 are mapped onto that namespace's index. `run`
//! drives the server on its own tokio runtime until the run flag clears.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::Level;

use ::opcua::server::address_space::{
    AccessLevel as UaAccessLevel, AddressSpace as UaAddressSpace, NodeType, ObjectBuilder,
    VariableBuilder,
};
use ::opcua::server::diagnostics::NamespaceMetadata;
use ::opcua::server::node_manager::memory::{SimpleNodeManager, simple_node_manager};
use ::opcua::server::{Server, ServerBuilder, ServerHandle};
use ::opcua::types as ua;

use opcua_gateway_core::address_space::{
    AccessLevel, AddressSpace, DataSource, DataType, DataValue, GATEWAY_NAMESPACE, Identifier,
    LogCategory, NodeId, ServerError, ServerRuntime, ServerSettings, StatusCode,
    VariableAttributes, Variant, runtime_log,
};

use crate::SERVE_TICK;

/// Namespace URI the gateway's nodes live in.
pub const GATEWAY_NAMESPACE_URI: &str = "urn:wb-mqtt-opcua:devices";

const NODE_MANAGER_NAME: &str = "wb-mqtt-opcua";

/// Longest wait for the address space when adding nodes. Read callbacks run
/// under its read lock and may be waiting on the caller's registry lock.
const SPACE_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Built server pieces available after `configure`.
struct Instance {
    handle: ServerHandle,
    manager: Arc<SimpleNodeManager>,
    namespace: u16,
}

impl Instance {
    fn with_space<T>(&self, f: impl FnOnce(&mut UaAddressSpace) -> T) -> Result<T, StatusCode> {
        let mut space = self
            .manager
            .address_space()
            .try_write_for(SPACE_LOCK_TIMEOUT)
            .ok_or(StatusCode::BadInternalError)?;
        Ok(f(&mut space))
    }

    fn node_id(&self, id: &NodeId) -> ua::NodeId {
        let namespace = if id.namespace == GATEWAY_NAMESPACE {
            self.namespace
        } else {
            id.namespace
        };
        match &id.identifier {
            Identifier::Numeric(n) => ua::NodeId::new(namespace, *n),
            Identifier::String(s) => ua::NodeId::new(namespace, s.clone()),
        }
    }
}

struct NodeRef {
    parent: Option<NodeId>,
    browse_name: String,
    variable: bool,
}

struct AttributeUpdate {
    node_id: ua::NodeId,
    data_type: DataType,
    access_level: AccessLevel,
}

/// OPC UA server speaking opc.tcp on the configured host and port.
pub struct UaServer {
    instance: RwLock<Option<Instance>>,
    server: Mutex<Option<Server>>,
    nodes: RwLock<HashMap<NodeId, NodeRef>>,
    /// Attribute changes requested while the address space was busy.
    pending: Mutex<Vec<AttributeUpdate>>,
    serving: AtomicBool,
}

impl UaServer {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            NodeId::objects_folder(),
            NodeRef {
                parent: None,
                browse_name: "Objects".to_string(),
                variable: false,
            },
        );
        Self {
            instance: RwLock::new(None),
            server: Mutex::new(None),
            nodes: RwLock::new(nodes),
            pending: Mutex::new(Vec::new()),
            serving: AtomicBool::new(false),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.instance.read().is_some()
    }

    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }

    /// Index the gateway namespace was registered under.
    pub fn namespace_index(&self) -> Option<u16> {
        self.instance.read().as_ref().map(|i| i.namespace)
    }

    fn check_new(
        nodes: &HashMap<NodeId, NodeRef>,
        node_id: &NodeId,
        parent: &NodeId,
    ) -> Result<(), StatusCode> {
        if nodes.contains_key(node_id) {
            return Err(StatusCode::BadNodeIdExists);
        }
        if !nodes.contains_key(parent) {
            return Err(StatusCode::BadParentNodeIdInvalid);
        }
        Ok(())
    }

    fn apply_pending(&self, instance: &Instance) {
        let updates: Vec<AttributeUpdate> = std::mem::take(&mut *self.pending.lock());
        if updates.is_empty() {
            return;
        }
        let mut space = instance.manager.address_space().write();
        for update in updates {
            if !apply_attributes(&mut space, &update) {
                tracing::warn!(node = %update.node_id, "Deferred attribute update found no variable");
            }
        }
    }

    fn serve(&self, running: &AtomicBool) -> StatusCode {
        let Some(server) = self.server.lock().take() else {
            runtime_log(Level::ERROR, LogCategory::Server, "Server is not configured");
            return StatusCode::BadInternalError;
        };
        let Some(handle) = self.instance.read().as_ref().map(|i| i.handle.clone()) else {
            return StatusCode::BadInternalError;
        };

        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("opcua-io")
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                runtime_log(
                    Level::ERROR,
                    LogCategory::Server,
                    &format!("Cannot start server runtime: {}", e),
                );
                return StatusCode::BadInternalError;
            }
        };

        runtime.block_on(async {
            let serving = server.run();
            tokio::pin!(serving);
            let mut tick = tokio::time::interval(SERVE_TICK);
            let mut cancelled = false;
            loop {
                tokio::select! {
                    result = &mut serving => {
                        return match result {
                            Ok(()) if cancelled => StatusCode::Good,
                            Ok(()) => {
                                runtime_log(Level::ERROR, LogCategory::Server, "Server exited unexpectedly");
                                StatusCode::BadInternalError
                            }
                            Err(e) => {
                                runtime_log(
                                    Level::ERROR,
                                    LogCategory::Network,
                                    &format!("Server failed: {}", e),
                                );
                                StatusCode::BadCommunicationError
                            }
                        };
                    }
                    _ = tick.tick() => {
                        if let Some(instance) = self.instance.read().as_ref() {
                            self.apply_pending(instance);
                        }
                        if !cancelled && !running.load(Ordering::SeqCst) {
                            handle.cancel();
                            cancelled = true;
                        }
                    }
                }
            }
        })
    }
}

impl Default for UaServer {
    fn default() -> Self {
        Self::new()
    }
}

fn ua_data_type(data_type: DataType) -> ua::DataTypeId {
    match data_type {
        DataType::Boolean => ua::DataTypeId::Boolean,
        DataType::Double => ua::DataTypeId::Double,
        DataType::String => ua::DataTypeId::String,
        DataType::BaseDataType => ua::DataTypeId::BaseDataType,
    }
}

// Read and write bits match the standard AccessLevel mask.
fn ua_access(level: AccessLevel) -> (UaAccessLevel, UaAccessLevel) {
    (
        UaAccessLevel::from_bits_truncate(level.bits()),
        UaAccessLevel::from_bits_truncate(level.bits()),
    )
}

fn apply_attributes(space: &mut UaAddressSpace, update: &AttributeUpdate) -> bool {
    match space.find_mut(&update.node_id) {
        Some(NodeType::Variable(variable)) => {
            let (access, user_access) = ua_access(update.access_level);
            variable.set_data_type(ua_data_type(update.data_type));
            variable.set_access_level(access);
            variable.set_user_access_level(user_access);
            true
        }
        _ => false,
    }
}

fn to_ua_variant(value: &Variant) -> ua::Variant {
    match value {
        Variant::Empty => ua::Variant::Empty,
        Variant::Boolean(b) => ua::Variant::Boolean(*b),
        Variant::Int32(i) => ua::Variant::Int32(*i),
        Variant::UInt32(i) => ua::Variant::UInt32(*i),
        Variant::Int64(i) => ua::Variant::Int64(*i),
        Variant::Float(f) => ua::Variant::Float(*f),
        Variant::Double(f) => ua::Variant::Double(*f),
        Variant::String(s) => ua::Variant::String(ua::UAString::from(s.as_str())),
        Variant::ByteString(b) => ua::Variant::ByteString(ua::ByteString::from(b.clone())),
    }
}

fn from_ua_variant(value: &ua::Variant) -> Variant {
    match value {
        ua::Variant::Boolean(b) => Variant::Boolean(*b),
        ua::Variant::Int32(i) => Variant::Int32(*i),
        ua::Variant::UInt32(i) => Variant::UInt32(*i),
        ua::Variant::Int64(i) => Variant::Int64(*i),
        ua::Variant::Float(f) => Variant::Float(*f),
        ua::Variant::Double(f) => Variant::Double(*f),
        ua::Variant::String(s) => Variant::String(s.value().clone().unwrap_or_default()),
        ua::Variant::ByteString(b) => Variant::ByteString(b.value.clone().unwrap_or_default()),
        // Anything else is rejected as an unknown data type downstream.
        _ => Variant::Empty,
    }
}

fn ua_status(status: StatusCode) -> ua::StatusCode {
    ua::StatusCode::from(status.code())
}

fn to_ua_data_value(value: DataValue) -> ua::DataValue {
    ua::DataValue {
        value: value.value.as_ref().map(to_ua_variant),
        status: value.status.map(ua_status),
        source_timestamp: value.source_timestamp.map(ua::DateTime::from),
        server_timestamp: Some(ua::DateTime::now()),
        ..Default::default()
    }
}

fn from_ua_data_value(value: &ua::DataValue) -> DataValue {
    DataValue {
        value: value.value.as_ref().map(from_ua_variant),
        status: None,
        source_timestamp: None,
    }
}

impl AddressSpace for UaServer {
    fn browse(&self, parent: &NodeId, browse_name: &str) -> Option<NodeId> {
        self.nodes
            .read()
            .iter()
            .find(|(_, n)| n.parent.as_ref() == Some(parent) && n.browse_name == browse_name)
            .map(|(id, _)| id.clone())
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
        let instance = self.instance.read();
        let instance = instance.as_ref().ok_or(StatusCode::BadInternalError)?;
        let mut nodes = self.nodes.write();
        Self::check_new(&nodes, &node_id, parent)?;

        let inserted = instance.with_space(|space| {
            ObjectBuilder::new(&instance.node_id(&node_id), browse_name, display_name)
                .organized_by(instance.node_id(parent))
                .insert(space)
        })?;
        if !inserted {
            return Err(StatusCode::BadNodeIdExists);
        }

        nodes.insert(
            node_id.clone(),
            NodeRef {
                parent: Some(parent.clone()),
                browse_name: browse_name.to_string(),
                variable: false,
            },
        );
        Ok(node_id)
    }

    fn add_variable_node(
        &self,
        node_id: NodeId,
        parent: &NodeId,
        attributes: VariableAttributes,
        data_source: Arc<dyn DataSource>,
    ) -> Result<NodeId, StatusCode> {
        let instance = self.instance.read();
        let instance = instance.as_ref().ok_or(StatusCode::BadInternalError)?;
        let mut nodes = self.nodes.write();
        Self::check_new(&nodes, &node_id, parent)?;

        let ua_id = instance.node_id(&node_id);
        let (access, user_access) = ua_access(attributes.access_level);
        let inserted = instance.with_space(|space| {
            VariableBuilder::new(
                &ua_id,
                attributes.browse_name.as_str(),
                attributes.display_name.as_str(),
            )
            .data_type(ua_data_type(attributes.data_type))
            .value_rank(-1)
            .access_level(access)
            .user_access_level(user_access)
            .organized_by(instance.node_id(parent))
            .insert(space)
        })?;
        if !inserted {
            return Err(StatusCode::BadNodeIdExists);
        }

        let reader = data_source.clone();
        let read_id = node_id.clone();
        instance
            .manager
            .inner()
            .add_read_callback(ua_id.clone(), move |_, _, _| {
                Ok(to_ua_data_value(reader.read(&read_id)))
            });
        let write_id = node_id.clone();
        instance
            .manager
            .inner()
            .add_write_callback(ua_id, move |value, _| {
                ua_status(data_source.write(&write_id, &from_ua_data_value(&value)))
            });

        nodes.insert(
            node_id.clone(),
            NodeRef {
                parent: Some(parent.clone()),
                browse_name: attributes.browse_name,
                variable: true,
            },
        );
        Ok(node_id)
    }

    fn set_variable_attributes(
        &self,
        node_id: &NodeId,
        data_type: DataType,
        access_level: AccessLevel,
    ) -> Result<(), StatusCode> {
        if !self.nodes.read().get(node_id).is_some_and(|n| n.variable) {
            return Err(StatusCode::BadNodeIdUnknown);
        }
        let instance = self.instance.read();
        let instance = instance.as_ref().ok_or(StatusCode::BadInternalError)?;
        let update = AttributeUpdate {
            node_id: instance.node_id(node_id),
            data_type,
            access_level,
        };

        // Callbacks can run while the server holds the address space; those
        // updates are applied on the next serving tick.
        let result = match instance.manager.address_space().try_write() {
            Some(mut space) => {
                if apply_attributes(&mut space, &update) {
                    Ok(())
                } else {
                    Err(StatusCode::BadNodeIdUnknown)
                }
            }
            None => {
                self.pending.lock().push(update);
                Ok(())
            }
        };
        result
    }

    fn node_count(&self) -> usize {
        self.nodes.read().len()
    }
}

impl ServerRuntime for UaServer {
    fn configure(&self, settings: &ServerSettings) -> Result<(), ServerError> {
        if self.is_configured() {
            return Err(ServerError::Configuration("server is already configured".to_string()));
        }
        if settings.port == 0 {
            return Err(ServerError::Configuration("port must be non-zero".to_string()));
        }
        if settings.application_uri.is_empty() {
            return Err(ServerError::Configuration(
                "application uri must not be empty".to_string(),
            ));
        }
        let host = if settings.bind_host.is_empty() {
            "0.0.0.0"
        } else {
            settings.bind_host.as_str()
        };

        let (server, handle) = ServerBuilder::new_anonymous(settings.application_name.as_str())
            .application_uri(settings.application_uri.as_str())
            .product_uri(settings.product_uri.as_str())
            .host(host)
            .port(settings.port)
            .pki_dir(settings.pki_dir.clone())
            .create_sample_keypair(true)
            .with_node_manager(simple_node_manager(
                NamespaceMetadata {
                    namespace_uri: GATEWAY_NAMESPACE_URI.to_string(),
                    ..Default::default()
                },
                NODE_MANAGER_NAME,
            ))
            .build()
            .map_err(ServerError::Configuration)?;

        let manager = handle
            .node_managers()
            .get_of_type::<SimpleNodeManager>()
            .ok_or_else(|| ServerError::Configuration("node manager is missing".to_string()))?;
        let namespace = handle
            .get_namespace_index(GATEWAY_NAMESPACE_URI)
            .ok_or_else(|| ServerError::Configuration("namespace is not registered".to_string()))?;

        runtime_log(
            Level::INFO,
            LogCategory::SecurityPolicy,
            "Security policy None, anonymous access enabled",
        );
        runtime_log(
            Level::DEBUG,
            LogCategory::Server,
            &format!(
                "Application '{}' ({}), namespace {} = {}",
                settings.application_name, settings.application_uri, namespace, GATEWAY_NAMESPACE_URI
            ),
        );

        *self.server.lock() = Some(server);
        *self.instance.write() = Some(Instance {
            handle,
            manager,
            namespace,
        });
        Ok(())
    }

    fn run(&self, running: &AtomicBool) -> StatusCode {
        if self.serving.swap(true, Ordering::SeqCst) {
            runtime_log(Level::ERROR, LogCategory::Server, "Serving loop already running");
            return StatusCode::BadInternalError;
        }
        runtime_log(Level::INFO, LogCategory::Network, "Starting OPC UA endpoint");
        let status = self.serve(running);
        runtime_log(Level::INFO, LogCategory::Network, "Server shut down");
        self.serving.store(false, Ordering::SeqCst);
        status
    }
}
