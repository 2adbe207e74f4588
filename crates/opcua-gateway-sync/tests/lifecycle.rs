//! Gateway start/stop behaviour.

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use serde_json::json;

use opcua_gateway_core::address_space::{
    AccessLevel, AddressSpace, DataSource, DataType, NodeId, ServerError, ServerRuntime,
    ServerSettings, StatusCode, VariableAttributes,
};
use opcua_gateway_core::bus::{
    BusError, BusResult, ControlEventReceiver, DeviceDriver, DeviceFilter, DriverTx,
};
use opcua_gateway_core::config::GatewayConfig;
use opcua_gateway_core::key::NodeKey;
use opcua_gateway_devices::MemoryDriver;
use opcua_gateway_server::{MemoryServer, UaServer};
use opcua_gateway_sync::{Gateway, GatewayError, GatewayState};

const GRACE: Duration = Duration::from_secs(5);

fn config(value: serde_json::Value) -> GatewayConfig {
    GatewayConfig::from_value(value).unwrap()
}

fn static_config() -> GatewayConfig {
    config(json!({
        "opcua": { "port": 4841 },
        "groups": [
            { "name": "test", "enabled": true,
              "controls": [ { "topic": "test/test", "enabled": true } ] }
        ]
    }))
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + GRACE;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_start_provisions_and_stop_is_idempotent() {
    let driver = Arc::new(MemoryDriver::new());
    driver.create_control("test", "test", "switch", false).publish("1");
    let server = Arc::new(MemoryServer::new());

    let gateway = Gateway::new(static_config(), driver.clone(), server.clone());
    assert_eq!(gateway.state(), GatewayState::Created);

    gateway.start().unwrap();
    assert_eq!(gateway.state(), GatewayState::Running);
    assert_eq!(
        driver.filter(),
        DeviceFilter::devices(["test"])
    );
    assert_eq!(server.settings().unwrap().port, 4841);
    assert!(server.contains(&NodeId::string(1, "test/test")));
    wait_until(|| server.is_serving()).await;

    assert!(matches!(gateway.start(), Err(GatewayError::Server(_))));

    gateway.stop(GRACE).unwrap();
    assert_eq!(gateway.state(), GatewayState::Stopped);
    assert!(!server.is_serving());
    gateway.stop(GRACE).unwrap();

    assert!(matches!(
        gateway.start(),
        Err(GatewayError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_reactive_events_after_start() {
    let driver = Arc::new(MemoryDriver::new());
    driver.create_control("room", "temp", "temperature", true).publish("20");
    let server = Arc::new(MemoryServer::new());
    let gateway = Gateway::new(
        config(json!({
            "mode": "reactive",
            "groups": [ { "name": "room", "enabled": true, "controls": [] } ]
        })),
        driver.clone(),
        server.clone(),
    );
    gateway.start().unwrap();

    // Known before start.
    assert!(server.contains(&NodeId::string(1, "room/temp")));

    driver.create_control("room", "hum", "rel_humidity", true);
    driver.publish_value("room", "hum", "40");
    let key = NodeKey::parse("room/hum").unwrap();
    wait_until(|| gateway.engine().registry().exists(&key)).await;
    assert_eq!(server.node_count(), 4);

    gateway.stop(GRACE).unwrap();
}

#[tokio::test]
async fn test_fatal_hook_on_serving_failure() {
    let driver = Arc::new(MemoryDriver::new());
    let server = Arc::new(MemoryServer::new());
    let (tx, rx) = mpsc::channel();
    let tx = parking_lot::Mutex::new(tx);

    let gateway = Gateway::new(static_config(), driver, server.clone()).with_fatal_hook(
        Arc::new(move |status| {
            let _ = tx.lock().send(status);
        }),
    );
    gateway.start().unwrap();
    server.inject_failure(StatusCode::BadCommunicationError);

    let status = tokio::task::spawn_blocking(move || rx.recv_timeout(GRACE))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, StatusCode::BadCommunicationError);

    gateway.stop(GRACE).unwrap();
}

#[tokio::test]
async fn test_configure_failure_aborts_start() {
    let driver = Arc::new(MemoryDriver::new());
    let server = Arc::new(MemoryServer::new());
    let gateway = Gateway::new(
        config(json!({
            "opcua": { "application_uri": "" },
            "groups": []
        })),
        driver,
        server.clone(),
    );

    assert!(matches!(gateway.start(), Err(GatewayError::Server(_))));
    assert_eq!(gateway.state(), GatewayState::Created);
    assert!(!server.is_serving());
}

struct NeverReady(MemoryDriver);

impl DeviceDriver for NeverReady {
    fn set_filter(&self, filter: DeviceFilter) -> BusResult<()> {
        self.0.set_filter(filter)
    }

    fn wait_for_ready(&self, timeout: Duration) -> BusResult<()> {
        Err(BusError::Timeout(timeout.as_millis() as u64))
    }

    fn begin_tx(&self) -> Box<dyn DriverTx + '_> {
        self.0.begin_tx()
    }

    fn subscribe(&self) -> ControlEventReceiver {
        self.0.subscribe()
    }
}

#[tokio::test]
async fn test_driver_timeout_aborts_start() {
    let server = Arc::new(MemoryServer::new());
    let gateway = Gateway::new(
        static_config(),
        Arc::new(NeverReady(MemoryDriver::new())),
        server.clone(),
    )
    .with_init_timeout(Duration::from_millis(10));

    assert!(matches!(
        gateway.start(),
        Err(GatewayError::Bus(BusError::Timeout(10)))
    ));
    assert!(server.settings().is_none());
    assert_eq!(server.node_count(), 1);
}

#[test]
fn test_start_requires_tokio_runtime() {
    let gateway = Gateway::new(
        static_config(),
        Arc::new(MemoryDriver::new()),
        Arc::new(MemoryServer::new()),
    );
    assert!(matches!(gateway.start(), Err(GatewayError::NoRuntime(_))));
}

#[tokio::test]
async fn test_drop_stops_serving() {
    let server = Arc::new(MemoryServer::new());
    let gateway = Gateway::new(
        static_config(),
        Arc::new(MemoryDriver::new()),
        server.clone(),
    );
    gateway.start().unwrap();
    wait_until(|| server.is_serving()).await;

    drop(gateway);
    assert!(!server.is_serving());
}

/// Runtime whose serving loop ignores the run flag until released.
struct StuckServer {
    space: MemoryServer,
    release: parking_lot::Mutex<mpsc::Receiver<()>>,
}

impl AddressSpace for StuckServer {
    fn browse(&self, parent: &NodeId, browse_name: &str) -> Option<NodeId> {
        self.space.browse(parent, browse_name)
    }

    fn contains(&self, node_id: &NodeId) -> bool {
        self.space.contains(node_id)
    }

    fn add_object_node(
        &self,
        node_id: NodeId,
        parent: &NodeId,
        browse_name: &str,
        display_name: &str,
    ) -> Result<NodeId, StatusCode> {
        self.space
            .add_object_node(node_id, parent, browse_name, display_name)
    }

    fn add_variable_node(
        &self,
        node_id: NodeId,
        parent: &NodeId,
        attributes: VariableAttributes,
        data_source: Arc<dyn DataSource>,
    ) -> Result<NodeId, StatusCode> {
        self.space
            .add_variable_node(node_id, parent, attributes, data_source)
    }

    fn set_variable_attributes(
        &self,
        node_id: &NodeId,
        data_type: DataType,
        access_level: AccessLevel,
    ) -> Result<(), StatusCode> {
        self.space
            .set_variable_attributes(node_id, data_type, access_level)
    }

    fn node_count(&self) -> usize {
        self.space.node_count()
    }
}

impl ServerRuntime for StuckServer {
    fn configure(&self, settings: &ServerSettings) -> Result<(), ServerError> {
        self.space.configure(settings)
    }

    fn run(&self, _running: &std::sync::atomic::AtomicBool) -> StatusCode {
        let _ = self.release.lock().recv_timeout(Duration::from_secs(10));
        StatusCode::Good
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_times_out_on_stuck_serving_loop() {
    let (release, released) = mpsc::channel();
    let server = Arc::new(StuckServer {
        space: MemoryServer::new(),
        release: parking_lot::Mutex::new(released),
    });
    let gateway = Gateway::new(static_config(), Arc::new(MemoryDriver::new()), server);
    gateway.start().unwrap();

    let grace = Duration::from_millis(50);
    assert!(matches!(
        gateway.stop(grace),
        Err(GatewayError::Server(ServerError::ShutdownTimeout(50)))
    ));
    assert_eq!(gateway.state(), GatewayState::Stopped);
    assert!(gateway.stop(grace).is_ok());

    release.send(()).unwrap();
}

fn ua_config(port: u16, pki: &tempfile::TempDir) -> GatewayConfig {
    config(json!({
        "opcua": { "host": "127.0.0.1", "port": port, "pki_dir": pki.path() },
        "groups": [
            { "name": "test", "enabled": true,
              "controls": [ { "topic": "test/test", "enabled": true } ] }
        ]
    }))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_opc_tcp_endpoint_accepts_connections() {
    let pki = tempfile::tempdir().unwrap();
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let driver = Arc::new(MemoryDriver::new());
    driver.create_control("test", "test", "switch", false).publish("1");
    let server = Arc::new(UaServer::new());

    let gateway = Gateway::new(ua_config(port, &pki), driver, server.clone());
    gateway.start().unwrap();
    assert!(server.contains(&NodeId::string(1, "test/test")));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_err() {
        assert!(tokio::time::Instant::now() < deadline, "endpoint never accepted");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    tokio::task::block_in_place(|| gateway.stop(GRACE)).unwrap();
    assert!(!server.is_serving());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bind_failure_reaches_fatal_hook() {
    let pki = tempfile::tempdir().unwrap();
    let occupant = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupant.local_addr().unwrap().port();
    let (tx, rx) = mpsc::channel();
    let tx = parking_lot::Mutex::new(tx);

    let gateway = Gateway::new(
        ua_config(port, &pki),
        Arc::new(MemoryDriver::new()),
        Arc::new(UaServer::new()),
    )
    .with_fatal_hook(Arc::new(move |status| {
        let _ = tx.lock().send(status);
    }));
    gateway.start().unwrap();

    let status = tokio::task::spawn_blocking(move || rx.recv_timeout(GRACE))
        .await
        .unwrap()
        .unwrap();
    assert!(status.is_bad());

    tokio::task::block_in_place(|| gateway.stop(GRACE)).unwrap();
    drop(occupant);
}
