//! Memory driver behaviour as seen through the bus traits only.

use std::sync::Arc;
use std::time::Duration;

use opcua_gateway_core::bus::{Control, DeviceDriver, DeviceFilter};
use opcua_gateway_core::key::NodeKey;
use opcua_gateway_core::value::ControlValue;
use opcua_gateway_devices::MemoryDriver;

#[tokio::test]
async fn test_write_is_echoed_as_event() {
    let driver = Arc::new(MemoryDriver::new());
    driver.create_control("test", "test", "switch", false);
    driver.wait_for_ready(Duration::from_secs(1)).unwrap();

    let mut rx = driver.subscribe();
    let control = {
        let tx = driver.begin_tx();
        tx.control(&NodeKey::parse("test/test").unwrap()).unwrap()
    };
    control.set_value(&ControlValue::Boolean(true)).unwrap();

    let event = rx.recv().await.unwrap();
    assert_eq!(event.raw_value, "1");
    assert_eq!(event.control.value().unwrap(), ControlValue::Boolean(true));
}

#[tokio::test]
async fn test_filter_change_stops_events() {
    let driver = MemoryDriver::new();
    driver.create_control("kitchen", "light", "switch", false);

    let mut rx = driver.subscribe();
    driver.publish_value("kitchen", "light", "1");
    assert!(rx.recv().await.is_some());

    driver
        .set_filter(DeviceFilter::devices(["hall"]))
        .unwrap();
    driver.publish_value("kitchen", "light", "0");
    assert!(rx.try_recv().is_none());

    // The value itself is still tracked.
    assert_eq!(driver.control("kitchen", "light").unwrap().raw_value(), "0");
}

#[test]
fn test_error_flags() {
    let driver = MemoryDriver::new();
    let control = driver.create_control("dev", "temp", "temperature", true);
    assert!(!opcua_gateway_core::Control::has_read_error(control.as_ref()));

    control.set_error("r");
    assert!(opcua_gateway_core::Control::has_read_error(control.as_ref()));
}
