//! OS-connected device listing and service-based filtering

mod common;

use std::time::Duration;

use common::*;
use unible_central::{CentralConfig, FakePeripheral, PlatformCall};
use unible_core::{BleError, BleService, ConnectionState, DeviceId};

fn headset() -> FakePeripheral {
    FakePeripheral::new("AA:BB:CC:DD:EE:20")
        .with_name("Headset")
        .with_service(BleService::new(BATTERY_SERVICE))
        .system_connected()
        .paired()
}

fn strap() -> FakePeripheral {
    heart_rate_sensor("AA:BB:CC:DD:EE:21").system_connected()
}

fn system_harness() -> Harness {
    Harness::new(|p| {
        p.with_peripheral(headset())
            .with_peripheral(strap())
            .with_peripheral(heart_rate_sensor("AA:BB:CC:DD:EE:22"))
    })
}

fn connect_calls(h: &Harness) -> usize {
    h.platform
        .count_calls(|c| matches!(c, PlatformCall::Connect(_)))
}

// ----------------------------------------------------------------------------
// Listing
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_unfiltered_listing_returns_every_system_device() {
    let h = system_harness();

    let devices = h.central.get_system_devices(&[]).await.unwrap();

    let ids: Vec<&str> = devices.iter().map(|d| d.device_id.as_str()).collect();
    assert_eq!(ids, vec!["AA:BB:CC:DD:EE:20", "AA:BB:CC:DD:EE:21"]);
    assert_eq!(devices[0].name.as_deref(), Some("Headset"));
    assert_eq!(devices[0].is_paired, Some(true));
    assert_eq!(connect_calls(&h), 0);
}

#[tokio::test]
async fn test_invalid_service_is_rejected() {
    let h = system_harness();

    assert!(matches!(
        h.central
            .get_system_devices(&["zz".to_string()])
            .await,
        Err(BleError::InvalidArgument(_))
    ));
    assert!(h.platform.calls().is_empty());
}

// ----------------------------------------------------------------------------
// Service Filtering
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_filtering_inspects_devices_through_silent_sessions() {
    let mut h = system_harness();

    let devices = h
        .central
        .get_system_devices(&["180D".to_string()])
        .await
        .unwrap();

    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].device_id, DeviceId::from("AA:BB:CC:DD:EE:21"));
    assert!(devices[0].services.contains(&HEART_RATE_SERVICE));
    assert_eq!(connect_calls(&h), 2);

    // Inspection sessions are closed again and never surface as events
    assert!(h.central.registry().is_empty());
    assert!(!h
        .drain_events()
        .await
        .iter()
        .any(is_connection_event));
}

#[tokio::test]
async fn test_cached_services_answer_without_connecting() {
    let h = system_harness();
    h.central
        .get_system_devices(&["180F".to_string()])
        .await
        .unwrap();
    h.platform.clear_calls();

    let devices = h
        .central
        .get_system_devices(&["180F".to_string()])
        .await
        .unwrap();

    assert_eq!(devices.len(), 2);
    assert_eq!(connect_calls(&h), 0);
}

#[tokio::test]
async fn test_caller_session_survives_inspection() {
    let h = system_harness();
    let strap_id = DeviceId::from("AA:BB:CC:DD:EE:21");
    h.central.connect(&strap_id).await.unwrap();

    let devices = h
        .central
        .get_system_devices(&["180D".to_string()])
        .await
        .unwrap();

    assert_eq!(devices.len(), 1);
    assert_eq!(
        h.central.connection_state(&strap_id),
        ConnectionState::Connected
    );
    assert!(!h.platform.calls().iter().any(|c| {
        matches!(c, PlatformCall::Disconnect(id) if id == &strap_id)
    }));
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_devices_time_out_as_non_matching() {
    let h = Harness::with_config(
        |p| p.with_peripheral(headset()).with_peripheral(strap()),
        CentralConfig::default().with_system_device_timeout(Duration::from_millis(500)),
    );
    h.platform.set_silent(true);

    let devices = h
        .central
        .get_system_devices(&["180D".to_string()])
        .await
        .unwrap();

    assert!(devices.is_empty());
    assert!(h.central.registry().is_empty());
    for id in ["AA:BB:CC:DD:EE:20", "AA:BB:CC:DD:EE:21"] {
        assert_eq!(h.central.pending_operations(&DeviceId::from(id)), 0);
    }
    assert_eq!(
        h.platform
            .count_calls(|c| matches!(c, PlatformCall::Disconnect(_))),
        2
    );
}

#[tokio::test]
async fn test_huge_timeout_saturates_the_deadline() {
    let config = CentralConfig::default().with_system_device_timeout(Duration::MAX);
    let h = Harness::with_config(
        |p| p.with_peripheral(headset()).with_peripheral(strap()),
        config,
    );

    let devices = h
        .central
        .get_system_devices(&["180D".to_string()])
        .await
        .unwrap();

    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].device_id, DeviceId::from("AA:BB:CC:DD:EE:21"));
}

#[tokio::test]
async fn test_inspection_does_not_break_a_later_connect() {
    let h = system_harness();
    h.central
        .get_system_devices(&["180D".to_string()])
        .await
        .unwrap();

    // Platform events for the closed inspection sessions may still be queued
    let strap_id = DeviceId::from("AA:BB:CC:DD:EE:21");
    assert_eq!(h.central.connect(&strap_id).await, Ok(()));
    assert_eq!(
        h.central.connection_state(&strap_id),
        ConnectionState::Connected
    );
}
