//! Service discovery tests: queuing, progressive trees and the service cache

mod common;

use std::time::Duration;

use common::*;
use unible_central::{CentralConfig, PlatformCall, PlatformEvent};
use unible_core::{
    BleCharacteristic, BleError, BleService, CharacteristicProperty, DeviceId, DiscoveredService,
    GattStatus, JsonFileServiceCache, ServiceCache, CCCD_UUID, DEFAULT_CACHE_NAMESPACE,
};

fn sensor() -> DeviceId {
    DeviceId::from("AA:BB:CC:DD:EE:02")
}

// ----------------------------------------------------------------------------
// Discovery Queuing
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrent_discoveries_share_one_platform_request() {
    let h = Harness::new(|p| p.with_peripheral(heart_rate_sensor("AA:BB:CC:DD:EE:02")));
    h.central.connect(&sensor()).await.unwrap();
    h.platform.set_silent(true);

    let mut callers = Vec::new();
    for with_descriptors in [true, false] {
        let central = h.central.clone();
        callers.push(tokio::spawn(async move {
            central.discover_services(&sensor(), with_descriptors).await
        }));
    }
    let central = h.central.clone();
    wait_until(move || central.pending_operations(&sensor()) == 2).await;

    let expected = vec![BleService::new(BATTERY_SERVICE).with_characteristic(
        BleCharacteristic::new(BATTERY_LEVEL, props(&[CharacteristicProperty::Read]))
            .with_descriptor(CCCD_UUID),
    )];
    h.platform.emit(PlatformEvent::ServicesDiscovered {
        device_id: sensor(),
        status: GattStatus::SUCCESS,
        services: expected.iter().map(DiscoveredService::from).collect(),
    });

    for caller in callers {
        assert_eq!(caller.await.unwrap().unwrap(), expected);
    }
    assert_eq!(
        h.platform
            .count_calls(|c| matches!(c, PlatformCall::DiscoverServices(_))),
        1
    );
}

#[tokio::test]
async fn test_discovery_failure_fails_every_caller() {
    let h = Harness::new(|p| p.with_peripheral(heart_rate_sensor("AA:BB:CC:DD:EE:02")));
    h.central.connect(&sensor()).await.unwrap();
    h.platform.set_silent(true);

    let mut callers = Vec::new();
    for _ in 0..2 {
        let central = h.central.clone();
        callers.push(tokio::spawn(async move {
            central.discover_services(&sensor(), false).await
        }));
    }
    let central = h.central.clone();
    wait_until(move || central.pending_operations(&sensor()) == 2).await;

    h.platform.emit(PlatformEvent::ServicesDiscovered {
        device_id: sensor(),
        status: GattStatus::ERROR,
        services: Vec::new(),
    });

    for caller in callers {
        assert!(matches!(
            caller.await.unwrap(),
            Err(BleError::Failed { status: 0x85, .. })
        ));
    }
    let discovering = h
        .central
        .registry()
        .with_session(&sensor(), |session| session.is_discovering());
    assert_eq!(discovering, Some(false));
}

#[tokio::test]
async fn test_discovery_requires_connection() {
    let h = Harness::new(|p| p.with_peripheral(heart_rate_sensor("AA:BB:CC:DD:EE:02")));

    assert!(matches!(
        h.central.discover_services(&sensor(), false).await,
        Err(BleError::DeviceNotFound { .. })
    ));
    assert!(h.platform.calls().is_empty());
}

// ----------------------------------------------------------------------------
// Progressive Discovery
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_progressive_discovery_walks_every_level() {
    let h = Harness::new(|p| {
        p.with_peripheral(heart_rate_sensor("AA:BB:CC:DD:EE:02").progressive())
    });
    h.central.connect(&sensor()).await.unwrap();

    let services = h.central.discover_services(&sensor(), true).await.unwrap();

    assert_eq!(services.len(), 2);
    let measurement = services[0]
        .characteristic(&HEART_RATE_MEASUREMENT)
        .expect("measurement characteristic");
    assert!(measurement.has_descriptor(&CCCD_UUID));
    assert_eq!(
        h.platform
            .count_calls(|c| matches!(c, PlatformCall::DiscoverCharacteristics { .. })),
        2
    );
    assert_eq!(
        h.platform
            .count_calls(|c| matches!(c, PlatformCall::DiscoverDescriptors { .. })),
        3
    );
}

#[tokio::test]
async fn test_progressive_discovery_skips_descriptors_when_not_asked() {
    let h = Harness::new(|p| {
        p.with_peripheral(heart_rate_sensor("AA:BB:CC:DD:EE:02").progressive())
    });
    h.central.connect(&sensor()).await.unwrap();

    let services = h.central.discover_services(&sensor(), false).await.unwrap();

    assert_eq!(services.len(), 2);
    assert_eq!(
        h.platform
            .count_calls(|c| matches!(c, PlatformCall::DiscoverDescriptors { .. })),
        0
    );
}

// ----------------------------------------------------------------------------
// Service Cache
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_discovery_records_service_uuids() {
    let h = Harness::new(|p| p.with_peripheral(heart_rate_sensor("AA:BB:CC:DD:EE:02")));
    h.central.connect(&sensor()).await.unwrap();
    h.central.discover_services(&sensor(), false).await.unwrap();

    let cached = h.central.registry().cached_services(&sensor()).unwrap();
    assert_eq!(
        cached,
        vec![HEART_RATE_SERVICE.to_string(), BATTERY_SERVICE.to_string()]
    );
}

#[tokio::test]
async fn test_service_cache_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = CentralConfig::default().with_cache_dir(dir.path());

    {
        let h = Harness::with_config(
            |p| p.with_peripheral(heart_rate_sensor("AA:BB:CC:DD:EE:02")),
            config.clone(),
        );
        h.central.connect(&sensor()).await.unwrap();
        h.central.discover_services(&sensor(), false).await.unwrap();
    }

    // The cache file is written off the dispatcher task
    let file = dir.path().join("com.unible.services.json");
    for _ in 0..500 {
        let on_disk = JsonFileServiceCache::open(dir.path(), DEFAULT_CACHE_NAMESPACE);
        if on_disk.load_all().is_ok_and(|entries| !entries.is_empty()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let restarted = Harness::with_config(|p| p, config);
    let cached = restarted.central.registry().cached_services(&sensor());
    assert_eq!(cached.map(|services| services.len()), Some(2));
    assert!(file.exists());
}
