//! Shared fixtures for central integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use uuid::Uuid;

use unible_central::{
    platform_event_channel, BleCentral, CentralConfig, CentralEvent, CentralEventReceiver,
    FakePeripheral, FakePlatform,
};
use unible_core::{
    uuid_from_u16, BleCharacteristic, BleService, CharacteristicProperties, CharacteristicProperty,
    DeviceId, CCCD_UUID,
};

pub const HEART_RATE_SERVICE: Uuid = uuid_from_u16(0x180D);
pub const HEART_RATE_MEASUREMENT: Uuid = uuid_from_u16(0x2A37);
pub const BODY_SENSOR_LOCATION: Uuid = uuid_from_u16(0x2A38);
pub const BATTERY_SERVICE: Uuid = uuid_from_u16(0x180F);
pub const BATTERY_LEVEL: Uuid = uuid_from_u16(0x2A19);

pub struct Harness {
    pub central: BleCentral<FakePlatform>,
    pub events: CentralEventReceiver,
    pub platform: Arc<FakePlatform>,
}

impl Harness {
    /// Central over a default-config fake stack shaped by `build`
    pub fn new(build: impl FnOnce(FakePlatform) -> FakePlatform) -> Self {
        Self::with_config(build, CentralConfig::default())
    }

    pub fn with_config(
        build: impl FnOnce(FakePlatform) -> FakePlatform,
        config: CentralConfig,
    ) -> Self {
        let (tx, rx) = platform_event_channel();
        let platform = Arc::new(build(FakePlatform::new(tx)));
        let (central, events) = BleCentral::new(Arc::clone(&platform), rx, config);
        Self {
            central,
            events,
            platform,
        }
    }

    pub async fn next_event(&mut self) -> CentralEvent {
        timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for a central event")
            .expect("event stream closed")
    }

    /// Skip events until one satisfies `predicate`
    pub async fn wait_for_event(
        &mut self,
        predicate: impl Fn(&CentralEvent) -> bool,
    ) -> CentralEvent {
        loop {
            let event = self.next_event().await;
            if predicate(&event) {
                return event;
            }
        }
    }

    /// Events already delivered, without waiting
    pub async fn drain_events(&mut self) -> Vec<CentralEvent> {
        settle().await;
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    pub async fn connect_and_discover(&mut self, device_id: &DeviceId) -> Vec<BleService> {
        self.central.connect(device_id).await.expect("connect");
        self.central
            .discover_services(device_id, false)
            .await
            .expect("discover")
    }
}

/// Let spawned tasks run until they block
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Poll `condition` between yields
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

pub fn props(properties: &[CharacteristicProperty]) -> CharacteristicProperties {
    properties.iter().copied().collect()
}

/// Heart-rate sensor: measurement is Read+Notify with a CCCD, location is Read
pub fn heart_rate_sensor(id: &str) -> FakePeripheral {
    FakePeripheral::new(id)
        .with_name("Pulse HR")
        .with_service(
            BleService::new(HEART_RATE_SERVICE)
                .with_characteristic(
                    BleCharacteristic::new(
                        HEART_RATE_MEASUREMENT,
                        props(&[CharacteristicProperty::Read, CharacteristicProperty::Notify]),
                    )
                    .with_descriptor(CCCD_UUID),
                )
                .with_characteristic(BleCharacteristic::new(
                    BODY_SENSOR_LOCATION,
                    props(&[CharacteristicProperty::Read]),
                )),
        )
        .with_service(BleService::new(BATTERY_SERVICE).with_characteristic(
            BleCharacteristic::new(
                BATTERY_LEVEL,
                props(&[
                    CharacteristicProperty::Read,
                    CharacteristicProperty::Write,
                    CharacteristicProperty::WriteWithoutResponse,
                ]),
            ),
        ))
        .with_value(HEART_RATE_SERVICE, BODY_SENSOR_LOCATION, vec![0x01])
        .with_value(BATTERY_SERVICE, BATTERY_LEVEL, vec![0x64])
}

pub fn is_connection_event(event: &CentralEvent) -> bool {
    matches!(event, CentralEvent::ConnectionChanged { .. })
}
