//! Simulated peripherals for the demo backend

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

use unible_central::{FakePeripheral, FakePlatform, PlatformCapabilities, PlatformEventSender};
use unible_core::{
    uuid_from_u16, BleCharacteristic, BleService, CharacteristicProperty, DeviceId,
    ManufacturerData, CCCD_UUID,
};

pub const HEART_RATE_STRAP: &str = "D0:E1:00:00:00:01";
pub const THERMOMETER: &str = "D0:E1:00:00:00:02";
pub const KEYBOARD: &str = "D0:E1:00:00:00:03";

const HEART_RATE_SERVICE: u16 = 0x180D;
const HEART_RATE_MEASUREMENT: u16 = 0x2A37;
const BODY_SENSOR_LOCATION: u16 = 0x2A38;
const BATTERY_SERVICE: u16 = 0x180F;
const BATTERY_LEVEL: u16 = 0x2A19;
const HEALTH_THERMOMETER: u16 = 0x1809;
const TEMPERATURE_MEASUREMENT: u16 = 0x2A1C;
const HUMAN_INTERFACE_DEVICE: u16 = 0x1812;
const DEMO_SERVICE: u16 = 0xFFF0;
const DEMO_LABEL: u16 = 0xFFF1;

/// Test company identifier reserved by the Bluetooth SIG
const TEST_COMPANY: u16 = 0xFFFF;

fn characteristic(uuid: u16, properties: &[CharacteristicProperty]) -> BleCharacteristic {
    BleCharacteristic::new(uuid_from_u16(uuid), properties.iter().copied().collect())
}

fn battery_service() -> BleService {
    BleService::new(uuid_from_u16(BATTERY_SERVICE)).with_characteristic(
        characteristic(
            BATTERY_LEVEL,
            &[CharacteristicProperty::Read, CharacteristicProperty::Notify],
        )
        .with_descriptor(CCCD_UUID),
    )
}

fn heart_rate_strap() -> FakePeripheral {
    FakePeripheral::new(HEART_RATE_STRAP)
        .with_name("Demo HR Strap")
        .with_rssi(-52)
        .with_service(
            BleService::new(uuid_from_u16(HEART_RATE_SERVICE))
                .with_characteristic(
                    characteristic(HEART_RATE_MEASUREMENT, &[CharacteristicProperty::Notify])
                        .with_descriptor(CCCD_UUID),
                )
                .with_characteristic(characteristic(
                    BODY_SENSOR_LOCATION,
                    &[CharacteristicProperty::Read],
                )),
        )
        .with_service(battery_service())
        .with_service(
            BleService::new(uuid_from_u16(DEMO_SERVICE)).with_characteristic(characteristic(
                DEMO_LABEL,
                &[
                    CharacteristicProperty::Read,
                    CharacteristicProperty::Write,
                    CharacteristicProperty::WriteWithoutResponse,
                ],
            )),
        )
        .with_value(
            uuid_from_u16(HEART_RATE_SERVICE),
            uuid_from_u16(BODY_SENSOR_LOCATION),
            vec![0x01],
        )
        .with_value(
            uuid_from_u16(BATTERY_SERVICE),
            uuid_from_u16(BATTERY_LEVEL),
            vec![87],
        )
        .with_value(
            uuid_from_u16(DEMO_SERVICE),
            uuid_from_u16(DEMO_LABEL),
            b"unible".to_vec(),
        )
}

fn thermometer() -> FakePeripheral {
    FakePeripheral::new(THERMOMETER)
        .with_name("Demo Thermometer")
        .with_rssi(-74)
        .with_manufacturer_data(ManufacturerData::new(TEST_COMPANY, vec![0x01, 0x09]))
        .with_service(
            BleService::new(uuid_from_u16(HEALTH_THERMOMETER)).with_characteristic(
                characteristic(TEMPERATURE_MEASUREMENT, &[CharacteristicProperty::Indicate])
                    .with_descriptor(CCCD_UUID),
            ),
        )
        .progressive()
}

fn keyboard() -> FakePeripheral {
    FakePeripheral::new(KEYBOARD)
        .with_name("Demo Keyboard")
        .with_service(BleService::new(uuid_from_u16(HUMAN_INTERFACE_DEVICE)))
        .with_service(battery_service())
        .with_value(
            uuid_from_u16(BATTERY_SERVICE),
            uuid_from_u16(BATTERY_LEVEL),
            vec![64],
        )
        .hidden()
        .system_connected()
        .paired()
}

/// Fake stack populated with the demo peripherals
pub fn demo_platform(events: PlatformEventSender) -> FakePlatform {
    FakePlatform::new(events)
        .with_capabilities(PlatformCapabilities {
            mtu_negotiation: true,
            pairing: true,
            rssi: true,
            ..PlatformCapabilities::default()
        })
        .with_peripheral(heart_rate_strap())
        .with_peripheral(thermometer())
        .with_peripheral(keyboard())
}

/// Push heart rate and temperature readings to subscribed characteristics
pub fn spawn_sensor_feed(platform: Arc<FakePlatform>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let strap = DeviceId::from(HEART_RATE_STRAP);
        let thermometer = DeviceId::from(THERMOMETER);
        let mut interval = tokio::time::interval(period);
        let mut tick: u32 = 0;

        loop {
            interval.tick().await;
            tick = tick.wrapping_add(1);

            // Flags 0x00: 8-bit beats per minute
            let bpm = heart_rate_sample(tick);
            platform.notify_value(
                &strap,
                uuid_from_u16(HEART_RATE_SERVICE),
                uuid_from_u16(HEART_RATE_MEASUREMENT),
                vec![0x00, bpm],
            );

            platform.notify_value(
                &thermometer,
                uuid_from_u16(HEALTH_THERMOMETER),
                uuid_from_u16(TEMPERATURE_MEASUREMENT),
                temperature_sample(tick),
            );
            trace!("Demo feed tick {}", tick);
        }
    })
}

/// Triangle wave between 62 and 98 bpm
fn heart_rate_sample(tick: u32) -> u8 {
    let phase = (tick % 36) as u8;
    if phase < 18 {
        62 + phase * 2
    } else {
        98 - (phase - 18) * 2
    }
}

/// Temperature measurement in Celsius as an IEEE-11073 FLOAT with exponent -1
fn temperature_sample(tick: u32) -> Vec<u8> {
    let tenths = 365 + tick % 5;
    let mantissa = tenths.to_le_bytes();
    vec![0x00, mantissa[0], mantissa[1], mantissa[2], 0xFF]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heart_rate_stays_in_range() {
        for tick in 0..100 {
            let bpm = heart_rate_sample(tick);
            assert!((62..=98).contains(&bpm), "{bpm} out of range");
        }
    }

    #[test]
    fn test_temperature_encoding() {
        assert_eq!(temperature_sample(0), vec![0x00, 0x6D, 0x01, 0x00, 0xFF]);
    }
}
