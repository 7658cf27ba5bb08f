//! Devices held connected by the operating system
//!
//! Filtering those devices by service needs each device's service list.
//! Cached lists answer immediately; otherwise every device is inspected in
//! parallel under one bounded deadline, opening short-lived incidental
//! sessions for devices the caller never connected.

use std::time::Duration;

use futures::future::join_all;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use unible_core::{now_millis, parse_uuid, parse_uuids, DeviceId, Result, ScanResult};

use crate::central::{BleCentral, Inner};
use crate::platform::{PlatformAdapter, SystemDevice};

impl<P: PlatformAdapter> BleCentral<P> {
    /// OS-connected devices, optionally only those offering one of `with_services`
    ///
    /// Devices whose services cannot be determined before the deadline count
    /// as not matching.
    pub async fn get_system_devices(&self, with_services: &[String]) -> Result<Vec<ScanResult>> {
        let inner = self.inner();
        let wanted = parse_uuids(with_services)?;
        let devices = inner.platform.connected_system_devices()?;
        debug!("{} system devices connected", devices.len());

        if wanted.is_empty() {
            return Ok(devices
                .iter()
                .map(|device| inner.system_scan_result(device, Vec::new()))
                .collect());
        }

        let all_cached = devices
            .iter()
            .all(|device| inner.registry.cached_services(&device.device_id).is_some());
        let services: Vec<Option<Vec<Uuid>>> = if all_cached {
            devices
                .iter()
                .map(|device| inner.cached_service_uuids(&device.device_id))
                .collect()
        } else {
            inner.inspect_system_devices(&devices).await
        };

        Ok(devices
            .iter()
            .zip(services)
            .filter_map(|(device, services)| {
                let services = services?;
                services
                    .iter()
                    .any(|uuid| wanted.contains(uuid))
                    .then(|| inner.system_scan_result(device, services))
            })
            .collect())
    }
}

impl<P: PlatformAdapter> Inner<P> {
    fn system_scan_result(&self, device: &SystemDevice, services: Vec<Uuid>) -> ScanResult {
        ScanResult {
            device_id: device.device_id.clone(),
            name: device
                .name
                .clone()
                .or_else(|| self.registry.advertised_name(&device.device_id)),
            is_paired: device.is_paired,
            rssi: None,
            manufacturer_data: Vec::new(),
            services,
            timestamp: now_millis(),
        }
    }

    fn cached_service_uuids(&self, device_id: &DeviceId) -> Option<Vec<Uuid>> {
        let cached = self.registry.cached_services(device_id)?;
        Some(
            cached
                .iter()
                .filter_map(|uuid| parse_uuid(uuid).ok())
                .collect(),
        )
    }

    /// Service lists for `devices`, `None` where inspection failed or timed out
    async fn inspect_system_devices(&self, devices: &[SystemDevice]) -> Vec<Option<Vec<Uuid>>> {
        let count = u32::try_from(devices.len()).unwrap_or(u32::MAX);
        let budget = self
            .config
            .system_device_timeout_per_device
            .checked_mul(count)
            .unwrap_or(Duration::MAX);
        let deadline = Instant::now()
            .checked_add(budget)
            .unwrap_or_else(far_future);
        info!(
            "Inspecting {} system devices (deadline {} ms)",
            devices.len(),
            budget.as_millis()
        );

        let inspections = devices.iter().map(|device| async move {
            match timeout_at(deadline, self.device_services(&device.device_id)).await {
                Ok(Ok(services)) => Some(services),
                Ok(Err(e)) => {
                    warn!("Could not inspect {}: {}", device.device_id, e);
                    None
                }
                Err(_) => {
                    warn!("Inspection of {} timed out", device.device_id);
                    None
                }
            }
        });
        let results = join_all(inspections).await;

        // Inspections cut off by the deadline may leave incidental sessions behind
        for device in devices {
            self.close_incidental(&device.device_id);
        }
        results
    }

    async fn device_services(&self, device_id: &DeviceId) -> Result<Vec<Uuid>> {
        if let Some(cached) = self.cached_service_uuids(device_id) {
            return Ok(cached);
        }

        let known = self
            .registry
            .with_session(device_id, |session| {
                session
                    .services()
                    .map(|services| services.iter().map(|s| s.uuid).collect::<Vec<_>>())
            })
            .flatten();
        if let Some(services) = known {
            return Ok(services);
        }

        if !self.registry.contains(device_id) {
            self.connect(device_id, true).await?;
        }
        let services = self.discover_services(device_id, false).await;
        self.close_incidental(device_id);
        Ok(services?.iter().map(|s| s.uuid).collect())
    }

    /// Tear down an incidental session without reporting it
    fn close_incidental(&self, device_id: &DeviceId) {
        let incidental = self
            .registry
            .with_session(device_id, |session| session.is_incidental())
            .unwrap_or(false);
        if !incidental {
            return;
        }

        debug!("Closing incidental session for {}", device_id);
        self.disconnect_link(device_id);
        self.teardown(device_id, None, false);
    }
}

/// Deadline for budgets too large to add to the clock
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365 * 30)
}
