//! Scanning: rate-governed starts, software filtering and result decoding

use std::sync::{Arc, Weak};

use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use unible_core::{
    now_millis, AdvertisementRecord, GovernorConfig, NativeScanFilter, Result, ScanAdmission,
    ScanFailure, ScanFilter, ScanFilterEngine, ScanRateGovernor, ScanResult,
};

use crate::central::{BleCentral, Inner};
use crate::events::CentralEvent;
use crate::platform::{PlatformAdapter, PlatformScanResult};

// ----------------------------------------------------------------------------
// Scan State
// ----------------------------------------------------------------------------

pub(crate) struct ScanState {
    governor: ScanRateGovernor,
    engine: ScanFilterEngine,
    native_filter: NativeScanFilter,
    /// A scan or its deferred retry is wanted
    active: bool,
    retry: Option<JoinHandle<()>>,
    /// Bumped on every stop so a late retry can tell it is stale
    generation: u64,
}

impl ScanState {
    pub(crate) fn new(config: GovernorConfig) -> Self {
        Self {
            governor: ScanRateGovernor::new(config),
            engine: ScanFilterEngine::new(),
            native_filter: NativeScanFilter::default(),
            active: false,
            retry: None,
            generation: 0,
        }
    }

    pub(crate) fn cancel_retry(&mut self) {
        if let Some(handle) = self.retry.take() {
            handle.abort();
        }
    }
}

// ----------------------------------------------------------------------------
// Public Operations
// ----------------------------------------------------------------------------

impl<P: PlatformAdapter> BleCentral<P> {
    /// Start scanning, optionally filtered
    ///
    /// Filter problems are reported here, before the platform is touched. A
    /// start that would exceed the governor's window is deferred and retried
    /// automatically.
    pub fn start_scan(&self, filter: Option<ScanFilter>) -> Result<()> {
        let inner = self.inner();
        inner.require_powered_on()?;

        let native_filter = match &filter {
            Some(filter) => filter.native_filter()?,
            None => NativeScanFilter::default(),
        };
        {
            let mut scan = inner.scan.lock();
            scan.engine.set_filter(filter.as_ref())?;
            scan.native_filter = native_filter;
        }
        if let Some(filter) = &filter {
            debug!(
                "Scan filter: {} services, {} name prefixes, {} manufacturer filters (software: {})",
                filter.services.len(),
                filter.name_prefixes.len(),
                filter.manufacturer_data.len(),
                filter.uses_custom_filters()
            );
        }

        inner.request_scan_start()
    }

    /// Stop scanning and forget any deferred retry
    pub fn stop_scan(&self) -> Result<()> {
        let inner = self.inner();
        inner.require_powered_on()?;
        {
            let mut scan = inner.scan.lock();
            scan.cancel_retry();
            if scan.governor.stop() {
                debug!("Cancelled deferred scan start");
            }
            scan.active = false;
            scan.generation += 1;
        }
        info!("Stopping scan");
        inner.platform.stop_scan()
    }

    /// Platform scanning flag when exposed, otherwise whether a scan or its
    /// deferred retry is active
    pub fn is_scanning(&self) -> bool {
        let inner = self.inner();
        let wanted = inner.scan.lock().active;
        inner.platform.is_scanning().unwrap_or(false) || wanted
    }
}

// ----------------------------------------------------------------------------
// Governed Starts
// ----------------------------------------------------------------------------

impl<P: PlatformAdapter> Inner<P> {
    pub(crate) fn request_scan_start(self: &Arc<Self>) -> Result<()> {
        let mut scan = self.scan.lock();
        match scan.governor.request_start(Instant::now()) {
            ScanAdmission::Admitted => {
                scan.active = true;
                let filter = scan.native_filter.clone();
                drop(scan);
                info!("Starting scan");
                self.platform.start_scan(&filter)
            }
            ScanAdmission::Deferred { retry_after } => {
                scan.active = true;
                scan.cancel_retry();
                let generation = scan.generation;
                scan.retry = Some(spawn_retry(Arc::downgrade(self), retry_after, generation));
                drop(scan);

                if self.platform.capabilities().reports_scan_throttling {
                    self.events
                        .emit(CentralEvent::ScanFailed(ScanFailure::ScanningTooFrequently));
                }
                Ok(())
            }
            ScanAdmission::Dropped => Ok(()),
        }
    }

    fn retry_scan_start(self: &Arc<Self>, generation: u64) {
        {
            let mut scan = self.scan.lock();
            if scan.generation != generation || !scan.active {
                debug!("Stale scan retry ignored");
                return;
            }
            scan.retry = None;
            scan.governor.retry_fired();
        }

        debug!("Retrying deferred scan start");
        if let Err(e) = self.request_scan_start() {
            warn!("Deferred scan start failed: {}", e);
            self.scan.lock().active = false;
        }
    }

    // ------------------------------------------------------------------------
    // Platform Callbacks
    // ------------------------------------------------------------------------

    /// Decode, filter and forward one advertisement
    pub(crate) fn on_scan_result(&self, raw: PlatformScanResult) {
        let record = raw
            .advertisement
            .as_deref()
            .map(AdvertisementRecord::parse)
            .unwrap_or_default();

        let device_id = raw.device_id;
        let name = raw
            .name
            .or_else(|| record.local_name())
            .or_else(|| self.registry.advertised_name(&device_id));
        if let Some(name) = &name {
            self.registry.remember_name(&device_id, name);
        }

        let manufacturer_data = if raw.manufacturer_data.is_empty() {
            record.manufacturer_data().into_iter().collect()
        } else {
            raw.manufacturer_data
        };
        let services = merge_services(raw.services, record.service_uuids());

        let accepted = {
            let scan = self.scan.lock();
            if !scan.active {
                trace!("Scan result for {} after stop dropped", device_id);
                return;
            }
            scan.engine
                .filter_device(name.as_deref(), &manufacturer_data, &services)
        };
        if !accepted {
            trace!("Scan result for {} filtered out", device_id);
            return;
        }

        self.events.emit(CentralEvent::ScanResult(ScanResult {
            device_id,
            name,
            is_paired: raw.is_paired,
            rssi: raw.rssi,
            manufacturer_data,
            services,
            timestamp: now_millis(),
        }));
    }

    pub(crate) fn on_scan_failed(&self, code: i32) {
        let failure = ScanFailure::from_code(code);
        warn!("Scan failed: {}", failure);
        self.scan.lock().active = false;
        self.events.emit(CentralEvent::ScanFailed(failure));
    }
}

fn spawn_retry<P: PlatformAdapter>(
    inner: Weak<Inner<P>>,
    delay: Duration,
    generation: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        sleep(delay).await;
        if let Some(inner) = inner.upgrade() {
            inner.retry_scan_start(generation);
        }
    })
}

fn merge_services(mut reported: Vec<Uuid>, decoded: Vec<Uuid>) -> Vec<Uuid> {
    for uuid in decoded {
        if !reported.contains(&uuid) {
            reported.push(uuid);
        }
    }
    reported
}

#[cfg(test)]
mod tests {
    use super::*;
    use unible_core::uuid_from_u16;

    #[test]
    fn test_merge_services_keeps_order_without_duplicates() {
        let a = uuid_from_u16(0x180D);
        let b = uuid_from_u16(0x1800);
        assert_eq!(merge_services(vec![a], vec![b, a]), vec![a, b]);
        assert_eq!(merge_services(Vec::new(), Vec::new()), Vec::<Uuid>::new());
    }
}
