//! Command handlers for the unible CLI

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use unible_central::{BleCentral, CentralEvent, CentralEventReceiver, PlatformAdapter};
use unible_core::{
    parse_uuid, BleService, DeviceId, ManufacturerDataFilter, NotificationMode, ScanFilter,
    ScanResult, WriteType,
};

use crate::cli::Commands;
use crate::config::AppConfig;
use crate::error::{CliError, Result};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command against `central`
    pub async fn execute<P: PlatformAdapter>(
        command: Commands,
        central: BleCentral<P>,
        events: CentralEventReceiver,
        config: &AppConfig,
    ) -> Result<()> {
        let default_duration = config.cli.default_duration_secs;
        match command {
            Commands::State => Self::handle_state_command(&central),
            Commands::Scan {
                services,
                name_prefixes,
                manufacturer,
                duration,
            } => {
                let filter = build_scan_filter(services, name_prefixes, &manufacturer)?;
                let duration = duration.unwrap_or(default_duration);
                Self::handle_scan_command(&central, events, filter, duration).await
            }
            Commands::Services {
                device,
                descriptors,
            } => Self::handle_services_command(&central, &device.into(), descriptors).await,
            Commands::Read {
                device,
                service,
                characteristic,
            } => {
                let (service, characteristic) = parse_pair(&service, &characteristic)?;
                Self::handle_read_command(&central, &device.into(), service, characteristic).await
            }
            Commands::Write {
                device,
                service,
                characteristic,
                value,
                without_response,
            } => {
                let (service, characteristic) = parse_pair(&service, &characteristic)?;
                let value = parse_hex(&value)?;
                let write_type = if without_response {
                    WriteType::WithoutResponse
                } else {
                    WriteType::WithResponse
                };
                Self::handle_write_command(
                    &central,
                    &device.into(),
                    service,
                    characteristic,
                    &value,
                    write_type,
                )
                .await
            }
            Commands::Watch {
                device,
                service,
                characteristic,
                indicate,
                duration,
            } => {
                let (service, characteristic) = parse_pair(&service, &characteristic)?;
                let mode = if indicate {
                    NotificationMode::Indication
                } else {
                    NotificationMode::Notification
                };
                let watch = Watch {
                    device_id: device.into(),
                    service,
                    characteristic,
                    mode,
                    duration: duration.unwrap_or(default_duration),
                };
                Self::handle_watch_command(&central, events, watch).await
            }
            Commands::SystemDevices { services } => {
                Self::handle_system_devices_command(&central, &services).await
            }
            Commands::Config => {
                print!("{}", toml::to_string_pretty(config)?);
                Ok(())
            }
        }
    }

    fn handle_state_command<P: PlatformAdapter>(central: &BleCentral<P>) -> Result<()> {
        let capabilities = central.platform().capabilities();
        println!("Availability:  {:?}", central.availability_state());
        println!("Scanning:      {}", central.is_scanning());
        println!("MTU exchange:  {}", capabilities.mtu_negotiation);
        println!("Pairing:       {}", capabilities.pairing);
        println!("Adapter power: {}", capabilities.adapter_toggle);
        println!("RSSI reads:    {}", capabilities.rssi);
        Ok(())
    }

    async fn handle_scan_command<P: PlatformAdapter>(
        central: &BleCentral<P>,
        mut events: CentralEventReceiver,
        filter: Option<ScanFilter>,
        duration: u64,
    ) -> Result<()> {
        central.start_scan(filter)?;
        if duration == 0 {
            info!("Scanning... Press Ctrl+C to stop");
        } else {
            info!("Scanning for {} seconds", duration);
        }

        let mut seen: BTreeMap<DeviceId, ScanResult> = BTreeMap::new();
        let deadline = deadline_after(duration);
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = sleep_until(deadline) => break,
                _ = tokio::signal::ctrl_c() => break,
            };
            match event {
                Some(CentralEvent::ScanResult(result)) => {
                    if !seen.contains_key(&result.device_id) {
                        println!("{}", format_scan_result(&result));
                    }
                    seen.insert(result.device_id.clone(), result);
                }
                Some(CentralEvent::ScanFailed(failure)) => warn!("Scan failed: {}", failure),
                Some(_) => {}
                None => break,
            }
        }

        central.stop_scan()?;
        println!("{} devices found", seen.len());
        Ok(())
    }

    async fn handle_services_command<P: PlatformAdapter>(
        central: &BleCentral<P>,
        device_id: &DeviceId,
        descriptors: bool,
    ) -> Result<()> {
        central.connect(device_id).await?;
        let result = central.discover_services(device_id, descriptors).await;
        close(central, device_id);

        for service in result? {
            print!("{}", format_service(&service));
        }
        Ok(())
    }

    async fn handle_read_command<P: PlatformAdapter>(
        central: &BleCentral<P>,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        open_session(central, device_id).await?;
        let result = central.read_value(device_id, service, characteristic).await;
        close(central, device_id);

        println!("{}", hex::encode(result?));
        Ok(())
    }

    async fn handle_write_command<P: PlatformAdapter>(
        central: &BleCentral<P>,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        open_session(central, device_id).await?;
        let result = central
            .write_value(device_id, service, characteristic, value, write_type)
            .await;
        close(central, device_id);

        result?;
        println!("Wrote {} bytes to {}", value.len(), characteristic);
        Ok(())
    }

    async fn handle_watch_command<P: PlatformAdapter>(
        central: &BleCentral<P>,
        mut events: CentralEventReceiver,
        watch: Watch,
    ) -> Result<()> {
        let device_id = &watch.device_id;
        open_session(central, device_id).await?;
        if let Err(e) = central
            .set_notifiable(device_id, watch.service, watch.characteristic, watch.mode)
            .await
        {
            close(central, device_id);
            return Err(e.into());
        }
        info!("Watching {} on {}", watch.characteristic, device_id);

        let deadline = deadline_after(watch.duration);
        let mut received = 0usize;
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = sleep_until(deadline) => break,
                _ = tokio::signal::ctrl_c() => break,
            };
            match event {
                Some(CentralEvent::ValueChanged {
                    device_id: source,
                    characteristic,
                    value,
                    timestamp,
                    ..
                }) if &source == device_id && characteristic == watch.characteristic => {
                    received += 1;
                    println!("{} {}", timestamp, hex::encode(value));
                }
                Some(CentralEvent::ConnectionChanged {
                    device_id: source,
                    connected: false,
                    error,
                }) if &source == device_id => {
                    warn!(
                        "{} disconnected: {}",
                        device_id,
                        error.as_deref().unwrap_or("no reason given")
                    );
                    return Ok(());
                }
                Some(_) => {}
                None => break,
            }
        }

        if let Err(e) = central
            .set_notifiable(
                device_id,
                watch.service,
                watch.characteristic,
                NotificationMode::Disabled,
            )
            .await
        {
            warn!("Failed to unsubscribe: {}", e);
        }
        close(central, device_id);
        println!("{} values received", received);
        Ok(())
    }

    async fn handle_system_devices_command<P: PlatformAdapter>(
        central: &BleCentral<P>,
        services: &[String],
    ) -> Result<()> {
        let devices = central.get_system_devices(services).await?;
        for device in &devices {
            println!("{}", format_scan_result(device));
        }
        println!("{} system devices", devices.len());
        Ok(())
    }
}

struct Watch {
    device_id: DeviceId,
    service: Uuid,
    characteristic: Uuid,
    mode: NotificationMode,
    duration: u64,
}

// ----------------------------------------------------------------------------
// Session Helpers
// ----------------------------------------------------------------------------

async fn open_session<P: PlatformAdapter>(
    central: &BleCentral<P>,
    device_id: &DeviceId,
) -> Result<Vec<BleService>> {
    central.connect(device_id).await?;
    match central.discover_services(device_id, false).await {
        Ok(services) => Ok(services),
        Err(e) => {
            close(central, device_id);
            Err(e.into())
        }
    }
}

fn close<P: PlatformAdapter>(central: &BleCentral<P>, device_id: &DeviceId) {
    if let Err(e) = central.disconnect(device_id) {
        warn!("Failed to disconnect {}: {}", device_id, e);
    }
}

/// `None` when `secs` is 0
fn deadline_after(secs: u64) -> Option<Instant> {
    (secs > 0).then(|| Instant::now() + Duration::from_secs(secs))
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ----------------------------------------------------------------------------
// Argument Parsing
// ----------------------------------------------------------------------------

fn parse_pair(service: &str, characteristic: &str) -> Result<(Uuid, Uuid)> {
    Ok((parse_uuid(service)?, parse_uuid(characteristic)?))
}

/// Hex value, with optional `0x` prefix and separators
pub fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let cleaned: String = input
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !matches!(c, ' ' | ':' | '-'))
        .collect();
    Ok(hex::decode(cleaned)?)
}

/// Parse `COMPANY[:DATA[:MASK]]`, all in hex
pub fn parse_manufacturer_filter(input: &str) -> Result<ManufacturerDataFilter> {
    let mut parts = input.split(':');
    let company = parts.next().unwrap_or_default();
    let company = u16::from_str_radix(company.trim_start_matches("0x"), 16).map_err(|_| {
        CliError::InvalidArgument(format!("Invalid company identifier: {company}"))
    })?;

    let mut filter = ManufacturerDataFilter::new(company);
    if let Some(data) = parts.next() {
        filter = filter.with_data(hex::decode(data)?);
    }
    if let Some(mask) = parts.next() {
        filter = filter.with_mask(hex::decode(mask)?);
    }
    if parts.next().is_some() {
        return Err(CliError::InvalidArgument(format!(
            "Manufacturer filter has too many parts: {input}"
        )));
    }
    Ok(filter)
}

pub fn build_scan_filter(
    services: Vec<String>,
    name_prefixes: Vec<String>,
    manufacturer: &[String],
) -> Result<Option<ScanFilter>> {
    let mut filter = ScanFilter::new();
    for service in services {
        filter = filter.with_service(service);
    }
    for prefix in name_prefixes {
        filter = filter.with_name_prefix(prefix);
    }
    for entry in manufacturer {
        filter = filter.with_manufacturer_data(parse_manufacturer_filter(entry)?);
    }

    if filter.is_empty() {
        return Ok(None);
    }
    filter.validate()?;
    Ok(Some(filter))
}

// ----------------------------------------------------------------------------
// Output Formatting
// ----------------------------------------------------------------------------

fn format_scan_result(result: &ScanResult) -> String {
    let mut line = format!(
        "{}  {:<20}",
        result.device_id,
        result.name.as_deref().unwrap_or("(unnamed)")
    );
    if let Some(rssi) = result.rssi {
        line.push_str(&format!("  {rssi} dBm"));
    }
    if result.is_paired == Some(true) {
        line.push_str("  paired");
    }
    for uuid in &result.services {
        line.push_str(&format!("  {uuid}"));
    }
    for data in &result.manufacturer_data {
        line.push_str(&format!("  mfr {data}"));
    }
    line
}

fn format_service(service: &BleService) -> String {
    let mut out = format!("{}\n", service.uuid);
    for characteristic in &service.characteristics {
        let properties: Vec<String> = characteristic
            .properties
            .iter()
            .map(|p| format!("{p:?}"))
            .collect();
        out.push_str(&format!(
            "  {} [{}]\n",
            characteristic.uuid,
            properties.join(", ")
        ));
        for descriptor in &characteristic.descriptors {
            out.push_str(&format!("    {}\n", descriptor.uuid));
        }
    }
    out
}
