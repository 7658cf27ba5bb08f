//! unible central
//!
//! A single BLE central-role coordinator over interchangeable native stacks.
//!
//! ## Architecture
//!
//! ```text
//! caller ──► BleCentral ──► DeviceRegistry / GattSession (validate)
//!                │                 │
//!                │                 └─► PendingOperationRegistry (register waiter)
//!                ▼
//!         PlatformAdapter (submit) ── PlatformEvent ──► dispatcher ──► resolve waiter
//!                                                           │
//!                                                           └─► CentralEvent stream
//! ```
//!
//! Platforms plug in through [`PlatformAdapter`]. [`FakePlatform`] is a
//! deterministic in-memory stack; the `native` feature adds an adapter over
//! btleplug.
//!
//! ```no_run
//! use std::sync::Arc;
//! use unible_central::{platform_event_channel, BleCentral, CentralConfig, FakePlatform};
//!
//! # async fn run() -> unible_core::Result<()> {
//! let (tx, rx) = platform_event_channel();
//! let platform = Arc::new(FakePlatform::new(tx));
//! let (central, mut events) = BleCentral::new(platform, rx, CentralConfig::default());
//!
//! central.start_scan(None)?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod central;
pub mod config;
pub mod events;
pub mod platform;

mod dispatch;
mod scanning;
mod system;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use central::BleCentral;
pub use config::CentralConfig;
pub use events::{CentralEvent, CentralEventReceiver};
pub use platform::fake::{FakePeripheral, FakePlatform, PlatformCall};
pub use platform::{
    platform_event_channel, PlatformAdapter, PlatformCapabilities, PlatformEvent,
    PlatformEventReceiver, PlatformEventSender, PlatformScanResult, SystemDevice,
};

#[cfg(feature = "native")]
pub use platform::native::BtleplugPlatform;
