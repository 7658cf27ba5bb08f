//! Events emitted by the central toward its consumer

use tokio::sync::mpsc;
use uuid::Uuid;

use unible_core::{AvailabilityState, DeviceId, ScanFailure, ScanResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralEvent {
    AvailabilityChanged(AvailabilityState),
    ScanResult(ScanResult),
    ScanFailed(ScanFailure),
    ConnectionChanged {
        device_id: DeviceId,
        connected: bool,
        error: Option<String>,
    },
    ValueChanged {
        device_id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
        /// Milliseconds since the Unix epoch
        timestamp: u64,
    },
    PairStateChanged {
        device_id: DeviceId,
        is_paired: bool,
        error: Option<String>,
    },
}

pub type CentralEventReceiver = mpsc::UnboundedReceiver<CentralEvent>;

/// Sending half of the outbound event stream
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    sender: mpsc::UnboundedSender<CentralEvent>,
}

impl EventSink {
    pub(crate) fn channel() -> (Self, CentralEventReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub(crate) fn emit(&self, event: CentralEvent) {
        if self.sender.send(event).is_err() {
            tracing::debug!("Central event dropped: receiver closed");
        }
    }
}
