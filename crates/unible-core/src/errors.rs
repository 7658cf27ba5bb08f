//! Error taxonomy for BLE central operations
//!
//! Every failure that reaches a caller is expressed as a [`BleError`] kind.
//! Raw platform status codes never escape; see [`crate::status`] for the
//! translation table.

use core::fmt;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Capability Kinds
// ----------------------------------------------------------------------------

/// Characteristic capability that an operation required but did not find
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CharacteristicCapability {
    Read,
    Write,
    WriteWithoutResponse,
    Notify,
    Indicate,
}

impl fmt::Display for CharacteristicCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CharacteristicCapability::Read => "read",
            CharacteristicCapability::Write => "write",
            CharacteristicCapability::WriteWithoutResponse => "write without response",
            CharacteristicCapability::Notify => "notify",
            CharacteristicCapability::Indicate => "indicate",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors reported by central operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BleError {
    #[error("Bluetooth is not enabled")]
    BluetoothNotEnabled,

    #[error("Device not found: {device_id}")]
    DeviceNotFound { device_id: String },

    #[error("Device disconnected")]
    DeviceDisconnected,

    #[error("Connection already in progress")]
    ConnectionInProgress,

    #[error("Characteristic not found: {characteristic}")]
    CharacteristicNotFound { characteristic: String },

    #[error("Characteristic does not support {0}")]
    CharacteristicDoesNotSupport(CharacteristicCapability),

    #[error("Operation already in progress: {0}")]
    OperationInProgress(String),

    #[error("Pairing failed: {0}")]
    PairingFailed(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Not implemented")]
    NotImplemented,

    #[error("Operation failed: {message} (status {status})")]
    Failed { status: i32, message: String },

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl BleError {
    pub fn device_not_found(device_id: impl Into<String>) -> Self {
        Self::DeviceNotFound {
            device_id: device_id.into(),
        }
    }

    pub fn characteristic_not_found(characteristic: impl fmt::Display) -> Self {
        Self::CharacteristicNotFound {
            characteristic: characteristic.to_string(),
        }
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument(reason.into())
    }

    pub fn not_supported(reason: impl Into<String>) -> Self {
        Self::NotSupported(reason.into())
    }

    /// Stable kind name used when errors cross a process or language boundary
    pub fn code(&self) -> &'static str {
        match self {
            BleError::BluetoothNotEnabled => "BluetoothNotEnabled",
            BleError::DeviceNotFound { .. } => "DeviceNotFound",
            BleError::DeviceDisconnected => "DeviceDisconnected",
            BleError::ConnectionInProgress => "ConnectionInProgress",
            BleError::CharacteristicNotFound { .. } => "CharacteristicNotFound",
            BleError::CharacteristicDoesNotSupport(capability) => match capability {
                CharacteristicCapability::Read => "CharacteristicDoesNotSupportRead",
                CharacteristicCapability::Write => "CharacteristicDoesNotSupportWrite",
                CharacteristicCapability::WriteWithoutResponse => {
                    "CharacteristicDoesNotSupportWriteWithoutResponse"
                }
                CharacteristicCapability::Notify => "CharacteristicDoesNotSupportNotify",
                CharacteristicCapability::Indicate => "CharacteristicDoesNotSupportIndicate",
            },
            BleError::OperationInProgress(_) => "OperationInProgress",
            BleError::PairingFailed(_) => "PairingFailed",
            BleError::InvalidArgument(_) => "InvalidArgument",
            BleError::NotSupported(_) => "NotSupported",
            BleError::NotImplemented => "NotImplemented",
            BleError::Failed { .. } => "Failed",
            BleError::Unknown(_) => "Unknown",
        }
    }
}

pub type Result<T> = core::result::Result<T, BleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_name_the_kind_not_the_message() {
        assert_eq!(
            BleError::device_not_found("AA:BB").code(),
            BleError::device_not_found("CC:DD").code()
        );
        assert_eq!(
            BleError::CharacteristicDoesNotSupport(CharacteristicCapability::WriteWithoutResponse)
                .code(),
            "CharacteristicDoesNotSupportWriteWithoutResponse"
        );
    }

    #[test]
    fn test_failed_message_carries_status() {
        let err = BleError::Failed {
            status: 0x85,
            message: "GATT_ERROR".into(),
        };
        assert_eq!(err.to_string(), "Operation failed: GATT_ERROR (status 133)");
    }
}
