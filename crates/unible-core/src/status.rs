//! Translation of raw platform status codes
//!
//! GATT statuses become [`BleError`] kinds, HCI disconnect reasons and scan
//! failure codes become readable names.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{BleError, CharacteristicCapability, Result};

// ----------------------------------------------------------------------------
// GATT Status
// ----------------------------------------------------------------------------

/// Raw ATT/GATT status reported with a platform completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GattStatus(pub u16);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0x00);
    pub const INVALID_HANDLE: GattStatus = GattStatus(0x01);
    pub const READ_NOT_PERMITTED: GattStatus = GattStatus(0x02);
    pub const WRITE_NOT_PERMITTED: GattStatus = GattStatus(0x03);
    pub const INVALID_PDU: GattStatus = GattStatus(0x04);
    pub const INSUFFICIENT_AUTHENTICATION: GattStatus = GattStatus(0x05);
    pub const REQUEST_NOT_SUPPORTED: GattStatus = GattStatus(0x06);
    pub const INVALID_OFFSET: GattStatus = GattStatus(0x07);
    pub const INSUFFICIENT_AUTHORIZATION: GattStatus = GattStatus(0x08);
    pub const PREPARE_QUEUE_FULL: GattStatus = GattStatus(0x09);
    pub const ATTR_NOT_FOUND: GattStatus = GattStatus(0x0A);
    pub const ATTR_NOT_LONG: GattStatus = GattStatus(0x0B);
    pub const INSUFFICIENT_KEY_SIZE: GattStatus = GattStatus(0x0C);
    pub const INVALID_ATTRIBUTE_LENGTH: GattStatus = GattStatus(0x0D);
    pub const UNLIKELY: GattStatus = GattStatus(0x0E);
    pub const INSUFFICIENT_ENCRYPTION: GattStatus = GattStatus(0x0F);
    pub const UNSUPPORTED_GROUP: GattStatus = GattStatus(0x10);
    pub const INSUFFICIENT_RESOURCES: GattStatus = GattStatus(0x11);
    pub const ERROR: GattStatus = GattStatus(0x85);
    pub const CONNECTION_CONGESTED: GattStatus = GattStatus(0x8F);
    pub const FAILURE: GattStatus = GattStatus(0x101);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::SUCCESS => "GATT_SUCCESS",
            Self::INVALID_HANDLE => "GATT_INVALID_HANDLE",
            Self::READ_NOT_PERMITTED => "GATT_READ_NOT_PERMITTED",
            Self::WRITE_NOT_PERMITTED => "GATT_WRITE_NOT_PERMITTED",
            Self::INVALID_PDU => "GATT_INVALID_PDU",
            Self::INSUFFICIENT_AUTHENTICATION => "GATT_INSUFFICIENT_AUTHENTICATION",
            Self::REQUEST_NOT_SUPPORTED => "GATT_REQUEST_NOT_SUPPORTED",
            Self::INVALID_OFFSET => "GATT_INVALID_OFFSET",
            Self::INSUFFICIENT_AUTHORIZATION => "GATT_INSUFFICIENT_AUTHORIZATION",
            Self::PREPARE_QUEUE_FULL => "GATT_PREPARE_QUEUE_FULL",
            Self::ATTR_NOT_FOUND => "GATT_ATTR_NOT_FOUND",
            Self::ATTR_NOT_LONG => "GATT_ATTR_NOT_LONG",
            Self::INSUFFICIENT_KEY_SIZE => "GATT_INSUFFICIENT_KEY_SIZE",
            Self::INVALID_ATTRIBUTE_LENGTH => "GATT_INVALID_ATTRIBUTE_LENGTH",
            Self::UNLIKELY => "GATT_UNLIKELY",
            Self::INSUFFICIENT_ENCRYPTION => "GATT_INSUFFICIENT_ENCRYPTION",
            Self::UNSUPPORTED_GROUP => "GATT_UNSUPPORTED_GROUP",
            Self::INSUFFICIENT_RESOURCES => "GATT_INSUFFICIENT_RESOURCES",
            Self::ERROR => "GATT_ERROR",
            Self::CONNECTION_CONGESTED => "GATT_CONNECTION_CONGESTED",
            Self::FAILURE => "GATT_FAILURE",
            _ => return None,
        };
        Some(name)
    }

    /// Map the status onto the error taxonomy
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::SUCCESS => Ok(()),
            Self::READ_NOT_PERMITTED => Err(BleError::CharacteristicDoesNotSupport(
                CharacteristicCapability::Read,
            )),
            Self::WRITE_NOT_PERMITTED => Err(BleError::CharacteristicDoesNotSupport(
                CharacteristicCapability::Write,
            )),
            Self::REQUEST_NOT_SUPPORTED => Err(BleError::not_supported("GATT_REQUEST_NOT_SUPPORTED")),
            Self::INVALID_HANDLE | Self::ATTR_NOT_FOUND => {
                Err(BleError::characteristic_not_found(self))
            }
            other => Err(BleError::Failed {
                status: other.0 as i32,
                message: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "Unknown Error: {}", self.0),
        }
    }
}

// ----------------------------------------------------------------------------
// HCI Disconnect Reasons
// ----------------------------------------------------------------------------

/// Readable name for an HCI error code, `None` for success
pub fn hci_reason_name(code: u8) -> Option<&'static str> {
    let name = match code {
        0x00 => return None,
        0x01 => "Unknown HCI Command",
        0x02 => "Unknown Connection Identifier",
        0x03 => "Hardware Failure",
        0x04 => "Page Timeout",
        0x05 => "Authentication Failure",
        0x06 => "PIN or Key Missing",
        0x07 => "Memory Capacity Exceeded",
        0x08 => "Connection Timeout",
        0x09 => "Connection Limit Exceeded",
        0x0A => "Synchronous Connection Limit To A Device Exceeded",
        0x0B => "Connection Already Exists",
        0x0C => "Command Disallowed",
        0x0D => "Connection Rejected due to Limited Resources",
        0x0E => "Connection Rejected Due To Security Reasons",
        0x0F => "Connection Rejected due to Unacceptable BD_ADDR",
        0x10 => "Connection Accept Timeout Exceeded",
        0x11 => "Unsupported Feature or Parameter Value",
        0x12 => "Invalid HCI Command Parameters",
        0x13 => "Remote User Terminated Connection",
        0x14 => "Remote Device Terminated Connection due to Low Resources",
        0x15 => "Remote Device Terminated Connection due to Power Off",
        0x16 => "Connection Terminated By Local Host",
        0x17 => "Repeated Attempts",
        0x18 => "Pairing Not Allowed",
        0x19 => "Unknown LMP PDU",
        0x1A => "Unsupported Remote Feature / Unsupported LMP Feature",
        0x1B => "SCO Offset Rejected",
        0x1C => "SCO Interval Rejected",
        0x1D => "SCO Air Mode Rejected",
        0x1E => "Invalid LMP Parameters / Invalid LL Parameters",
        0x1F => "Unspecified Error",
        0x20 => "Unsupported LMP Parameter Value / Unsupported LL Parameter Value",
        0x21 => "Role Change Not Allowed",
        0x22 => "LMP Response Timeout / LL Response Timeout",
        0x23 => "LMP Error Transaction Collision / LL Procedure Collision",
        0x24 => "LMP PDU Not Allowed",
        0x25 => "Encryption Mode Not Acceptable",
        0x26 => "Link Key cannot be Changed",
        0x27 => "Requested QoS Not Supported",
        0x28 => "Instant Passed",
        0x29 => "Pairing With Unit Key Not Supported",
        0x2A => "Different Transaction Collision",
        0x2C => "QoS Unacceptable Parameter",
        0x2D => "QoS Rejected",
        0x2E => "Channel Classification Not Supported",
        0x2F => "Insufficient Security",
        0x30 => "Parameter Out Of Mandatory Range",
        0x32 => "Role Switch Pending",
        0x34 => "Reserved Slot Violation",
        0x35 => "Role Switch Failed",
        0x36 => "Extended Inquiry Response Too Large",
        0x37 => "Secure Simple Pairing Not Supported By Host",
        0x38 => "Host Busy - Pairing",
        0x39 => "Connection Rejected due to No Suitable Channel Found",
        0x3A => "Controller Busy",
        0x3B => "Unacceptable Connection Parameters",
        0x3C => "Advertising Timeout",
        0x3D => "Connection Terminated due to MIC Failure",
        0x3E => "Connection Failed to be Established / Synchronization Timeout",
        0x3F => "MAC Connection Failed",
        0x40 => "Coarse Clock Adjustment Rejected but Will Try to Adjust Using Clock Dragging",
        0x41 => "Type0 Submap Not Defined",
        0x42 => "Unknown Advertising Identifier",
        0x43 => "Limit Reached",
        0x44 => "Operation Cancelled by Host",
        0x45 => "Packet Too Long",
        0x2B | 0x31 | 0x33 => "Reserved for future use",
        _ => "Unknown Error",
    };
    Some(name)
}

// ----------------------------------------------------------------------------
// Scan Failures and Bonding
// ----------------------------------------------------------------------------

/// Why the platform refused or aborted a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanFailure {
    AlreadyStarted,
    ApplicationRegistrationFailed,
    InternalError,
    FeatureUnsupported,
    OutOfHardwareResources,
    ScanningTooFrequently,
    Other(i32),
}

impl ScanFailure {
    /// Interpret a platform scan error code
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => ScanFailure::AlreadyStarted,
            2 => ScanFailure::ApplicationRegistrationFailed,
            3 => ScanFailure::InternalError,
            4 => ScanFailure::FeatureUnsupported,
            5 => ScanFailure::OutOfHardwareResources,
            6 => ScanFailure::ScanningTooFrequently,
            other => ScanFailure::Other(other),
        }
    }
}

impl fmt::Display for ScanFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanFailure::AlreadyStarted => f.write_str("SCAN_FAILED_ALREADY_STARTED"),
            ScanFailure::ApplicationRegistrationFailed => {
                f.write_str("SCAN_FAILED_APPLICATION_REGISTRATION_FAILED")
            }
            ScanFailure::InternalError => f.write_str("SCAN_FAILED_INTERNAL_ERROR"),
            ScanFailure::FeatureUnsupported => f.write_str("SCAN_FAILED_FEATURE_UNSUPPORTED"),
            ScanFailure::OutOfHardwareResources => {
                f.write_str("SCAN_FAILED_OUT_OF_HARDWARE_RESOURCES")
            }
            ScanFailure::ScanningTooFrequently => {
                f.write_str("SCAN_FAILED_SCANNING_TOO_FREQUENTLY")
            }
            ScanFailure::Other(code) => write!(f, "ErrorCode: {code}"),
        }
    }
}

/// OS bond state of a remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BondState {
    None,
    Bonding,
    Bonded,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_statuses_map_to_capabilities() {
        assert_eq!(
            GattStatus::READ_NOT_PERMITTED.into_result().unwrap_err(),
            BleError::CharacteristicDoesNotSupport(CharacteristicCapability::Read)
        );
        assert_eq!(
            GattStatus::WRITE_NOT_PERMITTED.into_result().unwrap_err(),
            BleError::CharacteristicDoesNotSupport(CharacteristicCapability::Write)
        );
        assert_eq!(
            GattStatus::ATTR_NOT_FOUND.into_result().unwrap_err().code(),
            "CharacteristicNotFound"
        );
        assert!(GattStatus::SUCCESS.into_result().is_ok());
    }

    #[test]
    fn test_other_statuses_keep_the_raw_code() {
        match GattStatus::ERROR.into_result().unwrap_err() {
            BleError::Failed { status, message } => {
                assert_eq!(status, 0x85);
                assert_eq!(message, "GATT_ERROR");
            }
            other => panic!("unexpected {other:?}"),
        }
        match GattStatus(0x77).into_result().unwrap_err() {
            BleError::Failed { message, .. } => assert_eq!(message, "Unknown Error: 119"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_hci_reason_names() {
        assert_eq!(hci_reason_name(0x00), None);
        assert_eq!(hci_reason_name(0x08), Some("Connection Timeout"));
        assert_eq!(hci_reason_name(0x13), Some("Remote User Terminated Connection"));
        assert_eq!(hci_reason_name(0xFE), Some("Unknown Error"));
    }

    #[test]
    fn test_scan_failure_codes() {
        assert_eq!(ScanFailure::from_code(6), ScanFailure::ScanningTooFrequently);
        assert_eq!(
            ScanFailure::ScanningTooFrequently.to_string(),
            "SCAN_FAILED_SCANNING_TOO_FREQUENTLY"
        );
        assert_eq!(ScanFailure::from_code(42).to_string(), "ErrorCode: 42");
    }
}
