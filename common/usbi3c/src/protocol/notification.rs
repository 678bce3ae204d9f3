// Licensed under the Apache-2.0 license

use crate::codec::CodecError;
use core::convert::TryFrom;
use zerocopy::byteorder::{LittleEndian, U16};
use zerocopy::{FromBytes, Immutable, IntoBytes};

pub const NOTIFICATION_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NotificationType {
    BusInitializationStatus = 0x01,
    AddressChangeStatus = 0x02,
}

impl TryFrom<u8> for NotificationType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0x01 => Ok(NotificationType::BusInitializationStatus),
            0x02 => Ok(NotificationType::AddressChangeStatus),
            _ => Err(CodecError::InvalidField {
                field: "notification type",
                value: value as u32,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum BusInitCode {
    Success = 0x0,
    DeviceDiscoveryFailed = 0x1,
    DynamicAddressAssignmentFailed = 0x2,
    BusConfigurationFailed = 0x3,
}

impl TryFrom<u16> for BusInitCode {
    type Error = CodecError;

    fn try_from(value: u16) -> Result<Self, CodecError> {
        match value {
            0x0 => Ok(BusInitCode::Success),
            0x1 => Ok(BusInitCode::DeviceDiscoveryFailed),
            0x2 => Ok(BusInitCode::DynamicAddressAssignmentFailed),
            0x3 => Ok(BusInitCode::BusConfigurationFailed),
            _ => Err(CodecError::InvalidField {
                field: "bus initialization code",
                value: value as u32,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AddressChangeCode {
    AllAddressChangesSucceeded = 0x0,
    SomeAddressChangesFailed = 0x1,
    HotJoinAddressAssignmentSucceeded = 0x2,
    HotJoinAddressAssignmentFailed = 0x3,
}

impl TryFrom<u16> for AddressChangeCode {
    type Error = CodecError;

    fn try_from(value: u16) -> Result<Self, CodecError> {
        match value {
            0x0 => Ok(AddressChangeCode::AllAddressChangesSucceeded),
            0x1 => Ok(AddressChangeCode::SomeAddressChangesFailed),
            0x2 => Ok(AddressChangeCode::HotJoinAddressAssignmentSucceeded),
            0x3 => Ok(AddressChangeCode::HotJoinAddressAssignmentFailed),
            _ => Err(CodecError::InvalidField {
                field: "address change code",
                value: value as u32,
            }),
        }
    }
}

/// Raw record delivered on the interrupt endpoint.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, PartialEq)]
#[repr(C, packed)]
pub struct Notification {
    pub notification_type: u8,
    reserved: u8,
    pub code: U16<LittleEndian>,
}

/// Typed view of a [`Notification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    BusInitialization(BusInitCode),
    AddressChange(AddressChangeCode),
}

impl Notification {
    pub fn new(notification_type: NotificationType, code: u16) -> Self {
        Notification {
            notification_type: notification_type as u8,
            reserved: 0,
            code: U16::new(code),
        }
    }

    pub fn bus_initialization(code: BusInitCode) -> Self {
        Self::new(NotificationType::BusInitializationStatus, code as u16)
    }

    pub fn address_change(code: AddressChangeCode) -> Self {
        Self::new(NotificationType::AddressChangeStatus, code as u16)
    }

    pub fn kind(&self) -> Result<NotificationKind, CodecError> {
        let code = self.code.get();
        match NotificationType::try_from(self.notification_type)? {
            NotificationType::BusInitializationStatus => Ok(NotificationKind::BusInitialization(
                BusInitCode::try_from(code)?,
            )),
            NotificationType::AddressChangeStatus => Ok(NotificationKind::AddressChange(
                AddressChangeCode::try_from(code)?,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::UsbI3cCodec;

    #[test]
    fn test_decode_hotjoin_notification() {
        let notification = Notification::decode(&[0x02, 0x00, 0x02, 0x00]).unwrap();
        assert_eq!(
            notification.kind().unwrap(),
            NotificationKind::AddressChange(AddressChangeCode::HotJoinAddressAssignmentSucceeded)
        );
    }

    #[test]
    fn test_decode_bus_init_failure() {
        let bytes = Notification::bus_initialization(BusInitCode::DeviceDiscoveryFailed)
            .to_bytes()
            .unwrap();
        assert_eq!(bytes, [0x01, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn test_unknown_type_and_code_rejected() {
        let unknown_type = Notification::decode(&[0x07, 0x00, 0x00, 0x00]).unwrap();
        assert!(unknown_type.kind().is_err());
        let unknown_code = Notification::decode(&[0x01, 0x00, 0x10, 0x00]).unwrap();
        assert!(unknown_code.kind().is_err());
    }

    #[test]
    fn test_short_notification_rejected() {
        assert!(Notification::decode(&[0x01, 0x00]).is_err());
    }
}
