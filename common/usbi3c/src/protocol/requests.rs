// Licensed under the Apache-2.0 license

use crate::codec::CodecError;
use core::convert::TryFrom;

/// Largest buffer requested by a class-specific control IN transfer.
pub const MAX_CONTROL_IN_LENGTH: usize = 2048;

/// GET_BUFFER_AVAILABLE answers with a single dword.
pub const BUFFER_AVAILABLE_LEN: usize = 4;

/// Class-specific control requests (bRequest).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClassRequest {
    ClearFeature = 0x01,
    SetFeature = 0x03,
    GetI3cCapability = 0x04,
    InitializeI3cBus = 0x05,
    GetTargetDeviceTable = 0x06,
    SetTargetDeviceConfig = 0x07,
    ChangeDynamicAddress = 0x08,
    GetAddressChangeResult = 0x09,
    GetBufferAvailable = 0x0A,
    CancelOrResumeBulkRequest = 0x0B,
}

impl TryFrom<u8> for ClassRequest {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0x01 => Ok(ClassRequest::ClearFeature),
            0x03 => Ok(ClassRequest::SetFeature),
            0x04 => Ok(ClassRequest::GetI3cCapability),
            0x05 => Ok(ClassRequest::InitializeI3cBus),
            0x06 => Ok(ClassRequest::GetTargetDeviceTable),
            0x07 => Ok(ClassRequest::SetTargetDeviceConfig),
            0x08 => Ok(ClassRequest::ChangeDynamicAddress),
            0x09 => Ok(ClassRequest::GetAddressChangeResult),
            0x0A => Ok(ClassRequest::GetBufferAvailable),
            0x0B => Ok(ClassRequest::CancelOrResumeBulkRequest),
            _ => Err(CodecError::InvalidField {
                field: "bRequest",
                value: value as u32,
            }),
        }
    }
}

/// Feature selectors carried in wValue of SET_FEATURE / CLEAR_FEATURE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FeatureSelector {
    I3cBus = 0x01,
    I3cControllerRoleHandoff = 0x02,
    RegularIbi = 0x03,
    HotJoin = 0x04,
    RegularIbiWake = 0x05,
    HotJoinWake = 0x06,
    I3cControllerRoleRequestWake = 0x07,
    HdrModeExitRecovery = 0x08,
}

impl TryFrom<u16> for FeatureSelector {
    type Error = CodecError;

    fn try_from(value: u16) -> Result<Self, CodecError> {
        match value {
            0x01 => Ok(FeatureSelector::I3cBus),
            0x02 => Ok(FeatureSelector::I3cControllerRoleHandoff),
            0x03 => Ok(FeatureSelector::RegularIbi),
            0x04 => Ok(FeatureSelector::HotJoin),
            0x05 => Ok(FeatureSelector::RegularIbiWake),
            0x06 => Ok(FeatureSelector::HotJoinWake),
            0x07 => Ok(FeatureSelector::I3cControllerRoleRequestWake),
            0x08 => Ok(FeatureSelector::HdrModeExitRecovery),
            _ => Err(CodecError::InvalidField {
                field: "feature selector",
                value: value as u32,
            }),
        }
    }
}

/// wValue of INITIALIZE_I3C_BUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum BusInitMode {
    /// Every target gets its address through ENTDAA.
    DynamicOnly = 0x0,
    /// Targets with a static address are assigned first (SETDASA), then ENTDAA.
    StaticThenDynamic = 0x1,
}

/// wValue of CANCEL_OR_RESUME_BULK_REQUEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum BulkRequestControl {
    Cancel = 0x0,
    Resume = 0x1,
}
