// Licensed under the Apache-2.0 license

use crate::codec::CodecError;
use core::convert::TryFrom;

/// Address used for broadcast CCCs.
pub const I3C_BROADCAST_ADDRESS: u8 = 0x7E;

/// Largest 7-bit target address.
pub const MAX_TARGET_ADDRESS: u8 = 0x7F;

/// Broadcast RSTACT CCC.
pub const CCC_RSTACT_BROADCAST: u8 = 0x2A;

/// Direct RSTACT CCC.
pub const CCC_RSTACT_DIRECT: u8 = 0x9A;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandType {
    Regular = 0x0,
    CccWithoutDefiningByte = 0x1,
    CccWithDefiningByte = 0x2,
    TargetResetPattern = 0x3,
}

impl TryFrom<u8> for CommandType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0x0 => Ok(CommandType::Regular),
            0x1 => Ok(CommandType::CccWithoutDefiningByte),
            0x2 => Ok(CommandType::CccWithDefiningByte),
            0x3 => Ok(CommandType::TargetResetPattern),
            _ => Err(CodecError::InvalidField {
                field: "command type",
                value: value as u32,
            }),
        }
    }
}

/// What the device does with the rest of a bulk request after an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ErrorHandling {
    #[default]
    TerminateOnAnyError = 0x0,
    TerminateOnAnyErrorExceptNack = 0x1,
    DoNotTerminateExceptNack = 0x2,
    DoNotTerminateIncludingNack = 0x3,
}

impl TryFrom<u8> for ErrorHandling {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0x0 => Ok(ErrorHandling::TerminateOnAnyError),
            0x1 => Ok(ErrorHandling::TerminateOnAnyErrorExceptNack),
            0x2 => Ok(ErrorHandling::DoNotTerminateExceptNack),
            0x3 => Ok(ErrorHandling::DoNotTerminateIncludingNack),
            _ => Err(CodecError::InvalidField {
                field: "error handling",
                value: value as u32,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TransferMode {
    #[default]
    Sdr = 0x0,
    HdrDdr = 0x1,
    HdrTsp = 0x2,
    HdrTsl = 0x3,
    HdrBt = 0x4,
    I2c = 0x5,
}

impl TryFrom<u8> for TransferMode {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0x0 => Ok(TransferMode::Sdr),
            0x1 => Ok(TransferMode::HdrDdr),
            0x2 => Ok(TransferMode::HdrTsp),
            0x3 => Ok(TransferMode::HdrTsl),
            0x4 => Ok(TransferMode::HdrBt),
            0x5 => Ok(TransferMode::I2c),
            _ => Err(CodecError::InvalidField {
                field: "transfer mode",
                value: value as u32,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TransferRate {
    #[default]
    Sdr0 = 0x0,
    Sdr1 = 0x1,
    Sdr2 = 0x2,
    Sdr3 = 0x3,
    Sdr4 = 0x4,
    I2cFm = 0x5,
    I2cFmPlus = 0x6,
}

impl TryFrom<u8> for TransferRate {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0x0 => Ok(TransferRate::Sdr0),
            0x1 => Ok(TransferRate::Sdr1),
            0x2 => Ok(TransferRate::Sdr2),
            0x3 => Ok(TransferRate::Sdr3),
            0x4 => Ok(TransferRate::Sdr4),
            0x5 => Ok(TransferRate::I2cFm),
            0x6 => Ok(TransferRate::I2cFmPlus),
            _ => Err(CodecError::InvalidField {
                field: "transfer rate",
                value: value as u32,
            }),
        }
    }
}

/// Device-wide transfer settings inherited by every queued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct I3cMode {
    pub transfer_mode: TransferMode,
    pub transfer_rate: TransferRate,
    pub tm_specific_info: u8,
}

/// Outcome the device reports for one command of a bulk request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandErrorStatus {
    Success,
    Crc,
    Parity,
    Frame,
    AddressHeader,
    Nack,
    ShortRead,
    Overflow,
    Aborted,
    /// A code this host does not know; carried as sent.
    Unknown(u8),
    /// Never sent by a device; the host reports it when the transfer carrying
    /// the request could not complete.
    TransportFailure,
}

/// Wire value of [`CommandErrorStatus::TransportFailure`], reserved to the host.
pub const TRANSPORT_FAILURE_STATUS: u8 = 0xFF;

impl TryFrom<u8> for CommandErrorStatus {
    type Error = CodecError;

    /// Decodes a device-reported status. Unknown codes are kept, the
    /// host-reserved transport failure code is refused.
    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0x0 => Ok(CommandErrorStatus::Success),
            0x1 => Ok(CommandErrorStatus::Crc),
            0x2 => Ok(CommandErrorStatus::Parity),
            0x3 => Ok(CommandErrorStatus::Frame),
            0x4 => Ok(CommandErrorStatus::AddressHeader),
            0x5 => Ok(CommandErrorStatus::Nack),
            0x6 => Ok(CommandErrorStatus::ShortRead),
            0x7 => Ok(CommandErrorStatus::Overflow),
            0x8 => Ok(CommandErrorStatus::Aborted),
            TRANSPORT_FAILURE_STATUS => Err(CodecError::InvalidField {
                field: "error status",
                value: value as u32,
            }),
            other => Ok(CommandErrorStatus::Unknown(other)),
        }
    }
}

impl From<CommandErrorStatus> for u8 {
    fn from(status: CommandErrorStatus) -> u8 {
        match status {
            CommandErrorStatus::Success => 0x0,
            CommandErrorStatus::Crc => 0x1,
            CommandErrorStatus::Parity => 0x2,
            CommandErrorStatus::Frame => 0x3,
            CommandErrorStatus::AddressHeader => 0x4,
            CommandErrorStatus::Nack => 0x5,
            CommandErrorStatus::ShortRead => 0x6,
            CommandErrorStatus::Overflow => 0x7,
            CommandErrorStatus::Aborted => 0x8,
            CommandErrorStatus::Unknown(code) => code,
            CommandErrorStatus::TransportFailure => TRANSPORT_FAILURE_STATUS,
        }
    }
}
