// Licensed under the Apache-2.0 license

use crate::transport::TransportError;
use thiserror::Error;
use usbi3c_common::codec::CodecError;
use usbi3c_common::protocol::notification::BusInitCode;
use usbi3c_common::protocol::requests::FeatureSelector;

pub type UsbI3cResult<T> = Result<T, UsbI3cError>;

/// Malformed caller input, detected before any I/O.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("target address {0:#04x} is outside the 7-bit range")]
    AddressOutOfRange(u8),
    #[error("address {0:#04x} is already taken by another target")]
    AddressInUse(u8),
    #[error("no target device at address {0:#04x}")]
    UnknownTarget(u8),
    #[error("I3C target has neither a static address nor a provisioned ID")]
    UnidentifiableDevice,
    #[error("regular write carries no data")]
    MissingWriteData,
    #[error("read length {0} is not a multiple of 4")]
    UnalignedReadLength(u32),
    #[error("regular read must request at least one dword")]
    ZeroReadLength,
    #[error("payload of {0} bytes does not fit a command descriptor")]
    PayloadTooLarge(usize),
    #[error("target reset pattern may only follow a reset pattern or a non-terminating RSTACT")]
    MisplacedResetPattern,
    #[error("command queue is empty")]
    EmptyQueue,
    #[error("queued command {0} has no response callback")]
    MissingCallback(usize),
    #[error("feature {0:?} can only be set")]
    FeatureCannotBeCleared(FeatureSelector),
}

/// Malformed wire data or an out-of-sequence message from the device.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("device accepted {actual} of {expected} bytes")]
    ShortTransfer { expected: usize, actual: usize },
}

/// Operation not allowed in the current device state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("device capabilities are not known yet")]
    CapabilitiesUnknown,
    #[error("device is not the active I3C controller")]
    NotActiveController,
    #[error("device does not support {0:?}")]
    FeatureNotSupported(FeatureSelector),
    #[error("bus initialization failed: {0:?}")]
    BusInitializationFailed(BusInitCode),
    #[error("bulk responses are not being received; initialize the device first")]
    ResponsesNotReceived,
    #[error("initialization event {0} is not valid in the current state")]
    UnexpectedInitEvent(&'static str),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum UsbI3cError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("device buffer too small: {required} bytes required, {available} available")]
    BufferUnavailable { required: usize, available: usize },
}

impl From<CodecError> for UsbI3cError {
    fn from(err: CodecError) -> Self {
        UsbI3cError::Protocol(ProtocolError::Codec(err))
    }
}
