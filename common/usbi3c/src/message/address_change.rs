// Licensed under the Apache-2.0 license

use super::{decode_entry_list, encode_entry_list, entry_list_size};
use crate::codec::{CodecError, CodecResult, UsbI3cCodec};
use core::convert::TryFrom;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressChangeStatus {
    Success = 0x0,
    Failure = 0x1,
}

impl TryFrom<u8> for AddressChangeStatus {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0x0 => Ok(AddressChangeStatus::Success),
            0x1 => Ok(AddressChangeStatus::Failure),
            _ => Err(CodecError::InvalidField {
                field: "address change status",
                value: value as u32,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, PartialEq)]
#[repr(C, packed)]
pub struct AddressChangeEntry {
    pub current_address: u8,
    pub new_address: u8,
    reserved0: [u8; 2],
    pub pid_lo: U32<LittleEndian>,
    pub pid_hi: U16<LittleEndian>,
    reserved1: [u8; 2],
}

impl AddressChangeEntry {
    pub fn new(current_address: u8, new_address: u8, pid: u64) -> Self {
        AddressChangeEntry {
            current_address,
            new_address,
            reserved0: [0; 2],
            pid_lo: U32::new(pid as u32),
            pid_hi: U16::new((pid >> 32) as u16),
            reserved1: [0; 2],
        }
    }
}

/// Buffer sent with CHANGE_DYNAMIC_ADDRESS.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AddressChangeRequest {
    pub entries: Vec<AddressChangeEntry>,
}

impl UsbI3cCodec for AddressChangeRequest {
    fn encode(&self, buffer: &mut [u8]) -> CodecResult<usize> {
        encode_entry_list(&self.entries, buffer)
    }

    fn decode(buffer: &[u8]) -> CodecResult<Self> {
        Ok(AddressChangeRequest {
            entries: decode_entry_list(buffer)?,
        })
    }

    fn codec_size_in_bytes(&self) -> usize {
        entry_list_size::<AddressChangeEntry>(self.entries.len())
    }
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, PartialEq)]
#[repr(C, packed)]
pub struct AddressChangeResultEntry {
    pub old_address: u8,
    pub new_address: u8,
    pub status: u8,
    reserved: u8,
}

impl AddressChangeResultEntry {
    pub fn new(old_address: u8, new_address: u8, status: AddressChangeStatus) -> Self {
        AddressChangeResultEntry {
            old_address,
            new_address,
            status: status as u8,
            reserved: 0,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == AddressChangeStatus::Success as u8
    }
}

/// Buffer returned by GET_ADDRESS_CHANGE_RESULT.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AddressChangeResult {
    pub entries: Vec<AddressChangeResultEntry>,
}

impl UsbI3cCodec for AddressChangeResult {
    fn encode(&self, buffer: &mut [u8]) -> CodecResult<usize> {
        encode_entry_list(&self.entries, buffer)
    }

    fn decode(buffer: &[u8]) -> CodecResult<Self> {
        let entries: Vec<AddressChangeResultEntry> = decode_entry_list(buffer)?;
        for entry in &entries {
            AddressChangeStatus::try_from(entry.status)?;
        }
        Ok(AddressChangeResult { entries })
    }

    fn codec_size_in_bytes(&self) -> usize {
        entry_list_size::<AddressChangeResultEntry>(self.entries.len())
    }
}
