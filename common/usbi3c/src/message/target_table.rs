// Licensed under the Apache-2.0 license

use super::target_config::TargetConfigBits;
use super::{decode_entry_list, encode_entry_list, entry_list_size};
use crate::codec::{CodecError, CodecResult, UsbI3cCodec};
use core::convert::TryFrom;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes};

pub const TARGET_TABLE_ENTRY_LEN: usize = core::mem::size_of::<TargetTableEntry>();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TargetType {
    #[default]
    I3c = 0x0,
    I2c = 0x1,
}

impl TryFrom<u8> for TargetType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0x0 => Ok(TargetType::I3c),
            0x1 => Ok(TargetType::I2c),
            _ => Err(CodecError::InvalidField {
                field: "target type",
                value: value as u32,
            }),
        }
    }
}

/// One row of the device's target device table.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, PartialEq)]
#[repr(C, packed)]
pub struct TargetTableEntry {
    pub address: u8,
    pub config: TargetConfigBits,
    pub target_type: u8,
    reserved: u8,
    pub pid_lo: U32<LittleEndian>,
    pub pid_hi: U16<LittleEndian>,
    pub dcr: u8,
    pub bcr: u8,
    pub max_ibi_payload_size: U32<LittleEndian>,
}

impl TargetTableEntry {
    pub fn new(
        address: u8,
        target_type: TargetType,
        pid: u64,
        dcr: u8,
        bcr: u8,
        config: TargetConfigBits,
        max_ibi_payload_size: u32,
    ) -> Self {
        TargetTableEntry {
            address,
            config,
            target_type: target_type as u8,
            reserved: 0,
            pid_lo: U32::new(pid as u32),
            pid_hi: U16::new((pid >> 32) as u16),
            dcr,
            bcr,
            max_ibi_payload_size: U32::new(max_ibi_payload_size),
        }
    }

    /// 48-bit provisioned ID.
    pub fn pid(&self) -> u64 {
        ((self.pid_hi.get() as u64) << 32) | self.pid_lo.get() as u64
    }
}

/// Decoded GET_TARGET_DEVICE_TABLE buffer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TargetDeviceTableBuffer {
    pub entries: Vec<TargetTableEntry>,
}

impl UsbI3cCodec for TargetDeviceTableBuffer {
    fn encode(&self, buffer: &mut [u8]) -> CodecResult<usize> {
        encode_entry_list(&self.entries, buffer)
    }

    fn decode(buffer: &[u8]) -> CodecResult<Self> {
        let entries: Vec<TargetTableEntry> = decode_entry_list(buffer)?;
        for entry in &entries {
            TargetType::try_from(entry.target_type)?;
        }
        Ok(TargetDeviceTableBuffer { entries })
    }

    fn codec_size_in_bytes(&self) -> usize {
        entry_list_size::<TargetTableEntry>(self.entries.len())
    }
}
