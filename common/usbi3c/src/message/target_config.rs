// Licensed under the Apache-2.0 license

use crate::codec::{read_record, write_record, CodecError, CodecResult, UsbI3cCodec};
use bitfield::bitfield;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// Only command type defined for SET_TARGET_DEVICE_CONFIG.
pub const CHANGE_CONFIG_COMMAND_TYPE: u8 = 0x01;

pub const TARGET_CONFIG_HEADER_LEN: usize = core::mem::size_of::<TargetConfigHeader>();
pub const TARGET_CONFIG_ENTRY_LEN: usize = core::mem::size_of::<TargetConfigEntry>();

bitfield! {
    #[repr(C)]
    #[derive(Clone, Copy, Default, FromBytes, IntoBytes, Immutable, PartialEq, Eq)]
    pub struct TargetConfigBits(u8);
    impl Debug;
    pub target_interrupt_request, set_target_interrupt_request: 0;
    pub controller_role_request, set_controller_role_request: 1;
    pub ibi_timestamp, set_ibi_timestamp: 2;
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, PartialEq)]
#[repr(C, packed)]
pub struct TargetConfigHeader {
    pub command_type: u8,
    pub num_entries: u8,
    reserved: [u8; 2],
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, PartialEq)]
#[repr(C, packed)]
pub struct TargetConfigEntry {
    pub address: u8,
    pub config: TargetConfigBits,
    reserved: [u8; 2],
    pub max_ibi_payload_size: U32<LittleEndian>,
}

impl TargetConfigEntry {
    pub fn new(address: u8, config: TargetConfigBits, max_ibi_payload_size: u32) -> Self {
        TargetConfigEntry {
            address,
            config,
            reserved: [0; 2],
            max_ibi_payload_size: U32::new(max_ibi_payload_size),
        }
    }
}

/// Buffer sent with SET_TARGET_DEVICE_CONFIG.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TargetConfigBuffer {
    pub entries: Vec<TargetConfigEntry>,
}

impl UsbI3cCodec for TargetConfigBuffer {
    fn encode(&self, buffer: &mut [u8]) -> CodecResult<usize> {
        let num_entries = u8::try_from(self.entries.len()).map_err(|_| CodecError::InvalidField {
            field: "target config entry count",
            value: self.entries.len() as u32,
        })?;
        let header = TargetConfigHeader {
            command_type: CHANGE_CONFIG_COMMAND_TYPE,
            num_entries,
            reserved: [0; 2],
        };
        let mut offset = write_record(&header, buffer, 0)?;
        for entry in &self.entries {
            offset = write_record(entry, buffer, offset)?;
        }
        Ok(offset)
    }

    fn decode(buffer: &[u8]) -> CodecResult<Self> {
        let header: TargetConfigHeader = read_record(buffer, 0)?;
        if header.command_type != CHANGE_CONFIG_COMMAND_TYPE {
            return Err(CodecError::InvalidField {
                field: "target config command type",
                value: header.command_type as u32,
            });
        }
        let entries = (0..header.num_entries as usize)
            .map(|i| read_record(buffer, TARGET_CONFIG_HEADER_LEN + i * TARGET_CONFIG_ENTRY_LEN))
            .collect::<CodecResult<Vec<_>>>()?;
        Ok(TargetConfigBuffer { entries })
    }

    fn codec_size_in_bytes(&self) -> usize {
        TARGET_CONFIG_HEADER_LEN + self.entries.len() * TARGET_CONFIG_ENTRY_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_buffer_layout() {
        let mut config = TargetConfigBits(0);
        config.set_target_interrupt_request(true);
        config.set_ibi_timestamp(true);
        let buffer = TargetConfigBuffer {
            entries: vec![TargetConfigEntry::new(0x09, config, 0x20)],
        };
        let bytes = buffer.to_bytes().unwrap();
        assert_eq!(
            bytes,
            [0x01, 0x01, 0x00, 0x00, 0x09, 0x05, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00]
        );
        assert_eq!(TargetConfigBuffer::decode(&bytes).unwrap(), buffer);
    }

    #[test]
    fn test_wrong_command_type_rejected() {
        assert!(TargetConfigBuffer::decode(&[0x02, 0x00, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_missing_entries_rejected() {
        assert!(matches!(
            TargetConfigBuffer::decode(&[0x01, 0x02, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00]),
            Err(CodecError::BufferTooShort { .. })
        ));
    }
}
