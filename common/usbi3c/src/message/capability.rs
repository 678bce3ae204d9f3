// Licensed under the Apache-2.0 license

use crate::codec::{read_record, write_record, CodecError, CodecResult, UsbI3cCodec};
use bitfield::bitfield;
use core::convert::TryFrom;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes};

pub const CAPABILITY_PREFIX_LEN: usize = core::mem::size_of::<CapabilityPrefix>();
pub const CAPABILITY_HEADER_LEN: usize = core::mem::size_of::<CapabilityHeader>();
pub const CAPABILITY_ENTRY_LEN: usize = core::mem::size_of::<TargetCapabilityEntry>();

/// `error_code` when the header is followed by capability data.
pub const CAPABILITY_DATA_PRESENT: u8 = 0x00;
/// `error_code` when the device holds no capability data; the buffer is then
/// allowed to stop after the 4-byte prefix.
pub const NO_CAPABILITY_DATA: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceRole {
    PrimaryController = 0x1,
    SecondaryController = 0x2,
    Target = 0x3,
}

impl TryFrom<u8> for DeviceRole {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0x1 => Ok(DeviceRole::PrimaryController),
            0x2 => Ok(DeviceRole::SecondaryController),
            0x3 => Ok(DeviceRole::Target),
            _ => Err(CodecError::InvalidField {
                field: "device role",
                value: value as u32,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CapabilityDataType {
    NoStaticData = 0x0,
    StaticData = 0x1,
}

impl TryFrom<u8> for CapabilityDataType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0x0 => Ok(CapabilityDataType::NoStaticData),
            0x1 => Ok(CapabilityDataType::StaticData),
            _ => Err(CodecError::InvalidField {
                field: "capability data type",
                value: value as u32,
            }),
        }
    }
}

bitfield! {
    #[repr(C)]
    #[derive(Clone, Copy, Default, FromBytes, IntoBytes, Immutable, PartialEq)]
    pub struct RoleAndDataType(u8);
    impl Debug;
    pub u8, device_role, set_device_role: 1, 0;
    pub u8, data_type, set_data_type: 3, 2;
}

bitfield! {
    #[repr(C)]
    #[derive(Copy, Clone, Default, FromBytes, IntoBytes, Immutable, PartialEq)]
    pub struct CapabilityFlags([u8]);
    impl Debug;
    pub handoff_controller_role, set_handoff_controller_role: 0;
    pub hot_join, set_hot_join: 1;
    pub in_band_interrupt, set_in_band_interrupt: 2;
    pub pending_read, set_pending_read: 3;
    pub self_initiated, set_self_initiated: 4;
    pub delayed_pending_read, set_delayed_pending_read: 5;
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, PartialEq)]
#[repr(C, packed)]
pub struct CapabilityPrefix {
    pub total_length: U16<LittleEndian>,
    pub role_and_type: RoleAndDataType,
    pub error_code: u8,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, PartialEq)]
#[repr(C, packed)]
pub struct CapabilityHeader {
    pub total_length: U16<LittleEndian>,
    pub role_and_type: RoleAndDataType,
    pub error_code: u8,
    pub mipi_major_version: u8,
    pub mipi_minor_version: u8,
    pub disco_major_version: u8,
    pub disco_minor_version: u8,
    pub capability_flags: CapabilityFlags<[u8; 2]>,
    pub supported_hdr_modes: u8,
    reserved: u8,
    pub max_ibi_payload_size: U32<LittleEndian>,
}

/// Static knowledge about one target the device was provisioned with.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, PartialEq)]
#[repr(C, packed)]
pub struct TargetCapabilityEntry {
    pub static_address: u8,
    pub ibi_prioritization: u8,
    pub disco_version: U16<LittleEndian>,
    pub pid_lo: U32<LittleEndian>,
    pub pid_hi: U16<LittleEndian>,
    reserved: [u8; 2],
    pub max_ibi_pending_size: U32<LittleEndian>,
}

impl TargetCapabilityEntry {
    pub fn new(
        static_address: u8,
        pid: u64,
        ibi_prioritization: u8,
        disco_version: u16,
        max_ibi_pending_size: u32,
    ) -> Self {
        TargetCapabilityEntry {
            static_address,
            ibi_prioritization,
            disco_version: U16::new(disco_version),
            pid_lo: U32::new(pid as u32),
            pid_hi: U16::new((pid >> 32) as u16),
            reserved: [0; 2],
            max_ibi_pending_size: U32::new(max_ibi_pending_size),
        }
    }
}

/// Decoded GET_I3C_CAPABILITY buffer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct I3cCapability {
    pub header: CapabilityHeader,
    pub targets: Vec<TargetCapabilityEntry>,
}

impl I3cCapability {
    pub fn new(
        device_role: DeviceRole,
        capability_flags: CapabilityFlags<[u8; 2]>,
        max_ibi_payload_size: u32,
        targets: Vec<TargetCapabilityEntry>,
    ) -> Self {
        let mut role_and_type = RoleAndDataType(0);
        role_and_type.set_device_role(device_role as u8);
        let data_type = if targets.is_empty() {
            CapabilityDataType::NoStaticData
        } else {
            CapabilityDataType::StaticData
        };
        role_and_type.set_data_type(data_type as u8);
        let header = CapabilityHeader {
            total_length: U16::new((CAPABILITY_HEADER_LEN + targets.len() * CAPABILITY_ENTRY_LEN) as u16),
            role_and_type,
            error_code: CAPABILITY_DATA_PRESENT,
            mipi_major_version: 1,
            mipi_minor_version: 1,
            disco_major_version: 1,
            disco_minor_version: 0,
            capability_flags,
            supported_hdr_modes: 0,
            reserved: 0,
            max_ibi_payload_size: U32::new(max_ibi_payload_size),
        };
        I3cCapability { header, targets }
    }

    /// A capability report from a device that carries no capability data.
    pub fn without_data() -> Self {
        let mut header = CapabilityHeader {
            total_length: U16::new(CAPABILITY_PREFIX_LEN as u16),
            error_code: NO_CAPABILITY_DATA,
            ..Default::default()
        };
        header
            .role_and_type
            .set_device_role(DeviceRole::PrimaryController as u8);
        I3cCapability {
            header,
            targets: Vec::new(),
        }
    }

    pub fn has_capability_data(&self) -> bool {
        self.header.error_code != NO_CAPABILITY_DATA
    }

    /// Role of the device. A device without capability data is treated as a
    /// primary controller with no prior bus knowledge.
    pub fn device_role(&self) -> DeviceRole {
        if !self.has_capability_data() {
            return DeviceRole::PrimaryController;
        }
        DeviceRole::try_from(self.header.role_and_type.device_role())
            .unwrap_or(DeviceRole::PrimaryController)
    }

    pub fn data_type(&self) -> CapabilityDataType {
        if self.targets.is_empty() {
            CapabilityDataType::NoStaticData
        } else {
            CapabilityDataType::StaticData
        }
    }
}

impl UsbI3cCodec for I3cCapability {
    fn encode(&self, buffer: &mut [u8]) -> CodecResult<usize> {
        if !self.has_capability_data() {
            let prefix = CapabilityPrefix {
                total_length: U16::new(CAPABILITY_PREFIX_LEN as u16),
                role_and_type: self.header.role_and_type,
                error_code: NO_CAPABILITY_DATA,
            };
            return write_record(&prefix, buffer, 0);
        }
        let mut header = self.header;
        header.total_length = U16::new(self.codec_size_in_bytes() as u16);
        header.role_and_type.set_data_type(self.data_type() as u8);
        let mut offset = write_record(&header, buffer, 0)?;
        for target in &self.targets {
            offset = write_record(target, buffer, offset)?;
        }
        Ok(offset)
    }

    fn decode(buffer: &[u8]) -> CodecResult<Self> {
        let prefix: CapabilityPrefix = read_record(buffer, 0)?;
        let declared = prefix.total_length.get() as usize;
        if declared > buffer.len() {
            return Err(CodecError::BufferTooShort {
                needed: declared,
                available: buffer.len(),
            });
        }

        if prefix.error_code == NO_CAPABILITY_DATA {
            let header = CapabilityHeader {
                total_length: prefix.total_length,
                role_and_type: prefix.role_and_type,
                error_code: prefix.error_code,
                ..Default::default()
            };
            return Ok(I3cCapability {
                header,
                targets: Vec::new(),
            });
        }
        if prefix.error_code != CAPABILITY_DATA_PRESENT {
            return Err(CodecError::InvalidField {
                field: "capability error code",
                value: prefix.error_code as u32,
            });
        }
        if declared < CAPABILITY_HEADER_LEN {
            return Err(CodecError::LengthMismatch {
                declared,
                actual: CAPABILITY_HEADER_LEN,
            });
        }

        let header: CapabilityHeader = read_record(buffer, 0)?;
        DeviceRole::try_from(header.role_and_type.device_role())?;
        let entries_len = declared - CAPABILITY_HEADER_LEN;
        let targets = match CapabilityDataType::try_from(header.role_and_type.data_type())? {
            CapabilityDataType::NoStaticData => {
                if entries_len != 0 {
                    return Err(CodecError::LengthMismatch {
                        declared,
                        actual: CAPABILITY_HEADER_LEN,
                    });
                }
                Vec::new()
            }
            CapabilityDataType::StaticData => {
                if entries_len % CAPABILITY_ENTRY_LEN != 0 {
                    return Err(CodecError::LengthMismatch {
                        declared,
                        actual: CAPABILITY_HEADER_LEN
                            + entries_len / CAPABILITY_ENTRY_LEN * CAPABILITY_ENTRY_LEN,
                    });
                }
                (0..entries_len / CAPABILITY_ENTRY_LEN)
                    .map(|i| read_record(buffer, CAPABILITY_HEADER_LEN + i * CAPABILITY_ENTRY_LEN))
                    .collect::<CodecResult<Vec<TargetCapabilityEntry>>>()?
            }
        };

        Ok(I3cCapability { header, targets })
    }

    fn codec_size_in_bytes(&self) -> usize {
        if !self.has_capability_data() {
            return CAPABILITY_PREFIX_LEN;
        }
        CAPABILITY_HEADER_LEN + self.targets.len() * CAPABILITY_ENTRY_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller_flags() -> CapabilityFlags<[u8; 2]> {
        let mut flags = CapabilityFlags([0u8; 2]);
        flags.set_hot_join(true);
        flags.set_in_band_interrupt(true);
        flags
    }

    #[test]
    fn test_no_capability_data_is_valid() {
        // total_length = 4, role bits = 0, error code = no capability data
        let capability = I3cCapability::decode(&[0x04, 0x00, 0x00, NO_CAPABILITY_DATA]).unwrap();
        assert!(!capability.has_capability_data());
        assert!(capability.targets.is_empty());
        assert_eq!(capability.device_role(), DeviceRole::PrimaryController);
    }

    #[test]
    fn test_decode_static_entries() {
        let capability = I3cCapability::new(
            DeviceRole::PrimaryController,
            controller_flags(),
            64,
            vec![
                TargetCapabilityEntry::new(0x50, 0x0123_4567_89ab, 1, 0x0100, 32),
                TargetCapabilityEntry::new(0x00, 0x0000_1111_2222, 0, 0x0100, 0),
            ],
        );
        let bytes = capability.to_bytes().unwrap();
        assert_eq!(bytes.len(), CAPABILITY_HEADER_LEN + 2 * CAPABILITY_ENTRY_LEN);

        let decoded = I3cCapability::decode(&bytes).unwrap();
        assert_eq!(decoded.targets.len(), 2);
        assert_eq!(decoded.targets[0].static_address, 0x50);
        assert_eq!(decoded.targets[0].pid_hi.get(), 0x0123);
        assert_eq!(decoded.targets[0].pid_lo.get(), 0x4567_89ab);
        assert!(decoded.header.capability_flags.hot_join());
        assert!(!decoded.header.capability_flags.handoff_controller_role());
        assert_eq!(decoded.header.max_ibi_payload_size.get(), 64);
        assert_eq!(decoded.data_type(), CapabilityDataType::StaticData);
    }

    #[test]
    fn test_truncated_buffer_rejected() {
        let capability = I3cCapability::new(
            DeviceRole::PrimaryController,
            controller_flags(),
            64,
            vec![TargetCapabilityEntry::new(0x50, 0x1, 0, 0, 0)],
        );
        let bytes = capability.to_bytes().unwrap();
        assert!(matches!(
            I3cCapability::decode(&bytes[..bytes.len() - 4]),
            Err(CodecError::BufferTooShort { .. })
        ));
    }

    #[test]
    fn test_partial_entry_rejected() {
        let capability = I3cCapability::new(
            DeviceRole::PrimaryController,
            controller_flags(),
            64,
            vec![TargetCapabilityEntry::new(0x50, 0x1, 0, 0, 0)],
        );
        let mut bytes = capability.to_bytes().unwrap();
        // Claim 8 more bytes than a whole number of entries.
        let bad_len = (bytes.len() + 8) as u16;
        bytes[0..2].copy_from_slice(&bad_len.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            I3cCapability::decode(&bytes),
            Err(CodecError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_role_rejected() {
        let mut bytes = I3cCapability::new(DeviceRole::Target, controller_flags(), 0, vec![])
            .to_bytes()
            .unwrap();
        bytes[2] &= !0x03;
        assert!(matches!(
            I3cCapability::decode(&bytes),
            Err(CodecError::InvalidField { .. })
        ));
    }
}
