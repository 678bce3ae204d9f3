// Licensed under the Apache-2.0 license

//! Bulk OUT requests and bulk IN responses.
//!
//! A transfer always starts with a 4-byte header whose first byte is a tag.
//! Regular transfers then carry a sequence of blocks: on the way out a block
//! header, a 16-byte command descriptor and (for writes) the payload; on the
//! way in a response descriptor followed by any read data. Payloads are
//! zero-padded to the next dword.

use crate::codec::{
    padded_len, read_record, write_padded, write_record, CodecError, CodecResult, UsbI3cCodec,
};
use crate::protocol::command::{
    CommandErrorStatus, CommandType, ErrorHandling, TransferMode, TransferRate,
};
use bitfield::bitfield;
use core::convert::TryFrom;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes};

pub const BULK_HEADER_LEN: usize = core::mem::size_of::<BulkTransferHeader>();
pub const COMMAND_BLOCK_HEADER_LEN: usize = core::mem::size_of::<CommandBlockHeader>();
pub const COMMAND_DESCRIPTOR_LEN: usize = core::mem::size_of::<CommandDescriptor>();
pub const RESPONSE_DESCRIPTOR_LEN: usize = core::mem::size_of::<ResponseDescriptor>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BulkRequestTag {
    RegularCommand = 0x0,
    VendorSpecific = 0x2,
}

impl TryFrom<u8> for BulkRequestTag {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0x0 => Ok(BulkRequestTag::RegularCommand),
            0x2 => Ok(BulkRequestTag::VendorSpecific),
            _ => Err(CodecError::InvalidField {
                field: "bulk request tag",
                value: value as u32,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BulkResponseTag {
    RegularCommand = 0x0,
    Ibi = 0x1,
    VendorSpecific = 0x2,
}

impl TryFrom<u8> for BulkResponseTag {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0x0 => Ok(BulkResponseTag::RegularCommand),
            0x1 => Ok(BulkResponseTag::Ibi),
            0x2 => Ok(BulkResponseTag::VendorSpecific),
            _ => Err(CodecError::InvalidField {
                field: "bulk response tag",
                value: value as u32,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, PartialEq)]
#[repr(C, packed)]
pub struct BulkTransferHeader {
    pub tag: u8,
    reserved: [u8; 3],
}

impl BulkTransferHeader {
    pub fn new(tag: u8) -> Self {
        BulkTransferHeader {
            tag,
            reserved: [0; 3],
        }
    }
}

bitfield! {
    #[repr(C)]
    #[derive(Clone, Copy, Default, FromBytes, IntoBytes, Immutable, PartialEq)]
    pub struct CommandBlockFlags(u8);
    impl Debug;
    pub dependent_on_previous, set_dependent_on_previous: 0;
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, PartialEq)]
#[repr(C, packed)]
pub struct CommandBlockHeader {
    pub request_id: U16<LittleEndian>,
    pub flags: CommandBlockFlags,
    reserved: u8,
}

bitfield! {
    #[repr(C)]
    #[derive(Clone, Copy, Default, FromBytes, IntoBytes, Immutable, PartialEq)]
    pub struct CommandAttributes(u8);
    impl Debug;
    pub read, set_read: 0;
    pub u8, error_handling, set_error_handling: 2, 1;
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, PartialEq)]
#[repr(C, packed)]
pub struct CommandDescriptor {
    pub command_type: u8,
    pub attributes: CommandAttributes,
    pub target_address: u8,
    pub transfer_mode: u8,
    pub transfer_rate: u8,
    pub tm_specific_info: u8,
    pub ccc: u8,
    pub defining_byte: u8,
    pub data_length: U32<LittleEndian>,
    reserved: [u8; 4],
}

impl CommandDescriptor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        command_type: CommandType,
        read: bool,
        error_handling: ErrorHandling,
        target_address: u8,
        transfer_mode: TransferMode,
        transfer_rate: TransferRate,
        tm_specific_info: u8,
        ccc: u8,
        defining_byte: u8,
        data_length: u32,
    ) -> Self {
        let mut attributes = CommandAttributes(0);
        attributes.set_read(read);
        attributes.set_error_handling(error_handling as u8);
        CommandDescriptor {
            command_type: command_type as u8,
            attributes,
            target_address,
            transfer_mode: transfer_mode as u8,
            transfer_rate: transfer_rate as u8,
            tm_specific_info,
            ccc,
            defining_byte,
            data_length: U32::new(data_length),
            reserved: [0; 4],
        }
    }

    pub fn is_read(&self) -> bool {
        self.attributes.read()
    }
}

/// One command of a regular bulk request.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandBlock {
    pub request_id: u16,
    pub dependent_on_previous: bool,
    pub descriptor: CommandDescriptor,
    /// Write payload; empty for reads.
    pub data: Vec<u8>,
}

impl CommandBlock {
    fn size_in_bytes(&self) -> usize {
        COMMAND_BLOCK_HEADER_LEN + COMMAND_DESCRIPTOR_LEN + padded_len(self.data.len())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BulkRequest {
    Regular(Vec<CommandBlock>),
    /// Opaque payload. The format carries no length, so a decoded payload
    /// includes the zero padding up to the next dword.
    VendorSpecific(Vec<u8>),
}

impl UsbI3cCodec for BulkRequest {
    fn encode(&self, buffer: &mut [u8]) -> CodecResult<usize> {
        match self {
            BulkRequest::VendorSpecific(data) => {
                let offset = write_record(
                    &BulkTransferHeader::new(BulkRequestTag::VendorSpecific as u8),
                    buffer,
                    0,
                )?;
                write_padded(data, buffer, offset)
            }
            BulkRequest::Regular(blocks) => {
                let mut offset = write_record(
                    &BulkTransferHeader::new(BulkRequestTag::RegularCommand as u8),
                    buffer,
                    0,
                )?;
                for block in blocks {
                    let declared = block.descriptor.data_length.get() as usize;
                    if !block.descriptor.is_read() && declared != block.data.len() {
                        return Err(CodecError::LengthMismatch {
                            declared,
                            actual: block.data.len(),
                        });
                    }
                    let mut flags = CommandBlockFlags(0);
                    flags.set_dependent_on_previous(block.dependent_on_previous);
                    let header = CommandBlockHeader {
                        request_id: U16::new(block.request_id),
                        flags,
                        reserved: 0,
                    };
                    offset = write_record(&header, buffer, offset)?;
                    offset = write_record(&block.descriptor, buffer, offset)?;
                    if !block.descriptor.is_read() {
                        offset = write_padded(&block.data, buffer, offset)?;
                    }
                }
                Ok(offset)
            }
        }
    }

    fn decode(buffer: &[u8]) -> CodecResult<Self> {
        let header: BulkTransferHeader = read_record(buffer, 0)?;
        match BulkRequestTag::try_from(header.tag)? {
            BulkRequestTag::VendorSpecific => {
                Ok(BulkRequest::VendorSpecific(buffer[BULK_HEADER_LEN..].to_vec()))
            }
            BulkRequestTag::RegularCommand => {
                let mut blocks = Vec::new();
                let mut offset = BULK_HEADER_LEN;
                while offset < buffer.len() {
                    let block_header: CommandBlockHeader = read_record(buffer, offset)?;
                    offset += COMMAND_BLOCK_HEADER_LEN;
                    let descriptor: CommandDescriptor = read_record(buffer, offset)?;
                    offset += COMMAND_DESCRIPTOR_LEN;
                    let mut data = Vec::new();
                    if !descriptor.is_read() {
                        let len = descriptor.data_length.get() as usize;
                        let end = offset + padded_len(len);
                        if buffer.len() < end {
                            return Err(CodecError::BufferTooShort {
                                needed: end,
                                available: buffer.len(),
                            });
                        }
                        data.extend_from_slice(&buffer[offset..offset + len]);
                        offset = end;
                    }
                    blocks.push(CommandBlock {
                        request_id: block_header.request_id.get(),
                        dependent_on_previous: block_header.flags.dependent_on_previous(),
                        descriptor,
                        data,
                    });
                }
                Ok(BulkRequest::Regular(blocks))
            }
        }
    }

    fn codec_size_in_bytes(&self) -> usize {
        match self {
            BulkRequest::VendorSpecific(data) => BULK_HEADER_LEN + padded_len(data.len()),
            BulkRequest::Regular(blocks) => {
                BULK_HEADER_LEN + blocks.iter().map(CommandBlock::size_in_bytes).sum::<usize>()
            }
        }
    }
}

bitfield! {
    #[repr(C)]
    #[derive(Clone, Copy, Default, FromBytes, IntoBytes, Immutable, PartialEq)]
    pub struct ResponseFlags(u8);
    impl Debug;
    pub attempted, set_attempted: 0;
    pub has_data, set_has_data: 1;
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, PartialEq)]
#[repr(C, packed)]
pub struct ResponseDescriptor {
    pub request_id: U16<LittleEndian>,
    pub flags: ResponseFlags,
    pub error_status: u8,
    pub data_length: U32<LittleEndian>,
}

/// Device's answer to one command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub request_id: u16,
    pub attempted: bool,
    pub error_status: CommandErrorStatus,
    pub has_data: bool,
    pub data: Vec<u8>,
}

impl CommandResponse {
    /// Synthesized locally when the transfer carrying the request failed.
    pub fn transport_failure(request_id: u16) -> Self {
        CommandResponse {
            request_id,
            attempted: false,
            error_status: CommandErrorStatus::TransportFailure,
            has_data: false,
            data: Vec::new(),
        }
    }

    fn size_in_bytes(&self) -> usize {
        RESPONSE_DESCRIPTOR_LEN + padded_len(self.data.len())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BulkResponse {
    Regular(Vec<CommandResponse>),
    Ibi(Vec<u8>),
    /// Everything after the header, dword padding included.
    VendorSpecific(Vec<u8>),
}

impl UsbI3cCodec for BulkResponse {
    fn encode(&self, buffer: &mut [u8]) -> CodecResult<usize> {
        let (tag, payload) = match self {
            BulkResponse::Ibi(data) => (BulkResponseTag::Ibi, data),
            BulkResponse::VendorSpecific(data) => (BulkResponseTag::VendorSpecific, data),
            BulkResponse::Regular(responses) => {
                let mut offset = write_record(
                    &BulkTransferHeader::new(BulkResponseTag::RegularCommand as u8),
                    buffer,
                    0,
                )?;
                for response in responses {
                    let mut flags = ResponseFlags(0);
                    flags.set_attempted(response.attempted);
                    flags.set_has_data(response.has_data);
                    let descriptor = ResponseDescriptor {
                        request_id: U16::new(response.request_id),
                        flags,
                        error_status: u8::from(response.error_status),
                        data_length: U32::new(response.data.len() as u32),
                    };
                    offset = write_record(&descriptor, buffer, offset)?;
                    offset = write_padded(&response.data, buffer, offset)?;
                }
                return Ok(offset);
            }
        };
        let offset = write_record(&BulkTransferHeader::new(tag as u8), buffer, 0)?;
        write_padded(payload, buffer, offset)
    }

    fn decode(buffer: &[u8]) -> CodecResult<Self> {
        let header: BulkTransferHeader = read_record(buffer, 0)?;
        let payload = &buffer[BULK_HEADER_LEN..];
        match BulkResponseTag::try_from(header.tag)? {
            BulkResponseTag::Ibi => Ok(BulkResponse::Ibi(payload.to_vec())),
            BulkResponseTag::VendorSpecific => Ok(BulkResponse::VendorSpecific(payload.to_vec())),
            BulkResponseTag::RegularCommand => {
                if payload.is_empty() {
                    return Err(CodecError::BufferTooShort {
                        needed: BULK_HEADER_LEN + RESPONSE_DESCRIPTOR_LEN,
                        available: buffer.len(),
                    });
                }
                let mut responses = Vec::new();
                let mut offset = BULK_HEADER_LEN;
                while offset < buffer.len() {
                    let descriptor: ResponseDescriptor = read_record(buffer, offset)?;
                    offset += RESPONSE_DESCRIPTOR_LEN;
                    let len = descriptor.data_length.get() as usize;
                    let end = offset + padded_len(len);
                    if buffer.len() < end {
                        return Err(CodecError::BufferTooShort {
                            needed: end,
                            available: buffer.len(),
                        });
                    }
                    responses.push(CommandResponse {
                        request_id: descriptor.request_id.get(),
                        attempted: descriptor.flags.attempted(),
                        error_status: CommandErrorStatus::try_from(descriptor.error_status)?,
                        has_data: descriptor.flags.has_data(),
                        data: buffer[offset..offset + len].to_vec(),
                    });
                    offset = end;
                }
                Ok(BulkResponse::Regular(responses))
            }
        }
    }

    fn codec_size_in_bytes(&self) -> usize {
        match self {
            BulkResponse::Ibi(data) | BulkResponse::VendorSpecific(data) => {
                BULK_HEADER_LEN + padded_len(data.len())
            }
            BulkResponse::Regular(responses) => {
                BULK_HEADER_LEN
                    + responses
                        .iter()
                        .map(CommandResponse::size_in_bytes)
                        .sum::<usize>()
            }
        }
    }
}
