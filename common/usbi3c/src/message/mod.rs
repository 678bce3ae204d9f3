// Licensed under the Apache-2.0 license

use crate::codec::{read_record, write_record, CodecError, CodecResult};
use zerocopy::byteorder::{LittleEndian, U16};
use zerocopy::{FromBytes, Immutable, IntoBytes};

pub mod address_change;
pub mod bulk;
pub mod capability;
pub mod target_config;
pub mod target_table;

/// Header shared by the buffers that are a plain list of fixed-size entries.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, PartialEq)]
#[repr(C, packed)]
pub struct EntryCountHeader {
    pub num_entries: U16<LittleEndian>,
    reserved: [u8; 2],
}

pub const ENTRY_COUNT_HEADER_LEN: usize = core::mem::size_of::<EntryCountHeader>();

/// Decodes an [`EntryCountHeader`] followed by exactly the entries it declares.
pub(crate) fn decode_entry_list<T: FromBytes>(buffer: &[u8]) -> CodecResult<Vec<T>> {
    let header: EntryCountHeader = read_record(buffer, 0)?;
    let count = header.num_entries.get() as usize;
    let needed = ENTRY_COUNT_HEADER_LEN + count * core::mem::size_of::<T>();
    if buffer.len() < needed {
        return Err(CodecError::BufferTooShort {
            needed,
            available: buffer.len(),
        });
    }
    (0..count)
        .map(|i| read_record(buffer, ENTRY_COUNT_HEADER_LEN + i * core::mem::size_of::<T>()))
        .collect()
}

pub(crate) fn encode_entry_list<T: IntoBytes + Immutable>(
    entries: &[T],
    buffer: &mut [u8],
) -> CodecResult<usize> {
    let count = u16::try_from(entries.len()).map_err(|_| CodecError::InvalidField {
        field: "entry count",
        value: entries.len() as u32,
    })?;
    let header = EntryCountHeader {
        num_entries: U16::new(count),
        reserved: [0; 2],
    };
    let mut offset = write_record(&header, buffer, 0)?;
    for entry in entries {
        offset = write_record(entry, buffer, offset)?;
    }
    Ok(offset)
}

pub(crate) fn entry_list_size<T>(count: usize) -> usize {
    ENTRY_COUNT_HEADER_LEN + count * core::mem::size_of::<T>()
}
