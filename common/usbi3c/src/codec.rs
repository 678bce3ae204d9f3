// Licensed under the Apache-2.0 license

use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes};

pub type CodecResult<T> = Result<T, CodecError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("buffer too short: {needed} bytes needed, {available} available")]
    BufferTooShort { needed: usize, available: usize },
    #[error("length field declares {declared} bytes but the buffer holds {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("invalid {field} value {value:#x}")]
    InvalidField { field: &'static str, value: u32 },
    #[error("unsupported message")]
    Unsupported,
}

/// A trait for encoding and decoding USB I3C class buffers.
///
/// Fixed-size records get an implementation for free through zerocopy.
/// Variable-length buffers (tables, command batches) implement it by hand and
/// must bounds-check every length field against the actual buffer.
pub trait UsbI3cCodec: core::fmt::Debug + Sized {
    /// Encodes the message into `buffer`, returning the number of bytes written.
    fn encode(&self, buffer: &mut [u8]) -> CodecResult<usize>;

    /// Decodes a message from `buffer`. On error nothing is returned, so a
    /// caller never observes a partially decoded value.
    fn decode(buffer: &[u8]) -> CodecResult<Self>;

    /// Number of bytes `encode` will write.
    fn codec_size_in_bytes(&self) -> usize;

    fn to_bytes(&self) -> CodecResult<Vec<u8>> {
        let mut buffer = vec![0u8; self.codec_size_in_bytes()];
        let len = self.encode(&mut buffer)?;
        buffer.truncate(len);
        Ok(buffer)
    }
}

// Default implementation of UsbI3cCodec for types that can leverage zerocopy.
impl<T> UsbI3cCodec for T
where
    T: core::fmt::Debug + Sized + FromBytes + IntoBytes + Immutable,
{
    fn encode(&self, buffer: &mut [u8]) -> CodecResult<usize> {
        write_record(self, buffer, 0)
    }

    fn decode(buffer: &[u8]) -> CodecResult<Self> {
        read_record(buffer, 0)
    }

    fn codec_size_in_bytes(&self) -> usize {
        core::mem::size_of::<T>()
    }
}

/// Reads a fixed-size record at `offset`.
pub fn read_record<T: FromBytes>(buffer: &[u8], offset: usize) -> CodecResult<T> {
    let end = offset + core::mem::size_of::<T>();
    let too_short = CodecError::BufferTooShort {
        needed: end,
        available: buffer.len(),
    };
    let bytes = buffer.get(offset..end).ok_or(too_short.clone())?;
    T::read_from_bytes(bytes).map_err(|_| too_short)
}

/// Writes a fixed-size record at `offset`, returning the offset just past it.
pub fn write_record<T: IntoBytes + Immutable>(
    record: &T,
    buffer: &mut [u8],
    offset: usize,
) -> CodecResult<usize> {
    let end = offset + core::mem::size_of::<T>();
    let too_short = CodecError::BufferTooShort {
        needed: end,
        available: buffer.len(),
    };
    let dst = buffer.get_mut(offset..end).ok_or(too_short.clone())?;
    record.write_to(dst).map_err(|_| too_short)?;
    Ok(end)
}

/// Copies `data` to `offset` and zero-fills up to the next dword boundary.
pub fn write_padded(data: &[u8], buffer: &mut [u8], offset: usize) -> CodecResult<usize> {
    let end = offset + padded_len(data.len());
    if buffer.len() < end {
        return Err(CodecError::BufferTooShort {
            needed: end,
            available: buffer.len(),
        });
    }
    buffer[offset..offset + data.len()].copy_from_slice(data);
    buffer[offset + data.len()..end].fill(0);
    Ok(end)
}

/// Rounds a payload length up to the next dword boundary.
pub const fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}
