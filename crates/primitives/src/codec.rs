//! Minimal binary codec used for the event wire format and storage records.
//!
//! Values implement [`Write`] + [`EncodeSize`] to be encodable and [`Read`] to be
//! decodable. [`Decode::decode`] additionally rejects trailing bytes so that a
//! record is always consumed exactly.

use alloy_primitives::B256;
use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of buffer")]
    EndOfBuffer,
    #[error("{0} trailing bytes after record")]
    ExtraData(usize),
    #[error("unknown event version `{0}`")]
    UnknownVersion(u8),
    #[error("declared length `{declared}` exceeds limit `{limit}`")]
    TooLong { declared: usize, limit: usize },
    #[error("invalid {0}")]
    Invalid(&'static str),
    #[error("rlp: {0}")]
    Rlp(#[from] alloy_rlp::Error),
}

pub trait Write {
    fn write(&self, buf: &mut impl BufMut);
}

pub trait EncodeSize {
    fn encode_size(&self) -> usize;
}

pub trait Read: Sized {
    fn read(buf: &mut impl Buf) -> Result<Self, DecodeError>;
}

pub trait Encode: Write + EncodeSize {
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encode_size());
        self.write(&mut buf);
        buf.freeze()
    }
}

impl<T: Write + EncodeSize> Encode for T {}

pub trait Decode: Read {
    fn decode(mut buf: &[u8]) -> Result<Self, DecodeError> {
        let value = Self::read(&mut buf)?;
        if !buf.is_empty() {
            return Err(DecodeError::ExtraData(buf.len()));
        }
        Ok(value)
    }
}

impl<T: Read> Decode for T {}

pub(crate) fn ensure_remaining(buf: &impl Buf, len: usize) -> Result<(), DecodeError> {
    if buf.remaining() < len {
        return Err(DecodeError::EndOfBuffer);
    }
    Ok(())
}

pub(crate) fn read_u8(buf: &mut impl Buf) -> Result<u8, DecodeError> {
    ensure_remaining(buf, 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn read_u16(buf: &mut impl Buf) -> Result<u16, DecodeError> {
    ensure_remaining(buf, 2)?;
    Ok(buf.get_u16())
}

pub(crate) fn read_u32(buf: &mut impl Buf) -> Result<u32, DecodeError> {
    ensure_remaining(buf, 4)?;
    Ok(buf.get_u32())
}

pub(crate) fn read_u64(buf: &mut impl Buf) -> Result<u64, DecodeError> {
    ensure_remaining(buf, 8)?;
    Ok(buf.get_u64())
}

pub(crate) fn read_b256(buf: &mut impl Buf) -> Result<B256, DecodeError> {
    ensure_remaining(buf, 32)?;
    let mut out = B256::ZERO;
    buf.copy_to_slice(out.as_mut_slice());
    Ok(out)
}

pub(crate) fn read_bytes(buf: &mut impl Buf, len: usize) -> Result<Bytes, DecodeError> {
    ensure_remaining(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}
