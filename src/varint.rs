//! Minimal base-128 variable-length integers.
//!
//! Each byte carries 7 magnitude bits, least significant group first; the high
//! bit marks that another byte follows. Every value has exactly one encoding
//! (the shortest), so a `u64` never takes more than [`MAX_VARINT_LEN`] bytes.
//! Signed values go through zig-zag first so small negatives stay short.

use std::io::{self, Read, Write};

use crate::error::{BottleError, Result};

/// Longest encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Encode `value` into a fresh buffer.
pub fn encode(value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(value));
    let mut v = value;
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

/// Number of bytes [`encode`] produces for `value`.
pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    (bits.max(1) + 6) / 7
}

pub fn write_varint<W: Write + ?Sized>(writer: &mut W, value: u64) -> io::Result<()> {
    writer.write_all(&encode(value))
}

/// Decode one varint, consuming exactly the bytes [`encode`] wrote.
pub fn read_varint<R: Read + ?Sized>(reader: &mut R) -> Result<u64> {
    match read_varint_or_eof(reader)? {
        Some(v) => Ok(v),
        None => Err(BottleError::MalformedVarInt("source ended before the first byte")),
    }
}

/// Like [`read_varint`], but a clean end of stream before the first byte
/// yields `None` instead of an error.
pub fn read_varint_or_eof<R: Read + ?Sized>(reader: &mut R) -> Result<Option<u64>> {
    let mut value: u64 = 0;
    for i in 0..MAX_VARINT_LEN {
        let mut byte = [0u8; 1];
        if let Err(e) = reader.read_exact(&mut byte) {
            return match e.kind() {
                io::ErrorKind::UnexpectedEof if i == 0 => Ok(None),
                io::ErrorKind::UnexpectedEof => {
                    Err(BottleError::MalformedVarInt("truncated continuation sequence"))
                }
                _ => Err(e.into()),
            };
        }
        let group = (byte[0] & 0x7f) as u64;
        // The tenth byte only has room for the top bit of a u64.
        if i == MAX_VARINT_LEN - 1 && group > 1 {
            return Err(BottleError::MalformedVarInt("value exceeds 64 bits"));
        }
        value |= group << (7 * i);
        if byte[0] & 0x80 == 0 {
            return Ok(Some(value));
        }
    }
    Err(BottleError::MalformedVarInt("value exceeds 64 bits"))
}

/// Decode a varint that must occupy all of `bytes`.
pub fn decode_exact(bytes: &[u8]) -> Result<u64> {
    let mut cursor = bytes;
    let value = read_varint(&mut cursor)?;
    if !cursor.is_empty() {
        return Err(BottleError::MalformedVarInt("trailing bytes after value"));
    }
    Ok(value)
}

#[inline]
pub fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

#[inline]
pub fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}
