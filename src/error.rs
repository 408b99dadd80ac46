//! Crate-wide error type.
//!
//! Framing errors raised inside `Read`/`Write` implementations travel through
//! `std::io::Error` and are unwrapped back into the original [`BottleError`]
//! by the `From<io::Error>` conversion, so callers never see a flattened
//! "other" error where a format error occurred.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BottleError>;

#[derive(Error, Debug)]
pub enum BottleError {
    #[error("Malformed varint: {0}")]
    MalformedVarInt(&'static str),
    #[error("Malformed header: {0}")]
    MalformedHeader(String),
    #[error("Malformed substream framing: {0}")]
    MalformedFrame(String),
    /// A substream was abandoned before it was drained, or a new one was
    /// opened while the previous one was still in flight.
    #[error("Bottle sequencing violation: {0}")]
    BottleSequencingViolation(&'static str),
    #[error("Bottle is already closed")]
    ClosedBottle,
    #[error("Expected a {expected} bottle, found kind {found}")]
    UnexpectedKind { expected: &'static str, found: u8 },
    #[error("Unsupported compression algorithm {0}")]
    UnsupportedCodec(u64),
    #[error("Unsupported cipher {0}")]
    UnsupportedCipher(u64),
    #[error("Unsupported hash algorithm {0}")]
    UnsupportedHash(u64),
    /// The stored digest does not match the streamed content. Any file data
    /// already delivered to a sink must be treated as suspect.
    #[error("Integrity mismatch: expected {expected}, computed {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("No decryption key available for this archive")]
    MissingDecryptionKey,
    #[error("Key service unavailable: {0}")]
    KeyServiceUnavailable(String),
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("Crypto error: {0}")]
    Crypto(String),
    #[error("Refusing to overwrite existing file {}", .0.display())]
    AlreadyExists(PathBuf),
    #[error("IO error: {0}")]
    UnderlyingIo(io::Error),
}

impl From<io::Error> for BottleError {
    fn from(err: io::Error) -> Self {
        if !err.get_ref().is_some_and(|inner| inner.is::<BottleError>()) {
            return BottleError::UnderlyingIo(err);
        }
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<BottleError>()) {
            Some(Ok(ours)) => *ours,
            Some(Err(other)) => BottleError::UnderlyingIo(io::Error::new(kind, other)),
            None => BottleError::UnderlyingIo(io::Error::from(kind)),
        }
    }
}

impl From<BottleError> for io::Error {
    fn from(err: BottleError) -> Self {
        match err {
            BottleError::UnderlyingIo(inner) => inner,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_errors_survive_an_io_round_trip() {
        let tunnelled: io::Error = BottleError::ClosedBottle.into();
        assert_eq!(tunnelled.kind(), io::ErrorKind::InvalidData);
        assert!(matches!(BottleError::from(tunnelled), BottleError::ClosedBottle));
    }

    #[test]
    fn plain_io_errors_stay_io() {
        let err = BottleError::from(io::Error::from(io::ErrorKind::UnexpectedEof));
        match err {
            BottleError::UnderlyingIo(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected {other:?}"),
        }
    }
}
