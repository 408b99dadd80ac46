//! HASHED bottles: an inner bottle followed by its digest.
//!
//! ```text
//! substream 0  chunked   inner bottle bytes
//! substream 1  sized     digest of substream 0
//! ```
//!
//! # Validation
//! The digest trails the data it covers, so validation is two-phase and the
//! types enforce the order: [`begin_validate`] yields a [`Validator`] to read
//! the inner bottle through; only once it has reached end of stream does
//! [`Validator::finish`] hand out the [`PendingDigest`] that can compare
//! against the stored value.

use std::io::{self, Read, Write};

use tracing::{debug, warn};

use crate::digest::{HashAlgorithm, Hasher, HashingReader, HashingWriter};
use crate::error::{BottleError, Result};
use crate::header::Header;
use crate::io_stream::{BottleKind, BottleReader, BottleWriter, SubstreamReader};

/// INTEGER id of the algorithm tag.
pub const FIELD_HASH_TYPE: u64 = 0;

/// Refuse digest substreams longer than this.
const MAX_DIGEST_LEN: u64 = 1024;

pub fn header(algorithm: HashAlgorithm) -> Header {
    Header::builder().integer(FIELD_HASH_TYPE, algorithm.tag()).build()
}

/// Write a HASHED bottle to `sink`. `body` writes the inner bottle into the
/// hashing stream it is given.
pub fn write<W, T, F>(sink: W, algorithm: HashAlgorithm, body: F) -> Result<(W, T)>
where
    W: Write,
    F: FnOnce(&mut dyn Write) -> Result<T>,
{
    let mut bottle = BottleWriter::new(sink, BottleKind::Hashed, &header(algorithm))?;
    let (value, digest) = {
        let mut hashing = HashingWriter::new(bottle.substream()?, algorithm);
        let value = body(&mut hashing)?;
        let (sub, digest) = hashing.finish();
        sub.finish()?;
        (value, digest)
    };
    debug!(algorithm = algorithm.name(), digest = %hex::encode(&digest), "hashed bottle sealed");
    bottle.write_bytes(&digest)?;
    bottle.close()?;
    Ok((bottle.into_inner(), value))
}

pub fn algorithm<R: Read>(bottle: &BottleReader<R>) -> Result<HashAlgorithm> {
    if bottle.kind() != BottleKind::Hashed {
        return Err(BottleError::UnexpectedKind { expected: "hashed", found: bottle.kind().tag() });
    }
    let tag = bottle
        .header()
        .integer(FIELD_HASH_TYPE)
        .ok_or_else(|| BottleError::MalformedHeader("hashed bottle has no algorithm".into()))?;
    HashAlgorithm::from_tag(tag)
}

/// Phase one: open the inner bottle for reading.
pub fn begin_validate<R: Read>(bottle: &mut BottleReader<R>) -> Result<Validator<'_, R>> {
    let algorithm = algorithm(bottle)?;
    let inner = bottle.require_substream("content")?;
    Ok(Validator { reader: HashingReader::new(inner, algorithm), algorithm })
}

/// Reads the inner bottle while digesting it.
pub struct Validator<'a, R: Read> {
    reader:    HashingReader<SubstreamReader<'a, R>>,
    algorithm: HashAlgorithm,
}

impl<R: Read> Validator<'_, R> {
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn bytes_hashed(&self) -> u64 {
        self.reader.bytes_hashed()
    }

    /// Fails unless a read has already returned end of stream.
    pub fn finish(self) -> Result<PendingDigest> {
        if !self.reader.at_eof() {
            return Err(BottleError::BottleSequencingViolation(
                "hashed content must be read to the end before validation",
            ));
        }
        let (_, hasher) = self.reader.into_parts();
        Ok(PendingDigest { algorithm: self.algorithm, hasher })
    }
}

impl<R: Read> Read for Validator<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

/// Phase two: the digest of everything read, waiting for the stored value.
pub struct PendingDigest {
    algorithm: HashAlgorithm,
    hasher:    Hasher,
}

impl PendingDigest {
    /// Read the digest substream from `bottle` and compare. Substreams after
    /// the digest are skipped.
    pub fn outcome<R: Read>(self, bottle: &mut BottleReader<R>) -> Result<HashOutcome> {
        let expected = bottle.require_substream("digest")?.read_small(MAX_DIGEST_LEN)?;
        bottle.skip_to_end()?;
        let actual = self.hasher.finalize();
        let outcome = HashOutcome {
            algorithm:    self.algorithm,
            valid:        actual == expected,
            digest_hex:   hex::encode(&actual),
            expected_hex: hex::encode(&expected),
        };
        if !outcome.valid {
            warn!(
                algorithm = self.algorithm.name(),
                expected = %outcome.expected_hex,
                actual = %outcome.digest_hex,
                "hash mismatch"
            );
        }
        Ok(outcome)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct HashOutcome {
    pub algorithm:    HashAlgorithm,
    pub valid:        bool,
    pub digest_hex:   String,
    pub expected_hex: String,
}

impl HashOutcome {
    pub fn into_result(self) -> Result<Self> {
        if self.valid {
            Ok(self)
        } else {
            Err(BottleError::IntegrityMismatch { expected: self.expected_hex, actual: self.digest_hex })
        }
    }
}

/// Both phases in one call. `body` must leave the inner stream at its end;
/// whatever it leaves behind is checked for and rejected.
pub fn validate_with<R, T, F>(bottle: &mut BottleReader<R>, body: F) -> Result<(T, HashOutcome)>
where
    R: Read,
    F: FnOnce(&mut dyn Read) -> Result<T>,
{
    let (value, pending) = {
        let mut validator = begin_validate(bottle)?;
        let value = body(&mut validator)?;
        crate::io_stream::ensure_exhausted(&mut validator, "hashed bottle")?;
        (value, validator.finish()?)
    };
    Ok((value, pending.outcome(bottle)?))
}
