//! Hash algorithms for HASHED bottles and the pass-through adapters that
//! digest bytes while they stream.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};

use crate::error::{BottleError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha512,
    Sha256,
    Blake3,
}

impl HashAlgorithm {
    /// Frozen wire tag.
    pub fn tag(self) -> u64 {
        match self {
            HashAlgorithm::Sha512 => 0,
            HashAlgorithm::Sha256 => 1,
            HashAlgorithm::Blake3 => 2,
        }
    }

    pub fn from_tag(tag: u64) -> Result<Self> {
        match tag {
            0 => Ok(HashAlgorithm::Sha512),
            1 => Ok(HashAlgorithm::Sha256),
            2 => Ok(HashAlgorithm::Blake3),
            other => Err(BottleError::UnsupportedHash(other)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha512 => "sha512",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Blake3 => "blake3",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sha512" | "sha-512" => Some(HashAlgorithm::Sha512),
            "sha256" | "sha-256" => Some(HashAlgorithm::Sha256),
            "blake3"             => Some(HashAlgorithm::Blake3),
            _                    => None,
        }
    }

    pub fn output_len(self) -> usize {
        match self {
            HashAlgorithm::Sha512 => 64,
            HashAlgorithm::Sha256 | HashAlgorithm::Blake3 => 32,
        }
    }

    pub fn hasher(self) -> Hasher {
        match self {
            HashAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            HashAlgorithm::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        let mut h = self.hasher();
        h.update(data);
        h.finalize()
    }
}

/// Incremental hashing state.
pub enum Hasher {
    Sha512(Sha512),
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    #[inline]
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha512(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Blake3(h) => {
                h.update(data);
            }
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::Sha512(h) => h.finalize().to_vec(),
            Hasher::Sha256(h) => h.finalize().to_vec(),
            Hasher::Blake3(h) => h.finalize().as_bytes().to_vec(),
        }
    }
}

/// Digests everything written through it.
pub struct HashingWriter<W: Write> {
    inner:  W,
    hasher: Hasher,
    count:  u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W, algorithm: HashAlgorithm) -> Self {
        Self { inner, hasher: algorithm.hasher(), count: 0 }
    }

    pub fn bytes_hashed(&self) -> u64 {
        self.count
    }

    pub fn finish(self) -> (W, Vec<u8>) {
        (self.inner, self.hasher.finalize())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Digests everything read through it and remembers whether the source has
/// reported end of stream.
pub struct HashingReader<R: Read> {
    inner:  R,
    hasher: Hasher,
    count:  u64,
    at_eof: bool,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R, algorithm: HashAlgorithm) -> Self {
        Self { inner, hasher: algorithm.hasher(), count: 0, at_eof: false }
    }

    pub fn bytes_hashed(&self) -> u64 {
        self.count
    }

    pub fn at_eof(&self) -> bool {
        self.at_eof
    }

    pub fn into_parts(self) -> (R, Hasher) {
        (self.inner, self.hasher)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.at_eof = true;
        }
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }
}
