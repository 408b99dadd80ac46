//! Compression algorithm registry.
//!
//! # Identity rules
//! Every algorithm is identified on the wire by a small integer tag stored in
//! the COMPRESSED bottle header. Tags are permanent: a tag is never reused,
//! even if an algorithm is retired. A reader that meets a tag it does not
//! know fails with [`BottleError::UnsupportedCodec`]; there is no fallback.
//!
//! All codecs here are streaming in both directions, so a compressed bottle
//! never has to be held in memory.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{BottleError, Result};

/// Default level (zstd scale; brotli quality is clamped to 0–11).
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

const BROTLI_BUFFER: usize = 4096;
const BROTLI_LGWIN:  u32   = 22;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// LZ4 frames — maximum throughput, lower ratio.
    Lz4,
    /// Zstandard — balanced speed/ratio (default).
    #[default]
    Zstd,
    /// Brotli — slow, high ratio.
    Brotli,
}

impl CompressionAlgorithm {
    /// Frozen wire tag.
    pub fn tag(self) -> u64 {
        match self {
            CompressionAlgorithm::Lz4    => 0,
            CompressionAlgorithm::Zstd   => 1,
            CompressionAlgorithm::Brotli => 2,
        }
    }

    pub fn from_tag(tag: u64) -> Result<Self> {
        match tag {
            0 => Ok(CompressionAlgorithm::Lz4),
            1 => Ok(CompressionAlgorithm::Zstd),
            2 => Ok(CompressionAlgorithm::Brotli),
            other => Err(BottleError::UnsupportedCodec(other)),
        }
    }

    /// Human-readable name (for diagnostics only — never parsed from disk).
    pub fn name(self) -> &'static str {
        match self {
            CompressionAlgorithm::Lz4    => "lz4",
            CompressionAlgorithm::Zstd   => "zstd",
            CompressionAlgorithm::Brotli => "brotli",
        }
    }

    /// Parse from a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "lz4"    => Some(CompressionAlgorithm::Lz4),
            "zstd"   => Some(CompressionAlgorithm::Zstd),
            "brotli" => Some(CompressionAlgorithm::Brotli),
            _        => None,
        }
    }

    /// Wrap `writer` in this algorithm's streaming encoder.
    pub fn encoder<W: Write>(self, writer: W, level: i32) -> Result<Encoder<W>> {
        Ok(match self {
            CompressionAlgorithm::Lz4 => Encoder::Lz4(lz4_flex::frame::FrameEncoder::new(writer)),
            CompressionAlgorithm::Zstd => Encoder::Zstd(zstd::stream::write::Encoder::new(writer, level)?),
            CompressionAlgorithm::Brotli => {
                let quality = level.clamp(0, 11) as u32;
                Encoder::Brotli(brotli::CompressorWriter::new(ErrorLatch::new(writer), BROTLI_BUFFER, quality, BROTLI_LGWIN))
            }
        })
    }

    /// Wrap `reader` in this algorithm's streaming decoder.
    pub fn decoder<'a, R: Read + 'a>(self, reader: R) -> Result<Box<dyn Read + 'a>> {
        Ok(match self {
            CompressionAlgorithm::Lz4    => Box::new(lz4_flex::frame::FrameDecoder::new(reader)),
            CompressionAlgorithm::Zstd   => Box::new(zstd::stream::read::Decoder::new(reader)?),
            CompressionAlgorithm::Brotli => Box::new(brotli::Decompressor::new(reader, BROTLI_BUFFER)),
        })
    }
}

/// A streaming compressor. [`finish`](Encoder::finish) must be called to
/// flush the codec's trailer.
pub enum Encoder<W: Write> {
    Lz4(lz4_flex::frame::FrameEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
    Brotli(brotli::CompressorWriter<ErrorLatch<W>>),
}

impl<W: Write> Encoder<W> {
    pub fn finish(self) -> Result<W> {
        match self {
            Encoder::Lz4(e) => e
                .finish()
                .map_err(|e| BottleError::UnderlyingIo(io::Error::new(io::ErrorKind::Other, e))),
            Encoder::Zstd(e) => Ok(e.finish()?),
            // into_inner() writes the final brotli block and discards any
            // error doing so; the latch keeps it.
            Encoder::Brotli(e) => e.into_inner().into_result(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Lz4(e)    => e.write(buf),
            Encoder::Zstd(e)   => e.write(buf),
            Encoder::Brotli(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Lz4(e)    => e.flush(),
            Encoder::Zstd(e)   => e.flush(),
            Encoder::Brotli(e) => e.flush(),
        }
    }
}

/// Remembers the first write error so it can be reported after an API that
/// swallows it.
pub struct ErrorLatch<W> {
    inner: W,
    error: Option<io::Error>,
}

impl<W: Write> ErrorLatch<W> {
    fn new(inner: W) -> Self {
        Self { inner, error: None }
    }

    fn latch<T>(&mut self, result: io::Result<T>) -> io::Result<T> {
        match result {
            Err(e) if self.error.is_none() => {
                let copy = io::Error::new(e.kind(), e.to_string());
                self.error = Some(e);
                Err(copy)
            }
            other => other,
        }
    }

    fn into_result(self) -> Result<W> {
        match self.error {
            Some(e) => Err(e.into()),
            None => Ok(self.inner),
        }
    }
}

impl<W: Write> Write for ErrorLatch<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = self.inner.write(buf);
        self.latch(result)
    }

    fn flush(&mut self) -> io::Result<()> {
        let result = self.inner.flush();
        self.latch(result)
    }
}
