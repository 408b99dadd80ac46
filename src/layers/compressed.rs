//! COMPRESSED bottles: one chunked substream holding the inner bottle run
//! through a streaming compressor.

use std::io::{Read, Write};

use tracing::debug;

use crate::codec::CompressionAlgorithm;
use crate::error::{BottleError, Result};
use crate::header::Header;
use crate::io_stream::{ensure_exhausted, BottleKind, BottleReader, BottleWriter};

/// INTEGER id of the algorithm tag.
pub const FIELD_COMPRESSION_TYPE: u64 = 0;

pub fn header(algorithm: CompressionAlgorithm) -> Header {
    Header::builder().integer(FIELD_COMPRESSION_TYPE, algorithm.tag()).build()
}

/// Write a COMPRESSED bottle to `sink`; `body` writes the uncompressed inner
/// bottle.
pub fn write<W, T, F>(sink: W, algorithm: CompressionAlgorithm, level: i32, body: F) -> Result<(W, T)>
where
    W: Write,
    F: FnOnce(&mut dyn Write) -> Result<T>,
{
    let mut bottle = BottleWriter::new(sink, BottleKind::Compressed, &header(algorithm))?;
    let value = {
        let mut encoder = algorithm.encoder(bottle.substream()?, level)?;
        let value = body(&mut encoder)?;
        let compressed = encoder.finish()?.finish()?;
        debug!(algorithm = algorithm.name(), compressed, "compressed bottle sealed");
        value
    };
    bottle.close()?;
    Ok((bottle.into_inner(), value))
}

pub fn algorithm<R: Read>(bottle: &BottleReader<R>) -> Result<CompressionAlgorithm> {
    if bottle.kind() != BottleKind::Compressed {
        return Err(BottleError::UnexpectedKind { expected: "compressed", found: bottle.kind().tag() });
    }
    let tag = bottle
        .header()
        .integer(FIELD_COMPRESSION_TYPE)
        .ok_or_else(|| BottleError::MalformedHeader("compressed bottle has no algorithm".into()))?;
    CompressionAlgorithm::from_tag(tag)
}

/// Decompress the inner bottle and hand the plain stream to `body`.
///
/// The decoded stream must end where `body` stopped reading; anything left
/// over is [`BottleError::MalformedFrame`]. The bottle is consumed through
/// its end marker on success.
pub fn decompress_with<R, T, F>(bottle: &mut BottleReader<R>, body: F) -> Result<T>
where
    R: Read,
    F: FnOnce(&mut dyn Read) -> Result<T>,
{
    let algorithm = algorithm(bottle)?;
    let value = {
        let mut sub = bottle.require_substream("content")?;
        let value = {
            let mut decoder = algorithm.decoder(&mut sub)?;
            let value = body(&mut decoder)?;
            ensure_exhausted(&mut decoder, "compressed bottle")?;
            value
        };
        // Some decoders stop at their own trailer without asking for EOF.
        let slack = sub.drain()?;
        if slack > 0 {
            return Err(BottleError::MalformedFrame(format!(
                "{slack} bytes after the {} stream",
                algorithm.name()
            )));
        }
        value
    };
    bottle.expect_end()?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DEFAULT_COMPRESSION_LEVEL;

    #[test]
    fn every_algorithm_roundtrips_through_a_bottle() {
        let data: Vec<u8> = b"nothing\n".iter().cycle().take(300_000).copied().collect();
        for algorithm in [CompressionAlgorithm::Lz4, CompressionAlgorithm::Zstd, CompressionAlgorithm::Brotli] {
            let (bytes, ()) =
                write(Vec::new(), algorithm, DEFAULT_COMPRESSION_LEVEL, |w| Ok(w.write_all(&data)?)).unwrap();
            assert!(bytes.len() < data.len() / 10);

            let mut bottle = BottleReader::new(&bytes[..]).unwrap();
            let back = decompress_with(&mut bottle, |r| {
                let mut v = Vec::new();
                r.read_to_end(&mut v)?;
                Ok(v)
            })
            .unwrap();
            assert_eq!(back, data, "{}", algorithm.name());
        }
    }

    #[test]
    fn unread_plaintext_is_trailing_data() {
        let (bytes, ()) =
            write(Vec::new(), CompressionAlgorithm::Zstd, 1, |w| Ok(w.write_all(b"0123456789")?)).unwrap();
        let mut bottle = BottleReader::new(&bytes[..]).unwrap();
        let err = decompress_with(&mut bottle, |r| {
            let mut half = [0u8; 5];
            r.read_exact(&mut half)?;
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, BottleError::MalformedFrame(_)));
    }

    #[test]
    fn unknown_algorithm_is_unsupported() {
        let mut w = BottleWriter::new(Vec::new(), BottleKind::Compressed, &Header::builder().integer(0, 7).build())
            .unwrap();
        w.write_bytes(b"whatever").unwrap();
        w.close().unwrap();
        let bytes = w.into_inner();
        let mut bottle = BottleReader::new(&bytes[..]).unwrap();
        let err = decompress_with(&mut bottle, |_| Ok(())).unwrap_err();
        assert!(matches!(err, BottleError::UnsupportedCodec(7)));
    }
}
