//! Bottle framing — writer and reader.
//!
//! # Wire layout
//!
//! ```text
//! bottle    := kind: u8 | header | substream* | 0x00
//! substream := 0x01 | length: varint | payload[length]          (sized)
//!            | 0x02 | (length: varint > 0 | payload[length])* | 0x00   (chunked)
//! ```
//!
//! Sized substreams are used when the producer knows the byte count up front
//! (leaf file content). Nested bottles and transformed streams are chunked,
//! so nothing has to be buffered to learn its length.
//!
//! # Cursor discipline
//! Both sides share one forward cursor. On the write side the borrow checker
//! enforces it: a [`SubstreamWriter`] holds `&mut BottleWriter` until it is
//! finished. On the read side a [`SubstreamReader`] must be drained (or the
//! bottle skipped) before the next call to [`BottleReader::next_substream`];
//! dropping one half-read is detected and reported as
//! [`BottleError::BottleSequencingViolation`].

use std::io::{self, Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt};
use tracing::trace;

use crate::error::{BottleError, Result};
use crate::header::Header;
use crate::varint::{read_varint, write_varint};

/// Largest chunk emitted by a [`SubstreamWriter`]: 64 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

pub const FRAME_END:     u8 = 0x00;
pub const FRAME_SIZED:   u8 = 0x01;
pub const FRAME_CHUNKED: u8 = 0x02;

// ── Bottle kinds ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BottleKind {
    File,
    Hashed,
    Compressed,
    Encrypted,
    /// A kind this build does not understand; readers skip it.
    Unknown(u8),
}

impl BottleKind {
    pub fn tag(self) -> u8 {
        match self {
            BottleKind::File       => 0,
            BottleKind::Hashed     => 1,
            BottleKind::Compressed => 2,
            BottleKind::Encrypted  => 3,
            BottleKind::Unknown(t) => t,
        }
    }

    pub fn from_tag(tag: u8) -> Self {
        match tag {
            0 => BottleKind::File,
            1 => BottleKind::Hashed,
            2 => BottleKind::Compressed,
            3 => BottleKind::Encrypted,
            t => BottleKind::Unknown(t),
        }
    }

    /// Human-readable name (diagnostics only).
    pub fn name(self) -> &'static str {
        match self {
            BottleKind::File       => "file",
            BottleKind::Hashed     => "hashed",
            BottleKind::Compressed => "compressed",
            BottleKind::Encrypted  => "encrypted",
            BottleKind::Unknown(_) => "unknown",
        }
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// Start a bottle on `writer`. Shorthand for [`BottleWriter::new`].
pub fn write_bottle<W: Write>(writer: W, kind: BottleKind, header: &Header) -> Result<BottleWriter<W>> {
    BottleWriter::new(writer, kind, header)
}

pub struct BottleWriter<W: Write> {
    writer:         W,
    kind:           BottleKind,
    chunk_size:     usize,
    open_substream: bool,
    closed:         bool,
}

impl<W: Write> BottleWriter<W> {
    pub fn new(writer: W, kind: BottleKind, header: &Header) -> Result<Self> {
        Self::with_chunk_size(writer, kind, header, DEFAULT_CHUNK_SIZE)
    }

    /// Write the kind tag and header immediately; substreams follow.
    pub fn with_chunk_size(
        mut writer: W,
        kind:       BottleKind,
        header:     &Header,
        chunk_size: usize,
    ) -> Result<Self> {
        writer.write_u8(kind.tag())?;
        header.write(&mut writer)?;
        trace!(kind = kind.name(), fields = header.fields().len(), "bottle opened for writing");
        Ok(Self {
            writer,
            kind,
            chunk_size: chunk_size.max(1),
            open_substream: false,
            closed: false,
        })
    }

    pub fn kind(&self) -> BottleKind {
        self.kind
    }

    fn ready(&self) -> Result<()> {
        if self.closed {
            return Err(BottleError::ClosedBottle);
        }
        if self.open_substream {
            return Err(BottleError::BottleSequencingViolation(
                "previous substream was dropped without finish()",
            ));
        }
        Ok(())
    }

    /// Frame everything `reader` yields as one substream.
    ///
    /// With `known_length` the substream is sized and exactly that many bytes
    /// are copied; a source that ends early is an error. Without it the
    /// content is chunked. Returns the payload byte count.
    pub fn write_substream<R: Read>(&mut self, mut reader: R, known_length: Option<u64>) -> Result<u64> {
        self.ready()?;
        match known_length {
            Some(len) => {
                self.writer.write_u8(FRAME_SIZED)?;
                write_varint(&mut self.writer, len)?;
                let copied = io::copy(&mut reader.by_ref().take(len), &mut self.writer)?;
                if copied != len {
                    return Err(BottleError::UnderlyingIo(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("substream source ended after {copied} of {len} bytes"),
                    )));
                }
                Ok(len)
            }
            None => {
                let mut sub = self.substream()?;
                io::copy(&mut reader, &mut sub)?;
                sub.finish()
            }
        }
    }

    /// Write `data` as a sized substream.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<u64> {
        self.write_substream(data, Some(data.len() as u64))
    }

    /// Open a chunked substream for incremental writing.
    pub fn substream(&mut self) -> Result<SubstreamWriter<'_, W>> {
        self.ready()?;
        self.writer.write_u8(FRAME_CHUNKED)?;
        self.open_substream = true;
        let capacity = self.chunk_size;
        Ok(SubstreamWriter { bottle: self, buf: Vec::with_capacity(capacity), total: 0 })
    }

    /// Write the end-of-substreams marker. Every later write fails with
    /// [`BottleError::ClosedBottle`]. The underlying writer is not flushed.
    pub fn close(&mut self) -> Result<()> {
        self.ready()?;
        self.writer.write_u8(FRAME_END)?;
        self.closed = true;
        trace!(kind = self.kind.name(), "bottle closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Chunked substream under construction. Call [`finish`](Self::finish) to
/// write the terminating zero-length chunk.
pub struct SubstreamWriter<'a, W: Write> {
    bottle: &'a mut BottleWriter<W>,
    buf:    Vec<u8>,
    total:  u64,
}

impl<W: Write> SubstreamWriter<'_, W> {
    fn emit(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        write_varint(&mut self.bottle.writer, self.buf.len() as u64)?;
        self.bottle.writer.write_all(&self.buf)?;
        self.buf.clear();
        Ok(())
    }

    pub fn finish(mut self) -> Result<u64> {
        self.emit()?;
        write_varint(&mut self.bottle.writer, 0)?;
        self.bottle.open_substream = false;
        Ok(self.total)
    }
}

impl<W: Write> Write for SubstreamWriter<'_, W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = self.bottle.chunk_size - self.buf.len();
        let n = room.min(data.len());
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() >= self.bottle.chunk_size {
            self.emit()?;
        }
        self.total += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit()?;
        self.bottle.writer.flush()
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Parse a bottle's kind and header from `reader`. Shorthand for
/// [`BottleReader::new`].
pub fn read_bottle<R: Read>(reader: R) -> Result<BottleReader<R>> {
    BottleReader::new(reader)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    /// Between substreams.
    Idle,
    Sized { remaining: u64 },
    Chunked { remaining: u64, finished: bool },
    /// End marker consumed.
    Ended,
}

impl Cursor {
    fn in_flight(self) -> bool {
        match self {
            Cursor::Sized { remaining }        => remaining > 0,
            Cursor::Chunked { finished, .. }   => !finished,
            Cursor::Idle | Cursor::Ended       => false,
        }
    }
}

pub struct BottleReader<R: Read> {
    reader: R,
    kind:   BottleKind,
    header: Header,
    cursor: Cursor,
}

impl<R: Read> BottleReader<R> {
    pub fn new(mut reader: R) -> Result<Self> {
        let kind = BottleKind::from_tag(reader.read_u8()?);
        let header = Header::read(&mut reader)?;
        trace!(kind = kind.name(), fields = header.fields().len(), "bottle opened for reading");
        Ok(Self { reader, kind, header, cursor: Cursor::Idle })
    }

    pub fn kind(&self) -> BottleKind {
        self.kind
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Next framed substream, or `None` once the end marker has been read.
    pub fn next_substream(&mut self) -> Result<Option<SubstreamReader<'_, R>>> {
        if self.cursor == Cursor::Ended {
            return Ok(None);
        }
        if self.cursor.in_flight() {
            return Err(BottleError::BottleSequencingViolation(
                "previous substream was not drained",
            ));
        }
        let tag = self.reader.read_u8().map_err(|e| truncated("substream tag", e))?;
        self.cursor = match tag {
            FRAME_END => {
                self.cursor = Cursor::Ended;
                return Ok(None);
            }
            FRAME_SIZED => Cursor::Sized { remaining: read_varint(&mut self.reader)? },
            FRAME_CHUNKED => Cursor::Chunked { remaining: 0, finished: false },
            other => {
                return Err(BottleError::MalformedFrame(format!("unknown substream tag {other:#04x}")));
            }
        };
        Ok(Some(SubstreamReader { bottle: self }))
    }

    fn read_current(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Cursor::Chunked { remaining: 0, finished: false } = self.cursor {
                let len = read_varint(&mut self.reader).map_err(|e| match e {
                    BottleError::MalformedVarInt(why) => {
                        BottleError::MalformedFrame(format!("chunk length: {why}"))
                    }
                    other => other,
                })?;
                self.cursor = Cursor::Chunked { remaining: len, finished: len == 0 };
                continue;
            }
            let remaining = match &mut self.cursor {
                Cursor::Sized { remaining } | Cursor::Chunked { remaining, finished: false } => remaining,
                _ => return Ok(0),
            };
            if *remaining == 0 {
                return Ok(0);
            }
            let want = (buf.len() as u64).min(*remaining) as usize;
            let n = self.reader.read(&mut buf[..want])?;
            if n == 0 {
                return Err(BottleError::MalformedFrame("substream truncated".into()));
            }
            *remaining -= n as u64;
            return Ok(n);
        }
    }

    fn drain_current(&mut self) -> Result<u64> {
        let mut scratch = [0u8; 8192];
        let mut total = 0u64;
        loop {
            let n = self.read_current(&mut scratch)?;
            if n == 0 {
                return Ok(total);
            }
            total += n as u64;
        }
    }

    /// Drain every remaining substream (including a partially read one)
    /// without materialising it. Used for kinds the reader does not know.
    pub fn skip_to_end(&mut self) -> Result<u64> {
        let mut total = self.drain_current()?;
        while let Some(mut sub) = self.next_substream()? {
            total += sub.drain()?;
        }
        Ok(total)
    }

    /// Consume the end marker, failing if another substream follows.
    pub fn expect_end(&mut self) -> Result<()> {
        match self.next_substream()? {
            None => Ok(()),
            Some(_) => Err(BottleError::MalformedFrame(format!(
                "{} bottle has more substreams than expected",
                self.kind.name()
            ))),
        }
    }

    /// Next substream, failing with `MalformedFrame` if the bottle has ended.
    pub fn require_substream(&mut self, what: &str) -> Result<SubstreamReader<'_, R>> {
        let kind = self.kind.name();
        self.next_substream()?
            .ok_or_else(|| BottleError::MalformedFrame(format!("{kind} bottle is missing its {what}")))
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// One substream's bytes. Reads return 0 at the end of the substream, not
/// at the end of the underlying source.
pub struct SubstreamReader<'a, R: Read> {
    bottle: &'a mut BottleReader<R>,
}

impl<R: Read> SubstreamReader<'_, R> {
    /// Read and discard whatever is left. Returns the discarded byte count.
    pub fn drain(&mut self) -> Result<u64> {
        self.bottle.drain_current()
    }

    pub fn is_drained(&self) -> bool {
        !self.bottle.cursor.in_flight()
    }

    /// Read a whole substream that is known to be small (digests, keys).
    pub fn read_small(&mut self, limit: u64) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.by_ref().take(limit).read_to_end(&mut out)?;
        if !self.is_drained() {
            ensure_exhausted(self, "small substream")?;
        }
        Ok(out)
    }
}

impl<R: Read> Read for SubstreamReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.bottle.read_current(buf).map_err(io::Error::from)
    }
}

/// Fail with `MalformedFrame` if `reader` yields anything more.
pub fn ensure_exhausted<R: Read + ?Sized>(reader: &mut R, what: &str) -> Result<()> {
    let mut probe = [0u8; 1];
    loop {
        match reader.read(&mut probe) {
            Ok(0) => return Ok(()),
            Ok(_) => return Err(BottleError::MalformedFrame(format!("trailing data after {what}"))),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn truncated(what: &str, err: io::Error) -> BottleError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => BottleError::MalformedFrame(format!("truncated {what}")),
        _ => err.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(content: &[u8]) -> Vec<u8> {
        let header = Header::builder().string(0, "nothing.txt").integer(0, content.len() as u64).build();
        let mut bottle = BottleWriter::new(Vec::new(), BottleKind::File, &header).unwrap();
        bottle.write_bytes(content).unwrap();
        bottle.close().unwrap();
        bottle.into_inner()
    }

    #[test]
    fn leaf_roundtrip() {
        let bytes = leaf(b"nothing\n");
        let mut bottle = read_bottle(&bytes[..]).unwrap();
        assert_eq!(bottle.kind(), BottleKind::File);
        assert_eq!(bottle.header().integer(0), Some(8));

        let mut content = Vec::new();
        bottle.next_substream().unwrap().unwrap().read_to_end(&mut content).unwrap();
        assert_eq!(content, b"nothing\n");
        assert!(bottle.next_substream().unwrap().is_none());
        assert!(bottle.next_substream().unwrap().is_none());
    }

    #[test]
    fn chunked_content_spans_many_chunks() {
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let mut bottle =
            BottleWriter::with_chunk_size(Vec::new(), BottleKind::File, &Header::default(), 1000).unwrap();
        assert_eq!(bottle.write_substream(&data[..], None).unwrap(), data.len() as u64);
        bottle.write_substream(&b""[..], None).unwrap();
        bottle.close().unwrap();
        let bytes = bottle.into_inner();

        let mut reader = read_bottle(&bytes[..]).unwrap();
        let mut back = Vec::new();
        reader.next_substream().unwrap().unwrap().read_to_end(&mut back).unwrap();
        assert_eq!(back, data);
        let mut empty = Vec::new();
        reader.next_substream().unwrap().unwrap().read_to_end(&mut empty).unwrap();
        assert!(empty.is_empty());
        reader.expect_end().unwrap();
    }

    #[test]
    fn undrained_substream_is_a_sequencing_violation() {
        let mut bottle = BottleWriter::new(Vec::new(), BottleKind::File, &Header::default()).unwrap();
        bottle.write_bytes(b"first substream").unwrap();
        bottle.write_bytes(b"second").unwrap();
        bottle.close().unwrap();
        let bytes = bottle.into_inner();

        let mut reader = read_bottle(&bytes[..]).unwrap();
        {
            let mut sub = reader.next_substream().unwrap().unwrap();
            let mut partial = [0u8; 4];
            sub.read_exact(&mut partial).unwrap();
        }
        assert!(matches!(
            reader.next_substream(),
            Err(BottleError::BottleSequencingViolation(_))
        ));
        // Skipping recovers the cursor.
        assert_eq!(reader.skip_to_end().unwrap(), 11 + 6);
        assert!(reader.next_substream().unwrap().is_none());
    }

    #[test]
    fn writes_after_close_fail() {
        let mut bottle = BottleWriter::new(Vec::new(), BottleKind::File, &Header::default()).unwrap();
        bottle.close().unwrap();
        assert!(matches!(bottle.write_bytes(b"late"), Err(BottleError::ClosedBottle)));
        assert!(matches!(bottle.substream().err(), Some(BottleError::ClosedBottle)));
        assert!(matches!(bottle.close(), Err(BottleError::ClosedBottle)));
    }

    #[test]
    fn unfinished_substream_writer_blocks_the_bottle() {
        let mut bottle = BottleWriter::new(Vec::new(), BottleKind::File, &Header::default()).unwrap();
        {
            let mut sub = bottle.substream().unwrap();
            sub.write_all(b"abandoned").unwrap();
        }
        assert!(matches!(bottle.close(), Err(BottleError::BottleSequencingViolation(_))));
    }

    #[test]
    fn short_sized_source_fails() {
        let mut bottle = BottleWriter::new(Vec::new(), BottleKind::File, &Header::default()).unwrap();
        let err = bottle.write_substream(&b"abc"[..], Some(10)).unwrap_err();
        assert!(matches!(err, BottleError::UnderlyingIo(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn unknown_kind_can_be_skipped_inside_a_parent() {
        let mut inner = BottleWriter::new(Vec::new(), BottleKind::Unknown(0x7e), &Header::default()).unwrap();
        inner.write_substream(&b"opaque payload"[..], None).unwrap();
        inner.write_bytes(b"more").unwrap();
        inner.close().unwrap();
        let inner = inner.into_inner();

        let mut outer = Vec::new();
        outer.extend_from_slice(&inner);
        outer.extend_from_slice(&leaf(b"after"));

        let mut cursor = &outer[..];
        let mut unknown = read_bottle(&mut cursor).unwrap();
        assert_eq!(unknown.kind(), BottleKind::Unknown(0x7e));
        unknown.skip_to_end().unwrap();

        let mut next = read_bottle(&mut cursor).unwrap();
        let mut content = Vec::new();
        next.next_substream().unwrap().unwrap().read_to_end(&mut content).unwrap();
        assert_eq!(content, b"after");
    }

    #[test]
    fn bad_frame_tag_and_truncation() {
        let mut bytes = leaf(b"x");
        bytes.pop();
        bytes.push(0x09);
        let mut reader = read_bottle(&bytes[..]).unwrap();
        reader.next_substream().unwrap().unwrap().drain().unwrap();
        assert!(matches!(reader.next_substream(), Err(BottleError::MalformedFrame(_))));

        let bytes = leaf(b"truncated content");
        let cut = &bytes[..bytes.len() - 5];
        let mut reader = read_bottle(cut).unwrap();
        let mut sub = reader.next_substream().unwrap().unwrap();
        let err = BottleError::from(sub.read_to_end(&mut Vec::new()).unwrap_err());
        assert!(matches!(err, BottleError::MalformedFrame(_)));
    }
}
