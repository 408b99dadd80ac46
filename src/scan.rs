//! Archive reader: walks a bottle tree in stream order and reports what it
//! finds to a [`ScanHandler`].
//!
//! # Dispatch
//! | kind       | action                                                     |
//! |------------|------------------------------------------------------------|
//! | FILE leaf  | [`ScanHandler::process_file`] with the content stream      |
//! | FILE folder| scan every child bottle in order                           |
//! | HASHED     | scan the inner bottle while digesting, then compare        |
//! | COMPRESSED | scan the decoded inner bottle                              |
//! | ENCRYPTED  | ask the handler for key material, scan the plaintext       |
//! | unknown    | skip                                                       |
//!
//! Hash mismatches do not stop a scan; they are collected in the
//! [`ScanReport`] and surfaced through [`ScanReport::verify`].

use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::CompressionAlgorithm;
use crate::digest::HashAlgorithm;
use crate::error::{BottleError, Result};
use crate::fs::{FileMetadata, FileSystem, Overwrite};
use crate::io_stream::{ensure_exhausted, BottleKind, BottleReader};
use crate::layers::{compressed, encrypted, file, hashed, Decryption, EncryptionInfo, HashOutcome};

/// Deepest bottle nesting a scan will follow. Layer bottles count as a level.
pub const MAX_NESTING_DEPTH: usize = 256;

// ── Events ───────────────────────────────────────────────────────────────────

/// A boundary crossed during a scan. `path` is the chain of filenames from
/// the archive root down to the entry.
#[derive(Debug)]
pub enum ScanEvent<'a> {
    FolderStart { path: &'a [String], metadata: &'a FileMetadata },
    FolderEnd { path: &'a [String] },
    /// Emitted before the content is handed to [`ScanHandler::process_file`].
    File { path: &'a [String], metadata: &'a FileMetadata },
    FileFailed { path: &'a [String], error: &'a BottleError },
    HashStart { algorithm: HashAlgorithm },
    HashEnd { outcome: &'a HashOutcome },
    CompressionStart { algorithm: CompressionAlgorithm },
    CompressionEnd,
    EncryptionStart { info: &'a EncryptionInfo },
    EncryptionEnd,
    UnknownBottle { kind: u8 },
}

/// `a/b/c` form of a scan path.
pub fn display_path(path: &[String]) -> String {
    path.join("/")
}

/// Receives a scan's events and file contents. Every method has a default,
/// so a handler only overrides what it cares about.
pub trait ScanHandler {
    fn on_event(&mut self, _event: &ScanEvent<'_>) -> Result<()> {
        Ok(())
    }

    /// Content left unread is discarded by the scanner.
    fn process_file(&mut self, _path: &[String], _metadata: &FileMetadata, _content: &mut dyn Read) -> Result<()> {
        Ok(())
    }

    /// Return `Ok` to carry on with the next entry.
    fn file_failed(&mut self, _path: &[String], error: BottleError) -> Result<()> {
        Err(error)
    }

    /// Key material for an encrypted bottle.
    fn decrypt_key(&mut self, _info: &EncryptionInfo) -> Result<Vec<u8>> {
        Err(BottleError::MissingDecryptionKey)
    }
}

/// What a finished scan saw.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub files:           u64,
    pub folders:         u64,
    /// Sum of leaf content lengths.
    pub bytes:           u64,
    pub hashes:          Vec<HashOutcome>,
    pub unknown_skipped: u64,
    pub failures:        u64,
    pub compressed:      bool,
    pub encrypted:       bool,
}

impl ScanReport {
    /// `Err` with the first invalid hash, if any.
    pub fn verify(&self) -> Result<()> {
        match self.hashes.iter().find(|h| !h.valid) {
            Some(bad) => Err(BottleError::IntegrityMismatch {
                expected: bad.expected_hex.clone(),
                actual:   bad.digest_hex.clone(),
            }),
            None => Ok(()),
        }
    }
}

// ── ArchiveReader ────────────────────────────────────────────────────────────

pub struct ArchiveReader<'h> {
    handler: &'h mut dyn ScanHandler,
    path:    Vec<String>,
    depth:   usize,
    report:  ScanReport,
}

impl<'h> ArchiveReader<'h> {
    pub fn new(handler: &'h mut dyn ScanHandler) -> Self {
        Self { handler, path: Vec::new(), depth: 0, report: ScanReport::default() }
    }

    /// Read one archive from `source`. Bytes after the top-level bottle are
    /// an error.
    pub fn scan<R: Read>(mut self, mut source: R) -> Result<ScanReport> {
        self.scan_bottle(&mut source)?;
        ensure_exhausted(&mut source, "archive")?;
        info!(
            files = self.report.files,
            folders = self.report.folders,
            failures = self.report.failures,
            "archive scanned"
        );
        Ok(self.report)
    }

    fn scan_bottle(&mut self, source: &mut dyn Read) -> Result<()> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(BottleError::MalformedFrame(format!("bottles nested deeper than {MAX_NESTING_DEPTH}")));
        }
        self.depth += 1;
        let result = self.scan_nested(source);
        self.depth -= 1;
        result
    }

    fn scan_nested(&mut self, source: &mut dyn Read) -> Result<()> {
        let mut bottle = BottleReader::new(source)?;
        debug!(kind = bottle.kind().name(), depth = self.depth, "bottle");
        match bottle.kind() {
            BottleKind::File => self.scan_file(&mut bottle),
            BottleKind::Hashed => {
                let algorithm = hashed::algorithm(&bottle)?;
                self.handler.on_event(&ScanEvent::HashStart { algorithm })?;
                let ((), outcome) = hashed::validate_with(&mut bottle, |inner| self.scan_bottle(inner))?;
                self.handler.on_event(&ScanEvent::HashEnd { outcome: &outcome })?;
                self.report.hashes.push(outcome);
                Ok(())
            }
            BottleKind::Compressed => {
                let algorithm = compressed::algorithm(&bottle)?;
                self.handler.on_event(&ScanEvent::CompressionStart { algorithm })?;
                compressed::decompress_with(&mut bottle, |inner| self.scan_bottle(inner))?;
                self.report.compressed = true;
                self.handler.on_event(&ScanEvent::CompressionEnd)
            }
            BottleKind::Encrypted => {
                let info = encrypted::info(&bottle)?;
                self.handler.on_event(&ScanEvent::EncryptionStart { info: &info })?;
                let key = self.handler.decrypt_key(&info)?;
                encrypted::decrypt_with(&mut bottle, |_| Ok(key), |inner| self.scan_bottle(inner))?;
                self.report.encrypted = true;
                self.handler.on_event(&ScanEvent::EncryptionEnd)
            }
            BottleKind::Unknown(kind) => {
                warn!(kind, "skipping unknown bottle kind");
                self.handler.on_event(&ScanEvent::UnknownBottle { kind })?;
                bottle.skip_to_end()?;
                self.report.unknown_skipped += 1;
                Ok(())
            }
        }
    }

    fn scan_file<R: Read>(&mut self, bottle: &mut BottleReader<R>) -> Result<()> {
        let meta = file::metadata(bottle)?;
        self.path.push(meta.filename.clone());
        let result = if meta.is_folder { self.scan_folder(bottle, &meta) } else { self.scan_leaf(bottle, &meta) };
        self.path.pop();
        result
    }

    fn scan_folder<R: Read>(&mut self, bottle: &mut BottleReader<R>, meta: &FileMetadata) -> Result<()> {
        self.handler.on_event(&ScanEvent::FolderStart { path: &self.path, metadata: meta })?;
        while let Some(mut child) = bottle.next_substream()? {
            self.scan_bottle(&mut child)?;
            ensure_exhausted(&mut child, "nested bottle")?;
        }
        self.report.folders += 1;
        self.handler.on_event(&ScanEvent::FolderEnd { path: &self.path })
    }

    fn scan_leaf<R: Read>(&mut self, bottle: &mut BottleReader<R>, meta: &FileMetadata) -> Result<()> {
        self.handler.on_event(&ScanEvent::File { path: &self.path, metadata: meta })?;
        let declared = bottle.header().integer(file::FIELD_SIZE);
        let length = {
            let mut content = bottle.require_substream("content")?;
            let mut counted = CountingReader { inner: &mut content, count: 0 };
            if let Err(error) = self.handler.process_file(&self.path, meta, &mut counted) {
                warn!(file = %display_path(&self.path), %error, "file failed");
                self.handler.on_event(&ScanEvent::FileFailed { path: &self.path, error: &error })?;
                self.report.failures += 1;
                self.handler.file_failed(&self.path, error)?;
            }
            let consumed = counted.count;
            consumed + content.drain()?
        };
        if let Some(size) = declared.filter(|size| *size != length) {
            return Err(BottleError::MalformedFrame(format!(
                "{} declares {size} bytes but holds {length}",
                display_path(&self.path)
            )));
        }
        bottle.expect_end()?;
        self.report.files += 1;
        self.report.bytes += length;
        Ok(())
    }
}

struct CountingReader<'r> {
    inner: &'r mut dyn Read,
    count: u64,
}

impl Read for CountingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Scan `source` with `handler`.
pub fn scan<R: Read>(source: R, handler: &mut dyn ScanHandler) -> Result<ScanReport> {
    ArchiveReader::new(handler).scan(source)
}

// ── Lister ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListEntry {
    pub path:     String,
    #[serde(flatten)]
    pub metadata: FileMetadata,
}

/// Collects every file and folder without reading any content.
#[derive(Debug, Default)]
pub struct Lister {
    pub decryption: Decryption,
    pub entries:    Vec<ListEntry>,
}

impl Lister {
    pub fn new(decryption: Decryption) -> Self {
        Self { decryption, entries: Vec::new() }
    }
}

impl ScanHandler for Lister {
    fn on_event(&mut self, event: &ScanEvent<'_>) -> Result<()> {
        match event {
            ScanEvent::FolderStart { path, metadata } | ScanEvent::File { path, metadata } => {
                self.entries.push(ListEntry { path: display_path(path), metadata: (*metadata).clone() });
            }
            _ => {}
        }
        Ok(())
    }

    fn decrypt_key(&mut self, info: &EncryptionInfo) -> Result<Vec<u8>> {
        self.decryption.resolve(info)
    }
}

// ── Unpacker ─────────────────────────────────────────────────────────────────

/// Whether one file's failure ends the whole unpack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    #[default]
    Abort,
    /// Log, record, and move on to the next entry.
    Continue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnpackOptions {
    pub overwrite:    Overwrite,
    pub error_policy: ErrorPolicy,
}

/// Recreates the archived tree under a destination folder.
pub struct Unpacker<'a> {
    fs:         &'a dyn FileSystem,
    dest:       PathBuf,
    options:    UnpackOptions,
    decryption: Decryption,
    /// `(path, error)` for every file skipped under [`ErrorPolicy::Continue`].
    pub failed: Vec<(String, String)>,
}

impl<'a> Unpacker<'a> {
    pub fn new(fs: &'a dyn FileSystem, dest: impl Into<PathBuf>, options: UnpackOptions, decryption: Decryption) -> Self {
        Self { fs, dest: dest.into(), options, decryption, failed: Vec::new() }
    }

    /// Filenames come from untrusted input: each must be one plain path
    /// component.
    fn target(&self, path: &[String]) -> Result<PathBuf> {
        let mut target = self.dest.clone();
        for name in path {
            let mut components = Path::new(name).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(part)), None) if !name.contains('\\') => target.push(part),
                _ => return Err(BottleError::MalformedHeader(format!("unsafe filename {name:?}"))),
            }
        }
        Ok(target)
    }
}

impl ScanHandler for Unpacker<'_> {
    fn on_event(&mut self, event: &ScanEvent<'_>) -> Result<()> {
        if let ScanEvent::FolderStart { path, metadata } = event {
            let target = self.target(path)?;
            self.fs.create_dir(&target, metadata.mode)?;
            debug!(folder = %target.display(), "created");
        }
        Ok(())
    }

    fn process_file(&mut self, path: &[String], metadata: &FileMetadata, content: &mut dyn Read) -> Result<()> {
        let target = self.target(path)?;
        let mut out = self.fs.open_write(&target, metadata.mode, self.options.overwrite)?;
        let written = io::copy(content, &mut out)?;
        out.flush()?;
        info!(file = %target.display(), bytes = written, "unpacked");
        Ok(())
    }

    fn file_failed(&mut self, path: &[String], error: BottleError) -> Result<()> {
        match self.options.error_policy {
            ErrorPolicy::Abort => Err(error),
            ErrorPolicy::Continue => {
                self.failed.push((display_path(path), error.to_string()));
                Ok(())
            }
        }
    }

    fn decrypt_key(&mut self, info: &EncryptionInfo) -> Result<Vec<u8>> {
        self.decryption.resolve(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Header;
    use crate::io_stream::BottleWriter;

    fn leaf(name: &str, content: &[u8]) -> Vec<u8> {
        let meta = FileMetadata { filename: name.into(), size: content.len() as u64, ..Default::default() };
        let mut w = BottleWriter::new(Vec::new(), BottleKind::File, &meta.to_header()).unwrap();
        w.write_bytes(content).unwrap();
        w.close().unwrap();
        w.into_inner()
    }

    fn folder(name: &str, children: &[Vec<u8>]) -> Vec<u8> {
        let meta = FileMetadata::synthetic_folder(name, 0);
        let mut w = BottleWriter::new(Vec::new(), BottleKind::File, &meta.to_header()).unwrap();
        for child in children {
            w.write_substream(&child[..], None).unwrap();
        }
        w.close().unwrap();
        w.into_inner()
    }

    #[test]
    fn lister_walks_in_stream_order_and_skips_unknown_kinds() {
        let mut unknown = BottleWriter::new(Vec::new(), BottleKind::Unknown(9), &Header::default()).unwrap();
        unknown.write_bytes(b"from the future").unwrap();
        unknown.close().unwrap();

        let archive = folder("top", &[leaf("a.txt", b"aaaaaaa"), unknown.into_inner(), folder("sub", &[leaf("b", b"")])]);
        let mut lister = Lister::default();
        let report = scan(&archive[..], &mut lister).unwrap();

        let paths: Vec<&str> = lister.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, ["top", "top/a.txt", "top/sub", "top/sub/b"]);
        assert_eq!((report.files, report.folders, report.unknown_skipped, report.bytes), (2, 2, 1, 7));
        report.verify().unwrap();
    }

    #[test]
    fn trailing_bytes_after_the_archive_are_rejected() {
        let mut archive = leaf("x", b"x");
        archive.push(0);
        assert!(matches!(scan(&archive[..], &mut Lister::default()), Err(BottleError::MalformedFrame(_))));
    }

    #[test]
    fn deep_nesting_is_rejected_before_the_stack_runs_out() {
        let header = FileMetadata::synthetic_folder("d", 0).to_header().encode();
        let mut archive = Vec::new();
        for _ in 0..10_000 {
            archive.push(BottleKind::File.tag());
            archive.extend_from_slice(&header);
            archive.push(0x01);
            archive.extend_from_slice(&crate::varint::encode(1 << 40));
        }
        let err = scan(&archive[..], &mut Lister::default()).unwrap_err();
        assert!(matches!(err, BottleError::MalformedFrame(_)), "{err}");
    }

    #[test]
    fn nesting_within_the_limit_scans() {
        let mut archive = leaf("x", b"x");
        for _ in 0..200 {
            archive = folder("d", &[archive]);
        }
        let report = scan(&archive[..], &mut Lister::default()).unwrap();
        assert_eq!((report.files, report.folders), (1, 200));
    }

    #[test]
    fn leaf_longer_than_its_declared_size_is_rejected() {
        let meta = FileMetadata { filename: "short".into(), size: 8, ..Default::default() };
        let mut w = BottleWriter::new(Vec::new(), BottleKind::File, &meta.to_header()).unwrap();
        w.write_bytes(&[b'x'; 1000]).unwrap();
        w.close().unwrap();
        let archive = w.into_inner();

        let err = scan(&archive[..], &mut Lister::default()).unwrap_err();
        assert!(matches!(err, BottleError::MalformedFrame(_)), "{err}");

        let dir = tempfile::tempdir().unwrap();
        let mut unpacker = Unpacker::new(&crate::fs::LocalFs, dir.path(), UnpackOptions::default(), Decryption::None);
        assert!(scan(&archive[..], &mut unpacker).is_err());
    }

    #[test]
    fn encrypted_bottle_without_a_key_is_missing_key() {
        let enc = crate::layers::Encryption::password(
            "pw",
            std::sync::Arc::new(crate::crypto::Argon2Kdf { memory_kib: 1024, lanes: 1 }),
        );
        let (bytes, ()) = encrypted::write(Vec::new(), &enc, |w| Ok(w.write_all(&leaf("x", b"x"))?)).unwrap();
        let err = scan(&bytes[..], &mut Lister::default()).unwrap_err();
        assert!(matches!(err, BottleError::MissingDecryptionKey));
    }

    #[test]
    fn unpacker_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let unpacker =
            Unpacker::new(&crate::fs::LocalFs, dir.path(), UnpackOptions::default(), Decryption::None);
        assert!(unpacker.target(&["ok".into(), "fine.txt".into()]).is_ok());
        for bad in ["..", "a/b", "/etc", "", "."] {
            assert!(unpacker.target(&[bad.into()]).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn continue_policy_records_failures() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("top")).unwrap();
        std::fs::write(dir.path().join("top/a.txt"), b"existing").unwrap();
        let archive = folder("top", &[leaf("a.txt", b"new"), leaf("b.txt", b"bee")]);

        let options = UnpackOptions { overwrite: Overwrite::Refuse, error_policy: ErrorPolicy::Continue };
        let mut unpacker = Unpacker::new(&crate::fs::LocalFs, dir.path(), options, Decryption::None);
        let report = scan(&archive[..], &mut unpacker).unwrap();

        assert_eq!(report.failures, 1);
        assert_eq!(unpacker.failed.len(), 1);
        assert_eq!(unpacker.failed[0].0, "top/a.txt");
        assert_eq!(std::fs::read(dir.path().join("top/a.txt")).unwrap(), b"existing");
        assert_eq!(std::fs::read(dir.path().join("top/b.txt")).unwrap(), b"bee");
    }
}
