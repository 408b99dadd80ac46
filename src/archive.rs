//! Archive writer: turns files and folders into a tree of FILE bottles and
//! wraps it in the configured layers.
//!
//! ```no_run
//! use bottler::archive::{ArchiveOptions, ArchiveWriter, PackRoot};
//! use bottler::fs::LocalFs;
//!
//! let out = std::fs::File::create("out.4b")?;
//! let root = PackRoot::Path("notes".into());
//! let (_, summary) = ArchiveWriter::new(&LocalFs, ArchiveOptions::default()).pack(&root, out)?;
//! println!("{} files", summary.files);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Layer order
//! Innermost first: FILE tree → COMPRESSED → ENCRYPTED → HASHED. Each layer
//! is optional. Hashing outermost lets a reader check integrity without the
//! decryption key.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::{CompressionAlgorithm, DEFAULT_COMPRESSION_LEVEL};
use crate::digest::HashAlgorithm;
use crate::error::{BottleError, Result};
use crate::fs::{FileMetadata, FileSystem};
use crate::io_stream::{BottleKind, BottleWriter, DEFAULT_CHUNK_SIZE};
use crate::layers::{compressed, encrypted, hashed, Encryption};

// ── ArchiveOptions ───────────────────────────────────────────────────────────

/// Configuration for [`ArchiveWriter`]. Loadable from JSON; every field is
/// optional there.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveOptions {
    /// `None` writes no COMPRESSED layer.
    pub compression: Option<CompressionAlgorithm>,
    pub level:       i32,
    /// `None` writes no HASHED layer.
    pub hash:        Option<HashAlgorithm>,
    pub chunk_size:  usize,
    /// Secrets never come from a config file.
    #[serde(skip)]
    pub encryption:  Option<Encryption>,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            compression: Some(CompressionAlgorithm::Zstd),
            level:       DEFAULT_COMPRESSION_LEVEL,
            hash:        None,
            chunk_size:  DEFAULT_CHUNK_SIZE,
            encryption:  None,
        }
    }
}

impl ArchiveOptions {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| BottleError::UnderlyingIo(io::Error::new(io::ErrorKind::InvalidData, e)))
    }

    /// Outermost first.
    fn layers(&self) -> Vec<Layer> {
        let mut layers = Vec::with_capacity(3);
        if let Some(algorithm) = self.hash {
            layers.push(Layer::Hash(algorithm));
        }
        if let Some(encryption) = &self.encryption {
            layers.push(Layer::Encrypt(encryption.clone()));
        }
        if let Some(algorithm) = self.compression {
            layers.push(Layer::Compress(algorithm, self.level));
        }
        layers
    }
}

enum Layer {
    Hash(HashAlgorithm),
    Encrypt(Encryption),
    Compress(CompressionAlgorithm, i32),
}

// ── PackRoot ─────────────────────────────────────────────────────────────────

/// What goes at the top of the FILE tree.
#[derive(Debug, Clone)]
pub enum PackRoot {
    /// One file or folder from the filesystem.
    Path(PathBuf),
    /// A folder that exists only in the archive, holding `paths`.
    Synthetic { name: String, paths: Vec<PathBuf>, now_ns: i64 },
}

impl PackRoot {
    /// A single input is archived as itself; several are gathered under a
    /// synthetic folder called `name`.
    pub fn from_inputs(inputs: &[PathBuf], name: &str, now_ns: i64) -> Self {
        match inputs {
            [single] => PackRoot::Path(single.clone()),
            _ => PackRoot::Synthetic { name: name.to_owned(), paths: inputs.to_vec(), now_ns },
        }
    }
}

/// Counts from one [`ArchiveWriter::pack`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PackSummary {
    pub files:   u64,
    pub folders: u64,
    /// Uncompressed content bytes.
    pub bytes:   u64,
}

// ── ArchiveWriter ────────────────────────────────────────────────────────────

type ProgressFn<'a> = Box<dyn FnMut(&str, u64) + 'a>;

pub struct ArchiveWriter<'a> {
    fs:       &'a dyn FileSystem,
    options:  ArchiveOptions,
    progress: Option<ProgressFn<'a>>,
    summary:  PackSummary,
}

impl<'a> ArchiveWriter<'a> {
    pub fn new(fs: &'a dyn FileSystem, options: ArchiveOptions) -> Self {
        Self { fs, options, progress: None, summary: PackSummary::default() }
    }

    /// Called with `(filename, bytes_so_far)` while each leaf is copied.
    pub fn on_progress(mut self, progress: impl FnMut(&str, u64) + 'a) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn options(&self) -> &ArchiveOptions {
        &self.options
    }

    /// Write `root` through every configured layer into `sink`.
    pub fn pack<W: Write>(&mut self, root: &PackRoot, mut sink: W) -> Result<(W, PackSummary)> {
        self.summary = PackSummary::default();
        let layers = self.options.layers();
        self.write_layers(&layers, root, &mut sink)?;
        sink.flush()?;
        info!(
            files = self.summary.files,
            folders = self.summary.folders,
            bytes = self.summary.bytes,
            "archive written"
        );
        Ok((sink, std::mem::take(&mut self.summary)))
    }

    /// Pack into a new file at `output`. On failure the partial file is
    /// removed.
    pub fn pack_to_path(&mut self, root: &PackRoot, output: &Path) -> Result<PackSummary> {
        let file = File::create(output)?;
        let result = self.pack(root, BufWriter::new(file)).and_then(|(sink, summary)| {
            sink.into_inner().map_err(|e| e.into_error())?;
            Ok(summary)
        });
        if result.is_err() {
            if let Err(error) = std::fs::remove_file(output) {
                warn!(output = %output.display(), %error, "could not remove partial archive");
            }
        }
        result
    }

    fn write_layers(&mut self, layers: &[Layer], root: &PackRoot, sink: &mut dyn Write) -> Result<FileMetadata> {
        match layers.split_first() {
            None => match root {
                PackRoot::Path(path) => self.archive_file(path, sink),
                PackRoot::Synthetic { name, paths, now_ns } => self.archive_files(name, paths, *now_ns, sink),
            },
            Some((Layer::Hash(algorithm), rest)) => {
                let (_, meta) = hashed::write(sink, *algorithm, |w| self.write_layers(rest, root, w))?;
                Ok(meta)
            }
            Some((Layer::Encrypt(encryption), rest)) => {
                let (_, meta) = encrypted::write(sink, encryption, |w| self.write_layers(rest, root, w))?;
                Ok(meta)
            }
            Some((Layer::Compress(algorithm, level), rest)) => {
                let (_, meta) = compressed::write(sink, *algorithm, *level, |w| self.write_layers(rest, root, w))?;
                Ok(meta)
            }
        }
    }

    /// Write `path` as a plain FILE bottle (recursively for folders).
    pub fn archive_file(&mut self, path: &Path, sink: &mut dyn Write) -> Result<FileMetadata> {
        let meta = self.fs.stat(path)?;
        let mut bottle =
            BottleWriter::with_chunk_size(sink, BottleKind::File, &meta.to_header(), self.options.chunk_size)?;

        if meta.is_folder {
            debug!(folder = %path.display(), "archiving folder");
            for child in self.fs.list_children(path)? {
                let mut sub = bottle.substream()?;
                self.archive_file(&path.join(&child), &mut sub)?;
                sub.finish()?;
            }
            self.summary.folders += 1;
        } else {
            let source = self.fs.open_read(path)?;
            let mut reader = ProgressReader {
                inner:    source,
                name:     &meta.filename,
                seen:     0,
                progress: self.progress.as_mut(),
            };
            bottle.write_substream(&mut reader, Some(meta.size))?;
            self.summary.files += 1;
            self.summary.bytes += meta.size;
            info!(file = %path.display(), size = meta.size, "packed");
        }
        bottle.close()?;
        Ok(meta)
    }

    /// Gather `paths` under a folder that exists only in the archive. Its
    /// timestamps are all `now_ns`.
    pub fn archive_files(
        &mut self,
        name:   &str,
        paths:  &[PathBuf],
        now_ns: i64,
        sink:   &mut dyn Write,
    ) -> Result<FileMetadata> {
        let meta = FileMetadata::synthetic_folder(name, now_ns);
        let mut bottle =
            BottleWriter::with_chunk_size(sink, BottleKind::File, &meta.to_header(), self.options.chunk_size)?;
        for path in paths {
            let mut sub = bottle.substream()?;
            self.archive_file(path, &mut sub)?;
            sub.finish()?;
        }
        bottle.close()?;
        self.summary.folders += 1;
        Ok(meta)
    }
}

struct ProgressReader<'p, 'f> {
    inner:    Box<dyn Read>,
    name:     &'p str,
    seen:     u64,
    progress: Option<&'p mut ProgressFn<'f>>,
}

impl Read for ProgressReader<'_, '_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.seen += n as u64;
            if let Some(progress) = self.progress.as_mut() {
                progress(self.name, self.seen);
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFs;
    use crate::io_stream::BottleReader;

    #[test]
    fn options_load_from_partial_json() {
        let opts = ArchiveOptions::from_json(r#"{"compression": "brotli", "hash": "sha256"}"#).unwrap();
        assert_eq!(opts.compression, Some(CompressionAlgorithm::Brotli));
        assert_eq!(opts.hash, Some(HashAlgorithm::Sha256));
        assert_eq!(opts.level, DEFAULT_COMPRESSION_LEVEL);
        assert_eq!(opts.chunk_size, DEFAULT_CHUNK_SIZE);

        let plain = ArchiveOptions::from_json(r#"{"compression": null}"#).unwrap();
        assert_eq!(plain.compression, None);
        assert!(ArchiveOptions::from_json(r#"{"compression": "lzma"}"#).is_err());
    }

    #[test]
    fn layers_nest_hash_outermost() {
        let opts = ArchiveOptions { hash: Some(HashAlgorithm::Blake3), ..ArchiveOptions::default() };
        let kinds: Vec<&str> = opts
            .layers()
            .iter()
            .map(|l| match l {
                Layer::Hash(_)        => "hash",
                Layer::Encrypt(_)     => "encrypt",
                Layer::Compress(_, _) => "compress",
            })
            .collect();
        assert_eq!(kinds, ["hash", "compress"]);
    }

    #[test]
    fn plain_leaf_is_a_sized_file_bottle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nothing.txt");
        std::fs::write(&path, b"nothing\n").unwrap();

        let mut seen = Vec::new();
        let opts = ArchiveOptions { compression: None, ..ArchiveOptions::default() };
        let (bytes, summary) = ArchiveWriter::new(&LocalFs, opts)
            .on_progress(|name, n| seen.push((name.to_owned(), n)))
            .pack(&PackRoot::Path(path), Vec::new())
            .unwrap();
        assert_eq!(summary, PackSummary { files: 1, folders: 0, bytes: 8 });
        assert_eq!(seen, [("nothing.txt".to_owned(), 8)]);

        let mut bottle = BottleReader::new(&bytes[..]).unwrap();
        assert_eq!(bottle.kind(), BottleKind::File);
        let meta = crate::layers::file::metadata(&bottle).unwrap();
        assert_eq!((meta.filename.as_str(), meta.size, meta.is_folder), ("nothing.txt", 8, false));
        let mut content = Vec::new();
        bottle.next_substream().unwrap().unwrap().read_to_end(&mut content).unwrap();
        assert_eq!(content, b"nothing\n");
        bottle.expect_end().unwrap();
    }

    #[test]
    fn missing_input_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let err = ArchiveWriter::new(&LocalFs, ArchiveOptions::default())
            .pack(&PackRoot::Path(dir.path().join("absent")), Vec::new())
            .unwrap_err();
        assert!(matches!(err, BottleError::UnderlyingIo(ref e) if e.kind() == io::ErrorKind::NotFound));
    }

    #[test]
    fn failed_pack_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("broken.4b");
        let root = PackRoot::Synthetic {
            name:   "broken".into(),
            paths:  vec![dir.path().join("absent")],
            now_ns: 0,
        };
        assert!(ArchiveWriter::new(&LocalFs, ArchiveOptions::default()).pack_to_path(&root, &output).is_err());
        assert!(!output.exists());

        let input = dir.path().join("present.txt");
        std::fs::write(&input, b"here\n").unwrap();
        let summary = ArchiveWriter::new(&LocalFs, ArchiveOptions::default())
            .pack_to_path(&PackRoot::Path(input), &output)
            .unwrap();
        assert_eq!(summary.files, 1);
        assert!(output.metadata().unwrap().len() > 0);
    }
}
