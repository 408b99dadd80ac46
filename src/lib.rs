//! Bottles: a streamable, self-describing, nestable archive container.
//!
//! A bottle is `kind | header | substream* | end`. Folders are FILE bottles
//! whose substreams are more bottles; HASHED, COMPRESSED and ENCRYPTED
//! bottles wrap exactly one inner bottle. Everything streams: neither side
//! ever needs to seek or hold a whole file in memory.

pub mod archive;
pub mod batch;
pub mod codec;
pub mod crypto;
pub mod digest;
pub mod error;
pub mod fs;
pub mod header;
pub mod io_stream;
pub mod layers;
pub mod scan;
pub mod varint;

pub use archive::{ArchiveOptions, ArchiveWriter, PackRoot, PackSummary};
pub use codec::CompressionAlgorithm;
pub use digest::HashAlgorithm;
pub use error::{BottleError, Result};
pub use fs::{FileMetadata, FileSystem, LocalFs, Overwrite};
pub use header::{Field, Header};
pub use io_stream::{read_bottle, write_bottle, BottleKind, BottleReader, BottleWriter};
pub use layers::{Decryption, Encryption, HashOutcome};
pub use scan::{scan, ArchiveReader, ErrorPolicy, Lister, ScanEvent, ScanHandler, ScanReport, UnpackOptions, Unpacker};
