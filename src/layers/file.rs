//! FILE bottles: a leaf with one content substream, or a folder whose
//! substreams are nested bottles.

use std::io::Read;

use crate::error::{BottleError, Result};
use crate::fs::FileMetadata;
use crate::header::Header;
use crate::io_stream::{BottleKind, BottleReader};

// STRING ids
pub const FIELD_FILENAME:  u64 = 0;
pub const FIELD_MIME_TYPE: u64 = 1;
pub const FIELD_OWNER:     u64 = 2;
pub const FIELD_GROUP:     u64 = 3;

// INTEGER ids
pub const FIELD_SIZE:     u64 = 0;
pub const FIELD_MODE:     u64 = 1;
pub const FIELD_CREATED:  u64 = 2;
pub const FIELD_MODIFIED: u64 = 3;
pub const FIELD_ACCESSED: u64 = 4;

// BOOLEAN ids
pub const FIELD_IS_FOLDER: u64 = 0;

impl FileMetadata {
    /// Folders carry no size field; their length is whatever their children
    /// add up to.
    pub fn to_header(&self) -> Header {
        let builder = Header::builder()
            .string(FIELD_FILENAME, self.filename.as_str())
            .maybe_string(FIELD_MIME_TYPE, self.mime_type.as_deref())
            .maybe_string(FIELD_OWNER, self.owner.as_deref())
            .maybe_string(FIELD_GROUP, self.group.as_deref());
        let builder = if self.is_folder { builder } else { builder.integer(FIELD_SIZE, self.size) };
        builder
            .integer(FIELD_MODE, u64::from(self.mode))
            .signed(FIELD_CREATED, self.created_ns)
            .signed(FIELD_MODIFIED, self.modified_ns)
            .signed(FIELD_ACCESSED, self.accessed_ns)
            .boolean(FIELD_IS_FOLDER, self.is_folder)
            .build()
    }

    /// Absent fields take their zero value.
    pub fn from_header(header: &Header) -> Result<Self> {
        let mode = header.integer(FIELD_MODE).unwrap_or(0);
        let mode = u32::try_from(mode)
            .map_err(|_| BottleError::MalformedHeader(format!("mode {mode:#o} does not fit in 32 bits")))?;
        Ok(Self {
            filename:    header.string(FIELD_FILENAME).unwrap_or_default().to_owned(),
            size:        header.integer(FIELD_SIZE).unwrap_or(0),
            mode,
            created_ns:  header.signed(FIELD_CREATED).unwrap_or(0),
            modified_ns: header.signed(FIELD_MODIFIED).unwrap_or(0),
            accessed_ns: header.signed(FIELD_ACCESSED).unwrap_or(0),
            owner:       header.string(FIELD_OWNER).map(str::to_owned),
            group:       header.string(FIELD_GROUP).map(str::to_owned),
            is_folder:   header.boolean(FIELD_IS_FOLDER),
            mime_type:   header.string(FIELD_MIME_TYPE).map(str::to_owned),
        })
    }
}

/// Decode the metadata of a FILE bottle.
pub fn metadata<R: Read>(bottle: &BottleReader<R>) -> Result<FileMetadata> {
    if bottle.kind() != BottleKind::File {
        return Err(BottleError::UnexpectedKind { expected: "file", found: bottle.kind().tag() });
    }
    FileMetadata::from_header(bottle.header())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_stream::BottleWriter;

    fn sample() -> FileMetadata {
        FileMetadata {
            filename:    "nothing.txt".into(),
            size:        8,
            mode:        0o100_644,
            created_ns:  -5,
            modified_ns: 1_600_000_000_123_456_789,
            accessed_ns: 1_600_000_000_999_999_999,
            owner:       Some("robey".into()),
            group:       None,
            is_folder:   false,
            mime_type:   Some("text/plain".into()),
        }
    }

    #[test]
    fn metadata_survives_the_header() {
        let meta = sample();
        let header = meta.to_header();
        assert_eq!(header.string(FIELD_FILENAME), Some("nothing.txt"));
        assert_eq!(header.integer(FIELD_SIZE), Some(8));
        assert!(!header.boolean(FIELD_IS_FOLDER));
        assert_eq!(FileMetadata::from_header(&Header::decode(&header.encode()).unwrap()).unwrap(), meta);
    }

    #[test]
    fn folders_omit_size() {
        let folder = FileMetadata::synthetic_folder("stuff", 42);
        let header = folder.to_header();
        assert_eq!(header.integer(FIELD_SIZE), None);
        assert!(header.boolean(FIELD_IS_FOLDER));
        assert_eq!(FileMetadata::from_header(&header).unwrap(), folder);
    }

    #[test]
    fn non_file_bottles_are_rejected() {
        let mut w = BottleWriter::new(Vec::new(), BottleKind::Hashed, &Header::default()).unwrap();
        w.close().unwrap();
        let bytes = w.into_inner();
        let reader = BottleReader::new(&bytes[..]).unwrap();
        assert!(matches!(
            metadata(&reader),
            Err(BottleError::UnexpectedKind { expected: "file", found: 1 })
        ));
    }
}
