//! Filesystem collaborator: metadata, directory listing, and byte streams.
//!
//! The archive engine only talks to [`FileSystem`]; [`LocalFs`] is the
//! `std::fs` implementation. Owner/group name resolution is left to
//! implementations; `LocalFs` does not resolve uid/gid to names.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::{BottleError, Result};

/// `S_IFDIR | 0755`, used for folders that exist only inside an archive.
pub const SYNTHETIC_FOLDER_MODE: u32 = 0o040_755;

/// Everything a FILE bottle header records about one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub filename:    String,
    pub size:        u64,
    pub mode:        u32,
    pub created_ns:  i64,
    pub modified_ns: i64,
    pub accessed_ns: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner:       Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group:       Option<String>,
    pub is_folder:   bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type:   Option<String>,
}

impl FileMetadata {
    /// A folder that has no on-disk counterpart; all timestamps are `now_ns`.
    pub fn synthetic_folder(name: &str, now_ns: i64) -> Self {
        Self {
            filename:    name.to_owned(),
            mode:        SYNTHETIC_FOLDER_MODE,
            created_ns:  now_ns,
            modified_ns: now_ns,
            accessed_ns: now_ns,
            is_folder:   true,
            ..Self::default()
        }
    }

    /// Permission bits only (no file type bits).
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// What to do when an output path already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Overwrite {
    /// Fail with [`BottleError::AlreadyExists`].
    #[default]
    Refuse,
    Replace,
}

pub trait FileSystem {
    fn stat(&self, path: &Path) -> Result<FileMetadata>;
    /// Child names in the order the filesystem produces them.
    fn list_children(&self, folder: &Path) -> Result<Vec<String>>;
    fn open_read(&self, path: &Path) -> Result<Box<dyn Read>>;
    fn open_write(&self, path: &Path, mode: u32, overwrite: Overwrite) -> Result<Box<dyn Write>>;
    fn create_dir(&self, path: &Path, mode: u32) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

fn nanos_since_epoch(t: io::Result<SystemTime>) -> i64 {
    match t {
        Ok(t) => match t.duration_since(SystemTime::UNIX_EPOCH) {
            Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
            Err(before) => -i64::try_from(before.duration().as_nanos()).unwrap_or(i64::MAX),
        },
        Err(_) => 0,
    }
}

#[cfg(unix)]
fn mode_of(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.mode()
}

#[cfg(not(unix))]
fn mode_of(meta: &fs::Metadata) -> u32 {
    match (meta.is_dir(), meta.permissions().readonly()) {
        (true, _)      => SYNTHETIC_FOLDER_MODE,
        (false, true)  => 0o100_444,
        (false, false) => 0o100_644,
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

impl FileSystem for LocalFs {
    fn stat(&self, path: &Path) -> Result<FileMetadata> {
        let meta = fs::metadata(path)?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Ok(FileMetadata {
            filename,
            size:        if meta.is_dir() { 0 } else { meta.len() },
            mode:        mode_of(&meta),
            created_ns:  nanos_since_epoch(meta.created()),
            modified_ns: nanos_since_epoch(meta.modified()),
            accessed_ns: nanos_since_epoch(meta.accessed()),
            owner:       None,
            group:       None,
            is_folder:   meta.is_dir(),
            mime_type:   None,
        })
    }

    fn list_children(&self, folder: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(folder)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn Read>> {
        Ok(Box::new(File::open(path)?))
    }

    fn open_write(&self, path: &Path, mode: u32, overwrite: Overwrite) -> Result<Box<dyn Write>> {
        let mut opts = OpenOptions::new();
        opts.write(true);
        match overwrite {
            Overwrite::Refuse  => opts.create_new(true),
            Overwrite::Replace => opts.create(true).truncate(true),
        };
        let file = opts.open(path).map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => BottleError::AlreadyExists(path.to_owned()),
            _ => BottleError::from(e),
        })?;
        if mode & 0o7777 != 0 {
            set_mode(path, mode)?;
        }
        Ok(Box::new(file))
    }

    fn create_dir(&self, path: &Path, mode: u32) -> Result<()> {
        match fs::create_dir(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => {}
            Err(e) => return Err(e.into()),
        }
        if mode & 0o7777 != 0 {
            set_mode(path, mode | 0o700)?;
        }
        Ok(())
    }
}
