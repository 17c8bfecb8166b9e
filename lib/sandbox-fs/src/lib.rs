//! A sandboxed, mount-based virtual filesystem.
//!
//! Independent backing stores ([`Mount`]s) are attached at path prefixes of a
//! single rooted namespace managed by [`FileSystem`]. Paths are canonicalised
//! by [`path::sanitize`], resolved to the most specific mount, and handed to
//! the backend in mount-local form. Files opened through the registry are
//! wrapped in [`FileHandle`]s which count towards a configurable ceiling and
//! are reclaimed if the caller drops them without closing.

use std::collections::BTreeSet;
use std::fmt;
use std::io::{self, Read, Seek, Write};

use thiserror::Error;

pub mod archive_mount;
pub mod config;
pub mod empty_mount;
pub mod filesystem;
pub mod handle;
pub mod host_mount;
pub mod mem_mount;
pub mod mount_point;
pub mod overlay_mount;
pub mod path;
pub mod rebase_mount;

pub use archive_mount::ArchiveMount;
pub use config::FileSystemConfig;
pub use empty_mount::EmptyMount;
pub use filesystem::{FileSystem, FileSystemError, FreeSpace};
pub use handle::{FileHandle, OpenMode};
pub use host_mount::RealDirectoryMount;
pub use mem_mount::MemoryMount;
pub use mount_point::{MountBackend, MountPoint};
pub use overlay_mount::OverlayMount;
pub use rebase_mount::RebaseMount;

pub type Result<T, E = FsError> = std::result::Result<T, E>;

/// The smallest amount of space any file or directory is charged against a
/// writable mount's quota, regardless of its actual length.
pub const MINIMUM_FILE_SIZE: u64 = 500;

/// An open byte channel returned by a mount.
///
/// Closing a channel is dropping it. Implementations which cannot read or
/// write should fail the respective call with an [`io::Error`] wrapping
/// [`FsError::AccessDenied`].
pub trait VirtualFile: fmt::Debug + Send + Read + Write + Seek + 'static {
    /// The current length of the underlying file in bytes.
    fn size(&self) -> io::Result<u64>;
}

/// Attributes of a single file or directory.
///
/// Timestamps are milliseconds since the UNIX epoch; backends which do not
/// track them report `0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileAttributes {
    pub is_directory: bool,
    pub size: u64,
    pub created: u64,
    pub modified: u64,
}

impl FileAttributes {
    pub fn file(size: u64) -> Self {
        FileAttributes {
            is_directory: false,
            size,
            created: 0,
            modified: 0,
        }
    }

    pub fn directory() -> Self {
        FileAttributes {
            is_directory: true,
            ..Default::default()
        }
    }
}

/// The read-only capability every backing store provides.
///
/// All paths are mount-local and already sanitised: no leading or trailing
/// slash, the empty string naming the mount's root.
pub trait Mount: fmt::Debug + Send + Sync {
    fn exists(&self, path: &str) -> Result<bool>;

    fn is_directory(&self, path: &str) -> Result<bool>;

    /// The names of the direct children of a directory.
    fn list(&self, path: &str) -> Result<BTreeSet<String>>;

    /// The length of a file, `0` for directories.
    fn size(&self, path: &str) -> Result<u64>;

    fn open_for_read(&self, path: &str) -> Result<Box<dyn VirtualFile>>;

    fn attributes(&self, path: &str) -> Result<FileAttributes>;

    /// The label of the layer which actually provides `path`, for backends
    /// composed of several labelled stores.
    fn label_of(&self, _path: &str) -> Option<String> {
        None
    }
}

/// A [`Mount`] which can also be modified.
pub trait WritableMount: Mount {
    /// Create a directory along with any missing parents.
    fn make_directory(&self, path: &str) -> Result<()>;

    /// Remove a file, or a directory and everything below it.
    fn delete(&self, path: &str) -> Result<()>;

    fn rename(&self, from: &str, to: &str) -> Result<()>;

    fn open_file(&self, path: &str, conf: &OpenOptionsConfig) -> Result<Box<dyn VirtualFile>>;

    /// The number of bytes which may still be written.
    fn remaining_space(&self) -> Result<u64>;

    /// The total capacity, or `None` if the mount is unbounded.
    fn capacity(&self) -> Option<u64>;

    fn is_read_only(&self, _path: &str) -> Result<bool> {
        Ok(false)
    }

    fn open_for_write(&self, path: &str) -> Result<Box<dyn VirtualFile>> {
        self.open_file(path, &OpenOptions::new().write(true).create(true).truncate(true).build())
    }

    fn open_for_append(&self, path: &str) -> Result<Box<dyn VirtualFile>> {
        self.open_file(path, &OpenOptions::new().write(true).create(true).append(true).build())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenOptionsConfig {
    read: bool,
    write: bool,
    create: bool,
    append: bool,
    truncate: bool,
}

impl OpenOptionsConfig {
    pub const fn read(&self) -> bool {
        self.read
    }

    pub const fn write(&self) -> bool {
        self.write
    }

    pub const fn create(&self) -> bool {
        self.create
    }

    pub const fn append(&self) -> bool {
        self.append
    }

    pub const fn truncate(&self) -> bool {
        self.truncate
    }
}

/// Builder for an [`OpenOptionsConfig`].
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    conf: OpenOptionsConfig,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(mut self, read: bool) -> Self {
        self.conf.read = read;
        self
    }

    pub fn write(mut self, write: bool) -> Self {
        self.conf.write = write;
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.conf.create = create;
        self
    }

    pub fn append(mut self, append: bool) -> Self {
        self.conf.append = append;
        self
    }

    pub fn truncate(mut self, truncate: bool) -> Self {
        self.conf.truncate = truncate;
        self
    }

    pub fn build(self) -> OpenOptionsConfig {
        self.conf
    }
}

/// Error kinds shared by every mount. The display string is the reason shown
/// to the guest.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum FsError {
    #[error("No such file")]
    NoSuchFile,
    #[error("Not a directory")]
    NotADirectory,
    #[error("Not a file")]
    NotAFile,
    #[error("File exists")]
    FileExists,
    #[error("Access denied")]
    AccessDenied,
    #[error("Out of space")]
    OutOfSpace,
    #[error("Cannot write to directory")]
    CannotWriteToDirectory,
    #[error("Too many files already open")]
    TooManyOpenFiles,
    /// No mount resolves the path, or a mount below the root was requested.
    #[error("Invalid Path")]
    InvalidPath,
    #[error("Can't copy or move a directory inside itself")]
    RecursiveOperation,
    #[error("Too many directories to copy")]
    TooManyDirectories,
    #[error("Unsupported mode")]
    UnsupportedMode,
    #[error("attempt to use a closed file")]
    Closed,
    #[error("file was closed externally")]
    ClosedExternally,
    /// A host I/O failure, carrying only the failure's description.
    #[error("{0}")]
    Io(String),
}

impl FsError {
    /// Wrap this error so it can travel through a [`std::io`] interface and
    /// be recovered by `From<io::Error>`.
    pub fn into_io(self) -> io::Error {
        let kind = match &self {
            FsError::NoSuchFile => io::ErrorKind::NotFound,
            FsError::AccessDenied | FsError::Closed | FsError::ClosedExternally => {
                io::ErrorKind::PermissionDenied
            }
            FsError::FileExists => io::ErrorKind::AlreadyExists,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }
}

impl From<io::Error> for FsError {
    fn from(io_error: io::Error) -> Self {
        if let Some(inner) = io_error
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<FsError>())
        {
            return inner.clone();
        }

        match io_error.kind() {
            io::ErrorKind::NotFound => FsError::NoSuchFile,
            io::ErrorKind::AlreadyExists => FsError::FileExists,
            io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
                FsError::AccessDenied
            }
            io::ErrorKind::NotADirectory => FsError::NotADirectory,
            io::ErrorKind::IsADirectory => FsError::CannotWriteToDirectory,
            io::ErrorKind::StorageFull => FsError::OutOfSpace,
            io::ErrorKind::DirectoryNotEmpty => FsError::AccessDenied,
            // The OS message may name host paths, so only the kind survives.
            kind => FsError::Io(kind.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_lose_host_details() {
        let err = io::Error::new(io::ErrorKind::Other, "/home/user/.local/share/disk/0: boom");
        let mapped = FsError::from(err);
        assert!(!mapped.to_string().contains("/home/user"));

        assert_eq!(
            FsError::from(io::Error::from(io::ErrorKind::NotFound)),
            FsError::NoSuchFile
        );
    }

    #[test]
    fn wrapped_errors_round_trip() {
        let err = FsError::OutOfSpace.into_io();
        assert_eq!(FsError::from(err), FsError::OutOfSpace);
    }

    #[test]
    fn open_options_builder() {
        let conf = OpenOptions::new().read(true).write(true).build();
        assert!(conf.read());
        assert!(conf.write());
        assert!(!conf.create());
        assert!(!conf.truncate());
        assert!(!conf.append());
    }
}
