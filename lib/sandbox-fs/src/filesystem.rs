//! The mount registry: a single rooted namespace assembled from [`Mount`]s.

use std::collections::{BTreeMap, BTreeSet};
use std::io;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::handle::HandleTracker;
use crate::path;
use crate::*;

pub type FsResult<T> = std::result::Result<T, FileSystemError>;

/// A failed filesystem operation, naming the global path it concerned.
///
/// Renders as `/<path>: <reason>`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("/{path}: {kind}")]
pub struct FileSystemError {
    path: String,
    kind: FsError,
}

impl FileSystemError {
    pub fn new(path: impl Into<String>, kind: FsError) -> Self {
        FileSystemError {
            path: path.into(),
            kind,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> &FsError {
        &self.kind
    }

    pub fn into_kind(self) -> FsError {
        self.kind
    }
}

/// Space left on the mount holding a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeSpace {
    Bytes(u64),
    Unlimited,
}

/// Everything known about a path, as reported to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathAttributes {
    pub size: u64,
    pub is_directory: bool,
    pub is_read_only: bool,
    pub created: u64,
    pub modified: u64,
}

/// A sandboxed filesystem made up of mounts at path prefixes.
///
/// Every path is sanitised and resolved to the mount with the longest
/// location containing it. A mount at the root always exists. All operations
/// are serialised by a single lock; reading and writing an open
/// [`FileHandle`] happens outside it.
#[derive(Debug)]
pub struct FileSystem {
    config: FileSystemConfig,
    inner: Mutex<FileSystemInner>,
}

#[derive(Debug)]
struct FileSystemInner {
    mounts: BTreeMap<String, MountPoint>,
    handles: HandleTracker,
}

impl FileSystem {
    /// Create a filesystem with `root` mounted at `/`.
    pub fn new(root_label: impl Into<String>, root: MountBackend) -> Self {
        Self::with_config(root_label, root, FileSystemConfig::default())
    }

    pub fn with_config(
        root_label: impl Into<String>,
        root: MountBackend,
        config: FileSystemConfig,
    ) -> Self {
        let root = MountPoint::new(root_label.into(), String::new(), root);
        let mounts = BTreeMap::from([(String::new(), root)]);

        FileSystem {
            inner: Mutex::new(FileSystemInner {
                mounts,
                handles: HandleTracker::new(config.maximum_files_open),
            }),
            config,
        }
    }

    pub fn config(&self) -> &FileSystemConfig {
        &self.config
    }

    /// Attach `backend` at `location`, replacing (and closing every file
    /// open on) whatever was mounted there before.
    pub fn mount(&self, label: impl Into<String>, location: &str, backend: MountBackend) -> FsResult<()> {
        let location = mount_location(location)?;
        self.inner.lock().mount(label.into(), location, backend);
        Ok(())
    }

    /// Attach `backend` at `location` only if nothing exists there yet,
    /// returning the location it was mounted at.
    pub fn mount_if_free(
        &self,
        label: impl Into<String>,
        location: &str,
        backend: MountBackend,
    ) -> FsResult<Option<String>> {
        let location = mount_location(location)?;

        let mut inner = self.inner.lock();
        if inner.resolve(&location)?.exists(&location)? {
            return Ok(None);
        }
        inner.mount(label.into(), location.clone(), backend);
        Ok(Some(location))
    }

    /// Detach the mount at `location`, closing every file open on it. The
    /// root mount can't be removed.
    pub fn unmount(&self, location: &str) {
        let location = path::sanitize(location, false);
        if location.is_empty() {
            warn!("Refusing to unmount the root");
            return;
        }

        let mut inner = self.inner.lock();
        let Some(mount) = inner.mounts.remove(&location) else {
            return;
        };
        inner.handles.sweep();
        let closed = inner.handles.close_mount(mount.id());
        debug!(label = mount.label(), location = %location, closed, "Unmounted");
    }

    /// Close every open file.
    pub fn close(&self) {
        self.inner.lock().handles.close_all();
    }

    /// Catch up with handles which were closed or dropped.
    pub fn sweep(&self) {
        self.inner.lock().handles.sweep();
    }

    pub fn open_handle_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.handles.sweep();
        inner.handles.open_count()
    }

    /// How many handles were dropped without being closed.
    pub fn leaked_handles(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.handles.sweep();
        inner.handles.leaked()
    }

    /// Join path segments onto `path`. Wildcards are kept.
    pub fn combine(path: &str, parts: &[&str]) -> String {
        parts
            .iter()
            .fold(path::sanitize(path, true), |joined, part| path::combine(&joined, part))
    }

    pub fn get_name(path: &str) -> String {
        path::get_name(path)
    }

    pub fn get_directory(path: &str) -> String {
        path::get_directory(path)
    }

    /// The sorted names in a directory, including mounts attached directly
    /// below it.
    pub fn list(&self, path: &str) -> FsResult<Vec<String>> {
        let path = path::sanitize(path, false);
        self.inner.lock().list(&path)
    }

    pub fn exists(&self, path: &str) -> FsResult<bool> {
        let path = path::sanitize(path, false);
        self.inner.lock().resolve(&path)?.exists(&path)
    }

    pub fn is_directory(&self, path: &str) -> FsResult<bool> {
        let path = path::sanitize(path, false);
        self.inner.lock().resolve(&path)?.is_directory(&path)
    }

    pub fn is_read_only(&self, path: &str) -> FsResult<bool> {
        let path = path::sanitize(path, false);
        self.inner.lock().resolve(&path)?.is_read_only(&path)
    }

    pub fn size(&self, path: &str) -> FsResult<u64> {
        let path = path::sanitize(path, false);
        self.inner.lock().resolve(&path)?.size(&path)
    }

    pub fn attributes(&self, path: &str) -> FsResult<PathAttributes> {
        let path = path::sanitize(path, false);
        let inner = self.inner.lock();
        let mount = inner.resolve(&path)?;

        let attributes = mount.attributes(&path)?;
        Ok(PathAttributes {
            size: attributes.size,
            is_directory: attributes.is_directory,
            is_read_only: mount.is_read_only(&path)?,
            created: attributes.created,
            modified: attributes.modified,
        })
    }

    pub fn free_space(&self, path: &str) -> FsResult<FreeSpace> {
        let path = path::sanitize(path, false);
        Ok(self.inner.lock().resolve(&path)?.free_space())
    }

    pub fn capacity(&self, path: &str) -> FsResult<Option<u64>> {
        let path = path::sanitize(path, false);
        Ok(self.inner.lock().resolve(&path)?.capacity())
    }

    /// The label of the mount, or layer within it, which provides `path`.
    pub fn get_mount_label(&self, path: &str) -> FsResult<String> {
        let path = path::sanitize(path, false);
        Ok(self.inner.lock().resolve(&path)?.label_of(&path))
    }

    pub fn make_directory(&self, path: &str) -> FsResult<()> {
        let path = path::sanitize(path, false);
        self.inner.lock().resolve(&path)?.make_directory(&path)
    }

    pub fn delete(&self, path: &str) -> FsResult<()> {
        let path = path::sanitize(path, false);
        self.inner.lock().resolve(&path)?.delete(&path)
    }

    /// Move a file or directory, renaming in place when both paths are on
    /// the same mount.
    pub fn move_path(&self, source: &str, dest: &str) -> FsResult<()> {
        let source = path::sanitize(source, false);
        let dest = path::sanitize(dest, false);
        let inner = self.inner.lock();

        inner.check_transfer(&source, &dest, true)?;

        let source_mount = inner.resolve(&source)?;
        let dest_mount = inner.resolve(&dest)?;
        if source_mount.id() == dest_mount.id() {
            source_mount.rename(&source, &dest)
        } else {
            inner.copy_recursive(&source, source_mount, &dest, dest_mount, 0, &self.config)?;
            source_mount.delete(&source)
        }
    }

    /// Copy a file or directory, recursively.
    pub fn copy_path(&self, source: &str, dest: &str) -> FsResult<()> {
        let source = path::sanitize(source, false);
        let dest = path::sanitize(dest, false);
        let inner = self.inner.lock();

        inner.check_transfer(&source, &dest, false)?;

        let source_mount = inner.resolve(&source)?;
        let dest_mount = inner.resolve(&dest)?;
        inner.copy_recursive(&source, source_mount, &dest, dest_mount, 0, &self.config)
    }

    /// Open a file with a mode string: `r`, `w`, `a`, `r+` or `w+`, each
    /// optionally followed by `b`.
    pub fn open(&self, path: &str, mode: &str) -> FsResult<FileHandle> {
        let (mode, binary) =
            OpenMode::parse(mode).map_err(|e| FileSystemError::new(path::sanitize(path, false), e))?;
        self.open_with(path, mode, binary)
    }

    pub fn open_with(&self, path: &str, mode: OpenMode, binary: bool) -> FsResult<FileHandle> {
        let path = path::sanitize(path, false);
        let mut inner = self.inner.lock();
        inner.handles.sweep();

        let mount = inner.resolve(&path)?.clone();
        // Check the limit before touching the mount so a refused open leaves
        // nothing behind.
        inner
            .handles
            .check_capacity()
            .map_err(|e| FileSystemError::new(path.as_str(), e))?;

        let file = match mode {
            OpenMode::Read => mount.open_for_read(&path)?,
            mode => mount.open_file(&path, &mode.options())?,
        };
        Ok(inner.handles.register(mount.id(), path, file, mode, binary))
    }

    pub fn open_for_read(&self, path: &str) -> FsResult<FileHandle> {
        self.open_with(path, OpenMode::Read, true)
    }

    pub fn open_for_write(&self, path: &str) -> FsResult<FileHandle> {
        self.open_with(path, OpenMode::Write, true)
    }

    pub fn open_for_append(&self, path: &str) -> FsResult<FileHandle> {
        self.open_with(path, OpenMode::Append, true)
    }
}

/// Sanitise a location to mount at, refusing anything above the root.
fn mount_location(location: &str) -> FsResult<String> {
    let location = path::sanitize(location, false);
    if location.split('/').any(|segment| segment == "..") {
        return Err(FileSystemError::new(location, FsError::InvalidPath));
    }
    Ok(location)
}

impl FileSystemInner {
    fn mount(&mut self, label: String, location: String, backend: MountBackend) {
        debug!(label = %label, location = %location, "Mounted");

        let mount = MountPoint::new(label, location.clone(), backend);
        if let Some(previous) = self.mounts.insert(location, mount) {
            self.handles.sweep();
            self.handles.close_mount(previous.id());
        }
    }

    /// The mount with the longest location containing `path`.
    fn resolve(&self, path: &str) -> FsResult<&MountPoint> {
        let mount = self
            .mounts
            .values()
            .filter(|mount| path::contains(mount.location(), path))
            .max_by_key(|mount| mount.location().len())
            .ok_or_else(|| FileSystemError::new(path, FsError::InvalidPath))?;

        trace!(path = %path, location = mount.location(), "Resolved mount");
        Ok(mount)
    }

    fn list(&self, path: &str) -> FsResult<Vec<String>> {
        let mut entries: BTreeSet<String> = self.resolve(path)?.list(path)?;

        for location in self.mounts.keys() {
            if path::get_directory(location) == path {
                entries.insert(path::get_name(location));
            }
        }
        Ok(entries.into_iter().collect())
    }

    fn check_transfer(&self, source: &str, dest: &str, moving: bool) -> FsResult<()> {
        if moving && self.resolve(source)?.is_read_only(source)? {
            return Err(FileSystemError::new(source, FsError::AccessDenied));
        }
        if self.resolve(dest)?.is_read_only(dest)? {
            return Err(FileSystemError::new(dest, FsError::AccessDenied));
        }
        if !self.resolve(source)?.exists(source)? {
            return Err(FileSystemError::new(source, FsError::NoSuchFile));
        }
        if self.resolve(dest)?.exists(dest)? {
            return Err(FileSystemError::new(dest, FsError::FileExists));
        }
        if path::contains(source, dest) {
            return Err(FileSystemError::new(source, FsError::RecursiveOperation));
        }
        Ok(())
    }

    fn copy_recursive(
        &self,
        source: &str,
        source_mount: &MountPoint,
        dest: &str,
        dest_mount: &MountPoint,
        depth: usize,
        config: &FileSystemConfig,
    ) -> FsResult<()> {
        if !source_mount.exists(source)? {
            return Ok(());
        }
        if depth >= config.maximum_copy_depth {
            return Err(FileSystemError::new(source, FsError::TooManyDirectories));
        }

        if source_mount.is_directory(source)? {
            dest_mount.make_directory(dest)?;
            for child in source_mount.list(source)? {
                self.copy_recursive(
                    &path::combine(source, &child),
                    source_mount,
                    &path::combine(dest, &child),
                    dest_mount,
                    depth + 1,
                    config,
                )?;
            }
            return Ok(());
        }

        let mut reader = source_mount.open_for_read(source)?;
        let mut writer = dest_mount.open_file(dest, &OpenMode::Write.options())?;
        io::copy(&mut reader, &mut writer)
            .and_then(|_| io::Write::flush(&mut writer))
            .map_err(|e| FileSystemError::new(dest, e.into()))?;
        Ok(())
    }
}
