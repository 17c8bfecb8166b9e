//! A backend attached at a location in the [`FileSystem`] namespace.
//!
//! Everything here takes global, sanitised paths, translates them into the
//! backend's local form, and turns backend failures into
//! [`FileSystemError`]s naming the global path.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::filesystem::{FileSystemError, FreeSpace, FsResult};
use crate::path;
use crate::*;

static NEXT_MOUNT_ID: AtomicU64 = AtomicU64::new(0);

/// A backend together with the capabilities it offers.
#[derive(Debug, Clone)]
pub enum MountBackend {
    ReadOnly(Arc<dyn Mount>),
    Writable(Arc<dyn WritableMount>),
}

impl MountBackend {
    pub fn read_only(mount: impl Mount + 'static) -> Self {
        MountBackend::ReadOnly(Arc::new(mount))
    }

    pub fn writable(mount: impl WritableMount + 'static) -> Self {
        MountBackend::Writable(Arc::new(mount))
    }

    pub fn as_mount(&self) -> &dyn Mount {
        match self {
            MountBackend::ReadOnly(mount) => &**mount,
            MountBackend::Writable(mount) => &**mount as &dyn Mount,
        }
    }

    pub fn as_writable(&self) -> Option<&dyn WritableMount> {
        match self {
            MountBackend::ReadOnly(_) => None,
            MountBackend::Writable(mount) => Some(&**mount),
        }
    }
}

impl From<Arc<dyn Mount>> for MountBackend {
    fn from(mount: Arc<dyn Mount>) -> Self {
        MountBackend::ReadOnly(mount)
    }
}

impl From<Arc<dyn WritableMount>> for MountBackend {
    fn from(mount: Arc<dyn WritableMount>) -> Self {
        MountBackend::Writable(mount)
    }
}

#[derive(Debug, Clone)]
pub struct MountPoint {
    id: u64,
    label: String,
    location: String,
    backend: MountBackend,
}

impl MountPoint {
    /// `location` must already be sanitised.
    pub(crate) fn new(label: String, location: String, backend: MountBackend) -> Self {
        MountPoint {
            id: NEXT_MOUNT_ID.fetch_add(1, Ordering::Relaxed),
            label,
            location,
            backend,
        }
    }

    /// Unique for every call to mount, even at the same location.
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn backend(&self) -> &MountBackend {
        &self.backend
    }

    fn mount(&self) -> &dyn Mount {
        self.backend.as_mount()
    }

    pub(crate) fn to_local(&self, path: &str) -> String {
        path::to_local(path, &self.location)
    }

    /// An error about a mount-local path, reported against its global form.
    pub(crate) fn local_error(&self, local: &str, kind: FsError) -> FileSystemError {
        FileSystemError::new(path::to_global(local, &self.location), kind)
    }

    fn writable(&self, path: &str) -> FsResult<&dyn WritableMount> {
        self.backend
            .as_writable()
            .ok_or_else(|| FileSystemError::new(path, FsError::AccessDenied))
    }

    pub fn free_space(&self) -> FreeSpace {
        match self.backend.as_writable() {
            None => FreeSpace::Bytes(0),
            Some(mount) if mount.capacity().is_none() => FreeSpace::Unlimited,
            Some(mount) => FreeSpace::Bytes(mount.remaining_space().unwrap_or(0)),
        }
    }

    pub fn capacity(&self) -> Option<u64> {
        self.backend.as_writable()?.capacity()
    }

    pub fn is_read_only(&self, path: &str) -> FsResult<bool> {
        let local = self.to_local(path);
        match self.backend.as_writable() {
            None => Ok(true),
            Some(mount) => mount
                .is_read_only(&local)
                .map_err(|e| self.local_error(&local, e)),
        }
    }

    /// The label of whatever actually provides `path`.
    pub fn label_of(&self, path: &str) -> String {
        self.mount()
            .label_of(&self.to_local(path))
            .unwrap_or_else(|| self.label.clone())
    }

    pub fn exists(&self, path: &str) -> FsResult<bool> {
        let local = self.to_local(path);
        self.mount()
            .exists(&local)
            .map_err(|e| self.local_error(&local, e))
    }

    pub fn is_directory(&self, path: &str) -> FsResult<bool> {
        let local = self.to_local(path);
        self.mount()
            .is_directory(&local)
            .map_err(|e| self.local_error(&local, e))
    }

    pub fn list(&self, path: &str) -> FsResult<BTreeSet<String>> {
        let local = self.to_local(path);
        let mount = self.mount();
        let result = (|| {
            if !mount.exists(&local)? || !mount.is_directory(&local)? {
                return Err(FsError::NotADirectory);
            }
            mount.list(&local)
        })();
        result.map_err(|e| self.local_error(&local, e))
    }

    pub fn size(&self, path: &str) -> FsResult<u64> {
        let local = self.to_local(path);
        self.mount()
            .size(&local)
            .map_err(|e| self.local_error(&local, e))
    }

    pub fn attributes(&self, path: &str) -> FsResult<FileAttributes> {
        let local = self.to_local(path);
        self.mount()
            .attributes(&local)
            .map_err(|e| self.local_error(&local, e))
    }

    pub fn open_for_read(&self, path: &str) -> FsResult<Box<dyn VirtualFile>> {
        let local = self.to_local(path);
        self.mount()
            .open_for_read(&local)
            .map_err(|e| self.local_error(&local, e))
    }

    pub fn make_directory(&self, path: &str) -> FsResult<()> {
        let writable = self.writable(path)?;
        let local = self.to_local(path);
        writable
            .make_directory(&local)
            .map_err(|e| self.local_error(&local, e))
    }

    pub fn delete(&self, path: &str) -> FsResult<()> {
        let writable = self.writable(path)?;
        let local = self.to_local(path);
        writable
            .delete(&local)
            .map_err(|e| self.local_error(&local, e))
    }

    /// Rename within this mount, creating the destination's parent first.
    pub fn rename(&self, source: &str, dest: &str) -> FsResult<()> {
        let writable = self.writable(source)?;
        let source = self.to_local(source);
        let dest = self.to_local(dest);

        let parent = path::get_directory(&dest);
        if !dest.is_empty() && !parent.is_empty() {
            let created = (|| {
                if !writable.exists(&parent)? {
                    writable.make_directory(&parent)
                } else if !writable.is_directory(&parent)? {
                    Err(FsError::NotADirectory)
                } else {
                    Ok(())
                }
            })();
            created.map_err(|e| self.local_error(&dest, e))?;
        }

        writable.rename(&source, &dest).map_err(|e| match e {
            FsError::FileExists => self.local_error(&dest, e),
            e => self.local_error(&source, e),
        })
    }

    /// Open a file for writing, creating its parent directory if the file
    /// doesn't exist yet.
    pub fn open_file(&self, path: &str, conf: &OpenOptionsConfig) -> FsResult<Box<dyn VirtualFile>> {
        if !conf.write() && !conf.append() {
            return self.open_for_read(path);
        }

        let writable = self.writable(path)?;
        let local = self.to_local(path);

        let result = (|| {
            if writable.exists(&local)? {
                if writable.is_directory(&local)? {
                    return Err(FsError::CannotWriteToDirectory);
                }
            } else if conf.create() && !local.is_empty() {
                let parent = path::get_directory(&local);
                if !parent.is_empty() {
                    writable.make_directory(&parent)?;
                }
            }
            writable.open_file(&local, conf)
        })();
        result.map_err(|e| self.local_error(&local, e))
    }
}
