//! A writable [`Mount`] backed by a directory on the host, with a byte quota.
//!
//! Every file and directory is charged at least [`MINIMUM_FILE_SIZE`] bytes.
//! Usage is measured by walking the directory when the mount is created and
//! then kept up to date as files are written and deleted. Bytes written through
//! an open channel are metered as they are written.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::warn;

use crate::*;

#[derive(Debug)]
struct Quota {
    /// The capacity, including the charge for the root directory.
    capacity: u64,
    used: u64,
}

impl Quota {
    fn remaining(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }

    fn charge(&mut self, bytes: u64) -> Result<()> {
        if bytes > self.remaining() {
            return Err(FsError::OutOfSpace);
        }
        self.used += bytes;
        Ok(())
    }

    fn credit(&mut self, bytes: u64) {
        self.used = self.used.saturating_sub(bytes);
    }
}

/// A directory on the host exposed as a writable mount.
///
/// The directory is only created once something is written to it.
#[derive(Debug)]
pub struct RealDirectoryMount {
    root: PathBuf,
    quota: Arc<Mutex<Quota>>,
}

impl RealDirectoryMount {
    pub fn new(root: impl Into<PathBuf>, capacity: u64) -> Self {
        let root = root.into();
        let used = if root.exists() {
            measure_used_space(&root)
        } else {
            MINIMUM_FILE_SIZE
        };

        RealDirectoryMount {
            root,
            quota: Arc::new(Mutex::new(Quota {
                capacity: capacity.saturating_add(MINIMUM_FILE_SIZE),
                used,
            })),
        }
    }

    /// The host directory backing this mount.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn created(&self) -> bool {
        self.root.exists()
    }

    fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|_| FsError::AccessDenied)
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        // Local paths are sanitised, but never let one walk out of the root.
        if path.split('/').any(|segment| segment == "..") {
            return Err(FsError::AccessDenied);
        }

        Ok(if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        })
    }

    fn metadata(&self, path: &str) -> Result<Option<fs::Metadata>> {
        match fs::metadata(self.resolve(path)?) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_recursively(&self, quota: &mut Quota, file: &Path) -> Result<()> {
        let metadata = fs::symlink_metadata(file)?;
        if metadata.is_dir() {
            for entry in fs::read_dir(file)? {
                self.delete_recursively(quota, &entry?.path())?;
            }
            fs::remove_dir(file).map_err(|_| FsError::AccessDenied)?;
            quota.credit(MINIMUM_FILE_SIZE);
        } else {
            fs::remove_file(file).map_err(|_| FsError::AccessDenied)?;
            quota.credit(MINIMUM_FILE_SIZE.max(metadata.len()));
        }

        Ok(())
    }
}

fn to_millis(time: io::Result<SystemTime>) -> u64 {
    time.ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |time| time.as_millis() as u64)
}

/// Walk `path`, charging each directory the minimum and each file the larger
/// of its length and the minimum. Unreadable entries are skipped.
fn measure_used_space(path: &Path) -> u64 {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(error) => {
            warn!(path = %path.display(), %error, "Error computing file size");
            return 0;
        }
    };

    if !metadata.is_dir() {
        return MINIMUM_FILE_SIZE.max(metadata.len());
    }

    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(error) => {
            warn!(path = %path.display(), %error, "Error computing file size");
            return MINIMUM_FILE_SIZE;
        }
    };

    MINIMUM_FILE_SIZE
        + entries
            .filter_map(|entry| entry.ok())
            .map(|entry| measure_used_space(&entry.path()))
            .sum::<u64>()
}

impl Mount for RealDirectoryMount {
    fn exists(&self, path: &str) -> Result<bool> {
        if !self.created() {
            return Ok(path.is_empty());
        }
        Ok(self.resolve(path)?.exists())
    }

    fn is_directory(&self, path: &str) -> Result<bool> {
        if !self.created() {
            return Ok(path.is_empty());
        }
        Ok(self.resolve(path)?.is_dir())
    }

    fn list(&self, path: &str) -> Result<BTreeSet<String>> {
        if !self.created() {
            return if path.is_empty() {
                Ok(BTreeSet::new())
            } else {
                Err(FsError::NotADirectory)
            };
        }

        let dir = self.resolve(path)?;
        if !dir.is_dir() {
            return Err(FsError::NotADirectory);
        }

        let mut names = BTreeSet::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            // Names which aren't valid UTF-8 can't be addressed by a path.
            if let Ok(name) = entry.file_name().into_string() {
                names.insert(name);
            }
        }
        Ok(names)
    }

    fn size(&self, path: &str) -> Result<u64> {
        if !self.created() && path.is_empty() {
            return Ok(0);
        }

        match self.metadata(path)? {
            Some(metadata) if metadata.is_dir() => Ok(0),
            Some(metadata) => Ok(metadata.len()),
            None => Err(FsError::NoSuchFile),
        }
    }

    fn open_for_read(&self, path: &str) -> Result<Box<dyn VirtualFile>> {
        if !self.created() {
            return Err(FsError::NoSuchFile);
        }

        match self.metadata(path)? {
            Some(metadata) if metadata.is_dir() => Err(FsError::NotAFile),
            Some(_) => {
                let file = fs::File::open(self.resolve(path)?)?;
                Ok(Box::new(HostFile {
                    file,
                    readable: true,
                    meter: None,
                }))
            }
            None => Err(FsError::NoSuchFile),
        }
    }

    fn attributes(&self, path: &str) -> Result<FileAttributes> {
        if !self.created() && path.is_empty() {
            return Ok(FileAttributes::directory());
        }

        let metadata = self.metadata(path)?.ok_or(FsError::NoSuchFile)?;
        Ok(FileAttributes {
            is_directory: metadata.is_dir(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            created: to_millis(metadata.created()),
            modified: to_millis(metadata.modified()),
        })
    }
}

impl WritableMount for RealDirectoryMount {
    fn make_directory(&self, path: &str) -> Result<()> {
        self.create()?;
        let dir = self.resolve(path)?;

        let mut quota = self.quota.lock();
        if dir.exists() {
            return if dir.is_dir() {
                Ok(())
            } else {
                Err(FsError::FileExists)
            };
        }

        let mut to_create = 1;
        let mut parent = dir.parent();
        while let Some(p) = parent {
            if p.exists() {
                break;
            }
            to_create += 1;
            parent = p.parent();
        }

        let charge = to_create * MINIMUM_FILE_SIZE;
        if quota.remaining() < charge {
            return Err(FsError::OutOfSpace);
        }

        fs::create_dir_all(&dir).map_err(|_| FsError::AccessDenied)?;
        quota.used += charge;
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(FsError::AccessDenied);
        }
        if !self.created() {
            return Ok(());
        }

        let file = self.resolve(path)?;
        let mut quota = self.quota.lock();
        if fs::symlink_metadata(&file).is_err() {
            return Ok(());
        }
        self.delete_recursively(&mut quota, &file)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let source = self.resolve(from)?;
        let dest = self.resolve(to)?;

        if !source.exists() {
            return Err(FsError::NoSuchFile);
        }
        if dest.exists() {
            return Err(FsError::FileExists);
        }
        if dest.starts_with(&source) {
            return Err(FsError::RecursiveOperation);
        }

        fs::rename(source, dest).map_err(Into::into)
    }

    fn open_file(&self, path: &str, conf: &OpenOptionsConfig) -> Result<Box<dyn VirtualFile>> {
        if !conf.write() && !conf.append() {
            return self.open_for_read(path);
        }

        self.create()?;
        let file = self.resolve(path)?;

        let mut quota = self.quota.lock();
        let existing = match self.metadata(path)? {
            Some(metadata) if metadata.is_dir() => return Err(FsError::CannotWriteToDirectory),
            Some(metadata) => Some(metadata.len()),
            None if !conf.create() => return Err(FsError::NoSuchFile),
            None => {
                if quota.remaining() < MINIMUM_FILE_SIZE {
                    return Err(FsError::OutOfSpace);
                }
                None
            }
        };

        // std refuses truncate together with append, and truncating makes
        // appending meaningless anyway.
        let append = conf.append() && !conf.truncate();
        let handle = fs::OpenOptions::new()
            .read(conf.read())
            .write(true)
            .create(conf.create())
            .truncate(conf.truncate())
            .append(append)
            .open(&file)?;

        let old_charge = existing.map_or(0, |size| MINIMUM_FILE_SIZE.max(size));
        let size = if conf.truncate() {
            0
        } else {
            existing.unwrap_or(0)
        };
        let position = if append { size } else { 0 };
        let new_charge = MINIMUM_FILE_SIZE.max(size);

        quota.credit(old_charge);
        quota.used += new_charge;

        Ok(Box::new(HostFile {
            file: handle,
            readable: conf.read(),
            meter: Some(Meter {
                quota: self.quota.clone(),
                // Bytes up to the charged size are already paid for.
                ignored: new_charge - position,
                can_seek: !append,
            }),
        }))
    }

    fn remaining_space(&self) -> Result<u64> {
        Ok(self.quota.lock().remaining())
    }

    fn capacity(&self) -> Option<u64> {
        Some(self.quota.lock().capacity - MINIMUM_FILE_SIZE)
    }

    fn is_read_only(&self, path: &str) -> Result<bool> {
        let mut file = self.resolve(path)?;
        loop {
            if let Ok(metadata) = fs::metadata(&file) {
                return Ok(metadata.permissions().readonly());
            }
            if file == self.root || !file.pop() {
                return Ok(false);
            }
        }
    }
}

/// Write metering for a channel on a [`RealDirectoryMount`].
#[derive(Debug)]
struct Meter {
    quota: Arc<Mutex<Quota>>,
    /// Bytes which may be written from the current position without being
    /// charged, as they overwrite space already accounted for.
    ignored: u64,
    can_seek: bool,
}

impl Meter {
    fn count(&mut self, bytes: u64) -> io::Result<()> {
        if bytes <= self.ignored {
            self.ignored -= bytes;
            return Ok(());
        }

        self.quota
            .lock()
            .charge(bytes - self.ignored)
            .map_err(FsError::into_io)?;
        self.ignored = 0;
        Ok(())
    }
}

#[derive(Debug)]
struct HostFile {
    file: fs::File,
    readable: bool,
    /// Present on channels opened for writing.
    meter: Option<Meter>,
}

impl Read for HostFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.readable {
            return Err(FsError::AccessDenied.into_io());
        }
        self.file.read(buf)
    }
}

impl Write for HostFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(meter) = &mut self.meter else {
            return Err(FsError::AccessDenied.into_io());
        };

        meter.count(buf.len() as u64)?;
        match self.file.write(buf) {
            Ok(written) => {
                meter.ignored += (buf.len() - written) as u64;
                Ok(written)
            }
            Err(e) => {
                meter.ignored += buf.len() as u64;
                Err(e)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for HostFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let Some(meter) = &mut self.meter else {
            return self.file.seek(pos);
        };

        if pos == SeekFrom::Current(0) {
            return self.file.stream_position();
        }
        if !meter.can_seek {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "File does not support seeking",
            ));
        }

        let current = self.file.stream_position()?;
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.file.metadata()?.len().checked_add_signed(delta),
            SeekFrom::Current(delta) => current.checked_add_signed(delta),
        }
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "Cannot seek before the beginning of the stream",
            )
        })?;

        if target < current {
            meter.ignored += current - target;
        } else {
            meter.count(target - current)?;
        }
        self.file.seek(SeekFrom::Start(target))
    }
}

impl VirtualFile for HostFile {
    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}
