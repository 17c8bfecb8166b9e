//! A read-only [`Mount`] backed by a zip archive.
//!
//! The archive's directory is indexed into an in-memory tree once, when the
//! mount is created, so lookups never touch the archive. File contents are
//! decompressed on open; small files are shared through a process-wide
//! [`cache`].

pub(crate) mod cache;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};
use time::PrimitiveDateTime;
use zip::result::ZipError;
use zip::{DateTime, ZipArchive};

use self::cache::{CacheKey, LARGE_FILE_THRESHOLD, contents_cache};
use crate::*;

static NEXT_ARCHIVE_ID: AtomicU64 = AtomicU64::new(0);

trait ArchiveSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> ArchiveSource for T {}

#[derive(Debug, Default)]
struct Entry {
    /// Position within the archive. Directories only implied by the files
    /// below them have none.
    index: Option<usize>,
    size: u64,
    /// Milliseconds since the UNIX epoch, `0` if the archive doesn't say.
    modified: u64,
    children: Option<BTreeMap<String, Entry>>,
}

impl Entry {
    fn is_directory(&self) -> bool {
        self.children.is_some()
    }

    fn children_mut(&mut self) -> &mut BTreeMap<String, Entry> {
        self.children.get_or_insert_with(BTreeMap::new)
    }

    /// Walk down to `path`, turning any file in the way into a directory.
    fn get_or_create_dir(&mut self, path: &str) -> &mut Entry {
        let mut entry = self;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            entry = entry
                .children_mut()
                .entry(segment.to_string())
                .or_default();
        }
        entry.children_mut();
        entry
    }

    fn attributes(&self) -> FileAttributes {
        FileAttributes {
            is_directory: self.is_directory(),
            size: if self.is_directory() { 0 } else { self.size },
            created: 0,
            modified: self.modified,
        }
    }
}

/// Zip timestamps carry no zone and are read as UTC.
fn modified_millis(time: Option<DateTime>) -> u64 {
    time.and_then(|time| PrimitiveDateTime::try_from(time).ok())
        .map(|time| time.assume_utc().unix_timestamp())
        .and_then(|seconds| u64::try_from(seconds).ok())
        .map_or(0, |seconds| seconds * 1000)
}

fn from_zip_error(error: ZipError) -> FsError {
    match error {
        ZipError::Io(e) => e.into(),
        other => FsError::Io(other.to_string()),
    }
}

/// A zip archive exposed as a read-only mount.
pub struct ArchiveMount {
    id: u64,
    archive: Mutex<ZipArchive<Box<dyn ArchiveSource>>>,
    root: Entry,
}

impl fmt::Debug for ArchiveMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveMount")
            .field("id", &self.id)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl ArchiveMount {
    pub fn new<R>(reader: R) -> Result<Self>
    where
        R: Read + Seek + Send + 'static,
    {
        let mut archive =
            ZipArchive::new(Box::new(reader) as Box<dyn ArchiveSource>).map_err(from_zip_error)?;

        let mut root = Entry::default();
        root.children_mut();
        for index in 0..archive.len() {
            let file = archive.by_index_raw(index).map_err(from_zip_error)?;
            let name = crate::path::sanitize(file.name(), false);
            if name.is_empty() || name == ".." || name.starts_with("../") {
                warn!(name = file.name(), "Skipping archive entry outside the root");
                continue;
            }

            let modified = modified_millis(file.last_modified());
            if file.is_dir() {
                root.get_or_create_dir(&name).modified = modified;
            } else {
                let (parent, file_name) = match name.rfind('/') {
                    Some(i) => (&name[..i], &name[i + 1..]),
                    None => ("", name.as_str()),
                };
                root.get_or_create_dir(parent).children_mut().insert(
                    file_name.to_string(),
                    Entry {
                        index: Some(index),
                        size: file.size(),
                        modified,
                        children: None,
                    },
                );
            }
        }

        let id = NEXT_ARCHIVE_ID.fetch_add(1, Ordering::Relaxed);
        debug!(archive = id, entries = archive.len(), "Opened archive");

        Ok(ArchiveMount {
            id,
            archive: Mutex::new(archive),
            root,
        })
    }

    /// Open a zip file on the host.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(File::open(path)?)
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        Self::new(Cursor::new(bytes.into()))
    }

    fn get(&self, path: &str) -> Option<&Entry> {
        path.split('/')
            .filter(|segment| !segment.is_empty())
            .try_fold(&self.root, |entry, segment| entry.children.as_ref()?.get(segment))
    }

    fn read_entry(&self, index: usize, size: u64) -> Result<Arc<[u8]>> {
        let mut archive = self.archive.lock();
        let mut file = archive.by_index(index).map_err(from_zip_error)?;
        let mut contents = Vec::with_capacity(size.min(LARGE_FILE_THRESHOLD) as usize);
        file.read_to_end(&mut contents)?;
        Ok(contents.into())
    }

    fn contents(&self, index: usize, size: u64) -> Result<Arc<[u8]>> {
        if size >= LARGE_FILE_THRESHOLD {
            return self.read_entry(index, size);
        }

        let key = CacheKey {
            archive: self.id,
            entry: index,
        };
        if let Some(contents) = contents_cache().lock().get(key, Instant::now()) {
            return Ok(contents);
        }

        let contents = self.read_entry(index, size)?;
        contents_cache()
            .lock()
            .insert(key, contents.clone(), Instant::now());
        Ok(contents)
    }
}

impl Drop for ArchiveMount {
    fn drop(&mut self) {
        contents_cache().lock().invalidate_archive(self.id);
        debug!(archive = self.id, "Released archive");
    }
}

impl Mount for ArchiveMount {
    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.get(path).is_some())
    }

    fn is_directory(&self, path: &str) -> Result<bool> {
        Ok(self.get(path).is_some_and(Entry::is_directory))
    }

    fn list(&self, path: &str) -> Result<BTreeSet<String>> {
        match self.get(path).and_then(|entry| entry.children.as_ref()) {
            Some(children) => Ok(children.keys().cloned().collect()),
            None => Err(FsError::NotADirectory),
        }
    }

    fn size(&self, path: &str) -> Result<u64> {
        match self.get(path) {
            Some(entry) if entry.is_directory() => Ok(0),
            Some(entry) => Ok(entry.size),
            None => Err(FsError::NoSuchFile),
        }
    }

    fn open_for_read(&self, path: &str) -> Result<Box<dyn VirtualFile>> {
        let entry = self.get(path).ok_or(FsError::NoSuchFile)?;
        if entry.is_directory() {
            return Err(FsError::NotAFile);
        }
        let index = entry.index.ok_or(FsError::NoSuchFile)?;

        Ok(Box::new(ArchiveFile {
            contents: self.contents(index, entry.size)?,
            position: 0,
        }))
    }

    fn attributes(&self, path: &str) -> Result<FileAttributes> {
        self.get(path)
            .map(Entry::attributes)
            .ok_or(FsError::NoSuchFile)
    }
}

/// A read-only channel over decompressed archive contents.
#[derive(Debug)]
struct ArchiveFile {
    contents: Arc<[u8]>,
    position: u64,
}

impl Read for ArchiveFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let start = (self.position as usize).min(self.contents.len());
        let count = buf.len().min(self.contents.len() - start);
        buf[..count].copy_from_slice(&self.contents[start..start + count]);
        self.position += count as u64;
        Ok(count)
    }
}

impl Write for ArchiveFile {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(FsError::AccessDenied.into_io())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for ArchiveFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => (self.contents.len() as u64).checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        let new = new.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "Cannot seek before the beginning of the stream",
            )
        })?;
        self.position = new;
        Ok(new)
    }
}

impl VirtualFile for ArchiveFile {
    fn size(&self) -> io::Result<u64> {
        Ok(self.contents.len() as u64)
    }
}
