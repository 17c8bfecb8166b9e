//! An in-memory, writable [`Mount`].
//!
//! The tree is kept behind a single lock; file contents are shared with any
//! open channel so writes through a channel are visible to later reads
//! immediately.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};

use crate::*;

/// Files can't grow past this through a channel.
const MAX_FILE_SIZE: u64 = 1 << 30;

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |time| time.as_millis() as u64)
}

#[derive(Debug)]
struct FileData {
    bytes: Vec<u8>,
    created: u64,
    modified: u64,
}

#[derive(Debug)]
struct DirectoryNode {
    children: BTreeMap<String, Node>,
    created: u64,
    modified: u64,
}

#[derive(Debug)]
enum Node {
    File(Arc<Mutex<FileData>>),
    Directory(DirectoryNode),
}

impl Node {
    fn new_file(bytes: Vec<u8>) -> Self {
        let now = now_millis();
        Node::File(Arc::new(Mutex::new(FileData {
            bytes,
            created: now,
            modified: now,
        })))
    }

    fn new_dir() -> Self {
        let now = now_millis();
        Node::Directory(DirectoryNode {
            children: BTreeMap::new(),
            created: now,
            modified: now,
        })
    }

    fn attributes(&self) -> FileAttributes {
        match self {
            Node::File(file) => {
                let file = file.lock();
                FileAttributes {
                    is_directory: false,
                    size: file.bytes.len() as u64,
                    created: file.created,
                    modified: file.modified,
                }
            }
            Node::Directory(dir) => FileAttributes {
                is_directory: true,
                size: 0,
                created: dir.created,
                modified: dir.modified,
            },
        }
    }

    fn used_space(&self) -> u64 {
        match self {
            Node::File(file) => MINIMUM_FILE_SIZE.max(file.lock().bytes.len() as u64),
            Node::Directory(dir) => {
                MINIMUM_FILE_SIZE + dir.children.values().map(Node::used_space).sum::<u64>()
            }
        }
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

/// Split a non-empty path into its parent directory and final name.
fn parent_and_name(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(index) => (&path[..index], &path[index + 1..]),
        None => ("", path),
    }
}

fn lookup<'a>(root: &'a Node, path: &str) -> Option<&'a Node> {
    segments(path).try_fold(root, |node, segment| match node {
        Node::Directory(dir) => dir.children.get(segment),
        Node::File(_) => None,
    })
}

fn lookup_dir_mut<'a>(root: &'a mut Node, path: &str) -> Option<&'a mut DirectoryNode> {
    let mut node = root;
    for segment in segments(path) {
        node = match node {
            Node::Directory(dir) => dir.children.get_mut(segment)?,
            Node::File(_) => return None,
        };
    }

    match node {
        Node::Directory(dir) => Some(dir),
        Node::File(_) => None,
    }
}

/// A writable mount which keeps every file in memory.
///
/// A capacity, when given, is only used to report free space; writes are not
/// refused once it has been exceeded.
#[derive(Debug)]
pub struct MemoryMount {
    root: RwLock<Node>,
    capacity: Option<u64>,
}

impl Default for MemoryMount {
    fn default() -> Self {
        MemoryMount::new()
    }
}

impl MemoryMount {
    /// Create an unbounded memory mount.
    pub fn new() -> Self {
        MemoryMount {
            root: RwLock::new(Node::new_dir()),
            capacity: None,
        }
    }

    pub fn with_capacity(capacity: u64) -> Self {
        MemoryMount {
            root: RwLock::new(Node::new_dir()),
            capacity: Some(capacity),
        }
    }

    /// Insert a file, creating its parent directories and replacing anything
    /// already at that path.
    pub fn add_file(&self, path: &str, contents: impl Into<Vec<u8>>) -> Result<()> {
        let path = crate::path::sanitize(path, false);
        if path.is_empty() {
            return Err(FsError::CannotWriteToDirectory);
        }

        let (parent, name) = parent_and_name(&path);
        let mut root = self.root.write();
        let mut node = &mut *root;
        for segment in segments(parent) {
            let Node::Directory(dir) = node else {
                return Err(FsError::NotADirectory);
            };
            let child = dir
                .children
                .entry(segment.to_string())
                .or_insert_with(Node::new_dir);
            if !matches!(child, Node::Directory(_)) {
                *child = Node::new_dir();
            }
            node = child;
        }

        let Node::Directory(dir) = node else {
            return Err(FsError::NotADirectory);
        };
        dir.children
            .insert(name.to_string(), Node::new_file(contents.into()));
        Ok(())
    }

    fn used_space(&self) -> u64 {
        // The root itself is free.
        self.root.read().used_space() - MINIMUM_FILE_SIZE
    }
}

impl Mount for MemoryMount {
    fn exists(&self, path: &str) -> Result<bool> {
        Ok(lookup(&self.root.read(), path).is_some())
    }

    fn is_directory(&self, path: &str) -> Result<bool> {
        Ok(matches!(
            lookup(&self.root.read(), path),
            Some(Node::Directory(_))
        ))
    }

    fn list(&self, path: &str) -> Result<BTreeSet<String>> {
        match lookup(&self.root.read(), path) {
            Some(Node::Directory(dir)) => Ok(dir.children.keys().cloned().collect()),
            Some(Node::File(_)) => Err(FsError::NotADirectory),
            None => Err(FsError::NoSuchFile),
        }
    }

    fn size(&self, path: &str) -> Result<u64> {
        lookup(&self.root.read(), path)
            .map(|node| node.attributes().size)
            .ok_or(FsError::NoSuchFile)
    }

    fn open_for_read(&self, path: &str) -> Result<Box<dyn VirtualFile>> {
        match lookup(&self.root.read(), path) {
            Some(Node::File(file)) => Ok(Box::new(EntryChannel {
                file: file.clone(),
                position: 0,
                readable: true,
                writable: false,
            })),
            Some(Node::Directory(_)) => Err(FsError::NotAFile),
            None => Err(FsError::NoSuchFile),
        }
    }

    fn attributes(&self, path: &str) -> Result<FileAttributes> {
        lookup(&self.root.read(), path)
            .map(Node::attributes)
            .ok_or(FsError::NoSuchFile)
    }
}

impl WritableMount for MemoryMount {
    fn make_directory(&self, path: &str) -> Result<()> {
        let mut root = self.root.write();
        let mut node = &mut *root;
        for segment in segments(path) {
            let Node::Directory(dir) = node else {
                return Err(FsError::FileExists);
            };
            node = dir
                .children
                .entry(segment.to_string())
                .or_insert_with(Node::new_dir);
        }

        match node {
            Node::Directory(_) => Ok(()),
            Node::File(_) => Err(FsError::FileExists),
        }
    }

    fn delete(&self, path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(FsError::AccessDenied);
        }

        let (parent, name) = parent_and_name(path);
        let mut root = self.root.write();
        if let Some(dir) = lookup_dir_mut(&mut root, parent) {
            dir.children.remove(name);
        }
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        if from.is_empty() || to.is_empty() {
            return Err(FsError::AccessDenied);
        }
        if crate::path::contains(from, to) {
            return Err(FsError::RecursiveOperation);
        }

        let mut root = self.root.write();
        if lookup(&root, from).is_none() {
            return Err(FsError::NoSuchFile);
        }

        let (to_parent, to_name) = parent_and_name(to);
        match lookup(&root, to_parent) {
            Some(Node::Directory(dir)) if dir.children.contains_key(to_name) => {
                return Err(FsError::FileExists);
            }
            Some(Node::Directory(_)) => {}
            _ => return Err(FsError::NoSuchFile),
        }

        let (from_parent, from_name) = parent_and_name(from);
        let node = lookup_dir_mut(&mut root, from_parent)
            .and_then(|dir| dir.children.remove(from_name))
            .ok_or(FsError::NoSuchFile)?;
        let dest = lookup_dir_mut(&mut root, to_parent).ok_or(FsError::NoSuchFile)?;
        dest.children.insert(to_name.to_string(), node);
        Ok(())
    }

    fn open_file(&self, path: &str, conf: &OpenOptionsConfig) -> Result<Box<dyn VirtualFile>> {
        let directory_error = if conf.create() {
            FsError::CannotWriteToDirectory
        } else {
            FsError::NotAFile
        };
        if path.is_empty() {
            return Err(directory_error);
        }

        let (parent, name) = parent_and_name(path);
        let mut root = self.root.write();
        let dir = lookup_dir_mut(&mut root, parent).ok_or(FsError::NoSuchFile)?;

        let file = match dir.children.get(name) {
            Some(Node::Directory(_)) => return Err(directory_error),
            Some(Node::File(file)) => {
                if conf.truncate() {
                    let mut data = file.lock();
                    data.bytes.clear();
                    data.modified = now_millis();
                }
                file.clone()
            }
            None if conf.create() => {
                let now = now_millis();
                let file = Arc::new(Mutex::new(FileData {
                    bytes: Vec::new(),
                    created: now,
                    modified: now,
                }));
                dir.children
                    .insert(name.to_string(), Node::File(file.clone()));
                dir.modified = now;
                file
            }
            None => return Err(FsError::NoSuchFile),
        };

        let position = if conf.append() {
            file.lock().bytes.len() as u64
        } else {
            0
        };

        Ok(Box::new(EntryChannel {
            file,
            position,
            readable: conf.read(),
            writable: conf.write() || conf.append(),
        }))
    }

    fn remaining_space(&self) -> Result<u64> {
        Ok(match self.capacity {
            Some(capacity) => capacity.saturating_sub(self.used_space()),
            None => u64::MAX,
        })
    }

    fn capacity(&self) -> Option<u64> {
        self.capacity
    }
}

/// A channel onto a single in-memory file.
#[derive(Debug)]
struct EntryChannel {
    file: Arc<Mutex<FileData>>,
    position: u64,
    readable: bool,
    writable: bool,
}

impl Read for EntryChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.readable {
            return Err(FsError::AccessDenied.into_io());
        }

        let file = self.file.lock();
        let len = file.bytes.len() as u64;
        if self.position >= len {
            return Ok(0);
        }

        let start = self.position as usize;
        let count = buf.len().min(file.bytes.len() - start);
        buf[..count].copy_from_slice(&file.bytes[start..start + count]);
        self.position += count as u64;
        Ok(count)
    }
}

impl Write for EntryChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.writable {
            return Err(FsError::AccessDenied.into_io());
        }

        let end = self.position + buf.len() as u64;
        if end > MAX_FILE_SIZE {
            return Err(io::Error::other("File is too large"));
        }

        let mut file = self.file.lock();
        let start = self.position as usize;
        let end = end as usize;
        if file.bytes.len() < end {
            file.bytes.resize(end, 0);
        }
        file.bytes[start..end].copy_from_slice(buf);
        file.modified = now_millis();
        self.position = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for EntryChannel {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.file.lock().bytes.len() as u64;
        let new = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };

        match new {
            Some(new) => {
                self.position = new;
                Ok(new)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Cannot seek before the beginning of the stream",
            )),
        }
    }
}

impl VirtualFile for EntryChannel {
    fn size(&self) -> io::Result<u64> {
        Ok(self.file.lock().bytes.len() as u64)
    }
}
