//! Open file handles and the tracker which bounds and reclaims them.
//!
//! A [`FileHandle`] owns the channel returned by a mount. Closing a handle, or
//! dropping it, closes the channel immediately; the tracker's bookkeeping is
//! caught up lazily by [`HandleTracker::sweep`], which reports every handle
//! that was dropped without being closed.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::str::FromStr;
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::*;

/// How a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// `r`
    Read,
    /// `w`
    Write,
    /// `a`
    Append,
    /// `r+`: read and write an existing file without truncating it.
    ReadUpdate,
    /// `w+`: read and write, truncating or creating the file.
    WriteUpdate,
}

impl OpenMode {
    /// Parse a mode string such as `"rb"` or `"w+"`, returning the mode and
    /// whether it asked for binary access.
    pub fn parse(mode: &str) -> Result<(OpenMode, bool)> {
        let (mode_str, binary) = match mode.strip_suffix('b') {
            Some(rest) => (rest, true),
            None => (mode, false),
        };
        Ok((mode_str.parse()?, binary))
    }

    pub fn options(self) -> OpenOptionsConfig {
        let options = OpenOptions::new();
        match self {
            OpenMode::Read => options.read(true),
            OpenMode::Write => options.write(true).create(true).truncate(true),
            OpenMode::Append => options.write(true).create(true).append(true),
            OpenMode::ReadUpdate => options.read(true).write(true),
            OpenMode::WriteUpdate => options.read(true).write(true).create(true).truncate(true),
        }
        .build()
    }

    pub fn is_readable(self) -> bool {
        self.options().read()
    }

    pub fn is_writable(self) -> bool {
        self != OpenMode::Read
    }
}

impl FromStr for OpenMode {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r" => Ok(OpenMode::Read),
            "w" => Ok(OpenMode::Write),
            "a" => Ok(OpenMode::Append),
            "r+" => Ok(OpenMode::ReadUpdate),
            "w+" => Ok(OpenMode::WriteUpdate),
            _ => Err(FsError::UnsupportedMode),
        }
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpenMode::Read => "r",
            OpenMode::Write => "w",
            OpenMode::Append => "a",
            OpenMode::ReadUpdate => "r+",
            OpenMode::WriteUpdate => "w+",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
enum SlotState {
    Open(Box<dyn VirtualFile>),
    Closed,
    ClosedExternally,
}

/// The channel behind a handle, shared between the handle and the tracker so
/// that either side can close it.
#[derive(Debug)]
struct HandleSlot {
    state: Mutex<SlotState>,
}

impl HandleSlot {
    fn with_file<T>(&self, f: impl FnOnce(&mut dyn VirtualFile) -> io::Result<T>) -> io::Result<T> {
        match &mut *self.state.lock() {
            SlotState::Open(file) => f(file.as_mut()),
            SlotState::Closed => Err(FsError::Closed.into_io()),
            SlotState::ClosedExternally => Err(FsError::ClosedExternally.into_io()),
        }
    }

    /// Close the channel, returning what state it was in beforehand.
    fn close(&self, closed_state: SlotState) -> SlotState {
        let mut state = self.state.lock();
        match &*state {
            SlotState::Open(_) => std::mem::replace(&mut *state, closed_state),
            SlotState::Closed => SlotState::Closed,
            SlotState::ClosedExternally => SlotState::ClosedExternally,
        }
    }

    fn is_closed(&self) -> bool {
        !matches!(&*self.state.lock(), SlotState::Open(_))
    }
}

#[derive(Debug, Clone, Copy)]
struct Reclaimed {
    id: u64,
    /// The handle was dropped without an explicit close.
    leaked: bool,
}

/// An open file.
///
/// Dropping a handle without calling [`FileHandle::close`] still closes the
/// underlying channel, but the owning [`FileSystem`] will report it as leaked.
pub struct FileHandle {
    id: u64,
    path: String,
    mode: OpenMode,
    binary: bool,
    slot: Arc<HandleSlot>,
    reclaim: Arc<SegQueue<Reclaimed>>,
    released: bool,
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("binary", &self.binary)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl FileHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The global path this handle was opened with.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn is_binary(&self) -> bool {
        self.binary
    }

    pub fn is_closed(&self) -> bool {
        self.slot.is_closed()
    }

    /// The current length of the open file.
    pub fn size(&self) -> Result<u64> {
        Ok(self.slot.with_file(|file| file.size())?)
    }

    /// Flush and close the file.
    ///
    /// Fails with [`FsError::ClosedExternally`] if the file's mount was
    /// removed while the handle was open.
    pub fn close(mut self) -> Result<()> {
        self.release(false)
    }

    fn release(&mut self, leaked: bool) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let flushed = self.slot.with_file(|file| file.flush());
        let previous = self.slot.close(SlotState::Closed);
        self.reclaim.push(Reclaimed {
            id: self.id,
            leaked,
        });

        match previous {
            SlotState::ClosedExternally => Err(FsError::ClosedExternally),
            SlotState::Closed => Err(FsError::Closed),
            SlotState::Open(_) => Ok(flushed?),
        }
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.release(true);
        }
    }
}

impl Read for FileHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.slot.with_file(|file| file.read(buf))
    }
}

impl Write for FileHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.slot.with_file(|file| file.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.slot.with_file(|file| file.flush())
    }
}

impl Seek for FileHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.slot.with_file(|file| file.seek(pos))
    }
}

#[derive(Debug)]
struct TrackedHandle {
    mount_id: u64,
    path: String,
    slot: Arc<HandleSlot>,
}

/// Bookkeeping for every handle a [`FileSystem`] has given out.
#[derive(Debug)]
pub(crate) struct HandleTracker {
    maximum: usize,
    next_id: u64,
    open: BTreeMap<u64, TrackedHandle>,
    reclaim: Arc<SegQueue<Reclaimed>>,
    leaked: u64,
}

impl HandleTracker {
    /// `maximum` of zero means no limit.
    pub(crate) fn new(maximum: usize) -> Self {
        HandleTracker {
            maximum,
            next_id: 0,
            open: BTreeMap::new(),
            reclaim: Arc::new(SegQueue::new()),
            leaked: 0,
        }
    }

    /// Forget every handle which has been closed or dropped since the last
    /// sweep.
    pub(crate) fn sweep(&mut self) {
        while let Some(reclaimed) = self.reclaim.pop() {
            let Some(handle) = self.open.remove(&reclaimed.id) else {
                continue;
            };
            if reclaimed.leaked {
                self.leaked += 1;
                warn!(
                    path = %handle.path,
                    id = reclaimed.id,
                    "File was opened but never closed; it has been closed automatically",
                );
            }
        }
    }

    /// Fails if opening another file would exceed the limit.
    pub(crate) fn check_capacity(&self) -> Result<()> {
        if self.maximum > 0 && self.open.len() >= self.maximum {
            return Err(FsError::TooManyOpenFiles);
        }
        Ok(())
    }

    pub(crate) fn register(
        &mut self,
        mount_id: u64,
        path: String,
        file: Box<dyn VirtualFile>,
        mode: OpenMode,
        binary: bool,
    ) -> FileHandle {
        let id = self.next_id;
        self.next_id += 1;

        let slot = Arc::new(HandleSlot {
            state: Mutex::new(SlotState::Open(file)),
        });
        self.open.insert(
            id,
            TrackedHandle {
                mount_id,
                path: path.clone(),
                slot: slot.clone(),
            },
        );

        FileHandle {
            id,
            path,
            mode,
            binary,
            slot,
            reclaim: self.reclaim.clone(),
            released: false,
        }
    }

    /// Close every handle open on one mount. Returns how many were closed.
    pub(crate) fn close_mount(&mut self, mount_id: u64) -> usize {
        let ids: Vec<u64> = self
            .open
            .iter()
            .filter(|(_, handle)| handle.mount_id == mount_id)
            .map(|(id, _)| *id)
            .collect();

        for id in &ids {
            if let Some(handle) = self.open.remove(id) {
                handle.slot.close(SlotState::ClosedExternally);
                debug!(path = %handle.path, id, "Closed file on unmount");
            }
        }
        ids.len()
    }

    pub(crate) fn close_all(&mut self) {
        for (_, handle) in std::mem::take(&mut self.open) {
            handle.slot.close(SlotState::ClosedExternally);
        }
        // Anything still queued refers to handles which are gone now.
        while self.reclaim.pop().is_some() {}
    }

    pub(crate) fn open_count(&self) -> usize {
        self.open.len()
    }

    pub(crate) fn leaked(&self) -> u64 {
        self.leaked
    }
}
