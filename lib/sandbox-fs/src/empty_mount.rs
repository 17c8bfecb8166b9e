//! A placeholder for a mount point with nothing behind it yet - as the name
//! suggests, only its root exists and it contains nothing.

use std::collections::BTreeSet;

use crate::*;

#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyMount;

impl EmptyMount {
    pub fn new() -> Self {
        EmptyMount
    }
}

impl Mount for EmptyMount {
    fn exists(&self, path: &str) -> Result<bool> {
        Ok(path.is_empty())
    }

    fn is_directory(&self, path: &str) -> Result<bool> {
        Ok(path.is_empty())
    }

    fn list(&self, path: &str) -> Result<BTreeSet<String>> {
        // The root is still readable, just without any entries.
        if path.is_empty() {
            Ok(BTreeSet::new())
        } else {
            Err(FsError::NotADirectory)
        }
    }

    fn size(&self, path: &str) -> Result<u64> {
        if path.is_empty() {
            Ok(0)
        } else {
            Err(FsError::NoSuchFile)
        }
    }

    fn open_for_read(&self, _path: &str) -> Result<Box<dyn VirtualFile>> {
        Err(FsError::NoSuchFile)
    }

    fn attributes(&self, path: &str) -> Result<FileAttributes> {
        if path.is_empty() {
            Ok(FileAttributes::directory())
        } else {
            Err(FsError::NoSuchFile)
        }
    }
}
