use std::collections::BTreeSet;
use std::sync::Arc;

use crate::path;
use crate::*;

/// A [`Mount`] exposing a sub-directory of another mount as its root.
///
/// Every incoming path is prefixed with `root` before being handed to the
/// parent, so a subtree of one mount can be attached elsewhere.
#[derive(Debug)]
pub struct RebaseMount<M: ?Sized> {
    root: String,
    inner: Arc<M>,
}

impl<M: ?Sized> RebaseMount<M> {
    pub fn new(inner: Arc<M>, root: &str) -> Self {
        RebaseMount {
            root: path::sanitize(root, false),
            inner,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    fn prepare_path(&self, local: &str) -> String {
        path::to_global(local, &self.root)
    }
}

impl<M: Mount + ?Sized> Mount for RebaseMount<M> {
    fn exists(&self, path: &str) -> Result<bool> {
        self.inner.exists(&self.prepare_path(path))
    }

    fn is_directory(&self, path: &str) -> Result<bool> {
        self.inner.is_directory(&self.prepare_path(path))
    }

    fn list(&self, path: &str) -> Result<BTreeSet<String>> {
        self.inner.list(&self.prepare_path(path))
    }

    fn size(&self, path: &str) -> Result<u64> {
        self.inner.size(&self.prepare_path(path))
    }

    fn open_for_read(&self, path: &str) -> Result<Box<dyn VirtualFile>> {
        self.inner.open_for_read(&self.prepare_path(path))
    }

    fn attributes(&self, path: &str) -> Result<FileAttributes> {
        self.inner.attributes(&self.prepare_path(path))
    }

    fn label_of(&self, path: &str) -> Option<String> {
        self.inner.label_of(&self.prepare_path(path))
    }
}

impl<M: WritableMount + ?Sized> WritableMount for RebaseMount<M> {
    fn make_directory(&self, path: &str) -> Result<()> {
        self.inner.make_directory(&self.prepare_path(path))
    }

    fn delete(&self, path: &str) -> Result<()> {
        // The rebased root is this mount's root, which can't be removed.
        if path.is_empty() {
            return Err(FsError::AccessDenied);
        }
        self.inner.delete(&self.prepare_path(path))
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.inner
            .rename(&self.prepare_path(from), &self.prepare_path(to))
    }

    fn open_file(&self, path: &str, conf: &OpenOptionsConfig) -> Result<Box<dyn VirtualFile>> {
        self.inner.open_file(&self.prepare_path(path), conf)
    }

    fn remaining_space(&self) -> Result<u64> {
        self.inner.remaining_space()
    }

    fn capacity(&self) -> Option<u64> {
        self.inner.capacity()
    }

    fn is_read_only(&self, path: &str) -> Result<bool> {
        self.inner.is_read_only(&self.prepare_path(path))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    fn fixture() -> Arc<MemoryMount> {
        let mem = MemoryMount::new();
        mem.add_file("programs/hello.lua", "print('hello')").unwrap();
        mem.add_file("programs/fun/worm.lua", "-- worm").unwrap();
        mem.add_file("startup.lua", "shell.run('hello')").unwrap();
        Arc::new(mem)
    }

    #[test]
    fn paths_are_prefixed() {
        let rebased = RebaseMount::new(fixture(), "/programs/");
        assert_eq!(rebased.root(), "programs");

        assert_eq!(rebased.exists(""), Ok(true));
        assert_eq!(rebased.is_directory(""), Ok(true));
        assert_eq!(rebased.exists("hello.lua"), Ok(true));
        assert_eq!(rebased.exists("startup.lua"), Ok(false));
        assert_eq!(
            rebased.list(""),
            Ok(BTreeSet::from(["fun".to_string(), "hello.lua".to_string()]))
        );
        assert_eq!(rebased.size("fun/worm.lua"), Ok(7));

        let mut contents = String::new();
        rebased
            .open_for_read("hello.lua")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "print('hello')");
    }

    #[test]
    fn writes_land_in_the_parent() {
        let parent = fixture();
        let rebased = RebaseMount::new(parent.clone(), "programs");

        rebased.make_directory("games").unwrap();
        assert_eq!(parent.is_directory("programs/games"), Ok(true));

        rebased.delete("fun").unwrap();
        assert_eq!(parent.exists("programs/fun/worm.lua"), Ok(false));

        assert_eq!(rebased.delete(""), Err(FsError::AccessDenied));
        assert_eq!(parent.exists("programs"), Ok(true));
    }
}
