use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;

use crate::*;

#[derive(Debug)]
struct Layer<M: ?Sized> {
    label: Option<String>,
    mount: Arc<M>,
}

impl<M: ?Sized> Clone for Layer<M> {
    fn clone(&self) -> Self {
        Layer {
            label: self.label.clone(),
            mount: self.mount.clone(),
        }
    }
}

/// A stack of mounts layered on top of each other.
///
/// # Precedence
///
/// Layers added later shadow layers added earlier. The optional writable
/// primary sits above every read-only layer and receives all modifications;
/// the read-only layers are never changed.
///
/// Directory listings are the union of every layer which has the directory.
/// Reads are served by the highest layer holding a file at that path.
#[derive(Debug, Clone, Default)]
pub struct OverlayMount {
    primary: Option<Layer<dyn WritableMount>>,
    layers: Vec<Layer<dyn Mount>>,
}

impl OverlayMount {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an overlay from read-only layers, lowest priority first.
    pub fn from_layers(layers: impl IntoIterator<Item = Arc<dyn Mount>>) -> Self {
        OverlayMount {
            primary: None,
            layers: layers
                .into_iter()
                .map(|mount| Layer { label: None, mount })
                .collect(),
        }
    }

    /// Add a read-only layer above all existing ones.
    pub fn with_layer(mut self, mount: Arc<dyn Mount>) -> Self {
        self.layers.push(Layer { label: None, mount });
        self
    }

    /// Add a read-only layer above all existing ones, reporting `label` for
    /// the paths it provides.
    pub fn with_labelled_layer(mut self, label: impl Into<String>, mount: Arc<dyn Mount>) -> Self {
        self.layers.push(Layer {
            label: Some(label.into()),
            mount,
        });
        self
    }

    /// Set the writable layer which shadows every read-only one.
    pub fn with_primary(mut self, label: impl Into<String>, mount: Arc<dyn WritableMount>) -> Self {
        self.primary = Some(Layer {
            label: Some(label.into()),
            mount,
        });
        self
    }

    pub fn primary(&self) -> Option<&Arc<dyn WritableMount>> {
        self.primary.as_ref().map(|layer| &layer.mount)
    }

    /// Every layer, highest priority first.
    fn candidates(&self) -> impl Iterator<Item = (Option<&str>, &dyn Mount)> {
        let primary = self
            .primary
            .iter()
            .map(|layer| (layer.label.as_deref(), &*layer.mount as &dyn Mount));
        let secondaries = self
            .layers
            .iter()
            .rev()
            .map(|layer| (layer.label.as_deref(), &*layer.mount));
        primary.chain(secondaries)
    }

    fn secondaries(&self) -> impl Iterator<Item = &dyn Mount> {
        self.layers.iter().rev().map(|layer| &*layer.mount)
    }

    /// The highest layer where `path` exists.
    fn provider(&self, path: &str) -> Result<Option<(Option<&str>, &dyn Mount)>> {
        for (label, mount) in self.candidates() {
            if mount.exists(path)? {
                return Ok(Some((label, mount)));
            }
        }
        Ok(None)
    }

    /// The highest layer holding a file (not a directory) at `path`.
    fn file_provider(&self, path: &str) -> Result<Option<&dyn Mount>> {
        for (_, mount) in self.candidates() {
            if mount.exists(path)? && !mount.is_directory(path)? {
                return Ok(Some(mount));
            }
        }
        Ok(None)
    }

    fn writable(&self) -> Result<&dyn WritableMount> {
        self.primary
            .as_ref()
            .map(|layer| &*layer.mount)
            .ok_or(FsError::AccessDenied)
    }

    fn exists_in_secondaries(&self, path: &str) -> Result<bool> {
        for mount in self.secondaries() {
            if mount.exists(path)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Copy a file from the read-only layers into the primary so it can be
    /// modified in place.
    fn copy_up(&self, primary: &dyn WritableMount, path: &str) -> Result<()> {
        let Some(source) = self.file_provider(path)? else {
            return Ok(());
        };
        tracing::trace!(path = %path, "Copying file into the writable layer");

        let parent = crate::path::get_directory(path);
        if !parent.is_empty() {
            primary.make_directory(&parent)?;
        }

        let mut reader = source.open_for_read(path)?;
        let mut writer = primary.open_for_write(path)?;
        io::copy(&mut reader, &mut writer)?;
        Ok(())
    }
}

impl Mount for OverlayMount {
    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.provider(path)?.is_some())
    }

    fn is_directory(&self, path: &str) -> Result<bool> {
        for (_, mount) in self.candidates() {
            if mount.is_directory(path)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn list(&self, path: &str) -> Result<BTreeSet<String>> {
        let mut entries = BTreeSet::new();
        let mut had_at_least_one_success = false;

        for (_, mount) in self.candidates() {
            if mount.is_directory(path)? {
                entries.extend(mount.list(path)?);
                had_at_least_one_success = true;
            }
        }

        if had_at_least_one_success {
            Ok(entries)
        } else {
            Err(FsError::NotADirectory)
        }
    }

    fn size(&self, path: &str) -> Result<u64> {
        if self.is_directory(path)? {
            return Ok(0);
        }
        match self.file_provider(path)? {
            Some(mount) => mount.size(path),
            None => Err(FsError::NoSuchFile),
        }
    }

    fn open_for_read(&self, path: &str) -> Result<Box<dyn VirtualFile>> {
        match self.file_provider(path)? {
            Some(mount) => mount.open_for_read(path),
            None if self.is_directory(path)? => Err(FsError::NotAFile),
            None => Err(FsError::NoSuchFile),
        }
    }

    fn attributes(&self, path: &str) -> Result<FileAttributes> {
        match self.provider(path)? {
            Some((_, mount)) => mount.attributes(path),
            None => Err(FsError::NoSuchFile),
        }
    }

    fn label_of(&self, path: &str) -> Option<String> {
        let (label, mount) = self.provider(path).ok()??;
        mount.label_of(path).or_else(|| label.map(str::to_string))
    }
}

impl WritableMount for OverlayMount {
    fn make_directory(&self, path: &str) -> Result<()> {
        let primary = self.writable()?;
        for mount in self.secondaries() {
            if mount.exists(path)? && !mount.is_directory(path)? {
                return Err(FsError::FileExists);
            }
        }
        primary.make_directory(path)
    }

    fn delete(&self, path: &str) -> Result<()> {
        let primary = self.writable()?;
        if primary.exists(path)? {
            // Anything in the read-only layers shows through again.
            primary.delete(path)
        } else if self.exists_in_secondaries(path)? {
            Err(FsError::AccessDenied)
        } else {
            Ok(())
        }
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let primary = self.writable()?;
        if self.exists_in_secondaries(from)? {
            return Err(FsError::AccessDenied);
        }
        if self.exists_in_secondaries(to)? {
            return Err(FsError::FileExists);
        }
        primary.rename(from, to)
    }

    fn open_file(&self, path: &str, conf: &OpenOptionsConfig) -> Result<Box<dyn VirtualFile>> {
        if !conf.write() && !conf.append() {
            return self.open_for_read(path);
        }

        let primary = self.writable()?;
        if !primary.exists(path)? {
            for mount in self.secondaries() {
                if mount.is_directory(path)? {
                    return Err(FsError::CannotWriteToDirectory);
                }
            }
            if conf.truncate() {
                let parent = crate::path::get_directory(path);
                if !parent.is_empty() {
                    primary.make_directory(&parent)?;
                }
            } else {
                self.copy_up(primary, path)?;
            }
        }

        primary.open_file(path, conf)
    }

    fn remaining_space(&self) -> Result<u64> {
        match &self.primary {
            Some(layer) => layer.mount.remaining_space(),
            None => Ok(0),
        }
    }

    fn capacity(&self) -> Option<u64> {
        self.primary.as_ref()?.mount.capacity()
    }

    fn is_read_only(&self, path: &str) -> Result<bool> {
        match &self.primary {
            Some(layer) => layer.mount.is_read_only(path),
            None => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use pretty_assertions::assert_eq;

    use super::*;

    fn read_to_string(mount: &dyn Mount, path: &str) -> String {
        let mut contents = String::new();
        mount
            .open_for_read(path)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        contents
    }

    fn layers() -> (Arc<MemoryMount>, Arc<MemoryMount>) {
        let low = MemoryMount::new();
        low.add_file("x", "low").unwrap();
        low.add_file("only_low.txt", "low").unwrap();
        low.add_file("lib/a.lua", "a").unwrap();

        let high = MemoryMount::new();
        high.add_file("x", "high").unwrap();
        high.add_file("only_high.txt", "high").unwrap();
        high.add_file("lib/b.lua", "b").unwrap();

        (Arc::new(low), Arc::new(high))
    }

    #[test]
    fn higher_layers_shadow_lower_ones() {
        let (low, high) = layers();
        let overlay = OverlayMount::from_layers([low as Arc<dyn Mount>, high as Arc<dyn Mount>]);

        assert_eq!(read_to_string(&overlay, "x"), "high");
        assert_eq!(read_to_string(&overlay, "only_low.txt"), "low");
        assert_eq!(overlay.size("x"), Ok(4));
    }

    #[test]
    fn listings_are_merged() {
        let (low, high) = layers();
        let overlay = OverlayMount::new()
            .with_layer(low)
            .with_layer(high);

        let expected: BTreeSet<String> = ["lib", "only_high.txt", "only_low.txt", "x"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(overlay.list(""), Ok(expected));

        let expected: BTreeSet<String> = ["a.lua", "b.lua"].into_iter().map(String::from).collect();
        assert_eq!(overlay.list("lib"), Ok(expected));
        assert_eq!(overlay.list("x"), Err(FsError::NotADirectory));
    }

    #[test]
    fn labels_follow_the_providing_layer() {
        let (low, high) = layers();
        let overlay = OverlayMount::new()
            .with_labelled_layer("rom", low)
            .with_labelled_layer("patch", high);

        assert_eq!(overlay.label_of("x").as_deref(), Some("patch"));
        assert_eq!(overlay.label_of("only_low.txt").as_deref(), Some("rom"));
        assert_eq!(overlay.label_of("missing"), None);
    }

    #[test]
    fn read_only_overlay_refuses_writes() {
        let (low, _) = layers();
        let overlay = OverlayMount::new().with_layer(low);

        assert_eq!(overlay.make_directory("dir"), Err(FsError::AccessDenied));
        assert!(matches!(
            overlay.open_for_write("new.txt"),
            Err(FsError::AccessDenied)
        ));
        assert_eq!(overlay.is_read_only("x"), Ok(true));
        assert_eq!(overlay.remaining_space(), Ok(0));
    }

    #[test]
    fn writes_go_to_the_primary() {
        let (low, _) = layers();
        let primary = Arc::new(MemoryMount::new());
        let overlay = OverlayMount::new()
            .with_labelled_layer("rom", low.clone())
            .with_primary("hdd", primary.clone());

        assert_eq!(overlay.label_of("x").as_deref(), Some("rom"));
        overlay
            .open_for_write("x")
            .unwrap()
            .write_all(b"mine")
            .unwrap();

        assert_eq!(read_to_string(&overlay, "x"), "mine");
        assert_eq!(read_to_string(&*low, "x"), "low");
        assert_eq!(overlay.label_of("x").as_deref(), Some("hdd"));

        assert_eq!(overlay.delete("only_low.txt"), Err(FsError::AccessDenied));
        assert_eq!(overlay.exists("only_low.txt"), Ok(true));
    }

    #[test]
    fn appending_copies_the_file_up() {
        let (low, _) = layers();
        let primary = Arc::new(MemoryMount::new());
        let overlay = OverlayMount::new()
            .with_layer(low)
            .with_primary("hdd", primary.clone());

        overlay
            .open_for_append("lib/a.lua")
            .unwrap()
            .write_all(b"bc")
            .unwrap();

        assert_eq!(read_to_string(&*primary, "lib/a.lua"), "abc");
        assert_eq!(read_to_string(&overlay, "lib/a.lua"), "abc");
    }
}
