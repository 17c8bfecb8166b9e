use std::collections::BTreeSet;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use pretty_assertions::assert_eq;
use sandbox_fs::*;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

fn archive(files: &[(&str, &str)]) -> ArchiveMount {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, contents) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    ArchiveMount::from_bytes(writer.finish().unwrap().into_inner()).unwrap()
}

fn read(fs: &FileSystem, path: &str) -> String {
    let mut file = fs.open(path, "r").unwrap();
    let mut contents = String::new();
    file.read_to_string(&mut contents).unwrap();
    file.close().unwrap();
    contents
}

/// A read-only mount whose channels record when they are released.
#[derive(Debug, Default)]
struct TrackingMount {
    closed: Arc<AtomicBool>,
}

#[derive(Debug)]
struct TrackingFile {
    contents: Cursor<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

impl Drop for TrackingFile {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Read for TrackingFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.contents.read(buf)
    }
}

impl Write for TrackingFile {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(FsError::AccessDenied.into_io())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for TrackingFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.contents.seek(pos)
    }
}

impl VirtualFile for TrackingFile {
    fn size(&self) -> io::Result<u64> {
        Ok(self.contents.get_ref().len() as u64)
    }
}

impl Mount for TrackingMount {
    fn exists(&self, path: &str) -> Result<bool> {
        Ok(path.is_empty() || path == "tracked")
    }

    fn is_directory(&self, path: &str) -> Result<bool> {
        Ok(path.is_empty())
    }

    fn list(&self, path: &str) -> Result<BTreeSet<String>> {
        match path {
            "" => Ok(BTreeSet::from(["tracked".to_string()])),
            _ => Err(FsError::NotADirectory),
        }
    }

    fn size(&self, path: &str) -> Result<u64> {
        match path {
            "tracked" => Ok(7),
            "" => Ok(0),
            _ => Err(FsError::NoSuchFile),
        }
    }

    fn open_for_read(&self, path: &str) -> Result<Box<dyn VirtualFile>> {
        if path != "tracked" {
            return Err(FsError::NoSuchFile);
        }
        self.closed.store(false, Ordering::SeqCst);
        Ok(Box::new(TrackingFile {
            contents: Cursor::new(b"tracked".to_vec()),
            closed: self.closed.clone(),
        }))
    }

    fn attributes(&self, path: &str) -> Result<FileAttributes> {
        match path {
            "" => Ok(FileAttributes::directory()),
            _ => Ok(FileAttributes::file(self.size(path)?)),
        }
    }
}

#[test]
fn longest_prefix_wins() {
    let fs = FileSystem::new("hdd", MountBackend::writable(MemoryMount::new()));
    let outer = Arc::new(MemoryMount::new());
    let inner = Arc::new(MemoryMount::new());
    fs.mount("outer", "a", MountBackend::Writable(outer.clone()))
        .unwrap();
    fs.mount("inner", "a/b", MountBackend::Writable(inner.clone()))
        .unwrap();

    assert_eq!(fs.get_mount_label("a/b/c").unwrap(), "inner");
    assert_eq!(fs.get_mount_label("a/bc").unwrap(), "outer");

    let mut file = fs.open("a/b/c", "w").unwrap();
    file.write_all(b"deep").unwrap();
    file.close().unwrap();

    assert_eq!(inner.exists("c"), Ok(true));
    assert_eq!(outer.exists("b/c"), Ok(false));
    assert_eq!(fs.list("a").unwrap(), vec!["b"]);
}

#[test]
fn quota_is_conserved() {
    let temp = TempDir::new().unwrap();
    let fs = FileSystem::new("hdd", MountBackend::writable(RealDirectoryMount::new(temp.path(), 1_000)));
    assert_eq!(fs.capacity("/"), Ok(Some(1_000)));

    let mut file = fs.open("big.bin", "wb").unwrap();
    let before = fs.free_space("/").unwrap();

    let err = file.write(&[0; 1_001]).unwrap_err();
    assert_eq!(FsError::from(err), FsError::OutOfSpace);
    assert_eq!(fs.free_space("/").unwrap(), before);

    file.write_all(&[0; 1_000]).unwrap();
    file.close().unwrap();
    assert_eq!(fs.size("big.bin"), Ok(1_000));
    assert_eq!(fs.free_space("/"), Ok(FreeSpace::Bytes(0)));

    fs.delete("big.bin").unwrap();
    assert_eq!(fs.free_space("/"), Ok(FreeSpace::Bytes(1_000)));
}

#[test]
fn overlay_prefers_the_highest_layer() {
    let low: Arc<dyn Mount> = Arc::new(archive(&[("x", "low"), ("only-low.txt", "")]));
    let high: Arc<dyn Mount> = Arc::new(archive(&[("x", "high"), ("only-high.txt", "")]));

    let fs = FileSystem::new(
        "rom",
        MountBackend::read_only(OverlayMount::from_layers([low, high])),
    );

    assert_eq!(read(&fs, "x"), "high");
    assert_eq!(fs.list("/").unwrap(), vec!["only-high.txt", "only-low.txt", "x"]);
}

#[test]
fn handle_ceiling_leaves_nothing_behind() {
    let temp = TempDir::new().unwrap();
    let fs = FileSystem::with_config(
        "hdd",
        MountBackend::writable(RealDirectoryMount::new(temp.path(), 10_000)),
        FileSystemConfig {
            maximum_files_open: 2,
            ..Default::default()
        },
    );

    let a = fs.open("a.txt", "w").unwrap();
    let b = fs.open("b.txt", "w").unwrap();
    let before = fs.free_space("/").unwrap();

    let err = fs.open("c.txt", "w").unwrap_err();
    assert_eq!(err.kind(), &FsError::TooManyOpenFiles);
    assert_eq!(fs.exists("c.txt"), Ok(false));
    assert_eq!(fs.free_space("/").unwrap(), before);
    assert_eq!(fs.open_handle_count(), 2);

    a.close().unwrap();
    let c = fs.open("c.txt", "w").unwrap();
    c.close().unwrap();
    b.close().unwrap();
    assert_eq!(fs.open_handle_count(), 0);
}

#[test]
#[tracing_test::traced_test]
fn dropped_handles_are_reclaimed() {
    let tracked = Arc::new(TrackingMount::default());
    let fs = FileSystem::new("tracked", MountBackend::ReadOnly(tracked.clone()));

    let mut handle = fs.open("tracked", "r").unwrap();
    let mut contents = String::new();
    handle.read_to_string(&mut contents).unwrap();
    assert_eq!(contents, "tracked");
    assert!(!tracked.closed.load(Ordering::SeqCst));

    drop(handle);
    assert!(tracked.closed.load(Ordering::SeqCst));

    fs.sweep();
    assert_eq!(fs.open_handle_count(), 0);
    assert_eq!(fs.leaked_handles(), 1);
    assert!(logs_contain("opened but never closed"));

    // Explicitly closed handles are not leaks.
    fs.open("tracked", "r").unwrap().close().unwrap();
    assert_eq!(fs.leaked_handles(), 1);
}

#[test]
fn unmounting_closes_open_files() {
    let tracked = Arc::new(TrackingMount::default());
    let fs = FileSystem::new("hdd", MountBackend::writable(MemoryMount::new()));
    fs.mount("tracked", "tracked", MountBackend::ReadOnly(tracked.clone()))
        .unwrap();

    let mut handle = fs.open("tracked/tracked", "r").unwrap();
    fs.unmount("tracked");

    assert!(handle.is_closed());
    assert!(tracked.closed.load(Ordering::SeqCst));
    assert_eq!(fs.open_handle_count(), 0);

    let mut buf = [0; 4];
    assert!(handle.read(&mut buf).is_err());
    assert_eq!(handle.close(), Err(FsError::ClosedExternally));
    assert_eq!(fs.leaked_handles(), 0);
}

#[test]
fn moving_into_itself_fails() {
    let fs = FileSystem::new("hdd", MountBackend::writable(MemoryMount::new()));
    fs.make_directory("a").unwrap();
    let mut file = fs.open("a/file.txt", "w").unwrap();
    file.write_all(b"keep").unwrap();
    file.close().unwrap();

    let err = fs.move_path("/a", "/a/b").unwrap_err();
    assert_eq!(err.kind(), &FsError::RecursiveOperation);
    assert_eq!(fs.list("a").unwrap(), vec!["file.txt"]);
    assert_eq!(read(&fs, "a/file.txt"), "keep");
}

#[test]
fn writable_layer_shadows_the_rom() {
    let temp = TempDir::new().unwrap();
    let rom: Arc<dyn Mount> = Arc::new(archive(&[("startup.lua", "print('rom')")]));
    let hdd: Arc<dyn WritableMount> = Arc::new(RealDirectoryMount::new(temp.path(), 1_000_000));

    let overlay = OverlayMount::new()
        .with_labelled_layer("rom", rom)
        .with_primary("hdd", hdd);
    let fs = FileSystem::new("hdd", MountBackend::writable(overlay));

    assert_eq!(fs.exists("/startup.lua"), Ok(true));
    assert_eq!(fs.get_mount_label("/startup.lua").unwrap(), "rom");
    assert_eq!(read(&fs, "startup.lua"), "print('rom')");

    let mut file = fs.open("/startup.lua", "w").unwrap();
    file.write_all(b"print('hdd')").unwrap();
    file.close().unwrap();

    assert_eq!(fs.get_mount_label("/startup.lua").unwrap(), "hdd");
    assert_eq!(read(&fs, "startup.lua"), "print('hdd')");
    assert!(temp.path().join("startup.lua").is_file());
}

#[test]
fn overwriting_a_nested_rom_file() {
    let rom = MemoryMount::new();
    rom.add_file("lib/a.lua", "-- rom").unwrap();
    let hdd = Arc::new(MemoryMount::new());

    let overlay = OverlayMount::new()
        .with_labelled_layer("rom", Arc::new(rom))
        .with_primary("hdd", hdd.clone());
    let fs = FileSystem::new("hdd", MountBackend::writable(overlay));

    for mode in ["w", "w+"] {
        let mut file = fs.open("lib/a.lua", mode).unwrap();
        file.write_all(mode.as_bytes()).unwrap();
        file.close().unwrap();
        assert_eq!(read(&fs, "lib/a.lua"), mode);
    }

    assert_eq!(fs.get_mount_label("lib/a.lua").unwrap(), "hdd");
    assert_eq!(hdd.is_directory("lib"), Ok(true));

    // Appending copies the rom contents up first.
    let rom = MemoryMount::new();
    rom.add_file("deep/er/b.lua", "-- rom").unwrap();
    let overlay = OverlayMount::new()
        .with_labelled_layer("rom", Arc::new(rom))
        .with_primary("hdd", Arc::new(MemoryMount::new()));
    let fs = FileSystem::new("hdd", MountBackend::writable(overlay));

    let mut file = fs.open("deep/er/b.lua", "a").unwrap();
    file.write_all(b"!").unwrap();
    file.close().unwrap();
    assert_eq!(read(&fs, "deep/er/b.lua"), "-- rom!");
}

#[test]
fn concurrent_writers_share_one_quota() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<FileSystem>();

    const CAPACITY: u64 = 6_000;
    let temp = TempDir::new().unwrap();
    let fs = Arc::new(FileSystem::new(
        "hdd",
        MountBackend::writable(RealDirectoryMount::new(temp.path(), CAPACITY)),
    ));

    let sizes: Vec<usize> = (0..8).map(|i| 100 + i * 150).collect();
    let threads: Vec<_> = sizes
        .iter()
        .enumerate()
        .map(|(i, &size)| {
            let fs = Arc::clone(&fs);
            std::thread::spawn(move || {
                let mut file = fs.open(&format!("file{i}.bin"), "wb").unwrap();
                for chunk in vec![i as u8; size].chunks(64) {
                    file.write_all(chunk).unwrap();
                    assert!(matches!(fs.free_space("/").unwrap(), FreeSpace::Bytes(_)));
                }
                file.close().unwrap();
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    let charged: u64 = sizes
        .iter()
        .map(|&size| (size as u64).max(MINIMUM_FILE_SIZE))
        .sum();
    assert!(charged <= CAPACITY);
    assert_eq!(fs.free_space("/"), Ok(FreeSpace::Bytes(CAPACITY - charged)));
    assert_eq!(fs.open_handle_count(), 0);

    for (i, &size) in sizes.iter().enumerate() {
        assert_eq!(fs.size(&format!("file{i}.bin")), Ok(size as u64));
    }
}

#[test]
fn written_bytes_read_back() {
    let temp = TempDir::new().unwrap();
    let fs = FileSystem::new("hdd", MountBackend::writable(RealDirectoryMount::new(temp.path(), 1_000_000)));

    let mut file = fs.open("/out.txt", "w").unwrap();
    file.write_all(b"0123456789").unwrap();
    file.close().unwrap();

    assert_eq!(read(&fs, "/out.txt"), "0123456789");
    assert_eq!(fs.size("out.txt"), Ok(10));
}

#[test]
fn copying_between_backends() {
    let temp = TempDir::new().unwrap();
    let fs = FileSystem::new("hdd", MountBackend::writable(RealDirectoryMount::new(temp.path(), 1_000_000)));
    fs.mount(
        "rom",
        "rom",
        MountBackend::read_only(archive(&[
            ("programs/hello.lua", "print('hello')"),
            ("programs/fun/worm.lua", "-- worm"),
        ])),
    )
    .unwrap();

    fs.copy_path("rom/programs", "programs").unwrap();

    assert_eq!(read(&fs, "programs/fun/worm.lua"), "-- worm");
    assert!(temp.path().join("programs/hello.lua").is_file());
    assert_eq!(fs.is_read_only("programs/hello.lua"), Ok(false));
    assert_eq!(fs.is_read_only("rom/programs/hello.lua"), Ok(true));
}

#[test]
fn closing_the_filesystem_closes_every_handle() {
    let fs = FileSystem::new("hdd", MountBackend::writable(MemoryMount::new()));
    let handles: Vec<_> = (0..4)
        .map(|i| fs.open(&format!("file{i}.txt"), "w").unwrap())
        .collect();
    assert_eq!(fs.open_handle_count(), 4);

    fs.close();
    assert!(handles.iter().all(FileHandle::is_closed));
    assert_eq!(fs.open_handle_count(), 0);
}
