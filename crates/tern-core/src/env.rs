//! Filesystem capability set.
//!
//! The storage engine never touches `std::fs` directly; every file operation
//! goes through an [`Env`]. [`DiskEnv`] is the real implementation, tests can
//! wrap it to inject failures.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

/// A sequentially written file.
pub trait WritableFile: Write + Send + Sync {
    /// Flushes buffered bytes and makes them durable.
    fn sync(&mut self) -> io::Result<()>;
}

pub trait Env: Send + Sync + 'static {
    /// Creates (or truncates) a file for writing.
    fn new_writable_file(&self, path: &Path) -> io::Result<Box<dyn WritableFile>>;

    fn read_all(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Lists the file names (not paths) in `dir`.
    fn list_dir(&self, dir: &Path) -> io::Result<Vec<String>>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn create_dir_all(&self, dir: &Path) -> io::Result<()>;

    fn file_exists(&self, path: &Path) -> bool;

    fn file_size(&self, path: &Path) -> io::Result<u64>;

    /// Persists directory entries (creations, renames, unlinks).
    fn sync_dir(&self, dir: &Path) -> io::Result<()>;
}

/// [`Env`] backed by the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskEnv;

struct DiskFile {
    inner: BufWriter<File>,
}

impl Write for DiskFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl WritableFile for DiskFile {
    fn sync(&mut self) -> io::Result<()> {
        self.inner.flush()?;
        self.inner.get_ref().sync_data()
    }
}

impl Env for DiskEnv {
    fn new_writable_file(&self, path: &Path) -> io::Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(DiskFile {
            inner: BufWriter::new(file),
        }))
    }

    fn read_all(&self, path: &Path) -> io::Result<Vec<u8>> {
        let mut file = File::open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn list_dir(&self, dir: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        tracing::trace!(path = %path.display(), "remove file");
        fs::remove_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        tracing::trace!(from = %from.display(), to = %to.display(), "rename file");
        fs::rename(from, to)
    }

    fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        fs::create_dir_all(dir)
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    #[cfg(unix)]
    fn sync_dir(&self, dir: &Path) -> io::Result<()> {
        File::open(dir)?.sync_all()
    }

    #[cfg(not(unix))]
    fn sync_dir(&self, _dir: &Path) -> io::Result<()> {
        Ok(())
    }
}
