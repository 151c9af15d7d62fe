//! Temporary file provider for sorted runs and read-ends spills.
//!
//! Files live in one scratch directory removed when the provider is dropped. Files are
//! append-only: a released file goes back on the free list and the next holder appends after
//! the existing content, so the [`Segment`]s already handed out stay valid.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::debug;
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::errors::{IoContext, Result};

/// An exclusively held temporary file.
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
    file: File,
    len: u64,
}

impl TempFile {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far; the offset of the next append.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `data`.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data).with_path(&self.path)?;
        self.len += data.len() as u64;
        Ok(())
    }

    /// Segment covering bytes `[offset, offset + len)`.
    #[must_use]
    pub fn segment(&self, offset: u64, len: u64) -> Segment {
        Segment { path: self.path.clone(), offset, len }
    }

    /// Flush and hand out an independent writer positioned at the end of the file.
    pub fn writer(&self) -> Result<File> {
        let mut file = self.file.try_clone().with_path(&self.path)?;
        file.seek(SeekFrom::End(0)).with_path(&self.path)?;
        Ok(file)
    }

    /// Account for bytes appended through a [`TempFile::writer`].
    pub fn record_external_append(&mut self, bytes: u64) {
        self.len += bytes;
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush().with_path(&self.path)
    }
}

/// A byte range of a temporary file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub path: PathBuf,
    pub offset: u64,
    pub len: u64,
}

impl Segment {
    /// Open a buffered reader over the segment.
    pub fn open(&self) -> Result<impl Read + Send + 'static> {
        let mut file = File::open(&self.path).with_path(&self.path)?;
        file.seek(SeekFrom::Start(self.offset)).with_path(&self.path)?;
        Ok(BufReader::with_capacity(64 * 1024, file.take(self.len)))
    }

    /// Read the whole segment into memory.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.len as usize);
        self.open()?.read_to_end(&mut out).with_path(&self.path)?;
        Ok(out)
    }
}

/// Hands out and takes back temporary files.
pub struct TempFileProvider {
    dir: TempDir,
    free: Mutex<Vec<TempFile>>,
    created: Mutex<usize>,
}

impl TempFileProvider {
    /// Create the scratch directory inside `parent`, or the system temp directory.
    pub fn new(parent: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("bamflow-");
        let dir = match parent {
            Some(p) => builder.tempdir_in(p).with_path(p)?,
            None => builder.tempdir().with_path(std::env::temp_dir())?,
        };
        debug!("Using temporary directory {}", dir.path().display());
        Ok(Self { dir, free: Mutex::new(Vec::new()), created: Mutex::new(0) })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Take a free file, creating one when none is free.
    pub fn acquire(&self) -> Result<TempFile> {
        if let Some(file) = self.free.lock().pop() {
            return Ok(file);
        }
        let index = {
            let mut created = self.created.lock();
            *created += 1;
            *created
        };
        let path = self.dir.path().join(format!("part-{index:05}.tmp"));
        let file = File::options()
            .create_new(true)
            .read(true)
            .append(true)
            .open(&path)
            .with_path(&path)?;
        Ok(TempFile { path, file, len: 0 })
    }

    /// Return a file; its content is kept.
    pub fn release(&self, mut file: TempFile) -> Result<()> {
        file.flush()?;
        self.free.lock().push(file);
        Ok(())
    }

    /// Number of files created so far.
    #[must_use]
    pub fn files_created(&self) -> usize {
        *self.created.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_release_and_reuse() {
        let provider = TempFileProvider::new(None).unwrap();
        let mut first = provider.acquire().unwrap();
        first.append(b"hello").unwrap();
        let hello = first.segment(0, first.len());
        provider.release(first).unwrap();

        let mut again = provider.acquire().unwrap();
        assert_eq!(again.len(), 5, "released file is reused, not truncated");
        let offset = again.len();
        again.append(b" world").unwrap();
        let world = again.segment(offset, 6);
        provider.release(again).unwrap();

        assert_eq!(provider.files_created(), 1);
        assert_eq!(hello.read_all().unwrap(), b"hello");
        assert_eq!(world.read_all().unwrap(), b" world");
    }

    #[test]
    fn test_distinct_files_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let provider = TempFileProvider::new(Some(dir.path())).unwrap();
        let a = provider.acquire().unwrap();
        let b = provider.acquire().unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.path().starts_with(dir.path()));
    }

    #[test]
    fn test_writer_appends_at_end() {
        let provider = TempFileProvider::new(None).unwrap();
        let mut file = provider.acquire().unwrap();
        file.append(b"ab").unwrap();
        let mut writer = file.writer().unwrap();
        writer.write_all(b"cd").unwrap();
        writer.flush().unwrap();
        file.record_external_append(2);
        assert_eq!(file.segment(0, file.len()).read_all().unwrap(), b"abcd");
    }
}
