//! Block data sources for the tree encoder
//!
//! A `DataReader` hands out exact byte ranges. Besides `read` it has two
//! explicit lifecycle calls: `pause`, after which the reader may drop open
//! handles until the next read, and `close`, after which no further reads
//! happen.

use bytes::Bytes;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::trace;

pub trait DataReader: Send {
    /// Fill `buf` completely with the bytes starting at `offset`
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Release resources; reads may resume later
    fn pause(&mut self) {}

    /// No further reads will happen
    fn close(&mut self) {}

    /// Whole contents, for readers that can be persisted by value
    fn snapshot(&self) -> Option<Bytes> {
        None
    }

    /// Backing file, for readers that can be persisted by name
    fn path(&self) -> Option<&Path> {
        None
    }
}

/// Reads from a file on disk, opening it lazily
pub struct FileReader {
    path: PathBuf,
    file: Option<File>,
}

impl FileReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }
}

impl DataReader for FileReader {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                trace!(path = %self.path.display(), "Opening file for reading");
                File::open(&self.path)?
            }
        };
        let file = self.file.insert(file);
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!(
                    "could not read {} bytes at offset {} from `{}': {}",
                    buf.len(),
                    offset,
                    self.path.display(),
                    e
                ),
            )
        })
    }

    fn pause(&mut self) {
        self.file = None;
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// Reads from an in-memory buffer
pub struct MemoryReader {
    data: Bytes,
}

impl MemoryReader {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

impl DataReader for MemoryReader {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::UnexpectedEof, "offset out of range"))?;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("read of {} bytes at {} past end of data", buf.len(), offset),
                )
            })?;
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn snapshot(&self) -> Option<Bytes> {
        Some(self.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_memory_reader() {
        let mut reader = MemoryReader::new(b"hello world".to_vec());
        let mut buf = [0u8; 5];
        reader.read(6, &mut buf).unwrap();
        assert_eq!(&buf, b"world");
        assert!(reader.read(7, &mut buf).is_err());
        assert_eq!(reader.snapshot().unwrap().len(), 11);
    }

    #[test]
    fn test_file_reader_reopens_after_pause() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();
        let mut reader = FileReader::new(tmp.path());
        let mut buf = [0u8; 3];
        reader.read(2, &mut buf).unwrap();
        assert_eq!(&buf, b"234");
        reader.pause();
        reader.read(7, &mut buf).unwrap();
        assert_eq!(&buf, b"789");
        let mut big = [0u8; 4];
        assert!(reader.read(8, &mut big).is_err());
        reader.close();
        assert_eq!(reader.path(), Some(tmp.path()));
    }

    #[test]
    fn test_empty_read_does_not_open_file() {
        let mut reader = FileReader::new("/nonexistent/file");
        assert!(reader.read(0, &mut []).is_ok());
        assert!(reader.read(0, &mut [0u8; 1]).is_err());
    }
}
