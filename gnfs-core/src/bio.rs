//! Typed binary I/O for persisted state files
//!
//! Files start with a format version, followed by big-endian fields.
//! Strings and metadata are length-prefixed where a zero prefix means
//! "absent". Writes go to a temporary file that is renamed into place, so a
//! reader never sees a half-written file.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::crypto::{HashCode, HASH_SIZE};
use crate::metadata::{MetaData, MetaError};
use crate::uri::{Uri, UriError};

/// Version written at the start of every state file
pub const FORMAT_VERSION: u32 = 1;

/// Limit for metadata blobs read back from disk
const MAX_META_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum BioError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected end of file while reading {0}")]
    Truncated(&'static str),

    #[error("Field {what} is too long ({len} bytes)")]
    TooLong { what: &'static str, len: usize },

    #[error("Field {0} is not valid UTF-8")]
    Utf8(&'static str),

    #[error("Unsupported state file version {0}")]
    Version(u32),

    #[error("Invalid value for {what}: {reason}")]
    Invalid { what: &'static str, reason: String },

    #[error("Metadata error: {0}")]
    Meta(#[from] MetaError),

    #[error("URI error: {0}")]
    Uri(#[from] UriError),
}

pub type Result<T> = std::result::Result<T, BioError>;

/// Buffered writer committed atomically by `close`
pub struct WriteHandle {
    path: PathBuf,
    buf: BytesMut,
}

impl WriteHandle {
    pub fn create(path: impl Into<PathBuf>) -> Self {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_u32(FORMAT_VERSION);
        Self {
            path: path.into(),
            buf,
        }
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64(v);
        self
    }

    pub fn write_bool(&mut self, v: bool) -> &mut Self {
        self.write_u8(v as u8)
    }

    pub fn write_blob(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_slice(data);
        self
    }

    pub fn write_hash(&mut self, hash: &HashCode) -> &mut Self {
        self.write_blob(hash.as_bytes())
    }

    pub fn write_string(&mut self, s: Option<&str>) -> &mut Self {
        match s {
            None => self.write_u32(0),
            Some(s) => {
                self.buf.put_u32(s.len() as u32 + 1);
                self.buf.put_slice(s.as_bytes());
                self
            }
        }
    }

    pub fn write_uri(&mut self, uri: Option<&Uri>) -> &mut Self {
        let s = uri.map(|u| u.to_string());
        self.write_string(s.as_deref())
    }

    pub fn write_meta(&mut self, meta: Option<&MetaData>) -> &mut Self {
        match meta {
            None => self.write_u32(0),
            Some(meta) => {
                let bytes = meta.serialize();
                self.buf.put_u32(bytes.len() as u32);
                self.buf.put_slice(&bytes);
                self
            }
        }
    }

    /// Length-prefixed byte blob
    pub fn write_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_u64(data.len() as u64);
        self.buf.put_slice(data);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close(self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        std::fs::write(&tmp, &self.buf)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Reader over a whole state file held in memory
pub struct ReadHandle {
    data: Bytes,
}

impl ReadHandle {
    pub fn open(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::from_bytes(Bytes::from(data))
    }

    pub fn from_bytes(data: Bytes) -> Result<Self> {
        let mut handle = Self { data };
        let version = handle.read_u32("version")?;
        if version != FORMAT_VERSION {
            return Err(BioError::Version(version));
        }
        Ok(handle)
    }

    fn need(&self, n: usize, what: &'static str) -> Result<()> {
        if self.data.remaining() < n {
            return Err(BioError::Truncated(what));
        }
        Ok(())
    }

    pub fn read_u8(&mut self, what: &'static str) -> Result<u8> {
        self.need(1, what)?;
        Ok(self.data.get_u8())
    }

    pub fn read_u32(&mut self, what: &'static str) -> Result<u32> {
        self.need(4, what)?;
        Ok(self.data.get_u32())
    }

    pub fn read_u64(&mut self, what: &'static str) -> Result<u64> {
        self.need(8, what)?;
        Ok(self.data.get_u64())
    }

    pub fn read_bool(&mut self, what: &'static str) -> Result<bool> {
        match self.read_u8(what)? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(BioError::Invalid {
                what,
                reason: format!("{} is not a boolean", v),
            }),
        }
    }

    pub fn read_blob(&mut self, what: &'static str, len: usize) -> Result<Bytes> {
        self.need(len, what)?;
        Ok(self.data.split_to(len))
    }

    pub fn read_hash(&mut self, what: &'static str) -> Result<HashCode> {
        let blob = self.read_blob(what, HASH_SIZE)?;
        HashCode::from_slice(&blob).ok_or(BioError::Truncated(what))
    }

    pub fn read_string(&mut self, what: &'static str, max_len: usize) -> Result<Option<String>> {
        let len = self.read_u32(what)? as usize;
        if len == 0 {
            return Ok(None);
        }
        let len = len - 1;
        if len > max_len {
            return Err(BioError::TooLong { what, len });
        }
        let blob = self.read_blob(what, len)?;
        String::from_utf8(blob.to_vec())
            .map(Some)
            .map_err(|_| BioError::Utf8(what))
    }

    pub fn read_uri(&mut self, what: &'static str) -> Result<Option<Uri>> {
        match self.read_string(what, 10 * 1024)? {
            None => Ok(None),
            Some(s) => Ok(Some(Uri::parse(&s)?)),
        }
    }

    pub fn read_meta(&mut self, what: &'static str) -> Result<Option<MetaData>> {
        let len = self.read_u32(what)? as usize;
        if len == 0 {
            return Ok(None);
        }
        if len > MAX_META_SIZE {
            return Err(BioError::TooLong { what, len });
        }
        let blob = self.read_blob(what, len)?;
        Ok(Some(MetaData::deserialize(&blob)?))
    }

    pub fn read_bytes(&mut self, what: &'static str, max_len: u64) -> Result<Bytes> {
        let len = self.read_u64(what)?;
        if len > max_len {
            return Err(BioError::TooLong {
                what,
                len: len as usize,
            });
        }
        self.read_blob(what, len as usize)
    }

    pub fn remaining(&self) -> usize {
        self.data.remaining()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetaType;

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state");
        let mut meta = MetaData::new();
        meta.insert_str(MetaType::Title, "t");
        let uri = Uri::ksk_from_args(&["a", "+b"]);

        let mut wh = WriteHandle::create(&path);
        wh.write_u32(7)
            .write_u64(u64::MAX)
            .write_bool(true)
            .write_string(Some("hello"))
            .write_string(None)
            .write_string(Some(""))
            .write_meta(Some(&meta))
            .write_meta(None)
            .write_uri(Some(&uri))
            .write_hash(&HashCode::digest(b"x"))
            .write_bytes(b"blob");
        wh.close().unwrap();

        let mut rh = ReadHandle::open(&path).unwrap();
        assert_eq!(rh.read_u32("a").unwrap(), 7);
        assert_eq!(rh.read_u64("b").unwrap(), u64::MAX);
        assert!(rh.read_bool("c").unwrap());
        assert_eq!(rh.read_string("d", 100).unwrap().as_deref(), Some("hello"));
        assert_eq!(rh.read_string("e", 100).unwrap(), None);
        assert_eq!(rh.read_string("f", 100).unwrap().as_deref(), Some(""));
        assert_eq!(rh.read_meta("g").unwrap(), Some(meta));
        assert_eq!(rh.read_meta("h").unwrap(), None);
        assert_eq!(rh.read_uri("i").unwrap(), Some(uri));
        assert_eq!(rh.read_hash("j").unwrap(), HashCode::digest(b"x"));
        assert_eq!(&rh.read_bytes("k", 10).unwrap()[..], b"blob");
        assert_eq!(rh.remaining(), 0);
        assert!(matches!(rh.read_u8("l"), Err(BioError::Truncated("l"))));
    }

    #[test]
    fn test_limits_and_version() {
        let mut wh = WriteHandle::create("/unused");
        wh.write_string(Some("too long for the limit"));
        let mut rh = ReadHandle::from_bytes(Bytes::from(wh.buf.to_vec())).unwrap();
        assert!(matches!(
            rh.read_string("s", 4),
            Err(BioError::TooLong { what: "s", .. })
        ));

        let mut bad = BytesMut::new();
        bad.put_u32(99);
        assert!(matches!(
            ReadHandle::from_bytes(bad.freeze()),
            Err(BioError::Version(99))
        ));
    }
}
