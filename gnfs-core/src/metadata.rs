//! File metadata as a typed multimap
//!
//! Items carry a type, a format, the name of the plugin that produced them,
//! an optional MIME type and raw bytes. The binary form is big-endian and
//! length-prefixed; parsing never panics on truncated or hostile input.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// MIME type marking a directory
pub const DIRECTORY_MIME: &str = "application/gnunet-directory";

/// Extension used for directories saved to disk
pub const DIRECTORY_EXT: &str = ".gnd";

const FORMAT_VERSION: u8 = 1;

/// Upper bound on items accepted when parsing
const MAX_ITEMS: u32 = 1 << 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetaError {
    #[error("Metadata truncated at byte {0}")]
    Truncated(usize),

    #[error("Unsupported metadata version {0}")]
    Version(u8),

    #[error("Metadata item is not valid UTF-8")]
    Utf8,

    #[error("Too many metadata items: {0}")]
    TooMany(u32),
}

pub type Result<T> = std::result::Result<T, MetaError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetaType {
    Mimetype,
    Filename,
    Comment,
    Title,
    Author,
    Publisher,
    Description,
    Keywords,
    Subject,
    Thumbnail,
    Language,
    /// Name of the file as it was published
    OriginalFilename,
    /// Complete file contents, for small files
    FullData,
    Other(u32),
}

impl MetaType {
    pub fn code(self) -> u32 {
        match self {
            MetaType::Mimetype => 1,
            MetaType::Filename => 2,
            MetaType::Comment => 3,
            MetaType::Title => 4,
            MetaType::Author => 5,
            MetaType::Publisher => 6,
            MetaType::Description => 7,
            MetaType::Keywords => 8,
            MetaType::Subject => 9,
            MetaType::Thumbnail => 10,
            MetaType::Language => 11,
            MetaType::OriginalFilename => 180,
            MetaType::FullData => 181,
            MetaType::Other(code) => code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            1 => MetaType::Mimetype,
            2 => MetaType::Filename,
            3 => MetaType::Comment,
            4 => MetaType::Title,
            5 => MetaType::Author,
            6 => MetaType::Publisher,
            7 => MetaType::Description,
            8 => MetaType::Keywords,
            9 => MetaType::Subject,
            10 => MetaType::Thumbnail,
            11 => MetaType::Language,
            180 => MetaType::OriginalFilename,
            181 => MetaType::FullData,
            other => MetaType::Other(other),
        }
    }

    /// Whether values of this type make sensible search keywords
    pub fn is_keyword_source(self) -> bool {
        !matches!(
            self,
            MetaType::Mimetype
                | MetaType::Thumbnail
                | MetaType::FullData
                | MetaType::Language
                | MetaType::Other(_)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetaFormat {
    Utf8,
    CString,
    Binary,
}

impl MetaFormat {
    fn code(self) -> u32 {
        match self {
            MetaFormat::Utf8 => 1,
            MetaFormat::CString => 2,
            MetaFormat::Binary => 3,
        }
    }

    fn from_code(code: u32) -> Self {
        match code {
            1 => MetaFormat::Utf8,
            2 => MetaFormat::CString,
            _ => MetaFormat::Binary,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaItem {
    pub plugin_name: String,
    pub meta_type: MetaType,
    pub format: MetaFormat,
    pub mime_type: Option<String>,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetaData {
    items: Vec<MetaItem>,
}

impl MetaData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetaItem> {
        self.items.iter()
    }

    /// Add an item; returns false if an identical (type, data) pair exists
    pub fn insert(
        &mut self,
        plugin_name: &str,
        meta_type: MetaType,
        format: MetaFormat,
        mime_type: Option<&str>,
        data: &[u8],
    ) -> bool {
        if self
            .items
            .iter()
            .any(|i| i.meta_type == meta_type && i.data == data)
        {
            return false;
        }
        self.items.push(MetaItem {
            plugin_name: plugin_name.to_string(),
            meta_type,
            format,
            mime_type: mime_type.map(str::to_string),
            data: data.to_vec(),
        });
        true
    }

    pub fn insert_str(&mut self, meta_type: MetaType, value: &str) -> bool {
        self.insert(
            "<gnfs>",
            meta_type,
            MetaFormat::Utf8,
            Some("text/plain"),
            value.as_bytes(),
        )
    }

    /// Remove items of `meta_type`, or only those with `data` if given
    pub fn delete(&mut self, meta_type: MetaType, data: Option<&[u8]>) -> usize {
        let before = self.items.len();
        self.items
            .retain(|i| !(i.meta_type == meta_type && data.map_or(true, |d| d == i.data)));
        before - self.items.len()
    }

    pub fn merge(&mut self, other: &MetaData) {
        for item in &other.items {
            self.insert(
                &item.plugin_name,
                item.meta_type,
                item.format,
                item.mime_type.as_deref(),
                &item.data,
            );
        }
    }

    /// First textual value among `types`, in the order given
    pub fn get_first_by_types(&self, types: &[MetaType]) -> Option<String> {
        types.iter().find_map(|t| {
            self.items
                .iter()
                .find(|i| i.meta_type == *t && i.format != MetaFormat::Binary)
                .and_then(|i| std::str::from_utf8(&i.data).ok())
                .map(|s| s.trim_end_matches('\0').to_string())
        })
    }

    pub fn get_by_type(&self, meta_type: MetaType) -> Option<String> {
        self.get_first_by_types(&[meta_type])
    }

    pub fn original_filename(&self) -> Option<String> {
        self.get_by_type(MetaType::OriginalFilename)
    }

    pub fn mime_type(&self) -> Option<String> {
        self.get_by_type(MetaType::Mimetype)
    }

    /// Inlined file contents, if present
    pub fn full_data(&self) -> Option<&[u8]> {
        self.items
            .iter()
            .find(|i| i.meta_type == MetaType::FullData)
            .map(|i| i.data.as_slice())
    }

    pub fn is_directory(&self) -> bool {
        self.mime_type().as_deref() == Some(DIRECTORY_MIME)
    }

    /// Mark this metadata as describing a directory
    pub fn make_directory(&mut self) {
        if self.is_directory() {
            return;
        }
        self.delete(MetaType::Mimetype, None);
        self.insert_str(MetaType::Mimetype, DIRECTORY_MIME);
    }

    pub fn serialized_size(&self) -> usize {
        1 + 4
            + self
                .items
                .iter()
                .map(|i| {
                    16 + i.plugin_name.len()
                        + i.mime_type.as_ref().map_or(0, |m| m.len())
                        + 4
                        + i.data.len()
                })
                .sum::<usize>()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.serialized_size());
        buf.put_u8(FORMAT_VERSION);
        buf.put_u32(self.items.len() as u32);
        for item in &self.items {
            buf.put_u32(item.meta_type.code());
            buf.put_u32(item.format.code());
            buf.put_u32(item.plugin_name.len() as u32);
            buf.put_slice(item.plugin_name.as_bytes());
            let mime = item.mime_type.as_deref().unwrap_or("");
            buf.put_u32(mime.len() as u32);
            buf.put_slice(mime.as_bytes());
            buf.put_u32(item.data.len() as u32);
            buf.put_slice(&item.data);
        }
        buf.to_vec()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let total = data.len();
        let mut buf = data;
        let pos = |b: &[u8]| total - b.len();
        if buf.remaining() < 5 {
            return Err(MetaError::Truncated(pos(buf)));
        }
        let version = buf.get_u8();
        if version != FORMAT_VERSION {
            return Err(MetaError::Version(version));
        }
        let count = buf.get_u32();
        if count > MAX_ITEMS {
            return Err(MetaError::TooMany(count));
        }
        let mut meta = MetaData::new();
        for _ in 0..count {
            if buf.remaining() < 12 {
                return Err(MetaError::Truncated(pos(buf)));
            }
            let meta_type = MetaType::from_code(buf.get_u32());
            let format = MetaFormat::from_code(buf.get_u32());
            let plugin = take_string(&mut buf).ok_or(MetaError::Truncated(pos(buf)))??;
            let mime = take_string(&mut buf).ok_or(MetaError::Truncated(pos(buf)))??;
            let value = take_bytes(&mut buf).ok_or(MetaError::Truncated(pos(buf)))?;
            meta.items.push(MetaItem {
                plugin_name: plugin,
                meta_type,
                format,
                mime_type: if mime.is_empty() { None } else { Some(mime) },
                data: value,
            });
        }
        Ok(meta)
    }
}

fn take_bytes(buf: &mut &[u8]) -> Option<Vec<u8>> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return None;
    }
    let out = buf[..len].to_vec();
    buf.advance(len);
    Some(out)
}

fn take_string(buf: &mut &[u8]) -> Option<Result<String>> {
    take_bytes(buf).map(|b| String::from_utf8(b).map_err(|_| MetaError::Utf8))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MetaData {
        let mut meta = MetaData::new();
        meta.insert_str(MetaType::OriginalFilename, "report.pdf");
        meta.insert_str(MetaType::Mimetype, "application/pdf");
        meta.insert(
            "thumbnailer",
            MetaType::Thumbnail,
            MetaFormat::Binary,
            Some("image/png"),
            &[0x89, 0x50, 0x4e, 0x47],
        );
        meta
    }

    #[test]
    fn test_serialize_roundtrip() {
        let meta = sample();
        let bytes = meta.serialize();
        assert_eq!(bytes.len(), meta.serialized_size());
        assert_eq!(MetaData::deserialize(&bytes).unwrap(), meta);
    }

    #[test]
    fn test_empty_roundtrip() {
        let meta = MetaData::new();
        assert_eq!(MetaData::deserialize(&meta.serialize()).unwrap(), meta);
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        let bytes = sample().serialize();
        for cut in [0, 3, 10, bytes.len() - 1] {
            assert!(MetaData::deserialize(&bytes[..cut]).is_err());
        }
        let mut bad = bytes.clone();
        bad[0] = 9;
        assert_eq!(MetaData::deserialize(&bad), Err(MetaError::Version(9)));
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut meta = MetaData::new();
        assert!(meta.insert_str(MetaType::Title, "a"));
        assert!(!meta.insert_str(MetaType::Title, "a"));
        assert!(meta.insert_str(MetaType::Title, "b"));
        assert_eq!(meta.len(), 2);
        assert_eq!(meta.delete(MetaType::Title, Some(b"a")), 1);
        assert_eq!(meta.get_by_type(MetaType::Title).as_deref(), Some("b"));
    }

    #[test]
    fn test_directory_marker() {
        let mut meta = sample();
        assert!(!meta.is_directory());
        meta.make_directory();
        assert!(meta.is_directory());
        assert_eq!(meta.mime_type().as_deref(), Some(DIRECTORY_MIME));
    }

    #[test]
    fn test_lookup_helpers() {
        let mut meta = sample();
        assert_eq!(meta.original_filename().as_deref(), Some("report.pdf"));
        assert!(meta.full_data().is_none());
        meta.insert("", MetaType::FullData, MetaFormat::Binary, None, b"abc");
        assert_eq!(meta.full_data(), Some(&b"abc"[..]));
        assert_eq!(
            meta.get_first_by_types(&[MetaType::Title, MetaType::OriginalFilename])
                .as_deref(),
            Some("report.pdf")
        );
    }
}
