//! Directory codec
//!
//! A directory is a flat file:
//!
//! ```text
//! MAGIC (8) | u32 BE meta size | meta | entry | entry | ...
//! entry := uri NUL | u32 BE meta size | meta
//! ```
//!
//! Entries never straddle a `DBLOCK_SIZE` boundary unless they are larger
//! than a block; instead the gap is zero-filled and the entry starts on the
//! boundary. Listing treats a NUL where a URI should start as padding and
//! skips to the next boundary, so a partially downloaded directory can be
//! listed block by block.

use thiserror::Error;
use tracing::{debug, warn};

use crate::metadata::{MetaData, MetaError, MetaFormat, MetaType};
use crate::tree::{DBLOCK_SIZE, MAX_INLINE_SIZE};
use crate::uri::Uri;

pub const DIRECTORY_MAGIC: &[u8; 8] = b"\x89GND\r\n\x1a\n";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("Not a directory (bad magic or header)")]
    NotADirectory,

    #[error("Malformed directory metadata: {0}")]
    Meta(#[from] MetaError),

    #[error("Keyword URIs cannot be directory entries")]
    KeywordEntry,

    #[error("Duplicate directory entry: {0}")]
    DuplicateEntry(String),
}

pub type Result<T> = std::result::Result<T, DirectoryError>;

/// One listed entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub filename: Option<String>,
    pub uri: Uri,
    pub meta: MetaData,
    /// Inlined file contents, if the publisher embedded them
    pub data: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirectoryListing {
    /// Metadata of the directory itself (only when listing from offset 0)
    pub meta: Option<MetaData>,
    pub entries: Vec<DirectoryEntry>,
    /// False if parsing stopped early on truncated or malformed data
    pub complete: bool,
}

/// Whether `data` starts with the directory magic
pub fn is_directory_data(data: &[u8]) -> bool {
    data.len() >= DIRECTORY_MAGIC.len() + 4 && data.starts_with(DIRECTORY_MAGIC)
}

/// Parse the entries in `data`, which starts at file offset `offset`
///
/// A broken entry ends the listing with `complete == false` and the entries
/// parsed so far. Only a bad header is an error.
pub fn list_contents(data: &[u8], offset: u64) -> Result<DirectoryListing> {
    let size = data.len();
    let mut listing = DirectoryListing {
        complete: true,
        ..Default::default()
    };
    let mut pos = 0usize;
    let block = DBLOCK_SIZE as u64;
    // offsets in `data` are relative; alignment uses the absolute position
    let abs = |p: usize| offset + p as u64;

    if offset == 0 {
        if !is_directory_data(data) {
            return Err(DirectoryError::NotADirectory);
        }
        let md_size = read_u32(&data[8..12]) as usize;
        if md_size > size - 12 {
            warn!("Directory metadata size exceeds data, not a directory");
            return Err(DirectoryError::NotADirectory);
        }
        listing.meta = Some(MetaData::deserialize(&data[12..12 + md_size])?);
        pos = 12 + md_size;
    }

    while pos < size {
        if data[pos] == 0 {
            let mut align = (abs(pos) / block + 1) * block;
            if align == abs(pos) {
                align += block;
            }
            let next = (align - offset) as usize;
            if abs(pos) % block == 0 {
                // already aligned: a whole block of padding
                pos = (abs(pos) + block - offset) as usize;
            } else {
                pos = next;
            }
            if pos >= size {
                break;
            }
        }
        let Some(nul) = data[pos..].iter().position(|&b| b == 0) else {
            listing.complete = false;
            break;
        };
        let epos = pos + nul;
        let parsed = std::str::from_utf8(&data[pos..epos])
            .ok()
            .and_then(|s| Uri::parse(s).ok());
        let Some(uri) = parsed else {
            debug!(offset = abs(pos), "Skipping unparseable directory entry");
            // back on the NUL, which forces a skip to the next boundary
            pos = epos;
            continue;
        };
        pos = epos + 1;
        if uri.is_ksk() {
            warn!("Keyword URI found in directory, stopping listing");
            listing.complete = false;
            break;
        }
        if pos + 4 > size {
            listing.complete = false;
            break;
        }
        let md_size = read_u32(&data[pos..pos + 4]) as usize;
        pos += 4;
        if pos + md_size > size {
            listing.complete = false;
            break;
        }
        let meta = match MetaData::deserialize(&data[pos..pos + md_size]) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(error = %e, "Malformed metadata in directory entry");
                listing.complete = false;
                break;
            }
        };
        pos += md_size;
        listing.entries.push(DirectoryEntry {
            filename: meta.original_filename(),
            data: meta.full_data().map(<[u8]>::to_vec),
            uri,
            meta,
        });
    }
    Ok(listing)
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

/// If the range `[start, end)` crosses a block boundary, move it to start
/// on that boundary and return the new end
fn do_align(start: usize, end: usize) -> usize {
    let align = (end / DBLOCK_SIZE) * DBLOCK_SIZE;
    if start < align && end > align {
        return align + end - start;
    }
    end
}

/// Greedy ordering of entries that keeps padding small
///
/// At a block start the entry leaving the fullest block wins; inside a block
/// the entry leaving the smallest remainder wins; entries that would need
/// re-alignment are penalized by the space they would waste.
fn block_align(start: usize, sizes: &[usize], perm: &mut [usize]) {
    let block = DBLOCK_SIZE as i64;
    let mut cpos = start;
    for i in 0..perm.len() {
        let start = cpos;
        let mut badness = i64::MAX;
        let mut best = i;
        for j in i..perm.len() {
            let cend = cpos + sizes[perm[j]];
            let cbad = if cpos % DBLOCK_SIZE == 0 {
                -((cend % DBLOCK_SIZE) as i64)
            } else if cpos / DBLOCK_SIZE == cend / DBLOCK_SIZE {
                block - (cend % DBLOCK_SIZE) as i64
            } else {
                block * (block - (cpos % DBLOCK_SIZE) as i64)
            };
            if cbad < badness {
                best = j;
                badness = cbad;
            }
        }
        perm.swap(i, best);
        cpos += sizes[perm[i]];
        cpos = do_align(start, cpos);
    }
}

struct BuilderEntry {
    uri: Uri,
    bytes: Vec<u8>,
}

/// Accumulates entries and produces the directory blob
pub struct DirectoryBuilder {
    meta: MetaData,
    entries: Vec<BuilderEntry>,
}

impl DirectoryBuilder {
    pub fn new(meta: Option<&MetaData>) -> Self {
        let mut meta = meta.cloned().unwrap_or_default();
        meta.make_directory();
        Self {
            meta,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add an entry; `data` is inlined when the file is small enough
    pub fn add(&mut self, uri: &Uri, meta: &MetaData, data: Option<&[u8]>) -> Result<()> {
        if uri.is_ksk() {
            return Err(DirectoryError::KeywordEntry);
        }
        if self.entries.iter().any(|e| &e.uri == uri) {
            return Err(DirectoryError::DuplicateEntry(uri.to_string()));
        }
        let mut meta_use = meta.clone();
        if let (Some(data), Some(fsize)) = (data, uri.chk_file_size()) {
            if fsize > 0 && fsize <= MAX_INLINE_SIZE && meta.full_data().is_none() {
                let len = (fsize as usize).min(data.len());
                meta_use.insert("<gnfs>", MetaType::FullData, MetaFormat::Binary, None, &data[..len]);
            }
        }
        let uri_string = uri.to_string();
        let meta_bytes = meta_use.serialize();
        let mut bytes = Vec::with_capacity(uri_string.len() + 5 + meta_bytes.len());
        bytes.extend_from_slice(uri_string.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&(meta_bytes.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&meta_bytes);
        self.entries.push(BuilderEntry {
            uri: uri.clone(),
            bytes,
        });
        Ok(())
    }

    pub fn finish(self) -> Vec<u8> {
        let meta_bytes = self.meta.serialize();
        let header = DIRECTORY_MAGIC.len() + 4 + meta_bytes.len();
        let sizes: Vec<usize> = self.entries.iter().map(|e| e.bytes.len()).collect();
        let mut perm: Vec<usize> = (0..sizes.len()).collect();
        block_align(header, &sizes, &mut perm);

        let mut size = header;
        for &i in &perm {
            let start = size;
            size = do_align(start, size + sizes[i]);
        }

        let mut out = vec![0u8; size];
        out[..8].copy_from_slice(DIRECTORY_MAGIC);
        out[8..12].copy_from_slice(&(meta_bytes.len() as u32).to_be_bytes());
        out[12..header].copy_from_slice(&meta_bytes);
        let mut off = header;
        for &i in &perm {
            let start = off;
            off = do_align(start, off + sizes[i]);
            out[off - sizes[i]..off].copy_from_slice(&self.entries[i].bytes);
        }
        debug!(entries = perm.len(), size, "Built directory");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ContentHashKey;

    fn entry_uri(n: u32, len: u64) -> Uri {
        let (chk, _) = ContentHashKey::encode_block(&n.to_be_bytes());
        Uri::chk(chk, len)
    }

    fn named(name: &str) -> MetaData {
        let mut meta = MetaData::new();
        meta.insert_str(MetaType::OriginalFilename, name);
        meta
    }

    #[test]
    fn test_empty_directory() {
        let mut dmeta = MetaData::new();
        dmeta.insert_str(MetaType::Title, "empty");
        let data = DirectoryBuilder::new(Some(&dmeta)).finish();
        assert!(is_directory_data(&data));
        let listing = list_contents(&data, 0).unwrap();
        assert!(listing.complete);
        assert!(listing.entries.is_empty());
        let meta = listing.meta.unwrap();
        assert!(meta.is_directory());
        assert_eq!(meta.get_by_type(MetaType::Title).as_deref(), Some("empty"));
    }

    #[test]
    fn test_roundtrip_with_inline_data() {
        let mut builder = DirectoryBuilder::new(None);
        builder.add(&entry_uri(1, 5), &named("a.txt"), Some(b"hello")).unwrap();
        builder.add(&entry_uri(2, 1 << 20), &named("big.iso"), Some(b"ignored")).unwrap();
        builder.add(&entry_uri(3, 10), &named("c"), None).unwrap();
        let data = builder.finish();
        let listing = list_contents(&data, 0).unwrap();
        assert!(listing.complete);
        assert_eq!(listing.entries.len(), 3);
        let find = |name: &str| {
            listing
                .entries
                .iter()
                .find(|e| e.filename.as_deref() == Some(name))
                .unwrap()
        };
        assert_eq!(find("a.txt").data.as_deref(), Some(&b"hello"[..]));
        assert_eq!(find("a.txt").uri, entry_uri(1, 5));
        assert!(find("big.iso").data.is_none());
        assert!(find("c").data.is_none());
    }

    #[test]
    fn test_duplicate_and_keyword_rejected() {
        let mut builder = DirectoryBuilder::new(None);
        builder.add(&entry_uri(1, 5), &named("a"), None).unwrap();
        assert!(matches!(
            builder.add(&entry_uri(1, 5), &named("b"), None),
            Err(DirectoryError::DuplicateEntry(_))
        ));
        assert_eq!(
            builder.add(&Uri::ksk_from_args(&["x"]), &named("k"), None),
            Err(DirectoryError::KeywordEntry)
        );
        assert_eq!(builder.len(), 1);
    }

    #[test]
    fn test_entries_do_not_straddle_blocks() {
        let mut builder = DirectoryBuilder::new(None);
        let count = 40;
        for n in 0..count {
            // ~3 KiB of metadata per entry forces several block boundaries
            let mut meta = named(&format!("file-{}", n));
            meta.insert_str(MetaType::Description, &"x".repeat(3000 + n as usize * 7));
            builder.add(&entry_uri(n, 100_000), &meta, None).unwrap();
        }
        let data = builder.finish();
        assert!(data.len() > 3 * DBLOCK_SIZE);
        let listing = list_contents(&data, 0).unwrap();
        assert!(listing.complete);
        assert_eq!(listing.entries.len(), count as usize);

        // every entry that starts inside a block also ends inside it
        for e in &listing.entries {
            let needle = e.uri.to_string();
            let start = data
                .windows(needle.len())
                .position(|w| w == needle.as_bytes())
                .unwrap();
            let len = needle.len() + 1 + 4 + e.meta.serialize().len();
            assert_eq!(start / DBLOCK_SIZE, (start + len - 1) / DBLOCK_SIZE);
        }
    }

    #[test]
    fn test_partial_directory_lists_prefix() {
        let mut builder = DirectoryBuilder::new(None);
        for n in 0..30 {
            let mut meta = named(&format!("f{}", n));
            meta.insert_str(MetaType::Comment, &"y".repeat(4000));
            builder.add(&entry_uri(n, 1), &meta, None).unwrap();
        }
        let data = builder.finish();
        let listing = list_contents(&data[..DBLOCK_SIZE + 100], 0).unwrap();
        assert!(!listing.complete);
        assert!(!listing.entries.is_empty());
        assert!(listing.entries.len() < 30);

        // the second block can be listed on its own
        let second = list_contents(&data[DBLOCK_SIZE..2 * DBLOCK_SIZE], DBLOCK_SIZE as u64).unwrap();
        assert!(second.meta.is_none());
        assert!(!second.entries.is_empty());
    }

    #[test]
    fn test_not_a_directory() {
        assert_eq!(
            list_contents(b"plain text file here", 0),
            Err(DirectoryError::NotADirectory)
        );
        let mut data = DirectoryBuilder::new(None).finish();
        data[8..12].copy_from_slice(&u32::MAX.to_be_bytes());
        assert_eq!(list_contents(&data, 0), Err(DirectoryError::NotADirectory));
    }

    #[test]
    fn test_block_align_prefers_filling_blocks() {
        let sizes = [DBLOCK_SIZE - 100, 50, 40];
        let mut perm = vec![0, 1, 2];
        block_align(0, &sizes, &mut perm);
        // at a boundary the entry leaving the fullest block goes first
        assert_eq!(perm[0], 0);
    }

    #[test]
    fn test_do_align() {
        assert_eq!(do_align(0, 10), 10);
        assert_eq!(do_align(DBLOCK_SIZE - 5, DBLOCK_SIZE + 5), DBLOCK_SIZE + 10);
        assert_eq!(do_align(DBLOCK_SIZE, DBLOCK_SIZE + 5), DBLOCK_SIZE + 5);
    }
}
