//! Content Hash Key tree
//!
//! Files are split into `DBLOCK_SIZE` leaves. Every block is encrypted with a
//! key derived from the hash of its plaintext and addressed by the hash of
//! its ciphertext. Interior blocks (IBLOCKs) hold up to `CHK_PER_INODE`
//! content hash keys of their children; the root CHK plus the file length
//! forms the CHK URI.
//!
//! # Encoding order
//!
//! The encoder walks strictly left to right. After each leaf it climbs as far
//! as the interior nodes that just became complete, so at most one partially
//! filled interior block exists per level. The `chk_tree` window keeps the
//! CHKs of those open nodes.
//!
//! # Disk layout of partial downloads
//!
//! Leaves live at their natural offset. Interior blocks are stored after the
//! leaf region, one region per level, see [`compute_disk_offset`].

use thiserror::Error;
use tracing::trace;

use crate::block::BlockType;
use crate::crypto::{ContentHashKey, CHK_SIZE};
use crate::reader::DataReader;
use crate::uri::Uri;

/// Size of a leaf block
pub const DBLOCK_SIZE: usize = 32 * 1024;

/// Fan-out of interior blocks
pub const CHK_PER_INODE: usize = 256;

/// Largest file that may be inlined into metadata or directories
pub const MAX_INLINE_SIZE: u64 = 65536;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("Failed to read {len} bytes at offset {offset}: {reason}")]
    Read {
        offset: u64,
        len: usize,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, TreeError>;

/// Depth of the tree for a file of `flen` bytes; at least 1
///
/// Saturates for lengths where the next level would overflow `u64`.
pub fn compute_depth(flen: u64) -> u32 {
    let mut depth = 1;
    let mut fl = DBLOCK_SIZE as u64;
    while fl < flen {
        depth += 1;
        match fl.checked_mul(CHK_PER_INODE as u64) {
            Some(next) => fl = next,
            None => return depth,
        }
    }
    depth
}

/// Bytes of payload covered by a subtree rooted at `depth` (0 = leaf)
pub fn compute_tree_size(depth: u32) -> u64 {
    let mut rsize = DBLOCK_SIZE as u64;
    for _ in 0..depth {
        rsize = rsize.saturating_mul(CHK_PER_INODE as u64);
    }
    rsize
}

/// Size of the interior block at `depth` that ends at `end_offset`
pub fn compute_iblock_size(depth: u32, end_offset: u64) -> usize {
    debug_assert!(depth > 0);
    debug_assert!(end_offset > 0);
    let bds = compute_tree_size(depth);
    let m = end_offset % bds;
    let entries = if m == 0 {
        CHK_PER_INODE as u64
    } else {
        let child = bds / CHK_PER_INODE as u64;
        (m + child - 1) / child
    };
    entries as usize * CHK_SIZE
}

/// Size of the block at `depth` whose subtree starts at `offset`
pub fn calculate_block_size(fsize: u64, offset: u64, depth: u32) -> usize {
    debug_assert!(offset <= fsize);
    if depth == 0 {
        let end = offset.saturating_add(DBLOCK_SIZE as u64).min(fsize);
        return (end - offset) as usize;
    }
    let rsize = compute_tree_size(depth - 1);
    let epos = offset
        .checked_add(rsize.saturating_mul(CHK_PER_INODE as u64))
        .map_or(fsize, |e| e.min(fsize));
    let chks = (epos - offset + rsize - 1) / rsize;
    debug_assert!(chks <= CHK_PER_INODE as u64);
    chks as usize * CHK_SIZE
}

/// Slot of a block within its parent; interior offsets are block ends
pub fn compute_chk_offset(depth: u32, end_offset: u64) -> usize {
    let bds = compute_tree_size(depth);
    let end_offset = if depth > 0 {
        end_offset.saturating_sub(1)
    } else {
        end_offset
    };
    ((end_offset / bds) % CHK_PER_INODE as u64) as usize
}

/// Where a block of a partial download is kept on disk
///
/// Leaves sit at `off`. Interior levels follow the leaf data, starting at the
/// next `DBLOCK_SIZE` boundary; each level holds the CHK arrays of its nodes
/// back to back.
pub fn compute_disk_offset(fsize: u64, off: u64, depth: u32) -> u64 {
    if depth == 0 {
        return off;
    }
    let dblock = DBLOCK_SIZE as u64;
    let fanout = CHK_PER_INODE as u64;
    let mut entries = (fsize + dblock - 1) / dblock;
    let mut loff = entries * dblock;
    let mut lsize = entries * CHK_SIZE as u64;
    let mut ioff = off / dblock;
    for _ in 1..depth {
        loff += lsize;
        entries = (entries + fanout - 1) / fanout;
        lsize = entries * CHK_SIZE as u64;
        ioff /= fanout;
    }
    loff + ioff * CHK_SIZE as u64
}

/// One encrypted block produced by the encoder
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeBlock {
    pub chk: ContentHashKey,
    /// Leaves: start of the block. Interior blocks: end of the covered range.
    pub offset: u64,
    pub depth: u32,
    pub block_type: BlockType,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub enum TreeStep {
    Block(TreeBlock),
    Done(Uri),
}

/// Incremental CHK tree encoder
///
/// Each call to [`TreeEncoder::next`] reads at most one leaf from the
/// reader and yields exactly one block, or the final URI. Taking `&mut self`
/// rules out re-entrant advancement while a block is being produced.
pub struct TreeEncoder {
    size: u64,
    publish_offset: u64,
    current_depth: u32,
    chk_tree_depth: u32,
    chk_tree: Vec<ContentHashKey>,
    uri: Option<Uri>,
    error: Option<TreeError>,
}

impl TreeEncoder {
    pub fn new(size: u64) -> Self {
        let chk_tree_depth = compute_depth(size);
        Self {
            size,
            publish_offset: 0,
            current_depth: 0,
            chk_tree_depth,
            chk_tree: vec![ContentHashKey::EMPTY; chk_tree_depth as usize * CHK_PER_INODE],
            uri: None,
            error: None,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn depth(&self) -> u32 {
        self.chk_tree_depth
    }

    /// Bytes of leaf data consumed so far
    pub fn position(&self) -> u64 {
        self.publish_offset
    }

    pub fn uri(&self) -> Option<&Uri> {
        self.uri.as_ref()
    }

    pub fn next(&mut self, reader: &mut dyn DataReader) -> Result<TreeStep> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if let Some(uri) = &self.uri {
            return Ok(TreeStep::Done(uri.clone()));
        }
        if self.current_depth == self.chk_tree_depth {
            let root = self.chk_tree[(self.chk_tree_depth as usize - 1) * CHK_PER_INODE];
            trace!(query = %root.query.short(), size = self.size, "Tree encoder done");
            let uri = Uri::chk(root, self.size);
            self.uri = Some(uri.clone());
            return Ok(TreeStep::Done(uri));
        }

        let plaintext = if self.current_depth == 0 {
            let len = (self.size - self.publish_offset).min(DBLOCK_SIZE as u64) as usize;
            let mut buf = vec![0u8; len];
            if let Err(e) = reader.read(self.publish_offset, &mut buf) {
                let err = TreeError::Read {
                    offset: self.publish_offset,
                    len,
                    reason: e.to_string(),
                };
                self.error = Some(err.clone());
                return Err(err);
            }
            buf
        } else {
            let len = compute_iblock_size(self.current_depth, self.publish_offset);
            let level = (self.current_depth as usize - 1) * CHK_PER_INODE;
            let mut buf = Vec::with_capacity(len);
            for chk in &self.chk_tree[level..level + len / CHK_SIZE] {
                buf.extend_from_slice(&chk.to_bytes());
            }
            buf
        };

        let off = compute_chk_offset(self.current_depth, self.publish_offset);
        let (chk, data) = ContentHashKey::encode_block(&plaintext);
        let slot = self.current_depth as usize * CHK_PER_INODE + off;
        self.chk_tree[slot] = chk;
        trace!(
            offset = self.publish_offset,
            depth = self.current_depth,
            len = plaintext.len(),
            slot,
            query = %chk.query.short(),
            "Tree encoder produced block"
        );

        let block = TreeBlock {
            chk,
            offset: self.publish_offset,
            depth: self.current_depth,
            block_type: if self.current_depth == 0 {
                BlockType::DBlock
            } else {
                BlockType::IBlock
            },
            data,
        };

        if self.current_depth == 0 {
            self.publish_offset += plaintext.len() as u64;
            if self.publish_offset == self.size
                || self.publish_offset % compute_tree_size(1) == 0
            {
                self.current_depth += 1;
            }
        } else if self.publish_offset == self.size
            || self.publish_offset % compute_tree_size(self.current_depth + 1) == 0
        {
            self.current_depth += 1;
        } else {
            self.current_depth = 0;
        }
        Ok(TreeStep::Block(block))
    }

    /// Close the reader and hand back the URI if encoding completed
    pub fn finish(self, reader: &mut dyn DataReader) -> Result<Uri> {
        reader.close();
        if let Some(err) = self.error {
            return Err(err);
        }
        match self.uri {
            Some(uri) => Ok(uri),
            None => Err(TreeError::Read {
                offset: self.publish_offset,
                len: 0,
                reason: "encoding was not completed".into(),
            }),
        }
    }

    /// Encode everything, passing each block to `sink`
    pub fn encode_all<F>(size: u64, reader: &mut dyn DataReader, mut sink: F) -> Result<Uri>
    where
        F: FnMut(&TreeBlock),
    {
        let mut encoder = TreeEncoder::new(size);
        loop {
            match encoder.next(reader) {
                Ok(TreeStep::Block(block)) => sink(&block),
                Ok(TreeStep::Done(_)) => return encoder.finish(reader),
                Err(e) => {
                    reader.close();
                    return Err(e);
                }
            }
        }
    }
}
