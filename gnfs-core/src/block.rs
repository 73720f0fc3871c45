//! Block types exchanged with the service
//!
//! Besides the DBLOCK/IBLOCK content blocks of the CHK tree there are:
//!
//! - UBLOCKs: signed, encrypted records mapping a keyword or a namespace
//!   identifier to a URI plus metadata
//! - ONDEMAND stubs: datastore records pointing into a locally indexed file

use ed25519_dalek::SigningKey;
use thiserror::Error;

use crate::crypto::{self, BlockCipher, HashCode, HASH_SIZE, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
use crate::metadata::{MetaData, MetaError, MetaFormat};
use crate::uri::{NamespaceId, Uri, UriError};

/// Largest UBLOCK we are willing to create
pub const MAX_UBLOCK_SIZE: usize = 60000;

/// Serialized size of an on-demand stub
pub const ONDEMAND_BLOCK_SIZE: usize = 8 + HASH_SIZE;

const UBLOCK_HEADER_SIZE: usize = SIGNATURE_SIZE + PUBLIC_KEY_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockType {
    /// Wildcard in datastore lookups
    Any,
    DBlock,
    IBlock,
    UBlock,
    OnDemand,
}

impl BlockType {
    pub fn code(self) -> u32 {
        match self {
            BlockType::Any => 0,
            BlockType::DBlock => 1,
            BlockType::IBlock => 2,
            BlockType::UBlock => 9,
            BlockType::OnDemand => 6,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(BlockType::Any),
            1 => Some(BlockType::DBlock),
            2 => Some(BlockType::IBlock),
            9 => Some(BlockType::UBlock),
            6 => Some(BlockType::OnDemand),
            _ => None,
        }
    }

    /// Content type of a CHK tree block at `depth`
    pub fn for_depth(depth: u32) -> Self {
        if depth == 0 {
            BlockType::DBlock
        } else {
            BlockType::IBlock
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("Block is truncated")]
    Truncated,

    #[error("Block signature is invalid")]
    BadSignature,

    #[error("Block was signed by an unexpected key")]
    WrongKey,

    #[error("Malformed block payload: {0}")]
    Malformed(String),

    #[error("Block payload too large ({0} bytes)")]
    TooLarge(usize),

    #[error("URI error: {0}")]
    Uri(#[from] UriError),

    #[error("Metadata error: {0}")]
    Meta(#[from] MetaError),
}

pub type Result<T> = std::result::Result<T, BlockError>;

/// Stub stored instead of content for indexed files
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OnDemandBlock {
    pub offset: u64,
    pub file_id: HashCode,
}

impl OnDemandBlock {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ONDEMAND_BLOCK_SIZE);
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.extend_from_slice(self.file_id.as_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != ONDEMAND_BLOCK_SIZE {
            return Err(BlockError::Truncated);
        }
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&data[..8]);
        Ok(OnDemandBlock {
            offset: u64::from_be_bytes(offset),
            file_id: HashCode::from_slice(&data[8..]).ok_or(BlockError::Truncated)?,
        })
    }
}

/// Signing key that anyone knowing `keyword` can derive
pub fn ksk_signing_key(keyword: &str) -> SigningKey {
    crypto::signing_key_from_seed(&HashCode::digest_parts(&[b"fs-ksk", keyword.as_bytes()]))
}

/// Public key under which UBLOCKs for `keyword` are published
pub fn ksk_public_key(keyword: &str) -> [u8; PUBLIC_KEY_SIZE] {
    ksk_signing_key(keyword).verifying_key().to_bytes()
}

/// Datastore and search key of a UBLOCK
pub fn ublock_query(public_key: &[u8; PUBLIC_KEY_SIZE], label: &str) -> HashCode {
    HashCode::digest_parts(&[b"fs-ublock-query", public_key, label.as_bytes()])
}

fn ublock_cipher(public_key: &[u8; PUBLIC_KEY_SIZE], label: &str) -> BlockCipher {
    BlockCipher::from_hash(&HashCode::digest_parts(&[
        b"fs-ublock-key",
        public_key,
        label.as_bytes(),
    ]))
}

fn signed_message(query: &HashCode, encrypted: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(9 + HASH_SIZE + encrypted.len());
    msg.extend_from_slice(b"fs-ublock");
    msg.extend_from_slice(query.as_bytes());
    msg.extend_from_slice(encrypted);
    msg
}

/// Decrypted contents of a UBLOCK
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UBlockContent {
    /// Identifier of the next version in a namespace, empty if none
    pub update_id: String,
    pub uri: Uri,
    pub meta: MetaData,
}

/// Build a signed UBLOCK; returns its query and wire bytes
///
/// Metadata that does not fit is trimmed, dropping binary items first.
pub fn create_ublock(
    key: &SigningKey,
    label: &str,
    update_id: Option<&str>,
    uri: &Uri,
    meta: &MetaData,
) -> Result<(HashCode, Vec<u8>)> {
    let public_key = key.verifying_key().to_bytes();
    let update_id = update_id.unwrap_or("");
    let uri_string = uri.to_string();
    let fixed = UBLOCK_HEADER_SIZE + update_id.len() + 1 + uri_string.len() + 1;
    if fixed > MAX_UBLOCK_SIZE {
        return Err(BlockError::TooLarge(fixed));
    }
    let meta_bytes = shrink_meta(meta, MAX_UBLOCK_SIZE - fixed);

    let mut payload = Vec::with_capacity(fixed + meta_bytes.len());
    payload.extend_from_slice(update_id.as_bytes());
    payload.push(0);
    payload.extend_from_slice(uri_string.as_bytes());
    payload.push(0);
    payload.extend_from_slice(&meta_bytes);
    ublock_cipher(&public_key, label).apply(&mut payload);

    let query = ublock_query(&public_key, label);
    let signature = crypto::sign(key, &signed_message(&query, &payload));
    let mut block = Vec::with_capacity(UBLOCK_HEADER_SIZE + payload.len());
    block.extend_from_slice(&signature);
    block.extend_from_slice(&public_key);
    block.extend_from_slice(&payload);
    Ok((query, block))
}

fn shrink_meta(meta: &MetaData, limit: usize) -> Vec<u8> {
    let bytes = meta.serialize();
    if bytes.len() <= limit {
        return bytes;
    }
    let mut items: Vec<_> = meta.iter().cloned().collect();
    // binary payloads (thumbnails, inlined data) go first, then large items
    items.sort_by_key(|i| (i.format != MetaFormat::Binary, std::cmp::Reverse(i.data.len())));
    let mut shrunk = meta.clone();
    for item in items {
        shrunk.delete(item.meta_type, Some(&item.data));
        let bytes = shrunk.serialize();
        if bytes.len() <= limit {
            return bytes;
        }
    }
    MetaData::new().serialize()
}

/// Verify and decrypt a UBLOCK expected under `public_key` and `label`
pub fn decrypt_ublock(
    block: &[u8],
    public_key: &[u8; PUBLIC_KEY_SIZE],
    label: &str,
) -> Result<UBlockContent> {
    if block.len() < UBLOCK_HEADER_SIZE {
        return Err(BlockError::Truncated);
    }
    let (signature, rest) = block.split_at(SIGNATURE_SIZE);
    let (block_key, encrypted) = rest.split_at(PUBLIC_KEY_SIZE);
    if block_key != public_key {
        return Err(BlockError::WrongKey);
    }
    let mut sig = [0u8; SIGNATURE_SIZE];
    sig.copy_from_slice(signature);
    let query = ublock_query(public_key, label);
    crypto::verify(public_key, &signed_message(&query, encrypted), &sig)
        .map_err(|_| BlockError::BadSignature)?;

    let mut plain = encrypted.to_vec();
    ublock_cipher(public_key, label).apply(&mut plain);
    let first = plain
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| BlockError::Malformed("missing update identifier".into()))?;
    let second = plain[first + 1..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| first + 1 + p)
        .ok_or_else(|| BlockError::Malformed("missing URI".into()))?;
    let update_id = std::str::from_utf8(&plain[..first])
        .map_err(|_| BlockError::Malformed("update identifier is not UTF-8".into()))?
        .to_string();
    let uri_str = std::str::from_utf8(&plain[first + 1..second])
        .map_err(|_| BlockError::Malformed("URI is not UTF-8".into()))?;
    let uri = Uri::parse(uri_str)?;
    let meta = MetaData::deserialize(&plain[second + 1..])?;
    Ok(UBlockContent {
        update_id,
        uri,
        meta,
    })
}

/// Query under which a keyword's results are published
pub fn ksk_query(keyword: &str) -> HashCode {
    ublock_query(&ksk_public_key(keyword), keyword)
}

/// Query of a namespace entry
pub fn sks_query(namespace: &NamespaceId, identifier: &str) -> HashCode {
    ublock_query(&namespace.0, identifier)
}
