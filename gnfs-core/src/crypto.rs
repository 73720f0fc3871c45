//! Content hashing, block encryption and signing keys
//!
//! Every block is addressed by SHA-512 hashes. The symmetric key used to
//! encrypt a block is derived from the hash of its plaintext, so identical
//! plaintext always produces identical ciphertext and identical queries.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use std::fmt;
use std::io::{self, Read};
use std::path::Path;
use thiserror::Error;

/// Size of a hash code in bytes (SHA-512)
pub const HASH_SIZE: usize = 64;

/// Size of a serialized content hash key (key + query)
pub const CHK_SIZE: usize = 2 * HASH_SIZE;

/// Size of an ed25519 public key
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of an ed25519 signature
pub const SIGNATURE_SIZE: usize = 64;

/// Alphabet of the 5-bit ASCII encoding used in URIs
const ENC_TABLE: &[u8; 32] = b"0123456789ABCDEFGHIJKLMNOPQRSTUV";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Signature verification failed")]
    BadSignature,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A 512-bit hash code
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashCode(pub [u8; HASH_SIZE]);

impl HashCode {
    pub const ZERO: HashCode = HashCode([0u8; HASH_SIZE]);

    /// Hash a single buffer
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha512::new();
        hasher.update(data);
        Self::from_digest(hasher)
    }

    /// Hash the concatenation of several buffers without copying them
    pub fn digest_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha512::new();
        for part in parts {
            hasher.update(part);
        }
        Self::from_digest(hasher)
    }

    fn from_digest(hasher: Sha512) -> Self {
        let mut out = [0u8; HASH_SIZE];
        out.copy_from_slice(hasher.finalize().as_slice());
        HashCode(out)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != HASH_SIZE {
            return None;
        }
        let mut out = [0u8; HASH_SIZE];
        out.copy_from_slice(bytes);
        Some(HashCode(out))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn xor(&self, other: &HashCode) -> HashCode {
        let mut out = [0u8; HASH_SIZE];
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.0[i] ^ other.0[i];
        }
        HashCode(out)
    }

    /// Encode as the 103-character ASCII form used in URIs
    pub fn to_enc(&self) -> String {
        data_to_string(&self.0)
    }

    pub fn from_enc(s: &str) -> Result<Self, CryptoError> {
        let bytes = string_to_data(s, HASH_SIZE)?;
        HashCode::from_slice(&bytes)
            .ok_or_else(|| CryptoError::InvalidEncoding(format!("bad hash length in `{}`", s)))
    }

    /// First characters of the encoding, for log lines
    pub fn short(&self) -> String {
        let mut s = self.to_enc();
        s.truncate(8);
        s
    }
}

impl fmt::Display for HashCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_enc())
    }
}

impl fmt::Debug for HashCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashCode({})", self.short())
    }
}

/// Encode arbitrary bytes with the 5-bit alphabet, MSB first, zero padded
pub fn data_to_string(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8 + 4) / 5);
    let mut bits: u32 = 0;
    let mut vbit: u32 = 0;
    let mut rpos = 0;
    while rpos < data.len() || vbit > 0 {
        if rpos < data.len() && vbit < 5 {
            bits = (bits << 8) | data[rpos] as u32;
            rpos += 1;
            vbit += 8;
        }
        if vbit < 5 {
            bits <<= 5 - vbit;
            vbit = 5;
        }
        out.push(ENC_TABLE[((bits >> (vbit - 5)) & 31) as usize] as char);
        vbit -= 5;
        bits &= (1 << vbit) - 1;
    }
    out
}

/// Decode the 5-bit encoding into exactly `out_len` bytes
pub fn string_to_data(s: &str, out_len: usize) -> Result<Vec<u8>, CryptoError> {
    let expected = (out_len * 8 + 4) / 5;
    if s.len() != expected {
        return Err(CryptoError::InvalidEncoding(format!(
            "expected {} characters, got {}",
            expected,
            s.len()
        )));
    }
    let mut out = Vec::with_capacity(out_len);
    let mut bits: u32 = 0;
    let mut vbit: u32 = 0;
    for c in s.bytes() {
        let val = ENC_TABLE
            .iter()
            .position(|&e| e == c.to_ascii_uppercase())
            .ok_or_else(|| CryptoError::InvalidEncoding(format!("invalid character `{}`", c as char)))?;
        bits = (bits << 5) | val as u32;
        vbit += 5;
        if vbit >= 8 {
            vbit -= 8;
            if out.len() < out_len {
                out.push((bits >> vbit) as u8);
            }
            bits &= (1 << vbit) - 1;
        }
    }
    if out.len() != out_len || bits != 0 {
        return Err(CryptoError::InvalidEncoding("trailing bits are not zero".into()));
    }
    Ok(out)
}

/// Content hash key of one block: hash of plaintext and hash of ciphertext
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ContentHashKey {
    pub key: HashCode,
    pub query: HashCode,
}

impl ContentHashKey {
    pub const EMPTY: ContentHashKey = ContentHashKey {
        key: HashCode::ZERO,
        query: HashCode::ZERO,
    };

    /// Hash, encrypt and hash again: the CHK together with the ciphertext
    pub fn encode_block(plaintext: &[u8]) -> (ContentHashKey, Vec<u8>) {
        let key = HashCode::digest(plaintext);
        let mut enc = plaintext.to_vec();
        BlockCipher::from_hash(&key).apply(&mut enc);
        let query = HashCode::digest(&enc);
        (ContentHashKey { key, query }, enc)
    }

    pub fn to_bytes(&self) -> [u8; CHK_SIZE] {
        let mut out = [0u8; CHK_SIZE];
        out[..HASH_SIZE].copy_from_slice(&self.key.0);
        out[HASH_SIZE..].copy_from_slice(&self.query.0);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != CHK_SIZE {
            return None;
        }
        Some(ContentHashKey {
            key: HashCode::from_slice(&bytes[..HASH_SIZE])?,
            query: HashCode::from_slice(&bytes[HASH_SIZE..])?,
        })
    }
}

/// Length-preserving stream cipher keyed by a hash code
pub struct BlockCipher {
    key: [u8; 32],
    nonce: [u8; 12],
}

impl BlockCipher {
    pub fn from_hash(hash: &HashCode) -> Self {
        let mut key = [0u8; 32];
        let mut nonce = [0u8; 12];
        key.copy_from_slice(&hash.0[..32]);
        nonce.copy_from_slice(&hash.0[32..44]);
        Self { key, nonce }
    }

    /// Encrypt or decrypt in place
    pub fn apply(&self, data: &mut [u8]) {
        let mut cipher = ChaCha20::new(&self.key.into(), &self.nonce.into());
        cipher.apply_keystream(data);
    }
}

/// Decrypt a block with the key from its CHK
pub fn decrypt_block(key: &HashCode, ciphertext: &[u8]) -> Vec<u8> {
    let mut out = ciphertext.to_vec();
    BlockCipher::from_hash(key).apply(&mut out);
    out
}

/// Deterministic signing key from a seed hash (first 32 bytes)
pub fn signing_key_from_seed(seed: &HashCode) -> SigningKey {
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&seed.0[..32]);
    SigningKey::from_bytes(&secret)
}

pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

pub fn sign(key: &SigningKey, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
    key.sign(message).to_bytes()
}

pub fn verify(
    public_key: &[u8; PUBLIC_KEY_SIZE],
    message: &[u8],
    signature: &[u8; SIGNATURE_SIZE],
) -> Result<(), CryptoError> {
    let vk = VerifyingKey::from_bytes(public_key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    vk.verify(message, &Signature::from_bytes(signature))
        .map_err(|_| CryptoError::BadSignature)
}

/// Read a 32-byte ed25519 secret from `path`, creating a fresh one if absent
pub fn load_or_create_signing_key(path: &Path) -> Result<SigningKey, CryptoError> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let secret: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKey(format!("{} is not 32 bytes", path.display())))?;
            Ok(SigningKey::from_bytes(&secret))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let key = generate_signing_key();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, key.to_bytes())?;
            Ok(key)
        }
        Err(e) => Err(e.into()),
    }
}

/// Streaming SHA-512 over a file or reader
pub struct FileHasher {
    hasher: Sha512,
    bytes_processed: u64,
}

impl FileHasher {
    pub fn new() -> Self {
        Self {
            hasher: Sha512::new(),
            bytes_processed: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_processed += data.len() as u64;
    }

    pub fn update_from_reader<R: Read>(&mut self, reader: &mut R) -> Result<u64, io::Error> {
        let mut buffer = [0u8; 65536];
        let mut total_read = 0u64;

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            self.update(&buffer[..n]);
            total_read += n as u64;
        }

        Ok(total_read)
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }

    pub fn finalize(self) -> HashCode {
        HashCode::from_digest(self.hasher)
    }
}

impl Default for FileHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash the complete contents of a file
pub fn hash_file(path: &Path) -> Result<HashCode, CryptoError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = FileHasher::new();
    hasher.update_from_reader(&mut file)?;
    Ok(hasher.finalize())
}
