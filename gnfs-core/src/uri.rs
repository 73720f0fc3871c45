//! File-sharing URIs
//!
//! Four variants share the `gnunet://fs/` prefix:
//!
//! - `chk/<key>.<query>.<length>` names content by its root content hash key
//! - `loc/<key>.<query>.<length>.<peer>.<signature>.<expiration>` adds a
//!   peer that promises to serve the content until `expiration`
//! - `ksk/<keyword>+<keyword>...` is a keyword search
//! - `sks/<namespace>/<identifier>` is a signed entry in a namespace
//!
//! Keywords keep their mandatory flag as a leading `+` once decoded; in the
//! string form that `+` is percent-encoded since a bare `+` separates keywords.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::SigningKey;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::crypto::{
    self, data_to_string, string_to_data, ContentHashKey, HashCode, CHK_SIZE, PUBLIC_KEY_SIZE,
    SIGNATURE_SIZE,
};
use crate::metadata::{MetaData, MetaFormat, MetaType};

pub const URI_PREFIX: &str = "gnunet://fs/";
const CHK_INFIX: &str = "chk/";
const LOC_INFIX: &str = "loc/";
const KSK_INFIX: &str = "ksk/";
const SKS_INFIX: &str = "sks/";

/// Characters that split metadata values into keywords
const KEYWORD_SEPARATORS: &[char] = &[
    ' ', '\t', '\n', '\r', '\x0b', '\x0c', ',', ';', ':', '/', '\\', '|', '"', '(', ')', '[',
    ']', '{', '}', '<', '>',
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UriError {
    #[error("Not a file-sharing URI: {0}")]
    UnknownScheme(String),

    #[error("Malformed CHK URI: {0}")]
    MalformedChk(String),

    #[error("Malformed LOC URI: {0}")]
    MalformedLoc(String),

    #[error("Malformed KSK URI: {0}")]
    MalformedKsk(String),

    #[error("Malformed SKS URI: {0}")]
    MalformedSks(String),

    #[error("Location signature is invalid")]
    BadSignature,

    #[error("Operation requires a {0} URI")]
    WrongKind(&'static str),
}

pub type Result<T> = std::result::Result<T, UriError>;

/// Identifies a file: root CHK plus the authoritative length
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileIdentifier {
    pub chk: ContentHashKey,
    pub file_length: u64,
}

/// A namespace is named by its ed25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespaceId(pub [u8; PUBLIC_KEY_SIZE]);

impl NamespaceId {
    pub fn from_signing_key(key: &SigningKey) -> Self {
        NamespaceId(key.verifying_key().to_bytes())
    }

    pub fn to_enc(&self) -> String {
        data_to_string(&self.0)
    }

    pub fn from_enc(s: &str) -> Result<Self> {
        let bytes = string_to_data(s, PUBLIC_KEY_SIZE)
            .map_err(|e| UriError::MalformedSks(e.to_string()))?;
        let mut out = [0u8; PUBLIC_KEY_SIZE];
        out.copy_from_slice(&bytes);
        Ok(NamespaceId(out))
    }
}

impl fmt::Debug for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let enc = self.to_enc();
        write!(f, "NamespaceId({})", &enc[..8])
    }
}

/// A keyword of a KSK URI
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Keyword {
    pub word: String,
    pub mandatory: bool,
}

impl Keyword {
    pub fn optional(word: impl Into<String>) -> Self {
        Keyword {
            word: word.into(),
            mandatory: false,
        }
    }

    pub fn mandatory(word: impl Into<String>) -> Self {
        Keyword {
            word: word.into(),
            mandatory: true,
        }
    }

    /// Decode the prefixed form: `+word` is mandatory, ` word` (or bare) optional
    pub fn from_prefixed(s: &str) -> Self {
        if let Some(rest) = s.strip_prefix('+') {
            Keyword::mandatory(rest)
        } else {
            Keyword::optional(s.strip_prefix(' ').unwrap_or(s))
        }
    }

    pub fn to_prefixed(&self) -> String {
        if self.mandatory {
            format!("+{}", self.word)
        } else {
            format!(" {}", self.word)
        }
    }
}

/// Location: a CHK plus a signed promise by a peer to serve it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Location {
    pub fi: FileIdentifier,
    pub peer: [u8; PUBLIC_KEY_SIZE],
    /// Expiration in seconds since the UNIX epoch
    pub expiration: u64,
    pub signature: [u8; SIGNATURE_SIZE],
}

impl Location {
    fn signed_message(fi: &FileIdentifier, expiration: u64) -> Vec<u8> {
        let mut msg = Vec::with_capacity(6 + CHK_SIZE + 16);
        msg.extend_from_slice(b"fs-loc");
        msg.extend_from_slice(&fi.chk.to_bytes());
        msg.extend_from_slice(&fi.file_length.to_be_bytes());
        msg.extend_from_slice(&expiration.to_be_bytes());
        msg
    }

    pub fn verify(&self) -> Result<()> {
        let msg = Self::signed_message(&self.fi, self.expiration);
        crypto::verify(&self.peer, &msg, &self.signature).map_err(|_| UriError::BadSignature)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Uri {
    Chk(FileIdentifier),
    Loc(Location),
    Ksk(Vec<Keyword>),
    Sks {
        namespace: NamespaceId,
        identifier: String,
    },
}

impl Uri {
    pub fn chk(chk: ContentHashKey, file_length: u64) -> Self {
        Uri::Chk(FileIdentifier { chk, file_length })
    }

    pub fn sks(namespace: NamespaceId, identifier: impl Into<String>) -> Self {
        Uri::Sks {
            namespace,
            identifier: identifier.into(),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix(URI_PREFIX)
            .ok_or_else(|| UriError::UnknownScheme(s.to_string()))?;
        if let Some(body) = rest.strip_prefix(CHK_INFIX) {
            let (fi, tail) = parse_file_identifier(body).map_err(UriError::MalformedChk)?;
            if !tail.is_empty() {
                return Err(UriError::MalformedChk(format!("trailing data `{}`", tail)));
            }
            Ok(Uri::Chk(fi))
        } else if let Some(body) = rest.strip_prefix(LOC_INFIX) {
            parse_loc(body)
        } else if let Some(body) = rest.strip_prefix(KSK_INFIX) {
            parse_ksk(body).map(Uri::Ksk)
        } else if let Some(body) = rest.strip_prefix(SKS_INFIX) {
            parse_sks(body)
        } else {
            Err(UriError::UnknownScheme(s.to_string()))
        }
    }

    pub fn is_chk(&self) -> bool {
        matches!(self, Uri::Chk(_))
    }

    pub fn is_loc(&self) -> bool {
        matches!(self, Uri::Loc(_))
    }

    pub fn is_ksk(&self) -> bool {
        matches!(self, Uri::Ksk(_))
    }

    pub fn is_sks(&self) -> bool {
        matches!(self, Uri::Sks { .. })
    }

    /// File identifier of CHK and LOC URIs
    pub fn file_identifier(&self) -> Option<&FileIdentifier> {
        match self {
            Uri::Chk(fi) => Some(fi),
            Uri::Loc(loc) => Some(&loc.fi),
            _ => None,
        }
    }

    /// Authoritative file size of CHK and LOC URIs
    pub fn chk_file_size(&self) -> Option<u64> {
        self.file_identifier().map(|fi| fi.file_length)
    }

    pub fn keywords(&self) -> &[Keyword] {
        match self {
            Uri::Ksk(kws) => kws,
            _ => &[],
        }
    }

    /// Stable key for hash maps of results
    pub fn to_key(&self) -> HashCode {
        match self {
            Uri::Chk(fi) => fi.chk.key.xor(&fi.chk.query),
            Uri::Loc(loc) => HashCode::digest_parts(&[
                &loc.fi.chk.to_bytes(),
                &loc.fi.file_length.to_be_bytes(),
                &loc.peer,
            ]),
            Uri::Sks {
                namespace,
                identifier,
            } => HashCode::digest_parts(&[&namespace.0, identifier.as_bytes()]),
            Uri::Ksk(_) => HashCode::digest(self.to_string().as_bytes()),
        }
    }

    /// Keyword URI from command-line style arguments (`+word` is mandatory)
    pub fn ksk_from_args<S: AsRef<str>>(args: &[S]) -> Self {
        let mut kws: Vec<Keyword> = Vec::new();
        for arg in args {
            let kw = Keyword::from_prefixed(arg.as_ref());
            if !kw.word.is_empty() && !kws.iter().any(|k| k.word == kw.word) {
                kws.push(kw);
            }
        }
        Uri::Ksk(kws)
    }

    /// Keyword URI from a query string; quotes group words with spaces
    pub fn ksk_from_query(query: &str) -> Result<Self> {
        let mut args = Vec::new();
        let mut current = String::new();
        let mut in_quote = false;
        for c in query.chars() {
            match c {
                '"' => in_quote = !in_quote,
                c if c.is_whitespace() && !in_quote => {
                    if !current.is_empty() {
                        args.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            }
        }
        if in_quote {
            return Err(UriError::MalformedKsk("quotes not balanced".into()));
        }
        if !current.is_empty() {
            args.push(current);
        }
        if args.is_empty() {
            return Err(UriError::MalformedKsk("no keywords".into()));
        }
        Ok(Uri::ksk_from_args(&args))
    }

    /// Union of two keyword URIs; mandatory wins when both carry a keyword
    pub fn ksk_merge(a: &Uri, b: &Uri) -> Result<Uri> {
        let (Uri::Ksk(ka), Uri::Ksk(kb)) = (a, b) else {
            return Err(UriError::WrongKind("KSK"));
        };
        let mut merged = ka.clone();
        for kw in kb {
            match merged.iter_mut().find(|k| k.word == kw.word) {
                Some(existing) => existing.mandatory |= kw.mandatory,
                None => merged.push(kw.clone()),
            }
        }
        Ok(Uri::Ksk(merged))
    }

    /// Lower-case and de-duplicate keywords
    pub fn ksk_canonicalize(&self) -> Result<Uri> {
        let Uri::Ksk(kws) = self else {
            return Err(UriError::WrongKind("KSK"));
        };
        let mut out: Vec<Keyword> = Vec::new();
        for kw in kws {
            let word = kw.word.to_lowercase();
            match out.iter_mut().find(|k| k.word == word) {
                Some(existing) => existing.mandatory |= kw.mandatory,
                None => out.push(Keyword {
                    word,
                    mandatory: kw.mandatory,
                }),
            }
        }
        Ok(Uri::Ksk(out))
    }

    /// Optional keywords derived from the textual metadata of a file
    pub fn ksk_from_metadata(meta: &MetaData) -> Uri {
        let mut seen = BTreeSet::new();
        let mut kws = Vec::new();
        let mut add = |word: &str| {
            let word = word.trim();
            if word.chars().count() >= 2 && seen.insert(word.to_string()) {
                kws.push(Keyword::optional(word));
            }
        };
        for item in meta.iter() {
            if item.format != MetaFormat::Utf8 || !item.meta_type.is_keyword_source() {
                continue;
            }
            let Ok(value) = std::str::from_utf8(&item.data) else {
                continue;
            };
            let value = value.trim_end_matches('\0');
            add(value);
            if item.meta_type == MetaType::OriginalFilename {
                if let Some((stem, _)) = value.rsplit_once('.') {
                    add(stem);
                }
            }
            for token in value.split(KEYWORD_SEPARATORS) {
                add(token);
            }
        }
        Uri::Ksk(kws)
    }

    /// Wrap a CHK URI into a LOC URI signed by `key`
    pub fn loc_create(base: &Uri, key: &SigningKey, expiration: u64) -> Result<Uri> {
        let Uri::Chk(fi) = base else {
            return Err(UriError::WrongKind("CHK"));
        };
        let msg = Location::signed_message(fi, expiration);
        Ok(Uri::Loc(Location {
            fi: *fi,
            peer: key.verifying_key().to_bytes(),
            expiration,
            signature: crypto::sign(key, &msg),
        }))
    }

    /// The CHK URI inside a LOC URI
    pub fn loc_chk(&self) -> Option<Uri> {
        match self {
            Uri::Loc(loc) => Some(Uri::Chk(loc.fi)),
            _ => None,
        }
    }

    pub fn loc_peer(&self) -> Option<[u8; PUBLIC_KEY_SIZE]> {
        match self {
            Uri::Loc(loc) => Some(loc.peer),
            _ => None,
        }
    }

    pub fn loc_expiration(&self) -> Option<u64> {
        match self {
            Uri::Loc(loc) => Some(loc.expiration),
            _ => None,
        }
    }
}

impl FromStr for Uri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self> {
        Uri::parse(s)
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Uri::Chk(fi) => write!(
                f,
                "{}{}{}.{}.{}",
                URI_PREFIX,
                CHK_INFIX,
                fi.chk.key.to_enc(),
                fi.chk.query.to_enc(),
                fi.file_length
            ),
            Uri::Loc(loc) => write!(
                f,
                "{}{}{}.{}.{}.{}.{}.{}",
                URI_PREFIX,
                LOC_INFIX,
                loc.fi.chk.key.to_enc(),
                loc.fi.chk.query.to_enc(),
                loc.fi.file_length,
                URL_SAFE_NO_PAD.encode(loc.peer),
                URL_SAFE_NO_PAD.encode(loc.signature),
                loc.expiration
            ),
            Uri::Ksk(kws) => {
                write!(f, "{}{}", URI_PREFIX, KSK_INFIX)?;
                for (i, kw) in kws.iter().enumerate() {
                    if i > 0 {
                        f.write_str("+")?;
                    }
                    if kw.mandatory {
                        f.write_str("%2B")?;
                    }
                    f.write_str(&percent_encode(&kw.word))?;
                }
                Ok(())
            }
            Uri::Sks {
                namespace,
                identifier,
            } => write!(
                f,
                "{}{}{}/{}",
                URI_PREFIX,
                SKS_INFIX,
                namespace.to_enc(),
                percent_encode(identifier)
            ),
        }
    }
}

fn needs_percent(c: u8) -> bool {
    !(c.is_ascii_alphanumeric() || c == b'-' || c == b'_' || c == b'.' || c == b'~')
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if needs_percent(b) {
            out.push_str(&format!("%{:02X}", b));
        } else {
            out.push(b as char);
        }
    }
    out
}

/// Decode `%XX` escapes; `%22` (double quote) is dropped
fn percent_decode(s: &str) -> std::result::Result<String, String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| "`%` must be followed by a HEX number".to_string())?;
            i += 3;
            if hex != b'"' {
                out.push(hex);
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| "keyword is not valid UTF-8".to_string())
}

fn parse_ksk(body: &str) -> Result<Vec<Keyword>> {
    if body.is_empty() {
        return Err(UriError::MalformedKsk("no keywords".into()));
    }
    if body.starts_with('+') || body.ends_with('+') {
        return Err(UriError::MalformedKsk("must not begin or end with `+'".into()));
    }
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quote = false;
    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i..].starts_with(b"%22") {
            in_quote = !in_quote;
            i += 3;
            continue;
        }
        if bytes[i] == b'+' && !in_quote {
            if i > 0 && bytes[i - 1] == b'+' {
                return Err(UriError::MalformedKsk("`++' not allowed".into()));
            }
            parts.push(&body[start..i]);
            start = i + 1;
        }
        i += 1;
    }
    if in_quote {
        return Err(UriError::MalformedKsk("quotes not balanced".into()));
    }
    parts.push(&body[start..]);
    let mut kws = Vec::with_capacity(parts.len());
    for part in parts {
        let decoded = percent_decode(part).map_err(UriError::MalformedKsk)?;
        kws.push(Keyword::from_prefixed_decoded(&decoded));
    }
    Ok(kws)
}

impl Keyword {
    /// In decoded URI text a keyword without `+` is optional even if it
    /// begins with a space
    fn from_prefixed_decoded(s: &str) -> Self {
        match s.strip_prefix('+') {
            Some(rest) => Keyword::mandatory(rest),
            None => Keyword::optional(s),
        }
    }
}

fn parse_sks(body: &str) -> Result<Uri> {
    let (ns, id) = body
        .split_once('/')
        .ok_or_else(|| UriError::MalformedSks("missing identifier".into()))?;
    let namespace = NamespaceId::from_enc(ns)?;
    let identifier = percent_decode(id).map_err(UriError::MalformedSks)?;
    Ok(Uri::Sks {
        namespace,
        identifier,
    })
}

/// Parse `<key>.<query>.<length>` and return the unparsed tail
fn parse_file_identifier(body: &str) -> std::result::Result<(FileIdentifier, &str), String> {
    let mut it = body.splitn(3, '.');
    let key = it.next().ok_or("missing key")?;
    let query = it.next().ok_or("missing query")?;
    let rest = it.next().ok_or("missing length")?;
    let (len, tail) = match rest.split_once('.') {
        Some((len, tail)) => (len, tail),
        None => (rest, ""),
    };
    let key = HashCode::from_enc(key).map_err(|e| e.to_string())?;
    let query = HashCode::from_enc(query).map_err(|e| e.to_string())?;
    if len.is_empty() || !len.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("bad length `{}`", len));
    }
    let file_length = len.parse::<u64>().map_err(|e| e.to_string())?;
    Ok((
        FileIdentifier {
            chk: ContentHashKey { key, query },
            file_length,
        },
        tail,
    ))
}

fn parse_loc(body: &str) -> Result<Uri> {
    let (fi, tail) = parse_file_identifier(body).map_err(UriError::MalformedLoc)?;
    let parts: Vec<&str> = tail.split('.').collect();
    if parts.len() != 3 {
        return Err(UriError::MalformedLoc("expected peer, signature and expiration".into()));
    }
    let peer_bytes = URL_SAFE_NO_PAD
        .decode(parts[0])
        .map_err(|e| UriError::MalformedLoc(format!("peer: {}", e)))?;
    let sig_bytes = URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|e| UriError::MalformedLoc(format!("signature: {}", e)))?;
    let peer: [u8; PUBLIC_KEY_SIZE] = peer_bytes
        .as_slice()
        .try_into()
        .map_err(|_| UriError::MalformedLoc("peer key has wrong size".into()))?;
    let signature: [u8; SIGNATURE_SIZE] = sig_bytes
        .as_slice()
        .try_into()
        .map_err(|_| UriError::MalformedLoc("signature has wrong size".into()))?;
    let expiration = parts[2]
        .parse::<u64>()
        .map_err(|e| UriError::MalformedLoc(format!("expiration: {}", e)))?;
    let loc = Location {
        fi,
        peer,
        expiration,
        signature,
    };
    loc.verify()?;
    Ok(Uri::Loc(loc))
}
