//! Persisted state of running operations
//!
//! Every operation is mirrored into a file below the client directory so it
//! can be resumed after a restart:
//!
//! ```text
//! publish/<name>                 publish context, refers to its root node
//! publish-file/<name>            one file information node each
//! search/<name>                  top-level search
//! search/<name>.dir/<name>       its results
//! search-child/<name>            namespace update searches
//! download/<name>                top-level download
//! download/<name>.dir/<name>     recursive children, nested the same way
//! download-child/<name>          downloads started from a search result
//! unindex/<name>
//! ```
//!
//! Names are short random tokens allocated on the first sync. Every sync
//! rewrites the whole file through [`WriteHandle`]. A file that fails to
//! load is logged and removed; whatever referred to it carries on without
//! it.

use ed25519_dalek::SigningKey;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::bio::{self, BioError, ReadHandle, WriteHandle};
use crate::crypto::ContentHashKey;
use crate::download::{BlockRequestState, DownloadContext, DownloadOptions, RequestTree};
use crate::events::{
    DownloadId, DownloadStatus, PublishId, ResultId, SearchId, SearchStatus, UnindexId,
};
use crate::file_info::{FileInformation, FileKind};
use crate::fs::{Fs, Task};
use crate::publish::{NamespacePublish, PublishContext, PublishOptions};
use crate::reader::{DataReader, FileReader, MemoryReader};
use crate::search::{SearchContext, SearchOptions, SearchResult};
use crate::service::BlockOptions;
use crate::unindex::{UnindexContext, UnindexState};

const PUBLISH_DIR: &str = "publish";
const PUBLISH_FILE_DIR: &str = "publish-file";
const SEARCH_DIR: &str = "search";
const SEARCH_CHILD_DIR: &str = "search-child";
const DOWNLOAD_DIR: &str = "download";
const DOWNLOAD_CHILD_DIR: &str = "download-child";
const UNINDEX_DIR: &str = "unindex";

/// Appended to a state file to name the directory of its children
const CHILD_SUFFIX: &str = ".dir";

const NAME_LEN: usize = 6;

const MAX_STRING: usize = 64 * 1024;

/// Largest in-memory file data or directory blob persisted by value
const MAX_BLOB: u64 = 1024 * 1024 * 1024;

/// Short random token naming a state file
pub(crate) fn random_name() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NAME_LEN)
        .map(char::from)
        .collect()
}

/// Random name not yet taken in `dir`
fn fresh_name(dir: &Path) -> String {
    loop {
        let name = random_name();
        if !dir.join(&name).exists() {
            return name;
        }
    }
}

fn child_dir(file: &Path) -> PathBuf {
    let mut dir = file.as_os_str().to_owned();
    dir.push(CHILD_SUFFIX);
    PathBuf::from(dir)
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Start time of an operation that had been running for `ms`
fn start_from_ms(ms: u64) -> Instant {
    let now = Instant::now();
    now.checked_sub(Duration::from_millis(ms)).unwrap_or(now)
}

fn path_string(path: Option<&Path>) -> Option<String> {
    path.map(|p| p.to_string_lossy().into_owned())
}

fn commit(handle: WriteHandle) {
    let path = handle.path().to_path_buf();
    match handle.close() {
        Ok(()) => trace!(path = %path.display(), "State file written"),
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to write state file"),
    }
}

fn remove_logged(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove state file");
        }
    }
}

/// Remove a state file together with the state of its children
fn remove_state(path: &Path) {
    remove_logged(path);
    let dir = child_dir(path);
    if let Err(e) = fs::remove_dir_all(&dir) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %dir.display(), error = %e, "Failed to remove state directory");
        }
    }
}

fn discard(path: &Path, error: &BioError) {
    warn!(path = %path.display(), error = %error, "Removing unreadable state file");
    remove_state(path);
}

/// State files in `dir` with their names, skipping child directories and
/// dropping leftovers of interrupted writes
fn state_files(dir: &Path) -> Vec<(String, PathBuf)> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %dir.display(), error = %e, "Failed to scan state directory");
            }
            return Vec::new();
        }
    };
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
            continue;
        };
        if name.ends_with(".tmp") {
            remove_logged(&path);
            continue;
        }
        if path.is_dir() {
            continue;
        }
        out.push((name, path));
    }
    out.sort();
    out
}

fn invalid(what: &'static str, reason: impl Into<String>) -> BioError {
    BioError::Invalid {
        what,
        reason: reason.into(),
    }
}

fn write_options(w: &mut WriteHandle, options: &BlockOptions) {
    w.write_u64(options.expiration)
        .write_u32(options.anonymity)
        .write_u32(options.content_priority)
        .write_u32(options.replication);
}

fn read_options(r: &mut ReadHandle) -> bio::Result<BlockOptions> {
    Ok(BlockOptions {
        expiration: r.read_u64("expiration")?,
        anonymity: r.read_u32("anonymity")?,
        content_priority: r.read_u32("content priority")?,
        replication: r.read_u32("replication")?,
    })
}

fn write_chk(w: &mut WriteHandle, chk: &ContentHashKey) {
    w.write_hash(&chk.key).write_hash(&chk.query);
}

fn read_chk(r: &mut ReadHandle) -> bio::Result<ContentHashKey> {
    Ok(ContentHashKey {
        key: r.read_hash("chk key")?,
        query: r.read_hash("chk query")?,
    })
}

/// Write `fi` and its descendants, children first; returns the node's name
fn write_file_info(fi: &mut FileInformation, dir: &Path) -> String {
    let mut child_names = Vec::new();
    if let FileKind::Directory { children, .. } = &mut fi.kind {
        for child in children.iter_mut() {
            child_names.push(write_file_info(child, dir));
        }
    }
    let name = fi
        .serialization
        .get_or_insert_with(|| fresh_name(dir))
        .clone();
    let mut w = WriteHandle::create(dir.join(&name));
    w.write_meta(Some(&fi.meta))
        .write_uri(fi.keywords.as_ref())
        .write_uri(fi.chk_uri.as_ref())
        .write_uri(fi.sks_uri.as_ref())
        .write_string(fi.emsg.as_deref())
        .write_string(path_string(fi.filename.as_deref()).as_deref())
        .write_bool(fi.is_published)
        .write_u64(elapsed_ms(fi.start_time));
    write_options(&mut w, &fi.options);
    match &fi.kind {
        FileKind::File {
            reader,
            size,
            do_index,
            file_id,
            index_start_confirmed,
        } => {
            w.write_u8(0)
                .write_u64(*size)
                .write_bool(*do_index)
                .write_bool(*index_start_confirmed)
                .write_bool(file_id.is_some());
            if let Some(file_id) = file_id {
                w.write_hash(file_id);
            }
            if let Some(path) = reader.path() {
                w.write_u8(0)
                    .write_string(path_string(Some(path)).as_deref());
            } else if let Some(data) = reader.snapshot() {
                w.write_u8(1).write_bytes(&data);
            } else {
                w.write_u8(2);
            }
        }
        FileKind::Directory { dir_data, .. } => {
            w.write_u8(1).write_bool(dir_data.is_some());
            if let Some(data) = dir_data {
                w.write_bytes(data);
            }
            w.write_u32(child_names.len() as u32);
            for child in &child_names {
                w.write_string(Some(child));
            }
        }
    }
    commit(w);
    name
}

/// Load the node `name` and its descendants; a child that fails to load is
/// dropped from its directory
fn read_file_info(
    dir: &Path,
    name: &str,
    seen: &mut HashSet<String>,
) -> bio::Result<FileInformation> {
    if !seen.insert(name.to_owned()) {
        return Err(invalid("file information", format!("`{}' appears twice", name)));
    }
    let path = dir.join(name);
    let mut r = ReadHandle::open(&path)?;
    let meta = r.read_meta("metadata")?.unwrap_or_default();
    let keywords = r.read_uri("keywords")?;
    let chk_uri = r.read_uri("chk uri")?;
    let sks_uri = r.read_uri("sks uri")?;
    let mut emsg = r.read_string("error message", MAX_STRING)?;
    let filename = r.read_string("filename", MAX_STRING)?.map(PathBuf::from);
    let is_published = r.read_bool("published flag")?;
    let start_time = start_from_ms(r.read_u64("start time")?);
    let options = read_options(&mut r)?;
    let kind = match r.read_u8("node kind")? {
        0 => {
            let size = r.read_u64("file size")?;
            let do_index = r.read_bool("index flag")?;
            let index_start_confirmed = r.read_bool("index confirmation")?;
            let file_id = if r.read_bool("file id flag")? {
                Some(r.read_hash("file id")?)
            } else {
                None
            };
            let reader: Box<dyn DataReader> = match r.read_u8("reader kind")? {
                0 => {
                    let path = r
                        .read_string("reader path", MAX_STRING)?
                        .ok_or_else(|| invalid("reader path", "missing"))?;
                    Box::new(FileReader::new(path))
                }
                1 => Box::new(MemoryReader::new(r.read_bytes("file data", MAX_BLOB)?)),
                2 => {
                    if chk_uri.is_none() && emsg.is_none() {
                        emsg = Some("Cannot resume publishing: the file data was not saved".into());
                    }
                    Box::new(MemoryReader::new(Vec::new()))
                }
                other => return Err(invalid("reader kind", other.to_string())),
            };
            FileKind::File {
                reader,
                size,
                do_index,
                file_id,
                index_start_confirmed,
            }
        }
        1 => {
            let dir_data = if r.read_bool("directory data flag")? {
                Some(r.read_bytes("directory data", MAX_BLOB)?)
            } else {
                None
            };
            let count = r.read_u32("child count")?;
            let mut children = Vec::new();
            for _ in 0..count {
                let Some(child) = r.read_string("child name", MAX_STRING)? else {
                    continue;
                };
                match read_file_info(dir, &child, seen) {
                    Ok(child) => children.push(child),
                    Err(e) => warn!(
                        path = %dir.join(&child).display(),
                        error = %e,
                        "Skipping unreadable directory entry of a publish"
                    ),
                }
            }
            FileKind::Directory { children, dir_data }
        }
        other => return Err(invalid("node kind", other.to_string())),
    };
    Ok(FileInformation {
        meta,
        keywords,
        options,
        filename,
        chk_uri,
        sks_uri,
        emsg,
        is_published,
        start_time,
        serialization: Some(name.to_owned()),
        kind,
    })
}

fn remove_file_info(fi: &mut FileInformation, dir: &Path) {
    if let Some(name) = fi.serialization.take() {
        remove_logged(&dir.join(name));
    }
    for child in fi.children_mut() {
        remove_file_info(child, dir);
    }
}

struct PublishRecord {
    options: PublishOptions,
    all_done: bool,
    start_time: Instant,
    fi_pos: Option<Vec<usize>>,
    namespace: Option<NamespacePublish>,
    root: String,
}

fn read_publish(path: &Path) -> bio::Result<PublishRecord> {
    let mut r = ReadHandle::open(path)?;
    let options = PublishOptions::from_bits(r.read_u32("publish options")?);
    let all_done = r.read_bool("done flag")?;
    let start_time = start_from_ms(r.read_u64("start time")?);
    let root = r
        .read_string("root node", MAX_STRING)?
        .ok_or_else(|| invalid("root node", "missing"))?;
    let fi_pos = if r.read_bool("position flag")? {
        let len = r.read_u32("position length")?;
        let mut pos = Vec::new();
        for _ in 0..len {
            pos.push(r.read_u32("position")? as usize);
        }
        Some(pos)
    } else {
        None
    };
    let namespace = if r.read_bool("namespace flag")? {
        let blob = r.read_blob("namespace key", 32)?;
        let seed: [u8; 32] = blob
            .as_ref()
            .try_into()
            .map_err(|_| invalid("namespace key", "wrong length"))?;
        let identifier = r
            .read_string("namespace identifier", MAX_STRING)?
            .ok_or_else(|| invalid("namespace identifier", "missing"))?;
        let update = r.read_string("namespace update", MAX_STRING)?;
        Some(NamespacePublish {
            key: SigningKey::from_bytes(&seed),
            identifier,
            update,
        })
    } else {
        None
    };
    Ok(PublishRecord {
        options,
        all_done,
        start_time,
        fi_pos,
        namespace,
        root,
    })
}

struct DownloadRecord {
    uri: crate::uri::Uri,
    meta: Option<crate::metadata::MetaData>,
    filename: Option<PathBuf>,
    temp_filename: Option<PathBuf>,
    offset: u64,
    length: u64,
    completed: u64,
    anonymity: u32,
    options: DownloadOptions,
    emsg: Option<String>,
    has_finished: bool,
    start_time: Instant,
    tree: Option<RequestTree>,
}

fn read_download(path: &Path) -> bio::Result<DownloadRecord> {
    let mut r = ReadHandle::open(path)?;
    let uri = r
        .read_uri("download uri")?
        .ok_or_else(|| invalid("download uri", "missing"))?;
    let file_length = uri
        .chk_file_size()
        .ok_or_else(|| invalid("download uri", "not a CHK or LOC URI"))?;
    let meta = r.read_meta("metadata")?;
    let filename = r.read_string("filename", MAX_STRING)?.map(PathBuf::from);
    let temp_filename = r.read_string("temporary filename", MAX_STRING)?.map(PathBuf::from);
    let offset = r.read_u64("offset")?;
    let length = r.read_u64("length")?;
    let completed = r.read_u64("completed")?;
    if offset.checked_add(length).map_or(true, |end| end > file_length) || completed > length {
        return Err(invalid("download range", format!("{}+{} of {}", offset, length, file_length)));
    }
    let anonymity = r.read_u32("anonymity")?;
    let options = DownloadOptions::from_bits(r.read_u32("download options")?);
    let emsg = r.read_string("error message", MAX_STRING)?;
    let has_finished = r.read_bool("finished flag")?;
    let start_time = start_from_ms(r.read_u64("start time")?);
    let tree = if r.read_bool("tree flag")? {
        let mut tree = RequestTree::build(file_length, offset, length);
        let count = r.read_u32("node count")? as usize;
        if count != tree.nodes.len() {
            return Err(invalid(
                "request tree",
                format!("{} nodes stored, {} expected", count, tree.nodes.len()),
            ));
        }
        for node in tree.nodes.iter_mut() {
            let code = r.read_u8("node state")?;
            node.state = BlockRequestState::from_code(code)
                .ok_or_else(|| invalid("node state", code.to_string()))?;
            if node.state.has_chk() {
                node.chk = read_chk(&mut r)?;
            }
        }
        Some(tree)
    } else {
        None
    };
    Ok(DownloadRecord {
        uri,
        meta,
        filename,
        temp_filename,
        offset,
        length,
        completed,
        anonymity,
        options,
        emsg,
        has_finished,
        start_time,
        tree,
    })
}

struct SearchRecord {
    query: crate::uri::Uri,
    emsg: Option<String>,
    start_time: Instant,
    anonymity: u32,
    options: SearchOptions,
    paused: bool,
}

fn read_search(path: &Path) -> bio::Result<SearchRecord> {
    let mut r = ReadHandle::open(path)?;
    Ok(SearchRecord {
        query: r
            .read_uri("search query")?
            .ok_or_else(|| invalid("search query", "missing"))?,
        emsg: r.read_string("error message", MAX_STRING)?,
        start_time: start_from_ms(r.read_u64("start time")?),
        anonymity: r.read_u32("anonymity")?,
        options: SearchOptions::from_bits(r.read_u32("search options")?),
        paused: r.read_bool("paused flag")?,
    })
}

struct ResultRecord {
    uri: crate::uri::Uri,
    meta: crate::metadata::MetaData,
    download: Option<String>,
    update_search: Option<String>,
    mandatory_missing: u32,
    optional_support: u32,
    availability_success: u32,
    availability_trials: u32,
    keyword_bitmap: Vec<bool>,
}

fn read_result(path: &Path) -> bio::Result<ResultRecord> {
    let mut r = ReadHandle::open(path)?;
    let uri = r
        .read_uri("result uri")?
        .ok_or_else(|| invalid("result uri", "missing"))?;
    let meta = r.read_meta("result metadata")?.unwrap_or_default();
    let download = r.read_string("download name", MAX_STRING)?;
    let update_search = r.read_string("update search name", MAX_STRING)?;
    let mandatory_missing = r.read_u32("mandatory missing")?;
    let optional_support = r.read_u32("optional support")?;
    let availability_success = r.read_u32("availability success")?;
    let availability_trials = r.read_u32("availability trials")?;
    let count = r.read_u32("keyword count")?;
    let mut keyword_bitmap = Vec::new();
    for _ in 0..count {
        keyword_bitmap.push(r.read_bool("keyword bit")?);
    }
    Ok(ResultRecord {
        uri,
        meta,
        download,
        update_search,
        mandatory_missing,
        optional_support,
        availability_success,
        availability_trials,
        keyword_bitmap,
    })
}

struct UnindexRecord {
    filename: PathBuf,
    file_size: u64,
    state: UnindexState,
    file_id: Option<crate::crypto::HashCode>,
    chk_uri: Option<crate::uri::Uri>,
    ksk: Option<crate::uri::Uri>,
    ksk_offset: usize,
    emsg: Option<String>,
    start_time: Instant,
}

fn read_unindex(path: &Path) -> bio::Result<UnindexRecord> {
    let mut r = ReadHandle::open(path)?;
    let filename = r
        .read_string("filename", MAX_STRING)?
        .map(PathBuf::from)
        .ok_or_else(|| invalid("filename", "missing"))?;
    let file_size = r.read_u64("file size")?;
    let code = r.read_u32("unindex state")?;
    let state =
        UnindexState::from_code(code).ok_or_else(|| invalid("unindex state", code.to_string()))?;
    let file_id = if r.read_bool("file id flag")? {
        Some(r.read_hash("file id")?)
    } else {
        None
    };
    Ok(UnindexRecord {
        filename,
        file_size,
        state,
        file_id,
        chk_uri: r.read_uri("chk uri")?,
        ksk: r.read_uri("keywords")?,
        ksk_offset: r.read_u32("keyword offset")? as usize,
        emsg: r.read_string("error message", MAX_STRING)?,
        start_time: start_from_ms(r.read_u64("start time")?),
    })
}

impl Fs {
    fn state_dir(&self, kind: &str) -> PathBuf {
        self.config.client_dir().join(kind)
    }

    /// Load every persisted operation and restart it
    pub(crate) fn resume_all(&mut self) {
        let publishes = self.resume_publishes();
        let searches = self.resume_searches();
        let downloads = self.resume_downloads();
        let unindexes = self.resume_unindexes();
        info!(publishes, searches, downloads, unindexes, "Resumed persisted operations");
    }

    // publish

    pub(crate) fn publish_sync(&mut self, id: PublishId) {
        if !self.config.persistence {
            return;
        }
        let file_dir = self.state_dir(PUBLISH_FILE_DIR);
        let dir = self.state_dir(PUBLISH_DIR);
        let Some(pc) = self.publishes.get_mut(&id) else {
            return;
        };
        let root = write_file_info(&mut pc.fi, &file_dir);
        let name = pc
            .serialization
            .get_or_insert_with(|| fresh_name(&dir))
            .clone();
        let mut w = WriteHandle::create(dir.join(name));
        w.write_u32(pc.options.to_bits())
            .write_bool(pc.all_done)
            .write_u64(elapsed_ms(pc.start_time))
            .write_string(Some(&root));
        match &pc.fi_pos {
            None => {
                w.write_bool(false);
            }
            Some(pos) => {
                w.write_bool(true).write_u32(pos.len() as u32);
                for i in pos {
                    w.write_u32(*i as u32);
                }
            }
        }
        match &pc.namespace {
            None => {
                w.write_bool(false);
            }
            Some(ns) => {
                w.write_bool(true)
                    .write_blob(&ns.key.to_bytes())
                    .write_string(Some(&ns.identifier))
                    .write_string(ns.update.as_deref());
            }
        }
        commit(w);
    }

    pub(crate) fn publish_remove_sync(&mut self, id: PublishId) {
        let file_dir = self.state_dir(PUBLISH_FILE_DIR);
        let dir = self.state_dir(PUBLISH_DIR);
        let Some(pc) = self.publishes.get_mut(&id) else {
            return;
        };
        if let Some(name) = pc.serialization.take() {
            remove_logged(&dir.join(name));
        }
        remove_file_info(&mut pc.fi, &file_dir);
    }

    fn resume_publishes(&mut self) -> usize {
        let file_dir = self.state_dir(PUBLISH_FILE_DIR);
        let mut referenced = HashSet::new();
        let mut count = 0;
        for (name, path) in state_files(&self.state_dir(PUBLISH_DIR)) {
            let record = match read_publish(&path) {
                Ok(record) => record,
                Err(e) => {
                    discard(&path, &e);
                    continue;
                }
            };
            let mut seen = HashSet::new();
            let fi = match read_file_info(&file_dir, &record.root, &mut seen) {
                Ok(fi) => fi,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Publish lost its file information");
                    remove_logged(&path);
                    continue;
                }
            };
            referenced.extend(seen);
            let id = PublishId(self.next_raw_id());
            let mut pc = PublishContext::new(id, fi, record.namespace, record.options);
            pc.all_done = record.all_done;
            pc.start_time = record.start_time;
            pc.fi_pos = match record.fi_pos {
                Some(pos) if pc.fi.node(&pos).is_none() => Some(Vec::new()),
                pos => pos,
            };
            pc.serialization = Some(name);
            debug!(publish = id.raw(), path = %path.display(), "Resuming publish");
            self.publish_resume(pc);
            count += 1;
        }
        for (name, path) in state_files(&file_dir) {
            if !referenced.contains(&name) {
                debug!(path = %path.display(), "Removing orphaned file information");
                remove_logged(&path);
            }
        }
        count
    }

    // download

    /// State file of a download, allocating names up the parent chain when
    /// `create` is set
    fn download_file(&mut self, id: DownloadId, create: bool) -> Option<PathBuf> {
        let dc = self.downloads.get(&id)?;
        if dc.options.is_probe || dc.probe_of.is_some() {
            return None;
        }
        let (parent, from_search) = (dc.parent, dc.search.is_some());
        let dir = match parent {
            Some(parent) => child_dir(&self.download_file(parent, create)?),
            None if from_search => self.state_dir(DOWNLOAD_CHILD_DIR),
            None => self.state_dir(DOWNLOAD_DIR),
        };
        let dc = self.downloads.get_mut(&id)?;
        let name = match &dc.serialization {
            Some(name) => name.clone(),
            None if create => dc.serialization.insert(fresh_name(&dir)).clone(),
            None => return None,
        };
        Some(dir.join(name))
    }

    pub(crate) fn download_sync(&mut self, id: DownloadId) {
        if !self.config.persistence {
            return;
        }
        let Some(path) = self.download_file(id, true) else {
            return;
        };
        let Some(dc) = self.downloads.get(&id) else {
            return;
        };
        let mut w = WriteHandle::create(path);
        w.write_uri(Some(&dc.uri))
            .write_meta(dc.meta.as_ref())
            .write_string(path_string(dc.filename.as_deref()).as_deref())
            .write_string(path_string(dc.temp_filename.as_deref()).as_deref())
            .write_u64(dc.offset)
            .write_u64(dc.length)
            .write_u64(dc.completed)
            .write_u32(dc.anonymity)
            .write_u32(dc.options.to_bits())
            .write_string(dc.emsg.as_deref())
            .write_bool(dc.has_finished)
            .write_u64(elapsed_ms(dc.start_time));
        match &dc.tree {
            None => {
                w.write_bool(false);
            }
            Some(tree) => {
                w.write_bool(true).write_u32(tree.nodes.len() as u32);
                for node in &tree.nodes {
                    w.write_u8(node.state.code());
                    if node.state.has_chk() {
                        write_chk(&mut w, &node.chk);
                    }
                }
            }
        }
        commit(w);
    }

    fn download_sync_tree(&mut self, id: DownloadId) {
        self.download_sync(id);
        let children = self
            .downloads
            .get(&id)
            .map(|dc| dc.children.clone())
            .unwrap_or_default();
        for child in children {
            self.download_sync_tree(child);
        }
    }

    /// Forget the state of a download and of its children
    pub(crate) fn download_remove_sync(&mut self, id: DownloadId) {
        if let Some(path) = self.download_file(id, false) {
            remove_state(&path);
        }
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            if let Some(dc) = self.downloads.get_mut(&id) {
                dc.serialization = None;
                stack.extend(dc.children.iter().copied());
            }
        }
    }

    /// Turn a download started from a search result into a top-level one
    pub(crate) fn download_detach_from_search(&mut self, id: DownloadId) {
        let old = if self.config.persistence {
            self.download_file(id, false)
        } else {
            None
        };
        let Some(dc) = self.downloads.get_mut(&id) else {
            return;
        };
        dc.search = None;
        let Some(old) = old else {
            return;
        };
        let dir = self.state_dir(DOWNLOAD_DIR);
        let name = fresh_name(&dir);
        let new = dir.join(&name);
        let moved = fs::create_dir_all(&dir).and_then(|()| fs::rename(&old, &new));
        if let Err(e) = moved {
            warn!(path = %old.display(), error = %e, "Failed to move download state, rewriting it");
            self.download_remove_sync(id);
            self.download_sync_tree(id);
            return;
        }
        if let Some(dc) = self.downloads.get_mut(&id) {
            dc.serialization = Some(name);
        }
        let old_children = child_dir(&old);
        if old_children.exists() {
            if let Err(e) = fs::rename(&old_children, child_dir(&new)) {
                warn!(path = %old_children.display(), error = %e, "Failed to move child download state");
                let children = self
                    .downloads
                    .get(&id)
                    .map(|dc| dc.children.clone())
                    .unwrap_or_default();
                for child in children {
                    self.download_remove_sync(child);
                    self.download_sync_tree(child);
                }
            }
        }
    }

    /// Load the download at `path` and its children
    fn load_download(
        &mut self,
        name: String,
        path: &Path,
        parent: Option<DownloadId>,
        search: Option<ResultId>,
    ) -> Option<DownloadId> {
        let record = match read_download(path) {
            Ok(record) => record,
            Err(e) => {
                discard(path, &e);
                return None;
            }
        };
        let id = DownloadId(self.next_raw_id());
        let mut dc = DownloadContext::new(
            id,
            record.uri,
            record.meta,
            record.filename,
            record.temp_filename,
            record.offset,
            record.length,
            record.anonymity,
            record.options,
            self.config.reconnect_delay(),
        );
        dc.parent = parent;
        dc.search = search;
        dc.completed = record.completed;
        dc.emsg = record.emsg;
        dc.has_finished = record.has_finished;
        dc.start_time = record.start_time;
        dc.tree = record.tree;
        dc.serialization = Some(name);
        let meta = dc.meta.clone();
        let message = dc.emsg.clone();
        let runnable = dc.emsg.is_none() && !dc.has_finished;
        debug!(download = id.raw(), path = %path.display(), "Resuming download");
        self.downloads.insert(id, dc);
        if let Some(parent) = parent.and_then(|p| self.downloads.get_mut(&p)) {
            parent.children.push(id);
        }
        self.download_emit(id, DownloadStatus::Resume { meta, message });
        for (child, child_path) in state_files(&child_dir(path)) {
            self.load_download(child, &child_path, Some(id), None);
        }
        if runnable {
            self.schedule(Task::DownloadStart(id));
            self.check_completed(id);
        }
        Some(id)
    }

    fn resume_downloads(&mut self) -> usize {
        let mut count = 0;
        for (name, path) in state_files(&self.state_dir(DOWNLOAD_DIR)) {
            if self.load_download(name, &path, None, None).is_some() {
                count += 1;
            }
        }
        count
    }

    // search

    fn search_file(&mut self, id: SearchId, create: bool) -> Option<PathBuf> {
        let sc = self.searches.get(&id)?;
        let dir = if sc.parent.is_some() {
            self.state_dir(SEARCH_CHILD_DIR)
        } else {
            self.state_dir(SEARCH_DIR)
        };
        let sc = self.searches.get_mut(&id)?;
        let name = match &sc.serialization {
            Some(name) => name.clone(),
            None if create => sc.serialization.insert(fresh_name(&dir)).clone(),
            None => return None,
        };
        Some(dir.join(name))
    }

    pub(crate) fn search_sync(&mut self, id: SearchId) {
        if !self.config.persistence {
            return;
        }
        let Some(path) = self.search_file(id, true) else {
            return;
        };
        let Some(sc) = self.searches.get(&id) else {
            return;
        };
        let mut w = WriteHandle::create(path);
        w.write_uri(Some(&sc.query))
            .write_string(sc.emsg.as_deref())
            .write_u64(elapsed_ms(sc.start_time))
            .write_u32(sc.anonymity)
            .write_u32(sc.options.to_bits())
            .write_bool(sc.paused);
        commit(w);
    }

    pub(crate) fn search_result_sync(&mut self, result: ResultId) {
        if !self.config.persistence {
            return;
        }
        let Some(sr) = self.search_result(result) else {
            return;
        };
        let (download, update) = (sr.download, sr.update_search);
        let download = download
            .and_then(|d| self.download_file(d, true))
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));
        let update = update
            .and_then(|s| self.search_file(s, true))
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));
        let Some(search_path) = self.search_file(result.search, true) else {
            return;
        };
        let dir = child_dir(&search_path);
        let Some(sr) = self.search_result_mut(result) else {
            return;
        };
        let name = sr
            .serialization
            .get_or_insert_with(|| fresh_name(&dir))
            .clone();
        let mut w = WriteHandle::create(dir.join(name));
        w.write_uri(Some(&sr.uri))
            .write_meta(Some(&sr.meta))
            .write_string(download.as_deref())
            .write_string(update.as_deref())
            .write_u32(sr.mandatory_missing)
            .write_u32(sr.optional_support)
            .write_u32(sr.availability_success)
            .write_u32(sr.availability_trials)
            .write_u32(sr.keyword_bitmap.len() as u32);
        for bit in &sr.keyword_bitmap {
            w.write_bool(*bit);
        }
        commit(w);
    }

    /// Forget the state of a search and its results
    pub(crate) fn search_remove_sync(&mut self, id: SearchId) {
        if let Some(path) = self.search_file(id, false) {
            remove_state(&path);
        }
        if let Some(sc) = self.searches.get_mut(&id) {
            sc.serialization = None;
            for sr in sc.results.values_mut() {
                sr.serialization = None;
            }
        }
    }

    pub(crate) fn search_result_remove_sync(&mut self, result: ResultId) {
        let Some(search_path) = self.search_file(result.search, false) else {
            return;
        };
        if let Some(name) = self
            .search_result_mut(result)
            .and_then(|sr| sr.serialization.take())
        {
            remove_logged(&child_dir(&search_path).join(name));
        }
    }

    /// Load the search at `path`, its results and everything they link to
    fn load_search(
        &mut self,
        name: String,
        path: &Path,
        parent: Option<ResultId>,
    ) -> Option<SearchId> {
        let record = match read_search(path) {
            Ok(record) => record,
            Err(e) => {
                discard(path, &e);
                return None;
            }
        };
        let id = SearchId(self.next_raw_id());
        let mut sc = match SearchContext::new(
            id,
            record.query,
            parent,
            record.anonymity,
            record.options,
            self.config.reconnect_delay(),
        ) {
            Ok(sc) => sc,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Removing unusable search state");
                remove_state(path);
                return None;
            }
        };
        sc.emsg = record.emsg;
        sc.start_time = record.start_time;
        sc.paused = record.paused;
        sc.serialization = Some(name);

        let mut links = Vec::new();
        for (result_name, result_path) in state_files(&child_dir(path)) {
            let rec = match read_result(&result_path) {
                Ok(rec) => rec,
                Err(e) => {
                    discard(&result_path, &e);
                    continue;
                }
            };
            if rec.keyword_bitmap.len() != sc.requests.len() {
                warn!(path = %result_path.display(), "Search result does not match its query, removing it");
                remove_logged(&result_path);
                continue;
            }
            let key = rec.uri.to_key();
            let result = ResultId { search: id, key };
            for (request, matched) in sc.requests.iter_mut().zip(&rec.keyword_bitmap) {
                if *matched {
                    request.results.insert(key);
                }
            }
            let mut sr = SearchResult::new(result, rec.uri, rec.meta, sc.requests.len());
            sr.mandatory_missing = rec.mandatory_missing;
            sr.optional_support = rec.optional_support;
            sr.availability_success = rec.availability_success;
            sr.availability_trials = rec.availability_trials;
            sr.keyword_bitmap = rec.keyword_bitmap;
            sr.serialization = Some(result_name);
            sc.results.insert(key, sr);
            links.push((result, rec.download, rec.update_search));
        }
        let message = sc.emsg.clone();
        let runnable = sc.emsg.is_none() && !sc.paused;
        debug!(search = id.raw(), results = links.len(), path = %path.display(), "Resuming search");
        self.searches.insert(id, sc);
        self.search_emit(id, SearchStatus::Resume { message });

        for (result, download, update) in links {
            let Some(sr) = self.search_result(result) else {
                continue;
            };
            if sr.is_visible() {
                let status = SearchStatus::ResumeResult {
                    result,
                    uri: sr.uri.clone(),
                    meta: sr.meta.clone(),
                    applicability_rank: sr.optional_support,
                    availability_rank: sr.availability_rank(),
                    availability_certainty: sr.availability_trials,
                };
                self.search_emit(id, status);
            }
            let download = download.and_then(|name| {
                let path = self.state_dir(DOWNLOAD_CHILD_DIR).join(&name);
                if !path.exists() {
                    warn!(path = %path.display(), "Search result refers to a missing download");
                    return None;
                }
                self.load_download(name, &path, None, Some(result))
            });
            let update = update.and_then(|name| {
                let path = self.state_dir(SEARCH_CHILD_DIR).join(&name);
                if !path.exists() {
                    warn!(path = %path.display(), "Search result refers to a missing update search");
                    return None;
                }
                self.load_search(name, &path, Some(result))
            });
            if let Some(sr) = self.search_result_mut(result) {
                sr.download = download;
                sr.update_search = update;
            }
            if runnable && download.is_none() {
                self.schedule(Task::StartProbe(result));
            }
        }
        if runnable {
            self.search_connect(id);
        }
        Some(id)
    }

    fn resume_searches(&mut self) -> usize {
        let mut count = 0;
        for (name, path) in state_files(&self.state_dir(SEARCH_DIR)) {
            if self.load_search(name, &path, None).is_some() {
                count += 1;
            }
        }
        count
    }

    // unindex

    pub(crate) fn unindex_sync(&mut self, id: UnindexId) {
        if !self.config.persistence {
            return;
        }
        let dir = self.state_dir(UNINDEX_DIR);
        let Some(uc) = self.unindexes.get_mut(&id) else {
            return;
        };
        let name = uc
            .serialization
            .get_or_insert_with(|| fresh_name(&dir))
            .clone();
        let mut w = WriteHandle::create(dir.join(name));
        w.write_string(path_string(Some(&uc.filename)).as_deref())
            .write_u64(uc.file_size)
            .write_u32(uc.state.code())
            .write_bool(uc.file_id.is_some());
        if let Some(file_id) = &uc.file_id {
            w.write_hash(file_id);
        }
        w.write_uri(uc.chk_uri.as_ref())
            .write_uri(uc.ksk.as_ref())
            .write_u32(uc.ksk_offset as u32)
            .write_string(uc.emsg.as_deref())
            .write_u64(elapsed_ms(uc.start_time));
        commit(w);
    }

    pub(crate) fn unindex_remove_sync(&mut self, id: UnindexId) {
        let dir = self.state_dir(UNINDEX_DIR);
        if let Some(name) = self
            .unindexes
            .get_mut(&id)
            .and_then(|uc| uc.serialization.take())
        {
            remove_logged(&dir.join(name));
        }
    }

    fn resume_unindexes(&mut self) -> usize {
        let mut count = 0;
        for (name, path) in state_files(&self.state_dir(UNINDEX_DIR)) {
            let record = match read_unindex(&path) {
                Ok(record) => record,
                Err(e) => {
                    discard(&path, &e);
                    continue;
                }
            };
            let id = UnindexId(self.next_raw_id());
            let mut uc = UnindexContext::new(id, record.filename, record.file_size);
            uc.state = record.state;
            uc.file_id = record.file_id;
            uc.chk_uri = record.chk_uri;
            uc.ksk = record.ksk;
            uc.ksk_offset = record.ksk_offset;
            uc.emsg = record.emsg;
            uc.start_time = record.start_time;
            uc.serialization = Some(name);
            debug!(unindex = id.raw(), path = %path.display(), "Resuming unindex");
            self.unindex_resume(uc);
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block;
    use crate::config::FsConfig;
    use crate::crypto::HashCode;
    use crate::events::{ProgressEvent, PublishStatus, UnindexStatus};
    use crate::metadata::{MetaData, MetaType};
    use crate::service::{MemoryService, Request, Response, Service};
    use crate::tree::DBLOCK_SIZE;
    use crate::uri::Uri;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn config(dir: &Path) -> FsConfig {
        FsConfig {
            state_dir: dir.join("state"),
            persistence: true,
            do_probes: false,
            ..Default::default()
        }
    }

    fn open(config: &FsConfig) -> (Fs, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Fs::new(config.clone(), tx).unwrap(), rx)
    }

    fn drain(fs: &mut Fs) -> Vec<Request> {
        let mut out = Vec::new();
        while let Some(req) = fs.poll_request() {
            out.push(req);
        }
        out
    }

    fn events(rx: &mut mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn pump(fs: &mut Fs, service: &mut MemoryService) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        loop {
            let mut progressed = false;
            while let Some(req) = fs.poll_request() {
                service.dispatch(req, &tx);
                progressed = true;
            }
            while let Ok(resp) = rx.try_recv() {
                fs.handle_response(resp);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    #[test]
    fn test_random_name() {
        let name = random_name();
        assert_eq!(name.len(), NAME_LEN);
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_child_dir() {
        assert_eq!(
            child_dir(Path::new("/state/download/abc123")),
            PathBuf::from("/state/download/abc123.dir")
        );
    }

    #[test]
    fn test_download_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let chk = ContentHashKey {
            key: HashCode::digest(b"key"),
            query: HashCode::digest(b"query"),
        };
        let uri = Uri::chk(chk, 3 * DBLOCK_SIZE as u64);
        let target = dir.path().join("out").join("file.bin");

        let (mut fs, _rx) = open(&config);
        fs.download_start(
            &uri,
            None,
            Some(target.clone()),
            None,
            0,
            3 * DBLOCK_SIZE as u64,
            1,
            DownloadOptions::default(),
        )
        .unwrap();
        drain(&mut fs);
        fs.suspend_all();
        assert_eq!(state_files(&config.client_dir().join(DOWNLOAD_DIR)).len(), 1);
        drop(fs);

        let (mut fs, mut rx) = open(&config);
        let resumed: Vec<_> = events(&mut rx)
            .into_iter()
            .filter_map(|ev| match ev {
                ProgressEvent::Download(e) => Some(e),
                _ => None,
            })
            .collect();
        assert!(matches!(resumed[0].status, DownloadStatus::Resume { .. }));
        assert_eq!(resumed[0].uri, uri);
        assert_eq!(resumed[0].filename.as_deref(), Some(target.as_path()));

        let id = resumed[0].id;
        let dc = fs.download(id).unwrap();
        assert_eq!(dc.length(), 3 * DBLOCK_SIZE as u64);
        let tree = dc.tree.as_ref().unwrap();
        assert_eq!(tree.nodes[0].chk, chk);
        assert_eq!(tree.nodes.len(), 4);

        fs.download_stop(id, true).unwrap();
        assert!(state_files(&config.client_dir().join(DOWNLOAD_DIR)).is_empty());
    }

    #[test]
    fn test_three_level_range_download_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut service = MemoryService::new();
        let span = DBLOCK_SIZE * crate::tree::CHK_PER_INODE;
        let content: Vec<u8> = (0..span + 1).map(|i| (i % 249) as u8).collect();

        let scratch = FsConfig {
            state_dir: dir.path().join("scratch"),
            persistence: false,
            ..config.clone()
        };
        let (mut publisher, mut rx) = open(&scratch);
        let fi = FileInformation::from_data(
            content.clone(),
            None,
            None,
            crate::service::BlockOptions::default(),
        )
        .unwrap();
        publisher
            .publish_start(fi, None, PublishOptions::default())
            .unwrap();
        pump(&mut publisher, &mut service);
        let uri = events(&mut rx)
            .into_iter()
            .find_map(|ev| match ev {
                ProgressEvent::Publish(e) if e.is_root() => match e.status {
                    PublishStatus::Completed { chk_uri, .. } => Some(chk_uri),
                    _ => None,
                },
                _ => None,
            })
            .unwrap();
        drop(publisher);

        let offset = span as u64 - 10;
        let (mut fs, _rx) = open(&config);
        fs.download_start(&uri, None, None, None, offset, 11, 1, DownloadOptions::default())
            .unwrap();
        drain(&mut fs);
        fs.suspend_all();
        drop(fs);

        let (mut fs, mut rx) = open(&config);
        let id = events(&mut rx)
            .into_iter()
            .find_map(|ev| match ev {
                ProgressEvent::Download(e) if matches!(e.status, DownloadStatus::Resume { .. }) => {
                    Some(e.id)
                }
                _ => None,
            })
            .unwrap();
        let dc = fs.download(id).unwrap();
        assert_eq!((dc.offset(), dc.length()), (offset, 11));
        let tree = dc.tree.as_ref().unwrap();
        assert_eq!(tree.nodes.len(), 5);
        assert_eq!(tree.nodes[0].depth, 2);
        let leaf_slots: Vec<u32> = tree
            .nodes
            .iter()
            .filter(|n| n.depth == 0)
            .map(|n| n.chk_idx)
            .collect();
        assert_eq!(leaf_slots, vec![crate::tree::CHK_PER_INODE as u32 - 1, 0]);

        pump(&mut fs, &mut service);
        let dc = fs.download(id).unwrap();
        assert!(dc.error().is_none(), "{:?}", dc.error());
        assert_eq!(dc.completed(), 11);
        assert!(events(&mut rx).iter().any(|ev| matches!(
            ev,
            ProgressEvent::Download(e) if e.status == DownloadStatus::Completed
        )));
    }

    fn ksk_block(word: &str, uri: &Uri) -> (HashCode, Bytes) {
        let mut meta = MetaData::new();
        meta.insert_str(MetaType::OriginalFilename, "song.ogg");
        let key = block::ksk_signing_key(word);
        let (query, data) = block::create_ublock(&key, word, None, uri, &meta).unwrap();
        (query, Bytes::from(data))
    }

    #[test]
    fn test_search_results_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let (chk, _) = ContentHashKey::encode_block(b"song");
        let target = Uri::chk(chk, 4);

        let (mut fs, _rx) = open(&config);
        let query = Uri::ksk_from_args(&["+music", "jazz"]);
        fs.search_start(&query, 1, SearchOptions::default()).unwrap();
        let client = drain(&mut fs)
            .into_iter()
            .find_map(|req| match req {
                Request::Connect { client } => Some(client),
                _ => None,
            })
            .unwrap();
        fs.handle_response(Response::Connected { client });
        let (q, data) = ksk_block("music", &target);
        fs.handle_response(Response::Block {
            client,
            query: q,
            block_type: block::BlockType::UBlock,
            expiration: 0,
            data: data.clone(),
        });
        fs.suspend_all();
        drop(fs);

        let (mut fs, mut rx) = open(&config);
        let statuses: Vec<SearchStatus> = events(&mut rx)
            .into_iter()
            .filter_map(|ev| match ev {
                ProgressEvent::Search(e) => Some(e.status),
                _ => None,
            })
            .collect();
        assert!(matches!(statuses[0], SearchStatus::Resume { message: None }));
        assert!(matches!(
            &statuses[1],
            SearchStatus::ResumeResult { uri, .. } if *uri == target
        ));

        let id = *fs.searches.keys().next().unwrap();
        assert_eq!(fs.search(id).unwrap().results().count(), 1);

        // a repeated delivery of the same block is recognised as known
        let client = drain(&mut fs)
            .into_iter()
            .find_map(|req| match req {
                Request::Connect { client } => Some(client),
                _ => None,
            })
            .unwrap();
        fs.handle_response(Response::Connected { client });
        events(&mut rx);
        fs.handle_response(Response::Block {
            client,
            query: q,
            block_type: block::BlockType::UBlock,
            expiration: 0,
            data,
        });
        assert!(events(&mut rx).is_empty());

        fs.search_stop(id).unwrap();
        let search_dir = config.client_dir().join(SEARCH_DIR);
        assert!(fs::read_dir(&search_dir).unwrap().next().is_none());
    }

    #[test]
    fn test_unindex_resumes_in_saved_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let file = dir.path().join("indexed.bin");
        fs::write(&file, vec![7u8; 100]).unwrap();

        let (mut fs, _rx) = open(&config);
        fs.unindex_start(&file).unwrap();
        assert!(matches!(drain(&mut fs).as_slice(), [Request::HashFile { .. }]));
        fs.suspend_all();
        drop(fs);

        let (mut fs, mut rx) = open(&config);
        let statuses: Vec<UnindexStatus> = events(&mut rx)
            .into_iter()
            .filter_map(|ev| match ev {
                ProgressEvent::Unindex(e) => Some(e.status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![UnindexStatus::Resume { message: None }]);
        let id = *fs.unindexes.keys().next().unwrap();
        assert_eq!(fs.unindex(id).unwrap().state(), UnindexState::Hashing);
        assert!(matches!(drain(&mut fs).as_slice(), [Request::HashFile { .. }]));
    }

    #[test]
    fn test_publish_resumes_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let content: Vec<u8> = (0..DBLOCK_SIZE + 100).map(|i| (i % 251) as u8).collect();
        let options = crate::service::BlockOptions::default();
        let mut root = FileInformation::empty_directory(None, None, options, None).unwrap();
        root.add(
            FileInformation::from_data(
                content.clone(),
                Some(Uri::ksk_from_args(&["track"])),
                None,
                options,
            )
            .unwrap(),
        )
        .unwrap();

        let (mut fs, _rx) = open(&config);
        fs.publish_start(root, None, PublishOptions::default()).unwrap();
        assert!(matches!(drain(&mut fs).as_slice(), [Request::Reserve { .. }]));
        fs.suspend_all();
        drop(fs);

        let (mut fs, mut rx) = open(&config);
        let resumed: Vec<_> = events(&mut rx)
            .into_iter()
            .filter_map(|ev| match ev {
                ProgressEvent::Publish(e) => Some(e),
                _ => None,
            })
            .collect();
        assert_eq!(resumed.len(), 2);
        assert!(resumed
            .iter()
            .all(|e| matches!(e.status, PublishStatus::Resume { chk_uri: None, .. })));
        let id = resumed[0].id;
        assert_eq!(
            fs.publish(id).unwrap().file_information().contents_size(),
            content.len() as u64
        );

        let mut service = MemoryService::new();
        pump(&mut fs, &mut service);
        let completed = events(&mut rx).into_iter().any(|ev| {
            matches!(
                ev,
                ProgressEvent::Publish(ref e)
                    if e.is_root() && matches!(e.status, PublishStatus::Completed { .. })
            )
        });
        assert!(completed);
        assert!(service.contains(&block::ksk_query("track")));

        fs.publish_stop(id).unwrap();
        assert!(state_files(&config.client_dir().join(PUBLISH_FILE_DIR)).is_empty());
        assert!(state_files(&config.client_dir().join(PUBLISH_DIR)).is_empty());
    }

    #[test]
    fn test_corrupt_state_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let search_dir = config.client_dir().join(SEARCH_DIR);
        fs::create_dir_all(&search_dir).unwrap();
        fs::write(search_dir.join("broken"), b"\x00\x00\x00\x01garbage").unwrap();
        fs::write(search_dir.join("other.tmp"), b"half written").unwrap();

        let (fs, _rx) = open(&config);
        assert!(fs.searches.is_empty());
        assert!(!search_dir.join("broken").exists());
        assert!(!search_dir.join("other.tmp").exists());
    }

    #[test]
    fn test_persistence_disabled_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = FsConfig {
            persistence: false,
            ..config(dir.path())
        };
        let (mut fs, _rx) = open(&config);
        fs.search_start(&Uri::ksk_from_args(&["x"]), 1, SearchOptions::default())
            .unwrap();
        fs.suspend_all();
        assert!(!config.client_dir().exists());
    }
}
