//! Downloads
//!
//! A download owns a request tree that mirrors the part of the CHK tree
//! covering the requested byte range. Nodes start in `Init`, get their CHK
//! from the decrypted parent (`ChkSet`), are resolved (`DownloadDown`) and
//! are finished together with their subtree (`DownloadUp`).
//!
//! Before anything is requested from the service the download tries to
//! rebuild blocks locally:
//!
//! 1. top-down from a partial file left by an earlier run, which keeps
//!    interior blocks after the leaf data (see [`compute_disk_offset`]),
//! 2. from file contents inlined into the metadata,
//! 3. bottom-up by running the tree encoder over an existing file.
//!
//! Whatever is left is requested through the job queue. Downloads of
//! directories with the `recursive` option start one child download per
//! entry.

use bytes::Bytes;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::block::BlockType;
use crate::crypto::{self, ContentHashKey, HashCode, CHK_SIZE};
use crate::directory::{self, DirectoryEntry};
use crate::error::{FsError, Result};
use crate::events::{DownloadEvent, DownloadId, DownloadStatus, ProgressEvent, ResultId};
use crate::fs::{ClientOwner, Fs, Timer, TimerKey};
use crate::metadata::{MetaData, DIRECTORY_EXT};
use crate::pending::ActiveRequests;
use crate::queue::Priority;
use crate::reader::{DataReader, FileReader, MemoryReader};
use crate::service::{ClientId, Request};
use crate::tree::{
    calculate_block_size, compute_depth, compute_disk_offset, compute_tree_size, TreeBlock,
    TreeEncoder, TreeStep, DBLOCK_SIZE, MAX_INLINE_SIZE,
};
use crate::uri::{Uri, URI_PREFIX};

/// Upper bound of the reconnect backoff
pub(crate) const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Index of the root in a request tree
pub(crate) const ROOT: usize = 0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Only ask the local peer, never the network
    pub loopback_only: bool,
    /// Download the entries of directories as well
    pub recursive: bool,
    /// Do not keep interior blocks on disk while downloading
    pub no_temporaries: bool,
    /// Availability check of a search result
    pub is_probe: bool,
}

impl DownloadOptions {
    pub(crate) fn to_bits(self) -> u32 {
        (self.loopback_only as u32)
            | (self.recursive as u32) << 1
            | (self.no_temporaries as u32) << 2
            | (self.is_probe as u32) << 3
    }

    pub(crate) fn from_bits(bits: u32) -> Self {
        DownloadOptions {
            loopback_only: bits & 1 != 0,
            recursive: bits & 2 != 0,
            no_temporaries: bits & 4 != 0,
            is_probe: bits & 8 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRequestState {
    /// CHK not known yet
    Init,
    /// CHK known, content missing
    ChkSet,
    /// Block resolved, children may still be missing
    DownloadDown,
    /// Block and subtree resolved
    DownloadUp,
    Error,
}

impl BlockRequestState {
    pub(crate) fn code(self) -> u8 {
        match self {
            BlockRequestState::Init => 0,
            BlockRequestState::ChkSet => 1,
            BlockRequestState::DownloadDown => 2,
            BlockRequestState::DownloadUp => 3,
            BlockRequestState::Error => 4,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => BlockRequestState::Init,
            1 => BlockRequestState::ChkSet,
            2 => BlockRequestState::DownloadDown,
            3 => BlockRequestState::DownloadUp,
            4 => BlockRequestState::Error,
            _ => return None,
        })
    }

    /// Whether the CHK of the node is meaningful
    pub(crate) fn has_chk(self) -> bool {
        !matches!(self, BlockRequestState::Init)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DownloadRequest {
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// File offset of the first byte covered by this node
    pub offset: u64,
    pub depth: u32,
    /// Slot of this node in the parent's CHK array
    pub chk_idx: u32,
    pub chk: ContentHashKey,
    pub state: BlockRequestState,
}

/// Arena of request nodes; the root is at index [`ROOT`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RequestTree {
    pub nodes: Vec<DownloadRequest>,
}

impl RequestTree {
    /// Request nodes for `length` bytes at `offset` of a file of `file_length`
    pub fn build(file_length: u64, offset: u64, length: u64) -> Self {
        let mut tree = RequestTree::default();
        let depth = compute_depth(file_length) - 1;
        tree.create(file_length, None, 0, depth, 0, offset, length);
        tree
    }

    #[allow(clippy::too_many_arguments)]
    fn create(
        &mut self,
        file_length: u64,
        parent: Option<usize>,
        chk_idx: u32,
        depth: u32,
        node_offset: u64,
        start: u64,
        length: u64,
    ) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(DownloadRequest {
            parent,
            children: Vec::new(),
            offset: node_offset,
            depth,
            chk_idx,
            chk: ContentHashKey::EMPTY,
            state: BlockRequestState::Init,
        });
        if depth == 0 {
            return idx;
        }
        let child_size = compute_tree_size(depth - 1);
        let head_skip = if node_offset < start {
            (start - node_offset) / child_size
        } else {
            0
        };
        let present = (calculate_block_size(file_length, node_offset, depth) / CHK_SIZE) as u64;
        let wanted = (start + length - node_offset)
            .div_ceil(child_size)
            .min(present);
        let count = wanted.saturating_sub(head_skip);
        let mut children = Vec::with_capacity(count as usize);
        for i in 0..count {
            let slot = i + head_skip;
            children.push(self.create(
                file_length,
                Some(idx),
                slot as u32,
                depth - 1,
                node_offset + slot * child_size,
                start,
                length,
            ));
        }
        self.nodes[idx].children = children;
        idx
    }

    pub fn root(&self) -> Option<&DownloadRequest> {
        self.nodes.get(ROOT)
    }

    pub fn root_state(&self) -> Option<BlockRequestState> {
        self.root().map(|r| r.state)
    }

    /// `node` and all of its descendants
    pub fn subtree(&self, node: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            out.push(n);
            stack.extend(self.nodes[n].children.iter().rev());
        }
        out
    }

    /// Mark `node` finished and climb while every sibling is finished too
    pub fn propagate_up(&mut self, node: usize) {
        let mut cur = node;
        loop {
            self.nodes[cur].state = BlockRequestState::DownloadUp;
            let Some(parent) = self.nodes[cur].parent else {
                break;
            };
            let done = self.nodes[parent]
                .children
                .iter()
                .all(|c| self.nodes[*c].state == BlockRequestState::DownloadUp);
            if !done {
                break;
            }
            cur = parent;
        }
    }

    /// Mark `node` and every ancestor as failed
    pub fn mark_error(&mut self, node: usize) {
        let mut cur = Some(node);
        while let Some(n) = cur {
            self.nodes[n].state = BlockRequestState::Error;
            cur = self.nodes[n].parent;
        }
    }
}

pub struct DownloadContext {
    pub(crate) id: DownloadId,
    pub(crate) parent: Option<DownloadId>,
    pub(crate) children: Vec<DownloadId>,
    /// Search result this download was started from
    pub(crate) search: Option<ResultId>,
    /// Search result this download probes
    pub(crate) probe_of: Option<ResultId>,
    pub(crate) uri: Uri,
    pub(crate) meta: Option<MetaData>,
    pub(crate) filename: Option<PathBuf>,
    /// Where directory data goes when recursing without a target file
    pub(crate) temp_filename: Option<PathBuf>,
    pub(crate) offset: u64,
    pub(crate) length: u64,
    pub(crate) completed: u64,
    pub(crate) anonymity: u32,
    pub(crate) options: DownloadOptions,
    pub(crate) emsg: Option<String>,
    pub(crate) start_time: Instant,
    pub(crate) has_finished: bool,
    /// Directory contents have been read back after the data completed
    pub(crate) entries_listed: bool,
    pub(crate) tree: Option<RequestTree>,
    pub(crate) active: ActiveRequests,
    /// Set once local reconstruction is over
    pub(crate) issue_requests: bool,
    pub(crate) client: Option<ClientId>,
    pub(crate) connected: bool,
    reconnect_delay: Duration,
    reconnect_timer: Option<TimerKey>,
    /// Size of the target file when the download was (re)started
    pub(crate) old_file_size: Option<u64>,
    pub(crate) serialization: Option<String>,
}

impl DownloadContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: DownloadId,
        uri: Uri,
        meta: Option<MetaData>,
        filename: Option<PathBuf>,
        temp_filename: Option<PathBuf>,
        offset: u64,
        length: u64,
        anonymity: u32,
        options: DownloadOptions,
        reconnect_delay: Duration,
    ) -> Self {
        DownloadContext {
            id,
            parent: None,
            children: Vec::new(),
            search: None,
            probe_of: None,
            uri,
            meta,
            filename,
            temp_filename,
            offset,
            length,
            completed: 0,
            anonymity,
            options,
            emsg: None,
            start_time: Instant::now(),
            has_finished: false,
            entries_listed: false,
            tree: None,
            active: ActiveRequests::new(),
            issue_requests: false,
            client: None,
            connected: false,
            reconnect_delay,
            reconnect_timer: None,
            old_file_size: None,
            serialization: None,
        }
    }

    pub fn id(&self) -> DownloadId {
        self.id
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn meta(&self) -> Option<&MetaData> {
        self.meta.as_ref()
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    pub fn parent(&self) -> Option<DownloadId> {
        self.parent
    }

    pub fn children(&self) -> &[DownloadId] {
        &self.children
    }

    pub fn search_result(&self) -> Option<ResultId> {
        self.search
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn is_finished(&self) -> bool {
        self.has_finished
    }

    pub fn error(&self) -> Option<&str> {
        self.emsg.as_deref()
    }

    /// Number of blocks currently requested from the service
    pub fn pending_blocks(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn file_length(&self) -> u64 {
        self.uri.chk_file_size().unwrap_or(0)
    }

    /// Whether directory entries should be downloaded as well
    pub(crate) fn is_recursive(&self) -> bool {
        self.options.recursive
            && (self.meta.as_ref().is_some_and(MetaData::is_directory)
                || (self.meta.is_none()
                    && self
                        .filename
                        .as_ref()
                        .map_or(true, |f| f.to_string_lossy().ends_with(DIRECTORY_EXT))))
    }

    /// File the decrypted blocks are written to
    pub(crate) fn target_file(&self) -> Option<&Path> {
        self.filename.as_deref().or(self.temp_filename.as_deref())
    }

    fn root_state(&self) -> Option<BlockRequestState> {
        self.tree.as_ref().and_then(RequestTree::root_state)
    }

    /// Check, decrypt and store one encrypted block for `node`
    ///
    /// On success the node is `DownloadDown`, leaf progress is counted and
    /// the plaintext is returned.
    fn accept_block(
        &mut self,
        node: usize,
        block: &[u8],
        do_store: bool,
    ) -> std::result::Result<Vec<u8>, String> {
        let file_length = self.file_length();
        let recursive = self.is_recursive();
        let Some(tree) = self.tree.as_mut() else {
            return Err("download has no request tree".into());
        };
        let req = &tree.nodes[node];
        let (offset, depth, chk) = (req.offset, req.depth, req.chk);
        let expected = calculate_block_size(file_length, offset, depth);
        if block.len() != expected {
            return Err(format!(
                "Internal error or bogus download URI (expected {} bytes at depth {} and offset {}/{}, got {} bytes)",
                expected,
                depth,
                offset,
                file_length,
                block.len()
            ));
        }
        if HashCode::digest(block) != chk.query {
            return Err(format!(
                "Block at depth {} and offset {} does not match its query",
                depth, offset
            ));
        }
        self.active.remove_node(&chk.query, node);
        let plain = crypto::decrypt_block(&chk.key, block);
        if HashCode::digest(&plain) != chk.key {
            return Err(format!(
                "Decrypted block at depth {} and offset {} does not match its key",
                depth, offset
            ));
        }

        let store = do_store
            && (self.filename.is_some() || recursive)
            && !(self.options.no_temporaries && depth > 0);
        if store {
            if let Some(path) = self.filename.as_deref().or(self.temp_filename.as_deref()) {
                write_at(path, compute_disk_offset(file_length, offset, depth), &plain)?;
            }
        }

        if depth == 0 {
            let range_end = self.offset + self.length;
            let block_end = offset + plain.len() as u64;
            let mut app = plain.len() as u64;
            if offset < self.offset {
                app = app.saturating_sub(self.offset - offset);
            }
            if block_end > range_end {
                app = app.saturating_sub(block_end - range_end);
            }
            self.completed += app;
        }
        tree.nodes[node].state = BlockRequestState::DownloadDown;
        Ok(plain)
    }
}

fn write_at(path: &Path, offset: u64, data: &[u8]) -> std::result::Result<(), String> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| format!("Download failed: could not open file `{}': {}", path.display(), e))?;
    file.seek(SeekFrom::Start(offset)).map_err(|e| {
        format!(
            "Failed to seek to offset {} in file `{}': {}",
            offset,
            path.display(),
            e
        )
    })?;
    file.write_all(data).map_err(|e| {
        format!(
            "Failed to write block of {} bytes at offset {} in file `{}': {}",
            data.len(),
            offset,
            path.display(),
            e
        )
    })
}

fn read_at(path: &Path, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    let mut file = fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

fn truncate_file(path: &Path, len: u64) {
    let result = OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|f| f.set_len(len));
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Failed to truncate downloaded file");
    }
}

fn remove_file_logged(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to delete file");
        }
    }
}

/// File name for a directory entry, stripped of anything that could escape
/// the download directory
fn entry_file_name(entry: &DirectoryEntry) -> String {
    let name = entry
        .filename
        .clone()
        .or_else(|| entry.meta.original_filename())
        .unwrap_or_else(|| {
            let s = entry.uri.to_string();
            s.strip_prefix(URI_PREFIX).unwrap_or(&s).replace('/', "_")
        });
    let mut name = name.replace('\\', "/");
    while name.contains("../") {
        name = name.replace("../", "___");
    }
    name
}

impl Fs {
    /// Start downloading `length` bytes at `offset` of the file named by `uri`
    ///
    /// Without `filename` the data is only delivered in progress events.
    #[allow(clippy::too_many_arguments)]
    pub fn download_start(
        &mut self,
        uri: &Uri,
        meta: Option<MetaData>,
        filename: Option<PathBuf>,
        temp_filename: Option<PathBuf>,
        offset: u64,
        length: u64,
        anonymity: u32,
        options: DownloadOptions,
    ) -> Result<DownloadId> {
        let id = self.create_download(
            uri,
            meta,
            filename,
            temp_filename,
            offset,
            length,
            anonymity,
            options,
            None,
        )?;
        self.run_tasks();
        Ok(id)
    }

    /// Download the content of a search result
    #[allow(clippy::too_many_arguments)]
    pub fn download_start_from_search(
        &mut self,
        result: ResultId,
        filename: Option<PathBuf>,
        temp_filename: Option<PathBuf>,
        offset: u64,
        length: u64,
        anonymity: u32,
        options: DownloadOptions,
    ) -> Result<DownloadId> {
        let sr = self
            .search_result(result)
            .ok_or_else(|| FsError::UnknownOperation(format!("search result {}", result.key.short())))?;
        if sr.download.is_some() {
            return Err(FsError::InvalidArgument(
                "search result is already being downloaded".into(),
            ));
        }
        let (uri, meta) = (sr.uri.clone(), sr.meta.clone());
        let id = self.create_download(
            &uri,
            Some(meta),
            filename,
            temp_filename,
            offset,
            length,
            anonymity,
            options,
            None,
        )?;
        if let Some(dc) = self.downloads.get_mut(&id) {
            dc.search = Some(result);
        }
        if let Some(sr) = self.search_result_mut(result) {
            sr.download = Some(id);
        }
        self.stop_result_probe(result);
        self.run_tasks();
        Ok(id)
    }

    /// Stop a download and its children; optionally delete incomplete files
    pub fn download_stop(&mut self, id: DownloadId, delete_incomplete: bool) -> Result<()> {
        if !self.downloads.contains_key(&id) {
            return Err(FsError::UnknownOperation(format!("download {}", id.raw())));
        }
        self.download_stop_inner(id, delete_incomplete);
        self.run_tasks();
        Ok(())
    }

    pub fn download(&self, id: DownloadId) -> Option<&DownloadContext> {
        self.downloads.get(&id)
    }

    pub fn downloads(&self) -> impl Iterator<Item = &DownloadContext> {
        self.downloads.values()
    }

    /// Set up a download context and schedule its start
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_download(
        &mut self,
        uri: &Uri,
        meta: Option<MetaData>,
        filename: Option<PathBuf>,
        temp_filename: Option<PathBuf>,
        offset: u64,
        length: u64,
        anonymity: u32,
        options: DownloadOptions,
        parent: Option<DownloadId>,
    ) -> Result<DownloadId> {
        let file_length = uri.chk_file_size().ok_or_else(|| {
            FsError::InvalidArgument(format!("cannot download `{}': not a CHK or LOC URI", uri))
        })?;
        if let Uri::Loc(loc) = uri {
            loc.verify()?;
        }
        if offset.checked_add(length).map_or(true, |end| end > file_length) {
            return Err(FsError::InvalidArgument(format!(
                "range {}+{} exceeds file size {}",
                offset, length, file_length
            )));
        }
        if let Some(dir) = filename.as_deref().and_then(Path::parent) {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }

        let id = DownloadId(self.next_raw_id());
        let mut dc = DownloadContext::new(
            id,
            uri.clone(),
            meta,
            filename,
            None,
            offset,
            length,
            anonymity,
            options,
            self.config.reconnect_delay(),
        );
        dc.parent = parent;
        if dc.filename.is_none() && dc.is_recursive() {
            dc.temp_filename = Some(temp_filename.unwrap_or_else(|| {
                std::env::temp_dir().join(format!(
                    "gnfs-download-{}",
                    crate::persistence::random_name()
                ))
            }));
        }
        info!(
            download = id.raw(),
            uri = %uri,
            filename = ?dc.filename,
            offset,
            length,
            "Starting download"
        );
        self.downloads.insert(id, dc);
        if let Some(parent) = parent.and_then(|p| self.downloads.get_mut(&p)) {
            parent.children.push(id);
        }
        self.schedule(crate::fs::Task::DownloadStart(id));
        Ok(id)
    }

    /// Report a status change, or hand it to the probing search
    pub(crate) fn download_emit(&mut self, id: DownloadId, status: DownloadStatus) {
        let Some(dc) = self.downloads.get(&id) else {
            return;
        };
        if let Some(result) = dc.probe_of {
            self.probe_progress(result, &status);
            return;
        }
        let event = DownloadEvent {
            id,
            parent: dc.parent,
            search_result: dc.search,
            uri: dc.uri.clone(),
            filename: dc.filename.clone(),
            size: dc.length,
            completed: dc.completed,
            duration: dc.start_time.elapsed(),
            is_active: dc.client.is_some(),
            anonymity: dc.anonymity,
            status,
        };
        self.emit(ProgressEvent::Download(event));
    }

    pub(crate) fn download_start_task(&mut self, id: DownloadId) {
        let Some(dc) = self.downloads.get_mut(&id) else {
            return;
        };
        if dc.emsg.is_some() || dc.has_finished {
            return;
        }
        let file_length = dc.file_length();

        if file_length == 0 || dc.length == 0 {
            if file_length == 0 {
                if let Some(path) = dc.filename.clone() {
                    if let Err(e) = fs::File::create(&path) {
                        let msg = format!(
                            "Download failed: could not open file `{}': {}",
                            path.display(),
                            e
                        );
                        self.download_fail(id, None, msg);
                        return;
                    }
                }
            }
            let meta = dc.meta.clone();
            self.download_sync(id);
            self.download_emit(id, DownloadStatus::Start { meta });
            self.check_completed(id);
            return;
        }

        if dc.tree.is_none() {
            let Some(fi) = dc.uri.file_identifier().copied() else {
                return;
            };
            let mut tree = RequestTree::build(file_length, dc.offset, dc.length);
            tree.nodes[ROOT].chk = fi.chk;
            tree.nodes[ROOT].state = BlockRequestState::ChkSet;
            dc.tree = Some(tree);
            let meta = dc.meta.clone();
            let search = dc.search;
            self.download_sync(id);
            if let Some(result) = search {
                self.search_result_sync(result);
            }
            self.download_emit(id, DownloadStatus::Start { meta });
        }

        self.download_start_downloading(id);

        let Some(dc) = self.downloads.get_mut(&id) else {
            return;
        };
        dc.old_file_size = dc
            .filename
            .as_deref()
            .and_then(|p| fs::metadata(p).ok())
            .map(|m| m.len());
        let have_file = dc.old_file_size.is_some();

        if have_file && dc.root_state() == Some(BlockRequestState::ChkSet) {
            debug!(download = id.raw(), "Trying top-down reconstruction");
            self.try_top_down_reconstruction(id);
            if self.download_root_state(id) != Some(BlockRequestState::DownloadDown)
                && self.download_root_state(id) != Some(BlockRequestState::ChkSet)
            {
                return;
            }
        }

        self.try_meta_reconstruction(id);
        match self.download_root_state(id) {
            Some(BlockRequestState::DownloadUp) | Some(BlockRequestState::Error) | None => return,
            _ => {}
        }

        if have_file {
            debug!(download = id.raw(), "Trying bottom-up reconstruction");
            self.try_bottom_up_reconstruction(id);
        }

        let Some(dc) = self.downloads.get_mut(&id) else {
            return;
        };
        if dc.emsg.is_some() {
            return;
        }
        dc.issue_requests = true;
        self.schedule_block_download(id, ROOT);
        if self.download_root_state(id) == Some(BlockRequestState::DownloadUp) {
            self.check_completed(id);
        }
    }

    fn download_root_state(&self, id: DownloadId) -> Option<BlockRequestState> {
        self.downloads.get(&id).and_then(DownloadContext::root_state)
    }

    /// Put the download into the job queue unless it is done or queued
    fn download_start_downloading(&mut self, id: DownloadId) {
        let Some(dc) = self.downloads.get(&id) else {
            return;
        };
        if dc.completed == dc.length || self.queue.contains(id) {
            return;
        }
        let blocks = u32::try_from(dc.length.div_ceil(DBLOCK_SIZE as u64)).unwrap_or(u32::MAX);
        let priority = if dc.options.is_probe {
            Priority::Probe
        } else {
            Priority::Normal
        };
        self.enqueue_job(id, blocks, priority);
    }

    /// Replay blocks stored by an earlier run, starting at the root
    fn try_top_down_reconstruction(&mut self, id: DownloadId) {
        let mut stack = vec![ROOT];
        while let Some(node) = stack.pop() {
            let Some(dc) = self.downloads.get(&id) else {
                return;
            };
            let (Some(path), Some(old_size), Some(tree)) =
                (dc.filename.as_deref(), dc.old_file_size, dc.tree.as_ref())
            else {
                return;
            };
            let req = &tree.nodes[node];
            if req.state != BlockRequestState::ChkSet {
                continue;
            }
            let file_length = dc.file_length();
            let off = compute_disk_offset(file_length, req.offset, req.depth);
            let len = calculate_block_size(file_length, req.offset, req.depth);
            if old_size < off + len as u64 {
                continue;
            }
            let plain = match read_at(path, off, len) {
                Ok(plain) => plain,
                Err(e) => {
                    debug!(path = %path.display(), offset = off, error = %e, "Cannot read stored block");
                    continue;
                }
            };
            let (chk, enc) = ContentHashKey::encode_block(&plain);
            if chk.key != req.chk.key || chk.query != req.chk.query {
                trace!(depth = req.depth, offset = req.offset, "Stored block differs");
                continue;
            }
            trace!(depth = req.depth, offset = req.offset, "Reconstructed block from disk");
            if !self.process_block(id, node, &enc, false, Duration::ZERO) {
                return;
            }
            if let Some(tree) = self.downloads.get(&id).and_then(|d| d.tree.as_ref()) {
                stack.extend(tree.nodes[node].children.iter().rev());
            }
        }
    }

    /// Satisfy a small download from file contents inlined in the metadata
    fn try_meta_reconstruction(&mut self, id: DownloadId) {
        let Some(dc) = self.downloads.get(&id) else {
            return;
        };
        let file_length = dc.file_length();
        if file_length > MAX_INLINE_SIZE
            || dc.root_state() == Some(BlockRequestState::DownloadUp)
        {
            return;
        }
        let Some(data) = dc.meta.as_ref().and_then(MetaData::full_data) else {
            return;
        };
        if data.len() as u64 != file_length {
            debug!(download = id.raw(), "Inlined data has the wrong size");
            return;
        }
        let data = Bytes::copy_from_slice(data);
        let mut reader = MemoryReader::new(data.clone());
        let uri = match TreeEncoder::encode_all(file_length, &mut reader, |_| {}) {
            Ok(uri) => uri,
            Err(e) => {
                debug!(error = %e, "Failed to encode inlined data");
                return;
            }
        };
        if uri.file_identifier().map(|f| f.chk) != dc.uri.file_identifier().map(|f| f.chk) {
            debug!(download = id.raw(), "Inlined data does not match the URI");
            return;
        }

        let store = dc.filename.is_some() || dc.is_recursive();
        if store {
            if let Some(path) = dc.target_file().map(Path::to_path_buf) {
                if let Err(msg) = write_at(&path, 0, &data) {
                    self.download_fail(id, None, msg);
                    return;
                }
            }
        }
        let Some(dc) = self.downloads.get_mut(&id) else {
            return;
        };
        if let Some(tree) = dc.tree.as_mut() {
            for node in &mut tree.nodes {
                node.state = BlockRequestState::DownloadUp;
            }
        }
        dc.active.clear();
        dc.completed = dc.length;
        let start = dc.offset as usize;
        let end = (dc.offset + dc.length) as usize;
        let offset = dc.offset;
        info!(download = id.raw(), "Download satisfied from inlined data");
        self.download_emit(
            id,
            DownloadStatus::Progress {
                data: data.slice(start..end),
                offset,
                depth: 0,
                block_download_duration: Duration::ZERO,
            },
        );
        self.download_sync(id);
        self.check_completed(id);
    }

    /// Re-encode the existing file and match its blocks against the tree
    fn try_bottom_up_reconstruction(&mut self, id: DownloadId) {
        let Some(dc) = self.downloads.get(&id) else {
            return;
        };
        let Some(path) = dc.filename.clone() else {
            return;
        };
        let mut reader = FileReader::new(&path);
        let mut encoder = TreeEncoder::new(dc.file_length());
        loop {
            match encoder.next(&mut reader) {
                Ok(TreeStep::Block(block)) => {
                    self.match_reconstructed_block(id, &block);
                    match self.download_root_state(id) {
                        Some(BlockRequestState::ChkSet) | Some(BlockRequestState::DownloadDown) => {}
                        _ => break,
                    }
                }
                Ok(TreeStep::Done(_)) => break,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Bottom-up reconstruction stopped");
                    break;
                }
            }
        }
        reader.close();
    }

    fn match_reconstructed_block(&mut self, id: DownloadId, block: &TreeBlock) {
        let Some(dc) = self.downloads.get_mut(&id) else {
            return;
        };
        let file_length = dc.file_length();
        let (range_start, range_end) = (dc.offset, dc.offset + dc.length);
        let Some(tree) = dc.tree.as_mut() else {
            return;
        };
        let start = if block.depth == 0 {
            block.offset
        } else {
            let ts = compute_tree_size(block.depth);
            ((block.offset - 1) / ts) * ts
        };

        let mut cur = ROOT;
        while tree.nodes[cur].depth > block.depth {
            let req = &tree.nodes[cur];
            let Some(&first) = req.children.first() else {
                return;
            };
            let child_size = compute_tree_size(req.depth - 1);
            let slot = (start - req.offset) / child_size;
            let first_slot = tree.nodes[first].chk_idx as u64;
            if slot < first_slot || slot - first_slot >= req.children.len() as u64 {
                return;
            }
            cur = req.children[(slot - first_slot) as usize];
        }
        let req = &tree.nodes[cur];
        if req.depth != block.depth
            || req.state != BlockRequestState::ChkSet
            || req.chk != block.chk
        {
            return;
        }

        let node_start = req.offset;
        let node_end = (node_start + compute_tree_size(req.depth)).min(file_length);
        for n in tree.subtree(cur) {
            let query = tree.nodes[n].chk.query;
            dc.active.remove_node(&query, n);
            tree.nodes[n].state = BlockRequestState::DownloadUp;
        }
        tree.propagate_up(cur);
        let lo = node_start.max(range_start);
        let hi = node_end.min(range_end);
        dc.completed += hi.saturating_sub(lo);
        trace!(
            depth = block.depth,
            offset = node_start,
            completed = dc.completed,
            "Block matched existing data"
        );
        let done = dc.completed == dc.length;
        let root_up = tree.root_state() == Some(BlockRequestState::DownloadUp);
        let target = dc.filename.clone();

        self.download_emit(
            id,
            DownloadStatus::Progress {
                data: Bytes::new(),
                offset: node_start,
                depth: 0,
                block_download_duration: Duration::ZERO,
            },
        );
        if done {
            if let Some(path) = target {
                truncate_file(&path, file_length);
            }
        }
        if root_up {
            self.download_sync(id);
            self.check_completed(id);
        }
    }

    /// Register every block under `node` whose CHK is known but data missing
    pub(crate) fn schedule_block_download(&mut self, id: DownloadId, node: usize) {
        let Some(dc) = self.downloads.get_mut(&id) else {
            return;
        };
        let Some(tree) = dc.tree.as_ref() else {
            return;
        };
        let mut to_send = Vec::new();
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            let req = &tree.nodes[n];
            match req.state {
                BlockRequestState::ChkSet => {
                    if dc.active.add(req.chk.query, n) && dc.connected {
                        to_send.push((req.chk.query, req.depth));
                    }
                }
                BlockRequestState::DownloadDown => {
                    stack.extend(req.children.iter().rev());
                }
                _ => {}
            }
        }
        for (query, depth) in to_send {
            self.send_block_request(id, query, depth);
        }
    }

    fn send_block_request(&mut self, id: DownloadId, query: HashCode, depth: u32) {
        let Some(dc) = self.downloads.get_mut(&id) else {
            return;
        };
        let (Some(client), true) = (dc.client, dc.connected) else {
            return;
        };
        trace!(download = id.raw(), query = %query.short(), depth, "Requesting block");
        dc.active.mark_sent(&query, Instant::now());
        let request = Request::StartSearch {
            client,
            query,
            block_type: BlockType::for_depth(depth),
            target: dc.uri.loc_peer(),
            anonymity: dc.anonymity,
            loopback_only: dc.options.loopback_only,
        };
        self.send(request);
    }

    /// Handle a verified block for `node`; false if the download failed
    fn process_block(
        &mut self,
        id: DownloadId,
        node: usize,
        block: &[u8],
        do_store: bool,
        duration: Duration,
    ) -> bool {
        let Some(dc) = self.downloads.get_mut(&id) else {
            return false;
        };
        let plain = match dc.accept_block(node, block, do_store) {
            Ok(plain) => Bytes::from(plain),
            Err(msg) => {
                self.download_fail(id, Some(node), msg);
                return false;
            }
        };
        let Some(req) = dc.tree.as_ref().map(|t| t.nodes[node].clone()) else {
            return false;
        };
        let recursive = dc.is_recursive();
        let file_length = dc.file_length();

        if req.depth == 0 && recursive {
            match directory::list_contents(&plain, req.offset) {
                Ok(listing) => {
                    for entry in &listing.entries {
                        self.trigger_recursive_download(id, entry);
                    }
                }
                Err(e) => trace!(offset = req.offset, error = %e, "No directory entries in block"),
            }
        }

        self.download_emit(
            id,
            DownloadStatus::Progress {
                data: plain.clone(),
                offset: req.offset,
                depth: req.depth,
                block_download_duration: duration,
            },
        );

        let Some(dc) = self.downloads.get_mut(&id) else {
            return false;
        };
        if req.depth == 0 {
            if let Some(tree) = dc.tree.as_mut() {
                tree.propagate_up(node);
            }
        }
        if dc.completed == dc.length {
            debug!(download = id.raw(), "All requested bytes present");
            if let Some(path) = dc.target_file() {
                truncate_file(path, file_length);
            }
            self.check_completed(id);
        }
        if req.depth == 0 {
            self.download_sync(id);
            return true;
        }

        let Some(dc) = self.downloads.get_mut(&id) else {
            return false;
        };
        let issue = dc.issue_requests;
        let mut ready = Vec::new();
        if let Some(tree) = dc.tree.as_mut() {
            for child in req.children.iter().copied() {
                if tree.nodes[child].state != BlockRequestState::Init {
                    continue;
                }
                let start = tree.nodes[child].chk_idx as usize * CHK_SIZE;
                let Some(chk) = plain
                    .get(start..start + CHK_SIZE)
                    .and_then(ContentHashKey::from_bytes)
                else {
                    self.download_fail(id, Some(child), "internal error decoding tree".into());
                    return false;
                };
                tree.nodes[child].chk = chk;
                tree.nodes[child].state = BlockRequestState::ChkSet;
                ready.push(child);
            }
        }
        if issue {
            for child in ready {
                self.schedule_block_download(id, child);
            }
        }
        self.download_sync(id);
        true
    }

    /// Abort the download with `message`
    fn download_fail(&mut self, id: DownloadId, node: Option<usize>, message: String) {
        let Some(dc) = self.downloads.get_mut(&id) else {
            return;
        };
        warn!(download = id.raw(), error = %message, "Download failed");
        if let (Some(tree), Some(node)) = (dc.tree.as_mut(), node) {
            tree.mark_error(node);
        }
        dc.active.clear();
        dc.emsg = Some(message.clone());
        self.download_emit(id, DownloadStatus::Error { message });
        self.dequeue_job(id);
        self.download_disconnect(id);
        self.download_sync(id);
    }

    /// Emit completion once this download and all of its children are done
    pub(crate) fn check_completed(&mut self, id: DownloadId) {
        let Some(dc) = self.downloads.get(&id) else {
            return;
        };
        if dc.has_finished || dc.emsg.is_some() || dc.completed < dc.length {
            return;
        }
        if dc.is_recursive() && !dc.entries_listed {
            self.full_recursive_download(id);
        }
        let Some(dc) = self.downloads.get(&id) else {
            return;
        };
        for child in &dc.children {
            let Some(c) = self.downloads.get(child) else {
                continue;
            };
            if c.emsg.is_none() && !c.has_finished {
                return;
            }
        }
        let parent = dc.parent;
        info!(download = id.raw(), "Download completed");
        if let Some(dc) = self.downloads.get_mut(&id) {
            dc.has_finished = true;
        }
        self.dequeue_job(id);
        self.download_sync(id);
        self.download_emit(id, DownloadStatus::Completed);
        if let Some(parent) = parent {
            self.check_completed(parent);
        }
    }

    /// List the finished directory and start downloads for its entries
    fn full_recursive_download(&mut self, id: DownloadId) {
        let Some(dc) = self.downloads.get(&id) else {
            return;
        };
        let Some(path) = dc.target_file().map(Path::to_path_buf) else {
            return;
        };
        let is_temp = dc.filename.is_none();
        match fs::read(&path) {
            Ok(data) if !data.is_empty() => match directory::list_contents(&data, 0) {
                Ok(listing) => {
                    if let Some(dc) = self.downloads.get_mut(&id) {
                        dc.entries_listed = true;
                    }
                    if !listing.complete {
                        warn!(path = %path.display(), "Directory listing is incomplete");
                    }
                    for entry in &listing.entries {
                        self.trigger_recursive_download(id, entry);
                    }
                }
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to access full directory contents for recursive download"
                ),
            },
            Ok(_) => {}
            Err(e) => trace!(path = %path.display(), error = %e, "Directory file not readable"),
        }
        if is_temp {
            remove_file_logged(&path);
        }
    }

    /// Start a child download for one directory entry unless it exists
    fn trigger_recursive_download(&mut self, id: DownloadId, entry: &DirectoryEntry) {
        let Some(dc) = self.downloads.get(&id) else {
            return;
        };
        if entry.uri.chk_file_size().is_none() {
            trace!(uri = %entry.uri, "Skipping directory entry that is not a file");
            return;
        }
        let sfn = entry_file_name(entry);
        let full_name = dc.filename.as_ref().map(|parent| {
            let parent = parent.to_string_lossy();
            let dn = parent.strip_suffix(DIRECTORY_EXT).unwrap_or(&parent);
            let sfn = sfn.trim_end_matches('/');
            let sfn = sfn.strip_suffix(DIRECTORY_EXT).unwrap_or(sfn);
            if entry.meta.is_directory() {
                PathBuf::from(format!("{}/{}{}", dn, sfn, DIRECTORY_EXT))
            } else {
                PathBuf::from(format!("{}/{}", dn, sfn))
            }
        });
        let exists = dc.children.iter().filter_map(|c| self.downloads.get(c)).any(|c| {
            c.uri == entry.uri || (full_name.is_some() && c.filename == full_name)
        });
        if exists {
            return;
        }
        let (anonymity, options) = (dc.anonymity, dc.options);
        let file_size = entry.uri.chk_file_size().unwrap_or(0);
        debug!(download = id.raw(), entry = %sfn, "Triggering recursive download");

        if let Some(dir) = full_name.as_deref().and_then(Path::parent) {
            if let Err(e) = fs::create_dir_all(dir) {
                warn!(path = %dir.display(), error = %e, "Failed to create directory for recursive download");
                return;
            }
        }
        let mut temp_name = None;
        if let Some(data) = entry.data.as_deref() {
            if data.len() as u64 == file_size && (full_name.is_some() || entry.meta.is_directory()) {
                let real = full_name.clone().unwrap_or_else(|| {
                    let t = std::env::temp_dir().join(format!(
                        "gnfs-download-{}",
                        crate::persistence::random_name()
                    ));
                    temp_name = Some(t.clone());
                    t
                });
                if let Err(e) = fs::write(&real, data) {
                    warn!(path = %real.display(), error = %e, "Failed to write inlined entry");
                }
            }
        }
        if let Err(e) = self.create_download(
            &entry.uri,
            Some(entry.meta.clone()),
            full_name,
            temp_name,
            0,
            file_size,
            anonymity,
            options,
            Some(id),
        ) {
            warn!(error = %e, "Failed to start recursive download");
        }
    }

    pub(crate) fn download_activate(&mut self, id: DownloadId) {
        let Some(dc) = self.downloads.get(&id) else {
            return;
        };
        if dc.client.is_some() || dc.emsg.is_some() {
            return;
        }
        self.download_connect(id);
    }

    fn download_connect(&mut self, id: DownloadId) {
        let client = self.new_client(ClientOwner::Download(id));
        if let Some(dc) = self.downloads.get_mut(&id) {
            dc.client = Some(client);
            dc.connected = false;
        }
        debug!(download = id.raw(), client = client.0, "Connecting download");
        self.send(Request::Connect { client });
    }

    /// Release the connection without signalling anything
    fn download_disconnect(&mut self, id: DownloadId) {
        let Some(dc) = self.downloads.get_mut(&id) else {
            return;
        };
        let timer = dc.reconnect_timer.take();
        let client = dc.client.take();
        dc.connected = false;
        self.cancel_timer(timer);
        if let Some(client) = client {
            self.drop_client(client);
        }
    }

    pub(crate) fn download_deactivate(&mut self, id: DownloadId) {
        if !self.downloads.contains_key(&id) {
            return;
        }
        debug!(download = id.raw(), "Deactivating download");
        self.download_disconnect(id);
        self.download_emit(id, DownloadStatus::Inactive);
    }

    pub(crate) fn download_connected(&mut self, id: DownloadId, client: ClientId) {
        let base_delay = self.config.reconnect_delay();
        let Some(dc) = self.downloads.get_mut(&id) else {
            return;
        };
        if dc.client != Some(client) {
            return;
        }
        dc.connected = true;
        dc.reconnect_delay = base_delay;
        let requests: Vec<(HashCode, u32)> = match dc.tree.as_ref() {
            Some(tree) => dc
                .active
                .queries()
                .filter_map(|q| {
                    let node = *dc.active.nodes(q)?.first()?;
                    Some((*q, tree.nodes[node].depth))
                })
                .collect(),
            None => Vec::new(),
        };
        debug!(download = id.raw(), pending = requests.len(), "Download connected");
        for (query, depth) in requests {
            self.send_block_request(id, query, depth);
        }
        self.download_emit(id, DownloadStatus::Active);
    }

    pub(crate) fn download_connect_failed(&mut self, id: DownloadId, reason: &str) {
        if let Some(dc) = self.downloads.get_mut(&id) {
            dc.client = None;
            dc.connected = false;
        }
        self.download_fail(
            id,
            None,
            format!("Failed to connect to the file-sharing service: {}", reason),
        );
    }

    pub(crate) fn download_disconnected(&mut self, id: DownloadId) {
        let running = self.queue.is_running(id);
        let Some(dc) = self.downloads.get_mut(&id) else {
            return;
        };
        dc.client = None;
        dc.connected = false;
        if !running || dc.emsg.is_some() {
            return;
        }
        let delay = dc.reconnect_delay;
        dc.reconnect_delay = (delay * 2).min(MAX_RECONNECT_DELAY);
        info!(download = id.raw(), delay_ms = delay.as_millis() as u64, "Service connection lost, reconnecting");
        let key = self.add_timer_in(delay, Timer::DownloadReconnect(id));
        if let Some(dc) = self.downloads.get_mut(&id) {
            dc.reconnect_timer = Some(key);
        }
    }

    pub(crate) fn download_reconnect(&mut self, id: DownloadId) {
        let running = self.queue.is_running(id);
        let Some(dc) = self.downloads.get_mut(&id) else {
            return;
        };
        dc.reconnect_timer = None;
        if running && dc.client.is_none() && dc.emsg.is_none() {
            self.download_connect(id);
        }
    }

    pub(crate) fn download_block(&mut self, id: DownloadId, query: HashCode, data: Bytes) {
        if HashCode::digest(&data) != query {
            warn!(download = id.raw(), query = %query.short(), "Received block that does not match its query");
            return;
        }
        let Some(dc) = self.downloads.get_mut(&id) else {
            return;
        };
        let Some((nodes, elapsed)) = dc.active.take(&query, Instant::now()) else {
            trace!(query = %query.short(), "Block no longer needed");
            return;
        };
        self.queue.record_block_latency(elapsed);
        for node in nodes {
            if !self.process_block(id, node, &data, true, elapsed) {
                break;
            }
        }
    }

    /// Persist and forget the download and its children
    pub(crate) fn download_suspend(&mut self, id: DownloadId) {
        let Some(dc) = self.downloads.get(&id) else {
            return;
        };
        let children = dc.children.clone();
        self.download_sync(id);
        for child in children {
            self.download_suspend(child);
        }
        self.dequeue_job(id);
        self.download_disconnect(id);
        self.download_emit(id, DownloadStatus::Suspend);
        if let Some(dc) = self.downloads.remove(&id) {
            if let Some(parent) = dc.parent.and_then(|p| self.downloads.get_mut(&p)) {
                parent.children.retain(|c| *c != id);
            }
        }
    }

    pub(crate) fn download_stop_inner(&mut self, id: DownloadId, delete_incomplete: bool) {
        let Some(dc) = self.downloads.get(&id) else {
            return;
        };
        let children = dc.children.clone();
        for child in children {
            self.download_stop_inner(child, delete_incomplete);
        }
        self.dequeue_job(id);
        self.download_disconnect(id);
        self.download_remove_sync(id);
        let Some(dc) = self.downloads.get(&id) else {
            return;
        };
        if let Some(result) = dc.search {
            self.search_result_download_stopped(result);
        }
        self.download_emit(id, DownloadStatus::Stopped);
        let Some(dc) = self.downloads.remove(&id) else {
            return;
        };
        if let Some(parent) = dc.parent.and_then(|p| self.downloads.get_mut(&p)) {
            parent.children.retain(|c| *c != id);
        }
        if let Some(path) = &dc.filename {
            if delete_incomplete && dc.completed != dc.length {
                remove_file_logged(path);
            }
        }
        if let Some(path) = &dc.temp_filename {
            remove_file_logged(path);
        }
        info!(download = id.raw(), "Download stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FsConfig;
    use crate::metadata::{MetaFormat, MetaType};
    use crate::service::Response;
    use crate::tree::CHK_PER_INODE;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn test_fs() -> (Fs, mpsc::UnboundedReceiver<ProgressEvent>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = FsConfig {
            state_dir: dir.path().join("state"),
            persistence: false,
            ..Default::default()
        };
        let (tx, rx) = mpsc::unbounded_channel();
        (Fs::new(config, tx).unwrap(), rx, dir)
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 253) as u8).collect()
    }

    fn encode(content: &[u8]) -> (Uri, HashMap<HashCode, Vec<u8>>) {
        let mut blocks = HashMap::new();
        let mut reader = MemoryReader::new(content.to_vec());
        let uri = TreeEncoder::encode_all(content.len() as u64, &mut reader, |b| {
            blocks.insert(b.chk.query, b.data.clone());
        })
        .unwrap();
        (uri, blocks)
    }

    /// Answer requests from `blocks` until nothing is left to do;
    /// returns the queries that were requested
    fn serve(fs: &mut Fs, blocks: &HashMap<HashCode, Vec<u8>>) -> Vec<HashCode> {
        serve_holding(fs, blocks, &mut Vec::new())
    }

    /// Like [`serve`], but remembers searches that found nothing in `held`
    /// and answers earlier held searches first
    fn serve_holding(
        fs: &mut Fs,
        blocks: &HashMap<HashCode, Vec<u8>>,
        held: &mut Vec<(ClientId, HashCode, BlockType)>,
    ) -> Vec<HashCode> {
        let mut requested = Vec::new();
        let mut replies = Vec::new();
        held.retain(|&(client, query, block_type)| match blocks.get(&query) {
            Some(data) => {
                replies.push(Response::Block {
                    client,
                    query,
                    block_type,
                    expiration: 0,
                    data: Bytes::from(data.clone()),
                });
                false
            }
            None => true,
        });
        for reply in replies {
            fs.handle_response(reply);
        }
        loop {
            let mut replies = Vec::new();
            while let Some(req) = fs.poll_request() {
                match req {
                    Request::Connect { client } => replies.push(Response::Connected { client }),
                    Request::StartSearch {
                        client,
                        query,
                        block_type,
                        ..
                    } => {
                        requested.push(query);
                        match blocks.get(&query) {
                            Some(data) => replies.push(Response::Block {
                                client,
                                query,
                                block_type,
                                expiration: 0,
                                data: Bytes::from(data.clone()),
                            }),
                            None => held.push((client, query, block_type)),
                        }
                    }
                    _ => {}
                }
            }
            if replies.is_empty() {
                return requested;
            }
            for reply in replies {
                fs.handle_response(reply);
            }
        }
    }

    fn statuses(rx: &mut mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<DownloadStatus> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let ProgressEvent::Download(d) = ev {
                out.push(d.status);
            }
        }
        out
    }

    #[test]
    fn test_request_tree_for_range() {
        let block = DBLOCK_SIZE as u64;
        let tree = RequestTree::build(3 * block, block, block);
        let root = tree.root().unwrap();
        assert_eq!(root.depth, 1);
        assert_eq!(root.children.len(), 1);
        let child = &tree.nodes[root.children[0]];
        assert_eq!(child.chk_idx, 1);
        assert_eq!(child.offset, block);
        assert_eq!(child.depth, 0);

        let whole = RequestTree::build(3 * block + 5, 0, 3 * block + 5);
        assert_eq!(whole.root().unwrap().children.len(), 4);
        assert_eq!(whole.subtree(ROOT).len(), 5);

        let single = RequestTree::build(100, 0, 100);
        assert_eq!(single.nodes.len(), 1);
        assert_eq!(single.root().unwrap().depth, 0);
    }

    #[test]
    fn test_request_tree_stops_at_end_of_interior_block() {
        let block = DBLOCK_SIZE as u64;
        let span = block * CHK_PER_INODE as u64;
        let tree = RequestTree::build(span + 1, span - 10, 11);
        let root = tree.root().unwrap();
        assert_eq!(root.depth, 2);
        assert_eq!(root.children.len(), 2);

        let first = &tree.nodes[root.children[0]];
        assert_eq!((first.depth, first.offset), (1, 0));
        assert_eq!(first.children.len(), 1);
        let last_leaf = &tree.nodes[first.children[0]];
        assert_eq!(last_leaf.chk_idx as usize, CHK_PER_INODE - 1);
        assert_eq!(last_leaf.offset, span - block);

        let second = &tree.nodes[root.children[1]];
        assert_eq!((second.depth, second.offset, second.chk_idx), (1, span, 1));
        assert_eq!(second.children.len(), 1);
        let tail = &tree.nodes[second.children[0]];
        assert_eq!((tail.chk_idx, tail.offset), (0, span));
        assert_eq!(tree.nodes.len(), 5);
    }

    #[test]
    fn test_propagate_up() {
        let block = DBLOCK_SIZE as u64;
        let mut tree = RequestTree::build(2 * block, 0, 2 * block);
        let (a, b) = (tree.nodes[ROOT].children[0], tree.nodes[ROOT].children[1]);
        tree.propagate_up(a);
        assert_eq!(tree.root_state(), Some(BlockRequestState::Init));
        tree.propagate_up(b);
        assert_eq!(tree.root_state(), Some(BlockRequestState::DownloadUp));
        tree.mark_error(a);
        assert_eq!(tree.root_state(), Some(BlockRequestState::Error));
        assert_eq!(tree.nodes[b].state, BlockRequestState::DownloadUp);
    }

    #[test]
    fn test_options_bits() {
        let opts = DownloadOptions {
            recursive: true,
            is_probe: true,
            ..Default::default()
        };
        assert_eq!(DownloadOptions::from_bits(opts.to_bits()), opts);
    }

    #[test]
    fn test_download_from_service() {
        let (mut fs, mut rx, dir) = test_fs();
        let content = data(3 * DBLOCK_SIZE + 100);
        let (uri, blocks) = encode(&content);
        let target = dir.path().join("out").join("file.bin");
        let len = content.len() as u64;
        let id = fs
            .download_start(&uri, None, Some(target.clone()), None, 0, len, 1, DownloadOptions::default())
            .unwrap();
        let requested = serve(&mut fs, &blocks);
        assert_eq!(requested.len(), 5);

        let dc = fs.download(id).unwrap();
        assert!(dc.is_finished());
        assert_eq!(dc.completed(), len);
        assert_eq!(std::fs::read(&target).unwrap(), content);

        let st = statuses(&mut rx);
        assert!(matches!(st[0], DownloadStatus::Start { .. }));
        assert!(st.contains(&DownloadStatus::Active));
        assert_eq!(st.iter().filter(|s| **s == DownloadStatus::Completed).count(), 1);
        assert_eq!(fs.active_downloads(), 0);
    }

    #[test]
    fn test_partial_range_counts_only_range() {
        let (mut fs, mut rx, _dir) = test_fs();
        let content = data(2 * DBLOCK_SIZE);
        let (uri, blocks) = encode(&content);
        let id = fs
            .download_start(&uri, None, None, None, 100, 200, 1, DownloadOptions::default())
            .unwrap();
        serve(&mut fs, &blocks);
        assert_eq!(fs.download(id).unwrap().completed(), 200);
        let leaf = statuses(&mut rx)
            .into_iter()
            .find_map(|s| match s {
                DownloadStatus::Progress { data, depth: 0, offset, .. } => Some((offset, data)),
                _ => None,
            })
            .unwrap();
        assert_eq!(leaf.0, 0);
        assert_eq!(&leaf.1[..], &content[..DBLOCK_SIZE]);
    }

    #[test]
    fn test_existing_file_needs_no_requests() {
        let (mut fs, mut rx, dir) = test_fs();
        let content = data(2 * DBLOCK_SIZE + 17);
        let (uri, _) = encode(&content);
        let target = dir.path().join("have.bin");
        std::fs::write(&target, &content).unwrap();
        let len = content.len() as u64;
        let id = fs
            .download_start(&uri, None, Some(target.clone()), None, 0, len, 1, DownloadOptions::default())
            .unwrap();
        assert!(fs.poll_request().is_none());
        assert!(fs.download(id).unwrap().is_finished());
        assert!(statuses(&mut rx).contains(&DownloadStatus::Completed));
        assert_eq!(std::fs::read(&target).unwrap(), content);
    }

    /// Content one byte too long for a two level tree
    fn three_level_content() -> Vec<u8> {
        data(DBLOCK_SIZE * CHK_PER_INODE + 1)
    }

    #[test]
    fn test_three_level_download_from_service() {
        let (mut fs, mut rx, dir) = test_fs();
        let content = three_level_content();
        let (uri, blocks) = encode(&content);
        let target = dir.path().join("deep.bin");
        let len = content.len() as u64;
        let id = fs
            .download_start(&uri, None, Some(target.clone()), None, 0, len, 1, DownloadOptions::default())
            .unwrap();
        serve(&mut fs, &blocks);

        let dc = fs.download(id).unwrap();
        assert_eq!(dc.tree.as_ref().unwrap().root().unwrap().depth, 2);
        assert!(dc.is_finished());
        assert_eq!(dc.completed(), len);
        assert!(statuses(&mut rx).contains(&DownloadStatus::Completed));
        assert_eq!(std::fs::read(&target).unwrap(), content);
    }

    #[test]
    fn test_three_level_existing_file_needs_no_requests() {
        let (mut fs, mut rx, dir) = test_fs();
        let content = three_level_content();
        let (uri, _) = encode(&content);
        let target = dir.path().join("deep-have.bin");
        std::fs::write(&target, &content).unwrap();
        let len = content.len() as u64;
        let id = fs
            .download_start(&uri, None, Some(target.clone()), None, 0, len, 1, DownloadOptions::default())
            .unwrap();
        assert!(fs.poll_request().is_none());
        let dc = fs.download(id).unwrap();
        assert!(dc.is_finished());
        assert_eq!(dc.completed(), len);
        assert!(statuses(&mut rx).contains(&DownloadStatus::Completed));
    }

    #[test]
    fn test_range_across_interior_block_boundary() {
        let (mut fs, mut rx, _dir) = test_fs();
        let content = three_level_content();
        let (uri, blocks) = encode(&content);
        let span = (DBLOCK_SIZE * CHK_PER_INODE) as u64;
        let id = fs
            .download_start(&uri, None, None, None, span - 10, 11, 1, DownloadOptions::default())
            .unwrap();
        serve(&mut fs, &blocks);

        let dc = fs.download(id).unwrap();
        assert!(dc.error().is_none(), "{:?}", dc.error());
        assert!(dc.is_finished());
        assert_eq!(dc.completed(), 11);

        let mut leaves: Vec<(u64, Bytes)> = statuses(&mut rx)
            .into_iter()
            .filter_map(|s| match s {
                DownloadStatus::Progress { data, depth: 0, offset, .. } => Some((offset, data)),
                _ => None,
            })
            .collect();
        leaves.sort_by_key(|(offset, _)| *offset);
        let offsets: Vec<u64> = leaves.iter().map(|(o, _)| *o).collect();
        assert_eq!(offsets, vec![span - DBLOCK_SIZE as u64, span]);
        for (offset, leaf) in &leaves {
            let start = *offset as usize;
            assert_eq!(&leaf[..], &content[start..start + leaf.len()]);
        }
    }

    fn named(name: &str) -> MetaData {
        let mut meta = MetaData::new();
        meta.insert_str(MetaType::OriginalFilename, name);
        meta
    }

    #[test]
    fn test_directory_listed_once_after_completion() {
        let (mut fs, mut rx, dir) = test_fs();
        let a = data(DBLOCK_SIZE + 5);
        let b = data(300);
        let (uri_a, blocks_a) = encode(&a);
        let (uri_b, blocks_b) = encode(&b);

        let mut builder = crate::directory::DirectoryBuilder::new(None);
        builder.add(&uri_a, &named("a.bin"), None).unwrap();
        builder.add(&uri_b, &named("b.bin"), None).unwrap();
        let (uri_dir, blocks_dir) = encode(&builder.finish());

        let target = dir.path().join("d.gnd");
        let options = DownloadOptions {
            recursive: true,
            ..Default::default()
        };
        let len = uri_dir.chk_file_size().unwrap();
        let id = fs
            .download_start(&uri_dir, None, Some(target.clone()), None, 0, len, 1, options)
            .unwrap();
        let mut held = Vec::new();
        serve_holding(&mut fs, &blocks_dir, &mut held);
        assert_eq!(fs.download(id).unwrap().children().len(), 2);
        assert!(!fs.download(id).unwrap().is_finished());

        // a listing read again later would pick up the extra entry
        let (uri_c, _) = encode(&data(77));
        let mut grown = crate::directory::DirectoryBuilder::new(None);
        grown.add(&uri_a, &named("a.bin"), None).unwrap();
        grown.add(&uri_b, &named("b.bin"), None).unwrap();
        grown.add(&uri_c, &named("c.bin"), None).unwrap();
        std::fs::write(&target, grown.finish()).unwrap();

        let mut children = blocks_a;
        children.extend(blocks_b);
        serve_holding(&mut fs, &children, &mut held);

        let dc = fs.download(id).unwrap();
        assert_eq!(dc.children().len(), 2);
        assert!(dc.is_finished());
        assert_eq!(std::fs::read(dir.path().join("d").join("a.bin")).unwrap(), a);
        assert_eq!(std::fs::read(dir.path().join("d").join("b.bin")).unwrap(), b);
        assert!(statuses(&mut rx).contains(&DownloadStatus::Completed));
    }

    #[test]
    fn test_top_down_reconstruction_refetches_tampered_leaf() {
        let (mut fs, _rx, dir) = test_fs();
        let content = data(3 * DBLOCK_SIZE);
        let (uri, blocks) = encode(&content);
        let len = content.len() as u64;
        let target = dir.path().join("partial.bin");

        // fetch only the root so the interior block lands on disk
        let root_query = uri.file_identifier().unwrap().chk.query;
        let only_root: HashMap<HashCode, Vec<u8>> = blocks
            .iter()
            .filter(|(q, _)| **q == root_query)
            .map(|(q, d)| (*q, d.clone()))
            .collect();
        let first = fs
            .download_start(&uri, None, Some(target.clone()), None, 0, len, 1, DownloadOptions::default())
            .unwrap();
        serve(&mut fs, &only_root);
        fs.download_stop(first, false).unwrap();

        let mut tampered = content.clone();
        tampered[DBLOCK_SIZE + 10] ^= 0x01;
        let mut file = OpenOptions::new().write(true).open(&target).unwrap();
        file.write_all(&tampered).unwrap();
        drop(file);

        let second = fs
            .download_start(&uri, None, Some(target.clone()), None, 0, len, 1, DownloadOptions::default())
            .unwrap();
        let dc = fs.download(second).unwrap();
        assert_eq!(dc.completed(), 2 * DBLOCK_SIZE as u64);
        assert_eq!(dc.pending_blocks(), 1);

        let requested = serve(&mut fs, &blocks);
        let (leaf_chk, _) = ContentHashKey::encode_block(&content[DBLOCK_SIZE..2 * DBLOCK_SIZE]);
        assert_eq!(requested, vec![leaf_chk.query]);
        assert!(fs.download(second).unwrap().is_finished());
        assert_eq!(std::fs::read(&target).unwrap(), content);
    }

    #[test]
    fn test_inlined_metadata_satisfies_download() {
        let (mut fs, mut rx, _dir) = test_fs();
        let content = data(5000);
        let (uri, _) = encode(&content);
        let mut meta = MetaData::new();
        meta.insert("test", MetaType::FullData, MetaFormat::Binary, None, &content);
        let id = fs
            .download_start(&uri, Some(meta), None, None, 0, 5000, 1, DownloadOptions::default())
            .unwrap();
        assert!(fs.poll_request().is_none());
        assert!(fs.download(id).unwrap().is_finished());
        let st = statuses(&mut rx);
        assert!(st.iter().any(|s| matches!(
            s,
            DownloadStatus::Progress { data, .. } if data.len() == 5000
        )));
        assert!(st.contains(&DownloadStatus::Completed));
    }

    #[test]
    fn test_bogus_length_is_an_error() {
        let (mut fs, mut rx, _dir) = test_fs();
        let content = data(1000);
        let (uri, blocks) = encode(&content);
        let chk = uri.file_identifier().unwrap().chk;
        let bogus = Uri::chk(chk, 2000);
        let id = fs
            .download_start(&bogus, None, None, None, 0, 2000, 1, DownloadOptions::default())
            .unwrap();
        serve(&mut fs, &blocks);
        let err = fs.download(id).unwrap().error().unwrap().to_string();
        assert!(err.starts_with("Internal error or bogus download URI"));
        assert!(statuses(&mut rx)
            .iter()
            .any(|s| matches!(s, DownloadStatus::Error { .. })));
    }

    #[test]
    fn test_rejects_bad_arguments() {
        let (mut fs, _rx, _dir) = test_fs();
        let (uri, _) = encode(&data(10));
        assert!(fs
            .download_start(&uri, None, None, None, 5, 10, 1, DownloadOptions::default())
            .is_err());
        let ksk = Uri::ksk_from_args(&["word"]);
        assert!(fs
            .download_start(&ksk, None, None, None, 0, 0, 1, DownloadOptions::default())
            .is_err());
    }

    #[test]
    fn test_empty_file() {
        let (mut fs, mut rx, dir) = test_fs();
        let (uri, _) = encode(&[]);
        let target = dir.path().join("empty");
        let id = fs
            .download_start(&uri, None, Some(target.clone()), None, 0, 0, 1, DownloadOptions::default())
            .unwrap();
        assert!(target.exists());
        assert!(fs.download(id).unwrap().is_finished());
        let st = statuses(&mut rx);
        assert!(matches!(st[0], DownloadStatus::Start { .. }));
        assert_eq!(st.last(), Some(&DownloadStatus::Completed));
    }

    #[test]
    fn test_stop_deletes_incomplete_file() {
        let (mut fs, mut rx, dir) = test_fs();
        let content = data(2 * DBLOCK_SIZE);
        let (uri, _) = encode(&content);
        let target = dir.path().join("never.bin");
        let id = fs
            .download_start(&uri, None, Some(target.clone()), None, 0, content.len() as u64, 1, DownloadOptions::default())
            .unwrap();
        std::fs::write(&target, b"junk").unwrap();
        fs.download_stop(id, true).unwrap();
        assert!(!target.exists());
        assert!(fs.download(id).is_none());
        assert_eq!(statuses(&mut rx).last(), Some(&DownloadStatus::Stopped));
        assert!(fs.download_stop(id, true).is_err());
    }

    #[test]
    fn test_disconnect_schedules_reconnect() {
        let (mut fs, _rx, _dir) = test_fs();
        let content = data(DBLOCK_SIZE * 2);
        let (uri, _) = encode(&content);
        let id = fs
            .download_start(&uri, None, None, None, 0, content.len() as u64, 1, DownloadOptions::default())
            .unwrap();
        let Some(Request::Connect { client }) = fs.poll_request() else {
            panic!("expected connect");
        };
        fs.handle_response(Response::Connected { client });
        assert!(matches!(fs.poll_request(), Some(Request::StartSearch { .. })));
        fs.handle_response(Response::Disconnected { client });
        assert!(fs.download(id).unwrap().client.is_none());
        let deadline = fs.next_deadline().unwrap();
        fs.tick(deadline);
        assert!(matches!(fs.poll_request(), Some(Request::Connect { .. })));
    }

    #[test]
    fn test_entry_file_name_is_sanitized() {
        let (uri, _) = encode(&data(10));
        let entry = DirectoryEntry {
            filename: Some("..\\../etc/passwd".into()),
            uri,
            meta: MetaData::new(),
            data: None,
        };
        assert_eq!(entry_file_name(&entry), "______etc/passwd");
    }
}
