//! Unindexing files
//!
//! Withdraws a previously indexed file: the service drops its index entry,
//! the on-demand stubs and interior blocks are removed from the datastore,
//! and finally the keyword blocks that point at the file are looked up and
//! removed. The state is persisted before each phase starts, so a resumed
//! unindex continues where it left off.

use bytes::Bytes;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::block::{self, BlockType, OnDemandBlock};
use crate::crypto::HashCode;
use crate::error::{FsError, Result};
use crate::events::{ProgressEvent, UnindexEvent, UnindexId, UnindexStatus};
use crate::fs::{Fs, OpOwner};
use crate::metadata::{MetaData, MetaType};
use crate::reader::{DataReader, FileReader};
use crate::service::{OpId, Request, Response};
use crate::tree::{TreeEncoder, TreeStep};
use crate::uri::Uri;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnindexState {
    Hashing,
    /// Telling the service to drop the index entry
    FsNotify,
    /// Removing the file's blocks from the datastore
    DsRemove,
    ExtractKeywords,
    /// Removing keyword blocks that point at the file
    DsRemoveKBlocks,
    Complete,
    Error,
}

impl UnindexState {
    pub(crate) fn code(self) -> u32 {
        match self {
            UnindexState::Hashing => 0,
            UnindexState::DsRemove => 1,
            UnindexState::ExtractKeywords => 2,
            UnindexState::DsRemoveKBlocks => 3,
            UnindexState::FsNotify => 4,
            UnindexState::Complete => 5,
            UnindexState::Error => 6,
        }
    }

    pub(crate) fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => UnindexState::Hashing,
            1 => UnindexState::DsRemove,
            2 => UnindexState::ExtractKeywords,
            3 => UnindexState::DsRemoveKBlocks,
            4 => UnindexState::FsNotify,
            5 => UnindexState::Complete,
            6 => UnindexState::Error,
            _ => return None,
        })
    }
}

pub struct UnindexContext {
    pub(crate) id: UnindexId,
    pub(crate) filename: PathBuf,
    pub(crate) file_size: u64,
    pub(crate) state: UnindexState,
    pub(crate) file_id: Option<HashCode>,
    /// URI of the file, known once its blocks were enumerated
    pub(crate) chk_uri: Option<Uri>,
    pub(crate) ksk: Option<Uri>,
    /// Keywords whose blocks were already removed
    pub(crate) ksk_offset: usize,
    pub(crate) emsg: Option<String>,
    pub(crate) start_time: Instant,
    pub(crate) serialization: Option<String>,
    encoder: Option<TreeEncoder>,
    reader: FileReader,
    pending: Option<OpId>,
    /// Matching keyword blocks still to remove for the current keyword
    removals: VecDeque<(HashCode, Bytes)>,
    fetched: bool,
}

impl UnindexContext {
    pub(crate) fn new(id: UnindexId, filename: PathBuf, file_size: u64) -> Self {
        UnindexContext {
            id,
            reader: FileReader::new(&filename),
            filename,
            file_size,
            state: UnindexState::Hashing,
            file_id: None,
            chk_uri: None,
            ksk: None,
            ksk_offset: 0,
            emsg: None,
            start_time: Instant::now(),
            serialization: None,
            encoder: None,
            pending: None,
            removals: VecDeque::new(),
            fetched: false,
        }
    }

    pub fn id(&self) -> UnindexId {
        self.id
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    pub fn state(&self) -> UnindexState {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.emsg.as_deref()
    }
}

/// Keywords a file published from `path` was most likely announced under
fn keywords_for(path: &Path) -> Uri {
    let mut meta = MetaData::new();
    if let Some(name) = path.file_name() {
        meta.insert_str(MetaType::OriginalFilename, &name.to_string_lossy());
    }
    Uri::ksk_from_metadata(&meta)
}

impl Fs {
    /// Withdraw an indexed file
    pub fn unindex_start(&mut self, filename: impl Into<PathBuf>) -> Result<UnindexId> {
        let filename = filename.into();
        let file_size = std::fs::metadata(&filename)?.len();
        let id = UnindexId(self.next_raw_id());
        info!(unindex = id.raw(), path = %filename.display(), size = file_size, "Starting unindex");
        self.unindexes
            .insert(id, UnindexContext::new(id, filename, file_size));
        self.unindex_emit(id, UnindexStatus::Start);
        self.unindex_sync(id);
        self.unindex_continue(id);
        self.run_tasks();
        Ok(id)
    }

    pub fn unindex_stop(&mut self, id: UnindexId) -> Result<()> {
        if !self.unindexes.contains_key(&id) {
            return Err(FsError::UnknownOperation(format!("unindex {}", id.raw())));
        }
        self.unindex_detach(id);
        self.unindex_emit(id, UnindexStatus::Stopped);
        self.unindex_remove_sync(id);
        self.unindexes.remove(&id);
        info!(unindex = id.raw(), "Unindex stopped");
        self.run_tasks();
        Ok(())
    }

    pub fn unindex(&self, id: UnindexId) -> Option<&UnindexContext> {
        self.unindexes.get(&id)
    }

    pub fn unindexes(&self) -> impl Iterator<Item = &UnindexContext> {
        self.unindexes.values()
    }

    fn unindex_emit(&self, id: UnindexId, status: UnindexStatus) {
        let Some(uc) = self.unindexes.get(&id) else {
            return;
        };
        let completed = match &status {
            UnindexStatus::Completed => uc.file_size,
            UnindexStatus::Resume { .. } if uc.state == UnindexState::Complete => uc.file_size,
            UnindexStatus::Progress {
                offset,
                data_len,
                depth: 0,
            } => (offset + *data_len as u64).min(uc.file_size),
            UnindexStatus::Progress { offset, .. } => (*offset).min(uc.file_size),
            _ => 0,
        };
        self.emit(ProgressEvent::Unindex(UnindexEvent {
            id,
            filename: uc.filename.clone(),
            size: uc.file_size,
            completed,
            duration: uc.start_time.elapsed(),
            status,
        }));
    }

    fn unindex_request(&mut self, id: UnindexId, make: impl FnOnce(OpId) -> Request) {
        let op = self.new_op(OpOwner::Unindex(id));
        if let Some(uc) = self.unindexes.get_mut(&id) {
            uc.pending = Some(op);
        }
        self.send(make(op));
    }

    fn unindex_detach(&mut self, id: UnindexId) {
        let Some(uc) = self.unindexes.get_mut(&id) else {
            return;
        };
        uc.encoder = None;
        uc.reader.close();
        if let Some(op) = uc.pending.take() {
            self.ops.remove(&op);
        }
    }

    /// Run the step that belongs to the current state
    fn unindex_continue(&mut self, id: UnindexId) {
        let Some(uc) = self.unindexes.get(&id) else {
            return;
        };
        match uc.state {
            UnindexState::Hashing => {
                let path = uc.filename.clone();
                self.unindex_request(id, |op| Request::HashFile { op, path });
            }
            UnindexState::FsNotify => {
                let Some(file_id) = uc.file_id else {
                    self.unindex_fail(id, "Missing hash of file being unindexed".into());
                    return;
                };
                debug!(unindex = id.raw(), file_id = %file_id.short(), "Asking service to drop index entry");
                self.unindex_request(id, |op| Request::Unindex { op, file_id });
            }
            UnindexState::DsRemove => self.unindex_remove_step(id),
            UnindexState::ExtractKeywords => self.unindex_extract_keywords(id),
            UnindexState::DsRemoveKBlocks => self.unindex_kblock_step(id),
            UnindexState::Complete | UnindexState::Error => {}
        }
    }

    fn unindex_set_state(&mut self, id: UnindexId, state: UnindexState) {
        if let Some(uc) = self.unindexes.get_mut(&id) {
            trace!(unindex = id.raw(), ?state, "Unindex state change");
            uc.state = state;
        }
        self.unindex_sync(id);
    }

    pub(crate) fn unindex_response(&mut self, id: UnindexId, op: OpId, response: Response) {
        let Some(uc) = self.unindexes.get_mut(&id) else {
            return;
        };
        if uc.pending != Some(op) {
            return;
        }
        uc.pending = None;
        match (uc.state, response) {
            (UnindexState::Hashing, Response::Hashed { result: Ok(hash), .. }) => {
                uc.file_id = Some(hash);
                self.unindex_set_state(id, UnindexState::FsNotify);
                self.unindex_continue(id);
            }
            (UnindexState::Hashing, Response::Hashed { result: Err(e), .. }) => {
                self.unindex_fail(id, format!("Failed to compute hash of file: {}", e));
            }
            (UnindexState::FsNotify, Response::Done { result: Ok(()), .. }) => {
                self.unindex_set_state(id, UnindexState::DsRemove);
                self.unindex_continue(id);
            }
            (UnindexState::FsNotify, Response::Done { result: Err(e), .. }) => {
                self.unindex_fail(id, format!("Failed to unindex file: {}", e));
            }
            (UnindexState::DsRemove, Response::Done { result, .. }) => {
                if let Err(e) = result {
                    debug!(unindex = id.raw(), error = %e, "Block removal failed");
                }
                self.unindex_remove_step(id);
            }
            (UnindexState::DsRemoveKBlocks, Response::Found { blocks, .. }) => {
                self.unindex_kblocks_found(id, blocks);
            }
            (UnindexState::DsRemoveKBlocks, Response::Done { result, .. }) => {
                if let Err(e) = result {
                    debug!(unindex = id.raw(), error = %e, "Keyword block removal failed");
                }
                self.unindex_kblock_step(id);
            }
            (state, other) => {
                warn!(unindex = id.raw(), ?state, reply = ?other, "Unexpected reply to unindex request");
                self.unindex_fail(id, "Unexpected reply from the service".into());
            }
        }
    }

    /// Re-encode the file and remove the next block it produces
    fn unindex_remove_step(&mut self, id: UnindexId) {
        let Some(uc) = self.unindexes.get_mut(&id) else {
            return;
        };
        let Some(file_id) = uc.file_id else {
            self.unindex_fail(id, "Missing hash of file being unindexed".into());
            return;
        };
        let size = uc.file_size;
        let encoder = uc.encoder.get_or_insert_with(|| TreeEncoder::new(size));
        match encoder.next(&mut uc.reader) {
            Err(e) => {
                uc.encoder = None;
                self.unindex_fail(id, format!("Failed to read file: {}", e));
            }
            Ok(TreeStep::Done(uri)) => {
                uc.encoder = None;
                uc.reader.close();
                debug!(unindex = id.raw(), uri = %uri, "Removed file blocks");
                uc.chk_uri = Some(uri);
                self.unindex_set_state(id, UnindexState::ExtractKeywords);
                self.unindex_continue(id);
            }
            Ok(TreeStep::Block(b)) => {
                self.unindex_emit(
                    id,
                    UnindexStatus::Progress {
                        offset: b.offset,
                        data_len: b.data.len(),
                        depth: b.depth,
                    },
                );
                let data = if b.depth == 0 {
                    Bytes::from(
                        OnDemandBlock {
                            offset: b.offset,
                            file_id,
                        }
                        .to_bytes(),
                    )
                } else {
                    Bytes::from(b.data)
                };
                let query = b.chk.query;
                trace!(unindex = id.raw(), query = %query.short(), depth = b.depth, "Removing block");
                self.unindex_request(id, |op| Request::Remove { op, query, data });
            }
        }
    }

    fn unindex_extract_keywords(&mut self, id: UnindexId) {
        let Some(uc) = self.unindexes.get_mut(&id) else {
            return;
        };
        let ksk = keywords_for(&uc.filename);
        debug!(unindex = id.raw(), keywords = ksk.keywords().len(), "Extracted keywords");
        uc.ksk = Some(ksk);
        uc.ksk_offset = 0;
        self.unindex_set_state(id, UnindexState::DsRemoveKBlocks);
        self.unindex_continue(id);
    }

    /// Remove the next matching keyword block, or look up the next keyword
    fn unindex_kblock_step(&mut self, id: UnindexId) {
        let Some(uc) = self.unindexes.get_mut(&id) else {
            return;
        };
        if let Some((query, data)) = uc.removals.pop_front() {
            self.unindex_request(id, |op| Request::Remove { op, query, data });
            return;
        }
        if std::mem::take(&mut uc.fetched) {
            uc.ksk_offset += 1;
            self.unindex_sync(id);
        }
        let Some(uc) = self.unindexes.get(&id) else {
            return;
        };
        let word = uc
            .ksk
            .as_ref()
            .and_then(|k| k.keywords().get(uc.ksk_offset))
            .map(|kw| kw.word.clone());
        match word {
            Some(word) => {
                let query = block::ksk_query(&word);
                trace!(unindex = id.raw(), keyword = %word, "Looking up keyword blocks");
                self.unindex_request(id, |op| Request::Get {
                    op,
                    query,
                    block_type: BlockType::UBlock,
                });
            }
            None => self.unindex_complete(id),
        }
    }

    fn unindex_kblocks_found(&mut self, id: UnindexId, blocks: Vec<(BlockType, Bytes)>) {
        let Some(uc) = self.unindexes.get_mut(&id) else {
            return;
        };
        let Some(word) = uc
            .ksk
            .as_ref()
            .and_then(|k| k.keywords().get(uc.ksk_offset))
            .map(|kw| kw.word.clone())
        else {
            self.unindex_complete(id);
            return;
        };
        let public_key = block::ksk_public_key(&word);
        let query = block::ksk_query(&word);
        for (_, data) in blocks {
            let Ok(content) = block::decrypt_ublock(&data, &public_key, &word) else {
                continue;
            };
            let points_here = uc.chk_uri.as_ref().is_some_and(|chk| {
                content.uri == *chk || content.uri.loc_chk().as_ref() == Some(chk)
            });
            if points_here {
                uc.removals.push_back((query, data));
            }
        }
        debug!(unindex = id.raw(), keyword = %word, matches = uc.removals.len(), "Keyword blocks found");
        uc.fetched = true;
        self.unindex_kblock_step(id);
    }

    fn unindex_complete(&mut self, id: UnindexId) {
        self.unindex_set_state(id, UnindexState::Complete);
        info!(unindex = id.raw(), "Unindex completed");
        self.unindex_emit(id, UnindexStatus::Completed);
    }

    fn unindex_fail(&mut self, id: UnindexId, message: String) {
        let Some(uc) = self.unindexes.get_mut(&id) else {
            return;
        };
        warn!(unindex = id.raw(), path = %uc.filename.display(), error = %message, "Unindex failed");
        uc.emsg = Some(message.clone());
        uc.encoder = None;
        self.unindex_set_state(id, UnindexState::Error);
        self.unindex_emit(id, UnindexStatus::Error { message });
    }

    /// Re-attach an unindex loaded from disk
    pub(crate) fn unindex_resume(&mut self, uc: UnindexContext) {
        let id = uc.id;
        let message = uc.emsg.clone();
        self.unindexes.insert(id, uc);
        self.unindex_emit(id, UnindexStatus::Resume { message });
        self.unindex_continue(id);
    }

    pub(crate) fn unindex_suspend(&mut self, id: UnindexId) {
        if !self.unindexes.contains_key(&id) {
            return;
        }
        self.unindex_sync(id);
        self.unindex_detach(id);
        self.unindex_emit(id, UnindexStatus::Suspend);
        self.unindexes.remove(&id);
        debug!(unindex = id.raw(), "Unindex suspended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FsConfig;
    use crate::file_info::FileInformation;
    use crate::publish::PublishOptions;
    use crate::service::{BlockOptions, MemoryService, Service};
    use crate::tree::DBLOCK_SIZE;
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

    fn unindex_statuses(rx: &mut mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<UnindexStatus> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let ProgressEvent::Unindex(e) = ev {
                out.push(e.status);
            }
        }
        out
    }

    #[test]
    fn test_state_codes() {
        for state in [
            UnindexState::Hashing,
            UnindexState::FsNotify,
            UnindexState::DsRemove,
            UnindexState::ExtractKeywords,
            UnindexState::DsRemoveKBlocks,
            UnindexState::Complete,
            UnindexState::Error,
        ] {
            assert_eq!(UnindexState::from_code(state.code()), Some(state));
        }
        assert_eq!(UnindexState::from_code(7), None);
    }

    #[test]
    fn test_keywords_for_path() {
        let ksk = keywords_for(Path::new("/tmp/holiday.jpg"));
        let words: Vec<&str> = ksk.keywords().iter().map(|k| k.word.as_str()).collect();
        assert!(words.contains(&"holiday.jpg"));
        assert!(words.contains(&"holiday"));
    }

    #[test]
    fn test_unindex_removes_everything() {
        let (mut fs, mut rx, dir) = test_fs();
        let mut service = MemoryService::new();
        let path = dir.path().join("report.txt");
        let content: Vec<u8> = (0..2 * DBLOCK_SIZE + 10).map(|i| (i % 253) as u8).collect();
        std::fs::write(&path, &content).unwrap();
        let fi = FileInformation::from_file(
            &path,
            Some(keywords_for(&path)),
            None,
            true,
            BlockOptions::default(),
        )
        .unwrap();
        fs.publish_start(fi, None, PublishOptions::default()).unwrap();
        pump(&mut fs, &mut service);
        assert!(service.count_blocks(BlockType::OnDemand) > 0);
        assert!(service.count_blocks(BlockType::UBlock) > 0);
        let file_id = HashCode::digest(&content);
        assert!(service.is_indexed(&file_id));
        while rx.try_recv().is_ok() {}

        let id = fs.unindex_start(&path).unwrap();
        pump(&mut fs, &mut service);

        let statuses = unindex_statuses(&mut rx);
        assert_eq!(statuses.first(), Some(&UnindexStatus::Start));
        assert_eq!(statuses.last(), Some(&UnindexStatus::Completed));
        assert!(statuses
            .iter()
            .any(|s| matches!(s, UnindexStatus::Progress { depth: 1, .. })));
        assert_eq!(fs.unindex(id).unwrap().state(), UnindexState::Complete);
        assert!(!service.is_indexed(&file_id));
        assert_eq!(service.count_blocks(BlockType::OnDemand), 0);
        assert_eq!(service.count_blocks(BlockType::IBlock), 0);
        assert_eq!(service.count_blocks(BlockType::UBlock), 0);
    }

    #[test]
    fn test_foreign_keyword_blocks_survive() {
        let (mut fs, _rx, dir) = test_fs();
        let mut service = MemoryService::new();
        let other = FileInformation::from_data(
            b"someone else's notes".to_vec(),
            Some(Uri::ksk_from_args(&["notes"])),
            None,
            BlockOptions::default(),
        )
        .unwrap();
        fs.publish_start(other, None, PublishOptions::default())
            .unwrap();
        pump(&mut fs, &mut service);

        let path = dir.path().join("notes");
        std::fs::write(&path, b"my notes").unwrap();
        let id = fs.unindex_start(&path).unwrap();
        pump(&mut fs, &mut service);
        assert_eq!(fs.unindex(id).unwrap().state(), UnindexState::Complete);
        assert!(service.contains(&block::ksk_query("notes")));
    }

    #[test]
    fn test_missing_file_is_rejected() {
        let (mut fs, _rx, dir) = test_fs();
        assert!(fs.unindex_start(dir.path().join("absent")).is_err());
    }

    #[test]
    fn test_stop_forgets_operation() {
        let (mut fs, mut rx, dir) = test_fs();
        let path = dir.path().join("f");
        std::fs::write(&path, b"data").unwrap();
        let id = fs.unindex_start(&path).unwrap();
        assert!(matches!(fs.poll_request(), Some(Request::HashFile { .. })));
        fs.unindex_stop(id).unwrap();
        assert!(fs.unindex(id).is_none());
        assert!(fs.is_idle());
        assert_eq!(
            unindex_statuses(&mut rx),
            vec![UnindexStatus::Start, UnindexStatus::Stopped]
        );
    }
}
