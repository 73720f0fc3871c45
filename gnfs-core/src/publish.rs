//! Publishing files and directories
//!
//! A publish walks its [`FileInformation`] tree depth first. Every file is
//! run through the tree encoder one block at a time, each block waiting for
//! the datastore to acknowledge the previous one. Directories are encoded
//! after all of their children, from the children's final URIs. Once a node
//! has its URI it is announced under its keywords; once the whole tree is
//! done the root is optionally published into a namespace.
//!
//! Files marked for indexing are hashed and announced to the service first.
//! Their leaves are then stored as on-demand stubs. If the service refuses
//! or does not answer in time the file is inserted instead.

use bytes::Bytes;
use ed25519_dalek::SigningKey;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::block::{BlockType, OnDemandBlock, MAX_UBLOCK_SIZE, ONDEMAND_BLOCK_SIZE};
use crate::crypto::HashCode;
use crate::directory::DirectoryBuilder;
use crate::error::{FsError, Result};
use crate::events::{ProgressEvent, PublishEvent, PublishId, PublishStatus, UBlockPublishId};
use crate::file_info::{FileInformation, FileKind};
use crate::fs::{Fs, OpOwner, Task, Timer, TimerKey};
use crate::reader::MemoryReader;
use crate::service::{OpId, Request, ReserveId, Response};
use crate::tree::{TreeBlock, TreeEncoder, TreeStep, CHK_PER_INODE, DBLOCK_SIZE};
use crate::uri::{NamespaceId, Uri};

/// Reply a publish is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PublishWait {
    Reserve,
    Hash,
    IndexStart,
    Put,
    Release,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Compute the URIs without storing anything
    pub simulate_only: bool,
}

impl PublishOptions {
    pub(crate) fn to_bits(self) -> u32 {
        self.simulate_only as u32
    }

    pub(crate) fn from_bits(bits: u32) -> Self {
        PublishOptions {
            simulate_only: bits & 1 != 0,
        }
    }
}

/// Namespace entry to create for the root once it is published
#[derive(Debug, Clone)]
pub struct NamespacePublish {
    pub key: SigningKey,
    pub identifier: String,
    /// Identifier reserved for the next version
    pub update: Option<String>,
}

pub struct PublishContext {
    pub(crate) id: PublishId,
    pub(crate) fi: FileInformation,
    /// Node being worked on; `None` once the whole tree has its URIs
    pub(crate) fi_pos: Option<Vec<usize>>,
    pub(crate) namespace: Option<NamespacePublish>,
    pub(crate) options: PublishOptions,
    pub(crate) reserve: Option<ReserveId>,
    encoder: Option<TreeEncoder>,
    pending: Option<(OpId, PublishWait)>,
    index_timer: Option<TimerKey>,
    /// Block publication in flight; the path is `None` for the namespace entry
    ublock: Option<(UBlockPublishId, Option<Vec<usize>>)>,
    pub(crate) all_done: bool,
    pub(crate) start_time: Instant,
    pub(crate) serialization: Option<String>,
}

impl PublishContext {
    pub(crate) fn new(
        id: PublishId,
        fi: FileInformation,
        namespace: Option<NamespacePublish>,
        options: PublishOptions,
    ) -> Self {
        PublishContext {
            id,
            fi,
            fi_pos: Some(Vec::new()),
            namespace,
            options,
            reserve: None,
            encoder: None,
            pending: None,
            index_timer: None,
            ublock: None,
            all_done: false,
            start_time: Instant::now(),
            serialization: None,
        }
    }

    pub fn id(&self) -> PublishId {
        self.id
    }

    pub fn file_information(&self) -> &FileInformation {
        &self.fi
    }

    pub fn options(&self) -> PublishOptions {
        self.options
    }

    /// Finished, successfully or not
    pub fn is_done(&self) -> bool {
        self.all_done
    }
}

fn tree_block_count(size: u64) -> u64 {
    let mut level = size.div_ceil(DBLOCK_SIZE as u64).max(1);
    let mut total = level;
    while level > 1 {
        level = level.div_ceil(CHK_PER_INODE as u64);
        total += level;
    }
    total
}

/// Datastore bytes and entries needed to publish `fi`
pub(crate) fn reservation(fi: &FileInformation) -> (u64, u32) {
    let mut bytes = 0u64;
    let mut entries = 0u64;
    fi.inspect(&mut |node, _| {
        let kc = node.keyword_count() as u64;
        entries += kc;
        bytes += kc * MAX_UBLOCK_SIZE as u64;
        if let FileKind::File { size, do_index, .. } = &node.kind {
            entries += tree_block_count(*size);
            bytes += if *do_index {
                size.div_ceil(DBLOCK_SIZE as u64) * ONDEMAND_BLOCK_SIZE as u64
            } else {
                *size
            };
        }
        true
    });
    (bytes, u32::try_from(entries).unwrap_or(u32::MAX))
}

/// Position after `path` in depth-first order: next sibling or parent
fn next_position(fi: &FileInformation, path: &[usize]) -> Option<Vec<usize>> {
    let (&last, parent) = path.split_last()?;
    let siblings = fi.node(parent).map_or(0, |p| p.children().len());
    let mut next = parent.to_vec();
    if last + 1 < siblings {
        next.push(last + 1);
    }
    Some(next)
}

fn display_name(node: &FileInformation) -> Option<String> {
    node.filename
        .as_ref()
        .map(|p| p.display().to_string())
        .or_else(|| node.meta.original_filename())
}

impl Fs {
    /// Publish a file or directory tree
    pub fn publish_start(
        &mut self,
        fi: FileInformation,
        namespace: Option<NamespacePublish>,
        options: PublishOptions,
    ) -> Result<PublishId> {
        if namespace.as_ref().is_some_and(|ns| ns.identifier.is_empty()) {
            return Err(FsError::InvalidArgument(
                "namespace identifier must not be empty".into(),
            ));
        }
        let id = PublishId(self.next_raw_id());
        info!(
            publish = id.raw(),
            filename = ?fi.filename(),
            size = fi.contents_size(),
            simulate = options.simulate_only,
            "Starting publish"
        );
        let paths = fi.paths();
        self.publishes
            .insert(id, PublishContext::new(id, fi, namespace, options));
        for path in &paths {
            self.publish_emit(id, path, PublishStatus::Start);
        }
        self.publish_sync(id);
        self.schedule(Task::PublishMain(id));
        self.run_tasks();
        Ok(id)
    }

    /// Stop a publish; blocks already stored stay in the datastore
    pub fn publish_stop(&mut self, id: PublishId) -> Result<()> {
        let pc = self
            .publishes
            .get(&id)
            .ok_or_else(|| FsError::UnknownOperation(format!("publish {}", id.raw())))?;
        let release = if pc.all_done { None } else { pc.reserve };
        self.publish_detach(id);
        if let Some(reserve) = release {
            let op = self.new_op(OpOwner::Detached);
            self.send(Request::ReleaseReserve { op, reserve });
        }
        let paths = self.publishes[&id].fi.paths();
        for path in paths.iter().rev() {
            self.publish_emit(id, path, PublishStatus::Stopped);
        }
        self.publish_remove_sync(id);
        self.publishes.remove(&id);
        info!(publish = id.raw(), "Publish stopped");
        self.run_tasks();
        Ok(())
    }

    pub fn publish(&self, id: PublishId) -> Option<&PublishContext> {
        self.publishes.get(&id)
    }

    pub(crate) fn publish_emit(&self, id: PublishId, path: &[usize], status: PublishStatus) {
        let Some(pc) = self.publishes.get(&id) else {
            return;
        };
        let Some(node) = pc.fi.node(path) else {
            return;
        };
        let size = if node.is_directory() && node.size() == 0 {
            node.contents_size()
        } else {
            node.size()
        };
        let completed = match &status {
            PublishStatus::Completed { .. } => size,
            PublishStatus::Progress {
                offset,
                data_len,
                depth: 0,
            } => (offset + *data_len as u64).min(size),
            PublishStatus::Progress { offset, .. } => (*offset).min(size),
            _ => 0,
        };
        self.emit(ProgressEvent::Publish(PublishEvent {
            id,
            node: path.to_vec(),
            filename: display_name(node),
            size,
            completed,
            duration: node.start_time.elapsed(),
            anonymity: node.options.anonymity,
            status,
        }));
    }

    fn publish_request(
        &mut self,
        id: PublishId,
        wait: PublishWait,
        make: impl FnOnce(OpId) -> Request,
    ) -> OpId {
        let op = self.new_op(OpOwner::Publish(id, wait));
        if let Some(pc) = self.publishes.get_mut(&id) {
            pc.pending = Some((op, wait));
        }
        self.send(make(op));
        op
    }

    /// Drop everything the publish is waiting for
    fn publish_detach(&mut self, id: PublishId) {
        let Some(pc) = self.publishes.get_mut(&id) else {
            return;
        };
        let pending = pc.pending.take();
        let timer = pc.index_timer.take();
        let job = pc.ublock.take();
        pc.encoder = None;
        if let Some((op, _)) = pending {
            self.ops.remove(&op);
        }
        self.cancel_timer(timer);
        if let Some((job, _)) = job {
            let _ = self.ublock_cancel(job);
        }
    }

    /// Advance the publish by one step
    pub(crate) fn publish_main(&mut self, id: PublishId) {
        let Some(pc) = self.publishes.get(&id) else {
            return;
        };
        if pc.all_done || pc.pending.is_some() || pc.ublock.is_some() {
            return;
        }
        if !pc.options.simulate_only && pc.reserve.is_none() {
            let (bytes, entries) = reservation(&pc.fi);
            debug!(publish = id.raw(), bytes, entries, "Reserving datastore space");
            self.publish_request(id, PublishWait::Reserve, |op| Request::Reserve {
                op,
                bytes,
                entries,
            });
            return;
        }
        let Some(mut path) = pc.fi_pos.clone() else {
            self.publish_tree_done(id);
            return;
        };
        while let Some(node) = pc.fi.node(&path) {
            let descend = node.is_directory()
                && node.emsg.is_none()
                && node.chk_uri.is_none()
                && node.children().first().is_some_and(|c| c.chk_uri.is_none());
            if !descend {
                break;
            }
            path.push(0);
        }
        let Some(node) = pc.fi.node(&path) else {
            warn!(publish = id.raw(), ?path, "Publish position outside the file tree");
            return;
        };
        let failed = node.emsg.is_some();
        let encoded = node.chk_uri.is_some();
        if let Some(pc) = self.publishes.get_mut(&id) {
            pc.fi_pos = Some(path.clone());
        }
        if failed {
            self.publish_propagate_error(id, path);
        } else if encoded {
            self.publish_node_encoded(id, path);
        } else {
            self.publish_encode_step(id, path);
        }
    }

    fn publish_encode_step(&mut self, id: PublishId, path: Vec<usize>) {
        let Some(pc) = self.publishes.get_mut(&id) else {
            return;
        };
        let simulate = pc.options.simulate_only;
        let Some(node) = pc.fi.node_mut(&path) else {
            return;
        };

        if let FileKind::Directory {
            children,
            dir_data: dir_data @ None,
        } = &mut node.kind
        {
            let mut builder = DirectoryBuilder::new(Some(&node.meta));
            for child in children.iter() {
                let Some(uri) = &child.chk_uri else {
                    continue;
                };
                if let Err(e) = builder.add(uri, &child.meta, None) {
                    warn!(publish = id.raw(), uri = %uri, error = %e, "Skipping directory entry");
                }
            }
            let data = builder.finish();
            debug!(publish = id.raw(), entries = children.len(), size = data.len(), "Built directory");
            *dir_data = Some(Bytes::from(data));
        }

        if let FileKind::File {
            do_index: true,
            file_id,
            index_start_confirmed: false,
            ..
        } = &node.kind
        {
            if !simulate {
                let file_id = *file_id;
                let Some(filename) = node.filename.clone() else {
                    self.publish_index_fallback(id, "file has no name on disk");
                    return;
                };
                match file_id {
                    None => {
                        debug!(publish = id.raw(), path = %filename.display(), "Hashing file for indexing");
                        self.publish_request(id, PublishWait::Hash, |op| Request::HashFile {
                            op,
                            path: filename,
                        });
                    }
                    Some(file_id) => {
                        let op = self.publish_request(id, PublishWait::IndexStart, |op| {
                            Request::IndexStart {
                                op,
                                file_id,
                                path: filename,
                            }
                        });
                        let timer = self.add_timer_in(
                            self.config.index_start_timeout(),
                            Timer::IndexStartTimeout(id, op),
                        );
                        if let Some(pc) = self.publishes.get_mut(&id) {
                            pc.index_timer = Some(timer);
                        }
                    }
                }
                return;
            }
        }

        let index_id = match &node.kind {
            FileKind::File {
                do_index: true,
                index_start_confirmed: true,
                file_id,
                ..
            } if !simulate => *file_id,
            _ => None,
        };
        let size = node.size();
        let encoder = pc.encoder.get_or_insert_with(|| TreeEncoder::new(size));
        let step = match &mut node.kind {
            FileKind::File { reader, .. } => encoder.next(reader.as_mut()),
            FileKind::Directory { dir_data, .. } => {
                let mut reader = MemoryReader::new(dir_data.clone().unwrap_or_default());
                encoder.next(&mut reader)
            }
        };

        match step {
            Err(e) => {
                pc.encoder = None;
                self.publish_node_error(id, &path, e.to_string());
            }
            Ok(TreeStep::Done(uri)) => {
                pc.encoder = None;
                if let Some(node) = pc.fi.node_mut(&path) {
                    if let FileKind::File { reader, .. } = &mut node.kind {
                        reader.close();
                    }
                    debug!(publish = id.raw(), ?path, uri = %uri, "Node encoded");
                    node.chk_uri = Some(uri);
                }
                self.publish_sync(id);
                self.schedule(Task::PublishMain(id));
            }
            Ok(TreeStep::Block(block)) => self.publish_block(id, &path, block, index_id),
        }
    }

    fn publish_block(
        &mut self,
        id: PublishId,
        path: &[usize],
        block: TreeBlock,
        index_id: Option<HashCode>,
    ) {
        self.publish_emit(
            id,
            path,
            PublishStatus::Progress {
                offset: block.offset,
                data_len: block.data.len(),
                depth: block.depth,
            },
        );
        let Some(pc) = self.publishes.get(&id) else {
            return;
        };
        if pc.options.simulate_only {
            self.schedule(Task::PublishMain(id));
            return;
        }
        let Some(node) = pc.fi.node(path) else {
            return;
        };
        let (options, reserve) = (node.options, pc.reserve);
        let (block_type, data) = match index_id {
            Some(file_id) if block.depth == 0 => {
                let odb = OnDemandBlock {
                    offset: block.offset,
                    file_id,
                };
                (BlockType::OnDemand, Bytes::from(odb.to_bytes()))
            }
            _ => (block.block_type, Bytes::from(block.data)),
        };
        let query = block.chk.query;
        trace!(
            publish = id.raw(),
            query = %query.short(),
            offset = block.offset,
            depth = block.depth,
            ?block_type,
            "Storing block"
        );
        self.publish_request(id, PublishWait::Put, |op| Request::Put {
            op,
            query,
            block_type,
            data,
            options,
            reserve,
        });
    }

    pub(crate) fn publish_response(
        &mut self,
        id: PublishId,
        op: OpId,
        wait: PublishWait,
        response: Response,
    ) {
        let Some(pc) = self.publishes.get_mut(&id) else {
            return;
        };
        if pc.pending != Some((op, wait)) {
            trace!(publish = id.raw(), op = op.0, "Stale reply for publish");
            return;
        }
        pc.pending = None;
        let path = pc.fi_pos.clone().unwrap_or_default();
        match (wait, response) {
            (PublishWait::Reserve, Response::Reserved { result: Ok(reserve), .. }) => {
                debug!(publish = id.raw(), reserve = reserve.0, "Datastore space reserved");
                pc.reserve = Some(reserve);
                self.schedule(Task::PublishMain(id));
            }
            (PublishWait::Reserve, Response::Reserved { result: Err(e), .. }) => {
                let message = format!("Datastore failure: {}", e);
                warn!(publish = id.raw(), error = %e, "Reservation failed");
                pc.fi.emsg = Some(message.clone());
                pc.all_done = true;
                self.publish_emit(id, &[], PublishStatus::Error { message });
                self.publish_sync(id);
            }
            (PublishWait::Hash, Response::Hashed { result: Ok(hash), .. }) => {
                if let Some(FileKind::File { file_id, .. }) =
                    pc.fi.node_mut(&path).map(|n| &mut n.kind)
                {
                    *file_id = Some(hash);
                }
                self.publish_sync(id);
                self.schedule(Task::PublishMain(id));
            }
            (PublishWait::Hash, Response::Hashed { result: Err(e), .. }) => {
                self.publish_index_fallback(id, &e);
            }
            (PublishWait::IndexStart, Response::Done { result, .. }) => {
                let timer = pc.index_timer.take();
                self.cancel_timer(timer);
                match result {
                    Ok(()) => {
                        if let Some(FileKind::File {
                            index_start_confirmed,
                            ..
                        }) = self
                            .publishes
                            .get_mut(&id)
                            .and_then(|pc| pc.fi.node_mut(&path))
                            .map(|n| &mut n.kind)
                        {
                            *index_start_confirmed = true;
                        }
                        debug!(publish = id.raw(), "Service accepted index request");
                        self.publish_sync(id);
                        self.schedule(Task::PublishMain(id));
                    }
                    Err(e) => self.publish_index_fallback(id, &e),
                }
            }
            (PublishWait::Put, Response::Done { result: Ok(()), .. }) => {
                self.schedule(Task::PublishMain(id));
            }
            (PublishWait::Put, Response::Done { result: Err(e), .. }) => {
                pc.encoder = None;
                let indexed = match pc.fi.node_mut(&path).map(|n| &mut n.kind) {
                    Some(FileKind::File {
                        index_start_confirmed: confirmed @ true,
                        file_id,
                        ..
                    }) => {
                        *confirmed = false;
                        *file_id
                    }
                    _ => None,
                };
                if let Some(file_id) = indexed {
                    debug!(publish = id.raw(), file_id = %file_id.short(), "Withdrawing index after failed put");
                    let op = self.new_op(OpOwner::Detached);
                    self.send(Request::Unindex { op, file_id });
                }
                self.publish_node_error(id, &path, format!("Publishing failed: {}", e));
            }
            (PublishWait::Release, Response::Done { result, .. }) => {
                if let Err(e) = result {
                    debug!(publish = id.raw(), error = %e, "Releasing reservation failed");
                }
                pc.reserve = None;
                self.publish_complete(id);
            }
            (wait, other) => {
                warn!(publish = id.raw(), ?wait, reply = ?other, "Unexpected reply to publish request");
                self.publish_node_error(id, &path, "Unexpected reply from the service".into());
            }
        }
    }

    pub(crate) fn publish_index_timeout(&mut self, id: PublishId, op: OpId) {
        let Some(pc) = self.publishes.get_mut(&id) else {
            return;
        };
        if pc.pending != Some((op, PublishWait::IndexStart)) {
            return;
        }
        pc.pending = None;
        pc.index_timer = None;
        self.ops.remove(&op);
        self.publish_index_fallback(id, "timeout waiting for the service");
    }

    /// Give up on indexing the current file and insert it instead
    fn publish_index_fallback(&mut self, id: PublishId, reason: &str) {
        let Some(pc) = self.publishes.get_mut(&id) else {
            return;
        };
        let path = pc.fi_pos.clone().unwrap_or_default();
        let Some(node) = pc.fi.node_mut(&path) else {
            return;
        };
        warn!(
            publish = id.raw(),
            "Can not index file `{}': {}. Will try to insert instead.",
            display_name(node).unwrap_or_default(),
            reason
        );
        if let FileKind::File {
            do_index,
            index_start_confirmed,
            ..
        } = &mut node.kind
        {
            *do_index = false;
            *index_start_confirmed = false;
        }
        self.publish_sync(id);
        self.schedule(Task::PublishMain(id));
    }

    /// Record the failure of one node; the main loop propagates it upward
    fn publish_node_error(&mut self, id: PublishId, path: &[usize], message: String) {
        let Some(pc) = self.publishes.get_mut(&id) else {
            return;
        };
        pc.encoder = None;
        let Some(node) = pc.fi.node_mut(path) else {
            return;
        };
        warn!(publish = id.raw(), ?path, error = %message, "Publishing node failed");
        node.emsg = Some(message.clone());
        self.publish_emit(id, path, PublishStatus::Error { message });
        self.publish_sync(id);
        self.schedule(Task::PublishMain(id));
    }

    fn publish_propagate_error(&mut self, id: PublishId, mut path: Vec<usize>) {
        let Some(pc) = self.publishes.get_mut(&id) else {
            return;
        };
        let mut message = pc
            .fi
            .node(&path)
            .and_then(|n| n.emsg.clone())
            .unwrap_or_default();
        let mut failed = Vec::new();
        while !path.is_empty() {
            let name = pc.fi.node(&path).and_then(display_name);
            path.pop();
            message = match name {
                Some(name) => format!("Recursive upload failed at `{}': {}", name, message),
                None => format!("Recursive upload failed: {}", message),
            };
            if let Some(parent) = pc.fi.node_mut(&path) {
                parent.emsg = Some(message.clone());
            }
            failed.push((path.clone(), message.clone()));
        }
        pc.all_done = true;
        pc.fi_pos = None;
        for (path, message) in failed {
            self.publish_emit(id, &path, PublishStatus::Error { message });
        }
        self.publish_sync(id);
    }

    /// The node has its URI: sign a location for public files, then
    /// announce it under its keywords
    fn publish_node_encoded(&mut self, id: PublishId, path: Vec<usize>) {
        let Some(pc) = self.publishes.get(&id) else {
            return;
        };
        let simulate = pc.options.simulate_only;
        let Some(node) = pc.fi.node(&path) else {
            return;
        };
        let expiration = node.options.expiration;
        let plain_chk = node
            .chk_uri
            .clone()
            .filter(|u| node.options.anonymity == 0 && u.is_chk());
        if let Some(chk) = plain_chk {
            let loc = self
                .peer_key()
                .map_err(FsError::from)
                .and_then(|key| Ok(Uri::loc_create(&chk, &key, expiration)?));
            match loc {
                Ok(loc) => {
                    if let Some(node) = self
                        .publishes
                        .get_mut(&id)
                        .and_then(|pc| pc.fi.node_mut(&path))
                    {
                        node.chk_uri = Some(loc);
                    }
                }
                Err(e) => warn!(publish = id.raw(), error = %e, "Failed to create location URI"),
            }
        }

        let Some(node) = self.publishes.get(&id).and_then(|pc| pc.fi.node(&path)) else {
            return;
        };
        if !node.is_published && !simulate && node.keyword_count() > 0 {
            let (Some(ksk), Some(uri)) = (node.keywords.clone(), node.chk_uri.clone()) else {
                return;
            };
            let (meta, options) = (node.meta.clone(), node.options);
            match self.start_publish_ksk(id, &ksk, &meta, &uri, options) {
                Ok(job) => {
                    if let Some(pc) = self.publishes.get_mut(&id) {
                        pc.ublock = Some((job, Some(path)));
                    }
                }
                Err(e) => self.publish_node_error(id, &path, e.to_string()),
            }
            return;
        }
        self.publish_node_done(id, path);
    }

    fn publish_node_done(&mut self, id: PublishId, path: Vec<usize>) {
        let Some(pc) = self.publishes.get_mut(&id) else {
            return;
        };
        let Some(node) = pc.fi.node_mut(&path) else {
            return;
        };
        node.is_published = true;
        let chk_uri = node.chk_uri.clone();
        pc.fi_pos = next_position(&pc.fi, &path);
        if let (false, Some(chk_uri)) = (path.is_empty(), chk_uri) {
            self.publish_emit(
                id,
                &path,
                PublishStatus::Completed {
                    chk_uri,
                    sks_uri: None,
                },
            );
        }
        self.publish_sync(id);
        self.schedule(Task::PublishMain(id));
    }

    pub(crate) fn publish_ublock_done(
        &mut self,
        id: PublishId,
        job: UBlockPublishId,
        uri: Uri,
        result: std::result::Result<(), String>,
    ) {
        let Some(pc) = self.publishes.get_mut(&id) else {
            return;
        };
        if pc.ublock.as_ref().map(|(j, _)| *j) != Some(job) {
            return;
        }
        let Some((_, target)) = pc.ublock.take() else {
            return;
        };
        match (target, result) {
            (Some(path), Ok(())) => self.publish_node_done(id, path),
            (Some(path), Err(e)) => self.publish_node_error(id, &path, e),
            (None, Ok(())) => {
                pc.fi.sks_uri = Some(uri);
                self.publish_sync(id);
                self.schedule(Task::PublishMain(id));
            }
            (None, Err(message)) => {
                pc.fi.emsg = Some(message.clone());
                pc.all_done = true;
                self.publish_emit(id, &[], PublishStatus::Error { message });
                self.publish_sync(id);
            }
        }
    }

    /// Every node has its URI: namespace entry, release, completion
    fn publish_tree_done(&mut self, id: PublishId) {
        let Some(pc) = self.publishes.get_mut(&id) else {
            return;
        };
        let simulate = pc.options.simulate_only;
        let pending_ns = pc.namespace.clone().filter(|_| pc.fi.sks_uri.is_none());
        if let Some(ns) = pending_ns {
            let Some(uri) = pc.fi.chk_uri.clone() else {
                return;
            };
            if simulate {
                pc.fi.sks_uri = Some(Uri::sks(
                    NamespaceId::from_signing_key(&ns.key),
                    ns.identifier,
                ));
            } else {
                let (meta, options) = (pc.fi.meta.clone(), pc.fi.options);
                match self.start_publish_sks(
                    id,
                    &ns.key,
                    &ns.identifier,
                    ns.update.as_deref(),
                    &meta,
                    &uri,
                    options,
                ) {
                    Ok(job) => {
                        if let Some(pc) = self.publishes.get_mut(&id) {
                            pc.ublock = Some((job, None));
                        }
                    }
                    Err(e) => {
                        let message = e.to_string();
                        if let Some(pc) = self.publishes.get_mut(&id) {
                            pc.fi.emsg = Some(message.clone());
                            pc.all_done = true;
                        }
                        self.publish_emit(id, &[], PublishStatus::Error { message });
                        self.publish_sync(id);
                    }
                }
                return;
            }
        }
        if let Some(reserve) = self.publishes.get(&id).and_then(|pc| pc.reserve) {
            self.publish_request(id, PublishWait::Release, |op| Request::ReleaseReserve {
                op,
                reserve,
            });
            return;
        }
        self.publish_complete(id);
    }

    fn publish_complete(&mut self, id: PublishId) {
        let Some(pc) = self.publishes.get_mut(&id) else {
            return;
        };
        pc.all_done = true;
        let Some(chk_uri) = pc.fi.chk_uri.clone() else {
            return;
        };
        let sks_uri = pc.fi.sks_uri.clone();
        info!(
            publish = id.raw(),
            uri = %chk_uri,
            duration_ms = pc.start_time.elapsed().as_millis() as u64,
            "Publish completed"
        );
        self.publish_sync(id);
        self.publish_emit(id, &[], PublishStatus::Completed { chk_uri, sks_uri });
    }

    /// Re-attach a publish loaded from disk
    pub(crate) fn publish_resume(&mut self, pc: PublishContext) {
        let id = pc.id;
        let all_done = pc.all_done;
        let paths = pc.fi.paths();
        self.publishes.insert(id, pc);
        for path in &paths {
            let Some(node) = self.publishes[&id].fi.node(path) else {
                continue;
            };
            let status = PublishStatus::Resume {
                chk_uri: node.chk_uri.clone(),
                message: node.emsg.clone(),
            };
            self.publish_emit(id, path, status);
        }
        if !all_done {
            self.schedule(Task::PublishMain(id));
        }
    }

    /// Persist and forget the publish
    pub(crate) fn publish_suspend(&mut self, id: PublishId) {
        let Some(pc) = self.publishes.get(&id) else {
            return;
        };
        let release = if pc.all_done { None } else { pc.reserve };
        self.publish_sync(id);
        self.publish_detach(id);
        if let Some(reserve) = release {
            let op = self.new_op(OpOwner::Detached);
            self.send(Request::ReleaseReserve { op, reserve });
        }
        let paths = self.publishes[&id].fi.paths();
        for path in paths.iter().rev() {
            self.publish_emit(id, path, PublishStatus::Suspend);
        }
        self.publishes.remove(&id);
        debug!(publish = id.raw(), "Publish suspended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ksk_query;
    use crate::config::FsConfig;
    use crate::crypto::signing_key_from_seed;
    use crate::metadata::MetaData;
    use crate::reader::DataReader;
    use crate::service::{BlockOptions, MemoryService, Service};
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

    fn publish_events(rx: &mut mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<PublishEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let ProgressEvent::Publish(e) = ev {
                out.push(e);
            }
        }
        out
    }

    fn root_completed(events: &[PublishEvent]) -> Option<(Uri, Option<Uri>)> {
        events.iter().find_map(|e| match &e.status {
            PublishStatus::Completed { chk_uri, sks_uri } if e.is_root() => {
                Some((chk_uri.clone(), sks_uri.clone()))
            }
            _ => None,
        })
    }

    fn first_error(events: &[PublishEvent]) -> Option<String> {
        events.iter().find_map(|e| match &e.status {
            PublishStatus::Error { message } => Some(message.clone()),
            _ => None,
        })
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn expected_uri(content: &[u8]) -> Uri {
        let mut reader = MemoryReader::new(content.to_vec());
        TreeEncoder::encode_all(content.len() as u64, &mut reader, |_| {}).unwrap()
    }

    #[test]
    fn test_reservation_counts_blocks_and_keywords() {
        let size = 2 * DBLOCK_SIZE as u64 + 1;
        let fi = FileInformation::from_data(
            data(size as usize),
            Some(Uri::ksk_from_args(&["a", "b"])),
            None,
            BlockOptions::default(),
        )
        .unwrap();
        let (bytes, entries) = reservation(&fi);
        // three leaves, one interior block, two keywords
        assert_eq!(entries, 3 + 1 + 2);
        assert_eq!(bytes, size + 2 * MAX_UBLOCK_SIZE as u64);
        assert_eq!(tree_block_count(0), 1);
        assert_eq!(tree_block_count(DBLOCK_SIZE as u64 * 257), 257 + 2 + 1);
    }

    #[test]
    fn test_next_position() {
        let mut dir = FileInformation::empty_directory(None, None, BlockOptions::default(), None)
            .unwrap();
        for _ in 0..2 {
            dir.add(
                FileInformation::from_data(b"x".to_vec(), None, None, BlockOptions::default())
                    .unwrap(),
            )
            .unwrap();
        }
        assert_eq!(next_position(&dir, &[0]), Some(vec![1]));
        assert_eq!(next_position(&dir, &[1]), Some(vec![]));
        assert_eq!(next_position(&dir, &[]), None);
    }

    #[test]
    fn test_insert_small_file() {
        let (mut fs, mut rx, _dir) = test_fs();
        let mut service = MemoryService::new();
        let content = data(3 * DBLOCK_SIZE + 17);
        let fi = FileInformation::from_data(
            content.clone(),
            Some(Uri::ksk_from_args(&["music"])),
            None,
            BlockOptions::default(),
        )
        .unwrap();
        let id = fs.publish_start(fi, None, PublishOptions::default()).unwrap();
        pump(&mut fs, &mut service);

        let events = publish_events(&mut rx);
        assert_eq!(events[0].status, PublishStatus::Start);
        let (chk, sks) = root_completed(&events).expect("publish completed");
        assert_eq!(chk, expected_uri(&content));
        assert!(sks.is_none());
        assert!(events
            .iter()
            .any(|e| matches!(e.status, PublishStatus::Progress { depth: 1, .. })));
        assert_eq!(service.count_blocks(BlockType::DBlock), 4);
        assert_eq!(service.count_blocks(BlockType::IBlock), 1);
        assert!(service.contains(&ksk_query("music")));
        assert_eq!(service.active_reservations(), 0);
        assert!(fs.publish(id).unwrap().is_done());
    }

    #[test]
    fn test_index_file_stores_on_demand_blocks() {
        let (mut fs, mut rx, dir) = test_fs();
        let mut service = MemoryService::new();
        let path = dir.path().join("indexed.bin");
        let content = data(2 * DBLOCK_SIZE);
        std::fs::write(&path, &content).unwrap();
        let fi = FileInformation::from_file(&path, None, None, true, BlockOptions::default())
            .unwrap();
        fs.publish_start(fi, None, PublishOptions::default()).unwrap();
        pump(&mut fs, &mut service);

        let (chk, _) = root_completed(&publish_events(&mut rx)).unwrap();
        assert_eq!(chk, expected_uri(&content));
        assert_eq!(service.count_blocks(BlockType::OnDemand), 2);
        assert_eq!(service.count_blocks(BlockType::DBlock), 0);
        assert_eq!(service.count_blocks(BlockType::IBlock), 1);
        assert!(service.is_indexed(&HashCode::digest(&content)));
    }

    #[test]
    fn test_refused_index_falls_back_to_insert() {
        let (mut fs, mut rx, dir) = test_fs();
        let mut service = MemoryService::new();
        service.set_refuse_index(true);
        let path = dir.path().join("plain.bin");
        let content = data(1000);
        std::fs::write(&path, &content).unwrap();
        let fi = FileInformation::from_file(&path, None, None, true, BlockOptions::default())
            .unwrap();
        fs.publish_start(fi, None, PublishOptions::default()).unwrap();
        pump(&mut fs, &mut service);

        let events = publish_events(&mut rx);
        assert!(first_error(&events).is_none());
        assert_eq!(root_completed(&events).unwrap().0, expected_uri(&content));
        assert_eq!(service.count_blocks(BlockType::DBlock), 1);
        assert_eq!(service.count_blocks(BlockType::OnDemand), 0);
    }

    #[test]
    fn test_index_start_timeout_falls_back_to_insert() {
        let (mut fs, mut rx, dir) = test_fs();
        let mut service = MemoryService::new();
        let path = dir.path().join("slow.bin");
        std::fs::write(&path, data(10)).unwrap();
        let fi = FileInformation::from_file(&path, None, None, true, BlockOptions::default())
            .unwrap();
        fs.publish_start(fi, None, PublishOptions::default()).unwrap();

        let (tx, mut replies) = mpsc::unbounded_channel();
        let mut swallowed = false;
        while let Some(req) = fs.poll_request() {
            if matches!(req, Request::IndexStart { .. }) {
                swallowed = true;
                continue;
            }
            service.dispatch(req, &tx);
            while let Ok(resp) = replies.try_recv() {
                fs.handle_response(resp);
            }
        }
        assert!(swallowed);
        let deadline = fs.next_deadline().unwrap();
        fs.tick(deadline);
        pump(&mut fs, &mut service);
        assert!(root_completed(&publish_events(&mut rx)).is_some());
        assert_eq!(service.count_blocks(BlockType::DBlock), 1);
    }

    #[test]
    fn test_simulate_only_touches_nothing() {
        let (mut fs, mut rx, _dir) = test_fs();
        let content = data(DBLOCK_SIZE + 1);
        let fi = FileInformation::from_data(
            content.clone(),
            Some(Uri::ksk_from_args(&["x"])),
            None,
            BlockOptions::default(),
        )
        .unwrap();
        let key = signing_key_from_seed(&HashCode::digest(b"sim"));
        let ns = NamespacePublish {
            key: key.clone(),
            identifier: "root".into(),
            update: None,
        };
        fs.publish_start(
            fi,
            Some(ns),
            PublishOptions {
                simulate_only: true,
            },
        )
        .unwrap();
        assert!(!fs.has_requests());
        let (chk, sks) = root_completed(&publish_events(&mut rx)).unwrap();
        assert_eq!(chk, expected_uri(&content));
        assert_eq!(
            sks,
            Some(Uri::sks(NamespaceId::from_signing_key(&key), "root"))
        );
    }

    #[test]
    fn test_directory_publish() {
        let (mut fs, mut rx, dir) = test_fs();
        let mut service = MemoryService::new();
        let root = dir.path().join("album");
        std::fs::create_dir_all(root.join("disc")).unwrap();
        std::fs::write(root.join("a.txt"), b"first file").unwrap();
        std::fs::write(root.join("disc").join("b.txt"), data(40_000)).unwrap();
        let fi =
            FileInformation::create_from_directory(&root, false, BlockOptions::default()).unwrap();
        fs.publish_start(fi, None, PublishOptions::default()).unwrap();
        pump(&mut fs, &mut service);

        let events = publish_events(&mut rx);
        let starts: Vec<Vec<usize>> = events
            .iter()
            .filter(|e| e.status == PublishStatus::Start)
            .map(|e| e.node.clone())
            .collect();
        assert_eq!(starts, vec![vec![], vec![0], vec![1], vec![1, 0]]);
        let completed: Vec<Vec<usize>> = events
            .iter()
            .filter(|e| matches!(e.status, PublishStatus::Completed { .. }))
            .map(|e| e.node.clone())
            .collect();
        assert_eq!(completed, vec![vec![0], vec![1, 0], vec![1], vec![]]);
        assert!(service.contains(&ksk_query("a.txt")));
        assert!(service.contains(&ksk_query("album/")));
        let (chk, _) = root_completed(&events).unwrap();
        assert!(chk.chk_file_size().unwrap() > 0);
    }

    #[test]
    fn test_put_failure_propagates_to_parents() {
        let (mut fs, mut rx, _dir) = test_fs();
        let mut service = MemoryService::new();
        service.set_fail_puts(true);
        let mut dir = FileInformation::empty_directory(None, None, BlockOptions::default(), None)
            .unwrap();
        let mut meta = MetaData::new();
        meta.insert_str(crate::metadata::MetaType::OriginalFilename, "song.ogg");
        dir.add(
            FileInformation::from_data(data(100), None, Some(meta), BlockOptions::default())
                .unwrap(),
        )
        .unwrap();
        let id = fs.publish_start(dir, None, PublishOptions::default()).unwrap();
        pump(&mut fs, &mut service);

        let errors: Vec<(Vec<usize>, String)> = publish_events(&mut rx)
            .into_iter()
            .filter_map(|e| match e.status {
                PublishStatus::Error { message } => Some((e.node, message)),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].0, vec![0]);
        assert_eq!(errors[0].1, "Publishing failed: datastore is read-only");
        assert_eq!(errors[1].0, Vec::<usize>::new());
        assert_eq!(
            errors[1].1,
            "Recursive upload failed at `song.ogg': Publishing failed: datastore is read-only"
        );
        let pc = fs.publish(id).unwrap();
        assert!(pc.is_done());
        assert!(pc.file_information().error().is_some());
    }

    #[test]
    fn test_reservation_failure_aborts() {
        let (mut fs, mut rx, _dir) = test_fs();
        let mut service = MemoryService::new();
        service.set_quota(Some(10));
        let fi = FileInformation::from_data(data(100), None, None, BlockOptions::default())
            .unwrap();
        fs.publish_start(fi, None, PublishOptions::default()).unwrap();
        pump(&mut fs, &mut service);
        let events = publish_events(&mut rx);
        let err = first_error(&events).unwrap();
        assert!(err.starts_with("Datastore failure: insufficient space"));
        assert_eq!(service.count_blocks(BlockType::DBlock), 0);
        assert!(root_completed(&events).is_none());
    }

    #[test]
    fn test_namespace_and_location() {
        let (mut fs, mut rx, _dir) = test_fs();
        let mut service = MemoryService::new();
        let key = signing_key_from_seed(&HashCode::digest(b"ns"));
        let options = BlockOptions {
            anonymity: 0,
            ..Default::default()
        };
        let fi = FileInformation::from_data(data(500), None, None, options).unwrap();
        let ns = NamespacePublish {
            key: key.clone(),
            identifier: "latest".into(),
            update: Some("next".into()),
        };
        fs.publish_start(fi, Some(ns), PublishOptions::default())
            .unwrap();
        pump(&mut fs, &mut service);

        let (uri, sks) = root_completed(&publish_events(&mut rx)).unwrap();
        assert!(uri.is_loc());
        assert_eq!(uri.loc_chk().unwrap(), expected_uri(&data(500)));
        let ns_id = NamespaceId::from_signing_key(&key);
        assert_eq!(sks, Some(Uri::sks(ns_id, "latest")));
        assert!(service.contains(&crate::block::sks_query(&ns_id, "latest")));
        let updates = fs.list_updateable(&ns_id, None).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].update, "next");
    }

    #[test]
    fn test_stop_releases_reservation() {
        let (mut fs, mut rx, _dir) = test_fs();
        let mut service = MemoryService::new();
        let fi = FileInformation::from_data(data(3 * DBLOCK_SIZE), None, None, BlockOptions::default())
            .unwrap();
        let id = fs.publish_start(fi, None, PublishOptions::default()).unwrap();
        let (tx, mut replies) = mpsc::unbounded_channel();
        // reservation plus the first put
        for _ in 0..2 {
            let req = fs.poll_request().unwrap();
            service.dispatch(req, &tx);
            fs.handle_response(replies.try_recv().unwrap());
        }
        assert_eq!(service.active_reservations(), 1);
        fs.publish_stop(id).unwrap();
        pump(&mut fs, &mut service);
        assert_eq!(service.active_reservations(), 0);
        assert!(fs.publish(id).is_none());
        let events = publish_events(&mut rx);
        assert_eq!(events.last().unwrap().status, PublishStatus::Stopped);
        assert!(publish_stop_is_unknown(&mut fs, id));
    }

    fn publish_stop_is_unknown(fs: &mut Fs, id: PublishId) -> bool {
        matches!(fs.publish_stop(id), Err(FsError::UnknownOperation(_)))
    }

    struct FailingReader;

    impl DataReader for FailingReader {
        fn read(&mut self, _offset: u64, _buf: &mut [u8]) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"))
        }
    }

    #[test]
    fn test_read_error_fails_publish() {
        let (mut fs, mut rx, _dir) = test_fs();
        let mut service = MemoryService::new();
        let fi = FileInformation::from_reader(
            64,
            Box::new(FailingReader),
            None,
            None,
            false,
            BlockOptions::default(),
        )
        .unwrap();
        let id = fs.publish_start(fi, None, PublishOptions::default()).unwrap();
        pump(&mut fs, &mut service);
        let err = first_error(&publish_events(&mut rx)).unwrap();
        assert!(err.contains("disk on fire"));
        assert!(fs.publish(id).unwrap().is_done());
    }
}
