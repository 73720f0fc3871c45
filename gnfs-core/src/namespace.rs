//! Keyword and namespace block publication, namespace update records
//!
//! A UBLOCK job puts one or more signed UBLOCKs into the datastore, one
//! after the other. Jobs are started directly by the application
//! ([`Fs::publish_ksk`], [`Fs::publish_sks`]) or by a publish operation once
//! a file has its final URI.
//!
//! Every namespace entry published from this client is also recorded
//! locally, so the application can later offer to publish updates for it.

use bytes::Bytes;
use ed25519_dalek::SigningKey;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use tracing::{debug, info, trace, warn};

use crate::bio::{ReadHandle, WriteHandle};
use crate::block::{self, BlockType, MAX_UBLOCK_SIZE};
use crate::crypto::HashCode;
use crate::error::{FsError, Result};
use crate::events::{ProgressEvent, PublishId, UBlockEvent, UBlockPublishId};
use crate::fs::{Fs, OpOwner};
use crate::metadata::MetaData;
use crate::service::{BlockOptions, OpId, Request, Response};
use crate::uri::{NamespaceId, Uri};

/// One node of the update graph of a namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateInformation {
    /// Identifier the entry was published under
    pub id: String,
    /// Identifier reserved for the next version, empty if none
    pub update: String,
    pub uri: Uri,
    pub meta: MetaData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UBlockOwner {
    Application,
    Publish(PublishId),
}

pub struct UBlockJob {
    pub(crate) owner: UBlockOwner,
    /// URI under which the target becomes findable
    pub(crate) uri: Uri,
    blocks: VecDeque<(HashCode, Bytes)>,
    options: BlockOptions,
    pending: Option<OpId>,
    /// Namespace entry to record once everything is stored
    record: Option<(NamespaceId, UpdateInformation)>,
}

impl UBlockJob {
    /// Blocks for every keyword of `ksk`
    fn keywords(
        owner: UBlockOwner,
        ksk: &Uri,
        meta: &MetaData,
        target: &Uri,
        options: BlockOptions,
    ) -> Result<Self> {
        if !ksk.is_ksk() || ksk.keywords().is_empty() {
            return Err(FsError::InvalidArgument(format!(
                "`{}' is not a keyword URI with keywords",
                ksk
            )));
        }
        let mut blocks = VecDeque::new();
        for kw in ksk.keywords() {
            let key = block::ksk_signing_key(&kw.word);
            let (query, data) = block::create_ublock(&key, &kw.word, None, target, meta)?;
            trace!(keyword = %kw.word, query = %query.short(), "Prepared keyword block");
            blocks.push_back((query, Bytes::from(data)));
        }
        Ok(UBlockJob {
            owner,
            uri: ksk.clone(),
            blocks,
            options,
            pending: None,
            record: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn namespace(
        owner: UBlockOwner,
        ns_key: &SigningKey,
        identifier: &str,
        update: Option<&str>,
        meta: &MetaData,
        target: &Uri,
        options: BlockOptions,
    ) -> Result<Self> {
        let ns = NamespaceId::from_signing_key(ns_key);
        let (query, data) = block::create_ublock(ns_key, identifier, update, target, meta)?;
        debug!(namespace = %ns.to_enc(), identifier, query = %query.short(), "Prepared namespace block");
        let info = UpdateInformation {
            id: identifier.to_string(),
            update: update.unwrap_or("").to_string(),
            uri: target.clone(),
            meta: meta.clone(),
        };
        Ok(UBlockJob {
            owner,
            uri: Uri::sks(ns, identifier),
            blocks: VecDeque::from([(query, Bytes::from(data))]),
            options,
            pending: None,
            record: Some((ns, info)),
        })
    }
}

impl Fs {
    /// Make `target` findable under every keyword of `ksk`
    pub fn publish_ksk(
        &mut self,
        ksk: &Uri,
        meta: &MetaData,
        target: &Uri,
        options: BlockOptions,
    ) -> Result<UBlockPublishId> {
        let job = UBlockJob::keywords(UBlockOwner::Application, ksk, meta, target, options)?;
        let id = self.start_ublock_job(job);
        self.run_tasks();
        Ok(id)
    }

    /// Publish `target` in the namespace of `ns_key` under `identifier`
    pub fn publish_sks(
        &mut self,
        ns_key: &SigningKey,
        identifier: &str,
        update: Option<&str>,
        meta: &MetaData,
        target: &Uri,
        options: BlockOptions,
    ) -> Result<UBlockPublishId> {
        let job = UBlockJob::namespace(
            UBlockOwner::Application,
            ns_key,
            identifier,
            update,
            meta,
            target,
            options,
        )?;
        let id = self.start_ublock_job(job);
        self.run_tasks();
        Ok(id)
    }

    /// Abandon a block publication; blocks already stored stay stored
    pub fn ublock_cancel(&mut self, id: UBlockPublishId) -> Result<()> {
        let job = self
            .ublocks
            .remove(&id)
            .ok_or_else(|| FsError::UnknownOperation(format!("block publication {}", id.raw())))?;
        if let Some(op) = job.pending {
            self.ops.remove(&op);
        }
        debug!(ublock = id.raw(), "Cancelled block publication");
        Ok(())
    }

    pub(crate) fn start_publish_ksk(
        &mut self,
        owner: PublishId,
        ksk: &Uri,
        meta: &MetaData,
        target: &Uri,
        options: BlockOptions,
    ) -> Result<UBlockPublishId> {
        let job = UBlockJob::keywords(UBlockOwner::Publish(owner), ksk, meta, target, options)?;
        Ok(self.start_ublock_job(job))
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start_publish_sks(
        &mut self,
        owner: PublishId,
        ns_key: &SigningKey,
        identifier: &str,
        update: Option<&str>,
        meta: &MetaData,
        target: &Uri,
        options: BlockOptions,
    ) -> Result<UBlockPublishId> {
        let job = UBlockJob::namespace(
            UBlockOwner::Publish(owner),
            ns_key,
            identifier,
            update,
            meta,
            target,
            options,
        )?;
        Ok(self.start_ublock_job(job))
    }

    fn start_ublock_job(&mut self, job: UBlockJob) -> UBlockPublishId {
        let id = UBlockPublishId(self.next_raw_id());
        info!(ublock = id.raw(), uri = %job.uri, blocks = job.blocks.len(), "Publishing blocks");
        self.ublocks.insert(id, job);
        self.ublock_next(id);
        id
    }

    fn ublock_next(&mut self, id: UBlockPublishId) {
        let Some(job) = self.ublocks.get_mut(&id) else {
            return;
        };
        let Some((query, data)) = job.blocks.pop_front() else {
            self.ublock_finish(id, Ok(()));
            return;
        };
        let options = job.options;
        let op = self.new_op(OpOwner::UBlock(id));
        if let Some(job) = self.ublocks.get_mut(&id) {
            job.pending = Some(op);
        }
        self.send(Request::Put {
            op,
            query,
            block_type: BlockType::UBlock,
            data,
            options,
            reserve: None,
        });
    }

    pub(crate) fn ublock_response(&mut self, id: UBlockPublishId, op: OpId, response: Response) {
        let Some(job) = self.ublocks.get_mut(&id) else {
            return;
        };
        if job.pending != Some(op) {
            return;
        }
        job.pending = None;
        match response {
            Response::Done { result: Ok(()), .. } => self.ublock_next(id),
            Response::Done { result: Err(e), .. } => self.ublock_finish(id, Err(e)),
            other => {
                warn!(ublock = id.raw(), reply = ?other, "Unexpected reply to block put");
                self.ublock_finish(id, Err("unexpected reply from the datastore".into()));
            }
        }
    }

    fn ublock_finish(&mut self, id: UBlockPublishId, result: std::result::Result<(), String>) {
        let Some(job) = self.ublocks.remove(&id) else {
            return;
        };
        match &result {
            Ok(()) => {
                debug!(ublock = id.raw(), uri = %job.uri, "Blocks published");
                if let Some((ns, info)) = job.record {
                    if let Err(e) = self.record_update(&ns, info) {
                        warn!(namespace = %ns.to_enc(), error = %e, "Failed to record namespace update");
                    }
                }
            }
            Err(e) => warn!(ublock = id.raw(), error = %e, "Block publication failed"),
        }
        match job.owner {
            UBlockOwner::Application => self.emit(ProgressEvent::UBlock(UBlockEvent {
                id,
                uri: job.uri,
                result,
            })),
            UBlockOwner::Publish(owner) => self.publish_ublock_done(owner, id, job.uri, result),
        }
    }

    fn updates_file(&self, ns: &NamespaceId) -> PathBuf {
        self.config
            .client_dir()
            .join("updates")
            .join(ns.to_enc())
    }

    /// Everything recorded for a namespace, oldest first
    pub fn namespace_updates(&self, ns: &NamespaceId) -> Result<Vec<UpdateInformation>> {
        let path = self.updates_file(ns);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut rh = ReadHandle::open(&path)?;
        let count = rh.read_u32("update count")?;
        let mut out = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let id = rh.read_string("update id", MAX_UBLOCK_SIZE)?.unwrap_or_default();
            let update = rh
                .read_string("update next id", MAX_UBLOCK_SIZE)?
                .unwrap_or_default();
            let meta = rh.read_meta("update metadata")?.unwrap_or_default();
            let uri = rh.read_uri("update uri")?.ok_or(crate::bio::BioError::Invalid {
                what: "update uri",
                reason: "missing".into(),
            })?;
            out.push(UpdateInformation {
                id,
                update,
                uri,
                meta,
            });
        }
        Ok(out)
    }

    fn record_update(&mut self, ns: &NamespaceId, info: UpdateInformation) -> Result<()> {
        let mut all = match self.namespace_updates(ns) {
            Ok(all) => all,
            Err(e) => {
                warn!(namespace = %ns.to_enc(), error = %e, "Discarding unreadable update records");
                Vec::new()
            }
        };
        all.retain(|u| !(u.id == info.id && u.uri == info.uri));
        all.push(info);
        let mut wh = WriteHandle::create(self.updates_file(ns));
        wh.write_u32(all.len() as u32);
        for u in &all {
            wh.write_string(Some(&u.id))
                .write_string(Some(&u.update))
                .write_meta(Some(&u.meta))
                .write_uri(Some(&u.uri));
        }
        wh.close()?;
        Ok(())
    }

    /// Entries of the namespace update graph
    ///
    /// Without `next_id` this returns one root per connected part of the
    /// graph: entries nobody points to, then one entry per remaining cycle.
    /// With `next_id` it returns the entries published under that
    /// identifier, i.e. the successors of whoever reserved it.
    pub fn list_updateable(
        &self,
        ns: &NamespaceId,
        next_id: Option<&str>,
    ) -> Result<Vec<UpdateInformation>> {
        let all = self.namespace_updates(ns)?;
        if let Some(next) = next_id {
            return Ok(all.into_iter().filter(|u| u.id == next).collect());
        }
        let mut by_id: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, u) in all.iter().enumerate() {
            by_id.entry(u.id.as_str()).or_default().push(i);
        }
        let referenced: HashSet<&str> = all
            .iter()
            .filter(|u| !u.update.is_empty())
            .map(|u| u.update.as_str())
            .collect();

        let mut reached = vec![false; all.len()];
        let mut roots = Vec::new();
        let visit = |start: usize, reached: &mut Vec<bool>| {
            let mut stack = vec![start];
            while let Some(i) = stack.pop() {
                if std::mem::replace(&mut reached[i], true) {
                    continue;
                }
                if let Some(next) = by_id.get(all[i].update.as_str()) {
                    stack.extend(next.iter().copied());
                }
            }
        };
        for (i, u) in all.iter().enumerate() {
            if !referenced.contains(u.id.as_str()) && !reached[i] {
                roots.push(i);
                visit(i, &mut reached);
            }
        }
        for i in 0..all.len() {
            if !reached[i] {
                roots.push(i);
                visit(i, &mut reached);
            }
        }
        Ok(roots.into_iter().map(|i| all[i].clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FsConfig;
    use crate::crypto::{signing_key_from_seed, ContentHashKey};
    use crate::service::{MemoryService, Service};
    use tokio::sync::mpsc;

    fn test_fs() -> (Fs, mpsc::UnboundedReceiver<ProgressEvent>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = FsConfig {
            state_dir: dir.path().to_path_buf(),
            persistence: false,
            ..Default::default()
        };
        let (tx, rx) = mpsc::unbounded_channel();
        (Fs::new(config, tx).unwrap(), rx, dir)
    }

    /// Run requests against `service` until both sides are quiet
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

    fn target(tag: &[u8]) -> Uri {
        let (chk, _) = ContentHashKey::encode_block(tag);
        Uri::chk(chk, tag.len() as u64)
    }

    #[test]
    fn test_publish_ksk_stores_one_block_per_keyword() {
        let (mut fs, mut rx, _dir) = test_fs();
        let mut service = MemoryService::new();
        let ksk = Uri::ksk_from_args(&["+red", "blue"]);
        let id = fs
            .publish_ksk(&ksk, &MetaData::new(), &target(b"x"), BlockOptions::default())
            .unwrap();
        pump(&mut fs, &mut service);
        assert_eq!(service.count_blocks(BlockType::UBlock), 2);
        assert!(service.contains(&block::ksk_query("red")));
        let ev = rx.try_recv().unwrap();
        match ev {
            ProgressEvent::UBlock(e) => {
                assert_eq!(e.id, id);
                assert_eq!(e.uri, ksk);
                assert!(e.result.is_ok());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_failed_put_is_reported() {
        let (mut fs, mut rx, _dir) = test_fs();
        let mut service = MemoryService::new();
        service.set_fail_puts(true);
        fs.publish_ksk(
            &Uri::ksk_from_args(&["a"]),
            &MetaData::new(),
            &target(b"y"),
            BlockOptions::default(),
        )
        .unwrap();
        pump(&mut fs, &mut service);
        assert!(rx.try_recv().unwrap().error().is_some());
    }

    #[test]
    fn test_update_graph() {
        let (mut fs, _rx, _dir) = test_fs();
        let mut service = MemoryService::new();
        let key = signing_key_from_seed(&HashCode::digest(b"updates"));
        let ns = NamespaceId::from_signing_key(&key);
        let opts = BlockOptions::default();
        let meta = MetaData::new();
        fs.publish_sks(&key, "v1", Some("v2"), &meta, &target(b"1"), opts)
            .unwrap();
        fs.publish_sks(&key, "v2", Some("v3"), &meta, &target(b"2"), opts)
            .unwrap();
        fs.publish_sks(&key, "other", None, &meta, &target(b"3"), opts)
            .unwrap();
        pump(&mut fs, &mut service);

        let roots: Vec<String> = fs
            .list_updateable(&ns, None)
            .unwrap()
            .into_iter()
            .map(|u| u.id)
            .collect();
        assert_eq!(roots, vec!["v1", "other"]);
        let next = fs.list_updateable(&ns, Some("v2")).unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].update, "v3");
        assert_eq!(next[0].uri, target(b"2"));
        assert!(fs.list_updateable(&ns, Some("v3")).unwrap().is_empty());
    }

    #[test]
    fn test_update_cycle_still_has_root() {
        let (mut fs, _rx, _dir) = test_fs();
        let mut service = MemoryService::new();
        let key = signing_key_from_seed(&HashCode::digest(b"cycle"));
        let ns = NamespaceId::from_signing_key(&key);
        let opts = BlockOptions::default();
        fs.publish_sks(&key, "a", Some("b"), &MetaData::new(), &target(b"a"), opts)
            .unwrap();
        fs.publish_sks(&key, "b", Some("a"), &MetaData::new(), &target(b"b"), opts)
            .unwrap();
        pump(&mut fs, &mut service);
        let roots = fs.list_updateable(&ns, None).unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].id, "a");
    }

    #[test]
    fn test_rejects_non_keyword_uri() {
        let (mut fs, _rx, _dir) = test_fs();
        assert!(fs
            .publish_ksk(&target(b"z"), &MetaData::new(), &target(b"z"), BlockOptions::default())
            .is_err());
    }
}
