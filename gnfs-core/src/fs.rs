//! The file-sharing client context
//!
//! `Fs` owns every publish, download, search and unindex operation together
//! with the job queue. It performs no I/O towards the service: requests
//! accumulate in an outbox drained with [`Fs::poll_request`], replies come
//! back through [`Fs::handle_response`] and timers advance with
//! [`Fs::tick`]. Each of these calls runs the internal task queue to
//! completion before returning, so state machines never re-enter each other.

use ed25519_dalek::SigningKey;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::FsConfig;
use crate::crypto;
use crate::download::DownloadContext;
use crate::error::Result;
use crate::events::{
    DownloadId, ProgressEvent, PublishId, ResultId, SearchId, UBlockPublishId, UnindexId,
};
use crate::namespace::UBlockJob;
use crate::publish::{PublishContext, PublishWait};
use crate::queue::{JobQueue, QueueAction};
use crate::search::SearchContext;
use crate::service::{ClientId, OpId, Request, Response};
use crate::unindex::UnindexContext;

pub(crate) type TimerKey = (Instant, u64);

/// Work deferred until the current call has finished its own step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Task {
    ProcessQueue,
    PublishMain(PublishId),
    DownloadStart(DownloadId),
    StartProbe(ResultId),
    ProbeResult { result: ResultId, success: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Timer {
    Queue,
    IndexStartTimeout(PublishId, OpId),
    ProbeTimeout(ResultId),
    DownloadReconnect(DownloadId),
    SearchReconnect(SearchId),
}

/// Who is waiting for the reply to a one-shot request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpOwner {
    Publish(PublishId, PublishWait),
    UBlock(UBlockPublishId),
    Unindex(UnindexId),
    /// Reply is not needed by anyone
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientOwner {
    Download(DownloadId),
    Search(SearchId),
}

pub struct Fs {
    pub(crate) config: FsConfig,
    events: mpsc::UnboundedSender<ProgressEvent>,
    outbox: VecDeque<Request>,
    pub(crate) queue: JobQueue<DownloadId>,
    queue_timer: Option<TimerKey>,
    tasks: VecDeque<Task>,
    timers: BTreeMap<TimerKey, Timer>,
    timer_seq: u64,
    next_id: u64,
    pub(crate) publishes: HashMap<PublishId, PublishContext>,
    pub(crate) downloads: HashMap<DownloadId, DownloadContext>,
    pub(crate) searches: HashMap<SearchId, SearchContext>,
    pub(crate) unindexes: HashMap<UnindexId, UnindexContext>,
    pub(crate) ublocks: HashMap<UBlockPublishId, UBlockJob>,
    pub(crate) ops: HashMap<OpId, OpOwner>,
    pub(crate) clients: HashMap<ClientId, ClientOwner>,
    peer_key: Option<SigningKey>,
}

impl Fs {
    /// Create the client context and resume persisted operations
    pub fn new(config: FsConfig, events: mpsc::UnboundedSender<ProgressEvent>) -> Result<Self> {
        config.validate()?;
        let mut fs = Fs {
            queue: JobQueue::new(&config),
            config,
            events,
            outbox: VecDeque::new(),
            queue_timer: None,
            tasks: VecDeque::new(),
            timers: BTreeMap::new(),
            timer_seq: 0,
            next_id: 1,
            publishes: HashMap::new(),
            downloads: HashMap::new(),
            searches: HashMap::new(),
            unindexes: HashMap::new(),
            ublocks: HashMap::new(),
            ops: HashMap::new(),
            clients: HashMap::new(),
            peer_key: None,
        };
        if fs.config.persistence {
            info!(dir = %fs.config.client_dir().display(), "Resuming persisted operations");
            fs.resume_all();
            fs.run_tasks();
        }
        Ok(fs)
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    /// Next request for the service, in the order they were issued
    pub fn poll_request(&mut self) -> Option<Request> {
        self.outbox.pop_front()
    }

    pub fn has_requests(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Earliest pending timer
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.keys().next().map(|(at, _)| *at)
    }

    /// Whether any operation is still waiting for the service or a timer
    pub fn is_idle(&self) -> bool {
        self.outbox.is_empty() && self.tasks.is_empty() && self.ops.is_empty()
    }

    pub fn active_downloads(&self) -> u32 {
        self.queue.active_downloads()
    }

    /// Fire every timer due at `now`
    pub fn tick(&mut self, now: Instant) {
        loop {
            let Some((&key, _)) = self.timers.iter().next() else {
                break;
            };
            if key.0 > now {
                break;
            }
            let Some(timer) = self.timers.remove(&key) else {
                break;
            };
            trace!(?timer, "Timer fired");
            self.fire_timer(key, timer, now);
            self.run_tasks();
        }
    }

    /// Feed one reply from the service
    pub fn handle_response(&mut self, response: Response) {
        match response {
            Response::Connected { client } => match self.clients.get(&client).copied() {
                Some(ClientOwner::Download(id)) => self.download_connected(id, client),
                Some(ClientOwner::Search(id)) => self.search_connected(id, client),
                None => trace!(client = client.0, "Connected reply for stale client"),
            },
            Response::ConnectFailed { client, reason } => match self.clients.remove(&client) {
                Some(ClientOwner::Download(id)) => self.download_connect_failed(id, &reason),
                Some(ClientOwner::Search(id)) => self.search_connect_failed(id, &reason),
                None => trace!(client = client.0, "Connect failure for stale client"),
            },
            Response::Disconnected { client } => match self.clients.remove(&client) {
                Some(ClientOwner::Download(id)) => self.download_disconnected(id),
                Some(ClientOwner::Search(id)) => self.search_disconnected(id),
                None => trace!(client = client.0, "Disconnect of stale client"),
            },
            Response::Block {
                client,
                query,
                block_type,
                data,
                ..
            } => match self.clients.get(&client).copied() {
                Some(ClientOwner::Download(id)) => self.download_block(id, query, data),
                Some(ClientOwner::Search(id)) => self.search_block(id, query, block_type, data),
                None => trace!(client = client.0, query = %query.short(), "Block for stale client"),
            },
            Response::Done { op, .. }
            | Response::Reserved { op, .. }
            | Response::Found { op, .. }
            | Response::Hashed { op, .. } => match self.ops.remove(&op) {
                Some(OpOwner::Publish(id, wait)) => self.publish_response(id, op, wait, response),
                Some(OpOwner::UBlock(id)) => self.ublock_response(id, op, response),
                Some(OpOwner::Unindex(id)) => self.unindex_response(id, op, response),
                Some(OpOwner::Detached) => {
                    if let Response::Done { result: Err(e), .. } = &response {
                        debug!(op = op.0, error = %e, "Detached request failed");
                    }
                }
                None => trace!(op = op.0, "Reply for unknown request"),
            },
        }
        self.run_tasks();
    }

    /// Suspend every operation, persisting its state for a later resume
    pub fn suspend_all(&mut self) {
        info!("Suspending all operations");
        let publishes: Vec<PublishId> = self.publishes.keys().copied().collect();
        for id in publishes {
            self.publish_suspend(id);
        }
        let searches: Vec<SearchId> = self
            .searches
            .iter()
            .filter(|(_, s)| s.parent.is_none())
            .map(|(id, _)| *id)
            .collect();
        for id in searches {
            self.search_suspend(id);
        }
        let downloads: Vec<DownloadId> = self
            .downloads
            .iter()
            .filter(|(_, d)| d.parent.is_none() && d.search.is_none() && !d.options.is_probe)
            .map(|(id, _)| *id)
            .collect();
        for id in downloads {
            self.download_suspend(id);
        }
        let unindexes: Vec<UnindexId> = self.unindexes.keys().copied().collect();
        for id in unindexes {
            self.unindex_suspend(id);
        }
        self.run_tasks();
    }

    pub(crate) fn emit(&self, event: ProgressEvent) {
        if self.events.send(event).is_err() {
            trace!("Progress event receiver dropped");
        }
    }

    pub(crate) fn send(&mut self, request: Request) {
        self.outbox.push_back(request);
    }

    pub(crate) fn next_raw_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(crate) fn new_op(&mut self, owner: OpOwner) -> OpId {
        let op = OpId(self.next_raw_id());
        self.ops.insert(op, owner);
        op
    }

    pub(crate) fn new_client(&mut self, owner: ClientOwner) -> ClientId {
        let client = ClientId(self.next_raw_id());
        self.clients.insert(client, owner);
        client
    }

    /// Release a connection and tell the service
    pub(crate) fn drop_client(&mut self, client: ClientId) {
        if self.clients.remove(&client).is_some() {
            self.send(Request::Disconnect { client });
        }
    }

    pub(crate) fn schedule(&mut self, task: Task) {
        if !self.tasks.contains(&task) {
            self.tasks.push_back(task);
        }
    }

    pub(crate) fn add_timer(&mut self, at: Instant, timer: Timer) -> TimerKey {
        self.timer_seq += 1;
        let key = (at, self.timer_seq);
        self.timers.insert(key, timer);
        key
    }

    pub(crate) fn add_timer_in(&mut self, delay: Duration, timer: Timer) -> TimerKey {
        self.add_timer(Instant::now() + delay, timer)
    }

    pub(crate) fn cancel_timer(&mut self, key: Option<TimerKey>) {
        if let Some(key) = key {
            self.timers.remove(&key);
        }
    }

    pub(crate) fn run_tasks(&mut self) {
        while let Some(task) = self.tasks.pop_front() {
            trace!(?task, "Running task");
            match task {
                Task::ProcessQueue => self.process_queue(Instant::now()),
                Task::PublishMain(id) => self.publish_main(id),
                Task::DownloadStart(id) => self.download_start_task(id),
                Task::StartProbe(result) => self.start_probe(result),
                Task::ProbeResult { result, success } => self.probe_result(result, success),
            }
        }
    }

    fn fire_timer(&mut self, key: TimerKey, timer: Timer, now: Instant) {
        match timer {
            Timer::Queue => {
                if self.queue_timer == Some(key) {
                    self.queue_timer = None;
                }
                self.process_queue(now);
            }
            Timer::IndexStartTimeout(id, op) => self.publish_index_timeout(id, op),
            Timer::ProbeTimeout(result) => self.probe_timeout(result, key),
            Timer::DownloadReconnect(id) => self.download_reconnect(id),
            Timer::SearchReconnect(id) => self.search_reconnect(id),
        }
    }

    pub(crate) fn enqueue_job(&mut self, id: DownloadId, blocks: u32, priority: crate::queue::Priority) {
        self.queue.enqueue(id, blocks, priority, Instant::now());
        self.schedule(Task::ProcessQueue);
    }

    /// Remove a job, deactivating it first if it was running
    pub(crate) fn dequeue_job(&mut self, id: DownloadId) {
        if let Some(QueueAction::Stop(id)) = self.queue.dequeue(id, Instant::now()) {
            self.download_deactivate(id);
        }
        self.schedule(Task::ProcessQueue);
    }

    fn process_queue(&mut self, now: Instant) {
        let timer = self.queue_timer.take();
        self.cancel_timer(timer);
        let (actions, next) = self.queue.process(now);
        for action in actions {
            match action {
                QueueAction::Start(id) => self.download_activate(id),
                QueueAction::Stop(id) => self.download_deactivate(id),
            }
        }
        if let Some(at) = next {
            self.queue_timer = Some(self.add_timer(at, Timer::Queue));
        }
    }

    /// Peer identity used to sign location URIs
    pub(crate) fn peer_key(&mut self) -> std::result::Result<SigningKey, crypto::CryptoError> {
        if let Some(key) = &self.peer_key {
            return Ok(key.clone());
        }
        let key = match &self.config.peer_key_file {
            Some(path) => crypto::load_or_create_signing_key(path)?,
            None => {
                warn!("No peer key file configured, using an ephemeral peer identity");
                crypto::generate_signing_key()
            }
        };
        self.peer_key = Some(key.clone());
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_fs() -> (Fs, mpsc::UnboundedReceiver<ProgressEvent>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = FsConfig {
            state_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let (tx, rx) = mpsc::unbounded_channel();
        (Fs::new(config, tx).unwrap(), rx, dir)
    }

    #[test]
    fn test_timers_fire_in_order() {
        let (mut fs, _rx, _dir) = test_fs();
        let now = Instant::now();
        let a = fs.add_timer(now + Duration::from_secs(2), Timer::Queue);
        let b = fs.add_timer(now + Duration::from_secs(1), Timer::Queue);
        assert_eq!(fs.next_deadline(), Some(b.0));
        fs.cancel_timer(Some(b));
        assert_eq!(fs.next_deadline(), Some(a.0));
        fs.tick(now + Duration::from_secs(3));
        assert_eq!(fs.next_deadline(), None);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = FsConfig {
            max_parallel_downloads: 0,
            ..Default::default()
        };
        assert!(Fs::new(config, tx).is_err());
    }

    #[test]
    fn test_stale_replies_are_ignored() {
        let (mut fs, _rx, _dir) = test_fs();
        fs.handle_response(Response::Connected {
            client: ClientId(99),
        });
        fs.handle_response(Response::Done {
            op: OpId(42),
            result: Ok(()),
        });
        assert!(fs.is_idle());
    }

    #[test]
    fn test_peer_key_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join("peer.key");
        let config = FsConfig {
            state_dir: dir.path().to_path_buf(),
            peer_key_file: Some(key_file.clone()),
            ..Default::default()
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut fs = Fs::new(config.clone(), tx.clone()).unwrap();
        let first = fs.peer_key().unwrap();
        let mut again = Fs::new(config, tx).unwrap();
        assert_eq!(again.peer_key().unwrap().to_bytes(), first.to_bytes());
        assert!(key_file.exists());
    }
}
