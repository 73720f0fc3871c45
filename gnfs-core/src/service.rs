//! Contract with the background file-sharing service
//!
//! The client core never performs network or datastore I/O itself. It emits
//! [`Request`]s and consumes [`Response`]s; a [`Service`] implementation
//! carries them out. Connection-scoped traffic (searches and their results)
//! is tagged with a [`ClientId`], one-shot datastore operations with an
//! [`OpId`].
//!
//! [`MemoryService`] is an in-process implementation backed by a map from
//! query hash to stored blocks. It serves indexed files on demand by reading
//! and re-encrypting the referenced block, like the real service does.

use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::block::{BlockType, OnDemandBlock};
use crate::crypto::{self, ContentHashKey, HashCode, PUBLIC_KEY_SIZE};
use crate::reader::{DataReader, FileReader};
use crate::tree::DBLOCK_SIZE;

/// A connection of the client to the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

/// A one-shot request awaiting exactly one reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub u64);

/// Datastore reservation handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReserveId(pub i32);

/// Options stored with every block put into the datastore
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOptions {
    /// Seconds since the UNIX epoch
    pub expiration: u64,
    pub anonymity: u32,
    pub content_priority: u32,
    pub replication: u32,
}

impl Default for BlockOptions {
    fn default() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        BlockOptions {
            // two years
            expiration: now + 2 * 365 * 24 * 3600,
            anonymity: 1,
            content_priority: 365,
            replication: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Connect {
        client: ClientId,
    },
    Disconnect {
        client: ClientId,
    },
    /// Start receiving blocks for `query` on `client`
    StartSearch {
        client: ClientId,
        query: HashCode,
        block_type: BlockType,
        target: Option<[u8; PUBLIC_KEY_SIZE]>,
        anonymity: u32,
        loopback_only: bool,
    },
    Put {
        op: OpId,
        query: HashCode,
        block_type: BlockType,
        data: Bytes,
        options: BlockOptions,
        reserve: Option<ReserveId>,
    },
    /// Remove the block stored under `query` whose payload equals `data`
    Remove {
        op: OpId,
        query: HashCode,
        data: Bytes,
    },
    /// Look up all stored blocks of a type under `query`
    Get {
        op: OpId,
        query: HashCode,
        block_type: BlockType,
    },
    Reserve {
        op: OpId,
        bytes: u64,
        entries: u32,
    },
    ReleaseReserve {
        op: OpId,
        reserve: ReserveId,
    },
    IndexStart {
        op: OpId,
        file_id: HashCode,
        path: PathBuf,
    },
    Unindex {
        op: OpId,
        file_id: HashCode,
    },
    HashFile {
        op: OpId,
        path: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Connected {
        client: ClientId,
    },
    ConnectFailed {
        client: ClientId,
        reason: String,
    },
    Disconnected {
        client: ClientId,
    },
    /// A block matching an active search
    Block {
        client: ClientId,
        query: HashCode,
        block_type: BlockType,
        expiration: u64,
        data: Bytes,
    },
    /// Completion of put, remove, release, index start and unindex
    Done {
        op: OpId,
        result: Result<(), String>,
    },
    Reserved {
        op: OpId,
        result: Result<ReserveId, String>,
    },
    Found {
        op: OpId,
        blocks: Vec<(BlockType, Bytes)>,
    },
    Hashed {
        op: OpId,
        result: Result<HashCode, String>,
    },
}

pub trait Service: Send {
    /// Carry out `request`, sending any replies on `replies`
    fn dispatch(&mut self, request: Request, replies: &mpsc::UnboundedSender<Response>);
}

#[derive(Debug, Clone)]
struct StoredBlock {
    block_type: BlockType,
    data: Bytes,
    options: BlockOptions,
}

#[derive(Debug, Default)]
struct ClientState {
    searches: Vec<(HashCode, BlockType)>,
    delivered: HashSet<(HashCode, HashCode)>,
}

#[derive(Debug, Default)]
struct MemoryStore {
    blocks: HashMap<HashCode, Vec<StoredBlock>>,
    indexed: HashMap<HashCode, PathBuf>,
    clients: HashMap<ClientId, ClientState>,
    reserves: HashMap<i32, (u64, u32)>,
    next_reserve: i32,
    replies: Option<mpsc::UnboundedSender<Response>>,
    refuse_index: bool,
    refuse_connect: bool,
    fail_puts: bool,
    quota: Option<u64>,
    put_count: u64,
}

/// In-process service with a shared datastore
///
/// Clones share the same store, so a test can keep one handle for
/// inspection while the driver owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryService {
    store: Arc<Mutex<MemoryStore>>,
}

impl MemoryService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStore> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of distinct queries with stored blocks
    pub fn len(&self) -> usize {
        self.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, query: &HashCode) -> bool {
        self.lock().blocks.contains_key(query)
    }

    /// Count of stored blocks of the given type
    pub fn count_blocks(&self, block_type: BlockType) -> usize {
        self.lock()
            .blocks
            .values()
            .flatten()
            .filter(|b| b.block_type == block_type)
            .count()
    }

    pub fn put_count(&self) -> u64 {
        self.lock().put_count
    }

    pub fn is_indexed(&self, file_id: &HashCode) -> bool {
        self.lock().indexed.contains_key(file_id)
    }

    pub fn active_reservations(&self) -> usize {
        self.lock().reserves.len()
    }

    /// Reject future index requests
    pub fn set_refuse_index(&self, refuse: bool) {
        self.lock().refuse_index = refuse;
    }

    /// Reject future connection attempts
    pub fn set_refuse_connect(&self, refuse: bool) {
        self.lock().refuse_connect = refuse;
    }

    /// Fail every future put
    pub fn set_fail_puts(&self, fail: bool) {
        self.lock().fail_puts = fail;
    }

    /// Limit the bytes a reservation may claim
    pub fn set_quota(&self, quota: Option<u64>) {
        self.lock().quota = quota;
    }

    /// Drop every connection as if the service restarted
    pub fn disconnect_all(&self) {
        let mut store = self.lock();
        let clients: Vec<ClientId> = store.clients.keys().copied().collect();
        store.clients.clear();
        if let Some(replies) = &store.replies {
            for client in clients {
                info!(client = client.0, "Dropping client connection");
                let _ = replies.send(Response::Disconnected { client });
            }
        }
    }

    /// Overwrite a stored block, for corruption tests
    pub fn corrupt(&self, query: &HashCode) -> bool {
        let mut store = self.lock();
        let Some(blocks) = store.blocks.get_mut(query) else {
            return false;
        };
        for block in blocks.iter_mut() {
            let mut data = block.data.to_vec();
            if let Some(b) = data.first_mut() {
                *b ^= 0xff;
            }
            block.data = Bytes::from(data);
        }
        true
    }
}

impl MemoryStore {
    /// Payload a search on `query` would receive from `block`
    fn materialize(&self, query: &HashCode, block: &StoredBlock) -> Option<(BlockType, Bytes)> {
        if block.block_type != BlockType::OnDemand {
            return Some((block.block_type, block.data.clone()));
        }
        let odb = OnDemandBlock::from_bytes(&block.data).ok()?;
        let Some(path) = self.indexed.get(&odb.file_id) else {
            warn!(file_id = %odb.file_id.short(), "On-demand block for unknown indexed file");
            return None;
        };
        let len = std::fs::metadata(path).ok()?.len();
        if odb.offset >= len && len > 0 {
            return None;
        }
        let size = (len - odb.offset).min(DBLOCK_SIZE as u64) as usize;
        let mut plain = vec![0u8; size];
        let mut reader = FileReader::new(path);
        if let Err(e) = reader.read(odb.offset, &mut plain) {
            warn!(path = %path.display(), error = %e, "Failed to read indexed file");
            return None;
        }
        let (chk, enc) = ContentHashKey::encode_block(&plain);
        if chk.query != *query {
            warn!(path = %path.display(), offset = odb.offset, "Indexed file changed on disk");
            return None;
        }
        Some((BlockType::DBlock, Bytes::from(enc)))
    }

    fn matching(&self, query: &HashCode, wanted: BlockType) -> Vec<(BlockType, Bytes)> {
        let Some(blocks) = self.blocks.get(query) else {
            return Vec::new();
        };
        blocks
            .iter()
            .filter_map(|b| self.materialize(query, b))
            .filter(|(t, _)| wanted == BlockType::Any || *t == wanted)
            .collect()
    }

    fn deliver(&mut self, client: ClientId, query: HashCode, replies: &mpsc::UnboundedSender<Response>) {
        let Some(state) = self.clients.get(&client) else {
            return;
        };
        let wanted: Vec<BlockType> = state
            .searches
            .iter()
            .filter(|(q, _)| *q == query)
            .map(|(_, t)| *t)
            .collect();
        let mut out = Vec::new();
        for block_type in wanted {
            for (t, data) in self.matching(&query, block_type) {
                out.push((t, data));
            }
        }
        let expiration = self
            .blocks
            .get(&query)
            .and_then(|b| b.first())
            .map(|b| b.options.expiration)
            .unwrap_or(0);
        let Some(state) = self.clients.get_mut(&client) else {
            return;
        };
        for (block_type, data) in out {
            if !state.delivered.insert((query, HashCode::digest(&data))) {
                continue;
            }
            trace!(client = client.0, query = %query.short(), "Delivering block");
            let _ = replies.send(Response::Block {
                client,
                query,
                block_type,
                expiration,
                data,
            });
        }
    }
}

impl Service for MemoryService {
    fn dispatch(&mut self, request: Request, replies: &mpsc::UnboundedSender<Response>) {
        let mut store = self.lock();
        store.replies = Some(replies.clone());
        let reply = |r: Response| {
            let _ = replies.send(r);
        };
        match request {
            Request::Connect { client } => {
                if store.refuse_connect {
                    reply(Response::ConnectFailed {
                        client,
                        reason: "service refused connection".into(),
                    });
                    return;
                }
                store.clients.entry(client).or_default();
                debug!(client = client.0, "Client connected");
                reply(Response::Connected { client });
            }
            Request::Disconnect { client } => {
                store.clients.remove(&client);
                debug!(client = client.0, "Client disconnected");
            }
            Request::StartSearch {
                client,
                query,
                block_type,
                ..
            } => {
                let Some(state) = store.clients.get_mut(&client) else {
                    warn!(client = client.0, "Search on unknown connection");
                    return;
                };
                if !state.searches.contains(&(query, block_type)) {
                    state.searches.push((query, block_type));
                }
                store.deliver(client, query, replies);
            }
            Request::Put {
                op,
                query,
                block_type,
                data,
                options,
                ..
            } => {
                if store.fail_puts {
                    reply(Response::Done {
                        op,
                        result: Err("datastore is read-only".into()),
                    });
                    return;
                }
                store.put_count += 1;
                let entry = store.blocks.entry(query).or_default();
                if !entry.iter().any(|b| b.data == data && b.block_type == block_type) {
                    entry.push(StoredBlock {
                        block_type,
                        data,
                        options,
                    });
                }
                trace!(query = %query.short(), ?block_type, "Stored block");
                reply(Response::Done { op, result: Ok(()) });
                let listeners: Vec<ClientId> = store
                    .clients
                    .iter()
                    .filter(|(_, s)| s.searches.iter().any(|(q, _)| *q == query))
                    .map(|(c, _)| *c)
                    .collect();
                for client in listeners {
                    store.deliver(client, query, replies);
                }
            }
            Request::Remove { op, query, data } => {
                let mut removed = false;
                if let Some(blocks) = store.blocks.get_mut(&query) {
                    let before = blocks.len();
                    blocks.retain(|b| b.data != data);
                    removed = blocks.len() != before;
                    if blocks.is_empty() {
                        store.blocks.remove(&query);
                    }
                }
                trace!(query = %query.short(), removed, "Remove");
                reply(Response::Done { op, result: Ok(()) });
            }
            Request::Get {
                op,
                query,
                block_type,
            } => {
                let blocks = store
                    .blocks
                    .get(&query)
                    .map(|bs| {
                        bs.iter()
                            .filter(|b| block_type == BlockType::Any || b.block_type == block_type)
                            .map(|b| (b.block_type, b.data.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                reply(Response::Found { op, blocks });
            }
            Request::Reserve { op, bytes, entries } => {
                if let Some(quota) = store.quota {
                    let used: u64 = store.reserves.values().map(|(b, _)| *b).sum();
                    if used + bytes > quota {
                        reply(Response::Reserved {
                            op,
                            result: Err(format!(
                                "insufficient space ({} bytes requested, {} available)",
                                bytes,
                                quota.saturating_sub(used)
                            )),
                        });
                        return;
                    }
                }
                store.next_reserve += 1;
                let id = store.next_reserve;
                store.reserves.insert(id, (bytes, entries));
                debug!(reserve = id, bytes, entries, "Reserved space");
                reply(Response::Reserved {
                    op,
                    result: Ok(ReserveId(id)),
                });
            }
            Request::ReleaseReserve { op, reserve } => {
                let result = match store.reserves.remove(&reserve.0) {
                    Some(_) => Ok(()),
                    None => Err(format!("no reservation {}", reserve.0)),
                };
                reply(Response::Done { op, result });
            }
            Request::IndexStart { op, file_id, path } => {
                if store.refuse_index {
                    reply(Response::Done {
                        op,
                        result: Err("indexing is disabled".into()),
                    });
                    return;
                }
                let result = match crypto::hash_file(&path) {
                    Ok(hash) if hash == file_id => {
                        info!(path = %path.display(), file_id = %file_id.short(), "Indexed file");
                        store.indexed.insert(file_id, path);
                        Ok(())
                    }
                    Ok(_) => Err(format!("hash mismatch for `{}'", path.display())),
                    Err(e) => Err(e.to_string()),
                };
                reply(Response::Done { op, result });
            }
            Request::Unindex { op, file_id } => {
                store.indexed.remove(&file_id);
                reply(Response::Done { op, result: Ok(()) });
            }
            Request::HashFile { op, path } => {
                let result = crypto::hash_file(&path).map_err(|e| e.to_string());
                reply(Response::Hashed { op, result });
            }
        }
    }
}
