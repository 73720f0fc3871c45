//! Keyword and namespace searches
//!
//! A keyword search sends one query per keyword and merges the answers by
//! result key. A result stays hidden until every mandatory keyword has
//! matched it. A namespace search sends a single query; results carrying an
//! update identifier spawn a child search for the next version.
//!
//! Visible results are probed for availability with small downloads of a
//! random block. Probes run through the job queue at probe priority.

use bytes::Bytes;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::block::{self, BlockType};
use crate::crypto::{HashCode, PUBLIC_KEY_SIZE};
use crate::download::{DownloadOptions, MAX_RECONNECT_DELAY};
use crate::error::{FsError, Result};
use crate::events::{
    DownloadId, DownloadStatus, ProgressEvent, ResultId, SearchEvent, SearchId, SearchStatus,
};
use crate::fs::{ClientOwner, Fs, Task, Timer, TimerKey};
use crate::metadata::MetaData;
use crate::service::{ClientId, Request};
use crate::tree::DBLOCK_SIZE;
use crate::uri::Uri;

/// Probes stop after this many attempts
const MAX_AVAILABILITY_TRIALS: u32 = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchOptions {
    /// Only ask the local peer
    pub loopback_only: bool,
}

impl SearchOptions {
    pub(crate) fn to_bits(self) -> u32 {
        self.loopback_only as u32
    }

    pub(crate) fn from_bits(bits: u32) -> Self {
        SearchOptions {
            loopback_only: bits & 1 != 0,
        }
    }
}

/// One query sent to the service
#[derive(Debug, Clone)]
pub(crate) struct SearchRequest {
    pub query: HashCode,
    /// Key the UBLOCKs are signed with
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    /// Keyword or namespace identifier
    pub label: String,
    pub mandatory: bool,
    /// Keys of the results this query produced
    pub results: HashSet<HashCode>,
}

#[derive(Debug)]
pub struct SearchResult {
    pub(crate) id: ResultId,
    pub(crate) uri: Uri,
    pub(crate) meta: MetaData,
    pub(crate) download: Option<DownloadId>,
    /// Child search for the next version in a namespace
    pub(crate) update_search: Option<SearchId>,
    pub(crate) probe: Option<DownloadId>,
    pub(crate) probe_timer: Option<TimerKey>,
    pub(crate) probe_active_since: Option<Instant>,
    pub(crate) remaining_probe_time: Duration,
    pub(crate) availability_success: u32,
    pub(crate) availability_trials: u32,
    pub(crate) optional_support: u32,
    pub(crate) mandatory_missing: u32,
    /// Which keywords of the query matched this result
    pub(crate) keyword_bitmap: Vec<bool>,
    pub(crate) serialization: Option<String>,
}

impl SearchResult {
    pub(crate) fn new(id: ResultId, uri: Uri, meta: MetaData, keywords: usize) -> Self {
        SearchResult {
            id,
            uri,
            meta,
            download: None,
            update_search: None,
            probe: None,
            probe_timer: None,
            probe_active_since: None,
            remaining_probe_time: Duration::ZERO,
            availability_success: 0,
            availability_trials: 0,
            optional_support: 0,
            mandatory_missing: 0,
            keyword_bitmap: vec![false; keywords],
            serialization: None,
        }
    }

    pub fn id(&self) -> ResultId {
        self.id
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn meta(&self) -> &MetaData {
        &self.meta
    }

    pub fn download(&self) -> Option<DownloadId> {
        self.download
    }

    pub fn update_search(&self) -> Option<SearchId> {
        self.update_search
    }

    pub fn mandatory_missing(&self) -> u32 {
        self.mandatory_missing
    }

    pub fn optional_support(&self) -> u32 {
        self.optional_support
    }

    pub fn availability_success(&self) -> u32 {
        self.availability_success
    }

    pub fn availability_trials(&self) -> u32 {
        self.availability_trials
    }

    /// Successful probes minus failed ones
    pub fn availability_rank(&self) -> i32 {
        2 * self.availability_success as i32 - self.availability_trials as i32
    }

    pub fn is_visible(&self) -> bool {
        self.mandatory_missing == 0
    }
}

pub struct SearchContext {
    pub(crate) id: SearchId,
    pub(crate) query: Uri,
    /// Result whose update identifier started this search
    pub(crate) parent: Option<ResultId>,
    pub(crate) anonymity: u32,
    pub(crate) options: SearchOptions,
    pub(crate) start_time: Instant,
    pub(crate) emsg: Option<String>,
    pub(crate) paused: bool,
    pub(crate) requests: Vec<SearchRequest>,
    pub(crate) mandatory_count: u32,
    pub(crate) results: HashMap<HashCode, SearchResult>,
    pub(crate) client: Option<ClientId>,
    pub(crate) connected: bool,
    reconnect_delay: Duration,
    reconnect_timer: Option<TimerKey>,
    pub(crate) serialization: Option<String>,
}

impl SearchContext {
    pub(crate) fn new(
        id: SearchId,
        query: Uri,
        parent: Option<ResultId>,
        anonymity: u32,
        options: SearchOptions,
        reconnect_delay: Duration,
    ) -> Result<Self> {
        let requests = build_requests(&query)?;
        let mandatory_count = requests.iter().filter(|r| r.mandatory).count() as u32;
        Ok(SearchContext {
            id,
            query,
            parent,
            anonymity,
            options,
            start_time: Instant::now(),
            emsg: None,
            paused: false,
            requests,
            mandatory_count,
            results: HashMap::new(),
            client: None,
            connected: false,
            reconnect_delay,
            reconnect_timer: None,
            serialization: None,
        })
    }

    pub fn id(&self) -> SearchId {
        self.id
    }

    pub fn query(&self) -> &Uri {
        &self.query
    }

    pub fn parent(&self) -> Option<ResultId> {
        self.parent
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn error(&self) -> Option<&str> {
        self.emsg.as_deref()
    }

    /// Results every mandatory keyword has matched
    pub fn results(&self) -> impl Iterator<Item = &SearchResult> {
        self.results.values().filter(|r| r.is_visible())
    }

    /// Results including those still missing mandatory keywords
    pub fn all_results(&self) -> impl Iterator<Item = &SearchResult> {
        self.results.values()
    }
}

fn build_requests(query: &Uri) -> Result<Vec<SearchRequest>> {
    match query {
        Uri::Ksk(keywords) => {
            if keywords.is_empty() {
                return Err(FsError::InvalidArgument("keyword URI without keywords".into()));
            }
            Ok(keywords
                .iter()
                .map(|kw| SearchRequest {
                    query: block::ksk_query(&kw.word),
                    public_key: block::ksk_public_key(&kw.word),
                    label: kw.word.clone(),
                    mandatory: kw.mandatory,
                    results: HashSet::new(),
                })
                .collect())
        }
        Uri::Sks {
            namespace,
            identifier,
        } => Ok(vec![SearchRequest {
            query: block::sks_query(namespace, identifier),
            public_key: namespace.0,
            label: identifier.clone(),
            mandatory: false,
            results: HashSet::new(),
        }]),
        other => Err(FsError::InvalidArgument(format!(
            "cannot search for `{}': not a keyword or namespace URI",
            other
        ))),
    }
}

impl Fs {
    /// Start a keyword or namespace search
    pub fn search_start(
        &mut self,
        query: &Uri,
        anonymity: u32,
        options: SearchOptions,
    ) -> Result<SearchId> {
        let id = self.create_search(query, anonymity, options, None)?;
        self.run_tasks();
        Ok(id)
    }

    pub fn search(&self, id: SearchId) -> Option<&SearchContext> {
        self.searches.get(&id)
    }

    /// Every running search, including update searches
    pub fn searches(&self) -> impl Iterator<Item = &SearchContext> {
        self.searches.values()
    }

    pub fn search_result(&self, result: ResultId) -> Option<&SearchResult> {
        self.searches
            .get(&result.search)
            .and_then(|s| s.results.get(&result.key))
    }

    pub(crate) fn search_result_mut(&mut self, result: ResultId) -> Option<&mut SearchResult> {
        self.searches
            .get_mut(&result.search)
            .and_then(|s| s.results.get_mut(&result.key))
    }

    /// Stop receiving results until [`Fs::search_continue`]
    pub fn search_pause(&mut self, id: SearchId) -> Result<()> {
        if !self.searches.contains_key(&id) {
            return Err(FsError::UnknownOperation(format!("search {}", id.raw())));
        }
        self.search_pause_inner(id);
        self.run_tasks();
        Ok(())
    }

    pub fn search_continue(&mut self, id: SearchId) -> Result<()> {
        if !self.searches.contains_key(&id) {
            return Err(FsError::UnknownOperation(format!("search {}", id.raw())));
        }
        self.search_continue_inner(id);
        self.run_tasks();
        Ok(())
    }

    fn search_pause_inner(&mut self, id: SearchId) {
        let Some(sc) = self.searches.get_mut(&id) else {
            return;
        };
        if sc.paused {
            return;
        }
        sc.paused = true;
        info!(search = id.raw(), "Pausing search");
        self.search_disconnect(id);
        self.search_freeze_probes(id);
        self.search_sync(id);
        self.search_emit(id, SearchStatus::Paused);
    }

    fn search_continue_inner(&mut self, id: SearchId) {
        let Some(sc) = self.searches.get_mut(&id) else {
            return;
        };
        if !sc.paused {
            return;
        }
        sc.paused = false;
        info!(search = id.raw(), "Continuing search");
        self.search_connect(id);
        self.search_resume_probes(id);
        self.search_sync(id);
        self.search_emit(id, SearchStatus::Continued);
    }

    /// Stop a search, its update searches and its probes
    ///
    /// Downloads started from its results keep running on their own.
    pub fn search_stop(&mut self, id: SearchId) -> Result<()> {
        if !self.searches.contains_key(&id) {
            return Err(FsError::UnknownOperation(format!("search {}", id.raw())));
        }
        self.search_stop_inner(id);
        self.run_tasks();
        Ok(())
    }

    /// Probe a result now instead of waiting for the next scheduled probe
    pub fn search_result_start_probe(&mut self, result: ResultId) -> Result<()> {
        if self.search_result(result).is_none() {
            return Err(FsError::UnknownOperation(format!(
                "search result {}",
                result.key.short()
            )));
        }
        self.start_probe(result);
        self.run_tasks();
        Ok(())
    }

    pub(crate) fn create_search(
        &mut self,
        query: &Uri,
        anonymity: u32,
        options: SearchOptions,
        parent: Option<ResultId>,
    ) -> Result<SearchId> {
        let id = SearchId(self.next_raw_id());
        let sc = SearchContext::new(
            id,
            query.clone(),
            parent,
            anonymity,
            options,
            self.config.reconnect_delay(),
        )?;
        info!(search = id.raw(), query = %query, "Starting search");
        self.searches.insert(id, sc);
        self.search_sync(id);
        self.search_emit(id, SearchStatus::Start);
        self.search_connect(id);
        Ok(id)
    }

    pub(crate) fn search_emit(&self, id: SearchId, status: SearchStatus) {
        let Some(sc) = self.searches.get(&id) else {
            return;
        };
        self.emit(ProgressEvent::Search(SearchEvent {
            id,
            query: sc.query.clone(),
            parent: sc.parent,
            duration: sc.start_time.elapsed(),
            anonymity: sc.anonymity,
            status,
        }));
    }

    fn search_emit_update(&self, result: ResultId) {
        let Some(sr) = self.search_result(result) else {
            return;
        };
        let status = SearchStatus::Update {
            result,
            uri: sr.uri.clone(),
            meta: sr.meta.clone(),
            applicability_rank: sr.optional_support,
            availability_rank: sr.availability_rank(),
            availability_certainty: sr.availability_trials,
            current_probe_time: sr
                .probe_active_since
                .map(|t| t.elapsed())
                .unwrap_or_default(),
        };
        self.search_emit(result.search, status);
    }

    pub(crate) fn search_connect(&mut self, id: SearchId) {
        let Some(sc) = self.searches.get(&id) else {
            return;
        };
        if sc.client.is_some() || sc.paused || sc.emsg.is_some() {
            return;
        }
        let client = self.new_client(ClientOwner::Search(id));
        if let Some(sc) = self.searches.get_mut(&id) {
            sc.client = Some(client);
            sc.connected = false;
        }
        debug!(search = id.raw(), client = client.0, "Connecting search");
        self.send(Request::Connect { client });
    }

    fn search_disconnect(&mut self, id: SearchId) {
        let Some(sc) = self.searches.get_mut(&id) else {
            return;
        };
        let timer = sc.reconnect_timer.take();
        let client = sc.client.take();
        sc.connected = false;
        self.cancel_timer(timer);
        if let Some(client) = client {
            self.drop_client(client);
        }
    }

    pub(crate) fn search_connected(&mut self, id: SearchId, client: ClientId) {
        let base_delay = self.config.reconnect_delay();
        let Some(sc) = self.searches.get_mut(&id) else {
            return;
        };
        if sc.client != Some(client) {
            return;
        }
        sc.connected = true;
        sc.reconnect_delay = base_delay;
        let queries: Vec<HashCode> = sc.requests.iter().map(|r| r.query).collect();
        let (anonymity, loopback_only) = (sc.anonymity, sc.options.loopback_only);
        debug!(search = id.raw(), queries = queries.len(), "Search connected");
        for query in queries {
            trace!(search = id.raw(), query = %query.short(), "Sending search request");
            self.send(Request::StartSearch {
                client,
                query,
                block_type: BlockType::UBlock,
                target: None,
                anonymity,
                loopback_only,
            });
        }
    }

    pub(crate) fn search_connect_failed(&mut self, id: SearchId, reason: &str) {
        let Some(sc) = self.searches.get_mut(&id) else {
            return;
        };
        sc.client = None;
        sc.connected = false;
        let message = format!("Failed to connect to the file-sharing service: {}", reason);
        warn!(search = id.raw(), error = %message, "Search failed");
        sc.emsg = Some(message.clone());
        self.search_sync(id);
        self.search_emit(id, SearchStatus::Error { message });
    }

    pub(crate) fn search_disconnected(&mut self, id: SearchId) {
        let Some(sc) = self.searches.get_mut(&id) else {
            return;
        };
        sc.client = None;
        sc.connected = false;
        if sc.paused || sc.emsg.is_some() {
            return;
        }
        let delay = sc.reconnect_delay;
        sc.reconnect_delay = (delay * 2).min(MAX_RECONNECT_DELAY);
        info!(search = id.raw(), delay_ms = delay.as_millis() as u64, "Search lost its connection, reconnecting");
        let key = self.add_timer_in(delay, Timer::SearchReconnect(id));
        if let Some(sc) = self.searches.get_mut(&id) {
            sc.reconnect_timer = Some(key);
        }
    }

    pub(crate) fn search_reconnect(&mut self, id: SearchId) {
        if let Some(sc) = self.searches.get_mut(&id) {
            sc.reconnect_timer = None;
        }
        self.search_connect(id);
    }

    pub(crate) fn search_block(
        &mut self,
        id: SearchId,
        query: HashCode,
        block_type: BlockType,
        data: Bytes,
    ) {
        if block_type != BlockType::UBlock {
            trace!(search = id.raw(), ?block_type, "Ignoring non-UBLOCK reply");
            return;
        }
        let Some(sc) = self.searches.get(&id) else {
            return;
        };
        if sc.paused {
            return;
        }
        let Some(idx) = sc.requests.iter().position(|r| r.query == query) else {
            trace!(search = id.raw(), query = %query.short(), "Reply for unknown query");
            return;
        };
        let req = &sc.requests[idx];
        let content = match block::decrypt_ublock(&data, &req.public_key, &req.label) {
            Ok(content) => content,
            Err(e) => {
                warn!(search = id.raw(), query = %query.short(), error = %e, "Dropping malformed UBLOCK");
                return;
            }
        };
        if content.uri.is_ksk() {
            warn!(search = id.raw(), "Result URI is a keyword URI, ignoring");
            return;
        }
        if sc.query.is_ksk() {
            self.process_ksk_result(id, idx, content.uri, content.meta);
        } else {
            self.process_sks_result(id, content.uri, content.meta, &content.update_id);
        }
    }

    fn process_ksk_result(&mut self, id: SearchId, idx: usize, uri: Uri, meta: MetaData) {
        let key = uri.to_key();
        let result = ResultId { search: id, key };
        let Some(sc) = self.searches.get_mut(&id) else {
            return;
        };
        if !sc.requests[idx].results.insert(key) {
            trace!(search = id.raw(), result = %key.short(), "Duplicate result for keyword");
            return;
        }
        let mandatory = sc.requests[idx].mandatory;
        let keyword_count = sc.requests.len();
        let mandatory_count = sc.mandatory_count;
        let is_new = !sc.results.contains_key(&key);
        let sr = sc.results.entry(key).or_insert_with(|| {
            let mut sr = SearchResult::new(result, uri.clone(), meta.clone(), keyword_count);
            sr.mandatory_missing = mandatory_count;
            sr
        });
        let was_visible = !is_new && sr.is_visible();
        if !is_new {
            sr.meta.merge(&meta);
        }
        if let Some(bit) = sr.keyword_bitmap.get_mut(idx) {
            *bit = true;
        }
        if mandatory {
            sr.mandatory_missing = sr.mandatory_missing.saturating_sub(1);
        } else {
            sr.optional_support += 1;
        }
        let visible = sr.is_visible();
        debug!(
            search = id.raw(),
            result = %key.short(),
            mandatory_missing = sr.mandatory_missing,
            "Keyword matched result"
        );
        self.search_result_sync(result);
        if visible && !was_visible {
            self.notify_new_result(result);
        } else if was_visible {
            self.search_emit_update(result);
        }
    }

    fn process_sks_result(&mut self, id: SearchId, uri: Uri, meta: MetaData, update_id: &str) {
        let key = uri.to_key();
        let result = ResultId { search: id, key };
        let Some(sc) = self.searches.get_mut(&id) else {
            return;
        };
        if sc.results.contains_key(&key) {
            trace!(search = id.raw(), result = %key.short(), "Duplicate namespace result");
            return;
        }
        let (anonymity, options) = (sc.anonymity, sc.options);
        let namespace = match &sc.query {
            Uri::Sks { namespace, .. } => *namespace,
            _ => return,
        };
        sc.results
            .insert(key, SearchResult::new(result, uri, meta, 1));
        self.search_result_sync(result);
        self.notify_new_result(result);

        if !update_id.is_empty() {
            debug!(search = id.raw(), update = update_id, "Following namespace update");
            match self.create_search(&Uri::sks(namespace, update_id), anonymity, options, Some(result)) {
                Ok(child) => {
                    if let Some(sr) = self.search_result_mut(result) {
                        sr.update_search = Some(child);
                    }
                    self.search_result_sync(result);
                }
                Err(e) => warn!(error = %e, "Failed to start update search"),
            }
        }
    }

    fn notify_new_result(&mut self, result: ResultId) {
        let Some(sr) = self.search_result(result) else {
            return;
        };
        info!(search = result.search.raw(), uri = %sr.uri, "New search result");
        let status = SearchStatus::Result {
            result,
            uri: sr.uri.clone(),
            meta: sr.meta.clone(),
            applicability_rank: sr.optional_support,
        };
        self.search_emit(result.search, status);
        self.schedule(Task::StartProbe(result));
    }

    /// Start an availability probe if the result qualifies for one
    pub(crate) fn start_probe(&mut self, result: ResultId) {
        if !self.config.do_probes {
            return;
        }
        let avg_latency = self.queue.avg_block_latency();
        let Some(sc) = self.searches.get(&result.search) else {
            return;
        };
        if sc.paused || sc.emsg.is_some() {
            return;
        }
        let anonymity = sc.anonymity;
        let Some(sr) = sc.results.get(&result.key) else {
            return;
        };
        if sr.probe.is_some()
            || sr.download.is_some()
            || !sr.is_visible()
            || sr.availability_trials > MAX_AVAILABILITY_TRIALS
        {
            return;
        }
        let Some(file_length) = sr.uri.chk_file_size() else {
            return;
        };
        let dblock = DBLOCK_SIZE as u64;
        if file_length == 0 || (file_length <= dblock && sr.availability_success > 0) {
            return;
        }
        let blocks = file_length / dblock;
        let offset = if blocks > 0 {
            rand::thread_rng().gen_range(0..blocks) * dblock
        } else {
            0
        };
        let length = (file_length - offset).min(dblock);
        let remaining = avg_latency.saturating_mul(2 * (1 + sr.availability_trials));
        let (uri, meta) = (sr.uri.clone(), sr.meta.clone());
        let options = DownloadOptions {
            no_temporaries: true,
            is_probe: true,
            ..Default::default()
        };
        trace!(result = %result.key.short(), offset, length, "Starting probe");
        match self.create_download(&uri, Some(meta), None, None, offset, length, anonymity, options, None) {
            Ok(probe) => {
                if let Some(dc) = self.downloads.get_mut(&probe) {
                    dc.probe_of = Some(result);
                }
                if let Some(sr) = self.search_result_mut(result) {
                    sr.probe = Some(probe);
                    sr.remaining_probe_time = remaining;
                }
            }
            Err(e) => debug!(error = %e, "Cannot probe search result"),
        }
    }

    /// Status of a probe download, in place of a download event
    pub(crate) fn probe_progress(&mut self, result: ResultId, status: &DownloadStatus) {
        let Some(sr) = self.search_result_mut(result) else {
            return;
        };
        match status {
            DownloadStatus::Error { .. } => {
                let timer = sr.probe_timer.take();
                self.cancel_timer(timer);
                self.schedule(Task::ProbeResult {
                    result,
                    success: false,
                });
            }
            DownloadStatus::Completed => {
                let timer = sr.probe_timer.take();
                self.cancel_timer(timer);
                self.schedule(Task::ProbeResult {
                    result,
                    success: true,
                });
            }
            DownloadStatus::Active => {
                sr.probe_active_since = Some(Instant::now());
                let remaining = sr.remaining_probe_time;
                let old = sr.probe_timer.take();
                self.cancel_timer(old);
                let key = self.add_timer_in(remaining, Timer::ProbeTimeout(result));
                if let Some(sr) = self.search_result_mut(result) {
                    sr.probe_timer = Some(key);
                }
            }
            DownloadStatus::Inactive => {
                let timer = sr.probe_timer.take();
                if let Some(since) = sr.probe_active_since.take() {
                    sr.remaining_probe_time =
                        sr.remaining_probe_time.saturating_sub(since.elapsed());
                }
                self.cancel_timer(timer);
            }
            _ => {}
        }
    }

    /// Record the outcome of the running probe and try the next one
    pub(crate) fn probe_result(&mut self, result: ResultId, success: bool) {
        let Some(sr) = self.search_result_mut(result) else {
            return;
        };
        let Some(probe) = sr.probe.take() else {
            return;
        };
        let timer = sr.probe_timer.take();
        sr.probe_active_since = None;
        sr.availability_trials += 1;
        if success {
            sr.availability_success += 1;
        }
        debug!(
            result = %result.key.short(),
            success,
            trials = sr.availability_trials,
            "Probe finished"
        );
        self.cancel_timer(timer);
        self.download_stop_inner(probe, false);
        self.search_result_sync(result);
        self.search_emit_update(result);
        self.start_probe(result);
    }

    pub(crate) fn probe_timeout(&mut self, result: ResultId, key: TimerKey) {
        let Some(sr) = self.search_result_mut(result) else {
            return;
        };
        if sr.probe_timer != Some(key) {
            return;
        }
        sr.probe_timer = None;
        debug!(result = %result.key.short(), "Probe timed out");
        self.probe_result(result, false);
    }

    /// Cancel a running probe without counting it
    pub(crate) fn stop_result_probe(&mut self, result: ResultId) {
        let Some(sr) = self.search_result_mut(result) else {
            return;
        };
        let probe = sr.probe.take();
        let timer = sr.probe_timer.take();
        if let Some(since) = sr.probe_active_since.take() {
            sr.remaining_probe_time = sr.remaining_probe_time.saturating_sub(since.elapsed());
        }
        self.cancel_timer(timer);
        if let Some(probe) = probe {
            self.download_stop_inner(probe, false);
        }
    }

    /// A download started from this result went away
    pub(crate) fn search_result_download_stopped(&mut self, result: ResultId) {
        if let Some(sr) = self.search_result_mut(result) {
            sr.download = None;
            self.search_result_sync(result);
        }
    }

    fn search_freeze_probes(&mut self, id: SearchId) {
        let Some(sc) = self.searches.get(&id) else {
            return;
        };
        let keys: Vec<HashCode> = sc.results.keys().copied().collect();
        for key in keys {
            let result = ResultId { search: id, key };
            self.stop_result_probe(result);
            if let Some(child) = self.search_result(result).and_then(|sr| sr.update_search) {
                self.search_pause_inner(child);
            }
        }
    }

    fn search_resume_probes(&mut self, id: SearchId) {
        let Some(sc) = self.searches.get(&id) else {
            return;
        };
        let keys: Vec<HashCode> = sc.results.keys().copied().collect();
        for key in keys {
            let result = ResultId { search: id, key };
            self.schedule(Task::StartProbe(result));
            if let Some(child) = self.search_result(result).and_then(|sr| sr.update_search) {
                self.search_continue_inner(child);
            }
        }
    }

    pub(crate) fn search_stop_inner(&mut self, id: SearchId) {
        let Some(sc) = self.searches.get(&id) else {
            return;
        };
        let keys: Vec<HashCode> = sc.results.keys().copied().collect();
        for key in keys {
            self.search_result_stop(ResultId { search: id, key });
        }
        self.search_disconnect(id);
        self.search_remove_sync(id);
        self.search_emit(id, SearchStatus::Stopped);
        if let Some(sc) = self.searches.remove(&id) {
            if let Some(parent) = sc.parent {
                if let Some(sr) = self.search_result_mut(parent) {
                    sr.update_search = None;
                }
            }
        }
        info!(search = id.raw(), "Search stopped");
    }

    fn search_result_stop(&mut self, result: ResultId) {
        self.stop_result_probe(result);
        let Some(sr) = self.search_result_mut(result) else {
            return;
        };
        let download = sr.download.take();
        let update = sr.update_search.take();
        let visible = sr.is_visible();
        if let Some(download) = download {
            self.download_detach_from_search(download);
            self.download_emit(download, DownloadStatus::LostParent);
        }
        if let Some(update) = update {
            self.search_stop_inner(update);
        }
        if visible {
            self.search_emit(result.search, SearchStatus::ResultStopped { result });
        }
        self.search_result_remove_sync(result);
        if let Some(sc) = self.searches.get_mut(&result.search) {
            sc.results.remove(&result.key);
        }
    }

    /// Persist and forget the search, its results and their downloads
    pub(crate) fn search_suspend(&mut self, id: SearchId) {
        let Some(sc) = self.searches.get(&id) else {
            return;
        };
        let keys: Vec<HashCode> = sc.results.keys().copied().collect();
        self.search_sync(id);
        for key in keys {
            let result = ResultId { search: id, key };
            self.stop_result_probe(result);
            self.search_result_sync(result);
            let Some(sr) = self.search_result(result) else {
                continue;
            };
            let (download, update) = (sr.download, sr.update_search);
            if let Some(download) = download {
                self.download_suspend(download);
            }
            if let Some(update) = update {
                self.search_suspend(update);
            }
            self.search_emit(id, SearchStatus::ResultSuspend { result });
        }
        self.search_disconnect(id);
        self.search_emit(id, SearchStatus::Suspend);
        self.searches.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FsConfig;
    use crate::crypto::{signing_key_from_seed, ContentHashKey};
    use crate::metadata::MetaType;
    use crate::service::Response;
    use crate::uri::NamespaceId;
    use tokio::sync::mpsc;

    fn test_fs(do_probes: bool) -> (Fs, mpsc::UnboundedReceiver<ProgressEvent>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = FsConfig {
            state_dir: dir.path().to_path_buf(),
            persistence: false,
            do_probes,
            ..Default::default()
        };
        let (tx, rx) = mpsc::unbounded_channel();
        (Fs::new(config, tx).unwrap(), rx, dir)
    }

    fn content(tag: &[u8], len: u64) -> Uri {
        let (chk, _) = ContentHashKey::encode_block(tag);
        Uri::chk(chk, len)
    }

    fn ksk_block(word: &str, uri: &Uri) -> (HashCode, Bytes) {
        let mut meta = MetaData::new();
        meta.insert_str(MetaType::OriginalFilename, "file.txt");
        let key = block::ksk_signing_key(word);
        let (query, data) = block::create_ublock(&key, word, None, uri, &meta).unwrap();
        (query, Bytes::from(data))
    }

    /// Connect the search and return its client
    fn connect(fs: &mut Fs) -> ClientId {
        let mut client = None;
        while let Some(req) = fs.poll_request() {
            if let Request::Connect { client: c } = req {
                client = Some(c);
            }
        }
        let client = client.unwrap();
        fs.handle_response(Response::Connected { client });
        client
    }

    fn deliver(fs: &mut Fs, client: ClientId, query: HashCode, data: Bytes) {
        fs.handle_response(Response::Block {
            client,
            query,
            block_type: BlockType::UBlock,
            expiration: 0,
            data,
        });
    }

    fn results(rx: &mut mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ResultId> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let ProgressEvent::Search(SearchEvent {
                status: SearchStatus::Result { result, .. },
                ..
            }) = ev
            {
                out.push(result);
            }
        }
        out
    }

    #[test]
    fn test_mandatory_keywords_gate_results() {
        let (mut fs, mut rx, _dir) = test_fs(false);
        let query = Uri::ksk_from_args(&["+alpha", "+beta", "gamma"]);
        let id = fs.search_start(&query, 1, SearchOptions::default()).unwrap();
        let client = connect(&mut fs);
        let searches: Vec<Request> = std::iter::from_fn(|| fs.poll_request()).collect();
        assert_eq!(searches.len(), 3);

        let uri = content(b"doc", 10);
        let (q, data) = ksk_block("alpha", &uri);
        deliver(&mut fs, client, q, data);
        assert!(results(&mut rx).is_empty());
        let sc = fs.search(id).unwrap();
        assert_eq!(sc.results().count(), 0);
        assert_eq!(sc.all_results().next().unwrap().mandatory_missing(), 1);

        let (q, data) = ksk_block("gamma", &uri);
        deliver(&mut fs, client, q, data);
        assert!(results(&mut rx).is_empty());

        let (q, data) = ksk_block("beta", &uri);
        deliver(&mut fs, client, q, data.clone());
        let found = results(&mut rx);
        assert_eq!(found.len(), 1);
        let sr = fs.search_result(found[0]).unwrap();
        assert_eq!(sr.mandatory_missing(), 0);
        assert_eq!(sr.optional_support(), 1);
        assert_eq!(sr.uri(), &uri);

        // the same block again changes nothing
        deliver(&mut fs, client, q, data);
        assert_eq!(fs.search_result(found[0]).unwrap().optional_support(), 1);
    }

    #[test]
    fn test_optional_only_query_shows_first_match() {
        let (mut fs, mut rx, _dir) = test_fs(false);
        let query = Uri::ksk_from_args(&["one", "two"]);
        fs.search_start(&query, 1, SearchOptions::default()).unwrap();
        let client = connect(&mut fs);
        let (q, data) = ksk_block("two", &content(b"x", 5));
        deliver(&mut fs, client, q, data);
        assert_eq!(results(&mut rx).len(), 1);
    }

    #[test]
    fn test_namespace_update_spawns_child_search() {
        let (mut fs, mut rx, _dir) = test_fs(false);
        let ns_key = signing_key_from_seed(&HashCode::digest(b"ns"));
        let ns = NamespaceId::from_signing_key(&ns_key);
        let id = fs
            .search_start(&Uri::sks(ns, "v1"), 1, SearchOptions::default())
            .unwrap();
        let client = connect(&mut fs);
        let (q, data) = block::create_ublock(
            &ns_key,
            "v1",
            Some("v2"),
            &content(b"first", 3),
            &MetaData::new(),
        )
        .unwrap();
        deliver(&mut fs, client, q, Bytes::from(data));
        let found = results(&mut rx);
        assert_eq!(found.len(), 1);
        let child = fs.search_result(found[0]).unwrap().update_search().unwrap();
        assert_eq!(fs.search(child).unwrap().query(), &Uri::sks(ns, "v2"));
        assert_eq!(fs.search(child).unwrap().parent(), Some(found[0]));

        fs.search_stop(id).unwrap();
        assert!(fs.search(child).is_none());
        assert!(fs.search(id).is_none());
    }

    #[test]
    fn test_rejects_content_uri() {
        let (mut fs, _rx, _dir) = test_fs(false);
        assert!(fs
            .search_start(&content(b"c", 1), 1, SearchOptions::default())
            .is_err());
    }

    #[test]
    fn test_probe_failure_counts_trial() {
        let (mut fs, mut rx, _dir) = test_fs(true);
        let query = Uri::ksk_from_args(&["probe"]);
        fs.search_start(&query, 1, SearchOptions::default()).unwrap();
        let client = connect(&mut fs);
        let (q, data) = ksk_block("probe", &content(b"missing", 100));
        deliver(&mut fs, client, q, data);
        let result = results(&mut rx)[0];
        let probe = fs.search_result(result).unwrap().probe.unwrap();
        assert!(fs.download(probe).is_some());

        fs.probe_result(result, false);
        let sr = fs.search_result(result).unwrap();
        assert_eq!(sr.availability_trials(), 1);
        assert_eq!(sr.availability_rank(), -1);
        assert!(fs.download(probe).is_none());
        // a fresh probe was started
        assert!(sr.probe.is_some());
    }

    #[test]
    fn test_pause_disconnects_and_continue_reconnects() {
        let (mut fs, _rx, _dir) = test_fs(false);
        let id = fs
            .search_start(&Uri::ksk_from_args(&["p"]), 1, SearchOptions::default())
            .unwrap();
        connect(&mut fs);
        while fs.poll_request().is_some() {}
        fs.search_pause(id).unwrap();
        assert!(fs.search(id).unwrap().is_paused());
        assert!(matches!(fs.poll_request(), Some(Request::Disconnect { .. })));
        fs.search_continue(id).unwrap();
        assert!(matches!(fs.poll_request(), Some(Request::Connect { .. })));
    }
}
