//! Active block requests of one download
//!
//! Maps the query hash of every block the download is waiting for to the
//! request-tree nodes that need it. Several nodes can share a query when a
//! file contains identical blocks, so an arriving block may resolve more than
//! one node at once.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

use crate::crypto::HashCode;

/// Block arrivals slower than this are logged
const SLOW_BLOCK_THRESHOLD: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct PendingQuery {
    nodes: Vec<usize>,
    /// When the query was last sent to the service
    requested_at: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct ActiveRequests {
    pending: HashMap<HashCode, PendingQuery>,
}

impl ActiveRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, query: &HashCode) -> bool {
        self.pending.contains_key(query)
    }

    /// Register `node` as waiting for `query`; returns true for a new query
    pub fn add(&mut self, query: HashCode, node: usize) -> bool {
        match self.pending.get_mut(&query) {
            Some(p) => {
                if !p.nodes.contains(&node) {
                    p.nodes.push(node);
                }
                false
            }
            None => {
                self.pending.insert(
                    query,
                    PendingQuery {
                        nodes: vec![node],
                        requested_at: None,
                    },
                );
                trace!(query = %query.short(), node, "Added active request");
                true
            }
        }
    }

    /// Note that `query` went out to the service
    pub fn mark_sent(&mut self, query: &HashCode, now: Instant) {
        if let Some(p) = self.pending.get_mut(query) {
            p.requested_at = Some(now);
        }
    }

    /// Remove every node waiting for `query`
    ///
    /// Returns the nodes and the time since the request was sent.
    pub fn take(&mut self, query: &HashCode, now: Instant) -> Option<(Vec<usize>, Duration)> {
        let p = self.pending.remove(query)?;
        let elapsed = p
            .requested_at
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default();
        if elapsed > SLOW_BLOCK_THRESHOLD {
            warn!(
                query = %query.short(),
                duration_ms = elapsed.as_millis() as u64,
                "High block retrieval time"
            );
        }
        Some((p.nodes, elapsed))
    }

    /// Drop a single node, keeping the query if others still need it
    pub fn remove_node(&mut self, query: &HashCode, node: usize) {
        if let Some(p) = self.pending.get_mut(query) {
            p.nodes.retain(|n| *n != node);
            if p.nodes.is_empty() {
                self.pending.remove(query);
            }
        }
    }

    pub fn nodes(&self, query: &HashCode) -> Option<&[usize]> {
        self.pending.get(query).map(|p| p.nodes.as_slice())
    }

    pub fn queries(&self) -> impl Iterator<Item = &HashCode> {
        self.pending.keys()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
