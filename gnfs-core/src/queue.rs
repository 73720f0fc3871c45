//! Admission control for network-active jobs
//!
//! Jobs wait in `pending` until `process` admits them into `running`.
//! Admission is bounded by the number of running jobs and by the summed
//! block cost of running jobs. Probes share the download slots but are
//! capped at roughly a quarter of them and are the first to be preempted.
//!
//! Running jobs are also stopped (and put back at the end of `pending`)
//! once they exceed an estimated time budget, so a stalled download yields
//! its slot. The estimate is best-effort fairness, nothing depends on it
//! for correctness.

use std::fmt::Debug;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::config::FsConfig;

/// Wall-clock budget of a running probe
pub const PROBE_BUDGET: Duration = Duration::from_secs(2 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Availability check, preempted first
    Probe,
    Normal,
}

/// Start/stop decision the owner of a job has to carry out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueAction<K> {
    Start(K),
    Stop(K),
}

#[derive(Debug)]
struct QueueEntry<K> {
    key: K,
    blocks: u32,
    priority: Priority,
    queue_time: Instant,
    start_time: Instant,
    run_time: Duration,
    start_times: u32,
}

#[derive(Debug)]
pub struct JobQueue<K> {
    pending: Vec<QueueEntry<K>>,
    running: Vec<QueueEntry<K>>,
    active_downloads: u32,
    active_blocks: u64,
    max_parallel_downloads: u32,
    max_parallel_requests: u32,
    avg_block_latency: Duration,
    track_latency: bool,
}

impl<K: Copy + Eq + Debug> JobQueue<K> {
    pub fn new(config: &FsConfig) -> Self {
        Self::with_limits(
            config.max_parallel_downloads,
            config.max_parallel_requests,
            config.avg_block_latency(),
        )
        .tracking_latency(config.track_block_latency)
    }

    pub fn with_limits(
        max_parallel_downloads: u32,
        max_parallel_requests: u32,
        avg_block_latency: Duration,
    ) -> Self {
        Self {
            pending: Vec::new(),
            running: Vec::new(),
            active_downloads: 0,
            active_blocks: 0,
            max_parallel_downloads,
            max_parallel_requests,
            avg_block_latency,
            track_latency: false,
        }
    }

    fn tracking_latency(mut self, on: bool) -> Self {
        self.track_latency = on;
        self
    }

    /// Add a job; the caller must re-run `process` afterwards
    pub fn enqueue(&mut self, key: K, blocks: u32, priority: Priority, now: Instant) {
        trace!(job = ?key, blocks, ?priority, "Queueing job");
        self.pending.push(QueueEntry {
            key,
            blocks,
            priority,
            queue_time: now,
            start_time: now,
            run_time: Duration::ZERO,
            start_times: 0,
        });
    }

    /// Remove a job; returns `Stop` if it was running
    pub fn dequeue(&mut self, key: K, now: Instant) -> Option<QueueAction<K>> {
        if let Some(pos) = self.running.iter().position(|e| e.key == key) {
            let entry = self.running.remove(pos);
            self.active_downloads -= 1;
            self.active_blocks -= entry.blocks as u64;
            debug!(
                job = ?key,
                ran_ms = now.saturating_duration_since(entry.start_time).as_millis() as u64,
                "Dequeued running job"
            );
            return Some(QueueAction::Stop(key));
        }
        if let Some(pos) = self.pending.iter().position(|e| e.key == key) {
            self.pending.remove(pos);
            trace!(job = ?key, "Dequeued pending job");
        }
        None
    }

    pub fn contains(&self, key: K) -> bool {
        self.is_running(key) || self.pending.iter().any(|e| e.key == key)
    }

    pub fn is_running(&self, key: K) -> bool {
        self.running.iter().any(|e| e.key == key)
    }

    pub fn active_downloads(&self) -> u32 {
        self.active_downloads
    }

    pub fn active_blocks(&self) -> u64 {
        self.active_blocks
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn avg_block_latency(&self) -> Duration {
        self.avg_block_latency
    }

    /// Total time a job has spent running, including the current run
    pub fn run_time(&self, key: K, now: Instant) -> Option<Duration> {
        if let Some(e) = self.running.iter().find(|e| e.key == key) {
            return Some(e.run_time + now.saturating_duration_since(e.start_time));
        }
        self.pending.iter().find(|e| e.key == key).map(|e| e.run_time)
    }

    /// Feed an observed block round-trip into the latency estimate
    pub fn record_block_latency(&mut self, sample: Duration) {
        if !self.track_latency {
            return;
        }
        // EMA with weight 1/8 for the new sample
        let avg = self.avg_block_latency.as_micros() as u64;
        let s = sample.as_micros() as u64;
        let next = (avg.saturating_mul(7).saturating_add(s)) / 8;
        self.avg_block_latency = Duration::from_micros(next.max(1));
    }

    fn deadline(&self, entry: &QueueEntry<K>) -> Instant {
        match entry.priority {
            Priority::Probe => entry.start_time + PROBE_BUDGET,
            Priority::Normal => {
                let factor = entry.blocks.saturating_mul(entry.start_times);
                entry.start_time + self.avg_block_latency.saturating_mul(factor)
            }
        }
    }

    fn start_job(&mut self, pos: usize, now: Instant, actions: &mut Vec<QueueAction<K>>) {
        let mut entry = self.pending.remove(pos);
        entry.start_times += 1;
        entry.start_time = now;
        self.active_blocks += entry.blocks as u64;
        self.active_downloads += 1;
        debug!(
            job = ?entry.key,
            blocks = entry.blocks,
            waited_ms = now.saturating_duration_since(entry.queue_time).as_millis() as u64,
            "Starting job"
        );
        actions.push(QueueAction::Start(entry.key));
        self.running.push(entry);
    }

    fn stop_job(&mut self, pos: usize, now: Instant, actions: &mut Vec<QueueAction<K>>) {
        let mut entry = self.running.remove(pos);
        self.active_downloads -= 1;
        self.active_blocks -= entry.blocks as u64;
        entry.run_time += now.saturating_duration_since(entry.start_time);
        debug!(job = ?entry.key, "Stopping job");
        actions.push(QueueAction::Stop(entry.key));
        self.pending.push(entry);
    }

    /// Re-evaluate start/stop decisions
    ///
    /// Returns the actions to carry out, stops first, and the time at which
    /// `process` should run again (None if nothing is running).
    pub fn process(&mut self, now: Instant) -> (Vec<QueueAction<K>>, Option<Instant>) {
        let mut actions = Vec::new();
        let mut restart_at: Option<Instant> = None;
        let earliest = |t: Instant, r: &mut Option<Instant>| {
            *r = Some(r.map_or(t, |cur| cur.min(t)));
        };

        let probes_waiting = self
            .pending
            .iter()
            .filter(|e| e.priority == Priority::Probe)
            .count() as i64;
        let downloads_waiting = self.pending.len() as i64 - probes_waiting;

        let mut probes_active = 0i64;
        let mut i = 0;
        while i < self.running.len() {
            let end = self.deadline(&self.running[i]);
            if end <= now {
                trace!(job = ?self.running[i].key, "Job exceeded its time budget");
                self.stop_job(i, now, &mut actions);
                continue;
            }
            if self.running[i].priority == Priority::Probe {
                probes_active += 1;
            }
            earliest(end, &mut restart_at);
            i += 1;
        }

        let mpd = self.max_parallel_downloads as i64;
        let active = self.active_downloads as i64;
        let mut probes_change;
        let mut downloads_change;
        if active + downloads_waiting > mpd {
            // preempt probes in favour of waiting downloads
            probes_change = -probes_active.min(downloads_waiting);
            downloads_change = mpd - active - probes_change;
        } else {
            downloads_change = downloads_waiting;
            let probe_cap = 1 + mpd / 4;
            probes_change = if probe_cap >= active + downloads_change {
                probes_waiting.min(probe_cap - (active + downloads_change))
            } else {
                0
            };
        }

        let mut i = 0;
        while probes_change < 0 && i < self.running.len() {
            if self.running[i].priority == Priority::Probe {
                self.stop_job(i, now, &mut actions);
                probes_change += 1;
            } else {
                i += 1;
            }
        }

        // only consider entries that were pending before this round
        let stopped = actions
            .iter()
            .filter(|a| matches!(a, QueueAction::Stop(_)))
            .count();
        let candidates = self.pending.len() - stopped;
        let mut i = 0;
        let mut seen = 0;
        while seen < candidates && (probes_change > 0 || downloads_change > 0) {
            seen += 1;
            let entry = &self.pending[i];
            let mpr = self.max_parallel_requests as u64;
            let blocks = entry.blocks as u64;
            let start = match entry.priority {
                Priority::Probe => {
                    if probes_change > 0 && blocks + self.active_blocks <= mpr {
                        probes_change -= 1;
                        true
                    } else {
                        false
                    }
                }
                Priority::Normal => {
                    let fits = blocks + self.active_blocks <= mpr
                        || (blocks > mpr && self.active_downloads == 0);
                    if downloads_change > 0 && fits {
                        downloads_change -= 1;
                        true
                    } else {
                        false
                    }
                }
            };
            if start {
                self.start_job(i, now, &mut actions);
                if let Some(entry) = self.running.last() {
                    let end = self.deadline(entry);
                    earliest(end, &mut restart_at);
                }
            } else {
                i += 1;
            }
        }

        trace!(
            active_downloads = self.active_downloads,
            active_blocks = self.active_blocks,
            pending = self.pending.len(),
            "Job queue processed"
        );
        (actions, restart_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn queue(mpd: u32, mpr: u32) -> JobQueue<u32> {
        JobQueue::with_limits(mpd, mpr, Duration::from_secs(60))
    }

    fn started(actions: &[QueueAction<u32>]) -> Vec<u32> {
        actions
            .iter()
            .filter_map(|a| match a {
                QueueAction::Start(k) => Some(*k),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_fifo_admission_within_limits() {
        let now = Instant::now();
        let mut q = queue(2, 100);
        for k in 1..=3 {
            q.enqueue(k, 10, Priority::Normal, now);
        }
        let (actions, next) = q.process(now);
        assert_eq!(started(&actions), vec![1, 2]);
        assert_eq!(q.active_downloads(), 2);
        assert_eq!(q.active_blocks(), 20);
        assert_eq!(next, Some(now + Duration::from_secs(600)));

        assert_eq!(q.dequeue(1, now), Some(QueueAction::Stop(1)));
        let (actions, _) = q.process(now);
        assert_eq!(started(&actions), vec![3]);
    }

    #[test]
    fn test_block_limit_and_huge_job_exception() {
        let now = Instant::now();
        let mut q = queue(10, 100);
        q.enqueue(1, 60, Priority::Normal, now);
        q.enqueue(2, 60, Priority::Normal, now);
        let (actions, _) = q.process(now);
        assert_eq!(started(&actions), vec![1]);
        assert!(!q.is_running(2));

        let mut q = queue(10, 100);
        q.enqueue(7, 5000, Priority::Normal, now);
        let (actions, _) = q.process(now);
        assert_eq!(started(&actions), vec![7]);
        q.enqueue(8, 1, Priority::Normal, now);
        let (actions, _) = q.process(now);
        assert!(started(&actions).is_empty());
    }

    #[test]
    fn test_probes_capped_and_preempted() {
        let now = Instant::now();
        let mut q = queue(4, 1000);
        for k in 0..5 {
            q.enqueue(k, 1, Priority::Probe, now);
        }
        let (actions, _) = q.process(now);
        // cap is 1 + 4/4
        assert_eq!(started(&actions), vec![0, 1]);

        for k in 10..14 {
            q.enqueue(k, 1, Priority::Normal, now);
        }
        let (actions, _) = q.process(now);
        let stops: Vec<_> = actions
            .iter()
            .filter(|a| matches!(a, QueueAction::Stop(_)))
            .collect();
        assert_eq!(stops.len(), 2);
        assert_eq!(started(&actions), vec![10, 11, 12, 13]);
        assert_eq!(q.active_downloads(), 4);
    }

    #[test]
    fn test_expired_jobs_are_requeued() {
        let now = Instant::now();
        let mut q = JobQueue::with_limits(1, 100, Duration::from_millis(10));
        q.enqueue(1, 2, Priority::Normal, now);
        q.enqueue(2, 2, Priority::Normal, now);
        let (actions, next) = q.process(now);
        assert_eq!(started(&actions), vec![1]);
        let later = next.unwrap();
        assert_eq!(later, now + Duration::from_millis(20));

        let (actions, _) = q.process(later);
        assert_eq!(actions[0], QueueAction::Stop(1));
        assert_eq!(started(&actions), vec![2]);
        assert_eq!(q.run_time(1, later), Some(Duration::from_millis(20)));
    }

    #[test]
    fn test_dequeue_pending_has_no_stop() {
        let now = Instant::now();
        let mut q = queue(1, 10);
        q.enqueue(1, 1, Priority::Normal, now);
        assert_eq!(q.dequeue(1, now), None);
        assert!(!q.contains(1));
        assert_eq!(q.dequeue(1, now), None);
    }

    #[test]
    fn test_latency_tracking() {
        let mut q: JobQueue<u32> = JobQueue::with_limits(1, 1, Duration::from_millis(800));
        q.record_block_latency(Duration::ZERO);
        assert_eq!(q.avg_block_latency(), Duration::from_millis(800));
        let mut q = q.tracking_latency(true);
        q.record_block_latency(Duration::ZERO);
        assert_eq!(q.avg_block_latency(), Duration::from_millis(700));
    }

    #[test]
    fn test_random_operations_keep_invariants() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let now = Instant::now();
        let (mpd, mpr) = (5u32, 50u32);
        let mut q = queue(mpd, mpr);
        let mut known = Vec::new();
        for step in 0..2000u32 {
            let t = now + Duration::from_secs(step as u64);
            match rng.gen_range(0..3) {
                0 => {
                    if rng.gen_bool(0.3) {
                        q.enqueue(step, 1, Priority::Probe, t);
                    } else {
                        q.enqueue(step, rng.gen_range(1..80), Priority::Normal, t);
                    }
                    known.push(step);
                }
                1 if !known.is_empty() => {
                    let k = known.swap_remove(rng.gen_range(0..known.len()));
                    let was_running = q.is_running(k);
                    let action = q.dequeue(k, t);
                    assert_eq!(action.is_some(), was_running);
                }
                _ => {}
            }
            let _ = q.process(t);
            assert!(q.active_downloads() <= mpd);
            let huge_alone = q.running_len() == 1 && q.active_blocks() > mpr as u64;
            assert!(q.active_blocks() <= mpr as u64 || huge_alone);
            assert_eq!(q.running_len() + q.pending_len(), known.len());
        }
    }
}
