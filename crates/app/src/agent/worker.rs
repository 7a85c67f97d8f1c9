//! Plumbing shared by the two dispatchers: non-blocking enqueue, log
//! rate-limiting, per-queue counters and bounded drain/join.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Sender, TrySendError};
use tracing::{debug, info, warn};

/// Result of a non-blocking submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// Queue full; the new item was discarded.
    Dropped,
    /// An equivalent item was already pending.
    Coalesced,
    /// The worker is gone.
    Closed,
}

/// Counters kept per dispatcher.
#[derive(Debug, Default)]
pub struct DispatchStats {
    queued: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub queued: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub failed: u64,
    /// Dequeued but intentionally not delivered (superseded, or no listener).
    pub skipped: u64,
}

impl DispatchStats {
    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped(&self, count: u64) {
        self.skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "queued={} dropped={} delivered={} failed={} skipped={}",
            self.queued, self.dropped, self.delivered, self.failed, self.skipped
        )
    }
}

/// `try_send` that never blocks; a full queue drops the incoming item.
pub(crate) fn try_enqueue<T>(
    tx: &Sender<T>,
    item: T,
    queue: &'static str,
    stats: &DispatchStats,
) -> SubmitOutcome {
    match tx.try_send(item) {
        Ok(()) => {
            stats.queued.fetch_add(1, Ordering::Relaxed);
            metrics::gauge!("agent_queue_depth", "queue" => queue).set(tx.len() as f64);
            SubmitOutcome::Queued
        }
        Err(TrySendError::Full(_)) => {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("agent_queue_dropped_total", "queue" => queue).increment(1);
            debug!("{queue} queue full ({} pending), dropping item", tx.len());
            SubmitOutcome::Dropped
        }
        Err(TrySendError::Disconnected(_)) => SubmitOutcome::Closed,
    }
}

/// Consecutive-failure counter that goes quiet after `threshold` failures
/// and speaks up again on the first success.
#[derive(Debug)]
pub(crate) struct ErrorTracker {
    label: &'static str,
    threshold: u32,
    consecutive: u32,
}

impl ErrorTracker {
    pub(crate) fn new(label: &'static str, threshold: u32) -> Self {
        Self {
            label,
            threshold,
            consecutive: 0,
        }
    }

    pub(crate) fn record_success(&mut self) {
        if self.consecutive > self.threshold {
            info!(
                "{} recovered after {} consecutive failures",
                self.label, self.consecutive
            );
        }
        self.consecutive = 0;
    }

    /// Returns whether the failure was logged.
    pub(crate) fn record_failure(&mut self, err: &dyn fmt::Display) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        if self.consecutive <= self.threshold {
            warn!("{} failed: {err}", self.label);
            if self.consecutive == self.threshold {
                warn!(
                    "{} failed {} times in a row; suppressing further errors until it recovers",
                    self.label, self.consecutive
                );
            }
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub(crate) fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Poll `pending` until it reaches zero or `timeout` elapses.
pub(crate) fn wait_for_drain(pending: impl Fn() -> usize, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if pending() == 0 {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    /// The thread was left running.
    TimedOut,
    Panicked,
}

/// Handle to a dispatcher thread with its own run flag.
pub(crate) struct Worker {
    name: &'static str,
    running: Arc<AtomicBool>,
    busy: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn<F>(name: &'static str, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(WorkerFlags) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let busy = Arc::new(AtomicBool::new(false));
        let flags = WorkerFlags {
            running: running.clone(),
            busy: busy.clone(),
        };
        let handle = crate::agent::telemetry::spawn_thread(name, move || body(flags))?;
        Ok(Self {
            name,
            running,
            busy,
            handle: Some(handle),
        })
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Clear the run flag and wait up to `timeout` for the thread to exit.
    pub(crate) fn stop(&mut self, timeout: Duration) -> JoinOutcome {
        self.running.store(false, Ordering::SeqCst);
        let Some(handle) = self.handle.take() else {
            return JoinOutcome::Joined;
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(
                    "{} did not stop within {:?}; continuing shutdown without it",
                    self.name, timeout
                );
                return JoinOutcome::TimedOut;
            }
            thread::sleep(Duration::from_millis(5));
        }
        match handle.join() {
            Ok(()) => JoinOutcome::Joined,
            Err(_) => {
                warn!("{} panicked", self.name);
                JoinOutcome::Panicked
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Flags visible to the worker body.
#[derive(Clone)]
pub(crate) struct WorkerFlags {
    running: Arc<AtomicBool>,
    busy: Arc<AtomicBool>,
}

impl WorkerFlags {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Mark the worker busy for the lifetime of the returned guard.
    pub(crate) fn busy(&self) -> BusyGuard<'_> {
        self.busy.store(true, Ordering::SeqCst);
        BusyGuard(&self.busy)
    }
}

pub(crate) struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// What a dispatcher reports when it is shut down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatcherReport {
    pub drained: bool,
    pub join: JoinOutcome,
    pub stats: StatsSnapshot,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn full_queue_drops_incoming_item() {
        let (tx, rx) = crossbeam_channel::bounded(2);
        let stats = DispatchStats::default();

        assert_eq!(try_enqueue(&tx, 1, "test", &stats), SubmitOutcome::Queued);
        assert_eq!(try_enqueue(&tx, 2, "test", &stats), SubmitOutcome::Queued);
        assert_eq!(try_enqueue(&tx, 3, "test", &stats), SubmitOutcome::Dropped);
        assert_eq!(tx.len(), 2);

        let received: Vec<i32> = rx.try_iter().collect();
        assert_eq!(received, vec![1, 2]);
        let snapshot = stats.snapshot();
        assert_eq!((snapshot.queued, snapshot.dropped), (2, 1));
    }

    #[test]
    fn disconnected_queue_reports_closed() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        drop(rx);
        let stats = DispatchStats::default();
        assert_eq!(try_enqueue(&tx, 1, "test", &stats), SubmitOutcome::Closed);
    }

    #[test]
    fn error_tracker_suppresses_after_threshold() {
        let mut tracker = ErrorTracker::new("actuator", 2);
        assert!(tracker.record_failure(&"timeout"));
        assert!(tracker.record_failure(&"timeout"));
        assert!(!tracker.record_failure(&"timeout"));
        assert_eq!(tracker.consecutive(), 3);

        tracker.record_success();
        assert_eq!(tracker.consecutive(), 0);
        assert!(tracker.record_failure(&"timeout"));
    }

    #[test]
    fn drain_wait_times_out() {
        let start = Instant::now();
        assert!(!wait_for_drain(|| 1, Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));

        let remaining = AtomicUsize::new(3);
        assert!(wait_for_drain(
            || remaining.fetch_sub(1, Ordering::SeqCst).saturating_sub(1),
            Duration::from_secs(1)
        ));
    }

    #[test]
    fn stop_gives_up_on_a_stuck_worker() {
        let release = Arc::new(AtomicBool::new(false));
        let gate = release.clone();
        let mut worker = Worker::spawn("stuck-worker", move |_flags| {
            while !gate.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
            }
        })
        .expect("spawn");

        assert_eq!(worker.stop(Duration::from_millis(30)), JoinOutcome::TimedOut);
        release.store(true, Ordering::SeqCst);
    }

    #[test]
    fn stop_joins_a_cooperative_worker() {
        let mut worker = Worker::spawn("cooperative-worker", |flags| {
            while flags.is_running() {
                thread::sleep(Duration::from_millis(1));
            }
        })
        .expect("spawn");

        assert_eq!(worker.stop(Duration::from_secs(1)), JoinOutcome::Joined);
    }
}
