//! Fault taxonomy and per-kind counters.
//!
//! Every non-fatal failure is counted here even when its log line is
//! suppressed, and mirrored to the `agent_faults_total` metric.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Camera open/read/configure failure.
    Camera,
    /// Actuator or channel send failure.
    Transport,
    /// Classifier error or panic.
    Classifier,
    /// Control channel could not connect or dropped mid-session.
    ChannelConnect,
    /// Error escaping the capture loop.
    Unhandled,
}

impl FaultKind {
    pub const ALL: [FaultKind; 5] = [
        FaultKind::Camera,
        FaultKind::Transport,
        FaultKind::Classifier,
        FaultKind::ChannelConnect,
        FaultKind::Unhandled,
    ];

    pub fn label(self) -> &'static str {
        match self {
            FaultKind::Camera => "camera",
            FaultKind::Transport => "transport",
            FaultKind::Classifier => "classifier",
            FaultKind::ChannelConnect => "channel_connect",
            FaultKind::Unhandled => "unhandled",
        }
    }

    fn slot(self) -> usize {
        match self {
            FaultKind::Camera => 0,
            FaultKind::Transport => 1,
            FaultKind::Classifier => 2,
            FaultKind::ChannelConnect => 3,
            FaultKind::Unhandled => 4,
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Default)]
pub struct FaultCounters {
    counts: [AtomicU64; 5],
}

impl FaultCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, kind: FaultKind) {
        self.counts[kind.slot()].fetch_add(1, Ordering::Relaxed);
        metrics::counter!("agent_faults_total", "kind" => kind.label()).increment(1);
    }

    pub fn count(&self, kind: FaultKind) -> u64 {
        self.counts[kind.slot()].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        FaultKind::ALL.iter().map(|&kind| self.count(kind)).sum()
    }
}

impl fmt::Display for FaultCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for kind in FaultKind::ALL {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{}={}", kind.label(), self.count(kind))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_per_kind() {
        let faults = FaultCounters::new();
        faults.record(FaultKind::Transport);
        faults.record(FaultKind::Transport);
        faults.record(FaultKind::Camera);

        assert_eq!(faults.count(FaultKind::Transport), 2);
        assert_eq!(faults.count(FaultKind::Camera), 1);
        assert_eq!(faults.count(FaultKind::Unhandled), 0);
        assert_eq!(faults.total(), 3);
        assert_eq!(
            faults.to_string(),
            "camera=1, transport=2, classifier=0, channel_connect=0, unhandled=0"
        );
    }
}
