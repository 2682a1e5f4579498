//! Scheduling events and their coalescing.
//!
//! Events only mark the scheduler dirty; any number of them raised before
//! the driver wakes up are served by a single round.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::Notify;

/// Why a round is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The workload set changed: start, exit, new requests.
    Opts,
    /// The platform changed: faults, degradation, forced releases.
    Plat,
    /// Operator request: dump status and reschedule.
    Usr1,
}

impl EventKind {
    pub fn bit(self) -> u8 {
        match self {
            EventKind::Opts => 0b001,
            EventKind::Plat => 0b010,
            EventKind::Usr1 => 0b100,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::Opts => "OPTS",
            EventKind::Plat => "PLAT",
            EventKind::Usr1 => "USR1",
        })
    }
}

/// Set of pending event kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventMask(u8);

impl EventMask {
    pub fn contains(self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Only workload-set changes are pending.
    pub fn only_opts(self) -> bool {
        self.0 == EventKind::Opts.bit()
    }
}

/// Dirty mask plus wake-up.
#[derive(Debug, Default)]
pub struct EventQueue {
    pending: AtomicU8,
    notify: Notify,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, kind: EventKind) {
        self.pending.fetch_or(kind.bit(), Ordering::AcqRel);
        self.notify.notify_one();
    }

    pub fn peek(&self) -> EventMask {
        EventMask(self.pending.load(Ordering::Acquire))
    }

    /// Clear and return the pending events.
    pub fn take(&self) -> EventMask {
        EventMask(self.pending.swap(0, Ordering::AcqRel))
    }

    /// Wait until at least one event was raised.
    pub async fn wait(&self) {
        if !self.peek().is_empty() {
            return;
        }
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn events_coalesce() {
        let q = EventQueue::new();
        q.raise(EventKind::Opts);
        q.raise(EventKind::Opts);
        q.raise(EventKind::Plat);
        let mask = q.take();
        assert!(mask.contains(EventKind::Opts));
        assert!(mask.contains(EventKind::Plat));
        assert!(!mask.contains(EventKind::Usr1));
        assert!(q.take().is_empty());
    }

    #[test]
    fn only_opts() {
        let q = EventQueue::new();
        q.raise(EventKind::Opts);
        assert!(q.peek().only_opts());
        q.raise(EventKind::Usr1);
        assert!(!q.peek().only_opts());
    }

    #[tokio::test]
    async fn wait_returns_when_already_dirty() {
        let q = EventQueue::new();
        q.raise(EventKind::Plat);
        // Permit stored by notify_one, plus the dirty check.
        tokio::time::timeout(Duration::from_secs(1), q.wait())
            .await
            .unwrap();
    }
}
