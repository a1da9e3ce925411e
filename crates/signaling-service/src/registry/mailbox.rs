//! Mailbox depth monitoring for the registry actor.
//!
//! | Level    | Depth     |
//! |----------|-----------|
//! | Normal   | < 100     |
//! | Warning  | 100-500   |
//! | Critical | > 500     |

use crate::observability::metrics;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, warn};

pub const MAILBOX_NORMAL: usize = 100;
pub const MAILBOX_WARNING: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

impl MailboxLevel {
    #[must_use]
    pub fn for_depth(depth: usize) -> Self {
        if depth > MAILBOX_WARNING {
            MailboxLevel::Critical
        } else if depth >= MAILBOX_NORMAL {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Shared between the registry handle (enqueue) and the actor (dequeue).
#[derive(Debug, Default)]
pub struct MailboxMonitor {
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    processed: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_enqueue(&self) {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_depth.fetch_max(depth, Ordering::Relaxed);

        match MailboxLevel::for_depth(depth) {
            MailboxLevel::Critical => warn!(
                target: "sig.registry.mailbox",
                depth,
                threshold = MAILBOX_WARNING,
                "Registry mailbox depth critical"
            ),
            MailboxLevel::Warning if depth == MAILBOX_NORMAL => debug!(
                target: "sig.registry.mailbox",
                depth,
                "Registry mailbox depth elevated"
            ),
            _ => {}
        }
    }

    /// Called by the actor after taking a message off the queue.
    pub fn record_dequeue(&self) {
        let previous = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| Some(d.saturating_sub(1)))
            .unwrap_or(0);
        self.processed.fetch_add(1, Ordering::Relaxed);
        metrics::set_registry_mailbox_depth(previous.saturating_sub(1));
    }

    /// Undo an enqueue whose send failed.
    pub fn record_send_failure(&self) {
        let _ = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| Some(d.saturating_sub(1)));
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}
