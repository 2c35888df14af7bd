//! Per-message-kind traffic counters.

use framelock_core::wire::MessageKind;
use std::sync::atomic::{AtomicU64, Ordering};

const KIND_COUNT: usize = MessageKind::ALL.len();

fn slot(kind: MessageKind) -> usize {
    MessageKind::ALL
        .iter()
        .position(|k| *k == kind)
        .unwrap_or(0)
}

/// Lock-free counters updated from the send path and the rx thread.
#[derive(Debug, Default)]
pub struct TrafficStats {
    sent: [AtomicU64; KIND_COUNT],
    received: [AtomicU64; KIND_COUNT],
}

impl TrafficStats {
    pub fn record_sent(&self, kind: MessageKind) {
        self.sent[slot(kind)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, kind: MessageKind) {
        self.received[slot(kind)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent(&self, kind: MessageKind) -> u64 {
        self.sent[slot(kind)].load(Ordering::Relaxed)
    }

    pub fn received(&self, kind: MessageKind) -> u64 {
        self.received[slot(kind)].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        let mut counters = Vec::with_capacity(KIND_COUNT);
        for kind in MessageKind::ALL {
            counters.push(KindCounters {
                kind,
                sent: self.sent(kind),
                received: self.received(kind),
            });
        }
        TrafficSnapshot { counters }
    }
}

/// Point-in-time copy of the counters, suitable for logging.
#[derive(Debug, Clone)]
pub struct TrafficSnapshot {
    pub counters: Vec<KindCounters>,
}

#[derive(Debug, Clone, Copy)]
pub struct KindCounters {
    pub kind: MessageKind,
    pub sent: u64,
    pub received: u64,
}

impl TrafficSnapshot {
    pub fn total_sent(&self) -> u64 {
        self.counters.iter().map(|c| c.sent).sum()
    }

    pub fn total_received(&self) -> u64 {
        self.counters.iter().map(|c| c.received).sum()
    }
}
