//! Bounded, latency-sorted pool of responsive addresses.
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use time::OffsetDateTime;

use crate::config::{ChangeHook, ScanConfig};
use crate::types::AddressRecord;

/// Pool of addresses that passed probing, best RTT first.
///
/// Writers are serialized through one mutex; readers get a copy taken under
/// the same lock, so they never see a half-applied change. The change hook
/// runs under a second lock that is taken before the pool lock is released,
/// which keeps notifications in change order without making readers wait for
/// the hook.
pub struct ResponsiveQueue {
    entries: Mutex<Vec<AddressRecord>>,
    notify: Mutex<()>,
    capacity: usize,
    ttl: Duration,
    max_rtt: Duration,
    on_change: Option<ChangeHook>,
}

impl std::fmt::Debug for ResponsiveQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponsiveQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("ttl", &self.ttl)
            .field("max_rtt", &self.max_rtt)
            .finish_non_exhaustive()
    }
}

impl ResponsiveQueue {
    pub fn new(capacity: usize, ttl: Duration, max_rtt: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::with_capacity(capacity + 1)),
            notify: Mutex::new(()),
            capacity,
            ttl,
            max_rtt,
            on_change: None,
        }
    }

    pub fn from_config(config: &ScanConfig) -> Self {
        Self::new(config.queue_capacity, config.queue_ttl, config.max_rtt)
            .with_hook(config.on_change.clone())
    }

    pub fn with_hook(mut self, hook: Option<ChangeHook>) -> Self {
        self.on_change = hook;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Level-triggered: true whenever the pool holds fewer than `capacity` records.
    pub fn needs_refill(&self) -> bool {
        self.len() < self.capacity
    }

    /// Add or improve a record. Returns whether the pool changed.
    ///
    /// A record above the latency ceiling is refused, as is one for an
    /// address already pooled with an equal or better RTT. A better RTT
    /// replaces the old record. Past capacity the worst record is dropped,
    /// which may be the newcomer itself.
    pub fn insert(&self, record: AddressRecord) -> bool {
        if record.rtt() > self.max_rtt {
            return false;
        }

        let mut entries = self.lock();
        if let Some(pos) = entries.iter().position(|r| r.ip == record.ip) {
            if entries[pos].rtt_ms <= record.rtt_ms {
                return false;
            }
            entries.remove(pos);
        }

        // Stable among equals: a newcomer lands after records with the same RTT.
        let at = entries.partition_point(|r| r.rtt_ms <= record.rtt_ms);
        if at >= self.capacity {
            return false;
        }
        entries.insert(at, record);
        entries.truncate(self.capacity);

        self.publish(entries);
        true
    }

    /// Drop every record older than the TTL. Returns how many went.
    pub fn expire(&self, now: OffsetDateTime) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|r| r.age(now) <= self.ttl);
        let removed = before - entries.len();
        if removed > 0 {
            self.publish(entries);
        }
        removed
    }

    /// Records that would survive an `expire(now)`, without removing anything.
    pub fn qualifying(&self, now: OffsetDateTime) -> usize {
        self.lock().iter().filter(|r| r.age(now) <= self.ttl).count()
    }

    /// Ordered copy of the pool, ascending RTT unless `descending`.
    pub fn snapshot(&self, descending: bool) -> Vec<AddressRecord> {
        let mut out = self.lock().clone();
        if descending {
            out.reverse();
        }
        out
    }

    fn lock(&self) -> MutexGuard<'_, Vec<AddressRecord>> {
        // A panicking hook must not wedge the pool for good.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, entries: MutexGuard<'_, Vec<AddressRecord>>) {
        let Some(hook) = self.on_change.as_ref() else {
            return;
        };
        let snapshot = entries.clone();
        let _turn = self.notify.lock().unwrap_or_else(|p| p.into_inner());
        drop(entries);
        hook(&snapshot);
    }
}
