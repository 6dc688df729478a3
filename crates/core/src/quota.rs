//! Rolling per-identity conversion counters.
//!
//! Windows reset lazily: every read or write first checks whether the
//! identity's window has elapsed. A reservation is taken at admission and
//! either committed (job succeeded) or released (job failed or was dropped),
//! so concurrent admissions cannot overshoot the quota.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use crate::error::StorageResult;
use crate::identity::Identity;
use crate::store::KeyValueStore;

/// Usage counters for one identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub identity: Identity,
    /// Successful metered conversions in the current window
    pub conversion_count: u32,
    /// Admitted jobs that have not reached a terminal state
    pub reserved: u32,
    pub window_start: DateTime<Utc>,
}

impl UsageRecord {
    fn new(identity: Identity, now: DateTime<Utc>) -> Self {
        UsageRecord {
            identity,
            conversion_count: 0,
            reserved: 0,
            window_start: now,
        }
    }

    /// Apply the window reset if it has elapsed. Returns true when reset.
    fn roll_window(&mut self, now: DateTime<Utc>, window: Duration) -> bool {
        let elapsed = (now - self.window_start).to_std().unwrap_or_default();
        if elapsed > window {
            self.conversion_count = 0;
            self.window_start = now;
            true
        } else {
            false
        }
    }

    fn used(&self) -> u32 {
        self.conversion_count.saturating_add(self.reserved)
    }
}

/// Outcome of a reservation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    /// Slots left in the window after this decision
    pub remaining: u32,
}

/// Serialized access to the usage table
pub struct QuotaTracker {
    records: Arc<dyn KeyValueStore<UsageRecord>>,
    window: Duration,
    lock: Mutex<()>,
    total_conversions: AtomicU64,
    users_seen: AtomicUsize,
}

impl QuotaTracker {
    pub fn new(records: Arc<dyn KeyValueStore<UsageRecord>>, window: Duration) -> Self {
        QuotaTracker {
            records,
            window,
            lock: Mutex::new(()),
            total_conversions: AtomicU64::new(0),
            users_seen: AtomicUsize::new(0),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Reserve one conversion slot if the identity is under `quota`
    pub fn check_and_reserve(&self, identity: &Identity, quota: u32) -> StorageResult<QuotaDecision> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        let mut record = self.load(identity, now)?;

        let decision = if record.used() < quota {
            record.reserved += 1;
            QuotaDecision {
                allowed: true,
                remaining: quota - record.used(),
            }
        } else {
            QuotaDecision {
                allowed: false,
                remaining: 0,
            }
        };

        debug!(
            "Quota {}: allowed={} count={} reserved={} quota={}",
            identity, decision.allowed, record.conversion_count, record.reserved, quota
        );
        self.records.set(identity.as_str(), record)?;
        Ok(decision)
    }

    /// Turn a reservation into a counted conversion
    pub fn commit(&self, identity: &Identity) -> StorageResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut record = self.load(identity, Utc::now())?;
        record.reserved = record.reserved.saturating_sub(1);
        record.conversion_count = record.conversion_count.saturating_add(1);
        self.records.set(identity.as_str(), record)?;
        self.total_conversions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Give a reservation back without consuming quota
    pub fn release(&self, identity: &Identity) -> StorageResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut record = self.load(identity, Utc::now())?;
        record.reserved = record.reserved.saturating_sub(1);
        self.records.set(identity.as_str(), record)
    }

    /// Count a conversion that was never metered (premium tier)
    pub fn record_unmetered(&self, identity: &Identity) -> StorageResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let record = self.load(identity, Utc::now())?;
        self.records.set(identity.as_str(), record)?;
        self.total_conversions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Slots left for `identity` under `quota`, without reserving
    pub fn remaining(&self, identity: &Identity, quota: u32) -> StorageResult<u32> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        let used = match self.records.get(identity.as_str())? {
            Some(mut record) => {
                record.roll_window(now, self.window);
                record.used()
            }
            None => 0,
        };
        Ok(quota.saturating_sub(used))
    }

    pub fn usage(&self, identity: &Identity) -> StorageResult<Option<UsageRecord>> {
        self.records.get(identity.as_str())
    }

    /// Usage records started since startup. An identity whose record was
    /// pruned while idle counts again when it comes back.
    pub fn total_users(&self) -> usize {
        self.users_seen.load(Ordering::Relaxed)
    }

    /// Drop records whose window has lapsed with nothing reserved. Such a
    /// record would be reset on its next use anyway.
    pub fn prune_idle(&self) -> StorageResult<usize> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        let mut pruned = 0;
        for mut record in self.records.values()? {
            if record.reserved == 0 && record.roll_window(now, self.window) {
                self.records.delete(record.identity.as_str())?;
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!("Quota: pruned {} idle usage records", pruned);
        }
        Ok(pruned)
    }

    /// Records currently held in the usage table
    pub fn tracked_identities(&self) -> StorageResult<usize> {
        self.records.len()
    }

    pub fn total_conversions(&self) -> u64 {
        self.total_conversions.load(Ordering::Relaxed)
    }

    fn load(&self, identity: &Identity, now: DateTime<Utc>) -> StorageResult<UsageRecord> {
        let mut record = match self.records.get(identity.as_str())? {
            Some(record) => record,
            None => {
                self.users_seen.fetch_add(1, Ordering::Relaxed);
                UsageRecord::new(identity.clone(), now)
            }
        };
        if record.roll_window(now, self.window) {
            debug!("Quota {}: window elapsed, counters reset", identity);
        }
        Ok(record)
    }
}
