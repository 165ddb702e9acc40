//! [`ScheduleLock`] and [`ConcurrencyLock`]: TTL-based mutual exclusion rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A per-schedule lock row, guaranteeing at-most-one dispatch per schedule
/// across instances (spec.md §3, §4.12).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleLock {
    pub schedule_id: uuid::Uuid,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ScheduleLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// A lock over an arbitrary resource key, same acquire/release discipline as
/// [`ScheduleLock`] but keyed by a caller-chosen name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyLock {
    pub lock_key: String,
    pub execution_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ConcurrencyLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_lock_expiry() {
        let now = Utc::now();
        let lock = ScheduleLock {
            schedule_id: uuid::Uuid::now_v7(),
            locked_by: "instance-a".into(),
            locked_at: now - chrono::Duration::seconds(120),
            expires_at: now - chrono::Duration::seconds(60),
        };
        assert!(lock.is_expired(now));
    }
}
