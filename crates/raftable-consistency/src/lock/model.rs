//! Lock identities and statistics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Table holding one row per held lock, keyed by lock path
pub const LOCK_TABLE: &str = "raftable-locks";

/// Rows expire this long after insertion; no lease can outlive it
pub const LOCK_TABLE_TTL_MILLIS: u32 = 5000;

/// A fresh holder token: `<random u64 as hex>@<member id>`
pub fn new_lock_id(member: &str) -> String {
    format!(
        "{}@{}",
        const_hex::encode(rand::random::<u64>().to_be_bytes()),
        member
    )
}

/// Lock statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStats {
    /// Successful acquisitions, immediate or after waiting
    pub acquired: u64,
    /// Successful releases
    pub released: u64,
    /// Attempts that found the lock held
    pub contended: u64,
    /// Waiters dropped after their wait window closed
    pub expired_waiters: u64,
    /// Waiters currently queued
    pub queued_waiters: u64,
}

#[derive(Default)]
pub(crate) struct LockStatsCollector {
    pub acquired: AtomicU64,
    pub released: AtomicU64,
    pub contended: AtomicU64,
    pub expired_waiters: AtomicU64,
    pub queued_waiters: AtomicU64,
}

impl LockStatsCollector {
    pub fn snapshot(&self) -> LockStats {
        LockStats {
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
            expired_waiters: self.expired_waiters.load(Ordering::Relaxed),
            queued_waiters: self.queued_waiters.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_id_format() {
        let id = new_lock_id("node-1");
        let (token, member) = id.split_once('@').unwrap();
        assert_eq!(token.len(), 16);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(member, "node-1");
        assert_ne!(new_lock_id("node-1"), id);
    }
}
