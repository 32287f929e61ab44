//! Lease, rate-limit bucket and per-target activity records

use serde::{Deserialize, Serialize};

/// Time-bounded exclusive ownership of an identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub identity_id: String,
    pub holder_token: String,
    pub expires_at: i64,
}

impl Lease {
    pub fn is_valid(&self, now: i64) -> bool {
        now < self.expires_at
    }

    pub fn is_held_by(&self, holder: &str, now: i64) -> bool {
        self.holder_token == holder && self.is_valid(now)
    }
}

/// Persisted token bucket
///
/// `spent` holds the times at which the tokens currently out of the bucket
/// were consumed; each returns `refill_interval` after its timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitBucket {
    pub identity_id: String,
    pub tokens_remaining: u32,
    pub last_refill_at: i64,
    #[serde(default)]
    pub spent: Vec<i64>,
    /// Provider cool-down; no tokens are granted before this time
    #[serde(default)]
    pub blocked_until: Option<i64>,
}

impl RateLimitBucket {
    /// A full bucket
    pub fn full(identity_id: impl Into<String>, capacity: u32, now: i64) -> Self {
        Self {
            identity_id: identity_id.into(),
            tokens_remaining: capacity,
            last_refill_at: now,
            spent: Vec::new(),
            blocked_until: None,
        }
    }

    /// Return tokens spent at least `interval_ms` ago
    pub fn refill(&mut self, capacity: u32, interval_ms: i64, now: i64) {
        let before = self.spent.len();
        self.spent.retain(|&at| now - at < interval_ms);
        // Capacity may shrink through reconfiguration
        let excess = self.spent.len().saturating_sub(capacity as usize);
        if excess > 0 {
            self.spent.drain(..excess);
        }
        if self.spent.len() != before {
            self.last_refill_at = now;
        }

        let blocked = self.is_blocked(now);
        if !blocked {
            self.blocked_until = None;
        }
        self.tokens_remaining = if blocked {
            0
        } else {
            capacity - self.spent.len() as u32
        };
    }

    pub fn is_blocked(&self, now: i64) -> bool {
        self.blocked_until.is_some_and(|until| now < until)
    }
}

/// Window of the per-target hourly cap
pub const TARGET_WINDOW_MS: i64 = 60 * 60 * 1_000;

/// Recent sends from one identity to one target
///
/// `sent` is ascending and never older than [`TARGET_WINDOW_MS`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetActivity {
    pub identity_id: String,
    pub target: String,
    #[serde(default)]
    pub sent: Vec<i64>,
}

impl TargetActivity {
    pub fn new(identity_id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            identity_id: identity_id.into(),
            target: target.into(),
            sent: Vec::new(),
        }
    }

    pub fn prune(&mut self, now: i64) {
        self.sent.retain(|&at| now - at < TARGET_WINDOW_MS);
    }

    /// Earliest time another send is allowed, if that is after `now`
    pub fn free_at(&self, cooldown_ms: u64, max_per_hour: u32, now: i64) -> Option<i64> {
        let recent: Vec<i64> = self
            .sent
            .iter()
            .copied()
            .filter(|&at| now - at < TARGET_WINDOW_MS)
            .collect();

        let after_gap = match recent.last() {
            Some(&last) if cooldown_ms > 0 => last + cooldown_ms as i64,
            _ => now,
        };
        let max = max_per_hour as usize;
        let after_cap = if max > 0 && recent.len() >= max {
            recent[recent.len() - max] + TARGET_WINDOW_MS
        } else {
            now
        };

        let free = after_gap.max(after_cap);
        (free > now).then_some(free)
    }

    /// Note a send at `now`, keeping only what the limits can still use
    pub fn record(&mut self, max_per_hour: u32, now: i64) {
        self.prune(now);
        self.sent.push(now);
        let keep = (max_per_hour as usize).max(1);
        let excess = self.sent.len().saturating_sub(keep);
        if excess > 0 {
            self.sent.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_validity() {
        let lease = Lease {
            identity_id: "bot-a".to_string(),
            holder_token: "h1".to_string(),
            expires_at: 1_000,
        };
        assert!(lease.is_held_by("h1", 999));
        assert!(!lease.is_held_by("h1", 1_000));
        assert!(!lease.is_held_by("h2", 0));
    }

    #[test]
    fn test_bucket_refill_returns_old_tokens() {
        let mut bucket = RateLimitBucket::full("bot-a", 3, 0);
        bucket.spent = vec![0, 100, 200];
        bucket.refill(3, 1_000, 500);
        assert_eq!(bucket.tokens_remaining, 0);

        bucket.refill(3, 1_000, 1_100);
        assert_eq!(bucket.tokens_remaining, 2);
        assert_eq!(bucket.last_refill_at, 1_100);
        assert_eq!(bucket.spent, vec![200]);
    }

    #[test]
    fn test_blocked_bucket_reports_zero() {
        let mut bucket = RateLimitBucket::full("bot-a", 3, 0);
        bucket.blocked_until = Some(5_000);
        bucket.refill(3, 1_000, 4_999);
        assert_eq!(bucket.tokens_remaining, 0);
        assert!(bucket.is_blocked(4_999));

        bucket.refill(3, 1_000, 5_000);
        assert_eq!(bucket.tokens_remaining, 3);
        assert!(bucket.blocked_until.is_none());
    }

    #[test]
    fn test_target_gap() {
        let mut activity = TargetActivity::new("bot-a", "chat-1");
        assert_eq!(activity.free_at(1_000, 0, 0), None);

        activity.record(0, 100);
        assert_eq!(activity.free_at(1_000, 0, 500), Some(1_100));
        assert_eq!(activity.free_at(1_000, 0, 1_100), None);
        assert_eq!(activity.free_at(0, 0, 500), None);
    }

    #[test]
    fn test_target_hourly_cap() {
        let mut activity = TargetActivity::new("bot-a", "chat-1");
        activity.record(2, 0);
        activity.record(2, 10);
        activity.record(2, 20);
        assert_eq!(activity.sent, vec![10, 20]);

        assert_eq!(activity.free_at(0, 2, 30), Some(10 + TARGET_WINDOW_MS));
        assert_eq!(activity.free_at(0, 3, 30), None);
        assert_eq!(activity.free_at(0, 2, 10 + TARGET_WINDOW_MS), None);
    }

    #[test]
    fn test_capacity_shrink_trims_spent() {
        let mut bucket = RateLimitBucket::full("bot-a", 5, 0);
        bucket.spent = vec![10, 20, 30, 40];
        bucket.refill(2, 1_000, 50);
        assert_eq!(bucket.spent, vec![30, 40]);
        assert_eq!(bucket.tokens_remaining, 0);
    }
}
