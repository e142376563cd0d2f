//! Freshness policy for cached data.
//!
//! Every "is this value still good enough" decision goes through this table,
//! so the broker, the single-flight timeout, and the health record never
//! disagree about what fresh means.
//!
//! | category       | ttl    | critical after | lock timeout |
//! |----------------|--------|----------------|--------------|
//! | `billing`      | 120 s  | 600 s          | 60 s         |
//! | `quota`        | 60 s   | 300 s          | 30 s         |
//! | `git`          | 10 s   | 60 s           | 15 s         |
//! | `secrets_scan` | 30 s   | 300 s          | 30 s         |
//! | `transcript`   | 5 s    | 60 s           | 15 s         |
//! | `auth`         | 300 s  | 3600 s         | 15 s         |
//! | anything else  | 60 s   | 300 s          | 30 s         |
//!
//! The TTL boundary is inclusive: a value exactly `ttl` old is still fresh.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessCategory {
    Billing,
    Quota,
    Git,
    SecretsScan,
    Transcript,
    Auth,
    /// Falls back to the default policy.
    Other(String),
}

impl FreshnessCategory {
    pub fn parse(name: &str) -> Self {
        match name {
            "billing" => Self::Billing,
            "quota" => Self::Quota,
            "git" => Self::Git,
            "secrets_scan" | "secrets-scan" => Self::SecretsScan,
            "transcript" => Self::Transcript,
            "auth" => Self::Auth,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Billing => "billing",
            Self::Quota => "quota",
            Self::Git => "git",
            Self::SecretsScan => "secrets_scan",
            Self::Transcript => "transcript",
            Self::Auth => "auth",
            Self::Other(name) => name,
        }
    }

    pub fn policy(&self) -> FreshnessPolicy {
        let (ttl, critical_after, lock_timeout) = match self {
            Self::Billing => (120, 600, 60),
            Self::Quota => (60, 300, 30),
            Self::Git => (10, 60, 15),
            Self::SecretsScan => (30, 300, 30),
            Self::Transcript => (5, 60, 15),
            Self::Auth => (300, 3600, 15),
            Self::Other(_) => (60, 300, 30),
        };
        FreshnessPolicy {
            ttl: Duration::from_secs(ttl),
            critical_after: Duration::from_secs(critical_after),
            lock_timeout: Duration::from_secs(lock_timeout),
        }
    }
}

impl fmt::Display for FreshnessCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    /// Values at most this old are fresh.
    pub ttl: Duration,
    /// Values older than this are critical rather than merely stale.
    pub critical_after: Duration,
    /// Age after which a single-flight lock for this category may be taken over.
    pub lock_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Fresh,
    Stale,
    Critical,
}

/// Age of `timestamp_ms` at `now_ms`. Timestamps from the future count as age 0.
pub fn age(timestamp_ms: i64, now_ms: i64) -> Duration {
    Duration::from_millis(now_ms.saturating_sub(timestamp_ms).max(0) as u64)
}

pub fn classify_at(timestamp_ms: i64, category: &FreshnessCategory, now_ms: i64) -> Freshness {
    let policy = category.policy();
    let age = age(timestamp_ms, now_ms);
    if age <= policy.ttl {
        Freshness::Fresh
    } else if age <= policy.critical_after {
        Freshness::Stale
    } else {
        Freshness::Critical
    }
}

pub fn classify(timestamp_ms: i64, category: &FreshnessCategory) -> Freshness {
    classify_at(timestamp_ms, category, crate::now_ms())
}

pub fn is_fresh(timestamp_ms: i64, category: &FreshnessCategory) -> bool {
    classify(timestamp_ms, category) == Freshness::Fresh
}

/// Time left before a value fetched at `timestamp_ms` turns stale (zero if it already has).
pub fn time_until_stale(timestamp_ms: i64, category: &FreshnessCategory, now_ms: i64) -> Duration {
    category
        .policy()
        .ttl
        .saturating_sub(age(timestamp_ms, now_ms))
}
