//! Severity-tiered alerts and the rate-limited dispatcher.
//!
//! CRITICAL alerts are never limited. WATCH and INFO alerts are gated per
//! dedup key by a minimum gap between deliveries and a same-calendar-day cap.
//! The clock is the triggering bar's timestamp, so replaying the same bars
//! yields the same gate decisions. Alerts that fail the gate are dropped with
//! status `Suppressed`; nothing is queued.

use crate::ports::alert_port::AlertPort;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Critical,
    Watch,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Critical => "CRITICAL",
            Severity::Watch => "WATCH",
            Severity::Info => "INFO",
        })
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "CRITICAL" => Ok(Severity::Critical),
            "WATCH" => Ok(Severity::Watch),
            "INFO" => Ok(Severity::Info),
            other => Err(format!(
                "unknown severity '{}' (expected CRITICAL, WATCH, INFO)",
                other
            )),
        }
    }
}

/// (rule or transition id, instrument)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupKey {
    pub source: String,
    pub instrument: String,
}

impl DedupKey {
    pub fn new(source: &str, instrument: &str) -> Self {
        Self {
            source: source.to_string(),
            instrument: instrument.to_string(),
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.source, self.instrument)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Suppressed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub key: DedupKey,
    pub severity: Severity,
    pub timestamp: NaiveDateTime,
    pub bar_index: usize,
    pub message: String,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Alert {
    pub fn new(
        key: DedupKey,
        severity: Severity,
        timestamp: NaiveDateTime,
        bar_index: usize,
        message: String,
    ) -> Self {
        Self {
            key,
            severity,
            timestamp,
            bar_index,
            message,
            status: DeliveryStatus::Pending,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimit {
    pub min_gap: Duration,
    pub daily_cap: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertPolicy {
    pub watch: TierLimit,
    pub info: TierLimit,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            watch: TierLimit {
                min_gap: Duration::hours(4),
                daily_cap: 5,
            },
            info: TierLimit {
                min_gap: Duration::hours(24),
                daily_cap: 2,
            },
        }
    }
}

impl AlertPolicy {
    pub fn limit(&self, severity: Severity) -> Option<&TierLimit> {
        match severity {
            Severity::Critical => None,
            Severity::Watch => Some(&self.watch),
            Severity::Info => Some(&self.info),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyCounter {
    pub last_delivered: Option<NaiveDateTime>,
    pub day: Option<NaiveDate>,
    pub day_count: u32,
}

/// Per-key delivery history, persisted with the state snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitBook {
    pub keys: BTreeMap<String, KeyCounter>,
}

impl RateLimitBook {
    /// Record a delivery if the tier allows one at `at`.
    pub fn admit(
        &mut self,
        key: &DedupKey,
        severity: Severity,
        at: NaiveDateTime,
        policy: &AlertPolicy,
    ) -> bool {
        let Some(limit) = policy.limit(severity) else {
            return true;
        };
        let counter = self.keys.entry(key.to_string()).or_default();
        let today = at.date();
        let same_day = if counter.day == Some(today) {
            counter.day_count
        } else {
            0
        };

        if counter
            .last_delivered
            .is_some_and(|last| at - last < limit.min_gap)
        {
            return false;
        }
        if same_day >= limit.daily_cap {
            return false;
        }

        counter.last_delivered = Some(at);
        counter.day = Some(today);
        counter.day_count = same_day + 1;
        true
    }
}

/// Gates alerts through the rate-limit book and hands the survivors to a sink.
/// Counters sit behind a mutex so one dispatcher can serve several threads.
pub struct AlertDispatcher {
    policy: AlertPolicy,
    book: Mutex<RateLimitBook>,
}

impl AlertDispatcher {
    pub fn new(policy: AlertPolicy, book: RateLimitBook) -> Self {
        Self {
            policy,
            book: Mutex::new(book),
        }
    }

    pub fn policy(&self) -> &AlertPolicy {
        &self.policy
    }

    fn lock(&self) -> MutexGuard<'_, RateLimitBook> {
        self.book
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply the gate; returns the alert marked `Pending` or `Suppressed`.
    pub fn gate(&self, alert: Alert) -> Alert {
        self.gate_with(&mut self.lock(), alert)
    }

    /// Gate against a caller-held book, leaving the dispatcher's own untouched.
    pub fn gate_with(&self, book: &mut RateLimitBook, mut alert: Alert) -> Alert {
        let admitted = book.admit(&alert.key, alert.severity, alert.timestamp, &self.policy);
        alert.status = if admitted {
            DeliveryStatus::Pending
        } else {
            debug!(key = %alert.key, severity = %alert.severity, "alert suppressed by rate limit");
            DeliveryStatus::Suppressed
        };
        alert
    }

    /// Gate then deliver.
    pub fn dispatch(&self, alert: Alert, sink: &dyn AlertPort) -> Alert {
        let alert = self.gate(alert);
        self.deliver(alert, sink)
    }

    /// Deliver an already gated alert. Suppressed alerts are returned as is.
    /// Sink failures are logged and recorded, never retried.
    pub fn deliver(&self, mut alert: Alert, sink: &dyn AlertPort) -> Alert {
        if alert.status == DeliveryStatus::Suppressed {
            return alert;
        }
        match sink.deliver(&alert) {
            Ok(()) => alert.status = DeliveryStatus::Delivered,
            Err(e) => {
                warn!(key = %alert.key, error = %e, "alert delivery failed");
                alert.status = DeliveryStatus::Failed;
                alert.error = Some(e.to_string());
            }
        }
        alert
    }

    pub fn book(&self) -> RateLimitBook {
        self.lock().clone()
    }

    pub fn restore(&self, book: RateLimitBook) {
        *self.lock() = book;
    }
}
