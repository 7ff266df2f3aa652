//! Metrics Module for Observability
//!
//! In-memory counters for the dispatch engine, served as JSON at `/metrics`
//! and in Prometheus text form for scraping.
//!
//! Lock-free atomics only; every counter is monotonically increasing.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance - lock-free atomics for counters
pub static METRICS: Metrics = Metrics::new();

/// Dispatch metrics - all fields are atomic for thread-safe access
pub struct Metrics {
    // Dispatch counters
    pub cases_dispatched: AtomicU64,
    pub candidates_notified: AtomicU64,
    pub selection_retries: AtomicU64,

    // Claim counters
    pub claims_won: AtomicU64,
    pub claims_lost: AtomicU64,
    pub declines: AtomicU64,
    pub tokens_invalid: AtomicU64,
    pub tokens_replayed: AtomicU64,

    // Delivery counters
    pub sends_ok: AtomicU64,
    pub sends_failed: AtomicU64,
    pub send_retries: AtomicU64,

    // Sweep counters
    pub cases_expired: AtomicU64,
    pub cases_escalated: AtomicU64,
    pub cases_cancelled: AtomicU64,

    pub db_errors: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            cases_dispatched: AtomicU64::new(0),
            candidates_notified: AtomicU64::new(0),
            selection_retries: AtomicU64::new(0),
            claims_won: AtomicU64::new(0),
            claims_lost: AtomicU64::new(0),
            declines: AtomicU64::new(0),
            tokens_invalid: AtomicU64::new(0),
            tokens_replayed: AtomicU64::new(0),
            sends_ok: AtomicU64::new(0),
            sends_failed: AtomicU64::new(0),
            send_retries: AtomicU64::new(0),
            cases_expired: AtomicU64::new(0),
            cases_escalated: AtomicU64::new(0),
            cases_cancelled: AtomicU64::new(0),
            db_errors: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_cases_dispatched(&self) {
        self.cases_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_candidates_notified(&self, count: u64) {
        self.candidates_notified.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_selection_retries(&self) {
        self.selection_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_claims_won(&self) {
        self.claims_won.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_claims_lost(&self) {
        self.claims_lost.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_declines(&self) {
        self.declines.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_tokens_invalid(&self) {
        self.tokens_invalid.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_tokens_replayed(&self) {
        self.tokens_replayed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_sends_ok(&self) {
        self.sends_ok.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_sends_failed(&self) {
        self.sends_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_send_retries(&self) {
        self.send_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_cases_expired(&self) {
        self.cases_expired.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_cases_escalated(&self) {
        self.cases_escalated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_cases_cancelled(&self) {
        self.cases_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_db_errors(&self) {
        self.db_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cases_dispatched: self.cases_dispatched.load(Ordering::Relaxed),
            candidates_notified: self.candidates_notified.load(Ordering::Relaxed),
            selection_retries: self.selection_retries.load(Ordering::Relaxed),
            claims_won: self.claims_won.load(Ordering::Relaxed),
            claims_lost: self.claims_lost.load(Ordering::Relaxed),
            declines: self.declines.load(Ordering::Relaxed),
            tokens_invalid: self.tokens_invalid.load(Ordering::Relaxed),
            tokens_replayed: self.tokens_replayed.load(Ordering::Relaxed),
            sends_ok: self.sends_ok.load(Ordering::Relaxed),
            sends_failed: self.sends_failed.load(Ordering::Relaxed),
            send_retries: self.send_retries.load(Ordering::Relaxed),
            cases_expired: self.cases_expired.load(Ordering::Relaxed),
            cases_escalated: self.cases_escalated.load(Ordering::Relaxed),
            cases_cancelled: self.cases_cancelled.load(Ordering::Relaxed),
            db_errors: self.db_errors.load(Ordering::Relaxed),
        }
    }

    /// Format as Prometheus exposition format
    pub fn prometheus_format(&self) -> String {
        let s = self.snapshot();
        let counters: [(&str, &str, u64); 15] = [
            ("cases_dispatched", "Cases broadcast to candidates", s.cases_dispatched),
            ("candidates_notified", "Dispatch rows created", s.candidates_notified),
            ("selection_retries", "Candidate source retries", s.selection_retries),
            ("claims_won", "Accepts that assigned a case", s.claims_won),
            ("claims_lost", "Accepts that arrived after the case closed", s.claims_lost),
            ("declines", "Fresh declines", s.declines),
            ("tokens_invalid", "Unknown or mismatched response links", s.tokens_invalid),
            ("tokens_replayed", "Redemptions of consumed tokens", s.tokens_replayed),
            ("sends_ok", "Notifications delivered", s.sends_ok),
            ("sends_failed", "Notifications that exhausted retries", s.sends_failed),
            ("send_retries", "Notification send retries", s.send_retries),
            ("cases_expired", "Cases expired without assignment", s.cases_expired),
            ("cases_escalated", "Rebroadcasts and operator hand-offs", s.cases_escalated),
            ("cases_cancelled", "Cases cancelled while open", s.cases_cancelled),
            ("db_errors", "Store failures seen by the engine", s.db_errors),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP vetdispatch_{name}_total {help}\n# TYPE vetdispatch_{name}_total counter\nvetdispatch_{name}_total {value}\n\n"
            ));
        }
        out
    }
}

/// Immutable snapshot of metrics for reading
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub cases_dispatched: u64,
    pub candidates_notified: u64,
    pub selection_retries: u64,
    pub claims_won: u64,
    pub claims_lost: u64,
    pub declines: u64,
    pub tokens_invalid: u64,
    pub tokens_replayed: u64,
    pub sends_ok: u64,
    pub sends_failed: u64,
    pub send_retries: u64,
    pub cases_expired: u64,
    pub cases_escalated: u64,
    pub cases_cancelled: u64,
    pub db_errors: u64,
}

impl MetricsSnapshot {
    /// Format as human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "Cases: {} dispatched, {} expired, {} escalated | \
             Claims: {} won, {} lost, {} declined | \
             Sends: {} ok, {} failed, {} retried",
            self.cases_dispatched,
            self.cases_expired,
            self.cases_escalated,
            self.claims_won,
            self.claims_lost,
            self.declines,
            self.sends_ok,
            self.sends_failed,
            self.send_retries,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();
        metrics.inc_claims_won();
        metrics.inc_claims_lost();
        metrics.inc_claims_lost();
        metrics.add_candidates_notified(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.claims_won, 1);
        assert_eq!(snapshot.claims_lost, 2);
        assert_eq!(snapshot.candidates_notified, 3);
        assert!(snapshot.summary().contains("1 won, 2 lost"));
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.inc_sends_ok();
        let output = metrics.prometheus_format();
        assert!(output.contains("vetdispatch_sends_ok_total 1"));
        assert!(output.contains("# TYPE vetdispatch_claims_won_total counter"));
    }
}
