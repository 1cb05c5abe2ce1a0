//! Rolling delivery statistics and alerting.
//!
//! Outcomes are counted per profile in fixed-width time buckets. Stats for a
//! window sum the buckets overlapping it. Anti-fraud blocks and credential
//! skips are counted apart from transport failures and never enter the
//! success-rate denominator.

mod alert;

pub use alert::*;

use crate::db::{digest_latencies, encode_digest, latency_quantile, MonitoringSnapshot, OutcomeCounters, SkipReason};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

/// Latency samples kept per bucket; later samples only update counters.
const MAX_SAMPLES_PER_BUCKET: usize = 2048;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Window used for alerting and default stats.
    pub window: Duration,
    /// Width of one counter bucket.
    pub bucket: Duration,
    pub success_rate_threshold: f64,
    /// Deliveries needed in the window before the success rate is judged.
    pub min_samples: u64,
    /// Failures in the window that raise an alert regardless of rate.
    pub failure_spike: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(3600),
            bucket: Duration::from_secs(300),
            success_rate_threshold: 0.9,
            min_samples: 10,
            failure_spike: 50,
        }
    }
}

/// What happened to one attempt, as far as monitoring cares.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Success { latency_ms: f64 },
    Failure { latency_ms: f64 },
    Skipped(SkipReason),
}

/// Aggregate stats over a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryStats {
    pub successes: u64,
    pub failures: u64,
    pub skips: u64,
    pub credential_skips: u64,
    /// Successes over successes + failures; 1.0 with no deliveries.
    pub success_rate: f64,
    pub total_blocks: u64,
    pub hard_blocks: u64,
    pub soft_blocks: u64,
    /// Anti-fraud blocks over every recorded outcome.
    pub block_rate: f64,
    pub latency_p50_ms: Option<f64>,
    pub latency_p95_ms: Option<f64>,
}

impl DeliveryStats {
    fn from_parts(c: &OutcomeCounters, latencies: &[f64]) -> Self {
        let deliveries = c.deliveries();
        let total = deliveries + c.skips;
        let blocks = c.hard_blocks + c.soft_blocks;
        let digest = digest_latencies(latencies);

        Self {
            successes: c.successes,
            failures: c.failures,
            skips: c.skips,
            credential_skips: c.credential_skips,
            success_rate: if deliveries == 0 {
                1.0
            } else {
                c.successes as f64 / deliveries as f64
            },
            total_blocks: blocks,
            hard_blocks: c.hard_blocks,
            soft_blocks: c.soft_blocks,
            block_rate: if total == 0 { 0.0 } else { blocks as f64 / total as f64 },
            latency_p50_ms: digest.as_ref().map(|td| latency_quantile(td, 0.5)),
            latency_p95_ms: digest.as_ref().map(|td| latency_quantile(td, 0.95)),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    start: DateTime<Utc>,
    counters: OutcomeCounters,
    latencies_ms: Vec<f64>,
    persisted: bool,
}

impl Bucket {
    fn new(start: DateTime<Utc>) -> Self {
        Self {
            start,
            counters: OutcomeCounters::default(),
            latencies_ms: Vec::new(),
            persisted: false,
        }
    }

    fn apply(&mut self, outcome: Outcome) {
        let c = &mut self.counters;
        match outcome {
            Outcome::Success { latency_ms } => {
                c.successes += 1;
                self.push_latency(latency_ms);
            }
            Outcome::Failure { latency_ms } => {
                c.failures += 1;
                self.push_latency(latency_ms);
            }
            Outcome::Skipped(reason) => {
                c.skips += 1;
                match reason {
                    SkipReason::HardBlock => c.hard_blocks += 1,
                    SkipReason::SoftBlock => c.soft_blocks += 1,
                    SkipReason::MissingCredential => c.credential_skips += 1,
                    SkipReason::InvalidTemplate => {}
                }
            }
        }
    }

    fn push_latency(&mut self, latency_ms: f64) {
        if self.latencies_ms.len() < MAX_SAMPLES_PER_BUCKET {
            self.latencies_ms.push(latency_ms);
        }
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    buckets: HashMap<i64, VecDeque<Bucket>>,
    last_alert: HashMap<(i64, AlertKind), DateTime<Utc>>,
}

/// Shared per-profile counters. Every update happens under one lock.
pub struct MonitoringService {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
    alerts: mpsc::Sender<Alert>,
}

impl MonitoringService {
    pub fn new(config: MonitorConfig, alerts: mpsc::Sender<Alert>) -> Self {
        Self {
            config,
            state: Mutex::new(MonitorState::default()),
            alerts,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bucket_secs(&self) -> i64 {
        self.config.bucket.as_secs().max(1) as i64
    }

    fn bucket_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.bucket_secs();
        let ts = at.timestamp();
        DateTime::from_timestamp(ts - ts.rem_euclid(secs), 0).unwrap_or(at)
    }

    pub fn record_outcome(&self, profile_id: i64, outcome: Outcome) {
        self.record_outcome_at(profile_id, outcome, Utc::now());
    }

    pub fn record_outcome_at(&self, profile_id: i64, outcome: Outcome, at: DateTime<Utc>) {
        let start = self.bucket_start(at);
        let mut state = self.lock();
        let buckets = state.buckets.entry(profile_id).or_default();

        let idx = match buckets.iter().rposition(|b| b.start <= start) {
            Some(i) if buckets[i].start == start => i,
            Some(i) => {
                buckets.insert(i + 1, Bucket::new(start));
                i + 1
            }
            None => {
                buckets.push_front(Bucket::new(start));
                0
            }
        };
        buckets[idx].apply(outcome);
    }

    /// Stats across every profile for the trailing `window`.
    pub fn get_stats(&self, window: Duration) -> DeliveryStats {
        self.get_stats_at(window, Utc::now())
    }

    pub fn get_stats_at(&self, window: Duration, now: DateTime<Utc>) -> DeliveryStats {
        let state = self.lock();
        self.collect(state.buckets.values(), window, now)
    }

    pub fn profile_stats(&self, profile_id: i64, window: Duration) -> DeliveryStats {
        self.profile_stats_at(profile_id, window, Utc::now())
    }

    pub fn profile_stats_at(&self, profile_id: i64, window: Duration, now: DateTime<Utc>) -> DeliveryStats {
        let state = self.lock();
        self.collect(state.buckets.get(&profile_id), window, now)
    }

    /// Per-profile stats for every profile with data in the window.
    pub fn all_profile_stats(&self, window: Duration) -> BTreeMap<i64, DeliveryStats> {
        let now = Utc::now();
        let state = self.lock();
        state
            .buckets
            .iter()
            .map(|(id, buckets)| (*id, self.collect(Some(buckets), window, now)))
            .filter(|(_, stats)| stats.successes + stats.failures + stats.skips > 0)
            .collect()
    }

    fn collect<'a>(
        &self,
        profiles: impl IntoIterator<Item = &'a VecDeque<Bucket>>,
        window: Duration,
        now: DateTime<Utc>,
    ) -> DeliveryStats {
        let from = now - ChronoDuration::seconds(window.as_secs() as i64);
        let width = ChronoDuration::seconds(self.bucket_secs());
        let mut counters = OutcomeCounters::default();
        let mut latencies = Vec::new();

        for buckets in profiles {
            for b in buckets.iter().filter(|b| b.start + width > from && b.start <= now) {
                counters.add(&b.counters);
                latencies.extend_from_slice(&b.latencies_ms);
            }
        }
        DeliveryStats::from_parts(&counters, &latencies)
    }

    /// Close finished buckets and drop the ones that left the window.
    ///
    /// Returns a snapshot for every bucket that closed since the last roll.
    pub fn roll(&self, now: DateTime<Utc>) -> Vec<MonitoringSnapshot> {
        let width = ChronoDuration::seconds(self.bucket_secs());
        let horizon = now - ChronoDuration::seconds(self.config.window.as_secs() as i64);
        let mut snapshots = Vec::new();
        let mut state = self.lock();

        for (profile_id, buckets) in state.buckets.iter_mut() {
            for b in buckets.iter_mut().filter(|b| !b.persisted && b.start + width <= now) {
                b.persisted = true;
                snapshots.push(MonitoringSnapshot {
                    profile_id: *profile_id,
                    window_start: b.start,
                    window_seconds: self.bucket_secs(),
                    counters: b.counters,
                    latency_digest: digest_latencies(&b.latencies_ms)
                        .map(|td| encode_digest(&td))
                        .unwrap_or_default(),
                });
            }
            while buckets.front().is_some_and(|b| b.persisted && b.start + width <= horizon) {
                buckets.pop_front();
            }
        }
        state.buckets.retain(|_, buckets| !buckets.is_empty());
        state.last_alert.retain(|_, at| *at > horizon);

        snapshots
    }

    /// Check every profile against the thresholds and raise alerts.
    ///
    /// Each (profile, alert type) fires at most once per window.
    pub fn evaluate_alerts(&self, now: DateTime<Utc>) -> Vec<Alert> {
        let cooldown = ChronoDuration::seconds(self.config.window.as_secs() as i64);
        let mut raised = Vec::new();
        {
            let mut state = self.lock();
            let mut candidates = Vec::new();

            for (profile_id, buckets) in &state.buckets {
                let stats = self.collect(Some(buckets), self.config.window, now);
                let deliveries = stats.successes + stats.failures;

                if deliveries >= self.config.min_samples
                    && stats.success_rate < self.config.success_rate_threshold
                {
                    candidates.push(Alert {
                        kind: AlertKind::PostbackSuccessRateLow,
                        profile_id: *profile_id,
                        details: json!({
                            "success_rate": stats.success_rate,
                            "threshold": self.config.success_rate_threshold,
                            "successes": stats.successes,
                            "failures": stats.failures,
                            "window_secs": self.config.window.as_secs(),
                        }),
                        raised_at: now,
                    });
                }
                if stats.failures >= self.config.failure_spike {
                    candidates.push(Alert {
                        kind: AlertKind::PostbackFailed,
                        profile_id: *profile_id,
                        details: json!({
                            "reason": "failure_spike",
                            "failures": stats.failures,
                            "window_secs": self.config.window.as_secs(),
                        }),
                        raised_at: now,
                    });
                }
            }

            for alert in candidates {
                let key = (alert.profile_id, alert.kind);
                let cooling = state
                    .last_alert
                    .get(&key)
                    .is_some_and(|last| now - *last < cooldown);
                if !cooling {
                    state.last_alert.insert(key, now);
                    raised.push(alert);
                }
            }
        }

        for alert in &raised {
            self.raise(alert.clone());
        }
        raised
    }

    /// Hand an alert to the notification channel without blocking.
    pub fn raise(&self, alert: Alert) {
        tracing::warn!(
            profile_id = alert.profile_id,
            kind = ?alert.kind,
            details = %alert.details,
            "Raising postback alert"
        );
        if let Err(e) = self.alerts.try_send(alert) {
            tracing::error!("Failed to enqueue alert: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(config: MonitorConfig) -> (MonitoringService, mpsc::Receiver<Alert>) {
        let (tx, rx) = mpsc::channel(16);
        (MonitoringService::new(config, tx), rx)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_skips_excluded_from_success_rate() {
        let (m, _rx) = service(MonitorConfig::default());
        let now = at(0);
        for _ in 0..3 {
            m.record_outcome_at(1, Outcome::Success { latency_ms: 40.0 }, now);
        }
        m.record_outcome_at(1, Outcome::Failure { latency_ms: 900.0 }, now);
        m.record_outcome_at(1, Outcome::Skipped(SkipReason::MissingCredential), now);
        m.record_outcome_at(2, Outcome::Skipped(SkipReason::HardBlock), now);
        m.record_outcome_at(2, Outcome::Skipped(SkipReason::SoftBlock), now);

        let stats = m.get_stats_at(Duration::from_secs(3600), now);
        assert_eq!(stats.successes, 3);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.skips, 3);
        assert_eq!(stats.credential_skips, 1);
        assert!((stats.success_rate - 0.75).abs() < 1e-9);
        assert_eq!(stats.hard_blocks, 1);
        assert_eq!(stats.soft_blocks, 1);
        assert_eq!(stats.total_blocks, 2);
        assert!((stats.block_rate - 2.0 / 7.0).abs() < 1e-9);
        assert!(stats.latency_p50_ms.is_some());

        let only_blocks = m.profile_stats_at(2, Duration::from_secs(3600), now);
        assert_eq!(only_blocks.success_rate, 1.0);
        assert_eq!(only_blocks.latency_p50_ms, None);
    }

    #[test]
    fn test_window_excludes_old_buckets() {
        let (m, _rx) = service(MonitorConfig::default());
        m.record_outcome_at(1, Outcome::Failure { latency_ms: 1.0 }, at(0));
        m.record_outcome_at(1, Outcome::Success { latency_ms: 1.0 }, at(7200));

        let recent = m.get_stats_at(Duration::from_secs(3600), at(7200));
        assert_eq!((recent.successes, recent.failures), (1, 0));
        let wide = m.get_stats_at(Duration::from_secs(3 * 3600), at(7200));
        assert_eq!((wide.successes, wide.failures), (1, 1));
    }

    #[test]
    fn test_out_of_order_outcomes_keep_buckets_sorted() {
        let (m, _rx) = service(MonitorConfig::default());
        m.record_outcome_at(1, Outcome::Success { latency_ms: 1.0 }, at(900));
        m.record_outcome_at(1, Outcome::Success { latency_ms: 1.0 }, at(0));
        m.record_outcome_at(1, Outcome::Success { latency_ms: 1.0 }, at(400));

        let state = m.lock();
        let starts: Vec<_> = state.buckets[&1].iter().map(|b| b.start).collect();
        assert_eq!(starts.len(), 3);
        assert!(starts.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_roll_snapshots_closed_buckets_once() {
        let (m, _rx) = service(MonitorConfig::default());
        m.record_outcome_at(1, Outcome::Success { latency_ms: 10.0 }, at(0));
        m.record_outcome_at(1, Outcome::Success { latency_ms: 12.0 }, at(320));

        let snaps = m.roll(at(310));
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].counters.successes, 1);
        assert_eq!(snaps[0].window_seconds, 300);
        assert!(!snaps[0].latency_digest.is_empty());
        assert!(m.roll(at(320)).is_empty());

        // Far in the future everything closes and then ages out.
        assert_eq!(m.roll(at(100_000)).len(), 1);
        assert!(m.lock().buckets.is_empty());
    }

    #[test]
    fn test_low_success_rate_alert_with_cooldown() {
        let config = MonitorConfig {
            min_samples: 4,
            ..Default::default()
        };
        let (m, mut rx) = service(config);
        let now = at(0);
        m.record_outcome_at(7, Outcome::Success { latency_ms: 5.0 }, now);
        for _ in 0..3 {
            m.record_outcome_at(7, Outcome::Failure { latency_ms: 5.0 }, now);
        }
        // Below min samples: never judged.
        m.record_outcome_at(8, Outcome::Failure { latency_ms: 5.0 }, now);

        let raised = m.evaluate_alerts(now);
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].kind, AlertKind::PostbackSuccessRateLow);
        assert_eq!(raised[0].profile_id, 7);
        assert_eq!(rx.try_recv().unwrap().profile_id, 7);

        assert!(m.evaluate_alerts(at(60)).is_empty());
    }

    #[test]
    fn test_failure_spike_alert() {
        let config = MonitorConfig {
            failure_spike: 3,
            min_samples: 1000,
            ..Default::default()
        };
        let (m, _rx) = service(config);
        for _ in 0..3 {
            m.record_outcome_at(2, Outcome::Failure { latency_ms: 5.0 }, at(0));
        }
        let raised = m.evaluate_alerts(at(1));
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].kind, AlertKind::PostbackFailed);
        assert_eq!(raised[0].details["reason"], "failure_spike");
    }

    #[test]
    fn test_blocks_do_not_trigger_alerts() {
        let config = MonitorConfig {
            min_samples: 1,
            failure_spike: 1,
            ..Default::default()
        };
        let (m, _rx) = service(config);
        for _ in 0..20 {
            m.record_outcome_at(3, Outcome::Skipped(SkipReason::HardBlock), at(0));
        }
        assert!(m.evaluate_alerts(at(1)).is_empty());
    }
}
