//! Per-pair delivery state machine and the retry engine.
//!
//! Every (conversion, profile) pair moves through
//! `pending -> in_flight -> {success, failed_retryable, failed_terminal, skipped}`
//! and every attempt writes exactly one row to the delivery log. Retry state
//! is written in the same transaction as that row.

use super::http::{build_client, send_postback};
use super::retry::RetryPolicy;
use super::DeliveryError;
use crate::db::{
    ConversionEvent, DbError, DeliveryAttempt, DeliveryState, PostbackProfile, RetryState,
    RetryStatus, RetryUpdate, SkipReason, Store,
};
use crate::monitor::{Alert, AlertKind, MonitoringService, Outcome};
use crate::postback::{resolve_profiles, should_deliver, GateDecision, ResponseVerdict, TrackerRegistry};

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Concurrent outbound calls.
    pub workers: usize,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    /// Due retries loaded per scheduler tick.
    pub retry_batch: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            request_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            retry_batch: 100,
        }
    }
}

type PairKey = (i64, i64);

/// Marks a pair as in flight until dropped.
struct PairClaim {
    key: PairKey,
    set: Arc<Mutex<HashSet<PairKey>>>,
}

impl PairClaim {
    fn acquire(set: &Arc<Mutex<HashSet<PairKey>>>, key: PairKey) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key);
        inserted.then(|| Self {
            key,
            set: set.clone(),
        })
    }
}

impl Drop for PairClaim {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Result of one finished attempt before it is written.
struct Settled {
    state: DeliveryState,
    built_url: String,
    response_code: Option<u16>,
    response_body: Option<String>,
    skipped_reason: Option<SkipReason>,
    error_message: Option<String>,
    latency: Option<Duration>,
}

impl Settled {
    fn skipped(built_url: String, reason: SkipReason, message: Option<String>) -> Self {
        Self {
            state: DeliveryState::Skipped,
            built_url,
            response_code: None,
            response_body: None,
            skipped_reason: Some(reason),
            error_message: message,
            latency: None,
        }
    }
}

/// Fans conversions out to their profiles and drives retries.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<Store>,
    trackers: Arc<TrackerRegistry>,
    monitor: Arc<MonitoringService>,
    client: reqwest::Client,
    workers: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<PairKey>>>,
    config: Arc<DispatcherConfig>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<Store>,
        trackers: Arc<TrackerRegistry>,
        monitor: Arc<MonitoringService>,
        config: DispatcherConfig,
    ) -> Result<Self, DeliveryError> {
        let client = build_client(config.request_timeout)?;
        Ok(Self {
            store,
            trackers,
            monitor,
            client,
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            config: Arc::new(config),
        })
    }

    /// Store a conversion and dispatch it in the background.
    ///
    /// A conversion id that is already stored is not dispatched again. A
    /// store failure is logged and the conversion is dispatched anyway; its
    /// first attempts go out but any retries are dropped.
    pub fn ingest_event(&self, event: ConversionEvent) -> Option<JoinHandle<Vec<DeliveryAttempt>>> {
        match self.store.add_conversion(&event) {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(conversion_id = event.id, "Conversion already ingested, not dispatching");
                return None;
            }
            Err(e) => {
                tracing::error!(
                    conversion_id = event.id,
                    error = %e,
                    "Failed to store conversion; retries for it will be dropped"
                );
            }
        }

        let dispatcher = self.clone();
        Some(tokio::spawn(async move { dispatcher.dispatch(event).await }))
    }

    /// First attempt for every profile the conversion resolves to.
    ///
    /// Pairs run in parallel, bounded by the worker pool. Attempts are
    /// returned ordered by profile id.
    pub async fn dispatch(&self, event: ConversionEvent) -> Vec<DeliveryAttempt> {
        let profiles = match resolve_profiles(&self.store, &event) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(conversion_id = event.id, error = %e, "Failed to resolve profiles");
                return Vec::new();
            }
        };
        tracing::debug!(
            conversion_id = event.id,
            profiles = profiles.len(),
            "Dispatching conversion"
        );

        let event = Arc::new(event);
        let mut set = JoinSet::new();
        for profile in profiles {
            let dispatcher = self.clone();
            let event = event.clone();
            let max_attempts = self.config.retry.max_attempts_for(&profile);
            set.spawn(async move { dispatcher.attempt(&event, &profile, 1, max_attempts).await });
        }

        let mut attempts = collect(set).await;
        attempts.sort_by_key(|a| a.profile_id);
        attempts
    }

    /// Run one attempt for a pair and record it.
    ///
    /// Returns `None` if the pair already has an attempt in flight.
    pub async fn attempt(
        &self,
        event: &ConversionEvent,
        profile: &PostbackProfile,
        attempt_number: u32,
        max_attempts: u32,
    ) -> Option<DeliveryAttempt> {
        let claim = self.claim(event.id, profile.id)?;
        let attempt = self.run(event, profile, attempt_number, max_attempts).await;
        drop(claim);
        attempt
    }

    fn claim(&self, conversion_id: i64, profile_id: i64) -> Option<PairClaim> {
        let claim = PairClaim::acquire(&self.in_flight, (conversion_id, profile_id));
        if claim.is_none() {
            tracing::debug!(conversion_id, profile_id, "Attempt already in flight");
        }
        claim
    }

    async fn run(
        &self,
        event: &ConversionEvent,
        profile: &PostbackProfile,
        attempt_number: u32,
        max_attempts: u32,
    ) -> Option<DeliveryAttempt> {
        let settled = match should_deliver(profile, event) {
            GateDecision::Block(reason) => Settled::skipped(profile.endpoint_url.clone(), reason, None),
            GateDecision::Allow => self.send(event, profile).await?,
        };
        self.settle(event, profile, attempt_number, max_attempts, settled)
    }

    async fn send(&self, event: &ConversionEvent, profile: &PostbackProfile) -> Option<Settled> {
        let adapter = self.trackers.adapter(profile.tracker);
        let mapped = adapter.map_status(profile, event);
        let request = match adapter.build_request(profile, event, &mapped) {
            Ok(r) => r,
            Err(e) => {
                return Some(Settled::skipped(
                    profile.endpoint_url.clone(),
                    e.skip_reason(),
                    Some(e.to_string()),
                ))
            }
        };

        let _permit = match self.workers.acquire().await {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "Worker pool closed");
                return None;
            }
        };

        let (elapsed, result) = send_postback(&self.client, &request, self.config.request_timeout).await;
        let (state, response_code, response_body, error_message) = match result {
            Err(e) => (DeliveryState::FailedRetryable, None, None, Some(e.to_string())),
            Ok(resp) => {
                let (state, error) = match adapter.validate_response(resp.status, &resp.body) {
                    ResponseVerdict::Success => (DeliveryState::Success, None),
                    ResponseVerdict::Retryable(msg) => (DeliveryState::FailedRetryable, Some(msg)),
                    ResponseVerdict::Permanent(msg) => (DeliveryState::FailedTerminal, Some(msg)),
                };
                (state, Some(resp.status), Some(resp.body), error)
            }
        };

        Some(Settled {
            state,
            built_url: request.redacted_url,
            response_code,
            response_body,
            skipped_reason: None,
            error_message,
            latency: Some(elapsed),
        })
    }

    /// Decide the retry update, write the row, and report the outcome.
    fn settle(
        &self,
        event: &ConversionEvent,
        profile: &PostbackProfile,
        attempt_number: u32,
        max_attempts: u32,
        mut settled: Settled,
    ) -> Option<DeliveryAttempt> {
        let now = Utc::now();

        if settled.state == DeliveryState::FailedRetryable && attempt_number >= max_attempts {
            settled.state = DeliveryState::FailedTerminal;
            let reason = settled.error_message.take().unwrap_or_default();
            settled.error_message = Some(format!("attempts exhausted ({}): {}", max_attempts, reason));
        }

        let mut next_retry_at = None;
        let retry = if settled.state == DeliveryState::FailedRetryable {
            if self.is_cancelled(event.id, profile.id) {
                RetryUpdate::Clear
            } else {
                let at = self.config.retry.next_attempt_at(attempt_number, now);
                next_retry_at = Some(at);
                RetryUpdate::Schedule {
                    next_attempt_at: at,
                    attempts_made: attempt_number,
                    max_attempts,
                }
            }
        } else {
            RetryUpdate::Clear
        };

        let mut attempt = DeliveryAttempt {
            id: 0,
            profile_id: profile.id,
            conversion_id: event.id,
            built_url: settled.built_url,
            http_method: profile.http_method,
            attempt_number,
            response_code: settled.response_code,
            response_body: settled.response_body,
            outcome: settled.state.outcome(),
            state: settled.state,
            skipped_reason: settled.skipped_reason,
            error_message: settled.error_message,
            latency_ms: settled.latency.map(|d| d.as_millis() as i64),
            next_retry_at,
            created_at: now,
        };

        if let Err(e) = self.store.record_attempt(&mut attempt, &retry) {
            tracing::error!(
                conversion_id = event.id,
                profile_id = profile.id,
                attempt = attempt_number,
                error = %e,
                "Failed to record delivery attempt"
            );
        }

        self.report(&attempt, settled.latency);
        Some(attempt)
    }

    fn is_cancelled(&self, conversion_id: i64, profile_id: i64) -> bool {
        match self.store.get_retry_state(conversion_id, profile_id) {
            Ok(Some(state)) => state.status == RetryStatus::Cancelled,
            Ok(None) => false,
            Err(e) => {
                tracing::error!(conversion_id, profile_id, error = %e, "Failed to read retry state");
                false
            }
        }
    }

    fn report(&self, attempt: &DeliveryAttempt, latency: Option<Duration>) {
        let latency_ms = latency.map(|d| d.as_secs_f64() * 1000.0).unwrap_or(0.0);
        let outcome = match (attempt.state, attempt.skipped_reason) {
            (DeliveryState::Success, _) => Outcome::Success { latency_ms },
            (DeliveryState::Skipped, Some(reason)) => Outcome::Skipped(reason),
            (DeliveryState::Skipped, None) => Outcome::Skipped(SkipReason::InvalidTemplate),
            _ => Outcome::Failure { latency_ms },
        };
        self.monitor.record_outcome(attempt.profile_id, outcome);

        match attempt.state {
            DeliveryState::Success => tracing::info!(
                conversion_id = attempt.conversion_id,
                profile_id = attempt.profile_id,
                attempt = attempt.attempt_number,
                state = %attempt.state,
                "Postback delivered"
            ),
            DeliveryState::Skipped => tracing::info!(
                conversion_id = attempt.conversion_id,
                profile_id = attempt.profile_id,
                reason = ?attempt.skipped_reason,
                "Postback skipped"
            ),
            DeliveryState::FailedRetryable => tracing::warn!(
                conversion_id = attempt.conversion_id,
                profile_id = attempt.profile_id,
                attempt = attempt.attempt_number,
                next_retry_at = ?attempt.next_retry_at,
                error = ?attempt.error_message,
                "Postback failed, will retry"
            ),
            DeliveryState::FailedTerminal => {
                tracing::warn!(
                    conversion_id = attempt.conversion_id,
                    profile_id = attempt.profile_id,
                    attempt = attempt.attempt_number,
                    error = ?attempt.error_message,
                    "Postback failed permanently"
                );
                self.monitor.raise(Alert::new(
                    AlertKind::PostbackFailed,
                    attempt.profile_id,
                    json!({
                        "conversion_id": attempt.conversion_id,
                        "attempt": attempt.attempt_number,
                        "response_code": attempt.response_code,
                        "error": attempt.error_message,
                    }),
                ));
            }
        }
    }

    /// Run the next attempt for every retry due at `now`.
    ///
    /// Returns the number of attempts made.
    pub async fn process_due_retries(&self, now: DateTime<Utc>) -> Result<usize, DbError> {
        let due = self.store.due_retries(now, self.config.retry_batch)?;
        if due.is_empty() {
            return Ok(0);
        }
        tracing::debug!("Processing {} due retries", due.len());

        let mut set = JoinSet::new();
        for retry in due {
            let dispatcher = self.clone();
            set.spawn(async move { dispatcher.retry(retry).await });
        }
        Ok(collect(set).await.len())
    }

    async fn retry(&self, retry: RetryState) -> Option<DeliveryAttempt> {
        let claim = self.claim(retry.conversion_id, retry.profile_id)?;

        // The row may have advanced since it was loaded.
        match self.store.get_retry_state(retry.conversion_id, retry.profile_id) {
            Ok(Some(current))
                if current.status == RetryStatus::Pending
                    && current.attempts_made == retry.attempts_made => {}
            Ok(_) => return None,
            Err(e) => {
                tracing::error!(error = %e, "Failed to reload retry state");
                return None;
            }
        }

        let (event, profile) = match self.load_pair(&retry) {
            Ok(Some(pair)) => pair,
            Ok(None) => {
                if let Err(e) = self.store.delete_retry(retry.conversion_id, retry.profile_id) {
                    tracing::error!(error = %e, "Failed to drop retry");
                }
                return None;
            }
            Err(e) => {
                tracing::error!(
                    conversion_id = retry.conversion_id,
                    profile_id = retry.profile_id,
                    error = %e,
                    "Failed to load retry"
                );
                return None;
            }
        };

        let attempt = self
            .run(&event, &profile, retry.attempts_made + 1, retry.max_attempts)
            .await;
        drop(claim);
        attempt
    }

    /// The conversion and profile behind a retry, or `None` when the retry
    /// should be dropped.
    fn load_pair(&self, retry: &RetryState) -> Result<Option<(ConversionEvent, PostbackProfile)>, DbError> {
        let event = match self.store.get_conversion(retry.conversion_id) {
            Ok(e) => e,
            Err(DbError::NotFound) => {
                tracing::warn!(
                    conversion_id = retry.conversion_id,
                    profile_id = retry.profile_id,
                    attempts_made = retry.attempts_made,
                    "Dropping retry: conversion was never stored"
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        match self.store.get_profile(retry.profile_id) {
            Ok(p) if p.is_active => Ok(Some((event, p))),
            Ok(_) | Err(DbError::NotFound) => {
                tracing::info!(
                    conversion_id = retry.conversion_id,
                    profile_id = retry.profile_id,
                    "Dropping retry for missing or inactive profile"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Stop future retries for a pair. An attempt already in flight still
    /// completes and is recorded.
    pub fn cancel(&self, conversion_id: i64, profile_id: i64) -> Result<bool, DbError> {
        let cancelled = self.store.cancel_retry(conversion_id, profile_id)?;
        tracing::info!(conversion_id, profile_id, cancelled, "Retry cancelled");
        Ok(cancelled)
    }

    /// Restore retry rows lost before a restart from the delivery log.
    pub fn recover(&self, now: DateTime<Utc>) -> Result<usize, DbError> {
        let restored = self.store.rederive_retries(now, self.config.retry.max_attempts)?;
        if restored > 0 {
            tracing::info!("Restored {} retries from the delivery log", restored);
        }
        Ok(restored)
    }
}

async fn collect(mut set: JoinSet<Option<DeliveryAttempt>>) -> Vec<DeliveryAttempt> {
    let mut attempts = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Some(attempt)) => attempts.push(attempt),
            Ok(None) => {}
            Err(e) => tracing::error!("Delivery task failed: {}", e),
        }
    }
    attempts
}
