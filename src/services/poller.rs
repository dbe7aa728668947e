// src/services/poller.rs

//! Station state poller.
//!
//! One explicit state machine (`idle -> polling -> idle | degraded`) driven
//! by an external scheduler tick. [`StationStatePoller::run_cycle`] never
//! overlaps with itself: a tick that arrives while a cycle is in flight is
//! reported as skipped instead of queued.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::error::{AppError, Result};
use crate::models::{
    PollOutcome, PollReport, PollSkip, PollerConfig, PollerState, StationFeed, StationSnapshot,
};
use crate::storage::SnapshotSink;
use crate::throttle::ResourceGovernor;
use crate::utils::http::HttpClient;

/// Externally visible poller status.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollStatus {
    pub state: PollerState,
    pub consecutive_failures: u32,
    /// Polls whose feed `last_updated` did not advance
    pub stale_polls: u32,
    pub interval: Duration,
    pub next_due: Option<Instant>,
}

/// State owned by the single in-flight cycle.
#[derive(Debug, Default)]
struct Session {
    consecutive_failures: u32,
    stale_polls: u32,
    last_polled_at: Option<DateTime<Utc>>,
    last_feed_update: Option<DateTime<Utc>>,
}

pub struct StationStatePoller {
    config: PollerConfig,
    governor: Arc<ResourceGovernor>,
    client: Arc<dyn HttpClient>,
    session: tokio::sync::Mutex<Session>,
    status: Mutex<PollStatus>,
}

impl StationStatePoller {
    pub fn new(
        config: &PollerConfig,
        governor: Arc<ResourceGovernor>,
        client: Arc<dyn HttpClient>,
    ) -> Self {
        Self {
            config: config.clone(),
            governor,
            client,
            session: tokio::sync::Mutex::new(Session::default()),
            status: Mutex::new(PollStatus {
                state: PollerState::Idle,
                consecutive_failures: 0,
                stale_polls: 0,
                interval: config.interval(),
                next_due: None,
            }),
        }
    }

    pub fn status(&self) -> Result<PollStatus> {
        self.status
            .lock()
            .map(|s| *s)
            .map_err(|_| AppError::store("poller status lock poisoned"))
    }

    /// Whether a tick at `now` should poll: nothing in flight and the
    /// current (possibly widened) interval has elapsed.
    pub fn is_due(&self, now: Instant) -> bool {
        self.status()
            .map(|s| s.state != PollerState::Polling && s.next_due.is_none_or(|due| now >= due))
            .unwrap_or(false)
    }

    /// One scheduler tick: poll if due and nothing is in flight.
    pub async fn run_cycle<S>(&self, sink: &S) -> Result<PollReport>
    where
        S: SnapshotSink + ?Sized,
    {
        let Ok(mut session) = self.session.try_lock() else {
            log::debug!("Poll cycle still in flight; skipping tick");
            return self.skipped(PollSkip::Overrun);
        };
        if !self.is_due(Instant::now()) {
            return self.skipped(PollSkip::NotDue);
        }
        self.poll(&mut session, sink).await
    }

    /// Poll immediately, ignoring the interval but never overlapping.
    pub async fn poll_now<S>(&self, sink: &S) -> Result<PollReport>
    where
        S: SnapshotSink + ?Sized,
    {
        let Ok(mut session) = self.session.try_lock() else {
            return self.skipped(PollSkip::Overrun);
        };
        self.poll(&mut session, sink).await
    }

    async fn poll<S>(&self, session: &mut Session, sink: &S) -> Result<PollReport>
    where
        S: SnapshotSink + ?Sized,
    {
        let started = Instant::now();
        let previous = self.publish(|s| s.state = PollerState::Polling)?;

        let polled_at = next_poll_timestamp(session.last_polled_at);
        session.last_polled_at = Some(polled_at);

        let outcome = match self.fetch_feed().await {
            Ok(feed) => {
                let outcome = self.record(session, &feed, polled_at, sink).await;
                if outcome.is_err() {
                    // Structural failure: restore the pre-cycle state.
                    self.publish(|s| *s = previous)?;
                }
                outcome?
            }
            Err(AppError::Cancelled) => {
                self.publish(|s| *s = previous)?;
                return Err(AppError::Cancelled);
            }
            Err(error) => {
                log::warn!("Station feed poll failed: {error}");
                PollOutcome::Failure {
                    error: error.to_string(),
                }
            }
        };

        let success = matches!(outcome, PollOutcome::Success { .. });
        let was_degraded = previous.state == PollerState::Degraded;
        if success {
            if was_degraded {
                log::info!(
                    "Station feed recovered after {} failed polls",
                    session.consecutive_failures
                );
            }
            session.consecutive_failures = 0;
        } else {
            session.consecutive_failures += 1;
        }

        let failures = session.consecutive_failures;
        let degraded = failures >= self.config.failure_threshold;
        if degraded && !was_degraded {
            log::warn!("Station feed degraded after {failures} consecutive failures");
        }
        let state = if degraded {
            PollerState::Degraded
        } else {
            PollerState::Idle
        };
        let interval = self.interval_after(failures);
        let stale_polls = session.stale_polls;

        self.publish(|s| {
            s.state = state;
            s.consecutive_failures = failures;
            s.stale_polls = stale_polls;
            s.interval = interval;
            s.next_due = Some(started + interval);
        })?;

        Ok(PollReport {
            polled_at,
            outcome,
            state,
            consecutive_failures: failures,
            next_interval: interval,
        })
    }

    async fn fetch_feed(&self) -> Result<StationFeed> {
        let policy = self
            .governor
            .retry_policy()
            .with_attempts(self.config.attempts_per_poll);
        let response = self
            .governor
            .get(self.client.as_ref(), &self.config.feed_url, policy)
            .await?;
        StationFeed::parse(&response.body)
    }

    /// Normalize one feed response and append its snapshots.
    async fn record<S>(
        &self,
        session: &mut Session,
        feed: &StationFeed,
        polled_at: DateTime<Utc>,
        sink: &S,
    ) -> Result<PollOutcome>
    where
        S: SnapshotSink + ?Sized,
    {
        let feed_updated = feed.last_updated_at();
        let stale = match (session.last_feed_update, feed_updated) {
            (Some(previous), Some(current)) => current <= previous,
            _ => false,
        };
        if stale {
            session.stale_polls += 1;
            log::warn!(
                "Station feed last_updated has not advanced ({} stale polls)",
                session.stale_polls
            );
        }
        if let Some(current) = feed_updated {
            session.last_feed_update = session.last_feed_update.max(Some(current));
        }

        let mut seen = HashSet::new();
        let snapshots: Vec<StationSnapshot> = feed
            .data
            .stations
            .iter()
            .filter_map(|entry| entry.normalize(polled_at, feed_updated))
            .filter(|snapshot| seen.insert(snapshot.station_id.clone()))
            .collect();
        let dropped = feed.data.stations.len() - snapshots.len();
        if dropped > 0 {
            log::debug!("Dropped {dropped} station entries without a usable id");
        }

        sink.append_snapshots(&snapshots).await?;
        log::info!("Recorded {} station snapshots at {}", snapshots.len(), polled_at);

        Ok(PollOutcome::Success {
            snapshots: snapshots.len(),
            dropped,
            stale,
        })
    }

    /// `base * multiplier^(failures - threshold + 1)` once degraded, capped.
    fn interval_after(&self, failures: u32) -> Duration {
        let base = self.config.interval();
        if failures < self.config.failure_threshold {
            return base;
        }
        let exponent = (failures - self.config.failure_threshold + 1).min(32) as i32;
        let widened = base.as_secs_f64() * self.config.degraded_multiplier.powi(exponent);
        let cap = self.config.max_interval_secs.max(self.config.interval_secs) as f64;
        Duration::from_secs_f64(widened.min(cap).max(base.as_secs_f64()))
    }

    fn skipped(&self, cause: PollSkip) -> Result<PollReport> {
        let status = self.status()?;
        Ok(PollReport {
            polled_at: Utc::now(),
            outcome: PollOutcome::Skipped { cause },
            state: status.state,
            consecutive_failures: status.consecutive_failures,
            next_interval: status.interval,
        })
    }

    /// Apply `update` to the shared status and return the value before it.
    fn publish(&self, update: impl FnOnce(&mut PollStatus)) -> Result<PollStatus> {
        let mut status = self
            .status
            .lock()
            .map_err(|_| AppError::store("poller status lock poisoned"))?;
        let before = *status;
        update(&mut status);
        Ok(before)
    }
}

/// Wall-clock poll time, bumped past the previous one when the clock stalls.
fn next_poll_timestamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(last) if now <= last => last + chrono::Duration::milliseconds(1),
        _ => now,
    }
}
