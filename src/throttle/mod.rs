// src/throttle/mod.rs

//! Shared politeness and resilience policy for every network call.
//!
//! A [`ResourceGovernor`] combines three things:
//!
//! - a global semaphore capping in-flight calls,
//! - one GCRA rate limiter per target host,
//! - a retry schedule with per-call timeouts.
//!
//! A caller takes a permit, then a rate token for its host. If the host has
//! no token yet the permit is handed back while the caller waits, so a
//! throttled host never holds slots other hosts could use. Every wait races
//! the run-level cancellation token.

mod retry;

pub use retry::RetryPolicy;

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::{GovernorConfig, RateLimitConfig};
use crate::utils::http::{HttpClient, HttpRequest, HttpResponse};
use crate::utils::url::get_domain;

/// Proof that a caller holds a concurrency slot and a rate token.
///
/// The slot is released when dropped.
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

pub struct ResourceGovernor {
    config: GovernorConfig,
    semaphore: Arc<Semaphore>,
    limiters: Mutex<HashMap<String, Arc<DefaultDirectRateLimiter>>>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl ResourceGovernor {
    pub fn new(config: &GovernorConfig, cancel: CancellationToken) -> Self {
        Self {
            config: config.clone(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            limiters: Mutex::new(HashMap::new()),
            retry: RetryPolicy::from(config.retry),
            cancel,
        }
    }

    /// Default retry policy for this governor.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Configured global concurrency cap.
    pub fn max_concurrent(&self) -> usize {
        self.config.max_concurrent.max(1)
    }

    /// Currently free concurrency slots.
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a concurrency slot holding a rate token for `url`'s host.
    pub async fn acquire(&self, url: &str) -> Result<Slot> {
        let host = get_domain(url).unwrap_or_default();
        let limiter = self.limiter_for(&host)?;
        loop {
            let permit = tokio::select! {
                _ = self.cancel.cancelled() => return Err(AppError::Cancelled),
                permit = Arc::clone(&self.semaphore).acquire_owned() => {
                    permit.map_err(|_| AppError::Cancelled)?
                }
            };

            match limiter.check() {
                Ok(()) => return Ok(Slot { _permit: permit }),
                Err(not_until) => {
                    // Rate limit exceeded: delay the caller, never surface it.
                    drop(permit);
                    let wait = not_until
                        .wait_time_from(DefaultClock::default().now())
                        .max(Duration::from_millis(1));
                    log::debug!("Rate limit reached for {host}; waiting {wait:?} for a token");
                    self.sleep(wait).await?;
                }
            }
        }
    }

    /// Run `op` under the default retry policy.
    pub async fn execute<T, F, Fut>(&self, url: &str, op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with(url, self.retry, op).await
    }

    /// Run `op` with a slot per attempt, a per-call timeout and retries.
    ///
    /// `op` receives the 0-based attempt number. Only transient errors are
    /// retried; a timeout counts as a transient failure of that attempt.
    pub async fn execute_with<T, F, Fut>(&self, url: &str, policy: RetryPolicy, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.config.request_timeout();
        let mut attempt = 0;
        loop {
            let slot = self.acquire(url).await?;
            let result = tokio::select! {
                _ = self.cancel.cancelled() => Err(AppError::Cancelled),
                outcome = tokio::time::timeout(timeout, op(attempt)) => match outcome {
                    Ok(result) => result,
                    Err(_) => Err(AppError::transient(
                        url,
                        format!("timed out after {}s", timeout.as_secs_f64()),
                    )),
                },
            };
            drop(slot);

            match result {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && policy.allows_retry(attempt) => {
                    let delay = policy.delay(attempt);
                    log::warn!(
                        "Attempt {}/{} for {} failed: {}. Retrying in {:?}",
                        attempt + 1,
                        policy.max_attempts,
                        url,
                        error,
                        delay
                    );
                    self.sleep(delay).await?;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Governed GET that fails on non-2xx statuses.
    pub async fn get(
        &self,
        client: &dyn HttpClient,
        url: &str,
        policy: RetryPolicy,
    ) -> Result<HttpResponse> {
        self.execute_with(url, policy, |_| async move {
            client
                .execute(HttpRequest::get(url))
                .await?
                .error_for_status()
        })
        .await
    }

    /// Sleep unless the run is cancelled first.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(AppError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    fn limiter_for(&self, host: &str) -> Result<Arc<DefaultDirectRateLimiter>> {
        let mut limiters = self
            .limiters
            .lock()
            .map_err(|_| AppError::store("rate limiter table poisoned"))?;
        if let Some(limiter) = limiters.get(host) {
            return Ok(Arc::clone(limiter));
        }
        let quota = quota_for(self.config.rate_for(host))?;
        let limiter = Arc::new(RateLimiter::direct(quota));
        limiters.insert(host.to_string(), Arc::clone(&limiter));
        Ok(limiter)
    }
}

/// `requests` per `window` with at most `burst` cells back to back.
fn quota_for(rate: &RateLimitConfig) -> Result<Quota> {
    let requests = rate.requests.max(1);
    let period = (rate.window() / requests).max(Duration::from_millis(1));
    let burst = NonZeroU32::new(rate.burst.max(1))
        .ok_or_else(|| AppError::config("rate burst must be > 0"))?;
    Quota::with_period(period)
        .map(|q| q.allow_burst(burst))
        .ok_or_else(|| AppError::config(format!("invalid rate period {period:?}")))
}
