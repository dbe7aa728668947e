// src/pipeline/poll.rs

//! Station feed polling entry points.

use tokio::time::{Instant, MissedTickBehavior};

use super::PipelineContext;
use crate::error::{AppError, Result};
use crate::models::{PollOutcome, PollReport};
use crate::services::StationStatePoller;

/// One scheduler tick against `poller`, writing snapshots to the context store.
pub async fn run_station_poll_cycle(
    ctx: &PipelineContext,
    poller: &StationStatePoller,
) -> Result<PollReport> {
    let report = poller.run_cycle(ctx.store.as_ref()).await?;
    if let Some(degraded) = report.degraded() {
        log::warn!("{degraded}; next poll in {:?}", report.next_interval);
    }
    Ok(report)
}

/// Tick `poller` on its base interval until cancelled or `max_cycles`
/// polls have run. Ticks that arrive while a poll is in flight or before a
/// widened interval has elapsed are skipped, never queued.
///
/// Returns the number of polls performed.
pub async fn run_poller(
    ctx: &PipelineContext,
    poller: &StationStatePoller,
    max_cycles: Option<usize>,
) -> Result<usize> {
    let mut ticker = tokio::time::interval(ctx.config.poller.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    log::info!(
        "Polling {} every {:?}",
        ctx.config.poller.feed_url,
        ctx.config.poller.interval()
    );

    let mut polls = 0;
    while max_cycles.is_none_or(|max| polls < max) {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !poller.is_due(Instant::now()) {
            continue;
        }
        match run_station_poll_cycle(ctx, poller).await {
            Ok(PollReport {
                outcome: PollOutcome::Skipped { .. },
                ..
            }) => {}
            Ok(_) => polls += 1,
            Err(AppError::Cancelled) => break,
            Err(error) => return Err(error),
        }
    }
    log::info!("Poller stopped after {polls} polls");
    Ok(polls)
}
