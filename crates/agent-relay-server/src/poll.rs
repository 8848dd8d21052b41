//! Poll-until-condition loop bounded by a per-connection deadline.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::stream::StreamContext;

/// Maximum deviation of a connection's age from the configured value, in percent.
pub const MAX_CONNECTION_AGE_JITTER_PERCENT: u64 = 5;

/// One tick of a polling session.
#[async_trait]
pub trait PollCondition: Send {
    type Error: Send;

    /// Returns `true` when polling should stop.
    async fn check(&mut self) -> Result<bool, Self::Error>;
}

/// How a poll loop ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The condition reported completion.
    Done,
    /// The deadline passed or the stream was cancelled. This is how a
    /// healthy stream normally ends.
    Stopped,
}

/// Evaluate `condition` now and then every `interval` until it reports
/// completion, fails, `deadline` passes or `ctx` is cancelled.
///
/// Cancellation and the deadline both interrupt a running check.
pub async fn poll_until<C>(
    ctx: &StreamContext,
    interval: Duration,
    deadline: Instant,
    condition: &mut C,
) -> Result<PollOutcome, C::Error>
where
    C: PollCondition + ?Sized,
{
    loop {
        let done = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Ok(PollOutcome::Stopped),
            _ = tokio::time::sleep_until(deadline) => return Ok(PollOutcome::Stopped),
            res = condition.check() => res?,
        };
        if done {
            return Ok(PollOutcome::Done);
        }

        tokio::select! {
            biased;
            _ = ctx.cancelled() => return Ok(PollOutcome::Stopped),
            _ = tokio::time::sleep_until(deadline) => return Ok(PollOutcome::Stopped),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// `d` shifted by a random amount within `±jitter_percent`.
pub fn duration_with_jitter(d: Duration, jitter_percent: u64) -> Duration {
    let range = d.as_nanos() * u128::from(jitter_percent) / 100;
    if range == 0 {
        return d;
    }
    let offset = random_u128() % (2 * range);
    let jittered = d.as_nanos() + offset - range;
    Duration::from_nanos(u64::try_from(jittered).unwrap_or(u64::MAX))
}

/// Deadline for a stream opened now. Computed once per stream so that
/// reconnects of many agents spread out over time.
pub fn connection_deadline(max_connection_age: Duration) -> Instant {
    Instant::now() + duration_with_jitter(max_connection_age, MAX_CONNECTION_AGE_JITTER_PERCENT)
}

fn random_u128() -> u128 {
    uuid::Uuid::new_v4().as_u128()
}
