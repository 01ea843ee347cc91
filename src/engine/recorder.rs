//! Outcome recording: applies the retry policy, then writes the outcome back
//! to the backlog under the worker's claim.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::backlog::Backlog;
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::model::{Outcome, WorkItem};

#[derive(Debug, Clone)]
pub struct OutcomeRecorder {
    max_attempts: Option<u32>,
    backoff: Duration,
    backoff_max: Duration,
}

impl OutcomeRecorder {
    pub fn new(max_attempts: Option<u32>, backoff: Duration, backoff_max: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
            backoff_max,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.retry_backoff,
            config.retry_backoff_max,
        )
    }

    /// Final outcome for `item`: a retry past the attempt limit becomes dead.
    pub fn resolve(&self, item: &WorkItem, outcome: Outcome) -> Outcome {
        match outcome {
            Outcome::Retry { reason }
                if self.max_attempts.is_some_and(|max| item.attempts >= max) =>
            {
                Outcome::Dead {
                    reason: format!(
                        "retry limit reached after {} attempts: {reason}",
                        item.attempts
                    ),
                    duplicate_of: None,
                }
            }
            other => other,
        }
    }

    /// Earliest reclaim time after a failed attempt:
    /// `now + min(backoff * 2^(attempts-1), backoff_max)`.
    ///
    /// `None` when backoff is off. A delay past the end of the calendar is a
    /// configuration error.
    pub fn retry_after(&self, attempts: u32, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        if self.backoff.is_zero() {
            return Ok(None);
        }
        let exp = attempts.saturating_sub(1).min(31);
        let delay = self
            .backoff
            .checked_mul(1u32 << exp)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max);
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .map(Some)
            .ok_or_else(|| Error::Config(format!("retry backoff of {delay:?} is out of range")))
    }

    /// Apply the retry policy and write the outcome. Returns the outcome
    /// actually recorded and the updated item.
    pub async fn record(
        &self,
        backlog: &dyn Backlog,
        worker: &str,
        item: &WorkItem,
        outcome: Outcome,
    ) -> Result<(Outcome, WorkItem)> {
        let outcome = self.resolve(item, outcome);
        let retry_after = match outcome {
            Outcome::Retry { .. } => self.retry_after(item.attempts, Utc::now())?,
            _ => None,
        };
        let updated = backlog
            .record(item.id, worker, &outcome, retry_after)
            .await?;
        Ok((outcome, updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Status, WorkId};

    fn item(attempts: u32) -> WorkItem {
        let now = Utc::now();
        WorkItem {
            id: WorkId(3),
            event_type: crate::model::ARTIFACT_OBSERVED.to_string(),
            source_ip: "10.0.0.1".into(),
            filename_hint: None,
            stored_name_hint: None,
            logged_hash: None,
            status: Status::Claimed,
            lease_until: None,
            claimed_by: Some("w".into()),
            attempts,
            retry_after: None,
            content_hash: None,
            task_ref: None,
            engine_response: None,
            duplicate_of: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn retry() -> Outcome {
        Outcome::Retry {
            reason: "engine returned HTTP 503".into(),
        }
    }

    #[test]
    fn retry_below_limit_stays_retry() {
        let r = OutcomeRecorder::new(Some(3), Duration::ZERO, Duration::ZERO);
        assert_eq!(r.resolve(&item(2), retry()), retry());
    }

    #[test]
    fn retry_at_limit_becomes_dead() {
        let r = OutcomeRecorder::new(Some(3), Duration::ZERO, Duration::ZERO);
        match r.resolve(&item(3), retry()) {
            Outcome::Dead {
                reason,
                duplicate_of,
            } => {
                assert_eq!(
                    reason,
                    "retry limit reached after 3 attempts: engine returned HTTP 503"
                );
                assert_eq!(duplicate_of, None);
            }
            other => panic!("expected dead, got {other:?}"),
        }
    }

    #[test]
    fn unbounded_retries() {
        let r = OutcomeRecorder::new(None, Duration::ZERO, Duration::ZERO);
        assert_eq!(r.resolve(&item(1_000), retry()), retry());
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let r = OutcomeRecorder::new(None, Duration::from_secs(10), Duration::from_secs(60));
        let now = Utc::now();
        let secs = |attempts| (r.retry_after(attempts, now).unwrap().unwrap() - now).num_seconds();
        assert_eq!(secs(1), 10);
        assert_eq!(secs(2), 20);
        assert_eq!(secs(3), 40);
        assert_eq!(secs(4), 60);
        assert_eq!(secs(40), 60);
    }

    #[test]
    fn zero_backoff_means_immediately_reclaimable() {
        let r = OutcomeRecorder::new(None, Duration::ZERO, Duration::from_secs(60));
        assert_eq!(r.retry_after(5, Utc::now()).unwrap(), None);
    }

    #[test]
    fn backoff_past_the_calendar_is_an_error() {
        let huge = Duration::from_secs(10_000_000_000_000);
        let r = OutcomeRecorder::new(None, huge, huge);
        let err = r.retry_after(1, Utc::now()).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
    }
}
