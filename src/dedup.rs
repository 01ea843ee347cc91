//! Duplicate detection by content hash.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::backlog::Backlog;
use crate::identify::ContentId;
use crate::model::WorkItem;
use crate::telemetry::metrics;

/// Answer from the dedup index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Unique,
    /// Same content already forwarded, in flight, or analysed in the window.
    Duplicate { hash: String },
    /// Couldn't tell (unknown content or a failed lookup); forward anyway.
    Unchecked,
}

#[derive(Debug, Clone)]
pub struct DedupIndex {
    /// `None` dedups across all time.
    window: Option<chrono::Duration>,
}

impl DedupIndex {
    pub fn new(window: Option<chrono::Duration>) -> Self {
        Self { window }
    }

    /// Oldest activity that still counts at `now`. A window reaching past
    /// the start of the calendar covers all time.
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.window.and_then(|w| now.checked_sub_signed(w))
    }

    /// Register `content` for `item` and decide whether it's a duplicate.
    ///
    /// Best-effort: a lookup failure is logged and reported as `Unchecked`,
    /// so an unavailable store never blocks forwarding.
    pub async fn check(
        &self,
        backlog: &dyn Backlog,
        item: &WorkItem,
        content: &ContentId,
    ) -> Verdict {
        let Some(hash) = content.hash() else {
            return Verdict::Unchecked;
        };

        let now = Utc::now();
        match backlog
            .register_hash(item.id, hash, now, self.since(now))
            .await
        {
            Ok(true) => Verdict::Duplicate {
                hash: hash.to_string(),
            },
            Ok(false) => Verdict::Unique,
            Err(e) => {
                metrics::dedup_check_failures().add(1, &[]);
                warn!(id = %item.id, hash, error = %e, "dedup check failed, forwarding anyway");
                Verdict::Unchecked
            }
        }
    }

    /// Human-readable window for log and error messages.
    pub fn describe_window(&self) -> String {
        match self.window {
            Some(w) => format!("{}m", w.num_minutes()),
            None => "all time".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_sets_the_horizon() {
        let now = Utc::now();
        let index = DedupIndex::new(Some(chrono::Duration::minutes(60)));
        assert_eq!(index.since(now), Some(now - chrono::Duration::minutes(60)));
        assert_eq!(index.describe_window(), "60m");
        assert_eq!(DedupIndex::new(None).since(now), None);
    }

    #[test]
    fn window_past_the_calendar_covers_all_time() {
        let index = DedupIndex::new(Some(chrono::Duration::MAX));
        assert_eq!(index.since(Utc::now()), None);
    }
}
