//! Retry backoff and the time-ordered heap of jobs waiting to be retried.
//!
//! Retries are data, not timers: the dispatcher polls [`RetryScheduler::pop_due`]
//! once per tick and re-enqueues whatever has waited out its backoff.

use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

use super::{JobId, JobMetadata};

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    Fixed {
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
    /// `initial + increment * retry_count`
    Linear {
        #[serde(with = "humantime_serde")]
        initial: Duration,
        #[serde(with = "humantime_serde")]
        increment: Duration,
        #[serde(with = "humantime_serde")]
        max: Duration,
    },
    /// `min(max, initial * multiplier^retry_count)`
    Exponential {
        #[serde(with = "humantime_serde")]
        initial: Duration,
        multiplier: f64,
        #[serde(with = "humantime_serde")]
        max: Duration,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(300),
        }
    }
}

impl BackoffStrategy {
    /// Create a fixed backoff strategy.
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    /// Create a doubling backoff starting at `initial`, capped at `max`.
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self::Exponential {
            initial,
            multiplier: 2.0,
            max,
        }
    }

    /// Delay before the retry numbered `retry_count` (the incremented count).
    ///
    /// With the default strategy retry 1 waits 2s, retry 2 waits 4s, and so on.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Linear {
                initial,
                increment,
                max,
            } => increment
                .checked_mul(retry_count)
                .and_then(|step| initial.checked_add(step))
                .map_or(*max, |delay| delay.min(*max)),
            Self::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
                let secs = initial.as_secs_f64() * multiplier.powi(exponent);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(secs.max(0.0))
                }
            }
        }
    }

    /// Largest delay this strategy can produce.
    pub fn cap(&self) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Linear { max, .. } | Self::Exponential { max, .. } => *max,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

/// Min-heap of retrying jobs keyed by due time.
///
/// A job id appears at most once; removal is lazy, so stale heap entries are
/// skipped when they surface.
#[derive(Debug, Default)]
pub struct RetryScheduler {
    heap: BinaryHeap<Reverse<(Instant, u64, JobId)>>,
    waiting: HashMap<JobId, (u64, JobMetadata)>,
    seq: u64,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a job until `due`. Hands the job back if it already has a retry outstanding.
    pub fn schedule(&mut self, job: JobMetadata, due: Instant) -> Result<(), JobMetadata> {
        if self.waiting.contains_key(&job.job_id) {
            return Err(job);
        }
        self.seq += 1;
        let id = job.job_id;
        self.heap.push(Reverse((due, self.seq, id)));
        self.waiting.insert(id, (self.seq, job));
        Ok(())
    }

    /// Remove and return every job whose backoff has elapsed, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<JobMetadata> {
        let mut due = Vec::new();
        while let Some(Reverse((at, seq, id))) = self.heap.peek().copied() {
            if at > now {
                break;
            }
            self.heap.pop();
            if let Some((live_seq, _)) = self.waiting.get(&id) {
                if *live_seq == seq {
                    if let Some((_, job)) = self.waiting.remove(&id) {
                        due.push(job);
                    }
                }
            }
        }
        due
    }

    /// When the earliest live retry becomes due.
    pub fn next_due(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, seq, id))) = self.heap.peek().copied() {
            match self.waiting.get(&id) {
                Some((live_seq, _)) if *live_seq == seq => return Some(at),
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Drop a job's outstanding retry.
    pub fn remove(&mut self, id: &JobId) -> Option<JobMetadata> {
        self.waiting.remove(id).map(|(_, job)| job)
    }

    pub fn get(&self, id: &JobId) -> Option<&JobMetadata> {
        self.waiting.get(id).map(|(_, job)| job)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.waiting.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobMetadata> {
        self.waiting.values().map(|(_, job)| job)
    }

    /// Remove every waiting job.
    pub fn drain(&mut self) -> Vec<JobMetadata> {
        self.heap.clear();
        self.waiting.drain().map(|(_, (_, job))| job).collect()
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobPriority;

    fn job(job_type: &str) -> JobMetadata {
        JobMetadata::new(job_type, JobPriority::Normal, 3)
    }

    #[test]
    fn test_backoff_exponential() {
        let backoff = BackoffStrategy::default();
        assert_eq!(backoff.delay_for(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(8));
        assert_eq!(backoff.delay_for(20), Duration::from_secs(300));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_backoff_fixed() {
        let backoff = BackoffStrategy::fixed(Duration::from_secs(10));
        assert_eq!(backoff.delay_for(0), Duration::from_secs(10));
        assert_eq!(backoff.delay_for(5), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_linear() {
        let backoff = BackoffStrategy::Linear {
            initial: Duration::from_secs(5),
            increment: Duration::from_secs(3),
            max: Duration::from_secs(12),
        };
        assert_eq!(backoff.delay_for(0), Duration::from_secs(5));
        assert_eq!(backoff.delay_for(1), Duration::from_secs(8));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(11));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(12));
        assert_eq!(backoff.cap(), Duration::from_secs(12));
    }

    #[test]
    fn test_backoff_deserialize_humantime() {
        let backoff: BackoffStrategy = serde_json::from_str(
            r#"{"strategy": "exponential", "initial": "250ms", "multiplier": 3.0, "max": "1m"}"#,
        )
        .unwrap();
        assert_eq!(backoff.delay_for(1), Duration::from_millis(750));
        assert_eq!(backoff.cap(), Duration::from_secs(60));
    }

    #[test]
    fn test_pop_due_in_time_order() {
        let mut scheduler = RetryScheduler::new();
        let now = Instant::now();
        let late = job("late");
        let early = job("early");
        scheduler.schedule(late, now + Duration::from_secs(10)).unwrap();
        scheduler.schedule(early, now + Duration::from_secs(1)).unwrap();

        assert!(scheduler.pop_due(now).is_empty());
        assert_eq!(scheduler.next_due(), Some(now + Duration::from_secs(1)));

        let due = scheduler.pop_due(now + Duration::from_secs(10));
        let types: Vec<&str> = due.iter().map(|j| j.job_type.as_str()).collect();
        assert_eq!(types, vec!["early", "late"]);
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.next_due(), None);
    }

    #[test]
    fn test_one_outstanding_retry_per_job() {
        let mut scheduler = RetryScheduler::new();
        let now = Instant::now();
        let job = job("email");
        scheduler.schedule(job.clone(), now).unwrap();
        let rejected = scheduler.schedule(job.clone(), now).unwrap_err();
        assert_eq!(rejected.job_id, job.job_id);
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn test_removed_retry_never_fires() {
        let mut scheduler = RetryScheduler::new();
        let now = Instant::now();
        let job = job("document");
        let id = job.job_id;
        scheduler.schedule(job, now).unwrap();

        assert!(scheduler.remove(&id).is_some());
        assert_eq!(scheduler.next_due(), None);
        assert!(scheduler.pop_due(now + Duration::from_secs(1)).is_empty());
    }
}
