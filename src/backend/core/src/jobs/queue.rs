//! Bounded priority queue of PENDING jobs.
//!
//! Ordering is strictly by priority, then by enqueue sequence, so equal
//! priorities are served FIFO. Cancellation removes the job record and leaves
//! its heap slot behind to be skipped on pop.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use super::{JobId, JobMetadata, JobPriority};
use crate::error::{ConveyorError, Result};

/// Heap slot for a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueuedJob {
    priority: JobPriority,
    seq: u64,
    job_id: JobId,
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Queue depth broken down by priority.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub low: usize,
    pub normal: usize,
    pub high: usize,
    pub critical: usize,
}

/// Priority queue holding the PENDING jobs.
#[derive(Debug)]
pub struct PriorityQueue {
    heap: BinaryHeap<QueuedJob>,
    jobs: HashMap<JobId, (u64, JobMetadata)>,
    capacity: usize,
    seq: u64,
}

impl PriorityQueue {
    /// Create a queue that accepts at most `capacity` new submissions.
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            jobs: HashMap::new(),
            capacity,
            seq: 0,
        }
    }

    /// Enqueue a newly submitted job, rejecting it when the queue is full.
    pub fn push(&mut self, job: JobMetadata) -> Result<()> {
        if self.is_full() {
            return Err(ConveyorError::queue_full(self.capacity));
        }
        self.push_unbounded(job).map_err(|job| {
            ConveyorError::internal(format!("job {} is already queued", job.job_id))
        })
    }

    /// Enqueue without the capacity check. Used for retries, which are never dropped.
    ///
    /// Hands the job back if its id is already queued.
    pub fn push_unbounded(&mut self, job: JobMetadata) -> std::result::Result<(), JobMetadata> {
        if self.jobs.contains_key(&job.job_id) {
            return Err(job);
        }
        self.seq += 1;
        self.heap.push(QueuedJob {
            priority: job.priority,
            seq: self.seq,
            job_id: job.job_id,
        });
        self.jobs.insert(job.job_id, (self.seq, job));
        Ok(())
    }

    /// Dequeue the highest priority job.
    pub fn pop(&mut self) -> Option<JobMetadata> {
        while let Some(slot) = self.heap.pop() {
            let live = matches!(self.jobs.get(&slot.job_id), Some((seq, _)) if *seq == slot.seq);
            if live {
                return self.jobs.remove(&slot.job_id).map(|(_, job)| job);
            }
        }
        None
    }

    /// Remove a specific job, e.g. on cancellation.
    pub fn remove(&mut self, id: &JobId) -> Option<JobMetadata> {
        let removed = self.jobs.remove(id).map(|(_, job)| job);
        if self.jobs.is_empty() {
            self.heap.clear();
        }
        removed
    }

    pub fn get(&self, id: &JobId) -> Option<&JobMetadata> {
        self.jobs.get(id).map(|(_, job)| job)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id)
    }

    /// Queued jobs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &JobMetadata> {
        self.jobs.values().map(|(_, job)| job)
    }

    /// Remove every queued job, in dispatch order.
    pub fn drain(&mut self) -> Vec<JobMetadata> {
        let mut drained = Vec::with_capacity(self.jobs.len());
        while let Some(job) = self.pop() {
            drained.push(job);
        }
        self.heap.clear();
        drained
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            pending: self.jobs.len(),
            ..Default::default()
        };
        for (_, job) in self.jobs.values() {
            match job.priority {
                JobPriority::Low => stats.low += 1,
                JobPriority::Normal => stats.normal += 1,
                JobPriority::High => stats.high += 1,
                JobPriority::Critical => stats.critical += 1,
            }
        }
        stats
    }
}
