//! Folds task events into batch status and the final ordered outcome list.
//!
//! Nothing here touches concurrency; the scheduler feeds events in the order they happen
//! and publishes whatever status comes back.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types::{BatchStatus, TaskOutcome};

/// A transition of one task within a run.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// A pending task took a slot
    Dispatched,
    /// An in-flight task settled
    Finished(TaskOutcome),
    /// A pending task failed without ever taking a slot
    Rejected(TaskOutcome),
    /// Dispatch stopped; remaining pending tasks will not be attempted
    Cancelled,
}

/// Aggregates task events for one run.
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    status: BatchStatus,
    outcomes: Vec<Option<TaskOutcome>>,
}

impl ResultAggregator {
    pub fn new(total: usize) -> Self {
        Self {
            status: BatchStatus::new(total),
            outcomes: vec![None; total],
        }
    }

    pub fn status(&self) -> BatchStatus {
        self.status
    }

    /// Applies one event and returns the resulting status.
    ///
    /// A second outcome for the same task index, or one outside the batch, is ignored.
    pub fn apply(&mut self, event: TaskEvent) -> BatchStatus {
        match event {
            TaskEvent::Dispatched => {
                if self.status.pending > 0 {
                    self.status.pending -= 1;
                    self.status.in_flight += 1;
                }
            }
            TaskEvent::Finished(outcome) => {
                if self.record(outcome) {
                    if self.status.in_flight > 0 {
                        self.status.in_flight -= 1;
                    } else {
                        self.status.pending = self.status.pending.saturating_sub(1);
                    }
                }
            }
            TaskEvent::Rejected(outcome) => {
                if self.record(outcome) {
                    self.status.pending = self.status.pending.saturating_sub(1);
                }
            }
            TaskEvent::Cancelled => self.status.cancelled = true,
        }
        self.status.refresh_progress();
        self.status
    }

    fn record(&mut self, outcome: TaskOutcome) -> bool {
        let Some(slot) = self.outcomes.get_mut(outcome.index) else {
            return false;
        };
        if slot.is_some() {
            return false;
        }
        if outcome.is_completed() {
            self.status.completed += 1;
        } else {
            self.status.failed += 1;
        }
        *slot = Some(outcome);
        true
    }

    pub fn summary(&self) -> BatchSummary {
        let recorded: Vec<&TaskOutcome> = self.outcomes.iter().flatten().collect();
        let attempted = recorded.len();
        let total_duration: Duration = recorded.iter().map(|o| o.duration).sum();

        BatchSummary {
            total: self.status.total,
            completed: self.status.completed,
            failed: self.status.failed,
            not_attempted: self.status.total - attempted,
            success_rate: if attempted > 0 {
                self.status.completed as f64 / attempted as f64 * 100.0
            } else {
                0.0
            },
            mean_duration: if attempted > 0 {
                total_duration / attempted as u32
            } else {
                Duration::ZERO
            },
        }
    }

    /// Outcomes in submission order; tasks that were never attempted are absent.
    pub fn into_outcomes(self) -> Vec<TaskOutcome> {
        self.outcomes.into_iter().flatten().collect()
    }
}

/// Folds a sequence of events for a batch of `total` tasks into its status.
pub fn fold_status<I>(total: usize, events: I) -> BatchStatus
where
    I: IntoIterator<Item = TaskEvent>,
{
    let mut aggregator = ResultAggregator::new(total);
    for event in events {
        aggregator.apply(event);
    }
    aggregator.status()
}

/// End-of-run figures, logged by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub not_attempted: usize,
    /// Percentage of attempted tasks that completed
    pub success_rate: f64,
    pub mean_duration: Duration,
}
