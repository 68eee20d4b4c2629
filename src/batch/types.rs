use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{ImagePayload, Operation, ResponseData, ValidationError};
use crate::rpc::{FailureKind, RpcError};

/// One unit of caller work
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    pub operation: Operation,
    pub input: ImagePayload,
}

impl Task {
    pub fn new(id: impl Into<String>, operation: Operation, input: ImagePayload) -> Self {
        Self {
            id: id.into(),
            operation,
            input,
        }
    }

    /// Creates a task with a random id.
    pub fn generated(operation: Operation, input: ImagePayload) -> Self {
        Self::new(Uuid::new_v4().to_string(), operation, input)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.operation.validate(&self.input)
    }
}

/// Lifecycle of a task within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Dispatched,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Terminal record of an attempted task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub task_id: String,
    /// Position of the task in the submitted list
    pub index: usize,
    pub status: TaskStatus,
    pub result: Option<ResponseData>,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub duration: Duration,
}

impl TaskOutcome {
    pub fn completed(
        index: usize,
        task_id: impl Into<String>,
        result: ResponseData,
        duration: Duration,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            index,
            status: TaskStatus::Completed,
            result: Some(result),
            error: None,
            failure_kind: None,
            duration,
        }
    }

    pub fn failed(
        index: usize,
        task_id: impl Into<String>,
        error: &RpcError,
        duration: Duration,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            index,
            status: TaskStatus::Failed,
            result: None,
            error: Some(error.to_string()),
            failure_kind: Some(error.kind()),
            duration,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// Live counters of a batch run.
///
/// `completed + failed + in_flight + pending == total` holds for every published value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchStatus {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_flight: usize,
    pub pending: usize,
    pub progress_percent: u8,
    /// Set once a cancelled run has stopped dispatching
    pub cancelled: bool,
}

impl BatchStatus {
    pub fn new(total: usize) -> Self {
        let mut status = Self {
            total,
            pending: total,
            ..Self::default()
        };
        status.refresh_progress();
        status
    }

    /// Tasks with a terminal outcome.
    pub fn settled(&self) -> usize {
        self.completed + self.failed
    }

    pub fn is_consistent(&self) -> bool {
        self.completed + self.failed + self.in_flight + self.pending == self.total
    }

    pub fn is_finished(&self) -> bool {
        self.in_flight == 0 && (self.pending == 0 || self.cancelled)
    }

    pub(crate) fn refresh_progress(&mut self) {
        self.progress_percent = progress_percent(self.settled(), self.total);
    }
}

/// `round(100 * settled / total)`, with an empty batch counting as done.
pub fn progress_percent(settled: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let settled = settled.min(total) as u128;
    let total = total as u128;
    ((200 * settled + total) / (2 * total)) as u8
}

/// Batch execution configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Slots available to a run when the caller does not pick a concurrency
    pub concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get(),
        }
    }
}
