//! Sliding-window batch scheduler.
//!
//! At most `concurrency` tasks are outstanding at any time. Each settlement immediately frees
//! its slot for the next pending task, so a run takes roughly `ceil(total / concurrency)`
//! slow-task durations. All in-flight sends are driven by the `run` future itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::aggregation::{ResultAggregator, TaskEvent};
use super::dispatcher::TaskDispatcher;
use super::progress::{ProgressHub, Subscription};
use super::types::{BatchConfig, BatchStatus, Task, TaskOutcome};
use crate::rpc::RpcError;
use crate::Result;

/// Errors that prevent a run from starting
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Concurrency must be at least 1, got {0}")]
    InvalidConcurrency(usize),

    #[error("A batch is already running on this scheduler")]
    AlreadyRunning,
}

/// Stops dispatch of a running batch. Cloneable so it can be handed to other tasks.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

struct RunGuard<'a> {
    running: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn acquire(running: &'a AtomicBool) -> std::result::Result<Self, SchedulerError> {
        running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SchedulerError::AlreadyRunning)?;
        Ok(Self { running })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Runs batches of tasks against a [`TaskDispatcher`].
pub struct BatchScheduler<D: TaskDispatcher + ?Sized> {
    dispatcher: Arc<D>,
    config: BatchConfig,
    progress: ProgressHub,
    cancel: CancelHandle,
    running: AtomicBool,
}

impl<D: TaskDispatcher + ?Sized> std::fmt::Debug for BatchScheduler<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("config", &self.config)
            .field("progress", &self.progress)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("running", &self.is_running())
            .finish()
    }
}

impl<D: TaskDispatcher + ?Sized> BatchScheduler<D> {
    pub fn new(dispatcher: Arc<D>) -> Self {
        Self {
            dispatcher,
            config: BatchConfig::default(),
            progress: ProgressHub::new(),
            cancel: CancelHandle::default(),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_config(mut self, config: BatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn progress(&self) -> &ProgressHub {
        &self.progress
    }

    /// Calls `callback` with every status published by subsequent runs.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&BatchStatus) + Send + Sync + 'static,
    {
        self.progress.subscribe(callback)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Stops dispatching new tasks of the active run. In-flight tasks still finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Latest published status.
    pub fn status(&self) -> BatchStatus {
        self.progress.latest()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Runs `tasks` with the configured concurrency.
    pub async fn run_with_config(&self, tasks: Vec<Task>) -> Result<Vec<TaskOutcome>> {
        self.run(tasks, self.config.concurrency).await
    }

    /// Runs `tasks` with at most `concurrency` outstanding at once.
    ///
    /// Outcomes come back in submission order. Tasks left undispatched by a cancellation
    /// have no outcome. Individual task failures never fail the run.
    #[instrument(skip(self, tasks), fields(task_count = tasks.len()))]
    pub async fn run(&self, tasks: Vec<Task>, concurrency: usize) -> Result<Vec<TaskOutcome>> {
        if concurrency == 0 {
            return Err(SchedulerError::InvalidConcurrency(concurrency).into());
        }
        let _running = RunGuard::acquire(&self.running)?;
        self.cancel.reset();

        let batch_start = Instant::now();
        let total = tasks.len();
        let mut aggregator = ResultAggregator::new(total);
        self.progress.publish(aggregator.status());

        if total == 0 {
            info!("No tasks to run in batch");
            return Ok(Vec::new());
        }

        info!(
            total_tasks = total,
            concurrency = concurrency,
            "Starting batch run"
        );

        let mut queue = tasks.into_iter().enumerate();
        let mut in_flight = FuturesUnordered::new();

        loop {
            while in_flight.len() < concurrency && !self.cancel.is_cancelled() {
                let Some((index, task)) = queue.next() else {
                    break;
                };

                if let Err(e) = task.validate() {
                    let error = RpcError::from(e);
                    warn!(
                        task_id = %task.id,
                        index = index,
                        error = %error,
                        "Task rejected before dispatch"
                    );
                    let outcome = TaskOutcome::failed(index, task.id, &error, Duration::ZERO);
                    self.progress
                        .publish(aggregator.apply(TaskEvent::Rejected(outcome)));
                    continue;
                }

                debug!(
                    task_id = %task.id,
                    index = index,
                    operation = %task.operation.kind(),
                    "Dispatching task"
                );
                self.progress.publish(aggregator.apply(TaskEvent::Dispatched));
                in_flight.push(self.execute(index, task));
            }

            match in_flight.next().await {
                Some(outcome) => {
                    self.progress
                        .publish(aggregator.apply(TaskEvent::Finished(outcome)));
                }
                None => break,
            }
        }

        if self.cancel.is_cancelled() {
            let status = aggregator.apply(TaskEvent::Cancelled);
            self.progress.publish(status);
            info!(
                settled = status.settled(),
                not_dispatched = status.pending,
                "Batch run cancelled"
            );
        }

        let summary = aggregator.summary();
        info!(
            total_tasks = summary.total,
            completed = summary.completed,
            failed = summary.failed,
            not_attempted = summary.not_attempted,
            success_rate = format!("{:.2}%", summary.success_rate),
            batch_duration_ms = batch_start.elapsed().as_millis(),
            avg_task_duration_ms = summary.mean_duration.as_millis(),
            "Batch run completed"
        );

        if summary.success_rate < 80.0 && summary.total > 5 {
            warn!(
                success_rate = format!("{:.2}%", summary.success_rate),
                failed = summary.failed,
                "High failure rate detected in batch run"
            );
        }

        Ok(aggregator.into_outcomes())
    }

    async fn execute(&self, index: usize, task: Task) -> TaskOutcome {
        let start = Instant::now();
        let result = self.dispatcher.dispatch(&task).await;
        let duration = start.elapsed();

        match result {
            Ok(data) => {
                debug!(
                    task_id = %task.id,
                    duration_ms = duration.as_millis(),
                    "Task completed"
                );
                TaskOutcome::completed(index, task.id, data, duration)
            }
            Err(e) => {
                warn!(
                    task_id = %task.id,
                    kind = ?e.kind(),
                    duration_ms = duration.as_millis(),
                    error = %e,
                    "Task failed"
                );
                TaskOutcome::failed(index, task.id, &e, duration)
            }
        }
    }
}
