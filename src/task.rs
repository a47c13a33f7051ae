//! Verification job scheduling.
//!
//! Jobs run on a bounded worker pool pulling from a queue: the worker count
//! is the concurrency limit, and jobs beyond it wait — explicit backpressure
//! so outbound image and RPC endpoints are never hammered without bound.
//! Transient failures retry with exponential backoff; terminal failures
//! report immediately. Cancellation is cooperative, honored only at retry
//! boundaries, never while a sub-check's network call is in flight.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::VerifierConfig;
use crate::image::FetchImage;
use crate::registry::ReadRegistry;
use crate::verifier::{TargetStatus, VerificationJob, VerificationResult, Verifier};

/// Opaque task identifier assigned by the queue.
pub type TaskId = u64;

/// Lifecycle of a verification task. `Pending` is both the initial queued
/// state and the parked state between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// A verification task as persisted at the external boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    /// First blocking reason on failure; all per-target results are
    /// retained in `results` regardless.
    pub error_message: Option<String>,
    pub results: Vec<VerificationResult>,
    /// Attempts made so far, including the current one.
    pub attempts: u32,
}

/// Write-side contract towards the external store: every task transition is
/// pushed through here.
pub trait TaskStore: Send + Sync {
    fn persist(&self, task: &Task);
}

/// In-memory task store, also usable as a test double for the external
/// relational store.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<TaskId, Task>>,
}

impl MemoryTaskStore {
    pub fn task(&self, id: TaskId) -> Option<Task> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }
}

impl TaskStore for MemoryTaskStore {
    fn persist(&self, task: &Task) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task.id, task.clone());
    }
}

/// What the retry policy decides after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Park the job and re-run it after the delay.
    Retry(Duration),
    /// Report the failure as final.
    Terminal,
}

/// Retry knobs, lifted out of [`VerifierConfig`] for the workers.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    fn from_config(config: &VerifierConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.backoff_base_ms),
        }
    }
}

/// Pure retry decision: no I/O, independently testable.
///
/// `attempt` counts attempts already made (starting at 1). Only transient
/// failures are ever retried, with delay `base * 2^(attempt-1)` — strictly
/// increasing until `max_attempts` is exhausted.
pub fn next_action(attempt: u32, max_attempts: u32, base_delay: Duration, transient: bool) -> Action {
    if !transient || attempt >= max_attempts {
        return Action::Terminal;
    }
    Action::Retry(base_delay * 2u32.saturating_pow(attempt.saturating_sub(1)))
}

/// Derive the job-level verdict from the joined per-target results.
///
/// `Completed` iff every target verified. A failure is only retryable when
/// nothing failed terminally: any terminal per-target failure makes the
/// verdict final even if a sibling also hit a transient error.
pub fn aggregate(results: &[VerificationResult]) -> (TaskStatus, Option<String>, bool) {
    let mut first_blocking: Option<String> = None;
    let mut any_terminal = false;
    let mut any_transient = false;
    for result in results {
        if result.status == TargetStatus::Verified {
            continue;
        }
        if first_blocking.is_none() {
            let reason = result
                .error
                .clone()
                .or_else(|| result.details.first().map(ToString::to_string))
                .unwrap_or_else(|| format!("{:?} failed", result.status));
            first_blocking = Some(format!("{:?}: {reason}", result.target));
        }
        if result.is_transient_failure() {
            any_transient = true;
        } else {
            any_terminal = true;
        }
    }
    match first_blocking {
        None => (TaskStatus::Completed, None, false),
        Some(reason) => (TaskStatus::Failed, Some(reason), any_transient && !any_terminal),
    }
}

/// Bounded-concurrency job queue in front of a [`Verifier`].
pub struct JobQueue {
    sender: mpsc::UnboundedSender<(TaskId, VerificationJob)>,
    store: Arc<MemoryTaskStore>,
    sink: Arc<dyn TaskStore>,
    cancelled: Arc<Mutex<HashSet<TaskId>>>,
    next_id: Mutex<TaskId>,
}

impl JobQueue {
    /// Spawn `config.worker_count` workers and return the queue handle.
    pub fn start<R, F>(
        config: &VerifierConfig,
        verifier: Arc<Verifier<R, F>>,
        sink: Arc<dyn TaskStore>,
    ) -> Self
    where
        R: ReadRegistry + 'static,
        F: FetchImage + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel::<(TaskId, VerificationJob)>();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let store = Arc::new(MemoryTaskStore::default());
        let cancelled = Arc::new(Mutex::new(HashSet::new()));

        for worker in 0..config.worker_count.max(1) {
            let receiver = receiver.clone();
            let verifier = verifier.clone();
            let store = store.clone();
            let sink = sink.clone();
            let cancelled = cancelled.clone();
            let policy = RetryPolicy::from_config(config);
            tokio::spawn(async move {
                loop {
                    let job = receiver.lock().await.recv().await;
                    let Some((id, job)) = job else {
                        break;
                    };
                    debug!("worker {worker} picked up task {id}");
                    run_task(
                        id,
                        &job,
                        verifier.as_ref(),
                        store.as_ref(),
                        sink.as_ref(),
                        &cancelled,
                        policy,
                    )
                    .await;
                }
            });
        }

        Self {
            sender,
            store,
            sink,
            cancelled,
            next_id: Mutex::new(1),
        }
    }

    /// Enqueue a job. Returns immediately; the task starts as `Pending`.
    pub fn submit(&self, job: VerificationJob) -> TaskId {
        let id = {
            let mut next = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
            let id = *next;
            *next += 1;
            id
        };
        let task = Task {
            id,
            status: TaskStatus::Pending,
            error_message: None,
            results: Vec::new(),
            attempts: 0,
        };
        self.store.persist(&task);
        self.sink.persist(&task);
        // Send fails only if every worker is gone.
        if self.sender.send((id, job)).is_err() {
            let task = Task {
                id,
                status: TaskStatus::Failed,
                error_message: Some("queue is shut down".into()),
                results: Vec::new(),
                attempts: 0,
            };
            self.store.persist(&task);
            self.sink.persist(&task);
        }
        id
    }

    /// Request cooperative cancellation. Takes effect at the next retry
    /// boundary; a task already in terminal state is unaffected.
    pub fn cancel(&self, id: TaskId) {
        self.cancelled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);
    }

    /// Current snapshot of a task.
    pub fn task(&self, id: TaskId) -> Option<Task> {
        self.store.task(id)
    }
}

fn is_cancelled(cancelled: &Mutex<HashSet<TaskId>>, id: TaskId) -> bool {
    cancelled
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .contains(&id)
}

async fn run_task<R: ReadRegistry, F: FetchImage>(
    id: TaskId,
    job: &VerificationJob,
    verifier: &Verifier<R, F>,
    store: &MemoryTaskStore,
    sink: &dyn TaskStore,
    cancelled: &Mutex<HashSet<TaskId>>,
    policy: RetryPolicy,
) {
    let mut task = match store.task(id) {
        Some(task) => task,
        None => return,
    };

    loop {
        if is_cancelled(cancelled, id) {
            info!("task {id} cancelled before attempt {}", task.attempts + 1);
            task.status = TaskStatus::Failed;
            task.error_message = Some("cancelled".into());
            break;
        }

        task.attempts += 1;
        task.status = TaskStatus::Running;
        store.persist(&task);
        sink.persist(&task);

        let results = verifier.run_job(job).await;
        let (status, error_message, transient) = aggregate(&results);
        task.results = results;
        task.status = status;
        task.error_message = error_message;

        if status == TaskStatus::Completed {
            break;
        }
        match next_action(task.attempts, policy.max_attempts, policy.base_delay, transient) {
            Action::Terminal => break,
            Action::Retry(delay) => {
                warn!(
                    "task {id} attempt {} failed transiently, retrying in {delay:?}: {}",
                    task.attempts,
                    task.error_message.as_deref().unwrap_or("unknown")
                );
                task.status = TaskStatus::Pending;
                store.persist(&task);
                sink.persist(&task);
                tokio::time::sleep(delay).await;
            }
        }
    }

    info!(
        "task {id} finished {:?} after {} attempt(s)",
        task.status, task.attempts
    );
    store.persist(&task);
    sink.persist(&task);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FieldMismatch;
    use std::time::SystemTime;

    fn result(status: TargetStatus) -> VerificationResult {
        VerificationResult {
            target: crate::verifier::TargetKind::App,
            status,
            details: vec![FieldMismatch::new("rtmr0", "aa", "bb")],
            error: Some("boom".into()),
            checked_at: SystemTime::now(),
        }
    }

    #[test]
    fn test_next_action_terminal_on_non_transient() {
        assert_eq!(
            next_action(1, 5, Duration::from_millis(100), false),
            Action::Terminal
        );
    }

    #[test]
    fn test_next_action_exhausts_attempts() {
        assert_eq!(
            next_action(3, 3, Duration::from_millis(100), true),
            Action::Terminal
        );
    }

    #[test]
    fn test_next_action_backoff_is_increasing() {
        let base = Duration::from_millis(100);
        let mut previous = Duration::ZERO;
        for attempt in 1..5 {
            match next_action(attempt, 10, base, true) {
                Action::Retry(delay) => {
                    assert!(delay > previous, "attempt {attempt}: {delay:?}");
                    previous = delay;
                }
                Action::Terminal => panic!("attempt {attempt} should retry"),
            }
        }
        assert_eq!(previous, Duration::from_millis(800));
    }

    #[test]
    fn test_aggregate_all_verified() {
        let results = vec![result(TargetStatus::Verified)];
        let (status, error, transient) = aggregate(&results);
        assert_eq!(status, TaskStatus::Completed);
        assert!(error.is_none());
        assert!(!transient);
    }

    #[test]
    fn test_aggregate_keeps_first_blocking_reason() {
        let results = vec![
            result(TargetStatus::Verified),
            result(TargetStatus::MeasurementMismatch),
            result(TargetStatus::Unreachable),
        ];
        let (status, error, transient) = aggregate(&results);
        assert_eq!(status, TaskStatus::Failed);
        assert!(error.unwrap().contains("App"));
        // A terminal sibling failure makes the verdict final.
        assert!(!transient);
    }

    #[test]
    fn test_aggregate_transient_only_is_retryable() {
        let results = vec![result(TargetStatus::Verified), result(TargetStatus::Unreachable)];
        let (status, _, transient) = aggregate(&results);
        assert_eq!(status, TaskStatus::Failed);
        assert!(transient);
    }
}
