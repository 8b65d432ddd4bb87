//! Status polling state machine.
//!
//! A submitted job moves `Submitted -> Polling -> {Succeeded, Failed,
//! TimedOut, Aborted}`. [`PollMachine`] holds the transition rules and
//! does no I/O: the caller feeds it the elapsed time and each query
//! result, and it answers with a [`Transition`]. [`poll_until_terminal`]
//! drives the machine against a [`GenerationBackend`], sleeping between
//! iterations and honouring a [`CancellationToken`].
//!
//! Two limits are independent: the overall budget (wall-clock time since
//! submission, checked at the top of every iteration) and the burst
//! limit (consecutive failures, reset by any in-progress status).

use std::time::Duration;

use soulgen_core::job::{JobStatus, RemoteJobHandle, TaskSnapshot};
use soulgen_dashscope::backend::{BackendError, GenerationBackend};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{AbortCause, GenerationError};
use crate::retry::{BurstCounter, ErrorClass, RetryDecision, RetryPolicy};

/// Message reported when a FAILED job carries no message of its own.
const UNKNOWN_FAILURE_MESSAGE: &str = "unknown error";

/// Timing and retry parameters for one poll loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    /// Overall budget measured from submission.
    pub timeout: Duration,
    /// Wait between polls while the job is PENDING or RUNNING.
    pub poll_interval: Duration,
    /// Wait between submission and the first poll.
    pub initial_delay: Duration,
    /// Wait after an unrecognized status.
    pub unknown_status_delay: Duration,
    pub retry: RetryPolicy,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(10),
            initial_delay: Duration::from_secs(1),
            unknown_status_delay: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// Poll loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Submitted,
    Polling,
    Succeeded,
    Failed,
    TimedOut,
    Aborted,
}

/// What the driver should do after an observation.
#[derive(Debug)]
pub enum Transition {
    /// Remain in `Polling`; wait before the next query.
    Wait(Duration),
    /// The job succeeded.
    Succeeded(TaskSnapshot),
    /// The loop ends with an error (FAILED, TIMED_OUT or ABORTED).
    Stop(GenerationError),
}

/// Pure transition logic for one job's poll loop.
#[derive(Debug)]
pub struct PollMachine {
    task_id: RemoteJobHandle,
    settings: PollSettings,
    state: PollState,
    burst: BurstCounter,
    polls: u32,
    retries: u32,
    last_status: Option<JobStatus>,
}

impl PollMachine {
    pub fn new(task_id: RemoteJobHandle, settings: PollSettings) -> Self {
        Self {
            task_id,
            settings,
            state: PollState::Submitted,
            burst: BurstCounter::default(),
            polls: 0,
            retries: 0,
            last_status: None,
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    /// Number of status queries observed so far.
    pub fn polls(&self) -> u32 {
        self.polls
    }

    /// Number of waits taken because of a failed or unrecognized poll.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn last_status(&self) -> Option<JobStatus> {
        self.last_status
    }

    /// Check cancellation and the overall deadline before a query.
    ///
    /// Returns the terminal error if the loop must stop; otherwise moves
    /// to `Polling` and returns `None`.
    pub fn begin_iteration(&mut self, elapsed: Duration, cancelled: bool) -> Option<GenerationError> {
        if cancelled {
            self.state = PollState::Aborted;
            return Some(GenerationError::PollingAborted {
                task_id: self.task_id.clone(),
                attempts: self.polls,
                elapsed,
                cause: AbortCause::Cancelled,
            });
        }

        if elapsed > self.settings.timeout {
            self.state = PollState::TimedOut;
            return Some(GenerationError::PollingTimedOut {
                task_id: self.task_id.clone(),
                elapsed,
                last_status: self.last_status,
            });
        }

        self.state = PollState::Polling;
        None
    }

    /// Apply the result of one status query.
    pub fn observe(
        &mut self,
        result: Result<TaskSnapshot, BackendError>,
        elapsed: Duration,
    ) -> Transition {
        self.polls += 1;
        match result {
            Ok(snapshot) => self.on_snapshot(snapshot, elapsed),
            Err(err) => self.on_error(err, elapsed),
        }
    }

    fn on_snapshot(&mut self, snapshot: TaskSnapshot, elapsed: Duration) -> Transition {
        self.last_status = Some(snapshot.status);

        match snapshot.status {
            status if status.is_in_progress() => {
                self.burst.reset();
                Transition::Wait(self.settings.poll_interval)
            }
            JobStatus::Succeeded => {
                self.burst.reset();
                self.state = PollState::Succeeded;
                Transition::Succeeded(snapshot)
            }
            JobStatus::Failed => {
                self.state = PollState::Failed;
                Transition::Stop(GenerationError::RemoteJobFailed {
                    task_id: self.task_id.clone(),
                    message: snapshot
                        .message
                        .unwrap_or_else(|| UNKNOWN_FAILURE_MESSAGE.to_string()),
                })
            }
            _ => {
                // Bounded by the transient burst so a nonsensical status
                // cannot keep the loop spinning until the deadline.
                let attempt = self.burst.record(ErrorClass::Network);
                if attempt > self.settings.retry.max_attempts(ErrorClass::Network) {
                    self.state = PollState::Aborted;
                    return Transition::Stop(GenerationError::PollingAborted {
                        task_id: self.task_id.clone(),
                        attempts: attempt,
                        elapsed,
                        cause: AbortCause::UnknownStatus(snapshot.raw_status),
                    });
                }
                self.retries += 1;
                tracing::warn!(
                    task_id = %self.task_id,
                    status = %snapshot.raw_status,
                    attempt,
                    "Unrecognized task status, polling again",
                );
                Transition::Wait(self.settings.unknown_status_delay)
            }
        }
    }

    fn on_error(&mut self, err: BackendError, elapsed: Duration) -> Transition {
        let class = ErrorClass::of(&err);
        let attempt = self.burst.record(class);

        match self.settings.retry.decide(attempt, class) {
            RetryDecision::RetryAfter(delay) => {
                self.retries += 1;
                tracing::warn!(
                    task_id = %self.task_id,
                    error = %err,
                    class = ?class,
                    attempt,
                    max_attempts = self.settings.retry.max_attempts(class),
                    delay_ms = delay.as_millis() as u64,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Status query failed, retrying",
                );
                Transition::Wait(delay)
            }
            RetryDecision::GiveUp => {
                self.state = PollState::Aborted;
                let cause = match class {
                    ErrorClass::Network => AbortCause::NetworkExhausted(err),
                    ErrorClass::Application => AbortCause::ApplicationExhausted(err),
                };
                Transition::Stop(GenerationError::PollingAborted {
                    task_id: self.task_id.clone(),
                    attempts: attempt,
                    elapsed,
                    cause,
                })
            }
        }
    }
}

/// Summary of a poll loop that reached SUCCEEDED.
#[derive(Debug, Clone)]
pub struct PollReport {
    /// The SUCCEEDED snapshot, including result URLs.
    pub snapshot: TaskSnapshot,
    pub polls: u32,
    pub retries: u32,
    /// Time from submission to the SUCCEEDED observation.
    pub elapsed: Duration,
}

/// Poll `handle` until it reaches a terminal state.
///
/// `submitted_at` anchors the overall budget. Queries are strictly
/// sequential. A triggered `cancel` token wakes any pending wait; the
/// next iteration aborts and a best-effort remote cancel is sent.
pub async fn poll_until_terminal<B>(
    backend: &B,
    handle: &RemoteJobHandle,
    settings: &PollSettings,
    submitted_at: Instant,
    cancel: &CancellationToken,
) -> Result<PollReport, GenerationError>
where
    B: GenerationBackend + ?Sized,
{
    let mut machine = PollMachine::new(handle.clone(), settings.clone());

    if !settings.initial_delay.is_zero() {
        pause(settings.initial_delay, cancel).await;
    }

    loop {
        if let Some(err) = machine.begin_iteration(submitted_at.elapsed(), cancel.is_cancelled()) {
            if matches!(
                err,
                GenerationError::PollingAborted {
                    cause: AbortCause::Cancelled,
                    ..
                }
            ) {
                request_remote_cancel(backend, handle).await;
            } else {
                tracing::warn!(task_id = %handle, error = %err, "Polling stopped");
            }
            return Err(err);
        }

        let result = backend.poll(handle).await;
        let elapsed = submitted_at.elapsed();

        if let Ok(snapshot) = &result {
            tracing::debug!(
                task_id = %handle,
                status = %snapshot.raw_status,
                elapsed_ms = elapsed.as_millis() as u64,
                "Task status",
            );
        }

        match machine.observe(result, elapsed) {
            Transition::Wait(delay) => pause(delay, cancel).await,
            Transition::Succeeded(snapshot) => {
                tracing::info!(
                    task_id = %handle,
                    polls = machine.polls(),
                    retries = machine.retries(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    results = snapshot.result_urls.len(),
                    "Task succeeded",
                );
                return Ok(PollReport {
                    snapshot,
                    polls: machine.polls(),
                    retries: machine.retries(),
                    elapsed,
                });
            }
            Transition::Stop(err) => {
                tracing::warn!(task_id = %handle, error = %err, "Polling stopped");
                return Err(err);
            }
        }
    }
}

/// Sleep for `delay`, returning early if `cancel` fires.
async fn pause(delay: Duration, cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

async fn request_remote_cancel<B>(backend: &B, handle: &RemoteJobHandle)
where
    B: GenerationBackend + ?Sized,
{
    match backend.cancel(handle).await {
        Ok(()) => tracing::info!(task_id = %handle, "Remote task cancelled"),
        Err(e) => tracing::warn!(
            task_id = %handle,
            error = %e,
            "Remote cancel failed (only PENDING tasks can be cancelled)",
        ),
    }
}
