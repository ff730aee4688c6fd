//! The job state machine.
//!
//! A [`Job`] drives a single [`Step`] through its lifecycle
//! (NEW → RUN → (CANCEL → RUN)* → CLEANUP → COMPLETED), honoring
//! per-phase timeouts, the retry budget, and external aborts.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobflow_core::{Completer, Error, JobId, Result, SharedContext, Step};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::composite::CompositeStep;

/// Lifecycle phase of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobPhase {
    New,
    Run,
    Cancel,
    Cleanup,
    Completed,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPhase::New => write!(f, "new"),
            JobPhase::Run => write!(f, "run"),
            JobPhase::Cancel => write!(f, "cancel"),
            JobPhase::Cleanup => write!(f, "cleanup"),
            JobPhase::Completed => write!(f, "completed"),
        }
    }
}

/// Per-child progress record emitted by composite jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepProgress {
    /// Index of the child this record refers to.
    pub index: usize,
    /// Number of children in the composite.
    pub total: usize,
    /// Whether the child's phase succeeded.
    pub success: bool,
    /// Failure message when `success` is false.
    pub error: Option<String>,
}

/// Event emitted by a job to its subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobEvent {
    /// A child of a composite finished (or failed) its run phase.
    Progress(StepProgress),
    /// A child of a composite finished (or failed) its cleanup.
    CleanupProgress(StepProgress),
}

/// Fan-out of [`JobEvent`]s plus the last-emitted forward progress
/// record. Shared between a composite job and its inner driver.
#[derive(Debug, Default)]
pub(crate) struct ProgressHub {
    subscribers: Mutex<Vec<UnboundedSender<JobEvent>>>,
    last_progress: Mutex<Option<StepProgress>>,
}

impl ProgressHub {
    pub(crate) fn subscribe(&self) -> UnboundedReceiver<JobEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: JobEvent) {
        if let JobEvent::Progress(progress) = &event {
            *self.last_progress.lock().unwrap() = Some(progress.clone());
        }
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn last_progress(&self) -> Option<StepProgress> {
        self.last_progress.lock().unwrap().clone()
    }
}

/// What a job executes: one step, or an ordered sequence of steps.
pub enum Work {
    Step(Arc<dyn Step>),
    Steps(Vec<Arc<dyn Step>>),
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Work::Step(step) => f.debug_tuple("Step").field(&step.name()).finish(),
            Work::Steps(steps) => f.debug_tuple("Steps").field(&steps.len()).finish(),
        }
    }
}

/// Construction record for a job.
#[derive(Debug)]
pub struct JobSpec {
    /// The work to perform. A sequence produces a composite job.
    pub work: Work,
    /// Display name. Defaults to the step's own name, or "composite".
    pub name: Option<String>,
    /// Per-phase timeout. Defaults to the step's own timeout for single
    /// jobs; composites have none unless set here.
    pub timeout: Option<Duration>,
    /// Run-attempt budget. Defaults to the step's own budget for single
    /// jobs; composites default to one attempt.
    pub max_retries: Option<u32>,
    /// When set, [`JobScheduler::enqueue`](crate::JobScheduler::enqueue)
    /// refuses while the queue is non-empty.
    pub fail_on_busy: bool,
}

impl JobSpec {
    /// Spec for a job running a single step.
    pub fn step(step: Arc<dyn Step>) -> Self {
        Self {
            work: Work::Step(step),
            name: None,
            timeout: None,
            max_retries: None,
            fail_on_busy: false,
        }
    }

    /// Spec for a composite job running `steps` in order.
    pub fn steps(steps: Vec<Arc<dyn Step>>) -> Self {
        Self {
            work: Work::Steps(steps),
            name: None,
            timeout: None,
            max_retries: None,
            fail_on_busy: false,
        }
    }
}

#[derive(Debug)]
struct JobState {
    phase: JobPhase,
    retries_remaining: u32,
    success: bool,
    error: Option<Error>,
    abort_reason: Option<String>,
    success_cancel: bool,
    error_cancel: Option<Error>,
    success_cleanup: bool,
    error_cleanup: Option<Error>,
    cleanup_ran: bool,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    ctx: Option<SharedContext>,
}

/// Outcome of driving one phase to its exit trigger.
#[derive(Debug)]
enum PhaseOutcome {
    Resolved,
    Rejected(Error),
    TimedOut(Duration),
    Aborted,
}

/// One execution of a step, governed by the engine's state machine.
///
/// Created via [`Job::from_spec`] (or by a scheduler's `enqueue`), then
/// driven to COMPLETED by [`run`](Job::run). The job owns its timers and
/// releases them before entering COMPLETED; outcome fields stay readable
/// afterwards.
pub struct Job {
    id: JobId,
    name: String,
    timeout: Option<Duration>,
    max_retries: u32,
    step: Arc<dyn Step>,
    state: Mutex<JobState>,
    abort_tx: watch::Sender<()>,
    completed_tx: watch::Sender<bool>,
    hub: Arc<ProgressHub>,
    created_at: DateTime<Utc>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl Job {
    /// Build a job from a construction record.
    pub fn from_spec(spec: JobSpec) -> Arc<Self> {
        match spec.work {
            Work::Step(step) => {
                let name = spec.name.unwrap_or_else(|| step.name().to_string());
                let timeout = spec.timeout.or_else(|| step.timeout());
                let max_retries = spec.max_retries.unwrap_or_else(|| step.max_retries());
                Self::build(name, step, timeout, max_retries, Arc::default())
            }
            Work::Steps(steps) => {
                let name = spec.name.unwrap_or_else(|| "composite".to_string());
                let hub: Arc<ProgressHub> = Arc::default();
                let driver = CompositeStep::new(name.clone(), steps, Arc::clone(&hub));
                Self::build(
                    name,
                    Arc::new(driver),
                    spec.timeout,
                    spec.max_retries.unwrap_or(1),
                    hub,
                )
            }
        }
    }

    /// Job running a single step with the step's own configuration.
    pub fn single(step: Arc<dyn Step>) -> Arc<Self> {
        Self::from_spec(JobSpec::step(step))
    }

    /// Job running `steps` in order, cleaned up in reverse order.
    pub fn composite(steps: Vec<Arc<dyn Step>>) -> Arc<Self> {
        Self::from_spec(JobSpec::steps(steps))
    }

    fn build(
        name: String,
        step: Arc<dyn Step>,
        timeout: Option<Duration>,
        max_retries: u32,
        hub: Arc<ProgressHub>,
    ) -> Arc<Self> {
        let max_retries = max_retries.max(1);
        Arc::new(Self {
            id: JobId::new(),
            name,
            timeout,
            max_retries,
            step,
            state: Mutex::new(JobState {
                phase: JobPhase::New,
                retries_remaining: max_retries,
                success: false,
                error: None,
                abort_reason: None,
                success_cancel: true,
                error_cancel: None,
                success_cleanup: true,
                error_cleanup: None,
                cleanup_ran: false,
                started_at: None,
                finished_at: None,
                ctx: None,
            }),
            abort_tx: watch::channel(()).0,
            completed_tx: watch::channel(false).0,
            hub,
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> JobPhase {
        self.state().phase
    }

    pub fn is_completed(&self) -> bool {
        self.phase() == JobPhase::Completed
    }

    /// Top-level outcome. Meaningful once the job completed.
    pub fn success(&self) -> bool {
        self.state().success
    }

    /// Top-level failure. Set iff `success` is false after completion.
    pub fn error(&self) -> Option<Error> {
        self.state().error.clone()
    }

    /// True when an external abort was requested.
    pub fn is_abort(&self) -> bool {
        self.state().abort_reason.is_some()
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.state().abort_reason.clone()
    }

    /// Outcome of the most recent cancel phase. Independent of the
    /// top-level outcome.
    pub fn success_cancel(&self) -> bool {
        self.state().success_cancel
    }

    pub fn error_cancel(&self) -> Option<Error> {
        self.state().error_cancel.clone()
    }

    /// Outcome of the cleanup phase. Independent of the top-level
    /// outcome.
    pub fn success_cleanup(&self) -> bool {
        self.state().success_cleanup
    }

    pub fn error_cleanup(&self) -> Option<Error> {
        self.state().error_cleanup.clone()
    }

    pub fn retries_remaining(&self) -> u32 {
        self.state().retries_remaining
    }

    /// Configured per-phase timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Configured run-attempt budget.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Last forward-progress record of a composite job.
    pub fn progress(&self) -> Option<StepProgress> {
        self.hub.last_progress()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state().started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.state().finished_at
    }

    /// Register an observer for this job's events. Composite jobs emit
    /// progress and cleanup progress; single jobs emit nothing.
    pub fn subscribe(&self) -> UnboundedReceiver<JobEvent> {
        self.hub.subscribe()
    }

    /// Wait until the job enters COMPLETED. Resolves immediately for
    /// jobs that already completed; any number of waiters may attach.
    pub async fn wait(&self) {
        let mut rx = self.completed_tx.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Request termination. Idempotent, and a silent no-op once the job
    /// completed.
    ///
    /// Forces the retry budget to zero. In RUN this triggers the cancel
    /// transition; in CANCEL or CLEANUP it cuts the wait short and
    /// accelerates the path to COMPLETED.
    pub fn abort(&self, reason: impl Into<String>) {
        {
            let mut state = self.state();
            if state.phase == JobPhase::Completed {
                return;
            }
            if state.abort_reason.is_none() {
                state.abort_reason = Some(reason.into());
            }
            state.retries_remaining = 0;
        }
        debug!(job_id = %self.id, job = %self.name, "abort requested");
        self.abort_tx.send_replace(());
    }

    /// Drive the job from NEW to COMPLETED.
    ///
    /// Job failure is not an error here: inspect the job's fields (or
    /// the scheduler's completed event) after it returns. `Err` is
    /// reserved for a call in any phase other than NEW.
    pub async fn run(&self, ctx: SharedContext, auto_cleanup: bool) -> Result<()> {
        {
            let mut state = self.state();
            if state.phase != JobPhase::New {
                return Err(Error::InvalidTransition(format!(
                    "run requested in phase {}",
                    state.phase
                )));
            }
            state.phase = JobPhase::Run;
            state.started_at = Some(Utc::now());
            state.ctx = Some(ctx.clone());
        }
        info!(job_id = %self.id, job = %self.name, "job started");

        let mut attempt: u32 = 1;
        loop {
            self.set_phase(JobPhase::Run);
            debug!(job_id = %self.id, job = %self.name, attempt, "entering run phase");
            let outcome = if self.is_abort() {
                // Aborted before (or between) run entries: skip the
                // handler and take the cancel path directly.
                PhaseOutcome::Aborted
            } else {
                self.drive_phase(JobPhase::Run, &ctx).await
            };

            match outcome {
                PhaseOutcome::Resolved => {
                    let mut state = self.state();
                    state.success = true;
                    state.error = None;
                    break;
                }
                PhaseOutcome::Rejected(error) => {
                    warn!(job_id = %self.id, job = %self.name, %error, "run handler failed");
                    self.state().error = Some(error);
                }
                PhaseOutcome::TimedOut(duration) => {
                    warn!(job_id = %self.id, job = %self.name, ?duration, "run phase timed out");
                }
                PhaseOutcome::Aborted => {
                    debug!(job_id = %self.id, job = %self.name, "run phase aborted");
                }
            }

            self.set_phase(JobPhase::Cancel);
            let mut cancel_forced_exit = false;
            match self.drive_phase(JobPhase::Cancel, &ctx).await {
                PhaseOutcome::Resolved => {
                    let mut state = self.state();
                    state.success_cancel = true;
                    state.error_cancel = None;
                }
                PhaseOutcome::Rejected(error) => {
                    warn!(job_id = %self.id, job = %self.name, %error, "cancel handler failed");
                    let mut state = self.state();
                    state.success_cancel = false;
                    state.error_cancel = Some(error);
                }
                PhaseOutcome::TimedOut(duration) => {
                    warn!(job_id = %self.id, job = %self.name, ?duration, "cancel phase timed out, forcing exit");
                    let mut state = self.state();
                    state.success_cancel = false;
                    state.error_cancel = Some(Error::Timeout(duration));
                    cancel_forced_exit = true;
                }
                PhaseOutcome::Aborted => {
                    let mut state = self.state();
                    state.success_cancel = false;
                    state.error_cancel = state.abort_reason.clone().map(Error::Aborted);
                }
            }

            let retry = {
                let mut state = self.state();
                let wants_retry = state.retries_remaining > 1
                    && state.abort_reason.is_none()
                    && !cancel_forced_exit;
                if wants_retry {
                    state.retries_remaining -= 1;
                }
                wants_retry
            };
            if !retry {
                break;
            }
            attempt += 1;
        }

        {
            let mut state = self.state();
            if !state.success {
                if let Some(reason) = state.abort_reason.clone() {
                    state.error = Some(Error::Aborted(reason));
                } else if state.error.is_none() {
                    state.error = Some(Error::RetriesExhausted);
                }
            }
        }

        if auto_cleanup {
            self.state().cleanup_ran = true;
            self.set_phase(JobPhase::Cleanup);
            let _ = self.cleanup_phase(&ctx).await;
        }
        self.complete();
        Ok(())
    }

    /// Run the cleanup phase of a job that completed with auto-cleanup
    /// off. Valid exactly once, and only in COMPLETED; rejects with
    /// `InvalidTransition` otherwise.
    pub async fn cleanup(&self) -> Result<()> {
        let ctx = {
            let mut state = self.state();
            if state.phase != JobPhase::Completed {
                return Err(Error::InvalidTransition(format!(
                    "cleanup requested in phase {}",
                    state.phase
                )));
            }
            if state.cleanup_ran {
                return Err(Error::InvalidTransition("cleanup already ran".into()));
            }
            state.cleanup_ran = true;
            state.phase = JobPhase::Cleanup;
            state.ctx.clone().unwrap_or_default()
        };
        let result = self.cleanup_phase(&ctx).await;
        self.set_phase(JobPhase::Completed);
        result
    }

    async fn cleanup_phase(&self, ctx: &SharedContext) -> Result<()> {
        match self.drive_phase(JobPhase::Cleanup, ctx).await {
            PhaseOutcome::Resolved => {
                let mut state = self.state();
                state.success_cleanup = true;
                state.error_cleanup = None;
                Ok(())
            }
            PhaseOutcome::Rejected(error) => {
                warn!(job_id = %self.id, job = %self.name, %error, "cleanup handler failed");
                let mut state = self.state();
                state.success_cleanup = false;
                state.error_cleanup = Some(error.clone());
                Err(error)
            }
            PhaseOutcome::TimedOut(duration) => {
                warn!(job_id = %self.id, job = %self.name, ?duration, "cleanup phase timed out, forcing completion");
                let error = Error::Timeout(duration);
                let mut state = self.state();
                state.success_cleanup = false;
                state.error_cleanup = Some(error.clone());
                Err(error)
            }
            PhaseOutcome::Aborted => {
                let reason = self.abort_reason().unwrap_or_default();
                let error = Error::Aborted(reason);
                let mut state = self.state();
                state.success_cleanup = false;
                state.error_cleanup = Some(error.clone());
                Err(error)
            }
        }
    }

    /// Invoke the handler for `phase` and wait for its exit trigger:
    /// the completer being signalled, a synchronous handler error, the
    /// phase timer, or an abort issued during the phase. The timer and
    /// all listeners are released on every exit path.
    async fn drive_phase(&self, phase: JobPhase, ctx: &SharedContext) -> PhaseOutcome {
        let (completer, mut signal) = Completer::new();
        let mut abort_rx = self.abort_tx.subscribe();
        let step = Arc::clone(&self.step);
        let ctx = ctx.clone();
        let job_id = self.id;

        let handler = async move {
            match phase {
                JobPhase::Run => step.handle_run(ctx, completer).await,
                JobPhase::Cancel => step.handle_cancel(ctx, completer).await,
                JobPhase::Cleanup => step.handle_cleanup(ctx, completer).await,
                // Only handler phases are driven.
                JobPhase::New | JobPhase::Completed => Ok(()),
            }
        };

        let settled = async move {
            tokio::pin!(handler);
            let mut handler_done = false;
            loop {
                tokio::select! {
                    result = &mut handler, if !handler_done => {
                        handler_done = true;
                        if let Err(error) = result {
                            // A synchronous raise counts as a rejection.
                            return PhaseOutcome::Rejected(error);
                        }
                    }
                    outcome = &mut signal => {
                        return match outcome {
                            Ok(Ok(())) => PhaseOutcome::Resolved,
                            Ok(Err(error)) => PhaseOutcome::Rejected(error),
                            Err(_) => {
                                // The handler returned and dropped its
                                // completer without signalling. Behave
                                // like a handler that never completes so
                                // the phase timer keeps authority over
                                // the exit.
                                warn!(job_id = %job_id, %phase, "handler dropped its completer without signalling");
                                std::future::pending::<PhaseOutcome>().await
                            }
                        };
                    }
                }
            }
        };

        let bounded = async {
            match self.timeout {
                Some(duration) => tokio::time::timeout(duration, settled)
                    .await
                    .unwrap_or(PhaseOutcome::TimedOut(duration)),
                None => settled.await,
            }
        };

        tokio::select! {
            outcome = bounded => outcome,
            // Fires only for aborts issued after this phase subscribed.
            _ = abort_rx.changed() => PhaseOutcome::Aborted,
        }
    }

    fn complete(&self) {
        {
            let mut state = self.state();
            state.phase = JobPhase::Completed;
            state.finished_at = Some(Utc::now());
        }
        info!(
            job_id = %self.id,
            job = %self.name,
            success = self.success(),
            "job completed"
        );
        self.completed_tx.send_replace(true);
    }

    fn set_phase(&self, phase: JobPhase) {
        self.state().phase = phase;
    }

    fn state(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap()
    }
}
