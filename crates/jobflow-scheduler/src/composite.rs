//! The composite driver: an ordered sequence of child jobs.
//!
//! Walks children forward during RUN, aborts the in-flight child during
//! CANCEL, and reverses through started children during CLEANUP.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use jobflow_core::{Completer, Error, Result, SharedContext, Step};
use tracing::{debug, warn};

use crate::job::{Job, JobEvent, ProgressHub, StepProgress};

/// Inner driver of a composite job. Implements [`Step`] so the owning
/// [`Job`] runs it through the ordinary state machine; composite-level
/// timeout and retries therefore apply to the sequence as a whole, while
/// each child carries its own.
pub(crate) struct CompositeStep {
    name: String,
    steps: Vec<Arc<dyn Step>>,
    /// Child jobs, one per started step; index i belongs to steps[i].
    jobs: Mutex<Vec<Arc<Job>>>,
    /// Cursor into `steps`: next child to run during the forward pass,
    /// next child to clean during the reverse pass. Rests at -1 once
    /// cleanup has reversed past index 0.
    cursor: Mutex<isize>,
    /// Child currently inside its run phase, if any.
    running: Mutex<Option<Arc<Job>>>,
    hub: Arc<ProgressHub>,
}

impl CompositeStep {
    pub(crate) fn new(name: String, steps: Vec<Arc<dyn Step>>, hub: Arc<ProgressHub>) -> Self {
        Self {
            name,
            steps,
            jobs: Mutex::new(Vec::new()),
            cursor: Mutex::new(0),
            running: Mutex::new(None),
            hub,
        }
    }

    fn cursor(&self) -> isize {
        *self.cursor.lock().unwrap()
    }

    fn set_cursor(&self, value: isize) {
        *self.cursor.lock().unwrap() = value;
    }

    /// Job for the child at `index`, creating one on first visit and
    /// replacing a spent job when a retry re-enters a failed index.
    fn child_at(&self, index: usize) -> Arc<Job> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get(index) {
            Some(job) if !job.is_completed() => Arc::clone(job),
            Some(_) => {
                let job = Job::single(Arc::clone(&self.steps[index]));
                jobs[index] = Arc::clone(&job);
                job
            }
            None => {
                let job = Job::single(Arc::clone(&self.steps[index]));
                jobs.push(Arc::clone(&job));
                job
            }
        }
    }
}

#[async_trait]
impl Step for CompositeStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle_run(&self, ctx: SharedContext, completer: Completer) -> Result<()> {
        let total = self.steps.len();
        loop {
            let index = self.cursor();
            if index < 0 || index as usize >= total {
                completer.resolve();
                return Ok(());
            }
            let index = index as usize;
            let child = self.child_at(index);
            *self.running.lock().unwrap() = Some(Arc::clone(&child));
            debug!(composite = %self.name, step = %child.name(), index, total, "running composite child");

            // Children run with auto-cleanup off: the composite owns
            // cleanup ordering. Spawned so that a composite-level
            // timeout or abort never tears a child down mid-transition;
            // the cancel pass aborts it and waits for it instead.
            let task = {
                let child = Arc::clone(&child);
                let ctx = ctx.clone();
                tokio::spawn(async move { child.run(ctx, false).await })
            };
            let joined = task.await;
            *self.running.lock().unwrap() = None;

            let failure = match joined {
                Err(join_error) => Some(Error::step(format!(
                    "child {index} panicked: {join_error}"
                ))),
                Ok(Err(error)) => Some(error),
                Ok(Ok(())) => None,
            };
            if let Some(error) = failure {
                self.hub.emit(JobEvent::Progress(StepProgress {
                    index,
                    total,
                    success: false,
                    error: Some(error.to_string()),
                }));
                completer.reject(error);
                return Ok(());
            }

            if child.success() {
                self.hub.emit(JobEvent::Progress(StepProgress {
                    index,
                    total,
                    success: true,
                    error: None,
                }));
                self.set_cursor(index as isize + 1);
            } else {
                let error = child
                    .error()
                    .unwrap_or_else(|| Error::step("child failed"));
                self.hub.emit(JobEvent::Progress(StepProgress {
                    index,
                    total,
                    success: false,
                    error: Some(error.to_string()),
                }));
                completer.reject(error);
                return Ok(());
            }
        }
    }

    async fn handle_cancel(&self, _ctx: SharedContext, completer: Completer) -> Result<()> {
        let running = self.running.lock().unwrap().take();
        if let Some(child) = running {
            debug!(composite = %self.name, step = %child.name(), "aborting in-flight composite child");
            child.abort("composite cancel");
            child.wait().await;
            // The aborted child released its acquisitions through its
            // own cancel handler; it is excluded from the reverse pass.
            self.set_cursor(self.cursor() - 1);
        }
        completer.resolve();
        Ok(())
    }

    async fn handle_cleanup(&self, _ctx: SharedContext, completer: Completer) -> Result<()> {
        let total = self.steps.len();
        {
            // Cleanup starts where execution stopped: the failing child,
            // or the last one after a fully successful pass.
            let mut cursor = self.cursor.lock().unwrap();
            if *cursor > total as isize - 1 {
                *cursor = total as isize - 1;
            }
        }
        let mut first_error: Option<Error> = None;
        loop {
            let index = self.cursor();
            if index < 0 {
                break;
            }
            let child = self.jobs.lock().unwrap().get(index as usize).cloned();
            if let Some(child) = child {
                let task = {
                    let child = Arc::clone(&child);
                    tokio::spawn(async move { child.cleanup().await })
                };
                let result = match task.await {
                    Ok(result) => result,
                    Err(join_error) => Err(Error::step(format!(
                        "child {index} cleanup panicked: {join_error}"
                    ))),
                };
                let success = result.is_ok();
                let message = result.as_ref().err().map(|error| error.to_string());
                if let Err(error) = result {
                    warn!(composite = %self.name, step = %child.name(), index, %error, "composite child cleanup failed");
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
                self.hub.emit(JobEvent::CleanupProgress(StepProgress {
                    index: index as usize,
                    total,
                    success,
                    error: message,
                }));
            }
            self.set_cursor(index - 1);
        }
        // Cleanup is best-effort and exhaustive; only the first failure
        // is surfaced as the composite's cleanup error.
        match first_error {
            Some(error) => completer.reject(error),
            None => completer.resolve(),
        }
        Ok(())
    }
}
