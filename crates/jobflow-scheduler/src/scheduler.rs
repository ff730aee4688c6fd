//! The FIFO job scheduler.
//!
//! Owns a queue of jobs and drives them one at a time, reporting
//! progress and completion to subscribers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use jobflow_core::SharedContext;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{info, warn};

use crate::job::{Job, JobEvent, JobSpec, StepProgress};

/// Event emitted by the scheduler to its subscribers.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// A job was enqueued. Execution has not started.
    Pushed(Arc<Job>),
    /// Forward progress reported by the running (composite) job.
    Progress {
        job: Arc<Job>,
        progress: StepProgress,
    },
    /// A job reached COMPLETED. Inspect the job's fields for its
    /// outcome; the scheduler itself never fails on a job's failure.
    Completed(Arc<Job>),
}

/// Single-consumer FIFO queue of jobs.
///
/// `enqueue` never starts execution. Callers drive the queue with
/// [`process_queue`](JobScheduler::process_queue); a long-running
/// service typically calls it once per `Pushed` and once per
/// `Completed` event.
pub struct JobScheduler {
    ctx: SharedContext,
    queue: Mutex<VecDeque<Arc<Job>>>,
    running: AtomicBool,
    subscribers: Mutex<Vec<UnboundedSender<SchedulerEvent>>>,
}

impl JobScheduler {
    /// Scheduler whose jobs all see `ctx` through their step handlers.
    pub fn new(ctx: SharedContext) -> Self {
        Self {
            ctx,
            queue: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register an observer. Every subscriber sees every event emitted
    /// after this call.
    pub fn subscribe(&self) -> UnboundedReceiver<SchedulerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// True while jobs are queued, including the one being processed.
    pub fn is_busy(&self) -> bool {
        !self.queue.lock().unwrap().is_empty()
    }

    /// Queue a job for execution and emit `Pushed`.
    ///
    /// Returns `None` without queueing when the spec set `fail_on_busy`
    /// and the queue is non-empty.
    pub fn enqueue(&self, spec: JobSpec) -> Option<Arc<Job>> {
        if spec.fail_on_busy && self.is_busy() {
            return None;
        }
        let job = Job::from_spec(spec);
        self.queue.lock().unwrap().push_back(Arc::clone(&job));
        info!(job_id = %job.id(), job = %job.name(), "job enqueued");
        self.emit(SchedulerEvent::Pushed(Arc::clone(&job)));
        Some(job)
    }

    /// Run the head of the queue to completion, then emit `Completed`.
    ///
    /// At most one job runs at a time; a call that finds the scheduler
    /// already processing, or the queue empty, returns immediately.
    pub async fn process_queue(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let job = self.queue.lock().unwrap().front().cloned();
        let Some(job) = job else {
            self.running.store(false, Ordering::SeqCst);
            return;
        };

        let mut events = job.subscribe();
        {
            let run = job.run(self.ctx.clone(), true);
            tokio::pin!(run);
            loop {
                tokio::select! {
                    Some(event) = events.recv() => {
                        self.forward(&job, event);
                    }
                    result = &mut run => {
                        while let Ok(event) = events.try_recv() {
                            self.forward(&job, event);
                        }
                        if let Err(error) = result {
                            warn!(job_id = %job.id(), %error, "job refused to run");
                        }
                        break;
                    }
                }
            }
        }

        self.queue.lock().unwrap().pop_front();
        self.running.store(false, Ordering::SeqCst);
        self.emit(SchedulerEvent::Completed(job));
    }

    fn forward(&self, job: &Arc<Job>, event: JobEvent) {
        // Cleanup progress stays on the job's own observer surface.
        if let JobEvent::Progress(progress) = event {
            self.emit(SchedulerEvent::Progress {
                job: Arc::clone(job),
                progress,
            });
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobPhase;
    use async_trait::async_trait;
    use jobflow_core::{Completer, Error, Result, Step};

    struct NamedStep {
        label: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl Step for NamedStep {
        fn name(&self) -> &str {
            self.label
        }

        async fn handle_run(&self, _ctx: SharedContext, completer: Completer) -> Result<()> {
            if self.fail {
                completer.reject(Error::step("nope"));
            } else {
                completer.resolve();
            }
            Ok(())
        }
    }

    fn spec(label: &'static str) -> JobSpec {
        JobSpec::step(Arc::new(NamedStep { label, fail: false }))
    }

    #[tokio::test]
    async fn jobs_complete_in_enqueue_order() {
        let scheduler = JobScheduler::new(SharedContext::new());
        let mut events = scheduler.subscribe();
        for label in ["first", "second", "third"] {
            scheduler.enqueue(spec(label)).unwrap();
        }
        while scheduler.is_busy() {
            scheduler.process_queue().await;
        }

        let mut pushed = Vec::new();
        let mut completed = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                SchedulerEvent::Pushed(job) => pushed.push(job.name().to_string()),
                SchedulerEvent::Completed(job) => {
                    assert!(job.success());
                    completed.push(job.name().to_string());
                }
                SchedulerEvent::Progress { .. } => {}
            }
        }
        assert_eq!(pushed, ["first", "second", "third"]);
        assert_eq!(completed, ["first", "second", "third"]);
    }

    #[tokio::test]
    async fn enqueue_does_not_start_execution() {
        let scheduler = JobScheduler::new(SharedContext::new());
        let job = scheduler.enqueue(spec("idle")).unwrap();
        assert_eq!(job.phase(), JobPhase::New);
        assert!(scheduler.is_busy());

        scheduler.process_queue().await;
        assert!(job.is_completed());
        assert!(!scheduler.is_busy());
    }

    #[tokio::test]
    async fn fail_on_busy_refuses_while_queued() {
        let scheduler = JobScheduler::new(SharedContext::new());
        scheduler.enqueue(spec("head")).unwrap();

        let mut busy = spec("busy");
        busy.fail_on_busy = true;
        assert!(scheduler.enqueue(busy).is_none());

        scheduler.process_queue().await;
        let mut retry = spec("retry");
        retry.fail_on_busy = true;
        assert!(scheduler.enqueue(retry).is_some());
    }

    #[tokio::test]
    async fn a_failing_job_surfaces_through_completed() {
        let scheduler = JobScheduler::new(SharedContext::new());
        let mut events = scheduler.subscribe();
        scheduler
            .enqueue(JobSpec::step(Arc::new(NamedStep {
                label: "broken",
                fail: true,
            })))
            .unwrap();
        scheduler.process_queue().await;

        let mut saw_completed = false;
        while let Ok(event) = events.try_recv() {
            if let SchedulerEvent::Completed(job) = event {
                assert!(!job.success());
                assert_eq!(job.error().unwrap().to_string(), "nope");
                saw_completed = true;
            }
        }
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn composite_progress_is_forwarded() {
        let scheduler = JobScheduler::new(SharedContext::new());
        let mut events = scheduler.subscribe();
        let steps: Vec<Arc<dyn Step>> = vec![
            Arc::new(NamedStep { label: "one", fail: false }),
            Arc::new(NamedStep { label: "two", fail: false }),
        ];
        scheduler.enqueue(JobSpec::steps(steps)).unwrap();
        scheduler.process_queue().await;

        let mut trace = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                SchedulerEvent::Pushed(_) => trace.push("pushed".to_string()),
                SchedulerEvent::Progress { progress, .. } => {
                    assert!(progress.success);
                    trace.push(format!("progress {}", progress.index));
                }
                SchedulerEvent::Completed(job) => {
                    assert!(job.success());
                    trace.push("completed".to_string());
                }
            }
        }
        assert_eq!(trace, ["pushed", "progress 0", "progress 1", "completed"]);
    }
}
