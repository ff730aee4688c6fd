//! The `Step` trait: a unit of work with run, cancel, and cleanup hooks.

use std::time::Duration;

use async_trait::async_trait;

use crate::completer::Completer;
use crate::context::SharedContext;
use crate::error::Result;

/// A caller-supplied unit of work.
///
/// Each handler must eventually signal the provided [`Completer`]
/// exactly once, or return `Err` to fail synchronously (the engine
/// treats that as a rejection with the returned error). `handle_run` may
/// legitimately never signal; the owning job's timeout converts that
/// into a cancel transition.
///
/// A step may be shared across jobs only if it is stateless; anything it
/// needs to carry between run and cleanup belongs on the shared context.
#[async_trait]
pub trait Step: Send + Sync {
    /// Human-readable identifier used in diagnostics.
    fn name(&self) -> &str;

    /// Per-phase timeout. `None` means no timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Number of run attempts before the job gives up. Defaults to one,
    /// i.e. no retries.
    fn max_retries(&self) -> u32 {
        1
    }

    /// Perform the work.
    async fn handle_run(&self, ctx: SharedContext, completer: Completer) -> Result<()>;

    /// Release whatever `handle_run` acquired that would delay
    /// termination. Failure here is recorded but never blocks the job.
    async fn handle_cancel(&self, _ctx: SharedContext, completer: Completer) -> Result<()> {
        completer.resolve();
        Ok(())
    }

    /// Compensate acquisitions that outlive the run phase, such as
    /// external event subscriptions. Invoked at most once per job.
    async fn handle_cleanup(&self, _ctx: SharedContext, completer: Completer) -> Result<()> {
        completer.resolve();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RunOnly;

    #[async_trait]
    impl Step for RunOnly {
        fn name(&self) -> &str {
            "run-only"
        }

        async fn handle_run(&self, _ctx: SharedContext, completer: Completer) -> Result<()> {
            completer.resolve();
            Ok(())
        }
    }

    #[tokio::test]
    async fn default_cancel_resolves_immediately() {
        let (completer, signal) = Completer::new();
        RunOnly
            .handle_cancel(SharedContext::new(), completer)
            .await
            .unwrap();
        assert!(matches!(signal.await, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn default_cleanup_resolves_immediately() {
        let (completer, signal) = Completer::new();
        RunOnly
            .handle_cleanup(SharedContext::new(), completer)
            .await
            .unwrap();
        assert!(matches!(signal.await, Ok(Ok(()))));
    }

    #[test]
    fn default_configuration() {
        assert_eq!(RunOnly.timeout(), None);
        assert_eq!(RunOnly.max_retries(), 1);
    }
}
