// ── Scheduler ──
//
// Owns every background task the link spawns: session listeners, delayed
// reconnects and fire-and-forget log posts. Tasks run on the runtime the
// scheduler was created on, so callers on plain threads can still
// dispatch work. Shutdown cancels, waits a bounded grace period, then
// aborts whatever is left.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::LinkError;

/// Shared task and timer service.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    handle: Handle,
    cancel: CancellationToken,
    closed: AtomicBool,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Bind to the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new() -> Self {
        Self::with_handle(Handle::current())
    }

    /// Bind to the current Tokio runtime, if there is one.
    pub fn try_new() -> Result<Self, LinkError> {
        Handle::try_current()
            .map(Self::with_handle)
            .map_err(|_| LinkError::NoRuntime)
    }

    pub fn with_handle(handle: Handle) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                handle,
                cancel: CancellationToken::new(),
                closed: AtomicBool::new(false),
                task_handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A token cancelled when the scheduler shuts down.
    pub fn child_token(&self) -> CancellationToken {
        self.inner.cancel.child_token()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Run `task` in the background. Returns `false` once shut down.
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut handles = self
            .inner
            .task_handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return false;
        }
        handles.retain(|h| !h.is_finished());
        handles.push(self.inner.handle.spawn(task));
        true
    }

    /// Run `job` after `delay`, unless `cancel` fires first.
    pub fn schedule<F>(&self, delay: Duration, cancel: CancellationToken, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => debug!("scheduled job cancelled"),
                () = tokio::time::sleep(delay) => job(),
            }
        })
    }

    /// Cancel everything and wait up to `grace` for tasks to finish.
    ///
    /// Returns `true` when all tasks finished in time; stragglers are
    /// aborted otherwise. Later calls are no-ops.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let mut handles = {
            let mut guard = self
                .inner
                .task_handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return true;
            }
            std::mem::take(&mut *guard)
        };
        self.inner.cancel.cancel();

        let drained = tokio::time::timeout(grace, async {
            for handle in &mut handles {
                let _ = handle.await;
            }
        })
        .await
        .is_ok();

        if !drained {
            let stragglers = handles.iter().filter(|h| !h.is_finished()).count();
            warn!(stragglers, grace_secs = grace.as_secs_f64(), "forcing scheduler shutdown");
            for handle in &handles {
                handle.abort();
            }
        }
        drained
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn scheduled_job_runs_after_delay() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        scheduler.schedule(Duration::from_secs(30), scheduler.child_token(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_job_never_runs() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        let token = scheduler.child_token();
        scheduler.schedule(Duration::from_secs(5), token.clone(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn try_new_needs_a_runtime() {
        assert!(matches!(Scheduler::try_new(), Err(LinkError::NoRuntime)));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_stragglers_after_grace() {
        let scheduler = Scheduler::new();
        scheduler.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        assert!(!scheduler.shutdown(Duration::from_secs(5)).await);
        assert!(scheduler.is_closed());
        assert!(!scheduler.spawn(async {}));
        assert!(scheduler.shutdown(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn shutdown_waits_for_cooperative_tasks() {
        let scheduler = Scheduler::new();
        let token = scheduler.child_token();
        scheduler.spawn(async move { token.cancelled().await });

        assert!(scheduler.shutdown(Duration::from_secs(5)).await);
    }
}
