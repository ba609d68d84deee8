//! A single submitted unit of work and its lifecycle.

use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::Span;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::scheduler::{ExceptionContext, SchedulerInner};

/// Opaque identifier for a [`Job`].
pub type JobId = Uuid;

/// Where a job currently sits in its lifecycle.
///
/// See `SPEC_FULL.md` section 3: a job has a task iff it is not `Pending`,
/// and once `Closed` it never transitions again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Active,
    Closed,
}

#[derive(Debug, Clone)]
pub(crate) enum JobOutcome<T> {
    Value(T),
    Error(SchedulerError),
    Cancelled,
}

/// Scheduler-facing, type-erased view of a job. This is what `Scheduler`
/// stores in its active/pending sets so a single collection can hold jobs
/// with different output types.
#[async_trait]
pub(crate) trait JobHandle: Send + Sync {
    fn id(&self) -> JobId;
    fn is_pending(&self) -> bool;
    fn is_closed(&self) -> bool;
    fn name(&self) -> Option<String>;
    fn set_scheduler(&self, scheduler: Weak<SchedulerInner>);
    /// Spawn the underlying task. Must be called exactly once.
    fn start(self: Arc<Self>);
    /// Force the job to stop: abort its task (starting it first if it was
    /// never started) and wait up to `timeout` for it to settle. On timeout,
    /// reports to the scheduler's exception handler rather than returning an
    /// error, since this path is only ever driven by scheduler shutdown.
    async fn force_close(self: Arc<Self>, timeout: Option<Duration>);
}

struct JobInner<T> {
    id: JobId,
    name: StdMutex<Option<String>>,
    state: StdMutex<JobState>,
    explicit: AtomicBool,
    fut: StdMutex<Option<Pin<Box<dyn Future<Output = T> + Send>>>>,
    abort_handle: StdMutex<Option<AbortHandle>>,
    outcome: StdMutex<Option<JobOutcome<T>>>,
    done: Notify,
    scheduler: StdMutex<Option<Weak<SchedulerInner>>>,
    span: StdMutex<Option<Span>>,
    source_trace: Option<String>,
}

impl<T> JobInner<T>
where
    T: Send + Sync + Clone + 'static,
{
    fn new<Fut>(fut: Fut, name: Option<String>, source_trace: Option<String>) -> Self
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            name: StdMutex::new(name),
            state: StdMutex::new(JobState::Pending),
            explicit: AtomicBool::new(false),
            fut: StdMutex::new(Some(Box::pin(fut))),
            abort_handle: StdMutex::new(None),
            outcome: StdMutex::new(None),
            done: Notify::new(),
            scheduler: StdMutex::new(None),
            span: StdMutex::new(None),
            source_trace,
        }
    }

    fn state(&self) -> JobState {
        *self.state.lock().unwrap()
    }

    fn scheduler_upgrade(&self) -> Option<Arc<SchedulerInner>> {
        self.scheduler.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    /// Waits for `done`, racing against nothing — cancellation of the
    /// returned future never touches the underlying task, since this only
    /// reads shared state and holds no handle capable of aborting it.
    async fn await_done(&self) -> JobOutcome<T> {
        loop {
            let notified = self.done.notified();
            if let Some(outcome) = self.outcome.lock().unwrap().clone() {
                return outcome;
            }
            notified.await;
        }
    }

    async fn run(self: Arc<Self>, task: tokio::task::JoinHandle<T>) {
        let result = task.await;
        let outcome = match result {
            Ok(value) => JobOutcome::Value(value),
            Err(e) if e.is_cancelled() => JobOutcome::Cancelled,
            Err(e) => JobOutcome::Error(SchedulerError::job_failure(e.to_string())),
        };
        self.finish(outcome).await;
    }

    async fn finish(self: Arc<Self>, outcome: JobOutcome<T>) {
        *self.outcome.lock().unwrap() = Some(outcome.clone());
        *self.state.lock().unwrap() = JobState::Closed;
        let scheduler = self.scheduler.lock().unwrap().take();

        if let JobOutcome::Error(err) = &outcome {
            if !self.explicit.load(Ordering::SeqCst) {
                if let Some(sched) = scheduler.as_ref().and_then(Weak::upgrade) {
                    sched.call_exception_handler(ExceptionContext {
                        message: "Job processing failed".to_string(),
                        job_id: self.id,
                        error: err.clone(),
                        source_trace: self.source_trace.clone(),
                    });
                    sched.forward_to_failure_sink(self.id);
                }
            }
        }

        self.done.notify_waiters();

        if let Some(sched) = scheduler.and_then(|w| w.upgrade()) {
            sched.job_done(self.id).await;
        }
    }

    /// Shared abort-then-await logic for `Job::close` and shutdown. The
    /// `Ok`/`Err(Timeout)` distinction is what lets the two call sites route
    /// a timeout differently (surfaced to the explicit caller vs. reported
    /// to the exception handler) without duplicating the abort/await dance.
    async fn close_impl(self: &Arc<Self>, timeout: Option<Duration>) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }

        if matches!(self.state(), JobState::Pending) {
            // Never started: remove from the pending queue (if it's still
            // there — a concurrent promotion may have already started it),
            // then start-and-abort so no future is ever dropped unpolled.
            if let Some(sched) = self.scheduler_upgrade() {
                sched.remove_pending(self.id);
            }
            Arc::clone(self).start();
        }

        if let Some(abort) = self.abort_handle.lock().unwrap().clone() {
            abort.abort();
        }

        let effective_timeout = timeout.or_else(|| self.scheduler_upgrade().and_then(|s| s.close_timeout()));
        let settled = match effective_timeout {
            Some(d) => tokio::time::timeout(d, self.await_done()).await.is_ok(),
            None => {
                self.await_done().await;
                true
            }
        };

        if settled {
            Ok(())
        } else {
            Err(SchedulerError::Timeout)
        }
    }
}

#[async_trait]
impl<T> JobHandle for JobInner<T>
where
    T: Send + Sync + Clone + 'static,
{
    fn id(&self) -> JobId {
        self.id
    }

    fn is_pending(&self) -> bool {
        matches!(self.state(), JobState::Pending)
    }

    fn is_closed(&self) -> bool {
        matches!(self.state(), JobState::Closed)
    }

    fn name(&self) -> Option<String> {
        self.name.lock().unwrap().clone()
    }

    fn set_scheduler(&self, scheduler: Weak<SchedulerInner>) {
        *self.scheduler.lock().unwrap() = Some(scheduler);
    }

    fn start(self: Arc<Self>) {
        {
            // Compare-and-set under the state lock: an explicit `close` on a
            // still-Pending job and the scheduler's own promotion can both
            // observe Pending and race to call `start`. Only the one that
            // wins this check actually takes the future and spawns the task;
            // the loser is a no-op instead of a double-spawn/double-take panic.
            let mut state = self.state.lock().unwrap();
            if !matches!(*state, JobState::Pending) {
                return;
            }
            *state = JobState::Active;
        }

        let fut = self
            .fut
            .lock()
            .unwrap()
            .take()
            .expect("future missing after winning the Pending -> Active transition");

        let span = tracing::info_span!("job", id = %self.id, name = tracing::field::Empty);
        if let Some(name) = self.name() {
            span.record("name", tracing::field::display(&name));
        }
        *self.span.lock().unwrap() = Some(span.clone());

        let task = tokio::spawn(async move {
            let _enter = span.enter();
            fut.await
        });
        *self.abort_handle.lock().unwrap() = Some(task.abort_handle());

        let me = Arc::clone(&self);
        tokio::spawn(async move { me.run(task).await });
    }

    async fn force_close(self: Arc<Self>, timeout: Option<Duration>) {
        if let Err(SchedulerError::Timeout) = self.close_impl(timeout).await {
            if let Some(sched) = self.scheduler_upgrade() {
                sched.call_exception_handler(ExceptionContext {
                    message: "Job closing timed out".to_string(),
                    job_id: self.id,
                    error: SchedulerError::Timeout,
                    source_trace: self.source_trace.clone(),
                });
            }
        }
    }
}

/// A handle to a single submitted computation.
///
/// Cloning a `Job` shares the same underlying state — all clones observe the
/// same lifecycle and the same eventual outcome.
pub struct Job<T> {
    inner: Arc<JobInner<T>>,
}

impl<T> Clone for Job<T> {
    fn clone(&self) -> Self {
        Job { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Job<T>
where
    T: Send + Sync + Clone + 'static,
{
    #[track_caller]
    pub(crate) fn spawn_from<Fut>(fut: Fut, name: Option<String>) -> (Self, Arc<dyn JobHandle>)
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        let trace = if cfg!(debug_assertions) {
            Some(Location::caller().to_string())
        } else {
            None
        };
        let inner = Arc::new(JobInner::new(fut, name, trace));
        let handle: Arc<dyn JobHandle> = inner.clone();
        (Job { inner }, handle)
    }

    pub fn id(&self) -> JobId {
        self.inner.id
    }

    pub fn is_active(&self) -> bool {
        matches!(self.inner.state(), JobState::Active)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.inner.state(), JobState::Pending)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.inner.state(), JobState::Closed)
    }

    pub fn name(&self) -> Option<String> {
        self.inner.name()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.inner.name.lock().unwrap() = Some(name.into());
    }

    /// Waits for the job to finish. Marks the job `explicit`, so a failure
    /// is re-raised here rather than routed to the scheduler's exception
    /// handler. Dropping the returned future cancels only the wait, never
    /// the underlying task.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<T> {
        self.inner.explicit.store(true, Ordering::SeqCst);

        let outcome = match timeout {
            Some(d) => match tokio::time::timeout(d, self.inner.await_done()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let _ = self.inner.close_impl(None).await;
                    return Err(SchedulerError::Timeout);
                }
            },
            None => self.inner.await_done().await,
        };

        match outcome {
            JobOutcome::Value(v) => Ok(v),
            JobOutcome::Error(e) => {
                let _ = self.inner.close_impl(None).await;
                Err(e)
            }
            JobOutcome::Cancelled => Err(SchedulerError::Cancelled),
        }
    }

    /// Idempotent. Cancels the task (starting it first if it never ran) and
    /// waits up to `timeout` (or the scheduler's `close_timeout`) for it to
    /// settle. A timeout here is surfaced to the caller, since the caller
    /// explicitly asked to close this job.
    pub async fn close(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.explicit.store(true, Ordering::SeqCst);
        self.inner.close_impl(timeout).await
    }
}

impl<T> fmt::Display for Job<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.inner.name().unwrap_or_else(|| "<unnamed>".to_string());
        match self.inner.state() {
            JobState::Pending => write!(f, "<Job pending coro={}>", name),
            JobState::Active => write!(f, "<Job coro={}>", name),
            JobState::Closed => write!(f, "<Job closed coro={}>", name),
        }
    }
}

impl<T> fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state())
            .finish()
    }
}
