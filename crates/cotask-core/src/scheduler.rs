//! Admission control, queue bookkeeping, shutdown orchestration and
//! exception-handler dispatch.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerSettings;
use crate::error::{Result, SchedulerError};
use crate::job::{Job, JobHandle, JobId};

type ShieldId = Uuid;

/// Context handed to the exception handler for a failure that nobody
/// explicitly awaited.
#[derive(Debug, Clone)]
pub struct ExceptionContext {
    pub message: String,
    pub job_id: JobId,
    pub error: SchedulerError,
    pub source_trace: Option<String>,
}

/// A user-supplied callback invoked once per non-explicit job failure.
pub type ExceptionHandler = Arc<dyn Fn(&Scheduler, ExceptionContext) + Send + Sync>;

struct State {
    jobs: HashMap<JobId, Arc<dyn JobHandle>>,
    pending: VecDeque<Arc<dyn JobHandle>>,
    waiting: VecDeque<oneshot::Sender<()>>,
    shields: HashMap<ShieldId, AbortHandle>,
    closed: bool,
}

impl State {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            pending: VecDeque::new(),
            waiting: VecDeque::new(),
            shields: HashMap::new(),
            closed: false,
        }
    }

    fn is_empty(&self) -> bool {
        self.jobs.is_empty() && self.pending.is_empty() && self.shields.is_empty()
    }
}

pub(crate) struct SchedulerInner {
    state: StdMutex<State>,
    limit: Option<usize>,
    pending_limit: Option<usize>,
    close_timeout: Option<Duration>,
    wait_timeout: Option<Duration>,
    exception_handler: StdMutex<Option<ExceptionHandler>>,
    failed_tx: StdMutex<Option<mpsc::UnboundedSender<JobId>>>,
    failed_worker: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    /// Fired whenever a job or shield finishes, so `wait_and_close` can wake
    /// up and re-check its emptiness condition without polling.
    activity: Notify,
}

impl SchedulerInner {
    pub(crate) fn close_timeout(&self) -> Option<Duration> {
        self.close_timeout
    }

    pub(crate) fn remove_pending(&self, id: JobId) {
        self.state.lock().unwrap().pending.retain(|j| j.id() != id);
    }

    pub(crate) fn forward_to_failure_sink(&self, id: JobId) {
        if let Some(tx) = self.failed_tx.lock().unwrap().as_ref() {
            let _ = tx.send(id);
        }
    }

    pub(crate) fn call_exception_handler(self: &Arc<Self>, ctx: ExceptionContext) {
        let handler = self.exception_handler.lock().unwrap().clone();
        match handler {
            Some(handler) => {
                let scheduler = Scheduler { inner: Arc::clone(self) };
                handler(&scheduler, ctx);
            }
            None => {
                error!(
                    job_id = %ctx.job_id,
                    error = %ctx.error,
                    source_trace = ctx.source_trace.as_deref().unwrap_or(""),
                    "{}", ctx.message
                );
            }
        }
    }

    /// Admits `handle`, starting it, parking it, or suspending the caller
    /// until a slot frees — see `SPEC_FULL.md` section 4.2.
    pub(crate) async fn spawn_handle(self: &Arc<Self>, handle: Arc<dyn JobHandle>) -> Result<()> {
        handle.set_scheduler(Arc::downgrade(self));

        loop {
            enum Step {
                Start,
                Park,
                Wait(oneshot::Receiver<()>),
            }

            let step = {
                let mut state = self.state.lock().unwrap();
                if state.closed {
                    return Err(SchedulerError::configuration("scheduling after close"));
                }
                if self.limit.map_or(true, |l| state.jobs.len() < l) {
                    state.jobs.insert(handle.id(), Arc::clone(&handle));
                    Step::Start
                } else if self.pending_limit.map_or(true, |pl| state.pending.len() < pl) {
                    state.pending.push_back(Arc::clone(&handle));
                    Step::Park
                } else {
                    let (tx, rx) = oneshot::channel();
                    state.waiting.push_back(tx);
                    Step::Wait(rx)
                }
            };

            match step {
                Step::Start => {
                    handle.start();
                    return Ok(());
                }
                Step::Park => return Ok(()),
                Step::Wait(rx) => {
                    // If this future is dropped right here, `handle` was
                    // never inserted into any collection the scheduler
                    // tracks, so it is fully abandoned with nothing further
                    // to clean up — the not-yet-started job simply never
                    // existed from the scheduler's point of view.
                    match rx.await {
                        Ok(()) => continue,
                        Err(_) => {
                            return Err(SchedulerError::configuration(
                                "scheduler closed while waiting for admission",
                            ))
                        }
                    }
                }
            }
        }
    }

    /// Called from a job's completion callback. Removes it from `jobs`,
    /// promotes pending jobs into the freed capacity, and wakes waiters in
    /// FIFO order as slots open up.
    pub(crate) async fn job_done(self: &Arc<Self>, id: JobId) {
        let (to_start, wake) = {
            let mut state = self.state.lock().unwrap();
            state.jobs.remove(&id);

            let mut to_start = Vec::new();
            loop {
                if !self.limit.map_or(true, |l| state.jobs.len() < l) {
                    break;
                }
                let mut promoted = None;
                while let Some(job) = state.pending.pop_front() {
                    if job.is_closed() {
                        continue;
                    }
                    promoted = Some(job);
                    break;
                }
                match promoted {
                    Some(job) => {
                        state.jobs.insert(job.id(), Arc::clone(&job));
                        to_start.push(job);
                    }
                    None => break,
                }
            }

            let has_room = self.limit.map_or(true, |l| state.jobs.len() < l)
                || self.pending_limit.map_or(true, |pl| state.pending.len() < pl);
            let wake = if has_room { state.waiting.pop_front() } else { None };

            (to_start, wake)
        };

        for job in to_start {
            job.start();
        }
        if let Some(tx) = wake {
            let _ = tx.send(());
        }
        self.activity.notify_waiters();
    }

    pub(crate) async fn shield<Fut, T>(self: &Arc<Self>, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let task = tokio::spawn(fut);
        let abort = task.abort_handle();
        let shield_id = Uuid::new_v4();

        let already_closed = {
            let mut state = self.state.lock().unwrap();
            state.shields.insert(shield_id, abort.clone());
            state.closed
        };
        if already_closed {
            abort.abort();
        }

        // A detached watcher owns cleanup so it runs even if the caller
        // drops this call — that is exactly the cancellation-decoupling
        // `shield` promises: the inner keeps running and still gets
        // deregistered, whether or not anyone stays to observe the result.
        let (tx, rx) = oneshot::channel();
        let me = Arc::clone(self);
        tokio::spawn(async move {
            let result = task.await;
            me.state.lock().unwrap().shields.remove(&shield_id);
            me.activity.notify_waiters();
            let _ = tx.send(result);
        });

        match rx.await {
            Ok(result) => result.map_err(SchedulerError::from),
            Err(_) => Err(SchedulerError::Cancelled),
        }
    }

    async fn wait_until<F>(self: &Arc<Self>, timeout: Option<Duration>, mut predicate: F)
    where
        F: FnMut(&State) -> bool,
    {
        let body = async {
            loop {
                let notified = self.activity.notified();
                if predicate(&self.state.lock().unwrap()) {
                    return;
                }
                notified.await;
            }
        };
        match timeout {
            Some(d) => {
                let _ = tokio::time::timeout(d, body).await;
            }
            None => body.await,
        }
    }

    /// Immediate shutdown: drains and force-closes everything.
    pub(crate) async fn close(self: &Arc<Self>) {
        let (jobs, pending, shield_aborts) = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            let jobs: Vec<_> = state.jobs.values().cloned().collect();
            let pending: Vec<_> = state.pending.drain(..).collect();
            let shield_aborts: Vec<_> = state.shields.values().cloned().collect();
            state.waiting.clear();
            (jobs, pending, shield_aborts)
        };

        info!(jobs = jobs.len(), pending = pending.len(), shields = shield_aborts.len(), "closing scheduler");

        for abort in &shield_aborts {
            abort.abort();
        }

        let close_timeout = self.close_timeout;
        let job_closes = jobs.into_iter().chain(pending).map(|job| {
            let job = Arc::clone(&job);
            async move { job.force_close(close_timeout).await }
        });
        futures::future::join_all(job_closes).await;

        self.wait_until(close_timeout, |s| s.shields.is_empty()).await;
        if !self.state.lock().unwrap().shields.is_empty() {
            warn!("some shielded operations did not settle within close_timeout");
        }

        self.shutdown_failure_sink().await;
        debug!("scheduler closed");
    }

    /// Graceful shutdown: waits for everything to finish on its own, up to
    /// `timeout`, then falls through to the forced `close`.
    pub(crate) async fn wait_and_close(self: &Arc<Self>, timeout: Option<Duration>) {
        let timeout = timeout.or(self.wait_timeout);
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            // The notified future must be created before the emptiness
            // check, not after, or a notify_waiters() landing in between
            // the check and the subscription would be missed entirely.
            let notified = self.activity.notified();
            let empty = self.state.lock().unwrap().is_empty();
            if empty {
                return;
            }
            let remaining = match deadline {
                Some(d) => {
                    let now = tokio::time::Instant::now();
                    if now >= d {
                        break;
                    }
                    Some(d - now)
                }
                None => None,
            };
            match remaining {
                Some(r) => {
                    if tokio::time::timeout(r, notified).await.is_err() {
                        break;
                    }
                }
                None => notified.await,
            }
        }

        warn!("graceful shutdown timed out, forcing close");
        self.close().await;
    }

    async fn shutdown_failure_sink(&self) {
        self.failed_tx.lock().unwrap().take();
        let handle = self.failed_worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Bounds how many jobs may run concurrently, queues the rest, and
/// coordinates shutdown. See `SPEC_FULL.md` for the full contract.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(settings: SchedulerSettings) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<JobId>();
        let failed_worker = tokio::spawn(async move {
            while let Some(id) = rx.recv().await {
                debug!(job_id = %id, "discharging failed job from the failure sink");
            }
        });

        let inner = Arc::new(SchedulerInner {
            state: StdMutex::new(State::new()),
            limit: settings.limit,
            pending_limit: settings.pending_limit,
            close_timeout: settings.close_timeout(),
            wait_timeout: settings.wait_timeout(),
            exception_handler: StdMutex::new(None),
            failed_tx: StdMutex::new(Some(tx)),
            failed_worker: StdMutex::new(Some(failed_worker)),
            activity: Notify::new(),
        });

        Scheduler { inner }
    }

    /// Installs a handler invoked once per non-explicit job failure.
    pub fn set_exception_handler<F>(&self, handler: F)
    where
        F: Fn(&Scheduler, ExceptionContext) + Send + Sync + 'static,
    {
        *self.inner.exception_handler.lock().unwrap() = Some(Arc::new(handler));
    }

    pub fn limit(&self) -> Option<usize> {
        self.inner.limit
    }

    pub fn pending_limit(&self) -> Option<usize> {
        self.inner.pending_limit
    }

    pub fn close_timeout(&self) -> Option<Duration> {
        self.inner.close_timeout
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().unwrap().jobs.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().unwrap().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().closed
    }

    pub fn len(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.jobs.len() + state.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: JobId) -> bool {
        let state = self.inner.state.lock().unwrap();
        state.jobs.contains_key(&id) || state.pending.iter().any(|j| j.id() == id)
    }

    /// Submits `fut` for execution, admitting it immediately, parking it, or
    /// suspending the caller — see `SPEC_FULL.md` section 4.2.
    #[track_caller]
    pub async fn spawn<Fut, T>(&self, fut: Fut, name: Option<String>) -> Result<Job<T>>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + Sync + Clone + 'static,
    {
        let (job, handle) = Job::spawn_from(fut, name);
        self.inner.spawn_handle(handle).await?;
        Ok(job)
    }

    /// Runs `fut` to completion regardless of whether the caller stays to
    /// await it. Cancelling the returned future does not cancel `fut`;
    /// cancelling the scheduler (via `close`) does.
    pub async fn shield<Fut, T>(&self, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.inner.shield(fut).await
    }

    /// Immediate shutdown: aborts everything outstanding, waits up to
    /// `close_timeout` per job/shield, then returns. Idempotent.
    pub async fn close(&self) {
        self.inner.close().await
    }

    /// Graceful shutdown: waits for everything to finish naturally, up to
    /// `timeout` (defaulting to `wait_timeout`), then forces a `close`.
    pub async fn wait_and_close(&self, timeout: Option<Duration>) {
        self.inner.wait_and_close(timeout).await
    }
}

impl fmt::Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        let n = state.jobs.len() + state.pending.len();
        if state.closed {
            write!(f, "<Scheduler closed jobs={}>", n)
        } else {
            write!(f, "<Scheduler jobs={}>", n)
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}
