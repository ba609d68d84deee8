//! Axum host adapter: binds a single [`Scheduler`] to a running application.
//!
//! One scheduler per app, resolved from request handlers via an extractor,
//! and torn down with `wait_and_close` on application shutdown rather than
//! dropped or force-closed — the same contract the scheduler's aiohttp and
//! sanic integrations follow.

pub mod server;
pub mod state;

use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use cotask_core::{Scheduler, SchedulerError};

pub use state::AppState;

/// Extracts the application's [`Scheduler`] in a request handler.
///
/// ```ignore
/// async fn handler(SchedulerHandle(scheduler): SchedulerHandle) -> impl IntoResponse {
///     scheduler.spawn(do_work(), None).await
/// }
/// ```
pub struct SchedulerHandle(pub Scheduler);

/// `SchedulerError` wrapped so this crate can give it an axum `IntoResponse`
/// impl without running into the orphan rule (both the error and the trait
/// live outside this crate).
pub struct RejectedBySchedule(pub SchedulerError);

impl From<SchedulerError> for RejectedBySchedule {
    fn from(err: SchedulerError) -> Self {
        RejectedBySchedule(err)
    }
}

impl IntoResponse for RejectedBySchedule {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SchedulerError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SchedulerError::JobFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SchedulerError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            SchedulerError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, self.0.to_string()).into_response()
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for SchedulerHandle
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = RejectedBySchedule;

    async fn from_request_parts(_parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = AppState::from_ref(state);
        Ok(SchedulerHandle(app_state.scheduler))
    }
}

/// Resolves the scheduler from outside a request handler — for code that
/// holds an `AppState` directly (startup hooks, background wiring) rather
/// than running inside `from_request_parts`. Kept fallible to mirror the
/// "raise inside a handler, return `None` outside one" split the scheduler's
/// aiohttp integration exposes, even though this adapter always has a
/// scheduler once the app is wired up.
pub fn from_app(state: &AppState) -> Option<Scheduler> {
    Some(state.scheduler.clone())
}

/// Runs `fut` as a tracked Job on `scheduler` and awaits it — the handler's
/// whole body is admitted, counted, and (on app shutdown) drained exactly
/// like any other submitted work, so a client disconnect mid-request does
/// not abandon it. This is the wrapper an axum handler reaches for to get
/// the same "run to completion regardless of the request's own lifetime"
/// guarantee the scheduler's aiohttp integration gives its `atomic` handlers.
pub async fn atomic<Fut, T>(scheduler: &Scheduler, fut: Fut) -> Result<T, SchedulerError>
where
    Fut: std::future::Future<Output = T> + Send + 'static,
    T: Send + Sync + Clone + 'static,
{
    let job = scheduler.spawn(fut, None).await?;
    job.wait(None).await
}

/// Runs `fut` to completion independent of the caller's own cancellation,
/// without going through admission control — forwards to
/// [`Scheduler::shield`]. Prefer `atomic` for whole request handlers;
/// reach for this when only a sub-operation needs shielding.
pub async fn shield<Fut, T>(scheduler: &Scheduler, fut: Fut) -> Result<T, SchedulerError>
where
    Fut: std::future::Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    scheduler.shield(fut).await
}
