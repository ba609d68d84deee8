//! Example application bootstrap wiring a [`Scheduler`] into an axum server.

use std::net::SocketAddr;
use std::time::Duration;

use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use cotask_core::{Scheduler, SchedulerSettings};

use crate::state::AppState;
use crate::{RejectedBySchedule, SchedulerHandle};

#[derive(Debug, Deserialize)]
pub struct SpawnRequest {
    pub name: Option<String>,
    pub delay_ms: u64,
}

async fn spawn_demo_job(
    SchedulerHandle(scheduler): SchedulerHandle,
    Json(req): Json<SpawnRequest>,
) -> Result<Json<String>, RejectedBySchedule> {
    let job = scheduler
        .spawn(
            async move {
                tokio::time::sleep(Duration::from_millis(req.delay_ms)).await;
            },
            req.name,
        )
        .await?;
    Ok(Json(job.id().to_string()))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/jobs", post(spawn_demo_job))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Runs the demo application on `addr` until the process receives a
/// shutdown signal, then drains the scheduler gracefully before returning.
pub async fn run(addr: SocketAddr, settings: SchedulerSettings) -> cotask_core::Result<()> {
    let scheduler = Scheduler::new(settings);
    let state = AppState::new(scheduler.clone());
    let app = build_router(state);

    info!(%addr, "scheduler demo server listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| cotask_core::SchedulerError::configuration(e.to_string()))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(scheduler.clone()))
        .await
        .map_err(|e| cotask_core::SchedulerError::configuration(e.to_string()))?;

    Ok(())
}

/// Waits for a shutdown signal, then closes the scheduler gracefully rather
/// than dropping it in place — this is the step an `on_cleanup`-style hook
/// performs in the scheduler's aiohttp integration.
async fn shutdown_signal(scheduler: Scheduler) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received, draining scheduler");
    scheduler.wait_and_close(None).await;
}
