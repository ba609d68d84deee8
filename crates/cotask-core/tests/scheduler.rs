use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cotask_core::{Scheduler, SchedulerError, SchedulerSettings};

fn settings(limit: Option<usize>, pending_limit: Option<usize>) -> SchedulerSettings {
    SchedulerSettings {
        limit,
        pending_limit,
        close_timeout_ms: Some(100),
        wait_timeout_ms: Some(60_000),
    }
}

#[tokio::test]
async fn s1_default_scheduler_round_trip() {
    let scheduler = Scheduler::new(SchedulerSettings::default());

    let job = scheduler.spawn(async { 1 }, None).await.unwrap();
    let value = job.wait(None).await.unwrap();

    assert_eq!(value, 1);
    assert_eq!(scheduler.len(), 0);
}

#[tokio::test]
async fn s2_limit_one_admission_and_promotion() {
    let scheduler = Scheduler::new(settings(Some(1), None));

    let (tx1, rx1) = tokio::sync::oneshot::channel::<()>();
    let (tx2, rx2) = tokio::sync::oneshot::channel::<()>();

    let a = scheduler.spawn(async move { rx1.await.ok(); }, Some("a".into())).await.unwrap();
    assert_eq!(scheduler.active_count(), 1);
    assert_eq!(scheduler.pending_count(), 0);

    let b = scheduler.spawn(async move { rx2.await.ok(); }, Some("b".into())).await.unwrap();
    assert_eq!(scheduler.active_count(), 1);
    assert_eq!(scheduler.pending_count(), 1);
    assert!(b.is_pending());

    tx1.send(()).unwrap();
    a.wait(None).await.unwrap();
    assert!(a.is_closed());
    tokio::task::yield_now().await;
    assert!(b.is_active());

    tx2.send(()).unwrap();
    b.wait(None).await.unwrap();

    assert_eq!(scheduler.active_count(), 0);
    assert_eq!(scheduler.pending_count(), 0);
}

#[tokio::test]
async fn s3_pending_limit_boundary_and_external_timeout() {
    let scheduler = Arc::new(Scheduler::new(settings(Some(1), Some(1))));

    let (_tx_a, rx_a) = tokio::sync::oneshot::channel::<()>();
    let (_tx_b, rx_b) = tokio::sync::oneshot::channel::<()>();

    let _a = scheduler.spawn(async move { rx_a.await.ok(); }, Some("a".into())).await.unwrap();
    let _b = scheduler.spawn(async move { rx_b.await.ok(); }, Some("b".into())).await.unwrap();

    assert_eq!(scheduler.active_count(), 1);
    assert_eq!(scheduler.pending_count(), 1);

    let sched = Arc::clone(&scheduler);
    let spawn_c = async move { sched.spawn(async { 3 }, Some("c".into())).await };
    let result = tokio::time::timeout(Duration::from_millis(200), spawn_c).await;

    assert!(result.is_err(), "third spawn should have suspended the caller");
    assert_eq!(scheduler.pending_count(), 1);
    assert_eq!(scheduler.active_count(), 1);
}

#[tokio::test]
async fn s4_exception_handler_called_exactly_once_for_unawaited_failure() {
    let scheduler = Scheduler::new(SchedulerSettings::default());

    let calls = Arc::new(AtomicUsize::new(0));
    let messages: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let calls_clone = Arc::clone(&calls);
    let messages_clone = Arc::clone(&messages);
    scheduler.set_exception_handler(move |_sched, ctx| {
        calls_clone.fetch_add(1, Ordering::SeqCst);
        messages_clone.lock().unwrap().push(ctx.message);
    });

    let _job = scheduler
        .spawn(
            async {
                panic!("deliberate failure");
            },
            None,
        )
        .await
        .unwrap();

    // never awaited — the failure must still reach the handler exactly once.
    tokio::time::sleep(Duration::from_millis(50)).await;
    tokio::task::yield_now().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(messages.lock().unwrap()[0], "Job processing failed");
    assert_eq!(scheduler.len(), 0);
}

// Needs a real second worker thread: the job below never hits an `.await`
// point, so on a current-thread runtime its poll would never return control
// and the test itself would never get to run `close()`.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s5_close_timeout_forces_shutdown_and_reports_to_handler() {
    let mut settings = SchedulerSettings::default();
    settings.close_timeout_ms = Some(10);
    let scheduler = Scheduler::new(settings);

    let messages: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let messages_clone = Arc::clone(&messages);
    scheduler.set_exception_handler(move |_sched, ctx| {
        messages_clone.lock().unwrap().push(ctx.message);
    });

    let _job = scheduler
        .spawn(
            async move {
                // `AbortHandle::abort()` only takes effect at the task's
                // next await point. A loop with no await point at all is
                // genuinely uncancellable from the scheduler's side — unlike
                // a Python coroutine, which can only ignore cancellation by
                // explicitly catching `CancelledError`, a tight Rust loop
                // ignores it simply by never yielding back to the executor.
                let deadline = std::time::Instant::now() + Duration::from_secs(2);
                while std::time::Instant::now() < deadline {
                    std::hint::spin_loop();
                }
            },
            Some("stubborn".into()),
        )
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    tokio::time::timeout(Duration::from_millis(900), scheduler.close())
        .await
        .expect("close should complete well under a second");
    assert!(started.elapsed() < Duration::from_secs(1));

    assert!(messages.lock().unwrap().iter().any(|m| m == "Job closing timed out"));
}

#[tokio::test]
async fn s6_shield_survives_outer_cancellation() {
    let scheduler = Scheduler::new(SchedulerSettings::default());

    let inner_done = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&inner_done);

    let scheduler_for_outer = scheduler.clone();
    let outer = scheduler
        .spawn(
            async move {
                let _ = scheduler_for_outer
                    .shield(async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        flag.store(true, Ordering::SeqCst);
                    })
                    .await;
            },
            Some("outer".into()),
        )
        .await
        .unwrap();

    // give the outer job a chance to start and enter the shield
    tokio::task::yield_now().await;
    outer.close(Some(Duration::from_millis(10))).await.ok();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(inner_done.load(Ordering::SeqCst), "shielded inner must still complete");

    tokio::time::timeout(Duration::from_millis(200), scheduler.wait_and_close(Some(Duration::from_millis(200))))
        .await
        .expect("wait_and_close should complete cleanly");
}

#[tokio::test]
async fn close_is_idempotent() {
    let scheduler = Scheduler::new(SchedulerSettings::default());
    scheduler.close().await;
    scheduler.close().await;
    assert!(scheduler.is_closed());
}

#[tokio::test]
async fn spawn_after_close_is_rejected() {
    let scheduler = Scheduler::new(SchedulerSettings::default());
    scheduler.close().await;

    let result = scheduler.spawn(async { 1 }, None).await;
    assert!(matches!(result, Err(SchedulerError::Configuration(_))));
}

#[tokio::test]
async fn wait_with_timeout_on_a_slow_job_times_out_and_closes_it() {
    let scheduler = Scheduler::new(SchedulerSettings::default());

    let job = scheduler
        .spawn(async { tokio::time::sleep(Duration::from_secs(5)).await }, None)
        .await
        .unwrap();

    let result = job.wait(Some(Duration::from_millis(20))).await;
    assert!(matches!(result, Err(SchedulerError::Timeout)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(scheduler.len(), 0);
}
