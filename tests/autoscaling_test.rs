//! Autoscaling behavior under synthetic load signals.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use spinneret::autoscaling::{
    AutoscaledPool, AutoscaledPoolOptions, PoolPredicateFn, PoolTaskFn, Snapshotter,
    SnapshotterOptions, SystemStatus, SystemStatusOptions,
};
use spinneret::events::{Event, EventBus, SystemInfoData};
use spinneret::Configuration;

struct Harness {
    bus: Arc<EventBus>,
    snapshotter: Arc<Snapshotter>,
    pool: Arc<AutoscaledPool>,
}

fn build_harness(max_concurrency: usize) -> Harness {
    let bus = Arc::new(EventBus::new());
    let snapshotter = Arc::new(Snapshotter::new(
        SnapshotterOptions {
            // short retention so removing the overload signal takes
            // effect within the test window; generous lag threshold so a
            // busy test runner cannot flag the event loop
            snapshot_history_secs: 1,
            max_blocked_millis: 10_000,
            ..Default::default()
        },
        Arc::new(Configuration::default().with_memory_mbytes(4096)),
        Arc::clone(&bus),
        None,
    ));
    snapshotter.start();
    let system_status = Arc::new(SystemStatus::new(
        Arc::clone(&snapshotter),
        SystemStatusOptions::default(),
    ));

    let run_task: PoolTaskFn = Arc::new(|| {
        Box::pin(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(())
        })
    });
    let always_ready: PoolPredicateFn = Arc::new(|| Box::pin(async { Ok(true) }));
    let never_finished: PoolPredicateFn = Arc::new(|| Box::pin(async { Ok(false) }));

    let pool = Arc::new(AutoscaledPool::new(
        AutoscaledPoolOptions {
            min_concurrency: 1,
            max_concurrency,
            autoscale_interval: Duration::from_millis(50),
            scale_up_step_ratio: 0.5,
            scale_down_step_ratio: 0.5,
            ..Default::default()
        },
        system_status,
        run_task,
        always_ready,
        never_finished,
    ));

    Harness { bus, snapshotter, pool }
}

async fn emit_cpu_overload(bus: &EventBus, overloaded: bool, samples: usize) {
    for _ in 0..samples {
        bus.emit(Event::SystemInfo(SystemInfoData {
            cpu_current_usage: if overloaded { 0.99 } else { 0.05 },
            is_cpu_overloaded: overloaded,
            mem_current_bytes: 1,
            created_at: chrono::Utc::now(),
        }))
        .expect("emit succeeds");
    }
    bus.wait_for_all_listeners().await;
}

#[tokio::test]
async fn test_concurrency_scales_down_under_load_and_recovers() {
    let harness = build_harness(16);
    let pool = Arc::clone(&harness.pool);
    let runner = Arc::clone(&pool);
    let run_handle = tokio::spawn(async move { runner.run().await });

    // idle telemetry: the pool grows from min toward max
    tokio::time::sleep(Duration::from_millis(400)).await;
    let grown = pool.current_concurrency();
    assert!(grown > 1, "idle pool should scale up, got {grown}");

    // sustained overload: within a few resize intervals the pool shrinks
    emit_cpu_overload(&harness.bus, true, 10).await;
    let mut shrunk = grown;
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(60)).await;
        emit_cpu_overload(&harness.bus, true, 2).await;
        let now = pool.current_concurrency();
        assert!(now <= shrunk, "concurrency must not grow while overloaded");
        shrunk = now;
    }
    assert!(shrunk < grown, "overload should have reduced concurrency");

    // overload samples age out of the 1 s history; growth resumes
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let mut recovered = pool.current_concurrency();
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(60)).await;
        let now = pool.current_concurrency();
        assert!(now >= recovered, "concurrency must not shrink once idle again");
        recovered = now;
    }
    assert!(recovered > shrunk, "recovery should scale back up");

    pool.abort();
    let _ = tokio::time::timeout(Duration::from_secs(2), run_handle).await;
    harness.snapshotter.stop().await;
}

#[tokio::test]
async fn test_concurrency_stays_within_bounds() {
    let harness = build_harness(4);
    let pool = Arc::clone(&harness.pool);
    let runner = Arc::clone(&pool);
    let run_handle = tokio::spawn(async move { runner.run().await });

    let peak_in_flight = Arc::new(AtomicUsize::new(0));
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let current = pool.current_concurrency();
        assert!((1..=4).contains(&current));
        peak_in_flight.fetch_max(pool.in_flight_count(), Ordering::SeqCst);
    }
    assert!(peak_in_flight.load(Ordering::SeqCst) <= 4);

    pool.abort();
    let _ = tokio::time::timeout(Duration::from_secs(2), run_handle).await;
    harness.snapshotter.stop().await;
}
