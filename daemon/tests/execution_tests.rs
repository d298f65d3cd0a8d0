//! Execution, timeout enforcement and status reporting.

mod common;

use common::*;
use delegate_core::{ResponseCode, Task};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_runnable_error_reports_single_failure() {
    let fake = FakeManager::new();
    let h = Harness::new(fake.clone(), TestFactory::new(RunBehavior::Fail));

    assert!(h.runtime.executor.execute_task(assigned("t1")));
    assert!(wait_until(Duration::from_secs(5), || !fake.statuses().is_empty()).await);

    // Nothing else arrives once the timeout watcher has finished
    tokio::time::sleep(Duration::from_secs(60)).await;
    let statuses = fake.statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].1.response_code, ResponseCode::Failed);
    assert!(statuses[0].1.error_message.as_deref().unwrap_or_default().contains("boom"));
    assert_eq!(h.metrics.tasks_failed.get(), 1);
    assert!(h.runtime.registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_overrunning_task_is_cancelled_after_grace() {
    let fake = FakeManager::new();
    let h = Harness::new(fake.clone(), TestFactory::new(RunBehavior::Hang));

    let start = Instant::now();
    assert!(h.runtime.executor.execute_task(assigned("t1").with_timeout_ms(1_000)));
    assert!(wait_until(Duration::from_secs(1), || h.runtime.registry.is_executing("t1")).await);

    assert!(wait_until(Duration::from_secs(60), || h.runtime.registry.is_empty()).await);
    let elapsed = start.elapsed();
    // Task timeout plus the 30s grace, checked every 5s
    assert!(elapsed >= Duration::from_secs(31));
    assert!(elapsed <= Duration::from_secs(36));
    assert_eq!(h.metrics.tasks_timed_out.get(), 1);

    assert!(wait_until(Duration::from_secs(5), || fake.statuses().len() == 1).await);
    assert_eq!(fake.statuses()[0].1.response_code, ResponseCode::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_status_delivery_is_retried() {
    let fake = FakeManager::new();
    fake.status_failures.store(2, Ordering::SeqCst);
    let h = Harness::new(fake.clone(), TestFactory::new(RunBehavior::Succeed));

    assert!(h.runtime.executor.execute_task(assigned("t1")));
    assert!(wait_until(Duration::from_secs(5), || fake.statuses().len() == 1).await);
    assert_eq!(fake.status_attempts.load(Ordering::SeqCst), 3);
    assert_eq!(fake.statuses()[0].1.response_code, ResponseCode::Ok);
}

#[tokio::test(start_paused = true)]
async fn test_undeliverable_status_is_dropped_after_retries() {
    let fake = FakeManager::new();
    fake.status_failures.store(10, Ordering::SeqCst);
    let h = Harness::new(fake.clone(), TestFactory::new(RunBehavior::Succeed));

    assert!(h.runtime.executor.execute_task(assigned("t1")));
    assert!(wait_until(Duration::from_secs(5), || fake.status_attempts.load(Ordering::SeqCst) == 3).await);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(fake.status_attempts.load(Ordering::SeqCst), 3);
    assert!(fake.statuses().is_empty());
    assert!(wait_until(Duration::from_secs(10), || h.runtime.registry.is_empty()).await);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_task_type_reports_failure() {
    let fake = FakeManager::new();
    let h = Harness::new(fake.clone(), TestFactory::new(RunBehavior::Succeed));

    let task = Task::new("t1", ACCOUNT_ID, "NOT_REGISTERED").with_delegate(DELEGATE_ID);
    assert!(!h.runtime.executor.execute_task(task));

    assert!(wait_until(Duration::from_secs(5), || fake.statuses().len() == 1).await);
    assert_eq!(fake.statuses()[0].1.response_code, ResponseCode::Failed);
    assert!(h.runtime.registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_pool_slot_frees_after_abort() {
    let fake = FakeManager::new();
    let h = Harness::with_config(fake.clone(), TestFactory::new(RunBehavior::Hang), |config| {
        config.pools.build_size = 1;
        config.pools.sync_size = 1;
    });

    // Occupies the only sync slot until cancelled
    assert!(h.runtime.executor.execute_task(assigned("sync-1")));
    assert!(wait_until(Duration::from_secs(1), || h.runtime.registry.is_executing("sync-1")).await);

    // Queued behind it in the same pool
    assert!(h.runtime.executor.execute_task(assigned("sync-2")));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!h.runtime.registry.is_executing("sync-2"));
    assert!(h.runtime.registry.has_executing());

    h.runtime.dispatcher.abort("sync-1");
    assert!(wait_until(Duration::from_secs(1), || h.runtime.registry.is_executing("sync-2")).await);
}
