//! Whole-process lifecycle against the in-memory manager.

mod common;

use common::*;
use delegate_core::message_store::keys;
use delegate_core::{MessageStore, MessengerType, ResponseCode, TaskEvent, TaskFactoryRegistry};
use delegate_daemon::DelegateService;
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test(start_paused = true)]
async fn test_register_poll_execute_and_stop() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    std::fs::create_dir_all(&config.agent.working_dir).unwrap();
    let store_dir = config.store.dir.clone();

    let fake = FakeManager::new();
    fake.add_task(unassigned("t1"));
    *fake.assign_on_validation.lock() = Some(DELEGATE_ID.to_string());
    fake.pending_events
        .lock()
        .push(TaskEvent::available("t1", true));

    let factories = Arc::new(
        TaskFactoryRegistry::new().with_factory(Arc::new(TestFactory::new(RunBehavior::Succeed))),
    );
    let service = DelegateService::new(config, fake.clone(), factories).unwrap();
    let state = service.state();
    let running = tokio::spawn(service.run());

    assert!(wait_until(Duration::from_secs(30), || fake.statuses().len() == 1).await);
    let (task_id, response) = fake.statuses().remove(0);
    assert_eq!(task_id, "t1");
    assert_eq!(response.response_code, ResponseCode::Ok);
    assert_eq!(fake.register_calls.lock().len(), 1);

    let reader = MessageStore::open(&store_dir, MessengerType::Watcher, "77").unwrap();
    let record = format!("delegate-{}", std::process::id());
    assert_eq!(
        reader.get_value(&record, keys::DELEGATE_ID).unwrap(),
        Some(Value::from(DELEGATE_ID))
    );

    state.stop();
    running.await.unwrap().unwrap();
    assert_eq!(fake.unregister_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_registration() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let fake = FakeManager::new();
    fake.register_responses.lock().extend(
        (0..10).map(|_| Err(delegate_core::ManagerError::ConnectionError("refused".to_string()))),
    );

    let service = DelegateService::new(config, fake.clone(), Arc::new(TaskFactoryRegistry::new())).unwrap();
    let state = service.state();
    let running = tokio::spawn(service.run());

    tokio::time::sleep(Duration::from_secs(10)).await;
    state.stop();
    assert!(running.await.unwrap().is_err());
    assert_eq!(fake.unregister_calls.load(Ordering::SeqCst), 0);
}
